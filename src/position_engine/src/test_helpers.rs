//! Helper functions for testing purposes.
//! These functions should only be available in test builds.

use rust_decimal_macros::dec;
use std::cell::Cell;

use crate::config::{EngineConfig, TokenConfig};
use crate::numeric::Ratio;
use crate::state::Position;
use crate::Clock;

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(Cell<u64>);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(Cell::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.set(now);
    }

    pub fn advance(&self, nanos: u64) {
        self.0.set(self.0.get() + nanos);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.get()
    }
}

/// 2 BTC deposited, 1000 USDT borrowed, 10 staked.
pub fn sample_position() -> Position {
    Position {
        collateral_balance: dec!(2),
        borrowed_balance: dec!(1000),
        staked_amount: dec!(10),
        pending_rewards: dec!(0.5),
        health_factor: Some(Ratio::new(dec!(75))),
        max_borrow_amount: dec!(74000),
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        collateral_token: TokenConfig::new("WBTC", "0xwbtc", 8),
        borrow_token: TokenConfig::new("USDT", "0xusdt", 6),
        stake_token: TokenConfig::new("STK", "0xstk", 18),
        lending_pool: "0xlending".to_string(),
        staking_pool: "0xstaking".to_string(),
        ..EngineConfig::default()
    }
}
