//! Unstake lifecycle of a staked position.
//!
//! The phase is never stored. It is derived on every read from the
//! ledger-reported cooldown start, the protocol durations and the current time:
//!
//! ```text
//! Idle --start--> Cooldown --(now >= cooldown_end)--> UnstakeWindow
//!                                                       |      |
//!                               unstake ok <------------+      +--(now >= window_end)--> Expired
//! ```
//! `Expired` only leaves through a fresh start.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownPhase {
    Idle,
    Cooldown,
    UnstakeWindow,
    Expired,
}

/// All timestamps and durations are in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub cooldown_start: Option<u64>,
    pub cooldown_period: u64,
    pub unstake_window: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CooldownState {
    pub phase: CooldownPhase,
    pub cooldown_start: Option<u64>,
    pub cooldown_end: Option<u64>,
    pub unstake_window_end: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CooldownError {
    NotInCooldown,
    CooldownNotElapsed { unlocks_at: u64 },
    UnstakeWindowExpired { expired_at: u64 },
    CooldownAlreadyActive,
}

impl fmt::Display for CooldownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInCooldown => write!(f, "Start the cooldown before unstaking."),
            Self::CooldownNotElapsed { unlocks_at } => write!(
                f,
                "The cooldown has not finished yet; unstaking opens at {}.",
                unlocks_at
            ),
            Self::UnstakeWindowExpired { expired_at } => write!(
                f,
                "The unstake window closed at {}. Start a new cooldown.",
                expired_at
            ),
            Self::CooldownAlreadyActive => write!(f, "A cooldown is already running."),
        }
    }
}

impl CooldownRecord {
    pub fn cooldown_end(&self) -> Option<u64> {
        self.cooldown_start
            .map(|start| start.saturating_add(self.cooldown_period))
    }

    pub fn unstake_window_end(&self) -> Option<u64> {
        self.cooldown_end()
            .map(|end| end.saturating_add(self.unstake_window))
    }

    pub fn phase_at(&self, now: u64) -> CooldownPhase {
        match (self.cooldown_end(), self.unstake_window_end()) {
            (Some(_), Some(window_end)) if now >= window_end => CooldownPhase::Expired,
            (Some(end), Some(_)) if now >= end => CooldownPhase::UnstakeWindow,
            (Some(_), Some(_)) => CooldownPhase::Cooldown,
            _ => CooldownPhase::Idle,
        }
    }

    pub fn state_at(&self, now: u64) -> CooldownState {
        CooldownState {
            phase: self.phase_at(now),
            cooldown_start: self.cooldown_start,
            cooldown_end: self.cooldown_end(),
            unstake_window_end: self.unstake_window_end(),
        }
    }

    pub fn check_unstake(&self, now: u64) -> Result<(), CooldownError> {
        match (self.phase_at(now), self.cooldown_end(), self.unstake_window_end()) {
            (CooldownPhase::UnstakeWindow, _, _) => Ok(()),
            (CooldownPhase::Cooldown, Some(unlocks_at), _) => {
                Err(CooldownError::CooldownNotElapsed { unlocks_at })
            }
            (CooldownPhase::Expired, _, Some(expired_at)) => {
                Err(CooldownError::UnstakeWindowExpired { expired_at })
            }
            _ => Err(CooldownError::NotInCooldown),
        }
    }

    pub fn check_start(&self, now: u64) -> Result<(), CooldownError> {
        match self.phase_at(now) {
            CooldownPhase::Idle | CooldownPhase::Expired => Ok(()),
            CooldownPhase::Cooldown | CooldownPhase::UnstakeWindow => {
                Err(CooldownError::CooldownAlreadyActive)
            }
        }
    }

    pub fn start(&mut self, now: u64) {
        self.cooldown_start = Some(now);
    }

    pub fn clear(&mut self) {
        self.cooldown_start = None;
    }
}
