use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::numeric::Ratio;
use crate::{
    SpenderRole, Token, DEFAULT_ACTION_TIMEOUT_SECS, DEFAULT_LIQUIDATION_THRESHOLD,
    DEFAULT_PRICE_MAX_AGE_SECS, DEFAULT_PRICE_REFRESH_INTERVAL_SECS,
    DEFAULT_WARNING_HEALTH_FACTOR, MAX_TOKEN_DECIMALS, SEC_NANOS,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    /// Token contract address on the ledger.
    pub address: String,
    /// Decimal precision of the token (e.g. 8 for wrapped BTC).
    pub decimals: u8,
}

impl TokenConfig {
    pub fn new(symbol: &str, address: &str, decimals: u8) -> Self {
        Self {
            symbol: symbol.to_string(),
            address: address.to_string(),
            decimals,
        }
    }
}

/// Engine configuration handed over by the hosting application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub collateral_token: TokenConfig,
    pub borrow_token: TokenConfig,
    pub stake_token: TokenConfig,
    /// Spender address of the lending pool contract.
    pub lending_pool: String,
    /// Spender address of the staking contract.
    pub staking_pool: String,
    /// Health factor below which a position is classified at risk.
    pub liquidation_threshold: Ratio,
    /// Health factor below which a position is flagged as a warning.
    pub warning_health_factor: Ratio,
    /// Maximum age of a cached price before metrics treat it as unavailable.
    pub price_max_age_secs: u64,
    /// Suggested period of the host's refresh timer.
    pub price_refresh_interval_secs: u64,
    /// Age after which a leftover action guard with no submitted
    /// transaction behind it is discarded.
    pub action_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collateral_token: TokenConfig::new("WBTC", "", 8),
            borrow_token: TokenConfig::new("USDT", "", 6),
            stake_token: TokenConfig::new("STK", "", 18),
            lending_pool: String::new(),
            staking_pool: String::new(),
            liquidation_threshold: DEFAULT_LIQUIDATION_THRESHOLD,
            warning_health_factor: DEFAULT_WARNING_HEALTH_FACTOR,
            price_max_age_secs: DEFAULT_PRICE_MAX_AGE_SECS,
            price_refresh_interval_secs: DEFAULT_PRICE_REFRESH_INTERVAL_SECS,
            action_timeout_secs: DEFAULT_ACTION_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "failed to parse engine config: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid engine config: {}", msg),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON config. Missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for token in Token::ALL {
            let token_config = self.token(token);
            if token_config.decimals > MAX_TOKEN_DECIMALS {
                return Err(ConfigError::Invalid(format!(
                    "{} token {} has {} decimals, at most {} are supported",
                    token, token_config.symbol, token_config.decimals, MAX_TOKEN_DECIMALS
                )));
            }
            if token_config.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} token {} has no contract address",
                    token, token_config.symbol
                )));
            }
        }
        if self.lending_pool.trim().is_empty() || self.staking_pool.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "lending_pool and staking_pool addresses are required".to_string(),
            ));
        }
        if !self.liquidation_threshold.is_positive() {
            return Err(ConfigError::Invalid(
                "liquidation_threshold must be positive".to_string(),
            ));
        }
        if self.warning_health_factor < self.liquidation_threshold {
            return Err(ConfigError::Invalid(format!(
                "warning_health_factor ({}) is below liquidation_threshold ({})",
                self.warning_health_factor, self.liquidation_threshold
            )));
        }
        if self.price_max_age_secs == 0 {
            return Err(ConfigError::Invalid(
                "price_max_age_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn token(&self, token: Token) -> &TokenConfig {
        match token {
            Token::Collateral => &self.collateral_token,
            Token::Borrow => &self.borrow_token,
            Token::Stake => &self.stake_token,
        }
    }

    pub fn spender_address(&self, spender: SpenderRole) -> &str {
        match spender {
            SpenderRole::LendingPool => &self.lending_pool,
            SpenderRole::StakingPool => &self.staking_pool,
        }
    }

    pub fn price_max_age_nanos(&self) -> u64 {
        self.price_max_age_secs.saturating_mul(SEC_NANOS)
    }

    pub fn action_timeout_nanos(&self) -> u64 {
        self.action_timeout_secs.saturating_mul(SEC_NANOS)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.price_refresh_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_config;
    use rust_decimal_macros::dec;

    #[test]
    fn loads_partial_json_over_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "lending_pool": "0xpool",
                "staking_pool": "0xstaking",
                "liquidation_threshold": "1.05",
                "collateral_token": { "symbol": "tBTC", "address": "0xbtc", "decimals": 18 },
                "borrow_token": { "symbol": "USDT", "address": "0xusdt", "decimals": 6 },
                "stake_token": { "symbol": "STK", "address": "0xstk", "decimals": 18 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.liquidation_threshold, Ratio::new(dec!(1.05)));
        assert_eq!(config.warning_health_factor, DEFAULT_WARNING_HEALTH_FACTOR);
        assert_eq!(config.collateral_token.decimals, 18);
        assert_eq!(config.token(Token::Borrow).address, "0xusdt");
        assert_eq!(config.spender_address(SpenderRole::StakingPool), "0xstaking");
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_missing_token_address() {
        let config = EngineConfig {
            lending_pool: "0xpool".to_string(),
            staking_pool: "0xstaking".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid(
                "collateral token WBTC has no contract address".to_string()
            ))
        );
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_missing_spenders() {
        let config = EngineConfig {
            lending_pool: " ".to_string(),
            ..test_config()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid(
                "lending_pool and staking_pool addresses are required".to_string()
            ))
        );
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = EngineConfig {
            liquidation_threshold: Ratio::new(dec!(1.5)),
            warning_health_factor: Ratio::new(dec!(1.1)),
            ..test_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unsupported_precision() {
        let config = EngineConfig {
            stake_token: TokenConfig::new("STK", "0xstk", 30),
            ..test_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
