use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cooldown::CooldownError;
use crate::guard::GuardError;
use crate::ledger::CallError;
use crate::numeric::Ratio;

pub mod approval;
pub mod auth;
pub mod config;
pub mod cooldown;
pub mod engine;
pub mod guard;
pub mod history;
pub mod ledger;
pub mod logs;
pub mod numeric;
pub mod price;
pub mod risk;
pub mod state;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use crate::engine::{ActionOutcome, ActionReceipt, ActionUpdate, Collaborators, PositionEngine};pub use crate::logs::{DEBUG, INFO, TRACE_PRICE};

pub const SEC_NANOS: u64 = 1_000_000_000;
pub const HOUR_NANOS: u64 = 3_600 * SEC_NANOS;
pub const DAY_NANOS: u64 = 24 * HOUR_NANOS;

/// Largest scale a `Decimal` can carry.
pub const MAX_TOKEN_DECIMALS: u8 = 28;

pub const DEFAULT_LIQUIDATION_THRESHOLD: Ratio = Ratio::new(dec!(1.0));
pub const DEFAULT_WARNING_HEALTH_FACTOR: Ratio = Ratio::new(dec!(1.2));
pub const DEFAULT_PRICE_MAX_AGE_SECS: u64 = 600;
pub const DEFAULT_PRICE_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 5 * 60;

/// A user intent the orchestrator can submit to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deposit,
    Borrow,
    Withdraw,
    Repay,
    Stake,
    Unstake,
    Claim,
    /// Starts the unstake cooldown.
    Cooldown,
    Approve,
}

impl ActionKind {
    pub const USER_ACTIONS: [ActionKind; 8] = [
        ActionKind::Deposit,
        ActionKind::Borrow,
        ActionKind::Withdraw,
        ActionKind::Repay,
        ActionKind::Stake,
        ActionKind::Unstake,
        ActionKind::Claim,
        ActionKind::Cooldown,
    ];

    /// The allowance an action spends from, if it moves tokens out of the wallet
    /// through a pool contract.
    pub fn allowance_target(&self) -> Option<(Token, SpenderRole)> {
        match self {
            ActionKind::Deposit => Some((Token::Collateral, SpenderRole::LendingPool)),
            ActionKind::Repay => Some((Token::Borrow, SpenderRole::LendingPool)),
            ActionKind::Stake => Some((Token::Stake, SpenderRole::StakingPool)),
            _ => None,
        }
    }

    /// The token whose precision governs the action's amount.
    pub fn amount_token(&self) -> Option<Token> {
        match self {
            ActionKind::Deposit | ActionKind::Withdraw => Some(Token::Collateral),
            ActionKind::Borrow | ActionKind::Repay => Some(Token::Borrow),
            ActionKind::Stake | ActionKind::Unstake => Some(Token::Stake),
            ActionKind::Claim | ActionKind::Cooldown | ActionKind::Approve => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Deposit => "deposit",
            ActionKind::Borrow => "borrow",
            ActionKind::Withdraw => "withdraw",
            ActionKind::Repay => "repay",
            ActionKind::Stake => "stake",
            ActionKind::Unstake => "unstake",
            ActionKind::Claim => "claim",
            ActionKind::Cooldown => "cooldown",
            ActionKind::Approve => "approve",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a guard and a PendingAction are keyed by. Each user intent has its
/// own slot; approvals get one per (token, spender) pair so that raising one
/// allowance never blocks raising another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSlot {
    Intent(ActionKind),
    Approval { token: Token, spender: SpenderRole },
}

impl ActionSlot {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionSlot::Intent(kind) => *kind,
            ActionSlot::Approval { .. } => ActionKind::Approve,
        }
    }
}

impl From<ActionKind> for ActionSlot {
    fn from(kind: ActionKind) -> Self {
        ActionSlot::Intent(kind)
    }
}

impl fmt::Display for ActionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionSlot::Intent(kind) => write!(f, "{}", kind),
            ActionSlot::Approval { token, spender } => {
                write!(f, "approve({}, {})", token, spender)
            }
        }
    }
}

/// Tokens the engine tracks balances and allowances for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    /// Wrapped bitcoin deposited as collateral.
    Collateral,
    /// The asset lent out against collateral.
    Borrow,
    Stake,
}

impl Token {
    pub const ALL: [Token; 3] = [Token::Collateral, Token::Borrow, Token::Stake];
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Collateral => write!(f, "collateral"),
            Token::Borrow => write!(f, "borrow"),
            Token::Stake => write!(f, "stake"),
        }
    }
}

/// Contracts that pull tokens from the wallet under an allowance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpenderRole {
    LendingPool,
    StakingPool,
}

impl fmt::Display for SpenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpenderRole::LendingPool => write!(f, "lending pool"),
            SpenderRole::StakingPool => write!(f, "staking pool"),
        }
    }
}

/// Source of the current time, in nanoseconds since the Unix epoch.
pub trait Clock {
    fn now(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default()
    }
}

/// Local, pre-submission input failures. These never reach the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    MissingAmount,
    InvalidAmount(String),
    NonPositiveAmount,
    TooManyDecimals { max_decimals: u8 },
    ExceedsBalance { requested: Decimal, available: Decimal },
    ExceedsBorrowLimit { requested: Decimal, max_borrow: Decimal },
    ExceedsDebt { requested: Decimal, outstanding: Decimal },
    NoCollateral,
    WouldLeaveDebtUncollateralized,
    NothingToClaim,
    NothingStaked,
    UnsupportedAction(ActionKind),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAmount => write!(f, "Please enter an amount."),
            Self::InvalidAmount(raw) => write!(f, "'{}' is not a valid amount.", raw),
            Self::NonPositiveAmount => write!(f, "Amount must be greater than zero."),
            Self::TooManyDecimals { max_decimals } => {
                write!(f, "Amount has more than {} decimal places.", max_decimals)
            }
            Self::ExceedsBalance { requested, available } => write!(
                f,
                "Insufficient balance: requested {}, available {}.",
                requested, available
            ),
            Self::ExceedsBorrowLimit { requested, max_borrow } => write!(
                f,
                "Borrow amount {} exceeds the maximum borrowable amount {}.",
                requested, max_borrow
            ),
            Self::ExceedsDebt { requested, outstanding } => write!(
                f,
                "Cannot repay {} when only {} is outstanding.",
                requested, outstanding
            ),
            Self::NoCollateral => write!(f, "Deposit collateral before borrowing."),
            Self::WouldLeaveDebtUncollateralized => {
                write!(f, "Repay your loan before withdrawing all collateral.")
            }
            Self::NothingToClaim => write!(f, "There are no rewards to claim."),
            Self::NothingStaked => write!(f, "You have nothing staked."),
            Self::UnsupportedAction(kind) => {
                write!(f, "The {} action cannot be submitted directly.", kind)
            }
        }
    }
}

/// Every failure the engine reports to the UI layer. All of them are scoped
/// to the single attempted action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    Validation(ValidationError),
    Cooldown(CooldownError),
    AlreadyProcessing { kind: ActionKind },
    NotConnected,
    NotAuthenticated,
    SubmissionFailed { kind: ActionKind, reason: String },
    ConfirmationFailed { kind: ActionKind, reason: Option<String> },
    ConfirmationTimeout { kind: ActionKind },
    TemporarilyUnavailable(String),
    HistoryUnavailable { deposits: String, loans: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(error) => write!(f, "{}", error),
            Self::Cooldown(error) => write!(f, "{}", error),
            Self::AlreadyProcessing { kind } => {
                write!(f, "A {} transaction is already in progress.", kind)
            }
            Self::NotConnected => write!(f, "Connect your wallet first."),
            Self::NotAuthenticated => write!(f, "Sign in to view your history."),
            Self::SubmissionFailed { kind, reason } => {
                write!(f, "The {} transaction was not submitted: {}", kind, reason)
            }
            Self::ConfirmationFailed { kind, reason: Some(reason) } => {
                write!(f, "The {} transaction failed: {}", kind, reason)
            }
            Self::ConfirmationFailed { kind, reason: None } => {
                write!(f, "The {} transaction failed. Please try again.", kind)
            }
            Self::ConfirmationTimeout { kind } => write!(
                f,
                "The {} transaction was not confirmed in time. Check your wallet before retrying.",
                kind
            ),
            Self::TemporarilyUnavailable(reason) => write!(f, "Temporarily unavailable: {}", reason),
            Self::HistoryUnavailable { deposits, loans } => write!(
                f,
                "History is unavailable (deposits: {}; loans: {}).",
                deposits, loans
            ),
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<CooldownError> for EngineError {
    fn from(e: CooldownError) -> Self {
        Self::Cooldown(e)
    }
}

impl From<GuardError> for EngineError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::AlreadyProcessing { kind } => Self::AlreadyProcessing { kind },
            GuardError::FetchInProgress => {
                Self::TemporarilyUnavailable("a price refresh is already running".to_string())
            }
        }
    }
}

impl From<CallError> for EngineError {
    fn from(e: CallError) -> Self {
        Self::TemporarilyUnavailable(e.to_string())
    }
}
