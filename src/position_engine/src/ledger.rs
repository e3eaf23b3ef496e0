use async_trait::async_trait;
use futures::future::try_join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::EngineConfig;
use crate::cooldown::CooldownRecord;
use crate::numeric::Ratio;
use crate::state::Position;
use crate::{ActionKind, ActionSlot, SpenderRole, Token};

/// Represents an error from a collaborator call (ledger, price feed,
/// history source).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallError {
    method: String,
    reason: Reason,
}

impl CallError {
    pub fn new(method: impl Into<String>, reason: Reason) -> Self {
        Self {
            method: method.into(),
            reason,
        }
    }

    /// Returns the name of the method that resulted in this error.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the failure reason.
    pub fn reason(&self) -> &Reason {
        &self.reason
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.reason, Reason::Timeout)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "call to {} failed: {}", self.method, self.reason)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    /// The callee (or the wallet signing on its behalf) refused the call.
    Rejected(String),
    /// No answer arrived in time.
    Timeout,
    /// The callee is unreachable.
    Unavailable(String),
    /// The callee answered with a value of the wrong shape.
    UnexpectedValue(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(msg) => write!(fmt, "rejected: {}", msg),
            Self::Timeout => write!(fmt, "timed out"),
            Self::Unavailable(msg) => write!(fmt, "unavailable: {}", msg),
            Self::UnexpectedValue(msg) => write!(fmt, "unexpected value: {}", msg),
        }
    }
}

/// Fields the engine reads from the ledger for one account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LedgerField {
    CollateralBalance,
    BorrowedBalance,
    StakedAmount,
    PendingRewards,
    HealthFactor,
    MaxBorrowAmount,
    WalletBalance(Token),
    Allowance { token: Token, spender: SpenderRole },
    /// Nanosecond timestamp, absent when no cooldown was requested.
    CooldownStart,
    CooldownPeriod,
    UnstakeWindow,
}

impl fmt::Display for LedgerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollateralBalance => write!(f, "collateral_balance"),
            Self::BorrowedBalance => write!(f, "borrowed_balance"),
            Self::StakedAmount => write!(f, "staked_amount"),
            Self::PendingRewards => write!(f, "pending_rewards"),
            Self::HealthFactor => write!(f, "health_factor"),
            Self::MaxBorrowAmount => write!(f, "max_borrow_amount"),
            Self::WalletBalance(token) => write!(f, "wallet_balance({})", token),
            Self::Allowance { token, spender } => write!(f, "allowance({}, {})", token, spender),
            Self::CooldownStart => write!(f, "cooldown_start"),
            Self::CooldownPeriod => write!(f, "cooldown_period"),
            Self::UnstakeWindow => write!(f, "unstake_window"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerValue {
    Amount(Decimal),
    Timestamp(Option<u64>),
    /// Nanoseconds.
    Duration(u64),
}

impl LedgerValue {
    fn mismatch(field: LedgerField, expected: &str, got: &LedgerValue) -> CallError {
        CallError::new(
            format!("read({})", field),
            Reason::UnexpectedValue(format!("expected {}, got {:?}", expected, got)),
        )
    }

    pub fn into_amount(self, field: LedgerField) -> Result<Decimal, CallError> {
        match self {
            LedgerValue::Amount(amount) if amount >= Decimal::ZERO => Ok(amount),
            other => Err(Self::mismatch(field, "a non-negative amount", &other)),
        }
    }

    pub fn into_timestamp(self, field: LedgerField) -> Result<Option<u64>, CallError> {
        match self {
            LedgerValue::Timestamp(ts) => Ok(ts),
            other => Err(Self::mismatch(field, "a timestamp", &other)),
        }
    }

    pub fn into_duration(self, field: LedgerField) -> Result<u64, CallError> {
        match self {
            LedgerValue::Duration(nanos) => Ok(nanos),
            other => Err(Self::mismatch(field, "a duration", &other)),
        }
    }
}

/// A state-changing call handed to the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAction {
    pub kind: ActionKind,
    pub amount: Option<Decimal>,
    pub token: Option<Token>,
    pub spender: Option<SpenderRole>,
    /// Contract address of `token`, filled in from the engine config.
    pub token_address: Option<String>,
    /// Contract address of `spender`, filled in from the engine config.
    pub spender_address: Option<String>,
}

impl LedgerAction {
    pub fn new(kind: ActionKind, amount: Option<Decimal>) -> Self {
        Self {
            kind,
            amount,
            token: kind.amount_token(),
            spender: kind.allowance_target().map(|(_, spender)| spender),
            token_address: None,
            spender_address: None,
        }
    }

    /// Raises the allowance of `spender` over `token` to `amount`.
    pub fn approve(token: Token, spender: SpenderRole, amount: Decimal) -> Self {
        Self {
            kind: ActionKind::Approve,
            amount: Some(amount),
            token: Some(token),
            spender: Some(spender),
            token_address: None,
            spender_address: None,
        }
    }

    /// Resolves the token and spender roles to the configured contract
    /// addresses.
    pub fn with_addresses(mut self, config: &EngineConfig) -> Self {
        self.token_address = self.token.map(|token| config.token(token).address.clone());
        self.spender_address = self
            .spender
            .map(|spender| config.spender_address(spender).to_string());
        self
    }

    pub fn slot(&self) -> ActionSlot {
        match (self.kind, self.token, self.spender) {
            (ActionKind::Approve, Some(token), Some(spender)) => {
                ActionSlot::Approval { token, spender }
            }
            (kind, _, _) => ActionSlot::Intent(kind),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Success(Receipt),
    Failure { reason: Option<String> },
}

/// The on-chain ledger as seen by the engine. Writes resolve in two phases:
/// `write` returns once the transaction is submitted, `await_confirmation`
/// once it has executed.
#[async_trait(?Send)]
pub trait Ledger {
    async fn read(&self, field: LedgerField, account: &str) -> Result<LedgerValue, CallError>;

    async fn write(
        &self,
        account: &str,
        action: LedgerAction,
    ) -> Result<SubmissionHandle, CallError>;

    async fn await_confirmation(&self, handle: &SubmissionHandle)
        -> Result<Confirmation, CallError>;
}

/// Everything the engine caches for one account, read in one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub position: Position,
    pub wallet_balances: BTreeMap<Token, Decimal>,
    pub allowances: BTreeMap<(Token, SpenderRole), Decimal>,
    pub cooldown: CooldownRecord,
}

async fn read_amount(ledger: &dyn Ledger, field: LedgerField, account: &str) -> Result<Decimal, CallError> {
    ledger.read(field, account).await?.into_amount(field)
}

pub fn allowance_targets() -> Vec<(Token, SpenderRole)> {
    let mut targets: Vec<_> = ActionKind::USER_ACTIONS
        .iter()
        .filter_map(|kind| kind.allowance_target())
        .collect();
    targets.sort();
    targets.dedup();
    targets
}

pub async fn load_snapshot(ledger: &dyn Ledger, account: &str) -> Result<LedgerSnapshot, CallError> {
    let position = async {
        let (
            collateral_balance,
            borrowed_balance,
            staked_amount,
            pending_rewards,
            health_factor,
            max_borrow_amount,
        ) = futures::try_join!(
            read_amount(ledger, LedgerField::CollateralBalance, account),
            read_amount(ledger, LedgerField::BorrowedBalance, account),
            read_amount(ledger, LedgerField::StakedAmount, account),
            read_amount(ledger, LedgerField::PendingRewards, account),
            read_amount(ledger, LedgerField::HealthFactor, account),
            read_amount(ledger, LedgerField::MaxBorrowAmount, account),
        )?;
        Ok::<_, CallError>(Position {
            collateral_balance,
            borrowed_balance,
            staked_amount,
            pending_rewards,
            // Undefined without debt.
            health_factor: (borrowed_balance > Decimal::ZERO).then(|| Ratio::from(health_factor)),
            max_borrow_amount,
        })
    };

    let wallet_balances = try_join_all(Token::ALL.into_iter().map(|token| async move {
        let balance = read_amount(ledger, LedgerField::WalletBalance(token), account).await?;
        Ok::<_, CallError>((token, balance))
    }));

    let allowances = try_join_all(allowance_targets().into_iter().map(|(token, spender)| async move {
        let allowance = read_amount(ledger, LedgerField::Allowance { token, spender }, account).await?;
        Ok::<_, CallError>(((token, spender), allowance))
    }));

    let cooldown = async {
        let (start, period, window) = futures::try_join!(
            ledger.read(LedgerField::CooldownStart, account),
            ledger.read(LedgerField::CooldownPeriod, account),
            ledger.read(LedgerField::UnstakeWindow, account),
        )?;
        Ok::<_, CallError>(CooldownRecord {
            cooldown_start: start.into_timestamp(LedgerField::CooldownStart)?,
            cooldown_period: period.into_duration(LedgerField::CooldownPeriod)?,
            unstake_window: window.into_duration(LedgerField::UnstakeWindow)?,
        })
    };

    let (position, wallet_balances, allowances, cooldown) =
        futures::try_join!(position, wallet_balances, allowances, cooldown)?;

    Ok(LedgerSnapshot {
        position,
        wallet_balances: wallet_balances.into_iter().collect(),
        allowances: allowances.into_iter().collect(),
        cooldown,
    })
}
