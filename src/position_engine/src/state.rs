use futures::future::AbortHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::cooldown::CooldownRecord;
use crate::history::HistoryView;
use crate::ledger::{LedgerAction, LedgerSnapshot, SubmissionHandle};
use crate::numeric::{saturating_sub, CollateralPrice, Ratio};
use crate::{ActionKind, ActionSlot, EngineError, SpenderRole, Token};

macro_rules! ensure {
    ($cond:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if !$cond {
            return Err(format!("Condition {} is false: {}",
                               std::stringify!($cond),
                               format!($msg $(,$args)*)));
        }
    }
}

/// A user's collateral, borrow and stake snapshot as last read from the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub collateral_balance: Decimal,
    pub borrowed_balance: Decimal,
    pub staked_amount: Decimal,
    pub pending_rewards: Decimal,
    /// Ledger-computed; `None` when nothing is borrowed.
    pub health_factor: Option<Ratio>,
    pub max_borrow_amount: Decimal,
}

impl Position {
    pub fn check_invariants(&self) -> Result<(), String> {
        ensure!(
            self.collateral_balance >= Decimal::ZERO
                && self.borrowed_balance >= Decimal::ZERO
                && self.staked_amount >= Decimal::ZERO
                && self.pending_rewards >= Decimal::ZERO,
            "negative balance in position {:?}",
            self
        );
        ensure!(
            self.borrowed_balance == Decimal::ZERO || self.collateral_balance > Decimal::ZERO,
            "debt of {} recorded without collateral",
            self.borrowed_balance
        );
        ensure!(
            self.borrowed_balance > Decimal::ZERO || self.health_factor.is_none(),
            "health factor {:?} reported without debt",
            self.health_factor
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Submitted,
    Confirming,
    Confirmed,
    Failed,
}

impl PendingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PendingStatus::Confirmed | PendingStatus::Failed)
    }
}

/// An in-flight user transaction. Lives until the UI clears it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub amount: Option<Decimal>,
    pub status: PendingStatus,
    pub submitted_at: u64,
    pub handle: Option<SubmissionHandle>,
    pub failure_reason: Option<String>,
}

/// Caches scoped to one connected wallet address.
#[derive(Debug)]
pub struct SessionState {
    pub account: String,
    pub generation: u64,

    pub position: Position,
    pub wallet_balances: BTreeMap<Token, Decimal>,
    pub allowances: BTreeMap<(Token, SpenderRole), Decimal>,
    pub cooldown: CooldownRecord,
    /// Set after an optimistic update until a refetch succeeds.
    pub cache_stale: bool,
    pub last_refresh: Option<u64>,

    pub last_price: Option<CollateralPrice>,
    pub last_price_timestamp: Option<u64>,
    pub is_fetching_price: bool,

    /// Acquisition time of each held action guard.
    pub action_guards: BTreeMap<ActionSlot, u64>,
    pub pending_actions: BTreeMap<ActionSlot, PendingAction>,

    pub history: Option<HistoryView>,
    pub history_loading: bool,

    pub abort_handles: BTreeMap<u64, AbortHandle>,
    pub next_abort_id: u64,
}

impl SessionState {
    pub fn new(account: &str, generation: u64) -> Self {
        Self {
            account: account.to_string(),
            generation,
            position: Position::default(),
            wallet_balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
            cooldown: CooldownRecord::default(),
            cache_stale: true,
            last_refresh: None,
            last_price: None,
            last_price_timestamp: None,
            is_fetching_price: false,
            action_guards: BTreeMap::new(),
            pending_actions: BTreeMap::new(),
            history: None,
            history_loading: false,
            abort_handles: BTreeMap::new(),
            next_abort_id: 0,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: LedgerSnapshot, now: u64) {
        self.position = snapshot.position;
        self.wallet_balances = snapshot.wallet_balances;
        self.allowances = snapshot.allowances;
        self.cooldown = snapshot.cooldown;
        self.cache_stale = false;
        self.last_refresh = Some(now);
    }

    pub fn needs_refresh(&self) -> bool {
        self.cache_stale || self.last_refresh.is_none()
    }

    pub fn wallet_balance(&self, token: Token) -> Decimal {
        self.wallet_balances.get(&token).copied().unwrap_or_default()
    }

    pub fn allowance(&self, token: Token, spender: SpenderRole) -> Option<Decimal> {
        self.allowances.get(&(token, spender)).copied()
    }

    /// The cached price, if it is younger than `max_age` nanoseconds.
    pub fn price_at(&self, now: u64, max_age: u64) -> Option<CollateralPrice> {
        let fetched_at = self.last_price_timestamp?;
        if now.saturating_sub(fetched_at) > max_age {
            return None;
        }
        self.last_price
    }

    fn adjust_wallet(&mut self, token: Token, delta: Decimal, credit: bool) {
        let balance = self.wallet_balance(token);
        let updated = if credit { balance + delta } else { saturating_sub(balance, delta) };
        self.wallet_balances.insert(token, updated);
    }

    fn spend_allowance(&mut self, kind: ActionKind, amount: Decimal) {
        if let Some((token, spender)) = kind.allowance_target() {
            if let Some(allowance) = self.allowances.get_mut(&(token, spender)) {
                *allowance = saturating_sub(*allowance, amount);
            }
        }
    }

    /// Moves the PendingAction in `slot` to `status`, but only if it is
    /// still the one submitted under `handle`. Returns its amount when it
    /// was updated.
    pub fn update_pending(
        &mut self,
        slot: ActionSlot,
        handle: &SubmissionHandle,
        status: PendingStatus,
        reason: Option<String>,
    ) -> Option<Option<Decimal>> {
        let pending = self
            .pending_actions
            .get_mut(&slot)
            .filter(|pending| pending.handle.as_ref() == Some(handle))?;
        pending.status = status;
        pending.failure_reason = reason;
        Some(pending.amount)
    }

    /// Applies the expected effect of a confirmed action to the caches and
    /// marks them stale until the next refetch.
    pub fn record_confirmed_action(&mut self, action: &LedgerAction, now: u64) {
        let amount = action.amount.unwrap_or_default();
        match action.kind {
            ActionKind::Deposit => {
                self.position.collateral_balance += amount;
                self.adjust_wallet(Token::Collateral, amount, false);
                self.spend_allowance(action.kind, amount);
            }
            ActionKind::Withdraw => {
                self.position.collateral_balance =
                    saturating_sub(self.position.collateral_balance, amount);
                self.adjust_wallet(Token::Collateral, amount, true);
            }
            ActionKind::Borrow => {
                self.position.borrowed_balance += amount;
                self.position.max_borrow_amount =
                    saturating_sub(self.position.max_borrow_amount, amount);
                self.adjust_wallet(Token::Borrow, amount, true);
            }
            ActionKind::Repay => {
                self.position.borrowed_balance =
                    saturating_sub(self.position.borrowed_balance, amount);
                self.position.max_borrow_amount += amount;
                self.adjust_wallet(Token::Borrow, amount, false);
                self.spend_allowance(action.kind, amount);
            }
            ActionKind::Stake => {
                self.position.staked_amount += amount;
                self.adjust_wallet(Token::Stake, amount, false);
                self.spend_allowance(action.kind, amount);
            }
            ActionKind::Unstake => {
                self.position.staked_amount = saturating_sub(self.position.staked_amount, amount);
                self.adjust_wallet(Token::Stake, amount, true);
                self.cooldown.clear();
            }
            ActionKind::Claim => {
                self.position.pending_rewards = Decimal::ZERO;
            }
            ActionKind::Cooldown => {
                self.cooldown.start(now);
            }
            ActionKind::Approve => {
                if let (Some(token), Some(spender)) = (action.token, action.spender) {
                    self.allowances.insert((token, spender), amount);
                }
            }
        }
        if self.position.borrowed_balance == Decimal::ZERO {
            self.position.health_factor = None;
        }
        self.cache_stale = true;
    }
}

/// Handle to the current session's caches. Cloning shares the same session.
///
/// Every `init` starts a new generation; work started under an older
/// generation must not write into a newer session.
#[derive(Clone, Default)]
pub struct Session {
    inner: Rc<RefCell<Option<SessionState>>>,
    next_generation: Rc<Cell<u64>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous session with a fresh one for `account`.
    pub fn init(&self, account: &str) -> u64 {
        self.teardown();
        let generation = self.next_generation.get() + 1;
        self.next_generation.set(generation);
        *self.inner.borrow_mut() = Some(SessionState::new(account, generation));
        generation
    }

    /// Drops every cache and abandons the registered in-flight reads.
    /// Returns the account that was connected.
    pub fn teardown(&self) -> Option<String> {
        let state = self.inner.borrow_mut().take()?;
        for handle in state.abort_handles.values() {
            handle.abort();
        }
        Some(state.account)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().is_some()
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.inner.borrow().as_ref().map(|s| s.generation)
    }

    pub fn read<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&SessionState) -> R,
    {
        self.inner
            .borrow()
            .as_ref()
            .map(f)
            .ok_or(EngineError::NotConnected)
    }

    pub fn mutate<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut SessionState) -> R,
    {
        self.inner
            .borrow_mut()
            .as_mut()
            .map(f)
            .ok_or(EngineError::NotConnected)
    }

    /// Runs `f` only if the session of `generation` is still the current one.
    pub fn mutate_if_current<F, R>(&self, generation: u64, f: F) -> Option<R>
    where
        F: FnOnce(&mut SessionState) -> R,
    {
        self.inner
            .borrow_mut()
            .as_mut()
            .filter(|s| s.generation == generation)
            .map(f)
    }

    pub fn register_abort(&self, handle: AbortHandle) -> Result<(u64, u64), EngineError> {
        self.mutate(|s| {
            let id = s.next_abort_id;
            s.next_abort_id += 1;
            s.abort_handles.insert(id, handle);
            (s.generation, id)
        })
    }

    pub fn unregister_abort(&self, generation: u64, id: u64) {
        self.mutate_if_current(generation, |s| s.abort_handles.remove(&id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::sample_position;
    use futures::future::AbortHandle;
    use rust_decimal_macros::dec;

    #[test]
    fn sample_position_is_consistent() {
        assert_eq!(sample_position().check_invariants(), Ok(()));
    }

    #[test]
    fn detects_debt_without_collateral() {
        let position = Position {
            borrowed_balance: dec!(10),
            health_factor: Some(Ratio::new(dec!(1.5))),
            ..Position::default()
        };
        assert!(position.check_invariants().is_err());
    }

    #[test]
    fn session_requires_init() {
        let session = Session::new();
        assert_eq!(session.read(|s| s.account.clone()), Err(EngineError::NotConnected));

        let generation = session.init("0xabc");
        assert_eq!(session.current_generation(), Some(generation));
        assert_eq!(session.read(|s| s.account.clone()), Ok("0xabc".to_string()));

        assert_eq!(session.teardown(), Some("0xabc".to_string()));
        assert!(!session.is_connected());
    }

    #[test]
    fn stale_generation_cannot_write() {
        let session = Session::new();
        let old = session.init("0xabc");
        let new = session.init("0xdef");
        assert_ne!(old, new);
        assert_eq!(session.mutate_if_current(old, |s| s.account.clone()), None);
        assert_eq!(
            session.mutate_if_current(new, |s| s.account.clone()),
            Some("0xdef".to_string())
        );
    }

    #[test]
    fn teardown_aborts_registered_reads() {
        let session = Session::new();
        session.init("0xabc");
        let (handle, _registration) = AbortHandle::new_pair();
        session.register_abort(handle.clone()).unwrap();
        session.teardown();
        assert!(handle.is_aborted());
    }

    #[test]
    fn price_expires_after_max_age() {
        let mut state = SessionState::new("0xabc", 1);
        state.last_price = CollateralPrice::new(dec!(60000));
        state.last_price_timestamp = Some(1_000);
        assert!(state.price_at(1_500, 500).is_some());
        assert!(state.price_at(1_501, 500).is_none());
    }

    #[test]
    fn optimistic_repay_clears_health_factor() {
        let mut state = SessionState::new("0xabc", 1);
        state.position = sample_position();
        state.cache_stale = false;
        let debt = state.position.borrowed_balance;
        state.wallet_balances.insert(Token::Borrow, debt);
        state.allowances.insert((Token::Borrow, SpenderRole::LendingPool), debt);

        state.record_confirmed_action(&LedgerAction::new(ActionKind::Repay, Some(debt)), 0);

        assert_eq!(state.position.borrowed_balance, Decimal::ZERO);
        assert_eq!(state.position.health_factor, None);
        assert_eq!(state.wallet_balance(Token::Borrow), Decimal::ZERO);
        assert_eq!(state.allowance(Token::Borrow, SpenderRole::LendingPool), Some(Decimal::ZERO));
        assert!(state.needs_refresh());
        assert_eq!(state.position.check_invariants(), Ok(()));
    }

    #[test]
    fn pending_update_requires_matching_handle() {
        let mut state = SessionState::new("0xabc", 1);
        let slot = ActionSlot::Intent(ActionKind::Borrow);
        let current = SubmissionHandle { id: "tx-2".to_string() };
        state.pending_actions.insert(
            slot,
            PendingAction {
                kind: ActionKind::Borrow,
                amount: Some(dec!(10)),
                status: PendingStatus::Failed,
                submitted_at: 0,
                handle: Some(current.clone()),
                failure_reason: Some("reverted".to_string()),
            },
        );

        let older = SubmissionHandle { id: "tx-1".to_string() };
        assert_eq!(
            state.update_pending(slot, &older, PendingStatus::Confirmed, None),
            None
        );
        assert_eq!(state.pending_actions[&slot].status, PendingStatus::Failed);

        assert_eq!(
            state.update_pending(slot, &current, PendingStatus::Confirmed, None),
            Some(Some(dec!(10)))
        );
        assert_eq!(state.pending_actions[&slot].status, PendingStatus::Confirmed);
        assert_eq!(state.pending_actions[&slot].failure_reason, None);
    }

    #[test]
    fn optimistic_approve_sets_allowance() {
        let mut state = SessionState::new("0xabc", 1);
        let approve = LedgerAction::approve(Token::Stake, SpenderRole::StakingPool, dec!(25));
        state.record_confirmed_action(&approve, 0);
        assert_eq!(state.allowance(Token::Stake, SpenderRole::StakingPool), Some(dec!(25)));
    }
}
