use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::future::{AbortHandle, Abortable};
use ic_canister_log::log;
use rust_decimal::Decimal;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use crate::approval::allowance_below;
use crate::auth::{require_token, Auth};
use crate::config::{ConfigError, EngineConfig};
use crate::cooldown::CooldownState;
use crate::guard::ActionGuard;
use crate::history::{self, HistorySource, HistoryView};
use crate::ledger::{load_snapshot, Confirmation, Ledger, LedgerAction, Receipt, SubmissionHandle};
use crate::logs::{DEBUG, INFO};
use crate::numeric::parse_amount;
use crate::price::{fetch_collateral_price, PriceFeed};
use crate::risk::{check_borrow_limit, derive_metrics, DerivedMetrics, RiskParameters};
use crate::state::{PendingAction, PendingStatus, Position, Session, SessionState};
use crate::{ActionKind, ActionSlot, Clock, EngineError, SpenderRole, Token, ValidationError};

/// External systems the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Rc<dyn Ledger>,
    pub price_feed: Rc<dyn PriceFeed>,
    pub history_source: Rc<dyn HistorySource>,
    pub auth: Rc<dyn Auth>,
    pub clock: Rc<dyn Clock>,
}

/// A PendingAction transition, as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionUpdate {
    pub slot: ActionSlot,
    pub kind: ActionKind,
    pub amount: Option<Decimal>,
    pub status: PendingStatus,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionReceipt {
    pub kind: ActionKind,
    pub amount: Option<Decimal>,
    pub receipt: Receipt,
    /// The session ended while the transaction was confirming. The result is
    /// final but was not applied to any cache.
    pub detached: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The requested action ran and was confirmed.
    Completed(ActionReceipt),
    /// Only an allowance raise was submitted and confirmed. The caller
    /// retries the original intent.
    ApprovalGranted {
        kind: ActionKind,
        token: Token,
        spender: SpenderRole,
        approval: ActionReceipt,
    },
}

/// Position orchestrator for one wallet session at a time.
pub struct PositionEngine {
    config: EngineConfig,
    risk_params: RiskParameters,
    session: Session,
    ledger: Rc<dyn Ledger>,
    price_feed: Rc<dyn PriceFeed>,
    history_source: Rc<dyn HistorySource>,
    auth: Rc<dyn Auth>,
    clock: Rc<dyn Clock>,
    subscribers: RefCell<Vec<UnboundedSender<ActionUpdate>>>,
}

impl PositionEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            risk_params: RiskParameters::from(&config),
            config,
            session: Session::new(),
            ledger: collaborators.ledger,
            price_feed: collaborators.price_feed,
            history_source: collaborators.history_source,
            auth: collaborators.auth,
            clock: collaborators.clock,
            subscribers: RefCell::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Starts a session for `account`, dropping any previous one, and loads
    /// its position and the collateral price.
    pub async fn connect(&self, account: &str) -> Result<(), EngineError> {
        let generation = self.session.init(account);
        log!(INFO, "[connect] session {} started for {}", generation, account);
        self.refresh().await?;
        self.refresh_price().await
    }

    /// Clears every cache and abandons in-flight reads. Submitted
    /// transactions still run to their terminal state.
    pub async fn disconnect(&self) {
        if let Some(account) = self.session.teardown() {
            log!(INFO, "[disconnect] session for {} torn down", account);
        }
        if let Err(error) = self.auth.sign_out().await {
            log!(INFO, "[disconnect] sign out failed: {}", error);
        }
    }

    pub async fn sign_in(&self) -> Result<(), EngineError> {
        let account = self.session.read(|s| s.account.clone())?;
        self.auth.sign_in(&account).await.map_err(|error| {
            log!(INFO, "[sign_in] failed for {}: {}", account, error);
            EngineError::from(error)
        })
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ActionUpdate> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.borrow_mut().push(sender);
        receiver
    }

    fn emit(&self, update: ActionUpdate) {
        self.subscribers
            .borrow_mut()
            .retain(|sender| sender.unbounded_send(update.clone()).is_ok());
    }

    /// Runs `fut` so that a disconnect abandons it. Returns `None` when it
    /// was abandoned, along with the session generation it ran under.
    async fn abortable<F: Future>(&self, fut: F) -> Result<Option<(u64, F::Output)>, EngineError> {
        let (handle, registration) = AbortHandle::new_pair();
        let (generation, id) = self.session.register_abort(handle)?;
        let result = Abortable::new(fut, registration).await;
        self.session.unregister_abort(generation, id);
        Ok(result.ok().map(|output| (generation, output)))
    }

    /// Refetches position, balances, allowances and cooldown from the ledger.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let account = self.session.read(|s| s.account.clone())?;
        let (generation, snapshot) =
            match self.abortable(load_snapshot(self.ledger.as_ref(), &account)).await? {
                Some((generation, result)) => (generation, result?),
                None => {
                    log!(DEBUG, "[refresh] abandoned for {}", account);
                    return Ok(());
                }
            };
        if let Err(violation) = snapshot.position.check_invariants() {
            log!(INFO, "[refresh] ledger position for {} is inconsistent: {}", account, violation);
        }
        let now = self.clock.now();
        self.session
            .mutate_if_current(generation, |s| s.apply_snapshot(snapshot, now));
        log!(DEBUG, "[refresh] position of {} refreshed", account);
        Ok(())
    }

    pub async fn refresh_price(&self) -> Result<(), EngineError> {
        let fetch = fetch_collateral_price(&self.session, self.price_feed.as_ref(), self.clock.as_ref());
        match self.abortable(fetch).await? {
            Some((_, result)) => result,
            None => Ok(()),
        }
    }

    /// Entry point for the host's refresh timer.
    pub async fn on_refresh_tick(&self) -> Result<(), EngineError> {
        self.refresh_price().await?;
        self.refresh().await
    }

    pub fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval()
    }

    pub fn get_derived_metrics(&self) -> Result<DerivedMetrics, EngineError> {
        let now = self.clock.now();
        let max_age = self.config.price_max_age_nanos();
        self.session.read(|s| {
            derive_metrics(&s.position, s.price_at(now, max_age), &self.risk_params)
        })
    }

    pub fn get_cooldown_state(&self) -> Result<CooldownState, EngineError> {
        let now = self.clock.now();
        self.session.read(|s| s.cooldown.state_at(now))
    }

    pub fn position(&self) -> Result<Position, EngineError> {
        self.session.read(|s| s.position.clone())
    }

    pub fn pending_action(
        &self,
        slot: impl Into<ActionSlot>,
    ) -> Result<Option<PendingAction>, EngineError> {
        let slot = slot.into();
        self.session.read(|s| s.pending_actions.get(&slot).cloned())
    }

    /// Drops a terminal PendingAction once the UI has shown its result.
    pub fn clear_action(&self, slot: impl Into<ActionSlot>) -> Result<bool, EngineError> {
        let slot = slot.into();
        self.session.mutate(|s| {
            let terminal = s
                .pending_actions
                .get(&slot)
                .map_or(false, |pending| pending.status.is_terminal());
            if terminal {
                s.pending_actions.remove(&slot);
            }
            terminal
        })
    }

    /// Fetches deposit and loan history. `Ok(None)` means the fetch was
    /// abandoned by a disconnect.
    pub async fn fetch_history(&self) -> Result<Option<HistoryView>, EngineError> {
        let token = require_token(self.auth.as_ref())?;
        self.session.mutate(|s| s.history_loading = true)?;
        let fetch = history::fetch_history(self.history_source.as_ref(), &token);
        match self.abortable(fetch).await? {
            Some((generation, result)) => {
                self.session.mutate_if_current(generation, |s| {
                    s.history_loading = false;
                    if let Ok(view) = &result {
                        s.history = Some(view.clone());
                    }
                });
                result.map(Some)
            }
            None => {
                log!(DEBUG, "[fetch_history] abandoned");
                Ok(None)
            }
        }
    }

    pub fn history(&self) -> Result<Option<HistoryView>, EngineError> {
        self.session.read(|s| s.history.clone())
    }

    pub fn is_history_loading(&self) -> Result<bool, EngineError> {
        self.session.read(|s| s.history_loading)
    }

    pub async fn deposit(&self, amount: &str) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Deposit, Some(amount)).await
    }

    pub async fn borrow(&self, amount: &str) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Borrow, Some(amount)).await
    }

    pub async fn withdraw(&self, amount: &str) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Withdraw, Some(amount)).await
    }

    pub async fn repay(&self, amount: &str) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Repay, Some(amount)).await
    }

    pub async fn stake(&self, amount: &str) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Stake, Some(amount)).await
    }

    pub async fn unstake(&self, amount: &str) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Unstake, Some(amount)).await
    }

    /// Claims the full pending reward.
    pub async fn claim(&self) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Claim, None).await
    }

    pub async fn start_cooldown(&self) -> Result<ActionOutcome, EngineError> {
        self.submit(ActionKind::Cooldown, None).await
    }

    /// Validates and submits one user intent.
    ///
    /// When the action spends an allowance that is too low, only the
    /// approval is submitted and `ActionOutcome::ApprovalGranted` is
    /// returned; the intent itself must be submitted again.
    pub async fn submit(
        &self,
        kind: ActionKind,
        amount: Option<&str>,
    ) -> Result<ActionOutcome, EngineError> {
        if kind == ActionKind::Approve {
            return Err(ValidationError::UnsupportedAction(kind).into());
        }
        let amount = match kind.amount_token() {
            Some(token) => Some(parse_amount(amount, self.config.token(token).decimals)?),
            None => None,
        };

        let timeout = self.config.action_timeout_nanos();
        let guard = ActionGuard::new(&self.session, kind.into(), self.clock.now(), timeout)?;

        if self.session.read(SessionState::needs_refresh)? {
            self.refresh().await?;
        }
        let amount = self.validate(kind, amount)?;

        if let (Some((token, spender)), Some(amount)) = (kind.allowance_target(), amount) {
            let allowance = self.session.read(|s| s.allowance(token, spender))?;
            if allowance_below(amount, allowance) {
                log!(
                    INFO,
                    "[submit] {} of {} needs {} allowance for the {} (current: {:?})",
                    kind,
                    amount,
                    token,
                    spender,
                    allowance
                );
                let _approve_guard = ActionGuard::new(
                    &self.session,
                    ActionSlot::Approval { token, spender },
                    self.clock.now(),
                    timeout,
                )?;
                let approval = self
                    .execute(LedgerAction::approve(token, spender, amount), guard.generation())
                    .await?;
                return Ok(ActionOutcome::ApprovalGranted {
                    kind,
                    token,
                    spender,
                    approval,
                });
            }
        }

        let receipt = self
            .execute(LedgerAction::new(kind, amount), guard.generation())
            .await?;
        Ok(ActionOutcome::Completed(receipt))
    }

    /// Local preconditions against the cached position. Advisory only: the
    /// ledger enforces its own limits. Returns the amount to submit.
    fn validate(
        &self,
        kind: ActionKind,
        amount: Option<Decimal>,
    ) -> Result<Option<Decimal>, EngineError> {
        let now = self.clock.now();
        self.session.read(|s| -> Result<Option<Decimal>, EngineError> {
            let position = &s.position;
            match (kind, amount) {
                (ActionKind::Deposit, Some(amount)) => {
                    within(amount, s.wallet_balance(Token::Collateral))?;
                }
                (ActionKind::Withdraw, Some(amount)) => {
                    within(amount, position.collateral_balance)?;
                    if amount == position.collateral_balance
                        && position.borrowed_balance > Decimal::ZERO
                    {
                        return Err(ValidationError::WouldLeaveDebtUncollateralized.into());
                    }
                }
                (ActionKind::Borrow, Some(amount)) => check_borrow_limit(amount, position)?,
                (ActionKind::Repay, Some(amount)) => {
                    if amount > position.borrowed_balance {
                        return Err(ValidationError::ExceedsDebt {
                            requested: amount,
                            outstanding: position.borrowed_balance,
                        }
                        .into());
                    }
                    within(amount, s.wallet_balance(Token::Borrow))?;
                }
                (ActionKind::Stake, Some(amount)) => {
                    within(amount, s.wallet_balance(Token::Stake))?;
                }
                (ActionKind::Unstake, Some(amount)) => {
                    if position.staked_amount <= Decimal::ZERO {
                        return Err(ValidationError::NothingStaked.into());
                    }
                    s.cooldown.check_unstake(now)?;
                    within(amount, position.staked_amount)?;
                }
                (ActionKind::Claim, _) => {
                    if position.pending_rewards <= Decimal::ZERO {
                        return Err(ValidationError::NothingToClaim.into());
                    }
                    return Ok(Some(position.pending_rewards));
                }
                (ActionKind::Cooldown, _) => {
                    if position.staked_amount <= Decimal::ZERO {
                        return Err(ValidationError::NothingStaked.into());
                    }
                    s.cooldown.check_start(now)?;
                }
                (ActionKind::Approve, _) => {
                    return Err(ValidationError::UnsupportedAction(kind).into())
                }
                (_, None) => return Err(ValidationError::MissingAmount.into()),
            }
            Ok(amount)
        })?
    }

    /// Submits `action` and waits for its terminal state. The cache is
    /// refetched strictly after a confirmation, never before.
    async fn execute(
        &self,
        action: LedgerAction,
        generation: u64,
    ) -> Result<ActionReceipt, EngineError> {
        let action = action.with_addresses(&self.config);
        let kind = action.kind;
        let slot = action.slot();
        let account = self.session.read(|s| s.account.clone())?;
        log!(INFO, "[execute] submitting {} of {:?} for {}", kind, action.amount, account);

        let handle = match self.ledger.write(&account, action.clone()).await {
            Ok(handle) => handle,
            Err(error) => {
                log!(INFO, "[execute] {} for {} was not submitted: {}", kind, account, error);
                return Err(EngineError::SubmissionFailed {
                    kind,
                    reason: error.reason().to_string(),
                });
            }
        };

        let pending = PendingAction {
            kind,
            amount: action.amount,
            status: PendingStatus::Submitted,
            submitted_at: self.clock.now(),
            handle: Some(handle.clone()),
            failure_reason: None,
        };
        let recorded = self.session.mutate_if_current(generation, |s| {
            s.pending_actions.insert(slot, pending);
        });
        if recorded.is_some() {
            self.emit(ActionUpdate {
                slot,
                kind,
                amount: action.amount,
                status: PendingStatus::Submitted,
                reason: None,
            });
        }
        self.transition(generation, slot, &handle, PendingStatus::Confirming, None);

        let confirmation = self.ledger.await_confirmation(&handle).await;
        let detached = self.session.current_generation() != Some(generation);

        match confirmation {
            Ok(Confirmation::Success(receipt)) => {
                log!(INFO, "[execute] {} for {} confirmed in {}", kind, account, receipt.tx_hash);
                self.transition(generation, slot, &handle, PendingStatus::Confirmed, None);
                let now = self.clock.now();
                self.session
                    .mutate_if_current(generation, |s| s.record_confirmed_action(&action, now));
                if !detached {
                    if let Err(error) = self.refresh().await {
                        log!(INFO, "[execute] refresh after {} failed: {}", kind, error);
                    }
                }
                Ok(ActionReceipt {
                    kind,
                    amount: action.amount,
                    receipt,
                    detached,
                })
            }
            Ok(Confirmation::Failure { reason }) => {
                log!(INFO, "[execute] {} for {} failed: {:?}", kind, account, reason);
                self.transition(generation, slot, &handle, PendingStatus::Failed, reason.clone());
                Err(EngineError::ConfirmationFailed { kind, reason })
            }
            Err(error) if error.is_timeout() => {
                log!(INFO, "[execute] {} for {} timed out: {}", kind, account, error);
                self.transition(
                    generation,
                    slot,
                    &handle,
                    PendingStatus::Failed,
                    Some("confirmation timed out".to_string()),
                );
                Err(EngineError::ConfirmationTimeout { kind })
            }
            Err(error) => {
                log!(INFO, "[execute] {} for {} could not be confirmed: {}", kind, account, error);
                let reason = Some(error.reason().to_string());
                self.transition(generation, slot, &handle, PendingStatus::Failed, reason.clone());
                Err(EngineError::ConfirmationFailed { kind, reason })
            }
        }
    }

    /// Moves the PendingAction submitted under `handle` to `status` and
    /// notifies subscribers. A slot since reused by a newer submission is
    /// left alone.
    fn transition(
        &self,
        generation: u64,
        slot: ActionSlot,
        handle: &SubmissionHandle,
        status: PendingStatus,
        reason: Option<String>,
    ) {
        let updated = self
            .session
            .mutate_if_current(generation, |s| {
                s.update_pending(slot, handle, status, reason.clone())
            })
            .flatten();
        if let Some(amount) = updated {
            self.emit(ActionUpdate {
                slot,
                kind: slot.kind(),
                amount,
                status,
                reason,
            });
        }
    }
}

fn within(requested: Decimal, available: Decimal) -> Result<(), ValidationError> {
    if requested > available {
        return Err(ValidationError::ExceedsBalance {
            requested,
            available,
        });
    }
    Ok(())
}
