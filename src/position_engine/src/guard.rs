use ic_canister_log::log;
use std::marker::PhantomData;

use crate::logs::INFO;
use crate::state::Session;
use crate::{ActionKind, ActionSlot, EngineError, SEC_NANOS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardError {
    AlreadyProcessing { kind: ActionKind },
    FetchInProgress,
}

/// Guards an action slot from being submitted twice in the same session
/// while an earlier submission in that slot is unresolved.
///
/// A submitted transaction cannot be cancelled, so an unresolved
/// PendingAction blocks for as long as it stays unresolved. Only a guard
/// left behind with no submission in flight expires, after `timeout_nanos`.
/// The guard itself is released on drop.
#[must_use]
pub struct ActionGuard {
    session: Session,
    generation: u64,
    slot: ActionSlot,
    _marker: PhantomData<ActionGuard>,
}

impl ActionGuard {
    pub fn new(
        session: &Session,
        slot: ActionSlot,
        now: u64,
        timeout_nanos: u64,
    ) -> Result<Self, EngineError> {
        let kind = slot.kind();
        let guard = session.mutate(|s| {
            if let Some(pending) = s.pending_actions.get(&slot) {
                if !pending.status.is_terminal() {
                    log!(
                        INFO,
                        "[guard] {} for {} is still {:?} ({}s old)",
                        slot,
                        s.account,
                        pending.status,
                        now.saturating_sub(pending.submitted_at) / SEC_NANOS
                    );
                    return Err(GuardError::AlreadyProcessing { kind });
                }
            }

            if let Some(acquired_at) = s.action_guards.get(&slot).copied() {
                let age = now.saturating_sub(acquired_at);
                if age <= timeout_nanos {
                    log!(
                        INFO,
                        "[guard] {} for {} is already in progress ({}s old)",
                        slot,
                        s.account,
                        age / SEC_NANOS
                    );
                    return Err(GuardError::AlreadyProcessing { kind });
                }
                log!(
                    INFO,
                    "[guard] removing stale {} guard for {} ({}s old)",
                    slot,
                    s.account,
                    age / SEC_NANOS
                );
            }

            s.action_guards.insert(slot, now);
            Ok(Self {
                session: session.clone(),
                generation: s.generation,
                slot,
                _marker: PhantomData,
            })
        })?;
        guard.map_err(EngineError::from)
    }

    pub fn slot(&self) -> ActionSlot {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        let slot = self.slot;
        self.session
            .mutate_if_current(self.generation, |s| s.action_guards.remove(&slot));
    }
}

/// Only one price fetch runs per session at a time.
#[must_use]
pub struct FetchPriceGuard {
    session: Session,
    generation: u64,
}

impl FetchPriceGuard {
    pub fn new(session: &Session) -> Result<Self, EngineError> {
        let guard = session.mutate(|s| {
            if s.is_fetching_price {
                return Err(GuardError::FetchInProgress);
            }
            s.is_fetching_price = true;
            Ok(FetchPriceGuard {
                session: session.clone(),
                generation: s.generation,
            })
        })?;
        guard.map_err(EngineError::from)
    }
}

impl Drop for FetchPriceGuard {
    fn drop(&mut self) {
        self.session.mutate_if_current(self.generation, |s| {
            s.is_fetching_price = false;
        });
    }
}
