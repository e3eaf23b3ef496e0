use async_trait::async_trait;
use ic_canister_log::log;
use rust_decimal::Decimal;

use crate::guard::FetchPriceGuard;
use crate::ledger::CallError;
use crate::logs::TRACE_PRICE;
use crate::numeric::CollateralPrice;
use crate::state::Session;
use crate::{Clock, EngineError};

/// Source of the collateral price, in borrow-asset units per collateral unit.
#[async_trait(?Send)]
pub trait PriceFeed {
    async fn get_collateral_price(&self) -> Result<Decimal, CallError>;
}

/// Fetches the collateral price into the session cache.
///
/// A failed or non-positive answer drops the cached price, so metrics report
/// the price as unavailable until a fetch succeeds. A fetch already in
/// flight makes this a no-op.
pub async fn fetch_collateral_price(
    session: &Session,
    feed: &dyn PriceFeed,
    clock: &dyn Clock,
) -> Result<(), EngineError> {
    let _guard = match FetchPriceGuard::new(session) {
        Ok(guard) => guard,
        Err(EngineError::NotConnected) => return Err(EngineError::NotConnected),
        Err(_) => {
            log!(TRACE_PRICE, "[fetch_collateral_price] double entry.");
            return Ok(());
        }
    };
    let generation = session
        .current_generation()
        .ok_or(EngineError::NotConnected)?;

    let price = match feed.get_collateral_price().await {
        Ok(value) => {
            let price = CollateralPrice::new(value);
            if price.is_none() {
                log!(
                    TRACE_PRICE,
                    "[fetch_collateral_price] rejecting non-positive price {}",
                    value
                );
            }
            price
        }
        Err(error) => {
            log!(
                TRACE_PRICE,
                "[fetch_collateral_price] failed to fetch collateral price: {}",
                error
            );
            None
        }
    };

    let now = clock.now();
    if let Some(price) = price {
        log!(
            TRACE_PRICE,
            "[fetch_collateral_price] fetched new collateral price: {} at {}",
            price,
            now
        );
    }
    session.mutate_if_current(generation, |s| {
        s.last_price = price;
        s.last_price_timestamp = price.map(|_| now);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Reason;
    use crate::test_helpers::ManualClock;
    use futures::executor::block_on;
    use rust_decimal_macros::dec;

    struct FixedFeed(Result<Decimal, CallError>);

    #[async_trait(?Send)]
    impl PriceFeed for FixedFeed {
        async fn get_collateral_price(&self) -> Result<Decimal, CallError> {
            self.0.clone()
        }
    }

    fn cached_price(session: &Session) -> Option<CollateralPrice> {
        session.read(|s| s.last_price).unwrap()
    }

    #[test]
    fn stores_positive_price() {
        let session = Session::new();
        session.init("0xabc");
        let clock = ManualClock::new(42);
        block_on(fetch_collateral_price(&session, &FixedFeed(Ok(dec!(65000))), &clock)).unwrap();
        assert_eq!(cached_price(&session), CollateralPrice::new(dec!(65000)));
        assert_eq!(session.read(|s| s.last_price_timestamp).unwrap(), Some(42));
        assert!(!session.read(|s| s.is_fetching_price).unwrap());
    }

    #[test]
    fn failure_makes_price_unavailable() {
        let session = Session::new();
        session.init("0xabc");
        let clock = ManualClock::new(0);
        let good = FixedFeed(Ok(dec!(65000)));
        block_on(fetch_collateral_price(&session, &good, &clock)).unwrap();

        let failing = FixedFeed(Err(CallError::new("get_collateral_price", Reason::Timeout)));
        block_on(fetch_collateral_price(&session, &failing, &clock)).unwrap();
        assert_eq!(cached_price(&session), None);
        assert_eq!(session.read(|s| s.price_at(0, u64::MAX)).unwrap(), None);

        block_on(fetch_collateral_price(&session, &good, &clock)).unwrap();
        block_on(fetch_collateral_price(&session, &FixedFeed(Ok(dec!(0))), &clock)).unwrap();
        assert_eq!(cached_price(&session), None);
        assert_eq!(session.read(|s| s.last_price_timestamp).unwrap(), None);
    }

    #[test]
    fn requires_session() {
        let session = Session::new();
        let clock = ManualClock::new(0);
        assert_eq!(
            block_on(fetch_collateral_price(&session, &FixedFeed(Ok(dec!(1))), &clock)),
            Err(EngineError::NotConnected)
        );
    }
}
