use ic_canister_log::log;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::logs::DEBUG;
use crate::SpenderRole;

/// Decides whether spending `amount` through `spender` needs an allowance
/// raise first. A missing allowance counts as zero. An amount that does not
/// parse (or is negative) forces approval; an unset amount never does.
///
/// This is the check for raw input, e.g. to flag an approval step while the
/// user is still typing. `PositionEngine::submit` parses the amount once at
/// validation and then calls [`allowance_below`] on the parsed value, which
/// gives the same answer for every parseable amount.
pub fn needs_approval(
    spender: SpenderRole,
    amount: Option<&str>,
    current_allowance: Option<Decimal>,
) -> bool {
    let raw = match amount.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return false,
    };

    match Decimal::from_str(raw) {
        Ok(amount) if amount >= Decimal::ZERO => allowance_below(amount, current_allowance),
        _ => {
            log!(
                DEBUG,
                "[needs_approval] unparseable amount '{}' for {}, forcing approval",
                raw,
                spender
            );
            true
        }
    }
}

/// Same check on an already parsed amount.
pub fn allowance_below(amount: Decimal, current_allowance: Option<Decimal>) -> bool {
    current_allowance.unwrap_or(Decimal::ZERO) < amount
}
