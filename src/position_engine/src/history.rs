use async_trait::async_trait;
use ic_canister_log::log;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::CallError;
use crate::logs::INFO;
use crate::EngineError;

/// Envelope returned by the history API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse<T> {
    pub success: bool,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> HistoryResponse<T> {
    pub fn ok(data: Vec<T>) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            message: Some(message.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRecord {
    pub id: String,
    pub amount: Decimal,
    pub token_symbol: String,
    pub tx_hash: Option<String>,
    /// Seconds since the Unix epoch, as reported by the API.
    pub timestamp: u64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanRecordKind {
    Borrow,
    Repay,
    Stake,
    Unstake,
    Claim,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: LoanRecordKind,
    pub amount: Decimal,
    pub token_symbol: String,
    pub tx_hash: Option<String>,
    pub timestamp: u64,
}

/// Remote source of past records. Calls carry the session token.
#[async_trait(?Send)]
pub trait HistorySource {
    async fn get_deposit_history(
        &self,
        token: &str,
    ) -> Result<HistoryResponse<DepositRecord>, CallError>;

    async fn get_loan_history(&self, token: &str) -> Result<HistoryResponse<LoanRecord>, CallError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySection {
    Deposits,
    Loans,
}

/// Merged history. Lists keep the order the source returned them in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistoryView {
    pub deposits: Vec<DepositRecord>,
    pub loans: Vec<LoanRecord>,
    /// Set when one source failed and its list is shown empty.
    pub failed_section: Option<HistorySection>,
}

fn unwrap_response<T>(result: Result<HistoryResponse<T>, CallError>) -> Result<Vec<T>, String> {
    match result {
        Ok(response) if response.success => Ok(response.data),
        Ok(response) => Err(response
            .message
            .unwrap_or_else(|| "request was not successful".to_string())),
        Err(error) => Err(error.to_string()),
    }
}

/// Combines both fetch results, tolerating one failure.
pub fn aggregate(
    deposits: Result<Vec<DepositRecord>, String>,
    loans: Result<Vec<LoanRecord>, String>,
) -> Result<HistoryView, EngineError> {
    match (deposits, loans) {
        (Ok(deposits), Ok(loans)) => Ok(HistoryView {
            deposits,
            loans,
            failed_section: None,
        }),
        (Err(reason), Ok(loans)) => {
            log!(INFO, "[aggregate] deposit history unavailable: {}", reason);
            Ok(HistoryView {
                deposits: Vec::new(),
                loans,
                failed_section: Some(HistorySection::Deposits),
            })
        }
        (Ok(deposits), Err(reason)) => {
            log!(INFO, "[aggregate] loan history unavailable: {}", reason);
            Ok(HistoryView {
                deposits,
                loans: Vec::new(),
                failed_section: Some(HistorySection::Loans),
            })
        }
        (Err(deposits), Err(loans)) => Err(EngineError::HistoryUnavailable { deposits, loans }),
    }
}

/// Issues both fetches concurrently and merges them.
pub async fn fetch_history(
    source: &dyn HistorySource,
    token: &str,
) -> Result<HistoryView, EngineError> {
    let (deposits, loans) = futures::join!(
        source.get_deposit_history(token),
        source.get_loan_history(token)
    );
    aggregate(unwrap_response(deposits), unwrap_response(loans))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Reason;
    use rust_decimal_macros::dec;

    fn loan(id: &str) -> LoanRecord {
        LoanRecord {
            id: id.to_string(),
            kind: LoanRecordKind::Borrow,
            amount: dec!(100),
            token_symbol: "USDT".to_string(),
            tx_hash: None,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn keeps_source_order() {
        let view = aggregate(Ok(vec![]), Ok(vec![loan("b"), loan("a")])).unwrap();
        let ids: Vec<_> = view.loans.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(view.failed_section, None);
    }

    #[test]
    fn one_failure_yields_partial_view() {
        let view = aggregate(Err("boom".to_string()), Ok(vec![loan("a")])).unwrap();
        assert!(view.deposits.is_empty());
        assert_eq!(view.loans.len(), 1);
        assert_eq!(view.failed_section, Some(HistorySection::Deposits));
    }

    #[test]
    fn both_failures_are_one_error() {
        assert_eq!(
            aggregate(Err("a".to_string()), Err("b".to_string())),
            Err(EngineError::HistoryUnavailable {
                deposits: "a".to_string(),
                loans: "b".to_string()
            })
        );
    }

    #[test]
    fn unsuccessful_envelope_is_a_failure() {
        let failed: Result<HistoryResponse<LoanRecord>, CallError> =
            Ok(HistoryResponse::failed("unauthorized"));
        assert_eq!(unwrap_response(failed), Err("unauthorized".to_string()));

        let unreachable: Result<HistoryResponse<LoanRecord>, CallError> = Err(CallError::new(
            "get_loan_history",
            Reason::Unavailable("offline".to_string()),
        ));
        assert!(unwrap_response(unreachable).is_err());
    }

    #[test]
    fn parses_api_payload() {
        let response: HistoryResponse<LoanRecord> = serde_json::from_str(
            r#"{
                "success": true,
                "data": [
                    { "id": "1", "type": "repay", "amount": "12.5", "tokenSymbol": "USDT",
                      "txHash": "0xabc", "timestamp": 1700000000 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(response.data[0].kind, LoanRecordKind::Repay);
        assert_eq!(response.data[0].amount, dec!(12.5));
        assert_eq!(response.data[0].tx_hash.as_deref(), Some("0xabc"));
    }
}
