// models/transaction.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// What a payment is for. Closed set: the reconciler dispatches the ledger
/// update on this variant, so a new purpose is a new variant plus one dispatch
/// arm, never a loose string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPurpose {
    Contribution,
    LoanRepayment,
    Penalty,
    RegistrationFee,
}

impl TransactionPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPurpose::Contribution => "contribution",
            TransactionPurpose::LoanRepayment => "loan_repayment",
            TransactionPurpose::Penalty => "penalty",
            TransactionPurpose::RegistrationFee => "registration_fee",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

/// Gateway-facing provisional record. Inserted as pending once daraja accepts
/// the STK push, finalized exactly once by the reconciler, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub member_id: String,
    pub chama_id: String,
    pub purpose: TransactionPurpose,

    pub amount: i64,
    pub phone: String,

    // Daraja correlation identifiers
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    /// Internal reference sent as the STK AccountReference (max 12 chars).
    pub reference: String,

    pub status: TransactionStatus,
    pub mpesa_receipt: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

// Client-facing summary (status endpoint, transaction listing).
#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub reference: String,
    pub checkout_request_id: String,
    pub purpose: TransactionPurpose,
    pub amount: i64,
    pub status: TransactionStatus,
    pub mpesa_receipt: Option<String>,
    pub result_desc: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionView {
    fn from(tx: Transaction) -> Self {
        TransactionView {
            reference: tx.reference,
            checkout_request_id: tx.checkout_request_id,
            purpose: tx.purpose,
            amount: tx.amount,
            status: tx.status,
            mpesa_receipt: tx.mpesa_receipt,
            result_desc: tx.result_desc,
            created_at: tx.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn purpose_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransactionPurpose::LoanRepayment).unwrap(),
            "\"loan_repayment\""
        );
        assert_eq!(TransactionPurpose::RegistrationFee.as_str(), "registration_fee");
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Success.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Cancelled.is_terminal());
    }
}
