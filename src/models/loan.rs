// models/loan.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Pending,
    Approved,
    Rejected,
    Active,
    Completed,
    Defaulted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub member_id: String,
    pub chama_id: String,

    pub amount: i64,
    pub interest_rate: f64,
    pub total_payable: i64,
    pub outstanding_balance: i64,

    pub purpose: String,
    pub status: LoanStatus,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub deadline: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Repayment record, created only once the gateway confirms the payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanRepayment {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub loan_id: ObjectId,
    pub member_id: String,
    pub amount: i64,
    pub mpesa_receipt: Option<String>,
    pub reference: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub repaid_at: DateTime<Utc>,
}
