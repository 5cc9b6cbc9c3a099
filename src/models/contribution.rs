// models/contribution.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionStatus {
    Pending,
    Success,
    Failed,
}

/// A member's contribution (or registration fee) towards a chama. Created as
/// pending by the initiation handler and settled by the reconciler when the
/// matching transaction succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub member_id: String,
    pub chama_id: String,
    pub cycle_id: Option<String>,

    pub amount: i64,
    pub contribution_type: String, // "contribution" | "registration_fee"
    pub status: ContributionStatus,
    pub phone: String,

    pub mpesa_receipt: Option<String>,
    /// Correlates with Transaction.reference when created by the same flow.
    pub reference: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}
