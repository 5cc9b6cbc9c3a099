// models/notification.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// In-app notification record. Delivery beyond persistence (SMS, push) is
/// handled elsewhere; the reconciler only writes these fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub member_id: String,
    pub chama_id: String,
    pub title: String,
    pub message: String,
    pub kind: String, // "payment" | "loan" | "penalty"
    pub related_reference: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}
