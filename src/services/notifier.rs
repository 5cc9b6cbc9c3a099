// services/notifier.rs
use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Collection, Database};
use serde::Deserialize;

use crate::errors::Result;
use crate::models::notification::Notification;

/// Fire-and-forget outbound messages. Callers log failures and move on; a
/// notification must never block or fail a reconciliation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        member_ids: &[String],
        chama_id: &str,
        title: &str,
        message: &str,
        kind: &str,
        related_reference: Option<&str>,
    ) -> Result<()>;

    /// Notify the chama's treasurers (contribution outcomes are their business).
    async fn notify_treasurers(
        &self,
        chama_id: &str,
        title: &str,
        message: &str,
        related_reference: Option<&str>,
    ) -> Result<()>;
}

// Only the fields needed to resolve recipients; memberships are owned by the
// group-management side of the system.
#[derive(Debug, Deserialize)]
struct MembershipRecipient {
    member_id: String,
}

#[derive(Clone)]
pub struct MongoNotifier {
    notifications: Collection<Notification>,
    memberships: Collection<MembershipRecipient>,
}

impl MongoNotifier {
    pub fn new(db: &Database) -> Self {
        MongoNotifier {
            notifications: db.collection("notifications"),
            memberships: db.collection("memberships"),
        }
    }
}

#[async_trait]
impl Notifier for MongoNotifier {
    async fn notify(
        &self,
        member_ids: &[String],
        chama_id: &str,
        title: &str,
        message: &str,
        kind: &str,
        related_reference: Option<&str>,
    ) -> Result<()> {
        if member_ids.is_empty() {
            return Ok(());
        }
        let records: Vec<Notification> = member_ids
            .iter()
            .map(|member_id| Notification {
                id: None,
                member_id: member_id.clone(),
                chama_id: chama_id.to_string(),
                title: title.to_string(),
                message: message.to_string(),
                kind: kind.to_string(),
                related_reference: related_reference.map(str::to_string),
                created_at: Utc::now(),
            })
            .collect();
        self.notifications.insert_many(records).await?;
        Ok(())
    }

    async fn notify_treasurers(
        &self,
        chama_id: &str,
        title: &str,
        message: &str,
        related_reference: Option<&str>,
    ) -> Result<()> {
        let filter = doc! {
            "chama_id": chama_id,
            "role": "treasurer",
            "status": "active",
        };
        let cursor = self.memberships.find(filter).await?;
        let treasurers: Vec<MembershipRecipient> = cursor.try_collect().await?;
        let member_ids: Vec<String> = treasurers.into_iter().map(|m| m.member_id).collect();
        self.notify(&member_ids, chama_id, title, message, "payment", related_reference)
            .await
    }
}
