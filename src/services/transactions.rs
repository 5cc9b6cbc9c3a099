// services/transactions.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};

use crate::errors::Result;
use crate::models::transaction::{Transaction, TransactionStatus};

/// Terminal state applied to a pending transaction. Metadata from the gateway
/// wins; missing fields keep the values recorded at initiation.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: TransactionStatus,
    pub result_code: i64,
    pub result_desc: String,
    pub amount: Option<i64>,
    pub mpesa_receipt: Option<String>,
    pub phone: Option<String>,
}

/// Storage seam for gateway transactions. The reconciler only ever finalizes
/// through `finalize_if_pending`, a single conditional update, so two
/// concurrent finalizers (callback racing a status query) cannot both win.
#[async_trait]
pub trait TransactionRepo: Send + Sync {
    async fn insert(&self, tx: Transaction) -> Result<Transaction>;

    async fn find_by_checkout(
        &self,
        checkout_request_id: &str,
        merchant_request_id: Option<&str>,
    ) -> Result<Option<Transaction>>;

    async fn find_pending_by_reference(&self, reference: &str) -> Result<Option<Transaction>>;

    /// Atomically move a pending transaction to a terminal state. Returns the
    /// updated record, or `None` if the transaction was no longer pending.
    /// A `None` means another finalizer got there first; the caller must not
    /// write again.
    async fn finalize_if_pending(
        &self,
        id: &ObjectId,
        settlement: &Settlement,
    ) -> Result<Option<Transaction>>;

    async fn find_stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Transaction>>;

    async fn list_for_member(&self, member_id: &str) -> Result<Vec<Transaction>>;
}

#[derive(Clone)]
pub struct MongoTransactionRepo {
    collection: Collection<Transaction>,
}

impl MongoTransactionRepo {
    pub fn new(db: &Database) -> Self {
        MongoTransactionRepo {
            collection: db.collection("transactions"),
        }
    }
}

#[async_trait]
impl TransactionRepo for MongoTransactionRepo {
    async fn insert(&self, mut tx: Transaction) -> Result<Transaction> {
        let result = self.collection.insert_one(&tx).await?;
        tx.id = result.inserted_id.as_object_id();
        Ok(tx)
    }

    async fn find_by_checkout(
        &self,
        checkout_request_id: &str,
        merchant_request_id: Option<&str>,
    ) -> Result<Option<Transaction>> {
        let mut filter = doc! { "checkout_request_id": checkout_request_id };
        if let Some(merchant_id) = merchant_request_id {
            filter.insert("merchant_request_id", merchant_id);
        }
        Ok(self.collection.find_one(filter).await?)
    }

    async fn find_pending_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        let filter = doc! {
            "reference": reference,
            "status": TransactionStatus::Pending.as_str(),
        };
        Ok(self.collection.find_one(filter).await?)
    }

    async fn finalize_if_pending(
        &self,
        id: &ObjectId,
        settlement: &Settlement,
    ) -> Result<Option<Transaction>> {
        let filter = doc! {
            "_id": id,
            "status": TransactionStatus::Pending.as_str(),
        };

        let mut set = doc! {
            "status": settlement.status.as_str(),
            "result_code": settlement.result_code,
            "result_desc": &settlement.result_desc,
            "updated_at": mongodb::bson::DateTime::from_chrono(Utc::now()),
        };
        if let Some(amount) = settlement.amount {
            set.insert("amount", amount);
        }
        if let Some(receipt) = &settlement.mpesa_receipt {
            set.insert("mpesa_receipt", receipt);
        }
        if let Some(phone) = &settlement.phone {
            set.insert("phone", phone);
        }

        let updated = self
            .collection
            .find_one_and_update(filter, doc! { "$set": set })
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated)
    }

    async fn find_stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let filter = doc! {
            "status": TransactionStatus::Pending.as_str(),
            "created_at": { "$lt": mongodb::bson::DateTime::from_chrono(older_than) },
        };
        let cursor = self.collection.find(filter).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_for_member(&self, member_id: &str) -> Result<Vec<Transaction>> {
        let filter: Document = doc! { "member_id": member_id };
        let cursor = self
            .collection
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }
}
