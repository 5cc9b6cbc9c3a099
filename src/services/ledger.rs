// services/ledger.rs
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::{Collection, Database};

use crate::errors::Result;
use crate::models::contribution::Contribution;
use crate::models::loan::{Loan, LoanRepayment};
use crate::models::penalty::Penalty;

/// The narrow view of the group's financial records that the reconciler
/// depends on. Each settle touches at most one entry, at most once.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn find_pending_contribution(
        &self,
        member_id: &str,
        chama_id: &str,
        reference: &str,
    ) -> Result<Option<Contribution>>;

    /// Degraded fallback when the reference did not survive the round trip:
    /// most recent pending contribution for the member/chama with this
    /// amount. Ambiguous if two identical amounts are in flight; every use is
    /// logged by the caller.
    async fn find_pending_contribution_by_amount(
        &self,
        member_id: &str,
        chama_id: &str,
        amount: i64,
    ) -> Result<Option<Contribution>>;

    async fn mark_contribution_settled(&self, id: &ObjectId, receipt: Option<&str>) -> Result<bool>;

    async fn find_active_loan(&self, member_id: &str, chama_id: &str) -> Result<Option<Loan>>;

    /// Record a confirmed repayment and reduce the loan's outstanding
    /// balance; a balance at or below zero completes the loan. Returns the
    /// new outstanding balance.
    async fn record_repayment(
        &self,
        loan: &Loan,
        amount: i64,
        receipt: Option<&str>,
        reference: &str,
    ) -> Result<i64>;

    async fn find_unpaid_penalty(
        &self,
        member_id: &str,
        chama_id: &str,
        amount: i64,
    ) -> Result<Option<Penalty>>;

    async fn mark_penalty_paid(&self, id: &ObjectId, receipt: Option<&str>) -> Result<bool>;
}

#[derive(Clone)]
pub struct MongoLedger {
    contributions: Collection<Contribution>,
    loans: Collection<Loan>,
    repayments: Collection<LoanRepayment>,
    penalties: Collection<Penalty>,
}

impl MongoLedger {
    pub fn new(db: &Database) -> Self {
        MongoLedger {
            contributions: db.collection("contributions"),
            loans: db.collection("loans"),
            repayments: db.collection("loan_repayments"),
            penalties: db.collection("penalties"),
        }
    }

    // Used by the initiation handlers, not by the reconciler.

    pub async fn create_pending_contribution(&self, mut contribution: Contribution) -> Result<Contribution> {
        let result = self.contributions.insert_one(&contribution).await?;
        contribution.id = result.inserted_id.as_object_id();
        Ok(contribution)
    }

    pub async fn find_loan_for_member(&self, loan_id: &ObjectId, member_id: &str) -> Result<Option<Loan>> {
        let filter = doc! { "_id": loan_id, "member_id": member_id };
        Ok(self.loans.find_one(filter).await?)
    }

    pub async fn find_penalty_for_member(
        &self,
        penalty_id: &ObjectId,
        member_id: &str,
    ) -> Result<Option<Penalty>> {
        let filter = doc! { "_id": penalty_id, "member_id": member_id };
        Ok(self.penalties.find_one(filter).await?)
    }
}

#[async_trait]
impl Ledger for MongoLedger {
    async fn find_pending_contribution(
        &self,
        member_id: &str,
        chama_id: &str,
        reference: &str,
    ) -> Result<Option<Contribution>> {
        let filter = doc! {
            "member_id": member_id,
            "chama_id": chama_id,
            "reference": reference,
            "status": "pending",
        };
        Ok(self.contributions.find_one(filter).await?)
    }

    async fn find_pending_contribution_by_amount(
        &self,
        member_id: &str,
        chama_id: &str,
        amount: i64,
    ) -> Result<Option<Contribution>> {
        let filter = doc! {
            "member_id": member_id,
            "chama_id": chama_id,
            "amount": amount,
            "status": "pending",
        };
        Ok(self
            .contributions
            .find_one(filter)
            .sort(doc! { "created_at": -1 })
            .await?)
    }

    async fn mark_contribution_settled(&self, id: &ObjectId, receipt: Option<&str>) -> Result<bool> {
        let filter = doc! { "_id": id, "status": "pending" };
        let mut set = doc! {
            "status": "success",
            "updated_at": mongodb::bson::DateTime::from_chrono(Utc::now()),
        };
        if let Some(receipt) = receipt {
            set.insert("mpesa_receipt", receipt);
        }
        let result = self.contributions.update_one(filter, doc! { "$set": set }).await?;
        Ok(result.modified_count == 1)
    }

    async fn find_active_loan(&self, member_id: &str, chama_id: &str) -> Result<Option<Loan>> {
        let filter = doc! {
            "member_id": member_id,
            "chama_id": chama_id,
            "status": "active",
        };
        Ok(self.loans.find_one(filter).await?)
    }

    async fn record_repayment(
        &self,
        loan: &Loan,
        amount: i64,
        receipt: Option<&str>,
        reference: &str,
    ) -> Result<i64> {
        let loan_id = loan.id.ok_or(crate::errors::AppError::NotFound)?;

        let repayment = LoanRepayment {
            id: None,
            loan_id,
            member_id: loan.member_id.clone(),
            amount,
            mpesa_receipt: receipt.map(str::to_string),
            reference: Some(reference.to_string()),
            repaid_at: Utc::now(),
        };
        self.repayments.insert_one(&repayment).await?;

        let updated = self
            .loans
            .find_one_and_update(
                doc! { "_id": loan_id },
                doc! { "$inc": { "outstanding_balance": -amount } },
            )
            .return_document(mongodb::options::ReturnDocument::After)
            .await?;

        let balance = updated.map(|l| l.outstanding_balance).unwrap_or(0);
        if balance <= 0 {
            self.loans
                .update_one(
                    doc! { "_id": loan_id, "status": "active" },
                    doc! { "$set": { "status": "completed" } },
                )
                .await?;
        }
        Ok(balance)
    }

    async fn find_unpaid_penalty(
        &self,
        member_id: &str,
        chama_id: &str,
        amount: i64,
    ) -> Result<Option<Penalty>> {
        let filter = doc! {
            "member_id": member_id,
            "chama_id": chama_id,
            "amount": amount,
            "paid": false,
        };
        Ok(self.penalties.find_one(filter).await?)
    }

    async fn mark_penalty_paid(&self, id: &ObjectId, receipt: Option<&str>) -> Result<bool> {
        let filter = doc! { "_id": id, "paid": false };
        let mut set = doc! { "paid": true };
        if let Some(receipt) = receipt {
            set.insert("mpesa_receipt", receipt);
        }
        let result = self.penalties.update_one(filter, doc! { "$set": set }).await?;
        Ok(result.modified_count == 1)
    }
}
