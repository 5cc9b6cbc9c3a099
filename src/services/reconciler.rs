// services/reconciler.rs
//
// The single reconciliation path. Callback delivery and active status queries
// both funnel through `PaymentReconciler::reconcile`, so "push" and "pull"
// outcomes can never diverge in behaviour.
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::models::transaction::{Transaction, TransactionPurpose, TransactionStatus};
use crate::services::ledger::Ledger;
use crate::services::notifier::Notifier;
use crate::services::transactions::{Settlement, TransactionRepo};

/// A gateway-reported outcome, normalized from either the webhook callback or
/// a status-query response.
#[derive(Debug, Clone)]
pub struct GatewayOutcome {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub result_code: i64,
    pub result_desc: String,
    pub amount: Option<i64>,
    pub mpesa_receipt: Option<String>,
    pub phone: Option<String>,
    pub account_reference: Option<String>,
}

impl GatewayOutcome {
    /// Normalize a status-query response. Query responses carry no metadata
    /// items, so amount/receipt/phone fall back to the stored transaction
    /// values at settlement time.
    pub fn from_query(query: &crate::services::daraja::StkQueryResponse) -> Result<Self> {
        let result_code = query.result_code.parse::<i64>().map_err(|_| {
            crate::errors::AppError::external_api(format!(
                "unparseable ResultCode in query response: {}",
                query.result_code
            ))
        })?;
        Ok(GatewayOutcome {
            checkout_request_id: query.checkout_request_id.clone(),
            merchant_request_id: Some(query.merchant_request_id.clone()),
            result_code,
            result_desc: query.result_desc.clone(),
            amount: None,
            mpesa_receipt: None,
            phone: None,
            account_reference: None,
        })
    }
}

/// Daraja result codes with a non-failure meaning. Anything not listed here
/// settles as failed; new codes are new rows, not new control flow.
const RESULT_CODE_TABLE: &[(i64, TransactionStatus)] = &[
    (0, TransactionStatus::Success),
    (1032, TransactionStatus::Cancelled), // request cancelled by user
];

pub fn status_for_result_code(code: i64) -> TransactionStatus {
    RESULT_CODE_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, status)| *status)
        .unwrap_or(TransactionStatus::Failed)
}

#[derive(Debug)]
pub struct MatchedTransaction {
    pub transaction: Transaction,
    /// Set when the transaction is already terminal; the reconciler must then
    /// perform no further writes. Duplicate delivery is expected gateway
    /// behaviour, not an error.
    pub already_finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEffect {
    /// Non-success outcomes never touch the ledger.
    NotApplicable,
    Applied,
    /// Settled transaction with no matching ledger entry; flagged for manual
    /// review, never fabricated.
    Gap,
    /// Ledger write failed after the transaction settled; independently
    /// retryable, the transaction state stands.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    /// No transaction matches the outcome. Logged and dropped.
    NotFound,
    /// The transaction was already terminal (duplicate or lost race).
    AlreadyFinalized,
    Settled {
        status: TransactionStatus,
        ledger: LedgerEffect,
    },
}

pub struct PaymentReconciler {
    transactions: Arc<dyn TransactionRepo>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
}

impl PaymentReconciler {
    pub fn new(
        transactions: Arc<dyn TransactionRepo>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        PaymentReconciler {
            transactions,
            ledger,
            notifier,
        }
    }

    /// Locate the one transaction an outcome describes. Primary key is the
    /// checkout id (plus merchant id when the payload carries it); the
    /// internal reference is the fallback for payloads that echo it back.
    pub async fn match_outcome(&self, outcome: &GatewayOutcome) -> Result<Option<MatchedTransaction>> {
        let primary = self
            .transactions
            .find_by_checkout(
                &outcome.checkout_request_id,
                outcome.merchant_request_id.as_deref(),
            )
            .await?;

        let transaction = match primary {
            Some(tx) => Some(tx),
            None => match &outcome.account_reference {
                Some(reference) => self.transactions.find_pending_by_reference(reference).await?,
                None => None,
            },
        };

        Ok(transaction.map(|tx| {
            let already_finalized = tx.status.is_terminal();
            MatchedTransaction {
                transaction: tx,
                already_finalized,
            }
        }))
    }

    /// Apply a gateway outcome exactly once. The transaction finalize is the
    /// durability boundary: once that conditional update commits, the outcome
    /// is settled regardless of how the ledger or notifier calls go.
    pub async fn reconcile(&self, outcome: GatewayOutcome) -> Result<ReconcileResult> {
        let matched = match self.match_outcome(&outcome).await? {
            Some(matched) => matched,
            None => {
                warn!(
                    "Unmatched gateway outcome for checkout {} (code {}), dropping",
                    outcome.checkout_request_id, outcome.result_code
                );
                return Ok(ReconcileResult::NotFound);
            }
        };

        if matched.already_finalized {
            info!(
                "Duplicate outcome for settled checkout {}, ignoring",
                outcome.checkout_request_id
            );
            return Ok(ReconcileResult::AlreadyFinalized);
        }

        let tx = matched.transaction;
        let status = status_for_result_code(outcome.result_code);
        let settlement = Settlement {
            status,
            result_code: outcome.result_code,
            result_desc: outcome.result_desc.clone(),
            amount: outcome.amount,
            mpesa_receipt: outcome.mpesa_receipt.clone(),
            phone: outcome.phone.clone(),
        };

        let tx_id = tx.id.ok_or(crate::errors::AppError::NotFound)?;
        let settled = match self.transactions.finalize_if_pending(&tx_id, &settlement).await? {
            Some(settled) => settled,
            None => {
                // Lost the race against a concurrent finalizer.
                info!(
                    "Checkout {} finalized concurrently, ignoring",
                    outcome.checkout_request_id
                );
                return Ok(ReconcileResult::AlreadyFinalized);
            }
        };

        info!(
            "Transaction {} settled as {} (code {})",
            settled.reference,
            status.as_str(),
            outcome.result_code
        );

        let ledger = if status == TransactionStatus::Success {
            match self.apply_ledger_effect(&settled).await {
                Ok(effect) => effect,
                Err(e) => {
                    error!(
                        "Ledger update failed for settled transaction {}: {}",
                        settled.reference, e
                    );
                    LedgerEffect::Failed
                }
            }
        } else {
            LedgerEffect::NotApplicable
        };

        self.notify_outcome(&settled, &ledger).await;

        Ok(ReconcileResult::Settled { status, ledger })
    }

    /// Exactly one ledger updater runs, picked by the closed purpose variant.
    async fn apply_ledger_effect(&self, tx: &Transaction) -> Result<LedgerEffect> {
        match tx.purpose {
            TransactionPurpose::Contribution | TransactionPurpose::RegistrationFee => {
                self.settle_contribution(tx).await
            }
            TransactionPurpose::LoanRepayment => self.settle_loan_repayment(tx).await,
            TransactionPurpose::Penalty => self.settle_penalty(tx).await,
        }
    }

    async fn settle_contribution(&self, tx: &Transaction) -> Result<LedgerEffect> {
        let mut contribution = self
            .ledger
            .find_pending_contribution(&tx.member_id, &tx.chama_id, &tx.reference)
            .await?;

        if contribution.is_none() {
            // Degraded path: the reference did not survive the round trip.
            // Ambiguous when two identical amounts are in flight, hence the log.
            contribution = self
                .ledger
                .find_pending_contribution_by_amount(&tx.member_id, &tx.chama_id, tx.amount)
                .await?;
            if contribution.is_some() {
                warn!(
                    "Contribution for {} matched by amount fallback (reference {})",
                    tx.member_id, tx.reference
                );
            }
        }

        match contribution.and_then(|c| c.id) {
            Some(id) => {
                let updated = self
                    .ledger
                    .mark_contribution_settled(&id, tx.mpesa_receipt.as_deref())
                    .await?;
                if updated {
                    Ok(LedgerEffect::Applied)
                } else {
                    warn!(
                        "Contribution {} already settled, transaction {} flagged for review",
                        id, tx.reference
                    );
                    Ok(LedgerEffect::Gap)
                }
            }
            None => {
                warn!(
                    "No pending contribution matches settled transaction {} ({} KSh {})",
                    tx.reference, tx.member_id, tx.amount
                );
                Ok(LedgerEffect::Gap)
            }
        }
    }

    async fn settle_loan_repayment(&self, tx: &Transaction) -> Result<LedgerEffect> {
        match self.ledger.find_active_loan(&tx.member_id, &tx.chama_id).await? {
            Some(loan) => {
                let balance = self
                    .ledger
                    .record_repayment(&loan, tx.amount, tx.mpesa_receipt.as_deref(), &tx.reference)
                    .await?;
                info!(
                    "Repayment of {} recorded for {}, outstanding balance {}",
                    tx.amount, tx.member_id, balance
                );
                Ok(LedgerEffect::Applied)
            }
            None => {
                warn!(
                    "No active loan for {} in {} despite settled repayment {}",
                    tx.member_id, tx.chama_id, tx.reference
                );
                Ok(LedgerEffect::Gap)
            }
        }
    }

    async fn settle_penalty(&self, tx: &Transaction) -> Result<LedgerEffect> {
        let penalty = self
            .ledger
            .find_unpaid_penalty(&tx.member_id, &tx.chama_id, tx.amount)
            .await?;
        match penalty.and_then(|p| p.id) {
            Some(id) => {
                let updated = self
                    .ledger
                    .mark_penalty_paid(&id, tx.mpesa_receipt.as_deref())
                    .await?;
                if updated {
                    Ok(LedgerEffect::Applied)
                } else {
                    Ok(LedgerEffect::Gap)
                }
            }
            None => {
                warn!(
                    "No unpaid penalty of {} for {} in {}, transaction {} flagged for review",
                    tx.amount, tx.member_id, tx.chama_id, tx.reference
                );
                Ok(LedgerEffect::Gap)
            }
        }
    }

    /// Outcome notifications are best-effort; failures are logged, never
    /// propagated back into the settlement.
    async fn notify_outcome(&self, tx: &Transaction, ledger: &LedgerEffect) {
        let (title, message) = match tx.status {
            TransactionStatus::Success => (
                "Payment Confirmed",
                format!(
                    "Your {} payment of KSh {} was received{}.",
                    tx.purpose.as_str().replace('_', " "),
                    tx.amount,
                    tx.mpesa_receipt
                        .as_deref()
                        .map(|r| format!(" (receipt {})", r))
                        .unwrap_or_default()
                ),
            ),
            TransactionStatus::Cancelled => (
                "Payment Cancelled",
                format!(
                    "Your {} payment of KSh {} was cancelled on the phone.",
                    tx.purpose.as_str().replace('_', " "),
                    tx.amount
                ),
            ),
            _ => (
                "Payment Failed",
                format!(
                    "Your {} payment of KSh {} failed: {}",
                    tx.purpose.as_str().replace('_', " "),
                    tx.amount,
                    tx.result_desc.as_deref().unwrap_or("unknown error")
                ),
            ),
        };

        if let Err(e) = self
            .notifier
            .notify(
                std::slice::from_ref(&tx.member_id),
                &tx.chama_id,
                title,
                &message,
                "payment",
                Some(&tx.reference),
            )
            .await
        {
            warn!("Failed to notify {}: {}", tx.member_id, e);
        }

        let is_contribution = matches!(
            tx.purpose,
            TransactionPurpose::Contribution | TransactionPurpose::RegistrationFee
        );
        if is_contribution && tx.status == TransactionStatus::Success {
            let note = if *ledger == LedgerEffect::Applied {
                format!("{} contributed KSh {}.", tx.member_id, tx.amount)
            } else {
                format!(
                    "{} paid KSh {} but no matching contribution was found; manual review needed.",
                    tx.member_id, tx.amount
                )
            };
            if let Err(e) = self
                .notifier
                .notify_treasurers(&tx.chama_id, "Contribution Received", &note, Some(&tx.reference))
                .await
            {
                warn!("Failed to notify treasurers of {}: {}", tx.chama_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::models::contribution::{Contribution, ContributionStatus};
    use crate::models::loan::{Loan, LoanStatus};
    use crate::models::penalty::Penalty;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mongodb::bson::oid::ObjectId;
    use std::sync::Mutex;

    struct FakeTransactionRepo {
        transactions: Mutex<Vec<Transaction>>,
    }

    impl FakeTransactionRepo {
        fn with(transactions: Vec<Transaction>) -> Arc<Self> {
            Arc::new(FakeTransactionRepo {
                transactions: Mutex::new(transactions),
            })
        }

        fn get(&self, reference: &str) -> Transaction {
            self.transactions
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.reference == reference)
                .cloned()
                .unwrap()
        }
    }

    #[async_trait]
    impl TransactionRepo for FakeTransactionRepo {
        async fn insert(&self, tx: Transaction) -> crate::errors::Result<Transaction> {
            self.transactions.lock().unwrap().push(tx.clone());
            Ok(tx)
        }

        async fn find_by_checkout(
            &self,
            checkout_request_id: &str,
            merchant_request_id: Option<&str>,
        ) -> crate::errors::Result<Option<Transaction>> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .iter()
                .find(|t| {
                    t.checkout_request_id == checkout_request_id
                        && merchant_request_id
                            .map(|m| t.merchant_request_id == m)
                            .unwrap_or(true)
                })
                .cloned())
        }

        async fn find_pending_by_reference(
            &self,
            reference: &str,
        ) -> crate::errors::Result<Option<Transaction>> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.reference == reference && t.status == TransactionStatus::Pending)
                .cloned())
        }

        async fn finalize_if_pending(
            &self,
            id: &ObjectId,
            settlement: &Settlement,
        ) -> crate::errors::Result<Option<Transaction>> {
            // Single lock models the atomic conditional update.
            let mut transactions = self.transactions.lock().unwrap();
            let tx = transactions
                .iter_mut()
                .find(|t| t.id.as_ref() == Some(id) && t.status == TransactionStatus::Pending);
            Ok(tx.map(|tx| {
                tx.status = settlement.status;
                tx.result_code = Some(settlement.result_code);
                tx.result_desc = Some(settlement.result_desc.clone());
                if let Some(amount) = settlement.amount {
                    tx.amount = amount;
                }
                if let Some(receipt) = &settlement.mpesa_receipt {
                    tx.mpesa_receipt = Some(receipt.clone());
                }
                if let Some(phone) = &settlement.phone {
                    tx.phone = phone.clone();
                }
                tx.updated_at = Utc::now();
                tx.clone()
            }))
        }

        async fn find_stuck_pending(
            &self,
            older_than: DateTime<Utc>,
        ) -> crate::errors::Result<Vec<Transaction>> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.status == TransactionStatus::Pending && t.created_at < older_than)
                .cloned()
                .collect())
        }

        async fn list_for_member(&self, member_id: &str) -> crate::errors::Result<Vec<Transaction>> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.member_id == member_id)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        contributions: Mutex<Vec<Contribution>>,
        loans: Mutex<Vec<Loan>>,
        penalties: Mutex<Vec<Penalty>>,
        repayments: Mutex<Vec<(ObjectId, i64)>>,
        settle_calls: Mutex<u32>,
    }

    impl FakeLedger {
        fn with_contribution(contribution: Contribution) -> Arc<Self> {
            let ledger = FakeLedger::default();
            ledger.contributions.lock().unwrap().push(contribution);
            Arc::new(ledger)
        }
    }

    #[async_trait]
    impl Ledger for FakeLedger {
        async fn find_pending_contribution(
            &self,
            member_id: &str,
            chama_id: &str,
            reference: &str,
        ) -> crate::errors::Result<Option<Contribution>> {
            Ok(self
                .contributions
                .lock()
                .unwrap()
                .iter()
                .find(|c| {
                    c.member_id == member_id
                        && c.chama_id == chama_id
                        && c.reference.as_deref() == Some(reference)
                        && c.status == ContributionStatus::Pending
                })
                .cloned())
        }

        async fn find_pending_contribution_by_amount(
            &self,
            member_id: &str,
            chama_id: &str,
            amount: i64,
        ) -> crate::errors::Result<Option<Contribution>> {
            let contributions = self.contributions.lock().unwrap();
            let mut candidates: Vec<&Contribution> = contributions
                .iter()
                .filter(|c| {
                    c.member_id == member_id
                        && c.chama_id == chama_id
                        && c.amount == amount
                        && c.status == ContributionStatus::Pending
                })
                .collect();
            candidates.sort_by_key(|c| std::cmp::Reverse(c.created_at));
            Ok(candidates.first().map(|c| (*c).clone()))
        }

        async fn mark_contribution_settled(
            &self,
            id: &ObjectId,
            receipt: Option<&str>,
        ) -> crate::errors::Result<bool> {
            *self.settle_calls.lock().unwrap() += 1;
            let mut contributions = self.contributions.lock().unwrap();
            let entry = contributions
                .iter_mut()
                .find(|c| c.id.as_ref() == Some(id) && c.status == ContributionStatus::Pending);
            Ok(match entry {
                Some(c) => {
                    c.status = ContributionStatus::Success;
                    c.mpesa_receipt = receipt.map(str::to_string);
                    true
                }
                None => false,
            })
        }

        async fn find_active_loan(
            &self,
            member_id: &str,
            chama_id: &str,
        ) -> crate::errors::Result<Option<Loan>> {
            Ok(self
                .loans
                .lock()
                .unwrap()
                .iter()
                .find(|l| {
                    l.member_id == member_id
                        && l.chama_id == chama_id
                        && l.status == LoanStatus::Active
                })
                .cloned())
        }

        async fn record_repayment(
            &self,
            loan: &Loan,
            amount: i64,
            _receipt: Option<&str>,
            _reference: &str,
        ) -> crate::errors::Result<i64> {
            let loan_id = loan.id.unwrap();
            self.repayments.lock().unwrap().push((loan_id, amount));
            let mut loans = self.loans.lock().unwrap();
            let loan = loans.iter_mut().find(|l| l.id == Some(loan_id)).unwrap();
            loan.outstanding_balance -= amount;
            if loan.outstanding_balance <= 0 {
                loan.status = LoanStatus::Completed;
            }
            Ok(loan.outstanding_balance)
        }

        async fn find_unpaid_penalty(
            &self,
            member_id: &str,
            chama_id: &str,
            amount: i64,
        ) -> crate::errors::Result<Option<Penalty>> {
            Ok(self
                .penalties
                .lock()
                .unwrap()
                .iter()
                .find(|p| {
                    p.member_id == member_id
                        && p.chama_id == chama_id
                        && p.amount == amount
                        && !p.paid
                })
                .cloned())
        }

        async fn mark_penalty_paid(
            &self,
            id: &ObjectId,
            receipt: Option<&str>,
        ) -> crate::errors::Result<bool> {
            let mut penalties = self.penalties.lock().unwrap();
            let entry = penalties
                .iter_mut()
                .find(|p| p.id.as_ref() == Some(id) && !p.paid);
            Ok(match entry {
                Some(p) => {
                    p.paid = true;
                    p.mpesa_receipt = receipt.map(str::to_string);
                    true
                }
                None => false,
            })
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(
            &self,
            _member_ids: &[String],
            _chama_id: &str,
            title: &str,
            _message: &str,
            _kind: &str,
            _related_reference: Option<&str>,
        ) -> crate::errors::Result<()> {
            if self.fail {
                return Err(AppError::external_api("notifier down"));
            }
            self.sent.lock().unwrap().push(title.to_string());
            Ok(())
        }

        async fn notify_treasurers(
            &self,
            _chama_id: &str,
            title: &str,
            _message: &str,
            _related_reference: Option<&str>,
        ) -> crate::errors::Result<()> {
            if self.fail {
                return Err(AppError::external_api("notifier down"));
            }
            self.sent.lock().unwrap().push(format!("treasurers:{}", title));
            Ok(())
        }
    }

    fn pending_transaction(purpose: TransactionPurpose) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Some(ObjectId::new()),
            member_id: "mem-1".into(),
            chama_id: "chama-1".into(),
            purpose,
            amount: 1000,
            phone: "254712345678".into(),
            checkout_request_id: "ABC123".into(),
            merchant_request_id: "MR123".into(),
            reference: "ref123456789".into(),
            status: TransactionStatus::Pending,
            mpesa_receipt: None,
            result_code: None,
            result_desc: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn pending_contribution(reference: &str) -> Contribution {
        let now = Utc::now();
        Contribution {
            id: Some(ObjectId::new()),
            member_id: "mem-1".into(),
            chama_id: "chama-1".into(),
            cycle_id: None,
            amount: 1000,
            contribution_type: "contribution".into(),
            status: ContributionStatus::Pending,
            phone: "254712345678".into(),
            mpesa_receipt: None,
            reference: Some(reference.to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    fn success_outcome() -> GatewayOutcome {
        GatewayOutcome {
            checkout_request_id: "ABC123".into(),
            merchant_request_id: Some("MR123".into()),
            result_code: 0,
            result_desc: "The service request is processed successfully.".into(),
            amount: Some(1000),
            mpesa_receipt: Some("QWE1".into()),
            phone: Some("254712345678".into()),
            account_reference: None,
        }
    }

    fn reconciler(
        repo: Arc<FakeTransactionRepo>,
        ledger: Arc<FakeLedger>,
        notifier: Arc<FakeNotifier>,
    ) -> PaymentReconciler {
        PaymentReconciler::new(repo, ledger, notifier)
    }

    #[test]
    fn result_codes_map_through_the_table() {
        assert_eq!(status_for_result_code(0), TransactionStatus::Success);
        assert_eq!(status_for_result_code(1032), TransactionStatus::Cancelled);
        assert_eq!(status_for_result_code(1037), TransactionStatus::Failed);
        assert_eq!(status_for_result_code(9999), TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn happy_path_settles_contribution_with_receipt() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo.clone(), ledger.clone(), notifier.clone());

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Success,
                ledger: LedgerEffect::Applied
            }
        );

        let tx = repo.get("ref123456789");
        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.mpesa_receipt.as_deref(), Some("QWE1"));

        let contributions = ledger.contributions.lock().unwrap();
        assert_eq!(contributions[0].status, ContributionStatus::Success);
        assert_eq!(contributions[0].mpesa_receipt.as_deref(), Some("QWE1"));

        let sent = notifier.sent.lock().unwrap();
        assert!(sent.contains(&"Payment Confirmed".to_string()));
        assert!(sent.contains(&"treasurers:Contribution Received".to_string()));
    }

    #[tokio::test]
    async fn duplicate_outcome_is_absorbed() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo.clone(), ledger.clone(), notifier);

        let first = r.reconcile(success_outcome()).await.unwrap();
        let second = r.reconcile(success_outcome()).await.unwrap();

        assert!(matches!(first, ReconcileResult::Settled { .. }));
        assert_eq!(second, ReconcileResult::AlreadyFinalized);
        assert_eq!(*ledger.settle_calls.lock().unwrap(), 1);
        assert_eq!(repo.get("ref123456789").status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn query_after_callback_is_idempotent() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo.clone(), ledger.clone(), notifier);

        r.reconcile(success_outcome()).await.unwrap();

        // Status-query outcomes carry no metadata items.
        let query_outcome = GatewayOutcome {
            amount: None,
            mpesa_receipt: None,
            phone: None,
            ..success_outcome()
        };
        let second = r.reconcile(query_outcome).await.unwrap();

        assert_eq!(second, ReconcileResult::AlreadyFinalized);
        let tx = repo.get("ref123456789");
        assert_eq!(tx.mpesa_receipt.as_deref(), Some("QWE1"));
        assert_eq!(*ledger.settle_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_leaves_ledger_untouched() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo.clone(), ledger.clone(), notifier.clone());

        let outcome = GatewayOutcome {
            result_code: 1032,
            result_desc: "Request cancelled by user".into(),
            amount: None,
            mpesa_receipt: None,
            phone: None,
            ..success_outcome()
        };
        let result = r.reconcile(outcome).await.unwrap();

        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Cancelled,
                ledger: LedgerEffect::NotApplicable
            }
        );
        assert_eq!(repo.get("ref123456789").status, TransactionStatus::Cancelled);
        let contributions = ledger.contributions.lock().unwrap();
        assert_eq!(contributions[0].status, ContributionStatus::Pending);
        assert!(notifier
            .sent
            .lock()
            .unwrap()
            .contains(&"Payment Cancelled".to_string()));
    }

    #[tokio::test]
    async fn failed_outcome_leaves_ledger_untouched() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo, ledger.clone(), notifier);

        let outcome = GatewayOutcome {
            result_code: 1037,
            result_desc: "DS timeout".into(),
            amount: None,
            mpesa_receipt: None,
            phone: None,
            ..success_outcome()
        };
        let result = r.reconcile(outcome).await.unwrap();

        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Failed,
                ledger: LedgerEffect::NotApplicable
            }
        );
        assert_eq!(
            ledger.contributions.lock().unwrap()[0].status,
            ContributionStatus::Pending
        );
    }

    #[tokio::test]
    async fn orphan_outcome_is_dropped() {
        let repo = FakeTransactionRepo::with(vec![]);
        let ledger = Arc::new(FakeLedger::default());
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo, ledger, notifier.clone());

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert_eq!(result, ReconcileResult::NotFound);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reference_fallback_matches_pending_transaction() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo.clone(), ledger, notifier);

        let outcome = GatewayOutcome {
            checkout_request_id: "UNKNOWN".into(),
            merchant_request_id: None,
            account_reference: Some("ref123456789".into()),
            ..success_outcome()
        };
        let result = r.reconcile(outcome).await.unwrap();

        assert!(matches!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Success,
                ..
            }
        ));
        assert_eq!(repo.get("ref123456789").status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn amount_fallback_settles_unreferenced_contribution() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let mut contribution = pending_contribution("other-ref");
        contribution.reference = None;
        let ledger = FakeLedger::with_contribution(contribution);
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo, ledger.clone(), notifier);

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Success,
                ledger: LedgerEffect::Applied
            }
        );
        assert_eq!(
            ledger.contributions.lock().unwrap()[0].status,
            ContributionStatus::Success
        );
    }

    #[tokio::test]
    async fn missing_ledger_entry_is_a_gap_not_an_error() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = Arc::new(FakeLedger::default());
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo.clone(), ledger, notifier);

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Success,
                ledger: LedgerEffect::Gap
            }
        );
        // The transaction still settles; the gap is a review item.
        assert_eq!(repo.get("ref123456789").status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn loan_repayment_reduces_balance_and_completes() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::LoanRepayment)]);
        let ledger = Arc::new(FakeLedger::default());
        let loan_id = ObjectId::new();
        ledger.loans.lock().unwrap().push(Loan {
            id: Some(loan_id),
            member_id: "mem-1".into(),
            chama_id: "chama-1".into(),
            amount: 1000,
            interest_rate: 10.0,
            total_payable: 1100,
            outstanding_balance: 1000,
            purpose: "stock".into(),
            status: LoanStatus::Active,
            deadline: Utc::now(),
            created_at: Utc::now(),
        });
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo, ledger.clone(), notifier);

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Success,
                ledger: LedgerEffect::Applied
            }
        );

        let loans = ledger.loans.lock().unwrap();
        assert_eq!(loans[0].outstanding_balance, 0);
        assert_eq!(loans[0].status, LoanStatus::Completed);
        assert_eq!(ledger.repayments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn penalty_payment_marks_penalty_paid() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Penalty)]);
        let ledger = Arc::new(FakeLedger::default());
        ledger.penalties.lock().unwrap().push(Penalty {
            id: Some(ObjectId::new()),
            member_id: "mem-1".into(),
            chama_id: "chama-1".into(),
            amount: 1000,
            reason: "missed cycle".into(),
            paid: false,
            mpesa_receipt: None,
            created_at: Utc::now(),
        });
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo, ledger.clone(), notifier);

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert_eq!(
            result,
            ReconcileResult::Settled {
                status: TransactionStatus::Success,
                ledger: LedgerEffect::Applied
            }
        );
        let penalties = ledger.penalties.lock().unwrap();
        assert!(penalties[0].paid);
        assert_eq!(penalties[0].mpesa_receipt.as_deref(), Some("QWE1"));
    }

    #[tokio::test]
    async fn notifier_failure_never_blocks_settlement() {
        let repo = FakeTransactionRepo::with(vec![pending_transaction(TransactionPurpose::Contribution)]);
        let ledger = FakeLedger::with_contribution(pending_contribution("ref123456789"));
        let notifier = Arc::new(FakeNotifier {
            sent: Mutex::new(vec![]),
            fail: true,
        });
        let r = reconciler(repo.clone(), ledger, notifier);

        let result = r.reconcile(success_outcome()).await.unwrap();
        assert!(matches!(result, ReconcileResult::Settled { .. }));
        assert_eq!(repo.get("ref123456789").status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn matcher_flags_terminal_transactions() {
        let mut tx = pending_transaction(TransactionPurpose::Contribution);
        tx.status = TransactionStatus::Success;
        let repo = FakeTransactionRepo::with(vec![tx]);
        let ledger = Arc::new(FakeLedger::default());
        let notifier = Arc::new(FakeNotifier::default());
        let r = reconciler(repo, ledger, notifier);

        let matched = r.match_outcome(&success_outcome()).await.unwrap().unwrap();
        assert!(matched.already_finalized);
    }
}
