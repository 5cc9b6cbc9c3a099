// services/initiation.rs
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::models::loan::{Loan, LoanStatus};
use crate::models::transaction::{Transaction, TransactionPurpose, TransactionStatus};
use crate::services::daraja::DarajaService;
use crate::services::phone;
use crate::services::transactions::TransactionRepo;

/// Daraja caps the AccountReference field at 12 characters.
const REFERENCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct InitiateSpec {
    pub member_id: String,
    pub chama_id: String,
    pub phone: String,
    pub amount: f64,
    pub purpose: TransactionPurpose,
    pub description: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InitiationReceipt {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub reference: String,
    pub customer_message: String,
}

/// Builds and sends the STK push and records the provisional transaction.
/// Nothing is persisted unless the gateway explicitly accepts the push, so a
/// rejection or timeout never leaves a half-written record behind.
pub struct PaymentInitiator {
    daraja: Arc<DarajaService>,
    transactions: Arc<dyn TransactionRepo>,
}

impl PaymentInitiator {
    pub fn new(daraja: Arc<DarajaService>, transactions: Arc<dyn TransactionRepo>) -> Self {
        PaymentInitiator { daraja, transactions }
    }

    pub async fn initiate(&self, spec: InitiateSpec) -> Result<InitiationReceipt> {
        let amount = whole_amount(spec.amount)?;
        let msisdn = phone::normalize(&spec.phone)?;
        let reference = new_reference();

        let push = self
            .daraja
            .initiate_stk_push(&msisdn, amount, &reference, &spec.description)
            .await?;

        let now = Utc::now();
        let tx = Transaction {
            id: None,
            member_id: spec.member_id,
            chama_id: spec.chama_id,
            purpose: spec.purpose,
            amount,
            phone: msisdn,
            checkout_request_id: push.checkout_request_id.clone(),
            merchant_request_id: push.merchant_request_id.clone(),
            reference: reference.clone(),
            status: TransactionStatus::Pending,
            mpesa_receipt: None,
            result_code: None,
            result_desc: None,
            created_at: now,
            updated_at: now,
        };
        self.transactions.insert(tx).await?;

        info!(
            "Payment initiated: {} KSh {} ({})",
            push.checkout_request_id, amount, reference
        );

        Ok(InitiationReceipt {
            checkout_request_id: push.checkout_request_id,
            merchant_request_id: push.merchant_request_id,
            reference,
            customer_message: push.customer_message,
        })
    }
}

/// Daraja rejects STK push amounts above this per-transaction cap.
const GATEWAY_MAX_AMOUNT: i64 = 250_000;

/// The gateway only accepts whole currency units within its transaction cap.
/// `1500.00` passes as 1500; `1500.75` is rejected outright rather than
/// silently floored.
pub fn whole_amount(amount: f64) -> Result<i64> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::validation("Amount must be greater than 0"));
    }
    if amount > GATEWAY_MAX_AMOUNT as f64 {
        return Err(AppError::validation(
            "Amount exceeds the gateway transaction limit",
        ));
    }
    if amount.fract() != 0.0 {
        return Err(AppError::validation(
            "Amount must be a whole number of shillings",
        ));
    }
    Ok(amount as i64)
}

/// Validate a repayment against its loan before any push goes out. The loan
/// must be active and the amount must not exceed the outstanding balance.
pub fn repayment_amount(loan: &Loan, amount: f64) -> Result<i64> {
    if loan.status != LoanStatus::Active {
        return Err(AppError::validation("Loan is not active"));
    }
    let amount = whole_amount(amount)?;
    if amount > loan.outstanding_balance {
        return Err(AppError::validation("Amount exceeds outstanding balance"));
    }
    Ok(amount)
}

fn new_reference() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..REFERENCE_LEN].to_string()
}
