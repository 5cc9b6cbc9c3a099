// handlers/payments.rs
use axum::{
    extract::{Path, Query, State},
    Json,
};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::models::contribution::{Contribution, ContributionStatus};
use crate::models::transaction::{TransactionPurpose, TransactionStatus, TransactionView};
use crate::services::initiation::InitiateSpec;
use crate::services::notifier::Notifier;
use crate::services::reconciler::GatewayOutcome;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Daraja callback wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode")]
    pub result_code: i64,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,

    // Not part of the standard callback, but echoed by some gateway setups.
    #[serde(rename = "AccountReference", default)]
    pub account_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

impl StkCallback {
    fn into_outcome(self) -> GatewayOutcome {
        let mut amount = None;
        let mut mpesa_receipt = None;
        let mut phone = None;

        if let Some(metadata) = &self.callback_metadata {
            for item in &metadata.items {
                match item.name.as_str() {
                    // A non-integral amount falls back to the stored value
                    // instead of being silently floored.
                    "Amount" => {
                        amount = item.value.as_f64().and_then(|a| {
                            if a.fract() == 0.0 {
                                Some(a as i64)
                            } else {
                                warn!("Non-integral callback amount {}, keeping stored amount", a);
                                None
                            }
                        })
                    }
                    "MpesaReceiptNumber" => {
                        mpesa_receipt = item.value.as_str().map(str::to_string)
                    }
                    "PhoneNumber" => {
                        phone = match &item.value {
                            serde_json::Value::Number(n) => Some(n.to_string()),
                            serde_json::Value::String(s) => Some(s.clone()),
                            _ => None,
                        }
                    }
                    _ => {}
                }
            }
        }

        GatewayOutcome {
            checkout_request_id: self.checkout_request_id,
            merchant_request_id: Some(self.merchant_request_id),
            result_code: self.result_code,
            result_desc: self.result_desc,
            amount,
            mpesa_receipt,
            phone,
            account_reference: self.account_reference,
        }
    }
}

// ---------------------------------------------------------------------------
// Initiation requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ContributionRequest {
    pub member_id: String,
    pub chama_id: String,
    pub cycle_id: Option<String>,
    pub phone: String,
    pub amount: f64,
    /// "contribution" (default) or "registration_fee".
    pub purpose: Option<TransactionPurpose>,
}

#[derive(Debug, Deserialize)]
pub struct LoanRepaymentRequest {
    pub member_id: String,
    pub phone: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct PenaltyPaymentRequest {
    pub member_id: String,
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub member_id: String,
}

#[derive(Debug, Serialize)]
pub struct InitiationResponse {
    pub success: bool,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub reference: String,
    pub customer_message: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Start a contribution (or registration-fee) payment: push the STK prompt,
/// record the provisional transaction and the pending ledger entry, and tell
/// the payer and the treasurers.
pub async fn initiate_contribution(
    State(state): State<AppState>,
    Json(request): Json<ContributionRequest>,
) -> Result<Json<InitiationResponse>> {
    let purpose = request.purpose.unwrap_or(TransactionPurpose::Contribution);
    if !matches!(
        purpose,
        TransactionPurpose::Contribution | TransactionPurpose::RegistrationFee
    ) {
        return Err(AppError::validation(
            "purpose must be contribution or registration_fee",
        ));
    }

    let amount = crate::services::initiation::whole_amount(request.amount)?;
    let phone = crate::services::phone::normalize(&request.phone)?;

    let receipt = state
        .initiator
        .initiate(InitiateSpec {
            member_id: request.member_id.clone(),
            chama_id: request.chama_id.clone(),
            phone: phone.clone(),
            amount: amount as f64,
            purpose,
            description: format!("{} pmt", purpose.as_str()),
        })
        .await?;

    // The pending ledger entry is linked to the transaction via `reference`
    // and settled later by the reconciler.
    let now = chrono::Utc::now();
    state
        .ledger
        .create_pending_contribution(Contribution {
            id: None,
            member_id: request.member_id.clone(),
            chama_id: request.chama_id.clone(),
            cycle_id: request.cycle_id,
            amount,
            contribution_type: purpose.as_str().to_string(),
            status: ContributionStatus::Pending,
            phone,
            mpesa_receipt: None,
            reference: Some(receipt.reference.clone()),
            created_at: now,
            updated_at: now,
        })
        .await?;

    notify_initiated(
        &state,
        &request.member_id,
        &request.chama_id,
        amount,
        &receipt.reference,
        "Pending Contribution",
    )
    .await;

    Ok(Json(InitiationResponse {
        success: true,
        checkout_request_id: receipt.checkout_request_id,
        merchant_request_id: receipt.merchant_request_id,
        reference: receipt.reference,
        customer_message: receipt.customer_message,
    }))
}

/// Repay an active loan. Overpay is rejected here, before any push goes out.
pub async fn initiate_loan_repayment(
    State(state): State<AppState>,
    Path(loan_id): Path<String>,
    Json(request): Json<LoanRepaymentRequest>,
) -> Result<Json<InitiationResponse>> {
    let loan_oid = ObjectId::parse_str(&loan_id)?;
    let loan = state
        .ledger
        .find_loan_for_member(&loan_oid, &request.member_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let amount = crate::services::initiation::repayment_amount(&loan, request.amount)?;

    let receipt = state
        .initiator
        .initiate(InitiateSpec {
            member_id: request.member_id.clone(),
            chama_id: loan.chama_id.clone(),
            phone: request.phone,
            amount: amount as f64,
            purpose: TransactionPurpose::LoanRepayment,
            description: "loan repayment".to_string(),
        })
        .await?;

    notify_initiated(
        &state,
        &request.member_id,
        &loan.chama_id,
        amount,
        &receipt.reference,
        "Loan Repayment Pending",
    )
    .await;

    Ok(Json(InitiationResponse {
        success: true,
        checkout_request_id: receipt.checkout_request_id,
        merchant_request_id: receipt.merchant_request_id,
        reference: receipt.reference,
        customer_message: receipt.customer_message,
    }))
}

/// Pay an unpaid penalty at its recorded amount.
pub async fn initiate_penalty_payment(
    State(state): State<AppState>,
    Path(penalty_id): Path<String>,
    Json(request): Json<PenaltyPaymentRequest>,
) -> Result<Json<InitiationResponse>> {
    let penalty_oid = ObjectId::parse_str(&penalty_id)?;
    let penalty = state
        .ledger
        .find_penalty_for_member(&penalty_oid, &request.member_id)
        .await?
        .ok_or(AppError::NotFound)?;

    if penalty.paid {
        return Err(AppError::validation("Penalty already paid"));
    }

    let receipt = state
        .initiator
        .initiate(InitiateSpec {
            member_id: request.member_id.clone(),
            chama_id: penalty.chama_id.clone(),
            phone: request.phone,
            amount: penalty.amount as f64,
            purpose: TransactionPurpose::Penalty,
            description: "penalty pmt".to_string(),
        })
        .await?;

    notify_initiated(
        &state,
        &request.member_id,
        &penalty.chama_id,
        penalty.amount,
        &receipt.reference,
        "Penalty Payment Pending",
    )
    .await;

    Ok(Json(InitiationResponse {
        success: true,
        checkout_request_id: receipt.checkout_request_id,
        merchant_request_id: receipt.merchant_request_id,
        reference: receipt.reference,
        customer_message: receipt.customer_message,
    }))
}

/// Daraja webhook. Always acknowledged with ResultCode 0; the gateway
/// retries non-200 responses, and duplicates are already absorbed by the
/// reconciler's idempotency guard.
pub async fn stk_callback(
    State(state): State<AppState>,
    Json(envelope): Json<CallbackEnvelope>,
) -> Json<serde_json::Value> {
    let callback = envelope.body.stk_callback;
    info!(
        "STK callback for {} (code {})",
        callback.checkout_request_id, callback.result_code
    );

    let outcome = callback.into_outcome();
    match state.reconciler.reconcile(outcome).await {
        Ok(result) => info!("Callback reconciled: {:?}", result),
        Err(e) => warn!("Callback reconciliation failed: {}", e),
    }

    Json(json!({ "ResultCode": 0, "ResultDesc": "Callback received" }))
}

/// User-triggered "check status now". While the transaction is pending the
/// gateway is actively queried and the result funneled through the same
/// reconcile path as the callback.
pub async fn check_payment_status(
    State(state): State<AppState>,
    Path(checkout_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let tx = state
        .transactions
        .find_by_checkout(&checkout_id, None)
        .await?
        .ok_or(AppError::NotFound)?;

    if tx.status == TransactionStatus::Pending {
        match state.daraja.query_stk_status(&checkout_id).await {
            Ok(Some(query)) => {
                let outcome = GatewayOutcome::from_query(&query)?;
                state.reconciler.reconcile(outcome).await?;
            }
            Ok(None) => info!("Checkout {} still processing on gateway", checkout_id),
            Err(e) => warn!("Status query for {} failed: {}", checkout_id, e),
        }
    }

    // Re-read: the query above may just have settled it.
    let tx = state
        .transactions
        .find_by_checkout(&checkout_id, None)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(json!({
        "success": true,
        "transaction": TransactionView::from(tx),
    })))
}

pub async fn my_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<serde_json::Value>> {
    let transactions = state.transactions.list_for_member(&query.member_id).await?;
    let views: Vec<TransactionView> = transactions.into_iter().map(TransactionView::from).collect();
    Ok(Json(json!({
        "count": views.len(),
        "transactions": views,
    })))
}

async fn notify_initiated(
    state: &AppState,
    member_id: &str,
    chama_id: &str,
    amount: i64,
    reference: &str,
    treasurer_title: &str,
) {
    let payer_message = format!(
        "An M-Pesa payment of KSh {} was initiated. Please complete the STK prompt on your phone.",
        amount
    );
    let recipients = [member_id.to_string()];
    if let Err(e) = state
        .notifier
        .notify(
            &recipients,
            chama_id,
            "Payment Initiated",
            &payer_message,
            "payment",
            Some(reference),
        )
        .await
    {
        warn!("Failed to notify {} of initiation: {}", member_id, e);
    }

    let treasurer_message = format!(
        "{} initiated a payment of KSh {} (pending confirmation).",
        member_id, amount
    );
    if let Err(e) = state
        .notifier
        .notify_treasurers(chama_id, treasurer_title, &treasurer_message, Some(reference))
        .await
    {
        warn!("Failed to notify treasurers of {}: {}", chama_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback_json(result_code: i64, with_metadata: bool) -> serde_json::Value {
        let mut stk = json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResultCode": result_code,
            "ResultDesc": "The service request is processed successfully.",
        });
        if with_metadata {
            stk["CallbackMetadata"] = json!({
                "Item": [
                    { "Name": "Amount", "Value": 1000.0 },
                    { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                    { "Name": "TransactionDate", "Value": 20191219102115u64 },
                    { "Name": "PhoneNumber", "Value": 254712345678u64 }
                ]
            });
        }
        json!({ "Body": { "stkCallback": stk } })
    }

    #[test]
    fn callback_metadata_is_extracted() {
        let envelope: CallbackEnvelope =
            serde_json::from_value(callback_json(0, true)).unwrap();
        let outcome = envelope.body.stk_callback.into_outcome();

        assert_eq!(outcome.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(outcome.result_code, 0);
        assert_eq!(outcome.amount, Some(1000));
        assert_eq!(outcome.mpesa_receipt.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(outcome.phone.as_deref(), Some("254712345678"));
    }

    #[test]
    fn non_integral_callback_amount_falls_back_to_stored_value() {
        let mut value = callback_json(0, true);
        value["Body"]["stkCallback"]["CallbackMetadata"]["Item"][0]["Value"] = json!(1000.5);
        let envelope: CallbackEnvelope = serde_json::from_value(value).unwrap();
        let outcome = envelope.body.stk_callback.into_outcome();

        assert_eq!(outcome.amount, None);
        assert_eq!(outcome.mpesa_receipt.as_deref(), Some("NLJ7RT61SV"));
    }

    #[test]
    fn failure_callback_has_no_metadata() {
        let envelope: CallbackEnvelope =
            serde_json::from_value(callback_json(1032, false)).unwrap();
        let outcome = envelope.body.stk_callback.into_outcome();

        assert_eq!(outcome.result_code, 1032);
        assert_eq!(outcome.amount, None);
        assert_eq!(outcome.mpesa_receipt, None);
    }
}
