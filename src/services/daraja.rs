// services/daraja.rs
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};

/// Refresh the cached token this long before its advertised expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Daraja reports a query on a still-processing push with this error code.
const STILL_PROCESSING_CODE: &str = "500.001.1001";

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: String,
    #[serde(rename = "Amount")]
    amount: i64,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "PhoneNumber")]
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: String,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: String,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

/// Daraja error envelope, returned with non-2xx statuses.
#[derive(Debug, Deserialize, Default)]
struct GatewayErrorBody {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

/// Gateway client: OAuth credential cache plus the STK push and STK query
/// calls. One instance per process; safe for concurrent callers (a double
/// token refresh is wasteful but harmless, last writer wins).
#[derive(Debug, Clone)]
pub struct DarajaService {
    config: AppConfig,
    client: Client,
    cached_token: Arc<RwLock<Option<(String, DateTime<Utc>)>>>,
}

impl DarajaService {
    pub fn new(config: AppConfig) -> Self {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        DarajaService {
            config,
            client,
            cached_token: Arc::new(RwLock::new(None)),
        }
    }

    fn timestamp() -> String {
        Utc::now().format("%Y%m%d%H%M%S").to_string()
    }

    fn generate_password(&self, timestamp: &str) -> String {
        generate_password(&self.config.mpesa_short_code, &self.config.mpesa_passkey, timestamp)
    }

    pub async fn access_token(&self) -> Result<String> {
        {
            let cached = self.cached_token.read().unwrap();
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Utc::now() {
                    return Ok(token.clone());
                }
            }
        }

        info!("Requesting new daraja access token");
        let auth_string = format!(
            "{}:{}",
            self.config.mpesa_consumer_key, self.config.mpesa_consumer_secret
        );
        let encoded_auth = base64.encode(auth_string);

        let response = self
            .client
            .get(self.config.auth_url())
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await
            .map_err(|e| AppError::GatewayAuth(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Daraja auth failed: {} - {}", status, body);
            return Err(AppError::GatewayAuth(format!("auth failed with {}", status)));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::GatewayAuth(e.to_string()))?;

        let ttl = auth.expires_in.parse::<i64>().unwrap_or(3600);
        let expiry = Utc::now() + Duration::seconds(ttl - TOKEN_REFRESH_MARGIN_SECS);
        {
            let mut cached = self.cached_token.write().unwrap();
            *cached = Some((auth.access_token.clone(), expiry));
        }

        info!("Daraja access token obtained, valid for {}s", ttl);
        Ok(auth.access_token)
    }

    /// Ask the gateway to prompt `phone` for `amount`. On acceptance returns
    /// the correlation IDs; a gateway business rejection surfaces as
    /// `GatewayRejected` and a network timeout as `GatewayTimeout`, since only
    /// the latter leaves the outcome unknown.
    pub async fn initiate_stk_push(
        &self,
        phone: &str,
        amount: i64,
        reference: &str,
        description: &str,
    ) -> Result<StkPushResponse> {
        info!("STK push for {} - KSh {} ({})", phone, amount, reference);

        let access_token = self.access_token().await?;
        let timestamp = Self::timestamp();
        let password = self.generate_password(&timestamp);

        let request = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: phone.to_string(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: phone.to_string(),
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: reference.to_string(),
            // Daraja caps TransactionDesc at 20 characters.
            transaction_desc: description.chars().take(20).collect(),
        };

        let response = self
            .client
            .post(self.config.stk_push_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body: GatewayErrorBody = response.json().await.unwrap_or_default();
            let code = body.error_code.unwrap_or_else(|| status.to_string());
            let message = body
                .error_message
                .unwrap_or_else(|| "STK push rejected".to_string());
            warn!("STK push rejected [{}]: {}", code, message);
            return Err(AppError::GatewayRejected { code, message });
        }

        let push: StkPushResponse = response
            .json()
            .await
            .map_err(|e| AppError::external_api(format!("bad STK push response: {}", e)))?;

        if push.response_code != "0" {
            warn!(
                "STK push not accepted [{}]: {}",
                push.response_code, push.response_description
            );
            return Err(AppError::GatewayRejected {
                code: push.response_code,
                message: push.response_description,
            });
        }

        info!("STK push accepted: {}", push.checkout_request_id);
        Ok(push)
    }

    /// Actively query the gateway for the outcome of a checkout. Returns
    /// `None` while the push is still being processed (no outcome yet).
    pub async fn query_stk_status(&self, checkout_request_id: &str) -> Result<Option<StkQueryResponse>> {
        let access_token = self.access_token().await?;
        let timestamp = Self::timestamp();
        let password = self.generate_password(&timestamp);

        let request = StkQueryRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let response = self
            .client
            .post(self.config.stk_query_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body: GatewayErrorBody = response.json().await.unwrap_or_default();
            if body.error_code.as_deref() == Some(STILL_PROCESSING_CODE) {
                return Ok(None);
            }
            let code = body.error_code.unwrap_or_else(|| status.to_string());
            let message = body
                .error_message
                .unwrap_or_else(|| "status query failed".to_string());
            return Err(AppError::GatewayRejected { code, message });
        }

        let query: StkQueryResponse = response
            .json()
            .await
            .map_err(|e| AppError::external_api(format!("bad STK query response: {}", e)))?;
        Ok(Some(query))
    }
}

fn generate_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        let password = generate_password("174379", "passkey", "20260101120000");
        let decoded = base64.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey20260101120000");
    }

    #[test]
    fn timestamp_has_daraja_shape() {
        let ts = DarajaService::timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }
}
