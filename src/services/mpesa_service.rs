// services/mpesa_service.rs
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};

// Safaricom caps the transaction description field.
const TRANSACTION_DESC_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[allow(dead_code)]
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

impl StkPushResponse {
    pub fn is_accepted(&self) -> bool {
        self.response_code == "0"
    }
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    #[serde(rename = "ResultCode", default)]
    pub result_code: Option<String>,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
}

/// Cached bearer credential with its expiry, injected into the gateway
/// instead of living in process-global state.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        let cached = self.inner.read().ok()?;
        let (token, expiry) = cached.as_ref()?;
        // Refuse tokens within 5 minutes of expiry so in-flight calls
        // never race the cutoff.
        if *expiry > Utc::now() + chrono::Duration::minutes(5) {
            Some(token.clone())
        } else {
            None
        }
    }

    pub fn put(&self, token: String, expiry: DateTime<Utc>) {
        if let Ok(mut cached) = self.inner.write() {
            *cached = Some((token, expiry));
        }
    }
}

/// Client for the Safaricom Daraja API: OAuth, STK push and status query.
/// In mock mode every call succeeds synthetically without touching the
/// network, which is what local and test environments run with.
#[derive(Debug)]
pub struct MpesaGateway {
    config: AppConfig,
    client: Client,
    tokens: Arc<TokenCache>,
    mock: bool,
}

impl MpesaGateway {
    pub fn new(config: AppConfig, tokens: Arc<TokenCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        let mock = config.mpesa_mock_mode();
        if mock {
            warn!("M-Pesa credentials missing or placeholder, running in MOCK mode");
        }

        Ok(MpesaGateway {
            config,
            client,
            tokens,
            mock,
        })
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    pub async fn authenticate(&self) -> Result<String> {
        if self.mock {
            return Ok("mock_access_token_12345".to_string());
        }

        if let Some(token) = self.tokens.get() {
            return Ok(token);
        }

        info!("Requesting new M-Pesa access token");
        let auth_string = format!(
            "{}:{}",
            self.config.mpesa_consumer_key, self.config.mpesa_consumer_secret
        );
        let encoded_auth = base64.encode(auth_string);

        let response = self
            .client
            .get(self.config.mpesa_auth_url())
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("M-Pesa auth failed: {} - {}", status, body);
            return Err(AppError::gateway(format!("M-Pesa auth failed: {}", status)));
        }

        let auth_response: AuthResponse = response.json().await?;
        self.tokens.put(
            auth_response.access_token.clone(),
            Utc::now() + chrono::Duration::hours(1),
        );

        Ok(auth_response.access_token)
    }

    pub async fn stk_push(
        &self,
        phone_number: &str,
        amount: Decimal,
        account_reference: &str,
        transaction_desc: &str,
    ) -> Result<StkPushResponse> {
        // Daraja only takes whole shillings.
        let amount = amount
            .trunc()
            .to_u64()
            .filter(|a| *a > 0)
            .ok_or_else(|| AppError::validation("Amount must be greater than 0"))?;

        if self.mock {
            return Ok(mock_stk_response(account_reference));
        }

        info!("STK push for {} - KSh {}", phone_number, amount);

        let access_token = self.authenticate().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let desc: String = transaction_desc.chars().take(TRANSACTION_DESC_LIMIT).collect();

        let stk_request = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: phone_number.to_string(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: phone_number.to_string(),
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: desc,
        };

        let response = self
            .client
            .post(self.config.mpesa_stk_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&stk_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("STK push failed: {} - {}", status, body);
            return Err(AppError::gateway(format!("STK push failed: {}", status)));
        }

        let stk_response: StkPushResponse = response.json().await?;
        info!("STK push accepted: {}", stk_response.merchant_request_id);
        Ok(stk_response)
    }

    pub async fn query_status(&self, checkout_request_id: &str) -> Result<StkQueryResponse> {
        if self.mock {
            return Ok(StkQueryResponse {
                response_code: "0".to_string(),
                response_description: "The service request has been processed successfully (mock)"
                    .to_string(),
                merchant_request_id: Some("req_mock".to_string()),
                checkout_request_id: Some(checkout_request_id.to_string()),
                result_code: Some("0".to_string()),
                result_desc: Some("The service request is processed successfully (mock)".to_string()),
            });
        }

        let access_token = self.authenticate().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let query_request = StkQueryRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let response = self
            .client
            .post(self.config.mpesa_query_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&query_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            error!("STK query failed: {}", status);
            return Err(AppError::gateway(format!("STK query failed: {}", status)));
        }

        Ok(response.json().await?)
    }

    fn generate_password(&self, timestamp: &str) -> String {
        let password_string = format!(
            "{}{}{}",
            self.config.mpesa_short_code, self.config.mpesa_passkey, timestamp
        );
        base64.encode(password_string)
    }
}

fn mock_stk_response(account_reference: &str) -> StkPushResponse {
    StkPushResponse {
        merchant_request_id: format!("req_mock_{}", account_reference),
        checkout_request_id: format!("chk_mock_{}", account_reference),
        response_code: "0".to_string(),
        response_description: "Success. Request accepted for processing".to_string(),
        customer_message: "Success. Request accepted for processing".to_string(),
    }
}

/// Canonicalize a Kenyan phone number to 2547XXXXXXXX, the only form the
/// gateway accepts.
pub fn format_phone_number(phone_number: &str) -> Result<String> {
    let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();

    let phone = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with("254") {
        digits
    } else if digits.len() == 9 {
        format!("254{}", digits)
    } else {
        digits
    };

    if phone.len() != 12 {
        return Err(AppError::validation(format!(
            "Invalid phone number length: {}",
            phone
        )));
    }

    Ok(phone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MpesaEnvironment;

    fn mock_config() -> AppConfig {
        AppConfig {
            mpesa_consumer_key: String::new(),
            mpesa_consumer_secret: String::new(),
            mpesa_short_code: "174379".to_string(),
            mpesa_passkey: String::new(),
            mpesa_callback_url: "https://localhost/cb".to_string(),
            mpesa_environment: MpesaEnvironment::Mock,
            sms_api_key: String::new(),
            sms_username: "sandbox".to_string(),
            sms_from: "UsafiLink".to_string(),
            admin_alert_phone: String::new(),
            jwt_secret: "secret".to_string(),
            database_url: String::new(),
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }

    #[test]
    fn phone_formats_to_international() {
        assert_eq!(format_phone_number("0712345678").unwrap(), "254712345678");
        assert_eq!(format_phone_number("254712345678").unwrap(), "254712345678");
        assert_eq!(format_phone_number("712345678").unwrap(), "254712345678");
        assert_eq!(format_phone_number("+254 712 345 678").unwrap(), "254712345678");
        assert!(format_phone_number("12345").is_err());
    }

    #[tokio::test]
    async fn mock_gateway_needs_no_network() {
        let gateway = MpesaGateway::new(mock_config(), Arc::new(TokenCache::new())).unwrap();
        assert!(gateway.is_mock());

        let token = gateway.authenticate().await.unwrap();
        assert_eq!(token, "mock_access_token_12345");

        let push = gateway
            .stk_push("254712345678", Decimal::from(5000), "BK000001", "Exhauster service")
            .await
            .unwrap();
        assert!(push.is_accepted());
        assert!(push.checkout_request_id.starts_with("chk_mock_"));

        let query = gateway.query_status(&push.checkout_request_id).await.unwrap();
        assert_eq!(query.result_code.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn mock_push_rejects_zero_amount() {
        let gateway = MpesaGateway::new(mock_config(), Arc::new(TokenCache::new())).unwrap();
        let err = gateway
            .stk_push("254712345678", Decimal::ZERO, "BK000001", "desc")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn token_cache_honours_expiry_margin() {
        let cache = TokenCache::new();
        assert!(cache.get().is_none());

        cache.put("fresh".to_string(), Utc::now() + chrono::Duration::hours(1));
        assert_eq!(cache.get().as_deref(), Some("fresh"));

        // Inside the 5-minute refresh margin the token is treated as stale.
        cache.put("stale".to_string(), Utc::now() + chrono::Duration::minutes(2));
        assert!(cache.get().is_none());
    }

    #[test]
    fn fractional_amounts_truncate_to_shillings() {
        use std::str::FromStr;
        let amount = Decimal::from_str("5000.75").unwrap();
        assert_eq!(amount.trunc().to_u64(), Some(5000));
    }
}
