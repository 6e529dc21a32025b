// config.rs
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
    Mock,
}

impl MpesaEnvironment {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "production" => MpesaEnvironment::Production,
            "mock" => MpesaEnvironment::Mock,
            _ => MpesaEnvironment::Sandbox,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_callback_url: String,
    pub mpesa_environment: MpesaEnvironment,
    pub sms_api_key: String,
    pub sms_username: String,
    pub sms_from: String,
    pub admin_alert_phone: String,
    pub jwt_secret: String,
    pub database_url: String,
    pub port: u16,
    pub host: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, crate::errors::AppError> {
        let mpesa_environment =
            MpesaEnvironment::parse(&env::var("MPESA_ENVIRONMENT").unwrap_or_default());

        let required = |key: &str| {
            env::var(key)
                .map_err(|_| crate::errors::AppError::configuration(format!("{} must be set", key)))
        };

        Ok(AppConfig {
            mpesa_consumer_key: env::var("MPESA_CONSUMER_KEY").unwrap_or_default(),
            mpesa_consumer_secret: env::var("MPESA_CONSUMER_SECRET").unwrap_or_default(),
            mpesa_short_code: env::var("MPESA_SHORT_CODE").unwrap_or_else(|_| "174379".to_string()),
            mpesa_passkey: env::var("MPESA_PASSKEY").unwrap_or_default(),
            mpesa_callback_url: env::var("MPESA_CALLBACK_URL")
                .unwrap_or_else(|_| "https://localhost/api/payments/mpesa/callback".to_string()),
            mpesa_environment,
            sms_api_key: env::var("SMS_API_KEY").unwrap_or_default(),
            sms_username: env::var("SMS_USERNAME").unwrap_or_else(|_| "sandbox".to_string()),
            sms_from: env::var("SMS_FROM").unwrap_or_else(|_| "UsafiLink".to_string()),
            admin_alert_phone: env::var("ADMIN_ALERT_PHONE").unwrap_or_default(),
            jwt_secret: required("JWT_SECRET")?,
            database_url: required("DATABASE_URL")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| crate::errors::AppError::configuration("PORT must be a number"))?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        })
    }

    pub fn mpesa_base_url(&self) -> &'static str {
        match self.mpesa_environment {
            MpesaEnvironment::Production => "https://api.safaricom.co.ke",
            _ => "https://sandbox.safaricom.co.ke",
        }
    }

    pub fn mpesa_auth_url(&self) -> String {
        format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.mpesa_base_url()
        )
    }

    pub fn mpesa_stk_url(&self) -> String {
        format!("{}/mpesa/stkpush/v1/processrequest", self.mpesa_base_url())
    }

    pub fn mpesa_query_url(&self) -> String {
        format!("{}/mpesa/stkpushquery/v1/query", self.mpesa_base_url())
    }

    /// Mock mode kicks in explicitly or whenever the credentials are empty or
    /// still the "your-..." placeholders from a sample .env.
    pub fn mpesa_mock_mode(&self) -> bool {
        self.mpesa_environment == MpesaEnvironment::Mock
            || self.mpesa_consumer_key.is_empty()
            || self.mpesa_consumer_secret.is_empty()
            || self.mpesa_consumer_key.starts_with("your-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parsing_defaults_to_sandbox() {
        assert_eq!(MpesaEnvironment::parse("production"), MpesaEnvironment::Production);
        assert_eq!(MpesaEnvironment::parse("MOCK"), MpesaEnvironment::Mock);
        assert_eq!(MpesaEnvironment::parse(""), MpesaEnvironment::Sandbox);
        assert_eq!(MpesaEnvironment::parse("staging"), MpesaEnvironment::Sandbox);
    }

    #[test]
    fn placeholder_credentials_force_mock_mode() {
        let config = AppConfig {
            mpesa_consumer_key: "your-consumer-key".to_string(),
            mpesa_consumer_secret: "secret".to_string(),
            mpesa_short_code: "174379".to_string(),
            mpesa_passkey: String::new(),
            mpesa_callback_url: String::new(),
            mpesa_environment: MpesaEnvironment::Sandbox,
            sms_api_key: String::new(),
            sms_username: "sandbox".to_string(),
            sms_from: "UsafiLink".to_string(),
            admin_alert_phone: String::new(),
            jwt_secret: "secret".to_string(),
            database_url: String::new(),
            port: 3000,
            host: "0.0.0.0".to_string(),
        };
        assert!(config.mpesa_mock_mode());
    }
}
