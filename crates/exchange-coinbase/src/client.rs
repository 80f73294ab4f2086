use chrono::Utc;
use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};
use gridtrade_core::ExchangeError;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// API credentials, sourced from the environment only. The secret is never
/// logged and never persisted.
#[derive(Clone)]
pub struct CoinbaseCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for CoinbaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseCredentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

impl CoinbaseCredentials {
    /// Reads `COINBASE_API_KEY` / `COINBASE_API_SECRET` from the environment.
    ///
    /// # Errors
    /// Returns an error if either variable is missing.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("COINBASE_API_KEY")
            .map_err(|_| anyhow::anyhow!("COINBASE_API_KEY is not set"))?;
        let api_secret = std::env::var("COINBASE_API_SECRET")
            .map_err(|_| anyhow::anyhow!("COINBASE_API_SECRET is not set"))?;
        Ok(Self { api_key, api_secret })
    }
}

/// Signed HTTP client for the Coinbase Advanced Trade REST API.
///
/// Every request is HMAC-SHA256 signed over `timestamp + method + path + body`
/// and rate limited client-side. Calls carry a 10 s deadline by default;
/// timeouts surface as transient errors and are retried by the caller.
pub struct CoinbaseClient {
    http: Client,
    base_url: String,
    credentials: CoinbaseCredentials,
    rate_limiter: Arc<RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>>,
    timeout: Duration,
}

impl CoinbaseClient {
    /// # Panics
    /// Panics if the HTTP client cannot be constructed (static TLS config).
    #[must_use]
    pub fn new(base_url: String, credentials: CoinbaseCredentials, timeout: Duration) -> Self {
        // Advanced Trade allows 30 req/s for private endpoints; stay under.
        let quota = Quota::per_second(NonZeroU32::new(20).expect("nonzero"));
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");

        Self {
            http,
            base_url,
            credentials,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            timeout,
        }
    }

    fn sign(&self, timestamp: &str, method: &Method, path: &str, body: &str) -> String {
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issues a signed request and decodes the JSON response.
    ///
    /// # Errors
    /// Returns a transient error for timeouts, connection failures, 429 and
    /// 5xx; a permanent error for any other non-2xx status.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let path = format!("/api/v3{endpoint}");
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, &method, &path, &body_str);

        let url = format!("{}{endpoint}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .header("CB-ACCESS-KEY", &self.credentials.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout(self.timeout)
            } else {
                ExchangeError::Transient(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify(status, text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Permanent(format!("malformed response: {e}")))
    }

    /// # Errors
    /// See [`CoinbaseClient::request`].
    pub async fn get(&self, endpoint: &str) -> Result<serde_json::Value, ExchangeError> {
        self.request(Method::GET, endpoint, None).await
    }

    /// # Errors
    /// See [`CoinbaseClient::request`].
    pub async fn post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.request(Method::POST, endpoint, Some(body)).await
    }
}

fn classify(status: StatusCode, body: String) -> ExchangeError {
    ExchangeError::from_status(status.as_u16(), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CoinbaseClient {
        CoinbaseClient::new(
            "https://api.coinbase.com/api/v3".to_string(),
            CoinbaseCredentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
            },
            Duration::from_secs(10),
        )
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let c = client();
        let sig = c.sign("1700000000", &Method::GET, "/api/v3/brokerage/products", "");
        let again = c.sign("1700000000", &Method::GET, "/api/v3/brokerage/products", "");
        assert_eq!(sig, again);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_never_prints_secrets() {
        let creds = CoinbaseCredentials {
            api_key: "real-key".to_string(),
            api_secret: "real-secret".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("real-key"));
        assert!(!rendered.contains("real-secret"));
    }
}
