//! Listings API client.
//!
//! [`HttpReferenceSource`] queries a listings endpoint returning
//!
//! ```text
//! {"data": [{"symbol": "BTC", "quote": {"USD": {"price": 61234.5}}}, ...]}
//! ```
//!
//! and picks the entry whose symbol matches. The HTTP layer is abstracted
//! behind [`AsyncHttpClient`] so the parsing and validation can be tested
//! with a mock client.
//!
//! The API key is never stored in configuration or source: the
//! configuration names an environment variable and the key is read from it
//! when the source is built.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{QuoteError, ReferenceSource};
use crate::peripheral::BoxFuture;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-CMC_PRO_API_KEY";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The parts of an HTTP response the source inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Trait for async HTTP GET requests.
pub trait AsyncHttpClient: Send + Sync {
    /// Perform a GET with the given extra headers.
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> impl std::future::Future<Output = Result<HttpResponse, QuoteError>> + Send;
}

/// Real HTTP client implementation using reqwest.
pub struct AsyncReqwestClient {
    client: reqwest::Client,
}

impl AsyncReqwestClient {
    /// Create a client with the default timeout.
    pub fn new() -> Result<Self, QuoteError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, QuoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QuoteError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl AsyncHttpClient for AsyncReqwestClient {
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, QuoteError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| QuoteError::Network(format!("Request failed: {}", e)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| QuoteError::Network(format!("Failed to read response: {}", e)))?
            .to_vec();

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Listings {
    data: Vec<Listing>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    symbol: String,
    quote: std::collections::HashMap<String, ConvertedQuote>,
}

#[derive(Debug, Deserialize)]
struct ConvertedQuote {
    price: f64,
}

/// Extract the price of `symbol` in `convert` from a listings response.
pub fn parse_listings(
    response: &HttpResponse,
    symbol: &str,
    convert: &str,
) -> Result<f64, QuoteError> {
    if !(200..300).contains(&response.status) {
        return Err(QuoteError::InvalidResponse(format!(
            "HTTP {}",
            response.status
        )));
    }

    let is_json = response
        .content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(QuoteError::InvalidResponse(format!(
            "expected JSON, got content type {:?}",
            response.content_type
        )));
    }

    let listings: Listings = serde_json::from_slice(&response.body)
        .map_err(|e| QuoteError::InvalidResponse(format!("malformed listings: {}", e)))?;

    listings
        .data
        .iter()
        .find(|l| l.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| QuoteError::InvalidResponse(format!("symbol {} not in listings", symbol)))?
        .quote
        .get(convert)
        .map(|q| q.price)
        .ok_or_else(|| {
            QuoteError::InvalidResponse(format!("no {} quote for {}", convert, symbol))
        })
}

/// Reference source backed by a listings HTTP API.
pub struct HttpReferenceSource<C: AsyncHttpClient> {
    client: C,
    url: String,
    convert: String,
    api_key: Option<String>,
}

impl<C: AsyncHttpClient> HttpReferenceSource<C> {
    /// Create a source querying `url`, quoting prices in `convert`.
    pub fn new(client: C, url: impl Into<String>, convert: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            convert: convert.into(),
            api_key: None,
        }
    }

    /// Send `key` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Read the API key from the environment variable `var`, if set.
    pub fn with_api_key_from_env(self, var: &str) -> Self {
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => self.with_api_key(key),
            _ => {
                debug!(var, "No API key in environment");
                self
            }
        }
    }

    async fn fetch(&self, symbol: &str) -> Result<f64, QuoteError> {
        let mut headers = vec![("Accept", "application/json")];
        if let Some(key) = &self.api_key {
            headers.push((API_KEY_HEADER, key.as_str()));
        }
        let response = self.client.get(&self.url, &headers).await?;
        let price = parse_listings(&response, symbol, &self.convert)?;
        debug!(symbol, price, "Reference quote fetched");
        Ok(price)
    }
}

impl<C: AsyncHttpClient> ReferenceSource for HttpReferenceSource<C> {
    fn fetch_quote<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<f64, QuoteError>> {
        Box::pin(self.fetch(symbol))
    }

    fn name(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Mock HTTP client for testing
    pub struct MockAsyncHttpClient {
        pub response: Result<HttpResponse, QuoteError>,
        pub seen_headers: Mutex<Vec<(String, String)>>,
    }

    impl MockAsyncHttpClient {
        pub fn new(response: Result<HttpResponse, QuoteError>) -> Self {
            Self {
                response,
                seen_headers: Mutex::new(Vec::new()),
            }
        }
    }

    impl AsyncHttpClient for MockAsyncHttpClient {
        async fn get(
            &self,
            _url: &str,
            headers: &[(&str, &str)],
        ) -> Result<HttpResponse, QuoteError> {
            self.seen_headers.lock().extend(
                headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            );
            self.response.clone()
        }
    }

    fn json(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: body.as_bytes().to_vec(),
        }
    }

    const LISTINGS: &str = r#"{"data":[
        {"symbol":"ETH","quote":{"USD":{"price":3000.0}}},
        {"symbol":"BTC","quote":{"USD":{"price":61234.5}}}
    ]}"#;

    #[test]
    fn test_parse_listings_picks_symbol() {
        assert_eq!(parse_listings(&json(LISTINGS), "BTC", "USD"), Ok(61234.5));
        assert_eq!(parse_listings(&json(LISTINGS), "eth", "USD"), Ok(3000.0));
    }

    #[test]
    fn test_missing_symbol_is_invalid_response() {
        assert!(matches!(
            parse_listings(&json(LISTINGS), "DOGE", "USD"),
            Err(QuoteError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_listings(&json(LISTINGS), "BTC", "EUR"),
            Err(QuoteError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_non_success_status() {
        let mut response = json(LISTINGS);
        response.status = 429;
        assert!(matches!(
            parse_listings(&response, "BTC", "USD"),
            Err(QuoteError::InvalidResponse(msg)) if msg.contains("429")
        ));
    }

    #[test]
    fn test_wrong_content_type() {
        let mut response = json(LISTINGS);
        response.content_type = Some("text/html".to_string());
        assert!(matches!(
            parse_listings(&response, "BTC", "USD"),
            Err(QuoteError::InvalidResponse(_))
        ));

        response.content_type = None;
        assert!(parse_listings(&response, "BTC", "USD").is_err());
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(
            parse_listings(&json("{\"data\": 5}"), "BTC", "USD"),
            Err(QuoteError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_source_sends_api_key() {
        let source = HttpReferenceSource::new(
            MockAsyncHttpClient::new(Ok(json(LISTINGS))),
            "http://example.com/listings",
            "USD",
        )
        .with_api_key("secret");

        assert_eq!(source.fetch_quote("BTC").await, Ok(61234.5));
        let headers = source.client.seen_headers.lock().clone();
        assert!(headers.contains(&(API_KEY_HEADER.to_string(), "secret".to_string())));
        assert!(headers.contains(&("Accept".to_string(), "application/json".to_string())));
    }

    #[tokio::test]
    async fn test_source_propagates_network_error() {
        let source = HttpReferenceSource::new(
            MockAsyncHttpClient::new(Err(QuoteError::Network("refused".into()))),
            "http://example.com/listings",
            "USD",
        );
        assert!(matches!(
            source.fetch_quote("BTC").await,
            Err(QuoteError::Network(_))
        ));
    }

    #[test]
    fn test_api_key_from_unset_env() {
        let source = HttpReferenceSource::new(
            MockAsyncHttpClient::new(Ok(json(LISTINGS))),
            "http://example.com",
            "USD",
        )
        .with_api_key_from_env("BEACONFIX_TEST_UNSET_API_KEY_VAR");
        assert!(source.api_key.is_none());
    }
}
