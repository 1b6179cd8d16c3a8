//! Reference quote source.
//!
//! The distance model needs a "current" value of the quantity a beacon's
//! reading records historically. That value comes from an external
//! [`ReferenceSource`]; the core only ever sees a number or a [`QuoteError`].
//!
//! # Implementations
//!
//! - [`HttpReferenceSource`] - a listings HTTP API (see [`http`])
//! - [`StaticReferenceSource`] - a fixed value, for simulation and tests

pub mod http;

pub use http::{AsyncHttpClient, AsyncReqwestClient, HttpReferenceSource, HttpResponse};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use crate::peripheral::BoxFuture;

/// Errors from fetching or using a reference quote.
///
/// All of them are local to one beacon's contribution to one cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuoteError {
    /// The request could not be completed.
    #[error("network error: {0}")]
    Network(String),

    /// The response was not usable (status, content type, missing symbol).
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A quote or reading the growth model cannot take a logarithm of.
    #[error("invalid quote: current={current}, historical={historical}")]
    InvalidQuote { current: f64, historical: f64 },
}

/// A fetched reference value, paired with the reading it will be compared to.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceQuote {
    /// Symbol the value was quoted for.
    pub symbol: String,
    /// Current value.
    pub value: f64,
    /// Timestamp of the raw reading this quote pairs with.
    pub reading_at: DateTime<Utc>,
}

impl ReferenceQuote {
    pub fn new(symbol: impl Into<String>, value: f64, reading_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            value,
            reading_at,
        }
    }
}

/// External source of current reference values.
pub trait ReferenceSource: Send + Sync {
    /// Fetch the current value for `symbol`.
    fn fetch_quote<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<f64, QuoteError>>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

/// A reference source returning a fixed, adjustable value.
#[derive(Debug)]
pub struct StaticReferenceSource {
    value: RwLock<Result<f64, QuoteError>>,
}

impl StaticReferenceSource {
    /// Always answer `value`.
    pub fn new(value: f64) -> Self {
        Self {
            value: RwLock::new(Ok(value)),
        }
    }

    /// Change the value returned by later fetches.
    pub fn set_value(&self, value: f64) {
        *self.value.write() = Ok(value);
    }

    /// Make later fetches fail with `error`.
    pub fn set_error(&self, error: QuoteError) {
        *self.value.write() = Err(error);
    }
}

impl ReferenceSource for StaticReferenceSource {
    fn fetch_quote<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, Result<f64, QuoteError>> {
        let value = self.value.read().clone();
        Box::pin(async move { value })
    }

    fn name(&self) -> &str {
        "static"
    }
}
