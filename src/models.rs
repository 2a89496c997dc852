// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A registered user and the symbols they track.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub email: String,
    pub first_name: String,
    pub password_hash: String,
    pub profile_picture: Option<String>,
    /// Registration fields we don't model explicitly.
    pub profile: Map<String, Value>,
    pub stocks: Vec<String>,
}

impl UserRecord {
    pub fn tracks(&self, symbol: &str) -> bool {
        self.stocks.iter().any(|s| s == symbol)
    }
}

/// One daily bar as reported by the market-data provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PricePoint {
    #[serde(rename = "Date")]
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexQuote {
    pub current_price: Option<f64>,
    pub change_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioEntry {
    pub name: String,
    pub current_price: f64,
    pub predicted_short_term_price: f64,
    pub predicted_long_term_price: f64,
}

impl PortfolioEntry {
    /// Current price minus the short-term estimate; ranks gainers and losers.
    pub fn spread(&self) -> f64 {
        self.current_price - self.predicted_short_term_price
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub stock_symbol: Option<String>,
    pub term: Option<String>,
}

/// Body shared by `/add-stock` and `/delete-stock`.
#[derive(Debug, Deserialize)]
pub struct StockRequest {
    pub email: Option<String>,
    pub stock_symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StockQuery {
    pub period: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortfolioQuery {
    pub email: Option<String>,
}

/// Returns the trimmed value when the field is present and non-blank.
pub fn required(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
