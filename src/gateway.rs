// src/gateway.rs
use crate::models::{IndexQuote, PricePoint};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const VALID_PERIODS: &[&str] = &[
    "1d", "5d", "1mo", "3mo", "6mo", "1y", "2y", "5y", "10y", "ytd", "max",
];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Failed to fetch data: HTTP {0}")]
    Status(StatusCode),
    #[error("Malformed provider response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("provider error {code}: {description}")]
    Provider { code: String, description: String },
    #[error("No data found for {0}")]
    NotFound(String),
    #[error("No price data available for {0}")]
    NoData(String),
    #[error("Invalid period '{0}'")]
    InvalidPeriod(String),
    #[error("Invalid provider URL: {0}")]
    Url(String),
}

/// Which slice of daily history to request.
#[derive(Debug, Clone, PartialEq)]
pub enum Window {
    Range(String),
    Since(NaiveDate),
}

/// Provider metadata plus daily bars, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Chart {
    pub meta: Value,
    pub points: Vec<PricePoint>,
}

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn chart(&self, ticker: &str, window: &Window) -> Result<Chart, GatewayError>;
}

#[derive(Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartFault>,
}

#[derive(Deserialize)]
struct ChartFault {
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: Value,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Deserialize, Default)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Yahoo Finance v8 chart endpoint.
pub struct YahooChart {
    client: Client,
    base_url: Url,
    max_retries: u32,
    backoff: Duration,
}

impl YahooChart {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<Self, GatewayError> {
        let base_url = Url::parse(base_url).map_err(|e| GatewayError::Url(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Url(format!("{} cannot be a base", base_url)));
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nse_portfolio/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(YahooChart {
            client,
            base_url,
            max_retries,
            backoff,
        })
    }

    fn url_for(&self, ticker: &str, window: &Window) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .push(ticker);
        {
            let mut query = url.query_pairs_mut();
            match window {
                Window::Range(range) => {
                    query.append_pair("range", range);
                }
                Window::Since(start) => {
                    let period1 = start
                        .and_hms_opt(0, 0, 0)
                        .map(|dt| dt.and_utc().timestamp())
                        .unwrap_or_default();
                    query
                        .append_pair("period1", &period1.to_string())
                        .append_pair("period2", &Utc::now().timestamp().to_string());
                }
            }
            query.append_pair("interval", "1d");
        }
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url) -> Result<ChartEnvelope, GatewayError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        // Unknown symbols come back as 404 with an error payload, so parse before checking.
        if !(status.is_success() || status == StatusCode::NOT_FOUND) {
            return Err(GatewayError::Status(status));
        }
        let body = response.bytes().await?;
        decode_envelope(status, &body)
    }
}

fn decode_envelope(status: StatusCode, body: &[u8]) -> Result<ChartEnvelope, GatewayError> {
    match serde_json::from_slice(body) {
        Ok(envelope) => Ok(envelope),
        Err(_) if status == StatusCode::NOT_FOUND => Err(GatewayError::Status(status)),
        Err(e) => Err(GatewayError::Decode(e)),
    }
}

/// Runs `attempt` once, then up to `max_retries` more times while the error is
/// retryable, sleeping `backoff * n` before the n-th retry.
async fn with_retries<T, F, Fut>(
    label: &str,
    max_retries: u32,
    backoff: Duration,
    mut attempt: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if retries < max_retries && is_retryable(&e) => {
                retries += 1;
                warn!(
                    "Provider request for {} failed ({}), retry {}/{}",
                    label, e, retries, max_retries
                );
                tokio::time::sleep(backoff * retries).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_retryable(err: &GatewayError) -> bool {
    match err {
        GatewayError::Transport(_) => true,
        GatewayError::Status(status) => {
            status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

#[async_trait]
impl MarketData for YahooChart {
    async fn chart(&self, ticker: &str, window: &Window) -> Result<Chart, GatewayError> {
        let url = self.url_for(ticker, window)?;
        debug!("Fetching {}", url);

        let url = &url;
        let envelope = with_retries(ticker, self.max_retries, self.backoff, move || {
            self.fetch_once(url)
        })
        .await?;

        chart_from_envelope(ticker, envelope)
    }
}

fn chart_from_envelope(ticker: &str, envelope: ChartEnvelope) -> Result<Chart, GatewayError> {
    if let Some(fault) = envelope.chart.error {
        if fault.code.eq_ignore_ascii_case("Not Found") {
            return Err(GatewayError::NotFound(ticker.to_string()));
        }
        return Err(GatewayError::Provider {
            code: fault.code,
            description: fault.description,
        });
    }

    let result = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| GatewayError::NotFound(ticker.to_string()))?;

    let series = result.indicators.quote.into_iter().next().unwrap_or_default();
    let at = |column: &Vec<Option<f64>>, i: usize| column.get(i).copied().flatten();

    let points = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let close = at(&series.close, i)?;
            Some(PricePoint {
                timestamp: DateTime::<Utc>::from_timestamp(ts, 0)?,
                open: at(&series.open, i).unwrap_or(close),
                high: at(&series.high, i).unwrap_or(close),
                low: at(&series.low, i).unwrap_or(close),
                close,
                volume: at(&series.volume, i).unwrap_or(0.0) as u64,
            })
        })
        .collect();

    Ok(Chart {
        meta: result.meta,
        points,
    })
}

/// Symbol-level view over a [`MarketData`] source for one exchange.
pub struct QuoteGateway {
    source: Arc<dyn MarketData>,
    suffix: String,
}

impl QuoteGateway {
    pub fn new(source: Arc<dyn MarketData>, suffix: impl Into<String>) -> Self {
        QuoteGateway {
            source,
            suffix: suffix.into(),
        }
    }

    pub fn listing(&self, symbol: &str) -> String {
        format!("{}{}", symbol, self.suffix)
    }

    pub async fn history(
        &self,
        symbol: &str,
        period: &str,
    ) -> Result<Vec<PricePoint>, GatewayError> {
        let window = period_window(period)?;
        let chart = self.source.chart(&self.listing(symbol), &window).await?;
        Ok(chart.points)
    }

    pub async fn history_since(
        &self,
        symbol: &str,
        start: NaiveDate,
    ) -> Result<Vec<PricePoint>, GatewayError> {
        let chart = self
            .source
            .chart(&self.listing(symbol), &Window::Since(start))
            .await?;
        Ok(chart.points)
    }

    /// Latest daily bar for the symbol.
    pub async fn quote(&self, symbol: &str) -> Result<PricePoint, GatewayError> {
        self.history(symbol, "1d")
            .await?
            .pop()
            .ok_or_else(|| GatewayError::NoData(self.listing(symbol)))
    }

    /// Provider metadata and history. Either part missing is a `NotFound`.
    pub async fn stock(
        &self,
        symbol: &str,
        period: &str,
    ) -> Result<(Value, Vec<PricePoint>), GatewayError> {
        let window = period_window(period)?;
        let listing = self.listing(symbol);
        let chart = self.source.chart(&listing, &window).await?;

        let mut info = match chart.meta {
            Value::Object(map) if !map.is_empty() => map,
            _ => return Err(GatewayError::NotFound(listing)),
        };
        if chart.points.is_empty() {
            return Err(GatewayError::NoData(listing));
        }
        if let Some(price) = info.get("regularMarketPrice").cloned() {
            info.entry("currentPrice").or_insert(price);
        }
        Ok((Value::Object(info), chart.points))
    }

    /// Index tickers are queried as-is, without the exchange suffix.
    pub async fn indices(
        &self,
        tickers: &[String],
    ) -> Result<BTreeMap<String, IndexQuote>, GatewayError> {
        let window = Window::Range("2d".to_string());
        let mut quotes = BTreeMap::new();
        for ticker in tickers {
            let chart = self.source.chart(ticker, &window).await?;
            quotes.insert(ticker.clone(), index_quote(&chart.points));
        }
        Ok(quotes)
    }
}

fn period_window(period: &str) -> Result<Window, GatewayError> {
    if VALID_PERIODS.contains(&period) {
        Ok(Window::Range(period.to_string()))
    } else {
        Err(GatewayError::InvalidPeriod(period.to_string()))
    }
}

fn index_quote(points: &[PricePoint]) -> IndexQuote {
    match points {
        [.., previous, latest] => IndexQuote {
            current_price: Some(latest.close),
            change_percent: Some((latest.close - previous.close) / previous.close * 100.0),
        },
        _ => IndexQuote {
            current_price: None,
            change_percent: None,
        },
    }
}
