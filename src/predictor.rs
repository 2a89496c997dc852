// src/predictor.rs
//! Naive next-price estimates.
//!
//! Short term regresses the close on SMA(30), SMA(100) and RSI(14) over the
//! whole training window and evaluates the fit at the latest indicator row.
//! Long term fits ARIMA(5,1,0) to the daily price changes of the last five
//! years and integrates a 30-step forecast onto the last close.

use crate::gateway::{GatewayError, QuoteGateway};
use crate::models::PricePoint;
use chrono::NaiveDate;
use log::debug;
use nalgebra::{DMatrix, DVector};
use std::str::FromStr;
use std::sync::Arc;
use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use ta::Next;
use thiserror::Error;

const SMA_SHORT: usize = 30;
const SMA_LONG: usize = 100;
const RSI_PERIOD: usize = 14;
const AR_LAGS: usize = 5;
const LONG_TERM_PERIOD: &str = "5y";
pub const FORECAST_STEPS: usize = 30;

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Invalid term specified")]
    InvalidTerm,
    #[error("Insufficient data")]
    InsufficientData,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("model fit failed: {0}")]
    Model(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    ShortTerm,
    LongTerm,
}

impl FromStr for Term {
    type Err = PredictionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_term" => Ok(Term::ShortTerm),
            "long_term" => Ok(Term::LongTerm),
            _ => Err(PredictionError::InvalidTerm),
        }
    }
}

pub struct Predictor {
    gateway: Arc<QuoteGateway>,
    history_start: NaiveDate,
}

impl Predictor {
    pub fn new(gateway: Arc<QuoteGateway>, history_start: NaiveDate) -> Self {
        Predictor {
            gateway,
            history_start,
        }
    }

    pub async fn predict(&self, symbol: &str, term: &str) -> Result<f64, PredictionError> {
        let term: Term = term.parse()?;

        let history = self
            .gateway
            .history_since(symbol, self.history_start)
            .await?;
        if history.len() < 2 {
            return Err(PredictionError::InsufficientData);
        }

        let prediction = match term {
            Term::ShortTerm => short_term(&history)?,
            Term::LongTerm => {
                let recent = self.gateway.history(symbol, LONG_TERM_PERIOD).await?;
                let closes: Vec<f64> = recent.iter().map(|p| p.close).collect();
                long_term(&closes, FORECAST_STEPS)?
            }
        };
        debug!("{} {:?} prediction: {}", symbol, term, prediction);
        Ok(prediction)
    }
}

/// RSI with Wilder's smoothing (alpha = 1/n), seeded at zero gain and loss.
///
/// `ta`'s own RSI uses an EMA of k = 2 / (n + 1) and a non-zero seed, so the
/// averages are built from two EMAs of period 2n - 1 instead.
struct WilderRsi {
    gains: ExponentialMovingAverage,
    losses: ExponentialMovingAverage,
    prev: Option<f64>,
}

impl WilderRsi {
    fn new(period: usize) -> Result<Self, ta::errors::TaError> {
        let smoothing = (2 * period).saturating_sub(1);
        Ok(WilderRsi {
            gains: ExponentialMovingAverage::new(smoothing)?,
            losses: ExponentialMovingAverage::new(smoothing)?,
            prev: None,
        })
    }
}

impl Next<f64> for WilderRsi {
    type Output = f64;

    fn next(&mut self, close: f64) -> f64 {
        let change = self.prev.map_or(0.0, |prev| close - prev);
        self.prev = Some(close);
        let gain = self.gains.next(change.max(0.0));
        let loss = self.losses.next((-change).max(0.0));
        if gain + loss == 0.0 {
            50.0
        } else {
            100.0 * gain / (gain + loss)
        }
    }
}

struct IndicatorRow {
    sma_short: f64,
    sma_long: f64,
    rsi: f64,
    close: f64,
}

/// Rows where every indicator is past its warm-up window.
fn indicator_rows(history: &[PricePoint]) -> Result<Vec<IndicatorRow>, PredictionError> {
    let model = |e: ta::errors::TaError| PredictionError::Model(e.to_string());
    let mut sma_short = SimpleMovingAverage::new(SMA_SHORT).map_err(model)?;
    let mut sma_long = SimpleMovingAverage::new(SMA_LONG).map_err(model)?;
    let mut rsi = WilderRsi::new(RSI_PERIOD).map_err(model)?;
    let warm_up = (SMA_SHORT - 1).max(SMA_LONG - 1).max(RSI_PERIOD);

    let mut rows = Vec::new();
    for (i, point) in history.iter().enumerate() {
        let row = IndicatorRow {
            sma_short: sma_short.next(point.close),
            sma_long: sma_long.next(point.close),
            rsi: rsi.next(point.close),
            close: point.close,
        };
        if i >= warm_up {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Ordinary least squares. Rank-deficient designs get the minimum-norm
/// solution, with the same singular-value cutoff numpy's `lstsq` uses.
fn least_squares(
    design: DMatrix<f64>,
    target: DVector<f64>,
) -> Result<DVector<f64>, PredictionError> {
    if design.iter().all(|v| *v == 0.0) {
        return Ok(DVector::zeros(design.ncols()));
    }
    let cutoff = design.nrows().max(design.ncols()) as f64 * f64::EPSILON;
    let svd = design.svd(true, true);
    let eps = svd.singular_values.max() * cutoff;
    svd.solve(&target, eps)
        .map_err(|e| PredictionError::Model(e.to_string()))
}

/// In-sample fitted close at the latest indicator row.
pub fn short_term(history: &[PricePoint]) -> Result<f64, PredictionError> {
    let rows = indicator_rows(history)?;
    let latest = rows.last().ok_or(PredictionError::InsufficientData)?;

    let design = DMatrix::from_fn(rows.len(), 4, |r, c| match c {
        0 => 1.0,
        1 => rows[r].sma_short,
        2 => rows[r].sma_long,
        _ => rows[r].rsi,
    });
    let target = DVector::from_iterator(rows.len(), rows.iter().map(|row| row.close));
    let beta = least_squares(design, target)?;

    Ok(beta[0] + beta[1] * latest.sma_short + beta[2] * latest.sma_long + beta[3] * latest.rsi)
}

fn diff(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Price after `steps` days, from ARIMA(5,1,0) fitted to the daily changes.
pub fn long_term(closes: &[f64], steps: usize) -> Result<f64, PredictionError> {
    let last_close = *closes.last().ok_or(PredictionError::InsufficientData)?;
    let changes = diff(closes);
    let last_change = *changes.last().ok_or(PredictionError::InsufficientData)?;

    // d = 1 on the change series leaves a pure AR(5) on its differences.
    let accel = diff(&changes);
    let samples = accel.len().saturating_sub(AR_LAGS);
    if samples < AR_LAGS {
        return Err(PredictionError::InsufficientData);
    }
    let design = DMatrix::from_fn(samples, AR_LAGS, |r, lag| accel[r + AR_LAGS - 1 - lag]);
    let target = DVector::from_iterator(samples, accel[AR_LAGS..].iter().copied());
    let phi = least_squares(design, target)?;

    let mut recent: Vec<f64> = accel[accel.len() - AR_LAGS..].to_vec();
    let mut change = last_change;
    let mut price = last_close;
    for _ in 0..steps {
        let next: f64 = (0..AR_LAGS)
            .map(|lag| phi[lag] * recent[recent.len() - 1 - lag])
            .sum();
        recent.remove(0);
        recent.push(next);
        change += next;
        price += change;
    }

    if price.is_finite() {
        Ok(price)
    } else {
        Err(PredictionError::Model("forecast diverged".to_string()))
    }
}
