// src/api.rs
use crate::auth::{hash_password, verify_password};
use crate::db::UserStore;
use crate::error::{handle_rejection, ApiError};
use crate::gateway::QuoteGateway;
use crate::models::{
    required, LoginRequest, PortfolioEntry, PortfolioQuery, PredictRequest, StockQuery,
    StockRequest, UserRecord,
};
use crate::predictor::Predictor;
use log::{error, info, warn};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

const DEFAULT_PERIOD: &str = "1y";
const RANKED_ENTRIES: usize = 5;

pub fn routes(
    store: Arc<dyn UserStore>,
    gateway: Arc<QuoteGateway>,
    predictor: Arc<Predictor>,
    index_tickers: Arc<Vec<String>>,
    cors_origins: &[String],
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let indices = warp::path("stock_indices")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and(warp::any().map(move || index_tickers.clone()))
        .and_then(stock_indices_handler);

    let predict = warp::path("predict")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_predictor(predictor.clone()))
        .and(warp::body::json())
        .and_then(predict_handler);

    let register = warp::path("submit-form")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_store(store.clone()))
        .and(warp::body::bytes())
        .and_then(submit_form_handler);

    let login = warp::path!("api" / "login")
        .and(warp::post())
        .and(with_store(store.clone()))
        .and(warp::body::json())
        .and_then(login_handler);

    let stock = warp::path!("api" / "stock" / String)
        .and(warp::get())
        .and(optional_query::<StockQuery>())
        .and(with_gateway(gateway.clone()))
        .and_then(stock_handler);

    let portfolio = warp::path("user-portfolio")
        .and(warp::path::end())
        .and(warp::get())
        .and(optional_query::<PortfolioQuery>())
        .and(with_store(store.clone()))
        .and(with_gateway(gateway))
        .and(with_predictor(predictor))
        .and_then(user_portfolio_handler);

    let add = warp::path("add-stock")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_store(store.clone()))
        .and(warp::body::json())
        .and_then(add_stock_handler);

    let delete = warp::path("delete-stock")
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_store(store))
        .and(warp::body::json())
        .and_then(delete_stock_handler);

    indices
        .or(predict)
        .or(register)
        .or(login)
        .or(stock)
        .or(portfolio)
        .or(add)
        .or(delete)
        .recover(handle_rejection)
        .with(cors(cors_origins))
        .with(warp::log("nse_portfolio::api"))
        // Disallowed origins and bad preflights are rejected by the CORS layer itself.
        .recover(handle_rejection)
}

fn cors(origins: &[String]) -> warp::cors::Builder {
    let builder = warp::cors()
        .allow_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
        .allow_headers(vec!["content-type"]);
    if origins.is_empty() {
        builder.allow_any_origin()
    } else {
        builder.allow_origins(origins.iter().map(String::as_str))
    }
}

fn with_store(
    store: Arc<dyn UserStore>,
) -> impl Filter<Extract = (Arc<dyn UserStore>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

fn with_gateway(
    gateway: Arc<QuoteGateway>,
) -> impl Filter<Extract = (Arc<QuoteGateway>,), Error = Infallible> + Clone {
    warp::any().map(move || gateway.clone())
}

fn with_predictor(
    predictor: Arc<Predictor>,
) -> impl Filter<Extract = (Arc<Predictor>,), Error = Infallible> + Clone {
    warp::any().map(move || predictor.clone())
}

/// Like `warp::query`, but a request without a query string yields `T::default()`.
fn optional_query<T>() -> impl Filter<Extract = (T,), Error = Infallible> + Clone
where
    T: DeserializeOwned + Default + Send + 'static,
{
    warp::query::<T>()
        .or(warp::any().map(T::default))
        .unify()
}

fn json_reply(body: &Value, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(body), status)
}

async fn stock_indices_handler(
    gateway: Arc<QuoteGateway>,
    tickers: Arc<Vec<String>>,
) -> Result<impl Reply, Rejection> {
    let quotes = gateway.indices(&tickers).await.map_err(ApiError::from)?;
    info!("Index quotes retrieved for {} tickers.", quotes.len());
    Ok(warp::reply::json(&quotes))
}

async fn predict_handler(
    predictor: Arc<Predictor>,
    body: PredictRequest,
) -> Result<impl Reply, Rejection> {
    let (symbol, term) = match (required(&body.stock_symbol), required(&body.term)) {
        (Some(symbol), Some(term)) => (symbol, term),
        _ => {
            return Err(ApiError::BadRequest(
                "Stock symbol or term not provided".to_string(),
            )
            .into())
        }
    };

    match predictor.predict(symbol, term).await {
        Ok(prediction) => {
            info!("Predicted {} for {} ({}).", prediction, symbol, term);
            Ok(warp::reply::json(&json!({ "prediction": prediction })))
        }
        Err(e) => {
            warn!("Prediction for {} ({}) failed: {}", symbol, term, e);
            Err(ApiError::from(e).into())
        }
    }
}

async fn submit_form_handler(
    store: Arc<dyn UserStore>,
    body: Bytes,
) -> Result<impl Reply, Rejection> {
    let mut form: Map<String, Value> = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?
    };
    if form.is_empty() {
        return Err(ApiError::BadRequest("No data provided".to_string()).into());
    }

    let mut take_text = |key: &str| -> Option<String> {
        match form.remove(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    };
    let email = take_text("email").map(|e| e.trim().to_string());
    let first_name = take_text("firstName");
    let password = take_text("password");
    let profile_picture = take_text("profilePicture");
    form.remove("stocks");

    let (email, first_name, password) = match (email, first_name, password) {
        (Some(e), Some(f), Some(p)) => (e, f, p),
        _ => {
            return Err(ApiError::BadRequest(
                "Email, first name and password are required".to_string(),
            )
            .into())
        }
    };

    let already_registered = || {
        info!("Registration for {} refused: already registered.", email);
        json_reply(
            &json!({
                "error": "User already registered\nPlease Login",
                "redirect_url": "/login",
            }),
            StatusCode::OK,
        )
    };

    if store
        .find_user(&email)
        .await
        .map_err(ApiError::from)?
        .is_some()
    {
        return Ok(already_registered());
    }

    let password_hash = hash_password(&password).map_err(|e| {
        error!("Failed to hash password: {}", e);
        ApiError::Internal("Failed to store data".to_string())
    })?;
    let record = UserRecord {
        email: email.clone(),
        first_name,
        password_hash,
        profile_picture,
        profile: form,
        stocks: Vec::new(),
    };

    match store.insert_user(record).await {
        Ok(true) => {
            info!("Registered {}.", email);
            Ok(json_reply(
                &json!({ "message": "Data stored successfully" }),
                StatusCode::OK,
            ))
        }
        Ok(false) => Ok(already_registered()),
        Err(e) => {
            error!("Failed to store registration for {}: {}", email, e);
            Err(ApiError::Internal("Failed to store data".to_string()).into())
        }
    }
}

async fn login_handler(
    store: Arc<dyn UserStore>,
    body: LoginRequest,
) -> Result<impl Reply, Rejection> {
    let (email, password) = match (required(&body.email), body.password.as_deref()) {
        (Some(email), Some(password)) if !password.is_empty() => (email, password),
        _ => {
            return Err(ApiError::BadRequest("Email or password not provided".to_string()).into())
        }
    };

    let user = match store.find_user(email).await.map_err(ApiError::from)? {
        Some(user) => user,
        None => {
            info!("Login for unknown user {}.", email);
            return Ok(json_reply(
                &json!({ "message": "User not found" }),
                StatusCode::NOT_FOUND,
            ));
        }
    };

    if !verify_password(password, &user.password_hash) {
        info!("Login for {} rejected: wrong password.", email);
        return Ok(json_reply(
            &json!({ "message": "Invalid password" }),
            StatusCode::UNAUTHORIZED,
        ));
    }

    info!("Login successful for {}.", email);
    Ok(json_reply(
        &json!({
            "message": "Login successful",
            "name": user.first_name,
            "email": user.email,
            "profilePicture": user.profile_picture.unwrap_or_default(),
        }),
        StatusCode::OK,
    ))
}

async fn stock_handler(
    symbol: String,
    query: StockQuery,
    gateway: Arc<QuoteGateway>,
) -> Result<impl Reply, Rejection> {
    // warp hands path params over still percent-encoded ("M%26M" for M&M).
    let symbol = percent_decode_str(&symbol)
        .decode_utf8()
        .map_err(|_| ApiError::BadRequest("Invalid stock symbol".to_string()))?;
    let symbol = symbol.trim();
    let period = required(&query.period).unwrap_or(DEFAULT_PERIOD);
    match gateway.stock(symbol, period).await {
        Ok((info, history)) => {
            info!("Stock data for {} ({} rows).", symbol, history.len());
            Ok(warp::reply::json(&json!({
                "stock_info": info,
                "stock_history": history,
            })))
        }
        Err(e) => {
            error!("Failed to fetch stock data for {}: {}", symbol, e);
            Err(ApiError::from(e).into())
        }
    }
}

async fn user_portfolio_handler(
    query: PortfolioQuery,
    store: Arc<dyn UserStore>,
    gateway: Arc<QuoteGateway>,
    predictor: Arc<Predictor>,
) -> Result<impl Reply, Rejection> {
    let email = required(&query.email)
        .ok_or_else(|| ApiError::BadRequest("Email not provided".to_string()))?;
    let user = store
        .find_user(email)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let mut portfolio = Vec::with_capacity(user.stocks.len());
    for symbol in &user.stocks {
        match portfolio_entry(&gateway, &predictor, symbol).await {
            Ok(entry) => portfolio.push(entry),
            Err(e) => warn!("Error fetching data for {}: {}", symbol, e),
        }
    }

    let mut gainers = portfolio.clone();
    gainers.sort_by(|a, b| b.spread().total_cmp(&a.spread()));
    gainers.truncate(RANKED_ENTRIES);

    let mut losers = portfolio.clone();
    losers.sort_by(|a, b| a.spread().total_cmp(&b.spread()));
    losers.truncate(RANKED_ENTRIES);

    info!(
        "Portfolio for {}: {} of {} symbols priced.",
        email,
        portfolio.len(),
        user.stocks.len()
    );
    Ok(warp::reply::json(&json!({
        "portfolio": portfolio,
        "topGainers": gainers,
        "topLosers": losers,
    })))
}

async fn portfolio_entry(
    gateway: &QuoteGateway,
    predictor: &Predictor,
    symbol: &str,
) -> Result<PortfolioEntry, ApiError> {
    let quote = gateway.quote(symbol).await?;
    let short_term = predictor.predict(symbol, "short_term").await?;
    let long_term = predictor.predict(symbol, "long_term").await?;
    Ok(PortfolioEntry {
        name: symbol.to_string(),
        current_price: quote.close,
        predicted_short_term_price: short_term,
        predicted_long_term_price: long_term,
    })
}

fn stock_request(body: &StockRequest) -> Result<(&str, &str), ApiError> {
    match (required(&body.email), required(&body.stock_symbol)) {
        (Some(email), Some(symbol)) => Ok((email, symbol)),
        _ => Err(ApiError::BadRequest(
            "Email or stock symbol not provided".to_string(),
        )),
    }
}

async fn add_stock_handler(
    store: Arc<dyn UserStore>,
    body: StockRequest,
) -> Result<impl Reply, Rejection> {
    let (email, symbol) = stock_request(&body)?;
    let user = store
        .find_user(email)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    if user.tracks(symbol) {
        return Ok(warp::reply::json(
            &json!({ "message": "Stock already in portfolio" }),
        ));
    }

    let added = store
        .add_symbol(email, symbol)
        .await
        .map_err(ApiError::from)?;
    let message = if added {
        info!("Added {} to portfolio of {}.", symbol, email);
        "Stock added to portfolio"
    } else {
        "Stock already in portfolio"
    };
    Ok(warp::reply::json(&json!({ "message": message })))
}

async fn delete_stock_handler(
    store: Arc<dyn UserStore>,
    body: StockRequest,
) -> Result<impl Reply, Rejection> {
    let (email, symbol) = stock_request(&body)?;
    let user = store
        .find_user(email)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    if !user.tracks(symbol) {
        return Err(ApiError::NotFound("Stock not found in portfolio".to_string()).into());
    }

    match store.remove_symbol(email, symbol).await {
        Ok(true) => {
            info!("Removed {} from portfolio of {}.", symbol, email);
            Ok(warp::reply::json(
                &json!({ "message": "Stock removed from portfolio" }),
            ))
        }
        Ok(false) => Err(ApiError::Internal("Failed to remove stock".to_string()).into()),
        Err(e) => {
            error!("Failed to remove {} for {}: {}", symbol, email, e);
            Err(ApiError::Internal("Failed to remove stock".to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::gateway::testing::FakeMarket;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    struct Harness<F> {
        store: Arc<MemoryStore>,
        app: F,
    }

    fn harness(
        market: FakeMarket,
    ) -> Harness<impl Filter<Extract = impl Reply, Error = Infallible> + Clone + 'static> {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(QuoteGateway::new(Arc::new(market), ".NS"));
        let predictor = Arc::new(Predictor::new(
            gateway.clone(),
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        ));
        let tickers = Arc::new(vec!["^NSEI".to_string(), "^NSEBANK".to_string()]);
        let app = routes(store.clone(), gateway, predictor, tickers, &[]);
        Harness { store, app }
    }

    async fn seed_user(store: &MemoryStore, email: &str, password: &str, stocks: &[&str]) {
        let record = UserRecord {
            email: email.to_string(),
            first_name: "Asha".to_string(),
            password_hash: hash_password(password).unwrap(),
            profile_picture: Some("asha.png".to_string()),
            profile: Map::new(),
            stocks: stocks.iter().map(|s| s.to_string()).collect(),
        };
        assert!(store.insert_user(record).await.unwrap());
    }

    async fn send<F>(app: &F, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value)
    where
        F: Filter + 'static,
        F::Extract: Reply + Send,
    {
        let mut request = warp::test::request().method(method).path(path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.reply(app).await;
        let json = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
        (response.status(), json)
    }

    fn linear(start: f64, slope: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start + slope * i as f64).collect()
    }

    #[tokio::test]
    async fn stock_indices_null_out_thin_tickers() {
        let h = harness(
            FakeMarket::default()
                .with_closes("^NSEI", &[100.0, 102.0])
                .with_closes("^NSEBANK", &[50.0]),
        );
        let (status, body) = send(&h.app, "GET", "/stock_indices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_relative_eq!(body["^NSEI"]["current_price"].as_f64().unwrap(), 102.0);
        assert_relative_eq!(body["^NSEI"]["change_percent"].as_f64().unwrap(), 2.0);
        assert!(body["^NSEBANK"]["current_price"].is_null());
        assert!(body["^NSEBANK"]["change_percent"].is_null());
    }

    #[tokio::test]
    async fn predict_invalid_term_regardless_of_symbol() {
        let h = harness(FakeMarket::default().with_closes("TCS.NS", &linear(100.0, 1.0, 160)));
        for symbol in ["TCS", "DOES_NOT_EXIST"] {
            let (status, body) = send(
                &h.app,
                "POST",
                "/predict",
                Some(json!({ "stock_symbol": symbol, "term": "mid_term" })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "Invalid term specified");
        }
    }

    #[tokio::test]
    async fn predict_returns_number() {
        let h = harness(FakeMarket::default().with_closes("TCS.NS", &linear(100.0, 1.0, 160)));
        let (status, body) = send(
            &h.app,
            "POST",
            "/predict",
            Some(json!({ "stock_symbol": "TCS", "term": "short_term" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_relative_eq!(body["prediction"].as_f64().unwrap(), 259.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn predict_reports_thin_history_separately() {
        let h = harness(FakeMarket::default().with_closes("TCS.NS", &[3500.0]));
        let (status, body) = send(
            &h.app,
            "POST",
            "/predict",
            Some(json!({ "stock_symbol": "TCS", "term": "long_term" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "Insufficient data");

        let (status, _) = send(&h.app, "POST", "/predict", Some(json!({ "term": "long_term" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_form_registers_once() {
        let h = harness(FakeMarket::default());
        let form = json!({
            "email": "a@x.com",
            "firstName": "Asha",
            "password": "pw",
            "city": "Pune",
        });

        let (status, body) = send(&h.app, "POST", "/submit-form", Some(form.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Data stored successfully");

        let stored = h.store.find_user("a@x.com").await.unwrap().unwrap();
        assert_ne!(stored.password_hash, "pw");
        assert!(stored.stocks.is_empty());
        assert_eq!(stored.profile["city"], "Pune");

        let mut second = form;
        second["firstName"] = json!("Impostor");
        let (status, body) = send(&h.app, "POST", "/submit-form", Some(second)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "User already registered\nPlease Login");
        assert_eq!(body["redirect_url"], "/login");

        let stored = h.store.find_user("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored.first_name, "Asha");
    }

    #[tokio::test]
    async fn submit_form_rejects_empty_body() {
        let h = harness(FakeMarket::default());
        let (status, body) = send(&h.app, "POST", "/submit-form", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No data provided");

        let (status, _) = send(&h.app, "POST", "/submit-form", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &h.app,
            "POST",
            "/submit-form",
            Some(json!({ "email": "a@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_distinguishes_unknown_user_and_wrong_password() {
        let h = harness(FakeMarket::default());
        seed_user(&h.store, "a@x.com", "correct horse", &[]).await;

        let (status, body) = send(
            &h.app,
            "POST",
            "/api/login",
            Some(json!({ "email": "a@x.com", "password": "correct horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Login successful");
        assert_eq!(body["name"], "Asha");
        assert_eq!(body["email"], "a@x.com");
        assert_eq!(body["profilePicture"], "asha.png");

        let (status, body) = send(
            &h.app,
            "POST",
            "/api/login",
            Some(json!({ "email": "a@x.com", "password": "battery staple" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid password");

        let (status, body) = send(
            &h.app,
            "POST",
            "/api/login",
            Some(json!({ "email": "b@x.com", "password": "correct horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "User not found");
    }

    #[tokio::test]
    async fn add_stock_is_idempotent() {
        let h = harness(FakeMarket::default());
        seed_user(&h.store, "a@x.com", "pw", &["TCS"]).await;

        let (status, body) = send(
            &h.app,
            "POST",
            "/add-stock",
            Some(json!({ "email": "a@x.com", "stock_symbol": "TCS" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Stock already in portfolio");

        for _ in 0..2 {
            let (status, _) = send(
                &h.app,
                "POST",
                "/add-stock",
                Some(json!({ "email": "a@x.com", "stock_symbol": "INFY" })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let stored = h.store.find_user("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored.stocks, vec!["TCS", "INFY"]);
    }

    #[tokio::test]
    async fn add_stock_validates_input_and_user() {
        let h = harness(FakeMarket::default());
        let (status, _) = send(
            &h.app,
            "POST",
            "/add-stock",
            Some(json!({ "email": "a@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &h.app,
            "POST",
            "/add-stock",
            Some(json!({ "email": "ghost@x.com", "stock_symbol": "TCS" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "User not found");
    }

    #[tokio::test]
    async fn delete_stock_missing_symbol_leaves_list() {
        let h = harness(FakeMarket::default());
        seed_user(&h.store, "a@x.com", "pw", &["TCS", "INFY"]).await;

        let (status, body) = send(
            &h.app,
            "DELETE",
            "/delete-stock",
            Some(json!({ "email": "a@x.com", "stock_symbol": "WIPRO" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Stock not found in portfolio");
        let stored = h.store.find_user("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored.stocks, vec!["TCS", "INFY"]);

        let (status, body) = send(
            &h.app,
            "DELETE",
            "/delete-stock",
            Some(json!({ "email": "a@x.com", "stock_symbol": "TCS" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Stock removed from portfolio");
        let stored = h.store.find_user("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored.stocks, vec!["INFY"]);

        let (status, _) = send(
            &h.app,
            "DELETE",
            "/delete-stock",
            Some(json!({ "email": "ghost@x.com", "stock_symbol": "TCS" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&h.app, "DELETE", "/delete-stock", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stock_endpoint_defaults_period_and_maps_errors() {
        let h = harness(FakeMarket::default().with_closes("TCS.NS", &[10.0, 11.0, 12.0]));

        let (status, body) = send(&h.app, "GET", "/api/stock/TCS", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stock_info"]["currentPrice"], 12.0);
        let history = body["stock_history"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2]["Close"], 12.0);
        assert!(history[0]["Date"].is_string());

        let (status, _) = send(&h.app, "GET", "/api/stock/TCS?period=5d", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&h.app, "GET", "/api/stock/TCS?period=forever", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&h.app, "GET", "/api/stock/NOPE", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn stock_symbol_in_path_is_percent_decoded() {
        let h = harness(FakeMarket::default().with_closes("M&M.NS", &[1500.0, 1512.5]));

        let (status, body) = send(&h.app, "GET", "/api/stock/M%26M", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stock_info"]["symbol"], "M&M.NS");
        assert_eq!(body["stock_info"]["currentPrice"], 1512.5);

        let (status, _) = send(&h.app, "GET", "/api/stock/%FF", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn error_responses_carry_cors_headers() {
        let h = harness(FakeMarket::default());
        let response = warp::test::request()
            .method("POST")
            .path("/add-stock")
            .header("origin", "http://localhost:3000")
            .json(&json!({ "email": "ghost@x.com", "stock_symbol": "TCS" }))
            .reply(&h.app)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );

        let response = warp::test::request()
            .method("GET")
            .path("/nowhere")
            .header("origin", "http://localhost:3000")
            .reply(&h.app)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn disallowed_origin_is_forbidden() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(QuoteGateway::new(Arc::new(FakeMarket::default()), ".NS"));
        let predictor = Arc::new(Predictor::new(
            gateway.clone(),
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        ));
        let app = routes(
            store,
            gateway,
            predictor,
            Arc::new(Vec::new()),
            &["http://localhost:3000".to_string()],
        );

        let response = warp::test::request()
            .method("GET")
            .path("/stock_indices")
            .header("origin", "http://evil.example")
            .reply(&app)
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn portfolio_skips_symbols_that_fail() {
        let h = harness(
            FakeMarket::default()
                .with_closes("TCS.NS", &linear(100.0, 1.0, 160))
                .with_closes("INFY.NS", &linear(1500.0, 2.0, 160)),
        );
        seed_user(&h.store, "a@x.com", "pw", &["TCS", "NOPE", "INFY"]).await;

        let (status, body) = send(&h.app, "GET", "/user-portfolio?email=a@x.com", None).await;
        assert_eq!(status, StatusCode::OK);

        let portfolio = body["portfolio"].as_array().unwrap();
        let names: Vec<&str> = portfolio.iter().filter_map(|e| e["name"].as_str()).collect();
        assert_eq!(names, vec!["TCS", "INFY"]);
        assert_relative_eq!(portfolio[0]["currentPrice"].as_f64().unwrap(), 259.0);
        assert!(portfolio[0]["predictedShortTermPrice"].is_number());
        assert!(portfolio[0]["predictedLongTermPrice"].is_number());
        assert_eq!(body["topGainers"].as_array().unwrap().len(), 2);
        assert_eq!(body["topLosers"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn portfolio_requires_known_email() {
        let h = harness(FakeMarket::default());
        let (status, body) = send(&h.app, "GET", "/user-portfolio", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Email not provided");

        let (status, _) = send(&h.app, "GET", "/user-portfolio?email=ghost@x.com", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let h = harness(FakeMarket::default());
        let response = warp::test::request()
            .method("POST")
            .path("/add-stock")
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&h.app)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let h = harness(FakeMarket::default());
        let (status, body) = send(&h.app, "GET", "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }
}
