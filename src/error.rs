// src/error.rs
use crate::db::StoreError;
use crate::gateway::GatewayError;
use crate::predictor::PredictionError;
use log::error;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(GatewayError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) | ApiError::Store(_) | ApiError::Gateway(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NotFound(_) | GatewayError::NoData(_) => {
                ApiError::NotFound(e.to_string())
            }
            GatewayError::InvalidPeriod(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Gateway(other),
        }
    }
}

impl From<PredictionError> for ApiError {
    fn from(e: PredictionError) -> Self {
        match e {
            PredictionError::InvalidTerm => ApiError::BadRequest(e.to_string()),
            PredictionError::InsufficientData => ApiError::Unprocessable(e.to_string()),
            PredictionError::Gateway(inner) => inner.into(),
            PredictionError::Model(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl Reject for ApiError {}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status)
}

/// Renders every rejection as `{"error": ...}` with a matching status.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    if let Some(e) = err.find::<ApiError>() {
        let status = e.status();
        if status.is_server_error() {
            error!("Request failed: {}", e);
        }
        return Ok(error_reply(status, &e.to_string()));
    }

    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query string".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Expected a JSON body".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
        )
    } else if err.find::<warp::cors::CorsForbidden>().is_some() {
        (StatusCode::FORBIDDEN, "Origin not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };
    Ok(error_reply(status, &message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_errors_get_their_own_statuses() {
        let invalid: ApiError = PredictionError::InvalidTerm.into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.to_string(), "Invalid term specified");

        let thin: ApiError = PredictionError::InsufficientData.into();
        assert_eq!(thin.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let model: ApiError = PredictionError::Model("singular".to_string()).into();
        assert_eq!(model.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn gateway_not_found_maps_to_404() {
        let e: ApiError = GatewayError::NotFound("TCS.NS".to_string()).into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);

        let e: ApiError = GatewayError::InvalidPeriod("7w".to_string()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);

        let e: ApiError = GatewayError::Status(StatusCode::BAD_GATEWAY).into();
        assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn api_errors_become_rejections_and_render_as_json() {
        let rejection: Rejection = ApiError::Unprocessable("Insufficient data".to_string()).into();
        assert!(rejection.find::<ApiError>().is_some());

        let response = handle_rejection(rejection).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Insufficient data");
    }
}
