// src/error.rs
use log::error;
use scylla::transport::errors::{NewSessionError, QueryError};
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connect failed: {0}")]
    Connect(#[from] NewSessionError),
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    #[error("bad document: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0}")]
    Corrupt(String),
    #[error("document modified concurrently")]
    Contended,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not authorized")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Insufficient balance for this transaction")]
    InsufficientBalance,
    #[error("Server Error")]
    Persistence(#[from] StoreError),
}

impl Reject for ApiError {}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InsufficientBalance => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn reject(err: ApiError) -> Rejection {
    warp::reject::custom(err)
}

/// Maps rejections to the JSON `{"msg": ...}` bodies the client expects.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, msg) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Resource not found".to_string())
    } else if let Some(e) = err.find::<ApiError>() {
        if let ApiError::Persistence(inner) = e {
            error!("Persistence error: {}", inner);
        }
        (e.status(), e.to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Server Error".to_string())
    };

    let body = warp::reply::json(&json!({ "msg": msg }));
    Ok(warp::reply::with_status(body, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::InsufficientBalance.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("Asset").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Persistence(StoreError::Contended).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn not_found_names_the_resource() {
        assert_eq!(ApiError::NotFound("Asset").to_string(), "Asset not found");
    }
}
