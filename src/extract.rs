//! Extractors whose rejections go through `AppError`, so a body, path or query
//! that does not parse still gets a JSON 400.

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request,
    },
    http::request::Parts,
    Json,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{AppError, FieldErrors};

/// JSON request body.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// Pulls the field name out of serde's "missing field `x`" message.
fn missing_field(detail: &str) -> Option<&str> {
    lazy_static! {
        static ref MISSING_RE: Regex = Regex::new(r"missing field `([^`]+)`").unwrap();
    }
    MISSING_RE
        .captures(detail)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let detail = rejection.body_text();
        debug!(detail = %detail, "request body rejected");
        match &rejection {
            JsonRejection::JsonDataError(_) => {
                let mut errors = FieldErrors::new();
                if let Some(field) = missing_field(&detail) {
                    errors.insert(field.to_string(), vec![format!("{field} is required")]);
                }
                AppError::with_fields("One or more validation errors occurred", errors)
            }
            JsonRejection::MissingJsonContentType(_) => {
                AppError::validation("Expected a JSON body with Content-Type: application/json")
            }
            _ => AppError::validation("Request body is not valid JSON"),
        }
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        debug!(detail = %rejection.body_text(), "path rejected");
        AppError::validation("Invalid path parameter")
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        debug!(detail = %rejection.body_text(), "query rejected");
        AppError::validation("Invalid query parameters")
    }
}
