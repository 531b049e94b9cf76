// src/server/response.rs

//! Response envelope, pagination and error mapping
//!
//! Every endpoint answers `{status: "ok"|"error", data?, message?}`;
//! paginated lists add `page`, `size` and `count`, cursor-paginated lists add
//! `cursor`.

use crate::error::Error;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Page size used when the client does not ask for one
pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl Envelope {
    fn empty(status: &'static str) -> Self {
        Self {
            status,
            data: None,
            message: None,
            page: None,
            size: None,
            count: None,
            cursor: None,
        }
    }

    /// `data` is always present on success, `null` included
    pub fn ok<T: Serialize>(data: T) -> ApiResult<Json<Self>> {
        let data = serde_json::to_value(data).map_err(Error::from)?;
        Ok(Json(Self {
            data: Some(data),
            ..Self::empty("ok")
        }))
    }

    pub fn message(message: impl Into<String>) -> ApiResult<Json<Self>> {
        Ok(Json(Self {
            message: Some(message.into()),
            ..Self::empty("ok")
        }))
    }

    pub fn paginated<T: Serialize>(data: T, params: &PageParams, count: i64) -> ApiResult<Json<Self>> {
        let data = serde_json::to_value(data).map_err(Error::from)?;
        Ok(Json(Self {
            data: Some(data),
            page: Some(params.page()),
            size: Some(params.size()),
            count: Some(count),
            ..Self::empty("ok")
        }))
    }

    pub fn with_cursor<T: Serialize>(data: T, count: i64, cursor: Option<Cursor>) -> ApiResult<Json<Self>> {
        let data = serde_json::to_value(data).map_err(Error::from)?;
        let cursor = cursor.map(|c| c.encode()).transpose()?;
        Ok(Json(Self {
            data: Some(data),
            count: Some(count),
            cursor,
            ..Self::empty("ok")
        }))
    }
}

/// `?page=&size=` query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

impl PageParams {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn size(&self) -> i64 {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn window(&self) -> crate::db::models::Page {
        crate::db::models::Page::new(self.page(), self.size())
    }
}

/// Opaque position in an id-ordered listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_id: i64,
}

impl Cursor {
    pub fn encode(&self) -> crate::error::Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(text: &str) -> crate::error::Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_| Error::Validation("invalid cursor".into()))?;
        serde_json::from_slice(&bytes).map_err(|_| Error::Validation("invalid cursor".into()))
    }
}

/// Split a comma-separated query value (`sort_by=name,version`)
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Domain error rendered as an error envelope
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::Storage(_) | Error::BuildPath(_) => StatusCode::BAD_REQUEST,
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            Error::Authorization(_) => "not authorized".to_string(),
            err if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!("Request failed: {}", err);
                "internal server error".to_string()
            }
            err => err.to_string(),
        };
        let body = Envelope {
            message: Some(message),
            ..Envelope::empty("error")
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
