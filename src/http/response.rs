//! Rendering pipeline results as HTTP responses.

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::error::RequestError;
use crate::pipeline::ResponseAccumulator;

/// Status plus `{code, message, metadata, status}`; `Retry-After` on 429.
pub fn error_response(err: &RequestError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(err.to_body())).into_response();

    if let Some(retry_after) = err.retry_after() {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}

/// Render the accumulated response.
///
/// String bodies with a non-JSON content type are sent as-is; everything
/// else is serialized as JSON.
pub fn pipeline_response(accumulated: &ResponseAccumulator) -> Response {
    let status = StatusCode::from_u16(accumulated.status).unwrap_or(StatusCode::OK);
    let content_type = accumulated.content_type_or_default();

    let body = match &accumulated.body {
        None => None,
        Some(Value::String(text)) if !content_type.contains("json") => Some(Body::from(text.clone())),
        Some(value) => match serde_json::to_vec(value) {
            Ok(bytes) => Some(Body::from(bytes)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize response body");
                return error_response(&RequestError::internal("unserializable response body"));
            }
        },
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &accumulated.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid response header"),
        }
    }

    if let Some(body) = body {
        if let Ok(value) = HeaderValue::try_from(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        *response.body_mut() = body;
    }
    response
}
