//! Error responses returned to clients

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{header, Response, StatusCode};
use serde::Serialize;

/// Response body type shared by every handler
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Message reported for every upstream failure
pub const PROXY_ERROR_MESSAGE: &str = "Proxy error";

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("a struct of strings always serializes")
    }
}

/// Wrap bytes in the shared body type
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// The uniform 500 returned when the upstream cannot be reached
pub fn proxy_error_response() -> Response<ResponseBody> {
    let body = ErrorResponse::new(PROXY_ERROR_MESSAGE).to_json();

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text response carrying the canonical reason phrase
pub fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let body = status.canonical_reason().unwrap_or("Error");

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CONTENT_LENGTH, body.len())
        .body(full_body(body))
        .expect("valid response with StatusCode enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(PROXY_ERROR_MESSAGE);
        assert_eq!(error.to_json(), r#"{"error":"Proxy error"}"#);
    }

    #[test]
    fn test_error_response_json_escapes() {
        let error = ErrorResponse::new("bad \"quote\" \\ and\nnewline");
        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();
        assert_eq!(json["error"], "bad \"quote\" \\ and\nnewline");
    }

    #[tokio::test]
    async fn test_proxy_error_response() {
        let response = proxy_error_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "Proxy error" }));
    }

    #[test]
    fn test_status_response() {
        let response = status_response(StatusCode::NOT_FOUND);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "9"
        );
    }
}
