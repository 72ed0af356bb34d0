//! Permissive cross-origin headers stamped on every response

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH,
};
use hyper::{Method, Request, Response, StatusCode};

use crate::config::CorsConfig;
use crate::error::{empty_body, ResponseBody};

/// Precomputed CORS header values
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
}

impl CorsPolicy {
    /// Build the policy from validated configuration
    pub fn from_config(config: &CorsConfig) -> anyhow::Result<Self> {
        Ok(Self {
            allow_origin: HeaderValue::from_str(&config.allow_origin)?,
            allow_methods: HeaderValue::from_str(&config.allow_methods.join(", "))?,
            allow_headers: HeaderValue::from_str(&config.allow_headers.join(", "))?,
        })
    }

    /// Insert the CORS headers, replacing any value already present
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
    }

    /// Every OPTIONS request is answered as a preflight
    pub fn is_preflight<B>(req: &Request<B>) -> bool {
        req.method() == Method::OPTIONS
    }

    pub fn preflight_response(&self) -> Response<ResponseBody> {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(CONTENT_LENGTH, 0)
            .body(empty_body())
            .expect("valid response with StatusCode enum");
        self.apply(response.headers_mut());
        response
    }
}
