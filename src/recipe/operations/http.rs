//! HTTP request operations

use std::time::Duration;

use async_trait::async_trait;

use super::{HttpCall, HttpClient};
use crate::error::AppError;
use crate::recipe::types::HttpMethod;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// [`HttpClient`] backed by a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Self {
        Self::default()
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    async fn request(&self, call: &HttpCall) -> Result<String, AppError> {
        let timeout = Duration::from_secs(call.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let mut req = self
            .client
            .request(method(call.method), &call.url)
            .timeout(timeout);

        for (key, value) in &call.headers {
            req = req.header(key, value);
        }
        if let Some(body) = &call.body {
            req = req.body(body.clone());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AppError::http(format!("HTTP request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AppError::http(format!("Failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(AppError::http(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                text
            )));
        }
        Ok(text)
    }
}
