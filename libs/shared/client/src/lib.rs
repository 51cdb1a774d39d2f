use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// JSON-over-HTTP client for one collaborator service.
///
/// Every request carries the timeout the client was built with, so a slow
/// collaborator surfaces as an error instead of holding the caller.
pub struct ServiceClient {
    client: Client,
    base_url: String,
    service: &'static str,
}

impl ServiceClient {
    pub fn new(service: &'static str, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("Failed to build HTTP client for {} service", service))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
        })
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    fn get_headers(&self, idempotency_key: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(key) = idempotency_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| anyhow!("Invalid idempotency key {:?}: {}", key, e))?;
            headers.insert(IDEMPOTENCY_KEY, value);
        }

        Ok(headers)
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.send(method, path, body, idempotency_key)
            .await?
            .ok_or_else(|| anyhow!("{} service: resource not found at {}", self.service, path))
    }

    /// Like `request`, but a 404 from the collaborator is a valid answer rather than an error.
    pub async fn get_optional<T>(&self, path: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.send(Method::GET, path, None, None).await
    }

    async fn send<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {} service: {}", method, self.service, url);

        let mut req = self
            .client
            .request(method, &url)
            .headers(self.get_headers(idempotency_key)?);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("{} service timed out: {}", self.service, e)
            } else {
                anyhow!("{} service unreachable: {}", self.service, e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("{} service error ({}): {}", self.service, status, error_text);
            return Err(anyhow!("{} service error ({}): {}", self.service, status, error_text));
        }

        let data = response
            .json::<T>()
            .await
            .with_context(|| format!("Invalid response body from {} service", self.service))?;
        Ok(Some(data))
    }
}
