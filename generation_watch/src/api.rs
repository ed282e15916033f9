//! HTTP client for the generation job and service health endpoints.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use url::Url;

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::health::{HealthReport, Service};
use crate::GenerationJob;

/// Status and confirmation calls for generation jobs.
#[async_trait]
pub trait JobStatusApi: Send + Sync {
    /// `GET /generation/jobs/{job_id}/status`
    async fn fetch_status(&self, job_id: &str) -> Result<GenerationJob, ApiError>;

    /// `POST /generation/jobs/{job_id}/confirm`
    async fn confirm_structure(
        &self,
        job_id: &str,
        structure: Option<Value>,
    ) -> Result<Value, ApiError>;
}

#[async_trait]
pub trait HealthApi: Send + Sync {
    /// `GET /health/{service}`
    async fn fetch_health(&self, service: Service) -> Result<HealthReport, ApiError>;
}

/// Rejects blank job ids before they reach the network.
pub fn validate_job_id(job_id: &str) -> Result<&str, ApiError> {
    let trimmed = job_id.trim();
    if trimmed.is_empty() {
        Err(ApiError::MissingJobId)
    } else {
        Ok(trimmed)
    }
}

pub struct ApiClient {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        Ok(Self {
            client: Client::builder().timeout(config.request_timeout).build()?,
            base_url: config.api_base_url.clone(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append path segments to the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::Internal(format!("invalid bearer token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        tracing::trace!(%url, "GET");
        let response = self.client.get(url).headers(self.headers()?).send().await?;
        let bytes = check_status(response).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Map non-success responses onto [`ApiError`], keeping a short body excerpt.
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.chars().take(200).collect()
    };
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl JobStatusApi for ApiClient {
    async fn fetch_status(&self, job_id: &str) -> Result<GenerationJob, ApiError> {
        let job_id = validate_job_id(job_id)?;
        let url = self.endpoint(&["generation", "jobs", job_id, "status"])?;
        self.get_json(url).await
    }

    async fn confirm_structure(
        &self,
        job_id: &str,
        structure: Option<Value>,
    ) -> Result<Value, ApiError> {
        let job_id = validate_job_id(job_id)?;
        let url = self.endpoint(&["generation", "jobs", job_id, "confirm"])?;

        let mut request = self.client.post(url).headers(self.headers()?);
        if let Some(structure) = structure {
            request = request.json(&json!({ "structureData": structure }));
        }

        let response = check_status(request.send().await?).await?;
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HealthApi for ApiClient {
    async fn fetch_health(&self, service: Service) -> Result<HealthReport, ApiError> {
        let url = self.endpoint(&["health", service.as_str()])?;
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        let config = ClientConfig::from_lookup(|key| match key {
            "GENERATION_API_URL" => Some(base.to_string()),
            _ => None,
        })
        .unwrap();
        ApiClient::new(&config).unwrap()
    }

    #[test]
    fn test_validate_job_id() {
        assert_eq!(validate_job_id(" abc "), Ok("abc"));
        assert_eq!(validate_job_id(""), Err(ApiError::MissingJobId));
        assert_eq!(validate_job_id("   "), Err(ApiError::MissingJobId));
    }

    #[test]
    fn test_endpoint_appends_segments() {
        let api = client("https://example.com/api");
        let url = api.endpoint(&["generation", "jobs", "j1", "status"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/generation/jobs/j1/status");
    }

    #[test]
    fn test_endpoint_encodes_job_id() {
        let api = client("https://example.com/");
        let url = api.endpoint(&["generation", "jobs", "a/b c", "status"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/generation/jobs/a%2Fb%20c/status"
        );
    }

    #[tokio::test]
    async fn test_missing_job_id_fails_before_network() {
        // Nothing listens on this port; reaching the network would be a transport error.
        let api = client("http://127.0.0.1:9/");
        assert_eq!(api.fetch_status("").await, Err(ApiError::MissingJobId));
        assert_eq!(
            api.confirm_structure(" ", None).await,
            Err(ApiError::MissingJobId)
        );
    }
}
