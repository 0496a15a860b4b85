//! HTTP client for the screenshot API, used by the CLI client commands.

use crate::api::{CreateScreenshotsRequest, ErrorBody, VERSION_HEADER};
use crate::metadata::{Metadata, VersionRequest};
use crate::JobOutcome;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const SCREENSHOT_PATH: &str = "/api/v1/screenshot";
const VERSIONS_PATH: &str = "/api/v1/screenshot/versions";

/// A fetched screenshot.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub content_type: Option<String>,
    pub version: Option<u32>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// `backend` is `host:port` or a full `http(s)://` base url.
    pub fn new(backend: &str, timeout: Duration) -> Result<Self> {
        let base_url = if backend.starts_with("http://") || backend.starts_with("https://") {
            backend.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", backend.trim_end_matches('/'))
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Link to the latest screenshot of `url`.
    pub fn screenshot_link(&self, url: &str) -> String {
        match reqwest::Url::parse_with_params(&format!("{}{}", self.base_url, SCREENSHOT_PATH), &[("url", url)]) {
            Ok(link) => link.to_string(),
            Err(_) => format!("{}{}?url={}", self.base_url, SCREENSHOT_PATH, url),
        }
    }

    pub async fn create_screenshots(&self, urls: Vec<String>) -> Result<Vec<JobOutcome>> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, SCREENSHOT_PATH))
            .json(&CreateScreenshotsRequest { urls })
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.base_url))?;

        let response = check(response).await?;
        response.json().await.context("failed to decode screenshot outcomes")
    }

    pub async fn versions(&self, url: &str) -> Result<Vec<Metadata>> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, VERSIONS_PATH))
            .query(&[("url", url)])
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.base_url))?;

        let response = check(response).await?;
        response.json().await.context("failed to decode versions")
    }

    pub async fn fetch(&self, url: &str, version: VersionRequest) -> Result<Screenshot> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, SCREENSHOT_PATH))
            .query(&[("url", url)]);
        if let VersionRequest::Specific(v) = version {
            request = request.query(&[("version", v)]);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.base_url))?;
        let response = check(response).await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE.as_str());
        let version = header(VERSION_HEADER).and_then(|v| v.parse().ok());

        let bytes = response.bytes().await.context("failed to read screenshot body")?;
        Ok(Screenshot {
            content_type,
            version,
            bytes: bytes.to_vec(),
        })
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    bail!("server responded {}: {}", status, message)
}
