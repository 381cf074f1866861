//! Upstream access to the vehicle-data APIs.
//!
//! This module owns the single place where HTTP responses are translated
//! into [`CacheError`]s, and the retry loop that reacts to that
//! classification. Everything above it (the lookup coordinators) only sees
//! classified errors.

use std::error::Error;
use std::future::Future;

use reqwest::{header, StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheContents, CacheError};
use crate::config::{Config, FetchTimeouts, RetryConfig};

pub const USER_AGENT: &str = concat!("motordata/", env!("CARGO_PKG_VERSION"));

impl CacheError {
    fn upstream_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Upstream(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::upstream_error(&error)
    }
}

/// Try to run a future up to `retry.max_attempts` times, with exponentially
/// growing delays between attempts.
///
/// Only transient failures are retried (see [`CacheError::is_transient`]):
/// client errors, cancellation and malformed bodies propagate immediately,
/// and the last error is returned unmodified when the attempts are
/// exhausted.
pub async fn retry<G, F, T>(retry: &RetryConfig, task_gen: G) -> CacheContents<T>
where
    G: Fn() -> F,
    F: Future<Output = CacheContents<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = task_gen().await;
        attempt += 1;

        let should_not_retry = match &result {
            Ok(_) => true,
            Err(e) => !e.is_transient(),
        };

        if should_not_retry || attempt >= max_attempts {
            break result;
        }

        let delay = retry.base_delay * 2u32.pow(attempt as u32 - 1);
        tracing::debug!(
            "Upstream request failed transiently, retrying in {delay:?} ({attempt}/{max_attempts})",
        );
        metric!(counter("fetch.retries") += 1);
        tokio::time::sleep(delay).await;
    }
}

/// Converts a non-success response to an error.
///
/// This uses the HTTP status code to infer the [`CacheError`], and surfaces
/// the upstream's own `message`/`detail` field when the error body is JSON.
async fn error_from_response(source: &Url, response: reqwest::Response) -> CacheError {
    let status = response.status();
    debug_assert!(!status.is_success());

    let detail = response.json::<Value>().await.ok().and_then(|body| {
        body.get("message")
            .or_else(|| body.get("detail"))?
            .as_str()
            .map(str::to_owned)
    });

    if status == StatusCode::BAD_REQUEST {
        tracing::debug!("Request rejected by `{source}`: {status}");

        CacheError::BadRequest(detail.unwrap_or_else(|| status.to_string()))
    } else if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to query `{source}`: {status}");

        CacheError::PermissionDenied(detail.unwrap_or_else(|| status.to_string()))
    } else if status.is_client_error() {
        // If it's another client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{source}`: {status}");

        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{source}`: {status}");

        CacheError::Upstream(status.to_string())
    }
}

/// A client for the upstream vehicle-data APIs.
///
/// One instance is shared by all lookup domains. Each request runs under the
/// configured deadline and honors the caller's [`CancellationToken`]; the
/// resulting [`CacheError`] classification is what the retry loop and the
/// coordinators react to.
#[derive(Debug, Clone)]
pub struct FetchService {
    client: reqwest::Client,
    base_url: Url,
    manual_base_url: Url,
    timeouts: FetchTimeouts,
}

impl FetchService {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.fetch.timeouts.connect)
            .user_agent(USER_AGENT)
            .build()
            .unwrap();

        FetchService {
            client,
            base_url: config.fetch.base_url.clone(),
            manual_base_url: config.fetch.manual_base_url.clone(),
            timeouts: config.fetch.timeouts,
        }
    }

    /// Technical specifications for a vehicle by make and model, optionally
    /// narrowed by year and fuel type.
    pub async fn tech_specs(
        &self,
        make: &str,
        model: &str,
        year: Option<u16>,
        fuel_type: Option<&str>,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let year = year.map(|y| y.to_string());
        let mut url = join_segments(&self.base_url, &["tech-specs", make, model])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(year) = &year {
                query.append_pair("year", year);
            }
            if let Some(fuel_type) = fuel_type {
                query.append_pair("fuel_type", fuel_type);
            }
        }
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// Technical specifications matched from a complete vehicle record.
    pub async fn tech_specs_lookup(
        &self,
        vehicle: &Value,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let url = join_segments(&self.base_url, &["tech-specs-lookup"])?;
        let body = serde_json::json!({ "vehicleData": vehicle });
        self.send(self.client.post(url.clone()).json(&body), &url, token)
            .await
    }

    /// Repair times for a vehicle by make and model.
    pub async fn repair_times(
        &self,
        make: &str,
        model: &str,
        year: Option<u16>,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let year = year.map(|y| y.to_string());
        let mut url = join_segments(&self.base_url, &["vehicles", make, model])?;
        if let Some(year) = &year {
            url.query_pairs_mut().append_pair("year", year);
        }
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// Repair times matched from a complete vehicle record.
    pub async fn repair_times_lookup(
        &self,
        vehicle: &Value,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let url = join_segments(&self.base_url, &["repair-times-lookup"])?;
        let body = serde_json::json!({ "vehicleData": vehicle });
        self.send(self.client.post(url.clone()).json(&body), &url, token)
            .await
    }

    /// The list of vehicles the upstream has data for, optionally filtered
    /// by data type (`repair_times`, `tech_specs`).
    pub async fn available_vehicles(
        &self,
        data_type: Option<&str>,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let mut url = join_segments(&self.base_url, &["vehicles"])?;
        if let Some(data_type) = data_type {
            url.query_pairs_mut().append_pair("data_type", data_type);
        }
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// A single defect from the MOT inspection manual.
    pub async fn defect(&self, defect_id: &str, token: &CancellationToken) -> CacheContents<Value> {
        let url = join_segments(&self.manual_base_url, &["manual", "defect", defect_id])?;
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// A section or subsection of the MOT inspection manual; `path` is the
    /// dotted section id.
    pub async fn manual_section(
        &self,
        path: &str,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let endpoint = match path.split('.').count() {
            1 => "section",
            2 => "subsection",
            _ => "item",
        };
        let url = join_segments(&self.manual_base_url, &["manual", endpoint, path])?;
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// The MOT inspection manual's table of contents.
    pub async fn manual_toc(&self, token: &CancellationToken) -> CacheContents<Value> {
        let url = join_segments(&self.manual_base_url, &["manual", "all"])?;
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// The AI condition analysis for a registration.
    pub async fn analysis(
        &self,
        registration: &str,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let url = join_segments(&self.base_url, &["vehicle-analysis", registration])?;
        self.send(self.client.get(url.clone()), &url, token).await
    }

    /// Performs a request under the configured deadline, honoring the
    /// cancellation token, and parses the JSON body.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        source: &Url,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let builder = builder.header(header::ACCEPT, "application/json");

        let request = async {
            let response = builder.send().await?;
            let status = response.status();
            if status.is_success() {
                tracing::trace!("Success hitting `{source}`");
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| CacheError::Malformed(e.to_string()))
            } else {
                Err(error_from_response(source, response).await)
            }
        };

        tokio::select! {
            _ = token.cancelled() => Err(CacheError::Canceled),
            result = tokio::time::timeout(self.timeouts.request, request) => {
                result.unwrap_or(Err(CacheError::Timeout(self.timeouts.request)))
            }
        }
    }
}

/// Appends path segments to a base URL, percent-encoding as needed.
fn join_segments(base: &Url, segments: &[&str]) -> CacheContents<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CacheError::InternalError)?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
