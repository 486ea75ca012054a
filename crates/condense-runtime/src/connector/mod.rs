//! HTTP connectors
//!
//! JSON-over-HTTP implementations of the validator's three outbound seams:
//!
//! - [`HttpMinerTransport`]: `POST {endpoint}/compress`, `GET {endpoint}/metadata`
//! - [`HttpInferenceEngine`]: `POST {base}/generate`, `POST {base}/log_likelihood`
//! - [`HttpWeightSink`]: `POST {url}` with a [`WeightSubmission`](crate::publisher::WeightSubmission) body

pub mod consensus;
pub mod inference;
pub mod miner;

pub use consensus::HttpWeightSink;
pub use inference::HttpInferenceEngine;
pub use miner::HttpMinerTransport;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid base URL '{0}'")]
    InvalidUrl(String),
}

pub(crate) fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, ConnectorError> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
        "condense-validator/",
        env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

pub(crate) fn base_url(url: &str) -> Result<String, ConnectorError> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Err(ConnectorError::InvalidUrl(url.to_string()))
    }
}

/// Read a response body, refusing anything larger than `limit` bytes.
pub(crate) async fn read_limited(
    mut resp: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, BodyError> {
    if let Some(len) = resp.content_length() {
        if len as usize > limit {
            return Err(BodyError::TooLarge(len as usize));
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| BodyError::Read(e.to_string()))?
    {
        if body.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge(body.len() + chunk.len()));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[derive(Debug)]
pub(crate) enum BodyError {
    TooLarge(usize),
    Read(String),
}
