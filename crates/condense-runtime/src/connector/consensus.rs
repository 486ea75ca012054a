//! Weight submission over HTTP.

use super::{base_url, build_client, ConnectorError};
use crate::publisher::{PublishError, WeightSink, WeightSubmission};
use async_trait::async_trait;
use condense_core::Weights;
use indexmap::IndexMap;
use std::time::Duration;

/// POSTs each round's [`WeightSubmission`] as JSON. Any non-2xx status is a
/// rejection.
pub struct HttpWeightSink {
    name: String,
    url: String,
    client: reqwest::Client,
    headers: IndexMap<String, String>,
}

impl HttpWeightSink {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: name.into(),
            url: base_url(url)?,
            client: build_client(timeout)?,
            headers: IndexMap::new(),
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl WeightSink for HttpWeightSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_weights(&self, round: u64, weights: &Weights) -> Result<(), PublishError> {
        let mut req = self.client.post(&self.url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req = req.json(&WeightSubmission::new(round, weights));

        match req.send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                Err(PublishError::Rejected {
                    sink: self.name.clone(),
                    message: format!("status {}: {}", status, text),
                })
            }
            Err(e) => Err(PublishError::Unreachable {
                sink: self.name.clone(),
                message: e.to_string(),
            }),
        }
    }
}
