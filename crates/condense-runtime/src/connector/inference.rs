//! Reference-model engine over HTTP.

use super::{base_url, build_client, ConnectorError};
use crate::inference::{GenerationParams, InferenceEngine, InferenceError, ModelInput};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    input: &'a ModelInput,
    params: &'a GenerationParams,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Serialize)]
struct LikelihoodRequest<'a> {
    model: &'a str,
    input: &'a ModelInput,
    target: &'a str,
}

#[derive(Deserialize)]
struct LikelihoodResponse {
    token_logprobs: Vec<f64>,
}

pub struct HttpInferenceEngine {
    name: String,
    base_url: String,
    client: reqwest::Client,
    headers: IndexMap<String, String>,
}

impl HttpInferenceEngine {
    pub fn new(
        name: impl Into<String>,
        base: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url(base)?,
            client: build_client(timeout)?,
            headers: IndexMap::new(),
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, InferenceError> {
        let mut req = self.client.post(format!("{}/{}", self.base_url, path));
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, message });
        }
        resp.json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        model: &str,
        input: &ModelInput,
        params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        let resp: GenerateResponse = self
            .post(
                "generate",
                &GenerateRequest {
                    model,
                    input,
                    params,
                },
            )
            .await?;
        Ok(resp.text)
    }

    async fn log_likelihood(
        &self,
        model: &str,
        input: &ModelInput,
        target: &str,
    ) -> Result<Vec<f64>, InferenceError> {
        let resp: LikelihoodResponse = self
            .post(
                "log_likelihood",
                &LikelihoodRequest {
                    model,
                    input,
                    target,
                },
            )
            .await?;
        Ok(resp.token_logprobs)
    }
}
