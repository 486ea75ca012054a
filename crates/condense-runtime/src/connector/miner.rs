//! Miner transport over HTTP.

use super::{base_url, build_client, read_limited, BodyError, ConnectorError};
use crate::dispatch::{MinerTransport, TransportError};
use crate::limits::{MAX_MINER_RESPONSE_BYTES, MAX_SOFT_TOKEN_WIDTH};
use async_trait::async_trait;
use condense_core::{CompressionPayload, CompressionResponse, MinerInfo, MinerMetadata};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub struct HttpMinerTransport {
    client: reqwest::Client,
    metadata_timeout: Duration,
    max_response_bytes: usize,
}

impl HttpMinerTransport {
    /// `metadata_timeout` bounds metadata queries; compression requests are
    /// bounded by the dispatcher's deadline instead.
    pub fn new(metadata_timeout: Duration) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: build_client(None)?,
            metadata_timeout,
            max_response_bytes: MAX_MINER_RESPONSE_BYTES,
        })
    }

    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    fn url(miner: &MinerInfo, path: &str) -> Result<String, TransportError> {
        let base = base_url(&miner.endpoint)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(format!("{}/{}", base, path))
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, TransportError> {
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        let body = read_limited(resp, self.max_response_bytes)
            .await
            .map_err(|e| match e {
                BodyError::TooLarge(n) => TransportError::TooLarge(n),
                BodyError::Read(m) => TransportError::Connect(m),
            })?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MinerTransport for HttpMinerTransport {
    async fn send_compression_request(
        &self,
        miner: &MinerInfo,
        payload: &CompressionPayload,
    ) -> Result<CompressionResponse, TransportError> {
        let resp = self
            .client
            .post(Self::url(miner, "compress")?)
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let response: CompressionResponse = self.decode(resp).await?;
        if let Some(row) = response
            .compressed_tokens
            .iter()
            .find(|row| row.len() > MAX_SOFT_TOKEN_WIDTH)
        {
            return Err(TransportError::Decode(format!(
                "soft token width {} exceeds {}",
                row.len(),
                MAX_SOFT_TOKEN_WIDTH
            )));
        }
        Ok(response)
    }

    async fn fetch_metadata(&self, miner: &MinerInfo) -> Result<MinerMetadata, TransportError> {
        let resp = self
            .client
            .get(Self::url(miner, "metadata")?)
            .timeout(self.metadata_timeout)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.decode(resp).await
    }
}
