//! HTTP client for the coordinator API

use crate::common::{Error, Result, WorkerCount};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub ok: bool,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SumResponse {
    pub ok: bool,
    pub total: i64,
    pub responded_count: usize,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub ok: bool,
    pub workers: Vec<WorkerCount>,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Queue one value for storage
    pub async fn write(&self, value: i64) -> Result<WriteResponse> {
        let url = format!("{}/api/write", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Run one aggregation round; takes at least the coordinator's window.
    pub async fn sum(&self) -> Result<SumResponse> {
        let url = format!("{}/api/sum", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let url = format!("{}/api/stats", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse(response).await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::parse(response).await
    }
}
