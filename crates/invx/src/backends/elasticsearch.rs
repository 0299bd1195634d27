//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM. 3:47 AM.
//!
//! The monitoring dashboard glows amber in the dark. One engineer, alone, stares
//! into the abyss of a RED cluster. The abyss stares back and offers a 429.
//! The inventory pipeline, meanwhile, keeps POSTing. It has no idea. It is at peace.
//!
//! 🚀 Four HTTP calls, that's the whole relationship:
//! - `POST /_bulk` with NDJSON, for the documents
//! - `HEAD /{index}`, to ask whether an index exists
//! - `PUT /{index}`, to create one with a date mapping
//! - `PUT /{index}/_doc/{id}`, to register the dashboard index pattern
//!
//! 🔒 Auth: API key wins over basic auth. This is not a democracy.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::backends::SearchCluster;
use crate::common::{BulkRequestBody, BulkResponse};

/// 🔍 How to reach the cluster.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    /// 📡 Cluster endpoint. A bare host (`search-x.us-east-1.es.amazonaws.com`) gets `https://`.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key, the velvet rope variant of authentication.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ElasticsearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// 🌐 `https://` for bare hosts, trailing slash trimmed. One slash of difference,
    /// infinite suffering of difference.
    pub fn base_url(&self) -> String {
        let trimmed = self.url.trim().trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        }
    }
}

/// 📡 Pure I/O against one cluster. Connections are pooled inside `reqwest::Client`,
/// so one of these lives for the whole process and is shared by every invocation.
#[derive(Debug)]
pub struct ElasticsearchCluster {
    client: reqwest::Client,
    config: ElasticsearchConfig,
    base_url: String,
}

impl ElasticsearchCluster {
    /// 🚀 Build the client. No connectivity ping: a cold start should not pay for a
    /// round trip that the first bulk request will make anyway.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Probably a missing cert bundle or a cursed system OpenSSL.")?;
        let base_url = config.base_url();
        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    /// 🔒 API key beats basic auth in this club.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl SearchCluster for ElasticsearchCluster {
    /// 📡 One `_bulk` POST. Does not retry; retries are the requeue path's job.
    async fn submit_bulk(&self, body: &BulkRequestBody) -> Result<BulkResponse> {
        debug!(
            "📡 Sending {} documents ({} bytes) to /_bulk",
            body.doc_count(),
            body.len_bytes()
        );
        let request = self
            .client
            .post(self.url_for("_bulk"))
            // ⚠️ application/x-ndjson, not application/json. The cluster cares.
            .header("Content-Type", "application/x-ndjson");

        let response = self
            .authorize(request)
            .body(body.payload.clone())
            .send()
            .await
            .context("💀 The bulk request never made it to the cluster. Check connectivity, check timeouts, check your feelings.")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("💀 The cluster answered the bulk request but the body got lost on the way back")?;
        if !status.is_success() {
            anyhow::bail!(
                "💀 Bulk request rejected with {}. The cluster's exact words: '{}'",
                status,
                text
            );
        }

        let parsed: BulkResponse = serde_json::from_str(&text)
            .context("💀 Bulk response was 2xx but not the JSON shape we expected")?;
        trace!(
            "🚀 Bulk request landed: took {}ms, errors={}",
            parsed.took, parsed.errors
        );
        Ok(parsed)
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let request = self.client.head(self.url_for(index));
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("💀 Could not ask the cluster whether index '{}' exists", index))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!(
                "💀 Index existence check for '{}' came back {}. Neither yes nor no. Schrodinger's index.",
                index,
                status
            ),
        }
    }

    async fn create_index(&self, index: &str, definition: &Value) -> Result<()> {
        let request = self
            .client
            .put(self.url_for(index))
            .header("Content-Type", "application/json");
        let response = self
            .authorize(request)
            .body(definition.to_string())
            .send()
            .await
            .with_context(|| format!("💀 Could not send the create request for index '{}'", index))?;

        let status = response.status();
        if status.is_success() {
            debug!("🏗️ Created index '{}'", index);
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && text.contains("resource_already_exists_exception") {
            // another invocation won the race
            debug!("🤝 Index '{}' already exists", index);
            return Ok(());
        }
        anyhow::bail!(
            "💀 Creating index '{}' failed with {}: '{}'",
            index,
            status,
            text
        )
    }

    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()> {
        let request = self
            .client
            .put(self.url_for(&format!("{}/_doc/{}", index, doc_id)))
            .header("Content-Type", "application/json");
        let response = self
            .authorize(request)
            .body(document.to_string())
            .send()
            .await
            .with_context(|| format!("💀 Could not write document '{}' to '{}'", doc_id, index))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "💀 Writing document '{}' to '{}' failed with {}: '{}'",
                doc_id,
                index,
                status,
                text
            );
        }
        Ok(())
    }
}
