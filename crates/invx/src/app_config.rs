//! 🔧 App Configuration: the sacred env-and-TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Three layers, merged by Figment, later layers win:
//! 1. Legacy deployment env vars (`ES_DOMAIN_ENDPOINT`, `SQS_QUEUE_URL`, `INVENTORY_BUCKET`,
//!    `EXCLUDED_RESOURCE_PREFIXES`), so existing function deployments keep working untouched.
//! 2. `INVX_*` env vars, `__` as the nesting separator (`INVX_INGEST__FETCH_RETRY_LIMIT=2`).
//! 3. An optional TOML file.

use crate::backends::{ElasticsearchConfig, FileBlobStoreConfig, S3BlobStoreConfig, SqsQueueConfig};
use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tracing::info;

/// 🗺️ Legacy env var → config path. The deployment templates predate this crate.
const LEGACY_ENV_KEYS: [&str; 4] = [
    "ES_DOMAIN_ENDPOINT",
    "SQS_QUEUE_URL",
    "INVENTORY_BUCKET",
    "EXCLUDED_RESOURCE_PREFIXES",
];

/// 📦 Everything the pipeline needs to know about itself.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// 🔍 Where documents get indexed.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchConfig {
    Elasticsearch(ElasticsearchConfig),
    /// 🧪 Keeps everything in RAM. Dry runs and tests only.
    #[default]
    InMemory,
}

/// 📨 Where requeued records go.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueConfig {
    Sqs(SqsQueueConfig),
    #[default]
    InMemory,
}

/// 🪣 Where snapshot objects are fetched from.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub enum BlobStoreConfig {
    S3(S3BlobStoreConfig),
    /// 📁 `<root>/<key>` on local disk, for replaying captured events.
    File(FileBlobStoreConfig),
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self::S3(S3BlobStoreConfig::default())
    }
}

/// 🔐 How `"Principal": "*"` gets fixed.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalFixupMode {
    /// 🌳 Walk the parsed tree. Only real `Principal` members are touched.
    #[default]
    Structural,
    /// 🔍 Byte-scan the raw text before parsing.
    Text,
}

/// 🧭 Ingestion knobs: exclusions, routing taxonomy, fixups, retries.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// 🪣 Bucket used when a failed item has to be rebuilt from its target alone.
    #[serde(default)]
    pub inventory_bucket: Option<String>,
    /// 🚫 Keys starting with any of these are skipped. A list, or one comma-separated string.
    #[serde(default, deserialize_with = "list_or_comma_separated")]
    pub excluded_prefixes: Vec<String>,
    /// 🔐 First path segments whose doc ids are hashed.
    #[serde(
        default = "default_hashed_id_prefixes",
        deserialize_with = "list_or_comma_separated"
    )]
    pub hashed_id_prefixes: Vec<String>,
    /// 🏷️ Canonical casing for first path segments, used when rebuilding keys.
    #[serde(
        default = "default_provider_prefixes",
        deserialize_with = "list_or_comma_separated"
    )]
    pub provider_prefixes: Vec<String>,
    #[serde(default)]
    pub principal_fixup: PrincipalFixupMode,
    /// 🔄 How many times a record whose fetch failed gets requeued. 0 means never.
    #[serde(default)]
    pub fetch_retry_limit: u32,
    /// 🚨 A failed item requeued more than this many times gets logged as an error each
    /// time it comes around again. Non-mapping 400s don't fix themselves.
    #[serde(default = "default_item_requeue_alarm")]
    pub item_requeue_alarm: u32,
    /// 🛑 Drop a failed item instead of requeueing it once it has been requeued this many
    /// times. Unset means requeue forever.
    #[serde(default)]
    pub item_requeue_limit: Option<u32>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            inventory_bucket: None,
            excluded_prefixes: Vec::new(),
            hashed_id_prefixes: default_hashed_id_prefixes(),
            provider_prefixes: default_provider_prefixes(),
            principal_fixup: PrincipalFixupMode::default(),
            fetch_retry_limit: 0,
            item_requeue_alarm: default_item_requeue_alarm(),
            item_requeue_limit: None,
        }
    }
}

impl IngestConfig {
    pub fn is_excluded(&self, key: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

fn default_item_requeue_alarm() -> u32 {
    5
}

fn default_hashed_id_prefixes() -> Vec<String> {
    vec!["Azure-Resources".to_string()]
}

fn default_provider_prefixes() -> Vec<String> {
    vec![
        "Resources".to_string(),
        "Azure-Resources".to_string(),
        "GCP-Resources".to_string(),
    ]
}

/// 📏 Size limits.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 📦 Upper bound for one `_bulk` body. Managed clusters commonly cap at 10 MiB.
    #[serde(default = "default_max_request_size_bytes")]
    pub max_request_size_bytes: usize,
    /// 📨 Upper bound for one requeue message. Queue messages cap at 256 KiB.
    #[serde(default = "default_max_requeue_message_bytes")]
    pub max_requeue_message_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_request_size_bytes: default_max_request_size_bytes(),
            max_requeue_message_bytes: default_max_requeue_message_bytes(),
        }
    }
}

fn default_max_request_size_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_requeue_message_bytes() -> usize {
    240 * 1024
}

/// 🏗️ Index lifecycle: create missing indices with a date mapping, register a dashboard pattern.
#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_time_field")]
    pub time_field: String,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    #[serde(default = "default_dashboards_index")]
    pub dashboards_index: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_field: default_time_field(),
            time_format: default_time_format(),
            dashboards_index: default_dashboards_index(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_time_field() -> String {
    "configurationItemCaptureTime".to_string()
}

fn default_time_format() -> String {
    "yyyy-MM-dd HH:mm:ss.SSSSSS".to_string()
}

fn default_dashboards_index() -> String {
    ".kibana".to_string()
}

/// 🔪 `["a", "b"]` or `"a, b"`. Blank entries are dropped either way.
fn list_or_comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let items: Vec<String> = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(joined) => joined.split(',').map(str::to_string).collect(),
        OneOrMany::Many(items) => items,
    };
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

/// 🗺️ Legacy deployment variables, renamed onto their config paths.
fn legacy_env() -> Env {
    Env::raw().only(&LEGACY_ENV_KEYS).map(|key| {
        let path = match key.as_str().to_ascii_uppercase().as_str() {
            "ES_DOMAIN_ENDPOINT" => "search.elasticsearch.url",
            "SQS_QUEUE_URL" => "queue.sqs.url",
            "INVENTORY_BUCKET" => "ingest.inventory_bucket",
            _ => "ingest.excluded_prefixes",
        };
        path.into()
    })
}

/// 🚀 Load the config from env vars and, if given, a TOML file on top.
///
/// - `None` → env vars only.
/// - `Some(path)` → env vars + TOML, TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new()
        .merge(legacy_env())
        .merge(Env::prefixed("INVX_").split("__"));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (INVX_* and legacy). \
             The file exists in our hearts, but apparently not in valid TOML.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (INVX_* and legacy). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn the_one_where_the_legacy_deployment_still_boots() {
        Jail::expect_with(|jail| {
            jail.set_env("ES_DOMAIN_ENDPOINT", "search-inventory.us-east-1.es.amazonaws.com");
            jail.set_env("SQS_QUEUE_URL", "https://sqs.us-east-1.amazonaws.com/1/inventory");
            jail.set_env("INVENTORY_BUCKET", "inventory-bucket");
            jail.set_env("EXCLUDED_RESOURCE_PREFIXES", "Resources/iam/credentialreport/, Resources/kms/");

            let the_config = load_config(None).map_err(|err| format!("{:#}", err))?;

            match &the_config.search {
                SearchConfig::Elasticsearch(es) => {
                    assert_eq!(es.url, "search-inventory.us-east-1.es.amazonaws.com");
                    assert_eq!(
                        es.base_url(),
                        "https://search-inventory.us-east-1.es.amazonaws.com"
                    );
                }
                who_invited_you => panic!("💀 expected elasticsearch, got {:?}", who_invited_you),
            }
            match &the_config.queue {
                QueueConfig::Sqs(sqs) => {
                    assert_eq!(sqs.url, "https://sqs.us-east-1.amazonaws.com/1/inventory")
                }
                who_invited_you => panic!("💀 expected sqs, got {:?}", who_invited_you),
            }
            assert_eq!(the_config.ingest.inventory_bucket.as_deref(), Some("inventory-bucket"));
            assert_eq!(
                the_config.ingest.excluded_prefixes,
                vec!["Resources/iam/credentialreport/", "Resources/kms/"]
            );
            assert!(the_config.ingest.is_excluded("Resources/kms/key/k1.json"));
            assert!(!the_config.ingest.is_excluded("Resources/ec2/instance/i-1.json"));
            Ok(())
        });
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        Jail::expect_with(|_jail| {
            let the_config = load_config(None).map_err(|err| format!("{:#}", err))?;
            assert!(matches!(the_config.search, SearchConfig::InMemory));
            assert!(matches!(the_config.blob_store, BlobStoreConfig::S3(_)));
            assert_eq!(the_config.runtime.max_request_size_bytes, 10 * 1024 * 1024);
            assert_eq!(the_config.runtime.max_requeue_message_bytes, 240 * 1024);
            assert_eq!(the_config.ingest.hashed_id_prefixes, vec!["Azure-Resources"]);
            assert_eq!(the_config.ingest.provider_prefixes.len(), 3);
            assert_eq!(the_config.ingest.principal_fixup, PrincipalFixupMode::Structural);
            assert_eq!(the_config.ingest.fetch_retry_limit, 0);
            assert_eq!(the_config.ingest.item_requeue_alarm, 5);
            assert_eq!(the_config.ingest.item_requeue_limit, None);
            assert!(the_config.lifecycle.enabled);
            assert_eq!(the_config.lifecycle.dashboards_index, ".kibana");
            Ok(())
        });
    }

    #[test]
    fn the_one_where_the_toml_file_gets_the_last_word() {
        Jail::expect_with(|jail| {
            jail.set_env("ES_DOMAIN_ENDPOINT", "legacy.example.com");
            jail.set_env("INVX_INGEST__FETCH_RETRY_LIMIT", "2");
            jail.create_file(
                "invx.toml",
                r#"
                [search.elasticsearch]
                url = "http://localhost:9200"
                api_key = "c2VjcmV0"

                [blob_store.file]
                root = "/tmp/inventory"

                [ingest]
                excluded_prefixes = ["Resources/iam/"]
                principal_fixup = "text"
                item_requeue_limit = 10

                [runtime]
                max_request_size_bytes = 123456

                [lifecycle]
                enabled = false
                "#,
            )?;

            let the_config =
                load_config(Some(Path::new("invx.toml"))).map_err(|err| format!("{:#}", err))?;

            match &the_config.search {
                SearchConfig::Elasticsearch(es) => {
                    assert_eq!(es.base_url(), "http://localhost:9200");
                    assert_eq!(es.api_key.as_deref(), Some("c2VjcmV0"));
                }
                who_invited_you => panic!("💀 expected elasticsearch, got {:?}", who_invited_you),
            }
            match &the_config.blob_store {
                BlobStoreConfig::File(file) => {
                    assert_eq!(file.root, std::path::PathBuf::from("/tmp/inventory"))
                }
                who_invited_you => panic!("💀 expected file blob store, got {:?}", who_invited_you),
            }
            assert_eq!(the_config.ingest.excluded_prefixes, vec!["Resources/iam/"]);
            assert_eq!(the_config.ingest.principal_fixup, PrincipalFixupMode::Text);
            assert_eq!(the_config.ingest.fetch_retry_limit, 2);
            assert_eq!(the_config.ingest.item_requeue_limit, Some(10));
            assert_eq!(the_config.runtime.max_request_size_bytes, 123456);
            assert!(!the_config.lifecycle.enabled);
            Ok(())
        });
    }

    #[test]
    fn the_one_where_a_blank_exclusion_list_excludes_nothing() {
        Jail::expect_with(|jail| {
            jail.set_env("EXCLUDED_RESOURCE_PREFIXES", ",");
            let the_config = load_config(None).map_err(|err| format!("{:#}", err))?;
            assert!(the_config.ingest.excluded_prefixes.is_empty());
            assert!(!the_config.ingest.is_excluded("Resources/anything.json"));
            Ok(())
        });
    }
}
