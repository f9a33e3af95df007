//! etcd v2 keys API client
//!
//! Pure-Rust async client over reqwest. Regular requests use a client with
//! a request timeout; long-poll watches use a separate client without one,
//! since a watch legitimately blocks until the next change.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CoordinationStore, Precondition, Response};
use crate::error::{Result, TaskGraphError};

/// Configuration for the etcd client
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Client URLs, tried in order
    pub endpoints: Vec<String>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds (not applied to watches)
    pub request_timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".into()],
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl EtcdConfig {
    /// Read `ETCD_ENDPOINTS` (comma separated), falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                config.endpoints = endpoints;
            }
        }
        config
    }
}

/// Error body returned by etcd
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

/// Coordination store backed by an etcd cluster
pub struct EtcdStore {
    client: Client,
    watch_client: Client,
    config: EtcdConfig,
}

impl EtcdStore {
    /// Create a new etcd client
    pub fn new(config: EtcdConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(TaskGraphError::InvalidConfig {
                reason: "at least one etcd endpoint is required".into(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TaskGraphError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let watch_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TaskGraphError::Internal {
                message: format!("Failed to create watch client: {}", e),
            })?;

        Ok(Self {
            client,
            watch_client,
            config,
        })
    }

    /// Build URL for a key on one endpoint
    fn key_url(endpoint: &str, key: &str) -> String {
        let key = if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{}", key)
        };
        format!("{}/v2/keys{}", endpoint.trim_end_matches('/'), key)
    }

    /// Send a request to the first endpoint that answers
    async fn execute<F>(&self, key: &str, watch: bool, build: F) -> Result<Response>
    where
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let client = if watch { &self.watch_client } else { &self.client };
        let mut last_error = None;

        for endpoint in &self.config.endpoints {
            let url = Self::key_url(endpoint, key);
            match build(client, url).send().await {
                Ok(resp) => return Self::decode(key, resp).await,
                Err(e) => {
                    warn!("etcd endpoint {} failed for {}: {}", endpoint, key, e);
                    last_error = Some(TaskGraphError::StoreUnavailable {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TaskGraphError::StoreUnavailable {
            endpoint: "<none>".into(),
            reason: "no endpoints configured".into(),
        }))
    }

    async fn decode(key: &str, resp: reqwest::Response) -> Result<Response> {
        let status = resp.status();
        let index = resp
            .headers()
            .get("x-etcd-index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let body = resp.bytes().await.map_err(|e| TaskGraphError::StoreProtocol {
            message: format!("Failed to read body for {}: {}", key, e),
        })?;

        if status.is_success() {
            let mut decoded: Response =
                serde_json::from_slice(&body).map_err(|e| TaskGraphError::StoreProtocol {
                    message: format!("Bad response for {}: {}", key, e),
                })?;
            decoded.index = index;
            debug!("etcd {:?} {} at index {}", decoded.action, key, index);
            return Ok(decoded);
        }

        let err: EtcdErrorBody =
            serde_json::from_slice(&body).map_err(|e| TaskGraphError::StoreProtocol {
                message: format!("Status {} for {} with unreadable body: {}", status, key, e),
            })?;

        Err(match err.error_code {
            100 => TaskGraphError::KeyNotFound {
                key: key.to_string(),
                index: err.index.max(index),
            },
            101 => TaskGraphError::CompareFailed {
                key: key.to_string(),
                cause: err.cause,
            },
            105 => TaskGraphError::NodeExists { key: key.to_string() },
            401 => TaskGraphError::EventIndexCleared {
                key: key.to_string(),
                index: err.index,
            },
            _ if status == StatusCode::SERVICE_UNAVAILABLE => TaskGraphError::StoreUnavailable {
                endpoint: key.to_string(),
                reason: err.message,
            },
            code => TaskGraphError::StoreProtocol {
                message: format!("etcd error {} on {}: {} ({})", code, key, err.message, err.cause),
            },
        })
    }

    fn ttl_param(ttl: Option<Duration>) -> Option<String> {
        // etcd TTLs are whole seconds; never round a live marker down to zero
        ttl.map(|t| t.as_secs_f64().ceil().max(1.0).to_string())
    }

    fn write_form(value: &str, ttl: Option<Duration>) -> Vec<(&'static str, String)> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = Self::ttl_param(ttl) {
            form.push(("ttl", ttl));
        }
        form
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn get(&self, key: &str) -> Result<Response> {
        self.execute(key, false, |c, url| c.get(url)).await
    }

    async fn list(&self, dir: &str) -> Result<Response> {
        self.execute(dir, false, |c, url| c.get(url).query(&[("sorted", "true")]))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Response> {
        let form = Self::write_form(value, ttl);
        self.execute(key, false, |c, url| c.put(url).form(&form)).await
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Response> {
        let mut form = Self::write_form(value, ttl);
        form.push(("prevExist", "false".into()));
        self.execute(key, false, |c, url| c.put(url).form(&form)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        cond: &Precondition,
    ) -> Result<Response> {
        let mut form = Self::write_form(value, ttl);
        form.push(("prevExist", "true".into()));
        if let Some(prev) = &cond.prev_value {
            form.push(("prevValue", prev.clone()));
        }
        if let Some(prev) = cond.prev_index {
            form.push(("prevIndex", prev.to_string()));
        }
        self.execute(key, false, |c, url| c.put(url).form(&form)).await
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<Response> {
        self.execute(key, false, |c, url| {
            let req = c.delete(url);
            if recursive {
                req.query(&[("recursive", "true")])
            } else {
                req
            }
        })
        .await
    }

    async fn wait(&self, key: &str, index: u64, recursive: bool) -> Result<Response> {
        let mut query = vec![("wait", "true".to_string())];
        if index > 0 {
            query.push(("waitIndex", index.to_string()));
        }
        if recursive {
            query.push(("recursive", "true".to_string()));
        }

        loop {
            match self.execute(key, true, |c, url| c.get(url).query(&query)).await {
                // etcd may end an idle long poll with an empty 200; poll again
                Err(TaskGraphError::StoreProtocol { message }) if message.contains("EOF") => {
                    debug!("Long poll on {} closed without event, re-arming", key);
                    continue;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Action;

    #[test]
    fn test_key_url() {
        assert_eq!(
            EtcdStore::key_url("http://127.0.0.1:2379/", "/job/epoch"),
            "http://127.0.0.1:2379/v2/keys/job/epoch"
        );
        assert_eq!(
            EtcdStore::key_url("http://etcd:2379", "job/slots/0"),
            "http://etcd:2379/v2/keys/job/slots/0"
        );
    }

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(EtcdStore::ttl_param(Some(Duration::from_millis(1500))), Some("2".into()));
        assert_eq!(EtcdStore::ttl_param(Some(Duration::from_millis(10))), Some("1".into()));
        assert_eq!(EtcdStore::ttl_param(None), None);
    }

    #[test]
    fn test_decode_watch_event_shape() {
        let body = r#"{"action":"expire","node":{"key":"/job/healthy/1","modifiedIndex":42,"createdIndex":40},"prevNode":{"key":"/job/healthy/1","value":"10.0.0.1:7000","modifiedIndex":41,"createdIndex":40}}"#;
        let resp: Response = serde_json::from_str(body).unwrap();
        assert_eq!(resp.action, Action::Expire);
        assert_eq!(resp.node.modified_index, 42);
        assert_eq!(resp.prev_node.unwrap().value, "10.0.0.1:7000");
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        let config = EtcdConfig {
            endpoints: vec![],
            ..Default::default()
        };
        assert!(EtcdStore::new(config).is_err());
    }
}
