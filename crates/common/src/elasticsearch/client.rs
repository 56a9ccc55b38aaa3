use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    pub node: String,
    pub username: String,
    pub password: String,
    pub index: String,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            node: "http://localhost:9200".to_string(),
            username: "".to_string(),
            password: "".to_string(),
            index: "cloudsight-traces".to_string(),
        }
    }
}

/// Thin HTTP client for the Elasticsearch REST API.
///
/// Only builds authenticated requests; interpreting responses is left to the
/// caller so sinks can map status codes onto their own error types.
#[derive(Clone)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
    node: String,
    credentials: Option<(String, String)>,
}

impl ElasticsearchClient {
    pub fn new(node: &str, username: &str, password: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Elasticsearch HTTP client")?;

        let credentials = if username.is_empty() {
            None
        } else {
            Some((username.to_string(), password.to_string()))
        };

        debug!(node = %node, authenticated = credentials.is_some(), "created Elasticsearch client");

        Ok(Self {
            http,
            node: node.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn from_config(config: &ElasticsearchConfig, timeout: Duration) -> Result<Self> {
        Self::new(&config.node, &config.username, &config.password, timeout)
    }

    /// Start a request against `path` (leading slash optional)
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.credentials {
            Some((username, password)) => builder.basic_auth(username, Some(password)),
            None => builder,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.node, path.trim_start_matches('/'))
    }

    pub fn node(&self) -> &str {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_paths() {
        let client =
            ElasticsearchClient::new("http://localhost:9200/", "", "", Duration::from_secs(1))
                .unwrap();

        assert_eq!(client.node(), "http://localhost:9200");
        assert_eq!(client.url("/_bulk"), "http://localhost:9200/_bulk");
        assert_eq!(
            client.url("cloudsight-traces"),
            "http://localhost:9200/cloudsight-traces"
        );
    }

    #[test]
    fn test_default_config() {
        let config = ElasticsearchConfig::default();
        assert_eq!(config.node, "http://localhost:9200");
        assert_eq!(config.index, "cloudsight-traces");
        assert!(config.username.is_empty());
    }
}
