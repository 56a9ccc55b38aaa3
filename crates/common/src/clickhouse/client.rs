use anyhow::{Context, Result};
use clickhouse::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub table: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "cloudsight".to_string(),
            username: "default".to_string(),
            password: "".to_string(),
            table: "metrics".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    database: String,
}

impl ClickHouseClient {
    /// Build a client bound to `database`.
    ///
    /// Inserts are acknowledged only once ClickHouse has flushed its async
    /// insert buffer, so a successful insert means the rows are durable.
    pub fn new(url: &str, database: &str, username: &str, password: &str) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(username)
            .with_password(password)
            .with_compression(clickhouse::Compression::Lz4)
            .with_option("async_insert", "1")
            .with_option("wait_for_async_insert", "1");

        Self {
            client,
            database: database.to_string(),
        }
    }

    pub fn from_config(config: &ClickHouseConfig) -> Self {
        Self::new(
            &config.url,
            &config.database,
            &config.username,
            &config.password,
        )
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .context("ClickHouse ping failed")?;
        Ok(())
    }

    /// Run a statement that returns no rows (DDL).
    ///
    /// Runs against the `default` database so it works before the configured
    /// database exists; statements must use fully-qualified names.
    pub async fn execute(&self, statement: &str) -> Result<(), clickhouse::error::Error> {
        self.client
            .clone()
            .with_database("default")
            .query(statement)
            .execute()
            .await
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClickHouseConfig::default();
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.database, "cloudsight");
        assert_eq!(config.table, "metrics");
    }

    #[test]
    fn test_client_keeps_database_name() {
        let client = ClickHouseClient::from_config(&ClickHouseConfig::default());
        assert_eq!(client.database(), "cloudsight");
    }
}
