use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

use sitesync_core::config::SourceConfig;
use sitesync_core::types::ExternalEmployee;

use super::row::{SourcePage, SourceRow};
use super::{EmployeePage, SourceConnection, SourceConnector, SourceError};

/// Source reached over its JSON query gateway:
/// `GET /ping`, `GET /employees?siteCd=&since=`, `GET /employees/page?siteCd=&offset=&limit=`.
pub struct HttpSourceConnector {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    site_cd: String,
    query_timeout: Duration,
}

impl HttpSourceConnector {
    pub fn new(base_url: &str, cfg: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .build()
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: cfg.api_token.clone().filter(|t| !t.is_empty()),
            site_cd: cfg.site_cd.clone(),
            query_timeout: Duration::from_millis(cfg.query_timeout_ms),
        })
    }
}

#[async_trait]
impl SourceConnector for HttpSourceConnector {
    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        debug!(base_url = %self.base_url, "connecting to source");
        Ok(Arc::new(HttpSourceConnection {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            site_cd: self.site_cd.clone(),
            query_timeout: self.query_timeout,
        }))
    }
}

pub struct HttpSourceConnection {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    site_cd: String,
    query_timeout: Duration,
}

impl HttpSourceConnection {
    fn get(&self, path: &str) -> RequestBuilder {
        let req = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .timeout(self.query_timeout);
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn map_err(&self, operation: &str, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.query_timeout.as_millis() as u64,
            }
        } else if e.is_connect() {
            SourceError::Unreachable(e.to_string())
        } else {
            SourceError::Query(e.to_string())
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        req: RequestBuilder,
    ) -> Result<T, SourceError> {
        let resp = req.send().await.map_err(|e| self.map_err(operation, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Query(format!("{operation} returned status {status}")));
        }
        resp.json::<T>().await.map_err(|e| self.map_err(operation, e))
    }
}

#[async_trait]
impl SourceConnection for HttpSourceConnection {
    async fn ping(&self) -> Result<(), SourceError> {
        let resp = self
            .get("/ping")
            .send()
            .await
            .map_err(|e| self.map_err("ping", e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SourceError::Unreachable(format!(
                "ping returned status {}",
                resp.status()
            )))
        }
    }

    async fn fetch_employees(&self, since: Option<&str>) -> Result<Vec<ExternalEmployee>, SourceError> {
        let mut query = vec![("siteCd", self.site_cd.as_str())];
        if let Some(since) = since {
            query.push(("since", since));
        }
        let rows: Vec<SourceRow> = self
            .send_json("fetch_employees", self.get("/employees").query(&query))
            .await?;
        Ok(rows.into_iter().map(ExternalEmployee::from).collect())
    }

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<EmployeePage, SourceError> {
        let offset = offset.to_string();
        let limit = limit.to_string();
        let query = [
            ("siteCd", self.site_cd.as_str()),
            ("offset", offset.as_str()),
            ("limit", limit.as_str()),
        ];
        let page: SourcePage = self
            .send_json("fetch_page", self.get("/employees/page").query(&query))
            .await?;
        Ok(EmployeePage {
            employees: page.employees.into_iter().map(ExternalEmployee::from).collect(),
            total: page.total,
        })
    }

    async fn close(&self) {}
}
