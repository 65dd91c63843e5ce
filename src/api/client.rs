use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ApiError, JobApi};
use crate::cli::config::ApiSettings;
use crate::lease::{Link, Rule};

/// Job API client talking to a remote coordinator over HTTP
pub struct HttpJobApi {
    client: Client,
    base_url: String,
}

impl HttpJobApi {
    pub fn new(settings: &ApiSettings) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout.max(1)))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.distributor_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn fetch_rule(&self, rule_id: Option<String>) -> Result<Option<Rule>, ApiError> {
        let request = self.client.get(self.endpoint("/rules"));
        let request = match rule_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => request.query(&[("ruleid", id)]),
            None => request.query(&[("isscraper", "1")]),
        };

        let rules: Vec<Rule> = read_json(request.send().await?).await?;
        debug!("Job API returned {} rules", rules.len());

        Ok(rules.into_iter().next())
    }

    async fn allocate(&self, rule_id: &str, worker: &str, size: usize) -> Result<Vec<Link>, ApiError> {
        let size = size.to_string();
        let response = self
            .client
            .get(self.endpoint("/links"))
            .query(&[("ruleid", rule_id), ("worker", worker), ("size", size.as_str())])
            .send()
            .await?;

        read_json(response).await
    }

    async fn complete(&self, link_ids: &[String]) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.endpoint("/links"))
            .json(&json!({ "linkids": link_ids }))
            .send()
            .await?;

        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> HttpJobApi {
        HttpJobApi::new(&ApiSettings {
            distributor_url: format!("{}/api/v1/dist/", server.uri()),
            ..ApiSettings::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_rule_for_any_worker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/dist/rules"))
            .and(query_param("isscraper", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "r1",
                "pattern": "{}",
                "targetLocation": "results",
                "linkPattern": "http://x/{page}"
            }])))
            .mount(&server)
            .await;

        let rule = client_for(&server).await.fetch_rule(None).await.unwrap().unwrap();

        assert_eq!(rule.id, "r1");
        assert_eq!(rule.target_location, "results");
    }

    #[tokio::test]
    async fn test_allocate_and_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/dist/links"))
            .and(query_param("ruleid", "r1"))
            .and(query_param("worker", "w1"))
            .and(query_param("size", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "l1",
                "link": "http://x/1",
                "status": "Running",
                "worker": "w1",
                "ruleID": "r1",
                "lastUpdate": 1_700_000_000_000_i64
            }])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/dist/links"))
            .and(body_json(serde_json::json!({ "linkids": ["l1"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let api = client_for(&server).await;
        let links = api.allocate("r1", "w1", 5).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].worker, "w1");

        api.complete(&["l1".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/dist/rules"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({ "error": "rule x" })))
            .mount(&server)
            .await;

        let result = client_for(&server).await.fetch_rule(Some("x".to_string())).await;

        assert!(matches!(result, Err(ApiError::Status { status: 404, .. })));
    }
}
