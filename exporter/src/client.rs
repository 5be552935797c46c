use crate::config::ExamService as ExamServiceConfig;
use crate::types::{IntegrationInfo, ItemVersion};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("exam service request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("exam service returned {status} for {url}")]
    Status { url: String, status: StatusCode },
    #[error("no access to exam {0}")]
    NoAccess(String),
    #[error("integration confirmation was rejected")]
    ConfirmRejected,
}

#[derive(Deserialize)]
struct ExamName {
    name: String,
}

/// One page of the delivery listing. Records are kept as raw JSON so a
/// single malformed record can be skipped without losing the page.
#[derive(Debug, Deserialize)]
pub struct DeliveryPage {
    pub has_next: bool,
    #[serde(default)]
    pub results: Vec<Value>,
}

/// Filters for the delivery listing endpoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveryQuery {
    pub exam_id: String,
    /// Exclusive lower bound on `modified_at`.
    pub start: Option<String>,
    /// Upper bound on `modified_at`.
    pub end: Option<String>,
    pub include_item_responses: bool,
}

/// HTTP client for the exam service.
#[derive(Clone)]
pub struct ExamServiceClient {
    client: reqwest::Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl ExamServiceClient {
    pub fn new(config: &ExamServiceConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(config.base_url.clone()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(ExamServiceClient {
            client,
            base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url: response.url().to_string(),
                status,
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// Fetches the integration credentials the exam service holds for this
    /// connector. Used when no record exists locally yet.
    pub async fn fetch_credentials(&self, exam_id: &str) -> Result<IntegrationInfo, ClientError> {
        let url = self.url(&["api", "integrations", exam_id, "credentials"])?;
        let request = self
            .client
            .get(url)
            .basic_auth(&self.client_id, Some(&self.client_secret));

        match self.get_json(request).await {
            Err(ClientError::Status { .. }) => Err(ClientError::NoAccess(exam_id.to_string())),
            other => other,
        }
    }

    /// Completes the integration handshake for a confirm token. The raw
    /// payload is returned so it can be merged over an existing record.
    pub async fn confirm_integration(
        &self,
        confirm_token: &str,
    ) -> Result<Map<String, Value>, ClientError> {
        let url = self.url(&["api", "integrations", "confirm", confirm_token])?;
        let request = self
            .client
            .get(url)
            .basic_auth(&self.client_id, Some(&self.client_secret));

        match self.get_json(request).await {
            Err(ClientError::Status { .. }) => Err(ClientError::ConfirmRejected),
            other => other,
        }
    }

    /// Exam title with double quotes removed.
    pub async fn exam_title(&self, exam_id: &str, token: &str) -> Result<String, ClientError> {
        let mut url = self.url(&["api", "exams", exam_id])?;
        url.query_pairs_mut().append_pair("only", "name");

        let exam: ExamName = self
            .get_json(self.client.get(url).bearer_auth(token))
            .await?;
        Ok(exam.name.replace('"', ""))
    }

    pub async fn delivery_page(
        &self,
        token: &str,
        query: &DeliveryQuery,
        page: u32,
    ) -> Result<DeliveryPage, ClientError> {
        let mut url = self.url(&["api", "exams", &query.exam_id, "deliveries"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("status", "complete");
            pairs.append_pair("sort", "modified_at");
            if let Some(start) = &query.start {
                pairs.append_pair("modified_after", start);
            }
            if let Some(end) = &query.end {
                pairs.append_pair("modified_before", end);
            }
            if query.include_item_responses {
                pairs.append_pair("include", "item_responses");
            }
            pairs.append_pair("page", &page.to_string());
        }

        self.get_json(self.client.get(url).bearer_auth(token)).await
    }

    pub async fn item_version(
        &self,
        exam_id: &str,
        token: &str,
        item_version_id: &str,
    ) -> Result<ItemVersion, ClientError> {
        let mut url = self.url(&["api", "exams", exam_id, "item_versions", item_version_id])?;
        url.query_pairs_mut().append_pair("include", "item");

        self.get_json(self.client.get(url).bearer_auth(token)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, bearer_token, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub fn test_client(base_url: &str) -> ExamServiceClient {
        ExamServiceClient::new(&ExamServiceConfig {
            base_url: base_url.to_string(),
            client_id: "connector".into(),
            client_secret: "connector-secret".into(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ExamServiceClient::new(&ExamServiceConfig {
            base_url: "not a url".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            timeout_secs: 5,
        });
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_fetch_credentials() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/integrations/exam1/credentials"))
            .and(basic_auth("connector", "connector-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exam_id": "exam1",
                "token": "tok",
                "secret": "shh"
            })))
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let info = client.fetch_credentials("exam1").await.unwrap();
        assert_eq!(info.exam_id, "exam1");
        assert_eq!(info.token, "tok");

        let result = client.fetch_credentials("exam2").await;
        assert!(matches!(result, Err(ClientError::NoAccess(id)) if id == "exam2"));
    }

    #[tokio::test]
    async fn test_confirm_integration() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/integrations/confirm/abc"))
            .and(basic_auth("connector", "connector-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exam_id": "exam1",
                "token": "tok",
                "secret": "shh"
            })))
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let payload = client.confirm_integration("abc").await.unwrap();
        assert_eq!(payload["exam_id"], json!("exam1"));

        let result = client.confirm_integration("expired").await;
        assert!(matches!(result, Err(ClientError::ConfirmRejected)));
    }

    #[tokio::test]
    async fn test_exam_title_strips_quotes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1"))
            .and(query_param("only", "name"))
            .and(bearer_token("tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"name": "The \"Big\" Exam"})),
            )
            .mount(&mock_server)
            .await;

        let client = test_client(&format!("{}/", mock_server.uri()));
        let title = client.exam_title("exam1", "tok").await.unwrap();
        assert_eq!(title, "The Big Exam");
    }

    #[tokio::test]
    async fn test_item_version() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/item_versions/v1"))
            .and(query_param("include", "item"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "v1",
                "settings": {"type": "multiple_choice", "key": [false, true], "scoring": "partial"},
                "item": {"name": "Q1", "content_area": "A|B"}
            })))
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let version = client.item_version("exam1", "tok", "v1").await.unwrap();
        assert!(version.is_multiple_choice());
        assert!(version.is_partial_scoring());
        assert_eq!(version.answer_key(), Some(vec![false, true]));
    }

    #[tokio::test]
    async fn test_http_error_handling() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/deliveries"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let query = DeliveryQuery {
            exam_id: "exam1".into(),
            ..Default::default()
        };
        let result = client.delivery_page("tok", &query, 1).await;

        let error_msg = result.unwrap_err().to_string();
        assert!(error_msg.contains("503"));
    }
}
