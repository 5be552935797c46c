use crate::client::{ClientError, DeliveryQuery, ExamServiceClient};
use crate::counter;
use crate::metrics_defs::PAGES_FETCHED;
use serde_json::Value;

/// Forward-only walk over the delivery listing.
///
/// Pages are requested one at a time starting at 1. Once the service reports
/// `has_next: false` the walk is finished and further calls return `None`.
/// Any request failure is returned to the caller and ends the walk.
pub struct DeliveryPages {
    client: ExamServiceClient,
    token: String,
    query: DeliveryQuery,
    next_page: u32,
    done: bool,
}

impl DeliveryPages {
    pub fn new(client: ExamServiceClient, token: String, query: DeliveryQuery) -> Self {
        DeliveryPages {
            client,
            token,
            query,
            next_page: 1,
            done: false,
        }
    }

    /// Number of the page the next call will request.
    pub fn page(&self) -> u32 {
        self.next_page
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ClientError> {
        if self.done {
            return Ok(None);
        }

        let result = self
            .client
            .delivery_page(&self.token, &self.query, self.next_page)
            .await;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        counter!(PAGES_FETCHED).increment(1);
        tracing::debug!(
            exam_id = %self.query.exam_id,
            page = self.next_page,
            records = page.results.len(),
            "Fetched delivery page"
        );

        self.next_page += 1;
        self.done = !page.has_next;
        Ok(Some(page.results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::test_client;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> DeliveryQuery {
        DeliveryQuery {
            exam_id: "exam1".into(),
            start: Some("2020-01-01T00:00:00".into()),
            end: None,
            include_item_responses: false,
        }
    }

    #[tokio::test]
    async fn test_walks_until_has_next_false() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/deliveries"))
            .and(query_param("page", "1"))
            .and(query_param("status", "complete"))
            .and(query_param("sort", "modified_at"))
            .and(query_param("modified_after", "2020-01-01T00:00:00"))
            .and(query_param_is_missing("modified_before"))
            .and(query_param_is_missing("include"))
            .and(bearer_token("tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "has_next": true,
                "results": [{"id": "d1"}, {"id": "d2"}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/deliveries"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "has_next": false,
                "results": [{"id": "d3"}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut pages = DeliveryPages::new(test_client(&mock_server.uri()), "tok".into(), query());

        let first = pages.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(pages.page(), 2);

        let second = pages.next_page().await.unwrap().unwrap();
        assert_eq!(second, vec![json!({"id": "d3"})]);

        assert!(pages.next_page().await.unwrap().is_none());
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_include_and_end_bound() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/deliveries"))
            .and(query_param("include", "item_responses"))
            .and(query_param("modified_before", "2020-02-01T00:00:00+00:00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "has_next": false,
                "results": []
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let query = DeliveryQuery {
            end: Some("2020-02-01T00:00:00+00:00".into()),
            include_item_responses: true,
            ..query()
        };
        let mut pages = DeliveryPages::new(test_client(&mock_server.uri()), "tok".into(), query);

        assert_eq!(pages.next_page().await.unwrap(), Some(vec![]));
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_ends_walk() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/deliveries"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut pages = DeliveryPages::new(test_client(&mock_server.uri()), "tok".into(), query());

        assert!(matches!(
            pages.next_page().await,
            Err(ClientError::Status { .. })
        ));
        assert!(pages.next_page().await.unwrap().is_none());
    }
}
