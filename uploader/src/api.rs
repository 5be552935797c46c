use crate::archive::{ArchiveError, zip_bytes};
use crate::config::Listener as ListenerConfig;
use crate::job::UploadContext;
use crate::metrics_defs::API_EXPORTS;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use exporter::client::ClientError;
use exporter::store::{StoreError, load_or_fetch};
use exporter::{CsvSink, ExportError, ExportOptions, ExportView, Exporter, RowKind, Sinks, counter};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("exam service request failed: {0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Client(ClientError::NoAccess(_)) | StoreError::NotFound(_) => {
                ApiError::NotFound(error.to_string())
            }
            StoreError::InvalidKey(_) => ApiError::BadRequest(error.to_string()),
            StoreError::Client(e) => ApiError::Upstream(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(error: ExportError) -> Self {
        match error {
            ExportError::Client(e) => ApiError::Upstream(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(error: ArchiveError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::IoError(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<UploadContext>,
    pub ready: Arc<AtomicBool>,
}

/// Routes for health checks and on-demand exports.
///
/// `/export` carries no authentication and returns any stored tenant's data,
/// so the router must only be reachable from inside the deployment.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/export", get(export))
        .with_state(state)
}

/// Serves `router` until `shutdown` resolves. Bind an internal address only;
/// the default listener is loopback.
pub async fn serve<F>(listener: ListenerConfig, state: ApiState, shutdown: F) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", listener.host, listener.port);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<ApiState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[derive(Deserialize, Debug)]
struct ExportParams {
    exam_id: String,
    #[serde(default, alias = "type")]
    view: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

// A bare date as the end bound means "through the end of that day".
fn end_bound(end: String) -> String {
    match NaiveDate::parse_from_str(&end, "%Y-%m-%d") {
        Ok(date) => date
            .succ_opt()
            .map(|next| next.format("%Y-%m-%d").to_string())
            .unwrap_or(end),
        Err(_) => end,
    }
}

async fn export(
    State(state): State<ApiState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let view: ExportView = params
        .view
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(|e: exporter::types::UnknownView| ApiError::BadRequest(e.to_string()))?;

    let result = run_export(&state.ctx, view, params).await;

    let status = if result.is_ok() { "ok" } else { "error" };
    counter!(API_EXPORTS, "view" => view.name(), "status" => status).increment(1);

    result
}

async fn run_export(
    ctx: &UploadContext,
    view: ExportView,
    params: ExportParams,
) -> Result<Response, ApiError> {
    let info = load_or_fetch(ctx.store.as_ref(), &ctx.client, &params.exam_id).await?;
    let mut exporter = Exporter::new(
        ctx.client.clone(),
        info,
        view,
        params.start,
        params.end.map(end_bound),
        ExportOptions::from_config(&ctx.export),
    )
    .await?;
    let format = ctx.export.csv_format();

    if let Some(kind) = view.single() {
        let mut sink = CsvSink::new(Vec::new(), format);
        {
            let mut sinks = Sinks::new().with(kind, &mut sink);
            exporter.generate(&mut sinks).await?;
        }
        let body = sink.into_inner()?;

        return Ok(attachment("text/csv", &exporter.filename(), body));
    }

    let mut cand = CsvSink::new(Vec::new(), format);
    let mut exam = CsvSink::new(Vec::new(), format);
    let mut item = CsvSink::new(Vec::new(), format);
    {
        let mut sinks = Sinks::new()
            .with(RowKind::Candidate, &mut cand)
            .with(RowKind::Exam, &mut exam)
            .with(RowKind::Item, &mut item);
        exporter.generate(&mut sinks).await?;
    }

    let archive = zip_bytes(&[
        (exporter.filename_for(RowKind::Candidate), cand.into_inner()?),
        (exporter.filename_for(RowKind::Exam), exam.into_inner()?),
        (exporter.filename_for(RowKind::Item), item.into_inner()?),
    ])?;
    let filename = format!("{}-{}.zip", exporter.exam_id(), exporter.stamp());

    Ok(attachment("application/zip", &filename, archive))
}

fn attachment(content_type: &str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::{context, delivery, mount_exam, tenant};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use exporter::store::{IntegrationStore, MemoryStore};
    use std::io::Read;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn app(server: &MockServer) -> (Router, Arc<MemoryStore>, Arc<AtomicBool>) {
        let drop_dir = tempfile::tempdir().unwrap();
        let (ctx, store) = context(server, drop_dir.path());
        store
            .put("exam1", &tenant("exam1", None))
            .await
            .unwrap();

        let ready = Arc::new(AtomicBool::new(false));
        let state = ApiState {
            ctx: Arc::new(ctx),
            ready: ready.clone(),
        };
        (router(state), store, ready)
    }

    async fn get_response(app: &Router, uri: &str) -> (StatusCode, Vec<(String, String)>, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap().to_string()))
            .collect();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_end_bound() {
        assert_eq!(end_bound("2020-01-31".into()), "2020-02-01");
        assert_eq!(
            end_bound("2020-01-31T10:00:00".into()),
            "2020-01-31T10:00:00"
        );
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let mock_server = MockServer::start().await;
        let (app, _store, ready) = app(&mock_server).await;

        let (status, _, body) = get_response(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");

        let (status, _, _) = get_response(&app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::Relaxed);
        let (status, _, _) = get_response(&app, "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_export_single_view() {
        let mock_server = MockServer::start().await;
        mount_exam(
            &mock_server,
            "exam1",
            vec![delivery("d1", "2020-01-02T00:00:00")],
        )
        .await;
        let (app, store, _) = app(&mock_server).await;

        let (status, headers, body) = get_response(
            &app,
            "/export?exam_id=exam1&view=exam&start=2020-01-01T00:00:00",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(header(&headers, "content-type"), Some("text/csv"));
        let disposition = header(&headers, "content-disposition").unwrap();
        assert!(disposition.starts_with("attachment; filename=\"exam-"));

        let mut reader = csv::ReaderBuilder::new().from_reader(body.as_slice());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "d1");
        assert_eq!(&rows[0][5], "f");

        // Downloads never move the stored watermark
        let stored = store.get("exam1").await.unwrap().unwrap();
        assert_eq!(
            stored.last_timestamp.as_deref(),
            Some("2020-01-01T00:00:00")
        );
    }

    #[tokio::test]
    async fn test_export_combined_is_zipped() {
        let mock_server = MockServer::start().await;
        mount_exam(
            &mock_server,
            "exam1",
            vec![delivery("d1", "2020-01-02T00:00:00")],
        )
        .await;
        let (app, _, _) = app(&mock_server).await;

        let (status, headers, body) =
            get_response(&app, "/export?exam_id=exam1&start=2020-01-01T00:00:00").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(header(&headers, "content-type"), Some("application/zip"));

        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(body)).unwrap();
        assert_eq!(zip.len(), 3);
        let name = zip
            .file_names()
            .find(|name| name.starts_with("item-"))
            .unwrap()
            .to_string();
        let mut items = String::new();
        zip.by_name(&name)
            .unwrap()
            .read_to_string(&mut items)
            .unwrap();
        assert_eq!(items.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_export_end_date_covers_whole_day() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/exams/exam1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "X"})))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/exams/exam1/deliveries"))
            .and(query_param("modified_before", "2020-02-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "has_next": false,
                "results": []
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        let (app, _, _) = app(&mock_server).await;

        let (status, _, _) = get_response(&app, "/export?exam_id=exam1&type=cand&end=2020-01-31").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_export_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/exams/exam1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;
        let (app, _, _) = app(&mock_server).await;

        let (status, _, _) = get_response(&app, "/export?exam_id=exam1&view=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = get_response(&app, "/export?view=exam").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Not stored locally and the credentials lookup is refused
        let (status, _, _) = get_response(&app, "/export?exam_id=unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, body) = get_response(&app, "/export?exam_id=exam1&view=exam").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(String::from_utf8(body).unwrap().contains("500"));
    }
}
