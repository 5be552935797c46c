//! Persistence of per-exam integration records.
//!
//! The store also tracks which exams take part in scheduled uploads.
use crate::client::{ClientError, ExamServiceClient};
use crate::types::IntegrationInfo;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed integration record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid exam id: {0:?}")]
    InvalidKey(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("integration payload has no exam_id")]
    MissingExamId,
    #[error("no integration stored for exam {0}")]
    NotFound(String),
    #[error("drop path must end with '/'")]
    InvalidDropPath,
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get(&self, exam_id: &str) -> Result<Option<IntegrationInfo>, StoreError>;
    async fn put(&self, exam_id: &str, info: &IntegrationInfo) -> Result<(), StoreError>;

    /// Exam ids enrolled in scheduled uploads, in sorted order.
    async fn scheduled(&self) -> Result<Vec<String>, StoreError>;
    async fn schedule(&self, exam_id: &str) -> Result<(), StoreError>;
    async fn unschedule(&self, exam_id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, IntegrationInfo>>,
    scheduled: RwLock<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn get(&self, exam_id: &str) -> Result<Option<IntegrationInfo>, StoreError> {
        Ok(self.records.read().get(exam_id).cloned())
    }

    async fn put(&self, exam_id: &str, info: &IntegrationInfo) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(exam_id.to_string(), info.clone());
        Ok(())
    }

    async fn scheduled(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.scheduled.read().iter().cloned().collect())
    }

    async fn schedule(&self, exam_id: &str) -> Result<(), StoreError> {
        self.scheduled.write().insert(exam_id.to_string());
        Ok(())
    }

    async fn unschedule(&self, exam_id: &str) -> Result<(), StoreError> {
        self.scheduled.write().remove(exam_id);
        Ok(())
    }
}

const SCHEDULED_FILE: &str = "scheduled.json";

/// Stores each record as `<base_dir>/<exam_id>.json` and the schedule as
/// `<base_dir>/scheduled.json`.
pub struct FilesystemStore {
    base_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        FilesystemStore {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self, exam_id: &str) -> Result<PathBuf, StoreError> {
        if exam_id.is_empty()
            || exam_id.contains(['/', '\\'])
            || exam_id.starts_with('.')
            || format!("{exam_id}.json") == SCHEDULED_FILE
        {
            return Err(StoreError::InvalidKey(exam_id.to_string()));
        }
        Ok(self.base_dir.join(format!("{exam_id}.json")))
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Write to a sibling temp file first so readers never see a partial record.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_scheduled(&self) -> Result<BTreeSet<String>, StoreError> {
        let path = self.base_dir.join(SCHEDULED_FILE);
        match Self::read_optional(&path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn store_scheduled(&self, scheduled: &BTreeSet<String>) -> Result<(), StoreError> {
        let path = self.base_dir.join(SCHEDULED_FILE);
        self.write_atomic(&path, &serde_json::to_vec(scheduled)?)
            .await
    }
}

#[async_trait]
impl IntegrationStore for FilesystemStore {
    async fn get(&self, exam_id: &str) -> Result<Option<IntegrationInfo>, StoreError> {
        let path = self.record_path(exam_id)?;
        match Self::read_optional(&path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, exam_id: &str, info: &IntegrationInfo) -> Result<(), StoreError> {
        let path = self.record_path(exam_id)?;
        self.write_atomic(&path, &serde_json::to_vec_pretty(info)?)
            .await
    }

    async fn scheduled(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.load_scheduled().await?.into_iter().collect())
    }

    async fn schedule(&self, exam_id: &str) -> Result<(), StoreError> {
        self.record_path(exam_id)?;
        let mut scheduled = self.load_scheduled().await?;
        if scheduled.insert(exam_id.to_string()) {
            self.store_scheduled(&scheduled).await?;
        }
        Ok(())
    }

    async fn unschedule(&self, exam_id: &str) -> Result<(), StoreError> {
        let mut scheduled = self.load_scheduled().await?;
        if scheduled.remove(exam_id) {
            self.store_scheduled(&scheduled).await?;
        }
        Ok(())
    }
}

/// Returns the stored record, or fetches the credentials from the exam
/// service and stores them when there is none yet.
pub async fn load_or_fetch(
    store: &dyn IntegrationStore,
    client: &ExamServiceClient,
    exam_id: &str,
) -> Result<IntegrationInfo, StoreError> {
    if let Some(info) = store.get(exam_id).await? {
        return Ok(info);
    }

    let info = client.fetch_credentials(exam_id).await?;
    store.put(exam_id, &info).await?;
    tracing::info!(exam_id, "Stored integration credentials");
    Ok(info)
}

/// Completes an integration handshake. Keys in the confirmed payload replace
/// those of any existing record; all other keys are kept.
pub async fn confirm(
    store: &dyn IntegrationStore,
    client: &ExamServiceClient,
    confirm_token: &str,
) -> Result<IntegrationInfo, StoreError> {
    let payload = client.confirm_integration(confirm_token).await?;
    let exam_id = payload
        .get("exam_id")
        .and_then(Value::as_str)
        .ok_or(StoreError::MissingExamId)?
        .to_string();

    let mut merged = match store.get(&exam_id).await? {
        Some(existing) => match serde_json::to_value(existing)? {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        None => Map::new(),
    };
    merged.extend(payload);

    let info: IntegrationInfo = serde_json::from_value(Value::Object(merged))?;
    store.put(&exam_id, &info).await?;
    tracing::info!(exam_id = %exam_id, "Integration confirmed");
    Ok(info)
}

/// Changes to an integration record. `None` leaves a field untouched, an
/// empty string clears it.
#[derive(Clone, Debug, Default)]
pub struct ConfigureSettings {
    pub secret: Option<String>,
    pub exam_code: Option<String>,
    pub drop_host: Option<String>,
    pub drop_port: Option<u16>,
    pub drop_user: Option<String>,
    pub drop_password: Option<String>,
    pub drop_path: Option<String>,
    pub last_timestamp: Option<String>,
}

fn apply(field: &mut Option<String>, update: Option<String>) {
    if let Some(value) = update {
        *field = Some(value).filter(|v| !v.trim().is_empty());
    }
}

/// Updates a stored record and enrolls the exam in scheduled uploads when a
/// drop host is configured, or removes it otherwise.
pub async fn configure(
    store: &dyn IntegrationStore,
    exam_id: &str,
    settings: ConfigureSettings,
) -> Result<IntegrationInfo, StoreError> {
    if let Some(path) = &settings.drop_path {
        if !path.is_empty() && !path.ends_with('/') {
            return Err(StoreError::InvalidDropPath);
        }
    }

    let mut info = store
        .get(exam_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(exam_id.to_string()))?;

    if let Some(secret) = settings.secret {
        info.secret = secret;
    }
    apply(&mut info.exam_code, settings.exam_code);
    apply(&mut info.drop_host, settings.drop_host);
    apply(&mut info.drop_user, settings.drop_user);
    apply(&mut info.drop_password, settings.drop_password);
    apply(&mut info.drop_path, settings.drop_path);
    apply(&mut info.last_timestamp, settings.last_timestamp);
    if settings.drop_port.is_some() {
        info.drop_port = settings.drop_port;
    }

    store.put(exam_id, &info).await?;
    if info.drop_host.is_some() {
        store.schedule(exam_id).await?;
    } else {
        store.unschedule(exam_id).await?;
    }

    tracing::info!(
        exam_id,
        scheduled = info.drop_host.is_some(),
        "Integration configured"
    );
    Ok(info)
}
