use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;

pub type ExamId = String;

/// Per-exam integration record, created by the handshake and updated on
/// reconfiguration. Keys the exporter does not know about are carried along
/// untouched so that other connectors sharing the record keep their settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IntegrationInfo {
    pub exam_id: ExamId,
    pub token: String,
    pub secret: String,
    #[serde(
        default,
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub exam_code: Option<String>,
    #[serde(
        default,
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_timestamp: Option<String>,
    #[serde(
        default,
        rename = "sftp_host",
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub drop_host: Option<String>,
    #[serde(
        default,
        rename = "sftp_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub drop_port: Option<u16>,
    #[serde(
        default,
        rename = "sftp_user",
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub drop_user: Option<String>,
    #[serde(
        default,
        rename = "sftp_password",
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub drop_password: Option<String>,
    #[serde(
        default,
        rename = "sftp_path",
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub drop_path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IntegrationInfo {
    /// Destination settings for scheduled uploads. `None` until a drop host
    /// has been configured for the exam.
    pub fn drop_settings(&self) -> Option<DropSettings> {
        let host = self.drop_host.clone()?;
        Some(DropSettings {
            host,
            port: self.drop_port,
            user: self.drop_user.clone(),
            password: self.drop_password.clone(),
            path: self.drop_path.clone().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DropSettings {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    // Always empty or ending with '/'
    pub path: String,
}

// Form submissions store cleared fields as "", which means "unset".
fn non_empty<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(s) if !s.trim().is_empty() => s.parse().map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Examinee {
    #[serde(default)]
    pub info: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Cutscore {
    #[serde(default)]
    pub score: Option<Number>,
}

/// One examinee attempt as returned by the delivery listing endpoint.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub id: String,
    pub modified_at: String,
    #[serde(default)]
    pub exam_id: Option<String>,
    #[serde(default)]
    pub examinee_id: Option<String>,
    #[serde(default)]
    pub examinee: Examinee,
    #[serde(default)]
    pub score: Option<Number>,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub rescored: Option<bool>,
    #[serde(default)]
    pub points_earned: Option<Value>,
    #[serde(default)]
    pub points_available: Option<Value>,
    #[serde(default)]
    pub cutscore: Option<Cutscore>,
    #[serde(default)]
    pub used_seconds: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub form_id: Option<String>,
    #[serde(default)]
    pub item_responses: Option<Vec<ItemResponse>>,
}

impl DeliveryRecord {
    pub fn item_version_ids(&self) -> impl Iterator<Item = &str> {
        self.item_responses
            .iter()
            .flatten()
            .map(|response| response.item_version_id.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ItemResponse {
    pub item_version_id: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub seconds: Option<f64>,
    // The examinee's final answer. Null when the item was left unanswered.
    #[serde(default, rename = "final")]
    pub final_response: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ItemSettings {
    #[serde(default, rename = "type")]
    pub kind: String,
    // Shape depends on the item type: a list of booleans for multiple
    // choice, free-form for everything else.
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub scoring: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ItemSummary {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_area: Option<String>,
}

/// Scored question variant referenced by item responses.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ItemVersion {
    pub id: String,
    pub settings: ItemSettings,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub item: Option<ItemSummary>,
}

impl ItemVersion {
    pub fn is_multiple_choice(&self) -> bool {
        self.settings.kind == "multiple_choice"
    }

    pub fn is_partial_scoring(&self) -> bool {
        self.settings.scoring.as_deref() == Some("partial")
    }

    /// The correct options of a multiple-choice item, or `None` when the key
    /// is not a list of booleans.
    pub fn answer_key(&self) -> Option<Vec<bool>> {
        self.settings.key.as_array()?.iter().map(Value::as_bool).collect()
    }
}

/// Shape of a single output stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowKind {
    Candidate,
    Exam,
    Item,
}

impl RowKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RowKind::Candidate => "cand",
            RowKind::Exam => "exam",
            RowKind::Item => "item",
        }
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Which column sets an export run produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportView {
    Candidate,
    Exam,
    Item,
    Combined,
}

impl ExportView {
    pub fn row_kinds(&self) -> &'static [RowKind] {
        match self {
            ExportView::Candidate => &[RowKind::Candidate],
            ExportView::Exam => &[RowKind::Exam],
            ExportView::Item => &[RowKind::Item],
            ExportView::Combined => &[RowKind::Candidate, RowKind::Exam, RowKind::Item],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportView::Candidate => "cand",
            ExportView::Exam => "exam",
            ExportView::Item => "item",
            ExportView::Combined => "all",
        }
    }

    pub fn includes(&self, kind: RowKind) -> bool {
        self.row_kinds().contains(&kind)
    }

    /// The single stream this view produces, if it produces exactly one.
    pub fn single(&self) -> Option<RowKind> {
        match self.row_kinds() {
            [kind] => Some(*kind),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown export view: {0}")]
pub struct UnknownView(String);

impl FromStr for ExportView {
    type Err = UnknownView;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cand" | "candidate" => Ok(ExportView::Candidate),
            "exam" => Ok(ExportView::Exam),
            "item" => Ok(ExportView::Item),
            "all" | "combined" => Ok(ExportView::Combined),
            other => Err(UnknownView(other.to_string())),
        }
    }
}
