//! Turns delivery records into output rows.
//!
//! Everything here is pure: item metadata is resolved by the caller before a
//! record is mapped, and the only failure modes are the record-skippable
//! [`MappingError`] variants.

use crate::sink::{Cell, Row};
use crate::types::{DeliveryRecord, ExportView, ItemResponse, ItemVersion, RowKind};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

pub const CANDIDATE_COLUMNS: &[&str] = &[
    "cand_id",
    "cand_client_id",
    "cand_last_update",
    // Demographic block, kept empty until the exam service exposes it
    "cand_first_name",
    "cand_middle_name",
    "cand_last_name",
    "cand_email",
    "cand_address1",
    "cand_address2",
    "cand_city",
    "cand_state",
    "cand_postal_code",
    "cand_country",
    "cand_phone",
];

const CANDIDATE_RESERVED: usize = CANDIDATE_COLUMNS.len() - 3;

pub const EXAM_COLUMNS: &[&str] = &[
    "exam_id",
    "exam_cand_id",
    "exam_code",
    "exam_date_time",
    "exam_time_spent",
    "exam_grade",
    "exam_score",
    "exam_rescored",
    "exam_passing_score",
    "exam_title",
    "exam_form",
    "exam_items_correct",
    "exam_items_incorrect",
    "exam_items_skipped",
    "exam_result_status",
    "exam_score_scaled",
];

pub const ITEM_COLUMNS: &[&str] = &[
    "item_exam_id",
    "item_name",
    "item_type",
    "item_status",
    "item_score",
    "item_time_spent",
    "item_response",
    "item_key",
    "item_content_area",
];

pub fn columns(kind: RowKind) -> &'static [&'static str] {
    match kind {
        RowKind::Candidate => CANDIDATE_COLUMNS,
        RowKind::Exam => EXAM_COLUMNS,
        RowKind::Item => ITEM_COLUMNS,
    }
}

pub fn header_row(kind: RowKind) -> Row {
    columns(kind).iter().map(|c| Cell::from(*c)).collect()
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MappingError {
    #[error("examinee token failed signature verification")]
    InvalidSecret,
    #[error("invalid delivery: {0}")]
    InvalidDelivery(String),
}

impl MappingError {
    /// Short label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            MappingError::InvalidSecret => "invalid_secret",
            MappingError::InvalidDelivery(_) => "invalid_delivery",
        }
    }
}

/// Per-run values shared by every record.
pub struct MappingContext<'a> {
    pub exam_title: &'a str,
    pub exam_code: &'a str,
    pub secret: &'a str,
    pub check_secret: bool,
    pub item_versions: &'a HashMap<String, ItemVersion>,
}

#[derive(Debug, Default, PartialEq)]
pub struct MappedRows {
    pub candidate: Option<Row>,
    pub exam: Option<Row>,
    pub items: Vec<Row>,
}

pub fn map_record(
    view: ExportView,
    delivery: &DeliveryRecord,
    ctx: &MappingContext<'_>,
) -> Result<MappedRows, MappingError> {
    let mut rows = MappedRows::default();
    if view.includes(RowKind::Candidate) {
        rows.candidate = Some(candidate_row(delivery, ctx)?);
    }
    if view.includes(RowKind::Exam) {
        rows.exam = Some(exam_row(delivery, ctx)?);
    }
    if view.includes(RowKind::Item) {
        rows.items = item_rows(delivery, ctx);
    }
    Ok(rows)
}

pub fn candidate_row(
    delivery: &DeliveryRecord,
    ctx: &MappingContext<'_>,
) -> Result<Row, MappingError> {
    let client_id = client_id(&delivery.examinee.info, ctx.secret, ctx.check_secret)?;

    let mut row = vec![
        Cell::from(delivery.examinee_id.clone().unwrap_or_default()),
        Cell::from(client_id),
        Cell::from(trim_fraction(delivery.created_at.as_deref().unwrap_or(""))),
    ];
    row.extend(std::iter::repeat_n(Cell::from(""), CANDIDATE_RESERVED));
    Ok(row)
}

pub fn exam_row(delivery: &DeliveryRecord, ctx: &MappingContext<'_>) -> Result<Row, MappingError> {
    let items_correct = number(delivery.points_earned.as_ref(), "points_earned")?;
    let items_total = number(delivery.points_available.as_ref(), "points_available")?;
    let items_incorrect = items_total - items_correct;

    let grade = if delivery.passed.unwrap_or(false) {
        "p"
    } else {
        "f"
    };
    let score = delivery
        .score
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_default();
    let cutscore = delivery
        .cutscore
        .as_ref()
        .and_then(|c| c.score.as_ref())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let submitted_at = delivery
        .submitted_at
        .as_deref()
        .unwrap_or(&delivery.modified_at);
    let time_spent = delivery
        .used_seconds
        .map(|s| (s.trunc() as i64).to_string())
        .unwrap_or_default();
    let rescored = if delivery.rescored.unwrap_or(false) {
        "1"
    } else {
        "0"
    };

    Ok(vec![
        Cell::from(delivery.id.as_str()),
        Cell::from(delivery.examinee_id.clone().unwrap_or_default()),
        Cell::from(ctx.exam_code),
        Cell::from(trim_fraction(submitted_at)),
        Cell::from(time_spent),
        Cell::from(grade),
        Cell::from(score.clone()),
        Cell::from(rescored),
        Cell::from(cutscore),
        Cell::Text(ctx.exam_title.to_string()),
        Cell::from(delivery.form_id.clone().unwrap_or_default()),
        Cell::from(format_number(items_correct)),
        Cell::from(format_number(items_incorrect)),
        Cell::from("0"),
        Cell::from("OK"),
        Cell::from(score),
    ])
}

/// One row per multiple-choice response. Responses to other item types, to
/// item versions that could not be resolved, or to items whose answer key is
/// malformed produce no row.
pub fn item_rows(delivery: &DeliveryRecord, ctx: &MappingContext<'_>) -> Vec<Row> {
    delivery
        .item_responses
        .iter()
        .flatten()
        .filter_map(|response| {
            let version = ctx.item_versions.get(&response.item_version_id)?;
            if !version.is_multiple_choice() {
                return None;
            }
            let key = version.answer_key()?;
            Some(item_row(delivery, response, version, &key))
        })
        .collect()
}

fn item_row(
    delivery: &DeliveryRecord,
    response: &ItemResponse,
    version: &ItemVersion,
    key: &[bool],
) -> Row {
    let summary = version.item.as_ref();
    let name = summary
        .and_then(|s| s.name.clone())
        .unwrap_or_else(|| version.id.clone());
    let content_area = summary
        .and_then(|s| s.content_area.as_deref())
        .unwrap_or("")
        .replace('|', ",");

    let item_type = if version.is_partial_scoring() { "m" } else { "s" };
    let status = match response.score {
        Some(score) if score == 1.0 => "c",
        Some(score) if score > 0.0 && score < 1.0 => "a",
        _ => "i",
    };
    let score = response.score.map(format_number).unwrap_or_default();
    let time_spent = response
        .seconds
        .map(|s| (s.round() as i64).to_string())
        .unwrap_or_default();
    let selected = response
        .final_response
        .as_ref()
        .map(selected_options)
        .unwrap_or_default();

    vec![
        Cell::from(delivery.id.as_str()),
        Cell::Text(name),
        Cell::from(item_type),
        Cell::from(status),
        Cell::from(score),
        Cell::from(time_spent),
        Cell::from(list_to_alpha(&selected)),
        Cell::from(list_to_alpha(key)),
        Cell::from(content_area),
    ]
}

// A final answer is either the option list itself or an object carrying it
// under "response".
fn selected_options(value: &Value) -> Vec<bool> {
    let options = match value {
        Value::Array(options) => options,
        Value::Object(map) => match map.get("response") {
            Some(Value::Array(options)) => options,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    options
        .iter()
        .map(|option| match option {
            Value::Bool(selected) => *selected,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        })
        .collect()
}

/// Resolves the examinee's client identifier.
///
/// An explicit `id` wins. Otherwise a signed `jwt` is verified with the
/// tenant secret and its `id` claim is used. A token that fails verification
/// rejects the record when `check_secret` is set and yields an empty id
/// otherwise.
pub fn client_id(
    info: &Map<String, Value>,
    secret: &str,
    check_secret: bool,
) -> Result<String, MappingError> {
    if let Some(id) = info.get("id") {
        return Ok(value_to_string(id));
    }

    let Some(token) = info.get("jwt") else {
        return Ok(String::new());
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = HashSet::new();
    let key = DecodingKey::from_secret(secret.as_bytes());

    let decoded = token.as_str().map(|token| {
        jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
    });

    match decoded {
        Some(Ok(data)) => Ok(data.claims.get("id").map(value_to_string).unwrap_or_default()),
        _ if check_secret => Err(MappingError::InvalidSecret),
        _ => Ok(String::new()),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Encodes selected positions as letter groups in bijective base 25 using
/// `A`..`Y`, one group per `true` entry, concatenated in order.
///
/// Downstream consumers of historical exports decode with exactly this
/// alphabet, so position 25 is `AA`, not `Z`.
pub fn list_to_alpha(options: &[bool]) -> String {
    let mut encoded = String::new();
    for (position, _) in options.iter().enumerate().filter(|(_, selected)| **selected) {
        let mut n = position as i64;
        let mut group = Vec::new();
        while n >= 0 {
            group.push((b'A' + (n % 25) as u8) as char);
            n = n / 25 - 1;
        }
        encoded.extend(group.iter().rev());
    }
    encoded
}

/// Short exam code derived from the title: the uppercase initials of its words.
pub fn exam_code_from_title(title: &str) -> String {
    title
        .split_whitespace()
        .filter_map(|word| word.chars().find(|c| c.is_alphanumeric()))
        .flat_map(char::to_uppercase)
        .collect()
}

/// Drops fractional seconds from an ISO-8601 timestamp, keeping any zone suffix.
pub fn trim_fraction(timestamp: &str) -> String {
    let Some(dot) = timestamp.find('.') else {
        return timestamp.to_string();
    };
    let rest = &timestamp[dot + 1..];
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    format!("{}{}", &timestamp[..dot], &rest[digits..])
}

fn number(value: Option<&Value>, field: &str) -> Result<f64, MappingError> {
    value
        .and_then(Value::as_f64)
        .ok_or_else(|| MappingError::InvalidDelivery(format!("{field} is not numeric")))
}

fn format_number(value: f64) -> String {
    // f64 Display prints integral values without a fractional part
    value.to_string()
}
