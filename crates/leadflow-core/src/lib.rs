//! Core domain model for the leadflow enrichment pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "leadflow-core";

/// Lifecycle status the scraping job service reports for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Running,
    Ready,
    #[serde(other)]
    Other,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Running => "running",
            SnapshotStatus::Ready => "ready",
            SnapshotStatus::Other => "other",
        }
    }
}

/// One scrape job as observed on the provider's snapshot listing.
/// Immutable once observed; the wire field for creation time is `created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: SnapshotStatus,
    #[serde(default, alias = "created")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Which dataset a seed URL belongs to. Parameterizes dataset ids, state
/// files, payload cache directories, and merge semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Profile,
    Company,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Profile => "profile",
            EntityKind::Company => "company",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovered-entity stub carried in `similar_profiles`, `people_also_viewed`
/// and company `similar` sub-lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStub {
    pub url: Option<String>,
    pub name: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
}

/// Profile payload record: typed linkage fields plus the open remainder of
/// the scraped payload, which drives column discovery during the merge.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileRecord {
    pub input_url: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub similar_profiles: Vec<EntityStub>,
    #[serde(default)]
    pub people_also_viewed: Vec<EntityStub>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompanyInput {
    pub url: Option<String>,
}

/// Company payload record; linkage lives under `input.url`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanyRecord {
    pub input: Option<CompanyInput>,
    #[serde(default)]
    pub similar: Vec<EntityStub>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Flatten an arbitrarily nested payload value into a human-readable cell
/// string. Total over all JSON-like inputs; a plain string is returned
/// unchanged.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => format_object(map),
                other => format_value(other),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => format_object(map),
    }
}

fn format_object(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}: {}", format_value(v)))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Strip the query string and one trailing slash, the canonical form used
/// for row matching.
pub fn normalize_linkedin_url(url: &str) -> String {
    let base = url.split('?').next().unwrap_or(url).trim();
    base.strip_suffix('/').unwrap_or(base).to_string()
}

/// Extract company URLs from a `current_company` cell. Cells hold
/// pipe-delimited `key: value` segments; `link:` carries a direct URL and
/// `company_id:` is reconstructed into the canonical company URL.
pub fn company_urls_from_cell(cell: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for segment in cell.split('|') {
        let segment = segment.trim();
        if let Some(rest) = segment.strip_prefix("link:") {
            let url = normalize_linkedin_url(rest.trim());
            if !url.is_empty() {
                urls.push(url);
            }
        } else if let Some(id) = segment.strip_prefix("company_id:") {
            let id = id.trim();
            if !id.is_empty() {
                urls.push(format!("https://www.linkedin.com/company/{id}"));
            }
        }
    }
    urls
}

/// Split a full name on the first space into (first_name, last_name).
pub fn split_full_name(full_name: &str) -> (String, String) {
    match full_name.trim().split_once(' ') {
        Some((first, rest)) => (first.to_string(), rest.to_string()),
        None => (full_name.trim().to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_handles_scalars_and_null() {
        assert_eq!(format_value(&Value::Null), "");
        assert_eq!(format_value(&json!("hello")), "hello");
        assert_eq!(format_value(&json!(42)), "42");
        assert_eq!(format_value(&json!(true)), "true");
    }

    #[test]
    fn format_is_identity_on_flat_strings() {
        let flat = "title: Engineer | company: Acme";
        assert_eq!(format_value(&json!(flat)), flat);
    }

    #[test]
    fn format_renders_list_of_objects_with_pipes_and_commas() {
        let value = json!([
            {"title": "Engineer", "company": "Acme"},
            {"title": "Manager", "company": "Globex"}
        ]);
        assert_eq!(
            format_value(&value),
            "company: Acme | title: Engineer, company: Globex | title: Manager"
        );
    }

    #[test]
    fn format_recurses_into_nested_values() {
        let value = json!({"skills": ["rust", "sql"], "years": 3});
        assert_eq!(format_value(&value), "skills: rust, sql | years: 3");
    }

    #[test]
    fn normalize_strips_query_and_trailing_slash() {
        assert_eq!(
            normalize_linkedin_url("https://linkedin.com/company/acme/?trk=x"),
            "https://linkedin.com/company/acme"
        );
        assert_eq!(
            normalize_linkedin_url("https://linkedin.com/company/acme"),
            "https://linkedin.com/company/acme"
        );
    }

    #[test]
    fn company_cell_yields_link_and_reconstructed_urls() {
        let cell = "name: Acme | link: https://linkedin.com/company/acme?trk=x | company_id: 123";
        assert_eq!(
            company_urls_from_cell(cell),
            vec![
                "https://linkedin.com/company/acme".to_string(),
                "https://www.linkedin.com/company/123".to_string(),
            ]
        );
    }

    #[test]
    fn company_cell_without_recognized_segments_is_empty() {
        assert!(company_urls_from_cell("name: Acme | industry: Software").is_empty());
    }

    #[test]
    fn full_name_splits_on_first_space_only() {
        assert_eq!(
            split_full_name("Jane Q. Public"),
            ("Jane".to_string(), "Q. Public".to_string())
        );
        assert_eq!(split_full_name("Cher"), ("Cher".to_string(), String::new()));
    }

    #[test]
    fn profile_record_keeps_unknown_fields_in_open_map() {
        let record: ProfileRecord = serde_json::from_value(json!({
            "input_url": "https://linkedin.com/in/jane",
            "name": "Jane Q. Public",
            "position": "CTO",
            "similar_profiles": [{"url": "https://linkedin.com/in/bob", "name": "Bob"}],
            "custom_field": {"a": 1}
        }))
        .unwrap();
        assert_eq!(record.input_url.as_deref(), Some("https://linkedin.com/in/jane"));
        assert_eq!(record.similar_profiles.len(), 1);
        assert!(record.fields.contains_key("position"));
        assert!(record.fields.contains_key("custom_field"));
        assert!(!record.fields.contains_key("name"));
    }

    #[test]
    fn job_record_accepts_created_alias() {
        let record: JobRecord = serde_json::from_value(json!({
            "id": "s_abc",
            "status": "ready",
            "created": "2026-08-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.status, SnapshotStatus::Ready);
        assert!(record.created_at.is_some());
    }

    #[test]
    fn unknown_status_maps_to_other() {
        let record: JobRecord =
            serde_json::from_value(json!({"id": "s_x", "status": "failed"})).unwrap();
        assert_eq!(record.status, SnapshotStatus::Other);
    }
}
