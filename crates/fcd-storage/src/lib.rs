//! Reference dataset IO, change-report writing, audit log sinks and HTTP
//! fetch utilities for facilities change detection.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use fcd_core::{ChangeRecord, Facility};
use geo_types::{Geometry, MultiPolygon};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcd-storage";

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Phase of a detection run, as recorded in the task log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "test connection")]
    TestConnection,
    #[serde(rename = "load source data")]
    LoadSourceData,
    #[serde(rename = "match")]
    Match,
    #[serde(rename = "classify")]
    Classify,
    #[serde(rename = "write output")]
    WriteOutput,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TestConnection => write!(f, "test connection"),
            Self::LoadSourceData => write!(f, "load source data"),
            Self::Match => write!(f, "match"),
            Self::Classify => write!(f, "classify"),
            Self::WriteOutput => write!(f, "write output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// One append-only task log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub logged_at: DateTime<Utc>,
    pub user: String,
    pub task: Task,
    pub level: LogLevel,
    pub comment: String,
}

impl TaskLogEntry {
    pub fn new(user: &str, task: Task, level: LogLevel, comment: impl Into<String>) -> Self {
        Self {
            logged_at: Utc::now(),
            user: user.to_string(),
            task,
            level,
            comment: comment.into(),
        }
    }
}

/// Append-only audit sink, injected into the pipeline.
///
/// Entries are never updated or deleted; the run summary is written exactly
/// once per run.
pub trait AuditSink: Send + Sync {
    fn append_task_log(&self, entry: &TaskLogEntry) -> anyhow::Result<()>;
    fn append_run_summary(&self, summary: &serde_json::Value) -> anyhow::Result<()>;
}

impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    fn append_task_log(&self, entry: &TaskLogEntry) -> anyhow::Result<()> {
        (**self).append_task_log(entry)
    }

    fn append_run_summary(&self, summary: &serde_json::Value) -> anyhow::Result<()> {
        (**self).append_run_summary(summary)
    }
}

/// File-backed sink writing line-delimited JSON under a directory.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    task_log_path: PathBuf,
    summary_path: PathBuf,
}

impl JsonlAuditSink {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            task_log_path: dir.join("task_log.jsonl"),
            summary_path: dir.join("run_summary.jsonl"),
        }
    }

    fn append_line(path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit file {}", path.display()))?;
        let line = serde_json::to_string(value).context("serializing audit entry")?;
        writeln!(file, "{line}").with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn append_task_log(&self, entry: &TaskLogEntry) -> anyhow::Result<()> {
        let value = serde_json::to_value(entry).context("serializing task log entry")?;
        Self::append_line(&self.task_log_path, &value)
    }

    fn append_run_summary(&self, summary: &serde_json::Value) -> anyhow::Result<()> {
        Self::append_line(&self.summary_path, summary)
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<TaskLogEntry>>,
    summaries: Mutex<Vec<serde_json::Value>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_log(&self) -> Vec<TaskLogEntry> {
        self.entries.lock().expect("audit lock poisoned").clone()
    }

    pub fn run_summaries(&self) -> Vec<serde_json::Value> {
        self.summaries.lock().expect("audit lock poisoned").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append_task_log(&self, entry: &TaskLogEntry) -> anyhow::Result<()> {
        self.entries.lock().expect("audit lock poisoned").push(entry.clone());
        Ok(())
    }

    fn append_run_summary(&self, summary: &serde_json::Value) -> anyhow::Result<()> {
        self.summaries.lock().expect("audit lock poisoned").push(summary.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reference dataset
// ---------------------------------------------------------------------------

/// Loads the reference facilities from a GeoJSON FeatureCollection,
/// optionally keeping only features whose `use` property matches.
///
/// Features with a missing or non-areal geometry load with an empty
/// multipolygon; the engine's normalizer reports them as skipped instead of
/// failing the whole load.
pub fn load_reference_facilities(
    path: &Path,
    use_filter: Option<&str>,
) -> anyhow::Result<Vec<Facility>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading reference dataset {}", path.display()))?;
    let geojson: GeoJson = text
        .parse()
        .with_context(|| format!("parsing reference dataset {}", path.display()))?;
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => bail!("reference dataset {} is not a FeatureCollection", path.display()),
    };

    let mut facilities = Vec::new();
    for feature in &collection.features {
        let props = feature.properties.as_ref();
        let facility_use = prop_str(props, "use").unwrap_or_default();
        if let Some(wanted) = use_filter {
            if facility_use != wanted {
                continue;
            }
        }
        let facility_id = prop_i64(props, "facility_id")
            .with_context(|| format!("feature without facility_id in {}", path.display()))?;
        facilities.push(Facility {
            facility_id,
            source_facility_id: prop_opt_str(props, "source_facility_id"),
            name: prop_str(props, "name").unwrap_or_default(),
            source_name: prop_str(props, "source_name").unwrap_or_default(),
            facility_use,
            use_type: prop_str(props, "use_type").unwrap_or_default(),
            use_subtype: prop_opt_str(props, "use_subtype"),
            estimated_occupancy: prop_u32(props, "estimated_occupancy"),
            last_modified: prop_date(props, "last_modified"),
            geometry: feature_multipolygon(feature),
            internal: prop_bool(props, "internal"),
            internal_comments: prop_opt_str(props, "internal_comments"),
        });
    }
    Ok(facilities)
}

fn feature_multipolygon(feature: &Feature) -> MultiPolygon<f64> {
    let Some(geometry) = &feature.geometry else {
        return MultiPolygon(vec![]);
    };
    match Geometry::<f64>::try_from(&geometry.value) {
        Ok(Geometry::MultiPolygon(mp)) => mp,
        Ok(Geometry::Polygon(p)) => MultiPolygon(vec![p]),
        Ok(_) | Err(_) => {
            warn!(feature_id = ?feature.id, "reference feature geometry is not areal");
            MultiPolygon(vec![])
        }
    }
}

fn prop_value<'a>(props: Option<&'a JsonObject>, key: &str) -> Option<&'a serde_json::Value> {
    props.and_then(|p| p.get(key)).filter(|v| !v.is_null())
}

fn prop_str(props: Option<&JsonObject>, key: &str) -> Option<String> {
    prop_value(props, key).and_then(|v| v.as_str()).map(String::from)
}

fn prop_opt_str(props: Option<&JsonObject>, key: &str) -> Option<String> {
    prop_str(props, key).filter(|s| !s.trim().is_empty())
}

fn prop_i64(props: Option<&JsonObject>, key: &str) -> Option<i64> {
    prop_value(props, key).and_then(|v| v.as_i64())
}

fn prop_u32(props: Option<&JsonObject>, key: &str) -> Option<u32> {
    prop_value(props, key)
        .and_then(|v| v.as_i64())
        .and_then(|v| u32::try_from(v).ok())
}

fn prop_bool(props: Option<&JsonObject>, key: &str) -> bool {
    prop_value(props, key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn prop_date(props: Option<&JsonObject>, key: &str) -> Option<NaiveDate> {
    prop_str(props, key).and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

// ---------------------------------------------------------------------------
// Change report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub dir: PathBuf,
    pub changes: PathBuf,
    pub internal: Option<PathBuf>,
    pub summary: PathBuf,
    pub manifest: PathBuf,
}

/// Writes one run's change report under `<base_dir>/<run_id>/`.
///
/// `changes.geojson` is the published layer; records for facilities flagged
/// internal go to a separate `internal.geojson` layer instead. A manifest
/// with sha256 digests covers every file written.
pub fn write_change_report(
    base_dir: &Path,
    run_id: Uuid,
    records: &[ChangeRecord],
    summary: &serde_json::Value,
) -> anyhow::Result<ReportPaths> {
    let dir = base_dir.join(run_id.to_string());
    fs::create_dir_all(&dir).with_context(|| format!("creating report dir {}", dir.display()))?;

    let (internal_records, published): (Vec<_>, Vec<_>) = records
        .iter()
        .partition(|r| r.facility.as_ref().is_some_and(|f| f.internal));

    let changes = dir.join("changes.geojson");
    write_record_layer(&changes, &published)?;

    let internal = if internal_records.is_empty() {
        None
    } else {
        let path = dir.join("internal.geojson");
        write_record_layer(&path, &internal_records)?;
        Some(path)
    };

    let summary_path = dir.join("summary.json");
    let summary_bytes =
        serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&summary_path, summary_bytes)
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let mut files = vec![
        manifest_entry("changes", &dir, &changes)?,
        manifest_entry("summary", &dir, &summary_path)?,
    ];
    if let Some(path) = &internal {
        files.push(manifest_entry("internal", &dir, path)?);
    }
    let manifest = ReportManifest { schema_version: 1, files };
    let manifest_path = dir.join("manifest.json");
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, manifest_bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ReportPaths {
        dir,
        changes,
        internal,
        summary: summary_path,
        manifest: manifest_path,
    })
}

fn write_record_layer(path: &Path, records: &[&ChangeRecord]) -> anyhow::Result<()> {
    let features = records.iter().map(|&r| record_to_feature(r)).collect::<Vec<_>>();
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let bytes = serde_json::to_vec_pretty(&collection)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn record_to_feature(record: &ChangeRecord) -> Feature {
    let mut props: BTreeMap<&str, serde_json::Value> = BTreeMap::new();

    if let Some(facility) = &record.facility {
        props.insert("facility_id", facility.facility_id.into());
        props.insert("source_facility_id", opt_string(&facility.source_facility_id));
        props.insert("name", facility.name.clone().into());
        props.insert("source_name", facility.source_name.clone().into());
        props.insert("use", facility.facility_use.clone().into());
        props.insert("use_type", facility.use_type.clone().into());
        props.insert("use_subtype", opt_string(&facility.use_subtype));
        props.insert("estimated_occupancy", opt_u32(facility.estimated_occupancy));
        props.insert(
            "last_modified",
            facility
                .last_modified
                .map(|d| d.format("%Y-%m-%d").to_string().into())
                .unwrap_or(serde_json::Value::Null),
        );
    } else if let Some(source) = &record.source {
        props.insert("source_facility_id", opt_string(&source.source_id));
        props.insert("name", source.name.clone().into());
        props.insert("source_name", source.name.clone().into());
        props.insert("use", source.authority.facility_use().into());
        props.insert("use_type", opt_string(&source.source_type));
        props.insert("use_subtype", opt_string(&source.source_subtype));
        props.insert("estimated_occupancy", opt_u32(source.occupancy));
    }

    props.insert("in_published", record.in_published.into());
    props.insert("change_action", record.change_action.to_string().into());
    props.insert("change_description", record.change_description.clone().into());
    props.insert(
        "match_method",
        record
            .match_method
            .map(|m| m.to_string().into())
            .unwrap_or(serde_json::Value::Null),
    );
    props.insert(
        "match_confidence",
        record
            .match_confidence
            .and_then(|c| serde_json::Number::from_f64(c).map(serde_json::Value::Number))
            .unwrap_or(serde_json::Value::Null),
    );

    let geometry = match (&record.facility, &record.source) {
        (Some(facility), _) => Some(geojson::Geometry::new(geojson::Value::from(
            &facility.geometry,
        ))),
        (None, Some(source)) => source
            .geometry
            .as_ref()
            .map(|g| geojson::Geometry::new(geojson::Value::from(g))),
        (None, None) => None,
    };

    Feature {
        bbox: None,
        geometry,
        id: None,
        properties: Some(
            props
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<JsonObject>(),
        ),
        foreign_members: None,
    }
}

fn opt_string(value: &Option<String>) -> serde_json::Value {
    value.clone().map(Into::into).unwrap_or(serde_json::Value::Null)
}

fn opt_u32(value: Option<u32>) -> serde_json::Value {
    value.map(Into::into).unwrap_or(serde_json::Value::Null)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> anyhow::Result<ReportManifestFile> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

// ---------------------------------------------------------------------------
// HTTP fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Minimal GET client for authority endpoints: timeout, user agent and
/// bounded retries with exponential backoff. One request at a time is all a
/// batch run ever needs.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(
        timeout: Duration,
        user_agent: &str,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, backoff })
    }

    pub async fn fetch_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    if retryable && attempt < self.backoff.max_retries {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
