//! Change detection engine: normalizes reference and source facility
//! records, pairs them with a layered matcher, diffs matched pairs and
//! classifies every record into a change action with auditable counts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use fcd_adapters::{adapter_for_authority, filter_education_records, RawCapture};
use fcd_core::{
    comparison_key, tidy_whitespace, Authority, ChangeAction, ChangeRecord, Crs, Facility,
    MatchMethod, SourceFacility,
};
use fcd_storage::{
    load_reference_facilities, write_change_report, AuditSink, BackoffPolicy, HttpFetcher,
    LogLevel, Task, TaskLogEntry,
};
use geo::{Area, BooleanOps, Centroid, Contains, EuclideanDistance, MapCoords};
use geo_types::{Coord, Geometry, MultiPolygon, Point};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcd-detect";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Attribute fields the differ may compare. Geometry is always compared and
/// is not part of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonField {
    SourceId,
    SourceName,
    SourceType,
    Occupancy,
}

impl ComparisonField {
    pub const ALL: [ComparisonField; 4] = [
        Self::SourceId,
        Self::SourceName,
        Self::SourceType,
        Self::Occupancy,
    ];
}

impl std::fmt::Display for ComparisonField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceId => write!(f, "source_id"),
            Self::SourceName => write!(f, "source_name"),
            Self::SourceType => write!(f, "source_type"),
            Self::Occupancy => write!(f, "occupancy"),
        }
    }
}

impl std::str::FromStr for ComparisonField {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "source_id" => Ok(Self::SourceId),
            "source_name" => Ok(Self::SourceName),
            "source_type" | "use_type" => Ok(Self::SourceType),
            "occupancy" => Ok(Self::Occupancy),
            other => Err(DetectError::Configuration(format!(
                "unknown comparison field '{other}' (expected one of source_id, source_name, source_type, occupancy)"
            ))),
        }
    }
}

/// Tunables for one detection run. Defaults mirror the curation team's
/// long-standing thresholds; every value is validated before matching
/// starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Attribute fields to diff. Occupancy is opt-in; the rest are the
    /// default comparable set.
    #[serde(default = "default_comparison_fields")]
    pub comparison_fields: Vec<ComparisonField>,
    /// How far outside a reference polygon a representative point may fall
    /// and still match spatially, in metres.
    #[serde(default = "default_spatial_buffer_m")]
    pub spatial_buffer_m: f64,
    /// Minimum folded-name similarity for a fuzzy match, in (0, 1].
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Symmetric-difference area below which two polygon geometries count
    /// as equal, in square metres.
    #[serde(default = "default_geometry_tolerance_m2")]
    pub geometry_tolerance_m2: f64,
    /// Distance beyond which a point source is considered to have moved
    /// away from its reference polygon, in metres.
    #[serde(default = "default_geometry_distance_m")]
    pub geometry_distance_m: f64,
}

fn default_comparison_fields() -> Vec<ComparisonField> {
    vec![
        ComparisonField::SourceId,
        ComparisonField::SourceName,
        ComparisonField::SourceType,
    ]
}

fn default_spatial_buffer_m() -> f64 {
    50.0
}

fn default_fuzzy_threshold() -> f64 {
    0.9
}

fn default_geometry_tolerance_m2() -> f64 {
    1.0
}

fn default_geometry_distance_m() -> f64 {
    350.0
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            comparison_fields: default_comparison_fields(),
            spatial_buffer_m: default_spatial_buffer_m(),
            fuzzy_threshold: default_fuzzy_threshold(),
            geometry_tolerance_m2: default_geometry_tolerance_m2(),
            geometry_distance_m: default_geometry_distance_m(),
        }
    }
}

impl DetectionConfig {
    pub fn from_yaml(input: &str) -> Result<Self, DetectError> {
        let config: DetectionConfig = serde_yaml::from_str(input)
            .map_err(|e| DetectError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        if self.comparison_fields.is_empty() {
            return Err(DetectError::Configuration(
                "at least one comparison field is required".into(),
            ));
        }
        if self.spatial_buffer_m <= 0.0 {
            return Err(DetectError::Configuration(format!(
                "spatial_buffer_m must be positive, got {}",
                self.spatial_buffer_m
            )));
        }
        if !(self.fuzzy_threshold > 0.0 && self.fuzzy_threshold <= 1.0) {
            return Err(DetectError::Configuration(format!(
                "fuzzy_threshold must be in (0, 1], got {}",
                self.fuzzy_threshold
            )));
        }
        if self.geometry_tolerance_m2 <= 0.0 {
            return Err(DetectError::Configuration(format!(
                "geometry_tolerance_m2 must be positive, got {}",
                self.geometry_tolerance_m2
            )));
        }
        if self.geometry_distance_m <= 0.0 {
            return Err(DetectError::Configuration(format!(
                "geometry_distance_m must be positive, got {}",
                self.geometry_distance_m
            )));
        }
        Ok(())
    }

    /// Comparison fields, deduplicated in a fixed order.
    fn effective_fields(&self) -> Vec<ComparisonField> {
        let mut fields = self.comparison_fields.clone();
        fields.sort();
        fields.dedup();
        fields
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DetectError {
    /// Record-level: the geometry cannot enter matching. The record is
    /// skipped and the run continues.
    #[error("malformed geometry: {detail}")]
    MalformedGeometry { detail: String },
    /// Run-level: the external source set could not be obtained. Fatal —
    /// a partial source set would classify every unmatched facility as
    /// removed.
    #[error("source data unavailable: {detail}")]
    SourceUnavailable { detail: String },
    /// Run-level: invalid tunables, rejected before any matching.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

const WGS84_PROJ: &str = "+proj=longlat +ellps=WGS84 +towgs84=0,0,0,0,0,0,0 +no_defs";
const NZTM_PROJ: &str = "+proj=tmerc +lat_0=0 +lon_0=173 +k=0.9996 +x_0=1600000 \
                         +y_0=10000000 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs";

/// WGS84 → NZTM coordinate transform, built once per run.
pub struct NztmReprojector {
    from: Proj,
    to: Proj,
}

impl NztmReprojector {
    pub fn new() -> Result<Self, DetectError> {
        let from = Proj::from_proj_string(WGS84_PROJ)
            .map_err(|e| DetectError::Configuration(format!("projection setup failed: {e}")))?;
        let to = Proj::from_proj_string(NZTM_PROJ)
            .map_err(|e| DetectError::Configuration(format!("projection setup failed: {e}")))?;
        Ok(Self { from, to })
    }

    fn reproject(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>, DetectError> {
        geometry.try_map_coords(|coord: Coord<f64>| {
            let mut point = (coord.x.to_radians(), coord.y.to_radians(), 0.0);
            transform(&self.from, &self.to, &mut point).map_err(|e| {
                DetectError::MalformedGeometry {
                    detail: format!("reprojection failed: {e}"),
                }
            })?;
            Ok(Coord {
                x: point.0,
                y: point.1,
            })
        })
    }
}

/// A source record canonicalized for comparison: NZTM geometry, a
/// representative point, and a folded name key. Original casing is kept on
/// the record itself.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSource {
    pub record: SourceFacility,
    pub cmp_name: String,
    pub point: Point<f64>,
    pub polygon: Option<MultiPolygon<f64>>,
}

/// A reference record canonicalized for comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReference {
    pub facility: Facility,
    pub cmp_name: String,
}

pub fn normalize_source(
    record: SourceFacility,
    reprojector: &NztmReprojector,
) -> Result<NormalizedSource, DetectError> {
    let mut record = record;
    record.name = tidy_whitespace(&record.name);

    let geometry = record
        .geometry
        .as_ref()
        .ok_or_else(|| DetectError::MalformedGeometry {
            detail: format!("source record '{}' has no geometry", record.name),
        })?;
    let geometry = match record.crs {
        Crs::Wgs84 => reprojector.reproject(geometry)?,
        Crs::Nztm => geometry.clone(),
    };

    let (point, polygon) = match &geometry {
        Geometry::Point(p) => (*p, None),
        Geometry::Polygon(p) => {
            let mp = MultiPolygon(vec![p.clone()]);
            let centroid = mp.centroid().ok_or_else(|| DetectError::MalformedGeometry {
                detail: format!("source record '{}' has an empty polygon", record.name),
            })?;
            (centroid, Some(mp))
        }
        Geometry::MultiPolygon(mp) => {
            let centroid = mp.centroid().ok_or_else(|| DetectError::MalformedGeometry {
                detail: format!("source record '{}' has an empty multipolygon", record.name),
            })?;
            (centroid, Some(mp.clone()))
        }
        other => {
            return Err(DetectError::MalformedGeometry {
                detail: format!(
                    "source record '{}' has non-areal geometry ({})",
                    record.name,
                    geometry_kind(other)
                ),
            })
        }
    };

    record.geometry = Some(geometry);
    record.crs = Crs::Nztm;
    let cmp_name = comparison_key(&record.name);
    Ok(NormalizedSource {
        record,
        cmp_name,
        point,
        polygon,
    })
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "point",
        Geometry::Line(_) => "line",
        Geometry::LineString(_) => "linestring",
        Geometry::Polygon(_) => "polygon",
        Geometry::MultiPoint(_) => "multipoint",
        Geometry::MultiLineString(_) => "multilinestring",
        Geometry::MultiPolygon(_) => "multipolygon",
        Geometry::GeometryCollection(_) => "geometrycollection",
        Geometry::Rect(_) => "rect",
        Geometry::Triangle(_) => "triangle",
    }
}

pub fn normalize_reference(facility: Facility) -> Result<NormalizedReference, DetectError> {
    if facility.geometry.0.is_empty() || facility.geometry.unsigned_area() == 0.0 {
        return Err(DetectError::MalformedGeometry {
            detail: format!(
                "facility {} '{}' has no usable polygon",
                facility.facility_id, facility.name
            ),
        });
    }
    let mut facility = facility;
    facility.name = tidy_whitespace(&facility.name);
    facility.source_name = tidy_whitespace(&facility.source_name);
    // Match against the name the source publishes; fall back to the curated
    // name for facilities that predate source_name capture.
    let match_name = if facility.source_name.is_empty() {
        &facility.name
    } else {
        &facility.source_name
    };
    let cmp_name = comparison_key(match_name);
    Ok(NormalizedReference { facility, cmp_name })
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Pairing of one source record with at most one reference record.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub source_idx: usize,
    pub reference_idx: Option<usize>,
    pub method: MatchMethod,
    pub confidence: f64,
}

impl MatchCandidate {
    fn unmatched(source_idx: usize) -> Self {
        Self {
            source_idx,
            reference_idx: None,
            method: MatchMethod::Unmatched,
            confidence: 0.0,
        }
    }
}

/// Pairs every source record with at most one reference record.
///
/// Phase one scores each source independently (exact id → spatial → fuzzy
/// name); phase two resolves reference records claimed by more than one
/// source, demoting all but the strongest claimant. The second phase makes
/// the one-to-one invariant hold regardless of input order.
pub fn match_records(
    sources: &[NormalizedSource],
    references: &[NormalizedReference],
    config: &DetectionConfig,
) -> Vec<MatchCandidate> {
    let id_index = build_id_index(references);

    let mut candidates: Vec<MatchCandidate> = sources
        .iter()
        .enumerate()
        .map(|(source_idx, source)| score_source(source_idx, source, references, &id_index, config))
        .collect();

    resolve_reference_conflicts(&mut candidates, sources);
    candidates
}

/// External id → reference index. When several references carry the same
/// external id the lowest facility_id wins, for determinism.
fn build_id_index(references: &[NormalizedReference]) -> HashMap<String, usize> {
    let mut index: HashMap<String, usize> = HashMap::new();
    for (idx, reference) in references.iter().enumerate() {
        let Some(id) = reference.facility.source_facility_id.as_deref() else {
            continue;
        };
        let id = id.trim();
        if id.is_empty() {
            continue;
        }
        index
            .entry(id.to_string())
            .and_modify(|existing| {
                if references[idx].facility.facility_id
                    < references[*existing].facility.facility_id
                {
                    *existing = idx;
                }
            })
            .or_insert(idx);
    }
    index
}

fn score_source(
    source_idx: usize,
    source: &NormalizedSource,
    references: &[NormalizedReference],
    id_index: &HashMap<String, usize>,
    config: &DetectionConfig,
) -> MatchCandidate {
    // 1. Exact external id.
    if let Some(id) = source.record.source_id.as_deref() {
        if let Some(&reference_idx) = id_index.get(id.trim()) {
            return MatchCandidate {
                source_idx,
                reference_idx: Some(reference_idx),
                method: MatchMethod::ExactId,
                confidence: 1.0,
            };
        }
    }

    // 2. Spatial: representative point inside a polygon, or within buffer.
    let containing: Vec<usize> = references
        .iter()
        .enumerate()
        .filter(|(_, r)| r.facility.geometry.contains(&source.point))
        .map(|(idx, _)| idx)
        .collect();

    match containing.len() {
        1 => {
            return MatchCandidate {
                source_idx,
                reference_idx: Some(containing[0]),
                method: MatchMethod::Spatial,
                confidence: 1.0,
            }
        }
        0 => {
            let mut nearest: Option<(usize, f64)> = None;
            for (idx, reference) in references.iter().enumerate() {
                let d = distance_to_reference(&source.point, reference);
                if d > config.spatial_buffer_m {
                    continue;
                }
                let better = match nearest {
                    None => true,
                    Some((best_idx, best_d)) => {
                        d < best_d
                            || (d == best_d
                                && reference.facility.facility_id
                                    < references[best_idx].facility.facility_id)
                    }
                };
                if better {
                    nearest = Some((idx, d));
                }
            }
            if let Some((reference_idx, d)) = nearest {
                // Linear decay from 1.0 at the polygon edge to the 0.5
                // floor at the buffer limit.
                let confidence = 1.0 - 0.5 * (d / config.spatial_buffer_m);
                return MatchCandidate {
                    source_idx,
                    reference_idx: Some(reference_idx),
                    method: MatchMethod::Spatial,
                    confidence,
                };
            }
        }
        // Ambiguous containment falls through to fuzzy scoring over the
        // contenders only.
        _ => {}
    }

    // 3. Fuzzy name + proximity.
    let subset: Vec<usize> = if containing.len() > 1 {
        containing
    } else {
        (0..references.len()).collect()
    };
    if let Some((reference_idx, score)) = fuzzy_candidate(source, references, &subset, config) {
        return MatchCandidate {
            source_idx,
            reference_idx: Some(reference_idx),
            method: MatchMethod::FuzzyName,
            confidence: score,
        };
    }

    MatchCandidate::unmatched(source_idx)
}

fn fuzzy_candidate(
    source: &NormalizedSource,
    references: &[NormalizedReference],
    subset: &[usize],
    config: &DetectionConfig,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for &idx in subset {
        let reference = &references[idx];
        let name_similarity = jaro_winkler(&source.cmp_name, &reference.cmp_name);
        if name_similarity < config.fuzzy_threshold {
            continue;
        }
        let d = distance_to_reference(&source.point, reference);
        let proximity = 1.0 / (1.0 + d / config.spatial_buffer_m);
        let score = name_similarity * proximity;
        let better = match best {
            None => true,
            Some((best_idx, best_score)) => {
                score > best_score
                    || (score == best_score
                        && reference.facility.facility_id
                            < references[best_idx].facility.facility_id)
            }
        };
        if better {
            best = Some((idx, score));
        }
    }
    best
}

fn distance_to_reference(point: &Point<f64>, reference: &NormalizedReference) -> f64 {
    reference
        .facility
        .geometry
        .0
        .iter()
        .map(|polygon| point.euclidean_distance(polygon))
        .fold(f64::INFINITY, f64::min)
}

fn method_rank(method: MatchMethod) -> u8 {
    match method {
        MatchMethod::ExactId => 0,
        MatchMethod::Spatial => 1,
        MatchMethod::FuzzyName => 2,
        MatchMethod::Unmatched => 3,
    }
}

fn source_id_sort_key(record: &SourceFacility) -> (u8, u64, String) {
    match &record.source_id {
        Some(id) => match id.trim().parse::<u64>() {
            Ok(n) => (0, n, id.clone()),
            Err(_) => (1, 0, id.clone()),
        },
        None => (2, 0, String::new()),
    }
}

/// Demotes all but the strongest claimant of every contested reference.
/// Strength is confidence, then match-method priority, then lowest source
/// id, then source index — a total order, so the outcome is independent of
/// candidate ordering.
fn resolve_reference_conflicts(candidates: &mut [MatchCandidate], sources: &[NormalizedSource]) {
    let mut claims: HashMap<usize, Vec<usize>> = HashMap::new();
    for (pos, candidate) in candidates.iter().enumerate() {
        if let Some(reference_idx) = candidate.reference_idx {
            claims.entry(reference_idx).or_default().push(pos);
        }
    }

    for (reference_idx, mut claimants) in claims {
        if claimants.len() < 2 {
            continue;
        }
        claimants.sort_by(|&a, &b| {
            let ca = &candidates[a];
            let cb = &candidates[b];
            cb.confidence
                .partial_cmp(&ca.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| method_rank(ca.method).cmp(&method_rank(cb.method)))
                .then_with(|| {
                    source_id_sort_key(&sources[ca.source_idx].record)
                        .cmp(&source_id_sort_key(&sources[cb.source_idx].record))
                })
                .then_with(|| ca.source_idx.cmp(&cb.source_idx))
        });
        let winner = claimants[0];
        for &pos in &claimants[1..] {
            candidates[pos] = MatchCandidate::unmatched(candidates[pos].source_idx);
        }
        debug_assert_eq!(candidates[winner].reference_idx, Some(reference_idx));
    }
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: ComparisonField,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub geometry_changed: bool,
    pub attributes_changed: bool,
    pub geometry_detail: Option<String>,
    pub changed_fields: Vec<FieldChange>,
}

impl DiffResult {
    /// Human-readable description of what changed, e.g.
    /// `Geom: 371.4m, Attrs: source_name: "Old" -> "New"`.
    pub fn change_description(&self) -> String {
        let attrs = || {
            self.changed_fields
                .iter()
                .map(|c| format!("{}: \"{}\" -> \"{}\"", c.field, c.old, c.new))
                .collect::<Vec<_>>()
                .join("; ")
        };
        match (self.geometry_changed, self.attributes_changed) {
            (true, true) => format!(
                "{}, Attrs: {}",
                self.geometry_detail.as_deref().unwrap_or("Geom: changed"),
                attrs()
            ),
            (true, false) => self
                .geometry_detail
                .clone()
                .unwrap_or_else(|| "Geom: changed".to_string()),
            (false, true) => format!("Attrs: {}", attrs()),
            (false, false) => String::new(),
        }
    }
}

/// Compares one matched pair. Geometry is always compared; attributes per
/// the configured comparison fields, all post-normalization. Occupancy
/// tolerates exact matches only.
pub fn diff(
    reference: &NormalizedReference,
    source: &NormalizedSource,
    config: &DetectionConfig,
) -> DiffResult {
    let facility = &reference.facility;

    let (geometry_changed, geometry_detail) = match &source.polygon {
        Some(polygon) => {
            let area = facility.geometry.xor(polygon).unsigned_area();
            if area > config.geometry_tolerance_m2 {
                (true, Some(format!("Geom: {area:.1}m2")))
            } else {
                (false, None)
            }
        }
        None => {
            let d = distance_to_reference(&source.point, reference);
            if d > config.geometry_distance_m {
                (true, Some(format!("Geom: {d:.1}m")))
            } else {
                (false, None)
            }
        }
    };

    let mut changed_fields = Vec::new();
    for field in config.effective_fields() {
        match field {
            ComparisonField::SourceId => {
                let old = facility.source_facility_id.as_deref().map(str::trim);
                let new = source.record.source_id.as_deref().map(str::trim);
                if old != new {
                    changed_fields.push(FieldChange {
                        field,
                        old: old.unwrap_or_default().to_string(),
                        new: new.unwrap_or_default().to_string(),
                    });
                }
            }
            ComparisonField::SourceName => {
                if comparison_key(&facility.source_name) != source.cmp_name {
                    changed_fields.push(FieldChange {
                        field,
                        old: facility.source_name.clone(),
                        new: source.record.name.clone(),
                    });
                }
            }
            ComparisonField::SourceType => {
                let old = comparison_key(&facility.use_type);
                let new = source
                    .record
                    .source_type
                    .as_deref()
                    .map(comparison_key)
                    .unwrap_or_default();
                if old != new {
                    changed_fields.push(FieldChange {
                        field,
                        old: facility.use_type.clone(),
                        new: source.record.source_type.clone().unwrap_or_default(),
                    });
                }
            }
            ComparisonField::Occupancy => {
                if facility.estimated_occupancy != source.record.occupancy {
                    changed_fields.push(FieldChange {
                        field,
                        old: display_occupancy(facility.estimated_occupancy),
                        new: display_occupancy(source.record.occupancy),
                    });
                }
            }
        }
    }

    DiffResult {
        geometry_changed,
        attributes_changed: !changed_fields.is_empty(),
        geometry_detail,
        changed_fields,
    }
}

fn display_occupancy(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
    pub geom_updated: usize,
    pub attr_updated: usize,
    pub geom_attr_updated: usize,
    pub unchanged: usize,
}

/// Folds accepted matches, diffs and both unmatched sides into final
/// per-record verdicts plus dataset counts. Output is ordered by
/// facility_id, then by source id for added records, so identical inputs
/// yield identical reports.
pub fn classify(
    references: &[NormalizedReference],
    sources: &[NormalizedSource],
    candidates: &[MatchCandidate],
    config: &DetectionConfig,
) -> (Vec<ChangeRecord>, ChangeCounts) {
    let mut accepted_by_reference: HashMap<usize, &MatchCandidate> = HashMap::new();
    for candidate in candidates {
        if let Some(reference_idx) = candidate.reference_idx {
            accepted_by_reference.insert(reference_idx, candidate);
        }
    }

    let mut counts = ChangeCounts::default();
    let mut records = Vec::with_capacity(references.len());

    let mut reference_order: Vec<usize> = (0..references.len()).collect();
    reference_order.sort_by_key(|&idx| references[idx].facility.facility_id);

    for idx in reference_order {
        let reference = &references[idx];
        match accepted_by_reference.get(&idx) {
            Some(candidate) => {
                let source = &sources[candidate.source_idx];
                let result = diff(reference, source, config);
                let action = match (result.geometry_changed, result.attributes_changed) {
                    (true, true) => {
                        counts.geom_attr_updated += 1;
                        ChangeAction::GeometryAttributeUpdated
                    }
                    (true, false) => {
                        counts.geom_updated += 1;
                        ChangeAction::GeometryUpdated
                    }
                    (false, true) => {
                        counts.attr_updated += 1;
                        ChangeAction::AttributeUpdated
                    }
                    (false, false) => {
                        counts.unchanged += 1;
                        ChangeAction::Unchanged
                    }
                };
                records.push(ChangeRecord {
                    facility: Some(reference.facility.clone()),
                    source: Some(source.record.clone()),
                    change_action: action,
                    change_description: result.change_description(),
                    in_published: true,
                    match_method: Some(candidate.method),
                    match_confidence: Some(candidate.confidence),
                });
            }
            None => {
                counts.removed += 1;
                records.push(ChangeRecord {
                    facility: Some(reference.facility.clone()),
                    source: None,
                    change_action: ChangeAction::Removed,
                    change_description: String::new(),
                    in_published: true,
                    match_method: None,
                    match_confidence: None,
                });
            }
        }
    }

    let mut added_order: Vec<usize> = candidates
        .iter()
        .filter(|c| c.reference_idx.is_none())
        .map(|c| c.source_idx)
        .collect();
    added_order.sort_by_key(|&idx| {
        let key = source_id_sort_key(&sources[idx].record);
        (key, idx)
    });
    for idx in added_order {
        counts.added += 1;
        records.push(ChangeRecord {
            facility: None,
            source: Some(sources[idx].record.clone()),
            change_action: ChangeAction::Added,
            change_description: String::new(),
            in_published: false,
            match_method: Some(MatchMethod::Unmatched),
            match_confidence: Some(0.0),
        });
    }

    (records, counts)
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Audit record of one detection run. Written once at the end of the run,
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub log_date: DateTime<Utc>,
    pub user: String,
    pub authority: Authority,
    pub added: usize,
    pub removed: usize,
    pub geom_updated: usize,
    pub attr_updated: usize,
    pub geom_attr_updated: usize,
    pub unchanged: usize,
    pub skipped_sources: usize,
    pub skipped_references: usize,
    pub row_count_before: usize,
    pub row_count_after: usize,
}

impl RunSummary {
    pub fn new(
        run_id: Uuid,
        user: &str,
        authority: Authority,
        counts: ChangeCounts,
        skipped_sources: usize,
        skipped_references: usize,
        row_count_before: usize,
    ) -> Self {
        Self {
            run_id,
            log_date: Utc::now(),
            user: user.to_string(),
            authority,
            added: counts.added,
            removed: counts.removed,
            geom_updated: counts.geom_updated,
            attr_updated: counts.attr_updated,
            geom_attr_updated: counts.geom_attr_updated,
            unchanged: counts.unchanged,
            skipped_sources,
            skipped_references,
            row_count_before,
            row_count_after: row_count_before - counts.removed + counts.added,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Inputs for one run that are not matching tunables.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Reference dataset (GeoJSON FeatureCollection).
    pub facilities_path: PathBuf,
    /// Directory reports are written under, one subdirectory per run.
    pub output_dir: PathBuf,
    /// Replay a saved authority capture instead of fetching.
    pub capture_path: Option<PathBuf>,
    /// Save the fetched capture for later replay.
    pub save_capture_path: Option<PathBuf>,
    pub user: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl RunOptions {
    pub fn new(facilities_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            facilities_path: facilities_path.into(),
            output_dir: output_dir.into(),
            capture_path: None,
            save_capture_path: None,
            user: "fcd".to_string(),
            http_timeout_secs: 20,
            user_agent: "fcd-bot/0.1".to_string(),
        }
    }
}

/// Orchestrates one detection run end to end, emitting an audit task-log
/// entry per phase and one run summary.
pub struct DetectionPipeline {
    config: DetectionConfig,
    options: RunOptions,
    audit: Box<dyn AuditSink>,
}

impl DetectionPipeline {
    pub fn new(
        config: DetectionConfig,
        options: RunOptions,
        audit: Box<dyn AuditSink>,
    ) -> Result<Self, DetectError> {
        config.validate()?;
        Ok(Self {
            config,
            options,
            audit,
        })
    }

    pub async fn run_once(&self, authority: Authority) -> anyhow::Result<RunSummary> {
        let run_id = Uuid::new_v4();
        info!(%run_id, %authority, "starting detection run");

        // test connection
        if !self.options.facilities_path.exists() {
            self.log(
                Task::TestConnection,
                LogLevel::Error,
                format!(
                    "reference dataset {} not found",
                    self.options.facilities_path.display()
                ),
            )?;
            anyhow::bail!(
                "reference dataset {} not found",
                self.options.facilities_path.display()
            );
        }
        self.log(
            Task::TestConnection,
            LogLevel::Info,
            format!(
                "reference dataset {} reachable",
                self.options.facilities_path.display()
            ),
        )?;

        // load source data
        let source_records = self.load_source_records(authority).await?;
        let references = load_reference_facilities(
            &self.options.facilities_path,
            Some(authority.facility_use()),
        )?;
        self.log(
            Task::LoadSourceData,
            LogLevel::Info,
            format!(
                "loaded {} source records and {} reference facilities",
                source_records.len(),
                references.len()
            ),
        )?;

        // match (normalization feeds straight into it)
        let reprojector = NztmReprojector::new()?;
        let mut skipped_sources = 0usize;
        let mut normalized_sources = Vec::with_capacity(source_records.len());
        for record in source_records {
            let name = record.name.clone();
            match normalize_source(record, &reprojector) {
                Ok(normalized) => normalized_sources.push(normalized),
                Err(err) => {
                    skipped_sources += 1;
                    self.log(
                        Task::Match,
                        LogLevel::Warning,
                        format!("skipping source record '{name}': {err}"),
                    )?;
                }
            }
        }

        let mut skipped_references = 0usize;
        let mut normalized_references = Vec::with_capacity(references.len());
        for facility in references {
            let label = format!("{} '{}'", facility.facility_id, facility.name);
            match normalize_reference(facility) {
                Ok(normalized) => normalized_references.push(normalized),
                Err(err) => {
                    skipped_references += 1;
                    self.log(
                        Task::Match,
                        LogLevel::Warning,
                        format!("skipping facility {label}: {err}"),
                    )?;
                }
            }
        }

        let candidates = match_records(&normalized_sources, &normalized_references, &self.config);
        let accepted = candidates.iter().filter(|c| c.reference_idx.is_some()).count();
        self.log(
            Task::Match,
            LogLevel::Info,
            format!(
                "matched {accepted} of {} source records against {} facilities",
                normalized_sources.len(),
                normalized_references.len()
            ),
        )?;

        // classify
        let (records, counts) = classify(
            &normalized_references,
            &normalized_sources,
            &candidates,
            &self.config,
        );
        let summary = RunSummary::new(
            run_id,
            &self.options.user,
            authority,
            counts,
            skipped_sources,
            skipped_references,
            normalized_references.len(),
        );
        self.log(
            Task::Classify,
            LogLevel::Info,
            format!(
                "added {}, removed {}, geom updated {}, attr updated {}, geom+attr updated {}, unchanged {}",
                summary.added,
                summary.removed,
                summary.geom_updated,
                summary.attr_updated,
                summary.geom_attr_updated,
                summary.unchanged
            ),
        )?;

        // write output
        let summary_value = serde_json::to_value(&summary).context("serializing run summary")?;
        let paths =
            write_change_report(&self.options.output_dir, run_id, &records, &summary_value)?;
        self.audit.append_run_summary(&summary_value)?;
        self.log(
            Task::WriteOutput,
            LogLevel::Info,
            format!("wrote change report to {}", paths.dir.display()),
        )?;

        Ok(summary)
    }

    async fn load_source_records(
        &self,
        authority: Authority,
    ) -> anyhow::Result<Vec<SourceFacility>> {
        let adapter = adapter_for_authority(authority);

        let capture: RawCapture = match &self.options.capture_path {
            Some(path) => match RawCapture::from_file(authority, path) {
                Ok(capture) => capture,
                Err(err) => return Err(self.source_failure(format!("{err:#}"))),
            },
            None => {
                let http = HttpFetcher::new(
                    Duration::from_secs(self.options.http_timeout_secs),
                    &self.options.user_agent,
                    BackoffPolicy::default(),
                )?;
                match adapter.fetch(&http).await {
                    Ok(capture) => capture,
                    Err(err) => return Err(self.source_failure(err.to_string())),
                }
            }
        };

        if let Some(path) = &self.options.save_capture_path {
            capture.save(path)?;
        }

        let records = match adapter.parse(&capture) {
            Ok(records) => records,
            Err(err) => return Err(self.source_failure(err.to_string())),
        };
        let records = match authority {
            Authority::Education => filter_education_records(records),
            Authority::Health => records,
        };
        if records.is_empty() {
            return Err(self.source_failure(format!(
                "{authority} source returned no records; refusing to classify every facility as removed"
            )));
        }
        Ok(records)
    }

    fn source_failure(&self, detail: String) -> anyhow::Error {
        warn!(detail, "source data unavailable, aborting run");
        if let Err(log_err) = self.log(Task::LoadSourceData, LogLevel::Error, detail.clone()) {
            warn!(error = %log_err, "failed to append task log entry");
        }
        DetectError::SourceUnavailable { detail }.into()
    }

    fn log(&self, task: Task, level: LogLevel, comment: impl Into<String>) -> anyhow::Result<()> {
        let entry = TaskLogEntry::new(&self.options.user, task, level, comment);
        self.audit.append_task_log(&entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcd_core::Crs;
    use geo_types::polygon;

    fn square(cx: f64, cy: f64, half: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: cx - half, y: cy - half),
            (x: cx + half, y: cy - half),
            (x: cx + half, y: cy + half),
            (x: cx - half, y: cy + half),
        ]])
    }

    fn facility(id: i64, source_id: Option<&str>, name: &str, cx: f64, cy: f64) -> Facility {
        Facility {
            facility_id: id,
            source_facility_id: source_id.map(String::from),
            name: name.to_string(),
            source_name: name.to_string(),
            facility_use: "School".to_string(),
            use_type: "Secondary (Year 9-15)".to_string(),
            use_subtype: None,
            estimated_occupancy: Some(400),
            last_modified: None,
            geometry: square(cx, cy, 100.0),
            internal: false,
            internal_comments: None,
        }
    }

    fn source_point(source_id: Option<&str>, name: &str, x: f64, y: f64) -> SourceFacility {
        SourceFacility {
            authority: Authority::Education,
            source_id: source_id.map(String::from),
            name: name.to_string(),
            source_type: Some("Secondary (Year 9-15)".to_string()),
            source_subtype: None,
            occupancy: Some(400),
            address: None,
            suburb: None,
            city: None,
            geometry: Some(Geometry::Point(Point::new(x, y))),
            crs: Crs::Nztm,
        }
    }

    fn source_polygon(source_id: Option<&str>, name: &str, cx: f64, cy: f64) -> SourceFacility {
        let mut record = source_point(source_id, name, cx, cy);
        record.geometry = Some(Geometry::MultiPolygon(square(cx, cy, 100.0)));
        record
    }

    fn norm_refs(facilities: Vec<Facility>) -> Vec<NormalizedReference> {
        facilities
            .into_iter()
            .map(|f| normalize_reference(f).expect("reference normalizes"))
            .collect()
    }

    fn norm_sources(records: Vec<SourceFacility>) -> Vec<NormalizedSource> {
        let reprojector = NztmReprojector::new().expect("projections");
        records
            .into_iter()
            .map(|r| normalize_source(r, &reprojector).expect("source normalizes"))
            .collect()
    }

    fn run_classify(
        facilities: Vec<Facility>,
        records: Vec<SourceFacility>,
    ) -> (Vec<ChangeRecord>, ChangeCounts) {
        let config = DetectionConfig::default();
        let references = norm_refs(facilities);
        let sources = norm_sources(records);
        let candidates = match_records(&sources, &references, &config);
        classify(&references, &sources, &candidates, &config)
    }

    // -- configuration ------------------------------------------------------

    #[test]
    fn default_config_is_valid() {
        DetectionConfig::default().validate().expect("valid");
    }

    #[test]
    fn config_rejects_bad_tunables() {
        let mut config = DetectionConfig::default();
        config.spatial_buffer_m = 0.0;
        assert!(matches!(config.validate(), Err(DetectError::Configuration(_))));

        let mut config = DetectionConfig::default();
        config.fuzzy_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = DetectionConfig::default();
        config.comparison_fields.clear();
        assert!(config.validate().is_err());

        let mut config = DetectionConfig::default();
        config.geometry_tolerance_m2 = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_parses_from_yaml_with_defaults() {
        let config = DetectionConfig::from_yaml("fuzzy_threshold: 0.85\n").expect("parse");
        assert_eq!(config.fuzzy_threshold, 0.85);
        assert_eq!(config.spatial_buffer_m, 50.0);

        let err = DetectionConfig::from_yaml("fuzzy_threshold: 0.0\n").unwrap_err();
        assert!(err.to_string().contains("fuzzy_threshold"));
    }

    #[test]
    fn comparison_fields_parse_and_reject_unknown_names() {
        assert_eq!("source_name".parse::<ComparisonField>().unwrap(), ComparisonField::SourceName);
        assert_eq!("use_type".parse::<ComparisonField>().unwrap(), ComparisonField::SourceType);
        let err = "colour".parse::<ComparisonField>().unwrap_err();
        assert!(err.to_string().contains("unknown comparison field"));
    }

    // -- normalization ------------------------------------------------------

    #[test]
    fn source_without_geometry_is_malformed() {
        let reprojector = NztmReprojector::new().expect("projections");
        let mut record = source_point(Some("1"), "No Geometry School", 0.0, 0.0);
        record.geometry = None;
        let err = normalize_source(record, &reprojector).unwrap_err();
        assert!(matches!(err, DetectError::MalformedGeometry { .. }));
    }

    #[test]
    fn reference_with_empty_geometry_is_malformed() {
        let mut f = facility(1, None, "Empty", 0.0, 0.0);
        f.geometry = MultiPolygon(vec![]);
        assert!(matches!(
            normalize_reference(f),
            Err(DetectError::MalformedGeometry { .. })
        ));
    }

    #[test]
    fn wgs84_points_reproject_into_nztm_range() {
        let reprojector = NztmReprojector::new().expect("projections");
        let mut record = source_point(Some("1"), "Wellington School", 0.0, 0.0);
        record.geometry = Some(Geometry::Point(Point::new(174.7772, -41.2889)));
        record.crs = Crs::Wgs84;
        let normalized = normalize_source(record, &reprojector).expect("normalize");
        assert!((1_700_000.0..1_800_000.0).contains(&normalized.point.x()));
        assert!((5_400_000.0..5_500_000.0).contains(&normalized.point.y()));
        assert_eq!(normalized.record.crs, Crs::Nztm);
    }

    #[test]
    fn normalization_is_idempotent() {
        let reprojector = NztmReprojector::new().expect("projections");
        let mut record = source_point(Some("1"), "  Pāpāmoa   College ", 174.9, -37.7);
        record.crs = Crs::Wgs84;
        record.geometry = Some(Geometry::Point(Point::new(176.28, -37.71)));
        let once = normalize_source(record, &reprojector).expect("first pass");
        let twice = normalize_source(once.record.clone(), &reprojector).expect("second pass");
        assert_eq!(once, twice);
    }

    // -- matching -----------------------------------------------------------

    #[test]
    fn exact_id_outranks_geometry() {
        // Source sits far from the polygon but carries the right id.
        let references = norm_refs(vec![facility(1, Some("174"), "Example School", 0.0, 0.0)]);
        let sources = norm_sources(vec![source_point(Some("174"), "Renamed School", 5000.0, 5000.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::ExactId);
        assert_eq!(candidates[0].confidence, 1.0);
        assert_eq!(candidates[0].reference_idx, Some(0));
    }

    #[test]
    fn spatial_containment_matches_without_ids() {
        let references = norm_refs(vec![facility(1, None, "Example School", 0.0, 0.0)]);
        let sources = norm_sources(vec![source_point(None, "Totally Different Name", 10.0, -20.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::Spatial);
        assert_eq!(candidates[0].confidence, 1.0);
    }

    #[test]
    fn spatial_buffer_confidence_decays_toward_floor() {
        let references = norm_refs(vec![facility(1, None, "Example School", 0.0, 0.0)]);
        // 25 m outside a 100 m half-width square, within the 50 m buffer.
        let sources = norm_sources(vec![source_point(None, "Another Name", 125.0, 0.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::Spatial);
        assert!(candidates[0].confidence > 0.5 && candidates[0].confidence < 1.0);

        // Beyond the buffer and with a dissimilar name: unmatched.
        let sources = norm_sources(vec![source_point(None, "Another Name", 500.0, 0.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::Unmatched);
    }

    #[test]
    fn ambiguous_containment_resolves_by_name() {
        // Overlapping polygons both contain the point; the name decides.
        let references = norm_refs(vec![
            facility(1, None, "North Shore College", 0.0, 0.0),
            facility(2, None, "Harbour View School", 50.0, 0.0),
        ]);
        let sources = norm_sources(vec![source_point(None, "Harbour View School", 25.0, 0.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::FuzzyName);
        assert_eq!(candidates[0].reference_idx, Some(1));
    }

    #[test]
    fn fuzzy_match_requires_threshold_similarity() {
        let references = norm_refs(vec![facility(1, None, "Saint Heliers School", 0.0, 0.0)]);
        // Diacritics and casing fold away; point is outside polygon + buffer
        // so only the name carries the match.
        let sources = norm_sources(vec![source_point(None, "SAINT HÉLIERS SCHOOL", 400.0, 0.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::FuzzyName);
        assert_eq!(candidates[0].reference_idx, Some(0));
        assert!(candidates[0].confidence > 0.0);

        let sources = norm_sources(vec![source_point(None, "Completely Other Kura", 400.0, 0.0)]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::Unmatched);
    }

    #[test]
    fn contested_reference_keeps_strongest_claimant() {
        // Two sources inside one polygon; the exact-id one wins, the other
        // demotes to unmatched.
        let references = norm_refs(vec![facility(1, Some("174"), "Example School", 0.0, 0.0)]);
        let sources = norm_sources(vec![
            source_point(Some("9999"), "Example School Annex", -30.0, 0.0),
            source_point(Some("174"), "Example School", 30.0, 0.0),
        ]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        assert_eq!(candidates[0].method, MatchMethod::Unmatched);
        assert_eq!(candidates[1].method, MatchMethod::ExactId);
        assert_eq!(candidates[1].confidence, 1.0);

        let accepted: Vec<_> = candidates.iter().filter(|c| c.reference_idx.is_some()).collect();
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn one_to_one_invariant_holds_under_competition() {
        let references = norm_refs(vec![facility(1, None, "Example School", 0.0, 0.0)]);
        let sources = norm_sources(vec![
            source_point(None, "Example School", 10.0, 0.0),
            source_point(None, "Example School", -10.0, 0.0),
            source_point(None, "Example School", 0.0, 10.0),
        ]);
        let candidates = match_records(&sources, &references, &DetectionConfig::default());
        let accepted = candidates.iter().filter(|c| c.reference_idx.is_some()).count();
        assert_eq!(accepted, 1);
        let unmatched = candidates.iter().filter(|c| c.method == MatchMethod::Unmatched).count();
        assert_eq!(unmatched, 2);
    }

    // -- diffing ------------------------------------------------------------

    #[test]
    fn occupancy_requires_exact_match_when_enabled() {
        let mut config = DetectionConfig::default();
        config.comparison_fields.push(ComparisonField::Occupancy);

        let references = norm_refs(vec![facility(1, Some("174"), "Example School", 0.0, 0.0)]);
        let mut record = source_point(Some("174"), "Example School", 0.0, 0.0);
        record.occupancy = Some(401);
        let sources = norm_sources(vec![record]);

        let result = diff(&references[0], &sources[0], &config);
        assert!(!result.geometry_changed);
        assert!(result.attributes_changed);
        assert_eq!(result.changed_fields.len(), 1);
        assert_eq!(result.changed_fields[0].field, ComparisonField::Occupancy);
        assert_eq!(result.change_description(), "Attrs: occupancy: \"400\" -> \"401\"");
    }

    #[test]
    fn name_comparison_ignores_case_and_diacritics() {
        let config = DetectionConfig::default();
        let references = norm_refs(vec![facility(1, Some("174"), "Saint Heliers School", 0.0, 0.0)]);
        let sources = norm_sources(vec![source_point(Some("174"), "SAINT HÉLIERS   SCHOOL", 0.0, 0.0)]);
        let result = diff(&references[0], &sources[0], &config);
        assert!(!result.attributes_changed);
    }

    #[test]
    fn polygon_sources_diff_by_symmetric_difference() {
        let config = DetectionConfig::default();
        let references = norm_refs(vec![facility(1, Some("174"), "Example School", 0.0, 0.0)]);

        let identical = norm_sources(vec![source_polygon(Some("174"), "Example School", 0.0, 0.0)]);
        let result = diff(&references[0], &identical[0], &config);
        assert!(!result.geometry_changed);

        let shifted = norm_sources(vec![source_polygon(Some("174"), "Example School", 150.0, 0.0)]);
        let result = diff(&references[0], &shifted[0], &config);
        assert!(result.geometry_changed);
        assert!(result.change_description().starts_with("Geom: "));
    }

    // -- classification scenarios -------------------------------------------

    #[test]
    fn identical_records_are_unchanged() {
        let (records, counts) = run_classify(
            vec![facility(1, Some("174"), "Example School", 0.0, 0.0)],
            vec![source_point(Some("174"), "Example School", 0.0, 0.0)],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_action, ChangeAction::Unchanged);
        assert_eq!(counts.unchanged, 1);
        assert!(records[0].in_published);
        assert_eq!(records[0].match_method, Some(MatchMethod::ExactId));
    }

    #[test]
    fn shifted_geometry_is_geometry_updated() {
        let (records, counts) = run_classify(
            vec![facility(1, Some("174"), "Example School", 0.0, 0.0)],
            vec![source_point(Some("174"), "Example School", 600.0, 0.0)],
        );
        assert_eq!(records[0].change_action, ChangeAction::GeometryUpdated);
        assert!(records[0].change_description.starts_with("Geom: "));
        assert_eq!(counts.geom_updated, 1);
    }

    #[test]
    fn changed_use_type_is_attribute_updated() {
        let mut record = source_point(Some("174"), "Example School", 0.0, 0.0);
        record.source_type = Some("Composite".to_string());
        let (records, counts) = run_classify(
            vec![facility(1, Some("174"), "Example School", 0.0, 0.0)],
            vec![record],
        );
        assert_eq!(records[0].change_action, ChangeAction::AttributeUpdated);
        assert!(records[0]
            .change_description
            .contains("source_type: \"Secondary (Year 9-15)\" -> \"Composite\""));
        assert_eq!(counts.attr_updated, 1);
    }

    #[test]
    fn geometry_and_attribute_changes_combine() {
        let mut record = source_point(Some("174"), "Example School", 600.0, 0.0);
        record.source_type = Some("Composite".to_string());
        let (records, _) = run_classify(
            vec![facility(1, Some("174"), "Example School", 0.0, 0.0)],
            vec![record],
        );
        assert_eq!(records[0].change_action, ChangeAction::GeometryAttributeUpdated);
        assert!(records[0].change_description.contains("Geom: "));
        assert!(records[0].change_description.contains("Attrs: "));
    }

    #[test]
    fn unmatched_source_is_added() {
        let (records, counts) = run_classify(
            vec![facility(1, Some("174"), "Example School", 0.0, 0.0)],
            vec![
                source_point(Some("174"), "Example School", 0.0, 0.0),
                source_point(Some("9001"), "Brand New Kura", 90_000.0, 90_000.0),
            ],
        );
        assert_eq!(records.len(), 2);
        let added: Vec<_> = records
            .iter()
            .filter(|r| r.change_action == ChangeAction::Added)
            .collect();
        assert_eq!(added.len(), 1);
        assert!(!added[0].in_published);
        assert!(added[0].facility.is_none());
        assert_eq!(counts.added, 1);
    }

    #[test]
    fn reference_without_source_is_removed() {
        let (records, counts) = run_classify(
            vec![
                facility(1, Some("174"), "Example School", 0.0, 0.0),
                facility(2, Some("175"), "Closed School", 10_000.0, 10_000.0),
            ],
            vec![source_point(Some("174"), "Example School", 0.0, 0.0)],
        );
        let removed: Vec<_> = records
            .iter()
            .filter(|r| r.change_action == ChangeAction::Removed)
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].facility.as_ref().unwrap().facility_id, 2);
        assert!(removed[0].source.is_none());
        assert_eq!(counts.removed, 1);
    }

    #[test]
    fn exact_id_wins_contested_polygon_and_loser_is_added() {
        let (records, counts) = run_classify(
            vec![facility(1, Some("174"), "Example School", 0.0, 0.0)],
            vec![
                source_point(Some("9999"), "Example School Annex", -30.0, 0.0),
                source_point(Some("174"), "Example School", 30.0, 0.0),
            ],
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].change_action, ChangeAction::Unchanged);
        assert_eq!(records[0].match_method, Some(MatchMethod::ExactId));
        assert_eq!(records[1].change_action, ChangeAction::Added);
        assert_eq!(counts.added, 1);
        assert_eq!(counts.unchanged, 1);
    }

    // -- invariants ---------------------------------------------------------

    fn mixed_inputs() -> (Vec<Facility>, Vec<SourceFacility>) {
        let facilities = vec![
            facility(1, Some("174"), "Example School", 0.0, 0.0),
            facility(2, Some("175"), "Closed School", 20_000.0, 0.0),
            facility(3, None, "Harbour View School", 40_000.0, 0.0),
        ];
        let mut renamed = source_point(Some("174"), "Example School (Renamed)", 0.0, 0.0);
        renamed.source_type = Some("Composite".to_string());
        let records = vec![
            renamed,
            source_point(None, "Harbour View School", 40_010.0, 0.0),
            source_point(Some("9001"), "Brand New Kura", 80_000.0, 0.0),
        ];
        (facilities, records)
    }

    #[test]
    fn classification_is_complete_and_counts_balance() {
        let (facilities, records) = mixed_inputs();
        let reference_count = facilities.len();
        let (change_records, counts) = run_classify(facilities, records);

        let unmatched_sources = counts.added;
        assert_eq!(change_records.len(), reference_count + unmatched_sources);

        let mut facility_ids: Vec<i64> = change_records
            .iter()
            .filter_map(|r| r.facility.as_ref().map(|f| f.facility_id))
            .collect();
        facility_ids.sort_unstable();
        facility_ids.dedup();
        assert_eq!(facility_ids.len(), reference_count);

        let row_count_before = reference_count;
        let row_count_after = row_count_before - counts.removed + counts.added;
        assert_eq!(row_count_after, 3);
        assert_eq!(counts.removed, 1);
        assert_eq!(counts.added, 1);
    }

    #[test]
    fn classification_is_deterministic_across_input_orderings() {
        let (facilities, records) = mixed_inputs();
        let (first, first_counts) = run_classify(facilities.clone(), records.clone());

        let mut reversed_facilities = facilities;
        reversed_facilities.reverse();
        let mut reversed_records = records;
        reversed_records.reverse();
        let (second, second_counts) = run_classify(reversed_facilities, reversed_records);

        assert_eq!(first, second);
        assert_eq!(first_counts, second_counts);
    }

    #[test]
    fn run_summary_count_identity_holds() {
        let counts = ChangeCounts {
            added: 4,
            removed: 2,
            geom_updated: 1,
            attr_updated: 1,
            geom_attr_updated: 0,
            unchanged: 10,
        };
        let summary = RunSummary::new(
            Uuid::new_v4(),
            "tester",
            Authority::Education,
            counts,
            1,
            0,
            14,
        );
        assert_eq!(summary.row_count_after, 14 - 2 + 4);
        assert_eq!(summary.row_count_before, 14);
    }
}
