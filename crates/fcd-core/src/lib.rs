//! Core domain model for facilities change detection.

use chrono::NaiveDate;
use geo_types::{Geometry, MultiPolygon};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "fcd-core";

/// External body whose dataset is reconciled against the reference set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Education,
    Health,
}

impl Authority {
    /// The `use` value reference facilities of this authority carry.
    pub fn facility_use(&self) -> &'static str {
        match self {
            Self::Education => "School",
            Self::Health => "Hospital",
        }
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Education => write!(f, "education"),
            Self::Health => write!(f, "health"),
        }
    }
}

/// Coordinate reference system a geometry is expressed in.
///
/// All comparison happens in NZTM (EPSG:2193); WGS84 geometries are
/// reprojected by the normalizer before any matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crs {
    Wgs84,
    Nztm,
}

/// Final verdict for one reconciled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Added,
    Removed,
    GeometryUpdated,
    AttributeUpdated,
    GeometryAttributeUpdated,
    Unchanged,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
            Self::GeometryUpdated => write!(f, "geometry_updated"),
            Self::AttributeUpdated => write!(f, "attribute_updated"),
            Self::GeometryAttributeUpdated => write!(f, "geometry_attribute_updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// How a source record was paired with a reference record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    ExactId,
    Spatial,
    FuzzyName,
    Unmatched,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExactId => write!(f, "exact_id"),
            Self::Spatial => write!(f, "spatial"),
            Self::FuzzyName => write!(f, "fuzzy_name"),
            Self::Unmatched => write!(f, "unmatched"),
        }
    }
}

/// A curated facility from the reference dataset.
///
/// Read-only input to the engine: `facility_id` is assigned once by the
/// ingestion process and never reused, and only humans mutate the dataset
/// after reviewing engine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: i64,
    pub source_facility_id: Option<String>,
    pub name: String,
    pub source_name: String,
    pub facility_use: String,
    pub use_type: String,
    pub use_subtype: Option<String>,
    pub estimated_occupancy: Option<u32>,
    pub last_modified: Option<NaiveDate>,
    /// Always NZTM.
    pub geometry: MultiPolygon<f64>,
    /// Missing/null loads as false; internal facilities are excluded from
    /// the published report layer.
    #[serde(default)]
    pub internal: bool,
    pub internal_comments: Option<String>,
}

/// One record fetched from an authority source.
///
/// Constructed fresh each run by an adapter and discarded afterwards. The
/// field set is the normalized superset over all authorities; fields a
/// particular authority does not publish stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFacility {
    pub authority: Authority,
    pub source_id: Option<String>,
    pub name: String,
    pub source_type: Option<String>,
    pub source_subtype: Option<String>,
    pub occupancy: Option<u32>,
    pub address: Option<String>,
    pub suburb: Option<String>,
    pub city: Option<String>,
    pub geometry: Option<Geometry<f64>>,
    pub crs: Crs,
}

/// The output unit: one per processed reference record plus one per
/// unmatched source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub facility: Option<Facility>,
    pub source: Option<SourceFacility>,
    pub change_action: ChangeAction,
    pub change_description: String,
    /// Whether this record was present in the prior reference set.
    pub in_published: bool,
    pub match_method: Option<MatchMethod>,
    pub match_confidence: Option<f64>,
}

/// Folds a name into its comparison key: NFD-decomposed with combining
/// marks stripped, lowercased, whitespace trimmed and collapsed.
///
/// Idempotent: folding an already-folded key returns it unchanged.
pub fn comparison_key(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trims and collapses internal whitespace while preserving casing, for
/// display fields that must survive normalization unchanged otherwise.
pub fn tidy_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Coerces a raw occupancy value to a non-negative count. Negative,
/// non-finite or absent values are unknown.
pub fn coerce_occupancy(raw: Option<f64>) -> Option<u32> {
    match raw {
        Some(v) if v.is_finite() && v >= 0.0 => Some(v.round() as u32),
        _ => None,
    }
}

/// Trims an external identifier, treating empty or whitespace-only values
/// as absent.
pub fn non_empty_id(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}
