//! Authority source adapters: fetch and parse external facility datasets
//! into the normalized `SourceFacility` shape.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fcd_core::{coerce_occupancy, Authority, Crs, SourceFacility};
use fcd_storage::HttpFetcher;
use geo::{EuclideanDistance, HaversineDistance};
use geo_types::{Geometry, Point};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "fcd-adapters";

pub const EDUCATION_ENDPOINT: &str =
    "https://catalogue.data.govt.nz/api/3/action/datastore_search_sql";
pub const HEALTH_ENDPOINT: &str =
    "https://www.health.govt.nz/sites/default/files/prms/pst_csvs/LegalEntitySummaryPublicHospital.csv";

const EDUCATION_SQL: &str = r#"
SELECT
    "School_Id",
    "Org_Name",
    "Add1_Line1",
    "Add1_Suburb",
    "Add1_City",
    "Org_Type",
    "Latitude",
    "Longitude",
    "Roll_Date",
    "Total"
FROM "20b7c271-fd5a-4c9e-869b-481a0e2453cd"
ORDER BY "School_Id"
"#;

/// A teen parent unit closer than this to another education record is taken
/// to sit inside a host school and is filtered out.
const TEEN_UNIT_DISTANCE_M: f64 = 100.0;

// ---------------------------------------------------------------------------
// Captures
// ---------------------------------------------------------------------------

/// One raw authority response, as fetched or as replayed from disk.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub authority: Authority,
    pub url: String,
    pub content_type: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawCapture {
    /// Loads a previously saved capture for a fixture-first run.
    pub fn from_file(authority: Authority, path: &Path) -> anyhow::Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading capture {}", path.display()))?;
        let content_type = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => "application/json",
            Some("csv") => "text/csv",
            _ => "text/plain",
        };
        Ok(Self {
            authority,
            url: format!("file://{}", path.display()),
            content_type: content_type.to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }

    /// Saves the capture body for later replay.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, &self.body)
            .with_context(|| format!("saving capture to {}", path.display()))
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {authority} source from {url}: {detail}")]
    Fetch {
        authority: Authority,
        url: String,
        detail: String,
    },
    #[error("parsing {authority} capture: {detail}")]
    Parse { authority: Authority, detail: String },
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// Authority-specific source provider. `fetch` talks to the network;
/// `parse` is pure so saved captures replay identically.
#[async_trait]
pub trait AuthorityAdapter: Send + Sync {
    fn authority(&self) -> Authority;

    async fn fetch(&self, http: &HttpFetcher) -> Result<RawCapture, AdapterError>;

    fn parse(&self, capture: &RawCapture) -> Result<Vec<SourceFacility>, AdapterError>;
}

pub fn adapter_for_authority(authority: Authority) -> Box<dyn AuthorityAdapter> {
    match authority {
        Authority::Education => Box::new(EducationAdapter),
        Authority::Health => Box::new(HealthAdapter),
    }
}

// ---------------------------------------------------------------------------
// Education authority (datastore JSON API)
// ---------------------------------------------------------------------------

/// Schools from the education authority's datastore-search-SQL endpoint.
/// Coordinates are WGS84 and may be absent.
#[derive(Debug, Clone, Copy)]
pub struct EducationAdapter;

#[async_trait]
impl AuthorityAdapter for EducationAdapter {
    fn authority(&self) -> Authority {
        Authority::Education
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<RawCapture, AdapterError> {
        info!(endpoint = EDUCATION_ENDPOINT, "fetching education source data");
        let body = http
            .fetch_text(EDUCATION_ENDPOINT, &[("sql", EDUCATION_SQL)])
            .await
            .map_err(|e| AdapterError::Fetch {
                authority: Authority::Education,
                url: EDUCATION_ENDPOINT.to_string(),
                detail: e.to_string(),
            })?;
        Ok(RawCapture {
            authority: Authority::Education,
            url: EDUCATION_ENDPOINT.to_string(),
            content_type: "application/json".to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse(&self, capture: &RawCapture) -> Result<Vec<SourceFacility>, AdapterError> {
        let parse_err = |detail: String| AdapterError::Parse {
            authority: Authority::Education,
            detail,
        };
        let value: JsonValue =
            serde_json::from_str(&capture.body).map_err(|e| parse_err(e.to_string()))?;
        let records = value
            .get("result")
            .and_then(|r| r.get("records"))
            .and_then(|r| r.as_array())
            .ok_or_else(|| parse_err("response has no result.records array".to_string()))?;

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let name = json_string(record, "Org_Name")
                .ok_or_else(|| parse_err("record without Org_Name".to_string()))?;
            let geometry = match (json_f64(record, "Longitude"), json_f64(record, "Latitude")) {
                (Some(lon), Some(lat)) => Some(Geometry::Point(Point::new(lon, lat))),
                _ => None,
            };
            out.push(SourceFacility {
                authority: Authority::Education,
                source_id: json_string(record, "School_Id"),
                name,
                source_type: json_string(record, "Org_Type"),
                source_subtype: None,
                occupancy: coerce_occupancy(json_f64(record, "Total")),
                address: json_string(record, "Add1_Line1"),
                suburb: json_string(record, "Add1_Suburb"),
                city: json_string(record, "Add1_City"),
                geometry,
                crs: Crs::Wgs84,
            });
        }
        Ok(out)
    }
}

/// Reads a JSON field that the datastore may serve as either a string or a
/// number.
fn json_string(record: &JsonValue, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(record: &JsonValue, key: &str) -> Option<f64> {
    match record.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Health authority (public hospitals CSV)
// ---------------------------------------------------------------------------

/// Public hospitals from the health authority's CSV export. The file has
/// ragged trailing commas and padded header names; coordinates are NZTM.
#[derive(Debug, Clone, Copy)]
pub struct HealthAdapter;

#[async_trait]
impl AuthorityAdapter for HealthAdapter {
    fn authority(&self) -> Authority {
        Authority::Health
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<RawCapture, AdapterError> {
        info!(endpoint = HEALTH_ENDPOINT, "fetching health source data");
        let body = http
            .fetch_text(HEALTH_ENDPOINT, &[])
            .await
            .map_err(|e| AdapterError::Fetch {
                authority: Authority::Health,
                url: HEALTH_ENDPOINT.to_string(),
                detail: e.to_string(),
            })?;
        Ok(RawCapture {
            authority: Authority::Health,
            url: HEALTH_ENDPOINT.to_string(),
            content_type: "text/csv".to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse(&self, capture: &RawCapture) -> Result<Vec<SourceFacility>, AdapterError> {
        let parse_err = |detail: String| AdapterError::Parse {
            authority: Authority::Health,
            detail,
        };
        let cleaned = clean_hospitals_csv(&capture.body);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(cleaned.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| parse_err(e.to_string()))?
            .clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let name_idx = col("Facility_Name")
            .ok_or_else(|| parse_err("missing Facility_Name column".to_string()))?;
        let id_idx = col("Facility_Id");
        let type_idx = col("Facility_Type");
        let beds_idx = col("Certified_Beds");
        let address_idx = col("Address");
        let suburb_idx = col("Suburb");
        let city_idx = col("City");
        let easting_idx = col("NZTM_Easting");
        let northing_idx = col("NZTM_Northing");

        let field = |row: &csv::StringRecord, idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| row.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let mut out = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| parse_err(e.to_string()))?;
            let Some(name) = field(&row, Some(name_idx)) else {
                continue;
            };
            let geometry = match (
                field(&row, easting_idx).and_then(|v| v.parse::<f64>().ok()),
                field(&row, northing_idx).and_then(|v| v.parse::<f64>().ok()),
            ) {
                (Some(x), Some(y)) => Some(Geometry::Point(Point::new(x, y))),
                _ => None,
            };
            out.push(SourceFacility {
                authority: Authority::Health,
                source_id: field(&row, id_idx),
                name,
                source_type: field(&row, type_idx),
                source_subtype: None,
                occupancy: coerce_occupancy(
                    field(&row, beds_idx).and_then(|v| v.parse::<f64>().ok()),
                ),
                address: field(&row, address_idx),
                suburb: field(&row, suburb_idx),
                city: field(&row, city_idx),
                geometry,
                crs: Crs::Nztm,
            });
        }
        Ok(out)
    }
}

/// Strips the trailing commas the export pads every row with, and trims
/// whitespace inside header names.
fn clean_hospitals_csv(text: &str) -> String {
    let mut lines = text.lines().map(|line| line.trim_end_matches(','));
    let header = lines
        .next()
        .map(|h| {
            h.split(',')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    let mut cleaned = vec![header];
    cleaned.extend(lines.map(String::from));
    cleaned.join("\n")
}

// ---------------------------------------------------------------------------
// Source filtering
// ---------------------------------------------------------------------------

/// Drops education records that should never enter matching: proposed
/// schools, and teen parent units sitting within an existing school site
/// (closer than `TEEN_UNIT_DISTANCE_M` to any other record).
pub fn filter_education_records(records: Vec<SourceFacility>) -> Vec<SourceFacility> {
    let points: Vec<Option<Point<f64>>> = records
        .iter()
        .map(|r| match &r.geometry {
            Some(Geometry::Point(p)) => Some(*p),
            _ => None,
        })
        .collect();

    let before = records.len();
    let mut kept = Vec::with_capacity(before);
    for (idx, record) in records.into_iter().enumerate() {
        if record.name.to_lowercase().contains("proposed") {
            continue;
        }
        if record.source_type.as_deref() == Some("Teen Parent Unit") {
            if let Some(point) = points[idx] {
                let mut nearest = f64::INFINITY;
                for (other_idx, other) in points.iter().enumerate() {
                    if other_idx == idx {
                        continue;
                    }
                    if let Some(other) = other {
                        nearest = nearest.min(point_distance_m(point, *other, record.crs));
                    }
                }
                if nearest < TEEN_UNIT_DISTANCE_M {
                    continue;
                }
            }
        }
        kept.push(record);
    }

    if kept.len() != before {
        info!(dropped = before - kept.len(), "filtered education records");
    }
    kept
}

fn point_distance_m(a: Point<f64>, b: Point<f64>, crs: Crs) -> f64 {
    match crs {
        Crs::Wgs84 => a.haversine_distance(&b),
        Crs::Nztm => a.euclidean_distance(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDUCATION_FIXTURE: &str = r#"{
      "success": true,
      "result": {
        "records": [
          {
            "School_Id": 174,
            "Org_Name": "Example School",
            "Add1_Line1": "1 Example Street",
            "Add1_Suburb": "Harbourside",
            "Add1_City": "Wellington",
            "Org_Type": "Secondary (Year 9-15)",
            "Latitude": -41.29,
            "Longitude": 174.78,
            "Roll_Date": "2026-03-01",
            "Total": 450
          },
          {
            "School_Id": "205",
            "Org_Name": "Inland College",
            "Add1_Line1": null,
            "Add1_Suburb": null,
            "Add1_City": "Taupo",
            "Org_Type": "Composite",
            "Latitude": null,
            "Longitude": null,
            "Roll_Date": "2026-03-01",
            "Total": "310"
          }
        ]
      }
    }"#;

    const HEALTH_FIXTURE: &str = concat!(
        "Facility_Id, Facility_Name ,Facility_Type,Address,Suburb,City,Certified_Beds,NZTM_Easting,NZTM_Northing,,\n",
        "H001,Harbour City Hospital,Public Hospital,12 Quay Street,,Auckland,250,1757000,5920400,,\n",
        "H002,Lakeside Clinic,Public Hospital,,,Rotorua,40,,,\n",
    );

    fn education_capture(body: &str) -> RawCapture {
        RawCapture {
            authority: Authority::Education,
            url: EDUCATION_ENDPOINT.to_string(),
            content_type: "application/json".to_string(),
            body: body.to_string(),
            fetched_at: Utc::now(),
        }
    }

    fn point_record(name: &str, source_type: &str, lon: f64, lat: f64) -> SourceFacility {
        SourceFacility {
            authority: Authority::Education,
            source_id: Some(name.to_string()),
            name: name.to_string(),
            source_type: Some(source_type.to_string()),
            source_subtype: None,
            occupancy: None,
            address: None,
            suburb: None,
            city: None,
            geometry: Some(Geometry::Point(Point::new(lon, lat))),
            crs: Crs::Wgs84,
        }
    }

    #[test]
    fn education_parse_handles_numeric_and_string_fields() {
        let records = EducationAdapter
            .parse(&education_capture(EDUCATION_FIXTURE))
            .expect("parse");
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].source_id.as_deref(), Some("174"));
        assert_eq!(records[0].name, "Example School");
        assert_eq!(records[0].occupancy, Some(450));
        assert!(matches!(records[0].geometry, Some(Geometry::Point(_))));
        assert_eq!(records[0].crs, Crs::Wgs84);

        // string-typed id and occupancy still parse; missing coords mean no geometry
        assert_eq!(records[1].source_id.as_deref(), Some("205"));
        assert_eq!(records[1].occupancy, Some(310));
        assert!(records[1].geometry.is_none());
    }

    #[test]
    fn education_parse_rejects_malformed_response() {
        let err = EducationAdapter
            .parse(&education_capture(r#"{"success": true, "result": {}}"#))
            .unwrap_err();
        assert!(err.to_string().contains("result.records"));
    }

    #[test]
    fn health_parse_cleans_ragged_csv() {
        let capture = RawCapture {
            authority: Authority::Health,
            url: HEALTH_ENDPOINT.to_string(),
            content_type: "text/csv".to_string(),
            body: HEALTH_FIXTURE.to_string(),
            fetched_at: Utc::now(),
        };
        let records = HealthAdapter.parse(&capture).expect("parse");
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].source_id.as_deref(), Some("H001"));
        assert_eq!(records[0].name, "Harbour City Hospital");
        assert_eq!(records[0].occupancy, Some(250));
        assert_eq!(records[0].crs, Crs::Nztm);
        let Some(Geometry::Point(p)) = &records[0].geometry else {
            panic!("expected point geometry");
        };
        assert_eq!(p.x(), 1757000.0);

        assert!(records[1].geometry.is_none());
        assert_eq!(records[1].suburb, None);
    }

    #[test]
    fn proposed_schools_are_filtered() {
        let records = vec![
            point_record("Example School", "Secondary (Year 9-15)", 174.78, -41.29),
            point_record("Proposed School of Hutt South", "Secondary (Year 9-15)", 174.9, -41.2),
        ];
        let kept = filter_education_records(records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Example School");
    }

    #[test]
    fn teen_parent_units_near_other_schools_are_filtered() {
        // ~33 m apart: unit sits inside the host school and is dropped.
        let records = vec![
            point_record("Host High School", "Secondary (Year 9-15)", 174.7800, -41.2900),
            point_record("Harbour Teen Parent Unit", "Teen Parent Unit", 174.7800, -41.2903),
        ];
        let kept = filter_education_records(records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Host High School");

        // ~1.1 km apart: standalone unit is kept.
        let records = vec![
            point_record("Host High School", "Secondary (Year 9-15)", 174.7800, -41.2900),
            point_record("Standalone Teen Parent Unit", "Teen Parent Unit", 174.7800, -41.3000),
        ];
        let kept = filter_education_records(records);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn captures_round_trip_through_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("education.json");
        let capture = education_capture(EDUCATION_FIXTURE);
        capture.save(&path).expect("save");

        let replayed = RawCapture::from_file(Authority::Education, &path).expect("load");
        assert_eq!(replayed.content_type, "application/json");
        assert_eq!(replayed.body, capture.body);
    }
}
