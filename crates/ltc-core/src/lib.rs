//! Core domain model for Ontario LTC home records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod distance;

pub const CRATE_NAME: &str = "ltc-core";

/// Display name of the province-wide reference row.
pub const PROVINCIAL_AVERAGE_NAME: &str = "Ontario Provincial Average";
pub const PROVINCIAL_REGION: &str = "Provincial";
pub const PROVINCE_WIDE_CITY: &str = "Province-wide";

/// Field names exported in the merged dataset header, in display order.
pub const MERGED_FIELDS: [&str; 20] = [
    "name",
    "address",
    "city",
    "postalCode",
    "phone",
    "fax",
    "website",
    "lhin",
    "homeCommunityCare",
    "homeType",
    "licensedBeds",
    "accreditation",
    "waitTimeCommunity",
    "waitTimeHospital",
    "antipsychoticUse",
    "falls",
    "restraints",
    "pressureUlcers",
    "pain",
    "depression",
];

/// Join key for a facility name: trimmed and ASCII-uppercased.
///
/// Only ever used for matching; display names are never rewritten.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

/// Quality metrics published by the metrics source. Wait times are in days,
/// everything else is a percentage of residents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityMetrics {
    pub wait_time_community: Option<f64>,
    pub wait_time_hospital: Option<f64>,
    pub antipsychotic_use: Option<f64>,
    pub falls: Option<f64>,
    pub restraints: Option<f64>,
    pub pressure_ulcers: Option<f64>,
    pub pain: Option<f64>,
    pub depression: Option<f64>,
}

impl QualityMetrics {
    pub fn populated_count(&self) -> usize {
        [
            self.wait_time_community,
            self.wait_time_hospital,
            self.antipsychotic_use,
            self.falls,
            self.restraints,
            self.pressure_ulcers,
            self.pain,
            self.depression,
        ]
        .iter()
        .filter(|m| m.is_some())
        .count()
    }
}

/// Location and administrative attributes published by the location source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationDetails {
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub website: Option<String>,
    pub lhin: Option<String>,
    pub home_community_care: Option<String>,
    pub home_administrator: Option<String>,
    pub licensee: Option<String>,
    pub management_firm: Option<String>,
    pub home_type: Option<String>,
    pub licensed_beds: Option<u32>,
    pub licensed_beds_text: Option<String>,
    pub approved_short_stay_beds: Option<String>,
    pub residents_council: Option<String>,
    pub family_council: Option<String>,
    pub accreditation: Option<String>,
    pub french_language_services: Option<String>,
}

/// One home as collected from the metrics source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRecord {
    pub name: String,
    #[serde(flatten)]
    pub metrics: QualityMetrics,
    #[serde(default)]
    pub is_provincial: bool,
}

/// One home as collected from the location source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub name: String,
    #[serde(flatten)]
    pub details: LocationDetails,
}

/// Unified post-reconciliation record served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityRecord {
    pub name: String,
    #[serde(flatten)]
    pub details: LocationDetails,
    #[serde(flatten)]
    pub metrics: QualityMetrics,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub is_provincial: bool,
}

impl FacilityRecord {
    /// Metrics name and values, location and administrative details.
    pub fn merged(metrics: &MetricsRecord, location: &LocationRecord) -> Self {
        Self {
            name: metrics.name.clone(),
            details: location.details.clone(),
            metrics: metrics.metrics.clone(),
            region: location.details.city.clone(),
            is_provincial: metrics.is_provincial,
        }
    }

    /// Unmatched metrics row. The provincial average has no location record
    /// and is placed province-wide instead.
    pub fn metrics_only(metrics: &MetricsRecord) -> Self {
        let (details, region) = if metrics.is_provincial {
            let details = LocationDetails {
                city: Some(PROVINCE_WIDE_CITY.to_string()),
                ..Default::default()
            };
            (details, Some(PROVINCIAL_REGION.to_string()))
        } else {
            (LocationDetails::default(), None)
        };
        Self {
            name: metrics.name.clone(),
            details,
            metrics: metrics.metrics.clone(),
            region,
            is_provincial: metrics.is_provincial,
        }
    }

    pub fn location_only(location: &LocationRecord) -> Self {
        Self {
            name: location.name.clone(),
            details: location.details.clone(),
            metrics: QualityMetrics::default(),
            region: location.details.city.clone(),
            is_provincial: false,
        }
    }
}

/// Checkpoint state of a collection run. The finished form doubles as the raw
/// per-source output file; `completed_at` is only set by the final write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProgress<R> {
    pub scraped_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_attempted: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "Vec::new")]
    pub homes: Vec<R>,
}

pub type RawSourceFile<R> = CollectionProgress<R>;

impl<R> CollectionProgress<R> {
    pub fn new(scraped_at: DateTime<Utc>) -> Self {
        Self {
            scraped_at,
            completed_at: None,
            total_attempted: 0,
            successful: 0,
            failed: 0,
            source: None,
            url: None,
            homes: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn processed(&self) -> usize {
        self.successful + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub name: String,
    pub url: Option<String>,
    pub data_date: Option<DateTime<Utc>>,
    pub provides: String,
}

/// Merged output file consumed by the serving layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedDataset {
    pub last_updated: DateTime<Utc>,
    pub sources: Vec<SourceInfo>,
    pub total_homes: usize,
    pub fields: Vec<String>,
    pub data: Vec<FacilityRecord>,
}

impl MergedDataset {
    pub fn new(last_updated: DateTime<Utc>, sources: Vec<SourceInfo>, data: Vec<FacilityRecord>) -> Self {
        Self {
            last_updated,
            sources,
            total_homes: data.len(),
            fields: MERGED_FIELDS.iter().map(ToString::to_string).collect(),
            data,
        }
    }
}

/// Durable snapshot of the last known-good dataset. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub data: Vec<FacilityRecord>,
    pub last_updated: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub source: String,
    pub url: String,
}

impl CacheSnapshot {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.last_updated > max_age
    }
}
