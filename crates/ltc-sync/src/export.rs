//! Parquet snapshots of a merged dataset, with a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use ltc_core::{FacilityRecord, QualityMetrics};
use ltc_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use crate::SourceConfig;

pub const FACILITIES_FILE: &str = "facilities.parquet";
pub const SOURCES_FILE: &str = "sources.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `facilities.parquet`, `sources.parquet` and `manifest.json` into
/// `snapshot_dir` and returns the manifest path.
pub fn export_snapshots(
    snapshot_dir: &Path,
    generated_at: DateTime<Utc>,
    facilities: &[FacilityRecord],
    sources: &[SourceConfig],
) -> Result<PathBuf> {
    std::fs::create_dir_all(snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let facilities_path = snapshot_dir.join(FACILITIES_FILE);
    let sources_path = snapshot_dir.join(SOURCES_FILE);
    write_facilities_parquet(&facilities_path, facilities)?;
    write_sources_parquet(&sources_path, sources)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        generated_at,
        files: vec![
            manifest_entry("facilities", snapshot_dir, &facilities_path, facilities.len())?,
            manifest_entry("sources", snapshot_dir, &sources_path, sources.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn string_column<'a>(rows: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(rows.collect::<Vec<_>>()))
}

fn metric_column(facilities: &[FacilityRecord], pick: fn(&QualityMetrics) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(
        facilities.iter().map(|f| pick(&f.metrics)).collect::<Vec<_>>(),
    ))
}

fn write_facilities_parquet(path: &Path, facilities: &[FacilityRecord]) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("postal_code", DataType::Utf8, true),
        ArrowField::new("lhin", DataType::Utf8, true),
        ArrowField::new("home_type", DataType::Utf8, true),
        ArrowField::new("licensed_beds", DataType::UInt32, true),
        ArrowField::new("region", DataType::Utf8, true),
        ArrowField::new("is_provincial", DataType::Boolean, false),
    ];
    let metrics: [(&str, fn(&QualityMetrics) -> Option<f64>); 8] = [
        ("wait_time_community", |m| m.wait_time_community),
        ("wait_time_hospital", |m| m.wait_time_hospital),
        ("antipsychotic_use", |m| m.antipsychotic_use),
        ("falls", |m| m.falls),
        ("restraints", |m| m.restraints),
        ("pressure_ulcers", |m| m.pressure_ulcers),
        ("pain", |m| m.pain),
        ("depression", |m| m.depression),
    ];
    fields.extend(
        metrics
            .iter()
            .map(|(name, _)| ArrowField::new(*name, DataType::Float64, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = vec![
        string_column(facilities.iter().map(|f| Some(f.name.as_str()))),
        string_column(facilities.iter().map(|f| f.details.city.as_deref())),
        string_column(facilities.iter().map(|f| f.details.postal_code.as_deref())),
        string_column(facilities.iter().map(|f| f.details.lhin.as_deref())),
        string_column(facilities.iter().map(|f| f.details.home_type.as_deref())),
        Arc::new(UInt32Array::from(
            facilities.iter().map(|f| f.details.licensed_beds).collect::<Vec<_>>(),
        )),
        string_column(facilities.iter().map(|f| f.region.as_deref())),
        Arc::new(BooleanArray::from(
            facilities.iter().map(|f| f.is_provincial).collect::<Vec<_>>(),
        )),
    ];
    columns.extend(metrics.iter().map(|(_, pick)| metric_column(facilities, *pick)));

    let batch = RecordBatch::try_new(schema, columns).context("building facilities record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, sources: &[SourceConfig]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("enabled", DataType::Boolean, false),
        ArrowField::new("provides", DataType::Utf8, false),
    ]));

    let kinds: Vec<String> = sources.iter().map(|s| format!("{:?}", s.kind)).collect();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            string_column(sources.iter().map(|s| Some(s.source_id.as_str()))),
            string_column(sources.iter().map(|s| Some(s.display_name.as_str()))),
            string_column(kinds.iter().map(|k| Some(k.as_str()))),
            Arc::new(BooleanArray::from(
                sources.iter().map(|s| s.enabled).collect::<Vec<_>>(),
            )),
            string_column(sources.iter().map(|s| Some(s.provides.as_str()))),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}
