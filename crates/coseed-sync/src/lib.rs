//! Batch conversion pipeline: company export CSV -> upsert SQL batch files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use coseed_core::{CompanyRecord, SectorRule, SectorRules, FALLBACK_SECTOR};
use coseed_ingest::{ingest_file, IngestStats};
use coseed_storage::OutputStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "coseed-sync";

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const SUMMARY_FILE_NAME: &str = "00_summary.txt";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const BATCH_FILE_PREFIX: &str = "insert_companies_batch_";
const BATCH_FILE_SUFFIX: &str = ".sql";

const UPSERT_HEADER: &str = "INSERT INTO companies (id, ticker_code, company_name, sector) VALUES\n";
const UPSERT_CONFLICT: &str = "ON CONFLICT (id) DO UPDATE SET\n  company_name = EXCLUDED.company_name,\n  ticker_code = EXCLUDED.ticker_code,\n  sector = EXCLUDED.sector;\n";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub rules_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("./export.csv"),
            output_dir: PathBuf::from("./sql-inserts"),
            batch_size: DEFAULT_BATCH_SIZE,
            rules_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            input_path: std::env::var("COSEED_INPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./export.csv")),
            output_dir: std::env::var("COSEED_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sql-inserts")),
            batch_size: std::env::var("COSEED_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            rules_path: std::env::var("COSEED_RULES").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rules file is not valid YAML: {0}")]
    Yaml(String),
    #[error("rule {index} has an empty sector label")]
    EmptySector { index: usize },
    #[error("rule {index} ({sector}) has no keywords")]
    NoKeywords { index: usize, sector: String },
    #[error("rule {index} ({sector}) has an empty keyword")]
    EmptyKeyword { index: usize, sector: String },
    #[error("fallback sector label is empty")]
    EmptyFallback,
}

#[derive(Debug, Clone, Deserialize)]
struct SectorRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_fallback")]
    fallback: String,
    #[serde(default)]
    rules: Vec<SectorRule>,
}

fn default_fallback() -> String {
    FALLBACK_SECTOR.to_string()
}

/// Parse a YAML rule table. File order is evaluation order.
pub fn parse_sector_rules(text: &str) -> Result<SectorRules, RuleError> {
    let file: SectorRulesFile =
        serde_yaml::from_str(text).map_err(|e| RuleError::Yaml(e.to_string()))?;

    if file.fallback.trim().is_empty() {
        return Err(RuleError::EmptyFallback);
    }
    for (index, rule) in file.rules.iter().enumerate() {
        if rule.sector.trim().is_empty() {
            return Err(RuleError::EmptySector { index });
        }
        if rule.contains_any.is_empty() {
            return Err(RuleError::NoKeywords {
                index,
                sector: rule.sector.clone(),
            });
        }
        if rule.contains_any.iter().any(|needle| needle.is_empty()) {
            return Err(RuleError::EmptyKeyword {
                index,
                sector: rule.sector.clone(),
            });
        }
    }

    Ok(SectorRules::new(file.rules, file.fallback))
}

pub fn load_sector_rules(path: &Path) -> Result<SectorRules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_sector_rules(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Double embedded single quotes; nothing else is escaped.
pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn batch_file_name(batch_index: usize) -> String {
    format!("{BATCH_FILE_PREFIX}{batch_index:03}{BATCH_FILE_SUFFIX}")
}

fn batch_index_of(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(BATCH_FILE_PREFIX)?
        .strip_suffix(BATCH_FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Batch files in `dir` left by an earlier run whose index is beyond `total`.
pub fn stale_batch_files(dir: &Path, total: usize) -> Result<Vec<String>> {
    let mut stale = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if batch_index_of(&name).is_some_and(|index| index > total) {
            stale.push(name);
        }
    }
    stale.sort_by_key(|name| batch_index_of(name));
    Ok(stale)
}

/// Render one self-contained upsert script for a 1-based batch.
pub fn render_batch_sql(batch_index: usize, records: &[CompanyRecord]) -> String {
    let values = records
        .iter()
        .map(|r| {
            format!(
                "  ('{}', '{}', '{}', '{}')",
                escape_sql_literal(&r.id),
                escape_sql_literal(&r.code),
                escape_sql_literal(&r.name),
                escape_sql_literal(&r.sector)
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    format!("-- companies upsert batch {batch_index}\n{UPSERT_HEADER}{values}\n{UPSERT_CONFLICT}")
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenBatch {
    pub batch_index: usize,
    pub file_name: String,
    pub path: PathBuf,
    pub records: usize,
    pub sha256: String,
    pub bytes: usize,
}

/// Split `records` into consecutive `batch_size` chunks and write one SQL file
/// per chunk. Files written before a failure are left in place.
pub fn write_batches(
    store: &OutputStore,
    records: &[CompanyRecord],
    batch_size: usize,
) -> Result<Vec<WrittenBatch>> {
    if batch_size == 0 {
        bail!("batch size must be at least 1");
    }

    let total = records.len().div_ceil(batch_size);
    let mut written = Vec::with_capacity(total);
    for (offset, chunk) in records.chunks(batch_size).enumerate() {
        let batch_index = offset + 1;
        let file_name = batch_file_name(batch_index);
        let sql = render_batch_sql(batch_index, chunk);
        let stored = store
            .write_file(&file_name, sql.as_bytes())
            .with_context(|| format!("writing batch {batch_index}/{total}"))?;

        info!(
            batch = batch_index,
            total,
            companies = chunk.len(),
            path = %stored.absolute_path.display(),
            "wrote SQL batch"
        );
        written.push(WrittenBatch {
            batch_index,
            file_name,
            path: stored.absolute_path,
            records: chunk.len(),
            sha256: stored.content_hash,
            bytes: stored.byte_size,
        });
    }
    Ok(written)
}

/// Per-sector counts, most frequent first, ties by label.
pub fn sector_counts(records: &[CompanyRecord]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.sector.as_str()).or_default() += 1;
    }
    let mut counts: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(sector, n)| (sector.to_string(), n))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub batch_size: usize,
    pub companies: usize,
    pub files: Vec<BatchManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchManifestFile {
    pub batch_index: usize,
    pub name: String,
    pub path: String,
    pub records: usize,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_path: String,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub duplicates_dropped: usize,
    pub companies: usize,
    pub batches: Vec<WrittenBatch>,
    pub sector_counts: Vec<(String, usize)>,
    pub stale_batches: Vec<String>,
    pub summary_path: PathBuf,
    pub manifest_path: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    rules: SectorRules,
    store: OutputStore,
}

impl SyncPipeline {
    /// Build a pipeline, loading the rule file when one is configured.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let rules = match &config.rules_path {
            Some(path) => load_sector_rules(path)?,
            None => SectorRules::builtin(),
        };
        let store = OutputStore::new(config.output_dir.clone());
        Ok(Self {
            config,
            rules,
            store,
        })
    }

    pub fn rules(&self) -> &SectorRules {
        &self.rules
    }

    pub fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        let _guard = span.enter();

        if self.config.batch_size == 0 {
            bail!("batch size must be at least 1");
        }

        // Input is fully materialized before the output directory is touched.
        let ingested = ingest_file(&self.config.input_path, &self.rules)?;
        info!(companies = ingested.records.len(), "total distinct companies");

        self.store.ensure_root()?;
        let batches = write_batches(&self.store, &ingested.records, self.config.batch_size)?;
        let sectors = sector_counts(&ingested.records);
        let stale_batches = stale_batch_files(self.store.root(), batches.len())?;
        for name in &stale_batches {
            warn!(file = %name, "batch file from an earlier run is not part of this run");
        }

        let finished_at = Utc::now();
        let summary_path = self.write_summary(
            run_id,
            started_at,
            finished_at,
            &ingested.stats,
            ingested.records.len(),
            &batches,
            &sectors,
            &stale_batches,
        )?;
        let manifest_path =
            self.write_manifest(run_id, finished_at, ingested.records.len(), &batches)?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            input_path: self.config.input_path.display().to_string(),
            rows_read: ingested.stats.rows_read,
            rows_skipped: ingested.stats.malformed,
            duplicates_dropped: ingested.stats.duplicates,
            companies: ingested.records.len(),
            batches,
            sector_counts: sectors,
            stale_batches,
            summary_path,
            manifest_path,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_summary(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        stats: &IngestStats,
        companies: usize,
        batches: &[WrittenBatch],
        sectors: &[(String, usize)],
        stale_batches: &[String],
    ) -> Result<PathBuf> {
        let rule = "===========================================";
        let thin = "-------------------------------------------";
        let mut lines = vec![
            rule.to_string(),
            "companies SQL generation complete".to_string(),
            rule.to_string(),
            String::new(),
            format!("run id: {run_id}"),
            format!("started: {started_at}"),
            format!("finished: {finished_at}"),
            format!("input: {}", self.config.input_path.display()),
            String::new(),
            format!("total companies: {companies}"),
            format!("rows read: {}", stats.rows_read),
            format!("rows skipped: {}", stats.malformed),
            format!("duplicate ids dropped: {}", stats.duplicates),
            format!("SQL files: {}", batches.len()),
            String::new(),
            "companies by sector:".to_string(),
            thin.to_string(),
        ];
        lines.extend(sectors.iter().map(|(sector, n)| format!("  {sector}: {n}")));
        if !stale_batches.is_empty() {
            lines.extend([
                String::new(),
                "stale batch files from an earlier run (do not execute):".to_string(),
                thin.to_string(),
            ]);
            lines.extend(stale_batches.iter().map(|name| format!("  {name}")));
        }
        lines.extend([
            String::new(),
            rule.to_string(),
            String::new(),
            "how to apply:".to_string(),
            "1. open an SQL session on the target database".to_string(),
            format!("2. execute the {} files listed in {MANIFEST_FILE_NAME}", batches.len()),
            "3. in ascending batch order, starting with 001".to_string(),
        ]);
        let mut text = lines.join("\n");
        text.push('\n');

        let stored = self
            .store
            .write_file(SUMMARY_FILE_NAME, text.as_bytes())
            .with_context(|| format!("writing {SUMMARY_FILE_NAME}"))?;
        Ok(stored.absolute_path)
    }

    fn write_manifest(
        &self,
        run_id: Uuid,
        generated_at: DateTime<Utc>,
        companies: usize,
        batches: &[WrittenBatch],
    ) -> Result<PathBuf> {
        let manifest = BatchManifest {
            schema_version: 1,
            run_id,
            generated_at,
            batch_size: self.config.batch_size,
            companies,
            files: batches
                .iter()
                .map(|b| BatchManifestFile {
                    batch_index: b.batch_index,
                    name: b.file_name.clone(),
                    path: b.file_name.clone(),
                    records: b.records,
                    sha256: b.sha256.clone(),
                    bytes: b.bytes,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing batch manifest")?;
        let stored = self
            .store
            .write_file(MANIFEST_FILE_NAME, &bytes)
            .with_context(|| format!("writing {MANIFEST_FILE_NAME}"))?;
        Ok(stored.absolute_path)
    }
}
