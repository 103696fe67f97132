//! CSV ingestion: decoding, row extraction and first-wins id deduplication.

use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use coseed_core::{CompanyRecord, SectorRules};
use csv::{ReaderBuilder, StringRecord};
use encoding_rs::{Encoding, UTF_8};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "coseed-ingest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input starts with a {0} byte-order mark; only UTF-8 is supported")]
    UnsupportedBom(&'static str),
    #[error("input is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    /// The reader is lenient about quoting (an unterminated quote runs to end
    /// of input); it only fails on I/O or UTF-8 errors from its source.
    #[error("parsing CSV {}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Strict UTF-8 decode. A leading UTF-8 BOM is dropped; any other BOM or a
/// malformed sequence is rejected rather than replaced.
pub fn decode_utf8(bytes: &[u8]) -> Result<Cow<'_, str>, DecodeError> {
    let body = match Encoding::for_bom(bytes) {
        Some((encoding, bom_len)) if encoding == UTF_8 => &bytes[bom_len..],
        Some((encoding, _)) => return Err(DecodeError::UnsupportedBom(encoding.name())),
        None => bytes,
    };
    UTF_8
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or(DecodeError::InvalidUtf8)
}

/// Parse CSV text, discarding the header row. Rows may have any column count
/// and quoting is lenient: an unterminated quoted field absorbs the rest of
/// the input instead of failing.
pub fn parse_records(text: &str) -> Result<Vec<StringRecord>, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    reader.records().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    Malformed,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub rows_read: usize,
    pub malformed: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub records: Vec<CompanyRecord>,
    pub stats: IngestStats,
}

/// Builds company records in first-seen order, dropping repeated ids.
pub struct CompanyDeduper<'r> {
    rules: &'r SectorRules,
    seen: HashSet<String>,
    records: Vec<CompanyRecord>,
    stats: IngestStats,
}

impl<'r> CompanyDeduper<'r> {
    pub fn new(rules: &'r SectorRules) -> Self {
        Self {
            rules,
            seen: HashSet::new(),
            records: Vec::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn push_pair(&mut self, id: &str, name: &str) -> Admission {
        self.stats.rows_read += 1;
        let id = id.trim();
        let name = name.trim();

        if id.is_empty() || name.is_empty() {
            self.stats.malformed += 1;
            return Admission::Malformed;
        }
        if !self.seen.insert(id.to_string()) {
            self.stats.duplicates += 1;
            return Admission::Duplicate;
        }

        self.records.push(CompanyRecord::new(id, name, self.rules));
        Admission::Added
    }

    /// Column 0 is the id, column 1 the name; extra columns are ignored.
    pub fn push_record(&mut self, record: &StringRecord) -> Admission {
        match (record.get(0), record.get(1)) {
            (Some(id), Some(name)) => self.push_pair(id, name),
            _ => {
                self.stats.rows_read += 1;
                self.stats.malformed += 1;
                Admission::Malformed
            }
        }
    }

    pub fn finish(self) -> Ingested {
        Ingested {
            records: self.records,
            stats: self.stats,
        }
    }
}

/// Read, decode and deduplicate a whole CSV export into memory.
pub fn ingest_file(path: &Path, rules: &SectorRules) -> Result<Ingested, IngestError> {
    let bytes = std::fs::read(path).map_err(|source| IngestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = decode_utf8(&bytes).map_err(|source| IngestError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let records = parse_records(&text).map_err(|source| IngestError::Csv {
        path: path.to_path_buf(),
        source,
    })?;

    let mut deduper = CompanyDeduper::new(rules);
    for record in &records {
        let admission = deduper.push_record(record);
        if admission != Admission::Added {
            let line = record.position().map(|p| p.line());
            debug!(?line, ?admission, "row not admitted");
        }
    }
    let ingested = deduper.finish();

    info!(
        path = %path.display(),
        rows = ingested.stats.rows_read,
        companies = ingested.records.len(),
        malformed = ingested.stats.malformed,
        duplicates = ingested.stats.duplicates,
        "ingested company export"
    );
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_text(text: &str) -> Ingested {
        let rules = SectorRules::builtin();
        let mut deduper = CompanyDeduper::new(&rules);
        for record in parse_records(text).expect("parse") {
            deduper.push_record(&record);
        }
        deduper.finish()
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let bytes = b"\xEF\xBB\xBFid,name\n";
        assert_eq!(decode_utf8(bytes).expect("decode"), "id,name\n");
    }

    #[test]
    fn utf16_bom_is_rejected() {
        let bytes = b"\xFF\xFEi\0d\0";
        assert_eq!(
            decode_utf8(bytes).expect_err("utf-16"),
            DecodeError::UnsupportedBom("UTF-16LE")
        );
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let bytes = b"id,name\nE001,\x82\xa0\n";
        assert_eq!(decode_utf8(bytes).expect_err("sjis"), DecodeError::InvalidUtf8);
    }

    #[test]
    fn first_occurrence_wins() {
        let ingested = ingest_text(
            "docID,filerName\nE001,X銀行株式会社\nE002,Y自動車工業\nE001,duplicate-ignored\n",
        );
        let ids: Vec<_> = ingested.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["E001", "E002"]);
        assert_eq!(ingested.records[0].name, "X銀行株式会社");
        assert_eq!(ingested.records[0].sector, "銀行業");
        assert_eq!(ingested.records[1].sector, "輸送用機器");
        assert_eq!(ingested.stats.duplicates, 1);
    }

    #[test]
    fn fields_are_trimmed_before_dedup() {
        let ingested = ingest_text("id,name\n  E001 ,  Alpha \nE001,Beta\n");
        assert_eq!(ingested.records.len(), 1);
        assert_eq!(ingested.records[0].id, "E001");
        assert_eq!(ingested.records[0].name, "Alpha");
    }

    #[test]
    fn malformed_rows_are_skipped_and_counted() {
        let ingested = ingest_text("id,name\nE001\n,Nameless\nE002,   \nE003,Gamma\n");
        assert_eq!(ingested.records.len(), 1);
        assert_eq!(ingested.records[0].id, "E003");
        assert_eq!(
            ingested.stats,
            IngestStats {
                rows_read: 4,
                malformed: 3,
                duplicates: 0,
            }
        );
    }

    #[test]
    fn quoted_names_keep_commas_and_quotes() {
        let ingested = ingest_text(
            "id,name,extra\nE010,\"Foo, Bar\",x\nE011,\"O'Brien \"\"Big\"\" Co.\",y\n",
        );
        assert_eq!(ingested.records[0].name, "Foo, Bar");
        assert_eq!(ingested.records[1].name, "O'Brien \"Big\" Co.");
    }

    #[test]
    fn unterminated_quote_absorbs_following_rows() {
        let records =
            parse_records("id,name\nE001,\"Unterminated\nE002,Foo\nE003,Bar\n").expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get(0), Some("E001"));
        assert_eq!(records[0].get(1), Some("Unterminated\nE002,Foo\nE003,Bar\n"));

        let ingested = ingest_text("id,name\nE001,\"Unterminated\nE002,Foo\n");
        assert_eq!(ingested.records.len(), 1);
        assert_eq!(ingested.records[0].name, "Unterminated\nE002,Foo");
    }

    #[test]
    fn header_only_input_yields_nothing() {
        let ingested = ingest_text("id,name\n");
        assert!(ingested.records.is_empty());
        assert_eq!(ingested.stats, IngestStats::default());
    }
}
