//! CSV sink that persists annotation records incrementally and replays them later.

use crate::literal::{format_list, parse_list};
use crate::record::AnnotationRecord;
use csv::{QuoteStyle, ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Column names, in order, of every sink file.
pub const SINK_COLUMNS: [&str; 9] = [
    "index",
    "pdb_id",
    "chain",
    "source",
    "region_values",
    "region_units",
    "uniprot",
    "pfam",
    "status",
];

/// Placeholder written for an absent UniProt accession.
const ABSENT: &str = "None";

/// Errors raised while writing or replaying a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Underlying file I/O failed.
    #[error("sink i/o error on {path:?}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Cause.
        source: io::Error,
    },
    /// CSV encoding failed.
    #[error("sink csv error: {0}")]
    Csv(#[from] csv::Error),
    /// The header lacks a column needed to rebuild records.
    #[error("sink header is missing column `{0}`")]
    MissingColumn(&'static str),
}

impl SinkError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only record writer; every record is flushed as soon as it is written.
pub struct AnnotationSink<W: Write> {
    writer: csv::Writer<W>,
    written: usize,
}

impl AnnotationSink<BufWriter<File>> {
    /// Creates (or truncates) the sink file at `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| SinkError::io(parent, err))?;
        }
        let file = File::create(path).map_err(|err| SinkError::io(path, err))?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> AnnotationSink<W> {
    /// Wraps `inner`, writing the header line immediately.
    pub fn new(mut inner: W) -> Result<Self, SinkError> {
        let header = format!("{}\n", SINK_COLUMNS.join(","));
        inner
            .write_all(header.as_bytes())
            .map_err(csv::Error::from)?;
        let writer = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::Always)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(inner);
        Ok(Self { writer, written: 0 })
    }

    /// Writes and flushes one record.
    pub fn append(&mut self, record: &AnnotationRecord) -> Result<(), SinkError> {
        let region_values = format_list(&record.region_values);
        let region_units = format_list(&record.region_units);
        let pfam = format_list(&record.pfam_ids);
        self.writer.write_record([
            record.row_index.as_str(),
            record.entity_id.as_str(),
            record.chain.as_str(),
            record.source.as_str(),
            region_values.as_str(),
            region_units.as_str(),
            record.uniprot.as_deref().unwrap_or(ABSENT),
            pfam.as_str(),
            record.status.as_str(),
        ])?;
        self.writer.flush().map_err(csv::Error::from)?;
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|err| SinkError::Csv(csv::Error::from(err.into_error())))
    }
}

/// A row the replay could not turn into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    /// 1-based line number in the sink file.
    pub line: u64,
    /// Why the row was skipped.
    pub reason: String,
}

/// Records recovered from a sink plus the rows that were dropped.
#[derive(Debug, Default)]
pub struct SinkReplay {
    /// Valid records in file order.
    pub records: Vec<AnnotationRecord>,
    /// Malformed rows, in file order.
    pub skipped: Vec<SkippedRow>,
}

/// Replays the sink file at `path`.
pub fn read_sink(path: &Path) -> Result<SinkReplay, SinkError> {
    let file = File::open(path).map_err(|err| SinkError::io(path, err))?;
    read_sink_from(file)
}

/// Replays a sink from any reader; malformed rows are logged and skipped.
pub fn read_sink_from<R: Read>(reader: R) -> Result<SinkReplay, SinkError> {
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(reader);
    let columns = Columns::locate(reader.headers()?)?;
    let mut replay = SinkReplay::default();

    for row in reader.records() {
        let skipped = match row {
            Ok(row) => {
                let line = row.position().map(|pos| pos.line()).unwrap_or_default();
                match columns.record(&row) {
                    Ok(record) => {
                        replay.records.push(record);
                        continue;
                    }
                    Err(reason) => SkippedRow { line, reason },
                }
            }
            Err(err) => SkippedRow {
                line: err.position().map(|pos| pos.line()).unwrap_or_default(),
                reason: err.to_string(),
            },
        };
        warn!(line = skipped.line, reason = %skipped.reason, "skipping sink row");
        replay.skipped.push(skipped);
    }

    Ok(replay)
}

struct Columns {
    index: Option<usize>,
    pdb_id: usize,
    chain: usize,
    source: Option<usize>,
    region_values: Option<usize>,
    region_units: Option<usize>,
    uniprot: Option<usize>,
    pfam: Option<usize>,
    status: Option<usize>,
}

impl Columns {
    fn locate(headers: &StringRecord) -> Result<Self, SinkError> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        Ok(Self {
            index: find("index"),
            pdb_id: find("pdb_id").ok_or(SinkError::MissingColumn("pdb_id"))?,
            chain: find("chain").ok_or(SinkError::MissingColumn("chain"))?,
            source: find("source"),
            region_values: find("region_values"),
            region_units: find("region_units"),
            uniprot: find("uniprot"),
            pfam: find("pfam"),
            status: find("status"),
        })
    }

    fn record(&self, row: &StringRecord) -> Result<AnnotationRecord, String> {
        let entity_id = cell(row, Some(self.pdb_id));
        let chain = cell(row, Some(self.chain));
        if entity_id.is_empty() || chain.is_empty() {
            return Err("missing pdb_id/chain".to_string());
        }

        let uniprot = match cell(row, self.uniprot) {
            "" | ABSENT => None,
            value => Some(value.to_string()),
        };

        Ok(AnnotationRecord {
            row_index: cell(row, self.index).to_string(),
            entity_id: entity_id.to_string(),
            chain: chain.to_string(),
            source: cell(row, self.source).to_string(),
            region_values: list_cell(row, "region_values", self.region_values)?,
            region_units: list_cell(row, "region_units", self.region_units)?,
            uniprot,
            pfam_ids: list_cell(row, "pfam", self.pfam)?,
            status: cell(row, self.status).to_string(),
        })
    }
}

fn cell(row: &StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i)).map(str::trim).unwrap_or("")
}

fn list_cell(row: &StringRecord, name: &str, idx: Option<usize>) -> Result<Vec<String>, String> {
    let raw = cell(row, idx);
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    parse_list(raw).map_err(|err| format!("unparseable {name} `{raw}`: {err}"))
}
