//! Sequence resolution for the records of a sink: fetches each record's sequence from RCSB or
//! UniProt and streams a multi-FASTA file, with failures appended to a companion `.err` file.

use crate::literal::format_list;
use crate::probe::FetchError;
use crate::record::{AnnotationRecord, SourceKind};
use crate::sink::{read_sink, SinkError};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

/// FASTA entry endpoint for experimental structures.
pub const RCSB_FASTA_URL: &str = "https://www.rcsb.org/fasta/entry";
/// UniProt search endpoint used for predicted models.
pub const UNIPROT_SEARCH_URL: &str = "https://rest.uniprot.org/uniprotkb/search";

const LINE_WIDTH: usize = 80;

/// Where a record's sequence comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceRequest {
    /// RCSB entry FASTA; the chain is picked from the returned records.
    Entry {
        /// PDB identifier.
        entity_id: String,
    },
    /// UniProt search by accession; every returned sequence line is used.
    Accession {
        /// UniProt accession (the entity id of a predicted model).
        accession: String,
    },
}

impl SequenceRequest {
    /// Chooses the source for `record`.
    pub fn for_record(record: &AnnotationRecord) -> Self {
        match record.source_kind() {
            SourceKind::Predicted => SequenceRequest::Accession {
                accession: record.entity_id.clone(),
            },
            SourceKind::Experimental => SequenceRequest::Entry {
                entity_id: record.entity_id.clone(),
            },
        }
    }

    /// Download URL for this request.
    pub fn url(&self) -> String {
        match self {
            SequenceRequest::Entry { entity_id } => format!("{RCSB_FASTA_URL}/{entity_id}"),
            SequenceRequest::Accession { accession } => {
                let query = format!("({accession})");
                match Url::parse_with_params(
                    UNIPROT_SEARCH_URL,
                    [("query", query.as_str()), ("format", "fasta")],
                ) {
                    Ok(url) => url.into(),
                    Err(_) => format!("{UNIPROT_SEARCH_URL}?query={query}&format=fasta"),
                }
            }
        }
    }
}

/// Fetches raw FASTA text.
#[async_trait]
pub trait SequenceLookup: Send + Sync {
    /// Returns the FASTA body answered for `request`.
    async fn fetch_fasta(&self, request: &SequenceRequest) -> Result<String, FetchError>;
}

/// `reqwest`-backed lookup against the public RCSB and UniProt services.
#[derive(Clone)]
pub struct HttpSequenceLookup {
    client: Client,
}

impl HttpSequenceLookup {
    /// Uses `client`, whose timeout bounds each lookup.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SequenceLookup for HttpSequenceLookup {
    async fn fetch_fasta(&self, request: &SequenceRequest) -> Result<String, FetchError> {
        let url = request.url();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FetchError::http(&url, err))?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        response.text().await.map_err(|err| FetchError::http(&url, err))
    }
}

/// Splits FASTA text into `(header, sequence)` pairs; sequence lines are concatenated.
pub fn split_fasta(text: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(header) = line.strip_prefix('>') {
            entries.push((header.trim().to_string(), String::new()));
        } else if let Some((_, sequence)) = entries.last_mut() {
            sequence.push_str(line);
        }
    }
    entries
}

/// True when a FASTA header names `chain`: `chain <c>`, `|<c>|`, or `<c>` as a whole word.
pub fn header_matches_chain(header: &str, chain: &str) -> bool {
    if chain.is_empty() {
        return false;
    }
    if header
        .to_lowercase()
        .contains(&format!("chain {}", chain.to_lowercase()))
    {
        return true;
    }
    if header.contains(&format!("|{chain}|")) {
        return true;
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(chain)))
        .map(|word| word.is_match(header))
        .unwrap_or(false)
}

/// Extracts the record's sequence from a FASTA answer.
pub fn pick_sequence(request: &SequenceRequest, fasta: &str, chain: &str) -> Option<String> {
    let sequence = match request {
        SequenceRequest::Entry { .. } => split_fasta(fasta)
            .into_iter()
            .find(|(header, _)| header_matches_chain(header, chain))
            .map(|(_, sequence)| sequence)?,
        SequenceRequest::Accession { .. } => fasta
            .lines()
            .filter(|line| !line.starts_with('>'))
            .map(str::trim)
            .collect(),
    };
    (!sequence.is_empty()).then_some(sequence)
}

/// Header description: `region_values=.. region_units=.. pfam=.. source=.. uniprot=..`.
pub fn describe(record: &AnnotationRecord) -> String {
    let mut parts = Vec::new();
    if !record.region_values.is_empty() {
        parts.push(format!("region_values={}", format_list(&record.region_values)));
    }
    if !record.region_units.is_empty() {
        parts.push(format!("region_units={}", format_list(&record.region_units)));
    }
    if !record.pfam_ids.is_empty() {
        parts.push(format!("pfam={}", format_list(&record.pfam_ids)));
    }
    if !record.source.is_empty() {
        parts.push(format!("source={}", record.source));
    }
    if let Some(uniprot) = record.uniprot.as_deref().filter(|u| !u.is_empty()) {
        parts.push(format!("uniprot={uniprot}"));
    }
    parts.join(" ")
}

/// Writes one FASTA record with the sequence wrapped at 80 columns.
pub fn write_fasta_record<W: Write>(
    out: &mut W,
    record: &AnnotationRecord,
    sequence: &str,
) -> io::Result<()> {
    writeln!(out, ">{} {}", record.identity(), describe(record))?;
    for chunk in sequence.as_bytes().chunks(LINE_WIDTH) {
        out.write_all(chunk)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// `<output>.err`
pub fn error_log_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".err");
    PathBuf::from(name)
}

/// Totals of one sequence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceSummary {
    /// FASTA records written.
    pub written: usize,
    /// Rows recorded in the error file.
    pub failed: usize,
}

struct ErrorLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ErrorLog {
    fn create(path: PathBuf) -> Result<Self, SinkError> {
        let file = File::create(&path).map_err(|err| SinkError::io(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn note(&mut self, message: &str) -> Result<(), SinkError> {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{stamp}] {message}")
            .and_then(|_| self.writer.flush())
            .map_err(|err| SinkError::io(&self.path, err))
    }
}

/// Resolves every record of the sink at `sink_path` into `output_path`.
///
/// Individual failures go to `<output>.err` and never stop the pass; only I/O on the sink,
/// the output or the error file is fatal.
pub async fn resolve_sink(
    sink_path: &Path,
    output_path: &Path,
    lookup: &dyn SequenceLookup,
) -> Result<SequenceSummary, SinkError> {
    let replay = read_sink(sink_path)?;
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| SinkError::io(parent, err))?;
    }
    let output = File::create(output_path).map_err(|err| SinkError::io(output_path, err))?;
    let mut output = BufWriter::new(output);
    let mut errors = ErrorLog::create(error_log_path(output_path))?;
    let mut summary = SequenceSummary::default();

    for skipped in &replay.skipped {
        errors.note(&format!(
            "Missing pdb_id/chain on line {}: {}",
            skipped.line, skipped.reason
        ))?;
        summary.failed += 1;
    }

    for record in &replay.records {
        let request = SequenceRequest::for_record(record);
        let sequence = match lookup.fetch_fasta(&request).await {
            Ok(fasta) => pick_sequence(&request, &fasta, &record.chain),
            Err(err) => {
                errors.note(&format!("Exception for {}: {err}", record.identity()))?;
                summary.failed += 1;
                continue;
            }
        };
        let Some(sequence) = sequence else {
            let detail = match &request {
                SequenceRequest::Accession { accession } => format!("uniprot={accession}"),
                SequenceRequest::Entry { entity_id } => {
                    format!("pdb={entity_id} chain={}", record.chain)
                }
            };
            errors.note(&format!(
                "Empty/missing sequence for {} (source={}) {detail}",
                record.identity(),
                record.source
            ))?;
            summary.failed += 1;
            continue;
        };
        write_fasta_record(&mut output, record, &sequence)
            .map_err(|err| SinkError::io(output_path, err))?;
        summary.written += 1;
    }

    info!(
        written = summary.written,
        failed = summary.failed,
        output = %output_path.display(),
        errors = %errors.path.display(),
        "sequences resolved"
    );
    Ok(summary)
}
