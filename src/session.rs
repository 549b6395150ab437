//! Per-job crawl state: the identity dedupe set and the sink that records stream into.

use crate::record::{AnnotationRecord, IdentityKey};
use crate::sink::{AnnotationSink, SinkError};
use std::collections::HashSet;
use std::io::Write;

/// Result of offering a record to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the record was written to the sink.
    Emitted,
    /// The identity key was already emitted in this crawl.
    Duplicate,
}

/// Owns everything one crawl mutates. Records are streamed to the sink, only keys are retained.
pub struct CrawlSession<W: Write> {
    seen: HashSet<IdentityKey>,
    sink: AnnotationSink<W>,
    duplicates: usize,
}

impl<W: Write> CrawlSession<W> {
    /// Starts an empty session writing into `sink`.
    pub fn new(sink: AnnotationSink<W>) -> Self {
        Self {
            seen: HashSet::new(),
            sink,
            duplicates: 0,
        }
    }

    /// Emits `record` unless its identity was already seen.
    pub fn admit(&mut self, record: &AnnotationRecord) -> Result<Admission, SinkError> {
        let key = record.identity();
        if self.seen.contains(&key) {
            self.duplicates += 1;
            return Ok(Admission::Duplicate);
        }
        self.sink.append(record)?;
        self.seen.insert(key);
        Ok(Admission::Emitted)
    }

    /// Unique records emitted so far.
    pub fn unique_records(&self) -> usize {
        self.seen.len()
    }

    /// Rows rejected because their identity was already emitted.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Ends the session, returning the flushed sink writer.
    pub fn finish(self) -> Result<W, SinkError> {
        self.sink.into_inner()
    }
}
