//! Per-record alignment discovery: walks a record's regions in display order, carrying the probe
//! cursor from one region to the next.

use crate::probe::{AlignmentArtifact, RegionOutcome, RegionProber};
use crate::record::{AnnotationRecord, IdentityKey};
use tracing::info;

/// Everything discovered for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Record identity.
    pub identity: IdentityKey,
    /// Region identifiers paired with their outcome, in probing order.
    pub regions: Vec<(String, RegionOutcome)>,
}

impl DiscoveryReport {
    /// Artifacts fetched for this record, in region order.
    pub fn artifacts(&self) -> impl Iterator<Item = &AlignmentArtifact> {
        self.regions.iter().filter_map(|(_, outcome)| match outcome {
            RegionOutcome::Fetched { artifact, .. } => Some(artifact),
            _ => None,
        })
    }
}

/// Totals over a discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    /// Records processed.
    pub records: usize,
    /// Alignments fetched.
    pub fetched: usize,
    /// Regions whose probe budget ran out.
    pub exhausted: usize,
    /// Top-level regions that were skipped.
    pub skipped: usize,
}

impl DiscoverySummary {
    fn absorb(&mut self, report: &DiscoveryReport) {
        self.records += 1;
        for (_, outcome) in &report.regions {
            match outcome {
                RegionOutcome::Fetched { .. } => self.fetched += 1,
                RegionOutcome::Exhausted { .. } => self.exhausted += 1,
                RegionOutcome::Skipped => self.skipped += 1,
            }
        }
    }
}

/// Runs the region prober over records.
pub struct DiscoveryEngine<'a> {
    prober: RegionProber<'a>,
}

impl<'a> DiscoveryEngine<'a> {
    /// Wraps a prober.
    pub fn new(prober: RegionProber<'a>) -> Self {
        Self { prober }
    }

    /// Probes every region of `record`; the cursor starts at 0 and is never reset in between.
    pub async fn discover(&self, record: &AnnotationRecord) -> DiscoveryReport {
        let mut cursor = 0;
        let mut regions = Vec::with_capacity(record.region_values.len());
        for region_id in &record.region_values {
            let outcome = self.prober.probe(record, region_id, cursor).await;
            cursor = outcome.cursor_after(cursor);
            regions.push((region_id.clone(), outcome));
        }
        DiscoveryReport {
            identity: record.identity(),
            regions,
        }
    }

    /// Discovers records one after another and tallies the outcomes.
    pub async fn discover_all(&self, records: &[AnnotationRecord]) -> DiscoverySummary {
        let mut summary = DiscoverySummary::default();
        for (position, record) in records.iter().enumerate() {
            let report = self.discover(record).await;
            summary.absorb(&report);
            info!(
                record = position + 1,
                of = records.len(),
                identity = %report.identity,
                fetched = report.artifacts().count(),
                "alignments discovered"
            );
        }
        summary
    }
}
