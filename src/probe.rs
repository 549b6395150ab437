//! Adaptive discovery of a region's server-side alignment number.
//!
//! The file API addresses alignments by `(entity, chain, regionNum)` where `regionNum` is an
//! internal ordinal with no published mapping to the displayed region identifier. The prober
//! scans a bounded window of candidates starting at a cursor and reports a typed outcome.

use crate::record::{is_top_level_class, region_file_stem, AnnotationRecord, IdentityKey, SourceKind};
use async_trait::async_trait;
use reqwest::Client;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fetch attempts per region before it is declared exhausted.
pub const MAX_PROBE_ATTEMPTS: u32 = 30;

/// Directory prefix of the per-region artifact folders.
pub const REGION_DIR_PREFIX: &str = "repeatsDB_alignments";

/// Shard token used for predicted-structure alignments.
const PREDICTED_SHARD: &str = "adb";

/// Failure of a single candidate fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request could not be completed.
    #[error("request to {url} failed: {source}")]
    Http {
        /// Requested URL.
        url: String,
        /// Transport error.
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{url} answered {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
}

impl FetchError {
    pub(crate) fn http(url: &str, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.to_string(),
            source,
        }
    }
}

/// One candidate address in the file API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Record identity.
    pub identity: IdentityKey,
    /// Endpoint family.
    pub source: SourceKind,
    /// Displayed region identifier.
    pub region_id: String,
    /// Candidate server-side region number.
    pub region_num: u32,
}

/// Builds the alignment URL for `target` under the file API base.
pub fn alignment_url(api_base: &str, target: &ProbeTarget) -> String {
    let IdentityKey { entity_id, chain } = &target.identity;
    let n = target.region_num;
    match target.source {
        SourceKind::Predicted => format!(
            "{api_base}/{PREDICTED_SHARD}/{entity_id}.{chain}/region.{n}/sequence_alignment.fasta"
        ),
        SourceKind::Experimental => {
            let shard = entity_id.get(1..3).unwrap_or(entity_id.as_str());
            format!(
                "{api_base}/pdb/{shard}/{entity_id}.{chain}/region.{n}/sequence_alignment.fasta"
            )
        }
    }
}

/// Downloads one alignment candidate.
#[async_trait]
pub trait AlignmentFetcher: Send + Sync {
    /// Returns the raw payload, or an error for any miss.
    async fn fetch(&self, target: &ProbeTarget) -> Result<Vec<u8>, FetchError>;
}

/// File API client backed by `reqwest`.
#[derive(Clone)]
pub struct HttpAlignmentFetcher {
    client: Client,
    api_base: String,
}

impl HttpAlignmentFetcher {
    /// Uses `client` (already configured with a timeout) against `api_base`.
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl AlignmentFetcher for HttpAlignmentFetcher {
    async fn fetch(&self, target: &ProbeTarget) -> Result<Vec<u8>, FetchError> {
        let url = alignment_url(&self.api_base, target);
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
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::http(&url, err))?;
        Ok(body.to_vec())
    }
}

/// On-disk layout of fetched alignments.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Stores artifacts beneath `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/repeatsDB_alignments_<region>/<id>_<chain>_<region>_<n>.fasta`
    pub fn path_for(&self, target: &ProbeTarget) -> PathBuf {
        let stem = region_file_stem(&target.region_id);
        self.root
            .join(format!("{REGION_DIR_PREFIX}_{stem}"))
            .join(format!(
                "{}_{}_{}.fasta",
                target.identity, target.region_id, target.region_num
            ))
    }

    /// Writes `payload`, creating the region directory on demand.
    pub fn persist(&self, target: &ProbeTarget, payload: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, payload)?;
        Ok(path)
    }
}

/// Highest `unit.<N>` ordinal named by a header line, or 0 when there is none.
pub fn parse_max_unit(payload: &str) -> u32 {
    payload
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(">unit."))
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// A persisted alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentArtifact {
    /// Record identity.
    pub identity: IdentityKey,
    /// Displayed region identifier.
    pub region_id: String,
    /// Server-side region number that answered.
    pub region_num: u32,
    /// Where the payload was written.
    pub path: PathBuf,
}

/// Result of probing one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionOutcome {
    /// An alignment was found; the next region starts at `next_cursor`.
    Fetched {
        /// Persisted payload.
        artifact: AlignmentArtifact,
        /// Highest unit ordinal in the payload.
        next_cursor: u32,
    },
    /// Every candidate in `start..=end` missed; the cursor is unchanged.
    Exhausted {
        /// First candidate tried.
        start: u32,
        /// Last candidate tried.
        end: u32,
    },
    /// Top-level class, not downloadable.
    Skipped,
}

impl RegionOutcome {
    /// Cursor handed to the region that follows.
    pub fn cursor_after(&self, cursor: u32) -> u32 {
        match self {
            RegionOutcome::Fetched { next_cursor, .. } => *next_cursor,
            RegionOutcome::Exhausted { .. } | RegionOutcome::Skipped => cursor,
        }
    }
}

/// Scans candidate region numbers for one region at a time.
pub struct RegionProber<'a> {
    fetcher: &'a dyn AlignmentFetcher,
    store: &'a ArtifactStore,
}

impl<'a> RegionProber<'a> {
    /// Binds a fetcher to an artifact store.
    pub fn new(fetcher: &'a dyn AlignmentFetcher, store: &'a ArtifactStore) -> Self {
        Self { fetcher, store }
    }

    /// Probes `region_id` of `record` starting at `cursor`.
    pub async fn probe(
        &self,
        record: &AnnotationRecord,
        region_id: &str,
        cursor: u32,
    ) -> RegionOutcome {
        if is_top_level_class(region_id) {
            debug!(region = region_id, "skipping top-level region class");
            return RegionOutcome::Skipped;
        }

        let identity = record.identity();
        let source = record.source_kind();
        // The cursor comes from remote content, so the window is clipped at `u32::MAX`.
        let end = cursor.saturating_add(MAX_PROBE_ATTEMPTS - 1);
        for region_num in cursor..=end {
            let target = ProbeTarget {
                identity: identity.clone(),
                source,
                region_id: region_id.to_string(),
                region_num,
            };
            let payload = match self.fetcher.fetch(&target).await {
                Ok(payload) => payload,
                Err(err) => {
                    debug!(region_num = target.region_num, error = %err, "probe miss");
                    continue;
                }
            };
            let path = match self.store.persist(&target, &payload) {
                Ok(path) => path,
                Err(err) => {
                    debug!(region_num = target.region_num, error = %err, "could not store alignment");
                    continue;
                }
            };
            if payload.iter().all(u8::is_ascii_whitespace) {
                debug!(region_num = target.region_num, path = %path.display(), "empty alignment");
                continue;
            }

            let next_cursor = parse_max_unit(&String::from_utf8_lossy(&payload));
            return RegionOutcome::Fetched {
                artifact: AlignmentArtifact {
                    identity: target.identity,
                    region_id: target.region_id,
                    region_num: target.region_num,
                    path,
                },
                next_cursor,
            };
        }

        warn!(
            "Failed to fetch region {region_id} for {identity} after trying regionNum {cursor} to {end}"
        );
        RegionOutcome::Exhausted { start: cursor, end }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Deterministic file API used by discovery and runtime tests.

    use super::{AlignmentFetcher, FetchError, ProbeTarget};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers only for configured `(entity, region_num)` pairs and records every request.
    #[derive(Default)]
    pub struct MapFetcher {
        pub answers: HashMap<(String, u32), String>,
        pub requests: Mutex<Vec<(String, String, u32)>>,
    }

    impl MapFetcher {
        pub fn answer(mut self, entity: &str, region_num: u32, payload: &str) -> Self {
            self.answers
                .insert((entity.to_string(), region_num), payload.to_string());
            self
        }

        pub fn requested(&self) -> Vec<(String, String, u32)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlignmentFetcher for MapFetcher {
        async fn fetch(&self, target: &ProbeTarget) -> Result<Vec<u8>, FetchError> {
            self.requests.lock().unwrap().push((
                target.identity.entity_id.clone(),
                target.region_id.clone(),
                target.region_num,
            ));
            self.answers
                .get(&(target.identity.entity_id.clone(), target.region_num))
                .map(|payload| payload.clone().into_bytes())
                .ok_or_else(|| FetchError::Status {
                    url: format!("fake://{}/{}", target.identity, target.region_num),
                    status: 404,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::MapFetcher;
    use super::*;
    use crate::logging::CapturedLogs;
    use tracing::instrument::WithSubscriber;

    fn record(id: &str, source: &str) -> AnnotationRecord {
        AnnotationRecord {
            row_index: "1".into(),
            entity_id: id.into(),
            chain: "A".into(),
            source: source.into(),
            region_values: vec!["4.4".into()],
            region_units: Vec::new(),
            uniprot: None,
            pfam_ids: Vec::new(),
            status: "ok".into(),
        }
    }

    const ALIGNMENT: &str = ">unit.1 12-40\nMKV\n>unit.3 80-120\nMKA\n>unit.2 41-79\nMKL\n";

    #[tokio::test]
    async fn finds_the_first_answering_region_number() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetcher = MapFetcher::default().answer("1abc", 9, ALIGNMENT);
        let prober = RegionProber::new(&fetcher, &store);

        let outcome = prober.probe(&record("1abc", "PDB"), "4.4", 5).await;

        let RegionOutcome::Fetched {
            artifact,
            next_cursor,
        } = outcome
        else {
            panic!("expected a fetched alignment, got {outcome:?}");
        };
        assert_eq!(next_cursor, 3);
        assert_eq!(artifact.region_num, 9);
        assert_eq!(
            artifact.path,
            dir.path()
                .join("repeatsDB_alignments_4_4")
                .join("1abc_A_4.4_9.fasta")
        );
        assert_eq!(std::fs::read_to_string(&artifact.path).unwrap(), ALIGNMENT);
        let tried: Vec<u32> = fetcher.requested().iter().map(|r| r.2).collect();
        assert_eq!(tried, vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn exhaustion_is_logged_once_and_keeps_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetcher = MapFetcher::default();
        let prober = RegionProber::new(&fetcher, &store);
        let logs = CapturedLogs::default();

        let outcome = prober
            .probe(&record("2xyz", "PDB"), "3.3", 12)
            .with_subscriber(logs.dispatch())
            .await;

        assert_eq!(outcome, RegionOutcome::Exhausted { start: 12, end: 41 });
        assert_eq!(outcome.cursor_after(12), 12);
        assert_eq!(fetcher.requested().len(), MAX_PROBE_ATTEMPTS as usize);
        let text = logs.contents();
        assert_eq!(text.matches("Failed to fetch region").count(), 1);
        assert!(text.contains("2xyz_A after trying regionNum 12 to 41"));
        assert!(!text.contains("probe miss"));
    }

    #[tokio::test]
    async fn empty_payload_is_stored_but_scanning_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetcher = MapFetcher::default()
            .answer("1abc", 0, "\n")
            .answer("1abc", 1, ">unit.2\nMK\n");
        let prober = RegionProber::new(&fetcher, &store);

        let outcome = prober.probe(&record("1abc", "PDB"), "4.4", 0).await;

        assert_eq!(outcome.cursor_after(0), 2);
        let empty = dir
            .path()
            .join("repeatsDB_alignments_4_4")
            .join("1abc_A_4.4_0.fasta");
        assert!(empty.exists());
    }

    #[tokio::test]
    async fn top_level_classes_are_skipped_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetcher = MapFetcher::default();
        let prober = RegionProber::new(&fetcher, &store);
        let outcome = prober.probe(&record("1abc", "PDB"), "4", 7).await;
        assert_eq!(outcome, RegionOutcome::Skipped);
        assert_eq!(outcome.cursor_after(7), 7);
        assert!(fetcher.requested().is_empty());
    }

    #[tokio::test]
    async fn scan_near_the_top_of_the_number_space_stops_at_the_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetcher = MapFetcher::default();
        let prober = RegionProber::new(&fetcher, &store);
        let cursor = u32::MAX - 5;

        let outcome = prober.probe(&record("1abc", "PDB"), "3.3.1", cursor).await;

        assert_eq!(
            outcome,
            RegionOutcome::Exhausted {
                start: cursor,
                end: u32::MAX
            }
        );
        let tried: Vec<u32> = fetcher.requested().iter().map(|r| r.2).collect();
        assert_eq!(tried, (cursor..=u32::MAX).collect::<Vec<_>>());
    }

    #[test]
    fn urls_follow_the_source_sharding() {
        let experimental = ProbeTarget {
            identity: IdentityKey::new("1abc", "A"),
            source: SourceKind::Experimental,
            region_id: "4.4".into(),
            region_num: 9,
        };
        assert_eq!(
            alignment_url("https://api.test", &experimental),
            "https://api.test/pdb/ab/1abc.A/region.9/sequence_alignment.fasta"
        );
        let predicted = ProbeTarget {
            identity: IdentityKey::new("Q9XYZ1", "A"),
            source: SourceKind::Predicted,
            ..experimental
        };
        assert_eq!(
            alignment_url("https://api.test", &predicted),
            "https://api.test/adb/Q9XYZ1.A/region.9/sequence_alignment.fasta"
        );
    }

    #[test]
    fn max_unit_reads_header_ordinals_only() {
        assert_eq!(parse_max_unit(ALIGNMENT), 3);
        assert_eq!(parse_max_unit(">unit.12_extra\nunit.40\n"), 12);
        assert_eq!(parse_max_unit(">seq1\nMKV\n"), 0);
        assert_eq!(parse_max_unit(""), 0);
    }
}
