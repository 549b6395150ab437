//! Job orchestration: one crawl + discovery job per region-class filter, run on a bounded pool.

use crate::controls::{listing_url, Cli, CrawlControls, HarvestEndpoints, JobCli};
use crate::crawler::{CrawlError, CrawlOutcome, TableCrawler};
use crate::discovery::{DiscoveryEngine, DiscoverySummary};
use crate::driver::{DriverError, DriverFactory, TableDriver};
use crate::logging::job_dispatch;
use crate::probe::{AlignmentFetcher, ArtifactStore, HttpAlignmentFetcher, RegionProber, REGION_DIR_PREFIX};
use crate::record::region_file_stem;
use crate::sequences::{resolve_sink, HttpSequenceLookup, SequenceLookup, SequenceSummary};
use crate::session::CrawlSession;
use crate::sink::{read_sink, AnnotationSink, SinkError};
use crate::webdriver::WebDriverFactory;
use anyhow::Context;
use chrono::Local;
use futures_util::future::join_all;
use reqwest::Client;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;

const USER_AGENT: &str = "repeatcrawl/0.1 (+https://repeatsdb.org)";
/// Navigation calls wait for the page to load, so the browser client gets a looser bound.
const WEBDRIVER_TIMEOUT: Duration = Duration::from_secs(120);

/// Builds the shared HTTP client with a per-request timeout.
pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
}

/// Whether a job crawls the live table or replays an existing sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Crawl the listing, then run the enabled downstream stages.
    Crawl,
    /// Skip the crawl and rediscover alignments from the persisted sink.
    DiscoveryOnly,
}

/// Files owned by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// Annotation CSV.
    pub sink: PathBuf,
    /// Append-only job log, next to the sink.
    pub log: PathBuf,
    /// Root of the alignment artifact store.
    pub alignments: PathBuf,
    /// Multi-FASTA output of the sequence stage.
    pub sequences: PathBuf,
}

impl JobPaths {
    /// Batch layout for filter `filter`.
    pub fn for_filter(
        filter: &str,
        annotations_dir: &Path,
        alignments_dir: &Path,
        sequences_dir: &Path,
    ) -> Self {
        let id = region_file_stem(filter);
        let sink = annotations_dir.join(format!("repeatsDB_annotations_{id}.csv"));
        Self {
            log: sink.with_extension("log"),
            alignments: alignments_dir.join(format!("{REGION_DIR_PREFIX}_{id}")),
            sequences: sequences_dir.join(format!("repeatsDB_seqs_{id}.fasta")),
            sink,
        }
    }

    /// Single-job layout; unset paths default to dated names under the result directories.
    pub fn for_job(job_id: &str, output_csv: Option<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        let sink = output_csv.unwrap_or_else(|| {
            Path::new("result-annotations").join(format!("repeatsDB_annotations_{job_id}.csv"))
        });
        let alignments = output_dir.unwrap_or_else(|| {
            Path::new("result-alignments").join(format!("{REGION_DIR_PREFIX}_{job_id}"))
        });
        Self {
            log: sink.with_extension("log"),
            sequences: sink.with_extension("fasta"),
            alignments,
            sink,
        }
    }
}

/// One unit of work for the orchestrator.
#[derive(Debug, Clone)]
pub struct JobSpec {
    filter: String,
    mode: JobMode,
    discover_alignments: bool,
    resolve_sequences: bool,
    paths: JobPaths,
}

impl JobSpec {
    /// A crawl job with alignment discovery and sequence resolution enabled.
    pub fn new(filter: impl Into<String>, paths: JobPaths) -> Self {
        Self {
            filter: filter.into(),
            mode: JobMode::Crawl,
            discover_alignments: true,
            resolve_sequences: true,
            paths,
        }
    }

    /// Sets the job mode.
    pub fn with_mode(mut self, mode: JobMode) -> Self {
        self.mode = mode;
        self
    }

    /// Toggles alignment discovery.
    pub fn with_alignments(mut self, enabled: bool) -> Self {
        self.discover_alignments = enabled;
        self
    }

    /// Toggles the sequence stage.
    pub fn with_sequences(mut self, enabled: bool) -> Self {
        self.resolve_sequences = enabled;
        self
    }

    /// Region-class filter.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Files owned by the job.
    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }
}

/// External services a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens one UI session per crawl.
    pub drivers: Arc<dyn DriverFactory>,
    /// Alignment file API.
    pub alignments: Arc<dyn AlignmentFetcher>,
    /// Sequence services.
    pub sequences: Arc<dyn SequenceLookup>,
}

impl Collaborators {
    /// Real WebDriver, file API and sequence services.
    pub fn connect(endpoints: &HarvestEndpoints) -> Result<Self, reqwest::Error> {
        let http = http_client(endpoints.http_timeout)?;
        let browser = http_client(WEBDRIVER_TIMEOUT)?;
        Ok(Self {
            drivers: Arc::new(WebDriverFactory::from_endpoints(browser, endpoints)),
            alignments: Arc::new(HttpAlignmentFetcher::new(
                http.clone(),
                endpoints.file_api.clone(),
            )),
            sequences: Arc::new(HttpSequenceLookup::new(http)),
        })
    }
}

/// Read-only configuration shared by every job of a run.
#[derive(Clone)]
pub struct JobContext {
    /// Crawl knobs.
    pub controls: CrawlControls,
    /// Unfiltered listing page.
    pub listing: Url,
    /// External services.
    pub collaborators: Collaborators,
}

/// Job-level failures; everything below this level is absorbed and logged.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// No UI session could be established.
    #[error("could not open a ui session: {0}")]
    Session(#[source] DriverError),
    /// The crawl aborted.
    #[error("crawl failed: {0}")]
    Crawl(#[from] CrawlError),
    /// Discovery-only mode found no sink to replay.
    #[error("annotation sink {0:?} does not exist")]
    MissingSink(PathBuf),
    /// Writing or replaying the sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// The job log could not be opened.
    #[error("cannot open job log {path:?}: {source}")]
    Log {
        /// Log path.
        path: PathBuf,
        /// Cause.
        source: io::Error,
    },
    /// The job task panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Process status code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobError::Session(_) | JobError::Crawl(CrawlError::Driver(_)) => 1,
            JobError::MissingSink(_) => 2,
            JobError::Sink(_) | JobError::Log { .. } | JobError::Crawl(CrawlError::Sink(_)) => 3,
            JobError::Panicked(_) => 101,
        }
    }
}

/// What a successful job produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Crawl totals, when the job crawled.
    pub crawl: Option<CrawlOutcome>,
    /// Discovery totals, when discovery ran.
    pub discovery: Option<DiscoverySummary>,
    /// Sequence totals, when the sequence stage ran and finished.
    pub sequences: Option<SequenceSummary>,
    /// Sink rows dropped during replay.
    pub skipped_rows: usize,
}

/// Runs one job under the current subscriber.
pub async fn run_job(spec: &JobSpec, ctx: &JobContext) -> Result<JobSummary, JobError> {
    info!("New run: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!("Region classes: {}", spec.filter);
    let mut summary = JobSummary::default();

    match spec.mode {
        JobMode::Crawl => summary.crawl = Some(crawl_filter(spec, ctx).await?),
        JobMode::DiscoveryOnly => {
            if !spec.paths.sink.is_file() {
                return Err(JobError::MissingSink(spec.paths.sink.clone()));
            }
            info!(sink = %spec.paths.sink.display(), "replaying existing sink");
        }
    }

    if spec.discover_alignments {
        let replay = read_sink(&spec.paths.sink)?;
        summary.skipped_rows = replay.skipped.len();
        let store = ArtifactStore::new(&spec.paths.alignments);
        let engine = DiscoveryEngine::new(RegionProber::new(
            ctx.collaborators.alignments.as_ref(),
            &store,
        ));
        info!(
            records = replay.records.len(),
            dir = %store.root().display(),
            "downloading alignments"
        );
        summary.discovery = Some(engine.discover_all(&replay.records).await);
    }

    if spec.resolve_sequences && spec.mode == JobMode::Crawl {
        match resolve_sink(
            &spec.paths.sink,
            &spec.paths.sequences,
            ctx.collaborators.sequences.as_ref(),
        )
        .await
        {
            Ok(sequences) => summary.sequences = Some(sequences),
            Err(err) => error!(error = %err, "sequence stage failed"),
        }
    }

    Ok(summary)
}

async fn crawl_filter(spec: &JobSpec, ctx: &JobContext) -> Result<CrawlOutcome, JobError> {
    // A previous sink is only truncated once a session is available.
    let mut driver = ctx
        .collaborators
        .drivers
        .connect()
        .await
        .map_err(JobError::Session)?;
    let crawled = crawl_into_sink(driver.as_mut(), spec, ctx).await;
    if let Err(err) = driver.close().await {
        warn!(error = %err, "could not close ui session");
    }
    crawled
}

async fn crawl_into_sink(
    driver: &mut dyn TableDriver,
    spec: &JobSpec,
    ctx: &JobContext,
) -> Result<CrawlOutcome, JobError> {
    let listing = listing_url(&ctx.listing, &spec.filter, ctx.controls.page_size());
    let mut session = CrawlSession::new(AnnotationSink::create(&spec.paths.sink)?);
    info!(url = %listing, sink = %spec.paths.sink.display(), "crawling listing");

    let crawled = TableCrawler::new(driver, &ctx.controls)
        .crawl(&listing, &mut session)
        .await;

    let duplicates = session.duplicates();
    session.finish()?;
    let outcome = crawled?;
    info!(
        unique = outcome.unique_records,
        pages = outcome.pages,
        duplicates,
        stop = ?outcome.stop,
        "Scraping completed"
    );
    Ok(outcome)
}

/// Runs one job with its own log file attached.
pub async fn run_logged_job(spec: &JobSpec, ctx: &JobContext) -> Result<JobSummary, JobError> {
    let dispatch = job_dispatch(&spec.paths.log).map_err(|source| JobError::Log {
        path: spec.paths.log.clone(),
        source,
    })?;
    async {
        let span = info_span!("job", filter = %spec.filter);
        let result = run_job(spec, ctx).instrument(span).await;
        if let Err(err) = &result {
            error!(code = err.exit_code(), "Region {} failed: {err}", spec.filter);
        }
        result
    }
    .with_subscriber(dispatch)
    .await
}

/// Outcome of one job in a batch.
#[derive(Debug)]
pub struct JobReport {
    /// Region-class filter.
    pub filter: String,
    /// Job result.
    pub result: Result<JobSummary, JobError>,
}

impl JobReport {
    /// 0 on success, otherwise the failure's code.
    pub fn status_code(&self) -> i32 {
        match &self.result {
            Ok(_) => 0,
            Err(err) => err.exit_code(),
        }
    }
}

/// Every job of a batch, in submission order.
#[derive(Debug)]
pub struct BatchReport {
    /// Per-filter results.
    pub jobs: Vec<JobReport>,
    /// Wall time of the batch.
    pub elapsed: Duration,
}

impl BatchReport {
    /// Jobs that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|job| job.result.is_err())
    }

    /// Prints a per-filter summary to stdout.
    pub fn report(&self) {
        let secs = self.elapsed.as_secs_f32();
        println!("--- batch summary ({secs:.2}s) ---");
        for job in &self.jobs {
            let summary = job.result.as_ref().ok();
            let unique = summary
                .and_then(|s| s.crawl)
                .map(|c| c.unique_records.to_string())
                .unwrap_or_else(|| "-".into());
            let discovery = summary.and_then(|s| s.discovery).unwrap_or_default();
            let sequences = summary
                .and_then(|s| s.sequences)
                .map(|s| s.written.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "{}: status {} | records {} | alignments {} | exhausted {} | skipped {} | sequences {}",
                job.filter,
                job.status_code(),
                unique,
                discovery.fetched,
                discovery.exhausted,
                discovery.skipped,
                sequences
            );
        }
        println!(
            "failed jobs: {} of {}",
            self.failures().count(),
            self.jobs.len()
        );
    }
}

/// Runs `specs` with at most `workers` jobs in flight (clamped to `[1, specs.len()]`).
///
/// A failing or panicking job is reported with its filter and never cancels its siblings.
pub async fn run_batch(specs: Vec<JobSpec>, workers: usize, ctx: Arc<JobContext>) -> BatchReport {
    let start = Instant::now();
    let workers = workers.clamp(1, specs.len().max(1));
    info!("Processing {} regions with {} worker(s)", specs.len(), workers);
    let permits = Arc::new(Semaphore::new(workers));

    let jobs = specs.into_iter().map(|spec| {
        let permits = Arc::clone(&permits);
        let ctx = Arc::clone(&ctx);
        let filter = spec.filter.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            run_logged_job(&spec, &ctx).await
        });
        async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => Err(JobError::Panicked(err.to_string())),
            };
            if let Err(err) = &result {
                error!(filter = %filter, code = err.exit_code(), "region job failed: {err}");
            }
            JobReport { filter, result }
        }
    });

    BatchReport {
        jobs: join_all(jobs).await,
        elapsed: start.elapsed(),
    }
}

/// Batch driver entry point. Individual job failures are reported, not returned.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let endpoints = cli.controls.build_endpoints();
    let collaborators = Collaborators::connect(&endpoints).context("building http clients")?;
    for dir in [&cli.annotations_dir, &cli.alignments_dir, &cli.sequences_dir] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let mode = if cli.alignments_only {
        JobMode::DiscoveryOnly
    } else {
        JobMode::Crawl
    };
    let specs = cli
        .regions
        .iter()
        .map(|filter| {
            let paths = JobPaths::for_filter(
                filter,
                &cli.annotations_dir,
                &cli.alignments_dir,
                &cli.sequences_dir,
            );
            JobSpec::new(filter.as_str(), paths)
                .with_mode(mode)
                .with_alignments(!cli.no_alignments)
                .with_sequences(!cli.no_sequences)
        })
        .collect();

    let ctx = Arc::new(JobContext {
        controls: cli.controls.build_controls(),
        listing: endpoints.listing.clone(),
        collaborators,
    });
    run_batch(specs, cli.workers, ctx).await.report();
    Ok(())
}

/// Single-job entry point; returns the status code the process should exit with.
pub async fn run_region_job(cli: JobCli) -> anyhow::Result<i32> {
    let endpoints = cli.controls.build_endpoints();
    let collaborators = Collaborators::connect(&endpoints).context("building http clients")?;
    let job_id = Local::now().format("%Y%m%d").to_string();
    let paths = JobPaths::for_job(&job_id, cli.output_csv, cli.output_dir);
    let mode = if cli.fetch_alignments_only {
        JobMode::DiscoveryOnly
    } else {
        JobMode::Crawl
    };
    let spec = JobSpec::new(cli.region_classes, paths)
        .with_mode(mode)
        .with_alignments(!cli.skip_alignments)
        .with_sequences(false);
    let ctx = JobContext {
        controls: cli.controls.build_controls(),
        listing: endpoints.listing.clone(),
        collaborators,
    };

    Ok(match run_logged_job(&spec, &ctx).await {
        Ok(_) => 0,
        Err(err) => err.exit_code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fake::{records, ScriptedListing};
    use crate::crawler::StopReason;
    use crate::driver::TableDriver;
    use crate::probe::fake::MapFetcher;
    use crate::sequences::SequenceRequest;
    use crate::probe::FetchError;
    use async_trait::async_trait;

    struct ListingFactory(Vec<Vec<crate::record::AnnotationRecord>>);

    #[async_trait]
    impl DriverFactory for ListingFactory {
        async fn connect(&self) -> Result<Box<dyn TableDriver>, DriverError> {
            Ok(Box::new(ScriptedListing::new(Vec::new(), self.0.clone())))
        }
    }

    struct NoSequences;

    #[async_trait]
    impl SequenceLookup for NoSequences {
        async fn fetch_fasta(&self, request: &SequenceRequest) -> Result<String, FetchError> {
            Err(FetchError::Status {
                url: request.url(),
                status: 404,
            })
        }
    }

    fn context(pages: Vec<Vec<crate::record::AnnotationRecord>>, fetcher: MapFetcher) -> JobContext {
        JobContext {
            controls: CrawlControls::new(10, None, Duration::from_secs(1)),
            listing: Url::parse("https://listing.test/annotations").unwrap(),
            collaborators: Collaborators {
                drivers: Arc::new(ListingFactory(pages)),
                alignments: Arc::new(fetcher),
                sequences: Arc::new(NoSequences),
            },
        }
    }

    fn paths(root: &Path, filter: &str) -> JobPaths {
        JobPaths::for_filter(
            filter,
            &root.join("annotations"),
            &root.join("alignments"),
            &root.join("sequences"),
        )
    }

    #[test]
    fn batch_paths_follow_the_filter_naming() {
        let paths = paths(Path::new("/data"), "3.3");
        assert_eq!(
            paths.sink,
            Path::new("/data/annotations/repeatsDB_annotations_3_3.csv")
        );
        assert_eq!(
            paths.log,
            Path::new("/data/annotations/repeatsDB_annotations_3_3.log")
        );
        assert_eq!(
            paths.alignments,
            Path::new("/data/alignments/repeatsDB_alignments_3_3")
        );
        assert_eq!(
            paths.sequences,
            Path::new("/data/sequences/repeatsDB_seqs_3_3.fasta")
        );

        let single = JobPaths::for_job("20260101", None, None);
        assert_eq!(
            single.sink,
            Path::new("result-annotations/repeatsDB_annotations_20260101.csv")
        );
        assert_eq!(
            single.alignments,
            Path::new("result-alignments/repeatsDB_alignments_20260101")
        );
    }

    #[test]
    fn exit_codes_follow_the_failure_kind() {
        assert_eq!(
            JobError::Session(DriverError::Session("down".into())).exit_code(),
            1
        );
        assert_eq!(JobError::MissingSink(PathBuf::from("x.csv")).exit_code(), 2);
        assert_eq!(
            JobError::Sink(SinkError::MissingColumn("pdb_id")).exit_code(),
            3
        );
        assert_eq!(JobError::Panicked("boom".into()).exit_code(), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_job_writes_sink_alignments_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MapFetcher::default().answer("p3", 0, ">unit.4\nMK\n");
        let ctx = context(vec![records("p", 0, 7)], fetcher);
        let spec = JobSpec::new("3.3", paths(dir.path(), "3.3"));

        let summary = run_logged_job(&spec, &ctx).await.unwrap();

        let crawl = summary.crawl.unwrap();
        assert_eq!(crawl.unique_records, 7);
        assert_eq!(crawl.stop, StopReason::ShortPage);
        let discovery = summary.discovery.unwrap();
        assert_eq!(discovery.records, 7);
        assert_eq!(discovery.fetched, 1);
        assert_eq!(discovery.exhausted, 6);
        assert_eq!(summary.sequences.unwrap().failed, 7);

        let replay = read_sink(&spec.paths().sink).unwrap();
        assert_eq!(replay.records.len(), 7);
        assert!(spec
            .paths()
            .alignments
            .join("repeatsDB_alignments_3_3")
            .join("p3_A_3.3_0.fasta")
            .is_file());
        let log = fs::read_to_string(&spec.paths().log).unwrap();
        assert!(log.contains("New run: "));
        assert!(log.contains("Region classes: 3.3"));
        assert_eq!(log.matches("Failed to fetch region").count(), 6);
    }

    struct RefusingBrowser;

    #[async_trait]
    impl DriverFactory for RefusingBrowser {
        async fn connect(&self) -> Result<Box<dyn TableDriver>, DriverError> {
            Err(DriverError::Session("no browser".into()))
        }
    }

    #[tokio::test]
    async fn failed_session_leaves_the_previous_sink_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new("3.3", paths(dir.path(), "3.3")).with_sequences(false);
        let mut previous = CrawlSession::new(AnnotationSink::create(&spec.paths().sink).unwrap());
        for record in records("old", 0, 4) {
            previous.admit(&record).unwrap();
        }
        previous.finish().unwrap();

        let mut ctx = context(Vec::new(), MapFetcher::default());
        ctx.collaborators.drivers = Arc::new(RefusingBrowser);
        let err = run_logged_job(&spec, &ctx).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(read_sink(&spec.paths().sink).unwrap().records.len(), 4);

        let replay = spec.clone().with_mode(JobMode::DiscoveryOnly);
        let summary = run_logged_job(&replay, &ctx).await.unwrap();
        assert_eq!(summary.discovery.map(|d| d.records), Some(4));
    }

    #[tokio::test]
    async fn discovery_only_without_a_sink_fails_with_code_two() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Vec::new(), MapFetcher::default());
        let spec =
            JobSpec::new("4.4", paths(dir.path(), "4.4")).with_mode(JobMode::DiscoveryOnly);

        let err = run_logged_job(&spec, &ctx).await.unwrap_err();
        assert!(matches!(err, JobError::MissingSink(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_stages_do_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![records("p", 0, 3)], MapFetcher::default());
        let spec = JobSpec::new("5.1", paths(dir.path(), "5.1"))
            .with_alignments(false)
            .with_sequences(false);

        let summary = run_logged_job(&spec, &ctx).await.unwrap();
        assert_eq!(summary.crawl.map(|c| c.unique_records), Some(3));
        assert_eq!(summary.discovery, None);
        assert_eq!(summary.sequences, None);
        assert!(!spec.paths().sequences.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_count_is_clamped_and_reports_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context(vec![records("p", 0, 2)], MapFetcher::default()));
        let specs = ["3.1", "3.2"]
            .iter()
            .map(|f| {
                JobSpec::new(*f, paths(dir.path(), f))
                    .with_alignments(false)
                    .with_sequences(false)
            })
            .collect();

        let report = run_batch(specs, 0, ctx).await;
        let filters: Vec<_> = report.jobs.iter().map(|j| j.filter.as_str()).collect();
        assert_eq!(filters, vec!["3.1", "3.2"]);
        assert_eq!(report.failures().count(), 0);
    }
}
