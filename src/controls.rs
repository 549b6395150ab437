//! Crawl timing knobs, endpoints, and the command-line surface that configures them.

use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Region classes processed when the batch driver is given none.
pub const DEFAULT_REGIONS: &[&str] = &[
    "3.1", "3.2", "3.3", "3.4", "4.1", "4.2", "4.3", "4.4", "4.5", "4.6", "4.7", "4.8", "5.1",
    "5.2", "5.3", "5.4", "5.5",
];

/// Tunable knobs that bound the table crawl.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrawlControls {
    page_size: usize,
    max_pages: Option<usize>,
    base_interval: Duration,
    empty_page_budget: Duration,
    ready_timeout: Duration,
    page_size_timeout: Duration,
    final_nav_wait: Duration,
}

impl CrawlControls {
    /// Constructs a new set of crawl controls.
    pub fn new(page_size: usize, max_pages: Option<usize>, base_interval: Duration) -> Self {
        Self {
            page_size: page_size.max(1),
            max_pages,
            base_interval,
            ..Self::default()
        }
    }

    /// Overrides the secondary wait bounds.
    pub fn with_waits(
        mut self,
        empty_page_budget: Duration,
        ready_timeout: Duration,
        page_size_timeout: Duration,
        final_nav_wait: Duration,
    ) -> Self {
        self.empty_page_budget = empty_page_budget;
        self.ready_timeout = ready_timeout;
        self.page_size_timeout = page_size_timeout;
        self.final_nav_wait = final_nav_wait;
        self
    }

    /// Rows requested per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hard cap on paginated pages, if any.
    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    /// Base sleep used for readiness fallback, empty-page polling and navigation backoff.
    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Total time spent polling an empty page before treating it as the end of data.
    pub fn empty_page_budget(&self) -> Duration {
        self.empty_page_budget
    }

    /// Bound on waiting for the first rows and for the page-size selector.
    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Bound on waiting for a page-size change to re-render the table.
    pub fn page_size_timeout(&self) -> Duration {
        self.page_size_timeout
    }

    /// Last bounded wait after the navigation backoff steps.
    pub fn final_nav_wait(&self) -> Duration {
        self.final_nav_wait
    }
}

impl Default for CrawlControls {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: None,
            base_interval: Duration::from_secs(5),
            empty_page_budget: Duration::from_secs(20),
            ready_timeout: Duration::from_secs(20),
            page_size_timeout: Duration::from_secs(15),
            final_nav_wait: Duration::from_secs(5),
        }
    }
}

/// Remote endpoints and the UI backend location.
#[derive(Clone, Debug)]
pub struct HarvestEndpoints {
    /// Listing page that renders the annotation table.
    pub listing: Url,
    /// Base of the public file API.
    pub file_api: String,
    /// W3C WebDriver endpoint (chromedriver).
    pub webdriver: Url,
    /// Run the browser without a window.
    pub headless: bool,
    /// Browser profile directory to reuse between runs.
    pub profile_dir: Option<PathBuf>,
    /// Per-request timeout for file and sequence downloads.
    pub http_timeout: Duration,
}

/// Appends the update, page-size and region-class filters to a listing page URL.
pub fn listing_url(listing: &Url, region_class: &str, page_size: usize) -> Url {
    let mut url = listing.clone();
    url.query_pairs_mut()
        .append_pair("updated.by", "user,predictor,mapping")
        .append_pair("limit", &page_size.to_string())
        .append_pair("region.classes", region_class);
    url
}

/// Flags shared by every driver binary.
#[derive(Args, Debug, Clone)]
pub struct ControlArgs {
    /// Number of results per page
    #[arg(long, env = "REPEATCRAWL_PAGE_SIZE", default_value_t = 100)]
    pub page_size: usize,

    /// Maximum number of pages to scrape (default: all pages)
    #[arg(long, env = "REPEATCRAWL_MAX_PAGES")]
    pub max_pages: Option<usize>,

    /// Base wait in seconds for readiness fallbacks, empty-page polls and navigation backoff
    #[arg(long, env = "REPEATCRAWL_SLEEP_SECS", default_value_t = 5)]
    pub sleep_secs: u64,

    /// Seconds to keep polling an empty page before ending the crawl
    #[arg(long, env = "REPEATCRAWL_PAGE_WAIT_LIMIT_SECS", default_value_t = 20)]
    pub page_wait_limit_secs: u64,

    /// Seconds to wait for the first table rows
    #[arg(long, env = "REPEATCRAWL_READY_TIMEOUT_SECS", default_value_t = 20)]
    pub ready_timeout_secs: u64,

    /// Seconds to wait for a page-size change to re-render the table
    #[arg(long, env = "REPEATCRAWL_PAGE_SIZE_TIMEOUT_SECS", default_value_t = 15)]
    pub page_size_timeout_secs: u64,

    /// Seconds of the final wait for the page index to change after a click
    #[arg(long, env = "REPEATCRAWL_NAV_WAIT_SECS", default_value_t = 5)]
    pub nav_wait_secs: u64,

    /// Listing page URL
    #[arg(
        long,
        env = "REPEATCRAWL_LISTING_URL",
        default_value = "https://repeatsdb.org/annotations"
    )]
    pub listing_url: Url,

    /// Base URL of the alignment file API
    #[arg(
        long,
        env = "REPEATCRAWL_FILE_API",
        default_value = "https://repeatsdb.org/api/public/production"
    )]
    pub file_api: String,

    /// WebDriver (chromedriver) endpoint
    #[arg(long, env = "REPEATCRAWL_WEBDRIVER", default_value = "http://localhost:9515")]
    pub webdriver_url: Url,

    /// Run the browser headless
    #[arg(long, env = "REPEATCRAWL_HEADLESS", default_value_t = false)]
    pub headless: bool,

    /// Browser user-data-dir to reuse profile and cache
    #[arg(long, env = "REPEATCRAWL_PROFILE_DIR")]
    pub chrome_profile_dir: Option<PathBuf>,

    /// Per-request timeout in seconds for downloads
    #[arg(long, env = "REPEATCRAWL_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,
}

impl ControlArgs {
    /// Converts the parsed flags into `CrawlControls`.
    pub fn build_controls(&self) -> CrawlControls {
        CrawlControls::new(
            self.page_size,
            self.max_pages,
            Duration::from_secs(self.sleep_secs),
        )
        .with_waits(
            Duration::from_secs(self.page_wait_limit_secs),
            Duration::from_secs(self.ready_timeout_secs),
            Duration::from_secs(self.page_size_timeout_secs),
            Duration::from_secs(self.nav_wait_secs),
        )
    }

    /// Converts the parsed flags into endpoint settings.
    pub fn build_endpoints(&self) -> HarvestEndpoints {
        HarvestEndpoints {
            listing: self.listing_url.clone(),
            file_api: self.file_api.trim_end_matches('/').to_string(),
            webdriver: self.webdriver_url.clone(),
            headless: self.headless,
            profile_dir: self.chrome_profile_dir.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
        }
    }
}

/// Command-line interface of the batch driver.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "repeat_harvest",
    about = "Crawl annotation tables and download region alignments for many region classes"
)]
pub struct Cli {
    /// Region classes to process
    #[arg(long, num_args = 0.., default_values_t = DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect::<Vec<_>>())]
    pub regions: Vec<String>,

    /// Number of regions to process in parallel
    #[arg(long, env = "REPEATCRAWL_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Skip extracting sequences
    #[arg(long, default_value_t = false)]
    pub no_sequences: bool,

    /// Skip downloading alignments
    #[arg(long, default_value_t = false)]
    pub no_alignments: bool,

    /// Do not crawl; read existing annotation CSVs and download alignments only
    #[arg(long, default_value_t = false)]
    pub alignments_only: bool,

    /// Directory for FASTA sequence outputs
    #[arg(long, default_value = "sequences")]
    pub sequences_dir: PathBuf,

    /// Directory for alignment outputs
    #[arg(long, default_value = "result-alignments")]
    pub alignments_dir: PathBuf,

    /// Directory to write/read annotation CSVs
    #[arg(long, default_value = "result-annotations")]
    pub annotations_dir: PathBuf,

    #[command(flatten)]
    pub controls: ControlArgs,
}

/// Command-line interface of the single-filter job runner.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "region_job",
    about = "Crawl one region-class filter and download its alignments"
)]
pub struct JobCli {
    /// Region classes to filter by
    #[arg(long, default_value = "3.3")]
    pub region_classes: String,

    /// Path to save CSV output (default: result-annotations/repeatsDB_annotations_YYYYMMDD.csv)
    #[arg(long)]
    pub output_csv: Option<PathBuf>,

    /// Directory to save alignment files (default: result-alignments/repeatsDB_alignments_YYYYMMDD)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Skip downloading alignment files
    #[arg(long, default_value_t = false)]
    pub skip_alignments: bool,

    /// Do not crawl; read the existing CSV and download alignments only
    #[arg(long, default_value_t = false)]
    pub fetch_alignments_only: bool,

    #[command(flatten)]
    pub controls: ControlArgs,
}

/// Command-line interface of the standalone sequence resolver.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sequence_fetch",
    about = "Resolve the sequences of an annotation CSV into a multi-FASTA file"
)]
pub struct SequenceCli {
    /// Annotation CSV to read
    pub input: PathBuf,

    /// FASTA file to write; failures go to `<output>.err`
    pub output: PathBuf,

    /// Per-request timeout in seconds
    #[arg(long, env = "REPEATCRAWL_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,
}
