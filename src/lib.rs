#![warn(missing_docs)]
//! Core library entry points for the RepeatsDB annotation harvester.

pub mod controls;
pub mod crawler;
pub mod discovery;
pub mod driver;
pub mod html;
pub mod literal;
pub mod logging;
pub mod probe;
pub mod record;
pub mod runtime;
pub mod sequences;
pub mod session;
pub mod sink;
pub mod webdriver;

pub use controls::{Cli, CrawlControls, HarvestEndpoints, JobCli, SequenceCli};
pub use crawler::{CrawlOutcome, StopReason, TableCrawler};
pub use discovery::{DiscoveryEngine, DiscoveryReport, DiscoverySummary};
pub use driver::{Control, DriverError, DriverFactory, TableDriver, TableSnapshot};
pub use probe::{AlignmentFetcher, ArtifactStore, RegionOutcome, RegionProber};
pub use record::{AnnotationRecord, IdentityKey, SourceKind};
pub use runtime::{run as run_harvest, run_region_job};
pub use sequences::{resolve_sink, SequenceLookup};
pub use session::CrawlSession;
pub use sink::{read_sink, AnnotationSink};
