//! Pagination state machine over the remote annotation table.
//!
//! The crawl never sleeps for a fixed time when a condition can be observed instead: every wait
//! is a bounded [`TableDriver::wait_for`] with a short, explicit fallback if it times out.

use crate::controls::CrawlControls;
use crate::driver::{Control, DriverError, TableDriver, TableSnapshot, WAIT_POLL_INTERVAL};
use crate::html::{has_body_rows, parse_table};
use crate::record::AnnotationRecord;
use crate::session::{Admission, CrawlSession};
use crate::sink::SinkError;
use std::io::Write;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Extra waits used when a page-size change is not observed in time.
const PAGE_SIZE_FALLBACK_WAITS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Doublings of the base interval tried after clicking the next page.
const NAV_BACKOFF_STEPS: u32 = 4;

/// Why a crawl stopped paginating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A page held fewer rows than the page size.
    ShortPage,
    /// A page held more rows than the page size.
    OversizedPage,
    /// No rows appeared within the per-page wait budget.
    EmptyPage,
    /// The active page has no enabled successor control.
    NoNextPage,
    /// The page index did not change after clicking the successor.
    NavigationStalled,
    /// The configured page cap was reached.
    PageCap,
    /// The page-size selector never appeared; only the initial render was captured.
    PageSizeUnavailable,
}

/// Totals reported when a crawl ends normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlOutcome {
    /// Unique records written to the sink.
    pub unique_records: usize,
    /// Paginated pages extracted (the initial render is not counted).
    pub pages: usize,
    /// What ended the crawl.
    pub stop: StopReason,
}

/// Unrecoverable crawl failures. Records emitted before the failure stay in the sink.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// The UI backend failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Writing a record failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

enum Navigation {
    Moved,
    NoSuccessor,
    Stalled,
}

/// Drives one filter's listing through pagination, streaming unique records into the session.
pub struct TableCrawler<'a, D: TableDriver + ?Sized> {
    driver: &'a mut D,
    controls: &'a CrawlControls,
}

impl<'a, D: TableDriver + ?Sized> TableCrawler<'a, D> {
    /// Binds a crawler to a driver session.
    pub fn new(driver: &'a mut D, controls: &'a CrawlControls) -> Self {
        Self { driver, controls }
    }

    /// Crawls `listing` to completion.
    pub async fn crawl<W: Write>(
        &mut self,
        listing: &Url,
        session: &mut CrawlSession<W>,
    ) -> Result<CrawlOutcome, CrawlError> {
        let page_size = self.controls.page_size();
        self.driver.load(listing).await?;

        let rows_ready = self
            .driver
            .wait_for(
                &|snap: &TableSnapshot| has_body_rows(&snap.table_html),
                self.controls.ready_timeout(),
            )
            .await?;
        if !rows_ready {
            debug!("table rows not rendered in time, falling back to a short sleep");
            sleep(self.controls.base_interval()).await;
        }

        // The first render is captured before touching the page-size control because the
        // change may reload the table while it is being read.
        let initial = self.extract().await?;
        let fresh = admit_all(session, &initial)?;
        info!(rows = initial.len(), fresh, "captured initial render");

        if !self.apply_page_size(page_size).await? {
            warn!(page_size, "page size selector unavailable, keeping the initial render only");
            return Ok(CrawlOutcome {
                unique_records: session.unique_records(),
                pages: 0,
                stop: StopReason::PageSizeUnavailable,
            });
        }

        let mut pages = 0usize;
        let stop = loop {
            if self.page_cap_reached(pages) {
                break StopReason::PageCap;
            }
            info!(page = pages + 1, "scraping page");

            let records = self.extract_with_patience(pages + 1).await?;
            if records.is_empty() {
                info!(page = pages + 1, "no records found, ending scrape");
                break StopReason::EmptyPage;
            }
            pages += 1;
            let fresh = admit_all(session, &records)?;
            info!(
                page = pages,
                rows = records.len(),
                fresh,
                total = session.unique_records(),
                "page extracted"
            );

            if records.len() < page_size {
                break StopReason::ShortPage;
            }
            if records.len() > page_size {
                warn!(rows = records.len(), page_size, "page larger than requested size");
                break StopReason::OversizedPage;
            }
            if self.page_cap_reached(pages) {
                break StopReason::PageCap;
            }
            match self.next_page().await? {
                Navigation::Moved => continue,
                Navigation::NoSuccessor => break StopReason::NoNextPage,
                Navigation::Stalled => {
                    info!(page = pages, "page index did not change, assuming last page");
                    break StopReason::NavigationStalled;
                }
            }
        };

        Ok(CrawlOutcome {
            unique_records: session.unique_records(),
            pages,
            stop,
        })
    }

    fn page_cap_reached(&self, pages: usize) -> bool {
        self.controls.max_pages().is_some_and(|cap| pages >= cap)
    }

    async fn extract(&mut self) -> Result<Vec<AnnotationRecord>, DriverError> {
        let snapshot = self.driver.snapshot().await?;
        Ok(parse_table(&snapshot.table_html))
    }

    /// Re-polls an empty page until rows show up or the per-page budget is spent.
    async fn extract_with_patience(
        &mut self,
        page: usize,
    ) -> Result<Vec<AnnotationRecord>, DriverError> {
        let started = Instant::now();
        let deadline = started + self.controls.empty_page_budget();
        let poll = self.controls.base_interval().max(WAIT_POLL_INTERVAL);
        let mut records = self.extract().await?;
        while records.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(poll.min(deadline - now)).await;
            records = self.extract().await?;
        }
        let waited = started.elapsed();
        if !waited.is_zero() {
            info!(page, waited_secs = waited.as_secs_f32(), "waited for page rows");
        }
        Ok(records)
    }

    /// Selects `page_size`; `Ok(false)` when the selector or the option is not on the page.
    async fn apply_page_size(&mut self, page_size: usize) -> Result<bool, DriverError> {
        let control_ready = self
            .driver
            .wait_for(
                &|snap: &TableSnapshot| snap.page_size_control,
                self.controls.ready_timeout(),
            )
            .await?;
        if !control_ready {
            return Ok(false);
        }

        let before = self.driver.snapshot().await?.table_html;
        match self.driver.invoke(Control::PageSize(page_size)).await {
            Ok(()) => {}
            Err(DriverError::MissingControl(control)) => {
                debug!(page_size, control, "page size option not offered");
                return Ok(false);
            }
            Err(err) => return Err(err),
        }
        let changed = self
            .driver
            .wait_for(
                &|snap: &TableSnapshot| snap.table_html != before,
                self.controls.page_size_timeout(),
            )
            .await?;
        if changed {
            return Ok(true);
        }

        for wait in PAGE_SIZE_FALLBACK_WAITS {
            sleep(wait).await;
            if self.driver.snapshot().await?.table_html != before {
                return Ok(true);
            }
        }
        debug!(page_size, "table did not visibly change after resizing");
        Ok(true)
    }

    async fn next_page(&mut self) -> Result<Navigation, DriverError> {
        let snapshot = self.driver.snapshot().await?;
        let Some(active) = snapshot.page_items.iter().position(|item| item.active) else {
            return Ok(Navigation::NoSuccessor);
        };
        let next = active + 1;
        match snapshot.page_items.get(next) {
            Some(item) if !item.disabled => {}
            _ => return Ok(Navigation::NoSuccessor),
        }

        let before = snapshot.page_index;
        self.driver.invoke(Control::PageItem(next)).await?;

        let base = self.controls.base_interval();
        for step in 0..NAV_BACKOFF_STEPS {
            sleep(base * 2u32.pow(step)).await;
            if self.driver.snapshot().await?.page_index != before {
                return Ok(Navigation::Moved);
            }
        }

        let moved = self
            .driver
            .wait_for(
                &|snap: &TableSnapshot| snap.page_index != before,
                self.controls.final_nav_wait(),
            )
            .await?;
        Ok(if moved {
            Navigation::Moved
        } else {
            Navigation::Stalled
        })
    }
}

fn admit_all<W: Write>(
    session: &mut CrawlSession<W>,
    records: &[AnnotationRecord],
) -> Result<usize, SinkError> {
    let mut fresh = 0;
    for record in records {
        if session.admit(record)? == Admission::Emitted {
            fresh += 1;
        }
    }
    Ok(fresh)
}


#[cfg(test)]
mod tests {
    use super::fake::{records, ScriptedListing};
    use super::*;
    use crate::sink::{read_sink_from, AnnotationSink};
    use std::collections::HashSet;

    fn listing_url() -> Url {
        Url::parse("https://listing.test/annotations?limit=100&region.classes=3.3").unwrap()
    }

    fn controls(page_size: usize, max_pages: Option<usize>) -> CrawlControls {
        CrawlControls::new(page_size, max_pages, Duration::from_secs(1))
    }

    async fn run(
        driver: &mut ScriptedListing,
        controls: &CrawlControls,
    ) -> (Result<CrawlOutcome, CrawlError>, Vec<AnnotationRecord>) {
        let mut session = CrawlSession::new(AnnotationSink::new(Vec::new()).unwrap());
        let outcome = TableCrawler::new(driver, controls)
            .crawl(&listing_url(), &mut session)
            .await;
        let bytes = session.finish().unwrap();
        let replay = read_sink_from(bytes.as_slice()).unwrap();
        (outcome, replay.records)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_first_short_page() {
        let pages = vec![
            records("p", 0, 100),
            records("p", 100, 100),
            records("p", 200, 37),
        ];
        // The default-size first render repeats the first ten rows of page one.
        let mut driver = ScriptedListing::new(records("p", 0, 10), pages);
        let controls = controls(100, None);

        let (outcome, emitted) = run(&mut driver, &controls).await;
        let outcome = outcome.unwrap();

        assert_eq!(outcome.unique_records, 237);
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.stop, StopReason::ShortPage);
        assert_eq!(driver.page_clicks, 2);
        assert_eq!(emitted.len(), 237);
        let keys: HashSet<_> = emitted.iter().map(|r| r.identity()).collect();
        assert_eq!(keys.len(), emitted.len());
        assert_eq!(emitted[0].entity_id, "p0");
        assert_eq!(emitted[236].entity_id, "p236");
    }

    #[tokio::test(start_paused = true)]
    async fn initial_render_rows_are_kept_even_if_resize_drops_them() {
        let mut driver = ScriptedListing::new(records("init", 0, 5), vec![records("p", 0, 3)]);
        let (outcome, emitted) = run(&mut driver, &controls(100, None)).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.unique_records, 8);
        assert_eq!(emitted[0].entity_id, "init0");
        assert_eq!(emitted[5].entity_id, "p0");
    }

    #[tokio::test(start_paused = true)]
    async fn full_last_page_ends_on_disabled_successor() {
        let mut driver =
            ScriptedListing::new(Vec::new(), vec![records("p", 0, 10), records("p", 10, 10)]);
        let (outcome, _) = run(&mut driver, &controls(10, None)).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.unique_records, 20);
        assert_eq!(outcome.stop, StopReason::NoNextPage);
        assert_eq!(driver.page_clicks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_cap_stops_regardless_of_remaining_pages() {
        let pages = (0..5).map(|n| records("p", n * 10, 10)).collect();
        let mut driver = ScriptedListing::new(Vec::new(), pages);
        let (outcome, emitted) = run(&mut driver, &controls(10, Some(2))).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.stop, StopReason::PageCap);
        assert_eq!(outcome.pages, 2);
        assert_eq!(emitted.len(), 20);
        assert_eq!(driver.page_clicks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_navigation_is_treated_as_the_end() {
        let mut driver =
            ScriptedListing::new(Vec::new(), vec![records("p", 0, 10), records("p", 10, 10)]);
        driver.navigation_works = false;
        let start = tokio::time::Instant::now();
        let (outcome, emitted) = run(&mut driver, &controls(10, None)).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.stop, StopReason::NavigationStalled);
        assert_eq!(emitted.len(), 10);
        // 1 + 2 + 4 + 8 seconds of backoff plus the final five second wait.
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_listing_waits_out_the_budget_then_stops() {
        let mut driver = ScriptedListing::new(Vec::new(), vec![Vec::new()]);
        let (outcome, emitted) = run(&mut driver, &controls(10, None)).await;
        assert_eq!(outcome.unwrap().stop, StopReason::EmptyPage);
        assert!(emitted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_base_interval_still_bounds_the_empty_page_wait() {
        let mut driver = ScriptedListing::new(Vec::new(), vec![Vec::new()]);
        let controls = CrawlControls::new(10, None, Duration::ZERO);
        let start = tokio::time::Instant::now();

        let (outcome, emitted) = run(&mut driver, &controls).await;

        assert_eq!(outcome.unwrap().stop, StopReason::EmptyPage);
        assert!(emitted.is_empty());
        let budgets = controls.ready_timeout()
            + controls.page_size_timeout()
            + Duration::from_millis(3500)
            + controls.empty_page_budget();
        assert!(start.elapsed() <= budgets + Duration::from_secs(1));
        assert!(driver.snapshots < 500, "{} snapshots", driver.snapshots);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_page_size_selector_keeps_the_initial_render() {
        let mut driver = ScriptedListing::new(records("init", 0, 5), vec![records("p", 0, 10)]);
        driver.page_size_control = false;

        let (outcome, emitted) = run(&mut driver, &controls(10, None)).await;

        let outcome = outcome.unwrap();
        assert_eq!(outcome.stop, StopReason::PageSizeUnavailable);
        assert_eq!(outcome.unique_records, 5);
        assert_eq!(outcome.pages, 0);
        assert_eq!(emitted.len(), 5);
        assert_eq!(driver.page_clicks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unoffered_page_size_option_keeps_the_initial_render() {
        let mut driver = ScriptedListing::new(records("init", 0, 5), vec![records("p", 0, 10)]);
        driver.page_size_offered = false;

        let (outcome, emitted) = run(&mut driver, &controls(250, None)).await;

        assert_eq!(outcome.unwrap().stop, StopReason::PageSizeUnavailable);
        assert_eq!(emitted.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failure_aborts_the_crawl() {
        let mut driver = ScriptedListing::new(records("p", 0, 3), vec![records("p", 0, 3)]);
        driver.fail_snapshots = true;
        let (outcome, emitted) = run(&mut driver, &controls(10, None)).await;
        assert!(matches!(outcome, Err(CrawlError::Driver(DriverError::Session(_)))));
        assert!(emitted.is_empty());
    }
}
