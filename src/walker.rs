//! Lazy walk over listing pages

use futures::Stream;

use crate::requests::comic::ComicSummary;
use crate::requests::Error;
use crate::HarvestClient;

/// Pages `start..=end`, or `start..` until the first empty page when `end` is `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl PageRange {
    pub fn new(start: u32, end: Option<u32>) -> Self {
        Self {
            start: start.max(1),
            end,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.end.is_some()
    }

    pub fn contains(&self, page: u32) -> bool {
        page >= self.start && self.end.map_or(true, |end| page <= end)
    }
}

impl Default for PageRange {
    fn default() -> Self {
        Self::new(1, None)
    }
}

/// A comic as seen on a listing page
#[derive(Debug, Clone, PartialEq)]
pub struct ListedComic {
    pub page: u32,
    pub summary: ComicSummary,
}

/// A listing page that could not be fetched or decoded
#[derive(Debug)]
pub struct PageFailure {
    pub page: u32,
    pub error: Error,
}

impl std::fmt::Display for PageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listing page {}: {}", self.page, self.error)
    }
}

#[derive(Debug, Clone)]
pub struct Walker {
    client: HarvestClient,
    range: PageRange,
    max_consecutive_failures: u32,
}

impl Walker {
    pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

    pub fn new(client: HarvestClient, range: PageRange) -> Self {
        Self {
            client,
            range,
            max_consecutive_failures: Self::DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }

    /// Only applies to unbounded walks. Zero is treated as one
    pub fn max_consecutive_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_failures = limit.max(1);
        self
    }

    pub fn range(&self) -> PageRange {
        self.range
    }

    /// Streams every comic of the range in page order.
    ///
    /// A failing page is yielded as `Err` and the walk moves on to the next page. No state is
    /// carried between pages besides the cursor, so a walk started at page `k` yields what a
    /// full walk yields from page `k` on.
    pub fn walk(&self) -> impl Stream<Item = Result<ListedComic, PageFailure>> + '_ {
        async_stream::stream! {
            let mut page = self.range.start;
            let mut consecutive_failures = 0;

            while self.range.contains(page) {
                tracing::debug!("walking listing page {page}");

                match self.client.fetch_listing_page(page).await {
                    Ok(comics) if comics.is_empty() => {
                        if !self.range.is_bounded() {
                            tracing::info!("listing page {page} is empty, walk finished");
                            break;
                        }
                        tracing::debug!("listing page {page} is empty");
                        consecutive_failures = 0;
                    }
                    Ok(comics) => {
                        consecutive_failures = 0;

                        for summary in comics {
                            yield Ok(ListedComic { page, summary });
                        }
                    }
                    Err(error) => {
                        consecutive_failures += 1;
                        tracing::warn!("listing page {page} failed: {error}");

                        yield Err(PageFailure { page, error });

                        if !self.range.is_bounded()
                            && consecutive_failures >= self.max_consecutive_failures
                        {
                            tracing::warn!(
                                "giving up after {consecutive_failures} failing pages in a row"
                            );
                            break;
                        }
                    }
                }

                let Some(next) = page.checked_add(1) else {
                    break;
                };
                page = next;
            }
        }
    }
}
