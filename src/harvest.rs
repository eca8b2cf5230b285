//! Scrape commands: one comic, a range of listing pages, and repairs of drifted chapters

use async_trait::async_trait;
use bon::{bon, Builder};
use bytes::Bytes;
use futures::StreamExt as _;
use serde::Serialize;

use crate::integrity::{ChapterDiscrepancy, IntegrityChecker};
use crate::requests::chapter::{Chapter, ChapterSummary};
use crate::requests::comic::{Comic, ComicSummary, IndexEntry};
use crate::requests::query_utils::ComicRef;
use crate::requests::{now, Error, Result};
use crate::store::Store;
use crate::walker::{ListedComic, PageRange, Walker};
use crate::HarvestClient;

use std::sync::Arc;

/// Receives downloaded chapter images. `position` is 1-based
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn accept(
        &self,
        slug: &str,
        chapter: &str,
        position: usize,
        url: &str,
        bytes: Bytes,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Builder)]
pub struct ScrapeOptions {
    /// Store a record for every chapter of the comic
    #[builder(default)]
    pub chapters: bool,
    /// Fetch every chapter page for its image urls. Implies `chapters`
    #[builder(default)]
    pub images: bool,
    /// Refetch metadata and chapters that are already stored
    #[builder(default)]
    pub force: bool,
    #[builder(default = 1)]
    pub workers: usize,
    #[builder(default)]
    pub range: PageRange,
    #[builder(default = true)]
    pub warm_up: bool,
    #[builder(default = Walker::DEFAULT_MAX_CONSECUTIVE_FAILURES)]
    pub max_consecutive_failures: u32,
}

impl ScrapeOptions {
    pub fn scrapes_chapters(&self) -> bool {
        self.chapters || self.images
    }
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChapterTally {
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for ChapterTally {
    fn add_assign(&mut self, other: Self) {
        self.stored += other.stored;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComicOutcome {
    pub comic: Comic,
    /// `true` when the stored metadata was used instead of a fresh fetch
    pub reused: bool,
    pub chapters: ChapterTally,
}

/// Summary of a page crawl
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub failed_pages: Vec<u32>,
    pub comics_stored: usize,
    pub failed_comics: Vec<String>,
    pub chapters: ChapterTally,
}

enum Processed {
    PageFailed(u32),
    Comic {
        slug: String,
        result: Result<ComicOutcome>,
    },
}

#[derive(Clone)]
pub struct Harvester {
    client: HarvestClient,
    store: Store,
    options: ScrapeOptions,
    sink: Option<Arc<dyn ImageSink>>,
}

#[bon]
impl Harvester {
    #[builder]
    pub fn new(
        client: HarvestClient,
        store: Store,
        #[builder(default)] options: ScrapeOptions,
        sink: Option<Arc<dyn ImageSink>>,
    ) -> Self {
        Self {
            client,
            store,
            options,
            sink,
        }
    }
}

impl Harvester {
    pub fn client(&self) -> &HarvestClient {
        &self.client
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn options(&self) -> &ScrapeOptions {
        &self.options
    }

    /// Checker over the same client and store, so checks and repairs share one rate limit
    pub fn checker(&self) -> IntegrityChecker {
        IntegrityChecker::new(self.client.clone(), self.store.clone())
    }

    async fn warm_up(&self) {
        if self.options.warm_up && !self.client.warm_up().await {
            tracing::warn!("continuing without a warmed-up session");
        }
    }

    /// Scrapes one comic addressed by slug or url. Every failure is returned
    #[tracing::instrument(skip(self))]
    pub async fn scrape_comic(&self, comic: &str) -> Result<ComicOutcome> {
        let comic_ref = ComicRef::parse(comic, self.client.layout())?;
        self.warm_up().await;
        self.process(&comic_ref, None, true).await
    }

    /// Walks the configured page range and scrapes every listed comic with up to `workers`
    /// comics in flight. Failures are logged and counted, the crawl goes on
    #[tracing::instrument(skip(self), fields(range = ?self.options.range))]
    pub async fn scrape_pages(&self) -> Result<CrawlReport> {
        self.warm_up().await;

        let walker = Walker::new(self.client.clone(), self.options.range)
            .max_consecutive_failures(self.options.max_consecutive_failures);

        let processed = walker
            .walk()
            .map(|item| async move {
                match item {
                    Err(failure) => Processed::PageFailed(failure.page),
                    Ok(listed) => Processed::Comic {
                        result: self.scrape_listed(&listed).await,
                        slug: listed.summary.slug,
                    },
                }
            })
            .buffer_unordered(self.options.workers.max(1));
        let mut processed = std::pin::pin!(processed);

        let mut report = CrawlReport::default();

        while let Some(item) = processed.next().await {
            match item {
                Processed::PageFailed(page) => report.failed_pages.push(page),
                Processed::Comic {
                    result: Ok(outcome),
                    ..
                } => {
                    report.comics_stored += 1;
                    report.chapters += outcome.chapters;
                }
                Processed::Comic {
                    slug,
                    result: Err(e),
                } => {
                    tracing::warn!("failed to scrape {slug}: {e}");
                    report.failed_comics.push(slug);
                }
            }
        }

        report.failed_pages.sort_unstable();
        report.failed_comics.sort();

        tracing::info!(
            "crawl finished: {} comics stored, {} comics failed, {} pages failed",
            report.comics_stored,
            report.failed_comics.len(),
            report.failed_pages.len()
        );

        Ok(report)
    }

    async fn scrape_listed(&self, listed: &ListedComic) -> Result<ComicOutcome> {
        let summary = &listed.summary;
        let input = if summary.url.is_empty() {
            &summary.slug
        } else {
            &summary.url
        };

        let comic_ref = ComicRef::parse(input, self.client.layout())?;
        self.process(&comic_ref, Some(summary), false).await
    }

    async fn process(
        &self,
        comic_ref: &ComicRef,
        listed: Option<&ComicSummary>,
        strict: bool,
    ) -> Result<ComicOutcome> {
        let (comic, reused) = self.resolve_comic(comic_ref, listed).await?;

        let chapters = if self.options.scrapes_chapters() {
            self.scrape_chapters(&comic, strict).await?
        } else {
            ChapterTally::default()
        };

        Ok(ComicOutcome {
            comic,
            reused,
            chapters,
        })
    }

    /// Stored metadata is reused unless `force` is set. Either way the index entry is
    /// written after the comic record
    async fn resolve_comic(
        &self,
        comic_ref: &ComicRef,
        listed: Option<&ComicSummary>,
    ) -> Result<(Comic, bool)> {
        if !self.options.force {
            let stored = match self.store.load_comic(&comic_ref.slug).await {
                Ok(stored) => stored,
                Err(e @ (Error::JsonError(_) | Error::DecodeError { .. })) => {
                    tracing::warn!(
                        "stored record of {} is unreadable, scraping it again: {e}",
                        comic_ref.slug
                    );
                    None
                }
                Err(e) => return Err(e),
            };

            if let Some(stored) = stored {
                tracing::info!("{} already stored, reusing metadata", comic_ref.slug);
                self.store
                    .upsert_index_entry(IndexEntry::from(&stored))
                    .await?;
                return Ok((stored, true));
            }
        }

        let mut comic = self.client.fetch_comic_metadata(&comic_ref.slug).await?;
        if let Some(summary) = listed {
            comic.absorb_summary(summary);
        }

        let stored = self.store.upsert_comic(comic).await?;
        self.store
            .upsert_index_entry(IndexEntry::from(&stored))
            .await?;

        tracing::info!(
            "stored {} with {} chapters",
            stored.slug,
            stored.total_chapters
        );

        Ok((stored, false))
    }

    fn needs_scrape(&self, existing: Option<&Chapter>) -> bool {
        match existing {
            _ if self.options.force => true,
            None => true,
            Some(chapter) => self.options.images && !chapter.has_images(),
        }
    }

    async fn scrape_chapters(&self, comic: &Comic, strict: bool) -> Result<ChapterTally> {
        let mut tally = ChapterTally::default();

        for summary in &comic.chapters {
            let existing = match self.store.load_chapter(&comic.slug, &summary.chapter).await {
                Ok(existing) => existing,
                Err(e) => {
                    tracing::warn!(
                        "stored chapter {} of {} is unreadable, scraping it again: {e}",
                        summary.chapter,
                        comic.slug
                    );
                    None
                }
            };

            if !self.needs_scrape(existing.as_ref()) {
                tally.skipped += 1;
                continue;
            }

            match self.scrape_chapter(&comic.slug, summary).await {
                Ok(()) => tally.stored += 1,
                Err(e) if strict => return Err(e),
                Err(e) => {
                    tracing::warn!("chapter {} of {} failed: {e}", summary.chapter, comic.slug);
                    tally.failed += 1;
                }
            }
        }

        tracing::debug!(?tally, "chapters of {} processed", comic.slug);

        Ok(tally)
    }

    async fn scrape_chapter(&self, slug: &str, summary: &ChapterSummary) -> Result<()> {
        let chapter = if self.options.images {
            self.client.fetch_chapter(summary).await?
        } else {
            Chapter {
                scraped_at: Some(now()),
                ..Chapter::from_summary(summary)
            }
        };

        self.store_chapter(slug, chapter).await
    }

    async fn store_chapter(&self, slug: &str, chapter: Chapter) -> Result<()> {
        let delivery = match &self.sink {
            Some(sink) if chapter.has_images() => Some((Arc::clone(sink), chapter.clone())),
            _ => None,
        };

        self.store.upsert_chapter(slug, chapter).await?;

        if let Some((sink, chapter)) = delivery {
            self.deliver_images(sink.as_ref(), slug, &chapter).await;
        }

        Ok(())
    }

    /// Sink and download failures are logged, never returned
    async fn deliver_images(&self, sink: &dyn ImageSink, slug: &str, chapter: &Chapter) {
        let images = chapter.images.as_deref().unwrap_or_default();

        for (i, url) in images.iter().enumerate() {
            let bytes = match self.client.fetch_image(url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("image {} of chapter {} failed: {e}", i + 1, chapter.chapter);
                    continue;
                }
            };

            if let Err(e) = sink
                .accept(slug, &chapter.chapter, i + 1, url, bytes)
                .await
            {
                tracing::warn!("sink rejected image {} of chapter {}: {e}", i + 1, chapter.chapter);
            }
        }
    }

    /// Re-scrapes the chapters of `discrepancies` whose live page gained images or changed
    /// image urls. Returns the number of chapters rewritten
    #[tracing::instrument(skip_all, fields(discrepancies = discrepancies.len()))]
    pub async fn repair(&self, discrepancies: &[ChapterDiscrepancy]) -> usize {
        let mut repaired = 0;

        for discrepancy in discrepancies {
            let Some(id) = discrepancy.chapter.as_deref() else {
                continue;
            };
            let slug = discrepancy.slug.as_str();

            if !discrepancy.is_repairable() {
                if let (Some(stored), Some(live)) =
                    (discrepancy.stored_count(), discrepancy.live_count())
                {
                    tracing::warn!(
                        "{slug} chapter {id}: live page has {live} images, {stored} stored, keeping the stored ones"
                    );
                }
                continue;
            }

            let summary = match self.stored_summary(slug, id).await {
                Ok(Some(summary)) => summary,
                Ok(None) => {
                    tracing::warn!("{slug} chapter {id} is no longer stored, nothing to repair");
                    continue;
                }
                Err(e) => {
                    tracing::warn!("{slug} chapter {id} cannot be repaired: {e}");
                    continue;
                }
            };

            let result = match self.client.fetch_chapter(&summary).await {
                Ok(chapter) => self.store_chapter(slug, chapter).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    tracing::info!("{slug} chapter {id} repaired");
                    repaired += 1;
                }
                Err(e) => tracing::warn!("{slug} chapter {id} repair failed: {e}"),
            }
        }

        repaired
    }

    /// Chapter summary as stored in the chapter record, or in the comic record when the chapter
    /// record cannot be read
    async fn stored_summary(&self, slug: &str, id: &str) -> Result<Option<ChapterSummary>> {
        match self.store.load_chapter(slug, id).await {
            Ok(Some(chapter)) if !chapter.url.is_empty() => return Ok(Some(chapter.summary())),
            Ok(_) => {}
            Err(e) => tracing::debug!("falling back to the comic record: {e}"),
        }

        Ok(self
            .store
            .load_comic(slug)
            .await?
            .and_then(|comic| comic.chapters.into_iter().find(|c| c.chapter == id)))
    }
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("client", &self.client)
            .field("store", &self.store)
            .field("options", &self.options)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
