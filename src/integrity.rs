//! Drift detection between the stored snapshot and the live source. Read-only

use serde::Serialize;

use crate::requests::chapter::Chapter;
use crate::requests::{Error, Result};
use crate::store::Store;
use crate::HarvestClient;

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Stored and live image counts differ
    CountMismatch { stored: usize, live: usize },
    /// Same number of images, but the urls at these 1-based positions changed
    UrlsChanged { positions: Vec<usize> },
    /// The chapter is gone from the live chapter list, or its page 404s
    MissingLive,
    LiveFetchFailed { reason: String },
    /// A stored record could not be read back
    Corrupt { reason: String },
    /// The whole comic could not be checked
    ComicUnavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterDiscrepancy {
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(flatten)]
    pub kind: DiscrepancyKind,
}

impl ChapterDiscrepancy {
    fn chapter(slug: &str, chapter: &str, kind: DiscrepancyKind) -> Self {
        Self {
            slug: slug.to_owned(),
            chapter: Some(chapter.to_owned()),
            kind,
        }
    }

    fn comic(slug: &str, kind: DiscrepancyKind) -> Self {
        Self {
            slug: slug.to_owned(),
            chapter: None,
            kind,
        }
    }

    pub fn stored_count(&self) -> Option<usize> {
        match self.kind {
            DiscrepancyKind::CountMismatch { stored, .. } => Some(stored),
            _ => None,
        }
    }

    pub fn live_count(&self) -> Option<usize> {
        match self.kind {
            DiscrepancyKind::CountMismatch { live, .. } => Some(live),
            _ => None,
        }
    }

    /// Whether re-scraping the chapter brings the snapshot in line with the source.
    /// A live page with fewer images than stored is left alone
    pub fn is_repairable(&self) -> bool {
        match &self.kind {
            DiscrepancyKind::CountMismatch { stored, live } => live > stored,
            DiscrepancyKind::UrlsChanged { .. } => true,
            _ => false,
        }
    }
}

/// Classifies a failure to read a stored record: unreadable contents are `Corrupt`,
/// anything else is passed on
fn corruption(error: Error) -> std::result::Result<DiscrepancyKind, Error> {
    match error {
        e @ (Error::DecodeError { .. } | Error::JsonError(_)) => Ok(DiscrepancyKind::Corrupt {
            reason: e.to_string(),
        }),
        e => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    client: HarvestClient,
    store: Store,
}

impl IntegrityChecker {
    pub fn new(client: HarvestClient, store: Store) -> Self {
        Self { client, store }
    }

    /// Compares every scraped chapter of one stored comic with its live page.
    ///
    /// Fails with `NotFoundError` when the comic is not stored or no longer exists on the
    /// source. Chapter level problems are reported, not returned as errors.
    #[tracing::instrument(skip(self))]
    pub async fn check_comic(&self, slug: &str) -> Result<Vec<ChapterDiscrepancy>> {
        let Some(stored) = self.store.load_comic(slug).await? else {
            return Err(Error::NotFoundError(format!("{slug} (not in the snapshot)")));
        };

        let live = self.client.fetch_comic_metadata(slug).await?;
        let live_urls: HashMap<&str, &str> = live
            .chapters
            .iter()
            .map(|chapter| (chapter.chapter.as_str(), chapter.url.as_str()))
            .collect();

        let mut discrepancies = Vec::new();

        for summary in &stored.chapters {
            let id = summary.chapter.as_str();

            let chapter = match self.store.load_chapter(slug, id).await {
                Ok(Some(chapter)) => chapter,
                Ok(None) => continue,
                Err(e) => {
                    let kind = corruption(e)?;
                    tracing::warn!("chapter {id} of {slug} is unreadable");
                    discrepancies.push(ChapterDiscrepancy::chapter(slug, id, kind));
                    continue;
                }
            };

            let Some(stored_count) = chapter.stored_image_count() else {
                tracing::trace!("chapter {id} has no scraped images, skipping");
                continue;
            };

            let Some(live_url) = live_urls.get(id) else {
                discrepancies.push(ChapterDiscrepancy::chapter(
                    slug,
                    id,
                    DiscrepancyKind::MissingLive,
                ));
                continue;
            };

            let url = if chapter.url.is_empty() {
                *live_url
            } else {
                chapter.url.as_str()
            };

            if let Some(kind) = self.compare_chapter(&chapter, stored_count, url).await {
                discrepancies.push(ChapterDiscrepancy::chapter(slug, id, kind));
            }
        }

        tracing::info!(
            "{slug}: {} chapters compared, {} discrepancies",
            stored.chapters.len(),
            discrepancies.len()
        );

        Ok(discrepancies)
    }

    async fn compare_chapter(
        &self,
        stored: &Chapter,
        stored_count: usize,
        url: &str,
    ) -> Option<DiscrepancyKind> {
        let live = match self.client.fetch_chapter_detail(url).await {
            Ok(live) => live,
            Err(Error::NotFoundError(_)) => return Some(DiscrepancyKind::MissingLive),
            Err(e) => {
                return Some(DiscrepancyKind::LiveFetchFailed {
                    reason: e.to_string(),
                })
            }
        };

        let live_images = live.images.unwrap_or_default();

        if live_images.len() != stored_count {
            return Some(DiscrepancyKind::CountMismatch {
                stored: stored_count,
                live: live_images.len(),
            });
        }

        let stored_images = stored.images.as_deref().unwrap_or_default();
        if stored_images.len() != live_images.len() {
            // count came from `total_images` alone, nothing to compare position by position
            return None;
        }

        let positions: Vec<usize> = stored_images
            .iter()
            .zip(&live_images)
            .enumerate()
            .filter(|(_, (stored, live))| stored != live)
            .map(|(i, _)| i + 1)
            .collect();

        (!positions.is_empty()).then_some(DiscrepancyKind::UrlsChanged { positions })
    }

    /// Checks every comic of the index. A comic that cannot be checked becomes a single
    /// discrepancy and the loop moves on
    #[tracing::instrument(skip(self))]
    pub async fn check_all(&self) -> Result<Vec<ChapterDiscrepancy>> {
        let index = self.store.load_index().await?;
        let mut discrepancies = Vec::new();

        for slug in index.slugs() {
            match self.check_comic(slug).await {
                Ok(found) => discrepancies.extend(found),
                Err(e) => {
                    tracing::warn!("could not check {slug}: {e}");

                    let kind = corruption(e).unwrap_or_else(|e| DiscrepancyKind::ComicUnavailable {
                        reason: e.to_string(),
                    });
                    discrepancies.push(ChapterDiscrepancy::comic(slug, kind));
                }
            }
        }

        tracing::info!(
            "checked {} comics, {} discrepancies",
            index.total_comics,
            discrepancies.len()
        );

        Ok(discrepancies)
    }
}
