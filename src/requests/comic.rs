use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use super::chapter::{chapter_order, ChapterSummary};
use super::Result;

/// Entry of a listing page
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ComicSummary {
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub comic_type: Option<String>,
    #[serde(default)]
    pub is_colored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

/// What a decoder extracts from one listing page
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ListingPage {
    pub comics: Vec<ComicSummary>,
    /// Highest page number advertised by the pagination widget, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_page: Option<u32>,
}

/// One comic record, stored as `comics/{slug}/metadata.json`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Comic {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_titles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illustrator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demographic: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub comic_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub themes: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_colored: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synopsis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<String>,
    #[serde(default)]
    pub chapters: Vec<ChapterSummary>,
    #[serde(default)]
    pub total_chapters: usize,
}

impl Comic {
    /// Fills fields the comic page left empty with what the listing page showed
    pub fn absorb_summary(&mut self, summary: &ComicSummary) {
        fn fill(field: &mut Option<String>, value: &str) {
            if field.as_deref().map_or(true, str::is_empty) && !value.is_empty() {
                *field = Some(value.to_owned());
            }
        }

        fill(&mut self.title, &summary.title);
        fill(&mut self.url, &summary.url);
        fill(
            &mut self.cover_url,
            summary.cover_url.as_deref().unwrap_or_default(),
        );
        fill(
            &mut self.comic_type,
            summary.comic_type.as_deref().unwrap_or_default(),
        );

        if self.rating.is_none() {
            self.rating = summary.rating;
        }
        if self.is_colored.is_none() {
            self.is_colored = Some(summary.is_colored);
        }
    }

    /// Merges a newer fetch into this record.
    ///
    /// Scalars come from `newer`. Chapters are merged by id: ids known only here are kept, ids in
    /// both take the newer version. The result is sorted by chapter order and `total_chapters`
    /// is recomputed.
    pub fn merge(self, newer: Comic) -> Comic {
        let mut chapters: BTreeMap<String, ChapterSummary> = self
            .chapters
            .into_iter()
            .map(|chapter| (chapter.chapter.clone(), chapter))
            .collect();

        let mut merged = newer;
        for chapter in std::mem::take(&mut merged.chapters) {
            chapters.insert(chapter.chapter.clone(), chapter);
        }

        merged.chapters = chapters.into_values().collect();
        merged.normalize();
        merged
    }

    /// Sorts chapters, drops duplicate ids (last one wins) and recomputes `total_chapters`
    pub fn normalize(&mut self) {
        let mut unique: BTreeMap<String, ChapterSummary> = BTreeMap::new();
        for chapter in self.chapters.drain(..) {
            unique.insert(chapter.chapter.clone(), chapter);
        }

        self.chapters = unique.into_values().collect();
        self.chapters
            .sort_by(|a, b| chapter_order(&a.chapter, &b.chapter));
        self.total_chapters = self.chapters.len();
    }

    pub(crate) fn map_urls<F>(mut self, mut f: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<String>,
    {
        if let Some(url) = self.url.take() {
            self.url = Some(f(&url)?);
        }
        if let Some(cover_url) = self.cover_url.take() {
            self.cover_url = Some(f(&cover_url)?);
        }

        self.chapters = self
            .chapters
            .into_iter()
            .map(|chapter| chapter.map_urls(&mut f))
            .collect::<Result<Vec<_>>>()?;

        Ok(self)
    }
}

/// Lightweight summary kept in `index.json`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct IndexEntry {
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub comic_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default)]
    pub total_chapters: usize,
}

impl From<&Comic> for IndexEntry {
    fn from(comic: &Comic) -> Self {
        Self {
            slug: comic.slug.clone(),
            title: comic.title.clone().unwrap_or_default(),
            comic_type: comic.comic_type.clone(),
            status: comic.status.clone(),
            rating: comic.rating,
            total_chapters: comic.total_chapters,
        }
    }
}

/// Contents of `index.json`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Index {
    #[serde(default)]
    pub total_comics: usize,
    #[serde(default)]
    pub comics: BTreeMap<String, IndexEntry>,
}

impl Index {
    pub fn upsert(&mut self, entry: IndexEntry) {
        self.comics.insert(entry.slug.clone(), entry);
        self.total_comics = self.comics.len();
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.comics.keys().map(String::as_str)
    }
}
