use serde::{Deserialize, Serialize};

use std::cmp::Ordering;

use super::Result;

/// Entry of a comic's chapter list, as shown on the comic page
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ChapterSummary {
    pub chapter: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Free text as published by the source, e.g. "5 years ago"
    #[serde(default)]
    pub date: String,
}

/// One chapter record, stored as `chapters/chapter-{id}.json`.
///
/// `images` is `None` when the images were never scraped, which is different from a chapter
/// that legitimately has no images.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Chapter {
    pub chapter: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_images: Option<usize>,
}

impl Chapter {
    /// Chapter record without images
    pub fn from_summary(summary: &ChapterSummary) -> Self {
        Self {
            chapter: summary.chapter.clone(),
            title: summary.title.clone(),
            url: summary.url.clone(),
            date: summary.date.clone(),
            ..Default::default()
        }
    }

    /// Sets the image list, keeping `total_images` in step with it
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.total_images = Some(images.len());
        self.images = Some(images);
        self
    }

    pub fn has_images(&self) -> bool {
        self.images.is_some()
    }

    /// Image count recorded for this chapter, `None` when images were never scraped.
    ///
    /// Trusts `total_images` and falls back to the length of `images` when the total is
    /// missing or zero. A zero total without an image list means nothing was scraped.
    pub fn stored_image_count(&self) -> Option<usize> {
        match (self.total_images, &self.images) {
            (Some(total), _) if total > 0 => Some(total),
            (_, Some(images)) => Some(images.len()),
            (_, None) => None,
        }
    }

    pub fn summary(&self) -> ChapterSummary {
        ChapterSummary {
            chapter: self.chapter.clone(),
            title: self.title.clone(),
            url: self.url.clone(),
            date: self.date.clone(),
        }
    }

    pub(crate) fn map_urls<F>(mut self, mut f: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<String>,
    {
        self.url = f(&self.url)?;

        if let Some(images) = self.images.take() {
            let images = images
                .iter()
                .map(|image| f(image))
                .collect::<Result<Vec<_>>>()?;
            self.images = Some(images);
        }

        Ok(self)
    }
}

impl ChapterSummary {
    pub(crate) fn map_urls<F>(mut self, mut f: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<String>,
    {
        self.url = f(&self.url)?;
        Ok(self)
    }
}

/// Orders chapter ids numerically when both parse as numbers, lexically otherwise.
/// Numeric ties ("1" and "1.0") are broken lexically so the order stays total
pub fn chapter_order(a: &str, b: &str) -> Ordering {
    match (parse_chapter_number(a), parse_chapter_number(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn parse_chapter_number(id: &str) -> Option<f64> {
    id.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// File name of a chapter record: `chapter-{id}.json` with `.`, `/` and `\` replaced by `-`.
///
/// Not injective: `1.5` and `1-5` share `chapter-1-5.json`.
pub fn chapter_file_name(id: &str) -> String {
    let id: String = id
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '/' | '\\' => '-',
            c => c,
        })
        .collect();

    format!("chapter-{id}.json")
}
