use reqwest::Url;

use super::{Error, Result};

/// URL scheme of the tracked source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    base_url: String,
}

impl SourceLayout {
    pub const LISTING_PATH: &'static str = "komik-terbaru";
    pub const COMIC_PATH: &'static str = "komik";

    pub fn new(base_url: &str) -> Result<Self> {
        let parsed =
            Url::parse(base_url).map_err(|e| Error::ConfigError(format!("{base_url}: {e}")))?;

        if parsed.host_str().is_none() {
            return Err(Error::ConfigError(format!("{base_url}: url has no host")));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// First listing page lives at the bare listing path, the rest under `page/{n}/`
    pub fn listing_url(&self, page: u32) -> String {
        if page > 1 {
            format!("{}/{}/page/{page}/", self.base_url, Self::LISTING_PATH)
        } else {
            format!("{}/{}/", self.base_url, Self::LISTING_PATH)
        }
    }

    pub fn comic_url(&self, slug: &str) -> String {
        format!("{}/{}/{slug}/", self.base_url, Self::COMIC_PATH)
    }
}

/// A comic addressed either by slug or by URL, canonicalized to one form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComicRef {
    pub slug: String,
    pub url: String,
}

impl ComicRef {
    /// Accepts `one-piece`, `https://host/komik/one-piece/` or `https://host/komik/one-piece`
    /// and resolves all of them to the same slug and canonical URL
    pub fn parse(input: &str, layout: &SourceLayout) -> Result<Self> {
        let input = input.trim();

        let slug = if input.starts_with("http://") || input.starts_with("https://") {
            slug_from_url(input).ok_or_else(|| Error::InvalidReference(input.to_owned()))?
        } else {
            input.trim_matches('/').to_owned()
        };

        if !is_valid_slug(&slug) {
            return Err(Error::InvalidReference(input.to_owned()));
        }

        Ok(Self {
            url: layout.comic_url(&slug),
            slug,
        })
    }
}

/// Last non-empty path segment of `url`
pub fn slug_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;

    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_owned)
}

/// Slugs are used as directory names, so only URL-safe characters are accepted
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug != "."
        && slug != ".."
        && slug
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '%'))
}
