//! Structs and utilities for making requests to the tracked source

pub mod chapter;
pub mod comic;
pub mod query_utils;

use crate::HarvestClient;
use chapter::{Chapter, ChapterSummary};
use comic::{Comic, ComicSummary};
use query_utils::ComicRef;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, REFERER};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_tracing::TracingMiddleware;
use thiserror::Error;

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

/// Custom error type that contains all errors that can be emitted by this crate's functions
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to fetch {url}: {reason}")]
    FetchError { url: String, reason: String },
    #[error("{0} does not resolve to a live page")]
    NotFoundError(String),
    #[error("malformed url token {token:?}: {reason}")]
    DecodeError { token: String, reason: String },
    #[error("failed to persist {}: {source}", .path.display())]
    PersistenceError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected page shape: {0}")]
    ParseError(String),
    #[error("{0:?} is neither a comic slug nor a comic url")]
    InvalidReference(String),
    #[error("invalid configuration: {0}")]
    ConfigError(String),
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn fetch(url: &str, reason: impl Display) -> Self {
        Error::FetchError {
            url: url.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PersistenceError {
            path: path.into(),
            source,
        }
    }

    /// Decoder failures surface as fetch failures of the page that could not be decoded
    fn at_page(self, url: &str) -> Self {
        match self {
            Error::ParseError(reason) => Error::fetch(url, reason),
            e => e,
        }
    }
}

/// Type alias for the [`Result`](std::result::Result) that is used in the crate's functions
pub type Result<T> = std::result::Result<T, Error>;

/// Raw answer of the source to a page request
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    pub body: String,
}

/// Network seam of the fetcher. Implementations perform exactly one request per call
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Fetched>;

    async fn get_bytes(&self, url: &str) -> Result<Bytes>;
}

/// [Transport] over HTTP, traced through [TracingMiddleware]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ClientWithMiddleware,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("id-ID,id;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(REFERER, HeaderValue::from_static("https://www.google.com/"));

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(TracingMiddleware::default())
            .build();

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Fetched> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::fetch(url, e))?;

        Ok(Fetched { status, body })
    }

    async fn get_bytes(&self, url: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFoundError(url.to_owned())),
            status if !status.is_success() => Err(Error::fetch(url, status)),
            _ => resp.bytes().await.map_err(|e| Error::fetch(url, e)),
        }
    }
}

/// Markers of an anti-bot interstitial served instead of the page
const CHALLENGE_MARKERS: [&str; 2] = ["Just a moment", "cf-challenge"];

impl HarvestClient {
    /// Lowest level function: waits for the rate limiter, then performs one request
    #[tracing::instrument(skip(self))]
    pub async fn query(&self, url: &str) -> Result<Fetched> {
        self.limiter.wait().await;

        let fetched = self.transport.get(url).await?;
        tracing::trace!(status = %fetched.status, len = fetched.body.len(), "fetched");

        Ok(fetched)
    }

    /// Shorthand for turning a non-successful response into the matching error
    fn successful_body(url: &str, fetched: Fetched) -> Result<String> {
        let status = fetched.status;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFoundError(url.to_owned()));
        }

        if !status.is_success() {
            let snippet: String = fetched.body.chars().take(200).collect();
            let snippet = snippet.replace('\n', " ");

            if status == StatusCode::FORBIDDEN {
                tracing::warn!("access denied for {url}, the source may be blocking this client: {snippet}");
            }

            return Err(Error::fetch(url, format!("server responded {status}")));
        }

        Ok(fetched.body)
    }

    /// Fetches one listing page. Pages past the last one come back empty instead of failing
    #[tracing::instrument(skip(self))]
    pub async fn fetch_listing_page(&self, page: u32) -> Result<Vec<ComicSummary>> {
        let url = self.layout.listing_url(page);
        let fetched = self.query(&url).await?;

        if fetched.status == StatusCode::NOT_FOUND {
            tracing::debug!("listing page {page} does not exist");
            return Ok(Vec::new());
        }

        let body = Self::successful_body(&url, fetched)?;
        let listing = self
            .decoder
            .decode_listing_page(&body)
            .map_err(|e| e.at_page(&url))?;

        match listing.last_page {
            Some(last) if page > last => {
                tracing::debug!("listing page {page} is past the last page {last}");
                Ok(Vec::new())
            }
            _ => Ok(listing.comics),
        }
    }

    /// Fetches the comic page addressed by a slug or a url. Chapter images are not fetched
    #[tracing::instrument(skip(self))]
    pub async fn fetch_comic_metadata(&self, comic: &str) -> Result<Comic> {
        let comic_ref = ComicRef::parse(comic, &self.layout)?;

        let fetched = self.query(&comic_ref.url).await?;
        let body = Self::successful_body(&comic_ref.url, fetched)?;

        let mut comic = self
            .decoder
            .decode_comic_page(&body)
            .map_err(|e| e.at_page(&comic_ref.url))?;

        comic.slug = comic_ref.slug;
        comic.url = Some(comic_ref.url);
        comic.scraped_at = Some(now());
        comic.normalize();

        Ok(comic)
    }

    /// Fetches a chapter page with its images. A chapter without images is a valid result
    #[tracing::instrument(skip(self))]
    pub async fn fetch_chapter_detail(&self, chapter_url: &str) -> Result<Chapter> {
        let fetched = self.query(chapter_url).await?;
        let body = Self::successful_body(chapter_url, fetched)?;

        let images = self
            .decoder
            .decode_chapter_page(&body)
            .map_err(|e| e.at_page(chapter_url))?;

        let chapter = Chapter {
            url: chapter_url.to_owned(),
            scraped_at: Some(now()),
            ..Default::default()
        };

        Ok(chapter.with_images(images))
    }

    /// The same as [`fetch_chapter_detail`](HarvestClient::fetch_chapter_detail), with the id,
    /// title and date taken from the comic's chapter list
    pub async fn fetch_chapter(&self, summary: &ChapterSummary) -> Result<Chapter> {
        let detail = self.fetch_chapter_detail(&summary.url).await?;

        Ok(Chapter {
            chapter: summary.chapter.clone(),
            title: summary.title.clone(),
            date: summary.date.clone(),
            ..detail
        })
    }

    /// Downloads raw image bytes
    #[tracing::instrument(skip(self))]
    pub async fn fetch_image(&self, url: &str) -> Result<Bytes> {
        self.limiter.wait().await;
        self.transport.get_bytes(url).await
    }

    /// Requests the home page once to establish a session before crawling.
    /// Returns whether the source answered normally
    #[tracing::instrument(skip(self))]
    pub async fn warm_up(&self) -> bool {
        let url = format!("{}/", self.layout.base_url());

        match self.query(&url).await {
            Ok(fetched) if fetched.status.is_success() => {
                tracing::info!("warm-up successful");
                true
            }
            Ok(fetched) => {
                tracing::warn!("warm-up returned status {}", fetched.status);
                if CHALLENGE_MARKERS
                    .iter()
                    .any(|marker| fetched.body.contains(marker))
                {
                    tracing::warn!("anti-bot challenge page detected");
                }
                false
            }
            Err(e) => {
                tracing::warn!("warm-up failed: {e}");
                false
            }
        }
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
