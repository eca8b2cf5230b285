#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use comic_harvest::requests::chapter::{Chapter, ChapterSummary};
use comic_harvest::requests::comic::{Comic, ComicSummary, ListingPage};
use comic_harvest::requests::query_utils::SourceLayout;
use comic_harvest::requests::{Error, Fetched, Result, Transport};
use comic_harvest::{HarvestClient, HtmlDecoder, PageDecoder, PrivacyCodec, RateLimiter, Store};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use tempfile::TempDir;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const BASE: &str = "https://comics.example";
pub const DOMAIN: &str = "comics.example";

/// In-memory source. Unknown urls answer 404
#[derive(Debug, Default)]
pub struct FakeSite {
    pages: Mutex<HashMap<String, (StatusCode, String)>>,
    images: Mutex<HashMap<String, Bytes>>,
    hits: Mutex<Vec<String>>,
}

impl FakeSite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve_json<T: Serialize>(&self, url: &str, value: &T) {
        let body = serde_json::to_string(value).unwrap();
        self.pages
            .lock()
            .insert(url.to_owned(), (StatusCode::OK, body));
    }

    pub fn serve_html(&self, url: &str, body: &str) {
        self.pages
            .lock()
            .insert(url.to_owned(), (StatusCode::OK, body.to_owned()));
    }

    pub fn serve_status(&self, url: &str, status: StatusCode) {
        self.pages
            .lock()
            .insert(url.to_owned(), (status, "<html>oops</html>".to_owned()));
    }

    pub fn serve_listing(&self, page: u32, slugs: &[&str]) {
        let listing = ListingPage {
            comics: slugs.iter().map(|slug| listed(slug)).collect(),
            last_page: None,
        };
        self.serve_json(&layout().listing_url(page), &listing);
    }

    pub fn serve_comic(&self, comic: &Comic) {
        self.serve_json(&layout().comic_url(&comic.slug), comic);
    }

    pub fn serve_chapter(&self, url: &str, images: &[String]) {
        self.serve_json(url, &images);
    }

    pub fn serve_image(&self, url: &str, bytes: &'static [u8]) {
        self.images
            .lock()
            .insert(url.to_owned(), Bytes::from_static(bytes));
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().clone()
    }

    pub fn hit_count(&self, url: &str) -> usize {
        self.hits.lock().iter().filter(|hit| *hit == url).count()
    }
}

#[async_trait]
impl Transport for FakeSite {
    async fn get(&self, url: &str) -> Result<Fetched> {
        self.hits.lock().push(url.to_owned());

        let (status, body) = self
            .pages
            .lock()
            .get(url)
            .cloned()
            .unwrap_or((StatusCode::NOT_FOUND, String::new()));

        Ok(Fetched { status, body })
    }

    async fn get_bytes(&self, url: &str) -> Result<Bytes> {
        self.hits.lock().push(url.to_owned());

        self.images
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::NotFoundError(url.to_owned()))
    }
}

/// Pages of the fake site are the JSON form of what a decoder returns
#[derive(Debug, Clone, Copy)]
pub struct JsonDecoder;

fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::ParseError(e.to_string()))
}

impl PageDecoder for JsonDecoder {
    fn decode_listing_page(&self, body: &str) -> Result<ListingPage> {
        parse(body)
    }

    fn decode_comic_page(&self, body: &str) -> Result<Comic> {
        parse(body)
    }

    fn decode_chapter_page(&self, body: &str) -> Result<Vec<String>> {
        parse(body)
    }
}

pub fn layout() -> SourceLayout {
    SourceLayout::new(BASE).unwrap()
}

pub fn client_with_delay(site: &Arc<FakeSite>, delay: Duration) -> HarvestClient {
    HarvestClient::builder()
        .layout(layout())
        .transport(Arc::clone(site) as Arc<dyn Transport>)
        .decoder(Arc::new(JsonDecoder))
        .limiter(Arc::new(RateLimiter::new(delay)))
        .build()
}

pub fn client(site: &Arc<FakeSite>) -> HarvestClient {
    client_with_delay(site, Duration::ZERO)
}

/// Client that decodes the fake site's pages as source markup
pub fn html_client(site: &Arc<FakeSite>) -> HarvestClient {
    HarvestClient::builder()
        .layout(layout())
        .transport(Arc::clone(site) as Arc<dyn Transport>)
        .decoder(Arc::new(HtmlDecoder))
        .limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
        .build()
}

/// Listing page markup with one entry per slug
pub fn listing_html(slugs: &[&str]) -> String {
    let posts: String = slugs
        .iter()
        .map(|slug| {
            format!(
                r#"<div class="animepost"><a href="{}" title="Komik {slug}"></a></div>"#,
                layout().comic_url(slug)
            )
        })
        .collect();

    format!(r#"<html><body><div class="listupd">{posts}</div></body></html>"#)
}

pub async fn temp_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), PrivacyCodec::new(DOMAIN))
        .await
        .unwrap();
    (dir, store)
}

pub fn listed(slug: &str) -> ComicSummary {
    ComicSummary {
        slug: slug.to_owned(),
        title: format!("Listed {slug}"),
        url: layout().comic_url(slug),
        cover_url: Some(format!("https://cdn.example/{slug}/cover.jpg")),
        comic_type: Some("Manhwa".to_owned()),
        is_colored: true,
        rating: Some(7.0),
    }
}

pub fn chapter_url(slug: &str, id: &str) -> String {
    format!("{BASE}/{slug}-chapter-{id}/")
}

pub fn chapter_summary(slug: &str, id: &str) -> ChapterSummary {
    ChapterSummary {
        chapter: id.to_owned(),
        title: format!("Chapter {id}"),
        url: chapter_url(slug, id),
        date: "3 days ago".to_owned(),
    }
}

/// Comic page as the source shows it
pub fn live_comic(slug: &str, chapter_ids: &[&str]) -> Comic {
    Comic {
        slug: slug.to_owned(),
        title: Some(format!("Comic {slug}")),
        status: Some("Ongoing".to_owned()),
        genres: vec!["Action".to_owned()],
        chapters: chapter_ids
            .iter()
            .map(|id| chapter_summary(slug, id))
            .collect(),
        ..Default::default()
    }
}

pub fn images(slug: &str, id: &str, count: usize) -> Vec<String> {
    (1..=count)
        .map(|n| format!("https://cdn.example/{slug}/{id}/{n:02}.jpg"))
        .collect()
}

/// Stores `slug` with one scraped chapter record per `(id, image count)`
pub async fn seed(store: &Store, slug: &str, chapters: &[(&str, usize)]) {
    let ids: Vec<&str> = chapters.iter().map(|(id, _)| *id).collect();
    let mut comic = live_comic(slug, &ids);
    comic.url = Some(layout().comic_url(slug));

    let stored = store.upsert_comic(comic).await.unwrap();
    store
        .upsert_index_entry((&stored).into())
        .await
        .unwrap();

    for (id, count) in chapters {
        let chapter =
            Chapter::from_summary(&chapter_summary(slug, id)).with_images(images(slug, id, *count));
        store.upsert_chapter(slug, chapter).await.unwrap();
    }
}
