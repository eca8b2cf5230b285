//! Page decoders turn raw source pages into typed entities.
//!
//! The crawl and integrity code only sees [PageDecoder], so another source layout (or a test
//! double) can be plugged in without touching pagination or persistence.

use scraper::{ElementRef, Html, Selector};

use crate::requests::chapter::ChapterSummary;
use crate::requests::comic::{Comic, ComicSummary, ListingPage};
use crate::requests::query_utils::slug_from_url;
use crate::requests::{Error, Result};

/// Extraction of structured fields from one source's markup.
///
/// Shape failures are reported as [`Error::ParseError`]; the fetcher attaches the page url.
pub trait PageDecoder: Send + Sync {
    fn decode_listing_page(&self, body: &str) -> Result<ListingPage>;

    /// Decodes everything but `slug`, `url` and `scraped_at`, which the fetcher fills in
    fn decode_comic_page(&self, body: &str) -> Result<Comic>;

    /// Image urls in reading order
    fn decode_chapter_page(&self, body: &str) -> Result<Vec<String>>;
}

const COMIC_TYPES: [&str; 3] = ["Manga", "Manhwa", "Manhua"];
const TITLE_PREFIX: &str = "Komik ";

/// Decoder for the WordPress comic theme of the default source
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlDecoder;

#[inline]
fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::ParseError(format!("bad selector {sel_str}")))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_owned()
}

fn attr_of(el: ElementRef<'_>, name: &str) -> Option<String> {
    el.value()
        .attr(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn strip_title_prefix(title: &str) -> String {
    title.trim().replace(TITLE_PREFIX, "").trim().to_owned()
}

impl PageDecoder for HtmlDecoder {
    fn decode_listing_page(&self, body: &str) -> Result<ListingPage> {
        if body.trim().is_empty() {
            return Err(Error::ParseError("empty listing page".to_owned()));
        }

        let doc = Html::parse_document(body);

        let listing_selector = create_selector(".animepost, .listupd, .pagination")?;
        if doc.select(&listing_selector).next().is_none() {
            return Err(Error::ParseError("page has no listing markup".to_owned()));
        }

        let post_selector = create_selector(".animepost")?;
        let link_selector = create_selector("a[href]")?;
        let img_selector = create_selector("img")?;
        let type_selector = create_selector(".typeflag")?;
        let colored_selector = create_selector(".warnalabel")?;
        let rating_selector = create_selector(".rating i")?;
        let pagination_selector = create_selector(".pagination a.page-numbers")?;

        let mut comics = Vec::new();
        for post in doc.select(&post_selector) {
            let Some(link) = post.select(&link_selector).next() else {
                continue;
            };

            let url = attr_of(link, "href").unwrap_or_default();
            let Some(slug) = slug_from_url(&url) else {
                tracing::debug!("skipping listing entry without a usable link: {url:?}");
                continue;
            };

            let comic_type = post.select(&type_selector).next().and_then(|flag| {
                flag.value()
                    .classes()
                    .find(|class| COMIC_TYPES.contains(class))
                    .map(str::to_owned)
            });

            comics.push(ComicSummary {
                slug,
                title: strip_title_prefix(&attr_of(link, "title").unwrap_or_default()),
                url,
                cover_url: post
                    .select(&img_selector)
                    .next()
                    .and_then(|img| attr_of(img, "src")),
                comic_type,
                is_colored: post.select(&colored_selector).next().is_some(),
                rating: post
                    .select(&rating_selector)
                    .next()
                    .and_then(|el| text_of(el).parse().ok()),
            });
        }

        let last_page = doc
            .select(&pagination_selector)
            .filter_map(|a| text_of(a).parse::<u32>().ok())
            .max();

        Ok(ListingPage { comics, last_page })
    }

    fn decode_comic_page(&self, body: &str) -> Result<Comic> {
        let doc = Html::parse_document(body);

        let title_selector = create_selector(".entry-title")?;
        let info_selector = create_selector(".spe span")?;
        let link_selector = create_selector("a")?;
        let genre_selector = create_selector(".genre-info a")?;
        let thumb_selector = create_selector(".thumb img")?;
        let rating_selector = create_selector(".ratingmanga i[itemprop='ratingValue']")?;
        let synopsis_selector = create_selector(".entry-content-single p")?;
        let chapter_row_selector = create_selector(".eps_lst ul li")?;
        let chapter_link_selector = create_selector(".lchx a")?;
        let chapter_num_selector = create_selector("chapter")?;
        let chapter_date_selector = create_selector(".dt a")?;

        let Some(title) = doc.select(&title_selector).next() else {
            return Err(Error::ParseError("comic page has no title".to_owned()));
        };

        let mut comic = Comic {
            title: Some(strip_title_prefix(&text_of(title))),
            ..Default::default()
        };

        for span in doc.select(&info_selector) {
            let text = text_of(span);
            let value_after = |label: &str| text.replace(label, "").trim().to_owned();
            let first_link = || span.select(&link_selector).next().map(text_of);

            if text.contains("Judul Alternatif:") {
                comic.alternative_titles = Some(value_after("Judul Alternatif:"));
            } else if text.contains("Status:") {
                comic.status = Some(value_after("Status:"));
            } else if text.contains("Pengarang:") {
                comic.author = Some(value_after("Pengarang:"));
            } else if text.contains("Ilustrator:") {
                comic.illustrator = Some(value_after("Ilustrator:"));
            } else if text.contains("Grafis:") {
                comic.demographic = first_link();
            } else if text.contains("Tema:") {
                comic.themes = span.select(&link_selector).map(text_of).collect();
            } else if text.contains("Jenis Komik:") {
                comic.comic_type = first_link();
            }
        }

        comic.genres = doc.select(&genre_selector).map(text_of).collect();
        comic.cover_url = doc
            .select(&thumb_selector)
            .next()
            .and_then(|img| attr_of(img, "src"));
        comic.rating = doc
            .select(&rating_selector)
            .next()
            .and_then(|el| text_of(el).parse().ok());
        comic.synopsis = doc
            .select(&synopsis_selector)
            .next()
            .map(text_of)
            .filter(|synopsis| !synopsis.is_empty());

        for row in doc.select(&chapter_row_selector) {
            let Some(link) = row.select(&chapter_link_selector).next() else {
                continue;
            };

            let chapter = link
                .select(&chapter_num_selector)
                .next()
                .map(text_of)
                .filter(|num| !num.is_empty())
                .unwrap_or_else(|| text_of(link));

            comic.chapters.push(ChapterSummary {
                chapter,
                title: attr_of(link, "title").unwrap_or_default(),
                url: attr_of(link, "href").unwrap_or_default(),
                date: row
                    .select(&chapter_date_selector)
                    .next()
                    .map(text_of)
                    .unwrap_or_default(),
            });
        }

        comic.total_chapters = comic.chapters.len();

        Ok(comic)
    }

    fn decode_chapter_page(&self, body: &str) -> Result<Vec<String>> {
        let doc = Html::parse_document(body);

        let container_selector = create_selector("#chimg-auh")?;
        let img_selector = create_selector("img")?;

        let Some(container) = doc.select(&container_selector).next() else {
            return Err(Error::ParseError("chapter page has no image container".to_owned()));
        };

        let mut images: Vec<String> = Vec::new();
        for img in container.select(&img_selector) {
            if let Some(src) = attr_of(img, "src").or_else(|| attr_of(img, "data-src")) {
                if !images.contains(&src) {
                    images.push(src);
                }
            }
        }

        Ok(images)
    }
}
