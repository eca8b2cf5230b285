//! On-disk snapshot: `index.json`, `comics/{slug}/metadata.json` and
//! `comics/{slug}/chapters/chapter-{id}.json`.
//!
//! Writes are atomic (temporary file + rename) and merge-based, so a reader never sees a
//! truncated file and re-scraping the same comic is idempotent.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;

use crate::codec::PrivacyCodec;
use crate::requests::chapter::{chapter_file_name, Chapter};
use crate::requests::comic::{Comic, Index, IndexEntry};
use crate::requests::query_utils::is_valid_slug;
use crate::requests::{Error, Result};

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// First half of an atomic write: the bytes are durable in a temporary sibling of the target,
/// but readers of the target still see the previous version until [`commit`](StagedWrite::commit)
#[derive(Debug)]
pub struct StagedWrite {
    tmp: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    pub async fn stage(target: &Path, bytes: &[u8]) -> Result<Self> {
        let (Some(dir), Some(file_name)) = (target.parent(), target.file_name()) else {
            return Err(Error::persistence(
                target,
                std::io::Error::new(ErrorKind::InvalidInput, "target has no file name"),
            ));
        };

        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::persistence(dir, e))?;

        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            file_name.to_string_lossy(),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = write_synced(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::persistence(&tmp, e));
        }

        Ok(Self {
            tmp,
            target: target.to_owned(),
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    /// Atomically replaces the target with the staged bytes
    pub async fn commit(self) -> Result<()> {
        if let Err(e) = fs::rename(&self.tmp, &self.target).await {
            let _ = fs::remove_file(&self.tmp).await;
            return Err(Error::persistence(&self.target, e));
        }

        Ok(())
    }

    pub async fn discard(self) -> Result<()> {
        fs::remove_file(&self.tmp)
            .await
            .map_err(|e| Error::persistence(&self.tmp, e))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Writes `bytes` to `target` so that readers see either the old or the new contents
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    StagedWrite::stage(target, bytes).await?.commit().await
}

fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::IoError(e)),
    }
}

/// Handle to one snapshot directory. Cheap to clone; clones share the write locks
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    codec: PrivacyCodec,
    slug_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    index_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    pub const INDEX_FILE: &'static str = "index.json";
    pub const COMICS_DIR: &'static str = "comics";
    pub const METADATA_FILE: &'static str = "metadata.json";
    pub const CHAPTERS_DIR: &'static str = "chapters";

    #[tracing::instrument(skip(codec))]
    pub async fn open(root: impl Into<PathBuf> + std::fmt::Debug, codec: PrivacyCodec) -> Result<Self> {
        let root = root.into();
        let comics_dir = root.join(Self::COMICS_DIR);

        fs::create_dir_all(&comics_dir)
            .await
            .map_err(|e| Error::persistence(&comics_dir, e))?;

        Ok(Self {
            root,
            codec,
            slug_locks: Arc::default(),
            index_lock: Arc::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &PrivacyCodec {
        &self.codec
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(Self::INDEX_FILE)
    }

    pub fn comic_dir(&self, slug: &str) -> PathBuf {
        self.root.join(Self::COMICS_DIR).join(slug)
    }

    pub fn metadata_path(&self, slug: &str) -> PathBuf {
        self.comic_dir(slug).join(Self::METADATA_FILE)
    }

    pub fn chapter_path(&self, slug: &str, chapter: &str) -> PathBuf {
        self.comic_dir(slug)
            .join(Self::CHAPTERS_DIR)
            .join(chapter_file_name(chapter))
    }

    fn check_slug(slug: &str) -> Result<()> {
        if is_valid_slug(slug) {
            Ok(())
        } else {
            Err(Error::InvalidReference(slug.to_owned()))
        }
    }

    fn slug_lock(&self, slug: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.slug_locks.lock();
        Arc::clone(locks.entry(slug.to_owned()).or_default())
    }

    pub async fn load_index(&self) -> Result<Index> {
        Ok(read_json(&self.index_path()).await?.unwrap_or_default())
    }

    /// Inserts or replaces the index entry of `entry.slug`. The comic record must exist
    #[tracing::instrument(skip(self, entry), fields(slug = %entry.slug))]
    pub async fn upsert_index_entry(&self, entry: IndexEntry) -> Result<()> {
        Self::check_slug(&entry.slug)?;

        if !self.has_comic(&entry.slug).await {
            return Err(Error::NotFoundError(format!(
                "{} (no stored comic record)",
                entry.slug
            )));
        }

        let _guard = self.index_lock.lock().await;

        let mut index = self.load_index().await?;
        index.upsert(entry);

        write_atomic(&self.index_path(), &to_json_bytes(&index)?).await
    }

    pub async fn has_comic(&self, slug: &str) -> bool {
        is_valid_slug(slug) && fs::try_exists(self.metadata_path(slug)).await.unwrap_or(false)
    }

    /// Reads a comic record with its urls decoded
    #[tracing::instrument(skip(self))]
    pub async fn load_comic(&self, slug: &str) -> Result<Option<Comic>> {
        Self::check_slug(slug)?;

        match read_json::<Comic>(&self.metadata_path(slug)).await? {
            Some(comic) => Ok(Some(comic.map_urls(|url| self.codec.reveal(url))?)),
            None => Ok(None),
        }
    }

    /// Merges `comic` into the stored record of the same slug and returns the merged record.
    ///
    /// The merge runs on encoded urls, so an unreadable token in an old chapter entry never
    /// blocks a write; such a token is returned as stored. A record that is not valid JSON
    /// is replaced.
    #[tracing::instrument(skip(self, comic), fields(slug = %comic.slug))]
    pub async fn upsert_comic(&self, comic: Comic) -> Result<Comic> {
        Self::check_slug(&comic.slug)?;

        let lock = self.slug_lock(&comic.slug);
        let _guard = lock.lock().await;

        let path = self.metadata_path(&comic.slug);
        let mut incoming = comic.map_urls(|url| Ok(self.codec.encode(url)))?;
        incoming.normalize();

        let existing = match read_json::<Comic>(&path).await {
            Ok(existing) => existing,
            Err(Error::JsonError(e)) => {
                tracing::warn!("replacing unreadable comic record: {e}");
                None
            }
            Err(Error::IoError(e)) => return Err(Error::persistence(&path, e)),
            Err(e) => return Err(e),
        };

        let merged = match existing {
            Some(existing) => existing.merge(incoming),
            None => incoming,
        };

        write_atomic(&path, &to_json_bytes(&merged)?).await?;
        tracing::debug!(total_chapters = merged.total_chapters, "comic stored");

        merged.map_urls(|url| Ok(self.codec.reveal(url).unwrap_or_else(|_| url.to_owned())))
    }

    /// Reads one chapter record with its urls decoded
    pub async fn load_chapter(&self, slug: &str, chapter: &str) -> Result<Option<Chapter>> {
        Self::check_slug(slug)?;

        match read_json::<Chapter>(&self.chapter_path(slug, chapter)).await? {
            Some(stored) => Ok(Some(stored.map_urls(|url| self.codec.reveal(url))?)),
            None => Ok(None),
        }
    }

    /// Writes or replaces exactly one chapter record.
    ///
    /// Ids that map to the same file name, like `1.5` and `1-5`, cannot both be stored: writing
    /// one over a stored record of the other is refused.
    #[tracing::instrument(skip(self, chapter), fields(chapter = %chapter.chapter))]
    pub async fn upsert_chapter(&self, slug: &str, chapter: Chapter) -> Result<()> {
        Self::check_slug(slug)?;

        if chapter.chapter.trim().is_empty() {
            return Err(Error::InvalidReference(format!("{slug}: chapter without id")));
        }

        let lock = self.slug_lock(slug);
        let _guard = lock.lock().await;

        let path = self.chapter_path(slug, &chapter.chapter);

        if let Ok(Some(stored)) = read_json::<Chapter>(&path).await {
            if stored.chapter.trim() != chapter.chapter.trim() {
                return Err(Error::InvalidReference(format!(
                    "{slug}: chapter {:?} would overwrite chapter {:?} in {}",
                    chapter.chapter,
                    stored.chapter,
                    path.display()
                )));
            }
        }
        let encoded = chapter.map_urls(|url| Ok(self.codec.encode(url)))?;

        write_atomic(&path, &to_json_bytes(&encoded)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::chapter::ChapterSummary;

    use tempfile::TempDir;

    async fn create_temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), PrivacyCodec::new("comics.example"))
            .await
            .unwrap();
        (dir, store)
    }

    fn summary(id: &str, title: &str) -> ChapterSummary {
        ChapterSummary {
            chapter: id.to_owned(),
            title: title.to_owned(),
            url: format!("https://comics.example/x-chapter-{id}/"),
            date: "1 week ago".to_owned(),
        }
    }

    fn comic(chapters: Vec<ChapterSummary>) -> Comic {
        Comic {
            slug: "x".into(),
            url: Some("https://comics.example/komik/x/".into()),
            title: Some("X".into()),
            cover_url: Some("https://cdn.example/x.jpg".into()),
            genres: vec!["Action".into()],
            total_chapters: chapters.len(),
            chapters,
            scraped_at: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_comic_is_idempotent() {
        let (_dir, store) = create_temp_store().await;
        let input = comic(vec![summary("1", "one"), summary("2", "two")]);

        store.upsert_comic(input.clone()).await.unwrap();
        let first = std::fs::read(store.metadata_path("x")).unwrap();

        store.upsert_comic(input).await.unwrap();
        let second = std::fs::read(store.metadata_path("x")).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_merge_preserves_history() {
        let (_dir, store) = create_temp_store().await;

        store
            .upsert_comic(comic(vec![summary("1", "one"), summary("2", "two")]))
            .await
            .unwrap();
        let returned = store
            .upsert_comic(comic(vec![summary("2", "two, fixed"), summary("3", "three")]))
            .await
            .unwrap();

        let stored = store.load_comic("x").await.unwrap().unwrap();
        let ids: Vec<_> = stored.chapters.iter().map(|c| c.chapter.as_str()).collect();

        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(stored.chapters[1].title, "two, fixed");
        assert_eq!(stored.total_chapters, 3);
        assert_eq!(returned, stored);
    }

    #[tokio::test]
    async fn test_source_urls_are_encoded_on_disk() {
        let (_dir, store) = create_temp_store().await;

        store
            .upsert_comic(comic(vec![summary("1", "one")]))
            .await
            .unwrap();
        store
            .upsert_chapter(
                "x",
                Chapter::from_summary(&summary("1", "one"))
                    .with_images(vec!["https://cdn.example/1.jpg".into()]),
            )
            .await
            .unwrap();

        let metadata = std::fs::read_to_string(store.metadata_path("x")).unwrap();
        assert!(!metadata.contains("comics.example"));
        assert!(metadata.contains("\"url\": \"b64:"));
        assert!(metadata.contains("https://cdn.example/x.jpg"));

        let chapter = std::fs::read_to_string(store.chapter_path("x", "1")).unwrap();
        assert!(!chapter.contains("comics.example"));
        assert!(chapter.contains("https://cdn.example/1.jpg"));

        let loaded = store.load_chapter("x", "1").await.unwrap().unwrap();
        assert_eq!(loaded.url, "https://comics.example/x-chapter-1/");
        assert_eq!(loaded.total_images, Some(1));

        let loaded = store.load_comic("x").await.unwrap().unwrap();
        assert_eq!(loaded.url.as_deref(), Some("https://comics.example/komik/x/"));
    }

    #[tokio::test]
    async fn test_chapters_are_independent() {
        let (_dir, store) = create_temp_store().await;

        store
            .upsert_chapter("x", Chapter::from_summary(&summary("1", "one")))
            .await
            .unwrap();
        store
            .upsert_chapter("x", Chapter::from_summary(&summary("1.5", "one and a half")))
            .await
            .unwrap();
        store
            .upsert_chapter("x", Chapter::from_summary(&summary("1", "one again")))
            .await
            .unwrap();

        let one = store.load_chapter("x", "1").await.unwrap().unwrap();
        let half = store.load_chapter("x", "1.5").await.unwrap().unwrap();

        assert_eq!(one.title, "one again");
        assert_eq!(half.title, "one and a half");
        assert!(store.chapter_path("x", "1.5").ends_with("chapter-1-5.json"));
        assert!(store.load_chapter("x", "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_write_leaves_previous_version() {
        let (dir, _store) = create_temp_store().await;
        let target = dir.path().join("comics/x/metadata.json");

        write_atomic(&target, b"old\n").await.unwrap();

        let staged = StagedWrite::stage(&target, b"new\n").await.unwrap();
        assert_eq!(std::fs::read(staged.temp_path()).unwrap(), b"new\n");
        // crash here: the rename never happens
        assert_eq!(std::fs::read(&target).unwrap(), b"old\n");

        staged.commit().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new\n");
    }

    #[tokio::test]
    async fn test_uncommitted_first_write_leaves_nothing() {
        let (dir, store) = create_temp_store().await;
        let target = store.metadata_path("fresh");

        let staged = StagedWrite::stage(&target, b"{}").await.unwrap();

        assert!(!target.exists());
        assert!(store.load_comic("fresh").await.unwrap().is_none());

        staged.discard().await.unwrap();
        let leftovers = std::fs::read_dir(dir.path().join("comics/fresh"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_rename_is_a_persistence_error_and_leaves_no_temp_file() {
        let (dir, _store) = create_temp_store().await;

        // a non-empty directory cannot be replaced by a file
        let target = dir.path().join("comics/x/metadata.json");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        let res = write_atomic(&target, b"{}\n").await;
        assert!(matches!(res, Err(Error::PersistenceError { .. })));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("comics/x"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, [std::ffi::OsString::from("metadata.json")]);
        assert!(target.join("occupied").is_dir());
    }

    #[tokio::test]
    async fn test_unwritable_record_is_a_persistence_error() {
        let (_dir, store) = create_temp_store().await;

        let metadata = store.metadata_path("x");
        std::fs::create_dir_all(metadata.join("occupied")).unwrap();

        let res = store.upsert_comic(comic(vec![summary("1", "one")])).await;
        assert!(matches!(res, Err(Error::PersistenceError { .. })));

        let entries: Vec<_> = std::fs::read_dir(store.comic_dir("x"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, [std::ffi::OsString::from("metadata.json")]);

        // an unrelated upsert still goes through
        let mut other = comic(vec![summary("1", "one")]);
        other.slug = "y".into();
        store.upsert_comic(other).await.unwrap();
        assert!(store.has_comic("y").await);
    }

    #[tokio::test]
    async fn test_truncated_record_is_replaced() {
        let (_dir, store) = create_temp_store().await;

        let path = store.metadata_path("x");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"slug": "x", "chap"#).unwrap();

        let stored = store
            .upsert_comic(comic(vec![summary("1", "one")]))
            .await
            .unwrap();

        assert_eq!(stored.total_chapters, 1);
        assert_eq!(store.load_comic("x").await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn test_colliding_chapter_ids_are_refused() {
        let (_dir, store) = create_temp_store().await;

        store
            .upsert_chapter("x", Chapter::from_summary(&summary("1.5", "one and a half")))
            .await
            .unwrap();

        let res = store
            .upsert_chapter("x", Chapter::from_summary(&summary("1-5", "one dash five")))
            .await;
        assert!(matches!(res, Err(Error::InvalidReference(_))));

        let kept = store.load_chapter("x", "1.5").await.unwrap().unwrap();
        assert_eq!(kept.chapter, "1.5");
        assert_eq!(kept.title, "one and a half");
    }

    #[tokio::test]
    async fn test_index_entries_are_unique_and_need_a_record() {
        let (_dir, store) = create_temp_store().await;

        let missing = store
            .upsert_index_entry(IndexEntry {
                slug: "x".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(missing, Err(Error::NotFoundError(_))));

        let stored = store
            .upsert_comic(comic(vec![summary("1", "one")]))
            .await
            .unwrap();
        let entry = IndexEntry::from(&stored);
        store.upsert_index_entry(entry.clone()).await.unwrap();
        store.upsert_index_entry(entry).await.unwrap();

        let index = store.load_index().await.unwrap();
        assert_eq!(index.total_comics, 1);
        assert_eq!(index.comics["x"].title, "X");
        assert_eq!(index.comics["x"].total_chapters, 1);
    }

    #[tokio::test]
    async fn test_invalid_slugs_are_rejected() {
        let (_dir, store) = create_temp_store().await;

        let mut bad = comic(Vec::new());
        bad.slug = "../escape".into();

        assert!(matches!(
            store.upsert_comic(bad).await,
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            store.load_comic("a/b").await,
            Err(Error::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_token_is_a_decode_error() {
        let (_dir, store) = create_temp_store().await;

        let path = store.chapter_path("x", "1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"chapter": "1", "url": "b64:%%%"}"#).unwrap();

        assert!(matches!(
            store.load_chapter("x", "1").await,
            Err(Error::DecodeError { .. })
        ));
    }
}
