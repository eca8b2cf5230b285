use bon::Builder;
use serde::Deserialize;

use crate::codec::{decode_token, PrivacyCodec, TOKEN_PREFIX};
use crate::harvest::{Harvester, ScrapeOptions};
use crate::rate_limit::RateLimiter;
use crate::requests::query_utils::SourceLayout;
use crate::requests::{Error, HttpTransport, Result};
use crate::store::Store;
use crate::walker::{PageRange, Walker};
use crate::HarvestClient;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Base url of the tracked source, as a `b64:` token
pub const DEFAULT_SOURCE: &str = "b64:aHR0cHM6Ly9rb21pa2luZG8uY2g=";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_delay_secs() -> f64 {
    RateLimiter::DEFAULT_DELAY.as_secs_f64()
}

fn default_source_url() -> String {
    DEFAULT_SOURCE.to_owned()
}

fn default_start_page() -> u32 {
    1
}

fn default_workers() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_owned()
}

fn default_max_consecutive_failures() -> u32 {
    Walker::DEFAULT_MAX_CONSECUTIVE_FAILURES
}

fn default_true() -> bool {
    true
}

/// Everything a harvest run needs. Built from CLI flags or deserialized from a file
#[derive(Debug, Clone, PartialEq, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarvestConfig {
    /// Root of the snapshot
    #[builder(into, default = default_data_dir())]
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seconds between two requests
    #[builder(default = default_delay_secs())]
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,
    /// Base url of the source, plain or as a `b64:` token
    #[builder(into, default = default_source_url())]
    #[serde(default = "default_source_url")]
    pub source_url: String,
    #[builder(default = default_start_page())]
    #[serde(default = "default_start_page")]
    pub start_page: u32,
    /// Walk until the first empty page when absent
    #[serde(default)]
    pub end_page: Option<u32>,
    #[builder(default)]
    #[serde(default)]
    pub chapters: bool,
    #[builder(default)]
    #[serde(default)]
    pub images: bool,
    #[builder(default)]
    #[serde(default)]
    pub force: bool,
    #[builder(default = default_workers())]
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[builder(default = default_timeout_secs())]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[builder(into, default = default_user_agent())]
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[builder(default = default_max_consecutive_failures())]
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[builder(default = true)]
    #[serde(default = "default_true")]
    pub warm_up: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HarvestConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.delay_secs.is_finite() || self.delay_secs < 0.0 {
            return Err(Error::ConfigError(format!(
                "delay must be a non-negative number of seconds, got {}",
                self.delay_secs
            )));
        }

        if self.start_page == 0 {
            return Err(Error::ConfigError("pages are numbered from 1".into()));
        }

        if let Some(end) = self.end_page {
            if end < self.start_page {
                return Err(Error::ConfigError(format!(
                    "end page {end} is before start page {}",
                    self.start_page
                )));
            }
        }

        if self.workers == 0 {
            return Err(Error::ConfigError("at least one worker is needed".into()));
        }

        if self.timeout_secs == 0 {
            return Err(Error::ConfigError("timeout must be positive".into()));
        }

        Ok(())
    }

    /// Reads a config file. Missing fields take their defaults
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| Error::ConfigError(format!("{}: {e}", path.display())))?;
        config.validate()?;

        Ok(config)
    }

    /// Only meaningful on a validated config
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_secs).unwrap_or(RateLimiter::DEFAULT_DELAY)
    }

    /// Plain base url of the source
    pub fn source(&self) -> Result<String> {
        let source = self.source_url.trim();

        if source.starts_with(TOKEN_PREFIX) {
            decode_token(source)
        } else {
            Ok(source.to_owned())
        }
    }

    pub fn page_range(&self) -> PageRange {
        PageRange::new(self.start_page, self.end_page)
    }

    pub fn scrape_options(&self) -> ScrapeOptions {
        ScrapeOptions::builder()
            .chapters(self.chapters || self.images)
            .images(self.images)
            .force(self.force)
            .workers(self.workers)
            .range(self.page_range())
            .warm_up(self.warm_up)
            .max_consecutive_failures(self.max_consecutive_failures)
            .build()
    }

    /// HTTP client for the configured source
    pub fn client(&self) -> Result<HarvestClient> {
        self.validate()?;

        let layout = SourceLayout::new(&self.source()?)?;
        let transport =
            HttpTransport::new(&self.user_agent, Duration::from_secs(self.timeout_secs))?;

        Ok(HarvestClient::builder()
            .layout(layout)
            .transport(Arc::new(transport))
            .limiter(Arc::new(RateLimiter::new(self.delay())))
            .build())
    }

    pub async fn open_store(&self) -> Result<Store> {
        let codec = PrivacyCodec::for_source(&self.source()?)?;
        Store::open(self.data_dir.clone(), codec).await
    }

    /// Wires client and store into a [Harvester]
    pub async fn connect(&self) -> Result<Harvester> {
        let client = self.client()?;
        let store = self.open_store().await?;

        Ok(Harvester::builder()
            .client(client)
            .store(store)
            .options(self.scrape_options())
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarvestConfig::default();

        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.delay(), Duration::from_secs(1));
        assert_eq!(config.start_page, 1);
        assert_eq!(config.end_page, None);
        assert_eq!(config.workers, 1);
        assert_eq!(config.max_consecutive_failures, 3);
        assert!(config.warm_up);
        assert!(config.validate().is_ok());
        assert!(config.source().unwrap().starts_with("https://"));
    }

    #[test]
    fn test_deserialized_config_matches_builder() {
        let parsed: HarvestConfig = serde_json::from_str(
            r#"{"data_dir": "/tmp/snapshot", "delay_secs": 2.5, "end_page": 4, "images": true}"#,
        )
        .unwrap();

        let built = HarvestConfig::builder()
            .data_dir("/tmp/snapshot")
            .delay_secs(2.5)
            .end_page(4)
            .images(true)
            .build();

        assert_eq!(parsed, built);
        assert_eq!(parsed.delay(), Duration::from_millis(2500));

        let options = parsed.scrape_options();
        assert!(options.chapters);
        assert_eq!(options.range, PageRange::new(1, Some(4)));
    }

    #[test]
    fn test_invalid_configs() {
        let invalid = [
            HarvestConfig::builder().delay_secs(-1.0).build(),
            HarvestConfig::builder().delay_secs(f64::NAN).build(),
            HarvestConfig::builder().start_page(0).build(),
            HarvestConfig::builder().start_page(5).end_page(2).build(),
            HarvestConfig::builder().workers(0).build(),
        ];

        for config in invalid {
            assert!(
                matches!(config.validate(), Err(Error::ConfigError(_))),
                "{config:?} was accepted"
            );
        }
    }

    #[test]
    fn test_plain_source_is_used_as_is() {
        let config = HarvestConfig::builder()
            .source_url("https://comics.example")
            .build();

        assert_eq!(config.source().unwrap(), "https://comics.example");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<HarvestConfig>(r#"{"pages": 3}"#).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();

        let path = dir.path().join("harvest.json");
        std::fs::write(&path, r#"{"workers": 4, "images": true, "warm_up": false}"#).unwrap();

        let config = HarvestConfig::from_json_file(&path).unwrap();
        assert_eq!(config.workers, 4);
        assert!(!config.warm_up);
        assert_eq!(config.delay_secs, 1.0);
        assert!(config.scrape_options().chapters);

        let invalid = dir.path().join("invalid.json");
        std::fs::write(&invalid, r#"{"start_page": 0}"#).unwrap();
        assert!(matches!(
            HarvestConfig::from_json_file(&invalid),
            Err(Error::ConfigError(_))
        ));

        assert!(matches!(
            HarvestConfig::from_json_file(&dir.path().join("missing.json")),
            Err(Error::ConfigError(_))
        ));
    }
}
