// TODO: resume an interrupted unbounded walk from the last completed page instead of page 1

pub mod codec;
pub mod config;
pub mod decoder;
pub mod harvest;
pub mod integrity;
pub mod rate_limit;
pub mod requests;
pub mod store;
pub mod walker;

pub use codec::PrivacyCodec;
pub use config::HarvestConfig;
pub use decoder::{HtmlDecoder, PageDecoder};
pub use harvest::{ChapterTally, ComicOutcome, CrawlReport, Harvester, ImageSink, ScrapeOptions};
pub use integrity::{ChapterDiscrepancy, DiscrepancyKind, IntegrityChecker};
pub use rate_limit::RateLimiter;
pub use requests::{Error, Result};
pub use store::Store;
pub use walker::{ListedComic, PageFailure, PageRange, Walker};

use requests::query_utils::SourceLayout;
use requests::Transport;

use bon::bon;

use std::sync::Arc;

/// Entity fetcher: every request goes through the shared [RateLimiter], every page through the
/// [PageDecoder]
#[derive(Clone)]
pub struct HarvestClient {
    layout: SourceLayout,
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn PageDecoder>,
    limiter: Arc<RateLimiter>,
}

#[bon]
impl HarvestClient {
    #[builder]
    pub fn new(
        layout: SourceLayout,
        transport: Arc<dyn Transport>,
        #[builder(default = Arc::new(HtmlDecoder) as Arc<dyn PageDecoder>)] decoder: Arc<dyn PageDecoder>,
        #[builder(default = Arc::new(RateLimiter::default()))] limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            layout,
            transport,
            decoder,
            limiter,
        }
    }

    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl std::fmt::Debug for HarvestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestClient")
            .field("layout", &self.layout)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
