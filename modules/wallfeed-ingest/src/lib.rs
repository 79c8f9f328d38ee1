pub mod engine;
pub mod enrichment;
pub mod error;
pub mod fetcher;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use engine::{IngestRequest, IngestSummary, Ingestor, PageOutcome, ReplaySummary, StopReason};
pub use enrichment::{EnrichmentPipeline, ModelHandle};
pub use error::{IngestError, Result};
pub use fetcher::{FetchError, FetchedPage, HttpFetcher, PageFetcher};
pub use orchestrator::{Orchestrator, PassOptions, PassSummary, SourceOrder};
pub use parser::{CandidatePost, PageParser, ParsedPage, VkWallParser};
