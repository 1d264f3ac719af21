//! Stage executors for the daycare-record enrichment pipeline.
//!
//! Each stage implements `StageExecutor` from `recordflow-orchestration`:
//! directory lookup (`places`), model-backed research and finalization,
//! website scraping, and the durable sink. Executors classify their own
//! failures as transient or permanent; retries, dedup and scheduling happen
//! in the orchestrator.

pub mod artifact;
pub mod fingerprint;
pub mod finalize;
pub mod genai;
pub mod http;
pub mod ingest;
pub mod places;
pub mod research;
pub mod scrape;
pub mod sink;

pub use artifact::ArtifactStore;
pub use finalize::FinalizeStage;
pub use genai::{GenAiClient, GenAiConfig};
pub use ingest::load_records_jsonl;
pub use places::{PlacesConfig, PlacesStage};
pub use research::ResearchStage;
pub use scrape::ScrapeStage;
pub use sink::{init_sink_schema, SinkStage};
