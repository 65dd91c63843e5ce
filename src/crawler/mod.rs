pub mod buffer;
pub mod controller;
pub mod fetcher;
pub mod orchestrator;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use buffer::ResultBuffer;
pub use controller::{CrawlLoop, LoopReport};
pub use fetcher::{FetchError, Fetcher};
pub use orchestrator::{InstanceOutcome, Orchestrator, RoundReport};
pub use scheduler::FetchQueue;
pub use task::{ExtractionRecord, FetchTarget, LayoutDiagnostic};
