//! Indicator OCR - multi-backend OCR orchestration for note attachments.
//!
//! Image attachments are fanned out to every ready OCR backend, recognized
//! text is turned into security indicators, and results are cached per
//! (attachment, backend) for the session.

pub mod cache;
pub mod config;
pub mod events;
pub mod indicators;
pub mod ocr;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod task;

pub use cache::ResultCache;
pub use events::OcrEvent;
pub use indicators::{Indicator, IndicatorExtractor, PatternExtractor};
pub use ocr::{OcrBackend, OcrError, OcrInput, ProgressReporter};
pub use orchestrator::{BatchState, Orchestrator, OrchestratorBuilder};
pub use store::{FsImageStore, ImageStore, ReadError};
pub use task::{ProgressAggregate, Task, TaskId, TaskStatus};
