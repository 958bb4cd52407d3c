//! Illustration job engine: generator backends, artifact cache, retry
//! policy, rate limiting, scheduling and the job orchestrator.

pub mod backends;
pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use backends::{default_registry, GenerateCall, GeneratedImage, GeneratorRegistry, ImageGenerator};
pub use cache::{ArtifactCache, CacheEntry};
pub use config::EngineConfig;
pub use error::{GenerationError, JobError};
pub use orchestrator::Orchestrator;
pub use rate_limit::{RateLimiters, TokenBucket};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, TaskRunner};
pub use storage::{FsObjectStore, JsonMetadataStore, MetadataStore, ObjectStore};
