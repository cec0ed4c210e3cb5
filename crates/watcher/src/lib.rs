//! Resilient change watching for relocale
//!
//! This crate turns raw file system events into debounced retranslation
//! runs and keeps the loop alive under pressure:
//! - Debouncing with simple, adaptive and batch strategies
//! - Git-aware batching of bulk checkouts, pulls and rebases
//! - Error recovery with backoff and a circuit breaker
//! - Graceful degradation and admission control
//! - Bounded graceful shutdown

pub mod debounce;
pub mod degradation;
pub mod feedback;
pub mod git;
pub mod monitor;
pub mod optimizer;
pub mod orchestrator;
pub mod patterns;
pub mod pipeline;
pub mod recovery;
pub mod resources;
pub mod schedule;
pub mod shutdown;
pub mod source;

pub use debounce::{DebounceController, DebounceStatistics, FnHandler, RetranslationHandler};
pub use degradation::{DegradationLevel, DegradationManager, FeatureFlag};
pub use feedback::{Feedback, FeedbackSettings, RetranslationResult, TracingFeedback, TranslationProgress};
pub use git::{FsGitProbe, GitAwareness, VcsProbe};
pub use monitor::{HostSampler, MetricsSource, PerformanceMonitor, SystemMetrics};
pub use optimizer::PerformanceOptimizer;
pub use orchestrator::{WatchOptions, WatchOrchestrator, WatchPhase, WatchStatus};
pub use patterns::{PatternResolver, ResolvedPatterns, WatchFilter};
pub use pipeline::{ExecutionReport, RetranslationPipeline, RunContext, Task, TaskOutcome};
pub use recovery::{ErrorContext, ErrorRecoveryManager, RecoverableError, RecoveryResult};
pub use resources::{ResourceError, ResourceManager};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, Shutdownable};
pub use source::{NotifySource, SourceEvent};
