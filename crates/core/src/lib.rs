//! Core types for relocale
//!
//! This crate provides the pieces shared by every watch component:
//! - Change events, per-path pending sets and emitted batches
//! - Layered watch configuration with validation
//! - A TTL cache with count and byte-size eviction
//! - The runtime error taxonomy
//! - BLAKE3 digests for cache keys

pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod event;

pub use cache::{Cache, CacheConfig, CacheStatistics, EntryMetadata};
pub use config::{
    load_config_file, load_configuration, merge_with_defaults, AdaptiveTuning, ConfigValidation,
    DebounceConfig, DebounceStrategy, GitConfig, LoadedConfig, LogLevel, MonitoringConfig,
    PatternConfig, PerformanceConfig, ResilienceConfig, StrategyKind, WatchConfiguration,
    WatchOverrides,
};
pub use digest::{digest_bytes, digest_strings, Digest};
pub use error::{CacheError, ConfigError, ErrorKind, WatchError};
pub use event::{
    dedup_latest, now_ms, BatchPriority, ChangeKind, FileChangeBatch, FileChangeEvent, FileStat,
    GitOperation, GitOperationInfo, PendingChangeSet,
};
