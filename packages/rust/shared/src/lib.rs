//! Shared types, error model, and configuration for inboxmirror.
//!
//! This crate is the foundation depended on by all other inboxmirror crates.
//! It provides:
//! - [`MirrorError`], the unified error type
//! - Domain types ([`TargetRecord`], [`RawSnapshot`], [`RawMessage`], [`JobPhase`])
//! - Configuration ([`AppConfig`], config loading, credential resolution)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, Credentials, JobsConfig, SelectorConfig, ServerConfig, SessionConfig,
    SourceConfig, StorageConfig, config_dir, config_file_path, expand_path, init_config,
    load_config, load_config_from, resolve_credentials, validate_config,
};
pub use error::{MirrorError, Result};
pub use types::{
    Direction, DisplayMetadata, JobPhase, MessageChannel, MessageKey, MessageRecord, RawMessage,
    RawSnapshot, TargetId, TargetRecord, TargetStatus,
};
