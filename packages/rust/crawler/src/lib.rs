//! Access to the chat source: capabilities, session handling, and the
//! reference HTTP implementation.
//!
//! This crate provides:
//! - [`SourceBrowser`] and [`Extractor`], the capabilities the pipeline consumes
//! - [`SessionManager`], the single shared authenticated session
//! - [`HttpSource`], a cookie-session client implementing both capabilities
//! - [`extract`], selector-driven page parsing

pub mod extract;
pub mod http;
pub mod session;
pub mod source;

pub use extract::{CompiledSelectors, MessageClock};
pub use http::HttpSource;
pub use session::SessionManager;
pub use source::{Extractor, LoginState, SessionArtifact, SourceBrowser, StoredCookie};
