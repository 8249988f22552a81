#![forbid(unsafe_code)]

//! Core library for tubelib: a local playlist library with YouTube playlist
//! import.
//!
//! The pipeline is split along testable seams: URL validation ([`url`]),
//! metadata-tool invocation and NDJSON parsing ([`ytdlp`]), raw-field
//! normalization ([`normalize`]), persistence ([`library`]), and the import
//! state machine tying them together ([`import`]). Binaries share the
//! [`config`] and [`security`] helpers.

pub mod config;
pub mod error;
pub mod import;
pub mod library;
pub mod normalize;
pub mod security;
pub mod url;
pub mod ytdlp;
