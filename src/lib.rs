//! Streaming chat relay.
//!
//! Exposes one continuous answer stream per chat request while transparently
//! continuing completions that the provider cut off at its token budget.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod paths;
pub mod provider;
pub mod relay;
pub mod server;
pub mod usage;
