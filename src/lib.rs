//! Parley keeps branching, per-character conversations and streams replies
//! from several LLM providers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation tree, context budgeting, provider
//!   adapters and registry, retry policy, and streaming sessions. Its
//!   [`core::app::ChatService`] is the surface front ends call.
//! - [`api`] defines the provider-neutral request/response types and the wire
//!   payloads of each provider dialect.
//! - [`character`] holds the personas that seed each conversation.
//! - [`cli`] is a thin command-line front end over [`core::app`].
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod character;
pub mod cli;
pub mod core;
pub mod utils;
