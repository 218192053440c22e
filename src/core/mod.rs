pub mod app;
pub mod builtin_providers;
pub mod chat_stream;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod prompt_format;
pub mod providers;
pub mod retry;
pub mod tree;
pub mod tree_store;
