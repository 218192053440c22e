//! Character personas that seed each conversation tree.

pub mod card;

pub use card::{Character, DEFAULT_SYSTEM_TEMPLATE};
