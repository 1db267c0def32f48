//! Small utilities: id generation and process helpers.

pub mod exec;
pub mod id;

pub use exec::{output_with_timeout, spawn_detached};
pub use id::uuid_v4;
