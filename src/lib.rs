pub mod client;
pub mod common;
pub mod server;
pub mod store;
pub mod topology;

pub type Error = crate::common::error::MsError;
pub type Result<T> = std::result::Result<T, Error>;

/// Job identifier, assigned by the store at submission.
pub type JobId = i64;

pub type Map<K, V> = std::collections::HashMap<K, V>;
pub type Set<T> = std::collections::HashSet<T>;

pub const MS_VERSION: &str = env!("CARGO_PKG_VERSION");
