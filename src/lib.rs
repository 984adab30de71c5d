//! StreamVault - a Telegram archive channel served as seekable HTTP streams
//!
//! A bot ingests uploaded media (or short-video URLs fetched on behalf of
//! users) into a private archive channel and indexes it in MongoDB; an
//! HTTP server streams the archived bytes back out with full byte-range
//! support, pulling 1 MiB chunks from Telegram on demand. No payload
//! bytes touch the local disk.

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod range;
pub mod server;
pub mod stream;
pub mod upstream;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::{ArchivedFile, FileRepo};
    pub use crate::error::{Error, Result};
    pub use crate::upstream::Upstream;
}
