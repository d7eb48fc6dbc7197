#![forbid(unsafe_code)]

//! Media-identity deduplication core shared by the storygate binaries.

pub mod config;
pub mod context;
pub mod housekeeping;
pub mod keys;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod netlog;
pub mod pipeline;
