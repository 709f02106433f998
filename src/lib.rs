//! WarpDL core: a segmented, resumable HTTP(S) download engine.
//!
//! A [`Downloader`] probes a URL, splits the byte range into parts, fetches
//! them over concurrent connections with dynamic work stealing, and compiles
//! the part files into the final output. The [`manager::Manager`] keeps every
//! download's [`Item`] in an atomically-replaced state file so interrupted
//! work survives restarts, and gates how many downloads run at once through
//! a priority queue.
//!
//! Progress, errors, and lifecycle transitions are reported through the
//! [`DownloadHandler`] callback trait; callers implement only the events
//! they care about.

pub mod downloader;
pub mod error;
pub mod events;
pub mod item;
pub mod limiter;
pub mod manager;
pub mod retry;

pub use downloader::{
    build_client, BasicAuth, DownloadOptions, Downloader, ProbeResult, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_SEGMENTS,
};
pub use error::{DownloadError, ProbeKind};
pub use events::{DownloadHandler, NoopHandler};
pub use item::{derive_item_hash, Item, ItemPart, UNKNOWN_SIZE};
pub use limiter::SpeedLimiter;
pub use manager::{AddDownloadOptions, ListFilters, Manager, QueuePosition, QueueStatus};
