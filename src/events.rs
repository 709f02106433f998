use async_trait::async_trait;

use crate::error::DownloadError;

/// Callback surface for everything a download reports while it runs.
///
/// Every method defaults to a no-op, so consumers implement only the events
/// they care about. Handlers are shared between all workers of a download;
/// implementations must be cheap or hand off to a channel, because
/// `on_progress` fires once per write.
///
/// Ordering guarantees:
/// - `on_progress` / `on_resume_progress` carry the bytes written since the
///   previous call for that part, not cumulative totals.
/// - After `on_download_stopped` no further events are emitted for the run.
/// - `on_error` fires at most once per run, with the first fatal error.
#[async_trait]
pub trait DownloadHandler: Send + Sync + 'static {
    /// Bytes written to a part file since the last call.
    async fn on_progress(&self, _part_hash: &str, _n_bytes: u64) {}

    /// Same as `on_progress`, for parts respawned by a resume.
    async fn on_resume_progress(&self, _part_hash: &str, _n_bytes: u64) {}

    /// All parts finished and the final file has been assembled.
    async fn on_download_complete(&self, _hash: &str, _total_bytes: u64) {}

    /// The run was cancelled; workers have already exited.
    async fn on_download_stopped(&self) {}

    /// A part's bytes are about to be appended to the final file.
    async fn on_compile_start(&self, _part_hash: &str) {}

    /// Bytes appended to the final file since the last call.
    async fn on_compile_progress(&self, _part_hash: &str, _n_bytes: u64) {}

    /// A part was fully appended and its temporary file removed.
    async fn on_compile_complete(&self, _part_hash: &str, _total_bytes: u64) {}

    /// First fatal error of the run; the download is stopping.
    async fn on_error(&self, _part_hash: &str, _error: &DownloadError) {}

    /// A fresh part `[ioff, foff)` is starting (initial plan or steal).
    async fn on_spawn_part(&self, _part_hash: &str, _ioff: i64, _foff: i64) {}

    /// A persisted part is restarting with `already_read` bytes on disk.
    async fn on_respawn_part(&self, _part_hash: &str, _already_read: i64, _ioff: i64, _foff: i64) {}
}

/// Handler that ignores every event.
pub struct NoopHandler;

#[async_trait]
impl DownloadHandler for NoopHandler {}
