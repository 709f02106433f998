use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::downloader::probe::RequestData;
use crate::error::DownloadError;
use crate::events::DownloadHandler;
use crate::item::{Item, OPEN_END, UNKNOWN_SIZE};
use crate::limiter::SpeedLimiter;
use crate::retry::{classify_reqwest, classify_status, ErrorKind, RetryDecision, RetryPolicy};

/// Write-buffer capacity for part files.
pub(crate) const COPY_BUF_SIZE: usize = 256 * 1024;

/// Live state of one part while its worker runs.
///
/// `foff` is the same atomic cell as the persisted `ItemPart::final_offset`,
/// so a steal is a single CAS visible to the victim, the thief, and the
/// persistence layer alike. `current` is only written by the owning worker;
/// other tasks read it to size steal candidates.
pub(crate) struct PartLive {
    pub hash: String,
    pub ioff: i64,
    pub current: AtomicI64,
    pub foff: Arc<AtomicI64>,
    pub finished: AtomicBool,
}

impl PartLive {
    pub fn remaining(&self) -> i64 {
        let foff = self.foff.load(Ordering::Acquire);
        if foff == OPEN_END {
            return 0;
        }
        (foff - self.current.load(Ordering::Acquire)).max(0)
    }
}

/// Everything a worker needs beyond its own part; shared across all workers
/// of one download.
pub(crate) struct WorkerEnv {
    pub client: Client,
    pub url: String,
    pub request: RequestData,
    pub item: Arc<Item>,
    pub handler: Arc<dyn DownloadHandler>,
    pub limiter: Arc<SpeedLimiter>,
    pub cancel: CancellationToken,
    pub policy: RetryPolicy,
    /// Whether `Range` headers are meaningful for this download.
    pub ranged: bool,
    /// True when the plan has exactly one part; a 200 instead of 206 is
    /// tolerated only then.
    pub sole_part: bool,
}

enum WorkerFailure {
    Transient(ErrorKind, String),
    Fatal(DownloadError),
}

/// Downloads one part, retrying transient failures with backoff. Each retry
/// resumes from the current offset with a fresh range request.
pub(crate) async fn run_part(
    env: &WorkerEnv,
    part: &PartLive,
    resumed: bool,
) -> Result<(), DownloadError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if env.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        match fetch_once(env, part, resumed).await {
            Ok(()) => return Ok(()),
            Err(WorkerFailure::Fatal(e)) => return Err(e),
            Err(WorkerFailure::Transient(kind, message)) => {
                match env.policy.decide(attempt, kind) {
                    RetryDecision::NoRetry => {
                        log::warn!(
                            "[run_part] part {}: giving up after {} attempts: {}",
                            part.hash,
                            attempt,
                            message
                        );
                        return Err(DownloadError::MaxRetryExceeded);
                    }
                    RetryDecision::RetryAfter(delay) => {
                        log::debug!(
                            "[run_part] part {}: attempt {} failed ({}), retrying in {:?}",
                            part.hash,
                            attempt,
                            message,
                            delay
                        );
                        tokio::select! {
                            _ = env.cancel.cancelled() => return Err(DownloadError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

async fn fetch_once(env: &WorkerEnv, part: &PartLive, resumed: bool) -> Result<(), WorkerFailure> {
    let mut current = part.current.load(Ordering::Acquire);
    let foff = part.foff.load(Ordering::Acquire);
    if foff != OPEN_END && current >= foff {
        return Ok(());
    }

    if !env.ranged && current > part.ioff {
        // A non-resumable stream can only restart from the beginning; drop
        // the partial prefix and its contribution to the byte counter.
        current = part.ioff;
        part.current.store(current, Ordering::Release);
        env.item.downloaded.store(0, Ordering::Release);
    }

    let mut builder = env.request.apply(env.client.get(&env.url));
    let mut sent_range = false;
    if env.ranged && foff != OPEN_END {
        builder = builder.header("Range", format!("bytes={}-{}", current, foff - 1));
        sent_range = true;
    } else if env.ranged && current > part.ioff {
        // Open-ended resume of an unknown-size download.
        builder = builder.header("Range", format!("bytes={}-", current));
        sent_range = true;
    }

    // The request must not outlive a cancellation; stop() waits on workers.
    let response = tokio::select! {
        _ = env.cancel.cancelled() => return Err(WorkerFailure::Fatal(DownloadError::Cancelled)),
        result = builder.send() => result.map_err(|e| {
            let kind = classify_reqwest(&e);
            match kind {
                ErrorKind::Fatal => WorkerFailure::Fatal(DownloadError::Fatal(e.to_string())),
                _ => WorkerFailure::Transient(kind, e.to_string()),
            }
        })?,
    };

    let status = response.status();
    match status {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK if !sent_range => {}
        StatusCode::OK if env.sole_part && current == part.ioff => {
            // Server ignored the range; the body is the whole file, which is
            // exactly this part.
        }
        StatusCode::OK => {
            return Err(WorkerFailure::Fatal(DownloadError::Fatal(format!(
                "server ignored range request for part {}",
                part.hash
            ))));
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            return Err(WorkerFailure::Fatal(DownloadError::PartFailed(format!(
                "range {}-{} not satisfiable",
                current, foff
            ))));
        }
        other => {
            let kind = classify_status(other.as_u16());
            let message = format!("part {} got HTTP {}", part.hash, other);
            return Err(match kind {
                ErrorKind::Fatal => WorkerFailure::Fatal(DownloadError::Fatal(message)),
                _ => WorkerFailure::Transient(kind, message),
            });
        }
    }

    let path = env.item.part_path(&part.hash);
    let file = if current > part.ioff {
        tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| WorkerFailure::Fatal(DownloadError::Disk(e)))?
    } else {
        tokio::fs::File::create(&path)
            .await
            .map_err(|e| WorkerFailure::Fatal(DownloadError::Disk(e)))?
    };
    let mut writer = BufWriter::with_capacity(COPY_BUF_SIZE, file);

    let mut stream = response.bytes_stream();
    let mut stream_error: Option<String> = None;

    loop {
        let chunk_result = tokio::select! {
            _ = env.cancel.cancelled() => {
                let _ = writer.flush().await;
                return Err(WorkerFailure::Fatal(DownloadError::Cancelled));
            }
            next = stream.next() => match next {
                Some(result) => result,
                None => break,
            },
        };

        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = writer.flush().await;
                stream_error = Some(e.to_string());
                break;
            }
        };

        // Re-read the bound every write: a thief may have shrunk it.
        let foff_now = part.foff.load(Ordering::Acquire);
        let cap = if foff_now == OPEN_END {
            chunk.len()
        } else {
            ((foff_now - current).max(0) as usize).min(chunk.len())
        };
        if cap == 0 {
            break;
        }

        env.limiter.acquire(cap as u64).await;

        writer
            .write_all(&chunk[..cap])
            .await
            .map_err(|e| WorkerFailure::Fatal(DownloadError::Disk(e)))?;

        current += cap as i64;
        part.current.store(current, Ordering::Release);
        env.item.add_downloaded(cap as i64);

        if resumed {
            env.handler.on_resume_progress(&part.hash, cap as u64).await;
        } else {
            env.handler.on_progress(&part.hash, cap as u64).await;
        }

        if foff_now != OPEN_END && current >= foff_now {
            break;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| WorkerFailure::Fatal(DownloadError::Disk(e)))?;

    // The steal margin keeps the thief's split well ahead of any in-flight
    // chunk; if that was ever violated, drop the overlap so the compiled
    // output stays exact.
    let foff_final = part.foff.load(Ordering::Acquire);
    if foff_final != OPEN_END && current > foff_final {
        log::error!(
            "[fetch_once] part {}: wrote {} bytes past a stolen boundary, truncating",
            part.hash,
            current - foff_final
        );
        writer
            .get_ref()
            .set_len((foff_final - part.ioff) as u64)
            .await
            .map_err(|e| WorkerFailure::Fatal(DownloadError::Disk(e)))?;
        current = foff_final;
        part.current.store(current, Ordering::Release);
    }

    if let Some(message) = stream_error {
        return Err(WorkerFailure::Transient(ErrorKind::Connection, message));
    }

    let foff_end = part.foff.load(Ordering::Acquire);
    if foff_end == OPEN_END {
        // Clean EOF defines the size of an unknown-length download.
        part.foff.store(current, Ordering::Release);
        if env.item.total_size() == UNKNOWN_SIZE {
            env.item.total_size.store(current - part.ioff, Ordering::Release);
        }
        return Ok(());
    }

    if current < foff_end {
        return Err(WorkerFailure::Transient(
            ErrorKind::Connection,
            format!(
                "part {}: body ended {} bytes early",
                part.hash,
                foff_end - current
            ),
        ));
    }

    Ok(())
}
