//! Planner and supervisor for one segmented download.
//!
//! A `Downloader` probes the URL once at construction, plans contiguous byte
//! segments at `start()`, runs one worker task per segment behind a
//! connection semaphore, lets fast workers steal the tail of slow ones, and
//! finally compiles the part files into the output in offset order.

pub mod probe;

mod compile;
mod part_worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DownloadError;
use crate::events::DownloadHandler;
use crate::item::{Item, ItemPart, OPEN_END, UNKNOWN_SIZE};
use crate::limiter::SpeedLimiter;
use crate::retry::RetryPolicy;

use compile::compile_parts;
use part_worker::{run_part, PartLive, WorkerEnv};
use probe::{derive_file_name, probe_url, RequestData};

pub use probe::ProbeResult;

/// Segments are never planned smaller than this.
const MIN_SEGMENT_SIZE: i64 = 256 * 1024;

/// A victim must have at least this many bytes left before its tail is
/// worth stealing. Also the minimum head start the thief leaves the victim,
/// which keeps the split safely ahead of any in-flight chunk.
const STEAL_MIN_BYTES: i64 = 1024 * 1024;

const MAX_REDIRECTS: usize = 10;

pub const DEFAULT_MAX_CONNECTIONS: usize = 24;
pub const DEFAULT_MAX_SEGMENTS: usize = 200;

/// HTTP Basic credentials applied at request-build time.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Per-download configuration. `Default` gives the documented defaults.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Ordered request headers, `User-Agent` included when wanted.
    pub headers: Vec<(String, String)>,
    /// Split resumable downloads into segments; `false` forces one part.
    pub force_parts: bool,
    /// Output name override; derived from the response when `None`.
    pub file_name: Option<String>,
    /// Target directory; the process working directory when `None`.
    pub download_directory: Option<PathBuf>,
    pub max_connections: usize,
    /// Upper bound on the number of originally planned parts.
    pub max_segments: usize,
    pub overwrite: bool,
    /// Proxy URL; `http`, `https`, and `socks5` schemes are accepted.
    pub proxy: Option<String>,
    pub per_request_timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// `0` disables rate shaping.
    pub speed_limit_bytes_per_sec: u64,
    pub disable_work_stealing: bool,
    /// Probe only; skip creating the target directory. For info queries.
    pub skip_setup: bool,
    pub authentication: Option<BasicAuth>,
    /// Value for the `Cookie` header.
    pub cookies: Option<String>,
    /// Companion item (paired video+audio downloads).
    pub child_hash: Option<String>,
    pub hidden: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            force_parts: true,
            file_name: None,
            download_directory: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_segments: DEFAULT_MAX_SEGMENTS,
            overwrite: false,
            proxy: None,
            per_request_timeout: None,
            max_retries: 5,
            retry_base_delay_ms: 250,
            speed_limit_bytes_per_sec: 0,
            disable_work_stealing: false,
            skip_setup: false,
            authentication: None,
            cookies: None,
            child_hash: None,
            hidden: false,
        }
    }
}

/// Builds the HTTP client a `Downloader` runs on: capped redirects with an
/// https→http downgrade refusal, optional proxy, raw (undecoded) bodies.
pub fn build_client(opts: &DownloadOptions) -> Result<Client, DownloadError> {
    let redirect = reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let from_https = attempt
            .previous()
            .last()
            .map(|u| u.scheme() == "https")
            .unwrap_or(false);
        if from_https && attempt.url().scheme() == "http" {
            attempt.error("refusing https to http downgrade")
        } else {
            attempt.follow()
        }
    });

    let mut builder = Client::builder()
        .redirect(redirect)
        .connect_timeout(Duration::from_secs(10))
        .tcp_nodelay(true)
        .no_gzip()
        .no_deflate()
        .no_brotli();

    if let Some(timeout) = opts.per_request_timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(proxy_url) = &opts.proxy {
        let scheme = proxy_url.split("://").next().unwrap_or("");
        if !matches!(scheme, "http" | "https" | "socks5") {
            return Err(DownloadError::Config(format!(
                "unknown proxy scheme in {:?}",
                proxy_url
            )));
        }
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| DownloadError::Config(format!("invalid proxy {:?}: {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| DownloadError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Splits `[0, total_size)` into at most `max_segments` contiguous ranges of
/// at least [`MIN_SEGMENT_SIZE`] bytes; the last one absorbs the remainder.
pub(crate) fn plan_segments(total_size: i64, max_segments: usize) -> Vec<(i64, i64)> {
    if total_size <= 0 {
        return Vec::new();
    }
    let cap = ((total_size + MIN_SEGMENT_SIZE - 1) / MIN_SEGMENT_SIZE).max(1) as usize;
    let n = max_segments.clamp(1, cap);
    let base = total_size / n as i64;

    let mut segments = Vec::with_capacity(n);
    let mut start = 0i64;
    for i in 0..n {
        let end = if i == n - 1 { total_size } else { start + base };
        segments.push((start, end));
        start = end;
    }
    segments
}

pub struct Downloader {
    client: Client,
    item: Arc<Item>,
    opts: DownloadOptions,
    handler: Arc<dyn DownloadHandler>,
    request: RequestData,
    final_url: String,
    limiter: Arc<SpeedLimiter>,
    cancel: StdRwLock<CancellationToken>,
    run_lock: tokio::sync::Mutex<()>,
    resumed: bool,
}

impl Downloader {
    /// Probes `url` and prepares a fresh download. The item is created here;
    /// no part is planned and no byte is fetched until [`start`](Self::start).
    pub async fn new(
        client: Client,
        url: &str,
        opts: DownloadOptions,
        handler: Arc<dyn DownloadHandler>,
    ) -> Result<Self, DownloadError> {
        let mut opts = opts;
        opts.max_connections = opts.max_connections.max(1);
        opts.max_segments = opts.max_segments.max(1);

        let request = request_data(&opts.headers, &opts.cookies, &opts.authentication);
        let probe = probe_url(&client, url, &request).await?;

        let seed = crate::item::derive_item_hash(url, &opts.headers);
        let name = derive_file_name(
            opts.file_name.as_deref(),
            probe.attachment_name.as_deref(),
            &probe.final_url,
            &seed,
        )?;

        let location = opts
            .download_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let absolute = if location.is_absolute() {
            location.clone()
        } else {
            std::env::current_dir()?.join(&location)
        };
        if !opts.skip_setup {
            tokio::fs::create_dir_all(&absolute).await?;
        }

        let item = Arc::new(Item::new(
            url.to_string(),
            name,
            opts.headers.clone(),
            probe.total_size,
            probe.resumable,
            location.to_string_lossy().into_owned(),
            absolute.to_string_lossy().into_owned(),
            opts.child_hash.clone(),
            opts.hidden,
        ));

        log::info!(
            "[new] download {}: {} ({} bytes, resumable={})",
            item.hash,
            item.name,
            item.total_size(),
            item.resumable
        );

        let limiter = Arc::new(SpeedLimiter::new(opts.speed_limit_bytes_per_sec));
        Ok(Self {
            client,
            item,
            opts,
            handler,
            request,
            final_url: probe.final_url,
            limiter,
            cancel: StdRwLock::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
            resumed: false,
        })
    }

    /// Rebuilds a downloader around a persisted item; used by the manager's
    /// resume path after it has re-probed the origin.
    pub fn from_item(
        client: Client,
        item: Arc<Item>,
        final_url: String,
        opts: DownloadOptions,
        handler: Arc<dyn DownloadHandler>,
    ) -> Self {
        let mut opts = opts;
        opts.max_connections = opts.max_connections.max(1);
        opts.max_segments = opts.max_segments.max(1);
        let request = request_data(&item.headers, &opts.cookies, &opts.authentication);
        let limiter = Arc::new(SpeedLimiter::new(opts.speed_limit_bytes_per_sec));
        Self {
            client,
            item,
            opts,
            handler,
            request,
            final_url,
            limiter,
            cancel: StdRwLock::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
            resumed: true,
        }
    }

    pub fn item(&self) -> Arc<Item> {
        Arc::clone(&self.item)
    }

    pub fn final_url(&self) -> &str {
        &self.final_url
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel.read().expect("cancel lock poisoned").clone()
    }

    /// Runs the download to completion: plan (first run only), fetch all
    /// parts concurrently, steal tails of slow parts, compile. Returns
    /// `Cancelled` when stopped; any other error is the run's first fatal
    /// error, already reported through the handler.
    pub async fn start(&self) -> Result<(), DownloadError> {
        let _run_guard = self
            .run_lock
            .try_lock()
            .map_err(|_| DownloadError::Config("download is already running".to_string()))?;

        // A previous stop leaves a cancelled token behind; replace it so the
        // same downloader can run again.
        let cancel = {
            let mut guard = self.cancel.write().expect("cancel lock poisoned");
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        self.plan_if_needed();

        let lives = self.reconcile_parts().await;

        // Rebase the committed-byte counter on what is actually on disk;
        // stale counters from a crash or a discarded non-resumable prefix
        // would otherwise over-report.
        {
            let compiled_bytes: i64 = {
                let parts = self.item.parts.read().expect("parts lock poisoned");
                parts
                    .iter()
                    .filter(|(_, p)| p.is_compiled())
                    .map(|(ioff, p)| p.final_offset.load(Ordering::Acquire) - ioff)
                    .sum()
            };
            let live_bytes: i64 = lives
                .iter()
                .map(|l| l.current.load(Ordering::Acquire) - l.ioff)
                .sum();
            self.item
                .downloaded
                .store(compiled_bytes + live_bytes, Ordering::Release);
        }
        if lives.is_empty() {
            let total = compile_parts(&self.item, &self.handler, self.opts.overwrite).await?;
            self.handler.on_download_complete(&self.item.hash, total).await;
            return Ok(());
        }

        for live in &lives {
            let foff = live.foff.load(Ordering::Acquire);
            let already = live.current.load(Ordering::Acquire) - live.ioff;
            if self.resumed || already > 0 {
                self.handler
                    .on_respawn_part(&live.hash, already, live.ioff, foff)
                    .await;
            } else {
                self.handler.on_spawn_part(&live.hash, live.ioff, foff).await;
            }
        }

        let sole_part = self.item.parts.read().expect("parts lock poisoned").len() == 1;
        let env = Arc::new(WorkerEnv {
            client: self.client.clone(),
            url: self.final_url.clone(),
            request: self.request.clone(),
            item: Arc::clone(&self.item),
            handler: Arc::clone(&self.handler),
            limiter: Arc::clone(&self.limiter),
            cancel: cancel.clone(),
            policy: RetryPolicy::new(self.opts.max_retries, self.opts.retry_base_delay_ms),
            ranged: self.item.resumable,
            sole_part,
        });

        let steal_enabled = !self.opts.disable_work_stealing
            && self.item.resumable
            && self.item.total_size() != UNKNOWN_SIZE;
        let table = Arc::new(StdRwLock::new(lives.clone()));
        let semaphore = Arc::new(Semaphore::new(self.opts.max_connections));
        let first_error: Arc<tokio::sync::Mutex<Option<DownloadError>>> = Arc::default();

        let mut handles = Vec::with_capacity(lives.len());
        for live in lives {
            let env = Arc::clone(&env);
            let table = Arc::clone(&table);
            let semaphore = Arc::clone(&semaphore);
            let first_error = Arc::clone(&first_error);
            let item_resumed = self.resumed;

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let mut live = live;
                let mut resumed = item_resumed;
                loop {
                    match run_part(&env, &live, resumed).await {
                        Ok(()) => {
                            live.finished.store(true, Ordering::Release);
                            if !steal_enabled {
                                break;
                            }
                            // Finished early: take over the tail of the
                            // slowest remaining part instead of going idle.
                            match try_steal(&env, &table) {
                                Some(stolen) => {
                                    env.handler
                                        .on_spawn_part(
                                            &stolen.hash,
                                            stolen.ioff,
                                            stolen.foff.load(Ordering::Acquire),
                                        )
                                        .await;
                                    live = stolen;
                                    resumed = false;
                                }
                                None => break,
                            }
                        }
                        Err(e) => {
                            if !e.is_cancelled() {
                                let mut slot = first_error.lock().await;
                                if slot.is_none() {
                                    env.handler.on_error(&live.hash, &e).await;
                                    *slot = Some(e);
                                    env.cancel.cancel();
                                } else {
                                    log::debug!(
                                        "[start] part {}: suppressed error: {}",
                                        live.hash,
                                        e
                                    );
                                }
                            }
                            break;
                        }
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        if let Some(e) = first_error.lock().await.take() {
            self.handler.on_download_stopped().await;
            return Err(e);
        }
        if cancel.is_cancelled() {
            self.handler.on_download_stopped().await;
            return Err(DownloadError::Cancelled);
        }

        let total = compile_parts(&self.item, &self.handler, self.opts.overwrite).await?;
        self.handler.on_download_complete(&self.item.hash, total).await;
        Ok(())
    }

    /// Cancels the run and waits until every worker has exited. Idempotent;
    /// a no-op when the downloader is not running.
    pub async fn stop(&self) {
        self.current_token().cancel();
        // Taking the run lock means `start` has returned.
        let _ = self.run_lock.lock().await;
    }

    /// Plans the original segments on the first run; resumed items already
    /// carry their parts map.
    fn plan_if_needed(&self) {
        let mut parts = self.item.parts.write().expect("parts lock poisoned");
        if !parts.is_empty() {
            return;
        }
        let total = self.item.total_size();
        if !self.item.resumable || total == UNKNOWN_SIZE || !self.opts.force_parts {
            let end = if total == UNKNOWN_SIZE { OPEN_END } else { total };
            parts.insert(0, ItemPart::new(Uuid::new_v4().to_string(), end));
            return;
        }
        for (ioff, foff) in plan_segments(total, self.opts.max_segments) {
            parts.insert(ioff, ItemPart::new(Uuid::new_v4().to_string(), foff));
        }
        log::debug!(
            "[plan_if_needed] {}: planned {} parts",
            self.item.hash,
            parts.len()
        );
    }

    /// Builds the live worker table, picking up whatever bytes the part
    /// files already hold. Snapshots the parts under the lock, then probes
    /// the part files without holding it.
    async fn reconcile_parts(&self) -> Vec<Arc<PartLive>> {
        let specs: Vec<(i64, String, Arc<AtomicI64>)> = {
            let parts = self.item.parts.read().expect("parts lock poisoned");
            parts
                .iter()
                .filter(|(_, p)| !p.is_compiled())
                .map(|(ioff, p)| (*ioff, p.hash.clone(), Arc::clone(&p.final_offset)))
                .collect()
        };

        let mut lives = Vec::with_capacity(specs.len());
        for (ioff, hash, foff_cell) in specs {
            let foff = foff_cell.load(Ordering::Acquire);
            let seg_len = if foff == OPEN_END { i64::MAX } else { foff - ioff };
            // A non-resumable origin cannot serve a suffix; any partial part
            // file is restarted from scratch.
            let on_disk = if self.item.resumable {
                tokio::fs::metadata(self.item.part_path(&hash))
                    .await
                    .map(|m| m.len() as i64)
                    .unwrap_or(0)
            } else {
                0
            };
            lives.push(Arc::new(PartLive {
                hash,
                ioff,
                current: AtomicI64::new(ioff + on_disk.min(seg_len)),
                foff: foff_cell,
                finished: AtomicBool::new(false),
            }));
        }
        lives
    }
}

/// Picks the unfinished part with the most remaining bytes and carves off
/// the second half of its tail. The CAS on the victim's `final_offset` is
/// the only synchronization with the victim; losing the race to another
/// thief just means rescanning.
fn try_steal(
    env: &WorkerEnv,
    table: &Arc<StdRwLock<Vec<Arc<PartLive>>>>,
) -> Option<Arc<PartLive>> {
    loop {
        let victim = {
            let guard = table.read().expect("steal table lock poisoned");
            guard
                .iter()
                .filter(|p| !p.finished.load(Ordering::Acquire))
                .max_by_key(|p| p.remaining())
                .cloned()
        }?;

        let old_foff = victim.foff.load(Ordering::Acquire);
        if old_foff == OPEN_END {
            return None;
        }
        let current = victim.current.load(Ordering::Acquire);
        let remaining = old_foff - current;
        if remaining <= STEAL_MIN_BYTES {
            return None;
        }
        let split = current + (remaining / 2).max(STEAL_MIN_BYTES);
        if split >= old_foff {
            return None;
        }

        if victim
            .foff
            .compare_exchange(old_foff, split, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thief got here first; look again.
            continue;
        }

        let hash = Uuid::new_v4().to_string();
        let cell = Arc::new(AtomicI64::new(old_foff));
        {
            let mut parts = env.item.parts.write().expect("parts lock poisoned");
            parts.insert(
                split,
                ItemPart {
                    hash: hash.clone(),
                    final_offset: Arc::clone(&cell),
                    compiled: AtomicBool::new(false),
                },
            );
        }
        let live = Arc::new(PartLive {
            hash,
            ioff: split,
            current: AtomicI64::new(split),
            foff: cell,
            finished: AtomicBool::new(false),
        });
        table.write().expect("steal table lock poisoned").push(Arc::clone(&live));

        log::info!(
            "[try_steal] stole [{}, {}) from part {} of {}",
            split,
            old_foff,
            victim.hash,
            env.item.hash
        );
        return Some(live);
    }
}

/// Request-shaping data for an item's stored headers plus per-run options;
/// used by the manager's resume re-probe.
pub(crate) fn request_data_for(headers: &[(String, String)], opts: &DownloadOptions) -> RequestData {
    request_data(headers, &opts.cookies, &opts.authentication)
}

fn request_data(
    headers: &[(String, String)],
    cookies: &Option<String>,
    auth: &Option<BasicAuth>,
) -> RequestData {
    RequestData {
        headers: headers.to_vec(),
        cookies: cookies.clone(),
        auth_header: auth.as_ref().map(|a| {
            let credentials = format!("{}:{}", a.username, a.password);
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_covers_range_without_gaps() {
        let total = 10 * 1024 * 1024 + 137;
        let segments = plan_segments(total, 7);
        assert_eq!(segments.len(), 7);
        assert_eq!(segments[0].0, 0);
        assert_eq!(segments.last().unwrap().1, total);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn plan_respects_min_segment_size() {
        // 1 MiB file cannot be split into more than 4 × 256 KiB segments.
        let segments = plan_segments(1024 * 1024, 200);
        assert_eq!(segments.len(), 4);
        for (ioff, foff) in &segments {
            assert_eq!(foff - ioff, 256 * 1024);
        }
    }

    #[test]
    fn plan_keys_match_expected_boundaries() {
        let segments = plan_segments(1_048_576, 4);
        let offsets: Vec<i64> = segments.iter().map(|(i, _)| *i).collect();
        assert_eq!(offsets, vec![0, 262_144, 524_288, 786_432]);
    }

    #[test]
    fn tiny_file_gets_one_segment() {
        let segments = plan_segments(1000, 200);
        assert_eq!(segments, vec![(0, 1000)]);
    }

    #[test]
    fn unknown_proxy_scheme_is_config_error() {
        let opts = DownloadOptions {
            proxy: Some("ftp://proxy:3128".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_client(&opts),
            Err(DownloadError::Config(_))
        ));
    }

    #[test]
    fn socks5_proxy_scheme_is_accepted() {
        let opts = DownloadOptions {
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            ..Default::default()
        };
        assert!(build_client(&opts).is_ok());
    }
}
