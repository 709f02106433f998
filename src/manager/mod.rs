//! Registry of downloads, concurrency gate, and persistence.
//!
//! The manager is an ordinary value with a scoped lifecycle
//! (`init` → use → `close`); it owns every `Item`, serializes all access to
//! `userdata.warp`, and admits queued downloads as running ones finish.

mod queue;
mod store;

pub use queue::{QueuePosition, QueueState, WaitingEntry};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::downloader::{build_client, probe::probe_url, DownloadOptions, Downloader};
use crate::error::DownloadError;
use crate::events::DownloadHandler;
use crate::item::{Item, UNKNOWN_SIZE};

use queue::Queue;
use store::Store;

/// How often in-flight `downloaded` counters are flushed to disk.
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Filters for [`Manager::list`].
#[derive(Debug, Clone)]
pub struct ListFilters {
    pub show_completed: bool,
    pub show_pending: bool,
    pub show_hidden: bool,
}

impl Default for ListFilters {
    fn default() -> Self {
        Self {
            show_completed: true,
            show_pending: true,
            show_hidden: false,
        }
    }
}

/// Queue-level options for registering a download.
#[derive(Debug, Clone)]
pub struct AddDownloadOptions {
    /// 0 = low, 1 = normal, 2 = high.
    pub priority: u8,
}

impl Default for AddDownloadOptions {
    fn default() -> Self {
        Self { priority: 1 }
    }
}

/// Snapshot returned by [`Manager::queue_status`].
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub max_concurrent: usize,
    pub paused: bool,
    pub active: Vec<String>,
    pub waiting: Vec<QueuePosition>,
}

struct ActiveDownload {
    downloader: Arc<Downloader>,
    priority: u8,
    task: JoinHandle<()>,
}

struct State {
    items: HashMap<String, Arc<Item>>,
    queue: Queue,
    active: HashMap<String, ActiveDownload>,
    /// Downloaders staged for waiting items. Entries restored from disk have
    /// no staged downloader until the caller resumes them.
    staged: HashMap<String, Arc<Downloader>>,
}

struct Shared {
    store: Store,
    /// Serializes persistence I/O; never held together with `state`.
    store_lock: tokio::sync::Mutex<()>,
    state: tokio::sync::RwLock<State>,
}

impl Shared {
    /// Snapshots the state under the read lock, then writes outside it.
    async fn persist(&self) -> Result<(), DownloadError> {
        let _io_guard = self.store_lock.lock().await;
        let (items, queue_state) = {
            let state = self.state.read().await;
            (state.items.clone(), state.queue.to_state())
        };
        self.store.save(&items, &queue_state).await
    }
}

pub struct Manager {
    shared: Arc<Shared>,
    flusher: Option<JoinHandle<()>>,
}

impl Manager {
    /// Opens or creates `<config_dir>/userdata.warp` and loads the stored
    /// state. Each restored item's `downloaded` counter is clamped to the
    /// bytes actually on disk, so a crash never over-reports progress.
    pub async fn init(
        config_dir: impl AsRef<Path>,
        max_concurrent: usize,
    ) -> Result<Self, DownloadError> {
        let config_dir = config_dir.as_ref();
        tokio::fs::create_dir_all(config_dir).await.map_err(|e| {
            DownloadError::Storage(format!(
                "failed to create config dir {}: {}",
                config_dir.display(),
                e
            ))
        })?;

        let store = Store::new(config_dir);
        let mut items: HashMap<String, Arc<Item>> = HashMap::new();
        let mut queue = Queue::new(max_concurrent);

        if let Some(data) = store.load().await? {
            for (hash, item) in data.items {
                let item = Arc::new(item);
                let on_disk = item.bytes_on_disk().await;
                if item.downloaded() > on_disk {
                    log::info!(
                        "[init] {}: clamping downloaded {} -> {} after restart",
                        hash,
                        item.downloaded(),
                        on_disk
                    );
                    item.downloaded.store(on_disk, std::sync::atomic::Ordering::Release);
                }
                items.insert(hash, item);
            }
            queue = Queue::from_state(&data.queue_state, max_concurrent);
            queue.retain_known(|hash| items.contains_key(hash));
            log::info!(
                "[init] loaded {} items and {} waiting entries from {}",
                items.len(),
                queue.len(),
                store.path().display()
            );
        }

        let shared = Arc::new(Shared {
            store,
            store_lock: tokio::sync::Mutex::new(()),
            state: tokio::sync::RwLock::new(State {
                items,
                queue,
                active: HashMap::new(),
                staged: HashMap::new(),
            }),
        });

        let flusher = spawn_progress_flusher(Arc::clone(&shared));
        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    /// Default state location: `<user_config_dir>/warpdl`.
    pub fn default_config_dir() -> PathBuf {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warpdl")
    }

    /// Registers the downloader's item, persists, and either starts it
    /// right away (gate permitting) or parks it in the wait queue.
    pub async fn add_download(
        &self,
        downloader: Downloader,
        opts: AddDownloadOptions,
    ) -> Result<Arc<Item>, DownloadError> {
        let downloader = Arc::new(downloader);
        let item = downloader.item();
        let hash = item.hash.clone();

        {
            let mut state = self.shared.state.write().await;
            if state.active.contains_key(&hash) {
                return Err(DownloadError::StillRunning(hash));
            }
            // Re-adding the same URL+headers replaces the previous record.
            state.queue.remove(&hash);
            state.items.insert(hash.clone(), Arc::clone(&item));
            state.staged.insert(hash.clone(), downloader);
            state.queue.enqueue(hash, opts.priority);
            admit_locked(&mut state, &self.shared);
        }

        self.shared.persist().await?;
        Ok(item)
    }

    /// Rebuilds a downloader from the stored item, re-probes the origin,
    /// and starts it subject to the concurrency gate. Compiled parts are
    /// skipped; the rest respawn from their part files.
    pub async fn resume_download(
        &self,
        hash: &str,
        opts: DownloadOptions,
        handler: Arc<dyn DownloadHandler>,
        queue_opts: AddDownloadOptions,
    ) -> Result<Arc<Item>, DownloadError> {
        let item = {
            let state = self.shared.state.read().await;
            if state.active.contains_key(hash) {
                return Err(DownloadError::StillRunning(hash.to_string()));
            }
            state
                .items
                .get(hash)
                .cloned()
                .ok_or_else(|| DownloadError::UnknownHash(hash.to_string()))?
        };

        if !item.resumable {
            return Err(DownloadError::NotResumable);
        }
        if item.is_completed() {
            return Err(DownloadError::Config(format!(
                "download {} is already completed",
                hash
            )));
        }

        let client = build_client(&opts)?;
        let request = crate::downloader::request_data_for(&item.headers, &opts);
        let probe = probe_url(&client, &item.url, &request).await?;
        if !probe.resumable {
            return Err(DownloadError::NotResumable);
        }
        if item.total_size() != UNKNOWN_SIZE
            && probe.total_size != UNKNOWN_SIZE
            && probe.total_size != item.total_size()
        {
            return Err(DownloadError::Fatal(format!(
                "content changed: origin now reports {} bytes, stored item has {}",
                probe.total_size,
                item.total_size()
            )));
        }

        let downloader = Arc::new(Downloader::from_item(
            client,
            Arc::clone(&item),
            probe.final_url,
            opts,
            handler,
        ));

        {
            let mut state = self.shared.state.write().await;
            if state.active.contains_key(hash) {
                return Err(DownloadError::StillRunning(hash.to_string()));
            }
            state.staged.insert(hash.to_string(), downloader);
            if !state.queue.contains(hash) {
                state.queue.enqueue(hash.to_string(), queue_opts.priority);
            }
            admit_locked(&mut state, &self.shared);
        }

        self.shared.persist().await?;
        Ok(item)
    }

    /// Cancels the active download for `hash`; a no-op when it is not
    /// running. The item and its part files stay behind for a later resume.
    pub async fn stop(&self, hash: &str) -> Result<(), DownloadError> {
        let entry = {
            let mut state = self.shared.state.write().await;
            if !state.items.contains_key(hash) {
                return Err(DownloadError::UnknownHash(hash.to_string()));
            }
            state.active.remove(hash)
        };

        if let Some(ActiveDownload {
            downloader, task, ..
        }) = entry
        {
            downloader.stop().await;
            let _ = task.await;
        }
        Ok(())
    }

    /// Removes an item and deletes its files. Part files always go; the
    /// output file goes only when the download never completed (a partial
    /// compile artifact), finished downloads keep their result.
    pub async fn flush(&self, hash: &str) -> Result<(), DownloadError> {
        let item = {
            let mut state = self.shared.state.write().await;
            if state.active.contains_key(hash) {
                return Err(DownloadError::StillRunning(hash.to_string()));
            }
            let item = state
                .items
                .remove(hash)
                .ok_or_else(|| DownloadError::UnknownHash(hash.to_string()))?;
            state.queue.remove(hash);
            state.staged.remove(hash);
            item
        };

        delete_item_files(&item).await;
        self.shared.persist().await
    }

    /// Removes every non-running item; returns how many were flushed.
    pub async fn flush_all(&self) -> Result<usize, DownloadError> {
        let removed: Vec<Arc<Item>> = {
            let mut state = self.shared.state.write().await;
            let hashes: Vec<String> = state
                .items
                .keys()
                .filter(|hash| !state.active.contains_key(*hash))
                .cloned()
                .collect();
            for hash in &hashes {
                state.queue.remove(hash);
                state.staged.remove(hash);
            }
            hashes
                .into_iter()
                .filter_map(|hash| state.items.remove(&hash))
                .collect()
        };

        for item in &removed {
            delete_item_files(item).await;
        }
        self.shared.persist().await?;
        Ok(removed.len())
    }

    /// Point-in-time view of the registry.
    pub async fn list(&self, filters: &ListFilters) -> Vec<Arc<Item>> {
        let state = self.shared.state.read().await;
        let mut out: Vec<Arc<Item>> = state
            .items
            .values()
            .filter(|item| {
                if item.hidden && !filters.show_hidden {
                    return false;
                }
                if item.is_completed() {
                    filters.show_completed
                } else {
                    filters.show_pending
                }
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.date_added, &a.hash).cmp(&(b.date_added, &b.hash)));
        out
    }

    pub async fn get(&self, hash: &str) -> Option<Arc<Item>> {
        self.shared.state.read().await.items.get(hash).cloned()
    }

    pub async fn is_active(&self, hash: &str) -> bool {
        self.shared.state.read().await.active.contains_key(hash)
    }

    pub async fn active_count(&self) -> usize {
        self.shared.state.read().await.active.len()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let state = self.shared.state.read().await;
        QueueStatus {
            max_concurrent: state.queue.max_concurrent(),
            paused: state.queue.is_paused(),
            active: state.active.keys().cloned().collect(),
            waiting: state.queue.positions(),
        }
    }

    /// Reorders a waiting download to an explicit position.
    pub async fn queue_move(&self, hash: &str, new_position: usize) -> Result<(), DownloadError> {
        {
            let mut state = self.shared.state.write().await;
            if !state.queue.move_to(hash, new_position) {
                return Err(DownloadError::UnknownHash(hash.to_string()));
            }
        }
        self.shared.persist().await
    }

    /// Stops every active download and pushes it back to the front of its
    /// priority class; nothing is admitted until [`queue_resume`](Self::queue_resume).
    pub async fn queue_pause(&self) -> Result<(), DownloadError> {
        let actives: Vec<(String, u8, Arc<Downloader>, JoinHandle<()>)> = {
            let mut state = self.shared.state.write().await;
            state.queue.set_paused(true);
            let hashes: Vec<String> = state.active.keys().cloned().collect();
            hashes
                .into_iter()
                .filter_map(|hash| {
                    state.active.remove(&hash).map(
                        |ActiveDownload {
                             downloader,
                             priority,
                             task,
                         }| (hash, priority, downloader, task),
                    )
                })
                .collect()
        };

        for (hash, priority, downloader, task) in actives {
            downloader.stop().await;
            let _ = task.await;
            let mut state = self.shared.state.write().await;
            state.staged.insert(hash.clone(), downloader);
            state.queue.enqueue_front(hash, priority);
        }

        self.shared.persist().await
    }

    /// Lifts a pause and fills the gate back up.
    pub async fn queue_resume(&self) -> Result<(), DownloadError> {
        {
            let mut state = self.shared.state.write().await;
            state.queue.set_paused(false);
            admit_locked(&mut state, &self.shared);
        }
        self.shared.persist().await
    }

    /// Stops everything, persists the final state, and releases the store.
    pub async fn close(mut self) -> Result<(), DownloadError> {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }

        // Park admission so stopping one download does not start another.
        let was_paused = {
            let mut state = self.shared.state.write().await;
            let was = state.queue.is_paused();
            state.queue.set_paused(true);
            was
        };

        loop {
            let entry = {
                let mut state = self.shared.state.write().await;
                let hash = state.active.keys().next().cloned();
                hash.and_then(|hash| state.active.remove(&hash))
            };
            let Some(ActiveDownload {
                downloader, task, ..
            }) = entry
            else {
                break;
            };
            downloader.stop().await;
            let _ = task.await;
        }

        {
            let mut state = self.shared.state.write().await;
            state.queue.set_paused(was_paused);
        }
        self.shared.persist().await
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
    }
}

/// Starts waiting downloads while the gate has room. Only entries with a
/// staged downloader are eligible; entries restored from disk stay waiting
/// until the caller resumes them.
fn admit_locked(state: &mut State, shared: &Arc<Shared>) {
    if state.queue.is_paused() {
        return;
    }
    loop {
        if state.queue.at_capacity(state.active.len()) {
            break;
        }
        let State { queue, staged, .. } = state;
        let Some((hash, priority)) = queue.dequeue_where(|h| staged.contains_key(h)) else {
            break;
        };
        let downloader = state
            .staged
            .remove(&hash)
            .expect("staged downloader vanished");
        log::info!("[admit_locked] admitting download {} (priority {})", hash, priority);
        let task = spawn_run(Arc::clone(shared), Arc::clone(&downloader), hash.clone());
        state.active.insert(
            hash,
            ActiveDownload {
                downloader,
                priority,
                task,
            },
        );
    }
}

fn spawn_run(shared: Arc<Shared>, downloader: Arc<Downloader>, hash: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match downloader.start().await {
            Ok(()) => log::info!("[spawn_run] download {} completed", hash),
            Err(e) if e.is_cancelled() => log::info!("[spawn_run] download {} stopped", hash),
            Err(e) => log::warn!("[spawn_run] download {} failed: {}", hash, e),
        }

        {
            let mut state = shared.state.write().await;
            state.active.remove(&hash);
            admit_locked(&mut state, &shared);
        }
        if let Err(e) = shared.persist().await {
            log::warn!("[spawn_run] failed to persist after download {}: {}", hash, e);
        }
    })
}

/// Coalesced flush of in-flight progress counters: at most one write per
/// tick, and only while something is actually downloading.
fn spawn_progress_flusher(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let has_active = !shared.state.read().await.active.is_empty();
            if has_active {
                if let Err(e) = shared.persist().await {
                    log::warn!("[spawn_progress_flusher] progress flush failed: {}", e);
                }
            }
        }
    })
}

async fn delete_item_files(item: &Item) {
    let completed = item.is_completed();
    let uncompiled: Vec<String> = {
        let parts = item.parts.read().expect("parts lock poisoned");
        parts
            .values()
            .filter(|p| !p.is_compiled())
            .map(|p| p.hash.clone())
            .collect()
    };
    for part_hash in uncompiled {
        let _ = tokio::fs::remove_file(item.part_path(&part_hash)).await;
    }
    if !completed {
        let _ = tokio::fs::remove_file(item.output_path()).await;
    }
}
