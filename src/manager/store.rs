//! On-disk persistence for the manager: `userdata.warp`.
//!
//! Layout: an 8-byte magic, a one-byte format version, a little-endian
//! `u64` payload length, then the payload (JSON-encoded `ManagerData`).
//! The envelope catches truncation and foreign files cheaply and gates the
//! version; the self-describing payload lets future fields be added with
//! zero-value defaults and unknown fields be ignored. The file is only ever
//! replaced atomically: temp file in the same directory, fsync, rename.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::item::Item;
use crate::manager::queue::QueueState;

const MAGIC: [u8; 8] = *b"WARPDATA";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 8;

const FILE_NAME: &str = "userdata.warp";
const TMP_NAME: &str = ".userdata.warp.tmp";

#[derive(Serialize)]
struct SaveView<'a> {
    // BTreeMap so the payload bytes are stable for identical state.
    items: BTreeMap<&'a str, &'a Item>,
    queue_state: &'a QueueState,
}

/// Decoded content of `userdata.warp`.
#[derive(Default, Deserialize)]
pub(crate) struct LoadedData {
    #[serde(default)]
    pub items: HashMap<String, Item>,
    #[serde(default)]
    pub queue_state: QueueState,
}

pub(crate) struct Store {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl Store {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(FILE_NAME),
            tmp_path: config_dir.join(TMP_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and decodes the state file. `Ok(None)` when it does not exist
    /// yet; `StorageError` for anything undecodable.
    pub async fn load(&self) -> Result<Option<LoadedData>, DownloadError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DownloadError::Storage(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        decode(&bytes).map(Some)
    }

    /// Atomically replaces the state file: write temp in the same directory,
    /// fsync, rename over the canonical path. A crash at any point leaves
    /// either the old file or the new one, never a mix.
    pub async fn save(
        &self,
        items: &HashMap<String, Arc<Item>>,
        queue_state: &QueueState,
    ) -> Result<(), DownloadError> {
        let view = SaveView {
            items: items.iter().map(|(k, v)| (k.as_str(), &**v)).collect(),
            queue_state,
        };
        let payload = serde_json::to_vec(&view)
            .map_err(|e| DownloadError::Storage(format!("failed to encode state: {}", e)))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&payload);

        let map_io = |what: &str, path: &Path, e: std::io::Error| {
            DownloadError::Storage(format!("failed to {} {}: {}", what, path.display(), e))
        };

        let file = tokio::fs::File::create(&self.tmp_path)
            .await
            .map_err(|e| map_io("create", &self.tmp_path, e))?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = file;
            file.write_all(&buf)
                .await
                .map_err(|e| map_io("write", &self.tmp_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| map_io("sync", &self.tmp_path, e))?;
        }
        tokio::fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|e| map_io("rename", &self.tmp_path, e))?;

        // Make the rename itself durable where the platform allows it.
        #[cfg(unix)]
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_file) = std::fs::File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }

        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<LoadedData, DownloadError> {
    if bytes.len() < HEADER_LEN {
        return Err(DownloadError::Storage(format!(
            "state file truncated: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(DownloadError::Storage(
            "state file has wrong magic; not a userdata.warp file".to_string(),
        ));
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(DownloadError::Storage(format!(
            "state file format version {} is not supported (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[MAGIC.len() + 1..HEADER_LEN]);
    let payload_len = u64::from_le_bytes(len_bytes) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(DownloadError::Storage(format!(
            "state file truncated: payload is {} bytes, header says {}",
            payload.len(),
            payload_len
        )));
    }

    serde_json::from_slice(payload)
        .map_err(|e| DownloadError::Storage(format!("failed to decode state payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemPart;
    use std::sync::atomic::Ordering;

    fn sample_item() -> Item {
        let item = Item::new(
            "https://example.com/a.bin".to_string(),
            "a.bin".to_string(),
            vec![("User-Agent".to_string(), "warp".to_string())],
            2048,
            true,
            ".".to_string(),
            "/tmp/warp-test".to_string(),
            None,
            false,
        );
        {
            let mut parts = item.parts.write().unwrap();
            parts.insert(0, ItemPart::new("p0".to_string(), 1024));
            parts.insert(1024, ItemPart::new("p1".to_string(), 2048));
        }
        item.add_downloaded(512);
        item
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let item = Arc::new(sample_item());
        let hash = item.hash.clone();
        let mut items = HashMap::new();
        items.insert(hash.clone(), item);

        let mut queue_state = QueueState::default();
        queue_state.max_concurrent = 3;
        queue_state.waiting.push(crate::manager::queue::WaitingEntry {
            hash: "deadbeef".to_string(),
            priority: 2,
        });

        store.save(&items, &queue_state).await.unwrap();
        let loaded = store.load().await.unwrap().expect("file should exist");

        assert_eq!(loaded.queue_state.max_concurrent, 3);
        assert_eq!(loaded.queue_state.waiting.len(), 1);
        let restored = &loaded.items[&hash];
        assert_eq!(restored.downloaded(), 512);
        assert_eq!(restored.total_size(), 2048);
        let parts = restored.parts.read().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[&1024].final_offset.load(Ordering::Acquire), 2048);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let items = HashMap::new();
        store.save(&items, &QueueState::default()).await.unwrap();

        let bytes = tokio::fs::read(store.path()).await.unwrap();
        tokio::fs::write(store.path(), &bytes[..bytes.len() - 3])
            .await
            .unwrap();

        assert!(matches!(
            store.load().await,
            Err(DownloadError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn wrong_magic_and_future_version_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        tokio::fs::write(store.path(), b"NOTWARPDxxxxxxxxxxxx")
            .await
            .unwrap();
        assert!(matches!(store.load().await, Err(DownloadError::Storage(_))));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(99);
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        tokio::fs::write(store.path(), &bytes).await.unwrap();
        assert!(matches!(store.load().await, Err(DownloadError::Storage(_))));
    }

    #[tokio::test]
    async fn unknown_payload_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let payload = br#"{"items":{},"queue_state":{"max_concurrent":1},"future_field":42}"#;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(payload);
        tokio::fs::write(store.path(), &bytes).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.queue_state.max_concurrent, 1);
        assert!(loaded.items.is_empty());
    }

    #[tokio::test]
    async fn stale_temp_file_never_shadows_canonical_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let items = HashMap::new();
        let mut queue_state = QueueState::default();
        queue_state.max_concurrent = 7;
        store.save(&items, &queue_state).await.unwrap();

        // Simulate a crash after the temp write but before the rename.
        tokio::fs::write(dir.path().join(TMP_NAME), b"half-written garbage")
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.queue_state.max_concurrent, 7);
    }
}
