use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel for "the origin did not tell us the size".
pub const UNKNOWN_SIZE: i64 = -1;

/// Upper bound of a part whose length is not known yet.
pub(crate) const OPEN_END: i64 = i64::MAX;

/// One contiguous byte range of the target file.
///
/// The map key in [`Item::parts`] is the part's original initial offset and
/// never changes; `final_offset` is the *exclusive* upper bound and shrinks
/// when a faster worker steals the tail of this range. The cell is shared
/// with the live worker so both persistence and the victim observe a steal
/// through the same atomic.
#[derive(Debug, Serialize, Deserialize)]
pub struct ItemPart {
    pub hash: String,
    #[serde(with = "shared_atomic_i64")]
    pub final_offset: Arc<AtomicI64>,
    #[serde(with = "atomic_bool", default = "atomic_bool_false")]
    pub compiled: AtomicBool,
}

impl ItemPart {
    pub fn new(hash: String, final_offset: i64) -> Self {
        Self {
            hash,
            final_offset: Arc::new(AtomicI64::new(final_offset)),
            compiled: AtomicBool::new(false),
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }
}

/// Per-download persistent state.
///
/// The owning `Downloader` mutates counters through atomics while running;
/// the `Manager` reads for listing and serializes for persistence. Structural
/// changes (inserting a stolen part) take the short `parts` write lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct Item {
    pub hash: String,
    pub name: String,
    pub url: String,
    /// Original request headers as ordered key/value pairs.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub date_added: u64,
    #[serde(with = "atomic_i64")]
    pub total_size: AtomicI64,
    #[serde(with = "atomic_i64")]
    pub downloaded: AtomicI64,
    pub download_location: String,
    pub absolute_location: String,
    #[serde(default)]
    pub child_hash: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub children: bool,
    pub resumable: bool,
    #[serde(with = "locked_parts")]
    pub parts: RwLock<BTreeMap<i64, ItemPart>>,
}

impl Item {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        name: String,
        headers: Vec<(String, String)>,
        total_size: i64,
        resumable: bool,
        download_location: String,
        absolute_location: String,
        child_hash: Option<String>,
        hidden: bool,
    ) -> Self {
        let hash = derive_item_hash(&url, &headers);
        let children = child_hash.is_some();
        Self {
            hash,
            name,
            url,
            headers,
            date_added: unix_now(),
            total_size: AtomicI64::new(total_size),
            downloaded: AtomicI64::new(0),
            download_location,
            absolute_location,
            child_hash,
            hidden,
            children,
            resumable,
            parts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn total_size(&self) -> i64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn downloaded(&self) -> i64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub(crate) fn add_downloaded(&self, n: i64) {
        self.downloaded.fetch_add(n, Ordering::AcqRel);
    }

    /// Path of the assembled output file.
    pub fn output_path(&self) -> PathBuf {
        Path::new(&self.absolute_location).join(&self.name)
    }

    /// Path of one part's temporary file.
    pub fn part_path(&self, part_hash: &str) -> PathBuf {
        Path::new(&self.absolute_location).join(format!("{}.wpart.{}", self.name, part_hash))
    }

    /// A download counts as completed once every part has been appended to
    /// the final file.
    pub fn is_completed(&self) -> bool {
        let parts = self.parts.read().expect("parts lock poisoned");
        !parts.is_empty() && parts.values().all(|p| p.is_compiled())
    }

    /// Sum of bytes actually on disk for this item: full segment length for
    /// compiled parts, current part-file length otherwise. Used to clamp the
    /// persisted `downloaded` counter after a crash. Snapshots the parts
    /// under the lock, then probes the part files without holding it.
    pub(crate) async fn bytes_on_disk(&self) -> i64 {
        let specs: Vec<(String, bool, i64)> = {
            let parts = self.parts.read().expect("parts lock poisoned");
            parts
                .iter()
                .map(|(ioff, part)| {
                    let foff = part.final_offset.load(Ordering::Acquire);
                    let seg_len = if foff == OPEN_END { i64::MAX } else { foff - ioff };
                    (part.hash.clone(), part.is_compiled(), seg_len)
                })
                .collect()
        };

        let mut sum = 0i64;
        for (hash, compiled, seg_len) in specs {
            if compiled {
                sum = sum.saturating_add(seg_len);
            } else {
                let on_disk = tokio::fs::metadata(self.part_path(&hash))
                    .await
                    .map(|m| m.len() as i64)
                    .unwrap_or(0);
                sum = sum.saturating_add(on_disk.min(seg_len));
            }
        }
        sum
    }
}

/// Deterministic item identity: the same URL with the same ordered headers
/// resolves to the same hash across daemon restarts.
pub fn derive_item_hash(url: &str, headers: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    for (key, value) in headers {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn atomic_bool_false() -> AtomicBool {
    AtomicBool::new(false)
}

mod atomic_i64 {
    use std::sync::atomic::{AtomicI64, Ordering};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &AtomicI64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(v.load(Ordering::Acquire))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<AtomicI64, D::Error> {
        i64::deserialize(d).map(AtomicI64::new)
    }
}

mod shared_atomic_i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Arc<AtomicI64>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(v.load(Ordering::Acquire))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Arc<AtomicI64>, D::Error> {
        i64::deserialize(d).map(|v| Arc::new(AtomicI64::new(v)))
    }
}

mod atomic_bool {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &AtomicBool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(v.load(Ordering::Acquire))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<AtomicBool, D::Error> {
        bool::deserialize(d).map(AtomicBool::new)
    }
}

mod locked_parts {
    use std::collections::BTreeMap;
    use std::sync::RwLock;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ItemPart;

    pub fn serialize<S: Serializer>(
        v: &RwLock<BTreeMap<i64, ItemPart>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let guard = v.read().map_err(|_| serde::ser::Error::custom("parts lock poisoned"))?;
        guard.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<RwLock<BTreeMap<i64, ItemPart>>, D::Error> {
        BTreeMap::deserialize(d).map(RwLock::new)
    }
}
