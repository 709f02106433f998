//! Shared test harness: a mock origin that actually honors `Range`
//! requests, and a handler that records every event for assertions.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use warpdl::{DownloadError, DownloadHandler};

/// Deterministic test data: each byte is `offset % 251`.
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Responds like a range-capable origin: `206` with the requested slice and
/// a `Content-Range` header, `200` with the whole body when no range was
/// asked for. Optionally delays responses whose range starts at a given
/// offset, to make one part artificially slow.
pub struct RangeResponder {
    body: Vec<u8>,
    slow_start: Option<(u64, Duration)>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            slow_start: None,
        }
    }

    pub fn with_slow_range(mut self, start_offset: u64, delay: Duration) -> Self {
        self.slow_start = Some((start_offset, delay));
        self
    }
}

fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let range = header.strip_prefix("bytes=")?;
    let mut pieces = range.splitn(2, '-');
    let start: u64 = pieces.next()?.parse().ok()?;
    let end = pieces.next().and_then(|s| {
        if s.is_empty() {
            None
        } else {
            s.parse::<u64>().ok()
        }
    });
    Some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let Some((start, end)) = range else {
            return ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(self.body.clone());
        };

        let total = self.body.len() as u64;
        if start >= total {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{}", total));
        }
        let end = end.map(|e| e.min(total - 1)).unwrap_or(total - 1);
        let slice = self.body[start as usize..=end as usize].to_vec();

        let mut template = ResponseTemplate::new(206)
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, total))
            .set_body_bytes(slice);

        if let Some((slow_start, delay)) = self.slow_start {
            // One-byte probes are never delayed.
            if start == slow_start && end > start {
                template = template.set_delay(delay);
            }
        }
        template
    }
}

/// Responds `200` with the full body to every request, never advertising
/// range support, like a non-resumable origin.
pub struct FullBodyResponder {
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl FullBodyResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Respond for FullBodyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let mut template = ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

/// Starts a mock server serving `body` at `route` with range support.
pub async fn serve_ranged(body: Vec<u8>, route: &str) -> MockServer {
    let server = MockServer::start().await;
    mount_ranged(&server, body, route).await;
    server
}

pub async fn mount_ranged(server: &MockServer, body: Vec<u8>, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(RangeResponder::new(body))
        .mount(server)
        .await;
}

/// Records every handler event for later assertions.
#[derive(Default)]
pub struct RecordingHandler {
    pub progress_bytes: AtomicU64,
    pub resume_bytes: AtomicU64,
    pub progress_calls: AtomicU64,
    pub spawns: StdMutex<Vec<(String, i64, i64)>>,
    pub respawns: StdMutex<Vec<(String, i64, i64, i64)>>,
    pub completed: StdMutex<Option<(String, u64)>>,
    pub stopped: AtomicU64,
    pub compile_starts: AtomicU64,
    pub compile_completes: StdMutex<Vec<(String, u64)>>,
    pub errors: StdMutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn total_progress(&self) -> u64 {
        self.progress_bytes.load(Ordering::Acquire) + self.resume_bytes.load(Ordering::Acquire)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn respawn_count(&self) -> usize {
        self.respawns.lock().unwrap().len()
    }

    pub fn completed_total(&self) -> Option<u64> {
        self.completed.lock().unwrap().as_ref().map(|(_, n)| *n)
    }
}

#[async_trait]
impl DownloadHandler for RecordingHandler {
    async fn on_progress(&self, _part_hash: &str, n_bytes: u64) {
        self.progress_bytes.fetch_add(n_bytes, Ordering::AcqRel);
        self.progress_calls.fetch_add(1, Ordering::AcqRel);
    }

    async fn on_resume_progress(&self, _part_hash: &str, n_bytes: u64) {
        self.resume_bytes.fetch_add(n_bytes, Ordering::AcqRel);
    }

    async fn on_download_complete(&self, hash: &str, total_bytes: u64) {
        *self.completed.lock().unwrap() = Some((hash.to_string(), total_bytes));
    }

    async fn on_download_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::AcqRel);
    }

    async fn on_compile_start(&self, _part_hash: &str) {
        self.compile_starts.fetch_add(1, Ordering::AcqRel);
    }

    async fn on_compile_complete(&self, part_hash: &str, total_bytes: u64) {
        self.compile_completes
            .lock()
            .unwrap()
            .push((part_hash.to_string(), total_bytes));
    }

    async fn on_error(&self, part_hash: &str, error: &DownloadError) {
        self.errors
            .lock()
            .unwrap()
            .push(format!("{}: {}", part_hash, error));
    }

    async fn on_spawn_part(&self, part_hash: &str, ioff: i64, foff: i64) {
        self.spawns
            .lock()
            .unwrap()
            .push((part_hash.to_string(), ioff, foff));
    }

    async fn on_respawn_part(&self, part_hash: &str, already_read: i64, ioff: i64, foff: i64) {
        self.respawns
            .lock()
            .unwrap()
            .push((part_hash.to_string(), already_read, ioff, foff));
    }
}

/// Asserts that an item's parts tile `[0, total)` exactly: consecutive,
/// disjoint, and gap-free.
pub fn assert_parts_cover(item: &warpdl::Item, total: i64) {
    let parts = item.parts.read().unwrap();
    assert!(!parts.is_empty(), "item should have parts");
    let mut expected_start = 0i64;
    for (ioff, part) in parts.iter() {
        assert_eq!(
            *ioff, expected_start,
            "part at {} leaves a gap or overlap",
            ioff
        );
        let foff = part.final_offset.load(Ordering::Acquire);
        assert!(foff > *ioff, "part at {} has empty range", ioff);
        expected_start = foff;
    }
    assert_eq!(expected_start, total, "parts should cover the whole file");
}
