//! Download tracking for one work item.
//!
//! Every artifact that lands for a work item is appended to a [`DownloadSink`],
//! whichever path observed it: the browser writing into the bucket directory,
//! a direct HTTP fetch, or bytes pulled out of the page. The sink is the
//! single source of truth for "has a new artifact appeared".

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Channel the page capability uses to report browser downloads.
pub type DownloadSender = mpsc::UnboundedSender<DownloadEvent>;
pub type DownloadReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSource {
    BrowserEvent,
    DirectFetch,
    BufferExtraction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEvent {
    pub suggested_name: String,
    pub byte_size: u64,
    pub source: DownloadSource,
    pub saved_path: PathBuf,
    pub source_url: Option<String>,
}

impl DownloadEvent {
    /// Deduplication keys: the source URL when known, else the suggested
    /// name, plus the saved path in every case.
    fn dedup_keys(&self) -> [String; 2] {
        let primary = match &self.source_url {
            Some(url) => format!("url:{url}"),
            None => format!("name:{}", self.suggested_name),
        };
        [primary, format!("path:{}", self.saved_path.display())]
    }
}

/// Position in the sink's event sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SinkMark(usize);

#[derive(Debug)]
pub struct DownloadSink {
    bucket: PathBuf,
    events: Vec<DownloadEvent>,
    seen: HashSet<String>,
    inbox: Option<DownloadReceiver>,
}

impl DownloadSink {
    pub fn new(bucket: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            events: Vec::new(),
            seen: HashSet::new(),
            inbox: None,
        }
    }

    /// Sender for browser download events. Pending events are pulled in by
    /// [`DownloadSink::drain`]. A new subscription replaces the old inbox.
    pub fn subscribe(&mut self) -> DownloadSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbox = Some(rx);
        tx
    }

    /// Domain bucket directory the artifacts of this sink are written to.
    pub fn bucket(&self) -> &Path {
        &self.bucket
    }

    pub fn mark(&self) -> SinkMark {
        SinkMark(self.events.len())
    }

    /// Append `event` unless an event with the same key was already recorded.
    /// Returns whether the event was new.
    pub fn record(&mut self, event: DownloadEvent) -> bool {
        let keys = event.dedup_keys();
        if keys.iter().any(|k| self.seen.contains(k)) {
            debug!(name = %event.suggested_name, source = ?event.source, "duplicate download ignored");
            return false;
        }
        self.seen.extend(keys);
        info!(
            name = %event.suggested_name,
            bytes = event.byte_size,
            source = ?event.source,
            path = %event.saved_path.display(),
            "artifact recorded"
        );
        self.events.push(event);
        true
    }

    pub fn has_new_since(&self, mark: SinkMark) -> bool {
        self.count_since(mark) > 0
    }

    pub fn count_since(&self, mark: SinkMark) -> usize {
        self.events.len().saturating_sub(mark.0)
    }

    pub fn events(&self) -> &[DownloadEvent] {
        &self.events
    }

    pub fn artifact_paths(&self) -> BTreeSet<PathBuf> {
        self.events.iter().map(|e| e.saved_path.clone()).collect()
    }

    pub fn is_known_url(&self, url: &str) -> bool {
        self.seen.contains(&format!("url:{url}"))
    }

    /// Move every pending browser event from the inbox into the sink.
    pub fn drain(&mut self) -> usize {
        let mut pending = Vec::new();
        if let Some(rx) = self.inbox.as_mut() {
            while let Ok(event) = rx.try_recv() {
                pending.push(event);
            }
        }
        pending.into_iter().map(|e| self.record(e)).filter(|new| *new).count()
    }

    /// Write captured bytes into the bucket and record them.
    ///
    /// Returns `Ok(None)` when the URL was already captured. A file name that
    /// is already taken on disk or by a recorded artifact gets a numeric
    /// suffix; existing files are never overwritten.
    pub fn store_bytes(
        &mut self,
        name_hint: &str,
        bytes: &[u8],
        source: DownloadSource,
        source_url: Option<&str>,
    ) -> std::io::Result<Option<DownloadEvent>> {
        if source_url.is_some_and(|u| self.is_known_url(u)) {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.bucket)?;
        let (name, path) = self.free_path(&clean_filename(name_hint));
        std::fs::write(&path, bytes)?;
        let event = DownloadEvent {
            suggested_name: name,
            byte_size: bytes.len() as u64,
            source,
            saved_path: path,
            source_url: source_url.map(str::to_string),
        };
        if self.record(event.clone()) {
            Ok(Some(event))
        } else {
            Ok(None)
        }
    }

    /// First `stem.ext`, `stem-2.ext`, `stem-3.ext`... that neither exists in
    /// the bucket nor belongs to a recorded artifact.
    fn free_path(&self, name: &str) -> (String, PathBuf) {
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
            _ => (name, String::new()),
        };
        let mut candidate = name.to_string();
        let mut n = 1;
        loop {
            let path = self.bucket.join(&candidate);
            let taken = path.exists() || self.seen.contains(&format!("path:{}", path.display()));
            if !taken {
                return (candidate, path);
            }
            n += 1;
            candidate = format!("{stem}-{n}{ext}");
        }
    }
}

/// File-system diffing over a bucket directory.
///
/// Files present at construction form the baseline. `poll` reports files that
/// appeared since, once they are complete (no in-progress browser suffix).
#[derive(Debug, Clone)]
pub struct DirectoryWatch {
    dir: PathBuf,
    known: HashSet<PathBuf>,
}

const PARTIAL_SUFFIXES: [&str; 4] = [".crdownload", ".part", ".tmp", ".download"];

impl DirectoryWatch {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let known = list_files(&dir).into_iter().collect();
        Self { dir, known }
    }

    pub fn with_baseline(dir: impl Into<PathBuf>, baseline: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            known: baseline.into_iter().collect(),
        }
    }

    pub fn poll(&mut self) -> Vec<DownloadEvent> {
        let mut fresh = Vec::new();
        for path in list_files(&self.dir) {
            if self.known.contains(&path) || is_partial(&path) {
                continue;
            }
            let byte_size = match std::fs::metadata(&path) {
                Ok(m) if m.len() > 0 => m.len(),
                _ => continue,
            };
            self.known.insert(path.clone());
            let suggested_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            fresh.push(DownloadEvent {
                suggested_name,
                byte_size,
                source: DownloadSource::BrowserEvent,
                saved_path: path,
                source_url: None,
            });
        }
        fresh
    }
}

fn is_partial(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.starts_with('.') || PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Regular files directly inside `dir`, sorted. A missing directory is empty.
pub fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Bucket name for a target URL: host without `www.` and the common TLDs.
pub fn domain_key(target: &str) -> String {
    let target = target.trim().trim_start_matches('@');
    let host = url::Url::parse(target)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    let key = host
        .replace("www.", "")
        .replace(".com", "")
        .replace(".net", "")
        .replace(".org", "");
    if key.is_empty() { "misc".to_string() } else { key }
}

/// Turn a URL or suggested file name into a safe `.pdf` file name.
pub fn clean_filename(raw: &str) -> String {
    let without_query = raw.split(['?', '#']).next().unwrap_or(raw);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query);
    let mut name = last
        .replace("%20", "-")
        .replace(' ', "-")
        .replace("%2B", "+")
        .replace(['\\', ':'], "-");
    if name.is_empty() || name == "." || name == ".." {
        name = "document".to_string();
    }
    if !name.to_lowercase().contains(".pdf") {
        name.push_str(".pdf");
    }
    name
}
