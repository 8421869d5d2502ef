//! Capturing a document from a URL or a tab without relying on the browser
//! download manager.

use crate::capability::PageCapability;
use crate::sink::{DownloadEvent, DownloadSink, DownloadSource};
use crate::types::TabInfo;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bodies pulled out of the page smaller than this are viewer shells, not documents.
pub const MIN_BUFFER_BYTES: usize = 1000;

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    pub status: u16,
    pub bytes: Vec<u8>,
}

/// Plain HTTP access to a document URL, outside the browser.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, referer: Option<&str>, user_agent: Option<&str>) -> Result<FetchedBody, String>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, referer: Option<&str>, user_agent: Option<&str>) -> Result<FetchedBody, String> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, user_agent.unwrap_or(FALLBACK_USER_AGENT))
            .header(ACCEPT, "application/pdf,application/octet-stream,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(FetchedBody {
            status,
            bytes: bytes.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured(DownloadEvent),
    /// The URL was already captured for this work item.
    Duplicate,
    NotDocument(String),
    Failed(String),
}

impl CaptureOutcome {
    /// One line for the planner's next observation.
    pub fn note(&self, url: &str) -> String {
        match self {
            CaptureOutcome::Captured(e) => format!(
                "DOWNLOAD COMPLETE: saved {} ({} KB) from {url}",
                e.suggested_name,
                e.byte_size / 1024
            ),
            CaptureOutcome::Duplicate => format!("{url} was already downloaded; do not download it again"),
            CaptureOutcome::NotDocument(why) => format!("{url} is not a PDF: {why}"),
            CaptureOutcome::Failed(why) => format!("capturing {url} failed: {why}"),
        }
    }
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Capture `url` into the sink: a direct HTTP request first, then the page's
/// own `fetch` so the request carries the site's session.
pub async fn capture_url(
    page: &mut dyn PageCapability,
    fetcher: &dyn DocumentFetcher,
    sink: &mut DownloadSink,
    url: &str,
    referer: Option<&str>,
) -> CaptureOutcome {
    if sink.is_known_url(url) {
        return CaptureOutcome::Duplicate;
    }

    let mut rejection = String::from("no body");

    // reqwest cannot resolve blob: URLs; only the page can.
    if !url.starts_with("blob:") {
        let ua = page.user_agent().await;
        match fetcher.fetch(url, referer, ua.as_deref()).await {
            Ok(body) if (200..300).contains(&body.status) && is_pdf(&body.bytes) => {
                return store(sink, url, &body.bytes, DownloadSource::DirectFetch);
            }
            Ok(body) => {
                debug!(url = %url, status = body.status, bytes = body.bytes.len(), "direct fetch did not return a PDF");
                rejection = format!("direct fetch returned HTTP {} without a PDF body", body.status);
            }
            Err(e) => {
                debug!(url = %url, error = %e, "direct fetch failed");
                rejection = format!("direct fetch failed: {e}");
            }
        }
    }

    match page.fetch_in_page(url).await {
        Ok(Some(bytes)) if bytes.len() > MIN_BUFFER_BYTES && is_pdf(&bytes) => {
            store(sink, url, &bytes, DownloadSource::BufferExtraction)
        }
        Ok(Some(bytes)) => CaptureOutcome::NotDocument(format!(
            "{rejection}; page body of {} bytes is not a PDF",
            bytes.len()
        )),
        Ok(None) => CaptureOutcome::NotDocument(rejection),
        Err(e) => {
            warn!(url = %url, error = %e, "buffer extraction failed");
            CaptureOutcome::Failed(e.to_string())
        }
    }
}

/// Switch to `tab` and capture the document it shows.
pub async fn capture_from_tab(
    page: &mut dyn PageCapability,
    fetcher: &dyn DocumentFetcher,
    sink: &mut DownloadSink,
    tab: &TabInfo,
) -> CaptureOutcome {
    let referer = page.current_url().await.ok();
    if !tab.active {
        if let Err(e) = page.switch_tab(&tab.handle).await {
            return CaptureOutcome::Failed(e.to_string());
        }
    }
    info!(tab = %tab.handle, url = %tab.url, "capturing document tab");
    capture_url(page, fetcher, sink, &tab.url, referer.as_deref()).await
}

fn store(sink: &mut DownloadSink, url: &str, bytes: &[u8], source: DownloadSource) -> CaptureOutcome {
    match sink.store_bytes(url, bytes, source, Some(url)) {
        Ok(Some(event)) => CaptureOutcome::Captured(event),
        Ok(None) => CaptureOutcome::Duplicate,
        Err(e) => CaptureOutcome::Failed(format!("writing to {}: {e}", sink.bucket().display())),
    }
}
