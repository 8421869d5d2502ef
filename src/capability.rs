//! The page capability seam: everything the agent can do to a live browser.

use crate::error::PageError;
use crate::sink::DownloadSender;
use crate::types::{PageState, TabInfo};
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Element descriptors are either `[eN]` ids from the DOM snapshot or CSS selectors.
#[async_trait]
pub trait PageCapability: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError>;
    async fn click(&mut self, target: &str) -> Result<(), PageError>;
    async fn fill(&mut self, target: &str, value: &str) -> Result<(), PageError>;
    async fn select(&mut self, target: &str, option: &str) -> Result<(), PageError>;
    async fn list_tabs(&mut self) -> Result<Vec<TabInfo>, PageError>;
    async fn switch_tab(&mut self, handle: &str) -> Result<(), PageError>;
    async fn close_tab(&mut self, handle: &str) -> Result<(), PageError>;
    async fn current_url(&mut self) -> Result<String, PageError>;

    /// Snapshot of the active tab (URL, title, simplified DOM) plus all tabs.
    async fn observe(&mut self) -> Result<PageState, PageError>;

    /// Fetch `url` from inside the page so the request carries the page's
    /// session. `Ok(None)` when the page could not produce a body.
    async fn fetch_in_page(&mut self, url: &str) -> Result<Option<Vec<u8>>, PageError>;

    async fn user_agent(&mut self) -> Option<String> {
        None
    }

    /// Route browser downloads of this context to `sender`.
    fn subscribe_downloads(&mut self, sender: DownloadSender);

    async fn close(&mut self) -> Result<(), PageError>;
}

/// Parameters for a fresh browser context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    pub label: String,
    /// Where browser downloads land. `None` denies downloads.
    pub download_dir: Option<PathBuf>,
}

impl ContextSpec {
    /// Throwaway context for the scout pass: downloads disabled.
    pub fn scout(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            download_dir: None,
        }
    }

    pub fn harvest(label: impl Into<String>, download_dir: PathBuf) -> Self {
        Self {
            label: label.into(),
            download_dir: Some(download_dir),
        }
    }
}

/// Opens a new, unshared browser context.
#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    async fn open(&self, spec: &ContextSpec) -> Result<Box<dyn PageCapability>, PageError>;
}

/// A browser context owned by exactly one scope.
///
/// `release` closes it explicitly; dropping the box without releasing still
/// tears the browser down.
pub struct ScopedContext {
    label: String,
    page: Box<dyn PageCapability>,
}

impl ScopedContext {
    pub async fn acquire(factory: &dyn CapabilityFactory, spec: &ContextSpec) -> Result<Self, PageError> {
        let page = factory.open(spec).await?;
        debug!(context = %spec.label, "browser context acquired");
        Ok(Self {
            label: spec.label.clone(),
            page,
        })
    }

    pub async fn release(mut self) {
        if let Err(e) = self.page.close().await {
            warn!(context = %self.label, error = %e, "closing browser context failed");
        } else {
            debug!(context = %self.label, "browser context released");
        }
    }
}

impl Deref for ScopedContext {
    type Target = dyn PageCapability;
    fn deref(&self) -> &Self::Target {
        self.page.as_ref()
    }
}

impl DerefMut for ScopedContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.page.as_mut()
    }
}
