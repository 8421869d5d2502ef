use crate::capability::{CapabilityFactory, ContextSpec, PageCapability};
use crate::config;
use crate::dom;
use crate::error::PageError;
use crate::sink::{DirectoryWatch, DownloadSender};
use crate::types::{PageState, TabInfo};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::{SetDownloadBehavior, SetDownloadBehaviorBehaviorOption};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Launches one Chrome process per context. Each gets its own throwaway
/// profile, so nothing leaks between the scout pass and the main run, or
/// between work items.
pub struct ChromeFactory {
    browser: config::Browser,
}

impl ChromeFactory {
    pub fn new(browser: config::Browser) -> Self {
        Self { browser }
    }
}

#[async_trait]
impl CapabilityFactory for ChromeFactory {
    async fn open(&self, spec: &ContextSpec) -> Result<Box<dyn PageCapability>, PageError> {
        let cfg = self.browser.clone();
        let spec = spec.clone();
        let session = blocking(move || ChromeSession::launch(&cfg, &spec)).await?;
        Ok(Box::new(session))
    }
}

/// A live Chrome process and the tab the agent is currently driving.
pub struct ChromeSession {
    label: String,
    browser: Browser,
    tab: Arc<Tab>,
    download_dir: Option<PathBuf>,
    watcher: Option<JoinHandle<()>>,
}

impl ChromeSession {
    fn launch(cfg: &config::Browser, spec: &ContextSpec) -> Result<Self, PageError> {
        info!(context = %spec.label, headless = cfg.headless, "launching Chrome");

        let owned_args: Vec<OsString> = cfg.extra_args.iter().map(OsString::from).collect();
        let options = LaunchOptions {
            headless: cfg.headless,
            path: cfg.chrome_path.clone(),
            window_size: Some((cfg.window_width, cfg.window_height)),
            args: owned_args.iter().map(|a| a.as_os_str()).collect(),
            idle_browser_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            ..Default::default()
        };

        let browser = Browser::new(options).map_err(|e| PageError::Browser(format!("launch failed: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| PageError::Browser(format!("opening tab failed: {e}")))?;

        if let Some(dir) = &spec.download_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| PageError::Browser(format!("download dir {}: {e}", dir.display())))?;
        }
        apply_download_behavior(&tab, spec.download_dir.as_deref())?;

        debug!(context = %spec.label, "Chrome ready");
        Ok(Self {
            label: spec.label.clone(),
            browser,
            tab,
            download_dir: spec.download_dir.clone(),
            watcher: None,
        })
    }

    fn tabs(&self) -> Result<Vec<Arc<Tab>>, PageError> {
        let tabs = self.browser.get_tabs();
        let guard = tabs
            .lock()
            .map_err(|_| PageError::Browser("tab list lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn find_tab(&self, handle: &str) -> Result<Arc<Tab>, PageError> {
        self.tabs()?
            .into_iter()
            .find(|t| t.get_target_id() == handle)
            .ok_or_else(|| PageError::NotApplicable(format!("no tab with handle {handle}")))
    }

    fn tab_infos(&self) -> Result<Vec<TabInfo>, PageError> {
        Ok(self
            .tabs()?
            .iter()
            .map(|t| TabInfo {
                handle: t.get_target_id().clone(),
                url: t.get_url(),
                active: Arc::ptr_eq(t, &self.tab),
            })
            .collect())
    }
}

#[async_trait]
impl PageCapability for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        let tab = self.tab.clone();
        let url = url.to_string();
        blocking(move || {
            match tab.navigate_to(&url).and_then(|t| t.wait_until_navigated()) {
                Ok(_) => {}
                // Chrome aborts the navigation when the response is a download.
                Err(e) if e.to_string().contains("ERR_ABORTED") => {
                    debug!(url = %url, "navigation turned into a download");
                    return Ok(());
                }
                Err(e) => return Err(classify(e, "navigate")),
            }
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        })
        .await
    }

    async fn click(&mut self, target: &str) -> Result<(), PageError> {
        let tab = self.tab.clone();
        let selector = dom::resolve_selector(target);
        blocking(move || {
            let el = tab.find_element(&selector).map_err(|e| classify(e, "click"))?;
            el.click().map_err(|e| classify(e, "click"))?;
            std::thread::sleep(Duration::from_millis(1000));
            Ok(())
        })
        .await
    }

    async fn fill(&mut self, target: &str, value: &str) -> Result<(), PageError> {
        let tab = self.tab.clone();
        let selector = dom::resolve_selector(target);
        let value = value.to_string();
        blocking(move || {
            let el = tab.find_element(&selector).map_err(|e| classify(e, "fill"))?;
            el.click().map_err(|e| classify(e, "fill"))?;
            tab.evaluate(&dom::clear_value_js(&selector), false)
                .map_err(|e| classify(e, "fill"))?;
            tab.type_str(&value).map_err(|e| classify(e, "fill"))?;
            Ok(())
        })
        .await
    }

    async fn select(&mut self, target: &str, option: &str) -> Result<(), PageError> {
        let tab = self.tab.clone();
        let selector = dom::resolve_selector(target);
        let js = dom::select_option_js(&selector, option);
        let option = option.to_string();
        blocking(move || {
            let result = tab.evaluate(&js, false).map_err(|e| classify(e, "select"))?;
            match result.value.as_ref().and_then(|v| v.as_str()) {
                Some("ok") => Ok(()),
                Some("no-option") => Err(PageError::NotApplicable(format!(
                    "no option '{option}' in {selector}"
                ))),
                _ => Err(PageError::NotApplicable(format!("no select element {selector}"))),
            }
        })
        .await
    }

    async fn list_tabs(&mut self) -> Result<Vec<TabInfo>, PageError> {
        self.tab_infos()
    }

    async fn switch_tab(&mut self, handle: &str) -> Result<(), PageError> {
        let tab = self.find_tab(handle)?;
        let front = tab.clone();
        let dir = self.download_dir.clone();
        blocking(move || {
            front.bring_to_front().map_err(|e| classify(e, "switch_tab"))?;
            // Tabs opened by the page do not inherit the download directory.
            apply_download_behavior(&front, dir.as_deref())
        })
        .await?;
        self.tab = tab;
        Ok(())
    }

    async fn close_tab(&mut self, handle: &str) -> Result<(), PageError> {
        let tab = self.find_tab(handle)?;
        let closing_active = Arc::ptr_eq(&tab, &self.tab);
        blocking(move || {
            tab.close(true).map_err(|e| classify(e, "close_tab"))?;
            Ok(())
        })
        .await?;
        if closing_active {
            let remaining = self.tabs()?;
            match remaining.into_iter().find(|t| t.get_target_id() != handle) {
                Some(next) => self.tab = next,
                None => {
                    self.tab = self
                        .browser
                        .new_tab()
                        .map_err(|e| PageError::Browser(format!("opening tab failed: {e}")))?
                }
            }
        }
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, PageError> {
        Ok(self.tab.get_url())
    }

    async fn observe(&mut self) -> Result<PageState, PageError> {
        let tab = self.tab.clone();
        let tabs = self.tab_infos()?;
        blocking(move || {
            let url = tab.get_url();
            let title = dom::get_page_title(&tab).unwrap_or_else(|_| "untitled".into());
            let dom_snapshot = dom::capture_dom_snapshot(&tab).unwrap_or_default();
            Ok(PageState {
                url,
                title,
                dom_snapshot,
                tabs,
                ..Default::default()
            })
        })
        .await
    }

    async fn fetch_in_page(&mut self, url: &str) -> Result<Option<Vec<u8>>, PageError> {
        let tab = self.tab.clone();
        let url = url.to_string();
        blocking(move || dom::fetch_bytes(&tab, &url).map_err(|e| classify(e, "fetch_in_page"))).await
    }

    async fn user_agent(&mut self) -> Option<String> {
        let tab = self.tab.clone();
        blocking(move || dom::user_agent(&tab).map_err(|e| classify(e, "user_agent")))
            .await
            .ok()
            .filter(|ua| !ua.is_empty())
    }

    fn subscribe_downloads(&mut self, sender: DownloadSender) {
        let Some(dir) = self.download_dir.clone() else {
            return;
        };
        if let Some(old) = self.watcher.take() {
            old.abort();
        }
        let label = self.label.clone();
        let mut watch = DirectoryWatch::new(dir);
        self.watcher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DOWNLOAD_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                for event in watch.poll() {
                    debug!(context = %label, name = %event.suggested_name, "browser download landed");
                    if sender.send(event).is_err() {
                        return;
                    }
                }
            }
        }));
    }

    async fn close(&mut self) -> Result<(), PageError> {
        if let Some(w) = self.watcher.take() {
            w.abort();
        }
        let tabs = self.tabs()?;
        blocking(move || {
            for t in tabs {
                if let Err(e) = t.close(false) {
                    warn!(error = %e, "closing tab failed");
                }
            }
            Ok(())
        })
        .await
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if let Some(w) = self.watcher.take() {
            w.abort();
        }
    }
}

fn apply_download_behavior(tab: &Tab, dir: Option<&Path>) -> Result<(), PageError> {
    let method = match dir {
        Some(dir) => SetDownloadBehavior {
            behavior: SetDownloadBehaviorBehaviorOption::Allow,
            download_path: Some(dir.to_string_lossy().into_owned()),
        },
        None => SetDownloadBehavior {
            behavior: SetDownloadBehaviorBehaviorOption::Deny,
            download_path: None,
        },
    };
    tab.call_method(method)
        .map_err(|e| PageError::Browser(format!("setting download behavior failed: {e}")))?;
    Ok(())
}

/// Run a blocking headless_chrome call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, PageError>
where
    F: FnOnce() -> Result<T, PageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PageError::Browser(format!("browser task panicked: {e}")))?
}

fn classify(err: anyhow::Error, what: &str) -> PageError {
    let msg = format!("{what}: {err:#}");
    let lower = msg.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        PageError::Timeout(msg)
    } else if lower.contains("element") && (lower.contains("find") || lower.contains("found")) {
        PageError::NotApplicable(msg)
    } else if lower.contains("connection closed") || lower.contains("disconnected") {
        PageError::Closed
    } else {
        PageError::Browser(msg)
    }
}
