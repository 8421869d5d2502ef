#![allow(dead_code)]

use async_trait::async_trait;
use om_harvester::brain::{Planner, PlannerFactory};
use om_harvester::capability::{CapabilityFactory, ContextSpec, PageCapability};
use om_harvester::capture::{DocumentFetcher, FetchedBody};
use om_harvester::error::{PageError, PlannerError};
use om_harvester::orchestrator::Settings;
use om_harvester::sink::{DownloadEvent, DownloadSender, DownloadSource};
use om_harvester::strategy::StepCaps;
use om_harvester::types::{AgentAction, PageState, TabInfo};
use om_harvester::usage::{PlannerRole, TokenUsage};
use om_harvester::config;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PER_CALL: TokenUsage = TokenUsage { input: 100, output: 20 };

pub fn click(target: &str) -> AgentAction {
    AgentAction::Click { target: target.into() }
}

pub fn fill(target: &str, value: &str) -> AgentAction {
    AgentAction::FillField {
        target: target.into(),
        value: value.into(),
    }
}

pub fn done(message: &str) -> AgentAction {
    AgentAction::DeclareDone { message: message.into() }
}

pub fn custom(name: &str, args: serde_json::Value) -> AgentAction {
    AgentAction::InvokeCustomAction {
        name: name.into(),
        args,
    }
}

pub fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut body = b"%PDF-1.4\n".to_vec();
    body.resize(len.max(body.len()), b'x');
    body
}

// ---------------------------------------------------------------- planner

/// Replays a fixed list of actions, then repeats `fallback` (or errors).
pub struct ScriptedPlanner {
    script: VecDeque<AgentAction>,
    fallback: Option<AgentAction>,
    calls: Arc<AtomicUsize>,
    observations: Arc<Mutex<Vec<PageState>>>,
    usage: TokenUsage,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<AgentAction>) -> Self {
        Self {
            script: script.into(),
            fallback: None,
            calls: Arc::new(AtomicUsize::new(0)),
            observations: Arc::new(Mutex::new(Vec::new())),
            usage: TokenUsage::default(),
        }
    }

    pub fn repeating(action: AgentAction) -> Self {
        let mut p = Self::new(Vec::new());
        p.fallback = Some(action);
        p
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn observations(&self) -> Arc<Mutex<Vec<PageState>>> {
        self.observations.clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    fn start_task(&mut self, _task: &str) {}

    fn observe(&mut self, state: &PageState) {
        self.observations.lock().unwrap().push(state.clone());
    }

    async fn next_action(&mut self) -> Result<AgentAction, PlannerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.usage += PER_CALL;
        if let Some(action) = self.script.pop_front() {
            return Ok(action);
        }
        self.fallback
            .clone()
            .ok_or_else(|| PlannerError::Parse("script exhausted".into()))
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

/// Never answers; used to exercise cancellation.
pub struct StalledPlanner;

#[async_trait]
impl Planner for StalledPlanner {
    fn start_task(&mut self, _task: &str) {}
    fn observe(&mut self, _state: &PageState) {}
    async fn next_action(&mut self) -> Result<AgentAction, PlannerError> {
        std::future::pending().await
    }
    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

/// Hands out one script per created planner, per role.
#[derive(Default)]
pub struct ScriptedPlanners {
    scout: Mutex<VecDeque<Vec<AgentAction>>>,
    main: Mutex<VecDeque<Vec<AgentAction>>>,
    pub scout_calls: Arc<AtomicUsize>,
    pub main_calls: Arc<AtomicUsize>,
    pub created: Mutex<Vec<PlannerRole>>,
}

impl ScriptedPlanners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scout(self, script: Vec<AgentAction>) -> Self {
        self.scout.lock().unwrap().push_back(script);
        self
    }

    pub fn main(self, script: Vec<AgentAction>) -> Self {
        self.main.lock().unwrap().push_back(script);
        self
    }

    pub fn created(&self, role: PlannerRole) -> usize {
        self.created.lock().unwrap().iter().filter(|r| **r == role).count()
    }
}

impl PlannerFactory for ScriptedPlanners {
    fn create(&self, role: PlannerRole) -> Box<dyn Planner> {
        self.created.lock().unwrap().push(role);
        let (queue, counter) = match role {
            PlannerRole::Scout => (&self.scout, &self.scout_calls),
            PlannerRole::Main => (&self.main, &self.main_calls),
        };
        let script = queue.lock().unwrap().pop_front().unwrap_or_default();
        let mut planner = ScriptedPlanner::new(script);
        planner.calls = counter.clone();
        Box::new(planner)
    }
}

// ---------------------------------------------------------------- browser

/// Behaviour of one mocked site, keyed by element target.
#[derive(Debug, Clone, Default)]
pub struct MockSite {
    downloads: HashMap<String, String>,
    failures: HashMap<String, PageError>,
    popups: HashMap<String, String>,
    missing: Vec<String>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clicking `target` makes the browser save `file` into the download dir.
    pub fn download_on(mut self, target: &str, file: &str) -> Self {
        self.downloads.insert(target.into(), file.into());
        self
    }

    pub fn fail_on(mut self, target: &str, err: PageError) -> Self {
        self.failures.insert(target.into(), err);
        self
    }

    /// Clicking `target` opens a new tab at `url`.
    pub fn popup_on(mut self, target: &str, url: &str) -> Self {
        self.popups.insert(target.into(), url.into());
        self
    }

    pub fn missing(mut self, target: &str) -> Self {
        self.missing.push(target.into());
        self
    }
}

pub struct MockPage {
    sites: Arc<HashMap<String, MockSite>>,
    bodies: Arc<HashMap<String, Vec<u8>>>,
    tabs: Vec<(String, String)>,
    active: usize,
    next_handle: usize,
    download_dir: Option<PathBuf>,
    sender: Option<DownloadSender>,
    log: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl MockPage {
    fn site(&self) -> MockSite {
        let url = &self.tabs[self.active].1;
        self.sites.get(url).cloned().unwrap_or_default()
    }

    fn log(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }

    fn check(&self, target: &str) -> Result<MockSite, PageError> {
        let site = self.site();
        if let Some(err) = site.failures.get(target) {
            return Err(err.clone());
        }
        if site.missing.iter().any(|m| m == target) {
            return Err(PageError::NotApplicable(format!("no element {target}")));
        }
        Ok(site)
    }
}

#[async_trait]
impl PageCapability for MockPage {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        self.log(format!("navigate {url}"));
        self.tabs[self.active].1 = url.to_string();
        if let Some(err) = self.site().failures.get("navigate") {
            return Err(err.clone());
        }
        Ok(())
    }

    async fn click(&mut self, target: &str) -> Result<(), PageError> {
        self.log(format!("click {target}"));
        let site = self.check(target)?;
        if let (Some(file), Some(dir)) = (site.downloads.get(target), self.download_dir.as_ref()) {
            let path = dir.join(file);
            let body = pdf_bytes(4096);
            std::fs::write(&path, &body).map_err(|e| PageError::Browser(e.to_string()))?;
            if let Some(tx) = &self.sender {
                let _ = tx.send(DownloadEvent {
                    suggested_name: file.clone(),
                    byte_size: body.len() as u64,
                    source: DownloadSource::BrowserEvent,
                    saved_path: path,
                    source_url: None,
                });
            }
        }
        if let Some(url) = site.popups.get(target) {
            self.next_handle += 1;
            self.tabs.push((format!("T{}", self.next_handle), url.clone()));
        }
        Ok(())
    }

    async fn fill(&mut self, target: &str, value: &str) -> Result<(), PageError> {
        self.log(format!("fill {target}={value}"));
        self.check(target).map(|_| ())
    }

    async fn select(&mut self, target: &str, option: &str) -> Result<(), PageError> {
        self.log(format!("select {target}={option}"));
        self.check(target).map(|_| ())
    }

    async fn list_tabs(&mut self) -> Result<Vec<TabInfo>, PageError> {
        Ok(self
            .tabs
            .iter()
            .enumerate()
            .map(|(i, (handle, url))| TabInfo {
                handle: handle.clone(),
                url: url.clone(),
                active: i == self.active,
            })
            .collect())
    }

    async fn switch_tab(&mut self, handle: &str) -> Result<(), PageError> {
        self.log(format!("switch {handle}"));
        self.active = self
            .tabs
            .iter()
            .position(|(h, _)| h == handle)
            .ok_or_else(|| PageError::NotApplicable(format!("no tab {handle}")))?;
        Ok(())
    }

    async fn close_tab(&mut self, handle: &str) -> Result<(), PageError> {
        self.log(format!("close {handle}"));
        let idx = self
            .tabs
            .iter()
            .position(|(h, _)| h == handle)
            .ok_or_else(|| PageError::NotApplicable(format!("no tab {handle}")))?;
        self.tabs.remove(idx);
        if self.tabs.is_empty() {
            self.next_handle += 1;
            self.tabs.push((format!("T{}", self.next_handle), "about:blank".into()));
        }
        self.active = 0;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, PageError> {
        Ok(self.tabs[self.active].1.clone())
    }

    async fn observe(&mut self) -> Result<PageState, PageError> {
        Ok(PageState {
            url: self.tabs[self.active].1.clone(),
            title: "Mock listing".into(),
            dom_snapshot: "[e0] button \"Download OM\"  <doc?>".into(),
            tabs: self.list_tabs().await?,
            ..Default::default()
        })
    }

    async fn fetch_in_page(&mut self, url: &str) -> Result<Option<Vec<u8>>, PageError> {
        self.log(format!("fetch_in_page {url}"));
        Ok(self.bodies.get(url).cloned())
    }

    fn subscribe_downloads(&mut self, sender: DownloadSender) {
        self.sender = Some(sender);
    }

    async fn close(&mut self) -> Result<(), PageError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`MockPage`]s and records every context it hands out.
#[derive(Default)]
pub struct MockBrowser {
    sites: Arc<HashMap<String, MockSite>>,
    bodies: Arc<HashMap<String, Vec<u8>>>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub opened: Mutex<Vec<ContextSpec>>,
    pub closed: Arc<AtomicUsize>,
    pub fail_open: bool,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(mut self, url: &str, site: MockSite) -> Self {
        Arc::make_mut(&mut self.sites).insert(url.into(), site);
        self
    }

    /// Body returned by the page's own `fetch` for `url`.
    pub fn in_page_body(mut self, url: &str, body: Vec<u8>) -> Self {
        Arc::make_mut(&mut self.bodies).insert(url.into(), body);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<ContextSpec> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn page(&self, download_dir: Option<&Path>) -> MockPage {
        MockPage {
            sites: self.sites.clone(),
            bodies: self.bodies.clone(),
            tabs: vec![("T0".into(), "about:blank".into())],
            active: 0,
            next_handle: 0,
            download_dir: download_dir.map(Path::to_path_buf),
            sender: None,
            log: self.log.clone(),
            closed: self.closed.clone(),
        }
    }
}

#[async_trait]
impl CapabilityFactory for MockBrowser {
    async fn open(&self, spec: &ContextSpec) -> Result<Box<dyn PageCapability>, PageError> {
        if self.fail_open {
            return Err(PageError::Browser("launch failed".into()));
        }
        self.opened.lock().unwrap().push(spec.clone());
        Ok(Box::new(self.page(spec.download_dir.as_deref())))
    }
}

// ---------------------------------------------------------------- http

#[derive(Default)]
pub struct MockFetcher {
    bodies: HashMap<String, FetchedBody>,
    pub calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, url: &str, status: u16, bytes: Vec<u8>) -> Self {
        self.bodies.insert(url.into(), FetchedBody { status, bytes });
        self
    }
}

#[async_trait]
impl DocumentFetcher for MockFetcher {
    async fn fetch(&self, url: &str, _referer: Option<&str>, _user_agent: Option<&str>) -> Result<FetchedBody, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| format!("connection refused: {url}"))
    }
}

pub fn settings(downloads_dir: &Path) -> Settings {
    Settings {
        downloads_dir: downloads_dir.to_path_buf(),
        caps: StepCaps {
            scout: 6,
            single: 12,
            batch: 30,
        },
        inter_item_delay: Duration::from_secs(10),
        post_action_wait: Duration::from_millis(2500),
        settle_wait: Duration::from_secs(5),
        contact: config::Contact::default(),
        model: "gpt-4o".into(),
        pricing: config::Pricing::default(),
    }
}
