//! A scripted website standing in for the browser and model collaborators.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use atlas_explore::{
    Browser, CancelHandle, CollaboratorError, Collaborators, IntentContext, PageAnalyzer,
    Trajectory, TrajectoryJudge,
};
use atlas_ir::types::{
    ActionKind, AnalysisReport, ExecutionOutcome, PageSnapshot, Task, TestCategory, TestIdea,
    TrajectoryLabel,
};
use atlas_store::{Atlas, EdgeStrategy};

pub const ORIGIN: &str = "https://app.test/";

pub fn url_of(page: &str) -> String {
    format!("{ORIGIN}{page}")
}

fn page_of(url: &str) -> String {
    url.trim_start_matches(ORIGIN).to_string()
}

/// Pages and the selectors that lead from one to another.
#[derive(Debug, Default)]
pub struct Site {
    links: BTreeMap<String, BTreeMap<String, String>>,
}

impl Site {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(mut self, from: &str, selector: &str, to: &str) -> Self {
        self.links
            .entry(from.to_string())
            .or_default()
            .insert(selector.to_string(), to.to_string());
        self
    }

    /// `home -#next-> p1 -#next-> p2 ...`
    pub fn chain(len: usize) -> Self {
        let mut site = Self::new();
        let mut prev = "home".to_string();
        for i in 1..len {
            let page = format!("p{i}");
            site = site.link(&prev, "#next", &page);
            prev = page;
        }
        site
    }

    fn target(&self, from: &str, selector: &str) -> Option<String> {
        self.links.get(from)?.get(selector).cloned()
    }

    fn selectors(&self, page: &str) -> Vec<String> {
        self.links
            .get(page)
            .map(|l| l.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct BrowserLog {
    pub stack: Vec<String>,
    pub navigations: usize,
    pub go_backs: usize,
    pub replays: usize,
    pub executed: Vec<String>,
    pub scripts: Vec<PathBuf>,
    last_action: Option<(String, String)>,
}

pub struct SiteBrowser {
    site: Arc<Site>,
    pub log: Mutex<BrowserLog>,
    action_delay: Option<Duration>,
}

impl SiteBrowser {
    pub fn new(site: Arc<Site>) -> Self {
        Self {
            site,
            log: Mutex::new(BrowserLog::default()),
            action_delay: None,
        }
    }

    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = Some(delay);
        self
    }

    fn current(&self) -> String {
        let log = self.log.lock().unwrap();
        log.stack.last().cloned().unwrap_or_else(|| "about:blank".into())
    }

    fn follow(&self, from: &str, selector: &str) -> bool {
        let Some(to) = self.site.target(from, selector) else {
            return false;
        };
        self.log.lock().unwrap().stack.push(to);
        true
    }
}

#[async_trait]
impl Browser for SiteBrowser {
    async fn navigate(&self, url: &str) -> Result<(), CollaboratorError> {
        let mut log = self.log.lock().unwrap();
        log.stack = vec![page_of(url)];
        log.navigations += 1;
        Ok(())
    }

    async fn page_snapshot(&self) -> Result<PageSnapshot, CollaboratorError> {
        let page = self.current();
        Ok(PageSnapshot {
            url: url_of(&page),
            dom_summary: format!("<main data-page=\"{page}\">"),
            title: page.clone(),
            dom_fingerprint: None,
        })
    }

    async fn screenshot(&self) -> Result<String, CollaboratorError> {
        Ok(format!("{}.png", self.current()))
    }

    async fn execute_intent(
        &self,
        intent: &str,
        context: &IntentContext,
    ) -> Result<ExecutionOutcome, CollaboratorError> {
        if let Some(delay) = self.action_delay {
            tokio::time::sleep(delay).await;
        }
        let from = self.current();
        let selector = context.task.selector.clone();
        {
            let mut log = self.log.lock().unwrap();
            log.executed.push(intent.to_string());
            log.last_action = Some((from.clone(), selector.clone()));
        }
        let moved = self.follow(&from, &selector);
        Ok(ExecutionOutcome {
            success: moved,
            dom_before: format!("<main data-page=\"{from}\">"),
            dom_after: format!("<main data-page=\"{}\">", self.current()),
            error: (!moved).then(|| format!("{selector} not found")),
            ..Default::default()
        })
    }

    async fn save_script(
        &self,
        path: &Path,
        _label: &TrajectoryLabel,
    ) -> Result<(), CollaboratorError> {
        let mut log = self.log.lock().unwrap();
        let (from, selector) = log
            .last_action
            .clone()
            .ok_or_else(|| CollaboratorError::failed("browser", "nothing to save"))?;
        let script = serde_json::json!({ "from": from, "selector": selector });
        std::fs::write(path, script.to_string())
            .map_err(|e| CollaboratorError::failed("browser", e.to_string()))?;
        log.scripts.push(path.to_path_buf());
        Ok(())
    }

    async fn go_back(&self) -> Result<(), CollaboratorError> {
        let mut log = self.log.lock().unwrap();
        if log.stack.len() > 1 {
            log.stack.pop();
        }
        log.go_backs += 1;
        Ok(())
    }

    async fn replay_script(&self, path: &Path) -> Result<(), CollaboratorError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CollaboratorError::failed("browser", e.to_string()))?;
        let script: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| CollaboratorError::failed("browser", e.to_string()))?;
        let from = script["from"].as_str().unwrap_or_default();
        let selector = script["selector"].as_str().unwrap_or_default();
        self.log.lock().unwrap().replays += 1;
        if self.current() != from || !self.follow(from, selector) {
            return Err(CollaboratorError::failed("browser", "script did not apply"));
        }
        Ok(())
    }
}

/// Proposes one click task per outgoing link and one test idea per page.
pub struct SiteAnalyzer {
    site: Arc<Site>,
    pub calls: AtomicUsize,
    fail: bool,
    cancel_after: Option<(usize, CancelHandle)>,
}

impl SiteAnalyzer {
    pub fn new(site: Arc<Site>) -> Self {
        Self {
            site,
            calls: AtomicUsize::new(0),
            fail: false,
            cancel_after: None,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Cancel the run from inside the `n`th analysis call.
    pub fn cancelling_after(mut self, n: usize, handle: CancelHandle) -> Self {
        self.cancel_after = Some((n, handle));
        self
    }
}

#[async_trait]
impl PageAnalyzer for SiteAnalyzer {
    async fn analyze(
        &self,
        _screenshot: &str,
        _dom_summary: &str,
        url: &str,
    ) -> Result<AnalysisReport, CollaboratorError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, handle)) = &self.cancel_after {
            if calls >= *n {
                handle.cancel();
            }
        }
        if self.fail {
            return Err(CollaboratorError::failed("analyzer", "model unavailable"));
        }
        let page = page_of(url);
        Ok(AnalysisReport {
            summary: format!("The {page} page"),
            frontier_tasks: self
                .site
                .selectors(&page)
                .into_iter()
                .map(|s| Task::new(s, ActionKind::Click))
                .collect(),
            test_ideas: vec![TestIdea::new(
                TestCategory::Boundary,
                format!("oversized input on {page}"),
            )],
        })
    }
}

pub struct FixedJudge {
    meaningful: bool,
    pub calls: AtomicUsize,
}

impl FixedJudge {
    pub fn new(meaningful: bool) -> Self {
        Self {
            meaningful,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TrajectoryJudge for FixedJudge {
    async fn label(&self, trajectory: &Trajectory) -> Result<TrajectoryLabel, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TrajectoryLabel {
            is_meaningful: self.meaningful,
            semantic_label: trajectory.action_description.clone(),
            script_name: String::new(),
            confidence: 0.9,
        })
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub atlas: Atlas,
    pub browser: Arc<SiteBrowser>,
    pub analyzer: Arc<SiteAnalyzer>,
    pub judge: Arc<FixedJudge>,
}

impl Harness {
    pub fn new(browser: SiteBrowser, analyzer: SiteAnalyzer, judge: FixedJudge) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let atlas = Atlas::open(dir.path().join("atlas"), EdgeStrategy::Auto).unwrap();
        Self {
            dir,
            atlas,
            browser: Arc::new(browser),
            analyzer: Arc::new(analyzer),
            judge: Arc::new(judge),
        }
    }

    pub fn for_site(site: Site, meaningful: bool) -> Self {
        let site = Arc::new(site);
        Self::new(
            SiteBrowser::new(site.clone()),
            SiteAnalyzer::new(site),
            FixedJudge::new(meaningful),
        )
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            browser: self.browser.clone(),
            analyzer: self.analyzer.clone(),
            judge: self.judge.clone(),
        }
    }
}
