//! In-process stand-ins for the browser and the dataset, used by unit and
//! end-to-end tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::LeadRecord,
    error::HarvestError,
    services::{
        merge_records, ordered, BrowserSession, LeadStore, MapsDirectory, MergeReport, PageError,
        SessionManager,
    },
};

pub const TEST_BASE_URL: &str = "https://maps.example.com/maps";

const END_OF_LIST: &str = "<p class=\"HlvSq\">You've reached the end of the list.</p>";
const BLANK: &str = "<html><head></head><body></body></html>";
const DEAD_SESSION: &str = "invalid session id: session deleted because of page crash";

#[derive(Debug, Clone)]
pub struct FeedScript {
    pub html: String,
    /// Feed height after n scrolls. The last entry repeats.
    pub heights: Vec<i64>,
    pub end_marker_after: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum ScriptedPage {
    Feed(FeedScript),
    Detail(String),
    Redirect(String),
    Unreachable,
    Panic,
}

pub fn search_url(query: &str) -> String {
    MapsDirectory::new(TEST_BASE_URL).search_url(query)
}

pub fn place_url(name: &str) -> String {
    format!(
        "{}/place/{}/data=!4m2!3d26.2!4d73.0",
        TEST_BASE_URL,
        name.replace(' ', "+")
    )
}

pub fn feed_html(names: &[&str]) -> String {
    let cards: String = names
        .iter()
        .map(|name| {
            format!(
                concat!(
                    r#"<div role="article">"#,
                    r#"<a class="hfpxzc" aria-label="{name}" href="{url}"></a>"#,
                    r#"<div class="qBF1Pd">{name}</div></div>"#,
                ),
                name = name,
                url = place_url(name)
            )
        })
        .collect();

    format!(
        concat!(
            r#"<html><body><div role="main"><div role="feed" aria-label="Results">"#,
            "{}</div></div></body></html>",
        ),
        cards
    )
}

pub fn feed_page(names: &[&str]) -> ScriptedPage {
    ScriptedPage::Feed(FeedScript {
        html: feed_html(names),
        heights: vec![1200],
        end_marker_after: None,
    })
}

pub fn detail_html(name: &str, phone: Option<&str>) -> String {
    let phone = phone
        .map(|p| {
            format!(
                concat!(
                    r#"<button data-item-id="phone:tel:{tel}" aria-label="Phone: {p} ">"#,
                    r#"<div class="Io6YTe">{p}</div></button>"#,
                ),
                tel = p.replace(' ', ""),
                p = p
            )
        })
        .unwrap_or_default();

    format!(
        concat!(
            r#"<html><body><div role="main"><h1 class="DUwDvf">{}</h1>"#,
            r#"<div class="RcCsl">{}</div></div></body></html>"#,
        ),
        name, phone
    )
}

pub fn detail_page(name: &str, phone: Option<&str>) -> ScriptedPage {
    ScriptedPage::Detail(detail_html(name, phone))
}

/// Url to page table a scripted session navigates. Unknown urls render blank.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDirectory {
    pages: HashMap<String, ScriptedPage>,
}

impl ScriptedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page(mut self, url: &str, page: ScriptedPage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    pub fn on_search(self, query: &str, page: ScriptedPage) -> Self {
        self.on_page(&search_url(query), page)
    }
}

struct Recorder {
    visits: Mutex<Vec<String>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl Recorder {
    fn record(&self, url: &str) {
        let count = {
            let mut visits = match self.visits.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            visits.push(url.to_string());
            visits.len()
        };

        if let Ok(cancel_after) = self.cancel_after.lock() {
            if let Some((after, token)) = cancel_after.as_ref() {
                if count >= *after {
                    token.cancel();
                }
            }
        }
    }
}

pub struct ScriptedSession {
    directory: Arc<ScriptedDirectory>,
    recorder: Arc<Recorder>,
    current_url: String,
    scrolls: usize,
    crashed: bool,
}

impl ScriptedSession {
    fn alive(&self) -> Result<(), PageError> {
        match self.crashed {
            true => Err(PageError::Driver(DEAD_SESSION.to_string())),
            false => Ok(()),
        }
    }

    fn page(&self) -> Option<&ScriptedPage> {
        self.directory.pages.get(&self.current_url)
    }

    fn render(&self) -> String {
        match self.page() {
            Some(ScriptedPage::Feed(script)) => {
                let ended = script
                    .end_marker_after
                    .map_or(false, |after| self.scrolls >= after);
                match ended {
                    true => script.html.replace("</body>", &format!("{}</body>", END_OF_LIST)),
                    false => script.html.clone(),
                }
            }
            Some(ScriptedPage::Detail(html)) => html.clone(),
            _ => BLANK.to_string(),
        }
    }

    fn matches(&self, css: &str) -> Result<bool, PageError> {
        self.alive()?;
        let selector = Selector::parse(css).map_err(|e| PageError::Script(format!("{:?}", e)))?;
        Ok(Html::parse_document(&self.render())
            .select(&selector)
            .next()
            .is_some())
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn goto(&mut self, url: &str) -> Result<(), PageError> {
        self.recorder.record(url);
        self.alive()?;
        self.scrolls = 0;

        match self.directory.pages.get(url) {
            Some(ScriptedPage::Unreachable) => Err(PageError::Navigation(format!(
                "{}: net::ERR_CONNECTION_RESET",
                url
            ))),
            Some(ScriptedPage::Panic) => panic!("scripted page crashed: {}", url),
            Some(ScriptedPage::Redirect(target)) => {
                self.current_url = target.clone();
                Ok(())
            }
            _ => {
                self.current_url = url.to_string();
                Ok(())
            }
        }
    }

    async fn current_url(&mut self) -> Result<String, PageError> {
        self.alive()?;
        Ok(self.current_url.clone())
    }

    async fn source(&mut self) -> Result<String, PageError> {
        self.alive()?;
        Ok(self.render())
    }

    async fn exists(&mut self, css: &str) -> Result<bool, PageError> {
        self.matches(css)
    }

    async fn scroll_to_bottom(&mut self, css: &str) -> Result<bool, PageError> {
        let present = self.matches(css)?;
        if present {
            self.scrolls += 1;
        }
        Ok(present)
    }

    async fn scroll_height(&mut self, css: &str) -> Result<Option<i64>, PageError> {
        if !self.matches(css)? {
            return Ok(None);
        }
        match self.page() {
            Some(ScriptedPage::Feed(script)) => Ok(script
                .heights
                .get(self.scrolls.min(script.heights.len().saturating_sub(1)))
                .copied()),
            _ => Ok(Some(0)),
        }
    }

    async fn quit(self: Box<Self>) -> Result<(), PageError> {
        self.alive()
    }
}

pub struct ScriptedSessionManager {
    directory: Arc<ScriptedDirectory>,
    recorder: Arc<Recorder>,
    capacity: Option<usize>,
    crashed: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedSessionManager {
    pub fn new(directory: ScriptedDirectory) -> Self {
        ScriptedSessionManager {
            directory: Arc::new(directory),
            recorder: Arc::new(Recorder {
                visits: Mutex::new(vec![]),
                cancel_after: Mutex::new(None),
            }),
            capacity: None,
            crashed: 0,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Only the first `capacity` acquisitions succeed.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// The first `sessions` handed out behave like a browser whose tab
    /// crashed: every call fails with a driver error.
    pub fn crash_first(mut self, sessions: usize) -> Self {
        self.crashed = sessions;
        self
    }

    /// Cancels `token` once `visits` navigations have happened across all
    /// sessions.
    pub fn cancel_after_visits(self, visits: usize, token: CancellationToken) -> Self {
        if let Ok(mut cancel_after) = self.recorder.cancel_after.lock() {
            *cancel_after = Some((visits, token));
        }
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn visits(&self) -> Vec<String> {
        match self.recorder.visits.lock() {
            Ok(visits) => visits.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl SessionManager for ScriptedSessionManager {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, HarvestError> {
        let index = self
            .acquired
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match self.capacity {
                Some(capacity) if n >= capacity => None,
                _ => Some(n + 1),
            })
            .map_err(|_| {
                HarvestError::SessionUnavailable("scripted browser pool exhausted".to_string())
            })?;

        Ok(Box::new(ScriptedSession {
            directory: self.directory.clone(),
            recorder: self.recorder.clone(),
            current_url: "about:blank".to_string(),
            scrolls: 0,
            crashed: index < self.crashed,
        }))
    }

    async fn release(&self, session: Box<dyn BrowserSession>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = session.quit().await {
            log::error!("Failed to quit scripted session: {:?}", e);
        }
    }
}

/// Dataset held in memory. The first `failures` merges return an error.
#[derive(Default)]
pub struct MemoryLeadStore {
    leads: Mutex<HashMap<String, LeadRecord>>,
    failures: AtomicUsize,
    merges: AtomicUsize,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        MemoryLeadStore {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn merge(&self, batch: &[LeadRecord]) -> anyhow::Result<MergeReport> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(anyhow!("dataset temporarily unavailable"));
        }

        let mut leads = self
            .leads
            .lock()
            .map_err(|_| anyhow!("dataset lock poisoned"))?;
        Ok(merge_records(&mut leads, batch))
    }

    async fn load(&self) -> anyhow::Result<Vec<LeadRecord>> {
        let leads = self
            .leads
            .lock()
            .map_err(|_| anyhow!("dataset lock poisoned"))?;
        Ok(ordered(leads.values().cloned()))
    }
}
