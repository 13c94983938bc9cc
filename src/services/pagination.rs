use std::{collections::BTreeSet, sync::Arc, time::Duration};

use rand::Rng;
use scraper::{Html, Selector};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::domain::{CandidateLink, SearchTask};

use super::{waits, BrowserSession, MapsDirectory, SelectorProfile};

#[derive(Debug, Clone)]
pub struct PaginationOptions {
    pub results_timeout: Duration,
    pub poll_interval: Duration,
    pub settle: Duration,
    pub settle_jitter: Duration,
    pub confirm_settle: Duration,
    pub max_scroll_rounds: u32,
    pub max_scroll_duration: Duration,
    pub max_links_per_task: Option<usize>,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        PaginationOptions {
            results_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
            settle: Duration::from_millis(2500),
            settle_jitter: Duration::from_millis(1000),
            confirm_settle: Duration::from_millis(2000),
            max_scroll_rounds: 60,
            max_scroll_duration: Duration::from_secs(240),
            max_links_per_task: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOutcome {
    EndOfList,
    Exhausted,
    CapReached,
    ContainerLost,
    Cancelled,
    SingleDetail,
    NoFeed,
    NavigationFailed,
}

#[derive(Debug)]
pub struct LinkHarvest {
    pub links: BTreeSet<CandidateLink>,
    pub outcome: FeedOutcome,
    pub scroll_rounds: u32,
}

impl LinkHarvest {
    fn empty(outcome: FeedOutcome) -> Self {
        LinkHarvest {
            links: BTreeSet::new(),
            outcome,
            scroll_rounds: 0,
        }
    }
}

pub struct PaginationController {
    directory: MapsDirectory,
    profile: SelectorProfile,
    options: PaginationOptions,
}

impl PaginationController {
    pub fn new(
        directory: MapsDirectory,
        profile: SelectorProfile,
        options: PaginationOptions,
    ) -> Self {
        PaginationController {
            directory,
            profile,
            options,
        }
    }

    pub async fn harvest_links(
        &self,
        session: &mut dyn BrowserSession,
        task: &Arc<SearchTask>,
        cancel: &CancellationToken,
    ) -> LinkHarvest {
        let query = task.query();
        let search_url = self.directory.search_url(&query);

        if let Err(e) = session.goto(&search_url).await {
            log::warn!("Could not open results for '{}': {}", query, e);
            return LinkHarvest::empty(FeedOutcome::NavigationFailed);
        }

        let feed_present = waits::wait_for(
            session,
            self.profile.feed,
            self.options.results_timeout,
            self.options.poll_interval,
        )
        .await
        .unwrap_or(false);

        if !feed_present {
            return self.single_detail_fallback(session, task, &query).await;
        }

        let (outcome, scroll_rounds) = self.scroll_to_exhaustion(session, cancel).await;
        log::info!(
            "Feed for '{}' stopped after {} scrolls: {:?}",
            query,
            scroll_rounds,
            outcome
        );

        let page_url = session.current_url().await.unwrap_or(search_url);
        let links = match session.source().await {
            Ok(source) => collect_links(&source, &page_url, &self.directory, &self.profile, task),
            Err(e) => {
                log::warn!("Could not read results page for '{}': {}", query, e);
                BTreeSet::new()
            }
        };

        let links = match self.options.max_links_per_task {
            Some(max) => links.into_iter().take(max).collect(),
            None => links,
        };

        LinkHarvest {
            links,
            outcome,
            scroll_rounds,
        }
    }

    async fn single_detail_fallback(
        &self,
        session: &mut dyn BrowserSession,
        task: &Arc<SearchTask>,
        query: &str,
    ) -> LinkHarvest {
        match session.current_url().await {
            Ok(url) if self.directory.is_detail_url(&url) => {
                log::info!("Search for '{}' resolved to a single place", query);
                LinkHarvest {
                    links: BTreeSet::from([CandidateLink {
                        url,
                        origin: task.clone(),
                    }]),
                    outcome: FeedOutcome::SingleDetail,
                    scroll_rounds: 0,
                }
            }
            _ => {
                log::warn!("Timeout/No results for: {}", query);
                LinkHarvest::empty(FeedOutcome::NoFeed)
            }
        }
    }

    async fn scroll_to_exhaustion(
        &self,
        session: &mut dyn BrowserSession,
        cancel: &CancellationToken,
    ) -> (FeedOutcome, u32) {
        let started = Instant::now();
        let mut rounds = 0;

        let Ok(Some(mut last_height)) = session.scroll_height(self.profile.feed).await else {
            return (FeedOutcome::ContainerLost, rounds);
        };

        loop {
            if cancel.is_cancelled() {
                return (FeedOutcome::Cancelled, rounds);
            }
            if self.cap_reached(rounds, started) {
                return (FeedOutcome::CapReached, rounds);
            }

            let settle = self.settle_with_jitter();
            let Some(height) = self.scroll_and_measure(session, settle).await else {
                return (FeedOutcome::ContainerLost, rounds);
            };
            rounds += 1;

            if self.end_of_list(session).await {
                return (FeedOutcome::EndOfList, rounds);
            }
            if height != last_height {
                last_height = height;
                continue;
            }

            // Lazy loading stalls now and then, one flat reading is not enough.
            if self.cap_reached(rounds, started) {
                return (FeedOutcome::CapReached, rounds);
            }
            let Some(confirmed) = self
                .scroll_and_measure(session, self.options.confirm_settle)
                .await
            else {
                return (FeedOutcome::ContainerLost, rounds);
            };
            rounds += 1;

            if self.end_of_list(session).await {
                return (FeedOutcome::EndOfList, rounds);
            }
            if confirmed == height {
                return (FeedOutcome::Exhausted, rounds);
            }
            last_height = confirmed;
        }
    }

    fn cap_reached(&self, rounds: u32, started: Instant) -> bool {
        rounds >= self.options.max_scroll_rounds
            || started.elapsed() >= self.options.max_scroll_duration
    }

    fn settle_with_jitter(&self) -> Duration {
        let jitter_ms = self.options.settle_jitter.as_millis() as u64;
        match jitter_ms {
            0 => self.options.settle,
            _ => {
                let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
                self.options.settle + Duration::from_millis(jitter)
            }
        }
    }

    async fn scroll_and_measure(
        &self,
        session: &mut dyn BrowserSession,
        settle: Duration,
    ) -> Option<i64> {
        match session.scroll_to_bottom(self.profile.feed).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                log::warn!("Scrolling the results feed failed: {}", e);
                return None;
            }
        }
        sleep(settle).await;
        session.scroll_height(self.profile.feed).await.ok().flatten()
    }

    async fn end_of_list(&self, session: &mut dyn BrowserSession) -> bool {
        match session.source().await {
            Ok(source) => self
                .profile
                .end_of_list_markers
                .iter()
                .any(|marker| source.contains(marker)),
            Err(_) => false,
        }
    }
}

/// Detail links inside the results feed, deduplicated across every strategy
/// of the profile.
pub fn collect_links(
    html: &str,
    page_url: &str,
    directory: &MapsDirectory,
    profile: &SelectorProfile,
    origin: &Arc<SearchTask>,
) -> BTreeSet<CandidateLink> {
    let document = Html::parse_document(html);
    let mut links = BTreeSet::new();

    let scopes = match Selector::parse(profile.feed) {
        Ok(feed) => document.select(&feed).collect::<Vec<_>>(),
        Err(_) => vec![],
    };
    let scopes = match scopes.is_empty() {
        true => vec![document.root_element()],
        false => scopes,
    };

    for strategy in profile.link_strategies.iter() {
        let Ok(selector) = Selector::parse(strategy.css()) else {
            log::error!("Invalid link selector in profile {}: {}", profile.name, strategy.css());
            continue;
        };

        for scope in scopes.iter() {
            for anchor in scope.select(&selector) {
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                let Some(url) = directory.resolve(page_url, href) else {
                    continue;
                };
                if strategy.accepts(&url) && directory.is_detail_url(&url) {
                    links.insert(CandidateLink {
                        url,
                        origin: origin.clone(),
                    });
                }
            }
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::{collect_links, FeedOutcome, PaginationController, PaginationOptions};
    use crate::{
        domain::SearchTask,
        services::{MapsDirectory, SelectorProfile, SessionManager},
        testing::{
            feed_html, feed_page, place_url, search_url, FeedScript, ScriptedDirectory,
            ScriptedPage, ScriptedSessionManager, TEST_BASE_URL,
        },
    };

    fn options() -> PaginationOptions {
        PaginationOptions {
            results_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            settle: Duration::from_millis(2000),
            settle_jitter: Duration::ZERO,
            confirm_settle: Duration::from_millis(1500),
            max_scroll_rounds: 12,
            max_scroll_duration: Duration::from_secs(600),
            max_links_per_task: None,
        }
    }

    fn controller(options: PaginationOptions) -> PaginationController {
        PaginationController::new(
            MapsDirectory::new(TEST_BASE_URL),
            SelectorProfile::default(),
            options,
        )
    }

    fn task() -> Arc<SearchTask> {
        Arc::new(SearchTask::new("Acme", "dealer", "Springfield"))
    }

    async fn run(directory: ScriptedDirectory, options: PaginationOptions) -> super::LinkHarvest {
        let manager = ScriptedSessionManager::new(directory);
        let mut session = manager.acquire().await.unwrap();
        let harvest = controller(options)
            .harvest_links(session.as_mut(), &task(), &CancellationToken::new())
            .await;
        manager.release(session).await;
        harvest
    }

    #[tokio::test(start_paused = true)]
    async fn flat_feed_stops_after_confirmatory_scroll() {
        let directory = ScriptedDirectory::new().on_page(
            &search_url("Acme dealer Springfield"),
            feed_page(&["Alpha Tyres", "Beta Tyres"]),
        );

        let harvest = run(directory, options()).await;

        assert_eq!(harvest.outcome, FeedOutcome::Exhausted);
        assert_eq!(harvest.scroll_rounds, 2);
        assert_eq!(harvest.links.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_load_is_not_mistaken_for_the_end() {
        let page = ScriptedPage::Feed(FeedScript {
            html: feed_html(&["Alpha Tyres"]),
            // Second reading repeats, third grows again, then flat.
            heights: vec![1000, 1000, 2000, 3000, 3000, 3000],
            end_marker_after: None,
        });
        let directory =
            ScriptedDirectory::new().on_page(&search_url("Acme dealer Springfield"), page);

        let harvest = run(directory, options()).await;

        assert_eq!(harvest.outcome, FeedOutcome::Exhausted);
        assert_eq!(harvest.scroll_rounds, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn ever_growing_feed_hits_the_hard_cap() {
        let page = ScriptedPage::Feed(FeedScript {
            html: feed_html(&["Alpha Tyres"]),
            heights: (0..1000).map(|i| 1000 + i * 500).collect(),
            end_marker_after: None,
        });
        let directory =
            ScriptedDirectory::new().on_page(&search_url("Acme dealer Springfield"), page);

        let harvest = run(directory, options()).await;

        assert_eq!(harvest.outcome, FeedOutcome::CapReached);
        assert_eq!(harvest.scroll_rounds, 12);
        assert_eq!(harvest.links.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn time_cap_bounds_the_loop_as_well() {
        let page = ScriptedPage::Feed(FeedScript {
            html: feed_html(&["Alpha Tyres"]),
            heights: (0..1000).map(|i| 1000 + i * 500).collect(),
            end_marker_after: None,
        });
        let directory =
            ScriptedDirectory::new().on_page(&search_url("Acme dealer Springfield"), page);
        let mut opts = options();
        opts.max_scroll_rounds = 1000;
        opts.max_scroll_duration = Duration::from_secs(9);

        let harvest = run(directory, opts).await;

        assert_eq!(harvest.outcome, FeedOutcome::CapReached);
        assert_eq!(harvest.scroll_rounds, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_list_marker_ends_scrolling() {
        let page = ScriptedPage::Feed(FeedScript {
            html: feed_html(&["Alpha Tyres", "Beta Tyres", "Gamma Tyres"]),
            heights: (0..1000).map(|i| 1000 + i * 500).collect(),
            end_marker_after: Some(3),
        });
        let directory =
            ScriptedDirectory::new().on_page(&search_url("Acme dealer Springfield"), page);

        let harvest = run(directory, options()).await;

        assert_eq!(harvest.outcome, FeedOutcome::EndOfList);
        assert_eq!(harvest.scroll_rounds, 3);
        assert_eq!(harvest.links.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_feed_degrades_to_zero_links() {
        let directory = ScriptedDirectory::new();

        let harvest = run(directory, options()).await;

        assert_eq!(harvest.outcome, FeedOutcome::NoFeed);
        assert!(harvest.links.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn search_resolving_to_a_place_yields_that_place() {
        let place = place_url("Alpha Tyres");
        let directory = ScriptedDirectory::new()
            .on_page(
                &search_url("Acme dealer Springfield"),
                ScriptedPage::Redirect(place.clone()),
            )
            .on_page(&place, ScriptedPage::Detail("<h1>Alpha Tyres</h1>".to_string()));

        let harvest = run(directory, options()).await;

        assert_eq!(harvest.outcome, FeedOutcome::SingleDetail);
        assert_eq!(
            harvest.links.iter().map(|l| l.url.clone()).collect::<Vec<_>>(),
            vec![place]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn link_cap_truncates_deterministically() {
        let directory = ScriptedDirectory::new().on_page(
            &search_url("Acme dealer Springfield"),
            feed_page(&["Gamma", "Alpha", "Beta"]),
        );
        let mut opts = options();
        opts.max_links_per_task = Some(2);

        let harvest = run(directory, opts).await;

        let urls: Vec<String> = harvest.links.iter().map(|l| l.url.clone()).collect();
        assert_eq!(urls, vec![place_url("Alpha"), place_url("Beta")]);
    }

    #[test]
    fn collect_links_unions_strategies_and_skips_navigation_links() {
        let html = format!(
            r#"<html><body>
            <a href="{base}/place/Nav+Link/data=!3d1">nav outside feed</a>
            <div role="feed">
                <a class="hfpxzc" href="{alpha}"></a>
                <a href="{alpha}">Alpha again</a>
                <a href="/maps/place/Beta/data=!4m2!3d26.1!4d73.0">Beta relative</a>
                <a href="{base}/place/No+Coordinates">no coordinates</a>
                <a href="{base}/search/other">search link</a>
            </div></body></html>"#,
            base = TEST_BASE_URL,
            alpha = place_url("Alpha"),
        );
        let task = Arc::new(SearchTask::new("Acme", "dealer", "Springfield"));

        let links = collect_links(
            &html,
            &search_url("Acme dealer Springfield"),
            &MapsDirectory::new(TEST_BASE_URL),
            &SelectorProfile::default(),
            &task,
        );

        let urls: Vec<String> = links.into_iter().map(|l| l.url).collect();
        assert_eq!(
            urls,
            vec![
                place_url("Alpha"),
                format!("{}/place/Beta/data=!4m2!3d26.1!4d73.0", TEST_BASE_URL),
            ]
        );
    }

    #[test]
    fn overlay_profile_reads_overlay_anchors_only() {
        let html = format!(
            concat!(
                r#"<div role="feed"><a class="hfpxzc" href="{base}/place/Alpha"></a>"#,
                r#"<a href="{beta}"></a></div>"#,
            ),
            base = TEST_BASE_URL,
            beta = place_url("Beta"),
        );
        let task = Arc::new(SearchTask::new("Acme", "dealer", "Springfield"));

        let links = collect_links(
            &html,
            &search_url("Acme"),
            &MapsDirectory::new(TEST_BASE_URL),
            &SelectorProfile::by_name("overlay-link-2023").unwrap(),
            &task,
        );

        assert_eq!(links.len(), 1);
        assert_eq!(links.iter().next().unwrap().url, format!("{}/place/Alpha", TEST_BASE_URL));
    }
}
