use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{phone, LeadRecord, SearchTask},
    error::HarvestError,
};

use super::{
    data_persistance_handler, BrowserSession, DedupIndex, ExtractionOptions, FeedOutcome,
    FieldExtractor, LeadStore, MapsDirectory, PageError, PaginationController, PaginationOptions,
    PersistantData, PersistenceOptions, SelectorProfile, SessionManager,
};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub detail_delay_min: Duration,
    pub detail_delay_max: Duration,
    pub require_subject_in_name: bool,
    pub pagination: PaginationOptions,
    pub extraction: ExtractionOptions,
    pub persistence: PersistenceOptions,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            workers: 4,
            detail_delay_min: Duration::from_millis(1200),
            detail_delay_max: Duration::from_millis(2500),
            require_subject_in_name: false,
            pagination: PaginationOptions::default(),
            extraction: ExtractionOptions::default(),
            persistence: PersistenceOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarvestEvent {
    TaskStarted {
        task: SearchTask,
    },
    TaskCompleted {
        task: SearchTask,
        lead_count: usize,
        outcome: FeedOutcome,
    },
    TaskFailed {
        task: SearchTask,
        error: String,
    },
    LeadAccepted {
        record: LeadRecord,
    },
    PersistenceWarning {
        unpersisted: usize,
    },
    RunFinished {
        summary: RunSummary,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_dropped: usize,
    pub links_visited: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub no_phone: usize,
    pub filtered: usize,
    pub failed_extractions: usize,
    pub persisted: usize,
    pub unpersisted: usize,
    pub cancelled: bool,
}

#[derive(Default)]
struct RunProgress {
    tasks_completed: AtomicUsize,
    tasks_failed: AtomicUsize,
    tasks_interrupted: AtomicUsize,
    links_visited: AtomicUsize,
    duplicates: AtomicUsize,
    no_phone: AtomicUsize,
    filtered: AtomicUsize,
    failed_extractions: AtomicUsize,
}

impl RunProgress {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

struct TaskQueue {
    tasks: Mutex<VecDeque<Arc<SearchTask>>>,
}

impl TaskQueue {
    fn new(tasks: Vec<SearchTask>) -> Self {
        TaskQueue {
            tasks: Mutex::new(tasks.into_iter().map(Arc::new).collect()),
        }
    }

    fn pop(&self) -> Option<Arc<SearchTask>> {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    fn len(&self) -> usize {
        match self.tasks.lock() {
            Ok(tasks) => tasks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

enum TaskResult {
    Completed,
    /// Cut short by cancellation, counted with the dropped tasks.
    Interrupted,
    /// The session is presumed dead and is replaced before the next task.
    Failed,
}

/// Everything the workers of one run share.
struct RunContext {
    sessions: Arc<dyn SessionManager>,
    pagination: Arc<PaginationController>,
    extractor: Arc<FieldExtractor>,
    options: SchedulerOptions,
    queue: TaskQueue,
    dedup: DedupIndex,
    progress: RunProgress,
    cancel: CancellationToken,
    events: UnboundedSender<HarvestEvent>,
    persistant_data_sender: UnboundedSender<PersistantData>,
}

impl RunContext {
    fn emit(&self, event: HarvestEvent) {
        let _ = self.events.send(event);
    }

    fn detail_delay(&self) -> Duration {
        let min = self.options.detail_delay_min;
        let max = self.options.detail_delay_max;
        match max > min {
            true => rand::thread_rng().gen_range(min..=max),
            false => min,
        }
    }

    async fn work(&self, worker_id: usize) -> bool {
        let mut session = match self.sessions.acquire().await {
            Ok(session) => session,
            Err(e) => {
                log::error!(
                    "Worker {} could not acquire a browser session: {}",
                    worker_id,
                    e
                );
                return false;
            }
        };
        log::info!("Worker {} acquired a browser session", worker_id);

        while !self.cancel.is_cancelled() {
            let Some(task) = self.queue.pop() else {
                break;
            };

            let mut accepted = vec![];
            let result =
                AssertUnwindSafe(self.process_task(session.as_mut(), &task, &mut accepted))
                    .catch_unwind()
                    .await;

            let result = result.unwrap_or_else(|_| {
                log::error!("Worker {} panicked on '{}'", worker_id, task.query());
                self.emit(HarvestEvent::TaskFailed {
                    task: task.as_ref().clone(),
                    error: "task panicked".to_string(),
                });
                TaskResult::Failed
            });

            let session_lost = match result {
                TaskResult::Completed => {
                    RunProgress::bump(&self.progress.tasks_completed);
                    false
                }
                TaskResult::Interrupted => {
                    RunProgress::bump(&self.progress.tasks_interrupted);
                    false
                }
                TaskResult::Failed => {
                    RunProgress::bump(&self.progress.tasks_failed);
                    true
                }
            };

            self.flush(task, accepted);

            if session_lost && !self.cancel.is_cancelled() && self.queue.len() > 0 {
                log::warn!("Worker {} is replacing its browser session", worker_id);
                self.sessions.release(session).await;
                session = match self.sessions.acquire().await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        log::error!(
                            "Worker {} could not replace its browser session, stopping: {}",
                            worker_id,
                            e
                        );
                        return true;
                    }
                };
            }
        }

        self.sessions.release(session).await;
        log::info!("Worker {} released its browser session", worker_id);
        true
    }

    async fn process_task(
        &self,
        session: &mut dyn BrowserSession,
        task: &Arc<SearchTask>,
        accepted: &mut Vec<LeadRecord>,
    ) -> TaskResult {
        log::info!("Started task '{}'", task.query());
        self.emit(HarvestEvent::TaskStarted {
            task: task.as_ref().clone(),
        });

        let harvest = self
            .pagination
            .harvest_links(session, task, &self.cancel)
            .await;
        log::info!(
            "Found {} candidate links for '{}'",
            harvest.links.len(),
            task.query()
        );

        let mut interrupted = harvest.outcome == FeedOutcome::Cancelled;
        let mut session_lost = false;

        for (i, link) in harvest.links.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!(
                    "Run cancelled, leaving '{}' after {} links",
                    task.query(),
                    i
                );
                interrupted = true;
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.detail_delay()).await;
            }

            RunProgress::bump(&self.progress.links_visited);
            let extraction = match self.extractor.extract(session, link).await {
                Ok(extraction) => extraction,
                Err(PageError::Driver(e)) => {
                    log::error!("Browser session died on {}: {}", link.url, e);
                    RunProgress::bump(&self.progress.failed_extractions);
                    session_lost = true;
                    break;
                }
                Err(e) => {
                    log::warn!("Extraction failed for {}: {}", link.url, e);
                    RunProgress::bump(&self.progress.failed_extractions);
                    continue;
                }
            };

            let Some(canonical_phone) =
                extraction.raw_phone.as_deref().and_then(phone::normalize)
            else {
                log::debug!("No usable phone on {}", link.url);
                RunProgress::bump(&self.progress.no_phone);
                continue;
            };

            let record =
                LeadRecord::from_extraction(&extraction, canonical_phone, link, Utc::now());

            if self.options.require_subject_in_name
                && !record
                    .company
                    .to_lowercase()
                    .contains(&task.subject.to_lowercase())
            {
                log::debug!(
                    "Skipping '{}', not a {} listing",
                    record.company,
                    task.subject
                );
                RunProgress::bump(&self.progress.filtered);
                continue;
            }

            if self.dedup.offer(record.clone()) {
                log::info!("Accepted {} ({})", record.company, record.canonical_phone);
                self.emit(HarvestEvent::LeadAccepted {
                    record: record.clone(),
                });
                accepted.push(record);
            } else {
                log::info!(
                    "Duplicate phone {} from {}",
                    record.canonical_phone,
                    link.url
                );
                RunProgress::bump(&self.progress.duplicates);
            }
        }

        log::info!(
            "Finished task '{}' with {} new leads",
            task.query(),
            accepted.len()
        );
        self.emit(HarvestEvent::TaskCompleted {
            task: task.as_ref().clone(),
            lead_count: accepted.len(),
            outcome: harvest.outcome,
        });

        match (harvest.outcome, session_lost, interrupted) {
            (FeedOutcome::NavigationFailed, _, _) | (_, true, _) => TaskResult::Failed,
            (_, false, true) => TaskResult::Interrupted,
            _ => TaskResult::Completed,
        }
    }

    fn flush(&self, task: Arc<SearchTask>, records: Vec<LeadRecord>) {
        if records.is_empty() {
            return;
        }
        let count = records.len();
        if self
            .persistant_data_sender
            .send(PersistantData { task, records })
            .is_err()
        {
            log::error!("Persistence handler is gone, {} leads were not flushed", count);
        }
    }
}

/// Runs search tasks across a bounded pool of browser sessions.
pub struct Harvester {
    sessions: Arc<dyn SessionManager>,
    store: Arc<dyn LeadStore>,
    pagination: Arc<PaginationController>,
    extractor: Arc<FieldExtractor>,
    options: SchedulerOptions,
}

impl Harvester {
    pub fn new(
        sessions: Arc<dyn SessionManager>,
        store: Arc<dyn LeadStore>,
        directory: MapsDirectory,
        profile: SelectorProfile,
        options: SchedulerOptions,
    ) -> Self {
        let pagination = Arc::new(PaginationController::new(
            directory.clone(),
            profile.clone(),
            options.pagination.clone(),
        ));
        let extractor = Arc::new(FieldExtractor::new(
            directory,
            profile,
            options.extraction.clone(),
        ));

        Harvester {
            sessions,
            store,
            pagination,
            extractor,
            options,
        }
    }

    pub fn store(&self) -> Arc<dyn LeadStore> {
        self.store.clone()
    }

    pub async fn run(
        &self,
        tasks: Vec<SearchTask>,
        cancel: CancellationToken,
        events: UnboundedSender<HarvestEvent>,
    ) -> Result<RunSummary, HarvestError> {
        let tasks_total = tasks.len();
        let workers = self.options.workers.min(tasks_total).max(1);
        log::info!("Starting harvest of {} tasks with {} workers", tasks_total, workers);

        let (persistant_data_sender, persistant_data_receiver) =
            mpsc::unbounded_channel::<PersistantData>();
        let persistence = tokio::spawn(data_persistance_handler(
            persistant_data_receiver,
            self.store.clone(),
            self.options.persistence.clone(),
        ));

        let context = Arc::new(RunContext {
            sessions: self.sessions.clone(),
            pagination: self.pagination.clone(),
            extractor: self.extractor.clone(),
            options: self.options.clone(),
            queue: TaskQueue::new(tasks),
            dedup: DedupIndex::new(),
            progress: RunProgress::default(),
            cancel: cancel.clone(),
            events: events.clone(),
            persistant_data_sender,
        });

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let context = context.clone();
            set.spawn(async move { context.work(worker_id).await });
        }

        let mut active_workers = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => active_workers += 1,
                Ok(false) => {}
                Err(e) => log::error!("Worker task failed: {}", e),
            }
        }

        let Ok(context) = Arc::try_unwrap(context) else {
            return Err(HarvestError::Persistence(
                "run context still shared after workers finished".to_string(),
            ));
        };
        let progress = context.progress;
        let tasks_dropped =
            context.queue.len() + RunProgress::read(&progress.tasks_interrupted);
        let accepted = context.dedup.accepted_count();
        drop(context.persistant_data_sender);

        let persistence = persistence
            .await
            .map_err(|e| HarvestError::Persistence(e.to_string()))?;

        if active_workers == 0 && tasks_total > 0 {
            return Err(HarvestError::NoSessions);
        }

        let summary = RunSummary {
            tasks_total,
            tasks_completed: RunProgress::read(&progress.tasks_completed),
            tasks_failed: RunProgress::read(&progress.tasks_failed),
            tasks_dropped,
            links_visited: RunProgress::read(&progress.links_visited),
            accepted,
            duplicates: RunProgress::read(&progress.duplicates),
            no_phone: RunProgress::read(&progress.no_phone),
            filtered: RunProgress::read(&progress.filtered),
            failed_extractions: RunProgress::read(&progress.failed_extractions),
            persisted: persistence.persisted,
            unpersisted: persistence.unpersisted.len(),
            cancelled: cancel.is_cancelled(),
        };

        if summary.unpersisted > 0 {
            log::error!("{} accepted leads were not persisted", summary.unpersisted);
            let _ = events.send(HarvestEvent::PersistenceWarning {
                unpersisted: summary.unpersisted,
            });
        }
        log::info!("Harvest finished: {:?}", summary);
        let _ = events.send(HarvestEvent::RunFinished {
            summary: summary.clone(),
        });

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{HarvestEvent, Harvester, SchedulerOptions};
    use crate::{
        domain::SearchTask,
        error::HarvestError,
        services::{LeadStore, MapsDirectory, SelectorProfile},
        testing::{
            detail_page, feed_page, place_url, MemoryLeadStore, ScriptedDirectory, ScriptedPage,
            ScriptedSessionManager, TEST_BASE_URL,
        },
    };

    fn options(workers: usize) -> SchedulerOptions {
        let mut options = SchedulerOptions {
            workers,
            ..SchedulerOptions::default()
        };
        options.pagination.settle_jitter = Duration::ZERO;
        options.persistence.backoff = Duration::from_millis(10);
        options
    }

    fn harvester(
        manager: Arc<ScriptedSessionManager>,
        store: Arc<MemoryLeadStore>,
        options: SchedulerOptions,
    ) -> Harvester {
        Harvester::new(
            manager,
            store,
            MapsDirectory::new(TEST_BASE_URL),
            SelectorProfile::default(),
            options,
        )
    }

    fn tasks(locations: &[&str]) -> Vec<SearchTask> {
        locations
            .iter()
            .map(|location| SearchTask::new("MRF", "dealer", location))
            .collect()
    }

    /// Each location gets one listing with a phone unique to it.
    fn directory(locations: &[&str]) -> ScriptedDirectory {
        locations
            .iter()
            .enumerate()
            .fold(ScriptedDirectory::new(), |directory, (i, location)| {
                let name = format!("MRF Tyres {}", location);
                directory
                    .on_search(&format!("MRF dealer {}", location), feed_page(&[name.as_str()]))
                    .on_page(
                        &place_url(&name),
                        detail_page(&name, Some(format!("+91 98765 4321{}", i).as_str())),
                    )
            })
    }

    #[tokio::test(start_paused = true)]
    async fn pool_is_capped_at_task_count_and_every_session_released() {
        let locations = ["Jodhpur", "Jaipur"];
        let manager = Arc::new(ScriptedSessionManager::new(directory(&locations)));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager.clone(), store.clone(), options(4))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(manager.acquired(), 2);
        assert_eq!(manager.released(), 2);
        assert_eq!(summary.tasks_completed, 2);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.persisted, 2);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_is_contained_and_session_released() {
        let locations = ["Jodhpur", "Jaipur", "Ajmer"];
        let directory = directory(&locations).on_search("MRF dealer Jaipur", ScriptedPage::Panic);
        let manager = Arc::new(ScriptedSessionManager::new(directory));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager.clone(), store.clone(), options(1))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.tasks_failed, 1);
        assert_eq!(summary.tasks_completed, 2);
        assert_eq!(summary.accepted, 2);
        assert_eq!(manager.released(), manager.acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_reports_a_failure_event() {
        let locations = ["Jodhpur", "Jaipur"];
        let directory = directory(&locations).on_search("MRF dealer Jaipur", ScriptedPage::Panic);
        let manager = Arc::new(ScriptedSessionManager::new(directory));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, mut receiver) = mpsc::unbounded_channel();

        harvester(manager, store, options(1))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        let mut completed = 0;
        let mut failed = vec![];
        while let Ok(event) = receiver.try_recv() {
            match event {
                HarvestEvent::TaskCompleted { .. } => completed += 1,
                HarvestEvent::TaskFailed { task, .. } => failed.push(task.location),
                _ => {}
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(failed, vec!["Jaipur".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_session_is_replaced_before_the_next_task() {
        let locations: Vec<String> = (0..10).map(|i| format!("Town {}", i)).collect();
        let locations: Vec<&str> = locations.iter().map(String::as_str).collect();
        let manager =
            Arc::new(ScriptedSessionManager::new(directory(&locations)).crash_first(1));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager.clone(), store.clone(), options(2))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.tasks_failed, 1);
        assert_eq!(summary.tasks_completed, 9);
        assert_eq!(summary.accepted, 9);
        assert_eq!(manager.acquired(), 3);
        assert_eq!(manager.released(), manager.acquired());
        assert_eq!(store.load().await.unwrap().len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_stops_when_its_session_cannot_be_replaced() {
        let locations: Vec<String> = (0..10).map(|i| format!("Town {}", i)).collect();
        let locations: Vec<&str> = locations.iter().map(String::as_str).collect();
        let manager = Arc::new(
            ScriptedSessionManager::new(directory(&locations))
                .with_capacity(2)
                .crash_first(1),
        );
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager.clone(), store, options(2))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.tasks_failed, 1);
        assert_eq!(summary.tasks_completed, 9);
        assert_eq!(summary.tasks_dropped, 0);
        assert_eq!(manager.acquired(), 2);
        assert_eq!(manager.released(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn task_cut_short_by_cancel_counts_as_dropped() {
        let names = ["MRF One", "MRF Two", "MRF Three"];
        let directory = names.iter().enumerate().fold(
            ScriptedDirectory::new().on_search("MRF dealer Jodhpur", feed_page(&names)),
            |directory, (i, name)| {
                directory.on_page(
                    &place_url(name),
                    detail_page(name, Some(format!("+91 98765 4321{}", i).as_str())),
                )
            },
        );
        let cancel = CancellationToken::new();
        // The search page and the first listing.
        let manager = Arc::new(
            ScriptedSessionManager::new(directory).cancel_after_visits(2, cancel.clone()),
        );
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();
        let tasks = tasks(&["Jodhpur", "Jaipur"]);
        let total = tasks.len();

        let summary = harvester(manager, store.clone(), options(1))
            .run(tasks, cancel, events)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(summary.tasks_dropped, 2);
        assert_eq!(
            summary.tasks_completed + summary.tasks_failed + summary.tasks_dropped,
            total
        );
        assert_eq!(summary.accepted, 1);
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_workers_drain_the_queue_when_one_cannot_start() {
        let locations = ["Jodhpur", "Jaipur", "Ajmer"];
        let manager = Arc::new(ScriptedSessionManager::new(directory(&locations)).with_capacity(1));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager.clone(), store.clone(), options(3))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.tasks_completed, 3);
        assert_eq!(summary.tasks_dropped, 0);
        assert_eq!(manager.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_fails_when_no_session_can_be_acquired() {
        let locations = ["Jodhpur"];
        let manager = Arc::new(ScriptedSessionManager::new(directory(&locations)).with_capacity(0));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let result = harvester(manager, store, options(2))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await;

        assert!(matches!(result, Err(HarvestError::NoSessions)));
    }

    #[tokio::test(start_paused = true)]
    async fn subject_filter_skips_unrelated_listings() {
        let directory = ScriptedDirectory::new()
            .on_search("MRF dealer Jodhpur", feed_page(&["MRF Tyres Jodhpur", "City Auto Works"]))
            .on_page(
                &place_url("MRF Tyres Jodhpur"),
                detail_page("MRF Tyres Jodhpur", Some("98765 43210")),
            )
            .on_page(
                &place_url("City Auto Works"),
                detail_page("City Auto Works", Some("91234 56780")),
            );
        let manager = Arc::new(ScriptedSessionManager::new(directory));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();
        let mut options = options(1);
        options.require_subject_in_name = true;

        let summary = harvester(manager, store.clone(), options)
            .run(tasks(&["Jodhpur"]), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(store.load().await.unwrap()[0].company, "MRF Tyres Jodhpur");
    }

    #[tokio::test(start_paused = true)]
    async fn listings_without_phone_or_reachable_page_are_counted() {
        let directory = ScriptedDirectory::new()
            .on_search("MRF dealer Jodhpur", feed_page(&["MRF One", "MRF Two", "MRF Three"]))
            .on_page(&place_url("MRF One"), detail_page("MRF One", None))
            .on_page(&place_url("MRF Two"), ScriptedPage::Unreachable)
            .on_page(&place_url("MRF Three"), detail_page("MRF Three", Some("12345")));
        let manager = Arc::new(ScriptedSessionManager::new(directory));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager, store.clone(), options(1))
            .run(tasks(&["Jodhpur"]), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.links_visited, 3);
        assert_eq!(summary.no_phone, 2);
        assert_eq!(summary.failed_extractions, 1);
        assert_eq!(summary.accepted, 0);
        assert_eq!(store.merges(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_drops_queued_tasks() {
        let locations = ["Jodhpur", "Jaipur", "Ajmer"];
        let manager = Arc::new(ScriptedSessionManager::new(directory(&locations)));
        let store = Arc::new(MemoryLeadStore::new());
        let (events, _receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = harvester(manager.clone(), store, options(1))
            .run(tasks(&locations), cancel, events)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.tasks_dropped, 3);
        assert_eq!(manager.released(), manager.acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn unpersisted_leads_raise_a_warning_event() {
        let locations = ["Jodhpur"];
        let manager = Arc::new(ScriptedSessionManager::new(directory(&locations)));
        let store = Arc::new(MemoryLeadStore::failing(usize::MAX));
        let (events, mut receiver) = mpsc::unbounded_channel();

        let summary = harvester(manager, store, options(1))
            .run(tasks(&locations), CancellationToken::new(), events)
            .await
            .unwrap();

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.unpersisted, 1);

        let mut warned = false;
        let mut finished = false;
        while let Ok(event) = receiver.try_recv() {
            match event {
                HarvestEvent::PersistenceWarning { unpersisted } => warned = unpersisted == 1,
                HarvestEvent::RunFinished { summary } => finished = summary.accepted == 1,
                _ => {}
            }
        }
        assert!(warned);
        assert!(finished);
    }
}
