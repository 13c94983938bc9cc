use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc::UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{domain::generate_tasks, error::HarvestError};

use super::{HarvestEvent, Harvester, RunSummary};

#[derive(Debug, Deserialize)]
pub struct HarvestRequest {
    pub subject: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RunTicket {
    pub run_id: Uuid,
    pub tasks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub state: RunState,
    pub tasks_total: usize,
    pub tasks_done: usize,
    pub accepted: usize,
    pub last_summary: Option<RunSummary>,
    pub error: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus {
            run_id: None,
            state: RunState::Idle,
            tasks_total: 0,
            tasks_done: 0,
            accepted: 0,
            last_summary: None,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Invalid(#[from] HarvestError),

    #[error("A harvest run is already active")]
    AlreadyRunning,
}

#[derive(Default)]
struct RegistryState {
    status: RunStatus,
    cancel: Option<CancellationToken>,
}

/// Owns the single active run and what the HTTP surface reports about it.
pub struct RunRegistry {
    harvester: Arc<Harvester>,
    state: Arc<Mutex<RegistryState>>,
    runtime: Handle,
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RunRegistry {
    /// Must be called from within a tokio runtime; runs are spawned on it.
    pub fn new(harvester: Arc<Harvester>) -> Self {
        RunRegistry {
            harvester,
            state: Arc::new(Mutex::new(RegistryState::default())),
            runtime: Handle::current(),
        }
    }

    pub fn start(&self, request: HarvestRequest) -> Result<RunTicket, StartError> {
        let tasks = generate_tasks(&[request.subject], &request.keywords, &request.locations)?;
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        {
            let mut state = lock(&self.state);
            if state.status.state == RunState::Running {
                return Err(StartError::AlreadyRunning);
            }
            state.status = RunStatus {
                run_id: Some(run_id),
                state: RunState::Running,
                tasks_total: tasks.len(),
                ..RunStatus::default()
            };
            state.cancel = Some(cancel.clone());
        }

        let ticket = RunTicket {
            run_id,
            tasks: tasks.len(),
        };
        log::info!("Accepted harvest run {} with {} tasks", run_id, tasks.len());

        let (event_sender, event_receiver) = tokio::sync::mpsc::unbounded_channel();
        self.runtime
            .spawn(progress_logger(event_receiver, self.state.clone(), run_id));

        let harvester = self.harvester.clone();
        let state = self.state.clone();
        self.runtime.spawn(async move {
            let result = harvester.run(tasks, cancel, event_sender).await;

            let mut guard = lock(&state);
            if guard.status.run_id != Some(run_id) {
                return;
            }
            guard.cancel = None;
            match result {
                Ok(summary) => {
                    guard.status.state = RunState::Finished;
                    guard.status.accepted = summary.accepted;
                    guard.status.last_summary = Some(summary);
                }
                Err(e) => {
                    log::error!("Harvest run {} failed: {}", run_id, e);
                    guard.status.state = RunState::Failed;
                    guard.status.error = Some(e.to_string());
                }
            }
        });

        Ok(ticket)
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.state).status.clone()
    }

    /// Returns false when no run is active.
    pub fn cancel(&self) -> bool {
        let state = lock(&self.state);
        match (&state.status.state, &state.cancel) {
            (RunState::Running, Some(cancel)) => {
                log::info!("Cancelling harvest run {:?}", state.status.run_id);
                cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

async fn progress_logger(
    mut events: UnboundedReceiver<HarvestEvent>,
    state: Arc<Mutex<RegistryState>>,
    run_id: Uuid,
) {
    while let Some(event) = events.recv().await {
        match &event {
            HarvestEvent::TaskStarted { task } => {
                log::info!("[{}] started '{}'", run_id, task.query())
            }
            HarvestEvent::TaskCompleted {
                task,
                lead_count,
                outcome,
            } => log::info!(
                "[{}] completed '{}' with {} leads ({:?})",
                run_id,
                task.query(),
                lead_count,
                outcome
            ),
            HarvestEvent::TaskFailed { task, error } => {
                log::error!("[{}] failed '{}': {}", run_id, task.query(), error)
            }
            HarvestEvent::LeadAccepted { record } => {
                log::debug!("[{}] lead {} {}", run_id, record.company, record.canonical_phone)
            }
            HarvestEvent::PersistenceWarning { unpersisted } => {
                log::warn!("[{}] {} leads were not persisted", run_id, unpersisted)
            }
            HarvestEvent::RunFinished { summary } => {
                log::info!("[{}] finished with {} leads", run_id, summary.accepted)
            }
        }

        let mut guard = lock(&state);
        if guard.status.run_id != Some(run_id) {
            continue;
        }
        match event {
            HarvestEvent::TaskCompleted { .. } | HarvestEvent::TaskFailed { .. } => {
                guard.status.tasks_done += 1
            }
            HarvestEvent::LeadAccepted { .. } => guard.status.accepted += 1,
            _ => {}
        }
    }
}
