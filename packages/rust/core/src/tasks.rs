//! Pollable planning tasks: trigger → status → result.
//!
//! Each task runs on its own tokio task with its own database connection.
//! A scope has at most one running task; different scopes plan concurrently.
//! Scopes sharing pages may race at commit; the planner re-plans the loser.
//! Finished tasks are kept for polling up to a retention limit, oldest
//! dropped first.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use linkweave_shared::{LinkweaveError, Result, TaskId};
use linkweave_storage::Storage;

use crate::pipeline::{PlanOutcome, PlanPhase, PlanProgress, PlanRequest, Planner};

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub scope_id: String,
    pub phase: PlanPhase,
    pub pages_done: usize,
    pub pages_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a finished (or unfinished) task produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskResult {
    Pending,
    Done(PlanOutcome),
    Failed { error: String },
}

struct TaskRecord {
    status: TaskStatus,
    outcome: Option<PlanOutcome>,
}

type Registry = Arc<RwLock<HashMap<TaskId, TaskRecord>>>;

/// Finished tasks kept for polling by default.
const DEFAULT_RETAINED_TASKS: usize = 64;

/// Runs planning requests in the background and tracks their progress.
#[derive(Clone)]
pub struct PlanService {
    planner: Planner,
    storage: Arc<Storage>,
    tasks: Registry,
    retain: usize,
}

impl PlanService {
    pub fn new(planner: Planner, storage: Storage) -> Self {
        Self {
            planner,
            storage: Arc::new(storage),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            retain: DEFAULT_RETAINED_TASKS,
        }
    }

    /// Keep at most `retain` finished tasks (at least one).
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// Start planning `request.scope_id`, or return the handle of the task
    /// already running for that scope.
    pub async fn trigger(&self, request: PlanRequest) -> Result<TaskId> {
        let id = {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            if let Some((id, _)) = tasks
                .iter()
                .find(|(_, t)| t.status.scope_id == request.scope_id && !t.status.phase.is_finished())
            {
                info!(task = %id, scope = %request.scope_id, "plan already running");
                return Ok(*id);
            }
            let id = TaskId::new();
            tasks.insert(
                id,
                TaskRecord {
                    status: TaskStatus {
                        id,
                        scope_id: request.scope_id.clone(),
                        phase: PlanPhase::Queued,
                        pages_done: 0,
                        pages_total: 0,
                        current_page: None,
                        error: None,
                    },
                    outcome: None,
                },
            );
            id
        };

        let storage = match self.storage.reconnect().await {
            Ok(storage) => storage,
            Err(e) => {
                finish(&self.tasks, id, Err(&e), self.retain);
                return Err(e);
            }
        };

        let planner = self.planner.clone();
        let tasks = Arc::clone(&self.tasks);
        let retain = self.retain;
        info!(task = %id, scope = %request.scope_id, "plan queued");
        tokio::spawn(async move {
            let progress = TaskProgress {
                id,
                tasks: Arc::clone(&tasks),
            };
            let result = planner.plan_scope(&storage, &request, &progress).await;
            match result {
                Ok(outcome) => finish(&tasks, id, Ok(outcome), retain),
                Err(e) => {
                    error!(task = %id, scope = %request.scope_id, error = %e, "plan failed");
                    finish(&tasks, id, Err(&e), retain);
                }
            }
        });
        Ok(id)
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks
            .get(&id)
            .map(|t| t.status.clone())
            .ok_or_else(|| LinkweaveError::not_found(format!("task {id}")))
    }

    pub fn result(&self, id: TaskId) -> Result<TaskResult> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let record = tasks
            .get(&id)
            .ok_or_else(|| LinkweaveError::not_found(format!("task {id}")))?;
        Ok(match (&record.outcome, record.status.phase) {
            (Some(outcome), _) => TaskResult::Done(outcome.clone()),
            (None, PlanPhase::Failed) => TaskResult::Failed {
                error: record.status.error.clone().unwrap_or_default(),
            },
            (None, _) => TaskResult::Pending,
        })
    }

    /// Drop a finished task and hand back its result. Running tasks stay.
    pub fn forget(&self, id: TaskId) -> Result<TaskResult> {
        let result = self.result(id)?;
        if matches!(result, TaskResult::Pending) {
            return Err(LinkweaveError::Conflict(format!("task {id} is still running")));
        }
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        tasks.remove(&id);
        Ok(result)
    }

    /// Every known task, oldest first.
    pub fn list(&self) -> Vec<TaskStatus> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<TaskStatus> = tasks.values().map(|t| t.status.clone()).collect();
        all.sort_by_key(|s| s.id.0);
        all
    }

    /// Poll until the task finishes.
    pub async fn wait(&self, id: TaskId, interval: Duration) -> Result<TaskResult> {
        loop {
            match self.result(id)? {
                TaskResult::Pending => tokio::time::sleep(interval).await,
                finished => return Ok(finished),
            }
        }
    }
}

fn finish(
    tasks: &Registry,
    id: TaskId,
    result: std::result::Result<PlanOutcome, &LinkweaveError>,
    retain: usize,
) {
    let mut tasks = tasks.write().unwrap_or_else(PoisonError::into_inner);
    let Some(record) = tasks.get_mut(&id) else {
        return;
    };
    record.status.current_page = None;
    match result {
        Ok(outcome) => {
            record.status.phase = PlanPhase::Done;
            record.outcome = Some(outcome);
        }
        Err(e) => {
            record.status.phase = PlanPhase::Failed;
            record.status.error = Some(e.to_string());
        }
    }

    let mut finished: Vec<TaskId> = tasks
        .values()
        .filter(|t| t.status.phase.is_finished())
        .map(|t| t.status.id)
        .collect();
    if finished.len() > retain {
        finished.sort_by_key(|id| id.0);
        let excess = finished.len() - retain;
        for old in &finished[..excess] {
            tasks.remove(old);
        }
        debug!(dropped = excess, "pruned finished plan tasks");
    }
}

/// Mirrors pipeline progress into the task registry.
struct TaskProgress {
    id: TaskId,
    tasks: Registry,
}

impl TaskProgress {
    fn update(&self, f: impl FnOnce(&mut TaskStatus)) {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = tasks.get_mut(&self.id) {
            f(&mut record.status);
        }
    }
}

impl PlanProgress for TaskProgress {
    fn phase(&self, phase: PlanPhase) {
        // Done is published by `finish`, together with the outcome.
        if phase != PlanPhase::Done {
            self.update(|s| s.phase = phase);
        }
    }

    fn page_done(&self, page_id: &str, current: usize, total: usize) {
        self.update(|s| {
            s.pages_done = current;
            s.pages_total = total;
            s.current_page = Some(page_id.to_string());
        });
    }
}
