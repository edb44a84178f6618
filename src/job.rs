use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    id::new_run_id,
    pipeline::{ErrorClass, PipelineError, UpdatePipeline, UpdateReport},
};

pub type UpdateFuture = Pin<Box<dyn Future<Output = Result<UpdateReport, PipelineError>> + Send>>;

pub trait UpdateRunner: Send + Sync {
    fn run_update(&self) -> UpdateFuture;
}

impl UpdateRunner for UpdatePipeline {
    fn run_update(&self) -> UpdateFuture {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.run().await })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    Api,
    Scheduled,
}

impl UpdateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastResult {
    pub success: bool,
    pub detail: String,
    pub run_id: String,
    pub reason: UpdateReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub advisories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<UpdateReport>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateJobSnapshot {
    pub running: bool,
    pub run_id: Option<String>,
    pub reason: Option<UpdateReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub last_result: Option<LastResult>,
    pub run_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBusy {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Display for JobBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "update {} is already running since {}",
            self.run_id,
            self.started_at.to_rfc3339()
        )
    }
}

impl std::error::Error for JobBusy {}

#[derive(Debug)]
pub struct AcceptedJob {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// `None` when the update task itself died.
    pub class: Option<ErrorClass>,
    pub message: String,
}

impl From<PipelineError> for JobFailure {
    fn from(value: PipelineError) -> Self {
        Self {
            class: Some(value.class()),
            message: value.to_string(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.class {
            Some(class) => write!(f, "[{}] {}", class.as_str(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for JobFailure {}

/// Runs `runner` under an overall deadline. A panic inside the runner is reported as a
/// failure instead of unwinding into the caller.
pub async fn run_with_deadline(
    runner: Arc<dyn UpdateRunner>,
    deadline: Duration,
) -> Result<UpdateReport, JobFailure> {
    let work = tokio::spawn(runner.run_update());
    let abort = work.abort_handle();
    match tokio::time::timeout(deadline, work).await {
        Ok(Ok(result)) => result.map_err(JobFailure::from),
        Ok(Err(join_err)) => Err(JobFailure {
            class: None,
            message: format!("update task failed: {join_err}"),
        }),
        Err(_) => {
            abort.abort();
            Err(PipelineError::DeadlineExceeded {
                secs: deadline.as_secs(),
            }
            .into())
        }
    }
}

/// Process-wide update job state with single-flight admission.
#[derive(Clone)]
pub struct UpdateJobHandle {
    inner: Arc<Mutex<UpdateJobSnapshot>>,
    runner: Arc<dyn UpdateRunner>,
    deadline: Duration,
}

impl UpdateJobHandle {
    pub fn new(runner: Arc<dyn UpdateRunner>, deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(UpdateJobSnapshot::default())),
            runner,
            deadline,
        }
    }

    pub async fn snapshot(&self) -> UpdateJobSnapshot {
        self.inner.lock().await.clone()
    }

    /// Starts an update in the background unless one is already running. Never waits for
    /// the update to finish.
    pub async fn try_start(&self, reason: UpdateReason) -> Result<AcceptedJob, JobBusy> {
        let mut snap = self.inner.lock().await;
        if snap.running {
            return Err(JobBusy {
                run_id: snap.run_id.clone().unwrap_or_default(),
                started_at: snap.started_at.unwrap_or_else(Utc::now),
            });
        }

        let run_id = new_run_id();
        let started_at = Utc::now();
        snap.running = true;
        snap.run_id = Some(run_id.clone());
        snap.reason = Some(reason);
        snap.started_at = Some(started_at);
        info!(%run_id, reason = reason.as_str(), "update accepted");

        let inner = self.inner.clone();
        let runner = self.runner.clone();
        let deadline = self.deadline;
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            let outcome = run_with_deadline(runner, deadline).await;
            let finished_at = Utc::now();

            let result = match outcome {
                Ok(report) => {
                    let advisories: Vec<String> =
                        report.advisories().into_iter().map(str::to_string).collect();
                    for advisory in &advisories {
                        warn!(run_id = %task_run_id, %advisory, "update finished with advisory");
                    }
                    info!(
                        run_id = %task_run_id,
                        best_node = %report.best_node,
                        reload_tier = %report.reload_tier,
                        duration_ms = report.duration_ms,
                        "update succeeded"
                    );
                    LastResult {
                        success: true,
                        detail: report.summary(),
                        run_id: task_run_id,
                        reason,
                        error_class: None,
                        advisories,
                        report: Some(report),
                    }
                }
                Err(failure) => {
                    error!(run_id = %task_run_id, error = %failure, "update failed");
                    LastResult {
                        success: false,
                        error_class: failure.class,
                        detail: failure.message,
                        run_id: task_run_id,
                        reason,
                        advisories: Vec::new(),
                        report: None,
                    }
                }
            };

            let mut snap = inner.lock().await;
            snap.running = false;
            snap.last_update_time = Some(finished_at);
            snap.last_result = Some(result);
            snap.run_count = snap.run_count.saturating_add(1);
        });

        Ok(AcceptedJob {
            run_id,
            started_at,
            task,
        })
    }
}
