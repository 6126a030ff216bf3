//! Agent-to-agent delegation.
//!
//! A parent agent hands a task to a child agent. Each hand-off is a
//! [`DelegationRun`] that moves through
//!
//! ```text
//! Registered -> Running -> Completed | Failed | TimedOut
//! ```
//!
//! and runs in its own `delegation-xxxxxxxx` session of the child, so the
//! child's regular conversations are untouched. Runs are kept in
//! `delegation/runs.json` keyed by run id. Terminal runs never change again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::agent::events::{EventStream, RunEvents};
use crate::agent::supervisor::{AgentState, Supervisor};
use crate::error::{AgentError, MemoryError};
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

/// Parent session used when the caller names none.
pub const DEFAULT_PARENT_SESSION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Registered,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Registered => "registered",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::TimedOut
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delegated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRun {
    pub run_id: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub task: String,
    /// Child session the task runs in.
    pub session_id: String,
    pub parent_session_id: String,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
}

impl DelegationRun {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Request to delegate `task` from `parent_agent_id` to `child_agent_id`.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub task: String,
    pub parent_session_id: String,
    /// Falls back to the configured delegation timeout.
    pub timeout: Option<Duration>,
}

impl DelegationRequest {
    pub fn new(
        parent_agent_id: impl Into<String>,
        child_agent_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            parent_agent_id: parent_agent_id.into(),
            child_agent_id: child_agent_id.into(),
            task: task.into(),
            parent_session_id: DEFAULT_PARENT_SESSION.to_string(),
            timeout: None,
        }
    }

    pub fn with_parent_session(mut self, session_id: impl Into<String>) -> Self {
        self.parent_session_id = session_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject blank fields, a zero timeout and self-delegation.
    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |reason: &str| {
            Err(AgentError::InvalidDelegation {
                reason: reason.to_string(),
            })
        };
        let parent = self.parent_agent_id.trim();
        let child = self.child_agent_id.trim();
        if parent.is_empty() {
            return invalid("parent agent is required");
        }
        if child.is_empty() {
            return invalid("child agent is required");
        }
        if self.task.trim().is_empty() {
            return invalid("task is required");
        }
        if self.parent_session_id.trim().is_empty() {
            return invalid("parent session is required");
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return invalid("timeout must be greater than zero");
        }
        if parent == child {
            return invalid("circular delegation is not allowed");
        }
        Ok(())
    }
}

// ==================== Registry ====================

/// Persistent record of delegation runs.
pub struct DelegationRegistry {
    store: Arc<dyn DocumentStore>,
    runs: Mutex<BTreeMap<String, DelegationRun>>,
}

impl DelegationRegistry {
    /// Load stored runs. Unreadable records are skipped and an unreadable
    /// file starts the registry empty.
    pub async fn open(store: Arc<dyn DocumentStore>) -> Result<Self, MemoryError> {
        let raw = store
            .get_document(&Scope::Global, DocumentKind::DelegationRuns)
            .await?;
        let runs = match raw {
            Some(raw) => parse_runs(&raw),
            None => BTreeMap::new(),
        };
        Ok(Self {
            store,
            runs: Mutex::new(runs),
        })
    }

    pub async fn register(
        &self,
        request: &DelegationRequest,
        default_timeout: Duration,
    ) -> Result<DelegationRun, AgentError> {
        request.validate()?;
        let timeout = request.timeout.unwrap_or(default_timeout);
        if timeout.is_zero() {
            return Err(AgentError::InvalidDelegation {
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        let short = uuid::Uuid::new_v4().simple().to_string();
        let run = DelegationRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            parent_agent_id: request.parent_agent_id.trim().to_string(),
            child_agent_id: request.child_agent_id.trim().to_string(),
            task: request.task.trim().to_string(),
            session_id: format!("delegation-{}", &short[..8]),
            parent_session_id: request.parent_session_id.trim().to_string(),
            status: RunStatus::Registered,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            timeout_ms: timeout.as_millis() as u64,
        };

        let mut runs = self.runs.lock().await;
        runs.insert(run.run_id.clone(), run.clone());
        self.persist(&runs).await;
        tracing::info!(
            "Registered delegation {}: {} -> {}",
            run.run_id,
            run.parent_agent_id,
            run.child_agent_id
        );
        Ok(run)
    }

    pub async fn mark_running(&self, run_id: &str) -> Result<DelegationRun, AgentError> {
        self.transition(run_id, |run| {
            run.status = RunStatus::Running;
        })
        .await
    }

    pub async fn complete(&self, run_id: &str, result: &str) -> Result<DelegationRun, AgentError> {
        self.transition(run_id, |run| {
            run.status = RunStatus::Completed;
            run.result = Some(result.to_string());
            run.error = None;
            run.completed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn fail(&self, run_id: &str, error: &str) -> Result<DelegationRun, AgentError> {
        let error = match error.trim() {
            "" => "Unknown failure",
            error => error,
        };
        self.transition(run_id, |run| {
            run.status = RunStatus::Failed;
            run.error = Some(error.to_string());
            run.completed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn time_out(&self, run_id: &str) -> Result<DelegationRun, AgentError> {
        self.transition(run_id, |run| mark_timed_out(run, Utc::now()))
            .await
    }

    /// Mark running runs older than their timeout as timed out.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<DelegationRun> {
        let mut runs = self.runs.lock().await;
        let mut expired = Vec::new();
        for run in runs.values_mut() {
            if run.status != RunStatus::Running {
                continue;
            }
            let age = (now - run.created_at).to_std().unwrap_or_default();
            if age <= run.timeout() {
                continue;
            }
            mark_timed_out(run, now);
            expired.push(run.clone());
        }
        if !expired.is_empty() {
            tracing::warn!("{} delegation run(s) timed out", expired.len());
            self.persist(&runs).await;
        }
        expired
    }

    pub async fn get(&self, run_id: &str) -> Option<DelegationRun> {
        self.runs.lock().await.get(run_id).cloned()
    }

    /// Runs newest first, optionally only those started by `parent`.
    pub async fn list(&self, parent: Option<&str>) -> Vec<DelegationRun> {
        let parent = parent.map(str::trim).filter(|p| !p.is_empty());
        let mut runs: Vec<DelegationRun> = self
            .runs
            .lock()
            .await
            .values()
            .filter(|run| parent.is_none_or(|p| run.parent_agent_id == p))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    async fn transition(
        &self,
        run_id: &str,
        apply: impl FnOnce(&mut DelegationRun),
    ) -> Result<DelegationRun, AgentError> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(run_id).ok_or_else(|| AgentError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        if run.status.is_terminal() {
            tracing::debug!("Delegation {} already {}", run_id, run.status);
            return Ok(run.clone());
        }
        apply(run);
        let updated = run.clone();
        self.persist(&runs).await;
        Ok(updated)
    }

    async fn persist(&self, runs: &BTreeMap<String, DelegationRun>) {
        let saved = match serde_json::to_string_pretty(runs) {
            Ok(json) => {
                self.store
                    .put_document(&Scope::Global, DocumentKind::DelegationRuns, &json)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            tracing::error!("Failed to persist delegation runs: {}", e);
        }
    }
}

fn mark_timed_out(run: &mut DelegationRun, now: DateTime<Utc>) {
    run.status = RunStatus::TimedOut;
    run.error = Some(format!(
        "Timed out after {:.1}s",
        run.timeout().as_secs_f64()
    ));
    run.completed_at = Some(now);
}

fn parse_runs(raw: &str) -> BTreeMap<String, DelegationRun> {
    let records: BTreeMap<String, serde_json::Value> = match serde_json::from_str(raw) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Resetting unreadable delegation runs: {}", e);
            return BTreeMap::new();
        }
    };
    records
        .into_iter()
        .filter_map(|(run_id, record)| match serde_json::from_value::<DelegationRun>(record) {
            Ok(run) => Some((run.run_id.clone(), run)),
            Err(e) => {
                tracing::warn!("Skipping invalid delegation run {}: {}", run_id, e);
                None
            }
        })
        .collect()
}

// ==================== Delegator ====================

/// Runs delegations against the supervisor.
pub struct Delegator {
    supervisor: Arc<Supervisor>,
    registry: DelegationRegistry,
    default_timeout: Duration,
}

impl Delegator {
    pub async fn open(
        supervisor: Arc<Supervisor>,
        store: Arc<dyn DocumentStore>,
        default_timeout: Duration,
    ) -> Result<Self, MemoryError> {
        Ok(Self {
            supervisor,
            registry: DelegationRegistry::open(store).await?,
            default_timeout,
        })
    }

    /// Hand the task to the child and wait for its outcome. Problems with
    /// the child after registration are recorded on the run, not returned.
    pub async fn delegate(&self, request: DelegationRequest) -> Result<DelegationRun, AgentError> {
        request.validate()?;
        self.supervisor.get_agent(request.parent_agent_id.trim()).await?;
        let child = self.supervisor.get_agent(request.child_agent_id.trim()).await?;

        let run = self.registry.register(&request, self.default_timeout).await?;
        let events = Arc::new(self.supervisor.events().run_as(
            &run.run_id,
            &run.child_agent_id,
            Some(run.session_id.as_str()),
        ));
        events
            .emit(
                EventStream::Delegation,
                "delegation.registered",
                json!({
                    "parent_agent_id": run.parent_agent_id,
                    "parent_session_id": run.parent_session_id,
                    "timeout_ms": run.timeout_ms,
                }),
            )
            .await;

        if child.state != AgentState::Running {
            if let Err(e) = self.supervisor.start(&run.child_agent_id).await {
                let reason = format!("Failed to start agent {}: {}", run.child_agent_id, e);
                return self.finish(&events, self.registry.fail(&run.run_id, &reason).await?).await;
            }
        }

        let run = self.registry.mark_running(&run.run_id).await?;
        events
            .emit(EventStream::Delegation, "delegation.running", json!({}))
            .await;

        let handle = match self
            .supervisor
            .submit_turn_with(&run.child_agent_id, &run.session_id, &run.task, Some(events.clone()))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                return self
                    .finish(&events, self.registry.fail(&run.run_id, &e.to_string()).await?)
                    .await;
            }
        };

        let settled = match tokio::time::timeout(run.timeout(), handle.wait()).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => {
                self.registry.complete(&run.run_id, &reply).await?
            }
            Ok(Ok(_)) => self.registry.fail(&run.run_id, "empty reply").await?,
            Ok(Err(e)) => self.registry.fail(&run.run_id, &e.to_string()).await?,
            Err(_) => {
                tracing::warn!(
                    "Delegation {} to {} timed out after {:?}",
                    run.run_id,
                    run.child_agent_id,
                    run.timeout()
                );
                self.registry.time_out(&run.run_id).await?
            }
        };
        self.finish(&events, settled).await
    }

    async fn finish(
        &self,
        events: &RunEvents,
        run: DelegationRun,
    ) -> Result<DelegationRun, AgentError> {
        let data = json!({
            "status": run.status.as_str(),
            "result_length": run.result.as_ref().map(|r| r.chars().count()),
            "error": run.error,
        });
        events
            .emit(
                EventStream::Delegation,
                &format!("delegation.{}", run.status.as_str()),
                data,
            )
            .await;
        tracing::info!("Delegation {} {}", run.run_id, run.status);
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<DelegationRun, AgentError> {
        self.sweep().await;
        self.registry
            .get(run_id)
            .await
            .ok_or_else(|| AgentError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub async fn list_runs(&self, parent: Option<&str>) -> Vec<DelegationRun> {
        self.sweep().await;
        self.registry.list(parent).await
    }

    /// Time out runs left running past their deadline, such as runs whose
    /// process exited mid-delegation.
    pub async fn sweep(&self) -> Vec<DelegationRun> {
        self.registry.check_timeouts(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::AgentEvent;
    use crate::agent::supervisor::NewAgent;
    use crate::config::{AgentsConfig, ExecutorConfig};
    use crate::memory::store::FileStore;
    use crate::testing::{ScriptedExecutor, ScriptedProcess};
    use pretty_assertions::assert_eq;
    use tokio::sync::Semaphore;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<dyn DocumentStore>,
        supervisor: Arc<Supervisor>,
        executor: Arc<ScriptedExecutor>,
        delegator: Delegator,
    }

    async fn harness(process: ScriptedProcess) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(dir.path()));
        let executor = Arc::new(ScriptedExecutor::new(process));
        let exec_config = ExecutorConfig::default().with_timeouts(
            Duration::from_millis(500),
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            executor.clone(),
            &AgentsConfig::default(),
            &exec_config,
        ));
        for id in ["lead", "scout"] {
            supervisor
                .create_agent(NewAgent {
                    id: Some(id.to_string()),
                    ..NewAgent::named(id)
                })
                .await
                .unwrap();
        }
        let delegator = Delegator::open(supervisor.clone(), store.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        Harness {
            _dir: dir,
            store,
            supervisor,
            executor,
            delegator,
        }
    }

    fn event_types(events: &[AgentEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let h = harness(ScriptedProcess::new()).await;
        for request in [
            DelegationRequest::new("lead", "lead", "loop"),
            DelegationRequest::new("lead", "scout", "  "),
            DelegationRequest::new("", "scout", "task"),
            DelegationRequest::new("lead", "scout", "task").with_timeout(Duration::ZERO),
            DelegationRequest::new("lead", "scout", "task").with_parent_session(""),
        ] {
            let err = h.delegator.delegate(request).await.unwrap_err();
            assert!(matches!(err, AgentError::InvalidDelegation { .. }), "{}", err);
        }

        let err = h
            .delegator
            .delegate(DelegationRequest::new("lead", "ghost", "task"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound { .. }));
        assert!(h.delegator.list_runs(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_delegate_starts_child_and_completes() {
        let h = harness(ScriptedProcess::new()).await;
        let run = h
            .delegator
            .delegate(DelegationRequest::new("lead", "scout", "find sources").with_parent_session("s1"))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("reply: find sources"));
        assert_eq!(run.parent_session_id, "s1");
        assert!(run.session_id.starts_with("delegation-"));
        assert_eq!(run.session_id.len(), "delegation-".len() + 8);
        assert!(run.completed_at.is_some());
        assert_eq!(
            h.supervisor.get_agent("scout").await.unwrap().state,
            AgentState::Running
        );

        // The task ran in its own session of the child.
        let session = h.supervisor.get_session("scout", &run.session_id).await.unwrap();
        assert_eq!(session.turns.len(), 2);

        let events: Vec<AgentEvent> = h
            .supervisor
            .events()
            .recent(Some("scout"), None, 50)
            .await
            .into_iter()
            .filter(|e| e.run_id == run.run_id)
            .collect();
        assert_eq!(
            event_types(&events),
            vec![
                "delegation.registered",
                "delegation.running",
                "turn.assigned",
                "turn.completed",
                "delegation.completed",
            ]
        );
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_turn_fails_run() {
        let h = harness(ScriptedProcess::new().failing()).await;
        let run = h
            .delegator
            .delegate(DelegationRequest::new("lead", "scout", "task"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("failed"));
        assert_eq!(run.result, None);
    }

    #[tokio::test]
    async fn test_launch_failure_fails_run() {
        let h = harness(ScriptedProcess::new()).await;
        h.executor.fail_launches(true);
        let run = h
            .delegator
            .delegate(DelegationRequest::new("lead", "scout", "task"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().starts_with("Failed to start agent scout"));
    }

    #[tokio::test]
    async fn test_slow_child_times_out() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedProcess::new().with_gate(gate.clone())).await;
        let run = h
            .delegator
            .delegate(
                DelegationRequest::new("lead", "scout", "task")
                    .with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
        assert_eq!(run.error.as_deref(), Some("Timed out after 0.2s"));

        // A late reply does not reopen the run.
        gate.add_permits(1);
        let late = h.delegator.registry.complete(&run.run_id, "late").await.unwrap();
        assert_eq!(late.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_runs_persist_newest_first() {
        let h = harness(ScriptedProcess::new()).await;
        let first = h
            .delegator
            .delegate(DelegationRequest::new("lead", "scout", "one"))
            .await
            .unwrap();
        let second = h
            .delegator
            .delegate(DelegationRequest::new("scout", "lead", "two"))
            .await
            .unwrap();

        let reopened = DelegationRegistry::open(h.store.clone()).await.unwrap();
        let ids: Vec<String> = reopened.list(None).await.into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![second.run_id.clone(), first.run_id.clone()]);
        let from_lead = reopened.list(Some("lead")).await;
        assert_eq!(from_lead.len(), 1);
        assert_eq!(from_lead[0], first);

        assert_eq!(h.delegator.get_run(&second.run_id).await.unwrap(), second);
        assert!(matches!(
            h.delegator.get_run("nope").await,
            Err(AgentError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_check_timeouts_only_touches_stale_running_runs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DelegationRegistry::open(Arc::new(FileStore::new(dir.path())))
            .await
            .unwrap();
        let request = DelegationRequest::new("lead", "scout", "task");
        let stale = registry.register(&request, Duration::from_secs(1)).await.unwrap();
        registry.mark_running(&stale.run_id).await.unwrap();
        let waiting = registry.register(&request, Duration::from_secs(1)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let expired = registry.check_timeouts(later).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id, stale.run_id);
        assert_eq!(expired[0].error.as_deref(), Some("Timed out after 1.0s"));
        assert_eq!(
            registry.get(&waiting.run_id).await.unwrap().status,
            RunStatus::Registered
        );
        assert!(registry.check_timeouts(later).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(dir.path()));
        store
            .put_document(
                &Scope::Global,
                DocumentKind::DelegationRuns,
                r#"{"broken": {"run_id": 7}}"#,
            )
            .await
            .unwrap();
        let registry = DelegationRegistry::open(store.clone()).await.unwrap();
        assert!(registry.list(None).await.is_empty());

        store
            .put_document(&Scope::Global, DocumentKind::DelegationRuns, "not json")
            .await
            .unwrap();
        let registry = DelegationRegistry::open(store).await.unwrap();
        assert!(registry.list(None).await.is_empty());
    }
}
