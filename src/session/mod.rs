//! Session and statement-execution tracking for the UI model.
//!
//! A second observer on the host event bus, independent of the forwarding
//! pipeline. Sessions and executions live in insertion-ordered maps under
//! one lock; finished entries are trimmed oldest-first once a retention
//! bound is exceeded.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Lifecycle of one statement execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Started,
    Compiled,
    Failed,
    Finished,
}

impl ExecutionState {
    /// True once the execution can be trimmed.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Failed | Self::Finished)
    }
}

/// One client session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub start_timestamp: i64,
    pub ip: String,
    pub user: String,
    /// Zero while the session is open.
    pub finish_timestamp: i64,
    pub total_execution: u64,
}

impl SessionInfo {
    fn is_finished(&self) -> bool {
        self.finish_timestamp != 0
    }
}

/// One statement execution within a session.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub statement: String,
    pub session_id: String,
    pub group_id: String,
    pub start_timestamp: i64,
    pub user: String,
    /// Zero while the statement is running.
    pub finish_timestamp: i64,
    pub execute_plan: String,
    pub detail: String,
    pub state: ExecutionState,
    pub job_ids: Vec<i64>,
}

#[derive(Default)]
struct TrackerState {
    /// Insertion-ordered; bounded by retention.
    sessions: Vec<(String, SessionInfo)>,
    executions: Vec<(String, ExecutionInfo)>,
    online_session_count: u64,
    running_statement_count: u64,
    stopped: bool,
}

impl TrackerState {
    fn session_mut(&mut self, id: &str) -> Option<&mut SessionInfo> {
        self.sessions
            .iter_mut()
            .find(|(key, _)| key == id)
            .map(|(_, info)| info)
    }

    fn execution_mut(&mut self, id: &str) -> Option<&mut ExecutionInfo> {
        self.executions
            .iter_mut()
            .find(|(key, _)| key == id)
            .map(|(_, info)| info)
    }
}

/// Tracks sessions and executions with bounded retention.
pub struct SessionTracker {
    state: Mutex<TrackerState>,
    clock: Arc<Clock>,
    retained_sessions: usize,
    retained_executions: usize,
}

impl SessionTracker {
    pub fn new(clock: Arc<Clock>, retained_sessions: usize, retained_executions: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            clock,
            retained_sessions,
            retained_executions,
        }
    }

    /// Number of currently open sessions.
    pub fn online_session_count(&self) -> u64 {
        self.state.lock().online_session_count
    }

    /// Number of statements currently running.
    pub fn total_running(&self) -> u64 {
        self.state.lock().running_statement_count
    }

    /// Snapshot of tracked sessions in insertion order.
    pub fn session_list(&self) -> Vec<SessionInfo> {
        self.state
            .lock()
            .sessions
            .iter()
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Snapshot of tracked executions in insertion order.
    pub fn execution_list(&self) -> Vec<ExecutionInfo> {
        self.state
            .lock()
            .executions
            .iter()
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub fn on_session_created(&self, session_id: &str, ip: &str, user: &str) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }

        state.sessions.push((
            session_id.to_string(),
            SessionInfo {
                session_id: session_id.to_string(),
                start_timestamp: now,
                ip: ip.to_string(),
                user: user.to_string(),
                finish_timestamp: 0,
                total_execution: 0,
            },
        ));
        state.online_session_count += 1;

        Self::trim_sessions(&mut state, self.retained_sessions);
    }

    pub fn on_session_closed(&self, session_id: &str) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }

        match state.session_mut(session_id) {
            Some(session) => session.finish_timestamp = now,
            None => {
                warn!(session_id, "close for untracked session");
                return;
            }
        }
        state.online_session_count = state.online_session_count.saturating_sub(1);

        Self::trim_sessions(&mut state, self.retained_sessions);
    }

    pub fn on_statement_start(
        &self,
        exec_id: &str,
        session_id: &str,
        statement: &str,
        group_id: &str,
        user: &str,
    ) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }

        state.executions.push((
            exec_id.to_string(),
            ExecutionInfo {
                statement: statement.to_string(),
                session_id: session_id.to_string(),
                group_id: group_id.to_string(),
                start_timestamp: now,
                user: user.to_string(),
                finish_timestamp: 0,
                execute_plan: String::new(),
                detail: String::new(),
                state: ExecutionState::Started,
                job_ids: Vec::new(),
            },
        ));

        if let Some(session) = state.session_mut(session_id) {
            session.total_execution += 1;
        }
        state.running_statement_count += 1;

        Self::trim_executions(&mut state, self.retained_executions);
    }

    pub fn on_statement_parsed(&self, exec_id: &str, execute_plan: &str) {
        let mut state = self.state.lock();
        if let Some(exec) = state.execution_mut(exec_id) {
            exec.execute_plan = execute_plan.to_string();
            exec.state = ExecutionState::Compiled;
        }
    }

    pub fn on_statement_error(&self, exec_id: &str, message: &str, trace: &str) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(exec) = state.execution_mut(exec_id) {
            exec.finish_timestamp = now;
            exec.detail = format!("{message}\n{trace}");
            exec.state = ExecutionState::Failed;
        }
        state.running_statement_count = state.running_statement_count.saturating_sub(1);

        Self::trim_executions(&mut state, self.retained_executions);
    }

    pub fn on_statement_finish(&self, exec_id: &str) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(exec) = state.execution_mut(exec_id) {
            exec.finish_timestamp = now;
            exec.state = ExecutionState::Finished;
        }
        state.running_statement_count = state.running_statement_count.saturating_sub(1);

        Self::trim_executions(&mut state, self.retained_executions);
    }

    /// Attributes a job to every execution sharing its group.
    pub fn on_job_start(&self, job_id: i64, group_id: &str) {
        let mut state = self.state.lock();
        for (_, exec) in &mut state.executions {
            if exec.group_id == group_id {
                exec.job_ids.push(job_id);
            }
        }
    }

    /// Stops tracking; all further callbacks are ignored.
    pub fn on_application_end(&self) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.stopped = true;
            debug!("session tracker stopped");
        }
    }

    /// Removes up to `max(limit/10, 1)` of the oldest finished sessions once
    /// the map exceeds its bound, in insertion order.
    fn trim_sessions(state: &mut TrackerState, limit: usize) {
        if state.sessions.len() <= limit {
            return;
        }

        let mut quota = (limit / 10).max(1);
        state.sessions.retain(|(_, session)| {
            if quota > 0 && session.is_finished() {
                quota -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Execution-side counterpart of `trim_sessions`.
    fn trim_executions(state: &mut TrackerState, limit: usize) {
        if state.executions.len() <= limit {
            return;
        }

        let mut quota = (limit / 10).max(1);
        state.executions.retain(|(_, exec)| {
            if quota > 0 && exec.state.is_settled() {
                quota -= 1;
                false
            } else {
                true
            }
        });
    }
}
