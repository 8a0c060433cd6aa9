//! Reader-side reconciliation of application history listings.
//!
//! A history UI querying the Timeline Server sees several entity views of
//! the same application: older cached listings, freshly fetched ones, and
//! the resource manager's live application reports. These pure functions
//! merge those views into one ordered attempt list per application.

use std::collections::{HashMap, HashSet};

/// One execution attempt of an application, as reconstructed from entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationAttemptInfo {
    /// Attempt id; `None` for applications that predate attempt tracking.
    pub attempt_id: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    /// Timestamp of the freshest entity contributing to this view.
    pub last_updated: i64,
    pub completed: bool,
    pub spark_user: String,
}

/// One application with its attempts, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationHistoryInfo {
    pub id: String,
    pub name: String,
    pub attempts: Vec<ApplicationAttemptInfo>,
}

/// Terminal/live state of an application per the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YarnApplicationState {
    New,
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl YarnApplicationState {
    /// True for states from which the application cannot produce more events.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

/// Live application report from the resource manager.
#[derive(Debug, Clone)]
pub struct ApplicationReport {
    pub state: YarnApplicationState,
    pub finish_time: i64,
}

/// Picks the fresher of two views of the same attempt.
///
/// A completed view always beats an incomplete one; otherwise the larger
/// `last_updated` wins and ties go to `b`.
pub fn most_recent_attempt(
    a: ApplicationAttemptInfo,
    b: ApplicationAttemptInfo,
) -> ApplicationAttemptInfo {
    if a.completed && !b.completed {
        return a;
    }
    if b.completed && !a.completed {
        return b;
    }
    if a.last_updated > b.last_updated {
        a
    } else {
        b
    }
}

/// Sorts attempts newest-first by `last_updated`.
pub fn sort_attempts(mut attempts: Vec<ApplicationAttemptInfo>) -> Vec<ApplicationAttemptInfo> {
    attempts.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    attempts
}

/// Merges two attempt lists keyed by attempt id (with `None` a valid key),
/// preferring the fresher view on collision. Result is newest-first.
pub fn merge_attempt_info_lists(
    old: Vec<ApplicationAttemptInfo>,
    latest: Vec<ApplicationAttemptInfo>,
) -> Vec<ApplicationAttemptInfo> {
    let mut by_id: HashMap<Option<String>, ApplicationAttemptInfo> = HashMap::new();

    for attempt in old {
        by_id.insert(attempt.attempt_id.clone(), attempt);
    }

    for attempt in latest {
        match by_id.remove(&attempt.attempt_id) {
            Some(existing) => {
                let merged = most_recent_attempt(existing, attempt);
                by_id.insert(merged.attempt_id.clone(), merged);
            }
            None => {
                by_id.insert(attempt.attempt_id.clone(), attempt);
            }
        }
    }

    sort_attempts(by_id.into_values().collect())
}

/// Merges two views of one application, reconciling their attempt lists.
pub fn merge_attempts(
    original: ApplicationHistoryInfo,
    latest: ApplicationHistoryInfo,
) -> ApplicationHistoryInfo {
    ApplicationHistoryInfo {
        id: latest.id,
        name: latest.name,
        attempts: merge_attempt_info_lists(original.attempts, latest.attempts),
    }
}

/// Combines an existing listing with a freshly fetched one.
///
/// Applications are merged by id; order is the original listing followed by
/// applications only present in the latest fetch, in their fetch order.
pub fn combine_results(
    original: Vec<ApplicationHistoryInfo>,
    latest: Vec<ApplicationHistoryInfo>,
) -> Vec<ApplicationHistoryInfo> {
    let mut latest_by_id: HashMap<String, ApplicationHistoryInfo> = HashMap::new();
    let mut latest_order: Vec<String> = Vec::with_capacity(latest.len());
    for app in latest {
        if !latest_by_id.contains_key(&app.id) {
            latest_order.push(app.id.clone());
        }
        latest_by_id.insert(app.id.clone(), app);
    }

    let mut combined = Vec::with_capacity(original.len() + latest_order.len());
    let mut seen: HashSet<String> = HashSet::new();

    for app in original {
        seen.insert(app.id.clone());
        match latest_by_id.remove(&app.id) {
            Some(fresh) => combined.push(merge_attempts(app, fresh)),
            None => combined.push(app),
        }
    }

    for id in latest_order {
        if seen.contains(&id) {
            continue;
        }
        if let Some(app) = latest_by_id.remove(&id) {
            combined.push(app);
        }
    }

    combined
}

/// True when every attempt of the application has completed.
fn is_complete(app: &ApplicationHistoryInfo) -> bool {
    app.attempts.iter().all(|a| a.completed)
}

/// Freshest update timestamp across an application's attempts.
fn newest_update(app: &ApplicationHistoryInfo) -> i64 {
    app.attempts.iter().map(|a| a.last_updated).max().unwrap_or(0)
}

/// Marks an application's incomplete attempts completed at `end_time`.
fn complete_app(app: &mut ApplicationHistoryInfo, end_time: i64) {
    for attempt in &mut app.attempts {
        if !attempt.completed {
            attempt.completed = true;
            attempt.end_time = end_time;
            attempt.last_updated = attempt.last_updated.max(end_time);
        }
    }
}

/// Reconciles incomplete applications against live resource-manager reports.
///
/// An incomplete application is marked complete when its report is terminal
/// (using the report's finish time), left alone while the report says it is
/// live, and — when no report exists at all — marked complete at its own
/// `last_updated` once that timestamp is older than `liveness_window_ms`.
pub fn complete_apps_from_yarn(
    apps: Vec<ApplicationHistoryInfo>,
    reports_by_id: &HashMap<String, ApplicationReport>,
    now: i64,
    liveness_window_ms: i64,
) -> Vec<ApplicationHistoryInfo> {
    apps.into_iter()
        .map(|mut app| {
            if is_complete(&app) {
                return app;
            }

            match reports_by_id.get(&app.id) {
                Some(report) if report.state.is_terminal() => {
                    complete_app(&mut app, report.finish_time);
                }
                Some(_) => {
                    // The resource manager still considers it live.
                }
                None => {
                    let updated = newest_update(&app);
                    if now - updated > liveness_window_ms {
                        complete_app(&mut app, updated);
                    }
                }
            }

            app
        })
        .collect()
}
