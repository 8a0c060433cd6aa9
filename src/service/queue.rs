use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::timeline::TimelineEntity;

/// One unit of work for the poster.
#[derive(Debug)]
pub enum PostAction {
    /// Post this entity to the Timeline Server.
    Entity(TimelineEntity),
    /// Leave the steady-state loop and drain until the deadline.
    Stop {
        /// When the stop was requested, in epoch milliseconds.
        enqueued_at: i64,
        /// Drain budget from `enqueued_at`.
        wait: Duration,
    },
}

impl PostAction {
    /// Number of events this action accounts for in the queue size counter.
    pub fn size(&self) -> usize {
        match self {
            Self::Entity(entity) => entity.events.len(),
            Self::Stop { .. } => 0,
        }
    }

    /// Absolute drain deadline of a stop action, in epoch milliseconds.
    pub fn time_limit(&self) -> Option<i64> {
        match self {
            Self::Entity(_) => None,
            Self::Stop { enqueued_at, wait } => {
                Some(enqueued_at.saturating_add(wait.as_millis() as i64))
            }
        }
    }
}

/// Double-ended FIFO of post actions with an event-size counter.
///
/// Producers push to the back; the poster pushes a failed entity back to the
/// front so retries keep their order relative to still-queued entities. The
/// size counter tracks the sum of `PostAction::size` over queued actions and
/// is exact whenever the queue is quiescent.
pub struct PostingQueue {
    actions: Mutex<VecDeque<PostAction>>,
    notify: Notify,
    event_size: AtomicI64,
    stopped: AtomicBool,
}

impl PostingQueue {
    pub fn new() -> Self {
        Self {
            actions: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            event_size: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Appends an action.
    pub fn push_back(&self, action: PostAction) {
        self.event_size
            .fetch_add(action.size() as i64, Ordering::Relaxed);
        self.actions.lock().push_back(action);
        self.notify.notify_one();
    }

    /// Prepends an action; used to retry a failed entity ahead of the rest.
    pub fn push_front(&self, action: PostAction) {
        self.event_size
            .fetch_add(action.size() as i64, Ordering::Relaxed);
        self.actions.lock().push_front(action);
        self.notify.notify_one();
    }

    /// Removes the head action, if any.
    pub fn try_pop(&self) -> Option<PostAction> {
        let action = self.actions.lock().pop_front()?;
        self.event_size
            .fetch_sub(action.size() as i64, Ordering::Relaxed);
        Some(action)
    }

    /// Waits for the next action.
    pub async fn take(&self) -> PostAction {
        loop {
            if let Some(action) = self.try_pop() {
                return action;
            }
            self.notify.notified().await;
        }
    }

    /// Waits up to `timeout` for the next action.
    pub async fn poll(&self, timeout: Duration) -> Option<PostAction> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(action) = self.try_pop() {
                return Some(action);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    /// Sum of queued action sizes.
    pub fn event_size(&self) -> i64 {
        self.event_size.load(Ordering::Relaxed)
    }

    /// Whether the queue has been marked stopped for producers.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Marks the queue stopped; the intake rejects events from here on.
    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Reopens the queue for producers.
    pub fn mark_open(&self) {
        self.stopped.store(false, Ordering::Release);
    }
}

impl Default for PostingQueue {
    fn default() -> Self {
        Self::new()
    }
}
