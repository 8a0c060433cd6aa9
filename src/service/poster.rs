use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::queue::{PostAction, PostingQueue};
use crate::clock::Clock;
use crate::metrics::ServiceMetrics;
use crate::timeline::client::{ClientError, TimelineClient};
use crate::timeline::{TimelineEntity, TimelinePutResponse};

/// Attempt/group coordinates for v1.5 grouped puts.
pub(crate) struct PutGrouping {
    pub attempt_id: Option<String>,
    pub group_id: String,
}

/// Background task draining the posting queue into the Timeline Server.
///
/// Exactly one poster runs per started service. It owns all network I/O:
/// steady-state posting with linear-backoff retry, then a deadline-bounded
/// drain once a stop action arrives. Cancellation unwinds either phase at
/// its next await point; the client is stopped on every exit path.
pub(crate) struct EntityPoster<C: TimelineClient> {
    queue: Arc<PostingQueue>,
    client: Arc<C>,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<Clock>,
    cancel: CancellationToken,
    retry_interval: Duration,
    retry_max: Duration,
    grouping: Option<PutGrouping>,
    current_delay: Duration,
    last_attempt_failed: bool,
}

impl<C: TimelineClient> EntityPoster<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PostingQueue>,
        client: Arc<C>,
        metrics: Arc<ServiceMetrics>,
        clock: Arc<Clock>,
        cancel: CancellationToken,
        retry_interval: Duration,
        retry_max: Duration,
        grouping: Option<PutGrouping>,
    ) -> Self {
        Self {
            queue,
            client,
            metrics,
            clock,
            cancel,
            retry_interval,
            retry_max,
            grouping,
            current_delay: retry_interval,
            last_attempt_failed: false,
        }
    }

    /// Runs both phases to completion or cancellation, then releases the
    /// client. This is the only place the client is stopped once the worker
    /// has started.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();

        let deadline = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("entity poster cancelled in steady state");
                None
            }
            deadline = self.post_entities() => Some(deadline),
        };

        if let Some(deadline) = deadline {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("entity poster cancelled during drain");
                }
                _ = self.post_entities_shutdown_phase(deadline) => {}
            }
        }

        self.client.stop().await;
        self.sync_queue_gauges();
        debug!("entity poster exited");
    }

    /// Steady-state loop: take, post, retry. Returns the drain deadline of
    /// the stop action that ended the loop, in epoch milliseconds.
    async fn post_entities(&mut self) -> i64 {
        loop {
            let action = self.queue.take().await;
            self.sync_queue_gauges();

            match action {
                PostAction::Stop { enqueued_at, wait } => {
                    debug!(wait = ?wait, "stop action received, entering drain");
                    return enqueued_at.saturating_add(wait.as_millis() as i64);
                }
                PostAction::Entity(entity) => self.post_entity(entity).await,
            }
        }
    }

    /// One steady-state post with the retry policy applied on failure.
    async fn post_entity(&mut self, entity: TimelineEntity) {
        match self.attempt_put(&entity).await {
            Ok(resp) if resp.errors.is_empty() => self.handle_success(&entity).await,
            Ok(resp) => self.handle_rejection(&resp),
            Err(err) => {
                self.handle_failure(&err, entity);

                // Linear growth, capped; a zero interval disables sleeping.
                self.current_delay =
                    (self.current_delay + self.retry_interval).min(self.retry_max);
                self.metrics
                    .retry_delay_ms
                    .set(self.current_delay.as_millis() as i64);

                if !self.current_delay.is_zero() {
                    tokio::time::sleep(self.current_delay).await;
                }
            }
        }
    }

    /// Deadline-bounded drain after a stop action. Additional stop actions
    /// are ignored; an empty poll ends the drain cleanly.
    async fn post_entities_shutdown_phase(&mut self, deadline: i64) {
        loop {
            let remaining = deadline.saturating_sub(self.clock.now_millis());
            if remaining <= 0 {
                let left = self.queue.len();
                if left > 0 {
                    warn!(actions = left, "drain deadline elapsed with actions still queued");
                }
                return;
            }

            let Some(action) = self.queue.poll(Duration::from_millis(remaining as u64)).await
            else {
                debug!("posting queue drained");
                return;
            };
            self.sync_queue_gauges();

            match action {
                PostAction::Stop { .. } => continue,
                PostAction::Entity(entity) => {
                    if !self.post_entity_draining(entity).await {
                        return;
                    }
                }
            }
        }
    }

    /// One drain-phase post. Returns false when the drain must abort.
    async fn post_entity_draining(&mut self, entity: TimelineEntity) -> bool {
        match self.attempt_put(&entity).await {
            Ok(resp) if resp.errors.is_empty() => {
                self.handle_success(&entity).await;
                true
            }
            Ok(resp) => {
                self.handle_rejection(&resp);
                true
            }
            Err(err) => {
                self.handle_failure(&err, entity);

                if self.retry_interval.is_zero() {
                    error!(error = %err, "drain post failed with no retry interval, aborting");
                    return false;
                }

                tokio::time::sleep(self.retry_interval).await;
                true
            }
        }
    }

    async fn attempt_put(
        &self,
        entity: &TimelineEntity,
    ) -> Result<TimelinePutResponse, ClientError> {
        self.metrics.entity_post_attempts.inc();

        match &self.grouping {
            Some(g) => {
                self.client
                    .put_entity_grouped(g.attempt_id.as_deref(), &g.group_id, entity)
                    .await
            }
            None => self.client.put_entity(entity).await,
        }
    }

    async fn handle_success(&mut self, entity: &TimelineEntity) {
        self.metrics.entity_post_successes.inc();
        self.metrics
            .events_posted
            .inc_by(entity.events.len() as u64);
        self.metrics
            .last_post_timestamp_ms
            .set(self.clock.now_millis());

        self.last_attempt_failed = false;
        self.current_delay = self.retry_interval;
        self.metrics
            .retry_delay_ms
            .set(self.current_delay.as_millis() as i64);

        if self.client.supports_flush() {
            if let Err(e) = self.client.flush().await {
                warn!(error = %e, "timeline client flush failed");
            }
        }
    }

    /// Rejections are application-level and permanent; the entity is dropped.
    fn handle_rejection(&self, resp: &TimelinePutResponse) {
        self.metrics.entity_post_rejections.inc();
        for err in &resp.errors {
            warn!(
                entity = %err.entity_id,
                entity_type = %err.entity_type,
                code = err.error_code,
                "entity rejected by timeline server",
            );
        }
    }

    /// Pushes the failed entity back to the queue head. The first failure in
    /// a streak logs at WARN; repeats stay at DEBUG until a success resets it.
    fn handle_failure(&mut self, err: &ClientError, entity: TimelineEntity) {
        self.metrics.entity_post_failures.inc();

        if self.last_attempt_failed {
            debug!(error = %err, entity = %entity.entity_id, "entity post failed again");
        } else {
            warn!(error = %err, entity = %entity.entity_id, "entity post failed, will retry");
        }
        self.last_attempt_failed = true;

        self.queue.push_front(PostAction::Entity(entity));
        self.sync_queue_gauges();
    }

    fn sync_queue_gauges(&self) {
        self.metrics.post_queue_actions.set(self.queue.len() as i64);
        self.metrics
            .post_queue_event_size
            .set(self.queue.event_size());
    }
}
