pub mod domain;
pub mod poster;
pub mod queue;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{AclsConfig, TimelineConfig};
use crate::events::{SparkEvent, TAG_APPLICATION_END, TAG_APPLICATION_START};
use crate::metrics::ServiceMetrics;
use crate::timeline::client::TimelineClient;
use crate::timeline::{
    to_timeline_event, TimelineEntity, TimelineEvent, ENTITY_TYPE_DETAIL, ENTITY_TYPE_SUMMARY,
    FIELD_APPLICATION_ID, FIELD_APP_NAME, FIELD_APP_USER, FIELD_ATTEMPT_ID, FIELD_END_TIME,
    FIELD_ENTITY_VERSION, FIELD_GROUP_INSTANCE_ID, FIELD_LAST_UPDATED, FIELD_SPARK_VERSION,
    FIELD_START_TIME, FILTER_APP_END, FILTER_APP_START,
};

use self::poster::{EntityPoster, PutGrouping};
use self::queue::{PostAction, PostingQueue};

/// Lifecycle state of the service. Transitions are monotonic: once stopped,
/// a service cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Started,
    Stopped,
}

impl ServiceState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Started => 1,
            Self::Stopped => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Created,
        }
    }
}

/// Identity of the application attempt the service forwards for, supplied
/// by the host when the service is bound.
#[derive(Debug, Clone)]
pub struct ServiceBinding {
    pub app_id: String,
    pub attempt_id: Option<String>,
    /// Entity-group instance for v1.5 grouped puts; defaults to the app id.
    pub group_id: Option<String>,
    /// User the application runs as; becomes a domain reader/writer.
    pub user: String,
    /// Host framework version recorded in every entity.
    pub spark_version: String,
}

/// Application metadata captured from the start event.
#[derive(Debug, Clone, Default)]
struct AppStartDetails {
    app_name: String,
    app_user: String,
}

/// Forwards host history events to the Timeline Server.
///
/// Events enter through [`process`](Self::process) on the host's dispatch
/// thread, aggregate in a pending buffer, and flush into timeline entities
/// on lifecycle events and batch thresholds. A single background poster
/// drains the entity queue over HTTP. Delivery is best-effort: the queue is
/// bounded, drops are counted, and shutdown drains within a budget.
pub struct TimelineService<C: TimelineClient> {
    timeline: TimelineConfig,
    acls: AclsConfig,
    clock: Arc<Clock>,
    metrics: Arc<ServiceMetrics>,
    client: Arc<C>,
    queue: Arc<PostingQueue>,

    state: AtomicU8,
    pending: Mutex<Vec<TimelineEvent>>,
    binding: Mutex<Option<ServiceBinding>>,
    start_details: Mutex<Option<AppStartDetails>>,
    app_start_seen: AtomicBool,
    app_end_seen: AtomicBool,
    start_time: AtomicI64,
    end_time: AtomicI64,
    entity_version: AtomicI64,
    post_event_limit: u64,
    domain_id: Mutex<Option<String>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<C: TimelineClient> TimelineService<C> {
    /// Creates a service in the `Created` state.
    ///
    /// The drop threshold is the configured headroom on top of one batch,
    /// per [`TimelineConfig::post_event_limit`].
    pub fn new(
        timeline: TimelineConfig,
        acls: AclsConfig,
        client: C,
        clock: Arc<Clock>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let post_event_limit = timeline.post_event_limit();

        Self {
            timeline,
            acls,
            clock,
            metrics,
            client: Arc::new(client),
            queue: Arc::new(PostingQueue::new()),
            state: AtomicU8::new(ServiceState::Created.as_u8()),
            pending: Mutex::new(Vec::new()),
            binding: Mutex::new(None),
            start_details: Mutex::new(None),
            app_start_seen: AtomicBool::new(false),
            app_end_seen: AtomicBool::new(false),
            start_time: AtomicI64::new(0),
            end_time: AtomicI64::new(0),
            entity_version: AtomicI64::new(0),
            post_event_limit,
            domain_id: Mutex::new(None),
            worker: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the absolute queued-event cap used by the drop policy.
    pub fn with_post_event_limit(mut self, limit: u64) -> Self {
        self.post_event_limit = limit;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Actions currently queued for posting.
    pub fn post_queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Sum of queued action sizes.
    pub fn post_queue_event_size(&self) -> i64 {
        self.queue.event_size()
    }

    /// Starts the service: `Created -> Started`, domain setup, worker spawn.
    pub async fn start(&self, binding: ServiceBinding) -> Result<()> {
        if self
            .state
            .compare_exchange(
                ServiceState::Created.as_u8(),
                ServiceState::Started.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            bail!("cannot start timeline service from state {:?}", self.state());
        }

        if self.timeline.batch_size == 0 {
            bail!("timeline batch size must be positive");
        }

        self.metrics.service_state.set(1);
        *self.binding.lock() = Some(binding.clone());

        if !self.timeline.enabled {
            // No worker: nothing will drain the queue, so refuse events too.
            self.queue.mark_stopped();
            info!("timeline forwarding disabled, events will not be accepted");
            return Ok(());
        }

        let domain_id = domain::setup_domain(
            self.client.as_ref(),
            &self.timeline,
            &self.acls,
            &binding,
            &self.metrics,
        )
        .await;
        *self.domain_id.lock() = domain_id;

        self.queue.mark_open();

        let grouping = self.timeline.version_1_5().then(|| PutGrouping {
            attempt_id: binding.attempt_id.clone(),
            group_id: binding
                .group_id
                .clone()
                .unwrap_or_else(|| binding.app_id.clone()),
        });

        let poster = EntityPoster::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.client),
            Arc::clone(&self.metrics),
            Arc::clone(&self.clock),
            self.cancel.clone(),
            self.timeline.post_retry_interval,
            self.timeline.post_retry_max_interval,
            grouping,
        );
        *self.worker.lock() = Some(tokio::spawn(poster.run()));

        info!(
            app_id = %binding.app_id,
            attempt_id = ?binding.attempt_id,
            endpoint = %self.timeline.endpoint,
            batch_size = self.timeline.batch_size,
            post_event_limit = self.post_event_limit,
            v1_5 = self.timeline.version_1_5(),
            "timeline service started",
        );

        Ok(())
    }

    /// Event sink called from the host's dispatch thread.
    ///
    /// Never blocks on I/O; only short mutexes are taken. Returns false when
    /// the service is not accepting events (not started, or queue stopped).
    pub fn process(&self, event: SparkEvent) -> bool {
        if self.state() != ServiceState::Started || self.queue.is_stopped() {
            return false;
        }

        self.handle_event(event);
        true
    }

    /// Classifies one event and applies the drop/flush policy.
    fn handle_event(&self, event: SparkEvent) {
        self.metrics.events_queued.inc();
        let queued = self.metrics.events_queued.get();
        if queued % 1000 == 0 {
            debug!(queued, "events queued");
        }

        let now = self.clock.now_millis();
        let mut push = false;
        let mut publish = true;
        let mut lifecycle = false;

        match &event {
            SparkEvent::ApplicationStart {
                app_name,
                spark_user,
                time,
                ..
            } => {
                if self.app_start_seen.swap(true, Ordering::SeqCst) {
                    warn!("duplicate application start event dropped");
                    return;
                }

                let start = if *time != 0 { *time } else { now };
                self.start_time.store(start, Ordering::SeqCst);
                *self.start_details.lock() = Some(AppStartDetails {
                    app_name: app_name.clone(),
                    app_user: spark_user.clone(),
                });

                lifecycle = true;
                push = true;
            }

            SparkEvent::ApplicationEnd { time } => {
                if !self.app_start_seen.load(Ordering::SeqCst) {
                    error!("application end received before application start, discarding");
                    return;
                }
                if self.app_end_seen.swap(true, Ordering::SeqCst) {
                    warn!("duplicate application end event dropped");
                    return;
                }

                let end = if *time != 0 { *time } else { now };
                self.end_time.store(end, Ordering::SeqCst);

                lifecycle = true;
                push = true;
            }

            SparkEvent::BlockUpdated | SparkEvent::ExecutorMetricsUpdate => publish = false,

            _ => {}
        }

        let mut event_count = 0;
        if publish {
            // Lifecycle events bypass the capacity limit.
            if lifecycle || queued < self.post_event_limit {
                if let Some(te) = to_timeline_event(&event, now) {
                    event_count = self.add_pending_event(te);
                }
            } else {
                self.metrics.events_dropped.inc();
                debug!(kind = event.type_tag(), "event dropped at capacity limit");
            }
        }

        if push || event_count >= self.timeline.batch_size {
            self.publish_pending_events();
        }
    }

    /// Appends to the pending buffer, returning the new buffer length.
    fn add_pending_event(&self, event: TimelineEvent) -> usize {
        let mut pending = self.pending.lock();
        pending.push(event);
        pending.len()
    }

    /// Drains the pending buffer into one entity per protocol mode and hands
    /// the entities to the posting queue.
    ///
    /// A no-op until the application start event has been observed, and on an
    /// empty buffer.
    fn publish_pending_events(&self) {
        if !self.app_start_seen.load(Ordering::SeqCst) {
            return;
        }

        // The buffer swap is atomic under the lock: no event can be observed
        // both here and in a later flush.
        let events = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        self.metrics.flushes.inc();
        let timestamp = self.clock.now_millis();
        let version = self.entity_version.fetch_add(1, Ordering::SeqCst) + 1;

        let summary = self.build_entity(true, timestamp, version, &events);
        self.enqueue_entity(summary);

        if self.timeline.version_1_5() {
            let detail = self.build_entity(false, timestamp, version, &events);
            self.enqueue_entity(detail);
        }
    }

    fn build_entity(
        &self,
        summary: bool,
        timestamp: i64,
        version: i64,
        events: &[TimelineEvent],
    ) -> TimelineEntity {
        let (app_id, attempt_id, group_id, spark_version) = {
            let guard = self.binding.lock();
            match guard.as_ref() {
                Some(b) => (
                    b.app_id.clone(),
                    b.attempt_id.clone(),
                    b.group_id.clone(),
                    b.spark_version.clone(),
                ),
                None => (String::new(), None, None, String::new()),
            }
        };

        let entity_type = if !self.timeline.version_1_5() || summary {
            ENTITY_TYPE_SUMMARY
        } else {
            ENTITY_TYPE_DETAIL
        };
        let entity_id = attempt_id.clone().unwrap_or_else(|| app_id.clone());

        let mut entity = TimelineEntity::new(entity_type, entity_id.clone());
        entity.start_time = Some(self.start_time.load(Ordering::SeqCst));
        entity.events = events.to_vec();
        entity.domain_id = self.domain_id.lock().clone();

        let details = self.start_details.lock().clone().unwrap_or_default();

        entity.set_other_info(FIELD_START_TIME, json!(self.start_time.load(Ordering::SeqCst)));
        entity.set_other_info(FIELD_END_TIME, json!(self.end_time.load(Ordering::SeqCst)));
        entity.set_other_info(FIELD_LAST_UPDATED, json!(timestamp));
        entity.set_other_info(FIELD_APP_NAME, json!(details.app_name));
        entity.set_other_info(FIELD_APP_USER, json!(details.app_user));
        entity.set_other_info(FIELD_APPLICATION_ID, json!(app_id));
        entity.set_other_info(FIELD_ATTEMPT_ID, json!(entity_id));
        entity.set_other_info(FIELD_ENTITY_VERSION, json!(version));
        entity.set_other_info(FIELD_SPARK_VERSION, json!(spark_version));
        if self.timeline.version_1_5() {
            let group = group_id.unwrap_or(app_id);
            entity.set_other_info(FIELD_GROUP_INSTANCE_ID, json!(group));
        }

        if self.app_start_seen.load(Ordering::SeqCst) {
            entity.add_primary_filter(FILTER_APP_START, TAG_APPLICATION_START);
        }
        if self.app_end_seen.load(Ordering::SeqCst) {
            entity.add_primary_filter(FILTER_APP_END, TAG_APPLICATION_END);
        }

        entity
    }

    fn enqueue_entity(&self, entity: TimelineEntity) {
        // Preflight: an entity without a start time would be rejected
        // server-side on every retry.
        if entity.start_time.is_none() {
            warn!(entity = %entity.entity_id, "entity missing start time, not queued");
            return;
        }

        self.queue.push_back(PostAction::Entity(entity));
        self.sync_queue_gauges();
    }

    fn sync_queue_gauges(&self) {
        self.metrics.post_queue_actions.set(self.queue.len() as i64);
        self.metrics
            .post_queue_event_size
            .set(self.queue.event_size());
    }

    /// Stops the service: `Started -> Stopped`, final flush, bounded drain.
    ///
    /// Any other starting state makes this a no-op. If the worker does not
    /// finish within the shutdown budget it is cancelled and awaited.
    pub async fn stop(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                ServiceState::Started.as_u8(),
                ServiceState::Stopped.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(state = ?self.state(), "stop ignored");
            return Ok(());
        }

        self.metrics.service_state.set(2);

        // An application that never reported its end gets a synthetic one so
        // readers see a completed attempt.
        if self.app_start_seen.load(Ordering::SeqCst) && !self.app_end_seen.load(Ordering::SeqCst)
        {
            debug!("synthesizing application end event");
            self.handle_event(SparkEvent::ApplicationEnd {
                time: self.clock.now_millis(),
            });
        }

        self.publish_pending_events();

        let now = self.clock.now_millis();
        self.queue.mark_stopped();
        self.queue.push_back(PostAction::Stop {
            enqueued_at: now,
            wait: self.timeline.shutdown_wait_time,
        });
        self.sync_queue_gauges();

        let worker = self.worker.lock().take();
        match worker {
            Some(mut handle) => {
                match tokio::time::timeout(self.timeline.shutdown_wait_time, &mut handle).await {
                    Ok(join) => {
                        if let Err(e) = join {
                            warn!(error = %e, "entity poster join failed");
                        }
                    }
                    Err(_) => {
                        warn!(
                            wait = ?self.timeline.shutdown_wait_time,
                            "entity poster did not finish in time, cancelling",
                        );
                        self.cancel.cancel();
                        if let Err(e) = handle.await {
                            warn!(error = %e, "entity poster join failed after cancel");
                        }
                    }
                }
            }
            None => {
                // Worker never ran, so the client is still ours to close.
                self.client.stop().await;
            }
        }

        info!(
            events_queued = self.metrics.events_queued.get(),
            events_posted = self.metrics.events_posted.get(),
            events_dropped = self.metrics.events_dropped.get(),
            "timeline service stopped",
        );

        Ok(())
    }

    #[cfg(test)]
    fn bind_without_worker(&self, binding: ServiceBinding) {
        self.state
            .store(ServiceState::Started.as_u8(), Ordering::SeqCst);
        *self.binding.lock() = Some(binding);
    }
}

impl<C: TimelineClient> fmt::Debug for TimelineService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineService")
            .field("state", &self.state())
            .field("queued_actions", &self.queue.len())
            .field("queued_event_size", &self.queue.event_size())
            .field("events_queued", &self.metrics.events_queued.get())
            .field("events_dropped", &self.metrics.events_dropped.get())
            .field("flushes", &self.metrics.flushes.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::client::ClientError;
    use crate::timeline::{TimelineDomain, TimelinePutResponse};

    /// Client that accepts everything; intake tests never start the worker,
    /// so nothing is actually sent.
    struct NullClient;

    impl TimelineClient for NullClient {
        async fn put_domain(&self, _domain: &TimelineDomain) -> Result<(), ClientError> {
            Ok(())
        }

        async fn put_entity(
            &self,
            _entity: &TimelineEntity,
        ) -> Result<TimelinePutResponse, ClientError> {
            Ok(TimelinePutResponse::default())
        }

        async fn put_entity_grouped(
            &self,
            _attempt_id: Option<&str>,
            _group_id: &str,
            _entity: &TimelineEntity,
        ) -> Result<TimelinePutResponse, ClientError> {
            Ok(TimelinePutResponse::default())
        }
    }

    fn test_binding() -> ServiceBinding {
        ServiceBinding {
            app_id: "application_1".into(),
            attempt_id: Some("appattempt_1".into()),
            group_id: None,
            user: "alice".into(),
            spark_version: "2.1.0".into(),
        }
    }

    fn test_service(timeline: TimelineConfig) -> TimelineService<NullClient> {
        let metrics = Arc::new(ServiceMetrics::new(":0").expect("metrics"));
        TimelineService::new(
            timeline,
            AclsConfig::default(),
            NullClient,
            Arc::new(Clock::fixed(50_000)),
            metrics,
        )
    }

    fn app_start(time: i64) -> SparkEvent {
        SparkEvent::ApplicationStart {
            app_id: Some("application_1".into()),
            attempt_id: Some("appattempt_1".into()),
            app_name: "demo".into(),
            spark_user: "alice".into(),
            time,
        }
    }

    fn generic_event(n: i64) -> SparkEvent {
        SparkEvent::Other {
            kind: "SparkListenerStageSubmitted".into(),
            payload: serde_json::json!({ "stageId": n }),
            time: n,
        }
    }

    fn pop_entity(service: &TimelineService<NullClient>) -> TimelineEntity {
        match service.queue.try_pop().expect("queued action") {
            PostAction::Entity(entity) => entity,
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_process_rejected_before_start() {
        let service = test_service(TimelineConfig::default());
        assert!(!service.process(app_start(1_000)));
        assert_eq!(service.metrics.events_queued.get(), 0);
    }

    #[test]
    fn test_lifecycle_push_flushes_immediately() {
        let service = test_service(TimelineConfig::default());
        service.bind_without_worker(test_binding());

        assert!(service.process(app_start(1_000)));

        assert_eq!(service.metrics.flushes.get(), 1);
        let entity = pop_entity(&service);
        assert_eq!(entity.entity_type, ENTITY_TYPE_SUMMARY);
        assert_eq!(entity.entity_id, "appattempt_1");
        assert_eq!(entity.start_time, Some(1_000));
        assert_eq!(entity.events.len(), 1);
        assert_eq!(entity.other_info["startTime"], 1_000);
        assert_eq!(entity.other_info["endTime"], 0);
        assert_eq!(entity.other_info["entityVersion"], 1);
        assert_eq!(entity.other_info["appName"], "demo");
        assert_eq!(entity.other_info["appUser"], "alice");
        assert_eq!(entity.other_info["applicationId"], "application_1");
        assert_eq!(entity.other_info["sparkVersion"], "2.1.0");
        assert_eq!(
            entity.primary_filters["startApp"],
            vec![TAG_APPLICATION_START.to_string()]
        );
        assert!(!entity.primary_filters.contains_key("endApp"));
    }

    #[test]
    fn test_start_time_falls_back_to_clock() {
        let service = test_service(TimelineConfig::default());
        service.bind_without_worker(test_binding());

        assert!(service.process(app_start(0)));
        let entity = pop_entity(&service);
        assert_eq!(entity.start_time, Some(50_000));
    }

    #[test]
    fn test_batch_threshold_triggers_flush() {
        let cfg = TimelineConfig {
            batch_size: 2,
            ..TimelineConfig::default()
        };
        let service = test_service(cfg);
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        assert_eq!(service.metrics.flushes.get(), 1);

        service.process(generic_event(1));
        assert_eq!(service.metrics.flushes.get(), 1);

        service.process(generic_event(2));
        assert_eq!(service.metrics.flushes.get(), 2);

        // First flush holds the start event, second the two job events.
        let first = pop_entity(&service);
        let second = pop_entity(&service);
        assert_eq!(first.events.len(), 1);
        assert_eq!(second.events.len(), 2);
        assert_eq!(first.other_info["entityVersion"], 1);
        assert_eq!(second.other_info["entityVersion"], 2);
    }

    #[test]
    fn test_batch_size_one_flushes_every_event() {
        let cfg = TimelineConfig {
            batch_size: 1,
            ..TimelineConfig::default()
        };
        let service = test_service(cfg);
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        service.process(generic_event(1));
        service.process(generic_event(2));

        assert_eq!(service.metrics.flushes.get(), 3);
        assert_eq!(service.queue.len(), 3);
        for _ in 0..3 {
            assert_eq!(pop_entity(&service).events.len(), 1);
        }
    }

    #[test]
    fn test_end_before_start_is_discarded() {
        let service = test_service(TimelineConfig::default());
        service.bind_without_worker(test_binding());

        assert!(service.process(SparkEvent::ApplicationEnd { time: 2_000 }));
        assert_eq!(service.metrics.flushes.get(), 0);
        assert!(service.queue.is_empty());
        assert!(service.pending.lock().is_empty());
    }

    #[test]
    fn test_duplicate_lifecycle_events_dropped() {
        let service = test_service(TimelineConfig::default());
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        service.process(app_start(9_999));
        service.process(SparkEvent::ApplicationEnd { time: 2_000 });
        service.process(SparkEvent::ApplicationEnd { time: 8_888 });

        assert_eq!(service.start_time.load(Ordering::SeqCst), 1_000);
        assert_eq!(service.end_time.load(Ordering::SeqCst), 2_000);
        // One flush per accepted lifecycle event.
        assert_eq!(service.metrics.flushes.get(), 2);
    }

    #[test]
    fn test_filtered_events_never_buffered() {
        let service = test_service(TimelineConfig::default());
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        service.process(SparkEvent::BlockUpdated);
        service.process(SparkEvent::ExecutorMetricsUpdate);

        assert!(service.pending.lock().is_empty());
        assert_eq!(service.metrics.events_dropped.get(), 0);
    }

    #[test]
    fn test_capacity_drop_spares_lifecycle() {
        let service = test_service(TimelineConfig {
            batch_size: 100,
            ..TimelineConfig::default()
        })
        .with_post_event_limit(3);
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        for n in 0..10 {
            service.process(generic_event(n));
        }

        // The start plus one generic event fit under the limit of 3; the
        // remaining nine generics were dropped.
        assert_eq!(service.metrics.events_dropped.get(), 9);

        service.process(SparkEvent::ApplicationEnd { time: 5_000 });
        assert_eq!(service.metrics.events_dropped.get(), 9);
        assert!(service.app_end_seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_limit_drops_all_non_lifecycle() {
        let service = test_service(TimelineConfig::default()).with_post_event_limit(0);
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        service.process(generic_event(1));
        service.process(SparkEvent::ApplicationEnd { time: 2_000 });

        assert_eq!(service.metrics.events_dropped.get(), 1);
        // Both lifecycle events flushed.
        assert_eq!(service.metrics.flushes.get(), 2);
    }

    #[test]
    fn test_publish_is_noop_without_start_event() {
        let service = test_service(TimelineConfig::default());
        service.bind_without_worker(test_binding());

        service.process(generic_event(1));
        service.publish_pending_events();

        assert_eq!(service.metrics.flushes.get(), 0);
        assert!(service.queue.is_empty());
        // The event stays buffered until the start arrives.
        assert_eq!(service.pending.lock().len(), 1);
    }

    #[test]
    fn test_v1_5_emits_summary_and_detail() {
        let cfg = TimelineConfig {
            version: 1.5,
            ..TimelineConfig::default()
        };
        let service = test_service(cfg);
        service.bind_without_worker(ServiceBinding {
            group_id: Some("group-7".into()),
            ..test_binding()
        });

        service.process(app_start(1_000));

        assert_eq!(service.queue.len(), 2);
        let summary = pop_entity(&service);
        let detail = pop_entity(&service);
        assert_eq!(summary.entity_type, ENTITY_TYPE_SUMMARY);
        assert_eq!(detail.entity_type, ENTITY_TYPE_DETAIL);
        assert_eq!(summary.other_info["groupInstanceId"], "group-7");
        assert_eq!(detail.other_info["groupInstanceId"], "group-7");
        assert_eq!(summary.other_info["entityVersion"], 1);
        assert_eq!(detail.other_info["entityVersion"], 1);
        assert_eq!(summary.events.len(), detail.events.len());
    }

    #[test]
    fn test_queue_event_size_matches_action_sum() {
        let cfg = TimelineConfig {
            batch_size: 2,
            ..TimelineConfig::default()
        };
        let service = test_service(cfg);
        service.bind_without_worker(test_binding());

        service.process(app_start(1_000));
        service.process(generic_event(1));
        service.process(generic_event(2));

        let reported = service.post_queue_event_size();

        // Sum over all queued actions, restoring the queue as we go.
        let mut drained = Vec::new();
        while let Some(action) = service.queue.try_pop() {
            drained.push(action);
        }
        let expected: i64 = drained.iter().map(|a| a.size() as i64).sum();
        for action in drained {
            service.queue.push_back(action);
        }

        assert_eq!(reported, expected);
        assert!(expected > 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let service = test_service(TimelineConfig::default());
        service.stop().await.expect("stop is a no-op");
        assert_eq!(service.state(), ServiceState::Created);
    }
}
