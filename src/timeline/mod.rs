pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::events::SparkEvent;

/// Entity type for summary entities (and all entities before v1.5).
pub const ENTITY_TYPE_SUMMARY: &str = "spark_event_v01";
/// Entity type for per-attempt detail entities in v1.5 mode.
pub const ENTITY_TYPE_DETAIL: &str = "spark_event_v01_detail";
/// Prefix of access-control domain ids derived from the application id.
pub const DOMAIN_ID_PREFIX: &str = "Spark_ATS_";

/// Primary filter set once the application start event has been observed.
pub const FILTER_APP_START: &str = "startApp";
/// Primary filter set once the application end event has been observed.
pub const FILTER_APP_END: &str = "endApp";

/// `other_info` field names forming the stable wire contract with readers.
pub const FIELD_START_TIME: &str = "startTime";
pub const FIELD_END_TIME: &str = "endTime";
pub const FIELD_LAST_UPDATED: &str = "lastUpdated";
pub const FIELD_APP_NAME: &str = "appName";
pub const FIELD_APP_USER: &str = "appUser";
pub const FIELD_APPLICATION_ID: &str = "applicationId";
pub const FIELD_ATTEMPT_ID: &str = "attemptId";
pub const FIELD_ENTITY_VERSION: &str = "entityVersion";
pub const FIELD_SPARK_VERSION: &str = "sparkVersion";
pub const FIELD_GROUP_INSTANCE_ID: &str = "groupInstanceId";

/// A single timeline event: a typed, timestamped JSON snapshot of one host
/// event, serialized with the field names the Timeline Server expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    #[serde(rename = "eventtype")]
    pub event_type: String,
    pub timestamp: i64,
    #[serde(rename = "eventinfo", default, skip_serializing_if = "Map::is_empty")]
    pub event_info: Map<String, Value>,
}

/// A server-side aggregate keyed by `(entity_type, entity_id)` carrying an
/// ordered event list plus indexed metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntity {
    #[serde(rename = "entitytype")]
    pub entity_type: String,
    #[serde(rename = "entity")]
    pub entity_id: String,
    #[serde(rename = "starttime")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TimelineEvent>,
    #[serde(rename = "otherinfo", default, skip_serializing_if = "Map::is_empty")]
    pub other_info: Map<String, Value>,
    #[serde(
        rename = "primaryfilters",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub primary_filters: HashMap<String, Vec<String>>,
    #[serde(rename = "domain", skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
}

impl TimelineEntity {
    /// New empty entity of the given type and id.
    pub fn new(entity_type: &str, entity_id: String) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id,
            start_time: None,
            events: Vec::new(),
            other_info: Map::new(),
            primary_filters: HashMap::new(),
            domain_id: None,
        }
    }

    /// Adds an `other_info` field.
    pub fn set_other_info(&mut self, key: &str, value: Value) {
        self.other_info.insert(key.to_string(), value);
    }

    /// Adds a primary filter value.
    pub fn add_primary_filter(&mut self, name: &str, value: &str) {
        self.primary_filters
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }
}

/// A named access-control namespace holding entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineDomain {
    pub id: String,
    pub readers: String,
    pub writers: String,
}

/// One rejected entity inside a put response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePutError {
    #[serde(rename = "entity")]
    pub entity_id: String,
    #[serde(rename = "entitytype")]
    pub entity_type: String,
    #[serde(rename = "errorcode")]
    pub error_code: i32,
}

/// Response body of an entity put. An empty error list means full acceptance;
/// a non-empty list is a permanent, per-entity rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelinePutResponse {
    #[serde(default)]
    pub errors: Vec<TimelinePutError>,
}

/// Converts a host event into a timeline event stamped with `timestamp`.
///
/// Returns `None` for the event classes the policy filters before enqueue.
pub fn to_timeline_event(event: &SparkEvent, timestamp: i64) -> Option<TimelineEvent> {
    if event.is_filtered() {
        return None;
    }

    let mut info = Map::new();
    match event {
        SparkEvent::ApplicationStart {
            app_id,
            attempt_id,
            app_name,
            spark_user,
            time,
        } => {
            if let Some(id) = app_id {
                info.insert("appId".into(), json!(id));
            }
            if let Some(id) = attempt_id {
                info.insert("appAttemptId".into(), json!(id));
            }
            info.insert("appName".into(), json!(app_name));
            info.insert("sparkUser".into(), json!(spark_user));
            info.insert("time".into(), json!(time));
        }
        SparkEvent::ApplicationEnd { time } => {
            info.insert("time".into(), json!(time));
        }
        SparkEvent::JobStart {
            job_id,
            group_id,
            time,
        } => {
            info.insert("jobId".into(), json!(job_id));
            if let Some(group) = group_id {
                info.insert("groupId".into(), json!(group));
            }
            info.insert("time".into(), json!(time));
        }
        SparkEvent::Other { payload, time, .. } => {
            if let Value::Object(fields) = payload {
                info.extend(fields.clone());
            } else if !payload.is_null() {
                info.insert("payload".into(), payload.clone());
            }
            info.insert("time".into(), json!(time));
        }
        // Filtered classes were rejected above.
        SparkEvent::BlockUpdated | SparkEvent::ExecutorMetricsUpdate => return None,
    }

    Some(TimelineEvent {
        event_type: event.type_tag().to_string(),
        timestamp,
        event_info: info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filtered_events_produce_none() {
        assert!(to_timeline_event(&SparkEvent::BlockUpdated, 1).is_none());
        assert!(to_timeline_event(&SparkEvent::ExecutorMetricsUpdate, 1).is_none());
    }

    #[test]
    fn test_application_start_snapshot() {
        let ev = SparkEvent::ApplicationStart {
            app_id: Some("application_1".into()),
            attempt_id: Some("attempt_1".into()),
            app_name: "demo".into(),
            spark_user: "alice".into(),
            time: 1_000,
        };

        let te = to_timeline_event(&ev, 5_000).expect("lifecycle event converts");
        assert_eq!(te.event_type, "SparkListenerApplicationStart");
        assert_eq!(te.timestamp, 5_000);
        assert_eq!(te.event_info["appName"], "demo");
        assert_eq!(te.event_info["sparkUser"], "alice");
        assert_eq!(te.event_info["time"], 1_000);
    }

    #[test]
    fn test_other_event_object_payload_is_flattened() {
        let ev = SparkEvent::Other {
            kind: "SparkListenerStageSubmitted".into(),
            payload: serde_json::json!({"stageId": 3}),
            time: 7,
        };

        let te = to_timeline_event(&ev, 7).expect("converts");
        assert_eq!(te.event_type, "SparkListenerStageSubmitted");
        assert_eq!(te.event_info["stageId"], 3);
    }

    #[test]
    fn test_entity_wire_field_names() {
        let mut entity = TimelineEntity::new(ENTITY_TYPE_SUMMARY, "attempt_1".into());
        entity.start_time = Some(1_000);
        entity.set_other_info(FIELD_START_TIME, serde_json::json!(1_000));
        entity.add_primary_filter(FILTER_APP_START, "SparkListenerApplicationStart");
        entity.events.push(TimelineEvent {
            event_type: "SparkListenerApplicationStart".into(),
            timestamp: 1_000,
            event_info: Map::new(),
        });
        entity.domain_id = Some("Spark_ATS_app_1".into());

        let json = serde_json::to_value(&entity).expect("serialize");
        assert_eq!(json["entitytype"], ENTITY_TYPE_SUMMARY);
        assert_eq!(json["entity"], "attempt_1");
        assert_eq!(json["starttime"], 1_000);
        assert_eq!(json["otherinfo"]["startTime"], 1_000);
        assert_eq!(
            json["primaryfilters"]["startApp"][0],
            "SparkListenerApplicationStart"
        );
        assert_eq!(json["events"][0]["eventtype"], "SparkListenerApplicationStart");
        assert_eq!(json["domain"], "Spark_ATS_app_1");
    }

    #[test]
    fn test_put_response_defaults_to_no_errors() {
        let resp: TimelinePutResponse = serde_json::from_str("{}").expect("parse");
        assert!(resp.errors.is_empty());

        let resp: TimelinePutResponse = serde_json::from_str(
            r#"{"errors":[{"entity":"e1","entitytype":"spark_event_v01","errorcode":6}]}"#,
        )
        .expect("parse");
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].error_code, 6);
    }
}
