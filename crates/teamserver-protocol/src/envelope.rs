//! The event envelope.

use chrono::{DateTime, Local, TimeZone};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::events::EventCategory;

/// `chrono` format of `Head.Time` (`DD/MM/YYYY HH:MM:SS`, local time).
pub const TIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Free-form key/value payload of an envelope.
pub type Info = Map<String, Value>;

/// A typed event: category, timestamp, sub-event and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub head: Head,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Head {
    pub event: EventCategory,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Body {
    pub sub_event: i32,
    #[serde(default)]
    pub info: Info,
}

impl Envelope {
    /// Build an envelope stamped with the current local time.
    pub fn new(category: EventCategory, sub_event: impl Into<i32>, info: Info) -> Self {
        Self::at(category, sub_event, info, &Local::now())
    }

    /// Build an envelope stamped with an explicit time (used for replays).
    pub fn at<Tz>(
        category: EventCategory,
        sub_event: impl Into<i32>,
        info: Info,
        time: &DateTime<Tz>,
    ) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            head: Head {
                event: category,
                time: time.format(TIME_FORMAT).to_string(),
            },
            body: Body {
                sub_event: sub_event.into(),
                info,
            },
        }
    }

    pub fn category(&self) -> EventCategory {
        self.head.event
    }

    /// Decode the sub-event code into the category's typed enum.
    pub fn sub_event<S>(&self) -> Result<S, ProtocolError>
    where
        S: TryFrom<i32, Error = ProtocolError>,
    {
        S::try_from(self.body.sub_event)
    }

    /// Read one `Info` entry.
    pub fn info(&self, key: &str) -> Option<&Value> {
        self.body.info.get(key)
    }

    /// Decode the `Info` payload into the shape a handler expects.
    pub fn info_as<T: DeserializeOwned>(&self, context: &'static str) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.body.info.clone())).map_err(|e| {
            ProtocolError::InvalidInfo {
                context,
                reason: e.to_string(),
            }
        })
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse a text frame received from a peer.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        // Decode the category first so an unknown code is reported as such
        // rather than as a generic shape error.
        let raw: Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let Some(code) = raw
            .get("Head")
            .and_then(|head| head.get("Event"))
            .and_then(Value::as_i64)
        {
            let code = i32::try_from(code).map_err(|_| {
                ProtocolError::Malformed(format!("event code {code} out of range"))
            })?;
            EventCategory::try_from(code)?;
        }

        serde_json::from_value(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Build an [`Info`] map from `key => value` pairs.
#[macro_export]
macro_rules! payload {
    () => { $crate::Info::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut info = $crate::Info::new();
        $(info.insert(($key).to_string(), $crate::serde_json::json!($value));)+
        info
    }};
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use serde_json::json;

    use super::*;
    use crate::events::{AgentEvent, AuditEvent, ChatEvent};

    #[test]
    fn test_wire_shape() {
        let time = Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(2024, 3, 9)
                .unwrap()
                .and_hms_opt(7, 5, 1)
                .unwrap(),
        );
        let envelope = Envelope::at(
            EventCategory::Audit,
            AuditEvent::Append,
            payload! { "User" => "alice", "Action" => "operator.login" },
            &time,
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "Head": { "Event": 0x11, "Time": "09/03/2024 07:05:01" },
                "Body": {
                    "SubEvent": 1,
                    "Info": { "User": "alice", "Action": "operator.login" }
                }
            })
        );
    }

    #[test]
    fn test_time_pattern() {
        let envelope = Envelope::new(EventCategory::Chat, ChatEvent::NewMessage, Info::new());
        let time = &envelope.head.time;
        assert_eq!(time.len(), "DD/MM/YYYY HH:MM:SS".len());
        assert!(chrono::NaiveDateTime::parse_from_str(time, TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_from_frame_rejects_unknown_category() {
        let frame = r#"{"Head":{"Event":99,"Time":""},"Body":{"SubEvent":1,"Info":{}}}"#;
        assert!(matches!(
            Envelope::from_frame(frame),
            Err(ProtocolError::UnknownCategory(99))
        ));
    }

    #[test]
    fn test_from_frame_rejects_non_object_info() {
        let frame = r#"{"Head":{"Event":4,"Time":""},"Body":{"SubEvent":1,"Info":[1,2]}}"#;
        assert!(matches!(
            Envelope::from_frame(frame),
            Err(ProtocolError::Malformed(_))
        ));

        assert!(matches!(
            Envelope::from_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_info_as_typed_payload() {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Output {
            agent_id: String,
            output: String,
        }

        let envelope = Envelope::new(
            EventCategory::Agent,
            AgentEvent::Output,
            payload! { "AgentID" => "a1", "Output" => "whoami" },
        );
        let err = envelope.info_as::<Output>("agent output").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidInfo { .. }));

        let envelope = Envelope::new(
            EventCategory::Agent,
            AgentEvent::Output,
            payload! { "AgentId" => "a1", "Output" => "whoami" },
        );
        let output: Output = envelope.info_as("agent output").unwrap();
        assert_eq!(output.agent_id, "a1");
        assert_eq!(output.output, "whoami");
        assert_eq!(envelope.sub_event::<AgentEvent>().unwrap(), AgentEvent::Output);
    }
}
