//! Event types pushed over the daemon's `/ws/events` stream.
//!
//! Wire format is `{"event": <name>, "data": {...}}`:
//!
//! | Event | Payload |
//! |-------|---------|
//! | `transcription_update` | `{text, final}` |
//! | `heartbeat` | `{timestamp, state}` |

use serde::{Deserialize, Serialize};

/// A server-push event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    TranscriptionUpdate {
        text: String,
        /// `false` for provisional previews, `true` for committed finals.
        #[serde(rename = "final")]
        is_final: bool,
    },
    Heartbeat {
        /// Seconds since the Unix epoch.
        timestamp: f64,
        /// Daemon state at emission time (`idle` / `recording`).
        state: String,
    },
}

impl StreamEvent {
    pub fn provisional(text: impl Into<String>) -> Self {
        StreamEvent::TranscriptionUpdate {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        StreamEvent::TranscriptionUpdate {
            text: text.into(),
            is_final: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcription_update_wire_format() {
        let event = StreamEvent::final_text("hola mundo");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "transcription_update");
        assert_eq!(json["data"]["text"], "hola mundo");
        assert_eq!(json["data"]["final"], true);

        let round_trip: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(round_trip, event);
    }

    #[test]
    fn heartbeat_wire_format() {
        let event = StreamEvent::Heartbeat {
            timestamp: 1_700_000_000.5,
            state: "recording".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "heartbeat");
        assert_eq!(json["data"]["state"], "recording");
        assert!(json["data"]["timestamp"].as_f64().unwrap() > 1.0e9);
    }

    #[test]
    fn provisional_is_not_final() {
        let json = serde_json::to_value(StreamEvent::provisional("…")).unwrap();
        assert_eq!(json["data"]["final"], false);
    }
}
