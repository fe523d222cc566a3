//! JSON text frames exchanged with the job and PTY backends.
//!
//! Job streams, terminal channels and media channels share one inbound frame
//! type; fields that only make sense on one channel are optional and the
//! demultiplexer decides what a frame means based on the channel it arrived on.

use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Created {
        session_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    Output {
        #[serde(default)]
        session_id: Option<String>,
        sequence: u64,
        #[serde(alias = "payload")]
        data: String,
    },
    Status {
        #[serde(default)]
        session_id: Option<String>,
        sequence: u64,
        status: WireStatus,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    Error {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        sequence: Option<u64>,
        message: String,
    },
    Ack {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        request: Option<String>,
    },
    Event {
        sequence: u64,
        event: MediaEvent,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Created { .. } => "created",
            InboundFrame::Output { .. } => "output",
            InboundFrame::Status { .. } => "status",
            InboundFrame::Error { .. } => "error",
            InboundFrame::Ack { .. } => "ack",
            InboundFrame::Event { .. } => "event",
        }
    }
}

/// Terminal statuses as backends spell them. PTY backends say
/// `completed`/`failed` where job backends say `done`/`error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    Done,
    Completed,
    Error,
    Failed,
    Cancelled,
    Killed,
}

impl From<WireStatus> for SessionStatus {
    fn from(status: WireStatus) -> Self {
        match status {
            WireStatus::Done | WireStatus::Completed => SessionStatus::Done,
            WireStatus::Error | WireStatus::Failed => SessionStatus::Error,
            WireStatus::Cancelled => SessionStatus::Cancelled,
            WireStatus::Killed => SessionStatus::Killed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

/// Media artifact produced or received by a terminal session. `session_id`
/// is the backend's terminal session id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MediaEvent {
    pub session_id: String,
    pub kind: MediaKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Position on the workspace media channel; filled in on receipt.
    #[serde(default, skip_serializing)]
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Subscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_sequence: Option<u64>,
    },
    Create {
        request_id: String,
        workspace: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    Attach {
        session_id: String,
        from_sequence: u64,
    },
    Resize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    Signal {
        session_id: String,
        signal: String,
    },
    Kill {
        session_id: String,
    },
    Input {
        session_id: String,
        data: String,
    },
    Emit {
        event: MediaEvent,
    },
}

pub fn decode(text: &str) -> Result<InboundFrame, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_output_accepts_payload_alias() {
        let frame = decode(r#"{"type":"output","sequence":4,"payload":"hello\n"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Output {
                session_id: None,
                sequence: 4,
                data: "hello\n".into()
            }
        );
    }

    #[test]
    fn pty_status_names_map_onto_session_statuses() {
        let frame =
            decode(r#"{"type":"status","session_id":"t1","sequence":9,"status":"failed","exit_code":2}"#)
                .unwrap();
        let InboundFrame::Status {
            status, exit_code, ..
        } = frame
        else {
            panic!("expected status frame");
        };
        assert_eq!(SessionStatus::from(status), SessionStatus::Error);
        assert_eq!(exit_code, Some(2));
        assert_eq!(SessionStatus::from(WireStatus::Completed), SessionStatus::Done);
    }

    #[test]
    fn media_event_frame_decodes_nested_event() {
        let frame = decode(
            &json!({
                "type": "event",
                "sequence": 12,
                "event": {"session_id": "t2", "kind": "image", "title": "plot.png", "uri": "file:///tmp/plot.png"}
            })
            .to_string(),
        )
        .unwrap();
        let InboundFrame::Event { sequence, event } = frame else {
            panic!("expected media event");
        };
        assert_eq!(sequence, 12);
        assert_eq!(event.session_id, "t2");
        assert_eq!(event.kind, MediaKind::Image);
    }

    #[test]
    fn outbound_frames_omit_absent_fields() {
        let subscribe = OutboundFrame::Subscribe {
            job_id: None,
            from_sequence: None,
        };
        assert_eq!(
            serde_json::to_value(&subscribe).unwrap(),
            json!({"type": "subscribe"})
        );
        let attach = OutboundFrame::Attach {
            session_id: "t1".into(),
            from_sequence: 5,
        };
        assert_eq!(
            serde_json::to_value(&attach).unwrap(),
            json!({"type": "attach", "session_id": "t1", "from_sequence": 5})
        );
    }

    #[test]
    fn unknown_frame_types_fail_to_decode() {
        assert!(decode(r#"{"type":"telemetry","sequence":1}"#).is_err());
        assert!(decode("not json").is_err());
    }
}
