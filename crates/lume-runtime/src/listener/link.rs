//! Frames exchanged between the supervisor and a listener process.
//!
//! One JSON document per line, each prefixed with [`FRAME_TAG`], over the
//! child's stdin (supervisor to listener) and stdout (listener to
//! supervisor). Protocol libraries are free to print to stdout: a line
//! without the tag is not a frame and is only logged.
//!
//! ```text
//!  supervisor                                   listener process
//!      │ ── start {protocol, env, config, values} ──► │ connect, bind
//!      │ ◄──────────────── ready ──────────────────── │
//!      │ ◄────────── changes {id, changes} ────────── │ accepted write
//!      │ ───────────── enqueued {id, seq} ──────────► │ reply to writer
//!      │ ──────────── publish {batch} ──────────────► │ publish group
//!      │ ──────────────── shutdown ─────────────────► │ unbind
//!      │ ◄──────────── exit {error} ───────────────── │
//! ```

use crate::config::{EpicsConfig, VariableDefinition};
use crate::queue::Publication;
use crate::transport::TransportError;
use lume_types::{Protocol, PvValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix marking a line as a frame.
pub const FRAME_TAG: &str = "@lume ";

/// Everything a listener process needs to rebuild the registry mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFrame {
    pub protocol: Protocol,
    pub env: BTreeMap<String, String>,
    pub variables: BTreeMap<String, VariableDefinition>,
    pub epics: EpicsConfig,
    /// Registry values as of the attach.
    pub values: BTreeMap<String, PvValue>,
}

/// Supervisor to listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum HostFrame {
    Start(StartFrame),
    Publish {
        batch: BTreeMap<String, Publication>,
    },
    /// The changes sent as `id` are queued under `seq`.
    Enqueued { id: u64, seq: u64 },
    /// The changes sent as `id` were refused: the loop is gone.
    Refused { id: u64 },
    Shutdown,
}

/// Listener to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ListenerFrame {
    /// Every point is bound.
    Ready,
    Changes {
        id: u64,
        changes: Vec<(String, PvValue)>,
    },
    /// Sent last. `error` is the transport failure that ended the listener.
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TransportError>,
    },
    /// The listener could not make sense of the supervisor's frames.
    Failed { message: String },
}

/// Encodes `frame` as one tagged line, newline included.
///
/// # Errors
///
/// Returns the serializer error; frames hold only plain data, so this
/// only fails on non-string map keys.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(frame)?;
    Ok(format!("{FRAME_TAG}{json}\n"))
}

/// Decodes one line. `None` when the line is not a frame.
#[must_use]
pub fn decode<T: DeserializeOwned>(line: &str) -> Option<Result<T, serde_json::Error>> {
    line.strip_prefix(FRAME_TAG).map(serde_json::from_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_lines() {
        let line = encode(&HostFrame::Enqueued { id: 3, seq: 9 }).unwrap();
        assert!(line.starts_with(FRAME_TAG));
        assert!(line.ends_with('\n'));
        assert_eq!(
            decode::<HostFrame>(line.trim_end()).unwrap().unwrap(),
            HostFrame::Enqueued { id: 3, seq: 9 }
        );
    }

    #[test]
    fn untagged_output_is_not_a_frame() {
        assert!(decode::<ListenerFrame>("CAS: server started").is_none());
        assert!(decode::<ListenerFrame>("@lume {not json").unwrap().is_err());
    }

    #[test]
    fn exit_carries_the_transport_error() {
        let frame = ListenerFrame::Exit {
            error: Some(TransportError::AddressInUse {
                pvname: "p:x".into(),
                endpoint: "pva:5075".into(),
            }),
        };
        let line = encode(&frame).unwrap();
        assert!(line.contains("address_in_use"));
        assert_eq!(decode::<ListenerFrame>(line.trim_end()).unwrap().unwrap(), frame);
        assert_eq!(
            decode::<ListenerFrame>(r#"@lume {"frame":"exit"}"#).unwrap().unwrap(),
            ListenerFrame::Exit { error: None }
        );
    }

    #[test]
    fn changes_keep_values_intact() {
        let frame = ListenerFrame::Changes {
            id: 1,
            changes: vec![("input1".into(), PvValue::Scalar(2.5))],
        };
        let line = encode(&frame).unwrap();
        assert_eq!(decode::<ListenerFrame>(line.trim_end()).unwrap().unwrap(), frame);
    }
}
