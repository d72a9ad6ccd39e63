//! NDJSON bridge to an external session runtime.
//!
//! The game server plugin writes one JSON event per line to our stdin and
//! reads one JSON command per line from our stdout. The reader is tolerant:
//! unknown fields are ignored and unknown event types are logged and skipped.

use std::collections::BTreeSet;
use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::relay::RelayEvent;
use crate::runtime::{RecipientId, SessionRuntime, Slot};

/// Event types understood by [`RelayEvent`].
const KNOWN_EVENTS: &[&str] = &[
    "occupant_connected",
    "occupant_disconnected",
    "session_boundary_start",
    "session_boundary_end",
    "game_chat",
    "chat_ready",
    "inbound",
];

/// Errors decoding a line of the event stream.
#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing 'type' field")]
    MissingType,

    #[error("malformed '{event_type}' event: {source}")]
    Malformed {
        event_type: String,
        source: serde_json::Error,
    },
}

/// Parse one line of the event stream.
///
/// Blank lines and unknown event types yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<RelayEvent>, EventParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let raw: Value = serde_json::from_str(line)?;
    let event_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EventParseError::MissingType)?;

    if !KNOWN_EVENTS.contains(&event_type) {
        debug!(event_type, "Ignoring unknown event type");
        return Ok(None);
    }

    let event_type = event_type.to_string();
    serde_json::from_value(raw)
        .map(Some)
        .map_err(|source| EventParseError::Malformed { event_type, source })
}

/// Command written to the session runtime.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostCommand<'a> {
    Broadcast { text: &'a str },
    RenderTransient { recipient: RecipientId, html: &'a str },
}

/// [`SessionRuntime`] that mirrors occupancy from the event stream and
/// writes output commands as NDJSON.
#[derive(Debug)]
pub struct StdioRuntime<W: Write> {
    out: W,
    connected: BTreeSet<Slot>,
    max_players: u32,
}

impl<W: Write> StdioRuntime<W> {
    pub const fn new(out: W, max_players: u32) -> Self {
        Self {
            out,
            connected: BTreeSet::new(),
            max_players,
        }
    }

    /// Update occupancy from an event before the relay sees it.
    pub fn observe(&mut self, event: &RelayEvent) {
        match event {
            RelayEvent::OccupantConnected(occupant) if !occupant.is_bot => {
                self.connected.insert(occupant.slot);
            }
            RelayEvent::OccupantDisconnected { slot, .. } => {
                self.connected.remove(slot);
            }
            _ => {}
        }
    }

    /// The command sink.
    pub const fn get_ref(&self) -> &W {
        &self.out
    }

    fn write(&mut self, command: &HostCommand<'_>) {
        let result = serde_json::to_writer(&mut self.out, command)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(e) = result {
            warn!(error = %e, "Failed to write command to session runtime");
        }
    }
}

impl<W: Write> SessionRuntime for StdioRuntime<W> {
    fn broadcast_text(&mut self, text: &str) {
        self.write(&HostCommand::Broadcast { text });
    }

    fn render_transient(&mut self, recipient: RecipientId, html: &str) {
        self.write(&HostCommand::RenderTransient { recipient, html });
    }

    fn eligible_recipients(&self) -> Vec<RecipientId> {
        self.connected.iter().copied().collect()
    }

    fn is_recipient_valid(&self, recipient: RecipientId) -> bool {
        self.connected.contains(&recipient)
    }

    fn max_occupants(&self) -> u32 {
        self.max_players
    }
}
