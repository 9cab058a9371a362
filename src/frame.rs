//! Text frame codec
//!
//! All traffic on the peer transport is UTF-8 text. Inbound frames are
//! either the liveness probe `ping`, a directed send `to:<recipient>;<body>`,
//! or a bare body (an implicit broadcast). Outbound service frames carry one
//! of the prefixes `pong`, `welcome:`, `connect:`, `disconnect:`, `msg:` or
//! `get:`; peers filter service prefixes themselves, so broadcast bodies go
//! out unprefixed.

use serde::Serialize;
use thiserror::Error;

/// Liveness probe sent by peers
pub const PING: &str = "ping";

/// Recipient literal addressing every other peer in the group
pub const BROADCAST_ALL: &str = "all";

const TO_PREFIX: &str = "to:";
const MSG_PREFIX: &str = "msg:";
const GET_PREFIX: &str = "get:";
const WELCOME_PREFIX: &str = "welcome:";
const CONNECT_PREFIX: &str = "connect:";
const DISCONNECT_PREFIX: &str = "disconnect:";

/// A decoded inbound frame
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// `ping`
    Ping,
    /// A peer message; `recipient` is `None` when the frame carried no
    /// `to:` prefix (a broadcast)
    Message {
        recipient: Option<&'a str>,
        body: &'a str,
    },
}

/// Frames the codec refuses to decode
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("to: frame is missing the ';' recipient delimiter")]
    MissingDelimiter,
}

/// Decode an inbound frame.
///
/// Only the `to:` prefix and the first `;` are structural; bodies may
/// contain further `;`. Anything that is neither `ping` nor a `to:` frame
/// is a broadcast whose body is the entire frame.
pub fn parse(frame: &str) -> Result<Inbound<'_>, FrameError> {
    if frame == PING {
        return Ok(Inbound::Ping);
    }
    if let Some(rest) = frame.strip_prefix(TO_PREFIX) {
        let (recipient, body) = rest.split_once(';').ok_or(FrameError::MissingDelimiter)?;
        return Ok(Inbound::Message {
            recipient: Some(recipient),
            body,
        });
    }
    Ok(Inbound::Message {
        recipient: None,
        body: frame,
    })
}

/// `pong`
pub fn pong() -> String {
    "pong".to_string()
}

/// `welcome:{"maxPayload":N}`, sent once per session at admission
pub fn welcome(max_payload: usize) -> String {
    #[derive(Serialize)]
    struct Welcome {
        #[serde(rename = "maxPayload")]
        max_payload: usize,
    }
    // Welcome has no serialization failure mode
    let payload = serde_json::to_string(&Welcome { max_payload }).unwrap_or_default();
    format!("{}{}", WELCOME_PREFIX, payload)
}

/// `connect:<peerId>`
pub fn connect(peer_id: &str) -> String {
    format!("{}{}", CONNECT_PREFIX, peer_id)
}

/// `disconnect:<peerId>`
pub fn disconnect(peer_id: &str) -> String {
    format!("{}{}", DISCONNECT_PREFIX, peer_id)
}

/// `msg:<body>`, a peer payload delivered over a per-peer send path
pub fn message(body: &str) -> String {
    format!("{}{}", MSG_PREFIX, body)
}

/// `get:<slotId>`, a reference to a spilled payload
pub fn fetch(slot_id: &str) -> String {
    format!("{}{}", GET_PREFIX, slot_id)
}
