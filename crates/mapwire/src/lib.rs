//! `mapwire`: the tabletop relay wire protocol.
//!
//! Everything on the wire is a line holding a space-delimited, brace-quoted
//! list; the first element is a short command token and the rest are its
//! fields. This crate owns the list codec, the event model (arity checks,
//! dedup keys, object classes), and the die-roll preset representation.
//!
//! Decoders work on `&str` lines that have already been stripped of their
//! terminator; framing lives with the server's IO layer.

pub mod event;
pub mod list;
pub mod preset;

/// Version of the client/server protocol this implementation speaks, sent
/// in the initial `OK` greeting. Bumped by hand when behavior changes.
pub const PROTOCOL_VERSION: &str = "332";

#[derive(Debug, Clone)]
pub enum WireError {
    /// Unbalanced braces/quotes, trailing backslash, or material following
    /// a closing quote without whitespace.
    MalformedList(&'static str),
    /// First list element is not a known command token.
    UnknownType(String),
    /// Field count outside the command's allowed range.
    Arity { etype: String, got: usize },
    /// Caller-supplied object id disagrees with the id embedded in the event.
    IdConflict {
        etype: String,
        embedded: String,
        applied: String,
    },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::MalformedList(s) => write!(f, "malformed list: {s}"),
            WireError::UnknownType(t) => write!(f, "event type {t} not understood"),
            WireError::Arity { etype, got } => {
                write!(f, "event {etype} has invalid parameter list ({got})")
            }
            WireError::IdConflict {
                etype,
                embedded,
                applied,
            } => write!(
                f,
                "{etype} record is for object ID {embedded} but applied to ID {applied}"
            ),
        }
    }
}

impl std::error::Error for WireError {}
