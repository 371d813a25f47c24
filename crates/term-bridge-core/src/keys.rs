//! Keystroke encoding.
//!
//! Maps a captured input fragment to a [`ProtocolMessage`]. Reserved
//! control sequences win over literal interpretation; everything else is
//! sent as text, unchanged.

use crate::protocol::{Key, ProtocolMessage};

/// Reserved control sequences and the key each one stands for.
const RESERVED: &[(&str, Key)] = &[
    ("\r", Key::Enter),
    ("\x7f", Key::Backspace),
    ("\x08", Key::Backspace),
    ("\t", Key::Tab),
    ("\x1b", Key::Escape),
    ("\x1b[A", Key::Up),
    ("\x1b[B", Key::Down),
    ("\x1b[C", Key::Right),
    ("\x1b[D", Key::Left),
    // Application cursor mode
    ("\x1bOA", Key::Up),
    ("\x1bOB", Key::Down),
    ("\x1bOC", Key::Right),
    ("\x1bOD", Key::Left),
];

/// Look up the key for an exact reserved sequence.
#[must_use]
pub fn reserved_key(raw: &str) -> Option<Key> {
    RESERVED
        .iter()
        .find_map(|(seq, key)| (*seq == raw).then_some(*key))
}

/// Encode a raw input fragment.
///
/// Total and side-effect free. Multi-character fragments (pastes) are
/// only classified as keys when they match a reserved sequence exactly.
#[must_use]
pub fn encode(raw: &str) -> ProtocolMessage {
    reserved_key(raw).map_or_else(|| ProtocolMessage::input(raw), ProtocolMessage::key)
}
