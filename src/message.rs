//! Host message-callback channel (spec.md §6 `msg_cb`, §7). Every
//! configuration warning/fatal also goes through `log`, matching
//! `krukah-robopoker`'s convention of calling `log::warn!`/`log::error!`
//! directly from library code rather than installing its own logger.

use crate::error::MessageLevel;

/// A single message the engine wants to surface to its host, mirroring the
/// C API's `formatted_spade_msg_send`.
#[derive(Debug, Clone)]
pub struct Message {
    pub level: MessageLevel,
    pub text: String,
}

/// Host-supplied callback; receives every message alongside the `log`
/// emission `emit` performs.
pub type MsgCallback<'a> = dyn FnMut(&Message) + 'a;

/// Emits `text` at `level` to both `log` and, if present, `cb`.
pub fn emit(level: MessageLevel, text: impl Into<String>, cb: Option<&mut MsgCallback<'_>>) {
    let text = text.into();
    log::log!(level.as_log_level(), "{text}");
    if let Some(cb) = cb {
        cb(&Message { level, text });
    }
}
