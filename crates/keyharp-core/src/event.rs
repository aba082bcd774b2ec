// Canonical pipeline event.

use std::time::Instant;

use keyharp_midi::message::StatusKind;

/// A normalized event flowing from a producer to the scheduler worker.
///
/// Created by the normalizer and immutable afterwards; producers never
/// share one event mutably.
#[derive(Debug, Clone)]
pub struct NoteEvent {
    pub kind: StatusKind,
    /// Note index for note messages, controller number for control-change.
    pub note: u8,
    /// Velocity or controller value.
    pub value: u8,
    /// Whether this came from live input rather than file playback.
    pub realtime: bool,
    /// Set while playback is resynchronizing after a timeline jump.
    pub fast_forward: bool,
    /// Source timestamp: arrival time for live input, nominal emission
    /// time for playback.
    pub time: Instant,
    /// Canonical wire bytes, for hardware echo.
    pub message: Vec<u8>,
}
