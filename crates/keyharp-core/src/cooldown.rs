// Cooldown governor.
//
// Computes how long an admitted action must still wait before it may
// legally fire. The skill cooldown is measured from the previous note-on's
// actual emission instant, not its nominal time, so governor-induced waits
// compound instead of letting a backlog fire in a burst.

use std::time::{Duration, Instant};

use keyharp_midi::message::StatusKind;

pub struct CooldownTracker {
    skill_cooldown: Duration,
    modifier_cooldown: Duration,
    last_note_on: Option<(u8, Instant)>,
}

impl CooldownTracker {
    pub fn new(skill_cooldown: Duration, modifier_cooldown: Duration) -> CooldownTracker {
        CooldownTracker {
            skill_cooldown,
            modifier_cooldown,
            last_note_on: None,
        }
    }

    /// Remaining skill-cooldown wait for this event at `now`.
    ///
    /// Governs every note-on/after-touch, and a note-off of the same pitch
    /// as the previous note-on (releasing the key that just triggered
    /// counts as a related action).
    pub fn skill_delay(&self, kind: StatusKind, note: u8, now: Instant) -> Duration {
        let Some((last_note, at)) = self.last_note_on else {
            return Duration::ZERO;
        };
        let governed = matches!(kind, StatusKind::NoteOn | StatusKind::AfterTouch)
            || (kind == StatusKind::NoteOff && note == last_note);
        if !governed {
            return Duration::ZERO;
        }
        (at + self.skill_cooldown).saturating_duration_since(now)
    }

    /// Remaining modifier-debounce wait at `now` given the last modifier
    /// transition.
    pub fn modifier_delay(&self, last_change: Option<Instant>, now: Instant) -> Duration {
        match last_change {
            Some(at) => (at + self.modifier_cooldown).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn modifier_cooldown(&self) -> Duration {
        self.modifier_cooldown
    }

    /// Record the actual emission instant of a note-on.
    pub fn record_note_on(&mut self, note: u8, at: Instant) {
        self.last_note_on = Some((note, at));
    }

    pub fn last_note_on(&self) -> Option<(u8, Instant)> {
        self.last_note_on
    }
}
