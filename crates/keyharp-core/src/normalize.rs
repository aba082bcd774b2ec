// Event normalizer.
//
// Classifies and filters raw channel-voice bytes into canonical pipeline
// events: percussion dropped, channel forced to the primary, quiet
// note-ons and zero after-touch reclassified as note-off, bank select and
// program change and pitch bend suppressed, channel pressure truncated,
// unmapped notes dropped.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use keyharp_config::KeybindingTable;
use keyharp_midi::message::{
    CC_BANK_SELECT_LSB, CC_BANK_SELECT_MSB, PERCUSSION_CHANNEL, StatusKind, channel,
    is_channel_voice,
};
use keyharp_midi::note;

use crate::event::NoteEvent;

pub struct Normalizer {
    bindings: Arc<KeybindingTable>,
    min_trigger_velocity: u8,
}

impl Normalizer {
    pub fn new(bindings: Arc<KeybindingTable>, min_trigger_velocity: u8) -> Normalizer {
        Normalizer {
            bindings,
            min_trigger_velocity,
        }
    }

    /// Normalize one raw message. Returns `None` when the message is to be
    /// suppressed. `transpose` is only applied (in reverse) to events whose
    /// note numbers were transposed upstream, i.e. file playback.
    pub fn normalize(
        &self,
        message: &[u8],
        realtime: bool,
        already_transposed: bool,
        transpose: i32,
        fast_forward: bool,
        time: Instant,
    ) -> Option<NoteEvent> {
        let &status = message.first()?;
        if is_channel_voice(status) && channel(status) == PERCUSSION_CHANNEL {
            return None;
        }
        let mut kind = StatusKind::from_status(status)?;
        let mut msg = message.to_vec();
        if is_channel_voice(status) {
            // Force the primary channel.
            msg[0] = status & 0xF0;
        }

        match kind {
            StatusKind::NoteOff | StatusKind::NoteOn | StatusKind::AfterTouch => {
                if msg.len() < 3 {
                    return None;
                }
                let mut index = msg[1] as i32;
                if already_transposed {
                    index -= transpose;
                    if !(0..=0x7F).contains(&index) {
                        return None;
                    }
                    msg[1] = index as u8;
                }
                let index = index as u8;
                if self.bindings.get(index).is_none() {
                    if kind == StatusKind::NoteOn {
                        info!(note = %note::note_name(index), "note out of range");
                    }
                    return None;
                }
                match kind {
                    // A note-on too quiet to be deliberate is an accidental
                    // touch; release instead of striking.
                    StatusKind::NoteOn if msg[2] < self.min_trigger_velocity => {
                        kind = StatusKind::NoteOff;
                        msg[0] = StatusKind::NoteOff.status();
                    }
                    StatusKind::AfterTouch if msg[2] == 0 => {
                        kind = StatusKind::NoteOff;
                        msg[0] = StatusKind::NoteOff.status();
                    }
                    _ => {}
                }
            }
            StatusKind::ControlChange => {
                if msg.len() < 3 {
                    return None;
                }
                // Bank select is consumed internally for instrument
                // switching, never forwarded.
                if msg[1] == CC_BANK_SELECT_MSB || msg[1] == CC_BANK_SELECT_LSB {
                    debug!(controller = msg[1], "suppressing bank select");
                    return None;
                }
            }
            StatusKind::ProgramChange | StatusKind::PitchBend => return None,
            StatusKind::ChannelPressure => {
                msg.truncate(2);
            }
            StatusKind::System => {
                // File meta markers carry nothing; sysex passes through for
                // the hardware echo only.
                if status == 0xFF {
                    return None;
                }
            }
        }

        Some(NoteEvent {
            kind,
            note: msg.get(1).copied().unwrap_or(0),
            value: msg.get(2).copied().unwrap_or(0),
            realtime,
            fast_forward,
            time,
            message: msg,
        })
    }
}
