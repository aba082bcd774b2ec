// Standard MIDI file decoding.
//
// Decodes an SMF into per-track event lists with tempo-resolved absolute
// times. Times are kept as exact rationals (microsecond numerator over
// ticks-per-beat) so repeated tempo changes accumulate no rounding error.

use std::time::Duration;

use anyhow::{Result, bail};
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

/// Absolute event time: microseconds = `numerator / ticks_per_beat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsTime {
    pub numerator: i64,
    pub ticks_per_beat: u16,
}

impl AbsTime {
    pub fn as_micros(&self) -> i64 {
        self.numerator / self.ticks_per_beat as i64
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.as_micros().max(0) as u64)
    }
}

/// One decoded file event: absolute tick, absolute time, raw wire bytes.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub ticks: i64,
    pub time: AbsTime,
    pub message: Vec<u8>,
}

/// A decoded MIDI file: one event list per track.
#[derive(Debug, Clone, Default)]
pub struct MidiSong {
    pub tracks: Vec<Vec<FileEvent>>,
    pub ticks_per_beat: u16,
}

impl MidiSong {
    pub fn track(&self, index: usize) -> Option<&[FileEvent]> {
        self.tracks.get(index).map(|t| t.as_slice())
    }
}

#[derive(Debug, Clone, Copy)]
struct TempoEntry {
    ticks: i64,
    micros_per_beat: u32,
}

/// Decode an SMF byte stream into tempo-resolved tracks.
///
/// The tempo table accumulates across tracks so that tempo events in an
/// earlier track (the usual format-1 layout) apply to later ones; for
/// sequential-format files each track restarts with its own table.
pub fn decode(bytes: &[u8]) -> Result<MidiSong> {
    let smf = Smf::parse(bytes)?;
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(t) => t.as_int(),
        Timing::Timecode(..) => bail!("MIDI files with SMPTE timestamps are not supported"),
    };

    let mut tempo_table: Vec<TempoEntry> = Vec::new();
    let mut tracks = Vec::with_capacity(smf.tracks.len());

    for parsed_track in &smf.tracks {
        if smf.header.format == Format::Sequential {
            tempo_table.clear();
        }
        let mut ticks = 0i64;
        let mut numerator = 0i64;
        let mut micros_per_beat = 500_000u32;
        let mut next_tempo = 0usize;
        let mut track = Vec::with_capacity(parsed_track.len());

        for event in parsed_track {
            let mut delta = event.delta.as_int() as i64;

            // Consume tempo changes that fall inside this delta.
            while next_tempo < tempo_table.len() && ticks + delta > tempo_table[next_tempo].ticks {
                let entry = tempo_table[next_tempo];
                delta -= entry.ticks - ticks;
                numerator += (entry.ticks - ticks) * micros_per_beat as i64;
                micros_per_beat = entry.micros_per_beat;
                ticks = entry.ticks;
                next_tempo += 1;
            }

            numerator += delta * micros_per_beat as i64;
            ticks += delta;

            if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                micros_per_beat = tempo.as_int();
                tempo_table.push(TempoEntry {
                    ticks,
                    micros_per_beat,
                });
            }

            track.push(FileEvent {
                ticks,
                time: AbsTime {
                    numerator,
                    ticks_per_beat,
                },
                message: event_bytes(&event.kind),
            });
        }

        tracks.push(track);
    }

    Ok(MidiSong {
        tracks,
        ticks_per_beat,
    })
}

/// Serialize a track event back to wire bytes.
///
/// Meta events collapse to a bare 0xFF marker: they keep their slot in the
/// timeline (track length, end-of-track) but carry nothing downstream.
fn event_bytes(kind: &TrackEventKind) -> Vec<u8> {
    match kind {
        TrackEventKind::Midi { channel, message } => {
            let ch = channel.as_int();
            match message {
                MidiMessage::NoteOff { key, vel } => vec![0x80 | ch, key.as_int(), vel.as_int()],
                MidiMessage::NoteOn { key, vel } => vec![0x90 | ch, key.as_int(), vel.as_int()],
                MidiMessage::Aftertouch { key, vel } => vec![0xA0 | ch, key.as_int(), vel.as_int()],
                MidiMessage::Controller { controller, value } => {
                    vec![0xB0 | ch, controller.as_int(), value.as_int()]
                }
                MidiMessage::ProgramChange { program } => vec![0xC0 | ch, program.as_int()],
                MidiMessage::ChannelAftertouch { vel } => vec![0xD0 | ch, vel.as_int()],
                MidiMessage::PitchBend { bend } => {
                    let raw = bend.0.as_int();
                    vec![0xE0 | ch, (raw & 0x7F) as u8, (raw >> 7) as u8]
                }
            }
        }
        TrackEventKind::SysEx(data) => {
            let mut message = Vec::with_capacity(data.len() + 1);
            message.push(0xF0);
            message.extend_from_slice(data);
            message
        }
        TrackEventKind::Escape(data) => data.to_vec(),
        TrackEventKind::Meta(_) => vec![0xFF],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u4, u7, u15, u24, u28};
    use midly::{Header, TrackEvent};

    fn note_on(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message: MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                },
            },
        }
    }

    fn tempo(delta: u32, micros_per_beat: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros_per_beat))),
        }
    }

    fn end_of_track(delta: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    fn encode(smf: &Smf) -> Vec<u8> {
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn default_tempo_resolution() {
        // 480 ticks per beat at the default 500000 us/beat: one beat = 500ms.
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))),
            tracks: vec![vec![note_on(0, 60, 100), note_on(480, 62, 100), end_of_track(0)]],
        };
        let song = decode(&encode(&smf)).unwrap();
        let track = song.track(0).unwrap();
        assert_eq!(track[0].time.as_micros(), 0);
        assert_eq!(track[1].time.as_micros(), 500_000);
        assert_eq!(track[1].ticks, 480);
    }

    #[test]
    fn tempo_change_applies_from_its_tick() {
        // Tempo halves to 250000 us/beat at tick 480; the next beat is 250ms.
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))),
            tracks: vec![vec![
                note_on(0, 60, 100),
                tempo(480, 250_000),
                note_on(480, 62, 100),
                end_of_track(0),
            ]],
        };
        let song = decode(&encode(&smf)).unwrap();
        let track = song.track(0).unwrap();
        assert_eq!(track[2].time.as_micros(), 500_000 + 250_000);
    }

    #[test]
    fn tempo_from_first_track_applies_to_second() {
        let smf = Smf {
            header: Header::new(Format::Parallel, Timing::Metrical(u15::new(480))),
            tracks: vec![
                vec![tempo(0, 250_000), end_of_track(960)],
                vec![note_on(480, 60, 100), end_of_track(0)],
            ],
        };
        let song = decode(&encode(&smf)).unwrap();
        let track = song.track(1).unwrap();
        // One beat at 250000 us/beat, not the 500000 default.
        assert_eq!(track[0].time.as_micros(), 250_000);
    }

    #[test]
    fn sequential_format_resets_tempo_per_track() {
        let smf = Smf {
            header: Header::new(Format::Sequential, Timing::Metrical(u15::new(480))),
            tracks: vec![
                vec![tempo(0, 250_000), end_of_track(960)],
                vec![note_on(480, 60, 100), end_of_track(0)],
            ],
        };
        let song = decode(&encode(&smf)).unwrap();
        let track = song.track(1).unwrap();
        // Second track starts back at the 500000 default.
        assert_eq!(track[0].time.as_micros(), 500_000);
    }

    #[test]
    fn event_bytes_channel_forced_into_status() {
        let track = vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(3),
                    message: MidiMessage::NoteOn {
                        key: u7::new(64),
                        vel: u7::new(90),
                    },
                },
            },
            end_of_track(0),
        ];
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(96))),
            tracks: vec![track],
        };
        let song = decode(&encode(&smf)).unwrap();
        assert_eq!(song.track(0).unwrap()[0].message, vec![0x93, 64, 90]);
    }

    #[test]
    fn meta_events_keep_their_timeline_slot() {
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))),
            tracks: vec![vec![note_on(0, 60, 100), end_of_track(960)]],
        };
        let song = decode(&encode(&smf)).unwrap();
        let track = song.track(0).unwrap();
        assert_eq!(track.len(), 2);
        assert_eq!(track[1].message, vec![0xFF]);
        assert_eq!(track[1].time.as_micros(), 1_000_000);
    }
}
