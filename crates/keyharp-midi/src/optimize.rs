// Offline note-spacing optimizer.
//
// A static batch pass over a standard MIDI file that nudges note-on ticks
// until every pair of consecutive note-ons in a track is at least the skill
// cooldown apart. Matching note-offs move with their note-ons and are
// clamped at the following note-on so notes never overlap backwards.

use std::time::Duration;

use anyhow::{Result, bail};
use midly::num::u28;
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

/// Per-track optimization summary.
#[derive(Debug, Clone, Copy)]
pub struct TrackReport {
    /// Nudge rounds run for this track.
    pub rounds: u64,
    /// Largest number of under-spaced pairs seen in one round.
    pub conflicts: usize,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    on_idx: usize,
    off_idx: Option<usize>,
    key: u8,
    old_tick: i64,
    new_tick: i64,
    new_time: i64,
}

/// Tick-to-microsecond conversion over the file's tempo map.
struct TempoMap {
    ticks_per_beat: i64,
    /// (tick, microsecond numerator at tick, micros-per-beat after tick).
    entries: Vec<(i64, i64, u32)>,
}

impl TempoMap {
    fn build(smf: &Smf, ticks_per_beat: u16) -> TempoMap {
        let mut changes: Vec<(i64, u32)> = Vec::new();
        for track in &smf.tracks {
            let mut ticks = 0i64;
            for event in track {
                ticks += event.delta.as_int() as i64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                    changes.push((ticks, tempo.as_int()));
                }
            }
        }
        changes.sort_by_key(|&(tick, _)| tick);

        let mut entries = vec![(0i64, 0i64, 500_000u32)];
        for (tick, micros_per_beat) in changes {
            let &(prev_tick, prev_num, prev_mpb) = entries.last().unwrap();
            let numerator = prev_num + (tick - prev_tick) * prev_mpb as i64;
            if tick == prev_tick {
                *entries.last_mut().unwrap() = (tick, numerator, micros_per_beat);
            } else {
                entries.push((tick, numerator, micros_per_beat));
            }
        }
        TempoMap {
            ticks_per_beat: ticks_per_beat as i64,
            entries,
        }
    }

    fn micros_at(&self, tick: i64) -> i64 {
        let idx = self
            .entries
            .partition_point(|&(entry_tick, _, _)| entry_tick <= tick)
            - 1;
        let (entry_tick, numerator, micros_per_beat) = self.entries[idx];
        (numerator + (tick - entry_tick) * micros_per_beat as i64) / self.ticks_per_beat
    }
}

/// Resolve spacing conflicts in place. Returns one report per track.
pub fn resolve_conflicts(smf: &mut Smf, cooldown: Duration) -> Result<Vec<TrackReport>> {
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(t) => t.as_int(),
        Timing::Timecode(..) => bail!("MIDI files with SMPTE timestamps are not supported"),
    };
    let map = TempoMap::build(smf, ticks_per_beat);
    let cooldown_us = cooldown.as_micros() as i64;
    let mut reports = Vec::with_capacity(smf.tracks.len());

    for track in smf.tracks.iter_mut() {
        let mut abs = Vec::with_capacity(track.len());
        let mut ticks = 0i64;
        for event in track.iter() {
            ticks += event.delta.as_int() as i64;
            abs.push(ticks);
        }

        let mut records = collect_note_ons(track, &abs, &map);
        records.sort_by_key(|r| (r.old_tick, r.key, r.on_idx));

        let report = nudge_apart(&mut records, &map, cooldown_us);

        // Apply offsets to the note-ons and their note-offs.
        let mut max_tick = 0i64;
        for record in &records {
            let offset = record.new_tick - record.old_tick;
            abs[record.on_idx] += offset;
            max_tick = max_tick.max(abs[record.on_idx]);
            if let Some(off_idx) = record.off_idx {
                abs[off_idx] += offset;
                max_tick = max_tick.max(abs[off_idx]);
            }
        }

        // A note-off must not outlive the next note-on's start.
        for i in 0..records.len().saturating_sub(1) {
            if let Some(off_idx) = records[i].off_idx
                && abs[off_idx] > records[i + 1].new_tick
                && records[i + 1].new_tick >= records[i].new_tick
            {
                abs[off_idx] = records[i + 1].new_tick;
            }
        }

        // Keep the track terminator at or beyond everything that moved.
        if let Some(last) = abs.last_mut()
            && *last < max_tick
        {
            *last = max_tick;
        }

        // Re-sort by absolute tick (stable on file order) and rebuild deltas.
        let mut order: Vec<usize> = (0..track.len()).collect();
        order.sort_by_key(|&i| (abs[i], i));
        let mut rebuilt = Vec::with_capacity(track.len());
        let mut prev = 0i64;
        for &i in &order {
            let mut event = track[i];
            event.delta = u28::new((abs[i] - prev).max(0) as u32);
            prev = abs[i];
            rebuilt.push(event);
        }
        *track = rebuilt;

        reports.push(report);
    }

    Ok(reports)
}

/// Gather note-on records, pairing each with its first unclaimed note-off
/// (real note-off or note-on with velocity zero) on the same key.
fn collect_note_ons(
    track: &[midly::TrackEvent],
    abs: &[i64],
    map: &TempoMap,
) -> Vec<Record> {
    let mut records: Vec<Record> = Vec::new();
    let mut pending: [Vec<usize>; 128] = std::array::from_fn(|_| Vec::new());

    for (idx, event) in track.iter().enumerate() {
        let TrackEventKind::Midi { message, .. } = event.kind else {
            continue;
        };
        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                let key = key.as_int();
                pending[key as usize].push(records.len());
                records.push(Record {
                    on_idx: idx,
                    off_idx: None,
                    key,
                    old_tick: abs[idx],
                    new_tick: abs[idx],
                    new_time: map.micros_at(abs[idx]),
                });
            }
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                let slot = &mut pending[key.as_int() as usize];
                if !slot.is_empty() {
                    let record = slot.remove(0);
                    records[record].off_idx = Some(idx);
                }
            }
            _ => {}
        }
    }
    records
}

/// The conflict-resolution loop: find the tightest under-spaced adjacent
/// pair, widen the cluster outward, and push its edges one tick apart,
/// until no pair is closer than the cooldown.
fn nudge_apart(records: &mut [Record], map: &TempoMap, cooldown_us: i64) -> TrackReport {
    let mut rounds = 0u64;
    let mut conflicts = 0usize;

    loop {
        rounds += 1;
        let mut unresolved = 0usize;
        let mut tightest: Option<(usize, usize)> = None;
        for i in 0..records.len().saturating_sub(1) {
            let gap = records[i + 1].new_time - records[i].new_time;
            if gap < cooldown_us {
                unresolved += 1;
                let tighter = match tightest {
                    Some((l, r)) => gap < records[r].new_time - records[l].new_time,
                    None => true,
                };
                if tighter {
                    tightest = Some((i, i + 1));
                }
            }
        }
        conflicts = conflicts.max(unresolved);
        let Some((mut left, mut right)) = tightest else {
            break;
        };

        while left != 0 && records[left].new_time - records[left - 1].new_time < cooldown_us {
            left -= 1;
        }
        while right < records.len() - 1
            && records[right + 1].new_time - records[right].new_time < cooldown_us
        {
            right += 1;
        }

        if records[left].new_tick > 0 {
            records[left].new_tick -= 1;
            records[right].new_tick += 1;
        } else {
            records[left].new_tick += 1;
            records[right].new_tick += 2;
        }
        records[left].new_time = map.micros_at(records[left].new_tick);
        records[right].new_time = map.micros_at(records[right].new_tick);
    }

    TrackReport { rounds, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u4, u7, u15, u28};
    use midly::{Format, Header, TrackEvent};

    const COOLDOWN: Duration = Duration::from_millis(125);

    fn midi(delta: u32, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message,
            },
        }
    }

    fn on(delta: u32, key: u8) -> TrackEvent<'static> {
        midi(
            delta,
            MidiMessage::NoteOn {
                key: u7::new(key),
                vel: u7::new(100),
            },
        )
    }

    fn off(delta: u32, key: u8) -> TrackEvent<'static> {
        midi(
            delta,
            MidiMessage::NoteOff {
                key: u7::new(key),
                vel: u7::new(0),
            },
        )
    }

    fn end(delta: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    fn song(track: Vec<TrackEvent<'static>>) -> Smf<'static> {
        Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))),
            tracks: vec![track],
        }
    }

    fn note_on_times(smf: &Smf) -> Vec<i64> {
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(t) => t.as_int(),
            _ => unreachable!(),
        };
        let map = TempoMap::build(smf, ticks_per_beat);
        let mut times = Vec::new();
        let mut ticks = 0i64;
        for event in &smf.tracks[0] {
            ticks += event.delta.as_int() as i64;
            if let TrackEventKind::Midi {
                message: MidiMessage::NoteOn { vel, .. },
                ..
            } = event.kind
                && vel.as_int() > 0
            {
                times.push(map.micros_at(ticks));
            }
        }
        times
    }

    #[test]
    fn spreads_under_spaced_notes() {
        // At 480 tpb / 500000 us per beat, 125ms is 120 ticks. Two notes 60
        // ticks apart conflict.
        let mut smf = song(vec![
            on(0, 60),
            off(30, 60),
            on(30, 62),
            off(30, 62),
            on(400, 64),
            end(0),
        ]);
        let reports = resolve_conflicts(&mut smf, COOLDOWN).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].conflicts >= 1);

        let times = note_on_times(&smf);
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(
                pair[1] - pair[0] >= COOLDOWN.as_micros() as i64,
                "gap {} under cooldown",
                pair[1] - pair[0]
            );
        }
    }

    #[test]
    fn preserves_event_count_and_order_keys() {
        let mut smf = song(vec![
            on(0, 60),
            off(20, 60),
            on(20, 62),
            off(20, 62),
            end(0),
        ]);
        let before = smf.tracks[0].len();
        resolve_conflicts(&mut smf, COOLDOWN).unwrap();
        assert_eq!(smf.tracks[0].len(), before);

        // Deltas are all non-negative by construction; absolute ticks are
        // therefore non-decreasing.
        let mut ticks = 0i64;
        for event in &smf.tracks[0] {
            ticks += event.delta.as_int() as i64;
        }
        assert!(ticks >= 0);
    }

    #[test]
    fn well_spaced_track_is_untouched() {
        let original = vec![on(0, 60), off(60, 60), on(120, 62), off(60, 62), end(0)];
        let mut smf = song(original.clone());
        let reports = resolve_conflicts(&mut smf, COOLDOWN).unwrap();
        assert_eq!(reports[0].conflicts, 0);
        for (before, after) in original.iter().zip(&smf.tracks[0]) {
            assert_eq!(before.delta, after.delta);
        }
    }

    #[test]
    fn note_off_does_not_cross_next_note_on() {
        let mut smf = song(vec![
            on(0, 60),
            off(100, 60),
            on(10, 62),
            off(60, 62),
            end(0),
        ]);
        resolve_conflicts(&mut smf, COOLDOWN).unwrap();

        let mut ticks = 0i64;
        let mut first_off = None;
        let mut second_on = None;
        for event in &smf.tracks[0] {
            ticks += event.delta.as_int() as i64;
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOff { key, .. } if key.as_int() == 60 => {
                        first_off = Some(ticks)
                    }
                    MidiMessage::NoteOn { key, vel } if key.as_int() == 62 && vel.as_int() > 0 => {
                        second_on = Some(ticks)
                    }
                    _ => {}
                }
            }
        }
        assert!(first_off.unwrap() <= second_on.unwrap());
    }

    #[test]
    fn rejects_smpte_timing() {
        let mut smf = Smf {
            header: Header::new(
                Format::SingleTrack,
                Timing::Timecode(midly::Fps::Fps25, 40),
            ),
            tracks: vec![vec![end(0)]],
        };
        assert!(resolve_conflicts(&mut smf, COOLDOWN).is_err());
    }
}
