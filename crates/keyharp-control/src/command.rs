// Control command definitions.
//
// Each command is one word plus arguments; with no arguments most commands
// answer with their current value instead of setting one.

use std::sync::Arc;

use anyhow::{Result, bail};

use keyharp_core::clock::{ClockSync, wall_now_us};
use keyharp_core::pipeline::Pipeline;
use keyharp_core::playback::{PlaybackHandle, PlaybackStatus};
use keyharp_midi::smf;

/// Trait for control-surface commands.
pub trait ControlCommand: Send + Sync {
    /// The command word (e.g. "transpose").
    fn name(&self) -> &str;

    /// Process the arguments after the command word. Returns an optional
    /// response payload.
    fn run(&self, args: &str) -> Result<Option<String>>;
}

/// `transpose [semitones]` — query or set the output transpose.
pub struct TransposeCommand {
    pub pipeline: Pipeline,
}

impl ControlCommand for TransposeCommand {
    fn name(&self) -> &str {
        "transpose"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            return Ok(Some(self.pipeline.transpose().to_string()));
        }
        let semitones: i8 = args.parse()?;
        self.pipeline.set_transpose(semitones as i32);
        Ok(Some(format!("transpose {semitones}")))
    }
}

/// `bank [n]` — query or set the output instrument bank.
pub struct BankCommand {
    pub pipeline: Pipeline,
}

impl ControlCommand for BankCommand {
    fn name(&self) -> &str {
        "bank"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            return Ok(Some(self.pipeline.bank().to_string()));
        }
        let bank: u16 = args.parse()?;
        self.pipeline.set_bank(bank);
        Ok(Some(format!("bank {bank}")))
    }
}

/// `patch [n]` — query or set the output instrument patch.
pub struct PatchCommand {
    pub pipeline: Pipeline,
}

impl ControlCommand for PatchCommand {
    fn name(&self) -> &str {
        "patch"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            return Ok(Some(self.pipeline.patch().to_string()));
        }
        let patch: u8 = args.parse()?;
        if patch > 0x7F {
            bail!("patch out of range");
        }
        self.pipeline.set_patch(patch);
        Ok(Some(format!("patch {patch}")))
    }
}

/// `track [n]` — query or select the playback track.
pub struct TrackCommand {
    pub playback: PlaybackHandle,
}

impl TrackCommand {
    fn status(&self) -> Result<PlaybackStatus> {
        self.playback
            .status()
            .ok_or_else(|| anyhow::anyhow!("playback scheduler unavailable"))
    }
}

impl ControlCommand for TrackCommand {
    fn name(&self) -> &str {
        "track"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            let status = self.status()?;
            return Ok(Some(format!("{}/{}", status.track, status.track_count)));
        }
        let track: u16 = args.parse()?;
        self.playback.set_track(track);
        Ok(Some(format!("track {track}")))
    }
}

/// `offset [ms]` — query or shift the playback offset (may be negative).
pub struct OffsetCommand {
    pub playback: PlaybackHandle,
}

impl ControlCommand for OffsetCommand {
    fn name(&self) -> &str {
        "offset"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            let status = self
                .playback
                .status()
                .ok_or_else(|| anyhow::anyhow!("playback scheduler unavailable"))?;
            return Ok(Some(format!("{}ms", status.offset_us / 1000)));
        }
        let ms: i64 = args.parse()?;
        self.playback.set_offset(ms * 1000);
        Ok(Some(format!("offset {ms}ms")))
    }
}

/// `schedule off` | `schedule <unix_ms> [loop <ms>]` | `schedule +<ms>
/// [loop <ms>]` — disable, or arm the performance start, absolute or
/// relative to now.
pub struct ScheduleCommand {
    pub playback: PlaybackHandle,
}

impl ControlCommand for ScheduleCommand {
    fn name(&self) -> &str {
        "schedule"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            let status = self
                .playback
                .status()
                .ok_or_else(|| anyhow::anyhow!("playback scheduler unavailable"))?;
            if !status.schedule_enabled {
                return Ok(Some("off".to_string()));
            }
            return Ok(Some(describe_schedule(
                status.start_unix_us,
                status.loop_enabled,
                status.loop_us,
            )));
        }

        let mut tokens = args.split_whitespace();
        let start = tokens.next().unwrap_or_default();
        if start == "off" {
            self.playback.set_schedule(false, 0, false, 0);
            return Ok(Some("off".to_string()));
        }

        let start_unix_us = if let Some(delay) = start.strip_prefix('+') {
            let delay_ms: i64 = delay.parse()?;
            wall_now_us() + delay_ms * 1000
        } else {
            let unix_ms: i64 = start.parse()?;
            unix_ms * 1000
        };

        let (loop_enabled, loop_us) = match (tokens.next(), tokens.next()) {
            (Some("loop"), Some(ms)) => (true, ms.parse::<i64>()? * 1000),
            (None, _) => (false, 0),
            _ => bail!("expected: schedule <start> [loop <ms>]"),
        };

        self.playback
            .set_schedule(true, start_unix_us, loop_enabled, loop_us);
        Ok(Some(describe_schedule(start_unix_us, loop_enabled, loop_us)))
    }
}

fn describe_schedule(start_unix_us: i64, loop_enabled: bool, loop_us: i64) -> String {
    let loop_part = if loop_enabled {
        format!("{}", loop_us / 1000)
    } else {
        "off".to_string()
    };
    format!("start={} loop={}", start_unix_us / 1000, loop_part)
}

/// `load <path>` — decode a MIDI file and hand it to the scheduler.
pub struct LoadCommand {
    pub playback: PlaybackHandle,
}

impl ControlCommand for LoadCommand {
    fn name(&self) -> &str {
        "load"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        if args.is_empty() {
            bail!("expected: load <path>");
        }
        let bytes = std::fs::read(args)?;
        let song = smf::decode(&bytes)?;
        let tracks = song.tracks.len();
        self.playback.set_song(Arc::new(song));
        Ok(Some(format!("{tracks} tracks")))
    }
}

/// `play-status` — report the scheduler position.
pub struct StatusCommand {
    pub playback: PlaybackHandle,
}

impl ControlCommand for StatusCommand {
    fn name(&self) -> &str {
        "play-status"
    }

    fn run(&self, _args: &str) -> Result<Option<String>> {
        let status = self
            .playback
            .status()
            .ok_or_else(|| anyhow::anyhow!("playback scheduler unavailable"))?;
        Ok(Some(format!(
            "{:?} track={}/{} index={} ff={} offset={}ms",
            status.state,
            status.track,
            status.track_count,
            status.next_event_index,
            status.fast_forward,
            status.offset_us / 1000
        )))
    }
}

/// `sync-time [server]` — synchronize against the reference time source.
pub struct SyncTimeCommand {
    pub sync: Arc<ClockSync>,
    pub default_server: String,
}

impl ControlCommand for SyncTimeCommand {
    fn name(&self) -> &str {
        "sync-time"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        let server = if args.is_empty() {
            &self.default_server
        } else {
            args
        };
        let published = self.sync.sync(server)?;
        Ok(Some(format!(
            "offset={}us deviation={}us",
            published.offset_us, published.max_deviation_us
        )))
    }
}
