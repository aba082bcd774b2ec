// Playback scheduler.
//
// Replays a decoded file against the shared wall clock and feeds events
// into the normalizer/queue pipeline at the right relative offset. Driven
// by a command channel plus a single pending-wake timeout; every track,
// offset, schedule, or loop change funnels through one reset operation.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use keyharp_midi::message::CC_ALL_NOTES_OFF;
use keyharp_midi::smf::MidiSong;

use crate::clock::{SharedClock, wall_now_us};
use crate::pipeline::Pipeline;

/// Where the scheduler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    WaitingForStart,
    Playing,
    Looping,
    Finished,
}

pub enum PlaybackCommand {
    SetSong(Arc<MidiSong>),
    SetTrack(u16),
    /// User offset in microseconds, may be negative.
    SetOffset(i64),
    SetSchedule {
        enabled: bool,
        start_unix_us: i64,
        loop_enabled: bool,
        loop_us: i64,
    },
    Query(Sender<PlaybackStatus>),
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub track: u16,
    pub track_count: usize,
    pub next_event_index: usize,
    pub fast_forward: bool,
    pub offset_us: i64,
    pub schedule_enabled: bool,
    pub start_unix_us: i64,
    pub loop_enabled: bool,
    pub loop_us: i64,
}

/// Cloneable command-side handle.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: Sender<PlaybackCommand>,
}

impl PlaybackHandle {
    pub fn set_song(&self, song: Arc<MidiSong>) {
        let _ = self.tx.send(PlaybackCommand::SetSong(song));
    }

    pub fn set_track(&self, track: u16) {
        let _ = self.tx.send(PlaybackCommand::SetTrack(track));
    }

    pub fn set_offset(&self, offset_us: i64) {
        let _ = self.tx.send(PlaybackCommand::SetOffset(offset_us));
    }

    pub fn set_schedule(&self, enabled: bool, start_unix_us: i64, loop_enabled: bool, loop_us: i64) {
        let _ = self.tx.send(PlaybackCommand::SetSchedule {
            enabled,
            start_unix_us,
            loop_enabled,
            loop_us,
        });
    }

    pub fn status(&self) -> Option<PlaybackStatus> {
        let (reply_tx, reply_rx) = channel();
        self.tx.send(PlaybackCommand::Query(reply_tx)).ok()?;
        reply_rx.recv_timeout(Duration::from_secs(1)).ok()
    }
}

pub struct PlaybackScheduler {
    rx: Receiver<PlaybackCommand>,
    pipeline: Pipeline,
    clock: SharedClock,
    song: Option<Arc<MidiSong>>,
    track: u16,
    next_event_index: usize,
    schedule_enabled: bool,
    start_unix_us: i64,
    loop_enabled: bool,
    loop_us: i64,
    offset_us: i64,
    fast_forward: bool,
    state: PlaybackState,
}

impl PlaybackScheduler {
    pub fn new(pipeline: Pipeline, clock: SharedClock) -> (PlaybackHandle, PlaybackScheduler) {
        let (tx, rx) = channel();
        (
            PlaybackHandle { tx },
            PlaybackScheduler {
                rx,
                pipeline,
                clock,
                song: None,
                track: 0,
                next_event_index: 0,
                schedule_enabled: false,
                start_unix_us: 0,
                loop_enabled: false,
                loop_us: 0,
                offset_us: 0,
                fast_forward: false,
                state: PlaybackState::Stopped,
            },
        )
    }

    /// Run until every command handle is dropped. The pending wake is kept
    /// as an absolute deadline so commands arriving mid-wait cannot push
    /// the next event late.
    pub fn run(mut self) {
        let mut wake: Option<Instant> = None;
        loop {
            let command = match wake {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(timeout) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };
            match command {
                Some(command) => self.apply(command, &mut wake),
                None => wake = self.step().map(|delay| Instant::now() + delay),
            }
        }
        info!("playback scheduler stopped");
    }

    fn apply(&mut self, command: PlaybackCommand, wake: &mut Option<Instant>) {
        match command {
            PlaybackCommand::SetSong(song) => {
                info!(tracks = song.tracks.len(), "playback file loaded");
                self.song = Some(song);
                self.reset();
                *wake = Some(Instant::now());
            }
            PlaybackCommand::SetTrack(track) => {
                if self.track != track {
                    self.track = track;
                    self.reset();
                    *wake = Some(Instant::now());
                }
            }
            PlaybackCommand::SetOffset(offset_us) => {
                info!(offset_us, "playback offset changed");
                self.offset_us = offset_us;
                self.reset();
                *wake = Some(Instant::now());
            }
            PlaybackCommand::SetSchedule {
                enabled,
                start_unix_us,
                loop_enabled,
                loop_us,
            } => {
                self.schedule_enabled = enabled;
                self.start_unix_us = start_unix_us;
                self.loop_enabled = loop_enabled;
                self.loop_us = loop_us;
                self.reset();
                *wake = Some(Instant::now());
            }
            PlaybackCommand::Query(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            track: self.track,
            track_count: self.song.as_ref().map_or(0, |s| s.tracks.len()),
            next_event_index: self.next_event_index,
            fast_forward: self.fast_forward,
            offset_us: self.offset_us,
            schedule_enabled: self.schedule_enabled,
            start_unix_us: self.start_unix_us,
            loop_enabled: self.loop_enabled,
            loop_us: self.loop_us,
        }
    }

    /// Advance playback at the current wall time; returns the next wake
    /// delay, or `None` to sleep until the next command.
    fn step(&mut self) -> Option<Duration> {
        self.step_at(wall_now_us())
    }

    fn step_at(&mut self, now_us: i64) -> Option<Duration> {
        loop {
            if !self.schedule_enabled {
                if self.state != PlaybackState::Finished {
                    self.state = PlaybackState::Stopped;
                }
                return None;
            }
            let Some(song) = self.song.clone() else {
                self.state = PlaybackState::Stopped;
                return None;
            };
            let Some(track) = song.track(self.track as usize) else {
                warn!(
                    track = self.track,
                    max = song.tracks.len().saturating_sub(1),
                    "invalid track number"
                );
                self.state = PlaybackState::Stopped;
                return None;
            };

            let mut progress = now_us + self.clock.offset_us() + self.offset_us - self.start_unix_us;
            if progress < 0 {
                self.next_event_index = 0;
                self.state = PlaybackState::WaitingForStart;
                self.exit_fast_forward();
                return Some(Duration::from_micros((-progress) as u64));
            }
            if self.loop_enabled && self.loop_us > 0 {
                progress %= self.loop_us;
            }

            let index = self.next_event_index;
            if index >= track.len() {
                if self.loop_enabled {
                    self.next_event_index = 0;
                    let wait = (self.loop_us - progress).max(0);
                    debug!(wait_us = wait, "looping");
                    self.state = PlaybackState::Looping;
                    self.exit_fast_forward();
                    return Some(Duration::from_micros(wait as u64));
                }
                info!("track finished");
                self.state = PlaybackState::Finished;
                self.pipeline
                    .submit_control(vec![0xB0, CC_ALL_NOTES_OFF, 0x00]);
                return None;
            }

            // Offset or track moved the timeline backwards: start over in
            // fast-forward until real time catches up.
            if index > 0 && track[index - 1].time.as_micros() > progress {
                self.reset();
                continue;
            }

            let next_time = track[index].time.as_micros();
            if next_time > progress {
                self.state = if self.loop_enabled {
                    PlaybackState::Looping
                } else {
                    PlaybackState::Playing
                };
                self.exit_fast_forward();
                return Some(Duration::from_micros((next_time - progress) as u64));
            }

            // Due (or overdue): submit tagged with its nominal emission
            // instant and immediately re-evaluate.
            let lag = Duration::from_micros((progress - next_time) as u64);
            let at = Instant::now().checked_sub(lag).unwrap_or_else(Instant::now);
            self.pipeline
                .submit_playback(&track[index].message, at, self.fast_forward);
            self.next_event_index = index + 1;
            self.state = if self.loop_enabled {
                PlaybackState::Looping
            } else {
                PlaybackState::Playing
            };
        }
    }

    /// The single reset path: clean up held keys, rewind, and fast-forward
    /// until the timeline catches up.
    fn reset(&mut self) {
        debug!("playback reset");
        self.pipeline
            .submit_control(vec![0xB0, CC_ALL_NOTES_OFF, 0x00]);
        self.next_event_index = 0;
        if !self.fast_forward {
            debug!("fast-forward on");
            self.fast_forward = true;
        }
    }

    fn exit_fast_forward(&mut self) {
        if self.fast_forward {
            debug!("fast-forward off");
            self.fast_forward = false;
        }
    }
}
