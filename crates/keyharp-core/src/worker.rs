// Scheduler worker.
//
// The single consumer of the action queue. Runs the governor waits,
// forwards admitted events to the hardware echo, and drives the keystroke
// state machine. Keystroke state and injection ordering are serialized by
// construction: nothing else touches them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use keyharp_config::{Config, KeyBinding, KeybindingTable};
use keyharp_midi::message::{CC_ALL_NOTES_OFF, StatusKind};

use crate::cooldown::CooldownTracker;
use crate::event::NoteEvent;
use crate::inject::{KeyInjector, KeyTransition, is_modifier};
use crate::keystate::KeystrokeState;
use crate::pipeline::Pipeline;
use crate::queue::{TimedQueue, Wait};
use crate::shutdown::Shutdown;

/// Hardware echo seam (optional MIDI out).
pub trait MidiSink: Send {
    fn send(&mut self, message: &[u8]) -> Result<()>;
}

/// Echo sink for running without an output device.
pub struct NullMidiSink;

impl MidiSink for NullMidiSink {
    fn send(&mut self, _message: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub skill_cooldown: Duration,
    pub modifier_cooldown: Duration,
    pub idle_timeout: Duration,
    pub playback_modifier_wait: bool,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> WorkerConfig {
        WorkerConfig {
            skill_cooldown: config.skill_cooldown(),
            modifier_cooldown: config.modifier_cooldown(),
            idle_timeout: config.idle_timeout(),
            playback_modifier_wait: config.playback_modifier_wait,
        }
    }
}

pub struct Worker {
    queue: TimedQueue,
    bindings: Arc<KeybindingTable>,
    pipeline: Pipeline,
    state: KeystrokeState,
    cooldown: CooldownTracker,
    injector: Box<dyn KeyInjector>,
    midi_out: Box<dyn MidiSink>,
    cfg: WorkerConfig,
    /// Single pending wake for the idle release.
    idle_deadline: Option<Instant>,
    shutdown: Shutdown,
}

impl Worker {
    pub fn new(
        pipeline: Pipeline,
        cfg: WorkerConfig,
        injector: Box<dyn KeyInjector>,
        midi_out: Box<dyn MidiSink>,
        shutdown: Shutdown,
    ) -> Worker {
        Worker {
            queue: pipeline.queue().clone(),
            bindings: pipeline.bindings().clone(),
            pipeline,
            state: KeystrokeState::new(),
            cooldown: CooldownTracker::new(cfg.skill_cooldown, cfg.modifier_cooldown),
            injector,
            midi_out,
            cfg,
            idle_deadline: None,
            shutdown,
        }
    }

    /// Run until the queue closes.
    pub fn run(mut self) {
        loop {
            match self.queue.pop_ready(self.idle_deadline) {
                Wait::Ready(action) => self.handle(action.payload),
                Wait::Deadline => {
                    self.idle_deadline = None;
                    self.idle_release();
                }
                Wait::Closed => break,
            }
        }
        info!("scheduler worker stopped");
    }

    fn handle(&mut self, event: NoteEvent) {
        match event.kind {
            StatusKind::NoteOn | StatusKind::AfterTouch => {
                if event.fast_forward {
                    trace!(note = event.note, "fast-forward, suppressing strike");
                    return;
                }
                self.handle_strike(&event);
            }
            StatusKind::NoteOff => self.handle_note_off(&event),
            StatusKind::ControlChange => self.handle_control(&event),
            _ => self.echo(&event.message),
        }
    }

    fn handle_strike(&mut self, event: &NoteEvent) {
        // Any new strike cancels a pending idle release.
        self.idle_deadline = None;
        let Some(binding) = self.binding(event.note) else {
            return;
        };

        // After-touch must not re-strike a key this note already holds.
        if event.kind == StatusKind::AfterTouch
            && self.state.holding_note(binding.key) == Some(event.note)
        {
            self.echo(&event.message);
            return;
        }

        let mut now = Instant::now();
        let wait = self.cooldown.skill_delay(event.kind, event.note, now);
        let skill_waited = !wait.is_zero();
        if skill_waited {
            debug!(wait_us = wait.as_micros() as u64, "skill cooldown wait");
            self.shutdown.sleep(wait);
            now = Instant::now();
        }

        self.echo(&event.message);

        let mut batch = self.state.note_on_prelude(&binding, now);
        let modifiers_changed = batch.iter().any(|t| is_modifier(t.key));

        if event.realtime {
            let delay = self
                .cooldown
                .modifier_delay(self.state.last_modifier_change(), now);
            if !delay.is_zero() {
                self.flush(&batch);
                batch.clear();
                debug!(
                    wait_us = delay.as_micros() as u64,
                    "modifier cooldown wait (realtime)"
                );
                self.shutdown.sleep(delay);
                now = Instant::now();
            }
        } else if self.cfg.playback_modifier_wait && modifiers_changed && !skill_waited {
            self.flush(&batch);
            batch.clear();
            debug!("modifier cooldown wait (playback)");
            self.shutdown.sleep(self.cfg.modifier_cooldown);
            now = Instant::now();
        }

        batch.push(self.state.note_on_press(event.note, &binding, now));
        self.flush(&batch);
        self.cooldown.record_note_on(event.note, Instant::now());
    }

    fn handle_note_off(&mut self, event: &NoteEvent) {
        let Some(binding) = self.binding(event.note) else {
            return;
        };
        let now = Instant::now();
        let wait = self.cooldown.skill_delay(StatusKind::NoteOff, event.note, now);
        if !wait.is_zero() {
            // Pushed back, never dropped: the release still has to land.
            debug!(
                wait_us = wait.as_micros() as u64,
                "skill cooldown wait (note-off)"
            );
            self.shutdown.sleep(wait);
        }

        self.echo(&event.message);
        let batch = self.state.note_off(event.note, &binding, Instant::now());
        self.flush(&batch);

        if self.state.held_count() == 0 {
            self.idle_deadline = Some(Instant::now() + self.cfg.idle_timeout);
        }
    }

    fn handle_control(&mut self, event: &NoteEvent) {
        self.echo(&event.message);
        if event.note == CC_ALL_NOTES_OFF {
            let batch = self.state.release_all(Instant::now());
            self.flush(&batch);
            // Fire the idle release at zero delay.
            self.idle_deadline = Some(Instant::now());
        }
    }

    fn idle_release(&mut self) {
        let batch = self.state.clear_modifiers(Instant::now());
        if !batch.is_empty() {
            debug!("idle release, clearing modifiers");
            self.flush(&batch);
        }
    }

    fn binding(&self, note: u8) -> Option<KeyBinding> {
        self.bindings.get(note).copied()
    }

    fn flush(&mut self, batch: &[KeyTransition]) {
        if batch.is_empty() {
            return;
        }
        self.injector.apply_batch(batch);
        self.state.verify();
        trace!(held = self.state.held_count(), "key state");
    }

    fn echo(&mut self, message: &[u8]) {
        let mut message = message.to_vec();
        // The hardware echo plays at concert pitch: re-apply the transpose
        // the normalizer removed.
        if matches!(
            message.first().map(|&s| s & 0xF0),
            Some(0x80) | Some(0x90) | Some(0xA0)
        ) && message.len() >= 2
        {
            let note = message[1] as i32 + self.pipeline.transpose();
            if !(0..=0x7F).contains(&note) {
                return;
            }
            message[1] = note as u8;
        }
        if let Err(err) = self.midi_out.send(&message) {
            warn!(%err, "midi out send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::{KEY_CTRL, VirtualInjector};
    use keyharp_config::keybinding::{self, KeybindingTable};
    use std::sync::Mutex;
    use std::thread;

    struct VecSink(Arc<Mutex<Vec<Vec<u8>>>>);

    impl MidiSink for VecSink {
        fn send(&mut self, message: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    struct Harness {
        pipeline: Pipeline,
        shutdown: Shutdown,
        log: Arc<Mutex<Vec<(KeyTransition, Instant)>>>,
        echoes: Arc<Mutex<Vec<Vec<u8>>>>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start(cfg: WorkerConfig) -> Harness {
            let config = Config::default();
            let table = KeybindingTable::from_entries(&keybinding::default_entries()).unwrap();
            let pipeline = Pipeline::new(&config, Arc::new(table));
            let shutdown = Shutdown::new();
            let (injector, log) = VirtualInjector::new();
            let echoes = Arc::new(Mutex::new(Vec::new()));
            let worker = Worker::new(
                pipeline.clone(),
                cfg,
                Box::new(injector),
                Box::new(VecSink(echoes.clone())),
                shutdown.clone(),
            );
            let handle = thread::spawn(move || worker.run());
            Harness {
                pipeline,
                shutdown,
                log,
                echoes,
                worker: Some(handle),
            }
        }

        fn finish(mut self) -> Vec<(KeyTransition, Instant)> {
            self.pipeline.queue().close();
            self.worker.take().unwrap().join().unwrap();
            self.shutdown.trigger();
            self.log.lock().unwrap().clone()
        }

        fn settle(&self) {
            while !self.pipeline.queue().is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
            thread::sleep(Duration::from_millis(30));
        }
    }

    fn fast_cfg() -> WorkerConfig {
        WorkerConfig {
            skill_cooldown: Duration::from_millis(80),
            modifier_cooldown: Duration::from_millis(60),
            idle_timeout: Duration::from_millis(120),
            playback_modifier_wait: true,
        }
    }

    fn transitions_for(log: &[(KeyTransition, Instant)], key: u8) -> Vec<(KeyTransition, Instant)> {
        log.iter().filter(|(t, _)| t.key == key).cloned().collect()
    }

    #[test]
    fn rapid_note_off_is_pushed_back_not_dropped() {
        let h = Harness::start(fast_cfg());
        let now = Instant::now();
        // Press and release 10ms apart; the cooldown is 80ms.
        h.pipeline.submit_realtime(&[0x90, 0x3C, 100], now);
        h.pipeline
            .submit_realtime(&[0x80, 0x3C, 0], now + Duration::from_millis(10));

        thread::sleep(Duration::from_millis(250));
        let log = h.finish();
        let q = transitions_for(&log, b'Q');
        assert_eq!(q.len(), 2, "expected one press and one release: {q:?}");
        assert!(q[0].0.pressed);
        assert!(!q[1].0.pressed);
        assert!(
            q[1].1 - q[0].1 >= Duration::from_millis(80),
            "release fired {}us after press",
            (q[1].1 - q[0].1).as_micros()
        );
    }

    #[test]
    fn consecutive_note_ons_respect_skill_cooldown() {
        let h = Harness::start(fast_cfg());
        let now = Instant::now();
        h.pipeline.submit_realtime(&[0x90, 0x3C, 100], now);
        h.pipeline.submit_realtime(&[0x90, 0x3E, 100], now);

        thread::sleep(Duration::from_millis(300));
        let log = h.finish();
        let presses: Vec<_> = log
            .iter()
            .filter(|(t, _)| t.pressed && !is_modifier(t.key))
            .collect();
        assert_eq!(presses.len(), 2);
        assert!(presses[1].1 - presses[0].1 >= Duration::from_millis(80));
    }

    #[test]
    fn modifier_transitions_respect_modifier_cooldown() {
        let mut cfg = fast_cfg();
        cfg.skill_cooldown = Duration::ZERO;
        let h = Harness::start(cfg);
        let now = Instant::now();
        // 0x30 needs ctrl, 0x3C does not: ctrl press then ctrl release.
        h.pipeline.submit_realtime(&[0x90, 0x30, 100], now);
        h.pipeline.submit_realtime(&[0x90, 0x3C, 100], now);

        thread::sleep(Duration::from_millis(300));
        let log = h.finish();
        let ctrl = transitions_for(&log, KEY_CTRL);
        assert_eq!(ctrl.len(), 2, "expected ctrl press then release: {ctrl:?}");
        assert!(ctrl[0].0.pressed);
        assert!(!ctrl[1].0.pressed);
        assert!(
            ctrl[1].1 - ctrl[0].1 >= Duration::from_millis(60),
            "modifier changes {}us apart",
            (ctrl[1].1 - ctrl[0].1).as_micros()
        );
    }

    #[test]
    fn all_notes_off_with_nothing_held_injects_nothing() {
        let h = Harness::start(fast_cfg());
        h.pipeline
            .submit_realtime(&[0xB0, CC_ALL_NOTES_OFF, 0], Instant::now());
        h.settle();
        let log = h.finish();
        assert!(log.is_empty(), "unexpected injections: {log:?}");
    }

    #[test]
    fn all_notes_off_releases_held_keys_and_modifiers() {
        let h = Harness::start(fast_cfg());
        let now = Instant::now();
        h.pipeline.submit_realtime(&[0x90, 0x30, 100], now); // ctrl + Q
        h.settle();
        h.pipeline
            .submit_realtime(&[0xB0, CC_ALL_NOTES_OFF, 0], Instant::now());
        thread::sleep(Duration::from_millis(150));
        let log = h.finish();

        let q = transitions_for(&log, b'Q');
        assert_eq!(q.len(), 2);
        assert!(!q[1].0.pressed);
        // The zero-delay idle release drops ctrl too.
        let ctrl = transitions_for(&log, KEY_CTRL);
        assert_eq!(ctrl.len(), 2);
        assert!(!ctrl[1].0.pressed);
    }

    #[test]
    fn expired_strike_never_reaches_the_state_machine() {
        let h = Harness::start(fast_cfg());
        // Older than the 300ms default latency window.
        let stale = Instant::now() - Duration::from_millis(500);
        h.pipeline.submit_realtime(&[0x90, 0x3C, 100], stale);
        h.settle();
        let dropped = h.pipeline.queue().dropped_expired();
        let log = h.finish();
        assert!(log.is_empty());
        assert_eq!(dropped, 1);
    }

    #[test]
    fn fast_forward_strikes_are_suppressed_releases_pass() {
        let h = Harness::start(fast_cfg());
        let now = Instant::now();
        // Build up held state without fast-forward first.
        h.pipeline.submit_playback(&[0x90, 0x3C, 100], now, false);
        h.settle();
        // Fast-forward strike suppressed, fast-forward release applies.
        h.pipeline
            .submit_playback(&[0x90, 0x3E, 100], Instant::now(), true);
        h.pipeline
            .submit_playback(&[0x80, 0x3C, 0], Instant::now(), true);
        thread::sleep(Duration::from_millis(200));
        let log = h.finish();

        let w = transitions_for(&log, b'W'); // 0x3E binding
        assert!(w.is_empty(), "fast-forward strike leaked: {w:?}");
        let q = transitions_for(&log, b'Q');
        assert_eq!(q.len(), 2);
        assert!(!q[1].0.pressed);
    }

    #[test]
    fn idle_timeout_clears_modifiers() {
        let h = Harness::start(fast_cfg());
        let now = Instant::now();
        h.pipeline.submit_realtime(&[0x90, 0x30, 100], now); // ctrl + Q
        h.settle();
        h.pipeline.submit_realtime(&[0x80, 0x30, 0], Instant::now());
        // Wait past the idle timeout for the release to fire.
        thread::sleep(Duration::from_millis(400));
        let log = h.finish();

        let ctrl = transitions_for(&log, KEY_CTRL);
        assert_eq!(ctrl.len(), 2, "ctrl press then idle release: {ctrl:?}");
        assert!(!ctrl[1].0.pressed);
        // The idle release comes only after the timeout.
        let q_release = transitions_for(&log, b'Q')[1].1;
        assert!(ctrl[1].1 - q_release >= Duration::from_millis(100));
    }

    #[test]
    fn echo_is_transposed_and_ordered_with_keystrokes() {
        let h = Harness::start(fast_cfg());
        h.pipeline.set_transpose(2);
        // Playback note 0x3E un-transposes to binding 0x3C, echoes as 0x3E.
        h.pipeline
            .submit_playback(&[0x90, 0x3E, 100], Instant::now(), false);
        h.settle();
        let echoes = h.echoes.lock().unwrap().clone();
        let log = h.finish();
        assert_eq!(echoes, vec![vec![0x90, 0x3E, 100]]);
        assert_eq!(transitions_for(&log, b'Q').len(), 1);
    }
}
