// Producer facade.
//
// All producers (live input callback, playback scheduler, control surface)
// submit through a shared `Pipeline`, which normalizes, stamps not-before
// and expiry, and pushes into the time-ordered queue. The queue is the
// only synchronization point between producers and the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU16, Ordering};
use std::time::{Duration, Instant};

use keyharp_config::{Config, KeybindingTable};
use keyharp_midi::message::{CC_BANK_SELECT_LSB, CC_BANK_SELECT_MSB, StatusKind};

use crate::event::NoteEvent;
use crate::normalize::Normalizer;
use crate::queue::{QueuedAction, TimedQueue};

struct Shared {
    queue: TimedQueue,
    normalizer: Normalizer,
    bindings: Arc<KeybindingTable>,
    transpose: AtomicI32,
    bank: AtomicU16,
    patch: AtomicU8,
    max_note_latency: Duration,
    playback_max_note_latency: Duration,
}

/// Default instrument patch (harp).
const DEFAULT_PATCH: u8 = 46;

/// Cloneable producer handle.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(config: &Config, bindings: Arc<KeybindingTable>) -> Pipeline {
        Pipeline {
            shared: Arc::new(Shared {
                queue: TimedQueue::new(),
                normalizer: Normalizer::new(bindings.clone(), config.min_trigger_velocity),
                bindings,
                transpose: AtomicI32::new(0),
                bank: AtomicU16::new(0),
                patch: AtomicU8::new(DEFAULT_PATCH),
                max_note_latency: config.max_note_latency(),
                playback_max_note_latency: config.playback_max_note_latency(),
            }),
        }
    }

    pub fn queue(&self) -> &TimedQueue {
        &self.shared.queue
    }

    pub fn bindings(&self) -> &Arc<KeybindingTable> {
        &self.shared.bindings
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.shared.transpose.store(semitones, Ordering::Relaxed);
    }

    pub fn transpose(&self) -> i32 {
        self.shared.transpose.load(Ordering::Relaxed)
    }

    /// Select the output instrument bank; emits the bank-select pair.
    pub fn set_bank(&self, bank: u16) {
        self.shared.bank.store(bank, Ordering::Relaxed);
        self.submit_control(vec![0xB0, CC_BANK_SELECT_MSB, ((bank >> 7) & 0x7F) as u8]);
        self.submit_control(vec![0xB0, CC_BANK_SELECT_LSB, (bank & 0x7F) as u8]);
    }

    pub fn bank(&self) -> u16 {
        self.shared.bank.load(Ordering::Relaxed)
    }

    /// Select the output instrument patch; emits the program change.
    pub fn set_patch(&self, patch: u8) {
        self.shared.patch.store(patch, Ordering::Relaxed);
        self.submit_control(vec![0xC0, patch & 0x7F]);
    }

    pub fn patch(&self) -> u8 {
        self.shared.patch.load(Ordering::Relaxed)
    }

    /// Re-emit the stored bank and patch, e.g. after an output device is
    /// (re)opened.
    pub fn resend_instrument(&self) {
        self.set_bank(self.bank());
        self.set_patch(self.patch());
    }

    /// Submit a raw message from live input, stamped with its arrival time.
    pub fn submit_realtime(&self, message: &[u8], at: Instant) {
        self.submit(message, true, false, false, at);
    }

    /// Submit a file-playback message at its computed emission time. File
    /// note numbers already include the transpose.
    pub fn submit_playback(&self, message: &[u8], at: Instant, fast_forward: bool) {
        self.submit(message, false, true, fast_forward, at);
    }

    /// Submit internally generated control traffic (bank select, program
    /// change, all-notes-off). Bypasses the normalizer and never expires.
    pub fn submit_control(&self, message: Vec<u8>) {
        let Some(&status) = message.first() else {
            return;
        };
        let Some(kind) = StatusKind::from_status(status) else {
            return;
        };
        let now = Instant::now();
        let payload = NoteEvent {
            kind,
            note: message.get(1).copied().unwrap_or(0),
            value: message.get(2).copied().unwrap_or(0),
            realtime: false,
            fast_forward: false,
            time: now,
            message,
        };
        self.shared.queue.push(QueuedAction {
            payload,
            not_before: now,
            expiry: None,
        });
    }

    fn submit(
        &self,
        message: &[u8],
        realtime: bool,
        already_transposed: bool,
        fast_forward: bool,
        at: Instant,
    ) {
        let transpose = self.transpose();
        let Some(event) = self.shared.normalizer.normalize(
            message,
            realtime,
            already_transposed,
            transpose,
            fast_forward,
            at,
        ) else {
            return;
        };
        // Only strikes expire; releases and control traffic must always
        // reach the state machine.
        let expiry = match event.kind {
            StatusKind::NoteOn | StatusKind::AfterTouch => {
                let latency = if realtime {
                    self.shared.max_note_latency
                } else {
                    self.shared.playback_max_note_latency
                };
                Some(at + latency)
            }
            _ => None,
        };
        self.shared.queue.push(QueuedAction {
            payload: event,
            not_before: at,
            expiry,
        });
    }
}
