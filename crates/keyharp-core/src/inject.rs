// Key-injection seam.
//
// The OS synthetic-input primitive is an external collaborator; the core
// talks to it through `KeyInjector`. A batch is ordered; a failing entry
// is logged and the rest of the batch still runs.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use tracing::{trace, warn};

/// Physical key codes for the three modifiers (VK-style).
pub const KEY_SHIFT: u8 = 0x10;
pub const KEY_CTRL: u8 = 0x11;
pub const KEY_ALT: u8 = 0x12;

/// Whether a key code is one of the modifier keys.
pub fn is_modifier(key: u8) -> bool {
    matches!(key, KEY_SHIFT | KEY_CTRL | KEY_ALT)
}

/// One key state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTransition {
    pub key: u8,
    pub pressed: bool,
}

impl KeyTransition {
    pub fn press(key: u8) -> KeyTransition {
        KeyTransition { key, pressed: true }
    }

    pub fn release(key: u8) -> KeyTransition {
        KeyTransition {
            key,
            pressed: false,
        }
    }
}

/// Platform abstraction for synthetic key input.
pub trait KeyInjector: Send {
    /// Apply a single transition.
    fn apply(&mut self, transition: KeyTransition) -> Result<()>;

    /// Apply an ordered batch. Individual failures are logged and the
    /// remaining transitions still run. Returns the failure count.
    fn apply_batch(&mut self, batch: &[KeyTransition]) -> usize {
        let mut failures = 0;
        for &transition in batch {
            if let Err(err) = self.apply(transition) {
                warn!(
                    key = transition.key,
                    pressed = transition.pressed,
                    %err,
                    "key injection failed"
                );
                failures += 1;
            }
        }
        failures
    }
}

/// Logs transitions instead of performing them. The headless default.
pub struct TraceInjector;

impl KeyInjector for TraceInjector {
    fn apply(&mut self, transition: KeyTransition) -> Result<()> {
        trace!(
            key = transition.key,
            pressed = transition.pressed,
            "key transition"
        );
        Ok(())
    }
}

/// Records transitions with timestamps, for tests.
pub struct VirtualInjector {
    log: Arc<Mutex<Vec<(KeyTransition, Instant)>>>,
    fail_keys: Vec<u8>,
}

impl VirtualInjector {
    pub fn new() -> (VirtualInjector, Arc<Mutex<Vec<(KeyTransition, Instant)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            VirtualInjector {
                log: log.clone(),
                fail_keys: Vec::new(),
            },
            log,
        )
    }

    /// Make every transition on `key` fail.
    pub fn fail_on(&mut self, key: u8) {
        self.fail_keys.push(key);
    }
}

impl KeyInjector for VirtualInjector {
    fn apply(&mut self, transition: KeyTransition) -> Result<()> {
        if self.fail_keys.contains(&transition.key) {
            anyhow::bail!("virtual injection failure on key {}", transition.key);
        }
        self.log.lock().unwrap().push((transition, Instant::now()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_continues_past_failures() {
        let (mut injector, log) = VirtualInjector::new();
        injector.fail_on(b'Q');

        let failures = injector.apply_batch(&[
            KeyTransition::press(KEY_CTRL),
            KeyTransition::press(b'Q'),
            KeyTransition::press(b'W'),
        ]);

        assert_eq!(failures, 1);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, KeyTransition::press(KEY_CTRL));
        assert_eq!(log[1].0, KeyTransition::press(b'W'));
    }

    #[test]
    fn modifier_codes_are_recognized() {
        assert!(is_modifier(KEY_CTRL));
        assert!(is_modifier(KEY_ALT));
        assert!(is_modifier(KEY_SHIFT));
        assert!(!is_modifier(b'Q'));
    }

    #[test]
    fn trace_injector_always_succeeds() {
        let mut injector = TraceInjector;
        assert_eq!(
            injector.apply_batch(&[KeyTransition::press(1), KeyTransition::release(1)]),
            0
        );
    }
}
