// Keystroke state.
//
// Tracks which keys and modifiers this process currently believes are
// down, which note owns each key, and change timestamps. Mutated only by
// the scheduler worker; transition-planning methods mutate the state and
// return the key transitions to inject, so state and hardware stay in
// lockstep.

use std::time::Instant;

use keyharp_config::KeyBinding;

use crate::inject::{KEY_ALT, KEY_CTRL, KEY_SHIFT, KeyTransition};

pub const KEY_TABLE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct KeySlot {
    pressed: bool,
    note: u8,
    last_press: Option<Instant>,
    last_release: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ModifierSlot {
    pressed: bool,
}

pub struct KeystrokeState {
    keys: [KeySlot; KEY_TABLE_SIZE],
    held_count: usize,
    ctrl: ModifierSlot,
    alt: ModifierSlot,
    shift: ModifierSlot,
    last_modifier_change: Option<Instant>,
}

impl Default for KeystrokeState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeystrokeState {
    pub fn new() -> KeystrokeState {
        KeystrokeState {
            keys: [KeySlot::default(); KEY_TABLE_SIZE],
            held_count: 0,
            ctrl: ModifierSlot::default(),
            alt: ModifierSlot::default(),
            shift: ModifierSlot::default(),
            last_modifier_change: None,
        }
    }

    pub fn held_count(&self) -> usize {
        self.held_count
    }

    pub fn is_held(&self, key: u8) -> bool {
        self.keys[key as usize].pressed
    }

    /// The note holding `key`, if any.
    pub fn holding_note(&self, key: u8) -> Option<u8> {
        let slot = &self.keys[key as usize];
        if slot.pressed { Some(slot.note) } else { None }
    }

    /// (ctrl, alt, shift) pressed flags.
    pub fn modifiers(&self) -> (bool, bool, bool) {
        (self.ctrl.pressed, self.alt.pressed, self.shift.pressed)
    }

    pub fn last_modifier_change(&self) -> Option<Instant> {
        self.last_modifier_change
    }

    pub fn last_press(&self, key: u8) -> Option<Instant> {
        self.keys[key as usize].last_press
    }

    pub fn last_release(&self, key: u8) -> Option<Instant> {
        self.keys[key as usize].last_release
    }

    /// Prepare a note-on: release the target key if another note holds it,
    /// then bring each mismatched modifier to the binding's required state.
    pub fn note_on_prelude(&mut self, binding: &KeyBinding, now: Instant) -> Vec<KeyTransition> {
        let mut batch = Vec::new();
        let slot = &mut self.keys[binding.key as usize];
        if slot.pressed {
            batch.push(KeyTransition::release(binding.key));
            slot.pressed = false;
            slot.last_release = Some(now);
            self.held_count -= 1;
        }
        sync_modifier(
            &mut self.ctrl,
            KEY_CTRL,
            binding.ctrl,
            now,
            &mut batch,
            &mut self.last_modifier_change,
        );
        sync_modifier(
            &mut self.alt,
            KEY_ALT,
            binding.alt,
            now,
            &mut batch,
            &mut self.last_modifier_change,
        );
        sync_modifier(
            &mut self.shift,
            KEY_SHIFT,
            binding.shift,
            now,
            &mut batch,
            &mut self.last_modifier_change,
        );
        batch
    }

    /// Complete a note-on: press the key and record the owning note.
    pub fn note_on_press(&mut self, note: u8, binding: &KeyBinding, now: Instant) -> KeyTransition {
        let slot = &mut self.keys[binding.key as usize];
        slot.pressed = true;
        slot.note = note;
        slot.last_press = Some(now);
        self.held_count += 1;
        KeyTransition::press(binding.key)
    }

    /// Release for a note-off, only when this note still owns the key.
    pub fn note_off(&mut self, note: u8, binding: &KeyBinding, now: Instant) -> Vec<KeyTransition> {
        let slot = &mut self.keys[binding.key as usize];
        if slot.pressed && slot.note == note {
            slot.pressed = false;
            slot.last_release = Some(now);
            self.held_count -= 1;
            vec![KeyTransition::release(binding.key)]
        } else {
            Vec::new()
        }
    }

    /// Release every held key, unconditionally.
    pub fn release_all(&mut self, now: Instant) -> Vec<KeyTransition> {
        let mut batch = Vec::new();
        for (key, slot) in self.keys.iter_mut().enumerate() {
            if slot.pressed {
                batch.push(KeyTransition::release(key as u8));
                slot.pressed = false;
                slot.last_release = Some(now);
                self.held_count -= 1;
            }
        }
        batch
    }

    /// Release any held modifiers (the idle release).
    pub fn clear_modifiers(&mut self, now: Instant) -> Vec<KeyTransition> {
        let mut batch = Vec::new();
        for (slot, key) in [
            (&mut self.ctrl, KEY_CTRL),
            (&mut self.alt, KEY_ALT),
            (&mut self.shift, KEY_SHIFT),
        ] {
            if slot.pressed {
                batch.push(KeyTransition::release(key));
                slot.pressed = false;
                self.last_modifier_change = Some(now);
            }
        }
        batch
    }

    /// The held-count bookkeeping must agree with the slots; a mismatch is
    /// a logic bug and halts the process.
    pub fn verify(&self) {
        let actual = self.keys.iter().filter(|slot| slot.pressed).count();
        if actual != self.held_count {
            panic!(
                "held key count mismatch: {} slots pressed, count says {}",
                actual, self.held_count
            );
        }
    }
}

fn sync_modifier(
    slot: &mut ModifierSlot,
    key: u8,
    want: bool,
    now: Instant,
    batch: &mut Vec<KeyTransition>,
    last_change: &mut Option<Instant>,
) {
    if slot.pressed != want {
        batch.push(KeyTransition { key, pressed: want });
        slot.pressed = want;
        *last_change = Some(now);
    }
}
