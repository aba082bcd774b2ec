// Note-to-key binding table.
//
// Maps MIDI note indices to a physical key plus modifier requirements.
// Built once from config entries at startup and read-only afterwards.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use keyharp_midi::note;

/// One configured binding. The note may be a pitch name (`"C4"`) or a
/// number; the key a single character (`"Q"`) or a numeric key code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct KeybindEntry {
    pub note: String,
    pub key: String,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

/// Resolved binding for one note index. Key code 0 means unmapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyBinding {
    pub key: u8,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl KeyBinding {
    pub fn is_mapped(&self) -> bool {
        self.key != 0
    }
}

/// Binding table indexed by MIDI note (128 entries).
#[derive(Debug, Clone)]
pub struct KeybindingTable {
    entries: [KeyBinding; 128],
}

impl KeybindingTable {
    /// Build the table from config entries. Later entries override earlier
    /// ones for the same note.
    pub fn from_entries(entries: &[KeybindEntry]) -> Result<KeybindingTable> {
        let mut table = [KeyBinding::default(); 128];
        for entry in entries {
            let index = note::note_index(&entry.note)?;
            table[index as usize] = KeyBinding {
                key: parse_key(&entry.key)?,
                ctrl: entry.ctrl,
                alt: entry.alt,
                shift: entry.shift,
            };
        }
        Ok(KeybindingTable { entries: table })
    }

    /// Look up the binding for a note. Returns `None` for out-of-range or
    /// unmapped notes.
    pub fn get(&self, note: u8) -> Option<&KeyBinding> {
        self.entries
            .get(note as usize)
            .filter(|binding| binding.is_mapped())
    }

    /// Number of mapped notes.
    pub fn mapped_count(&self) -> usize {
        self.entries.iter().filter(|b| b.is_mapped()).count()
    }
}

fn parse_key(spec: &str) -> Result<u8> {
    if spec.len() == 1 {
        let c = spec.as_bytes()[0];
        if c.is_ascii_graphic() {
            return Ok(c.to_ascii_uppercase());
        }
    }
    let value = if let Some(hex) = spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        spec.parse().ok()
    };
    match value {
        Some(v @ 1..=255) => Ok(v as u8),
        _ => bail!("unrecognized key {spec:?}"),
    }
}

/// Key row shared by all three octaves of the default layout.
const OCTAVE_KEYS: [&str; 12] = ["Q", "2", "W", "3", "E", "R", "5", "T", "6", "Y", "7", "U"];

/// The default three-octave layout: Ctrl for the low octave, no modifier
/// for the middle, Shift for the high, plus Shift+I for the top C.
pub fn default_entries() -> Vec<KeybindEntry> {
    let mut entries = Vec::with_capacity(37);
    for (base, ctrl, shift) in [(0x30u8, true, false), (0x3C, false, false), (0x48, false, true)] {
        for (i, key) in OCTAVE_KEYS.iter().enumerate() {
            entries.push(KeybindEntry {
                note: note::note_name(base + i as u8),
                key: key.to_string(),
                ctrl,
                alt: false,
                shift,
            });
        }
    }
    entries.push(KeybindEntry {
        note: note::note_name(0x54),
        key: "I".to_string(),
        ctrl: false,
        alt: false,
        shift: true,
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_covers_three_octaves() {
        let table = KeybindingTable::from_entries(&default_entries()).unwrap();
        assert_eq!(table.mapped_count(), 37);

        let low = table.get(0x30).unwrap();
        assert_eq!(low.key, b'Q');
        assert!(low.ctrl);
        assert!(!low.shift);

        let mid = table.get(0x3C).unwrap();
        assert_eq!(mid.key, b'Q');
        assert!(!mid.ctrl);
        assert!(!mid.shift);

        let high = table.get(0x48).unwrap();
        assert_eq!(high.key, b'Q');
        assert!(high.shift);

        let top = table.get(0x54).unwrap();
        assert_eq!(top.key, b'I');
        assert!(top.shift);
    }

    #[test]
    fn unmapped_notes_return_none() {
        let table = KeybindingTable::from_entries(&default_entries()).unwrap();
        assert!(table.get(0x2F).is_none());
        assert!(table.get(0x55).is_none());
        assert!(table.get(127).is_none());
    }

    #[test]
    fn entries_accept_names_and_numbers() {
        let entries = vec![
            KeybindEntry {
                note: "C4".into(),
                key: "a".into(),
                ..Default::default()
            },
            KeybindEntry {
                note: "61".into(),
                key: "0x42".into(),
                ..Default::default()
            },
        ];
        let table = KeybindingTable::from_entries(&entries).unwrap();
        assert_eq!(table.get(60).unwrap().key, b'A');
        assert_eq!(table.get(61).unwrap().key, 0x42);
    }

    #[test]
    fn later_entry_overrides_earlier() {
        let entries = vec![
            KeybindEntry {
                note: "C4".into(),
                key: "A".into(),
                ..Default::default()
            },
            KeybindEntry {
                note: "C4".into(),
                key: "B".into(),
                ctrl: true,
                ..Default::default()
            },
        ];
        let table = KeybindingTable::from_entries(&entries).unwrap();
        let binding = table.get(60).unwrap();
        assert_eq!(binding.key, b'B');
        assert!(binding.ctrl);
    }

    #[test]
    fn bad_note_or_key_is_an_error() {
        let bad_note = vec![KeybindEntry {
            note: "H9".into(),
            key: "A".into(),
            ..Default::default()
        }];
        assert!(KeybindingTable::from_entries(&bad_note).is_err());

        let bad_key = vec![KeybindEntry {
            note: "C4".into(),
            key: "whatever".into(),
            ..Default::default()
        }];
        assert!(KeybindingTable::from_entries(&bad_key).is_err());

        let zero_key = vec![KeybindEntry {
            note: "C4".into(),
            key: "0".into(),
            ..Default::default()
        }];
        assert!(KeybindingTable::from_entries(&zero_key).is_err());
    }
}
