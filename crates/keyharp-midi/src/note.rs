// Note index <-> scientific pitch name conversion.
//
// Octave numbering follows the convention where middle C (note 60) is C4,
// so index 0 is C-1 and index 127 is G9. Sharps are used for C/F, flats
// for E/A/B, matching common notation for the remaining accidentals.

use anyhow::{Result, bail};

const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
];

/// Name a MIDI note index, e.g. `60` -> `"C4"`.
pub fn note_name(index: u8) -> String {
    let class = PITCH_CLASS_NAMES[(index % 12) as usize];
    let octave = (index / 12) as i32 - 1;
    format!("{class}{octave}")
}

/// Parse a note given as a pitch name (`"C4"`, `"Eb2"`, `"F#-1"`) or a bare
/// number (`"60"`, `"0x3c"`).
pub fn note_index(name: &str) -> Result<u8> {
    if let Some(index) = parse_pitch_name(name) {
        return Ok(index);
    }
    if let Ok(index) = parse_number(name) {
        if index <= 0x7F {
            return Ok(index as u8);
        }
    }
    bail!("unrecognized note name {name:?}");
}

fn parse_pitch_name(name: &str) -> Option<u8> {
    let bytes = name.as_bytes();
    let letter = bytes.first()?.to_ascii_uppercase();
    let base: i32 = match letter {
        b'C' => 0,
        b'D' => 2,
        b'E' => 4,
        b'F' => 5,
        b'G' => 7,
        b'A' => 9,
        b'B' => 11,
        _ => return None,
    };
    let (accidental, rest) = match bytes.get(1) {
        Some(b'#') => (1, &name[2..]),
        Some(b'b') => (-1, &name[2..]),
        _ => (0, &name[1..]),
    };
    let octave: i32 = rest.parse().ok()?;
    let index = (octave + 1) * 12 + base + accidental;
    if (0..=0x7F).contains(&index) {
        Some(index as u8)
    } else {
        None
    }
}

fn parse_number(name: &str) -> Result<u32> {
    let value = if let Some(hex) = name.strip_prefix("0x").or_else(|| name.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)?
    } else {
        name.parse()?
    };
    Ok(value)
}
