// MIDI wire and file model
//
// Wire-level message classification, note-name tables, SMF decoding with
// tempo resolution, and the offline note-spacing optimizer.

pub mod message;
pub mod note;
pub mod optimize;
pub mod smf;
