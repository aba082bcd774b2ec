// Control surface
//
// Line-command protocol over TCP: one command per line, one response line
// back. Each command maps to a single serialized call into the pipeline.

pub mod command;
pub mod controller;

pub use command::{
    BankCommand, ControlCommand, LoadCommand, OffsetCommand, PatchCommand, ScheduleCommand,
    StatusCommand, SyncTimeCommand, TrackCommand, TransposeCommand,
};
pub use controller::{ControlServer, dispatch_line};
