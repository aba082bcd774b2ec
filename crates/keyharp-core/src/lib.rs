// Realtime scheduling core
//
// Converts normalized MIDI events into precisely timed key transitions:
// time-ordered action queue, cooldown governor, keystroke state machine,
// playback scheduler, and clock synchronizer, glued by a producer facade
// and a single consumer worker.

pub mod clock;
pub mod cooldown;
pub mod event;
pub mod inject;
pub mod keystate;
pub mod normalize;
pub mod pipeline;
pub mod playback;
pub mod queue;
pub mod shutdown;
pub mod worker;

pub use clock::{ClockSync, SharedClock, TimeSource};
pub use event::NoteEvent;
pub use inject::{KeyInjector, KeyTransition, TraceInjector, VirtualInjector};
pub use pipeline::Pipeline;
pub use playback::{PlaybackCommand, PlaybackHandle, PlaybackScheduler, PlaybackState};
pub use queue::{QueuedAction, TimedQueue};
pub use shutdown::Shutdown;
pub use worker::{MidiSink, NullMidiSink, Worker, WorkerConfig};
