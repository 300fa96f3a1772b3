//! Decode, playback and rendering on a dedicated worker thread
//!
//! The control side talks to the worker only through [`Command`]s and
//! [`Event`]s; decoder, canvas and effect state never leave the worker.

mod command;
mod handle;
mod orchestrator;
mod state;

pub use command::{Command, Event};
pub use handle::PipelineHandle;
pub use orchestrator::Orchestrator;
pub use state::{Action, PipelineState, PlaybackState, StateError};
