//! Control-side handle to the worker thread

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, info};

use crate::effects::EffectRegistry;
use crate::error::PipelineError;
use crate::settings::PipelineSettings;
use crate::video::{default_decoder_factory, BitmapTracker, DecoderFactory};

use super::command::{Command, Event};
use super::orchestrator::Orchestrator;

/// Owns the worker thread; dropping the handle shuts the worker down
pub struct PipelineHandle {
    commands: Sender<Command>,
    events: Receiver<Event>,
    tracker: BitmapTracker,
    thread: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Spawn with the builtin effects and the platform decoder.
    pub fn spawn(settings: PipelineSettings) -> Result<Self, PipelineError> {
        Self::spawn_with(settings, EffectRegistry::with_builtin(), default_decoder_factory())
    }

    pub fn spawn_with(
        settings: PipelineSettings,
        registry: EffectRegistry,
        decoder_factory: DecoderFactory,
    ) -> Result<Self, PipelineError> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let tracker = BitmapTracker::new();

        let orchestrator = Orchestrator::new(settings, registry, decoder_factory, tracker.clone(), event_tx);
        let thread = thread::Builder::new()
            .name("pipeline-worker".into())
            .spawn(move || orchestrator.run(command_rx))
            .map_err(PipelineError::Thread)?;

        info!("pipeline worker spawned");
        Ok(Self {
            commands: command_tx,
            events: event_rx,
            tracker,
            thread: Some(thread),
        })
    }

    pub fn send(&self, command: Command) -> Result<(), PipelineError> {
        self.commands.send(command).map_err(|_| PipelineError::WorkerGone)
    }

    /// Extra sender for producers on other threads, e.g. a mask stream
    pub fn sender(&self) -> Sender<Command> {
        self.commands.clone()
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Counts bitmaps the worker allocates
    pub fn tracker(&self) -> &BitmapTracker {
        &self.tracker
    }

    /// Stop the worker and wait for it to release everything.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            error!("pipeline worker panicked");
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
