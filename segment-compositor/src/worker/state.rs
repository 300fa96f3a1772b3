//! Lifecycle of the worker's session

use serde::Serialize;
use thiserror::Error;

/// Where the loaded source stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No source
    Idle,
    /// Source set, track not parsed yet
    SourceLoading,
    /// Track known, frames can be drawn
    Ready,
    Playing,
    Paused,
}

/// Actions checked by [`PipelineState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Play,
    Pause,
    Stop,
    Seek,
    Encode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {action:?} while {state:?}{}", encoding_suffix(.encoding))]
pub struct StateError {
    pub action: Action,
    pub state: PlaybackState,
    pub encoding: bool,
}

fn encoding_suffix(encoding: &bool) -> &'static str {
    if *encoding {
        " (encoding)"
    } else {
        ""
    }
}

/// Playback state plus the orthogonal encoding flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub playback: PlaybackState,
    pub encoding: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            playback: PlaybackState::Idle,
            encoding: false,
        }
    }
}

impl PipelineState {
    fn reject(&self, action: Action) -> StateError {
        StateError {
            action,
            state: self.playback,
            encoding: self.encoding,
        }
    }

    /// Frames can be drawn
    pub fn has_track(&self) -> bool {
        matches!(
            self.playback,
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused
        )
    }

    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Playing
    }

    /// A new source replaces whatever was loaded.
    pub fn load(&mut self) {
        self.playback = PlaybackState::SourceLoading;
        self.encoding = false;
    }

    /// Track parsed. Ignored outside `SourceLoading`.
    pub fn ready(&mut self) -> bool {
        if self.playback == PlaybackState::SourceLoading {
            self.playback = PlaybackState::Ready;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn play(&mut self) -> Result<(), StateError> {
        match self.playback {
            PlaybackState::Ready | PlaybackState::Paused if !self.encoding => {
                self.playback = PlaybackState::Playing;
                Ok(())
            }
            _ => Err(self.reject(Action::Play)),
        }
    }

    pub fn pause(&mut self) -> Result<(), StateError> {
        match self.playback {
            PlaybackState::Playing => {
                self.playback = PlaybackState::Paused;
                Ok(())
            }
            PlaybackState::Paused => Ok(()),
            _ => Err(self.reject(Action::Pause)),
        }
    }

    /// Back to `Ready`; the caller rewinds to frame 0.
    pub fn stop(&mut self) -> Result<(), StateError> {
        if self.has_track() && !self.encoding {
            self.playback = PlaybackState::Ready;
            Ok(())
        } else {
            Err(self.reject(Action::Stop))
        }
    }

    /// Seeks are accepted while the track is still loading and resolved later.
    pub fn check_seek(&self) -> Result<(), StateError> {
        if self.playback == PlaybackState::Idle || self.encoding {
            Err(self.reject(Action::Seek))
        } else {
            Ok(())
        }
    }

    pub fn begin_encode(&mut self) -> Result<(), StateError> {
        match self.playback {
            PlaybackState::Ready | PlaybackState::Paused if !self.encoding => {
                self.encoding = true;
                Ok(())
            }
            _ => Err(self.reject(Action::Encode)),
        }
    }

    pub fn end_encode(&mut self) {
        self.encoding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> PipelineState {
        let mut state = PipelineState::default();
        state.load();
        assert!(state.ready());
        state
    }

    #[test]
    fn test_lifecycle() {
        let mut state = PipelineState::default();
        assert!(state.play().is_err());
        state.load();
        assert_eq!(state.playback, PlaybackState::SourceLoading);
        assert!(state.play().is_err());
        assert!(state.ready());
        assert!(!state.ready());

        state.play().unwrap();
        assert!(state.is_playing());
        state.pause().unwrap();
        state.pause().unwrap();
        assert_eq!(state.playback, PlaybackState::Paused);
        state.stop().unwrap();
        assert_eq!(state.playback, PlaybackState::Ready);
    }

    #[test]
    fn test_encoding_only_from_ready_or_paused() {
        let mut state = ready();
        state.play().unwrap();
        let err = state.begin_encode().unwrap_err();
        assert_eq!(err.action, Action::Encode);
        assert_eq!(err.state, PlaybackState::Playing);

        state.pause().unwrap();
        state.begin_encode().unwrap();
        assert!(state.begin_encode().is_err());
        assert!(state.play().is_err());
        assert!(state.check_seek().is_err());

        state.end_encode();
        state.play().unwrap();
    }

    #[test]
    fn test_seek_allowed_while_loading() {
        let mut state = PipelineState::default();
        assert!(state.check_seek().is_err());
        state.load();
        state.check_seek().unwrap();
    }

    #[test]
    fn test_load_clears_encoding() {
        let mut state = ready();
        state.begin_encode().unwrap();
        state.load();
        assert!(!state.encoding);
        assert_eq!(state.playback, PlaybackState::SourceLoading);
    }

    #[test]
    fn test_error_message_and_serialization() {
        let mut state = ready();
        state.begin_encode().unwrap();
        let err = state.stop().unwrap_err();
        assert_eq!(err.to_string(), "cannot Stop while Ready (encoding)");

        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["playback"], "ready");
        assert_eq!(json["encoding"], true);
    }
}
