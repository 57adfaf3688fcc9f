//! Playback state machine
//!
//! All playback transitions go through [`reduce`], which returns the next
//! state and the effects the manager must carry out. The reducer never touches
//! a sink itself.

use super::PlaybackStatus;
use crate::platform::PlayError;

/// Monotonic identifier of one playback attempt, assigned by the manager
pub type PlaybackId = u64;

/// Authoritative playback state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    Loading {
        playback_id: PlaybackId,
    },
    Playing {
        playback_id: PlaybackId,
    },
    Paused {
        playback_id: PlaybackId,
    },
}

impl State {
    pub fn playback_id(&self) -> Option<PlaybackId> {
        match self {
            State::Idle => None,
            State::Loading { playback_id }
            | State::Playing { playback_id }
            | State::Paused { playback_id } => Some(*playback_id),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        match self {
            State::Idle => PlaybackStatus::Idle,
            State::Loading { .. } => PlaybackStatus::Loading,
            State::Playing { .. } => PlaybackStatus::Playing,
            State::Paused { .. } => PlaybackStatus::Paused,
        }
    }
}

/// Inputs to the reducer, from the manager's API and from sink callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new playback was set up and its play request issued
    Begin { playback_id: PlaybackId },
    /// The sink started producing audio
    PlayStarted { playback_id: PlaybackId },
    /// The sink paused on its own (device or OS interruption)
    SinkPaused { playback_id: PlaybackId },
    SinkEnded { playback_id: PlaybackId },
    LoadFailed { playback_id: PlaybackId, err: PlayError },
    /// Play refused for lack of gesture provenance
    GestureBlocked { playback_id: PlaybackId },
    /// Re-initiating a paused playback was refused
    ResumeFailed { playback_id: PlaybackId, err: PlayError },
    PauseRequested,
    ResumeRequested,
    Stop,
}

/// Work the manager performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish the new status to watchers
    EmitStatus,
    PauseSink { playback_id: PlaybackId },
    /// Issue a fresh play request on the active sink
    StartSink { playback_id: PlaybackId },
    /// Pause, rewind, detach and close the active playback's resources
    Release { playback_id: PlaybackId },
    /// Keep the request for a later gesture
    Defer { playback_id: PlaybackId },
    ReportFailure {
        playback_id: PlaybackId,
        error: PlayError,
    },
    AnnounceEnded { playback_id: PlaybackId },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale playback ids
/// - Emit status after every real transition
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.playback_id();
    let is_current = |eid: PlaybackId| current_id == Some(eid);

    match (state, event) {
        // A new playback always replaces whatever was there; the manager has
        // already released the previous one.
        (_, Begin { playback_id }) => (Loading { playback_id }, vec![EmitStatus]),

        // -----------------
        // Loading
        // -----------------
        (Loading { .. }, PlayStarted { playback_id }) if is_current(playback_id) => {
            (Playing { playback_id }, vec![EmitStatus])
        }
        (Loading { .. }, LoadFailed { playback_id, err }) if is_current(playback_id) => (
            Idle,
            vec![
                Release { playback_id },
                ReportFailure {
                    playback_id,
                    error: err,
                },
                EmitStatus,
            ],
        ),
        // Also reached when the user paused before the first play was refused
        (Loading { .. } | Paused { .. }, GestureBlocked { playback_id })
            if is_current(playback_id) =>
        (
            Idle,
            vec![Release { playback_id }, Defer { playback_id }, EmitStatus],
        ),
        // Resume attempt refused: stay paused rather than dropping the playback
        (Loading { .. }, ResumeFailed { playback_id, err }) if is_current(playback_id) => (
            Paused { playback_id },
            vec![
                ReportFailure {
                    playback_id,
                    error: err,
                },
                EmitStatus,
            ],
        ),
        (Loading { playback_id }, PauseRequested) => (
            Paused {
                playback_id: *playback_id,
            },
            vec![
                PauseSink {
                    playback_id: *playback_id,
                },
                EmitStatus,
            ],
        ),

        // -----------------
        // Playing
        // -----------------
        (Playing { playback_id }, PauseRequested) => (
            Paused {
                playback_id: *playback_id,
            },
            vec![
                PauseSink {
                    playback_id: *playback_id,
                },
                EmitStatus,
            ],
        ),
        (Playing { .. }, SinkPaused { playback_id }) if is_current(playback_id) => {
            (Paused { playback_id }, vec![EmitStatus])
        }

        // -----------------
        // Paused
        // -----------------
        (Paused { playback_id }, ResumeRequested) => (
            Loading {
                playback_id: *playback_id,
            },
            vec![
                StartSink {
                    playback_id: *playback_id,
                },
                EmitStatus,
            ],
        ),
        // Play resolved after the user paused mid-load: hold the pause
        (Paused { .. }, PlayStarted { playback_id }) if is_current(playback_id) => {
            (state.clone(), vec![PauseSink { playback_id }])
        }

        // -----------------
        // Failure after playback started (or while paused mid-load)
        // -----------------
        (Playing { .. } | Paused { .. }, LoadFailed { playback_id, err })
            if is_current(playback_id) =>
        {
            (
                Idle,
                vec![
                    Release { playback_id },
                    ReportFailure {
                        playback_id,
                        error: err,
                    },
                    EmitStatus,
                ],
            )
        }

        // -----------------
        // Natural end, from any live state
        // -----------------
        (Loading { .. } | Playing { .. } | Paused { .. }, SinkEnded { playback_id })
            if is_current(playback_id) =>
        {
            (
                Idle,
                vec![
                    Release { playback_id },
                    AnnounceEnded { playback_id },
                    EmitStatus,
                ],
            )
        }

        // -----------------
        // Stop
        // -----------------
        (Idle, Stop) => (Idle, vec![]),
        (_, Stop) => match current_id {
            Some(playback_id) => (Idle, vec![Release { playback_id }, EmitStatus]),
            None => (Idle, vec![EmitStatus]),
        },

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_enters_loading_from_any_state() {
        for state in [
            State::Idle,
            State::Playing { playback_id: 1 },
            State::Paused { playback_id: 1 },
        ] {
            let (next, effects) = reduce(&state, Event::Begin { playback_id: 2 });
            assert_eq!(next, State::Loading { playback_id: 2 });
            assert_eq!(effects, vec![Effect::EmitStatus]);
        }
    }

    #[test]
    fn loading_play_started_transitions_to_playing() {
        let (next, effects) = reduce(
            &State::Loading { playback_id: 3 },
            Event::PlayStarted { playback_id: 3 },
        );
        assert_eq!(next, State::Playing { playback_id: 3 });
        assert_eq!(effects, vec![Effect::EmitStatus]);
    }

    #[test]
    fn stale_event_is_ignored() {
        let state = State::Loading { playback_id: 5 };
        for event in [
            Event::PlayStarted { playback_id: 4 },
            Event::LoadFailed {
                playback_id: 4,
                err: PlayError::Load("gone".to_string()),
            },
            Event::GestureBlocked { playback_id: 4 },
            Event::SinkEnded { playback_id: 4 },
        ] {
            let (next, effects) = reduce(&state, event);
            assert_eq!(next, state);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn gesture_block_goes_idle_and_defers() {
        let (next, effects) = reduce(
            &State::Loading { playback_id: 1 },
            Event::GestureBlocked { playback_id: 1 },
        );
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::Defer { playback_id: 1 }));
        assert!(effects.contains(&Effect::Release { playback_id: 1 }));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::ReportFailure { .. })));
    }

    #[test]
    fn gesture_block_after_pause_mid_load_still_defers() {
        let (paused, _) = reduce(&State::Loading { playback_id: 6 }, Event::PauseRequested);
        assert_eq!(paused, State::Paused { playback_id: 6 });

        let (next, effects) = reduce(&paused, Event::GestureBlocked { playback_id: 6 });
        assert_eq!(next, State::Idle);
        assert_eq!(
            effects,
            vec![
                Effect::Release { playback_id: 6 },
                Effect::Defer { playback_id: 6 },
                Effect::EmitStatus
            ]
        );
    }

    #[test]
    fn load_failure_goes_idle_and_reports() {
        let (next, effects) = reduce(
            &State::Loading { playback_id: 1 },
            Event::LoadFailed {
                playback_id: 1,
                err: PlayError::Load("decode".to_string()),
            },
        );
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::ReportFailure {
            playback_id: 1,
            error: PlayError::Load("decode".to_string())
        }));
    }

    #[test]
    fn pause_resume_cycle() {
        let (paused, effects) = reduce(&State::Playing { playback_id: 2 }, Event::PauseRequested);
        assert_eq!(paused, State::Paused { playback_id: 2 });
        assert!(effects.contains(&Effect::PauseSink { playback_id: 2 }));

        let (loading, effects) = reduce(&paused, Event::ResumeRequested);
        assert_eq!(loading, State::Loading { playback_id: 2 });
        assert!(effects.contains(&Effect::StartSink { playback_id: 2 }));

        let (playing, _) = reduce(&loading, Event::PlayStarted { playback_id: 2 });
        assert_eq!(playing, State::Playing { playback_id: 2 });
    }

    #[test]
    fn resume_failure_reverts_to_paused() {
        let (next, effects) = reduce(
            &State::Loading { playback_id: 2 },
            Event::ResumeFailed {
                playback_id: 2,
                err: PlayError::GestureRequired,
            },
        );
        assert_eq!(next, State::Paused { playback_id: 2 });
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReportFailure { .. })));
    }

    #[test]
    fn play_resolving_after_pause_keeps_paused() {
        let (next, effects) = reduce(
            &State::Paused { playback_id: 9 },
            Event::PlayStarted { playback_id: 9 },
        );
        assert_eq!(next, State::Paused { playback_id: 9 });
        assert_eq!(effects, vec![Effect::PauseSink { playback_id: 9 }]);
    }

    #[test]
    fn natural_end_releases_and_announces() {
        let (next, effects) = reduce(
            &State::Playing { playback_id: 4 },
            Event::SinkEnded { playback_id: 4 },
        );
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::AnnounceEnded { playback_id: 4 }));
        assert!(effects.contains(&Effect::Release { playback_id: 4 }));
    }

    #[test]
    fn stop_from_idle_is_a_no_op() {
        let (next, effects) = reduce(&State::Idle, Event::Stop);
        assert_eq!(next, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_releases_from_any_live_state() {
        for state in [
            State::Loading { playback_id: 1 },
            State::Playing { playback_id: 1 },
            State::Paused { playback_id: 1 },
        ] {
            let (next, effects) = reduce(&state, Event::Stop);
            assert_eq!(next, State::Idle);
            assert!(effects.contains(&Effect::Release { playback_id: 1 }));
        }
    }

    #[test]
    fn pause_and_resume_ignored_when_idle() {
        assert_eq!(reduce(&State::Idle, Event::PauseRequested).0, State::Idle);
        assert_eq!(reduce(&State::Idle, Event::ResumeRequested).0, State::Idle);
    }
}
