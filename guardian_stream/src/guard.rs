use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Monitoring,
    LeaveConfirmPending,
    Closed,
}

/// A way out of the monitoring view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Navigation {
    InApp { target: String },
    Back,
    Forward,
    Reload,
    Close,
}

impl Navigation {
    /// Host-level attempts are only advised against; the host has the final
    /// say.
    pub fn is_host_level(&self) -> bool {
        !matches!(self, Navigation::InApp { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    OpenRequested,
    ChannelOpened,
    ChannelClosed,
    ChannelErrored,
    NavigationAttempted(Navigation),
    LeaveDeclined,
    LeaveConfirmed,
}

impl GuardEvent {
    fn name(&self) -> &'static str {
        match self {
            GuardEvent::OpenRequested => "open requested",
            GuardEvent::ChannelOpened => "channel opened",
            GuardEvent::ChannelClosed => "channel closed",
            GuardEvent::ChannelErrored => "channel errored",
            GuardEvent::NavigationAttempted(_) => "navigation attempted",
            GuardEvent::LeaveDeclined => "leave declined",
            GuardEvent::LeaveConfirmed => "leave confirmed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardAction {
    None,
    /// Nothing to protect; the navigation may complete.
    Proceed(Navigation),
    /// Hold the navigation and ask the operator.
    AwaitConfirmation(Navigation),
    /// A confirmation is already open; this attempt is dropped.
    Reject,
    /// Operator stayed; cancel or undo the held navigation.
    Revert(Navigation),
    /// Operator left; release everything, then let the navigation complete.
    TeardownAndProceed(Navigation),
    /// The channel ended on its own; release everything.
    Teardown,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GuardError {
    #[error("Cannot handle {event} while {state:?}")]
    InvalidTransition {
        state: SessionState,
        event: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    None,
    Allow,
    Hold,
    Reject,
    Revert,
    Leave,
    Abandon,
    Teardown,
}

fn transition(
    state: SessionState,
    event: &GuardEvent,
) -> Result<(SessionState, Decision), GuardError> {
    use SessionState::*;

    let next = match (state, event) {
        (Idle | Closed, GuardEvent::OpenRequested) => (Connecting, Decision::None),
        (Connecting, GuardEvent::ChannelOpened) => (Monitoring, Decision::None),
        (
            Connecting | Monitoring | LeaveConfirmPending,
            GuardEvent::ChannelClosed | GuardEvent::ChannelErrored,
        ) => (Closed, Decision::Teardown),
        (Idle | Closed, GuardEvent::ChannelClosed | GuardEvent::ChannelErrored) => {
            (state, Decision::None)
        }
        (Monitoring, GuardEvent::NavigationAttempted(_)) => (LeaveConfirmPending, Decision::Hold),
        (LeaveConfirmPending, GuardEvent::NavigationAttempted(_)) => {
            (LeaveConfirmPending, Decision::Reject)
        }
        // Nothing to confirm yet, but the half-open session must not outlive
        // the view.
        (Connecting, GuardEvent::NavigationAttempted(_)) => (Closed, Decision::Abandon),
        (Idle | Closed, GuardEvent::NavigationAttempted(_)) => (state, Decision::Allow),
        (LeaveConfirmPending, GuardEvent::LeaveDeclined) => (Monitoring, Decision::Revert),
        (LeaveConfirmPending, GuardEvent::LeaveConfirmed) => (Closed, Decision::Leave),
        _ => {
            return Err(GuardError::InvalidTransition {
                state,
                event: event.name(),
            })
        }
    };
    Ok(next)
}

/// Keeps a monitoring session from ending without an explicit confirmation.
#[derive(Debug)]
pub struct SessionGuard {
    state: SessionState,
    pending: Option<Navigation>,
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending(&self) -> Option<&Navigation> {
        self.pending.as_ref()
    }

    /// Whether the host should show its own unload warning.
    pub fn is_armed(&self) -> bool {
        matches!(
            self.state,
            SessionState::Monitoring | SessionState::LeaveConfirmPending
        )
    }

    pub fn step(&mut self, event: GuardEvent) -> Result<GuardAction, GuardError> {
        let (next, decision) = transition(self.state, &event)?;
        if next != self.state {
            tracing::info!("Session {:?} -> {:?} on {}", self.state, next, event.name());
        }
        self.state = next;

        let action = match decision {
            Decision::None => GuardAction::None,
            Decision::Reject => GuardAction::Reject,
            Decision::Allow => match event {
                GuardEvent::NavigationAttempted(navigation) => GuardAction::Proceed(navigation),
                _ => GuardAction::None,
            },
            Decision::Hold => match event {
                GuardEvent::NavigationAttempted(navigation) => {
                    self.pending = Some(navigation.clone());
                    GuardAction::AwaitConfirmation(navigation)
                }
                _ => GuardAction::None,
            },
            Decision::Revert => match self.pending.take() {
                Some(navigation) => GuardAction::Revert(navigation),
                None => GuardAction::None,
            },
            Decision::Leave => match self.pending.take() {
                Some(navigation) => GuardAction::TeardownAndProceed(navigation),
                None => GuardAction::Teardown,
            },
            Decision::Abandon => match event {
                GuardEvent::NavigationAttempted(navigation) => {
                    GuardAction::TeardownAndProceed(navigation)
                }
                _ => GuardAction::Teardown,
            },
            Decision::Teardown => {
                self.pending = None;
                GuardAction::Teardown
            }
        };
        Ok(action)
    }
}

/// Asks the operator whether to leave a monitoring session.
pub trait LeaveConfirmation: Send + Sync {
    fn confirm_leave(&self, navigation: &Navigation) -> impl Future<Output = bool> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitoring() -> SessionGuard {
        let mut guard = SessionGuard::new();
        guard.step(GuardEvent::OpenRequested).unwrap();
        guard.step(GuardEvent::ChannelOpened).unwrap();
        guard
    }

    fn in_app(target: &str) -> Navigation {
        Navigation::InApp {
            target: target.into(),
        }
    }

    #[test]
    fn test_open_then_monitoring() {
        let guard = monitoring();
        assert_eq!(guard.state(), SessionState::Monitoring);
        assert!(guard.is_armed());
    }

    #[test]
    fn test_navigation_waits_for_confirmation() {
        let mut guard = monitoring();

        let action = guard
            .step(GuardEvent::NavigationAttempted(in_app("/about")))
            .unwrap();

        assert_eq!(action, GuardAction::AwaitConfirmation(in_app("/about")));
        assert_eq!(guard.state(), SessionState::LeaveConfirmPending);
        assert_eq!(guard.pending(), Some(&in_app("/about")));
    }

    #[test]
    fn test_declined_leave_returns_to_monitoring() {
        let mut guard = monitoring();
        guard
            .step(GuardEvent::NavigationAttempted(Navigation::Back))
            .unwrap();

        let action = guard.step(GuardEvent::LeaveDeclined).unwrap();

        assert_eq!(action, GuardAction::Revert(Navigation::Back));
        assert_eq!(guard.state(), SessionState::Monitoring);
        assert!(guard.pending().is_none());
    }

    #[test]
    fn test_confirmed_leave_tears_down() {
        let mut guard = monitoring();
        guard
            .step(GuardEvent::NavigationAttempted(in_app("/cats")))
            .unwrap();

        let action = guard.step(GuardEvent::LeaveConfirmed).unwrap();

        assert_eq!(action, GuardAction::TeardownAndProceed(in_app("/cats")));
        assert_eq!(guard.state(), SessionState::Closed);
        assert!(!guard.is_armed());
    }

    #[test]
    fn test_second_attempt_while_pending_is_rejected() {
        let mut guard = monitoring();
        guard
            .step(GuardEvent::NavigationAttempted(Navigation::Reload))
            .unwrap();

        let action = guard
            .step(GuardEvent::NavigationAttempted(in_app("/mypage")))
            .unwrap();

        assert_eq!(action, GuardAction::Reject);
        assert_eq!(guard.pending(), Some(&Navigation::Reload));
    }

    #[test]
    fn test_channel_loss_closes_from_any_live_state() {
        for setup in [
            vec![GuardEvent::OpenRequested],
            vec![GuardEvent::OpenRequested, GuardEvent::ChannelOpened],
            vec![
                GuardEvent::OpenRequested,
                GuardEvent::ChannelOpened,
                GuardEvent::NavigationAttempted(Navigation::Close),
            ],
        ] {
            let mut guard = SessionGuard::new();
            for event in setup {
                guard.step(event).unwrap();
            }

            assert_eq!(guard.step(GuardEvent::ChannelErrored).unwrap(), GuardAction::Teardown);
            assert_eq!(guard.state(), SessionState::Closed);
            assert_eq!(guard.step(GuardEvent::ChannelClosed).unwrap(), GuardAction::None);
        }
    }

    #[test]
    fn test_navigation_allowed_when_not_monitoring() {
        let mut guard = SessionGuard::new();
        assert_eq!(
            guard.step(GuardEvent::NavigationAttempted(Navigation::Forward)).unwrap(),
            GuardAction::Proceed(Navigation::Forward)
        );
        assert_eq!(guard.state(), SessionState::Idle);
    }

    #[test]
    fn test_navigation_while_connecting_abandons_session() {
        let mut guard = SessionGuard::new();
        guard.step(GuardEvent::OpenRequested).unwrap();

        let action = guard
            .step(GuardEvent::NavigationAttempted(in_app("/about")))
            .unwrap();

        assert_eq!(action, GuardAction::TeardownAndProceed(in_app("/about")));
        assert_eq!(guard.state(), SessionState::Closed);
        assert!(guard.pending().is_none());
        assert!(guard.step(GuardEvent::ChannelOpened).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut guard = SessionGuard::new();
        assert!(guard.step(GuardEvent::ChannelOpened).is_err());
        assert!(guard.step(GuardEvent::LeaveConfirmed).is_err());

        let mut guard = monitoring();
        assert_eq!(
            guard.step(GuardEvent::OpenRequested),
            Err(GuardError::InvalidTransition {
                state: SessionState::Monitoring,
                event: "open requested",
            })
        );
        assert_eq!(guard.state(), SessionState::Monitoring);
    }

    #[test]
    fn test_closed_session_can_reopen() {
        let mut guard = monitoring();
        guard.step(GuardEvent::ChannelClosed).unwrap();
        guard.step(GuardEvent::OpenRequested).unwrap();
        assert_eq!(guard.state(), SessionState::Connecting);
    }

    #[test]
    fn test_navigation_serde() {
        let navigation: Navigation =
            serde_json::from_str(r#"{"kind":"in_app","target":"/about"}"#).unwrap();
        assert_eq!(navigation, in_app("/about"));
        assert!(!navigation.is_host_level());
        assert!(Navigation::Reload.is_host_level());
    }
}
