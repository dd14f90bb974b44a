//! Session state table
//!
//! Which actions each session state accepts and what the session does with
//! them. The table is a pure function so it can be tested on its own; the
//! session carries out the returned [`Directive`].

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCondition;
use crate::types::JingleAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing sent or received yet
    Unknown,
    /// Initiator: `session-initiate` sent, not yet acknowledged
    Inviting,
    /// Responder: request accepted, `session-initiate` not yet processed
    Accepting,
    /// Negotiation in progress
    Pending,
    Active,
    Ended,
}

impl SessionState {
    pub fn is_ended(&self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unknown => write!(f, "Unknown"),
            SessionState::Inviting => write!(f, "Inviting"),
            SessionState::Accepting => write!(f, "Accepting"),
            SessionState::Pending => write!(f, "Pending"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Ended => write!(f, "Ended"),
        }
    }
}

/// What the session must do with an inbound action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Acknowledge and tear the session down
    AckAndTerminate,
    /// Validate the offer, build one content per block and start negotiating
    BuildContents,
    /// Check the peer's accept against our selections
    VerifyAccept,
    /// Acknowledge and hand the action to the contents
    Delegate,
    /// Answer with an error; negotiation state is left alone
    Reject(ErrorCondition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State to enter; `None` keeps the current one
    pub next: Option<SessionState>,
    pub directive: Directive,
}

impl Transition {
    fn stay(directive: Directive) -> Self {
        Self { next: None, directive }
    }

    fn to(next: SessionState, directive: Directive) -> Self {
        Self {
            next: Some(next),
            directive,
        }
    }
}

/// Look up the transition for `action` in `state`.
pub fn transition(state: SessionState, action: JingleAction) -> Transition {
    use Directive::*;
    use JingleAction::*;
    use SessionState::*;

    match (state, action) {
        (Ended, _) => Transition::stay(Reject(ErrorCondition::MalformedStanza)),
        (_, SessionTerminate) => Transition::to(Ended, AckAndTerminate),

        (Unknown | Accepting, SessionInitiate) => Transition::to(Pending, BuildContents),
        (Unknown | Accepting, _) => Transition::stay(Reject(ErrorCondition::MalformedStanza)),

        (Inviting | Pending, SessionAccept) => Transition::to(Active, VerifyAccept),
        (Inviting | Pending, SessionInitiate) => Transition::stay(Reject(ErrorCondition::OutOfOrder)),
        (Inviting | Pending, _) => Transition::stay(Delegate),

        (Active, ContentAdd | ContentModify | ContentRemove | SessionInfo | TransportInfo) => {
            Transition::stay(Delegate)
        }
        (Active, _) => Transition::stay(Reject(ErrorCondition::OutOfOrder)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL_ACTIONS: [JingleAction; 9] = [
        JingleAction::ContentAccept,
        JingleAction::ContentAdd,
        JingleAction::ContentModify,
        JingleAction::ContentRemove,
        JingleAction::SessionAccept,
        JingleAction::SessionInfo,
        JingleAction::SessionInitiate,
        JingleAction::SessionTerminate,
        JingleAction::TransportInfo,
    ];

    #[test]
    fn ended_is_absorbing() {
        for action in ALL_ACTIONS {
            let t = transition(SessionState::Ended, action);
            assert_eq!(t.next, None);
            assert_eq!(t.directive, Directive::Reject(ErrorCondition::MalformedStanza));
        }
    }

    #[test]
    fn terminate_ends_every_live_state() {
        for state in [
            SessionState::Unknown,
            SessionState::Inviting,
            SessionState::Accepting,
            SessionState::Pending,
            SessionState::Active,
        ] {
            let t = transition(state, JingleAction::SessionTerminate);
            assert_eq!(t.next, Some(SessionState::Ended));
            assert_eq!(t.directive, Directive::AckAndTerminate);
        }
    }

    #[test]
    fn unknown_only_accepts_initiate() {
        assert_eq!(
            transition(SessionState::Unknown, JingleAction::SessionInitiate),
            Transition::to(SessionState::Pending, Directive::BuildContents)
        );
        assert_eq!(
            transition(SessionState::Unknown, JingleAction::TransportInfo).directive,
            Directive::Reject(ErrorCondition::MalformedStanza)
        );
        assert_eq!(
            transition(SessionState::Accepting, JingleAction::SessionInitiate).next,
            Some(SessionState::Pending)
        );
    }

    #[test]
    fn pending_delegates_negotiation() {
        assert_eq!(
            transition(SessionState::Pending, JingleAction::ContentAccept).directive,
            Directive::Delegate
        );
        assert_eq!(
            transition(SessionState::Pending, JingleAction::SessionAccept),
            Transition::to(SessionState::Active, Directive::VerifyAccept)
        );
        assert_eq!(
            transition(SessionState::Pending, JingleAction::SessionInitiate).directive,
            Directive::Reject(ErrorCondition::OutOfOrder)
        );
    }

    #[test]
    fn active_rejects_negotiation_actions() {
        assert_eq!(
            transition(SessionState::Active, JingleAction::TransportInfo).directive,
            Directive::Delegate
        );
        assert_eq!(
            transition(SessionState::Active, JingleAction::SessionInfo).directive,
            Directive::Delegate
        );
        for action in [
            JingleAction::SessionInitiate,
            JingleAction::SessionAccept,
            JingleAction::ContentAccept,
        ] {
            assert_eq!(
                transition(SessionState::Active, action).directive,
                Directive::Reject(ErrorCondition::OutOfOrder)
            );
        }
    }
}
