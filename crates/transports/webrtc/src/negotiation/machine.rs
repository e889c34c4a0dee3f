//! Perfect-negotiation state machine
//!
//! Pure bookkeeping with no I/O: the negotiator applies an event only after
//! the matching peer-connection call succeeded, so the machine always
//! mirrors the peer's signaling state.
//!
//! ```text
//!            LocalOffer                 RemoteOffer
//!   Stable ─────────────▶ HaveLocalOffer    Stable ─────────────▶ HaveRemoteOffer
//!     ▲    RemoteAnswer /        │            ▲    LocalAnswer /         │
//!     └────── Rollback ──────────┘            └────── Rollback ──────────┘
//! ```

use crate::config::Role;
use crate::{Error, Result};

/// Offer/answer state of one negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No exchange outstanding (initial, and the end of every round)
    Stable,
    /// Local offer applied, waiting for the remote answer
    HaveLocalOffer,
    /// Remote offer applied, local answer pending
    HaveRemoteOffer,
}

/// Transitions of the negotiation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    LocalOffer,
    RemoteAnswer,
    RemoteOffer,
    LocalAnswer,
    Rollback,
}

/// Collision behaviour derived from the session role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Yields on collision: rolls back its own offer
    Polite,
    /// Wins on collision: ignores the colliding remote offer
    Impolite,
}

impl From<Role> for Politeness {
    fn from(role: Role) -> Self {
        if role.is_polite() {
            Politeness::Polite
        } else {
            Politeness::Impolite
        }
    }
}

/// What to do with an incoming remote offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// No collision, or a collision before anything was applied locally
    Accept,
    /// Polite side of a collision: undo the local description first
    RollbackThenAccept,
    /// Impolite side of a collision: drop the offer
    Ignore,
}

/// Synchronization flags of an outstanding negotiation round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
    /// A local offer is being created or applied
    pub making_offer: bool,
    /// The last remote offer was ignored (its candidates may fail)
    pub ignore_offer: bool,
    /// Local media tracks are attached to the connection
    pub tracks_added: bool,
}

/// Explicit perfect-negotiation state machine
#[derive(Debug, Clone)]
pub struct NegotiationStateMachine {
    state: NegotiationState,
    politeness: Politeness,
    flags: NegotiationFlags,
    /// Bumped whenever a remote offer is applied
    epoch: u64,
}

impl NegotiationStateMachine {
    pub fn new(politeness: Politeness) -> Self {
        Self {
            state: NegotiationState::Stable,
            politeness,
            flags: NegotiationFlags::default(),
            epoch: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    pub fn flags(&self) -> NegotiationFlags {
        self.flags
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Apply a transition; invalid transitions leave the state unchanged
    pub fn apply(&mut self, event: NegotiationEvent) -> Result<NegotiationState> {
        use NegotiationEvent::*;
        use NegotiationState::*;

        let next = match (self.state, event) {
            (Stable, LocalOffer) => HaveLocalOffer,
            (HaveLocalOffer, RemoteAnswer) => Stable,
            (Stable, RemoteOffer) => {
                self.epoch += 1;
                HaveRemoteOffer
            }
            (HaveRemoteOffer, LocalAnswer) => Stable,
            (HaveLocalOffer, Rollback) | (HaveRemoteOffer, Rollback) => Stable,
            (state, event) => {
                return Err(Error::InvalidTransition {
                    state: format!("{:?}", state),
                    event: format!("{:?}", event),
                })
            }
        };

        self.state = next;
        Ok(next)
    }

    /// Local negotiation in flight, or a description already outstanding
    pub fn is_collision(&self) -> bool {
        self.flags.making_offer || self.state != NegotiationState::Stable
    }

    /// Classify an incoming remote offer and record the ignore flag
    pub fn classify_remote_offer(&mut self) -> OfferDecision {
        let collision = self.is_collision();
        self.flags.ignore_offer = self.politeness == Politeness::Impolite && collision;

        if self.flags.ignore_offer {
            OfferDecision::Ignore
        } else if self.state != NegotiationState::Stable {
            OfferDecision::RollbackThenAccept
        } else {
            OfferDecision::Accept
        }
    }

    /// Answers are produced only after a remote offer was applied
    pub fn can_answer(&self) -> bool {
        self.state == NegotiationState::HaveRemoteOffer
    }

    /// Mark a local offer in flight; false if one already is
    pub fn begin_local_offer(&mut self) -> bool {
        if self.flags.making_offer {
            return false;
        }
        self.flags.making_offer = true;
        true
    }

    pub fn finish_local_offer(&mut self) {
        self.flags.making_offer = false;
    }

    pub fn mark_tracks_added(&mut self) {
        self.flags.tracks_added = true;
    }

    /// Back to the initial state, flags cleared
    pub fn reset(&mut self) {
        self.state = NegotiationState::Stable;
        self.flags = NegotiationFlags::default();
    }
}
