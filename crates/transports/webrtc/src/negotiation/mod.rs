//! Offer/answer negotiation
//!
//! - [`machine`]: pure state machine with collision rules
//! - [`queue`]: remote candidates held until the remote description lands
//! - [`negotiator`]: async driver over a [`PeerHandle`]

pub mod machine;
pub mod negotiator;
pub mod queue;

pub use machine::{
    NegotiationEvent, NegotiationFlags, NegotiationState, NegotiationStateMachine, OfferDecision,
    Politeness,
};
pub use negotiator::{Negotiator, PeerHandle};
pub use queue::{CandidateAction, IceCandidateQueue};
