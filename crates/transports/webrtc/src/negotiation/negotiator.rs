//! Perfect-negotiation driver
//!
//! Runs the offer/answer exchange for one peer connection. All description
//! changes happen under one async lock so a remote offer can never interleave
//! with a half-applied local one; outbound messages are sent after the lock is
//! released.

use super::machine::{
    NegotiationEvent, NegotiationFlags, NegotiationState, NegotiationStateMachine, OfferDecision,
    Politeness,
};
use super::queue::{CandidateAction, IceCandidateQueue};
use crate::signaling::{IceCandidate, SessionDescription, SignalingMessage, SignalingSink};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Description and candidate operations of a peer connection
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard the outstanding description and return to stable
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
}

struct NegotiationInner {
    machine: NegotiationStateMachine,
    candidates: IceCandidateQueue,
    /// Local offer applied and sent, until answered or rolled back
    pending_offer: Option<SessionDescription>,
}

/// Offer/answer driver for one peer connection
pub struct Negotiator<P: PeerHandle> {
    peer: Arc<P>,
    sink: Arc<dyn SignalingSink>,
    inner: Mutex<NegotiationInner>,
}

impl<P: PeerHandle> Negotiator<P> {
    pub fn new(peer: Arc<P>, sink: Arc<dyn SignalingSink>, politeness: Politeness) -> Self {
        Self {
            peer,
            sink,
            inner: Mutex::new(NegotiationInner {
                machine: NegotiationStateMachine::new(politeness),
                candidates: IceCandidateQueue::new(),
                pending_offer: None,
            }),
        }
    }

    pub fn peer(&self) -> &Arc<P> {
        &self.peer
    }

    /// Create, apply and send a local offer
    ///
    /// Returns `Ok(false)` when no offer went out: an exchange was already
    /// outstanding, or a remote offer was accepted while this one was created.
    pub async fn negotiate(&self) -> Result<bool> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.machine.state() != NegotiationState::Stable {
                debug!(
                    "Exchange outstanding in state {:?}, skipping negotiation",
                    inner.machine.state()
                );
                return Ok(false);
            }
            if !inner.machine.begin_local_offer() {
                debug!("Offer already in flight, skipping negotiation");
                return Ok(false);
            }
            inner.machine.epoch()
        };

        let result = self.make_offer(epoch).await;

        self.inner.lock().await.machine.finish_local_offer();
        result
    }

    async fn make_offer(&self, epoch: u64) -> Result<bool> {
        let offer = self.peer.create_offer().await?;

        let mut inner = self.inner.lock().await;
        if inner.machine.epoch() != epoch {
            info!(
                "Remote offer accepted while creating ours, dropping local offer (state {:?})",
                inner.machine.state()
            );
            return Ok(false);
        }
        if inner.machine.state() != NegotiationState::Stable {
            debug!(
                "Exchange started while creating offer, dropping local offer (state {:?})",
                inner.machine.state()
            );
            return Ok(false);
        }

        self.peer.set_local_description(offer.clone()).await?;
        inner.machine.apply(NegotiationEvent::LocalOffer)?;
        inner.pending_offer = Some(offer.clone());
        drop(inner);

        info!("Sending offer ({} bytes)", offer.sdp.len());
        self.sink.send(SignalingMessage::Offer(offer));
        Ok(true)
    }

    /// Send the outstanding local offer again
    ///
    /// An offer sent while the remote participant was absent never reached
    /// it; the relay does not store messages. Returns false when no local
    /// offer is outstanding.
    pub async fn resend_offer(&self) -> bool {
        let inner = self.inner.lock().await;
        let offer = match (&inner.pending_offer, inner.machine.state()) {
            (Some(offer), NegotiationState::HaveLocalOffer) => offer.clone(),
            _ => return false,
        };
        drop(inner);

        info!("Re-sending outstanding offer ({} bytes)", offer.sdp.len());
        self.sink.send(SignalingMessage::Offer(offer));
        true
    }

    /// Handle a remote offer, answering unless it lost a collision
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<OfferDecision> {
        let mut inner = self.inner.lock().await;

        let decision = inner.machine.classify_remote_offer();
        match decision {
            OfferDecision::Ignore => {
                info!(
                    "Offer collision, keeping local offer and ignoring remote (state {:?})",
                    inner.machine.state()
                );
                return Ok(decision);
            }
            OfferDecision::RollbackThenAccept => {
                info!(
                    "Offer collision, rolling back local description (state {:?})",
                    inner.machine.state()
                );
                self.peer.rollback().await?;
                inner.machine.apply(NegotiationEvent::Rollback)?;
                inner.pending_offer = None;
            }
            OfferDecision::Accept => {}
        }

        self.peer.set_remote_description(offer).await?;
        inner.machine.apply(NegotiationEvent::RemoteOffer)?;
        self.apply_queued(&mut inner).await;

        if !inner.machine.can_answer() {
            warn!("Not answering in state {:?}", inner.machine.state());
            return Ok(decision);
        }

        let answer = match self.make_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                // Back to stable so the next offer from the remote is accepted
                if let Err(rollback_err) = self.peer.rollback().await {
                    debug!("Rollback after failed answer: {}", rollback_err);
                }
                inner.machine.apply(NegotiationEvent::Rollback)?;
                return Err(e);
            }
        };
        inner.machine.apply(NegotiationEvent::LocalAnswer)?;
        drop(inner);

        info!("Sending answer ({} bytes)", answer.sdp.len());
        self.sink.send(SignalingMessage::Answer(answer));
        Ok(decision)
    }

    async fn make_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply a remote answer; a no-op unless a local offer is outstanding
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        if inner.machine.state() != NegotiationState::HaveLocalOffer {
            warn!(
                "Ignoring answer received in state {:?}",
                inner.machine.state()
            );
            return Ok(false);
        }

        self.peer.set_remote_description(answer).await?;
        inner.machine.apply(NegotiationEvent::RemoteAnswer)?;
        inner.pending_offer = None;
        self.apply_queued(&mut inner).await;

        debug!("Remote answer applied");
        Ok(true)
    }

    /// Queue or apply a remote candidate
    ///
    /// Failures are logged, never returned.
    pub async fn handle_candidate(&self, candidate: IceCandidate) {
        let mut inner = self.inner.lock().await;

        match inner.candidates.push(candidate) {
            CandidateAction::Deferred => {
                debug!(
                    "Queued ICE candidate until remote description ({} pending)",
                    inner.candidates.len()
                );
            }
            CandidateAction::ApplyNow(candidate) => {
                self.add_candidate(&inner, candidate).await;
            }
        }
    }

    async fn apply_queued(&self, inner: &mut MutexGuard<'_, NegotiationInner>) {
        let queued = inner.candidates.drain_ready();
        if queued.is_empty() {
            return;
        }

        debug!("Applying {} queued ICE candidates", queued.len());
        for candidate in queued {
            self.add_candidate(inner, candidate).await;
        }
    }

    async fn add_candidate(&self, inner: &NegotiationInner, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            if inner.machine.flags().ignore_offer {
                debug!("Dropped candidate of ignored offer: {}", e);
            } else {
                warn!("Failed to add ICE candidate: {}", e);
            }
        }
    }

    pub async fn mark_tracks_added(&self) {
        self.inner.lock().await.machine.mark_tracks_added();
    }

    pub async fn tracks_added(&self) -> bool {
        self.inner.lock().await.machine.flags().tracks_added
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.machine.state()
    }

    pub async fn flags(&self) -> NegotiationFlags {
        self.inner.lock().await.machine.flags()
    }

    pub async fn queued_candidates(&self) -> usize {
        self.inner.lock().await.candidates.len()
    }

    /// Forget the current round and any queued candidates
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.machine.reset();
        inner.candidates = IceCandidateQueue::new();
        inner.pending_offer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockPeer {
        label: &'static str,
        ops: std::sync::Mutex<Vec<String>>,
        counter: AtomicUsize,
        reject_candidates: AtomicBool,
        fail_answer: AtomicBool,
        gate: Option<(Notify, Notify)>,
    }

    impl MockPeer {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                ..Default::default()
            })
        }

        fn gated(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                gate: Some((Notify::new(), Notify::new())),
                ..Default::default()
            })
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn next_sdp(&self, kind: &str) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            format!("{}-{}-{}", self.label, kind, n)
        }
    }

    #[async_trait]
    impl PeerHandle for MockPeer {
        async fn create_offer(&self) -> Result<SessionDescription> {
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(SessionDescription::offer(self.next_sdp("offer")))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            if self.fail_answer.load(Ordering::SeqCst) {
                return Err(Error::SdpError("no codecs in common".to_string()));
            }
            Ok(SessionDescription::answer(self.next_sdp("answer")))
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
            self.record(format!("local:{}", description.sdp));
            Ok(())
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
            self.record(format!("remote:{}", description.sdp));
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.record("rollback".to_string());
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if self.reject_candidates.load(Ordering::SeqCst) {
                return Err(Error::IceCandidateError("unknown ufrag".to_string()));
            }
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<SignalingMessage>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<SignalingMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl SignalingSink for RecordingSink {
        fn send(&self, message: SignalingMessage) {
            self.sent.lock().unwrap().push(message);
        }
    }

    fn negotiator(
        peer: Arc<MockPeer>,
        politeness: Politeness,
    ) -> (Arc<Negotiator<MockPeer>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let negotiator = Arc::new(Negotiator::new(peer, sink.clone(), politeness));
        (negotiator, sink)
    }

    #[tokio::test]
    async fn test_offer_then_answer() {
        let peer = MockPeer::new("host");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Impolite);

        assert!(negotiator.negotiate().await.unwrap());
        assert_eq!(negotiator.state().await, NegotiationState::HaveLocalOffer);
        assert!(!negotiator.flags().await.making_offer);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], SignalingMessage::Offer(o) if o.sdp == "host-offer-0"));

        assert!(negotiator
            .handle_answer(SessionDescription::answer("remote-answer"))
            .await
            .unwrap());
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
        assert_eq!(peer.ops(), vec!["local:host-offer-0", "remote:remote-answer"]);
    }

    #[tokio::test]
    async fn test_answer_in_stable_is_ignored() {
        let peer = MockPeer::new("host");
        let (negotiator, _sink) = negotiator(peer.clone(), Politeness::Impolite);

        let applied = negotiator
            .handle_answer(SessionDescription::answer("stray"))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
        assert!(peer.ops().is_empty());
    }

    #[tokio::test]
    async fn test_remote_offer_is_answered() {
        let peer = MockPeer::new("guest");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Polite);

        let decision = negotiator
            .handle_offer(SessionDescription::offer("host-offer"))
            .await
            .unwrap();
        assert_eq!(decision, OfferDecision::Accept);
        assert_eq!(negotiator.state().await, NegotiationState::Stable);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], SignalingMessage::Answer(a) if a.sdp == "guest-answer-0"));
        assert_eq!(peer.ops(), vec!["remote:host-offer", "local:guest-answer-0"]);
    }

    #[tokio::test]
    async fn test_impolite_ignores_colliding_offer() {
        let peer = MockPeer::new("host");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Impolite);

        negotiator.negotiate().await.unwrap();
        sink.take();

        let decision = negotiator
            .handle_offer(SessionDescription::offer("guest-offer"))
            .await
            .unwrap();
        assert_eq!(decision, OfferDecision::Ignore);
        assert!(negotiator.flags().await.ignore_offer);
        assert_eq!(negotiator.state().await, NegotiationState::HaveLocalOffer);
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_polite_rolls_back_and_answers() {
        let peer = MockPeer::new("guest");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Polite);

        negotiator.negotiate().await.unwrap();
        sink.take();

        let decision = negotiator
            .handle_offer(SessionDescription::offer("host-offer"))
            .await
            .unwrap();
        assert_eq!(decision, OfferDecision::RollbackThenAccept);
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
        assert_eq!(
            peer.ops(),
            vec![
                "local:guest-offer-0",
                "rollback",
                "remote:host-offer",
                "local:guest-answer-1"
            ]
        );

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalingMessage::Answer(_)));
    }

    #[tokio::test]
    async fn test_glare_produces_exactly_one_answer() {
        let host_peer = MockPeer::new("host");
        let guest_peer = MockPeer::new("guest");
        let (host, host_out) = negotiator(host_peer, Politeness::Impolite);
        let (guest, guest_out) = negotiator(guest_peer, Politeness::Polite);

        // Both sides start negotiating at the same moment
        host.negotiate().await.unwrap();
        guest.negotiate().await.unwrap();

        let mut answers = 0;
        let mut to_host = guest_out.take();
        let mut to_guest = host_out.take();

        while !to_host.is_empty() || !to_guest.is_empty() {
            for msg in to_guest.drain(..) {
                match msg {
                    SignalingMessage::Offer(o) => {
                        guest.handle_offer(o).await.unwrap();
                    }
                    SignalingMessage::Answer(a) => {
                        guest.handle_answer(a).await.unwrap();
                    }
                    _ => {}
                }
            }
            for msg in to_host.drain(..) {
                match msg {
                    SignalingMessage::Offer(o) => {
                        host.handle_offer(o).await.unwrap();
                    }
                    SignalingMessage::Answer(a) => {
                        host.handle_answer(a).await.unwrap();
                    }
                    _ => {}
                }
            }

            let from_guest = guest_out.take();
            let from_host = host_out.take();
            answers += from_guest
                .iter()
                .chain(from_host.iter())
                .filter(|m| matches!(m, SignalingMessage::Answer(_)))
                .count();
            to_host = from_guest;
            to_guest = from_host;
        }

        assert_eq!(answers, 1);
        assert_eq!(host.state().await, NegotiationState::Stable);
        assert_eq!(guest.state().await, NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_offer_discarded_when_remote_offer_wins_meanwhile() {
        let peer = MockPeer::gated("guest");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Polite);

        let pending = tokio::spawn({
            let negotiator = negotiator.clone();
            async move { negotiator.negotiate().await }
        });

        let (entered, release) = peer.gate.as_ref().unwrap();
        entered.notified().await;

        let decision = negotiator
            .handle_offer(SessionDescription::offer("host-offer"))
            .await
            .unwrap();
        assert_eq!(decision, OfferDecision::Accept);

        release.notify_one();
        assert!(!pending.await.unwrap().unwrap());

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalingMessage::Answer(_)));
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
        assert!(!negotiator.flags().await.making_offer);
    }

    #[tokio::test]
    async fn test_second_negotiate_while_in_flight_is_skipped() {
        let peer = MockPeer::gated("host");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Impolite);

        let first = tokio::spawn({
            let negotiator = negotiator.clone();
            async move { negotiator.negotiate().await }
        });

        let (entered, release) = peer.gate.as_ref().unwrap();
        entered.notified().await;

        assert!(!negotiator.negotiate().await.unwrap());

        release.notify_one();
        assert!(first.await.unwrap().unwrap());
        assert_eq!(sink.take().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_answer_returns_to_stable() {
        let peer = MockPeer::new("guest");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Polite);

        peer.fail_answer.store(true, Ordering::SeqCst);
        let err = negotiator
            .handle_offer(SessionDescription::offer("host-offer-0"))
            .await
            .unwrap_err();
        assert!(err.is_negotiation_error());
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
        assert!(sink.take().is_empty());

        // The next offer from the remote is answered normally
        peer.fail_answer.store(false, Ordering::SeqCst);
        let decision = negotiator
            .handle_offer(SessionDescription::offer("host-offer-1"))
            .await
            .unwrap();
        assert_eq!(decision, OfferDecision::Accept);
        assert_eq!(negotiator.state().await, NegotiationState::Stable);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalingMessage::Answer(_)));
        assert_eq!(
            peer.ops(),
            vec![
                "remote:host-offer-0",
                "rollback",
                "remote:host-offer-1",
                "local:guest-answer-0"
            ]
        );
    }

    #[tokio::test]
    async fn test_outstanding_offer_is_resent() {
        let peer = MockPeer::new("guest");
        let (negotiator, sink) = negotiator(peer.clone(), Politeness::Polite);

        assert!(!negotiator.resend_offer().await);

        // First offer goes out while nobody else is in the room
        assert!(negotiator.negotiate().await.unwrap());
        let first = sink.take();
        assert_eq!(first.len(), 1);

        // A fresh negotiation does not replace the outstanding offer
        assert!(!negotiator.negotiate().await.unwrap());
        assert!(sink.take().is_empty());

        assert!(negotiator.resend_offer().await);
        let resent = sink.take();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0], first[0]);
        assert_eq!(negotiator.state().await, NegotiationState::HaveLocalOffer);

        negotiator
            .handle_answer(SessionDescription::answer("host-answer"))
            .await
            .unwrap();
        assert!(!negotiator.resend_offer().await);
        assert_eq!(peer.ops(), vec!["local:guest-offer-0", "remote:host-answer"]);
    }

    #[tokio::test]
    async fn test_candidates_queued_until_remote_description() {
        let peer = MockPeer::new("guest");
        let (negotiator, _sink) = negotiator(peer.clone(), Politeness::Polite);

        negotiator.handle_candidate(IceCandidate::new("c1")).await;
        negotiator.handle_candidate(IceCandidate::new("c2")).await;
        assert_eq!(negotiator.queued_candidates().await, 2);
        assert!(peer.ops().is_empty());

        negotiator
            .handle_offer(SessionDescription::offer("host-offer"))
            .await
            .unwrap();
        assert_eq!(negotiator.queued_candidates().await, 0);

        negotiator.handle_candidate(IceCandidate::new("c3")).await;

        assert_eq!(
            peer.ops(),
            vec![
                "remote:host-offer",
                "candidate:c1",
                "candidate:c2",
                "local:guest-answer-0",
                "candidate:c3"
            ]
        );
    }

    #[tokio::test]
    async fn test_candidate_errors_are_swallowed() {
        let peer = MockPeer::new("host");
        let (negotiator, _sink) = negotiator(peer.clone(), Politeness::Impolite);

        negotiator.negotiate().await.unwrap();
        negotiator
            .handle_answer(SessionDescription::answer("guest-answer"))
            .await
            .unwrap();

        peer.reject_candidates.store(true, Ordering::SeqCst);
        negotiator.handle_candidate(IceCandidate::new("bad")).await;
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_tracks_flag_and_reset() {
        let peer = MockPeer::new("host");
        let (negotiator, _sink) = negotiator(peer, Politeness::Impolite);

        assert!(!negotiator.tracks_added().await);
        negotiator.mark_tracks_added().await;
        assert!(negotiator.tracks_added().await);

        negotiator.negotiate().await.unwrap();
        negotiator.handle_candidate(IceCandidate::new("c1")).await;
        negotiator.reset().await;

        assert!(!negotiator.tracks_added().await);
        assert_eq!(negotiator.state().await, NegotiationState::Stable);
        assert_eq!(negotiator.queued_candidates().await, 0);
    }
}
