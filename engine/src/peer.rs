// Copyright 2023 Oxide Computer Company
//! The link between the two SPs
//!
//! There is no queueing across an outage: while the link is down, sends
//! are dropped on the floor, and the two sides resynchronize with full
//! snapshots when it comes back.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sep_common::{
    ClusteredFlags, Lba, ObjectId, Position, RaidGroupInfo, VerifyType,
};
use tokio::sync::mpsc;

/// Requests a Passive SP hands to the Active one
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ForwardedOp {
    Quiesce(ObjectId),
    Unquiesce(ObjectId),
    InitiateVerify(ObjectId, VerifyType),
    InjectMediaError(ObjectId, Position, Lba),
}

impl ForwardedOp {
    pub fn object(&self) -> ObjectId {
        match self {
            ForwardedOp::Quiesce(o)
            | ForwardedOp::Unquiesce(o)
            | ForwardedOp::InitiateVerify(o, _)
            | ForwardedOp::InjectMediaError(o, _, _) => *o,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PeerMessage {
    /// The link just came up; reply with everything we own
    ResyncRequest,
    /// The system database changed, reload objects from it
    ConfigChanged,
    /// Full state of an object the sender is Active for
    Checkpoint(Box<RaidGroupInfo>),
    ClusteredFlags {
        object: ObjectId,
        flags: ClusteredFlags,
    },
    Forward(ForwardedOp),
}

#[derive(Debug)]
pub(crate) struct PeerLink {
    alive: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

impl PeerLink {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send `m` if the link is up; returns whether it went out
    pub fn send(&self, m: PeerMessage) -> bool {
        self.is_alive() && self.tx.send(m).is_ok()
    }
}

/// Build both ends of a link sharing one up/down flag
///
/// The first pair belongs to SPA, the second to SPB.
pub(crate) fn link_pair(
    alive: Arc<AtomicBool>,
) -> (
    (PeerLink, mpsc::UnboundedReceiver<PeerMessage>),
    (PeerLink, mpsc::UnboundedReceiver<PeerMessage>),
) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        (
            PeerLink {
                alive: alive.clone(),
                tx: a_tx,
            },
            a_rx,
        ),
        (PeerLink { alive, tx: b_tx }, b_rx),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn down_link_drops_messages() {
        let alive = Arc::new(AtomicBool::new(true));
        let ((a, mut a_rx), (b, mut b_rx)) = link_pair(alive.clone());

        assert!(a.send(PeerMessage::ConfigChanged));
        assert_eq!(b_rx.recv().await, Some(PeerMessage::ConfigChanged));

        alive.store(false, Ordering::Release);
        assert!(!b.is_alive());
        assert!(!b.send(PeerMessage::ResyncRequest));
        assert!(a_rx.try_recv().is_err());

        alive.store(true, Ordering::Release);
        let fwd = ForwardedOp::Quiesce(ObjectId(0x101));
        assert_eq!(fwd.object(), ObjectId(0x101));
        assert!(b.send(PeerMessage::Forward(fwd)));
        assert_eq!(a_rx.recv().await, Some(PeerMessage::Forward(fwd)));
    }
}
