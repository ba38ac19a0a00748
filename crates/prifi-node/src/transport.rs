//! Message transport between role actors.
//!
//! Roles exchange [`Envelope`]s: a run id, both endpoints, the message kind
//! and the CBOR body. Sealing and opening go through the wire codec, so a
//! transport never sees typed messages and can be swapped for a network
//! implementation without touching the actors.
//!
//! # Ordering
//!
//! Implementations MUST deliver envelopes from one sender to one receiver
//! in the order they were sent. The relay relies on this: a trustee's
//! ciphers from an abandoned run always arrive before that trustee's key
//! for the next run.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Bytes, BytesMut};
use prifi_core::Peer;
use prifi_proto::{Message, MessageKind, WireError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of one protocol run.
pub type RunId = u64;

/// Transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the destination.
    #[error("no route to {peer} in run {run:#018x}")]
    UnknownPeer {
        /// Run of the envelope.
        run: RunId,
        /// Destination.
        peer: Peer,
    },

    /// The destination stopped receiving.
    #[error("{peer} in run {run:#018x} is gone")]
    Closed {
        /// Run of the envelope.
        run: RunId,
        /// Destination.
        peer: Peer,
    },
}

/// A sealed message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Run the message belongs to.
    pub run: RunId,
    /// Sender.
    pub from: Peer,
    /// Receiver.
    pub to: Peer,
    /// Message kind, sent alongside the body.
    pub kind: MessageKind,
    /// CBOR body.
    pub body: Bytes,
}

impl Envelope {
    /// Encode `message` for delivery.
    pub fn seal(run: RunId, from: Peer, to: Peer, message: &Message) -> Result<Self, WireError> {
        let mut body = BytesMut::new();
        message.encode(&mut body)?;
        Ok(Self { run, from, to, kind: message.kind(), body: body.freeze() })
    }

    /// Decode the carried message.
    pub fn open(&self) -> Result<Message, WireError> {
        Message::decode(self.kind, &self.body)
    }
}

/// Delivers envelopes to their destination.
pub trait Transport: Send + Sync + 'static {
    /// Queue an envelope for delivery. Never blocks.
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

type Routes = HashMap<(RunId, Peer), mpsc::UnboundedSender<Envelope>>;

/// In-process transport: one unbounded channel per registered endpoint.
#[derive(Clone, Default)]
pub struct LocalTransport {
    routes: Arc<Mutex<Routes>>,
}

impl LocalTransport {
    /// Transport with no endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return its inbox. Replaces any previous
    /// registration of the same endpoint.
    pub fn register(&self, run: RunId, peer: Peer) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes().insert((run, peer), tx);
        rx
    }

    /// Remove every endpoint of a run.
    pub fn unregister_run(&self, run: RunId) {
        self.routes().retain(|(route_run, _), _| *route_run != run);
    }

    /// Number of registered endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.routes().len()
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        // Routes stay consistent across a panicking holder: every operation
        // is a single map call.
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let (run, peer) = (envelope.run, envelope.to);
        let routes = self.routes();
        let route = routes.get(&(run, peer)).ok_or(TransportError::UnknownPeer { run, peer })?;
        route.send(envelope).map_err(|_| TransportError::Closed { run, peer })
    }
}

#[cfg(test)]
mod tests {
    use prifi_proto::UpstreamData;

    use super::*;

    fn upstream(round_id: i32) -> Message {
        Message::UpstreamData(UpstreamData { round_id, cipher: vec![0xAB; 8] })
    }

    #[test]
    fn envelope_seal_open() {
        let message = upstream(3);
        let envelope = Envelope::seal(1, Peer::Client(0), Peer::Relay, &message).unwrap();

        assert_eq!(envelope.kind, MessageKind::UpstreamData);
        assert_eq!(envelope.open().unwrap(), message);
    }

    #[test]
    fn delivers_in_order() {
        let transport = LocalTransport::new();
        let mut inbox = transport.register(9, Peer::Relay);

        for round in 0..3 {
            let envelope = Envelope::seal(9, Peer::Client(1), Peer::Relay, &upstream(round)).unwrap();
            transport.send(envelope).unwrap();
        }

        for round in 0..3 {
            let envelope = inbox.try_recv().unwrap();
            assert_eq!(envelope.open().unwrap(), upstream(round));
        }
    }

    #[test]
    fn runs_are_isolated() {
        let transport = LocalTransport::new();
        let _inbox = transport.register(1, Peer::Relay);

        let envelope = Envelope::seal(2, Peer::Client(0), Peer::Relay, &upstream(0)).unwrap();
        assert_eq!(
            transport.send(envelope),
            Err(TransportError::UnknownPeer { run: 2, peer: Peer::Relay })
        );
    }

    #[test]
    fn dropped_inbox_reports_closed() {
        let transport = LocalTransport::new();
        drop(transport.register(1, Peer::Trustee(0)));

        let envelope = Envelope::seal(1, Peer::Relay, Peer::Trustee(0), &upstream(0)).unwrap();
        assert!(matches!(transport.send(envelope), Err(TransportError::Closed { .. })));
    }

    #[test]
    fn unregister_removes_whole_run() {
        let transport = LocalTransport::new();
        let _a = transport.register(1, Peer::Relay);
        let _b = transport.register(1, Peer::Client(0));
        let _c = transport.register(2, Peer::Relay);

        transport.unregister_run(1);
        assert_eq!(transport.endpoint_count(), 1);
    }
}
