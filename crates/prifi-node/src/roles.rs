//! Role actors.
//!
//! Each role instance runs as one tokio task that owns its state machine and
//! drains two inboxes: envelopes from the transport and local commands. A
//! handler always runs to completion before the next input is taken, so the
//! state machines never see concurrent access.
//!
//! A trustee's cipher stream is a separate ticker task. It reads the stream
//! rate from a `watch` slot (a newer rate overwrites an unread one) and posts
//! [`TrusteeEvent::ProduceCipher`] into the trustee's command inbox, which
//! keeps cipher production serialized with message handling.

use std::{collections::HashMap, sync::Arc};

use prifi_core::{
    CipherRate, Client, ClientAction, ClientEvent, Environment, Peer, ProtocolError, Relay,
    RelayAction, RelayEvent, Trustee, TrusteeAction, TrusteeEvent,
};
use prifi_proto::Message;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::{
    arena::RunOutput,
    config::NodeConfig,
    error::NodeError,
    transport::{Envelope, RunId, Transport},
};

/// Shared rate slot of one trustee's cipher stream.
pub(crate) type RateControl = Arc<watch::Sender<CipherRate>>;

/// What an actor needs to talk to the rest of its run.
#[derive(Clone)]
pub(crate) struct Link {
    run: RunId,
    me: Peer,
    transport: Arc<dyn Transport>,
    outputs: mpsc::UnboundedSender<RunOutput>,
}

impl Link {
    pub(crate) fn new(
        run: RunId,
        me: Peer,
        transport: Arc<dyn Transport>,
        outputs: mpsc::UnboundedSender<RunOutput>,
    ) -> Self {
        Self { run, me, transport, outputs }
    }

    fn send(&self, to: Peer, message: &Message) {
        let sent = Envelope::seal(self.run, self.me, to, message)
            .map_err(NodeError::from)
            .and_then(|envelope| self.transport.send(envelope).map_err(NodeError::from));
        if let Err(err) = sent {
            warn!(run = self.run, from = %self.me, %to, %err, "send failed");
        }
    }

    fn open(&self, envelope: &Envelope) -> Option<Message> {
        match envelope.open() {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(
                    run = self.run,
                    peer = %self.me,
                    from = %envelope.from,
                    %err,
                    "undecodable envelope"
                );
                None
            },
        }
    }

    fn output(&self, output: RunOutput) {
        // Nobody listening is fine: outputs are informational.
        let _ = self.outputs.send(output);
    }

    /// Log a handler error. Returns `true` if the actor must halt.
    fn report(&self, err: ProtocolError) -> bool {
        if err.is_fatal() {
            error!(run = self.run, peer = %self.me, %err, "fatal protocol error, halting");
            self.output(RunOutput::Halted { peer: self.me, error: err });
            true
        } else {
            debug!(run = self.run, peer = %self.me, %err, "message dropped");
            false
        }
    }
}

pub(crate) async fn relay_task(
    mut relay: Relay,
    link: Link,
    mut network: mpsc::UnboundedReceiver<Envelope>,
    mut commands: mpsc::UnboundedReceiver<RelayEvent>,
    rates: HashMap<u32, RateControl>,
) {
    loop {
        let event = tokio::select! {
            Some(envelope) = network.recv() => link
                .open(&envelope)
                .map(|message| RelayEvent::Message { from: envelope.from, message }),
            Some(event) = commands.recv() => Some(event),
            else => break,
        };
        let Some(event) = event else { continue };

        let actions = match relay.handle(event) {
            Ok(actions) => actions,
            Err(err) => {
                if link.report(err) {
                    break;
                }
                continue;
            },
        };

        for action in actions {
            match action {
                RelayAction::Send { to, message } => link.send(to, &message),
                RelayAction::DeliverUpstream { round, data } => {
                    link.output(RunOutput::Upstream { round, data });
                },
                RelayAction::LatencyProbe { round, .. } => {
                    debug!(run = link.run, round, "latency probe echoed");
                },
                RelayAction::SetTrusteeRate { trustee_id, rate } => {
                    if let Some(control) = rates.get(&trustee_id) {
                        control.send_replace(rate);
                    }
                },
                RelayAction::Finished { rounds } => {
                    for control in rates.values() {
                        control.send_replace(CipherRate::Kill);
                    }
                    link.output(RunOutput::Finished { rounds });
                },
            }
        }
    }

    for control in rates.values() {
        control.send_replace(CipherRate::Kill);
    }
}

pub(crate) async fn client_task<E: Environment>(
    mut client: Client<E>,
    link: Link,
    mut network: mpsc::UnboundedReceiver<Envelope>,
    mut commands: mpsc::UnboundedReceiver<ClientEvent>,
) {
    loop {
        let event = tokio::select! {
            Some(envelope) = network.recv() => link.open(&envelope).map(ClientEvent::Message),
            Some(event) = commands.recv() => Some(event),
            else => break,
        };
        let Some(event) = event else { continue };

        let actions = match client.handle(event) {
            Ok(actions) => actions,
            Err(err) => {
                if link.report(err) {
                    break;
                }
                continue;
            },
        };

        let client_id = client.id();
        for action in actions {
            match action {
                ClientAction::Send { message } => link.send(Peer::Relay, &message),
                ClientAction::Deliver { round, data } => {
                    link.output(RunOutput::Downstream { client_id, round, data });
                },
                ClientAction::LatencyMeasured { millis } => {
                    link.output(RunOutput::Latency { client_id, millis });
                },
                ClientAction::SlotFallback { slot } => {
                    warn!(run = link.run, client_id, slot, "client is not anonymous in this run");
                },
            }
        }
    }
}

pub(crate) async fn trustee_task<E: Environment>(
    mut trustee: Trustee<E>,
    link: Link,
    mut network: mpsc::UnboundedReceiver<Envelope>,
    mut ticks: mpsc::UnboundedReceiver<TrusteeEvent>,
    rate: RateControl,
) {
    loop {
        let event = tokio::select! {
            Some(envelope) = network.recv() => link.open(&envelope).map(TrusteeEvent::Message),
            Some(event) = ticks.recv() => Some(event),
            else => break,
        };
        let Some(event) = event else { continue };

        let actions = match trustee.handle(event) {
            Ok(actions) => actions,
            Err(err) => {
                if link.report(err) {
                    break;
                }
                continue;
            },
        };

        for action in actions {
            match action {
                TrusteeAction::Send { message } => link.send(Peer::Relay, &message),
                TrusteeAction::StartCipherStream => {
                    rate.send_replace(CipherRate::Full);
                },
                TrusteeAction::StopCipherStream => {
                    rate.send_replace(CipherRate::Stopped);
                },
            }
        }
    }

    rate.send_replace(CipherRate::Kill);
}

/// Post cipher ticks at the pace set in `rate` until it reads
/// [`CipherRate::Kill`] or the trustee goes away.
pub(crate) async fn cipher_ticker<E: Environment>(
    env: E,
    config: NodeConfig,
    mut rate: watch::Receiver<CipherRate>,
    ticks: mpsc::UnboundedSender<TrusteeEvent>,
) {
    loop {
        let current = *rate.borrow_and_update();
        if current == CipherRate::Kill {
            break;
        }

        let Some(interval) = config.interval(current) else {
            if rate.changed().await.is_err() {
                break;
            }
            continue;
        };

        if ticks.send(TrusteeEvent::ProduceCipher).is_err() {
            break;
        }

        let alive = tokio::select! {
            () = env.sleep(interval) => true,
            changed = rate.changed() => changed.is_ok(),
        };
        if !alive {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::SystemEnv;

    fn fast() -> NodeConfig {
        NodeConfig {
            full_rate_interval: Duration::from_millis(1),
            half_rate_interval: Duration::from_millis(2),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn stopped_ticker_is_silent_until_started() {
        let (control, rate) = watch::channel(CipherRate::Stopped);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = tokio::spawn(cipher_ticker(SystemEnv::new(), fast(), rate, tx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        control.send_replace(CipherRate::Full);
        let tick = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(tick, Some(TrusteeEvent::ProduceCipher));

        control.send_replace(CipherRate::Kill);
        tokio::time::timeout(Duration::from_secs(1), ticker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ticker_ends_when_control_dropped() {
        let (control, rate) = watch::channel(CipherRate::Stopped);
        let (tx, _rx) = mpsc::unbounded_channel();
        let ticker = tokio::spawn(cipher_ticker(SystemEnv::new(), fast(), rate, tx));

        drop(control);
        tokio::time::timeout(Duration::from_secs(1), ticker).await.unwrap().unwrap();
    }
}
