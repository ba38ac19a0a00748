//! Deterministic in-memory run of every role.
//!
//! [`SimNetwork`] owns one relay, its clients and its trustees, and moves
//! messages between them through a single FIFO queue. Every message is
//! encoded and decoded with the wire codec on the way, so the simulation
//! exercises exactly what a networked run would exchange.
//!
//! Trustee cipher streams are modeled as ticks: [`SimNetwork::tick`] makes
//! every streaming trustee produce according to its current rate. The
//! default scheduler ticks only when no message is in flight, which keeps
//! trustees roughly in step with the relay; tests that need trustees to run
//! ahead call [`SimNetwork::tick`] directly.
//!
//! Given the same seed and the same sequence of calls, two networks produce
//! identical keys, shuffles, message logs and outputs.

use std::{
    collections::{BTreeSet, VecDeque},
    time::Duration,
};

use prifi_core::{
    CipherRate, Client, ClientAction, ClientEvent, Peer, ProtocolError, Relay, RelayAction,
    RelayEvent, Trustee, TrusteeAction, TrusteeEvent,
};
use prifi_proto::{Message, MessageKind, ProtocolParams, Round};
use tracing::{debug, warn};

use crate::{
    invariants::{ClientSnapshot, RunSnapshot},
    sim_env::SimEnv,
};

/// Network misbehavior injected into a simulation. Each fault fires once,
/// on the first message it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Flip a byte of the first shuffle proof in the transcript delivered to
    /// this trustee.
    TamperTranscript {
        /// Receiving trustee.
        trustee_id: u32,
    },
    /// Flip a byte of this trustee's signature in the final shuffle
    /// delivered to this client.
    ForgeSignature {
        /// Receiving client.
        client_id: u32,
        /// Trustee whose signature is forged.
        trustee_id: u32,
    },
    /// Silently drop the next message of this kind from this sender.
    Drop {
        /// Sender.
        from: Peer,
        /// Kind to drop.
        kind: MessageKind,
    },
    /// Truncate the body of the next message of this kind so it no longer
    /// decodes.
    Garble {
        /// Kind to garble.
        kind: MessageKind,
    },
}

/// A message delivered by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Sender.
    pub from: Peer,
    /// Receiver.
    pub to: Peer,
    /// Message kind.
    pub kind: MessageKind,
}

#[derive(Debug, Clone)]
struct InFlight {
    from: Peer,
    to: Peer,
    kind: MessageKind,
    body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Stream {
    rate: CipherRate,
    ticks: u64,
}

/// Everything observable about a simulated run.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    /// Delivered messages, in order.
    pub log: Vec<Delivery>,
    /// Cells the relay decoded and handed to its sink.
    pub upstream: Vec<(Round, Vec<u8>)>,
    /// Downstream payloads per client.
    pub downstream: Vec<Vec<(Round, Vec<u8>)>>,
    /// Latency measurements as `(client_id, millis)`.
    pub latencies: Vec<(u32, u64)>,
    /// Latency probes the relay echoed.
    pub probes_echoed: usize,
    /// Clients that fell back to their id as slot.
    pub slot_fallbacks: Vec<(u32, u32)>,
    /// Every error a role returned, in order.
    pub errors: Vec<(Peer, ProtocolError)>,
    /// Messages dropped because they did not decode.
    pub undecodable: usize,
    /// Rounds reported when the relay reached its reporting limit.
    pub finished: Option<u64>,
    /// Round history per client, as seen in received downstream data.
    /// Cleared entries mark a resync.
    pub round_history: Vec<Vec<Option<Round>>>,
}

/// A whole PriFi run in one process, driven step by step.
pub struct SimNetwork {
    env: SimEnv,
    params: ProtocolParams,
    relay: Relay,
    clients: Vec<Client<SimEnv>>,
    trustees: Vec<Trustee<SimEnv>>,
    streams: Vec<Stream>,
    queue: VecDeque<InFlight>,
    faults: Vec<Fault>,
    link_delay: Duration,
    halted: BTreeSet<Peer>,
    observed: Observations,
}

impl SimNetwork {
    /// Network with roles sized for `params`, nothing sent yet.
    pub fn new(seed: u64, params: ProtocolParams) -> Self {
        let env = SimEnv::with_seed(seed);
        let trustees: Vec<_> = (0..params.n_trustees).map(|_| Trustee::new(env.clone())).collect();
        let clients: Vec<_> = (0..params.n_clients).map(|_| Client::new(env.clone())).collect();
        let n_clients = clients.len();

        Self {
            env,
            params,
            relay: Relay::new(),
            clients,
            streams: vec![Stream::default(); trustees.len()],
            trustees,
            queue: VecDeque::new(),
            faults: Vec::new(),
            link_delay: Duration::from_millis(1),
            halted: BTreeSet::new(),
            observed: Observations {
                downstream: vec![Vec::new(); n_clients],
                round_history: vec![Vec::new(); n_clients],
                ..Observations::default()
            },
        }
    }

    /// Wall-clock time each delivery takes.
    #[must_use]
    pub fn with_link_delay(mut self, delay: Duration) -> Self {
        self.link_delay = delay;
        self
    }

    /// Arm a fault.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Hand the parameters to the relay, which starts the setup.
    pub fn start(&mut self) {
        let params = ProtocolParams { start_now: true, ..self.params.clone() };
        let message = Message::Parameters(params);
        self.relay_event(RelayEvent::Message { from: Peer::Relay, message });
    }

    /// Queue upstream data on a client.
    pub fn queue_upstream(&mut self, client_id: u32, data: Vec<u8>) {
        self.client_event(client_id, ClientEvent::QueueUpstream { data });
    }

    /// Queue downstream data on the relay.
    pub fn queue_downstream(&mut self, data: Vec<u8>) {
        self.relay_event(RelayEvent::QueueDownstream { data });
    }

    /// Ask the relay to resync.
    pub fn resync(&mut self) {
        self.relay_event(RelayEvent::Resync);
    }

    /// Deliver the oldest message in flight. Returns `false` if none was.
    pub fn deliver_one(&mut self) -> bool {
        let Some(mut in_flight) = self.queue.pop_front() else {
            return false;
        };
        self.env.advance_wall_clock(self.link_delay);

        if !self.apply_faults(&mut in_flight) {
            return true;
        }
        if self.halted.contains(&in_flight.to) {
            debug!(to = %in_flight.to, kind = in_flight.kind.name(), "receiver halted, dropped");
            return true;
        }
        self.observed.log.push(Delivery {
            from: in_flight.from,
            to: in_flight.to,
            kind: in_flight.kind,
        });

        let message = match Message::decode(in_flight.kind, &in_flight.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(from = %in_flight.from, to = %in_flight.to, %err, "undecodable message");
                self.observed.undecodable += 1;
                return true;
            },
        };

        match in_flight.to {
            Peer::Relay => {
                self.relay_event(RelayEvent::Message { from: in_flight.from, message });
            },
            Peer::Client(id) => self.client_event(id, ClientEvent::Message(message)),
            Peer::Trustee(id) => self.trustee_event(id, TrusteeEvent::Message(message)),
        }
        true
    }

    /// Let every streaming trustee produce one cipher (every other tick at
    /// half rate). Returns `false` if no trustee is streaming.
    pub fn tick(&mut self) -> bool {
        let mut produced = false;
        for trustee_id in 0..self.streams.len() as u32 {
            let stream = &mut self.streams[trustee_id as usize];
            let due = match stream.rate {
                CipherRate::Full => true,
                CipherRate::Half => stream.ticks % 2 == 0,
                CipherRate::Stopped | CipherRate::Kill => continue,
            };
            stream.ticks += 1;
            if due && !self.halted.contains(&Peer::Trustee(trustee_id)) {
                produced = true;
                self.trustee_event(trustee_id, TrusteeEvent::ProduceCipher);
            }
        }
        produced
    }

    /// Deliver messages, ticking trustees when the network is idle, for at
    /// most `max_steps` steps. Returns the number of steps taken.
    pub fn run(&mut self, max_steps: usize) -> usize {
        self.run_until(max_steps, |_| false)
    }

    /// Like [`SimNetwork::run`] but stops as soon as `done` holds.
    pub fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&Self) -> bool) -> usize {
        for step in 0..max_steps {
            if done(self) {
                return step;
            }
            if !self.deliver_one() && !self.tick() {
                return step;
            }
        }
        max_steps
    }

    /// Run until every client is ready and the relay is communicating.
    pub fn run_setup(&mut self, max_steps: usize) -> bool {
        self.run_until(max_steps, Self::is_communicating);
        self.is_communicating()
    }

    /// Relay communicating and every client ready.
    pub fn is_communicating(&self) -> bool {
        self.relay.state() == prifi_core::RelayState::Communicating
            && self.clients.iter().all(|c| c.state() == prifi_core::ClientState::Ready)
    }

    /// The relay.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Client `id`.
    pub fn client(&self, id: u32) -> &Client<SimEnv> {
        &self.clients[id as usize]
    }

    /// Trustee `id`.
    pub fn trustee(&self, id: u32) -> &Trustee<SimEnv> {
        &self.trustees[id as usize]
    }

    /// Current rate of trustee `id`'s cipher stream.
    pub fn stream_rate(&self, id: u32) -> CipherRate {
        self.streams[id as usize].rate
    }

    /// Roles stopped by a fatal error.
    pub fn halted(&self) -> &BTreeSet<Peer> {
        &self.halted
    }

    /// Messages in flight.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Everything observed so far.
    pub fn observations(&self) -> &Observations {
        &self.observed
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Observable state for invariant checks.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            relay_state: self.relay.state(),
            relay_round: self.relay.current_round().map(prifi_core::relay::DcNetRound::id),
            n_clients: self.params.n_clients,
            clients: self
                .clients
                .iter()
                .enumerate()
                .map(|(i, client)| ClientSnapshot {
                    id: i as u32,
                    state: client.state(),
                    slot: client.slot(),
                    next_round: client.round(),
                    round_history: self.observed.round_history[i].clone(),
                })
                .collect(),
        }
    }

    fn send(&mut self, from: Peer, to: Peer, message: &Message) {
        match message.to_vec() {
            Ok(body) => self.queue.push_back(InFlight { from, to, kind: message.kind(), body }),
            Err(err) => warn!(%from, %to, %err, "encode failed"),
        }
    }

    fn report(&mut self, peer: Peer, err: ProtocolError) {
        if err.is_fatal() {
            warn!(%peer, %err, "fatal error, role halted");
            self.halted.insert(peer);
            if let Peer::Trustee(id) = peer {
                self.streams[id as usize].rate = CipherRate::Kill;
            }
        } else {
            debug!(%peer, %err, "message rejected");
        }
        self.observed.errors.push((peer, err));
    }

    fn relay_event(&mut self, event: RelayEvent) {
        if self.halted.contains(&Peer::Relay) {
            return;
        }
        let actions = match self.relay.handle(event) {
            Ok(actions) => actions,
            Err(err) => return self.report(Peer::Relay, err),
        };
        for action in actions {
            match action {
                RelayAction::Send { to, message } => self.send(Peer::Relay, to, &message),
                RelayAction::DeliverUpstream { round, data } => {
                    self.observed.upstream.push((round, data));
                },
                RelayAction::LatencyProbe { .. } => self.observed.probes_echoed += 1,
                RelayAction::SetTrusteeRate { trustee_id, rate } => {
                    if let Some(stream) = self.streams.get_mut(trustee_id as usize) {
                        stream.rate = rate;
                    }
                },
                RelayAction::Finished { rounds } => {
                    self.observed.finished = Some(rounds);
                    for stream in &mut self.streams {
                        stream.rate = CipherRate::Kill;
                    }
                },
            }
        }
    }

    fn client_event(&mut self, id: u32, event: ClientEvent) {
        let peer = Peer::Client(id);
        if self.halted.contains(&peer) {
            return;
        }
        if let ClientEvent::Message(Message::DownstreamData(msg)) = &event {
            let history = &mut self.observed.round_history[id as usize];
            if msg.flag_resync {
                history.push(None);
            } else {
                history.push(Some(msg.round_id));
            }
        }
        let actions = match self.clients[id as usize].handle(event) {
            Ok(actions) => actions,
            Err(err) => return self.report(peer, err),
        };
        for action in actions {
            match action {
                ClientAction::Send { message } => self.send(peer, Peer::Relay, &message),
                ClientAction::Deliver { round, data } => {
                    self.observed.downstream[id as usize].push((round, data));
                },
                ClientAction::LatencyMeasured { millis } => {
                    self.observed.latencies.push((id, millis));
                },
                ClientAction::SlotFallback { slot } => {
                    self.observed.slot_fallbacks.push((id, slot));
                },
            }
        }
    }

    fn trustee_event(&mut self, id: u32, event: TrusteeEvent) {
        let peer = Peer::Trustee(id);
        if self.halted.contains(&peer) {
            return;
        }
        let actions = match self.trustees[id as usize].handle(event) {
            Ok(actions) => actions,
            Err(err) => return self.report(peer, err),
        };
        for action in actions {
            match action {
                TrusteeAction::Send { message } => self.send(peer, Peer::Relay, &message),
                TrusteeAction::StartCipherStream => {
                    self.streams[id as usize].rate = CipherRate::Full;
                },
                TrusteeAction::StopCipherStream => {
                    self.streams[id as usize].rate = CipherRate::Stopped;
                },
            }
        }
    }

    /// Apply the first matching fault. Returns `false` if the message is
    /// dropped.
    fn apply_faults(&mut self, in_flight: &mut InFlight) -> bool {
        let Some(index) = self.faults.iter().position(|fault| matches(fault, in_flight)) else {
            return true;
        };
        let fault = self.faults.remove(index);
        warn!(?fault, from = %in_flight.from, to = %in_flight.to, "fault injected");

        match fault {
            Fault::Drop { .. } => return false,
            Fault::Garble { .. } => in_flight.body.truncate(in_flight.body.len() / 2),
            Fault::TamperTranscript { .. } | Fault::ForgeSignature { .. } => {
                if let Ok(mut message) = Message::decode(in_flight.kind, &in_flight.body) {
                    tamper(&fault, &mut message);
                    if let Ok(body) = message.to_vec() {
                        in_flight.body = body;
                    }
                }
            },
        }
        true
    }
}

fn matches(fault: &Fault, in_flight: &InFlight) -> bool {
    match *fault {
        Fault::TamperTranscript { trustee_id } => {
            in_flight.kind == MessageKind::Transcript && in_flight.to == Peer::Trustee(trustee_id)
        },
        Fault::ForgeSignature { client_id, .. } => {
            in_flight.kind == MessageKind::FinalShuffle && in_flight.to == Peer::Client(client_id)
        },
        Fault::Drop { from, kind } => in_flight.from == from && in_flight.kind == kind,
        Fault::Garble { kind } => in_flight.kind == kind,
    }
}

fn tamper(fault: &Fault, message: &mut Message) {
    match (fault, message) {
        (Fault::TamperTranscript { .. }, Message::Transcript(transcript)) => {
            if let Some(byte) = transcript.proofs.first_mut().and_then(|p| p.last_mut()) {
                *byte ^= 0x01;
            }
        },
        (Fault::ForgeSignature { trustee_id, .. }, Message::FinalShuffle(final_shuffle)) => {
            if let Some(byte) = final_shuffle
                .trustee_sigs
                .get_mut(*trustee_id as usize)
                .and_then(|sig| sig.first_mut())
            {
                *byte ^= 0x01;
            }
        },
        _ => {},
    }
}
