//! Relay state machine.
//!
//! The relay coordinates a run: it collects keys, drives the chained shuffle
//! through every trustee, checks trustee signatures, and then runs DC-net
//! rounds, combining one cipher from every client and trustee per round
//! into a plaintext cell.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────────┐ params(start_now) ┌────────────────────────┐ all trustee pks
//! │ BEFORE_INIT │──────────────────>│ COLLECTING_TRUSTEE_PKS │────────────────┐
//! └─────────────┘                   └────────────────────────┘                │
//!                                              ^                              v
//! ┌───────────────┐ all sigs ┌───────────────────────────────┐  ┌───────────────────────┐
//! │ COMMUNICATING │<─────────│ COLLECTING_SHUFFLE_SIGNATURES │  │ COLLECTING_CLIENT_PKS │
//! └───────────────┘          └───────────────────────────────┘  └───────────────────────┘
//!        │  resync                       ^ last shuffle                   │ all client pks
//!        └──────> COLLECTING_TRUSTEE_PKS │                                v
//!                                        │                     ┌─────────────────────┐
//!                                        └─────────────────────│ COLLECTING_SHUFFLES │
//!                                                              └─────────────────────┘
//! ```
//!
//! Transitions only move forward. The single way back is an explicit
//! [`RelayEvent::Resync`], which tells clients to resync and re-initializes
//! trustees with forced parameters.
//!
//! # Rounds
//!
//! Client ciphers are strictly lock-step: a cipher for any round other than
//! the current one is rejected. Trustee ciphers are produced by a
//! free-running loop and may run ahead; they wait in a [`CipherBuffer`]
//! until the relay opens their round. A round completes when every client
//! and every trustee contributed; the relay then decodes the cell, picks the
//! next downstream payload, broadcasts it to open the next round, and drains
//! buffered trustee ciphers for that round.

mod round;

use std::collections::{BTreeSet, VecDeque};

use prifi_crypto::{CellCoder, MessageHistory, PublicKey, Signature, schnorr};
use prifi_proto::{
    ClientKeys, DownstreamData, FinalShuffle, KeyBytes, Message, MessageKind, ProtocolParams,
    Round, ShuffleBase, ShuffleRequest, ShuffleResult, ShuffleSignature, Transcript,
    TrusteeCipher, TrusteeKeys, TrusteePublicKey, UpstreamData,
};
pub use round::{CipherBuffer, DcNetRound};
use tracing::{debug, error, info, warn};

use crate::{
    error::ProtocolError,
    keys::{decode_key, shuffle_signing_bytes},
    latency::{LATENCY_PROBE_LEN, is_probe},
    peer::Peer,
    trustee::CipherRate,
};

/// Relay setup and communication states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Waiting for parameters.
    BeforeInit,
    /// Waiting for every trustee's long-term key.
    CollectingTrusteePks,
    /// Waiting for every client's long-term and ephemeral key.
    CollectingClientPks,
    /// Driving the shuffle chain, one trustee at a time.
    CollectingShuffles,
    /// Waiting for every trustee's signature over the final shuffle.
    CollectingShuffleSignatures,
    /// Running DC-net rounds.
    Communicating,
}

impl RelayState {
    /// Protocol name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeInit => "BEFORE_INIT",
            Self::CollectingTrusteePks => "COLLECTING_TRUSTEE_PKS",
            Self::CollectingClientPks => "COLLECTING_CLIENT_PKS",
            Self::CollectingShuffles => "COLLECTING_SHUFFLES",
            Self::CollectingShuffleSignatures => "COLLECTING_SHUFFLE_SIGNATURES",
            Self::Communicating => "COMMUNICATING",
        }
    }
}

/// Inputs to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Protocol message from a peer.
    Message {
        /// Sender as identified by the transport.
        from: Peer,
        /// The message.
        message: Message,
    },
    /// Application data to broadcast downstream in a future round.
    QueueDownstream {
        /// Payload, at most the downstream cell size.
        data: Vec<u8>,
    },
    /// Abandon the current setup or run and start key collection again.
    Resync,
}

/// Outputs of the relay for its driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Deliver a message to a peer.
    Send {
        /// Recipient.
        to: Peer,
        /// The message.
        message: Message,
    },
    /// A decoded upstream cell for the output sink.
    DeliverUpstream {
        /// Round the cell was decoded in.
        round: Round,
        /// Cell contents.
        data: Vec<u8>,
    },
    /// A decoded cell carrying a latency probe. It is echoed downstream
    /// instead of being delivered.
    LatencyProbe {
        /// Round the cell was decoded in.
        round: Round,
        /// Cell contents.
        data: Vec<u8>,
    },
    /// Ask a trustee's cipher loop to change speed.
    SetTrusteeRate {
        /// Trustee to throttle or release.
        trustee_id: u32,
        /// New rate.
        rate: CipherRate,
    },
    /// The configured number of rounds completed; the relay accepts no
    /// further ciphers.
    Finished {
        /// Rounds completed.
        rounds: u64,
    },
}

struct ClientEntry {
    pk: KeyBytes,
    eph_pk: KeyBytes,
}

/// Shuffle chain under construction, in wire form.
struct ShuffleTranscript {
    initial_base: KeyBytes,
    initial_eph_pks: Vec<KeyBytes>,
    bases: Vec<KeyBytes>,
    eph_pks: Vec<Vec<KeyBytes>>,
    proofs: Vec<Vec<u8>>,
}

impl ShuffleTranscript {
    fn new(initial_base: KeyBytes, initial_eph_pks: Vec<KeyBytes>) -> Self {
        Self {
            initial_base,
            initial_eph_pks,
            bases: Vec::new(),
            eph_pks: Vec::new(),
            proofs: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.bases.len()
    }

    fn push(&mut self, step: ShuffleResult) {
        self.bases.push(step.new_base);
        self.eph_pks.push(step.new_eph_pks);
        self.proofs.push(step.proof);
    }

    fn last(&self) -> Option<(&KeyBytes, &[KeyBytes])> {
        Some((self.bases.last()?, self.eph_pks.last()?.as_slice()))
    }

    fn to_message(&self) -> Transcript {
        Transcript {
            initial_base: self.initial_base,
            initial_eph_pks: self.initial_eph_pks.clone(),
            bases: self.bases.clone(),
            eph_pks: self.eph_pks.clone(),
            proofs: self.proofs.clone(),
        }
    }
}

/// Relay role of one run.
///
/// Sans-IO: [`Relay::handle`] consumes one event and returns the actions to
/// perform. The relay draws no randomness and reads no clock.
pub struct Relay {
    params: ProtocolParams,
    state: RelayState,
    trustee_pks: Vec<Option<PublicKey>>,
    clients: Vec<ClientEntry>,
    client_senders: BTreeSet<u32>,
    transcript: Option<ShuffleTranscript>,
    signatures: Vec<Option<Vec<u8>>>,
    coder: CellCoder,
    history: MessageHistory,
    round: Option<DcNetRound>,
    buffered: CipherBuffer,
    downstream: VecDeque<Vec<u8>>,
    probes: VecDeque<Vec<u8>>,
    throttled: BTreeSet<u32>,
    completed_rounds: u64,
    finished: bool,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    /// Relay waiting for parameters.
    pub fn new() -> Self {
        Self {
            params: ProtocolParams::default(),
            state: RelayState::BeforeInit,
            trustee_pks: Vec::new(),
            clients: Vec::new(),
            client_senders: BTreeSet::new(),
            transcript: None,
            signatures: Vec::new(),
            coder: CellCoder::relay(),
            history: MessageHistory::new(),
            round: None,
            buffered: CipherBuffer::new(),
            downstream: VecDeque::new(),
            probes: VecDeque::new(),
            throttled: BTreeSet::new(),
            completed_rounds: 0,
            finished: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Active parameters.
    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// Round currently being decoded.
    pub fn current_round(&self) -> Option<&DcNetRound> {
        self.round.as_ref()
    }

    /// Trustee ciphers waiting for future rounds.
    pub fn buffered(&self) -> &CipherBuffer {
        &self.buffered
    }

    /// Rounds decoded since the run started.
    pub fn completed_rounds(&self) -> u64 {
        self.completed_rounds
    }

    /// Whether the reporting limit was reached.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Trustees currently asked to run at half rate.
    pub fn throttled_trustees(&self) -> impl Iterator<Item = u32> + '_ {
        self.throttled.iter().copied()
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// See [`ProtocolError`]; [`ProtocolError::is_fatal`] tells the driver
    /// whether the run must halt. On error no actions are produced and,
    /// unless stated otherwise, the relay state is unchanged.
    pub fn handle(&mut self, event: RelayEvent) -> Result<Vec<RelayAction>, ProtocolError> {
        match event {
            RelayEvent::Message { from, message } => self.handle_message(from, message),
            RelayEvent::QueueDownstream { data } => {
                self.queue_downstream(data)?;
                Ok(Vec::new())
            },
            RelayEvent::Resync => self.resync(),
        }
    }

    fn handle_message(
        &mut self,
        from: Peer,
        message: Message,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        let kind = message.kind();
        match message {
            Message::Parameters(params) => self.handle_parameters(params),
            Message::TrusteePublicKey(msg) => {
                self.expect_state(RelayState::CollectingTrusteePks, kind)?;
                self.handle_trustee_pk(from, &msg)
            },
            Message::ClientKeys(msg) => {
                self.expect_state(RelayState::CollectingClientPks, kind)?;
                self.handle_client_keys(from, msg)
            },
            Message::ShuffleResult(msg) => {
                self.expect_state(RelayState::CollectingShuffles, kind)?;
                self.handle_shuffle_result(from, msg)
            },
            Message::ShuffleSignature(msg) => {
                self.expect_state(RelayState::CollectingShuffleSignatures, kind)?;
                self.handle_signature(from, msg)
            },
            Message::UpstreamData(msg) => {
                self.expect_state(RelayState::Communicating, kind)?;
                self.handle_upstream(from, &msg)
            },
            Message::TrusteeCipher(msg) => self.handle_trustee_cipher(from, msg),
            Message::TrusteeKeys(_)
            | Message::ShuffleRequest(_)
            | Message::Transcript(_)
            | Message::FinalShuffle(_)
            | Message::DownstreamData(_) => Err(self.violation(kind)),
        }
    }

    fn handle_parameters(
        &mut self,
        params: ProtocolParams,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        if self.state != RelayState::BeforeInit && !params.force_params {
            return Err(self.violation(MessageKind::Parameters));
        }
        params.validate().map_err(|reason| ProtocolError::InvalidMessage(reason.to_string()))?;

        if self.state != RelayState::BeforeInit {
            warn!(state = self.state.as_str(), "relay re-initialized by forced parameters");
        }
        let start_now = params.start_now;
        self.downstream.clear();
        self.reset_run(params);

        if !start_now {
            info!("relay initialized, waiting for start");
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        for trustee_id in 0..self.params.n_trustees {
            actions.push(RelayAction::Send {
                to: Peer::Trustee(trustee_id),
                message: Message::Parameters(self.params.for_trustee(trustee_id)),
            });
        }
        for client_id in 0..self.params.n_clients {
            actions.push(RelayAction::Send {
                to: Peer::Client(client_id),
                message: Message::Parameters(self.params.for_client(client_id)),
            });
        }
        self.state = RelayState::CollectingTrusteePks;
        info!(
            n_clients = self.params.n_clients,
            n_trustees = self.params.n_trustees,
            "relay started setup"
        );
        Ok(actions)
    }

    fn handle_trustee_pk(
        &mut self,
        from: Peer,
        msg: &TrusteePublicKey,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        let index = self.check_trustee_sender(from, msg.trustee_id)?;
        if self.trustee_pks[index].is_some() {
            return Err(ProtocolError::Duplicate { from, kind: MessageKind::TrusteePublicKey });
        }
        self.trustee_pks[index] = Some(decode_key(&msg.pk)?);
        debug!(trustee_id = msg.trustee_id, "trustee key received");

        if self.trustee_pks.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }

        let pks: Vec<KeyBytes> =
            self.trustee_pks.iter().flatten().map(PublicKey::to_bytes).collect();
        let actions = (0..self.params.n_clients)
            .map(|client_id| RelayAction::Send {
                to: Peer::Client(client_id),
                message: Message::TrusteeKeys(TrusteeKeys { pks: pks.clone() }),
            })
            .collect();
        self.state = RelayState::CollectingClientPks;
        info!("all trustee keys collected");
        Ok(actions)
    }

    fn handle_client_keys(
        &mut self,
        from: Peer,
        msg: ClientKeys,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        let Peer::Client(client_id) = from else {
            return Err(ProtocolError::InvalidMessage(format!("client keys from {from}")));
        };
        if client_id >= self.params.n_clients {
            return Err(ProtocolError::InvalidMessage(format!(
                "client id {client_id} out of range"
            )));
        }
        if self.client_senders.contains(&client_id) {
            return Err(ProtocolError::Duplicate { from, kind: MessageKind::ClientKeys });
        }
        if self.clients.iter().any(|c| c.pk == msg.pk) {
            return Err(ProtocolError::InvalidMessage(
                "long-term key submitted twice".to_string(),
            ));
        }
        decode_key(&msg.pk)?;
        decode_key(&msg.eph_pk)?;

        self.client_senders.insert(client_id);
        self.clients.push(ClientEntry { pk: msg.pk, eph_pk: msg.eph_pk });
        debug!(client_id, index = self.clients.len() - 1, "client keys received");

        if self.clients.len() < self.n_clients() {
            return Ok(Vec::new());
        }

        let base = match self.params.shuffle_base {
            ShuffleBase::Generator => PublicKey::generator().to_bytes(),
            ShuffleBase::FirstClientKey => self.clients[0].pk,
        };
        let eph_pks: Vec<KeyBytes> = self.clients.iter().map(|c| c.eph_pk).collect();
        self.transcript = Some(ShuffleTranscript::new(base, eph_pks.clone()));
        self.state = RelayState::CollectingShuffles;
        info!("all client keys collected, starting shuffle chain");

        Ok(vec![RelayAction::Send {
            to: Peer::Trustee(0),
            message: Message::ShuffleRequest(ShuffleRequest {
                pks: self.client_pks(),
                eph_pks,
                base,
            }),
        }])
    }

    fn handle_shuffle_result(
        &mut self,
        from: Peer,
        msg: ShuffleResult,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        let n_clients = self.n_clients();
        let n_trustees = self.n_trustees();
        let client_pks = self.client_pks();
        let Some(transcript) = self.transcript.as_mut() else {
            return Err(self.violation(MessageKind::ShuffleResult));
        };

        let expected = transcript.len() as u32;
        if from != Peer::Trustee(expected) {
            return Err(ProtocolError::InvalidMessage(format!(
                "shuffle result from {from}, expected trustee-{expected}"
            )));
        }
        if msg.new_eph_pks.len() != n_clients {
            return Err(ProtocolError::InvalidMessage(format!(
                "shuffle result has {} keys for {n_clients} clients",
                msg.new_eph_pks.len()
            )));
        }

        let request = ShuffleRequest {
            pks: client_pks,
            eph_pks: msg.new_eph_pks.clone(),
            base: msg.new_base,
        };
        transcript.push(msg);
        debug!(step = expected, "shuffle step received");

        if transcript.len() < n_trustees {
            return Ok(vec![RelayAction::Send {
                to: Peer::Trustee(expected + 1),
                message: Message::ShuffleRequest(request),
            }]);
        }

        let full = transcript.to_message();
        let actions = (0..self.params.n_trustees)
            .map(|trustee_id| RelayAction::Send {
                to: Peer::Trustee(trustee_id),
                message: Message::Transcript(full.clone()),
            })
            .collect();
        self.state = RelayState::CollectingShuffleSignatures;
        info!("shuffle chain complete, collecting signatures");
        Ok(actions)
    }

    fn handle_signature(
        &mut self,
        from: Peer,
        msg: ShuffleSignature,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        let index = self.check_trustee_sender(from, msg.trustee_id)?;
        if self.signatures[index].is_some() {
            return Err(ProtocolError::Duplicate { from, kind: MessageKind::ShuffleSignature });
        }

        let (Some(transcript), Some(trustee_pk)) = (&self.transcript, self.trustee_pks[index])
        else {
            return Err(self.violation(MessageKind::ShuffleSignature));
        };
        let Some((base, keys)) = transcript.last() else {
            return Err(self.violation(MessageKind::ShuffleSignature));
        };
        let signed = shuffle_signing_bytes(base, keys);
        Signature::from_slice(&msg.sig)
            .and_then(|sig| schnorr::verify(&trustee_pk, &signed, &sig))
            .map_err(|_| {
                error!(trustee_id = msg.trustee_id, "trustee signature does not verify");
                ProtocolError::SignatureInvalid { trustee_id: msg.trustee_id }
            })?;

        self.signatures[index] = Some(msg.sig);
        debug!(trustee_id = msg.trustee_id, "shuffle signature verified");

        if self.signatures.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }

        let Some(transcript) = self.transcript.take() else {
            return Err(self.violation(MessageKind::ShuffleSignature));
        };
        let (base, eph_pks) = match transcript.last() {
            Some((base, keys)) => (*base, keys.to_vec()),
            None => return Err(self.violation(MessageKind::ShuffleSignature)),
        };
        let trustee_sigs: Vec<Vec<u8>> = self.signatures.iter().flatten().cloned().collect();

        let mut actions: Vec<RelayAction> = (0..self.params.n_clients)
            .map(|client_id| RelayAction::Send {
                to: Peer::Client(client_id),
                message: Message::FinalShuffle(FinalShuffle {
                    base,
                    eph_pks: eph_pks.clone(),
                    trustee_sigs: trustee_sigs.clone(),
                }),
            })
            .collect();

        self.state = RelayState::Communicating;
        self.open_round(0, &mut actions)?;
        info!("setup complete, communicating");
        Ok(actions)
    }

    fn handle_upstream(
        &mut self,
        from: Peer,
        msg: &UpstreamData,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        let Peer::Client(client_id) = from else {
            return Err(ProtocolError::InvalidMessage(format!("upstream data from {from}")));
        };
        if client_id >= self.params.n_clients {
            return Err(ProtocolError::InvalidMessage(format!(
                "client id {client_id} out of range"
            )));
        }
        if self.finished {
            debug!(client_id, "run finished, dropping client cipher");
            return Ok(Vec::new());
        }
        let Some(round) = self.round.as_ref() else {
            return Err(self.violation(MessageKind::UpstreamData));
        };
        if msg.round_id != round.id() {
            return Err(ProtocolError::RoundMismatch {
                expected: round.id(),
                received: msg.round_id,
            });
        }
        let round_id = round.id();
        if round.has_client(client_id) {
            return Err(ProtocolError::Duplicate { from, kind: MessageKind::UpstreamData });
        }
        self.check_cipher_len(from, round_id, &msg.cipher)?;
        self.coder.decode_client(&msg.cipher)?;
        if let Some(round) = self.round.as_mut() {
            round.add_client(client_id);
        }
        self.try_complete()
    }

    fn handle_trustee_cipher(
        &mut self,
        from: Peer,
        msg: TrusteeCipher,
    ) -> Result<Vec<RelayAction>, ProtocolError> {
        // Trustees start streaming right after signing, possibly before the
        // last signature reaches the relay.
        if !matches!(
            self.state,
            RelayState::Communicating | RelayState::CollectingShuffleSignatures
        ) {
            return Err(self.violation(MessageKind::TrusteeCipher));
        }
        self.check_trustee_sender(from, msg.trustee_id)?;
        if self.finished {
            return Ok(Vec::new());
        }

        let current = self.round.as_ref().map_or(0, DcNetRound::id);
        if msg.round_id < current {
            return Err(ProtocolError::StaleRound { current, received: msg.round_id });
        }
        self.check_cipher_len(from, msg.round_id, &msg.cipher)?;

        if let Some(round) = self.round.as_mut().filter(|r| r.id() == msg.round_id) {
            if !round.add_trustee(msg.trustee_id) {
                return Err(ProtocolError::Duplicate { from, kind: MessageKind::TrusteeCipher });
            }
            self.coder.decode_trustee(&msg.cipher)?;
            return self.try_complete();
        }

        if !self.buffered.insert(msg.round_id, msg.trustee_id, msg.cipher) {
            return Err(ProtocolError::Duplicate { from, kind: MessageKind::TrusteeCipher });
        }
        debug!(trustee_id = msg.trustee_id, round = msg.round_id, "trustee cipher buffered");

        let mut actions = Vec::new();
        self.check_window(msg.trustee_id, &mut actions);
        Ok(actions)
    }

    fn try_complete(&mut self) -> Result<Vec<RelayAction>, ProtocolError> {
        let complete = self
            .round
            .as_ref()
            .is_some_and(|r| r.is_complete(self.n_clients(), self.n_trustees()));
        let mut actions = Vec::new();
        if complete {
            self.finish_round(&mut actions)?;
        }
        Ok(actions)
    }

    fn finish_round(&mut self, actions: &mut Vec<RelayAction>) -> Result<(), ProtocolError> {
        let Some(round) = self.round.take() else {
            return Ok(());
        };
        let round_id = round.id();

        let cell = self.coder.decode_cell()?;

        if is_probe(&cell) {
            self.probes.push_back(cell[..LATENCY_PROBE_LEN].to_vec());
            actions.push(RelayAction::LatencyProbe { round: round_id, data: cell });
        } else if self.params.relay_data_output_enabled {
            actions.push(RelayAction::DeliverUpstream { round: round_id, data: cell });
        }
        self.completed_rounds += 1;
        debug!(round = round_id, "round decoded");

        let limit = u64::from(self.params.relay_reporting_limit);
        if limit > 0 && self.completed_rounds >= limit {
            self.finished = true;
            info!(rounds = self.completed_rounds, "reporting limit reached");
            actions.push(RelayAction::Finished { rounds: self.completed_rounds });
            return Ok(());
        }

        let next = round_id.checked_add(1).ok_or(ProtocolError::RoundOverflow)?;
        let payload = self.next_downstream();
        self.history.update(&payload);
        for client_id in 0..self.params.n_clients {
            actions.push(RelayAction::Send {
                to: Peer::Client(client_id),
                message: Message::DownstreamData(DownstreamData {
                    round_id: next,
                    payload: payload.clone(),
                    flag_resync: false,
                }),
            });
        }
        self.open_round(next, actions)
    }

    /// Start decoding `round` and absorb trustee ciphers already buffered
    /// for it.
    fn open_round(
        &mut self,
        round_id: Round,
        actions: &mut Vec<RelayAction>,
    ) -> Result<(), ProtocolError> {
        self.coder.decode_start(self.params.up_cell_size as usize, &self.history);
        let mut round = DcNetRound::new(round_id);
        for (trustee_id, cipher) in self.buffered.take(round_id) {
            round.add_trustee(trustee_id);
            self.coder.decode_trustee(&cipher)?;
        }
        self.round = Some(round);
        self.release_throttles(actions);
        Ok(())
    }

    fn next_downstream(&mut self) -> Vec<u8> {
        let mut payload = self
            .probes
            .pop_front()
            .or_else(|| self.downstream.pop_front())
            .unwrap_or_else(|| vec![0u8; 1]);
        let size = self.params.down_cell_size as usize;
        if self.params.use_dummy_data_down && payload.len() < size {
            payload.resize(size, 0);
        }
        payload
    }

    fn check_window(&mut self, trustee_id: u32, actions: &mut Vec<RelayAction>) {
        let window = self.params.relay_window_size as usize;
        if window == 0 || self.buffered.backlog(trustee_id) <= window {
            return;
        }
        if self.throttled.insert(trustee_id) {
            warn!(trustee_id, window, "trustee ahead of window, throttling");
            actions.push(RelayAction::SetTrusteeRate { trustee_id, rate: CipherRate::Half });
        }
    }

    fn release_throttles(&mut self, actions: &mut Vec<RelayAction>) {
        let low_water = self.params.relay_window_size as usize / 2;
        let released: Vec<u32> = self
            .throttled
            .iter()
            .copied()
            .filter(|&id| self.buffered.backlog(id) <= low_water)
            .collect();
        for trustee_id in released {
            self.throttled.remove(&trustee_id);
            debug!(trustee_id, "trustee back within window");
            actions.push(RelayAction::SetTrusteeRate { trustee_id, rate: CipherRate::Full });
        }
    }

    fn queue_downstream(&mut self, data: Vec<u8>) -> Result<(), ProtocolError> {
        let max = self.params.down_cell_size as usize;
        if data.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: data.len(), max });
        }
        self.downstream.push_back(data);
        Ok(())
    }

    /// Tell clients to resync and restart trustees with forced parameters.
    ///
    /// Queued downstream data survives; everything collected during setup
    /// and every round in flight is discarded.
    fn resync(&mut self) -> Result<Vec<RelayAction>, ProtocolError> {
        if self.state == RelayState::BeforeInit {
            return Err(ProtocolError::InvalidMessage(
                "resync requested before setup started".to_string(),
            ));
        }
        warn!(state = self.state.as_str(), "relay resync");

        let round_id = self.round.as_ref().map_or(0, DcNetRound::id);
        let mut actions = Vec::new();
        for client_id in 0..self.params.n_clients {
            actions.push(RelayAction::Send {
                to: Peer::Client(client_id),
                message: Message::DownstreamData(DownstreamData {
                    round_id,
                    payload: Vec::new(),
                    flag_resync: true,
                }),
            });
        }

        let forced =
            ProtocolParams { force_params: true, start_now: true, ..self.params.clone() };
        for trustee_id in 0..self.params.n_trustees {
            actions.push(RelayAction::Send {
                to: Peer::Trustee(trustee_id),
                message: Message::Parameters(forced.for_trustee(trustee_id)),
            });
        }

        self.reset_run(self.params.clone());
        self.state = RelayState::CollectingTrusteePks;
        Ok(actions)
    }

    fn reset_run(&mut self, params: ProtocolParams) {
        let n_trustees = params.n_trustees as usize;
        self.params = params;
        self.state = RelayState::BeforeInit;
        self.trustee_pks = vec![None; n_trustees];
        self.clients.clear();
        self.client_senders.clear();
        self.transcript = None;
        self.signatures = vec![None; n_trustees];
        self.coder = CellCoder::relay();
        self.history = MessageHistory::new();
        self.round = None;
        self.buffered.clear();
        self.probes.clear();
        self.throttled.clear();
        self.completed_rounds = 0;
        self.finished = false;
    }

    /// Every cipher must be exactly one upstream cell long; anything else
    /// would decode to a cell of the right size with garbled contents.
    fn check_cipher_len(
        &self,
        from: Peer,
        round: Round,
        cipher: &[u8],
    ) -> Result<(), ProtocolError> {
        let expected = self.params.up_cell_size as usize;
        if cipher.len() == expected {
            return Ok(());
        }
        error!(%from, round, expected, actual = cipher.len(), "cipher size mismatch");
        Err(ProtocolError::SizeMismatch { expected, actual: cipher.len() })
    }

    fn check_trustee_sender(&self, from: Peer, trustee_id: u32) -> Result<usize, ProtocolError> {
        if trustee_id >= self.params.n_trustees {
            return Err(ProtocolError::InvalidMessage(format!(
                "trustee id {trustee_id} out of range"
            )));
        }
        if from != Peer::Trustee(trustee_id) {
            return Err(ProtocolError::InvalidMessage(format!(
                "{from} claims trustee id {trustee_id}"
            )));
        }
        Ok(trustee_id as usize)
    }

    fn client_pks(&self) -> Vec<KeyBytes> {
        self.clients.iter().map(|c| c.pk).collect()
    }

    fn n_clients(&self) -> usize {
        self.params.n_clients as usize
    }

    fn n_trustees(&self) -> usize {
        self.params.n_trustees as usize
    }

    fn expect_state(&self, expected: RelayState, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.state == expected { Ok(()) } else { Err(self.violation(kind)) }
    }

    fn violation(&self, kind: MessageKind) -> ProtocolError {
        debug!(state = self.state.as_str(), kind = kind.name(), "relay dropping message");
        ProtocolError::StateViolation { role: "relay", state: self.state.as_str(), kind }
    }
}
