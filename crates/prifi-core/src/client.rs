//! Client state machine.
//!
//! A client contributes one cipher to every DC-net round. In rounds it owns
//! (`round mod n_clients == slot`) the cipher carries its next queued
//! upstream payload; in every other round it carries only keystream pads.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────────┐ params ┌──────────────┐ trustee pks ┌───────────────┐ final shuffle ┌───────┐
//! │ BEFORE_INIT │───────>│ INITIALIZING │────────────>│ EPH_KEYS_SENT │──────────────>│ READY │
//! └─────────────┘        └──────────────┘             └───────────────┘               └───────┘
//!                               ^                                                        │
//!                               └──────────────── downstream(flag_resync) ───────────────┘
//! ```
//!
//! # Security
//!
//! The ephemeral keypair is regenerated at every setup; it is what the
//! shuffle anonymizes. The long-term keypair lives as long as the client and
//! only seeds the pairwise DC-net pads with each trustee.

use std::collections::VecDeque;

use prifi_crypto::{
    CellCoder, Keypair, MessageHistory, PublicKey, Signature, group::SCALAR_SEED_LEN, schnorr,
};
use prifi_proto::{
    ClientKeys, DownstreamData, FinalShuffle, Message, MessageKind, ProtocolParams, Round,
    TrusteeKeys, UpstreamData,
};
use tracing::{debug, info, warn};

use crate::{
    env::Environment,
    error::ProtocolError,
    keys::{decode_key, decode_keys, shuffle_signing_bytes},
    latency::{encode_probe, parse_probe},
};

/// Client setup and communication states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for parameters.
    BeforeInit,
    /// Waiting for the trustees' long-term keys.
    Initializing,
    /// Keys sent to the relay, waiting for the final shuffle.
    EphKeysSent,
    /// Sending one cipher per round.
    Ready,
}

impl ClientState {
    /// Protocol name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeInit => "BEFORE_INIT",
            Self::Initializing => "INITIALIZING",
            Self::EphKeysSent => "EPH_KEYS_SENT",
            Self::Ready => "READY",
        }
    }
}

/// Inputs to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Protocol message from the relay.
    Message(Message),
    /// Application data to send in one of this client's slots.
    QueueUpstream {
        /// Payload, at most the upstream cell size.
        data: Vec<u8>,
    },
}

/// Outputs of a client for its driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Deliver a message to the relay.
    Send {
        /// The message.
        message: Message,
    },
    /// Downstream payload for the application.
    Deliver {
        /// Round the payload opened.
        round: Round,
        /// Payload.
        data: Vec<u8>,
    },
    /// This client's own latency probe came back.
    LatencyMeasured {
        /// Round-trip time.
        millis: u64,
    },
    /// The client could not find its key in the final shuffle and uses its
    /// id as slot. Anonymity does not hold for this run.
    SlotFallback {
        /// Self-assigned slot.
        slot: u32,
    },
}

/// Client role of one run.
pub struct Client<E: Environment> {
    env: E,
    params: ProtocolParams,
    id: u32,
    state: ClientState,
    long_term: Keypair,
    ephemeral: Option<Keypair>,
    trustee_pks: Vec<PublicKey>,
    coder: CellCoder,
    history: MessageHistory,
    slot: Option<u32>,
    round: Round,
    upstream: VecDeque<Vec<u8>>,
}

impl<E: Environment> Client<E> {
    /// Client with a fresh long-term keypair, waiting for parameters.
    pub fn new(env: E) -> Self {
        let long_term = Keypair::from_random_bytes(&env.random_array::<SCALAR_SEED_LEN>());
        Self {
            env,
            params: ProtocolParams::default(),
            id: 0,
            state: ClientState::BeforeInit,
            long_term,
            ephemeral: None,
            trustee_pks: Vec::new(),
            coder: CellCoder::relay(),
            history: MessageHistory::new(),
            slot: None,
            round: 0,
            upstream: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Id assigned by the relay.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Slot in the final permutation, once known.
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    /// Next round this client will send a cipher for.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Long-term public key.
    pub fn public_key(&self) -> PublicKey {
        self.long_term.public()
    }

    /// Ephemeral public key of the current setup.
    pub fn ephemeral_key(&self) -> Option<PublicKey> {
        self.ephemeral.as_ref().map(Keypair::public)
    }

    /// Payloads waiting for an owned slot.
    pub fn queued_upstream(&self) -> usize {
        self.upstream.len()
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// See [`ProtocolError`]. On error no actions are produced.
    pub fn handle(&mut self, event: ClientEvent) -> Result<Vec<ClientAction>, ProtocolError> {
        match event {
            ClientEvent::Message(message) => self.handle_message(message),
            ClientEvent::QueueUpstream { data } => {
                let max = self.params.up_cell_size as usize;
                if data.len() > max {
                    return Err(ProtocolError::PayloadTooLarge { size: data.len(), max });
                }
                self.upstream.push_back(data);
                Ok(Vec::new())
            },
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<Vec<ClientAction>, ProtocolError> {
        let kind = message.kind();
        match message {
            Message::Parameters(params) => self.handle_parameters(params),
            Message::TrusteeKeys(msg) => {
                self.expect_state(ClientState::Initializing, kind)?;
                self.handle_trustee_keys(&msg)
            },
            Message::FinalShuffle(msg) => {
                self.expect_state(ClientState::EphKeysSent, kind)?;
                self.handle_final_shuffle(&msg)
            },
            Message::DownstreamData(msg) => self.handle_downstream(msg),
            _ => Err(self.violation(kind)),
        }
    }

    fn handle_parameters(
        &mut self,
        params: ProtocolParams,
    ) -> Result<Vec<ClientAction>, ProtocolError> {
        if self.state != ClientState::BeforeInit && !params.force_params {
            return Err(self.violation(MessageKind::Parameters));
        }
        params.validate().map_err(|reason| ProtocolError::InvalidMessage(reason.to_string()))?;
        if params.next_free_client_id >= params.n_clients {
            return Err(ProtocolError::InvalidMessage(format!(
                "client id {} out of range",
                params.next_free_client_id
            )));
        }

        self.id = params.next_free_client_id;
        self.params = params;
        self.reset_setup();
        info!(client_id = self.id, "client initialized");
        Ok(Vec::new())
    }

    fn handle_trustee_keys(
        &mut self,
        msg: &TrusteeKeys,
    ) -> Result<Vec<ClientAction>, ProtocolError> {
        if msg.pks.is_empty() {
            return Err(ProtocolError::InvalidMessage("empty trustee key list".to_string()));
        }
        if msg.pks.len() != self.params.n_trustees as usize {
            return Err(ProtocolError::InvalidMessage(format!(
                "{} trustee keys for {} trustees",
                msg.pks.len(),
                self.params.n_trustees
            )));
        }
        let trustee_pks = decode_keys(&msg.pks)?;

        let secrets: Vec<_> =
            trustee_pks.iter().map(|pk| self.long_term.secret().diffie_hellman(pk)).collect();
        let ephemeral = Keypair::from_random_bytes(&self.env.random_array::<SCALAR_SEED_LEN>());
        let eph_pk = ephemeral.public().to_bytes();

        self.coder = CellCoder::new(&secrets);
        self.history = MessageHistory::new();
        self.trustee_pks = trustee_pks;
        self.ephemeral = Some(ephemeral);
        self.state = ClientState::EphKeysSent;
        debug!(client_id = self.id, "ephemeral key generated");

        Ok(vec![ClientAction::Send {
            message: Message::ClientKeys(ClientKeys {
                pk: self.long_term.public().to_bytes(),
                eph_pk,
            }),
        }])
    }

    fn handle_final_shuffle(
        &mut self,
        msg: &FinalShuffle,
    ) -> Result<Vec<ClientAction>, ProtocolError> {
        if msg.trustee_sigs.len() != self.trustee_pks.len() {
            let missing = msg.trustee_sigs.len().min(self.trustee_pks.len());
            return Err(ProtocolError::SignatureInvalid { trustee_id: missing as u32 });
        }
        let signed = shuffle_signing_bytes(&msg.base, &msg.eph_pks);
        for (trustee_id, (pk, sig)) in self.trustee_pks.iter().zip(&msg.trustee_sigs).enumerate()
        {
            Signature::from_slice(sig)
                .and_then(|sig| schnorr::verify(pk, &signed, &sig))
                .map_err(|_| ProtocolError::SignatureInvalid { trustee_id: trustee_id as u32 })?;
        }

        let Some(ephemeral) = self.ephemeral.as_ref() else {
            return Err(self.violation(MessageKind::FinalShuffle));
        };
        let base = decode_key(&msg.base)?;
        let mine = ephemeral.secret().scale(&base).to_bytes();

        let mut actions = Vec::new();
        let slot = match msg.eph_pks.iter().position(|key| *key == mine) {
            Some(index) => index as u32,
            None => {
                let err = ProtocolError::SlotNotFound { client_id: self.id };
                warn!(client_id = self.id, %err, "falling back to self-assigned slot");
                actions.push(ClientAction::SlotFallback { slot: self.id });
                self.id
            },
        };

        self.slot = Some(slot);
        self.round = 0;
        self.state = ClientState::Ready;
        info!(client_id = self.id, slot, "client ready");

        actions.push(self.next_cipher()?);
        Ok(actions)
    }

    fn handle_downstream(
        &mut self,
        msg: DownstreamData,
    ) -> Result<Vec<ClientAction>, ProtocolError> {
        if msg.flag_resync && self.state != ClientState::BeforeInit {
            warn!(client_id = self.id, state = self.state.as_str(), "resync requested by relay");
            self.reset_setup();
            return Ok(Vec::new());
        }
        self.expect_state(ClientState::Ready, MessageKind::DownstreamData)?;
        if msg.round_id != self.round {
            return Err(ProtocolError::RoundMismatch {
                expected: self.round,
                received: msg.round_id,
            });
        }

        self.history.update(&msg.payload);

        let mut actions = Vec::new();
        match parse_probe(&msg.payload) {
            Some((client_id, sent_at)) => {
                if u32::from(client_id) == self.id {
                    let millis = self.env.wall_clock_millis().saturating_sub(sent_at);
                    debug!(client_id = self.id, millis, "latency probe returned");
                    actions.push(ClientAction::LatencyMeasured { millis });
                }
            },
            None if self.params.client_data_output_enabled => {
                actions.push(ClientAction::Deliver { round: msg.round_id, data: msg.payload });
            },
            None => {},
        }

        actions.push(self.next_cipher()?);
        Ok(actions)
    }

    /// Encode this client's cipher for the current round and advance.
    fn next_cipher(&mut self) -> Result<ClientAction, ProtocolError> {
        let n_clients = self.params.n_clients;
        let owns_slot =
            u32::try_from(self.round).is_ok_and(|round| Some(round % n_clients) == self.slot);

        let payload = if owns_slot {
            Some(match self.upstream.pop_front() {
                Some(data) => data,
                None if self.params.do_latency_tests => {
                    let id = u16::try_from(self.id).unwrap_or(u16::MAX);
                    encode_probe(id, self.env.wall_clock_millis()).to_vec()
                },
                None => Vec::new(),
            })
        } else {
            None
        };

        let cipher = self.coder.client_encode(
            payload.as_deref(),
            self.params.up_cell_size as usize,
            &self.history,
        )?;
        let round_id = self.round;
        self.round = round_id.checked_add(1).ok_or(ProtocolError::RoundOverflow)?;

        Ok(ClientAction::Send { message: Message::UpstreamData(UpstreamData { round_id, cipher }) })
    }

    fn reset_setup(&mut self) {
        self.state = ClientState::Initializing;
        self.ephemeral = None;
        self.trustee_pks.clear();
        self.coder = CellCoder::relay();
        self.history = MessageHistory::new();
        self.slot = None;
        self.round = 0;
    }

    fn expect_state(&self, expected: ClientState, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.state == expected { Ok(()) } else { Err(self.violation(kind)) }
    }

    fn violation(&self, kind: MessageKind) -> ProtocolError {
        debug!(
            client_id = self.id,
            state = self.state.as_str(),
            kind = kind.name(),
            "client dropping message"
        );
        ProtocolError::StateViolation { role: "client", state: self.state.as_str(), kind }
    }
}
