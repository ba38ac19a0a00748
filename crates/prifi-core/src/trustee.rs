//! Trustee state machine.
//!
//! A trustee shares one DC-net pad with every client, takes one step of the
//! shuffle chain, signs the final permutation, and then streams one cipher
//! per round for as long as the run lasts. The stream is driven by
//! [`TrusteeEvent::ProduceCipher`] ticks from the driver, whose pace the
//! relay controls through [`CipherRate`].
//!
//! ```text
//! BEFORE_INIT ──params──> INITIALIZING ──shuffle request──> SHUFFLE_DONE ──transcript──> READY
//!      ^                                                                                  │
//!      └──────────────────── params(force) from any state ──────────────────────────────┘
//! ```

use prifi_crypto::{
    CellCoder, Keypair, PublicKey, ShuffleProof, ShuffleStep, group::SCALAR_SEED_LEN, schnorr,
    shuffle,
};
use prifi_proto::{
    KeyBytes, Message, MessageKind, ProtocolParams, Round, ShuffleRequest, ShuffleResult,
    ShuffleSignature, Transcript, TrusteeCipher, TrusteePublicKey,
};
use tracing::{debug, error, info, warn};

use crate::{
    env::Environment,
    error::ProtocolError,
    keys::{decode_key, decode_keys, encode_keys, shuffle_signing_bytes},
};

/// Pace of a trustee's cipher stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherRate {
    /// Terminate the stream.
    Kill,
    /// Pause without terminating.
    #[default]
    Stopped,
    /// Half speed; the relay throttles trustees that run too far ahead.
    Half,
    /// Full speed.
    Full,
}

/// Trustee setup and communication states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrusteeState {
    /// Waiting for parameters.
    BeforeInit,
    /// Key announced, waiting for this trustee's shuffle turn.
    Initializing,
    /// Shuffle sent, waiting for the full transcript.
    ShuffleDone,
    /// Transcript signed, streaming ciphers.
    Ready,
}

impl TrusteeState {
    /// Protocol name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeInit => "BEFORE_INIT",
            Self::Initializing => "INITIALIZING",
            Self::ShuffleDone => "SHUFFLE_DONE",
            Self::Ready => "READY",
        }
    }
}

/// Inputs to a trustee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrusteeEvent {
    /// Protocol message from the relay.
    Message(Message),
    /// Produce the next cipher of the stream.
    ProduceCipher,
}

/// Outputs of a trustee for its driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrusteeAction {
    /// Deliver a message to the relay.
    Send {
        /// The message.
        message: Message,
    },
    /// Begin issuing [`TrusteeEvent::ProduceCipher`] ticks at full rate.
    StartCipherStream,
    /// Stop issuing ticks.
    StopCipherStream,
}

/// What this trustee contributed to the shuffle chain.
struct OwnShuffle {
    base: KeyBytes,
    keys: Vec<KeyBytes>,
    proof: Vec<u8>,
}

/// Trustee role of one run.
pub struct Trustee<E: Environment> {
    env: E,
    params: ProtocolParams,
    id: u32,
    state: TrusteeState,
    long_term: Keypair,
    coder: CellCoder,
    own_shuffle: Option<OwnShuffle>,
    round: Round,
}

impl<E: Environment> Trustee<E> {
    /// Trustee with a fresh long-term keypair, waiting for parameters.
    pub fn new(env: E) -> Self {
        let long_term = Keypair::from_random_bytes(&env.random_array::<SCALAR_SEED_LEN>());
        Self {
            env,
            params: ProtocolParams::default(),
            id: 0,
            state: TrusteeState::BeforeInit,
            long_term,
            coder: CellCoder::relay(),
            own_shuffle: None,
            round: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> TrusteeState {
        self.state
    }

    /// Id assigned by the relay.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Round of the next cipher. Advisory only; the relay is authoritative.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Long-term public key.
    pub fn public_key(&self) -> PublicKey {
        self.long_term.public()
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// See [`ProtocolError`]. On error no actions are produced.
    pub fn handle(&mut self, event: TrusteeEvent) -> Result<Vec<TrusteeAction>, ProtocolError> {
        match event {
            TrusteeEvent::Message(message) => self.handle_message(message),
            TrusteeEvent::ProduceCipher => self.produce_cipher(),
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<Vec<TrusteeAction>, ProtocolError> {
        let kind = message.kind();
        match message {
            Message::Parameters(params) => self.handle_parameters(params),
            Message::ShuffleRequest(msg) => {
                self.expect_state(TrusteeState::Initializing, kind)?;
                self.handle_shuffle_request(&msg)
            },
            Message::Transcript(msg) => {
                self.expect_state(TrusteeState::ShuffleDone, kind)?;
                self.handle_transcript(&msg)
            },
            _ => Err(self.violation(kind)),
        }
    }

    fn handle_parameters(
        &mut self,
        params: ProtocolParams,
    ) -> Result<Vec<TrusteeAction>, ProtocolError> {
        if self.state != TrusteeState::BeforeInit && !params.force_params {
            return Err(self.violation(MessageKind::Parameters));
        }
        params.validate().map_err(|reason| ProtocolError::InvalidMessage(reason.to_string()))?;
        if params.next_free_trustee_id >= params.n_trustees {
            return Err(ProtocolError::InvalidMessage(format!(
                "trustee id {} out of range",
                params.next_free_trustee_id
            )));
        }

        let mut actions = Vec::new();
        if self.state == TrusteeState::Ready {
            warn!(trustee_id = self.id, "trustee re-initialized while streaming");
            actions.push(TrusteeAction::StopCipherStream);
        }

        self.id = params.next_free_trustee_id;
        self.params = params;
        self.state = TrusteeState::Initializing;
        self.coder = CellCoder::relay();
        self.own_shuffle = None;
        self.round = 0;
        info!(trustee_id = self.id, "trustee initialized");

        actions.push(TrusteeAction::Send {
            message: Message::TrusteePublicKey(TrusteePublicKey {
                trustee_id: self.id,
                pk: self.long_term.public().to_bytes(),
            }),
        });
        Ok(actions)
    }

    fn handle_shuffle_request(
        &mut self,
        msg: &ShuffleRequest,
    ) -> Result<Vec<TrusteeAction>, ProtocolError> {
        if msg.pks.len() < 2 {
            return Err(ProtocolError::InvalidMessage(format!(
                "shuffle needs at least 2 clients, got {}",
                msg.pks.len()
            )));
        }
        if msg.pks.len() != msg.eph_pks.len() {
            return Err(ProtocolError::InvalidMessage(format!(
                "{} client keys but {} ephemeral keys",
                msg.pks.len(),
                msg.eph_pks.len()
            )));
        }
        let client_pks = decode_keys(&msg.pks)?;
        let eph_pks = decode_keys(&msg.eph_pks)?;
        let base = decode_key(&msg.base)?;

        let secrets: Vec<_> =
            client_pks.iter().map(|pk| self.long_term.secret().diffie_hellman(pk)).collect();
        let output = shuffle::shuffle(&base, &eph_pks, &self.env.random_array::<32>())?;

        let own = OwnShuffle {
            base: output.base.to_bytes(),
            keys: encode_keys(&output.keys),
            proof: output.proof.to_bytes(),
        };
        let result = ShuffleResult {
            new_base: own.base,
            new_eph_pks: own.keys.clone(),
            proof: own.proof.clone(),
        };

        self.coder = CellCoder::new(&secrets);
        self.own_shuffle = Some(own);
        self.state = TrusteeState::ShuffleDone;
        debug!(trustee_id = self.id, clients = client_pks.len(), "shuffle step done");

        Ok(vec![TrusteeAction::Send { message: Message::ShuffleResult(result) }])
    }

    fn handle_transcript(&mut self, msg: &Transcript) -> Result<Vec<TrusteeAction>, ProtocolError> {
        let steps = msg.bases.len();
        if steps == 0 || msg.eph_pks.len() != steps || msg.proofs.len() != steps {
            return Err(verification_failure("transcript lists have mismatched lengths"));
        }
        if steps != self.params.n_trustees as usize {
            return Err(verification_failure(format!(
                "transcript has {steps} steps for {} trustees",
                self.params.n_trustees
            )));
        }

        let initial_base = decode_key(&msg.initial_base)?;
        let initial_keys = decode_keys(&msg.initial_eph_pks)?;
        let chain = msg
            .bases
            .iter()
            .zip(&msg.eph_pks)
            .zip(&msg.proofs)
            .map(|((base, keys), proof)| -> Result<ShuffleStep, ProtocolError> {
                Ok(ShuffleStep {
                    base: decode_key(base)?,
                    keys: decode_keys(keys)?,
                    proof: ShuffleProof::from_bytes(proof)
                        .map_err(|e| verification_failure(e.to_string()))?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        shuffle::verify_chain(&initial_base, &initial_keys, &chain).map_err(|e| {
            error!(trustee_id = self.id, %e, "shuffle transcript rejected");
            verification_failure(e.to_string())
        })?;

        let Some(own) = self.own_shuffle.as_ref() else {
            return Err(self.violation(MessageKind::Transcript));
        };
        let position = msg
            .bases
            .iter()
            .zip(&msg.proofs)
            .position(|(base, proof)| *base == own.base && *proof == own.proof)
            .ok_or_else(|| verification_failure("own shuffle missing from transcript"))?;
        if msg.eph_pks[position] != own.keys {
            return Err(verification_failure(format!("own shuffle altered at step {position}")));
        }

        let (Some(last_base), Some(last_keys)) = (msg.bases.last(), msg.eph_pks.last()) else {
            return Err(verification_failure("empty transcript"));
        };
        let signed = shuffle_signing_bytes(last_base, last_keys);
        let sig = schnorr::sign(
            self.long_term.secret(),
            &signed,
            &self.env.random_array::<SCALAR_SEED_LEN>(),
        );

        self.state = TrusteeState::Ready;
        self.round = 0;
        info!(trustee_id = self.id, step = position, "transcript verified and signed");

        Ok(vec![
            TrusteeAction::Send {
                message: Message::ShuffleSignature(ShuffleSignature {
                    trustee_id: self.id,
                    sig: sig.to_bytes().to_vec(),
                }),
            },
            TrusteeAction::StartCipherStream,
        ])
    }

    fn produce_cipher(&mut self) -> Result<Vec<TrusteeAction>, ProtocolError> {
        self.expect_state(TrusteeState::Ready, MessageKind::TrusteeCipher)?;

        let cipher = self.coder.trustee_encode(self.params.up_cell_size as usize);
        let round_id = self.round;
        self.round = round_id.checked_add(1).ok_or(ProtocolError::RoundOverflow)?;

        Ok(vec![TrusteeAction::Send {
            message: Message::TrusteeCipher(TrusteeCipher {
                round_id,
                trustee_id: self.id,
                cipher,
            }),
        }])
    }

    fn expect_state(&self, expected: TrusteeState, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.state == expected { Ok(()) } else { Err(self.violation(kind)) }
    }

    fn violation(&self, kind: MessageKind) -> ProtocolError {
        debug!(
            trustee_id = self.id,
            state = self.state.as_str(),
            kind = kind.name(),
            "trustee dropping message"
        );
        ProtocolError::StateViolation { role: "trustee", state: self.state.as_str(), kind }
    }
}

fn verification_failure(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::ShuffleVerificationFailure(reason.into())
}
