//! Per-round bookkeeping at the relay.

use std::collections::{BTreeMap, BTreeSet};

use prifi_proto::Round;

/// Contribution tracking for the round currently being decoded.
///
/// Only membership is tracked here; the cipher bytes go straight into the
/// relay's cell coder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcNetRound {
    id: Round,
    clients: BTreeSet<u32>,
    trustees: BTreeSet<u32>,
}

impl DcNetRound {
    /// Empty round.
    pub fn new(id: Round) -> Self {
        Self { id, clients: BTreeSet::new(), trustees: BTreeSet::new() }
    }

    /// Round number.
    pub fn id(&self) -> Round {
        self.id
    }

    /// Record a client cipher. Returns `false` if this client already
    /// contributed.
    pub fn add_client(&mut self, client_id: u32) -> bool {
        self.clients.insert(client_id)
    }

    /// Record a trustee cipher. Returns `false` if this trustee already
    /// contributed.
    pub fn add_trustee(&mut self, trustee_id: u32) -> bool {
        self.trustees.insert(trustee_id)
    }

    /// Whether a client already contributed.
    pub fn has_client(&self, client_id: u32) -> bool {
        self.clients.contains(&client_id)
    }

    /// Whether a trustee already contributed.
    pub fn has_trustee(&self, trustee_id: u32) -> bool {
        self.trustees.contains(&trustee_id)
    }

    /// Client ciphers received so far.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Trustee ciphers received so far.
    pub fn trustee_count(&self) -> usize {
        self.trustees.len()
    }

    /// Both counts reached their cardinalities.
    pub fn is_complete(&self, n_clients: usize, n_trustees: usize) -> bool {
        self.clients.len() == n_clients && self.trustees.len() == n_trustees
    }
}

/// Trustee ciphers that arrived ahead of the relay's round pointer.
///
/// # Invariants
///
/// - At most one entry per trustee per round.
/// - Entries are only ever for rounds after the current one; the relay
///   drains a round's entries when it opens that round.
#[derive(Debug, Clone, Default)]
pub struct CipherBuffer {
    rounds: BTreeMap<Round, BTreeMap<u32, Vec<u8>>>,
}

impl CipherBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cipher. Returns `false` (and keeps the first cipher) if the
    /// trustee already has one buffered for this round.
    pub fn insert(&mut self, round: Round, trustee_id: u32, cipher: Vec<u8>) -> bool {
        let slot = self.rounds.entry(round).or_default();
        if slot.contains_key(&trustee_id) {
            return false;
        }
        slot.insert(trustee_id, cipher);
        true
    }

    /// Remove and return every cipher buffered for `round`.
    pub fn take(&mut self, round: Round) -> BTreeMap<u32, Vec<u8>> {
        self.rounds.remove(&round).unwrap_or_default()
    }

    /// Number of rounds a trustee is ahead by.
    pub fn backlog(&self, trustee_id: u32) -> usize {
        self.rounds.values().filter(|ciphers| ciphers.contains_key(&trustee_id)).count()
    }

    /// Rounds with at least one buffered cipher.
    pub fn rounds(&self) -> impl Iterator<Item = Round> + '_ {
        self.rounds.keys().copied()
    }

    /// Total number of buffered ciphers.
    pub fn len(&self) -> usize {
        self.rounds.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.rounds.clear();
    }
}
