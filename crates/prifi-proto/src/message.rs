//! CBOR-encoded protocol messages.
//!
//! The `Message` enum covers the whole PriFi message set: setup parameters,
//! key collection, the chained shuffle, signature collection and the
//! per-round DC-net traffic. Each variant's wire name is kept in its docs
//! and returned by [`MessageKind::name`] for logging.
//!
//! # Invariants
//!
//! Each message variant maps to exactly one kind (enforced by match
//! exhaustiveness). Round-trip encoding must produce identical values.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    Round,
    errors::{Result, WireError},
    params::ProtocolParams,
};

/// Maximum encoded body size accepted by [`Message::decode`].
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Compressed group element.
pub type KeyBytes = [u8; 32];

/// One-byte message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// `ALL_ALL_PARAMETERS`
    Parameters = 0x01,
    /// `TRU_REL_TELL_PK`
    TrusteePublicKey = 0x02,
    /// `REL_CLI_TELL_TRUSTEES_PK`
    TrusteeKeys = 0x03,
    /// `CLI_REL_TELL_PK_AND_EPH_PK`
    ClientKeys = 0x04,
    /// `REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE`
    ShuffleRequest = 0x05,
    /// `TRU_REL_TELL_NEW_BASE_AND_EPH_PKS`
    ShuffleResult = 0x06,
    /// `REL_TRU_TELL_TRANSCRIPT`
    Transcript = 0x07,
    /// `TRU_REL_SHUFFLE_SIG`
    ShuffleSignature = 0x08,
    /// `REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG`
    FinalShuffle = 0x09,
    /// `CLI_REL_UPSTREAM_DATA`
    UpstreamData = 0x0A,
    /// `TRU_REL_DC_CIPHER`
    TrusteeCipher = 0x0B,
    /// `REL_CLI_DOWNSTREAM_DATA`
    DownstreamData = 0x0C,
}

impl MessageKind {
    /// Parse a tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Parameters,
            0x02 => Self::TrusteePublicKey,
            0x03 => Self::TrusteeKeys,
            0x04 => Self::ClientKeys,
            0x05 => Self::ShuffleRequest,
            0x06 => Self::ShuffleResult,
            0x07 => Self::Transcript,
            0x08 => Self::ShuffleSignature,
            0x09 => Self::FinalShuffle,
            0x0A => Self::UpstreamData,
            0x0B => Self::TrusteeCipher,
            0x0C => Self::DownstreamData,
            _ => return None,
        })
    }

    /// Tag byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Protocol name of the message, as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Parameters => "ALL_ALL_PARAMETERS",
            Self::TrusteePublicKey => "TRU_REL_TELL_PK",
            Self::TrusteeKeys => "REL_CLI_TELL_TRUSTEES_PK",
            Self::ClientKeys => "CLI_REL_TELL_PK_AND_EPH_PK",
            Self::ShuffleRequest => "REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE",
            Self::ShuffleResult => "TRU_REL_TELL_NEW_BASE_AND_EPH_PKS",
            Self::Transcript => "REL_TRU_TELL_TRANSCRIPT",
            Self::ShuffleSignature => "TRU_REL_SHUFFLE_SIG",
            Self::FinalShuffle => "REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG",
            Self::UpstreamData => "CLI_REL_UPSTREAM_DATA",
            Self::TrusteeCipher => "TRU_REL_DC_CIPHER",
            Self::DownstreamData => "REL_CLI_DOWNSTREAM_DATA",
        }
    }
}

/// Trustee announces its long-term key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrusteePublicKey {
    /// Sender's trustee id.
    pub trustee_id: u32,
    /// Long-term public key.
    pub pk: KeyBytes,
}

/// Relay tells clients every trustee's long-term key, ordered by trustee id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrusteeKeys {
    /// Trustee public keys.
    pub pks: Vec<KeyBytes>,
}

/// Client announces its long-term and ephemeral keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeys {
    /// Long-term public key (DC-net secrets).
    pub pk: KeyBytes,
    /// Ephemeral public key (shuffle input).
    pub eph_pk: KeyBytes,
}

/// Relay asks a trustee to perform its shuffle step.
///
/// `pks` always holds the clients' long-term keys in relay arrival order;
/// `eph_pks` and `base` are the previous step's output (or the initial
/// input for trustee 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleRequest {
    /// Client long-term keys.
    pub pks: Vec<KeyBytes>,
    /// Ephemeral keys to shuffle.
    pub eph_pks: Vec<KeyBytes>,
    /// Current base.
    pub base: KeyBytes,
}

/// Trustee returns its shuffle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleResult {
    /// Re-blinded base.
    pub new_base: KeyBytes,
    /// Permuted, re-blinded ephemeral keys.
    pub new_eph_pks: Vec<KeyBytes>,
    /// Encoded shuffle proof.
    pub proof: Vec<u8>,
}

/// Relay sends the complete shuffle chain to every trustee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Base given to trustee 0.
    pub initial_base: KeyBytes,
    /// Ephemeral keys given to trustee 0.
    pub initial_eph_pks: Vec<KeyBytes>,
    /// Output base of each step, by trustee id.
    pub bases: Vec<KeyBytes>,
    /// Output keys of each step, by trustee id.
    pub eph_pks: Vec<Vec<KeyBytes>>,
    /// Proof of each step, by trustee id.
    pub proofs: Vec<Vec<u8>>,
}

/// Trustee's signature over the final shuffle output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleSignature {
    /// Signer's trustee id.
    pub trustee_id: u32,
    /// Signature over `last_base || last_eph_pks`.
    pub sig: Vec<u8>,
}

/// Relay tells clients the final shuffle output and all trustee signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalShuffle {
    /// Final base.
    pub base: KeyBytes,
    /// Final ephemeral key list; index is the slot.
    pub eph_pks: Vec<KeyBytes>,
    /// Signatures, by trustee id.
    pub trustee_sigs: Vec<Vec<u8>>,
}

/// Client's DC-net cipher for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamData {
    /// Round the cipher belongs to.
    pub round_id: Round,
    /// Cipher bytes.
    pub cipher: Vec<u8>,
}

/// Trustee's DC-net cipher for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrusteeCipher {
    /// Round the cipher belongs to.
    pub round_id: Round,
    /// Sender's trustee id.
    pub trustee_id: u32,
    /// Cipher bytes.
    pub cipher: Vec<u8>,
}

/// Relay's downstream broadcast that opens a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamData {
    /// Round being opened.
    pub round_id: Round,
    /// Downstream payload.
    pub payload: Vec<u8>,
    /// Clients must drop back to key exchange.
    pub flag_resync: bool,
}

/// All PriFi messages.
///
/// The variant is identified by [`MessageKind`], so only the inner struct
/// is serialized (no variant tag in CBOR).
///
/// # Invariants
///
/// - Kind Uniqueness: each variant corresponds to exactly one
///   `MessageKind`, returned by [`Message::kind`].
///
/// - Serialization Consistency: encoding a `Message` and decoding it with
///   the same kind MUST produce an equal value.
///
/// # Security
///
/// - Size Validation First: [`Message::decode`] rejects oversized bodies
///   before CBOR parsing starts.
///
/// - No Variant Tag: a body decoded under the wrong kind fails to parse
///   instead of being silently reinterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `ALL_ALL_PARAMETERS`
    Parameters(ProtocolParams),
    /// `TRU_REL_TELL_PK`
    TrusteePublicKey(TrusteePublicKey),
    /// `REL_CLI_TELL_TRUSTEES_PK`
    TrusteeKeys(TrusteeKeys),
    /// `CLI_REL_TELL_PK_AND_EPH_PK`
    ClientKeys(ClientKeys),
    /// `REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE`
    ShuffleRequest(ShuffleRequest),
    /// `TRU_REL_TELL_NEW_BASE_AND_EPH_PKS`
    ShuffleResult(ShuffleResult),
    /// `REL_TRU_TELL_TRANSCRIPT`
    Transcript(Transcript),
    /// `TRU_REL_SHUFFLE_SIG`
    ShuffleSignature(ShuffleSignature),
    /// `REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG`
    FinalShuffle(FinalShuffle),
    /// `CLI_REL_UPSTREAM_DATA`
    UpstreamData(UpstreamData),
    /// `TRU_REL_DC_CIPHER`
    TrusteeCipher(TrusteeCipher),
    /// `REL_CLI_DOWNSTREAM_DATA`
    DownstreamData(DownstreamData),
}

impl Message {
    /// Kind tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Parameters(_) => MessageKind::Parameters,
            Self::TrusteePublicKey(_) => MessageKind::TrusteePublicKey,
            Self::TrusteeKeys(_) => MessageKind::TrusteeKeys,
            Self::ClientKeys(_) => MessageKind::ClientKeys,
            Self::ShuffleRequest(_) => MessageKind::ShuffleRequest,
            Self::ShuffleResult(_) => MessageKind::ShuffleResult,
            Self::Transcript(_) => MessageKind::Transcript,
            Self::ShuffleSignature(_) => MessageKind::ShuffleSignature,
            Self::FinalShuffle(_) => MessageKind::FinalShuffle,
            Self::UpstreamData(_) => MessageKind::UpstreamData,
            Self::TrusteeCipher(_) => MessageKind::TrusteeCipher,
            Self::DownstreamData(_) => MessageKind::DownstreamData,
        }
    }

    /// Encode the message body to CBOR.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Parameters(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::TrusteePublicKey(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::TrusteeKeys(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ClientKeys(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ShuffleRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ShuffleResult(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Transcript(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ShuffleSignature(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::FinalShuffle(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::UpstreamData(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::TrusteeCipher(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::DownstreamData(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| WireError::CborEncode(e.to_string()))
    }

    /// Encode the body into a fresh buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a message body of the given kind.
    ///
    /// # Security
    ///
    /// The size check happens BEFORE CBOR parsing begins, so a peer cannot
    /// make the parser chew through arbitrarily large inputs.
    pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }

        let message = match kind {
            MessageKind::Parameters => Self::Parameters(parse(bytes)?),
            MessageKind::TrusteePublicKey => Self::TrusteePublicKey(parse(bytes)?),
            MessageKind::TrusteeKeys => Self::TrusteeKeys(parse(bytes)?),
            MessageKind::ClientKeys => Self::ClientKeys(parse(bytes)?),
            MessageKind::ShuffleRequest => Self::ShuffleRequest(parse(bytes)?),
            MessageKind::ShuffleResult => Self::ShuffleResult(parse(bytes)?),
            MessageKind::Transcript => Self::Transcript(parse(bytes)?),
            MessageKind::ShuffleSignature => Self::ShuffleSignature(parse(bytes)?),
            MessageKind::FinalShuffle => Self::FinalShuffle(parse(bytes)?),
            MessageKind::UpstreamData => Self::UpstreamData(parse(bytes)?),
            MessageKind::TrusteeCipher => Self::TrusteeCipher(parse(bytes)?),
            MessageKind::DownstreamData => Self::DownstreamData(parse(bytes)?),
        };
        Ok(message)
    }

    /// Decode from a raw tag byte and body.
    pub fn decode_tagged(tag: u8, bytes: &[u8]) -> Result<Self> {
        let kind = MessageKind::from_u8(tag).ok_or(WireError::UnknownKind(tag))?;
        Self::decode(kind, bytes)
    }
}

fn parse<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_roundtrips_through_tag() {
        for tag in 0x01..=0x0C {
            let kind = MessageKind::from_u8(tag).unwrap();
            assert_eq!(kind.to_u8(), tag);
        }
        assert_eq!(MessageKind::from_u8(0x00), None);
        assert_eq!(MessageKind::from_u8(0x0D), None);
    }

    #[test]
    fn downstream_roundtrip() {
        let message = Message::DownstreamData(DownstreamData {
            round_id: 7,
            payload: vec![1, 2, 3],
            flag_resync: true,
        });
        let bytes = message.to_vec().unwrap();
        assert_eq!(Message::decode(MessageKind::DownstreamData, &bytes).unwrap(), message);
    }

    #[test]
    fn parameters_roundtrip() {
        let message = Message::Parameters(ProtocolParams::new(5, 3));
        let bytes = message.to_vec().unwrap();
        assert_eq!(Message::decode(message.kind(), &bytes).unwrap(), message);
    }

    #[test]
    fn wrong_kind_fails_to_parse() {
        let message =
            Message::UpstreamData(UpstreamData { round_id: 1, cipher: vec![0xAA; 4] });
        let bytes = message.to_vec().unwrap();
        assert!(matches!(
            Message::decode(MessageKind::ClientKeys, &bytes),
            Err(WireError::CborDecode(_))
        ));
    }

    #[test]
    fn oversized_body_rejected_before_parse() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Message::decode(MessageKind::UpstreamData, &bytes),
            Err(WireError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(Message::decode_tagged(0xFF, &[]), Err(WireError::UnknownKind(0xFF)));
    }

    #[test]
    fn names_follow_wire_convention() {
        assert_eq!(MessageKind::UpstreamData.name(), "CLI_REL_UPSTREAM_DATA");
        assert_eq!(MessageKind::Parameters.name(), "ALL_ALL_PARAMETERS");
    }
}
