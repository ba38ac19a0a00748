//! Conversions between wire key bytes and group elements.

use prifi_crypto::PublicKey;
use prifi_proto::KeyBytes;

use crate::error::ProtocolError;

pub(crate) fn decode_key(bytes: &KeyBytes) -> Result<PublicKey, ProtocolError> {
    Ok(PublicKey::from_bytes(bytes)?)
}

pub(crate) fn decode_keys(list: &[KeyBytes]) -> Result<Vec<PublicKey>, ProtocolError> {
    list.iter().map(decode_key).collect()
}

pub(crate) fn encode_keys(list: &[PublicKey]) -> Vec<KeyBytes> {
    list.iter().map(PublicKey::to_bytes).collect()
}

/// Bytes trustees sign and clients verify: `base || key_0 || .. || key_n`.
pub fn shuffle_signing_bytes(base: &KeyBytes, keys: &[KeyBytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 * (keys.len() + 1));
    out.extend_from_slice(base);
    for key in keys {
        out.extend_from_slice(key);
    }
    out
}
