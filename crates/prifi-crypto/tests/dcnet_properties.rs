//! Property tests for the DC-net cell coder.
//!
//! A round with exactly one slot owner must decode to the owner's payload,
//! whatever the payload, the participant counts, or the order in which the
//! relay accumulates ciphers.

use prifi_crypto::{CellCoder, Keypair, MessageHistory};
use proptest::prelude::*;

struct Participants {
    clients: Vec<CellCoder>,
    trustees: Vec<CellCoder>,
}

fn participants(n_clients: usize, n_trustees: usize, salt: u8) -> Participants {
    let client_keys: Vec<_> = (0..n_clients)
        .map(|i| Keypair::from_random_bytes(&[salt ^ (i as u8 + 1); 64]))
        .collect();
    let trustee_keys: Vec<_> = (0..n_trustees)
        .map(|j| Keypair::from_random_bytes(&[salt ^ (j as u8 + 0x80); 64]))
        .collect();

    let clients = client_keys
        .iter()
        .map(|c| {
            let secrets: Vec<_> =
                trustee_keys.iter().map(|t| c.secret().diffie_hellman(&t.public())).collect();
            CellCoder::new(&secrets)
        })
        .collect();
    let trustees = trustee_keys
        .iter()
        .map(|t| {
            let secrets: Vec<_> =
                client_keys.iter().map(|c| t.secret().diffie_hellman(&c.public())).collect();
            CellCoder::new(&secrets)
        })
        .collect();

    Participants { clients, trustees }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Decode(Encode(m)) == m for single-contributor rounds.
    #[test]
    fn single_contributor_recovers_payload(
        n_clients in 2usize..6,
        n_trustees in 1usize..4,
        owner_seed in any::<usize>(),
        salt in any::<u8>(),
        payload in prop::collection::vec(any::<u8>(), 64),
        history_data in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let size = payload.len();
        let owner = owner_seed % n_clients;
        let mut net = participants(n_clients, n_trustees, salt);
        let mut history = MessageHistory::new();
        history.update(&history_data);

        let mut relay = CellCoder::relay();
        relay.decode_start(size, &history);

        for (i, client) in net.clients.iter_mut().enumerate() {
            let data = (i == owner).then_some(payload.as_slice());
            let cipher = client.client_encode(data, size, &history).unwrap();
            relay.decode_client(&cipher).unwrap();
        }
        for trustee in &mut net.trustees {
            relay.decode_trustee(&trustee.trustee_encode(size)).unwrap();
        }

        // ORACLE: all pads cancel, only the owner's payload remains
        prop_assert_eq!(relay.decode_cell().unwrap(), payload);
    }

    /// Accumulation order does not affect the decoded cell.
    #[test]
    fn accumulation_order_is_irrelevant(
        n_clients in 2usize..5,
        n_trustees in 1usize..4,
        rotation in any::<usize>(),
        payload in prop::collection::vec(any::<u8>(), 1..48),
    ) {
        let size = 48;
        let mut net = participants(n_clients, n_trustees, 7);
        let history = MessageHistory::new();

        let mut ciphers: Vec<(bool, Vec<u8>)> = Vec::new();
        for (i, client) in net.clients.iter_mut().enumerate() {
            let data = (i == 0).then_some(payload.as_slice());
            ciphers.push((true, client.client_encode(data, size, &history).unwrap()));
        }
        for trustee in &mut net.trustees {
            ciphers.push((false, trustee.trustee_encode(size)));
        }
        let len = ciphers.len();
        ciphers.rotate_left(rotation % len);

        let mut relay = CellCoder::relay();
        relay.decode_start(size, &history);
        for (from_client, cipher) in &ciphers {
            if *from_client {
                relay.decode_client(cipher).unwrap();
            } else {
                relay.decode_trustee(cipher).unwrap();
            }
        }

        let mut expected = payload.clone();
        expected.resize(size, 0);
        prop_assert_eq!(relay.decode_cell().unwrap(), expected);
    }
}

#[test]
fn two_contributors_garble_the_round() {
    let size = 16;
    let mut net = participants(2, 1, 3);
    let history = MessageHistory::new();

    let mut relay = CellCoder::relay();
    relay.decode_start(size, &history);
    let a = net.clients[0].client_encode(Some(b"first sender...."), size, &history).unwrap();
    let b = net.clients[1].client_encode(Some(b"second sender..."), size, &history).unwrap();
    relay.decode_client(&a).unwrap();
    relay.decode_client(&b).unwrap();
    relay.decode_trustee(&net.trustees[0].trustee_encode(size)).unwrap();

    let cell = relay.decode_cell().unwrap();
    assert_ne!(cell, b"first sender....");
    assert_ne!(cell, b"second sender...");
}

#[test]
fn missing_trustee_cipher_leaves_noise() {
    let size = 16;
    let mut net = participants(2, 2, 9);
    let history = MessageHistory::new();

    let mut relay = CellCoder::relay();
    relay.decode_start(size, &history);
    for (i, client) in net.clients.iter_mut().enumerate() {
        let data = (i == 0).then_some(&b"hidden"[..]);
        relay.decode_client(&client.client_encode(data, size, &history).unwrap()).unwrap();
    }
    relay.decode_trustee(&net.trustees[0].trustee_encode(size)).unwrap();

    let cell = relay.decode_cell().unwrap();
    assert_ne!(&cell[..6], b"hidden");
}
