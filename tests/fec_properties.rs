//! Codec-level properties of the XOR FEC: round-trip identity,
//! single-loss recovery at every index, and double-loss non-recovery,
//! across batch sizes and packet lengths.

use bytes::Bytes;
use masque_vpn::fec::{FecConfig, XorDecoder, XorEncoder};

fn config(block_size: u8) -> FecConfig {
    FecConfig {
        enabled: true,
        redundancy_percent: 10,
        block_size,
    }
}

/// Deterministic batch with varying packet lengths.
fn batch(len: usize) -> Vec<Bytes> {
    (0..len)
        .map(|i| {
            let size = 20 + (i * 13) % 80;
            let mut data = vec![0u8; size];
            for (j, byte) in data.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(7).wrapping_add(j as u8);
            }
            Bytes::from(data)
        })
        .collect()
}

#[test]
fn round_trip_identity_without_losses() {
    for len in [1usize, 2, 5, 10, 11, 19, 25] {
        let cfg = config(10);
        let encoder = XorEncoder::new(cfg).unwrap();
        let decoder = XorDecoder::new(cfg).unwrap();

        let packets = batch(len);
        let encoded = encoder.encode(&packets);

        // Data packets pass through unmodified.
        assert_eq!(&encoded[..len], &packets[..]);

        // With no losses the decoder recovers nothing and fails nothing.
        let received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        let recovered = decoder.decode(&received, &[]);
        assert_eq!(recovered.len(), received.len());
        assert!(recovered.iter().all(|r| r.is_none()));
    }
}

#[test]
fn single_loss_recovered_at_every_index_and_batch_size() {
    for len in [1usize, 3, 10, 17, 25] {
        let cfg = config(10);
        let encoder = XorEncoder::new(cfg).unwrap();
        let decoder = XorDecoder::new(cfg).unwrap();

        let packets = batch(len);
        let encoded = encoder.encode(&packets);

        for lost in 0..len {
            let mut received: Vec<Option<Bytes>> =
                encoded.iter().cloned().map(Some).collect();
            received[lost] = None;

            let recovered = decoder.decode(&received, &[lost]);
            assert_eq!(
                recovered[lost].as_ref(),
                Some(&packets[lost]),
                "batch of {len}: index {lost} not recovered"
            );
            // Nothing else is fabricated.
            for (i, slot) in recovered.iter().enumerate() {
                if i != lost {
                    assert!(slot.is_none());
                }
            }
        }
    }
}

#[test]
fn double_loss_in_one_block_recovers_neither() {
    let cfg = config(10);
    let encoder = XorEncoder::new(cfg).unwrap();
    let decoder = XorDecoder::new(cfg).unwrap();

    let packets = batch(10);
    let encoded = encoder.encode(&packets);

    for (a, b) in [(0usize, 1usize), (2, 7), (8, 9)] {
        let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        received[a] = None;
        received[b] = None;

        let recovered = decoder.decode(&received, &[a, b]);
        assert!(
            recovered.iter().all(|r| r.is_none()),
            "double loss ({a},{b}) must not recover"
        );
    }
}

#[test]
fn losses_in_distinct_blocks_all_recovered() {
    let cfg = config(5);
    let encoder = XorEncoder::new(cfg).unwrap();
    let decoder = XorDecoder::new(cfg).unwrap();

    // Three blocks of five.
    let packets = batch(15);
    let encoded = encoder.encode(&packets);
    assert_eq!(encoded.len(), 18);

    // One loss per block.
    let lost = [1usize, 7, 14];
    let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
    for &i in &lost {
        received[i] = None;
    }

    let recovered = decoder.decode(&received, &lost);
    for &i in &lost {
        assert_eq!(recovered[i].as_ref(), Some(&packets[i]));
    }
}

#[test]
fn zero_percent_redundancy_is_passthrough() {
    let cfg = FecConfig {
        enabled: true,
        redundancy_percent: 0,
        block_size: 10,
    };
    let encoder = XorEncoder::new(cfg).unwrap();
    let packets = batch(12);
    assert_eq!(encoder.encode(&packets), packets);
}

#[test]
fn shape_validation_bounds() {
    assert!(XorEncoder::new(FecConfig {
        enabled: true,
        redundancy_percent: 101,
        block_size: 10
    })
    .is_err());
    assert!(XorDecoder::new(FecConfig {
        enabled: true,
        redundancy_percent: 10,
        block_size: 0
    })
    .is_err());
    assert!(XorEncoder::new(FecConfig {
        enabled: true,
        redundancy_percent: 100,
        block_size: 255
    })
    .is_ok());
}
