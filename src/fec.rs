//! XOR-based forward error correction.
//!
//! Packets are grouped into blocks of `block_size`; each block gets one
//! redundancy packet holding the bytewise XOR of the block, prefixed by
//! a header recording the original packet lengths:
//!
//! ```text
//! [n: u8][len_1: u16 be] ... [len_n: u16 be][xor payload ...]
//! ```
//!
//! The XOR payload length equals the longest packet in the block;
//! shorter packets are padded with zeroes for the XOR. One redundancy
//! packet recovers at most one lost packet per block. The codec knows
//! nothing about QUIC, IP, or TUN; sequencing is applied by the pumps.

use crate::error::{Result, VpnError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// FEC shape shared by encoder and decoder. Also the `[fec]` section of
/// the client and server config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// Toggle for the outbound FEC path.
    pub enabled: bool,
    /// Redundancy percentage, 0..=100.
    pub redundancy_percent: u8,
    /// Data packets per block, 1..=255.
    pub block_size: u8,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redundancy_percent: 10,
            block_size: 10,
        }
    }
}

impl FecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.redundancy_percent > 100 {
            return Err(VpnError::Config(format!(
                "fec.redundancy_percent must be between 0 and 100, got {}",
                self.redundancy_percent
            )));
        }
        if self.block_size == 0 {
            return Err(VpnError::Config(
                "fec.block_size must be between 1 and 255".into(),
            ));
        }
        Ok(())
    }

    /// Number of redundancy packets for `data_packets` data packets:
    /// at least one whenever redundancy is enabled at all.
    pub fn redundancy_packets(&self, data_packets: usize) -> usize {
        if self.redundancy_percent == 0 {
            return 0;
        }
        let redundancy = data_packets * self.redundancy_percent as usize / 100;
        redundancy.max(1)
    }

    /// Sequence-number span of one block on the wire: data packets plus
    /// the redundancy slots reserved for them.
    pub fn total_block_size(&self) -> usize {
        self.block_size as usize + self.redundancy_packets(self.block_size as usize)
    }
}

/// Block XOR encoder.
#[derive(Debug, Clone)]
pub struct XorEncoder {
    config: FecConfig,
}

impl XorEncoder {
    pub fn new(config: FecConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> FecConfig {
        self.config
    }

    /// Encode `packets`: the originals in order, then one redundancy
    /// packet per block in block order. Returns the input unchanged
    /// when it is empty or redundancy is configured off.
    pub fn encode(&self, packets: &[Bytes]) -> Vec<Bytes> {
        if packets.is_empty() || self.config.redundancy_packets(packets.len()) == 0 {
            return packets.to_vec();
        }

        let block_size = self.config.block_size as usize;
        let mut out = Vec::with_capacity(packets.len() + packets.len().div_ceil(block_size));
        out.extend_from_slice(packets);

        for block in packets.chunks(block_size) {
            if let Some(redundancy) = xor_block(block) {
                out.push(redundancy);
            }
        }
        out
    }
}

/// Build the redundancy packet for one block.
fn xor_block(block: &[Bytes]) -> Option<Bytes> {
    let max_len = block.iter().map(|p| p.len()).max().unwrap_or(0);
    if block.is_empty() || max_len == 0 {
        return None;
    }

    let header_len = 1 + block.len() * 2;
    let mut redundancy = vec![0u8; header_len + max_len];
    redundancy[0] = block.len() as u8;
    for (i, pkt) in block.iter().enumerate() {
        let len = pkt.len() as u16;
        redundancy[1 + i * 2..1 + i * 2 + 2].copy_from_slice(&len.to_be_bytes());
    }
    for pkt in block {
        for (i, byte) in pkt.iter().enumerate() {
            redundancy[header_len + i] ^= byte;
        }
    }
    Some(Bytes::from(redundancy))
}

/// Block XOR decoder.
#[derive(Debug, Clone)]
pub struct XorDecoder {
    config: FecConfig,
}

impl XorDecoder {
    pub fn new(config: FecConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> FecConfig {
        self.config
    }

    /// Attempt recovery of lost packets. `received` is the encoded
    /// stream (data packets followed by per-block redundancy packets)
    /// with `None` at lost positions; `lost` lists those indices.
    ///
    /// Returns a sparse vector of the same length with recovered
    /// packets at their original indices. Blocks with zero or more
    /// than one lost data packet, or with a missing redundancy packet,
    /// are skipped; the decoder never fails hard.
    pub fn decode(&self, received: &[Option<Bytes>], lost: &[usize]) -> Vec<Option<Bytes>> {
        let mut recovered: Vec<Option<Bytes>> = vec![None; received.len()];
        if lost.is_empty() {
            return recovered;
        }

        let block_size = self.config.block_size as usize;
        let Some(num_data) = data_packet_count(received.len(), block_size) else {
            return recovered;
        };

        // Group lost *data* indices by block; lost redundancy packets
        // are unrecoverable and unneeded.
        let num_blocks = num_data.div_ceil(block_size);
        let mut lost_by_block: Vec<Vec<usize>> = vec![Vec::new(); num_blocks];
        for &idx in lost {
            if idx < num_data {
                lost_by_block[idx / block_size].push(idx);
            }
        }

        for (block_idx, lost_indices) in lost_by_block.iter().enumerate() {
            // XOR recovers exactly one missing packet per block.
            if lost_indices.len() != 1 {
                continue;
            }
            let lost_idx = lost_indices[0];

            let redundancy_idx = num_data + block_idx;
            let Some(Some(redundancy)) = received.get(redundancy_idx) else {
                continue;
            };
            if redundancy.is_empty() {
                continue;
            }

            let packets_in_block = redundancy[0] as usize;
            let header_len = 1 + packets_in_block * 2;
            if redundancy.len() < header_len {
                continue;
            }

            let index_in_block = lost_idx - block_idx * block_size;
            if index_in_block >= packets_in_block {
                continue;
            }
            let len_off = 1 + index_in_block * 2;
            let original_len =
                u16::from_be_bytes([redundancy[len_off], redundancy[len_off + 1]]) as usize;

            let block_start = block_idx * block_size;
            let block_end = (block_start + block_size).min(num_data);
            let survivors: Vec<&Bytes> = (block_start..block_end)
                .filter(|i| *i != lost_idx)
                .filter_map(|i| received[i].as_ref())
                .collect();

            if let Some(pkt) =
                xor_recover(redundancy, header_len, &survivors, original_len)
            {
                recovered[lost_idx] = Some(pkt);
            }
        }

        recovered
    }
}

/// XOR the redundancy payload with every surviving packet, then
/// truncate to the recorded original length.
fn xor_recover(
    redundancy: &Bytes,
    header_len: usize,
    survivors: &[&Bytes],
    original_len: usize,
) -> Option<Bytes> {
    let xor_payload = &redundancy[header_len..];
    let max_len = survivors
        .iter()
        .map(|p| p.len())
        .chain([original_len, xor_payload.len()])
        .max()?;

    let mut buf = vec![0u8; max_len];
    buf[..xor_payload.len()].copy_from_slice(xor_payload);
    for pkt in survivors {
        for (i, byte) in pkt.iter().enumerate() {
            buf[i] ^= byte;
        }
    }

    if original_len > buf.len() {
        return None;
    }
    buf.truncate(original_len);
    Some(Bytes::from(buf))
}

/// Number of data packets in an encoded stream of `total` packets,
/// given that each block of up to `block_size` data packets carries
/// exactly one redundancy packet. `None` if no split is consistent.
fn data_packet_count(total: usize, block_size: usize) -> Option<usize> {
    for blocks in 1..=total {
        let data = total - blocks;
        if data.div_ceil(block_size) == blocks && data > 0 {
            return Some(data);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(percent: u8, block_size: u8) -> FecConfig {
        FecConfig {
            enabled: true,
            redundancy_percent: percent,
            block_size,
        }
    }

    fn packets(raw: &[&[u8]]) -> Vec<Bytes> {
        raw.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    #[test]
    fn config_validation() {
        assert!(config(0, 1).validate().is_ok());
        assert!(config(100, 255).validate().is_ok());
        assert!(config(101, 10).validate().is_err());
        assert!(config(10, 0).validate().is_err());
    }

    #[test]
    fn redundancy_count_floors_at_one() {
        let c = config(10, 10);
        assert_eq!(c.redundancy_packets(10), 1);
        assert_eq!(c.redundancy_packets(3), 1);
        assert_eq!(c.redundancy_packets(30), 3);
        assert_eq!(config(0, 10).redundancy_packets(10), 0);
    }

    #[test]
    fn encode_empty_or_disabled_is_identity() {
        let enc = XorEncoder::new(config(10, 10)).unwrap();
        assert!(enc.encode(&[]).is_empty());

        let enc = XorEncoder::new(config(0, 10)).unwrap();
        let pkts = packets(&[b"abc", b"def"]);
        assert_eq!(enc.encode(&pkts), pkts);
    }

    #[test]
    fn encode_appends_one_redundancy_per_block() {
        let enc = XorEncoder::new(config(10, 2)).unwrap();
        let pkts = packets(&[b"aa", b"bb", b"cc", b"dd", b"ee"]);
        let out = enc.encode(&pkts);

        // 5 data packets in blocks of 2 -> 3 blocks -> 3 redundancy.
        assert_eq!(out.len(), 8);
        assert_eq!(&out[..5], &pkts[..]);

        // First redundancy covers packets 0 and 1.
        let r = &out[5];
        assert_eq!(r[0], 2);
        assert_eq!(u16::from_be_bytes([r[1], r[2]]), 2);
        assert_eq!(u16::from_be_bytes([r[3], r[4]]), 2);
        assert_eq!(&r[5..], &[b'a' ^ b'b', b'a' ^ b'b']);
    }

    #[test]
    fn no_loss_recovers_nothing() {
        let cfg = config(10, 4);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        let pkts = packets(&[b"one", b"two", b"three", b"four"]);
        let encoded: Vec<Option<Bytes>> = enc.encode(&pkts).into_iter().map(Some).collect();
        let recovered = dec.decode(&encoded, &[]);

        assert!(recovered.iter().all(|r| r.is_none()));
        // Data packets pass through the stream unchanged.
        for (i, pkt) in pkts.iter().enumerate() {
            assert_eq!(encoded[i].as_ref().unwrap(), pkt);
        }
    }

    #[test]
    fn single_loss_recovered_at_every_index() {
        let cfg = config(10, 5);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        let pkts = packets(&[b"alpha", b"br", b"charlie-longer", b"d", b"echo5"]);
        let encoded = enc.encode(&pkts);

        for lost_idx in 0..pkts.len() {
            let mut received: Vec<Option<Bytes>> =
                encoded.iter().cloned().map(Some).collect();
            received[lost_idx] = None;

            let recovered = dec.decode(&received, &[lost_idx]);
            assert_eq!(
                recovered[lost_idx].as_ref(),
                Some(&pkts[lost_idx]),
                "failed to recover index {lost_idx}"
            );
        }
    }

    #[test]
    fn double_loss_in_block_recovers_nothing() {
        let cfg = config(10, 5);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        let pkts = packets(&[b"alpha", b"bravo", b"charlie", b"delta", b"echo"]);
        let encoded = enc.encode(&pkts);

        let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        received[1] = None;
        received[3] = None;

        let recovered = dec.decode(&received, &[1, 3]);
        assert!(recovered.iter().all(|r| r.is_none()));
    }

    #[test]
    fn losses_in_separate_blocks_both_recovered() {
        let cfg = config(10, 2);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        let pkts = packets(&[b"p0", b"p1", b"p2", b"p3"]);
        let encoded = enc.encode(&pkts);
        assert_eq!(encoded.len(), 6);

        let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        received[0] = None;
        received[3] = None;

        let recovered = dec.decode(&received, &[0, 3]);
        assert_eq!(recovered[0].as_ref(), Some(&pkts[0]));
        assert_eq!(recovered[3].as_ref(), Some(&pkts[3]));
    }

    #[test]
    fn missing_redundancy_skips_block() {
        let cfg = config(10, 2);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        let pkts = packets(&[b"p0", b"p1"]);
        let encoded = enc.encode(&pkts);

        let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        received[0] = None;
        received[2] = None; // redundancy gone too

        let recovered = dec.decode(&received, &[0, 2]);
        assert!(recovered.iter().all(|r| r.is_none()));
    }

    #[test]
    fn short_last_block_recovers() {
        let cfg = config(10, 4);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        // 6 packets -> block of 4 + short block of 2.
        let pkts = packets(&[b"a0", b"a1", b"a2", b"a3", b"b0-longer", b"b1"]);
        let encoded = enc.encode(&pkts);
        assert_eq!(encoded.len(), 8);

        let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        received[4] = None;

        let recovered = dec.decode(&received, &[4]);
        assert_eq!(recovered[4].as_ref(), Some(&pkts[4]));
    }

    #[test]
    fn recovered_length_matches_original() {
        let cfg = config(10, 3);
        let enc = XorEncoder::new(cfg).unwrap();
        let dec = XorDecoder::new(cfg).unwrap();

        // The lost packet is shorter than its block-mates.
        let pkts = packets(&[b"longest-of-all", b"x", b"medium-one"]);
        let encoded = enc.encode(&pkts);

        let mut received: Vec<Option<Bytes>> = encoded.iter().cloned().map(Some).collect();
        received[1] = None;

        let recovered = dec.decode(&received, &[1]);
        assert_eq!(recovered[1].as_ref(), Some(&pkts[1]));
        assert_eq!(recovered[1].as_ref().unwrap().len(), 1);
    }

    #[test]
    fn data_packet_count_solves_stream_shape() {
        assert_eq!(data_packet_count(11, 10), Some(10));
        assert_eq!(data_packet_count(6, 2), Some(4));
        assert_eq!(data_packet_count(8, 4), Some(6));
        assert_eq!(data_packet_count(3, 2), Some(2));
    }
}
