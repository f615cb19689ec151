//! Header-framed message codec.
//!
//! Messages follow a configurable Bitcoin-style layout:
//! - magic prefix at offset 0
//! - NUL-padded command string
//! - 4-byte little-endian payload length
//! - optional checksum
//! - payload
//!
//! [`inspect_frame`] is the pure detection step. [`FrameCodec`] wraps it in a
//! decoder that tracks how many bytes it is waiting for, so a reader can wake
//! up only when the next threshold is reached.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::NetworkConfig;
use crate::error::{NetError, NetResult};

/// What the front of a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough bytes to read the length field.
    NeedHeader,
    /// Header is visible; the message is `total` bytes but not all buffered.
    Partial { total: usize },
    /// A complete message of `total` bytes starts the buffer.
    Complete { total: usize },
    /// Magic prefix mismatch. The stream cannot be resynchronized.
    BadSync,
}

/// Inspect the front of `buf` for a framed message.
pub fn inspect_frame(network: &NetworkConfig, buf: &[u8]) -> FrameStatus {
    let needed = network.size_needed();
    if buf.len() < needed {
        return FrameStatus::NeedHeader;
    }

    let magic = &network.message_start;
    if !buf.starts_with(magic) {
        return FrameStatus::BadSync;
    }

    let offset = network.header_msg_size_offset;
    let length = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
    let total = length as usize + network.header_size;

    if buf.len() >= total {
        FrameStatus::Complete { total }
    } else {
        FrameStatus::Partial { total }
    }
}

/// Extract the command name from a framed message.
pub fn command_name<'a>(network: &NetworkConfig, message: &'a [u8]) -> Option<&'a str> {
    let start = network.header_msg_string_offset;
    let field = message.get(start..start + network.header_msg_string_size)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).ok()
}

/// First four bytes of double SHA-256.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Decoder read state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadState {
    /// Waiting until the length field is visible.
    #[default]
    AwaitingHeader,
    /// Waiting for a message of this total size.
    AwaitingBody(usize),
}

/// A command and payload to frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Command name, truncated to the command field width.
    pub command: String,
    /// Message payload.
    pub payload: Bytes,
}

impl RawMessage {
    /// Create a message.
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }
}

/// Codec for header-framed messages.
///
/// Decoded items are whole messages, header included.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Header layout and limits.
    network: NetworkConfig,
    /// What the decoder is waiting for.
    state: ReadState,
}

impl FrameCodec {
    /// Create a codec for the given network.
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            state: ReadState::AwaitingHeader,
        }
    }

    /// Current read state.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Buffered bytes needed before decoding can make progress.
    pub fn threshold(&self) -> usize {
        match self.state {
            ReadState::AwaitingHeader => self.network.size_needed(),
            ReadState::AwaitingBody(total) => total,
        }
    }

    /// Network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    fn check_size(&self, total: usize) -> NetResult<()> {
        let max = self.network.message_max_size;
        if max > 0 && total > max {
            return Err(NetError::MessageTooLarge { size: total, max });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> NetResult<Option<Self::Item>> {
        match inspect_frame(&self.network, src) {
            FrameStatus::NeedHeader => {
                self.state = ReadState::AwaitingHeader;
                Ok(None)
            }
            FrameStatus::BadSync => {
                let len = self.network.message_start.len().min(src.len());
                Err(NetError::InvalidMagic {
                    expected: self.network.message_start.clone(),
                    actual: src[..len].to_vec(),
                })
            }
            FrameStatus::Partial { total } => {
                self.check_size(total)?;
                // Reserve space for the full message to avoid reallocations
                src.reserve(total - src.len());
                self.state = ReadState::AwaitingBody(total);
                Ok(None)
            }
            FrameStatus::Complete { total } => {
                self.check_size(total)?;
                self.state = ReadState::AwaitingHeader;
                Ok(Some(src.split_to(total).freeze()))
            }
        }
    }
}

impl Encoder<RawMessage> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, message: RawMessage, dst: &mut BytesMut) -> NetResult<()> {
        let net = &self.network;
        let total = net.header_size + message.payload.len();
        self.check_size(total)?;
        let length = u32::try_from(message.payload.len()).map_err(|_| NetError::MessageTooLarge {
            size: total,
            max: u32::MAX as usize,
        })?;

        let mut header = vec![0u8; net.header_size];
        header[..net.message_start.len()].copy_from_slice(&net.message_start);

        let command = message.command.as_bytes();
        let width = command.len().min(net.header_msg_string_size);
        let start = net.header_msg_string_offset;
        header[start..start + width].copy_from_slice(&command[..width]);

        let offset = net.header_msg_size_offset;
        header[offset..offset + 4].copy_from_slice(&length.to_le_bytes());

        // Checksum follows the length field when the header has room for it
        let sum_offset = offset + 4;
        if sum_offset + 4 <= net.header_size {
            header[sum_offset..sum_offset + 4].copy_from_slice(&checksum(&message.payload));
        }

        dst.reserve(total);
        dst.put_slice(&header);
        dst.put_slice(&message.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BITCOIN_MAINNET_MAGIC;

    fn mainnet() -> NetworkConfig {
        NetworkConfig::bitcoin_mainnet()
    }

    fn encode(command: &str, payload: &[u8]) -> BytesMut {
        let mut codec = FrameCodec::new(mainnet());
        let mut buf = BytesMut::new();
        codec
            .encode(RawMessage::new(command, payload.to_vec()), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_verack_wire_format() {
        // Empty payload: checksum is the well-known 5df6e0e2.
        let buf = encode("verack", &[]);
        let mut expected = BITCOIN_MAINNET_MAGIC.to_vec();
        expected.extend_from_slice(b"verack\0\0\0\0\0\0");
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0x5d, 0xf6, 0xe0, 0xe2]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_need_header() {
        let buf = encode("ping", &[1, 2, 3, 4, 5, 6, 7, 8]);
        for len in 0..20 {
            assert_eq!(inspect_frame(&mainnet(), &buf[..len]), FrameStatus::NeedHeader);
        }
        assert_eq!(
            inspect_frame(&mainnet(), &buf[..20]),
            FrameStatus::Partial { total: 32 }
        );
    }

    #[test]
    fn test_split_chunks_complete_once() {
        let buf = encode("inv", &[9u8; 37]);
        let total = buf.len();

        for split in 1..total {
            let mut codec = FrameCodec::new(mainnet());
            let mut src = BytesMut::new();
            let mut complete = Vec::new();

            for chunk in [&buf[..split], &buf[split..]] {
                src.extend_from_slice(chunk);
                while let Some(msg) = codec.decode(&mut src).unwrap() {
                    complete.push(msg);
                }
            }

            assert_eq!(complete.len(), 1, "split at {}", split);
            assert_eq!(complete[0].len(), total);
            assert!(src.is_empty());
        }
    }

    /// Feed `wire` in the given chunk sizes, decoding only once the buffer
    /// reaches the codec threshold, the way a connection task reads.
    fn feed(wire: &[u8], chunks: impl IntoIterator<Item = usize>) -> (Vec<Bytes>, BytesMut) {
        let mut codec = FrameCodec::new(mainnet());
        let mut src = BytesMut::new();
        let mut delivered = Vec::new();
        let mut at = 0;
        for len in chunks {
            let end = (at + len).min(wire.len());
            src.extend_from_slice(&wire[at..end]);
            at = end;
            if src.len() < codec.threshold() {
                continue;
            }
            while let Some(msg) = codec.decode(&mut src).unwrap() {
                delivered.push(msg);
            }
        }
        assert_eq!(at, wire.len(), "chunks did not cover the input");
        (delivered, src)
    }

    fn three_frames() -> (BytesMut, Vec<Bytes>) {
        let frames = vec![
            encode("ping", &[1u8; 8]).freeze(),
            encode("verack", &[]).freeze(),
            encode("inv", &[3u8; 37]).freeze(),
        ];
        let mut wire = BytesMut::new();
        for frame in &frames {
            wire.extend_from_slice(frame);
        }
        (wire, frames)
    }

    #[test]
    fn test_byte_at_a_time_delivers_each_frame_once() {
        let (wire, frames) = three_frames();
        let (delivered, rest) = feed(&wire, std::iter::repeat(1).take(wire.len()));

        assert_eq!(delivered, frames);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_body_ending_on_read_boundary() {
        let (wire, frames) = three_frames();
        // Header split mid length field, then reads ending exactly on each frame
        let first = frames[0].len();
        let second = frames[1].len();
        let chunks = [18, first - 18, second, 10, wire.len() - first - second - 10];
        let (delivered, rest) = feed(&wire, chunks);

        assert_eq!(delivered, frames);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_random_splits_deliver_each_frame_once() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (wire, frames) = three_frames();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..200 {
            let mut chunks = Vec::new();
            let mut left = wire.len();
            while left > 0 {
                let len = rng.gen_range(1..=left.min(40));
                chunks.push(len);
                left -= len;
            }
            let (delivered, rest) = feed(&wire, chunks.clone());
            assert_eq!(delivered, frames, "round {} chunks {:?}", round, chunks);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_bad_magic_detected_immediately() {
        let mut buf = encode("ping", &[0u8; 8]);
        buf[0] = 0x00;

        assert_eq!(inspect_frame(&mainnet(), &buf), FrameStatus::BadSync);

        let mut codec = FrameCodec::new(mainnet());
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(NetError::InvalidMagic { .. })));
    }

    #[test]
    fn test_empty_magic_disables_check() {
        let mut net = mainnet();
        net.message_start.clear();
        let buf = encode("ping", &[0u8; 8]);
        let mut garbled = buf.to_vec();
        garbled[..4].copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(inspect_frame(&net, &garbled), FrameStatus::Complete { total: 32 });
    }

    #[test]
    fn test_message_too_large() {
        let net = mainnet().with_message_max_size(100);
        let mut codec = FrameCodec::new(net);
        let mut src = encode("block", &[0u8; 200]);

        let result = codec.decode(&mut src);
        assert!(matches!(
            result,
            Err(NetError::MessageTooLarge { size: 224, max: 100 })
        ));
    }

    #[test]
    fn test_threshold_follows_state() {
        let mut codec = FrameCodec::new(mainnet());
        let full = encode("addr", &[7u8; 10]);
        let mut src = BytesMut::from(&full[..22]);

        assert_eq!(codec.threshold(), 20);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(codec.state(), ReadState::AwaitingBody(34));
        assert_eq!(codec.threshold(), 34);

        src.extend_from_slice(&full[22..]);
        assert!(codec.decode(&mut src).unwrap().is_some());
        assert_eq!(codec.state(), ReadState::AwaitingHeader);
    }

    #[test]
    fn test_multiple_messages() {
        let mut codec = FrameCodec::new(mainnet());
        let mut src = encode("ping", &[1u8; 8]);
        src.extend_from_slice(&encode("pong", &[2u8; 8]));

        let first = codec.decode(&mut src).unwrap().unwrap();
        let second = codec.decode(&mut src).unwrap().unwrap();

        assert_eq!(command_name(&mainnet(), &first), Some("ping"));
        assert_eq!(command_name(&mainnet(), &second), Some("pong"));
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());
    }

    #[test]
    fn test_long_command_truncated() {
        let buf = encode("averyverylongcommand", &[]);
        assert_eq!(command_name(&mainnet(), &buf), Some("averyverylon"));
    }
}
