//! Bitcoin wire frame prefix handling.
//!
//! Every p2p message starts with a fixed 24 byte heading: 4 bytes of
//! network magic, a 12 byte zero padded ASCII command, the payload length
//! as a little-endian u32, and the first four bytes of the payload's
//! double-SHA-256. Heading validation happens here; payload serialization
//! is delegated to the codec in the `bitcoin` crate.

use crate::error::NetworkError;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::message::{CommandString, RawNetworkMessage};
use bitcoin::p2p::Magic;

/// Size of a bitcoin message heading in bytes.
pub const HEADING_SIZE: usize = 24;

/// Offset in the heading where the payload length is stored.
const PAYLOAD_LENGTH_OFFSET: usize = 16;

/// Protocol version that introduced witness serialization.
///
/// Bitcoin Core implemented SegWit in version 0.13.1 with protocol
/// version 70015.
pub const WITNESS_PROTOCOL_VERSION: u32 = 70015;

/// Largest payload accepted from pre-witness peers (legacy block size).
const MAX_PAYLOAD_BASE: usize = 1_000_000;

/// Largest payload accepted from witness-capable peers. Matches the
/// codec's own frame cap, so anything the codec can parse fits.
const MAX_PAYLOAD_WITNESS: usize = 4_000_000;

/// Largest payload a peer may announce under the given protocol version.
///
/// Monotonically non-decreasing in version, which lets a channel size its
/// frame buffer once from the configured protocol maximum.
pub fn max_payload(version: u32) -> usize {
    if version >= WITNESS_PROTOCOL_VERSION {
        MAX_PAYLOAD_WITNESS
    } else {
        MAX_PAYLOAD_BASE
    }
}

/// First four bytes of the double-SHA-256 over the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d::Hash::hash(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.to_byte_array()[..4]);
    out
}

/// Parsed form of the fixed 24 byte frame prefix.
#[derive(Debug, Clone)]
pub struct Heading {
    /// Network magic the frame was stamped with.
    pub magic: Magic,
    /// Command naming the payload's type.
    pub command: CommandString,
    /// Number of payload bytes that follow the heading.
    pub payload_length: u32,
    /// Declared checksum over the payload.
    pub checksum: [u8; 4],
}

impl Heading {
    /// Decode a heading from its wire form.
    ///
    /// Returns `BadStream` if the command field is not zero padded
    /// printable ASCII of at least one character.
    pub fn decode(bytes: &[u8; HEADING_SIZE]) -> Result<Self, NetworkError> {
        let mut magic_bytes = [0u8; 4];
        magic_bytes.copy_from_slice(&bytes[0..4]);
        let magic = Magic::from_bytes(magic_bytes);

        let raw_command = &bytes[4..16];
        let end = raw_command.iter().position(|&b| b == 0).unwrap_or(12);
        let (name, padding) = raw_command.split_at(end);
        if name.is_empty()
            || !name.iter().all(u8::is_ascii_graphic)
            || padding.iter().any(|&b| b != 0)
        {
            return Err(NetworkError::BadStream);
        }
        let name = std::str::from_utf8(name).map_err(|_| NetworkError::BadStream)?;
        let command =
            CommandString::try_from(name.to_owned()).map_err(|_| NetworkError::BadStream)?;

        let payload_length = u32::from_le_bytes([
            bytes[PAYLOAD_LENGTH_OFFSET],
            bytes[PAYLOAD_LENGTH_OFFSET + 1],
            bytes[PAYLOAD_LENGTH_OFFSET + 2],
            bytes[PAYLOAD_LENGTH_OFFSET + 3],
        ]);

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);

        Ok(Heading {
            magic,
            command,
            payload_length,
            checksum,
        })
    }

    /// Whether the declared checksum matches the payload.
    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == checksum(payload)
    }
}

/// Discards everything written to it; used to measure encodings.
struct NullWriter;

impl bitcoin::io::Write for NullWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, bitcoin::io::Error> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), bitcoin::io::Error> {
        Ok(())
    }
}

/// Serialized size of a complete frame, counted without allocating.
///
/// The read loop compares this against the framed length to detect
/// payloads with trailing bytes the codec silently ignored.
pub(crate) fn encoded_size(message: &RawNetworkMessage) -> Result<usize, NetworkError> {
    message
        .consensus_encode(&mut NullWriter)
        .map_err(|_| NetworkError::BadStream)
}
