//! Wire codec: bus and LAN packet layouts.
//!
//! All multi-byte integers are big-endian. Parsing is bounds-checked and
//! returns [`CodecError`] instead of trusting buffer lengths.
//!
//! ```text
//! bus (multicast):  senderTag u32 ‖ publicKey[32] ‖ signature[64] ‖
//!                   messageTypeHash u32 ‖ timestamp u64 ‖ zstd(armoredPayload)
//! bus (router):     same, without the senderTag prefix
//! lan:              sessionId u32 ‖ messageTypeHash u32 ‖ flags u8 ‖
//!                   [targetId u64] ‖ body ‖ [signature[64]]
//! ```

use std::io::Read;

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::crypto;
use crate::error::CodecError;
use crate::identity::{AccountId, Identity};
use crate::topic::{Topic, TopicHash};

/// Upper bound for a decompressed bus payload. Frames that inflate beyond
/// this are rejected rather than truncated.
pub const MAX_DECOMPRESSED_PAYLOAD: usize = 256 * 1024;

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Length of the multicast overhead prefix (sender tag).
pub const OVERHEAD_LEN: usize = 4;

/// Fixed bus header length before the compressed payload.
pub const BUS_HEADER_LEN: usize = 32 + 64 + 4 + 8;

pub const SIGNATURE_LEN: usize = 64;

const COMPRESSION_LEVEL: i32 = 1;

// ---------------------------------------------------------------------------
// Bounds-checked reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Armoring
// ---------------------------------------------------------------------------

/// A payload in the text-safe armored alphabet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Armored(String);

impl Armored {
    /// Armor raw bytes.
    pub fn wrap(raw: &[u8]) -> Self {
        Self(STANDARD.encode(raw))
    }

    /// Accept text that is already armored, validating it decodes.
    pub fn from_text(text: impl Into<String>) -> Result<Self, CodecError> {
        let text = text.into();
        STANDARD.decode(&text)?;
        Ok(Self(text))
    }

    /// Recover the raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(STANDARD.decode(&self.0)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Armor a signature for text storage.
pub fn armor_signature(signature: &[u8; 64]) -> String {
    STANDARD.encode(signature)
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::bulk::compress(data, COMPRESSION_LEVEL).map_err(|e| CodecError::Compression(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let decoder =
        zstd::stream::read::Decoder::new(data).map_err(|e| CodecError::Compression(e.to_string()))?;
    let mut out = Vec::new();
    decoder
        .take(MAX_DECOMPRESSED_PAYLOAD as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if out.len() > MAX_DECOMPRESSED_PAYLOAD {
        return Err(CodecError::TooLarge {
            limit: MAX_DECOMPRESSED_PAYLOAD,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Bus packets
// ---------------------------------------------------------------------------

/// A signed bus packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPacket {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
    pub topic: TopicHash,
    pub timestamp: u64,
    pub payload: Armored,
}

/// The bytes covered by a bus signature: `hash ‖ timestamp ‖ payload`.
fn signed_region(topic: TopicHash, timestamp: u64, payload: &Armored) -> Vec<u8> {
    let mut region = Vec::with_capacity(12 + payload.as_str().len());
    region.extend_from_slice(&topic.0.to_be_bytes());
    region.extend_from_slice(&timestamp.to_be_bytes());
    region.extend_from_slice(payload.as_str().as_bytes());
    region
}

impl BusPacket {
    /// Build and sign a packet with `identity`.
    pub fn sign(identity: &Identity, topic: TopicHash, timestamp: u64, payload: Armored) -> Self {
        let signature = identity.sign(&signed_region(topic, timestamp, &payload));
        Self {
            public_key: identity.public_key(),
            signature,
            topic,
            timestamp,
            payload,
        }
    }

    /// Check the signature against the embedded public key.
    pub fn verify(&self) -> bool {
        crypto::verify(
            &self.public_key,
            &self.signature,
            &signed_region(self.topic, self.timestamp, &self.payload),
        )
    }

    /// Long id of the embedded sender key.
    pub fn sender_long_id(&self) -> String {
        bs58::encode(self.public_key).into_string()
    }

    /// Serialize without the overhead prefix.
    ///
    /// Fails if a receiver would reject the payload as too large, or if the
    /// framed packet cannot fit in one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let text = self.payload.as_str();
        if text.len() > MAX_DECOMPRESSED_PAYLOAD {
            return Err(CodecError::TooLarge {
                limit: MAX_DECOMPRESSED_PAYLOAD,
            });
        }
        let compressed = compress(text.as_bytes())?;
        let size = OVERHEAD_LEN + BUS_HEADER_LEN + compressed.len();
        if size > MAX_UDP_PAYLOAD {
            return Err(CodecError::DatagramTooLarge {
                size,
                limit: MAX_UDP_PAYLOAD,
            });
        }

        let mut out = Vec::with_capacity(BUS_HEADER_LEN + compressed.len());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.topic.0.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Parse a packet without the overhead prefix.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let public_key = reader.array::<32>()?;
        let signature = reader.array::<64>()?;
        let topic = TopicHash(reader.u32()?);
        let timestamp = reader.u64()?;
        let inflated = decompress(reader.rest())?;
        let text = String::from_utf8(inflated)
            .map_err(|_| CodecError::Compression("payload is not text".into()))?;
        Ok(Self {
            public_key,
            signature,
            topic,
            timestamp,
            payload: Armored::from_text(text)?,
        })
    }
}

/// Prefix an encoded packet with the sender tag for multicast.
pub fn with_overhead(sender_tag: u32, packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OVERHEAD_LEN + packet.len());
    out.extend_from_slice(&sender_tag.to_be_bytes());
    out.extend_from_slice(packet);
    out
}

/// Split a multicast datagram into its sender tag and packet bytes.
pub fn split_overhead(datagram: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    let mut reader = Reader::new(datagram);
    let tag = reader.u32()?;
    Ok((tag, reader.rest()))
}

/// Armor, sign, compress and frame `raw` for multicast.
pub fn encode(
    identity: &Identity,
    sender_tag: u32,
    topic: &Topic,
    raw: &[u8],
    timestamp: u64,
) -> Result<Vec<u8>, CodecError> {
    let packet = BusPacket::sign(identity, topic.hash(), timestamp, Armored::wrap(raw));
    Ok(with_overhead(sender_tag, &packet.encode()?))
}

/// Inverse of [`encode`]: returns the sender tag, the packet, and the raw
/// payload bytes. Does not verify the signature.
pub fn decode(datagram: &[u8]) -> Result<(u32, BusPacket, Vec<u8>), CodecError> {
    let (tag, body) = split_overhead(datagram)?;
    let packet = BusPacket::decode(body)?;
    let raw = packet.payload.decode()?;
    Ok((tag, packet, raw))
}

// ---------------------------------------------------------------------------
// LAN packets
// ---------------------------------------------------------------------------

/// LAN flag bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LanFlags {
    pub encrypted: bool,
    pub targeted: bool,
    pub signed: bool,
}

impl LanFlags {
    const ENCRYPTED: u8 = 1 << 0;
    const TARGETED: u8 = 1 << 1;
    const SIGNED: u8 = 1 << 2;

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.encrypted {
            b |= Self::ENCRYPTED;
        }
        if self.targeted {
            b |= Self::TARGETED;
        }
        if self.signed {
            b |= Self::SIGNED;
        }
        b
    }

    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        if b & !(Self::ENCRYPTED | Self::TARGETED | Self::SIGNED) != 0 {
            return Err(CodecError::InvalidFlags(b));
        }
        Ok(Self {
            encrypted: b & Self::ENCRYPTED != 0,
            targeted: b & Self::TARGETED != 0,
            signed: b & Self::SIGNED != 0,
        })
    }
}

/// Fixed LAN header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanHeader {
    pub session_id: u32,
    pub topic: TopicHash,
    pub flags: LanFlags,
}

impl LanHeader {
    pub const LEN: usize = 4 + 4 + 1;

    /// Parse the header, returning it and the unparsed remainder.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let mut reader = Reader::new(bytes);
        let session_id = reader.u32()?;
        let topic = TopicHash(reader.u32()?);
        let flags = LanFlags::from_byte(reader.u8()?)?;
        Ok((
            Self {
                session_id,
                topic,
                flags,
            },
            reader.rest(),
        ))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.extend_from_slice(&self.topic.0.to_be_bytes());
        out.push(self.flags.to_byte());
    }
}

/// Read the 8-byte target id that follows the header of a targeted packet.
pub fn split_target(rest: &[u8]) -> Result<(AccountId, &[u8]), CodecError> {
    let mut reader = Reader::new(rest);
    let target = AccountId(reader.u64()?);
    Ok((target, reader.rest()))
}

/// Split the trailing signature off a signed packet's body.
pub fn split_signature(rest: &[u8]) -> Result<(&[u8], [u8; 64]), CodecError> {
    if rest.len() < SIGNATURE_LEN {
        return Err(CodecError::Truncated {
            needed: SIGNATURE_LEN,
            available: rest.len(),
        });
    }
    let (body, sig) = rest.split_at(rest.len() - SIGNATURE_LEN);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(sig);
    Ok((body, signature))
}

/// A complete LAN packet. The signature, when present, covers `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanPacket {
    pub header: LanHeader,
    pub target: Option<AccountId>,
    pub body: Vec<u8>,
    pub signature: Option<[u8; 64]>,
}

impl LanPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            LanHeader::LEN + 8 + self.body.len() + SIGNATURE_LEN,
        );
        self.header.encode_into(&mut out);
        if let Some(target) = self.target {
            out.extend_from_slice(&target.0.to_be_bytes());
        }
        out.extend_from_slice(&self.body);
        if let Some(signature) = &self.signature {
            out.extend_from_slice(signature);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (header, mut rest) = LanHeader::decode(bytes)?;
        let mut target = None;
        if header.flags.targeted {
            let (t, r) = split_target(rest)?;
            target = Some(t);
            rest = r;
        }
        let (body, signature) = if header.flags.signed {
            let (b, s) = split_signature(rest)?;
            (b, Some(s))
        } else {
            (rest, None)
        };
        Ok(Self {
            header,
            target,
            body: body.to_vec(),
            signature,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
