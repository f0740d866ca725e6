use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use quinn::{RecvStream, SendStream};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::{auth::Challenge, Parcel, QueueName};
use crate::{
    error::{Error, Result},
    protocol::now_micros,
};

/// Bumped whenever a message layout below changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// ALPN token both sides advertise.
pub const ALPN: &[u8] = b"nbm-queue/1";

/// len (4) | flags (1) | sent_at (8)
const PREFIX_LEN: usize = 4 + 1 + 8;
const FLAG_ZSTD: u8 = 0b0000_0001;
const COMPRESS_OVER: usize = 1024;
const ZSTD_LEVEL: i32 = 3;
const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum HandshakeMessage {
    /// Opens the handshake stream.
    Hello { version: u16 },
    /// A challenge for the client.
    AChallengeForYou(Challenge),
    /// The client's keyed answer to the challenge.
    MyProof([u8; 32]),
    /// Handshake complete
    Ready,
}

/// One queue operation. Each request travels on its own bi-stream.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Request {
    Put(Parcel),
    /// `wait_ms == 0` never blocks.
    Get { queue: QueueName, wait_ms: u64 },
    Size(QueueName),
    Purge(QueueName),
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Response {
    Done,
    Item(Parcel),
    Empty,
    Size(u64),
    Purged(u64),
}

pub trait WireMessage: Sized {
    fn encode(&self) -> Result<AlignedVec>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

macro_rules! wire_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireMessage for $ty {
                fn encode(&self) -> Result<AlignedVec> {
                    rkyv::to_bytes::<_, 1024>(self).map_err(|_| Error::CouldNotEncodeMessage)
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    // archived roots must be aligned
                    let mut aligned = AlignedVec::with_capacity(bytes.len());
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<$ty>(&aligned).map_err(|_| Error::CouldNotDecodeMessage)
                }
            }
        )*
    };
}

wire_message!(HandshakeMessage, Request, Response);

/// Builds `len | flags | sent_at | body`, compressing large bodies.
pub fn frame<T: WireMessage>(msg: &T, sent_at: i64) -> Result<Vec<u8>> {
    let encoded = msg.encode()?;
    let (flags, body) = if encoded.len() > COMPRESS_OVER {
        (FLAG_ZSTD, zstd::encode_all(encoded.as_slice(), ZSTD_LEVEL)?)
    } else {
        (0, encoded.to_vec())
    };
    if body.len() > MAX_FRAME {
        Err(Error::FrameTooLarge(body.len()))?
    }
    let mut buf = Vec::with_capacity(PREFIX_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes()); // 4 bytes
    buf.push(flags); // 1 byte
    buf.extend_from_slice(&sent_at.to_le_bytes()); // 8 bytes
    buf.extend_from_slice(&body); // len bytes
    Ok(buf)
}

/// Splits a frame prefix into `(body_len, flags, sent_at)`.
fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<(usize, u8, i64)> {
    let len = LittleEndian::read_u32(&prefix[..4]) as usize;
    if len > MAX_FRAME {
        Err(Error::FrameTooLarge(len))?
    }
    let flags = prefix[4];
    let sent_at = i64::from_le_bytes(*array_ref![prefix, 5, 8]);
    Ok((len, flags, sent_at))
}

fn unframe_body<T: WireMessage>(flags: u8, body: Vec<u8>) -> Result<T> {
    let body = if flags & FLAG_ZSTD != 0 {
        zstd::decode_all(body.as_slice())?
    } else {
        body
    };
    T::decode(&body)
}

pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send<T: WireMessage>(&mut self, msg: &T) -> Result<()> {
        let buf = frame(msg, now_micros())?;
        self.0.write_all(&buf).await?;
        Ok(())
    }

    /// Resolves once the peer stops reading this stream.
    pub async fn stopped(&mut self) {
        let _ = self.0.stopped().await;
    }

    /// Signals that nothing more will be sent on this stream.
    pub async fn finish(&mut self) -> Result<()> {
        self.0.finish().await?;
        Ok(())
    }
}

pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    pub async fn receive<T: WireMessage>(&mut self) -> Result<T> {
        let mut prefix = [0u8; PREFIX_LEN];
        self.0.read_exact(&mut prefix).await?;
        let (len, flags, _sent_at) = parse_prefix(&prefix)?;
        let mut body = vec![0u8; len];
        self.0.read_exact(&mut body).await?;
        unframe_body(flags, body)
    }
}
