//! Obfuscator hooks
//!
//! The multiplexer never touches the wire directly; it hands every outbound
//! [`Frame`] to [`Obfuscator::encode`] and receives inbound frames through
//! [`Obfuscator::read_record`] + [`Obfuscator::decode`]. The hook object is
//! supplied at session construction and never replaced, so any carrier
//! disguise that can express these three operations plugs into the same
//! multiplexer.
//!
//! Two implementations ship here:
//!
//! - [`PlainObfuscator`]: framing only. A record is a 2-byte big-endian
//!   length prefix followed by the 9-byte frame header and the payload.
//! - [`AeadObfuscator`]: the same header + payload sealed with AES-256-GCM
//!   or ChaCha20-Poly1305; a random 12-byte nonce travels at the front of
//!   the record.

use crate::crypto::{self, AeadSuite, CryptoError, RecordCipher, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::mux::{Frame, MuxError, MAX_RECORD_SIZE};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame header bytes inside a record: stream_id (4) + seq (4) + closing (1),
/// all big-endian.
pub const FRAME_HEADER_SIZE: usize = 9;

/// The three operations the multiplexer consumes from the carrier disguise.
#[async_trait]
pub trait Obfuscator: Send + Sync {
    /// Produce one carrier-ready record containing exactly this frame.
    fn encode(&self, frame: &Frame) -> Result<Bytes, MuxError>;

    /// Inverse of [`encode`](Self::encode), minus the carrier length prefix.
    /// An integrity failure is a fatal protocol violation on that carrier.
    fn decode(&self, record: &[u8]) -> Result<Frame, MuxError>;

    /// Read exactly one carrier record into `buf`, returning its length.
    /// Blocks until a full record is available; short reads never surface.
    async fn read_record(
        &self,
        carrier: &mut (dyn AsyncRead + Send + Unpin),
        buf: &mut [u8],
    ) -> io::Result<usize>;
}

/// Build the obfuscator for an encryption method byte (0x00 plain,
/// 0x01 AES-256-GCM, 0x02 ChaCha20-Poly1305) and record key.
pub fn generate(method: u8, key: [u8; KEY_LEN]) -> Result<Arc<dyn Obfuscator>, CryptoError> {
    match AeadSuite::from_method_byte(method)? {
        None => Ok(Arc::new(PlainObfuscator)),
        Some(suite) => Ok(Arc::new(AeadObfuscator::new(suite, &key)?)),
    }
}

fn put_header(buf: &mut BytesMut, frame: &Frame) {
    buf.put_u32(frame.stream_id);
    buf.put_u32(frame.seq);
    buf.put_u8(frame.closing);
}

fn parse_body(body: &[u8]) -> Result<Frame, MuxError> {
    if body.len() < FRAME_HEADER_SIZE {
        return Err(MuxError::ProtocolViolation(format!(
            "record body too short: {} bytes",
            body.len()
        )));
    }
    let stream_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let seq = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let closing = body[8];
    Ok(Frame {
        stream_id,
        seq,
        closing,
        payload: Bytes::copy_from_slice(&body[FRAME_HEADER_SIZE..]),
    })
}

/// Read one length-prefixed record. Both shipped obfuscators frame records
/// the same way on the carrier; only the record contents differ.
async fn read_length_prefixed(
    carrier: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut len_buf = [0u8; 2];
    carrier.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record of {} bytes exceeds read buffer", len),
        ));
    }
    carrier.read_exact(&mut buf[..len]).await?;
    Ok(len)
}

/// Framing-only obfuscator. Useful on carriers that already encrypt
/// (and as the identity hook in tests).
pub struct PlainObfuscator;

#[async_trait]
impl Obfuscator for PlainObfuscator {
    fn encode(&self, frame: &Frame) -> Result<Bytes, MuxError> {
        let body_len = FRAME_HEADER_SIZE + frame.payload.len();
        if body_len > MAX_RECORD_SIZE {
            return Err(MuxError::ProtocolViolation(format!(
                "frame of {} bytes exceeds record size",
                body_len
            )));
        }
        let mut buf = BytesMut::with_capacity(2 + body_len);
        buf.put_u16(body_len as u16);
        put_header(&mut buf, frame);
        buf.extend_from_slice(&frame.payload);
        Ok(buf.freeze())
    }

    fn decode(&self, record: &[u8]) -> Result<Frame, MuxError> {
        parse_body(record)
    }

    async fn read_record(
        &self,
        carrier: &mut (dyn AsyncRead + Send + Unpin),
        buf: &mut [u8],
    ) -> io::Result<usize> {
        read_length_prefixed(carrier, buf).await
    }
}

/// AEAD obfuscator: header + payload sealed per record, explicit nonce.
pub struct AeadObfuscator {
    cipher: RecordCipher,
}

impl AeadObfuscator {
    pub fn new(suite: AeadSuite, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: RecordCipher::new(suite, key)?,
        })
    }
}

#[async_trait]
impl Obfuscator for AeadObfuscator {
    fn encode(&self, frame: &Frame) -> Result<Bytes, MuxError> {
        let record_len = NONCE_LEN + FRAME_HEADER_SIZE + frame.payload.len() + TAG_LEN;
        if record_len > MAX_RECORD_SIZE {
            return Err(MuxError::ProtocolViolation(format!(
                "frame of {} bytes exceeds record size",
                record_len
            )));
        }

        let mut body = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        put_header(&mut body, frame);
        body.extend_from_slice(&frame.payload);
        let mut sealed = body.to_vec();

        let mut nonce = [0u8; NONCE_LEN];
        crypto::random_bytes(&mut nonce);
        self.cipher.seal(nonce, &[], &mut sealed)?;

        let mut buf = BytesMut::with_capacity(2 + record_len);
        buf.put_u16(record_len as u16);
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&sealed);
        Ok(buf.freeze())
    }

    fn decode(&self, record: &[u8]) -> Result<Frame, MuxError> {
        if record.len() < NONCE_LEN + TAG_LEN + FRAME_HEADER_SIZE {
            return Err(MuxError::ProtocolViolation(format!(
                "sealed record too short: {} bytes",
                record.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&record[..NONCE_LEN]);

        let mut sealed = record[NONCE_LEN..].to_vec();
        let body = self
            .cipher
            .open(nonce, &[], &mut sealed)
            .map_err(|e| MuxError::ProtocolViolation(format!("record rejected: {}", e)))?;
        parse_body(body)
    }

    async fn read_record(
        &self,
        carrier: &mut (dyn AsyncRead + Send + Unpin),
        buf: &mut [u8],
    ) -> io::Result<usize> {
        read_length_prefixed(carrier, buf).await
    }
}
