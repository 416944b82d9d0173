//! The framed, typed record format used on every Connection socket and on
//! the tracker TCP channel: `u32 length | u8 tag | bincode(payload)`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::model::{FileId, FilePieceSpecs, Piece, PieceSpecSet, Predicate};

/// Largest record this codec will accept off the wire. Bounds memory use
/// against a peer declaring an absurd length.
pub const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum Message {
    Notice(PieceSpecSet),
    Request(PieceSpecSet),
    Piece(Piece),
    AddendumSpec(FilePieceSpecs),
    Removal(FileId),
}

#[repr(u8)]
enum Tag {
    Notice = 0,
    Request = 1,
    Piece = 2,
    AddendumSpec = 3,
    Removal = 4,
    Handshake = 5,
}

impl Tag {
    fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Tag::Notice,
            1 => Tag::Request,
            2 => Tag::Piece,
            3 => Tag::AddendumSpec,
            4 => Tag::Removal,
            5 => Tag::Handshake,
            other => return Err(Error::Decode(format!("unknown wire tag {other}"))),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Decode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| Error::Decode(e.to_string()))
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: Tag,
    payload: &[u8],
) -> Result<(), Error> {
    let len = payload.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(Error::PeerIo)?;
    writer
        .write_u8(tag as u8)
        .await
        .map_err(Error::PeerIo)?;
    writer.write_all(payload).await.map_err(Error::PeerIo)?;
    writer.flush().await.map_err(Error::PeerIo)?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Tag, Vec<u8>), Error> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| Error::PeerDisconnected)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_RECORD_BYTES {
        return Err(Error::LengthMismatch {
            declared: len as usize,
            available: MAX_RECORD_BYTES as usize,
        });
    }
    let tag = Tag::from_u8(reader.read_u8().await.map_err(Error::PeerIo)?)?;
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(Error::PeerIo)?;
    Ok((tag, payload))
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), Error> {
    let (tag, payload) = match message {
        Message::Notice(s) => (Tag::Notice, encode(s)?),
        Message::Request(s) => (Tag::Request, encode(s)?),
        Message::Piece(p) => (Tag::Piece, encode(p)?),
        Message::AddendumSpec(s) => (Tag::AddendumSpec, encode(s)?),
        Message::Removal(id) => (Tag::Removal, encode(id)?),
    };
    write_frame(writer, tag, &payload).await
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, Error> {
    let (tag, payload) = read_frame(reader).await?;
    Ok(match tag {
        Tag::Notice => Message::Notice(decode(&payload)?),
        Tag::Request => Message::Request(decode(&payload)?),
        Tag::Piece => Message::Piece(decode(&payload)?),
        Tag::AddendumSpec => Message::AddendumSpec(decode(&payload)?),
        Tag::Removal => Message::Removal(decode(&payload)?),
        Tag::Handshake => {
            return Err(Error::ProtocolViolation(
                "unexpected handshake record mid-stream".to_string(),
            ));
        }
    });
}

/// Writes the local `Predicate` as the handshake record on a freshly opened
/// REQUEST socket.
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    writer: &mut W,
    predicate: &Predicate,
) -> Result<(), Error> {
    let payload = encode(predicate)?;
    write_frame(writer, Tag::Handshake, &payload).await
}

pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Predicate, Error> {
    let (tag, payload) = read_frame(reader).await?;
    match tag {
        Tag::Handshake => decode(&payload),
        _ => Err(Error::ProtocolViolation(
            "expected handshake record first".to_string(),
        )),
    }
}
