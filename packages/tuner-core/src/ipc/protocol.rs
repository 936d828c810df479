//! Wire protocol primitives (§4.C, §6).
//!
//! Unix stream sockets carry no message boundaries, so every message is a
//! length-prefixed *multipart frame set* — the same mental model as a
//! ZeroMQ multipart message, just framed by hand: a little-endian `u32`
//! frame count, then for each frame a little-endian `u32` length followed by
//! that many bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{TunerError, TunerResult};

/// A single multipart message: an ordered list of opaque byte frames.
pub type Frames = Vec<Vec<u8>>;

/// Writes a multipart frame set to `writer`.
pub async fn write_frames<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Vec<u8>]) -> TunerResult<()> {
    writer
        .write_u32_le(frames.len() as u32)
        .await
        .map_err(|e| TunerError::TransientIo(e.to_string()))?;
    for frame in frames {
        writer
            .write_u32_le(frame.len() as u32)
            .await
            .map_err(|e| TunerError::TransientIo(e.to_string()))?;
        writer
            .write_all(frame)
            .await
            .map_err(|e| TunerError::TransientIo(e.to_string()))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| TunerError::TransientIo(e.to_string()))?;
    Ok(())
}

/// Reads one multipart frame set from `reader`. Returns `Ok(None)` on clean EOF
/// (connection closed between messages).
pub async fn read_frames<R: AsyncRead + Unpin>(reader: &mut R) -> TunerResult<Option<Frames>> {
    let count = match reader.read_u32_le().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TunerError::TransientIo(e.to_string())),
    };
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader
            .read_u32_le()
            .await
            .map_err(|e| TunerError::TransientIo(e.to_string()))?;
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| TunerError::TransientIo(e.to_string()))?;
        frames.push(buf);
    }
    Ok(Some(frames))
}

/// `msg_type` of a command-socket message (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Req,
    Res,
    Err,
}

impl MsgType {
    #[must_use]
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Req => b"REQ",
            Self::Res => b"RES",
            Self::Err => b"ERR",
        }
    }

    pub fn from_bytes(b: &[u8]) -> TunerResult<Self> {
        match b {
            b"REQ" => Ok(Self::Req),
            b"RES" => Ok(Self::Res),
            b"ERR" => Ok(Self::Err),
            other => Err(TunerError::Protocol(format!(
                "unknown msg_type: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// A decoded command-socket frame (either direction; `target`/`sender` share
/// the first slot depending on which way it travels).
#[derive(Debug, Clone)]
pub struct CommandFrame {
    /// Target identity on send, sender identity on receive.
    pub identity: String,
    pub msg_type: MsgType,
    pub corr_id: Uuid,
    /// Method name; empty on RES/ERR frames.
    pub method: String,
    pub payload: serde_json::Value,
}

impl CommandFrame {
    pub fn into_wire(self) -> Frames {
        vec![
            self.identity.into_bytes(),
            self.msg_type.as_bytes().to_vec(),
            self.corr_id.simple().to_string().into_bytes(),
            self.method.into_bytes(),
            serde_json::to_vec(&self.payload).unwrap_or_else(|_| b"null".to_vec()),
        ]
    }

    pub fn from_wire(mut frames: Frames) -> TunerResult<Self> {
        if frames.len() != 5 {
            return Err(TunerError::Protocol(format!(
                "malformed command frame ({} parts)",
                frames.len()
            )));
        }
        let payload_bytes = frames.pop().unwrap();
        let method_bytes = frames.pop().unwrap();
        let corr_bytes = frames.pop().unwrap();
        let msg_type_bytes = frames.pop().unwrap();
        let identity_bytes = frames.pop().unwrap();

        let identity = String::from_utf8(identity_bytes)
            .map_err(|e| TunerError::Protocol(e.to_string()))?;
        let msg_type = MsgType::from_bytes(&msg_type_bytes)?;
        let corr_id_str =
            String::from_utf8(corr_bytes).map_err(|e| TunerError::Protocol(e.to_string()))?;
        let corr_id = Uuid::parse_str(&corr_id_str).map_err(|e| TunerError::Protocol(e.to_string()))?;
        let method =
            String::from_utf8(method_bytes).map_err(|e| TunerError::Protocol(e.to_string()))?;
        let payload: serde_json::Value =
            serde_json::from_slice(&payload_bytes).unwrap_or(serde_json::Value::Null);

        Ok(Self {
            identity,
            msg_type,
            corr_id,
            method,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn frames_round_trip_through_a_buffer() {
        let frames: Frames = vec![b"a".to_vec(), b"bc".to_vec(), vec![]];
        let mut buf = Vec::new();
        write_frames(&mut buf, &frames).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_frames(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, frames);
    }

    #[tokio::test]
    async fn empty_reader_yields_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frames(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn command_frame_round_trips_through_wire_encoding() {
        let frame = CommandFrame {
            identity: "state".to_string(),
            msg_type: MsgType::Req,
            corr_id: Uuid::new_v4(),
            method: "get".to_string(),
            payload: serde_json::json!({"key": "now_playing"}),
        };
        let corr_id = frame.corr_id;
        let wire = frame.into_wire();
        let decoded = CommandFrame::from_wire(wire).unwrap();
        assert_eq!(decoded.identity, "state");
        assert_eq!(decoded.corr_id, corr_id);
        assert_eq!(decoded.method, "get");
        assert_eq!(decoded.payload["key"], "now_playing");
    }

    #[test]
    fn malformed_frame_count_is_a_protocol_error() {
        let frames: Frames = vec![b"only_one".to_vec()];
        let err = CommandFrame::from_wire(frames).unwrap_err();
        assert_eq!(err.to_string().contains("malformed"), true);
    }
}
