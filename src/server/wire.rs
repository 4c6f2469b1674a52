//! Length-prefixed JSON framing for the application server's socket
//! protocol: `"<decimal length> <json bytes>"`, with no trailing delimiter
//! beyond the declared length. Grounded on
//! `original_source/lib/core/components/impl/socketappserver.py`'s
//! `SocketIO.send`/`recv`.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Every response has the fixed shape spec.md §4.6 mandates:
/// `{"status": <OK|failed>, "message": <payload-or-text>}`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub message: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum Status {
    Ok,
    Failed,
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(match self {
            Status::Ok => "OK",
            Status::Failed => "failed",
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("message", &self.message)?;
        map.end()
    }
}

impl Envelope {
    pub fn ok(message: impl Into<Value>) -> Self {
        Envelope { status: Status::Ok, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Envelope { status: Status::Failed, message: Value::String(message.into()) }
    }
}

pub async fn send<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    writer.write_all(format!("{} ", body.len()).as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Returns `None` on a clean EOF before any bytes of a new message arrive.
pub async fn recv<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_digits = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if len_digits.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-frame");
        }
        if byte[0] == b' ' {
            break;
        }
        if !byte[0].is_ascii_digit() {
            bail!("malformed frame length prefix");
        }
        len_digits.push(byte[0]);
        if len_digits.len() > 10 {
            bail!("frame length prefix too long");
        }
    }

    let len: usize = std::str::from_utf8(&len_digits)?.parse()?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn round_trips_a_value() {
        let mut buf = Vec::new();
        send(&mut buf, &json!({"op": "status"})).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Value = recv(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded["op"], "status");
    }

    #[tokio::test]
    async fn clean_eof_before_any_frame_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let decoded: Option<Value> = recv(&mut cursor).await.unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn envelope_serializes_to_fixed_status_message_shape() {
        let value = serde_json::to_value(Envelope::failed("missing appid")).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["message"], "missing appid");

        let value = serde_json::to_value(Envelope::ok(json!({"appid": 3}))).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["message"]["appid"], 3);
    }
}
