use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every DiME frame starts with these four bytes.
pub const MAGIC: &[u8; 4] = b"DiME";
pub const HEADER_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {0} bytes, shorter than the 12 byte header")]
    TooShort(usize),
    #[error("frame does not start with the DiME magic")]
    BadMagic,
    #[error("frame declares {expected} bytes of body but carries {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("frame section exceeds the 4 GiB length field")]
    TooLarge,
    #[error("invalid JSON in frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Serialization {
    #[default]
    #[serde(rename = "dimejson")]
    DimeJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Handshake {
        serialization: Serialization,
        tls: bool,
    },
    Join {
        name: Vec<String>,
    },
    Send {
        name: String,
        varname: String,
        serialization: Serialization,
    },
    Sync {
        n: usize,
    },
    Wait,
    Devices,
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Handshake { .. } => "handshake",
            Command::Join { .. } => "join",
            Command::Send { .. } => "send",
            Command::Sync { .. } => "sync",
            Command::Wait => "wait",
            Command::Devices => "devices",
        }
    }
}

/// Server reply header. `status` is 0 for done, 1 for a data item that
/// carries `varname` plus a payload, and negative for errors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reply {
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub varname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<Serialization>,
}

impl Reply {
    pub const DONE: i64 = 0;
    pub const ITEM: i64 = 1;

    pub fn is_error(&self) -> bool {
        self.status < 0
    }
}

/// JSON header plus opaque binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Value,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new<H: Serialize>(header: &H, payload: Vec<u8>) -> Result<Self, FrameError> {
        Ok(Self {
            header: serde_json::to_value(header)?,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let header = serde_json::to_vec(&self.header)?;
        let header_len = u32::try_from(header.len()).map_err(|_| FrameError::TooLarge)?;
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| FrameError::TooLarge)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + header.len() + self.payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&header_len.to_be_bytes());
        bytes.extend_from_slice(&payload_len.to_be_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if &bytes[..4] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        let header_len = read_u32(&bytes[4..8]);
        let payload_len = read_u32(&bytes[8..12]);

        let body = &bytes[HEADER_LEN..];
        let expected = header_len + payload_len;
        if body.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: body.len(),
            });
        }

        Ok(Self {
            header: serde_json::from_slice(&body[..header_len])?,
            payload: body[header_len..].to_vec(),
        })
    }

    pub fn reply(&self) -> Result<Reply, FrameError> {
        Ok(Reply::deserialize(&self.header)?)
    }
}

fn read_u32(bytes: &[u8]) -> usize {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw) as usize
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>, FrameError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_value(payload: &[u8]) -> Result<Value, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}
