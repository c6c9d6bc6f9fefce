//! Line-delimited JSON request protocol.
//!
//! Each input line is one [`Request`]; each request gets exactly one
//! [`Response`] line carrying the same `id`.
//!
//! Secrets and secret values are held in [`Zeroizing`] containers from the
//! moment they are parsed until the response line has been written.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use zeroize::Zeroizing;

use mqvault_common::{Error, Result, SecretId};

/// How a secret value is represented in JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueEncoding {
    #[default]
    Utf8,
    Base64,
}

impl ValueEncoding {
    /// Turn a request value into plaintext bytes.
    pub fn decode(self, value: &str) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            ValueEncoding::Utf8 => Ok(Zeroizing::new(value.as_bytes().to_vec())),
            ValueEncoding::Base64 => STANDARD
                .decode(value)
                .map(Zeroizing::new)
                .map_err(|e| Error::InvalidInput(format!("Invalid base64 value: {}", e))),
        }
    }

    /// Turn plaintext bytes into a response value.
    pub fn encode(self, plaintext: &[u8]) -> Result<Zeroizing<String>> {
        match self {
            ValueEncoding::Utf8 => std::str::from_utf8(plaintext)
                .map(|text| Zeroizing::new(text.to_owned()))
                .map_err(|_| {
                    Error::InvalidInput("Value is not UTF-8, request base64 encoding".to_string())
                }),
            ValueEncoding::Base64 => Ok(Zeroizing::new(STANDARD.encode(plaintext))),
        }
    }
}

/// One operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Initialize {
        secret: Zeroizing<String>,
    },
    Unlock {
        secret: Zeroizing<String>,
    },
    Lock,
    Seal {
        key: String,
        value: Zeroizing<String>,
        #[serde(default)]
        encoding: ValueEncoding,
    },
    Open {
        key: String,
        #[serde(default)]
        encoding: ValueEncoding,
    },
    Delete {
        key: String,
    },
    List,
    ChangeMasterSecret {
        old: Zeroizing<String>,
        new: Zeroizing<String>,
    },
    Rotate {
        key: String,
    },
    RotateDataKey {
        secret: Zeroizing<String>,
    },
    RotateAll,
    Status,
    Shutdown,
}

impl Command {
    /// Operation name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize { .. } => "initialize",
            Command::Unlock { .. } => "unlock",
            Command::Lock => "lock",
            Command::Seal { .. } => "seal",
            Command::Open { .. } => "open",
            Command::Delete { .. } => "delete",
            Command::List => "list",
            Command::ChangeMasterSecret { .. } => "change_master_secret",
            Command::Rotate { .. } => "rotate",
            Command::RotateDataKey { .. } => "rotate_data_key",
            Command::RotateAll => "rotate_all",
            Command::Status => "status",
            Command::Shutdown => "shutdown",
        }
    }

    /// Whether the command changes vault state or key material.
    ///
    /// Such commands run alone: earlier requests finish first and later
    /// ones wait for them.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            Command::Initialize { .. }
                | Command::Unlock { .. }
                | Command::Lock
                | Command::ChangeMasterSecret { .. }
                | Command::RotateDataKey { .. }
                | Command::RotateAll
                | Command::Shutdown
        )
    }
}

/// A request line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Request {
    /// Client correlation id, echoed verbatim.
    #[serde(default)]
    pub id: Value,
    /// Per-request limit for each store call, overriding the default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub command: Command,
}

/// Just the id of a request line, other fields skipped unread.
#[derive(Deserialize)]
struct RequestId {
    #[serde(default)]
    id: Value,
}

impl Request {
    /// Parse one input line.
    ///
    /// On failure the returned id is the request's own id when the line is
    /// JSON carrying one, `null` otherwise.
    pub fn parse(line: &str) -> std::result::Result<Self, (Value, Error)> {
        serde_json::from_str(line).map_err(|invalid| {
            match serde_json::from_str::<RequestId>(line) {
                Ok(RequestId { id }) => (
                    id,
                    Error::InvalidInput(format!("Invalid request: {}", invalid)),
                ),
                Err(e) => (
                    Value::Null,
                    Error::InvalidInput(format!("Malformed request: {}", e)),
                ),
            }
        })
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// A secret value returned by `open`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenedValue {
    pub key: SecretId,
    pub value: Zeroizing<String>,
    pub encoding: ValueEncoding,
}

/// Result payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome {
    Value(Value),
    Opened(OpenedValue),
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<OpenedValue> for Outcome {
    fn from(opened: OpenedValue) -> Self {
        Outcome::Opened(opened)
    }
}

/// A response line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: Value, result: impl Into<Outcome>) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &Error) -> Self {
        let retry_after_ms = match error {
            Error::TooManyAttempts { retry_after } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: error.kind().as_str(),
                message: error.to_string(),
                retry_after_ms,
            }),
        }
    }

    /// Serialize as a single newline-terminated line.
    ///
    /// The buffer is sized up front so it is never reallocated, leaving no
    /// stray copy of a secret value behind.
    pub fn to_line(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut counter = ByteCounter(0);
        serde_json::to_writer(&mut counter, self)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut line = Zeroizing::new(Vec::with_capacity(counter.0 + 1));
        serde_json::to_writer(&mut *line, self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
