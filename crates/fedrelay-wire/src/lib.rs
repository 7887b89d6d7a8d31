// Line-oriented wire format for the replication protocol.
use bytes::{Buf, BytesMut};

/// Position value marking a continuation of an open row batch.
pub const BATCH_POSITION: &str = "batch";

/// Position value requesting a subscription from the latest position.
pub const LATEST_POSITION: &str = "-1";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command} command is missing the {field} field")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
    #[error("line is not valid utf-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// One replication command, in either direction.
///
/// Commands are single lines of space-separated fields. The final field of
/// `NAME`, `PING`, `SERVER`, `ERROR` and `RDATA` is taken verbatim up to
/// end-of-line, so row JSON and error text may contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Client identification, sent immediately on connect.
    Name { client: String },
    /// Stream subscription request; `LATEST_POSITION` means "latest".
    Replicate { stream: String, position: String },
    /// Keepalive with an opaque payload, valid in both directions.
    Ping { payload: String },
    /// Remote server identifier, first message from the server.
    Server { name: String },
    /// One row for a stream. A `BATCH_POSITION` position continues an open
    /// batch; anything else closes it and becomes the new cursor.
    Rdata {
        stream: String,
        position: String,
        row: String,
    },
    /// Authoritative cursor for a stream, with no rows attached.
    Position { stream: String, position: String },
    /// Fatal protocol error from the server.
    Error { message: String },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, rest),
            None => (line, ""),
        };
        match word {
            "NAME" => Ok(Command::Name {
                client: required(rest, "NAME", "client")?.to_string(),
            }),
            "REPLICATE" => {
                let (stream, position) = two_fields(rest, "REPLICATE")?;
                Ok(Command::Replicate { stream, position })
            }
            "PING" => Ok(Command::Ping {
                payload: required(rest, "PING", "payload")?.to_string(),
            }),
            "SERVER" => Ok(Command::Server {
                name: required(rest, "SERVER", "name")?.to_string(),
            }),
            "RDATA" => {
                let (stream, rest) = rest.split_once(' ').ok_or(Error::MissingField {
                    command: "RDATA",
                    field: "position",
                })?;
                let (position, row) = rest.split_once(' ').ok_or(Error::MissingField {
                    command: "RDATA",
                    field: "row",
                })?;
                Ok(Command::Rdata {
                    stream: required(stream, "RDATA", "stream")?.to_string(),
                    position: position.to_string(),
                    row: row.to_string(),
                })
            }
            "POSITION" => {
                let (stream, position) = two_fields(rest, "POSITION")?;
                Ok(Command::Position { stream, position })
            }
            "ERROR" => Ok(Command::Error {
                message: rest.to_string(),
            }),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }

    /// Render the command as a single line, without the terminator.
    pub fn encode(&self) -> String {
        match self {
            Command::Name { client } => format!("NAME {client}"),
            Command::Replicate { stream, position } => format!("REPLICATE {stream} {position}"),
            Command::Ping { payload } => format!("PING {payload}"),
            Command::Server { name } => format!("SERVER {name}"),
            Command::Rdata {
                stream,
                position,
                row,
            } => format!("RDATA {stream} {position} {row}"),
            Command::Position { stream, position } => format!("POSITION {stream} {position}"),
            Command::Error { message } => format!("ERROR {message}"),
        }
    }
}

fn required<'a>(value: &'a str, command: &'static str, field: &'static str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(Error::MissingField { command, field });
    }
    Ok(value)
}

fn two_fields(rest: &str, command: &'static str) -> Result<(String, String)> {
    let (stream, position) = rest.split_once(' ').ok_or(Error::MissingField {
        command,
        field: "position",
    })?;
    let stream = required(stream, command, "stream")?;
    let position = required(position, command, "position")?;
    Ok((stream.to_string(), position.to_string()))
}

/// Incremental `\n`-framed line decoder.
///
/// Bytes are pushed in as they arrive from the socket; complete lines come
/// out. Records split across reads and multiple records per read are both
/// handled; the newline is authoritative, never readiness of the socket.
/// A trailing `\r` is stripped and empty lines are discarded.
///
/// ```
/// use fedrelay_wire::LineDecoder;
///
/// let mut decoder = LineDecoder::new();
/// decoder.extend(b"PING 17\nPI");
/// assert_eq!(decoder.next_line().expect("line"), Some("PING 17".to_string()));
/// assert_eq!(decoder.next_line().expect("line"), None);
/// decoder.extend(b"NG 18\n");
/// assert_eq!(decoder.next_line().expect("line"), Some("PING 18".to_string()));
/// ```
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let end = match self.buf.iter().position(|byte| *byte == b'\n') {
                Some(end) => end,
                None => return Ok(None),
            };
            let mut line = self.buf.split_to(end);
            self.buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Ok(Some(std::str::from_utf8(&line)?.to_string()));
        }
    }
}
