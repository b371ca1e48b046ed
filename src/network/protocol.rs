//! Snapshot distribution wire protocol.
//!
//! Requests are single UTF-8 lines, `<verb> [board]\n`. Every reply is one
//! frame: a 4-byte big-endian payload length followed by the JSON encoding of
//! a [`Reply`].
//!
//! ```text
//! client: "temperature 3\n"
//! server: 00 00 00 1b ["21.5","22.0","21.75","22.1"]
//! ```

use crate::error::{ScError, ScResult};
use crate::reading::VoltageTriple;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};

/// Upper bound on an accepted reply payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Upper bound on one request line, newline excluded.
pub const MAX_REQUEST_LEN: usize = 1024;

pub const HELP_TEXT: &str = "\
Welcome to the sEPD slow controls server

Usage:
\ttemperature x\t\tReads the temperatures of interface board x
\tvoltage x\t\tReads the voltages of interface board x
\tcurrent x\t\tReads the SiPM currents of interface board x
\tshutdown\t\tStops the server
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Temperature,
    Voltage,
    Current,
    Help,
    Shutdown,
}

impl Verb {
    /// Case-insensitive; `h` and `?` are accepted for help.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "temperature" => Some(Verb::Temperature),
            "voltage" => Some(Verb::Voltage),
            "current" => Some(Verb::Current),
            "help" | "h" | "?" => Some(Verb::Help),
            "shutdown" => Some(Verb::Shutdown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Temperature => "temperature",
            Verb::Voltage => "voltage",
            Verb::Current => "current",
            Verb::Help => "help",
            Verb::Shutdown => "shutdown",
        }
    }

    pub fn takes_board(self) -> bool {
        matches!(self, Verb::Temperature | Verb::Voltage | Verb::Current)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Command {
        verb: Verb,
        /// Raw board token, validated by the handler.
        board: Option<String>,
    },
    Unknown(String),
}

impl Request {
    pub fn new(verb: Verb, board: Option<usize>) -> Self {
        Request::Command {
            verb,
            board: board.map(|b| b.to_string()),
        }
    }

    /// `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let first = tokens.next()?;
        Some(match Verb::parse(first) {
            Some(verb) => Request::Command {
                verb,
                board: tokens.next().map(str::to_string),
            },
            None => Request::Unknown(first.to_string()),
        })
    }

    /// Wire form, including the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Request::Command {
                verb,
                board: Some(board),
            } => format!("{verb} {board}\n"),
            Request::Command { verb, board: None } => format!("{verb}\n"),
            Request::Unknown(token) => format!("{token}\n"),
        }
    }
}

/// Validate a board token against the number of boards served.
pub fn board_index(board: Option<&str>, boards: usize) -> Result<usize, String> {
    let token = board.ok_or_else(|| "missing board number".to_string())?;
    let index: usize = token
        .parse()
        .map_err(|_| format!("'{token}' is not a board number"))?;
    if index >= boards {
        return Err(format!("board {index} out of range 0-{}", boards.saturating_sub(1)));
    }
    Ok(index)
}

/// Reply payload.
///
/// Encoded untagged: a string, a list of numeric strings, a voltage mapping
/// or `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Empty,
    Text(String),
    Values(Vec<String>),
    Voltages(VoltageTriple),
}

impl Reply {
    /// Reply as floats; `None` unless this is a value list of numbers.
    pub fn as_floats(&self) -> Option<Vec<f64>> {
        match self {
            Reply::Values(values) => values.iter().map(|v| v.parse().ok()).collect(),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Empty => f.write_str("(no data)"),
            Reply::Text(text) => f.write_str(text),
            Reply::Values(values) => f.write_str(&values.join(" ")),
            Reply::Voltages(v) => write!(
                f,
                "positive={} negative={} bias={}",
                v.positive, v.negative, v.bias
            ),
        }
    }
}

/// Read one request line of at most [`MAX_REQUEST_LEN`] bytes.
///
/// Returns `None` at end of stream. A longer line is a `Protocol` error; the
/// rest of it is left unread.
pub async fn read_request_line<R>(reader: &mut R) -> ScResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let limit = MAX_REQUEST_LEN as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut raw).await?;
    if read == 0 {
        return Ok(None);
    }
    if raw.last() != Some(&b'\n') && raw.len() > MAX_REQUEST_LEN {
        return Err(ScError::Protocol(format!(
            "request line exceeds {MAX_REQUEST_LEN} bytes"
        )));
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

pub fn encode_frame(reply: &Reply) -> ScResult<Vec<u8>> {
    let payload = serde_json::to_vec(reply)
        .map_err(|e| ScError::Protocol(format!("encoding reply: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ScError::Protocol("reply too large".into()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub async fn write_frame<W>(writer: &mut W, reply: &Reply) -> ScResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(reply)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> ScResult<Reply>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ScError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| ScError::Protocol(format!("decoding reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_lines() {
        assert_eq!(
            Request::parse("temperature 3\n"),
            Some(Request::new(Verb::Temperature, Some(3)))
        );
        assert_eq!(
            Request::parse("  VOLTAGE   11 "),
            Some(Request::new(Verb::Voltage, Some(11)))
        );
        assert_eq!(
            Request::parse("current"),
            Some(Request::new(Verb::Current, None))
        );
        assert_eq!(Request::parse("?"), Some(Request::new(Verb::Help, None)));
        assert_eq!(
            Request::parse("reboot now"),
            Some(Request::Unknown("reboot".into()))
        );
        assert_eq!(Request::parse("   \r\n"), None);
    }

    #[test]
    fn request_line_round_trips() {
        let request = Request::new(Verb::Current, Some(7));
        assert_eq!(request.to_line(), "current 7\n");
        assert_eq!(Request::parse(&request.to_line()), Some(request));
    }

    #[test]
    fn board_index_reports_readable_errors() {
        assert_eq!(board_index(Some("3"), 12), Ok(3));
        assert!(board_index(None, 12).unwrap_err().contains("missing"));
        assert!(board_index(Some("x"), 12).unwrap_err().contains("'x'"));
        assert!(board_index(Some("12"), 12).unwrap_err().contains("out of range"));
    }

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let frame = encode_frame(&Reply::Text("ok".into())).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 4]);
        assert_eq!(&frame[4..], b"\"ok\"");
    }

    #[test]
    fn untagged_payload_shapes() {
        let cases = [
            (Reply::Empty, "null"),
            (
                Reply::Values(vec!["21.50".into(), "22.0".into()]),
                r#"["21.50","22.0"]"#,
            ),
            (
                Reply::Voltages(VoltageTriple {
                    positive: 5.0,
                    negative: -5.0,
                    bias: 60.0,
                }),
                r#"{"positive":5.0,"negative":-5.0,"bias":60.0}"#,
            ),
        ];
        for (reply, json) in cases {
            assert_eq!(serde_json::to_string(&reply).unwrap(), json);
            assert_eq!(serde_json::from_str::<Reply>(json).unwrap(), reply);
        }
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reply = Reply::Values(vec!["1.0".into(), "2.5".into()]);
        write_frame(&mut server, &reply).await.unwrap();
        write_frame(&mut server, &Reply::Empty).await.unwrap();

        let first = read_frame(&mut client).await.unwrap();
        assert_eq!(first.as_floats(), Some(vec![1.0, 2.5]));
        assert_eq!(read_frame(&mut client).await.unwrap(), Reply::Empty);
    }

    #[tokio::test]
    async fn request_lines_are_bounded() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = tokio::io::BufReader::new(server);
        let long = "x".repeat(MAX_REQUEST_LEN + 10);
        client
            .write_all(format!("temperature 3\n{}\n", "y".repeat(MAX_REQUEST_LEN)).as_bytes())
            .await
            .unwrap();
        client.write_all(long.as_bytes()).await.unwrap();

        let first = read_request_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, "temperature 3\n");
        let limit = read_request_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(limit.trim_end().len(), MAX_REQUEST_LEN);
        assert!(matches!(
            read_request_line(&mut reader).await,
            Err(ScError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn request_reader_ends_at_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = tokio::io::BufReader::new(server);
        client.write_all(b"help").await.unwrap();
        drop(client);

        assert_eq!(
            read_request_line(&mut reader).await.unwrap().as_deref(),
            Some("help")
        );
        assert!(read_request_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut client).await,
            Err(ScError::Protocol(_))
        ));
    }
}
