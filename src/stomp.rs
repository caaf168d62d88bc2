//! STOMP 1.2 frame codec.
//!
//! Frames are carried one (or more) per WebSocket text message:
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! `^@` is the NUL octet. Bare EOLs between frames are heart-beats and are
//! skipped. Header values are escaped (`\\`, `\n`, `\r`, `\c`) on every
//! frame except `CONNECT` and `CONNECTED`, as the protocol requires.

use crate::error::SyncError;

/// STOMP frame commands used by the push transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Server handshake reply.
    Connected,
    /// Register for a destination.
    Subscribe,
    /// Drop a subscription.
    Unsubscribe,
    /// Publish to a destination.
    Send,
    /// Server-delivered message.
    Message,
    /// Server acknowledgment of a frame carrying `receipt`.
    Receipt,
    /// Server-reported failure.
    Error,
    /// Graceful client shutdown.
    Disconnect,
}

impl Command {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names keep the first occurrence.
    pub headers: Vec<(String, String)>,
    /// Frame body (UTF-8).
    pub body: String,
}

impl Frame {
    /// Frame with no headers and no body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `CONNECT` with bearer auth and heart-beats disabled.
    pub fn connect(host: &str, access_token: &str) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("Authorization", &format!("Bearer {access_token}"))
            .header("heart-beat", "0,0")
    }

    /// `SUBSCRIBE` with automatic acks. Add a `receipt` header to have the
    /// server confirm it.
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// `SEND` of a JSON body.
    pub fn send_json(destination: &str, body: &str) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    /// `DISCONNECT`.
    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Encode to wire text, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decode every frame in a WebSocket text message.
///
/// Heart-beat EOLs decode to no frames.
pub fn decode_all(text: &str) -> Result<Vec<Frame>, SyncError> {
    let mut frames = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str), SyncError> {
    let (command_line, mut rest) = split_line(input)
        .ok_or_else(|| SyncError::Protocol("frame has no command line".to_string()))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| SyncError::Protocol(format!("unknown STOMP command {command_line:?}")))?;

    let mut headers = Vec::new();
    loop {
        let (line, remaining) = split_line(rest)
            .ok_or_else(|| SyncError::Protocol(format!("{command} frame headers not terminated")))?;
        rest = remaining;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SyncError::Protocol(format!("malformed header line {line:?}")))?;
        let (name, value) = if command.escapes_headers() {
            (unescape_header(name)?, unescape_header(value)?)
        } else {
            (name.to_string(), value.to_string())
        };
        headers.push((name, value));
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());

    let body_end = match content_length {
        Some(len)
            if rest.len() > len && rest.as_bytes()[len] == 0 && rest.is_char_boundary(len) =>
        {
            len
        }
        _ => rest
            .find('\0')
            .ok_or_else(|| SyncError::Protocol(format!("{command} frame missing NUL terminator")))?,
    };

    let body = rest[..body_end].to_string();
    Ok((
        Frame {
            command,
            headers,
            body,
        },
        &rest[body_end + 1..],
    ))
}

/// Split off one line, accepting `\n` or `\r\n`.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = input[..idx].strip_suffix('\r').unwrap_or(&input[..idx]);
    Some((line, &input[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, SyncError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(SyncError::Protocol(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_subscribe() {
        let frame = Frame::subscribe("sub-1", "/topic/pushs/7").header("receipt", "sub-1-ack");
        assert_eq!(
            frame.encode(),
            "SUBSCRIBE\nid:sub-1\ndestination:/topic/pushs/7\nack:auto\nreceipt:sub-1-ack\n\n\0"
        );
    }

    #[test]
    fn test_connect_headers_are_not_escaped() {
        let encoded = Frame::connect("localhost", "tok").encode();
        assert!(encoded.starts_with("CONNECT\naccept-version:1.2\n"));
        assert!(encoded.contains("Authorization:Bearer tok\n"));
    }

    #[test]
    fn test_decode_message_frame() {
        let text = concat!(
            "MESSAGE\ndestination:/topic/pushs/7\nsubscription:sub-1\nmessage-id:42\n",
            "\n{\"id\":1}\0"
        );
        let frames = decode_all(text).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-1"));
        assert_eq!(frame.body, "{\"id\":1}");
    }

    #[test]
    fn test_decode_heartbeat_only() {
        assert!(decode_all("\n").unwrap().is_empty());
        assert!(decode_all("\r\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_decode_multiple_frames_with_heartbeats() {
        let text = "RECEIPT\nreceipt-id:sub-1-ack\n\n\0\nMESSAGE\ndestination:/d\n\nhi\0\n";
        let frames = decode_all(text).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Receipt);
        assert_eq!(frames[0].get("receipt-id"), Some("sub-1-ack"));
        assert_eq!(frames[1].body, "hi");
    }

    #[test]
    fn test_decode_crlf_lines() {
        let frames = decode_all("CONNECTED\r\nversion:1.2\r\n\r\n\0").unwrap();
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[0].get("version"), Some("1.2"));
    }

    #[test]
    fn test_header_escaping_survives_decode() {
        let frame = Frame::new(Command::Message).header("note", "a:b\\c\nd");
        let decoded = decode_all(&frame.encode()).unwrap();
        assert_eq!(decoded[0].get("note"), Some("a:b\\c\nd"));
    }

    #[test]
    fn test_content_length_allows_embedded_nul() {
        let text = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frames = decode_all(text).unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let frames = decode_all("MESSAGE\nfoo:1\nfoo:2\n\n\0").unwrap();
        assert_eq!(frames[0].get("foo"), Some("1"));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_all("BOGUS\n\n\0"), Err(SyncError::Protocol(_))));
        assert!(matches!(decode_all("MESSAGE\nfoo:1\n\nbody"), Err(SyncError::Protocol(_))));
        assert!(matches!(decode_all("MESSAGE\nnocolon\n\n\0"), Err(SyncError::Protocol(_))));
        assert!(matches!(decode_all("MESSAGE\nfoo:\\x\n\n\0"), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_error_frame_message_header() {
        let frames = decode_all("ERROR\nmessage:Access denied\n\ndetails\0").unwrap();
        assert_eq!(frames[0].command, Command::Error);
        assert_eq!(frames[0].get("message"), Some("Access denied"));
    }
}
