//! STOMP 1.2 frame codec plus the chat broker's destination names.
//!
//! Frames travel as WebSocket text messages. A frame is
//! `COMMAND\nheader:value\n…\n\nbody\0`; a bare EOL is a heart-beat.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::models::UserId;

/// Protocol version negotiated on CONNECT.
pub const STOMP_VERSION: &str = "1.2";

/// WebSocket path appended to the broker endpoint.
pub const WS_PATH: &str = "/ws";

/// STOMP header names
pub const HEADER_ACCEPT_VERSION: &str = "accept-version";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_HEART_BEAT: &str = "heart-beat";
pub const HEADER_HOST: &str = "host";
pub const HEADER_ID: &str = "id";
pub const HEADER_MESSAGE: &str = "message";
pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_RECEIPT: &str = "receipt";
pub const HEADER_SUBSCRIPTION: &str = "subscription";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Outbound destinations
pub const SEND_MESSAGE_DESTINATION: &str = "/app/chat.sendMessage";
pub const DELETE_MESSAGE_DESTINATION: &str = "/app/chat.deleteMessage";
pub const CREATE_CONVERSATION_DESTINATION: &str = "/app/chat.createConversation";

const USER_TOPIC_PREFIX: &str = "/topic/user.";
const CONVERSATION_TOPIC_PREFIX: &str = "/topic/conversation.";

/// Inbox topic carrying conversation-update notices for one user.
pub fn user_topic(user_id: UserId) -> String {
    format!("{USER_TOPIC_PREFIX}{user_id}")
}

/// Topic carrying chat messages and delete notices for one conversation.
pub fn conversation_topic(conversation_id: &str) -> String {
    format!("{CONVERSATION_TOPIC_PREFIX}{conversation_id}")
}

/// Inverse of [`conversation_topic`].
pub fn conversation_id_from_topic(destination: &str) -> Option<&str> {
    destination
        .strip_prefix(CONVERSATION_TOPIC_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Codec failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("missing blank line between headers and body")]
    MissingBody,
    #[error("invalid content-length: {0}")]
    ContentLength(String),
}

/// Client and server frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
    Ack,
    Nack,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
        }
    }

    /// CONNECT and CONNECTED headers are not escaped (STOMP 1.2 §Value Encoding).
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header. Repeated headers resolve to the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame carrying the bearer credential.
    pub fn connect(host: &str, credential: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .header(HEADER_ACCEPT_VERSION, STOMP_VERSION)
            .header(HEADER_HOST, host)
            .header(HEADER_HEART_BEAT, heart_beat.to_header_value())
            .header(HEADER_AUTHORIZATION, format!("Bearer {credential}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header(HEADER_ID, id)
            .header(HEADER_DESTINATION, destination)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header(HEADER_ID, id)
    }

    /// SEND frame with a JSON body.
    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header(HEADER_DESTINATION, destination)
            .header(HEADER_CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header(HEADER_RECEIPT, receipt)
    }

    /// Serialize to wire text, adding `content-length` for non-empty bodies.
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

        if !self.body.is_empty() && self.get(HEADER_CONTENT_LENGTH).is_none() {
            out.push_str(HEADER_CONTENT_LENGTH);
            out.push(':');
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode every frame in one text message. Heart-beat EOLs are skipped,
    /// so a heart-beat-only message yields an empty list.
    pub fn decode_all(text: &str) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = text;
        loop {
            rest = rest.trim_start_matches(['\n', '\r']);
            if rest.is_empty() {
                return Ok(frames);
            }
            let (frame, consumed) = decode_one(rest)?;
            frames.push(frame);
            rest = &rest[consumed..];
        }
    }
}

/// Returns the frame and the number of bytes consumed (including the NUL).
fn decode_one(text: &str) -> Result<(Frame, usize), FrameError> {
    let (head, head_len) = match (text.find("\n\n"), text.find("\r\n\r\n")) {
        (Some(a), Some(b)) if b < a => (&text[..b], b + 4),
        (Some(a), _) => (&text[..a], a + 2),
        (None, Some(b)) => (&text[..b], b + 4),
        (None, None) => return Err(FrameError::MissingBody),
    };

    let mut lines = head.lines();
    let command: Command = lines.next().unwrap_or_default().trim_end().parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let after_head = &text[head_len..];
    let content_length = headers
        .iter()
        .find(|(k, _)| k == HEADER_CONTENT_LENGTH)
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FrameError::ContentLength(v.clone()))
        })
        .transpose()?;

    let (body, body_len) = match content_length {
        Some(len) => {
            let body = after_head
                .get(..len)
                .ok_or_else(|| FrameError::ContentLength(len.to_string()))?;
            (body, len)
        }
        None => {
            let end = after_head.find('\0').unwrap_or(after_head.len());
            (&after_head[..end], end)
        }
    };

    let mut consumed = head_len + body_len;
    if text[consumed..].starts_with('\0') {
        consumed += 1;
    }

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        consumed,
    ))
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

fn unescape_header(raw: &str) -> Result<String, FrameError> {
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
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Heart-beat intervals in milliseconds, as carried by the `heart-beat` header:
/// `outgoing` is what this side can send, `incoming` what it wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parse a header value like `10000,10000`.
    pub fn parse(header: &str) -> Option<Self> {
        let (out, inc) = header.split_once(',')?;
        Some(Self {
            outgoing_ms: out.trim().parse().ok()?,
            incoming_ms: inc.trim().parse().ok()?,
        })
    }

    pub fn to_header_value(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Interval at which this side must send heart-beats given the server's
    /// CONNECTED header, or `None` when either side opted out.
    pub fn negotiated_outgoing_ms(&self, server: &HeartBeat) -> Option<u64> {
        if self.outgoing_ms == 0 || server.incoming_ms == 0 {
            None
        } else {
            Some(self.outgoing_ms.max(server.incoming_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn send_frame_encodes_content_length_and_terminator() {
        let frame = Frame::send_json(SEND_MESSAGE_DESTINATION, r#"{"a":1}"#);
        let wire = frame.encode();
        assert_eq!(
            wire,
            "SEND\ndestination:/app/chat.sendMessage\ncontent-type:application/json\ncontent-length:7\n\n{\"a\":1}\0"
        );
    }

    #[test]
    fn decodes_message_with_heart_beats_around_it() {
        let wire = "\n\nMESSAGE\nsubscription:sub-1\ndestination:/topic/conversation.9\n\n{\"x\":1}\0\n";
        let frames = Frame::decode_all(wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Message);
        assert_eq!(frames[0].get(HEADER_SUBSCRIPTION), Some("sub-1"));
        assert_eq!(frames[0].body, "{\"x\":1}");
    }

    #[test]
    fn heart_beat_only_message_is_empty() {
        assert!(Frame::decode_all("\n").unwrap().is_empty());
        assert!(Frame::decode_all("\r\n").unwrap().is_empty());
    }

    #[test]
    fn content_length_allows_nul_in_body() {
        let wire = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frames = Frame::decode_all(wire).unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let wire = format!(
            "{}{}",
            Frame::new(Command::Receipt).header(HEADER_ID, "r-1").encode(),
            Frame::new(Command::Error).header(HEADER_MESSAGE, "boom").encode()
        );
        let frames = Frame::decode_all(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].get(HEADER_MESSAGE), Some("boom"));
    }

    #[test]
    fn repeated_header_resolves_to_first() {
        let wire = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frames = Frame::decode_all(wire).unwrap();
        assert_eq!(frames[0].get("foo"), Some("first"));
    }

    #[test]
    fn rejects_unknown_command_and_bad_escape() {
        assert_eq!(
            Frame::decode_all("HELLO\n\n\0"),
            Err(FrameError::UnknownCommand("HELLO".to_string()))
        );
        assert!(matches!(
            Frame::decode_all("MESSAGE\nfoo:bad\\x\n\n\0"),
            Err(FrameError::InvalidEscape(_))
        ));
    }

    #[test]
    fn connected_headers_are_not_unescaped() {
        let wire = "CONNECTED\nversion:1.2\nserver:broker\\x\n\n\0";
        let frames = Frame::decode_all(wire).unwrap();
        assert_eq!(frames[0].get("server"), Some("broker\\x"));
    }

    #[test]
    fn heart_beat_negotiation() {
        let client = HeartBeat::new(10_000, 10_000);
        assert_eq!(client.negotiated_outgoing_ms(&HeartBeat::new(0, 20_000)), Some(20_000));
        assert_eq!(client.negotiated_outgoing_ms(&HeartBeat::new(5_000, 0)), None);
        assert_eq!(HeartBeat::parse("4000, 0"), Some(HeartBeat::new(4000, 0)));
        assert_eq!(HeartBeat::parse("nope"), None);
    }

    #[test]
    fn topic_names() {
        assert_eq!(user_topic(42), "/topic/user.42");
        assert_eq!(conversation_topic("c1"), "/topic/conversation.c1");
        assert_eq!(conversation_id_from_topic("/topic/conversation.c1"), Some("c1"));
        assert_eq!(conversation_id_from_topic("/topic/user.42"), None);
    }

    proptest! {
        #[test]
        fn header_values_survive_escaping(value in "[a-z:\\\\\r\n ]{0,24}") {
            let frame = Frame::new(Command::Message).header("k", value.clone());
            let decoded = Frame::decode_all(&frame.encode()).unwrap();
            prop_assert_eq!(decoded[0].get("k"), Some(value.as_str()));
        }
    }
}
