//! Prefixed line protocol spoken between the relay and its clients.
//!
//! Every logical message is one line of UTF-8 text:
//!
//! - `MSG:<text>` chat content sent by a client
//! - `NAME:<name>` identity handshake sent by a client
//! - `FROM:<name>:<text>` chat relayed by the server
//! - `SYS:<text>` notice emitted by the server
//!
//! [`FrameCodec`] turns the bytes delivered by successive socket reads into
//! decoded [`Message`]s.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;
use tracing::warn;

pub const MSG_PREFIX: &str = "MSG:";
pub const NAME_PREFIX: &str = "NAME:";
pub const FROM_PREFIX: &str = "FROM:";
pub const SYS_PREFIX: &str = "SYS:";

/// Longest unterminated line a [`FrameCodec`] holds before discarding it.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Chat { text: String },
    NameAnnounce { name: String },
    Relayed { sender: String, text: String },
    SystemNotice { text: String },
    /// Payload that matched no prefix, or a `FROM:` line without a sender
    /// separator. Carries the trimmed raw text.
    Unrecognized(String),
}

impl Message {
    pub fn chat(text: impl Into<String>) -> Self {
        Self::Chat { text: text.into() }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self::NameAnnounce { name: name.into() }
    }

    pub fn relayed(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Relayed {
            sender: sender.into(),
            text: text.into(),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::SystemNotice { text: text.into() }
    }

    /// Encodes the message as a single newline-terminated line.
    ///
    /// Line breaks inside field values are flattened to spaces so that one
    /// message never spans more than one line on the wire.
    pub fn encode(&self) -> Bytes {
        let line = match self {
            Self::Chat { text } => format!("{MSG_PREFIX}{}", flatten(text)),
            Self::NameAnnounce { name } => format!("{NAME_PREFIX}{}", flatten(name)),
            Self::Relayed { sender, text } => {
                format!("{FROM_PREFIX}{}:{}", flatten(sender), flatten(text))
            }
            Self::SystemNotice { text } => format!("{SYS_PREFIX}{}", flatten(text)),
            Self::Unrecognized(raw) => flatten(raw),
        };

        let mut encoded = BytesMut::with_capacity(line.len() + 1);
        encoded.put_slice(line.as_bytes());
        encoded.put_u8(b'\n');
        encoded.freeze()
    }

    /// Decodes one payload. Never fails: anything that is not a well-formed
    /// message comes back as [`Message::Unrecognized`].
    pub fn decode(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        parse(text.trim())
    }
}

fn parse(raw: &str) -> Message {
    if let Some(text) = raw.strip_prefix(SYS_PREFIX) {
        return Message::notice(text.trim());
    }

    if let Some(rest) = raw.strip_prefix(FROM_PREFIX) {
        return match rest.split_once(':') {
            Some((sender, text)) => Message::relayed(sender.trim(), text.trim()),
            None => Message::Unrecognized(raw.to_string()),
        };
    }

    if let Some(text) = raw.strip_prefix(MSG_PREFIX) {
        return Message::chat(text.trim());
    }

    if let Some(name) = raw.strip_prefix(NAME_PREFIX) {
        return Message::name(name.trim());
    }

    Message::Unrecognized(raw.to_string())
}

fn flatten(value: &str) -> String {
    if value.contains(LINE_ENDINGS) {
        value.replace(LINE_ENDINGS, " ")
    } else {
        value.to_string()
    }
}

/// How a byte stream is split into messages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Messages are newline-terminated and may span or share reads.
    #[default]
    Lines,
    /// Every read is one message. Matches peers that never send a newline,
    /// at the cost of mis-decoding messages split across reads.
    Chunks,
}

/// Splits a byte stream into [`Message`]s for `FramedRead`.
///
/// With [`Framing::Lines`] an oversized line is skipped up to its terminator
/// instead of failing the connection.
#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    /// Discarding the tail of an oversized line until its `\n` arrives.
    skipping: bool,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            skipping: false,
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Option<Message> {
        while let Some(pos) = src.iter().position(|byte| *byte == b'\n') {
            let line = src.split_to(pos + 1);
            if self.skipping {
                self.skipping = false;
                continue;
            }
            if let Some(message) = decode_payload(&line[..pos]) {
                return Some(message);
            }
        }

        if src.len() > MAX_LINE_LENGTH {
            warn!(bytes = src.len(), "discarding unterminated line over size limit");
            src.clear();
            self.skipping = true;
        } else if self.skipping {
            src.clear();
        }
        None
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        match self.framing {
            // Whatever one read delivered is one message.
            Framing::Chunks => Ok(decode_payload(&src.split())),
            Framing::Lines => Ok(self.decode_line(src)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        // A final line the peer never terminated.
        let rest = src.split();
        if self.skipping {
            return Ok(None);
        }
        Ok(decode_payload(&rest))
    }
}

fn decode_payload(payload: &[u8]) -> Option<Message> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(Message::decode(payload))
}
