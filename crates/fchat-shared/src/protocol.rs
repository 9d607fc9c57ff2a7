//! Packet types and their text wire form.
//!
//! A packet travels as the payload of one frame: UTF-8 text with one
//! `key=value` pair per line and a `type` key naming the packet kind.
//! Values are escaped (`\\`, `\n`, `\r`) so multi-line message content
//! stays on a single line.

use std::collections::HashMap;
use std::num::NonZeroU32;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::{ChannelId, Message, Name};

/// All protocol packets exchanged between client and server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Claim a display name for the rest of the connection
    Login(Login),

    /// Ask for every pending channel update notification
    RequestUpdates,

    /// Create or rename a channel and (re)announce it to its members
    UpdateChannel(UpdateChannel),

    /// Server to client: a channel the user belongs to was created or changed
    ChannelUpdated(ChannelUpdated),

    /// Append a message to a channel (also used to deliver history)
    SendMessage(SendMessage),

    /// Ask for the most recent messages of a channel
    RequestMessages(RequestMessages),

    /// Announce a file upload, or the header of a file download
    SendFile(SendFile),

    /// Ask for a file stored in a channel
    RequestFile(RequestFile),

    /// Flow-control acknowledgement during a file download
    Acknowledge(Acknowledge),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChannel {
    pub channel: ChannelId,
    /// Explicit channel name; `None` lets the server derive one per member
    pub name: Option<Name>,
    pub members: Vec<Name>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdated {
    pub channel: ChannelId,
    /// Name of the channel as seen by the recipient
    pub name: Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub channel: ChannelId,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessages {
    pub channel: ChannelId,
    pub count: NonZeroU32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFile {
    pub channel: ChannelId,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFile {
    pub channel: ChannelId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    pub packet_id: Uuid,
}

impl Acknowledge {
    pub fn new() -> Self {
        Self {
            packet_id: Uuid::new_v4(),
        }
    }
}

impl Default for Acknowledge {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// The value of the `type` field for this packet.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Login(_) => "Login",
            Packet::RequestUpdates => "RequestUpdates",
            Packet::UpdateChannel(_) => "UpdateChannel",
            Packet::ChannelUpdated(_) => "ChannelUpdated",
            Packet::SendMessage(_) => "SendMessage",
            Packet::RequestMessages(_) => "RequestMessages",
            Packet::SendFile(_) => "SendFile",
            Packet::RequestFile(_) => "RequestFile",
            Packet::Acknowledge(_) => "Acknowledge",
        }
    }

    /// Serialize to the wire form. Total for every in-memory packet.
    pub fn encode(&self) -> Bytes {
        let mut out = Writer::new(self.kind());

        match self {
            Packet::Login(p) => out.put("username", p.username.as_str()),
            Packet::RequestUpdates => {}
            Packet::UpdateChannel(p) => {
                out.put("channel", &p.channel.to_string());
                if let Some(name) = &p.name {
                    out.put("name", name.as_str());
                }
                if !p.members.is_empty() {
                    let members: Vec<&str> = p.members.iter().map(Name::as_str).collect();
                    out.put("members", &members.join(","));
                }
            }
            Packet::ChannelUpdated(p) => {
                out.put("channel", &p.channel.to_string());
                out.put("name", p.name.as_str());
            }
            Packet::SendMessage(p) => {
                out.put("channel", &p.channel.to_string());
                out.put("author", p.message.author().as_str());
                out.put("message", p.message.content());
            }
            Packet::RequestMessages(p) => {
                out.put("channel", &p.channel.to_string());
                out.put("count", &p.count.to_string());
            }
            Packet::SendFile(p) => {
                out.put("channel", &p.channel.to_string());
                out.put("name", &p.name);
                out.put("size", &p.size.to_string());
            }
            Packet::RequestFile(p) => {
                out.put("channel", &p.channel.to_string());
                out.put("name", &p.name);
            }
            Packet::Acknowledge(p) => out.put("packet_id", &p.packet_id.to_string()),
        }

        out.finish()
    }

    /// Parse a frame payload back into a packet.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(data).map_err(|_| DecodeError::NotUtf8)?;
        let fields = Fields::parse(text);

        let kind = fields.get("type").ok_or(DecodeError::MissingType)?;

        let packet = match kind {
            "Login" => Packet::Login(Login {
                username: fields.name("username")?,
            }),
            "RequestUpdates" => Packet::RequestUpdates,
            "UpdateChannel" => Packet::UpdateChannel(UpdateChannel {
                channel: fields.channel("channel")?,
                name: match fields.get("name") {
                    Some(_) => Some(fields.name("name")?),
                    None => None,
                },
                members: fields.members("members")?,
            }),
            "ChannelUpdated" => Packet::ChannelUpdated(ChannelUpdated {
                channel: fields.channel("channel")?,
                name: fields.name("name")?,
            }),
            "SendMessage" => {
                let author = fields.name("author")?;
                let content = fields.required("message")?;
                let message = Message::new(author, content)
                    .map_err(|e| DecodeError::invalid("message", e))?;
                Packet::SendMessage(SendMessage {
                    channel: fields.channel("channel")?,
                    message,
                })
            }
            "RequestMessages" => {
                let count: u32 = fields
                    .required("count")?
                    .parse()
                    .map_err(|e| DecodeError::invalid("count", e))?;
                let count = NonZeroU32::new(count)
                    .ok_or_else(|| DecodeError::invalid("count", "must be at least 1"))?;
                Packet::RequestMessages(RequestMessages {
                    channel: fields.channel("channel")?,
                    count,
                })
            }
            "SendFile" => Packet::SendFile(SendFile {
                channel: fields.channel("channel")?,
                name: fields.required("name")?.to_string(),
                size: fields
                    .required("size")?
                    .parse()
                    .map_err(|e| DecodeError::invalid("size", e))?,
            }),
            "RequestFile" => Packet::RequestFile(RequestFile {
                channel: fields.channel("channel")?,
                name: fields.required("name")?.to_string(),
            }),
            "Acknowledge" => Packet::Acknowledge(Acknowledge {
                packet_id: Uuid::parse_str(fields.required("packet_id")?)
                    .map_err(|e| DecodeError::invalid("packet_id", e))?,
            }),
            other => return Err(DecodeError::UnknownType(other.to_string())),
        };

        Ok(packet)
    }
}

// ---------------------------------------------------------------------------
// Line format
// ---------------------------------------------------------------------------

struct Writer {
    out: String,
}

impl Writer {
    fn new(kind: &str) -> Self {
        let mut writer = Self { out: String::new() };
        writer.put("type", kind);
        writer
    }

    fn put(&mut self, key: &str, value: &str) {
        self.out.push_str(key);
        self.out.push('=');
        escape_into(&mut self.out, value);
        self.out.push('\n');
    }

    fn finish(self) -> Bytes {
        Bytes::from(self.out.into_bytes())
    }
}

struct Fields<'a> {
    values: HashMap<&'a str, String>,
}

impl<'a> Fields<'a> {
    fn parse(text: &'a str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key, unescape(value));
            }
        }
        Self { values }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn required(&self, key: &'static str) -> Result<&str, DecodeError> {
        self.get(key).ok_or(DecodeError::MissingField(key))
    }

    fn name(&self, key: &'static str) -> Result<Name, DecodeError> {
        Name::new(self.required(key)?).map_err(|e| DecodeError::invalid(key, e))
    }

    fn channel(&self, key: &'static str) -> Result<ChannelId, DecodeError> {
        self.required(key)?
            .parse()
            .map_err(|e| DecodeError::invalid(key, e))
    }

    // Absent key means no members; a present empty value is one empty name.
    fn members(&self, key: &'static str) -> Result<Vec<Name>, DecodeError> {
        match self.get(key) {
            None => Ok(Vec::new()),
            Some(joined) => joined
                .split(',')
                .map(|member| Name::new(member).map_err(|e| DecodeError::invalid(key, e)))
                .collect(),
        }
    }
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
