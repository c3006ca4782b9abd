//! Command model — the textual grammar carried inside frames.
//!
//! Payloads are comma-separated token lists whose first token is the verb.
//! SERVERS lists separate their `id,ip,port` triples with semicolons, and a
//! SENDMSG may carry a hop trailer after an EOT byte. Payloads are parsed into
//! [`Command`] (peer verbs) or [`ClientCommand`] (client verbs) as soon as
//! they leave the codec and are only turned back into text by `to_wire`.

use crate::frame::{EOT, MAX_HOPS_LENGTH};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// A payload that does not fit the grammar. The command is ignored and the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
    #[error("{verb} expects at least {expected} tokens, got {got}")]
    Arity {
        verb: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{verb}: invalid number {value:?}")]
    InvalidNumber { verb: &'static str, value: String },
    #[error("{verb}: content contains a hop separator")]
    HopSeparator { verb: &'static str },
}

/// Split a command on commas. There is no escaping.
pub fn tokenize(command: &str) -> Vec<&str> {
    if command.is_empty() {
        Vec::new()
    } else {
        command.split(',').collect()
    }
}

/// Separate a payload into its main command and hop trailer.
///
/// Without an EOT byte the trailer is empty.
pub fn split_hops(payload: &str) -> (&str, &str) {
    match payload.find(EOT as char) {
        Some(pos) => (&payload[..pos], &payload[pos + 1..]),
        None => (payload, ""),
    }
}

/// Exact-token membership test on a comma-separated hop list.
pub fn is_in_hops(hops: &str, group_id: &str) -> bool {
    !hops.is_empty() && hops.split(',').any(|hop| hop == group_id)
}

/// Number of hops recorded in a trailer: 0 when empty, else commas + 1.
pub fn hop_count(hops: &str) -> usize {
    if hops.is_empty() {
        0
    } else {
        hops.matches(',').count() + 1
    }
}

/// Ordered list of group ids a message has traversed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HopTrail(String);

impl HopTrail {
    pub fn new(hops: impl Into<String>) -> Self {
        Self(hops.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, group_id: &str) -> bool {
        is_in_hops(&self.0, group_id)
    }

    pub fn count(&self) -> usize {
        hop_count(&self.0)
    }

    /// The trail as it leaves this node.
    ///
    /// An empty trail is seeded with the originating group so the first hop is
    /// recorded; otherwise this node's id is appended.
    pub fn extended(&self, from: &str, own_id: &str) -> Self {
        if self.0.is_empty() {
            Self(from.to_string())
        } else {
            Self(format!("{},{}", self.0, own_id))
        }
    }
}

impl fmt::Display for HopTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `id,ip,port` triple of a SERVERS list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub group_id: String,
    pub ip: String,
    pub port: u16,
}

impl ServerEntry {
    pub fn new(group_id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            group_id: group_id.into(),
            ip: ip.into(),
            port,
        }
    }
}

/// Parse the body of a SERVERS command (everything after `SERVERS,`).
///
/// Empty entries and malformed triples are skipped.
pub fn split_servers(list: &str) -> Vec<ServerEntry> {
    list.split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parts = tokenize(entry);
            if parts.len() < 3 {
                return None;
            }
            let port = parts[2].trim().parse::<u16>().ok()?;
            Some(ServerEntry::new(parts[0].trim(), parts[1].trim(), port))
        })
        .collect()
}

/// An application message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMsg {
    pub to: String,
    pub from: String,
    pub content: String,
    pub hops: HopTrail,
}

/// Verbs exchanged between peers (plus the `OK` acknowledgement sent to clients).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo { group_id: String },
    Servers(Vec<ServerEntry>),
    Keepalive { queued: usize },
    GetMsgs { group_id: String },
    SendMsg(SendMsg),
    StatusReq,
    StatusResp(Vec<(String, usize)>),
    NoMessages,
    Ok { detail: String },
}

impl Command {
    /// Parse a frame payload into a peer command.
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let (main, hops) = split_hops(payload);
        let tokens = tokenize(main);
        let verb = *tokens.first().ok_or(CommandError::Empty)?;

        match verb {
            "HELO" => {
                require("HELO", &tokens, 2)?;
                Ok(Command::Helo {
                    group_id: tokens[1].to_string(),
                })
            }
            "SERVERS" => {
                let body = main.split_once(',').map(|(_, rest)| rest).unwrap_or("");
                Ok(Command::Servers(split_servers(body)))
            }
            "KEEPALIVE" => {
                require("KEEPALIVE", &tokens, 2)?;
                Ok(Command::Keepalive {
                    queued: parse_count("KEEPALIVE", tokens[1])?,
                })
            }
            "GETMSGS" => {
                require("GETMSGS", &tokens, 2)?;
                Ok(Command::GetMsgs {
                    group_id: tokens[1].to_string(),
                })
            }
            "SENDMSG" => {
                require("SENDMSG", &tokens, 4)?;
                let mut parts = main.splitn(4, ',').skip(1);
                let to = parts.next().unwrap_or_default();
                let from = parts.next().unwrap_or_default();
                let content = parts.next().unwrap_or_default();
                Ok(Command::SendMsg(SendMsg {
                    to: to.to_string(),
                    from: from.to_string(),
                    content: content.to_string(),
                    hops: HopTrail::new(hops),
                }))
            }
            "STATUSREQ" => Ok(Command::StatusReq),
            "STATUSRESP" => {
                let pairs = tokens[1..]
                    .chunks(2)
                    .filter(|pair| pair.len() == 2)
                    .filter_map(|pair| {
                        let count = pair[1].trim().parse::<usize>().ok()?;
                        Some((pair[0].to_string(), count))
                    })
                    .collect();
                Ok(Command::StatusResp(pairs))
            }
            "NO_MESSAGES" => Ok(Command::NoMessages),
            "OK" => Ok(Command::Ok {
                detail: main.split_once(',').map(|(_, d)| d).unwrap_or("").to_string(),
            }),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Helo { .. } => "HELO",
            Command::Servers(_) => "SERVERS",
            Command::Keepalive { .. } => "KEEPALIVE",
            Command::GetMsgs { .. } => "GETMSGS",
            Command::SendMsg(_) => "SENDMSG",
            Command::StatusReq => "STATUSREQ",
            Command::StatusResp(_) => "STATUSRESP",
            Command::NoMessages => "NO_MESSAGES",
            Command::Ok { .. } => "OK",
        }
    }

    /// Render the canonical wire payload.
    pub fn to_wire(&self) -> String {
        match self {
            Command::Helo { group_id } => format!("HELO,{group_id}"),
            Command::Servers(entries) => {
                let list = entries
                    .iter()
                    .map(|e| format!("{},{},{}", e.group_id, e.ip, e.port))
                    .collect::<Vec<_>>()
                    .join(";");
                if list.is_empty() {
                    "SERVERS".to_string()
                } else {
                    format!("SERVERS,{list}")
                }
            }
            Command::Keepalive { queued } => format!("KEEPALIVE,{queued}"),
            Command::GetMsgs { group_id } => format!("GETMSGS,{group_id}"),
            Command::SendMsg(msg) => build_sendmsg(msg),
            Command::StatusReq => "STATUSREQ".to_string(),
            Command::StatusResp(pairs) => {
                let mut out = String::from("STATUSRESP");
                for (group, count) in pairs {
                    out.push_str(&format!(",{group},{count}"));
                }
                out
            }
            Command::NoMessages => "NO_MESSAGES".to_string(),
            Command::Ok { detail } => format!("OK,{detail}"),
        }
    }
}

fn build_sendmsg(msg: &SendMsg) -> String {
    let mut out = format!("SENDMSG,{},{},{}", msg.to, msg.from, msg.content);
    if !msg.hops.is_empty() {
        if msg.hops.as_str().len() <= MAX_HOPS_LENGTH {
            out.push(EOT as char);
            out.push_str(msg.hops.as_str());
        } else {
            warn!(
                to = %msg.to,
                hops_len = msg.hops.as_str().len(),
                max = MAX_HOPS_LENGTH,
                "Hop trailer exceeds budget, sending without it"
            );
        }
    }
    out
}

fn require(verb: &'static str, tokens: &[&str], expected: usize) -> Result<(), CommandError> {
    if tokens.len() < expected {
        return Err(CommandError::Arity {
            verb,
            expected,
            got: tokens.len(),
        });
    }
    Ok(())
}

fn parse_count(verb: &'static str, value: &str) -> Result<usize, CommandError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| CommandError::InvalidNumber {
            verb,
            value: value.to_string(),
        })
}

/// Verbs accepted from a client connection (one that never sent HELO).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    SendMsg { to: String, content: String },
    GetMsg,
    ListServers,
    Quit,
}

impl ClientCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let tokens = tokenize(payload);
        let verb = *tokens.first().ok_or(CommandError::Empty)?;

        match verb {
            "SENDMSG" => {
                require("SENDMSG", &tokens, 3)?;
                if payload.as_bytes().contains(&EOT) {
                    return Err(CommandError::HopSeparator { verb: "SENDMSG" });
                }
                let mut parts = payload.splitn(3, ',').skip(1);
                let to = parts.next().unwrap_or_default();
                let content = parts.next().unwrap_or_default();
                Ok(ClientCommand::SendMsg {
                    to: to.to_string(),
                    content: content.to_string(),
                })
            }
            "GETMSG" => Ok(ClientCommand::GetMsg),
            "LISTSERVERS" => Ok(ClientCommand::ListServers),
            "QUIT" => Ok(ClientCommand::Quit),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            ClientCommand::SendMsg { to, content } => format!("SENDMSG,{to},{content}"),
            ClientCommand::GetMsg => "GETMSG".to_string(),
            ClientCommand::ListServers => "LISTSERVERS".to_string(),
            ClientCommand::Quit => "QUIT".to_string(),
        }
    }
}
