//! The line-oriented wire protocol.
//!
//! Every message is a line of whitespace-separated tokens terminated by a
//! newline; tokens never contain internal spaces. Requests are single lines.
//! Responses are free-form text whose lines are newline-terminated, followed
//! by one empty line that terminates the response, so multi-line responses
//! (group and file listings) can be framed without guessing. Error responses
//! begin with `Error:`.
//!
//! The peer-to-peer chunk request is a single `get_chunk` line; its response
//! is either raw chunk bytes or an `Error:` line and is deliberately not
//! framed here (the receiver knows the exact chunk length and disambiguates
//! by length and digest).

use std::{fmt, io, net::IpAddr};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ChunkIndex;

// A single request or response may not exceed this size; upload manifests of
// very large files are the only messages that get anywhere near it.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A command a peer may issue to the tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    CreateUser {
        user: String,
        password: String,
    },
    Login {
        user: String,
        password: String,
        ip: IpAddr,
        port: u16,
    },
    CreateGroup {
        group: String,
    },
    JoinGroup {
        group: String,
    },
    LeaveGroup {
        group: String,
    },
    ListGroups,
    ListRequests {
        group: String,
    },
    AcceptRequest {
        group: String,
        user: String,
    },
    ListFiles {
        group: String,
    },
    UploadFile {
        name: String,
        len: u64,
        file_sha1: String,
        group: String,
        chunk_sha1s: Vec<String>,
    },
    DownloadFile {
        group: String,
        name: String,
    },
    Quit,
    Shutdown,
}

impl Request {
    /// Parses a request from a single line of whitespace-separated tokens.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let verb = *tokens.first().ok_or(ProtocolError::UnknownCommand)?;
        let request = match (verb, tokens.len()) {
            ("create_user", 3) => Self::CreateUser {
                user: tokens[1].into(),
                password: tokens[2].into(),
            },
            ("create_user", _) => {
                return Err(ProtocolError::Usage(
                    "create_user <user_id> <password>",
                ))
            }
            ("login", 5) => {
                const USAGE: &str = "login <user_id> <password> <ip> <port>";
                Self::Login {
                    user: tokens[1].into(),
                    password: tokens[2].into(),
                    ip: tokens[3]
                        .parse()
                        .map_err(|_| ProtocolError::Usage(USAGE))?,
                    port: tokens[4]
                        .parse()
                        .map_err(|_| ProtocolError::Usage(USAGE))?,
                }
            }
            ("login", _) => {
                return Err(ProtocolError::Usage(
                    "login <user_id> <password> <ip> <port>",
                ))
            }
            ("create_group", 2) => Self::CreateGroup {
                group: tokens[1].into(),
            },
            ("create_group", _) => {
                return Err(ProtocolError::Usage("create_group <group_id>"))
            }
            ("join_group", 2) => Self::JoinGroup {
                group: tokens[1].into(),
            },
            ("join_group", _) => {
                return Err(ProtocolError::Usage("join_group <group_id>"))
            }
            ("leave_group", 2) => Self::LeaveGroup {
                group: tokens[1].into(),
            },
            ("leave_group", _) => {
                return Err(ProtocolError::Usage("leave_group <group_id>"))
            }
            ("list_groups", 1) => Self::ListGroups,
            ("list_groups", _) => {
                return Err(ProtocolError::Usage("list_groups"))
            }
            ("list_requests", 2) => Self::ListRequests {
                group: tokens[1].into(),
            },
            ("list_requests", _) => {
                return Err(ProtocolError::Usage("list_requests <group_id>"))
            }
            ("accept_request", 3) => Self::AcceptRequest {
                group: tokens[1].into(),
                user: tokens[2].into(),
            },
            ("accept_request", _) => {
                return Err(ProtocolError::Usage(
                    "accept_request <group_id> <user_id>",
                ))
            }
            ("list_files", 2) => Self::ListFiles {
                group: tokens[1].into(),
            },
            ("list_files", _) => {
                return Err(ProtocolError::Usage("list_files <group_id>"))
            }
            ("upload_file", n) if n >= 6 => {
                const USAGE: &str = "upload_file <file_name> <file_size> \
                                     <file_sha1> <group_id> <chunk_sha1s...>";
                Self::UploadFile {
                    name: tokens[1].into(),
                    len: tokens[2]
                        .parse()
                        .map_err(|_| ProtocolError::Usage(USAGE))?,
                    file_sha1: tokens[3].into(),
                    group: tokens[4].into(),
                    chunk_sha1s: tokens[5..]
                        .iter()
                        .map(|t| t.to_string())
                        .collect(),
                }
            }
            ("upload_file", _) => {
                return Err(ProtocolError::Usage(
                    "upload_file <file_name> <file_size> <file_sha1> \
                     <group_id> <chunk_sha1s...>",
                ))
            }
            ("download_file", 3) => Self::DownloadFile {
                group: tokens[1].into(),
                name: tokens[2].into(),
            },
            ("download_file", _) => {
                return Err(ProtocolError::Usage(
                    "download_file <group_id> <file_name>",
                ))
            }
            ("quit", 1) => Self::Quit,
            ("shutdown", 1) => Self::Shutdown,
            _ => return Err(ProtocolError::UnknownCommand),
        };
        Ok(request)
    }

    /// Returns the request's verb, for logging. Unlike the `Display` encoding
    /// this never exposes credentials.
    pub fn verb(&self) -> &'static str {
        use Request::*;
        match self {
            CreateUser { .. } => "create_user",
            Login { .. } => "login",
            CreateGroup { .. } => "create_group",
            JoinGroup { .. } => "join_group",
            LeaveGroup { .. } => "leave_group",
            ListGroups => "list_groups",
            ListRequests { .. } => "list_requests",
            AcceptRequest { .. } => "accept_request",
            ListFiles { .. } => "list_files",
            UploadFile { .. } => "upload_file",
            DownloadFile { .. } => "download_file",
            Quit => "quit",
            Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Request {
    /// Encodes the request as its wire line, without the trailing newline.
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Request::*;
        match self {
            CreateUser { user, password } => {
                write!(fmt, "create_user {} {}", user, password)
            }
            Login {
                user,
                password,
                ip,
                port,
            } => write!(fmt, "login {} {} {} {}", user, password, ip, port),
            CreateGroup { group } => write!(fmt, "create_group {}", group),
            JoinGroup { group } => write!(fmt, "join_group {}", group),
            LeaveGroup { group } => write!(fmt, "leave_group {}", group),
            ListGroups => write!(fmt, "list_groups"),
            ListRequests { group } => write!(fmt, "list_requests {}", group),
            AcceptRequest { group, user } => {
                write!(fmt, "accept_request {} {}", group, user)
            }
            ListFiles { group } => write!(fmt, "list_files {}", group),
            UploadFile {
                name,
                len,
                file_sha1,
                group,
                chunk_sha1s,
            } => {
                write!(
                    fmt,
                    "upload_file {} {} {} {}",
                    name, len, file_sha1, group
                )?;
                for sha1 in chunk_sha1s {
                    write!(fmt, " {}", sha1)?;
                }
                Ok(())
            }
            DownloadFile { group, name } => {
                write!(fmt, "download_file {} {}", group, name)
            }
            Quit => write!(fmt, "quit"),
            Shutdown => write!(fmt, "shutdown"),
        }
    }
}

/// A message that does not conform to the wire grammar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The verb is not part of the protocol.
    UnknownCommand,
    /// A known verb with the wrong argument count or a malformed argument.
    Usage(&'static str),
    /// A `download_info` response that does not parse.
    InvalidPlan,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand => write!(fmt, "Invalid command."),
            Self::Usage(usage) => write!(fmt, "Usage: {}", usage),
            Self::InvalidPlan => {
                write!(fmt, "Invalid download_info response.")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Returns the peer-to-peer chunk request line, including the newline.
pub fn get_chunk_line(file_name: &str, index: ChunkIndex) -> String {
    format!("get_chunk {} {}\n", file_name, index)
}

/// Parses a peer-to-peer chunk request line.
pub fn parse_get_chunk(
    line: &str,
) -> Result<(String, ChunkIndex), ProtocolError> {
    const USAGE: &str = "get_chunk <file_name> <chunk_index>";
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["get_chunk", name, index] => {
            let index =
                index.parse().map_err(|_| ProtocolError::Usage(USAGE))?;
            Ok((name.to_string(), index))
        }
        ["get_chunk", ..] => Err(ProtocolError::Usage(USAGE)),
        _ => Err(ProtocolError::UnknownCommand),
    }
}

/// Splits one newline-terminated line off the front of the buffer. Returns
/// `None` until a full line has arrived.
fn split_line(buf: &mut BytesMut) -> io::Result<Option<String>> {
    match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            let line = buf.split_to(pos + 1);
            let line = std::str::from_utf8(&line[..pos]).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message is not valid UTF-8",
                )
            })?;
            Ok(Some(line.trim_end_matches('\r').to_string()))
        }
        None if buf.len() > MAX_FRAME_LEN => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too long",
        )),
        None => Ok(None),
    }
}

/// The tracker's side of a client session: decodes request lines, encodes
/// framed response text.
pub struct ServerCodec;

impl Decoder for ServerCodec {
    // Parse failures are part of the item so that a malformed request gets an
    // `Error:` response instead of killing the session.
    type Item = Result<Request, ProtocolError>;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> io::Result<Option<Self::Item>> {
        Ok(split_line(buf)?.map(|line| Request::parse(&line)))
    }
}

impl Encoder<String> for ServerCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        response: String,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.extend_from_slice(response.as_bytes());
        if !response.ends_with('\n') {
            buf.extend_from_slice(b"\n");
        }
        // the empty line terminates the response
        buf.extend_from_slice(b"\n");
        Ok(())
    }
}

/// The peer's side of a tracker session: encodes request lines, decodes
/// framed response text.
pub struct ClientCodec;

impl Encoder<Request> for ClientCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        request: Request,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.extend_from_slice(request.to_string().as_bytes());
        buf.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Decoder for ClientCodec {
    /// The full response text, with its interior newlines but without the
    /// terminating empty line.
    type Item = String;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> io::Result<Option<Self::Item>> {
        // a response ends at the first empty line
        let end = buf
            .iter()
            .zip(buf.iter().skip(1))
            .position(|(a, b)| *a == b'\n' && *b == b'\n');
        match end {
            Some(pos) => {
                let frame = buf.split_to(pos + 1);
                buf.advance(1);
                let text =
                    std::str::from_utf8(&frame).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            "response is not valid UTF-8",
                        )
                    })?;
                Ok(Some(text.to_string()))
            }
            None if buf.len() > MAX_FRAME_LEN => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response too long",
            )),
            None => Ok(None),
        }
    }
}
