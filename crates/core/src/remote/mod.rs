//! Remote repository protocol
//!
//! A line-oriented protocol spoken over a pair of byte streams (usually the
//! stdin/stdout of `cairn server`, possibly through ssh):
//!
//! ```text
//! read-ref <name>                 -> ok <hex> | ok -
//! list-objects                    -> ok <n>, then n hex lines
//! receive-objects <n>             (n frames "<kind> <len>\n<body>") -> ok
//! update-ref <name> <new> <old|-> -> ok | conflict <hex|->
//! quit                            -> ok
//! ```
//!
//! Any request may instead be answered with `err <message>`.

mod client;
mod server;

pub use client::Client;
pub use server::serve;

use crate::error::StoreError;
use crate::hash::ObjectId;
use crate::object::ObjectKind;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Largest object body accepted in a single frame
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Where a remote repository lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLocation {
    /// Repository on this machine, served by a child process
    Local(PathBuf),
    /// `host:path`, served through ssh (empty path = the remote default)
    Ssh { host: String, path: String },
}

impl RemoteLocation {
    pub fn parse(location: &str) -> Self {
        match location.split_once(':') {
            Some((host, path)) if !host.is_empty() && !host.contains('/') => RemoteLocation::Ssh {
                host: host.to_string(),
                path: path.to_string(),
            },
            _ => RemoteLocation::Local(PathBuf::from(location)),
        }
    }

    /// Command that starts a server for this location
    ///
    /// `local_program` is the `cairn` executable used for local locations.
    pub fn server_command(&self, local_program: &Path) -> Command {
        match self {
            RemoteLocation::Local(path) => {
                let mut command = Command::new(local_program);
                command.arg("server").arg(path);
                command
            }
            RemoteLocation::Ssh { host, path } => {
                let mut command = Command::new("ssh");
                command.arg(host).arg("--").arg("cairn").arg("server");
                if !path.is_empty() {
                    command.arg(path);
                }
                command
            }
        }
    }
}

/// Read one `\n`-terminated line, `None` at end of stream
fn read_line<R: BufRead + ?Sized>(reader: &mut R) -> Result<Option<String>, StoreError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| StoreError::io("failed to read from remote", e))?;
    if n == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

fn write_line<W: Write + ?Sized>(writer: &mut W, line: &str) -> Result<(), StoreError> {
    writer
        .write_all(line.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .map_err(|e| StoreError::io("failed to write to remote", e))
}

fn flush<W: Write + ?Sized>(writer: &mut W) -> Result<(), StoreError> {
    writer
        .flush()
        .map_err(|e| StoreError::io("failed to write to remote", e))
}

fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    kind: ObjectKind,
    body: &[u8],
) -> Result<(), StoreError> {
    write_line(writer, &format!("{} {}", kind, body.len()))?;
    writer
        .write_all(body)
        .map_err(|e| StoreError::io("failed to write to remote", e))
}

fn read_frame<R: BufRead + ?Sized>(reader: &mut R) -> Result<(ObjectKind, Vec<u8>), StoreError> {
    let header = read_line(reader)?
        .ok_or_else(|| StoreError::Protocol("stream ended inside an object batch".into()))?;
    let (kind, len) = header
        .split_once(' ')
        .ok_or_else(|| StoreError::Protocol(format!("bad frame header {header:?}")))?;
    let kind: ObjectKind = kind
        .parse()
        .map_err(|_| StoreError::Protocol(format!("bad object kind {kind:?}")))?;
    let len: usize = len
        .parse()
        .map_err(|_| StoreError::Protocol(format!("bad frame length {len:?}")))?;
    if len > MAX_FRAME_BYTES {
        return Err(StoreError::Protocol(format!("frame of {len} bytes is too large")));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| StoreError::io("failed to read object body", e))?;
    Ok((kind, body))
}

fn format_opt_oid(id: Option<ObjectId>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_hex())
}

fn parse_opt_oid(text: &str) -> Result<Option<ObjectId>, StoreError> {
    if text == "-" {
        return Ok(None);
    }
    ObjectId::from_hex(text)
        .map(Some)
        .map_err(|e| StoreError::Protocol(e.to_string()))
}
