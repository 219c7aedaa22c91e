//! Client half of the remote protocol

use super::{
    flush, format_opt_oid, parse_opt_oid, read_line, write_frame, write_line, RemoteLocation,
};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::hash::ObjectId;
use crate::object::{self, ObjectKind};
use crate::refs::RefName;
use crate::store::{ObjectStore, WriteStats};
use ahash::AHashSet;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Object store proxied over a remote session
///
/// Ids are computed locally. Objects the remote already has (according to
/// the index fetched by [`Client::sync_index`]) are never sent; the rest are
/// buffered and shipped in batches.
pub struct Client {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    child: Option<Child>,
    remote_index: AHashSet<ObjectId>,
    pending: Vec<(ObjectKind, Vec<u8>)>,
    pending_ids: AHashSet<ObjectId>,
    pending_bytes: usize,
    flush_threshold: usize,
    closed: bool,
    stats: WriteStats,
}

impl Client {
    /// Speak the protocol over an already connected stream pair
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(BufWriter::new(writer)),
            child: None,
            remote_index: AHashSet::new(),
            pending: Vec::new(),
            pending_ids: AHashSet::new(),
            pending_bytes: 0,
            flush_threshold: StoreConfig::default().flush_threshold_bytes,
            closed: false,
            stats: WriteStats::default(),
        }
    }

    /// Start a server process and talk to it over its stdin/stdout
    pub fn spawn(mut command: Command) -> Result<Self, StoreError> {
        tracing::info!(?command, "starting remote server");
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| StoreError::io("failed to start remote server", e))?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(StoreError::Protocol("server pipes unavailable".into())),
        };
        let mut client = Self::new(stdout, stdin);
        client.child = Some(child);
        Ok(client)
    }

    /// Open a session with the server for `location` and sync its index
    ///
    /// Local locations are served by `local_program` (normally the running
    /// `cairn` executable).
    pub fn connect(location: &RemoteLocation, local_program: &Path) -> Result<Self, StoreError> {
        let mut client = Self::spawn(location.server_command(local_program))?;
        client.sync_index()?;
        Ok(client)
    }

    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes.max(1);
        self
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Fetch the ids of every object the remote already stores
    pub fn sync_index(&mut self) -> Result<usize, StoreError> {
        let count = self.request("list-objects")?;
        let count: usize = count
            .parse()
            .map_err(|_| StoreError::Protocol(format!("bad object count {count:?}")))?;
        self.remote_index.reserve(count);
        for _ in 0..count {
            let line = read_line(&mut self.reader)?
                .ok_or_else(|| StoreError::Protocol("index listing ended early".into()))?;
            let id = ObjectId::from_hex(&line).map_err(|e| StoreError::Protocol(e.to_string()))?;
            self.remote_index.insert(id);
        }
        tracing::info!(objects = count, "remote index synced");
        Ok(count)
    }

    /// End the session and wait for a spawned server to exit
    pub fn disconnect(mut self) -> Result<(), StoreError> {
        if !self.pending.is_empty() {
            self.send_pending()?;
        }
        self.request("quit")?;
        if let Some(mut child) = self.child.take() {
            drop(self.writer);
            let status = child
                .wait()
                .map_err(|e| StoreError::io("failed to wait for remote server", e))?;
            if !status.success() {
                return Err(StoreError::Remote(format!("server exited with {status}")));
            }
        }
        Ok(())
    }

    /// Send one request line and return the payload of its `ok` reply
    fn request(&mut self, line: &str) -> Result<String, StoreError> {
        write_line(&mut self.writer, line)?;
        flush(&mut self.writer)?;
        self.read_reply()
    }

    fn read_reply(&mut self) -> Result<String, StoreError> {
        let reply = read_line(&mut self.reader)?
            .ok_or_else(|| StoreError::Protocol("remote closed the connection".into()))?;
        parse_reply(&reply)
    }

    fn send_pending(&mut self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        tracing::debug!(count = pending.len(), bytes = self.pending_bytes, "sending objects");

        write_line(&mut self.writer, &format!("receive-objects {}", pending.len()))?;
        for (kind, body) in &pending {
            write_frame(&mut self.writer, *kind, body)?;
        }
        flush(&mut self.writer)?;
        self.read_reply()?;

        self.remote_index.extend(self.pending_ids.drain());
        self.pending_bytes = 0;
        Ok(())
    }
}

fn parse_reply(reply: &str) -> Result<String, StoreError> {
    if reply == "ok" {
        return Ok(String::new());
    }
    if let Some(payload) = reply.strip_prefix("ok ") {
        return Ok(payload.to_string());
    }
    if let Some(message) = reply.strip_prefix("err ") {
        return Err(StoreError::Remote(message.to_string()));
    }
    Err(StoreError::Protocol(format!("unexpected reply {reply:?}")))
}

impl ObjectStore for Client {
    fn read_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>, StoreError> {
        let payload = self.request(&format!("read-ref {name}"))?;
        parse_opt_oid(&payload)
    }

    fn write_object(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId, StoreError> {
        if self.closed {
            return Err(StoreError::WriterClosed);
        }
        let id = object::object_id(kind, body);
        if self.remote_index.contains(&id) || self.pending_ids.contains(&id) {
            self.stats.objects_deduplicated += 1;
            return Ok(id);
        }
        self.pending.push((kind, body.to_vec()));
        self.pending_ids.insert(id);
        self.pending_bytes += body.len();
        self.stats.objects_written += 1;
        self.stats.bytes_written += body.len() as u64;

        if self.pending_bytes >= self.flush_threshold {
            self.send_pending()?;
        }
        Ok(id)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        if !self.pending.is_empty() {
            self.send_pending()?;
        }
        self.closed = true;
        Ok(())
    }

    fn update_ref(
        &mut self,
        name: &RefName,
        new: ObjectId,
        expected: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        write_line(
            &mut self.writer,
            &format!("update-ref {name} {new} {}", format_opt_oid(expected)),
        )?;
        flush(&mut self.writer)?;
        let reply = read_line(&mut self.reader)?
            .ok_or_else(|| StoreError::Protocol("remote closed the connection".into()))?;
        if let Some(actual) = reply.strip_prefix("conflict ") {
            return Err(StoreError::RefConflict {
                name: name.to_string(),
                expected,
                actual: parse_opt_oid(actual)?,
            });
        }
        parse_reply(&reply).map(|_| ())
    }
}
