//! Server half of the remote protocol

use super::{flush, format_opt_oid, parse_opt_oid, read_frame, read_line, write_line};
use crate::error::StoreError;
use crate::refs::RefName;
use crate::store::{ObjectStore, Repository};
use std::io::{BufRead, Write};

/// Answer protocol requests against `repo` until `quit` or end of stream
///
/// Store failures are reported to the client and the session continues;
/// a broken or desynchronized stream ends the session with an error.
pub fn serve<R: BufRead, W: Write>(
    repo: &mut Repository,
    mut reader: R,
    mut writer: W,
) -> Result<(), StoreError> {
    while let Some(line) = read_line(&mut reader)? {
        let mut parts = line.split(' ');
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        tracing::debug!(command, "remote request");

        let reply = match (command, args.as_slice()) {
            ("read-ref", [name]) => RefName::new(name)
                .and_then(|name| repo.read_ref(&name))
                .map(|id| format!("ok {}", format_opt_oid(id))),

            ("list-objects", []) => match repo.list_objects() {
                Ok(ids) => {
                    write_line(&mut writer, &format!("ok {}", ids.len()))?;
                    for id in ids {
                        write_line(&mut writer, &id.to_hex())?;
                    }
                    flush(&mut writer)?;
                    continue;
                }
                Err(e) => Err(e),
            },

            ("receive-objects", [count]) => {
                let count: usize = count
                    .parse()
                    .map_err(|_| StoreError::Protocol(format!("bad object count {count:?}")))?;
                // Every frame must be consumed even if storing one fails
                let mut result = Ok(());
                for _ in 0..count {
                    let (kind, body) = read_frame(&mut reader)?;
                    if result.is_ok() {
                        result = repo.write_object(kind, &body).map(|_| ());
                    }
                }
                result
                    .and_then(|_| repo.flush())
                    .map(|_| "ok".to_string())
            }

            ("update-ref", [name, new, old]) => {
                let parsed = RefName::new(name).and_then(|name| {
                    let new = parse_opt_oid(new)?.ok_or_else(|| {
                        StoreError::Protocol("update-ref needs a new value".into())
                    })?;
                    Ok((name, new, parse_opt_oid(old)?))
                });
                match parsed.and_then(|(name, new, old)| repo.update_ref(&name, new, old)) {
                    Ok(()) => Ok("ok".to_string()),
                    Err(StoreError::RefConflict { actual, .. }) => {
                        Ok(format!("conflict {}", format_opt_oid(actual)))
                    }
                    Err(e) => Err(e),
                }
            }

            ("quit", []) => {
                write_line(&mut writer, "ok")?;
                flush(&mut writer)?;
                return Ok(());
            }

            _ => Err(StoreError::Protocol(format!("unknown request {line:?}"))),
        };

        let reply = reply.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "remote request failed");
            format!("err {}", e.to_string().replace('\n', " "))
        });
        write_line(&mut writer, &reply)?;
        flush(&mut writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{object_id, ObjectKind};

    fn run(repo: &mut Repository, input: &[u8]) -> String {
        let mut output = Vec::new();
        serve(repo, input, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_receive_and_list() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::init(temp_dir.path()).unwrap();

        let output = run(&mut repo, b"receive-objects 1\nblob 5\nhellolist-objects\nquit\n");
        let id = object_id(ObjectKind::Blob, b"hello");
        assert_eq!(output, format!("ok\nok 1\n{id}\nok\n"));
    }

    #[test]
    fn test_unknown_request_keeps_session() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::init(temp_dir.path()).unwrap();

        let output = run(&mut repo, b"frobnicate\nread-ref refs/heads/none\n");
        let lines: Vec<_> = output.lines().collect();
        assert!(lines[0].starts_with("err "));
        assert_eq!(lines[1], "ok -");
    }

    #[test]
    fn test_invalid_ref_name_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::init(temp_dir.path()).unwrap();

        let output = run(&mut repo, b"read-ref ../../etc/passwd\n");
        assert!(output.starts_with("err "));
    }

    #[test]
    fn test_truncated_batch_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::init(temp_dir.path()).unwrap();

        let mut output = Vec::new();
        let result = serve(&mut repo, &b"receive-objects 2\nblob 1\nx"[..], &mut output);
        assert!(result.is_err());
    }
}
