//! Server request dispatcher: the per-connection state machine that reads
//! framed requests off a [`Channel`], executes them against a
//! [`LocalFs`] and a [`SessionTable`], and writes back framed responses.
//!
//! Grounded in the reference implementation's `sck_server_ops` dispatch
//! table: one function per opcode, switched on by the connection's
//! request loop. READ/WRITE additionally stream `(n, data)` frames after
//! the initial record, exactly as the external-interface table specifies.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

use crate::error::{XpnError, XpnResult};
use crate::localfs::{LocalFs, SetAttr};
use crate::metadata::{self, MetadataHeader};
use crate::session::{SessionHandle, SessionTable};
use crate::transport::Channel;
use crate::wire::{self, FileRef, Opcode, Request, Response, StreamFrame, MAX_BUFFER_SIZE};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of servicing one connection to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The client sent `DISCONNECT` or the channel closed normally.
    Disconnected,
    /// The client sent `FINALIZE`; the caller should stop accepting new
    /// connections.
    Finalized,
}

/// Drives one connection's request loop until the client disconnects or
/// asks the server to finalize. Every session this connection opens is
/// released on exit, even on error, so a crashed client cannot leak
/// session-table slots.
#[instrument(skip(channel, fs, sessions))]
pub async fn serve_connection(
    mut channel: Box<dyn Channel>,
    fs: &dyn LocalFs,
    sessions: &SessionTable,
) -> XpnResult<DispatchOutcome> {
    let connection = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(connection, "connection established");

    let outcome = loop {
        let request = match read_request(channel.as_mut()).await {
            Ok(Some(request)) => request,
            Ok(None) => break DispatchOutcome::Disconnected,
            Err(e) => {
                warn!(connection, error = %e, "dropping connection after framing error");
                break DispatchOutcome::Disconnected;
            }
        };

        debug!(connection, opcode = ?request.opcode(), "dispatching request");

        match &request {
            Request::Disconnect => break DispatchOutcome::Disconnected,
            Request::Finalize => break DispatchOutcome::Finalized,
            Request::Read { .. } => {
                handle_read(channel.as_mut(), fs, sessions, connection, &request).await?;
                continue;
            }
            Request::Write { .. } => {
                handle_write(channel.as_mut(), fs, sessions, connection, &request).await?;
                continue;
            }
            _ => {}
        }

        let response = dispatch_one(fs, sessions, connection, request).await;
        send_response(channel.as_mut(), response).await?;
    };

    sessions.close_connection(connection);
    info!(connection, ?outcome, "connection closed");
    Ok(outcome)
}

/// Reads one framed `opcode | body` request, or `None` if the peer closed
/// the channel between frames (a clean disconnect, not an error).
async fn read_request(channel: &mut dyn Channel) -> XpnResult<Option<Request>> {
    let len_bytes = match channel.recv(4).await {
        Ok(b) => b,
        Err(_) => return Ok(None),
    };
    let len = u32::from_le_bytes(len_bytes.try_into().map_err(|_| XpnError::CorruptMetadata("frame".into()))?) as usize;
    let payload = channel.recv(len).await?;
    if payload.len() < 4 {
        return Err(XpnError::CorruptMetadata("short request frame".into()));
    }
    let opcode_value = u32::from_le_bytes(payload[..4].try_into().unwrap());
    let opcode = Opcode::from_u32(opcode_value).map_err(|e| XpnError::InvalidArgument(e.to_string()))?;
    let request = Request::decode(opcode, &payload[4..]).map_err(|e| XpnError::InvalidArgument(e.to_string()))?;
    Ok(Some(request))
}

async fn send_response(channel: &mut dyn Channel, response: Response) -> XpnResult<()> {
    let encoded = response.encode().map_err(|e| XpnError::Fatal(e.to_string()))?;
    channel.send(&wire::frame(&encoded)).await
}

async fn send_stream_frame(channel: &mut dyn Channel, frame: &StreamFrame) -> XpnResult<()> {
    channel.send(&wire::frame(&frame.encode())).await
}

/// Executes every non-streaming opcode against local state, returning the
/// response. Errors are folded into the opcode's own status field rather
/// than propagated, mirroring the POSIX `(return, errno)` contract: a
/// dropped connection is the only thing that should abort the loop.
async fn dispatch_one(fs: &dyn LocalFs, sessions: &SessionTable, connection: u64, request: Request) -> Response {
    match request {
        Request::Open { path, sessioned, .. } => match open_for_read(fs, sessions, connection, &path).await {
            Ok(handle) => Response::Handle(finish_open(sessions, handle, sessioned)),
            Err(e) => Response::Handle(-(e.errno() as i64)),
        },
        Request::Creat { path, sessioned, .. } => match create_for_write(fs, sessions, connection, &path).await {
            Ok(handle) => Response::Handle(finish_open(sessions, handle, sessioned)),
            Err(e) => Response::Handle(-(e.errno() as i64)),
        },
        Request::Close { handle } => {
            let closed = sessions.close(SessionHandle::from_wire(handle));
            Response::Ret(if closed { 0 } else { -1 })
        }
        Request::Rm { path } => ret(fs.unlink(Path::new(&path)).await),
        Request::Rename { from, to } => ret(fs.rename(Path::new(&from), Path::new(&to)).await),
        Request::GetAttr { path } => match fs.stat(Path::new(&path)).await {
            Ok(mut stat) => {
                if !stat.is_dir {
                    // The raw on-disk size includes the metadata header
                    // prefix; the header's own `file_size` field is the
                    // logical size reported to callers.
                    match metadata::read_mdata(fs, Path::new(&path)).await {
                        Ok(header) if !header.is_absent() => stat.size = header.file_size,
                        _ => stat.size = stat.size.saturating_sub(metadata::HEADER_SIZE),
                    }
                }
                Response::GetAttr { status: 0, stat }
            }
            Err(e) => Response::GetAttr { status: -(e.errno()), stat: Default::default() },
        },
        Request::SetAttr { path, mode, size, mtime } => {
            let attr = SetAttr { mode, size, atime_secs: None, mtime_secs: mtime };
            ret(fs.set_attr(Path::new(&path), attr).await)
        }
        Request::Mkdir { path, .. } => ret(fs.mkdir(Path::new(&path)).await),
        Request::Opendir { path } => match fs.readdir(Path::new(&path)).await {
            Ok(entries) => {
                let handle = sessions.open_dir(connection, PathBuf::from(&path), entries);
                Response::DirHandle(handle.to_wire())
            }
            Err(e) => Response::DirHandle(-(e.errno() as i64)),
        },
        Request::Readdir { handle } => {
            match sessions.read_dir_page(SessionHandle::from_wire(handle), 1) {
                Some(mut page) if !page.0.is_empty() => {
                    let entry = page.0.remove(0);
                    Response::ReaddirEntry { end: page.1 && page.0.is_empty(), name: Some(entry.name), fileid: 0 }
                }
                Some(_) => Response::ReaddirEntry { end: true, name: None, fileid: 0 },
                None => Response::ReaddirEntry { end: true, name: None, fileid: 0 },
            }
        }
        Request::Closedir { handle } => {
            let closed = sessions.close(SessionHandle::from_wire(handle));
            Response::Ret(if closed { 0 } else { -1 })
        }
        Request::Rmdir { path } => ret(fs.rmdir(Path::new(&path)).await),
        Request::Statvfs { path } => match fs.statvfs(Path::new(&path)).await {
            Ok(stat) => Response::Statvfs { ret: 0, stat },
            Err(e) => Response::Statvfs { ret: -(e.errno()), stat: Default::default() },
        },
        Request::WriteMdataFileSize { path, size } => {
            let header = MetadataHeader { file_size: size, ..MetadataHeader::absent() };
            match metadata::write_mdata(fs, Path::new(&path), header, true).await {
                Ok(()) => Response::Ret(0),
                Err(e) => Response::Ret(-(e.errno())),
            }
        }
        Request::Flush { src, dst } | Request::Preload { src, dst } | Request::Checkpoint { src, dst } => {
            match fs.rename(Path::new(&src), Path::new(&dst)).await {
                Ok(()) => Response::FlushResult { ret: 0, errno: 0 },
                Err(e) => Response::FlushResult { ret: -1, errno: e.errno() },
            }
        }
        Request::GetNodeName => Response::NodeName { host: hostname(), path: "/".into() },
        Request::Read { .. } | Request::Write { .. } | Request::Finalize | Request::Disconnect => {
            unreachable!("handled before dispatch_one")
        }
    }
}

async fn open_for_read(
    fs: &dyn LocalFs,
    sessions: &SessionTable,
    connection: u64,
    path: &str,
) -> XpnResult<SessionHandle> {
    fs.open_read(Path::new(path)).await?;
    Ok(sessions.open_file(connection, PathBuf::from(path)))
}

async fn create_for_write(
    fs: &dyn LocalFs,
    sessions: &SessionTable,
    connection: u64,
    path: &str,
) -> XpnResult<SessionHandle> {
    fs.open_write_create(Path::new(path)).await?;
    Ok(sessions.open_file(connection, PathBuf::from(path)))
}

/// `OPEN_WOS`/`CREAT_WOS`: the descriptor must not outlive this single
/// request, so it is closed immediately; the wire value returned is a
/// success marker only, never reused as a handle by a WOS-mode caller.
fn finish_open(sessions: &SessionTable, handle: SessionHandle, sessioned: bool) -> i64 {
    if sessioned {
        handle.to_wire()
    } else {
        sessions.close(handle);
        0
    }
}

fn ret(result: XpnResult<()>) -> Response {
    match result {
        Ok(()) => Response::Ret(0),
        Err(e) => Response::Ret(-(e.errno())),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Resolves a [`FileRef`] to the local path it names, going through the
/// session table for `WS` opcodes.
fn resolve_path(sessions: &SessionTable, file: &FileRef) -> XpnResult<PathBuf> {
    match file {
        FileRef::Path(p) => Ok(PathBuf::from(p)),
        FileRef::Handle(h) => sessions
            .file_path(SessionHandle::from_wire(*h))
            .ok_or_else(|| XpnError::InvalidArgument("stale session handle".into())),
    }
}

/// `READ_WS`/`READ_WOS`: streams the requested range back as a sequence
/// of `(n, data)` frames bounded by [`MAX_BUFFER_SIZE`], terminated by an
/// `eof` frame (or an `error` frame on failure).
async fn handle_read(
    channel: &mut dyn Channel,
    fs: &dyn LocalFs,
    sessions: &SessionTable,
    _connection: u64,
    request: &Request,
) -> XpnResult<()> {
    let Request::Read { file, offset, size } = request else { unreachable!() };
    let path = match resolve_path(sessions, file) {
        Ok(p) => p,
        Err(_) => return send_stream_frame(channel, &StreamFrame::error()).await,
    };

    let mut remaining = *size as usize;
    let mut cursor = *offset;
    while remaining > 0 {
        let chunk_len = remaining.min(MAX_BUFFER_SIZE);
        match fs.read_at(&path, cursor, chunk_len).await {
            Ok(data) if !data.is_empty() => {
                let n = data.len();
                send_stream_frame(channel, &StreamFrame { n: n as i32, data }).await?;
                cursor += n as u64;
                remaining -= n;
                if n < chunk_len {
                    break;
                }
            }
            Ok(_) => break,
            Err(_) => return send_stream_frame(channel, &StreamFrame::error()).await,
        }
    }
    send_stream_frame(channel, &StreamFrame::eof()).await
}

/// `WRITE_WS`/`WRITE_WOS`: reads `(n, data)` frames until `eof`, writing
/// each chunk at its sequential offset and folding the file's logical
/// size forward with [`metadata::write_mdata`]'s `only_file_size` path.
async fn handle_write(
    channel: &mut dyn Channel,
    fs: &dyn LocalFs,
    sessions: &SessionTable,
    _connection: u64,
    request: &Request,
) -> XpnResult<()> {
    let Request::Write { file, offset, .. } = request else { unreachable!() };
    let path = match resolve_path(sessions, file) {
        Ok(p) => p,
        Err(e) => {
            drain_write_stream(channel).await.ok();
            return send_response(channel, Response::Ret(-(e.errno()))).await;
        }
    };

    let mut cursor = *offset;
    let mut total_written: u64 = 0;
    loop {
        let len_bytes = channel.recv(4).await?;
        let n = i32::from_le_bytes(len_bytes.try_into().unwrap());
        if n <= 0 {
            break;
        }
        let data = channel.recv(n as usize).await?;
        fs.write_at(&path, cursor, &data).await?;
        cursor += data.len() as u64;
        total_written += data.len() as u64;
    }

    if total_written > 0 {
        let header = MetadataHeader { file_size: cursor, ..MetadataHeader::absent() };
        metadata::write_mdata(fs, &path, header, true).await?;
    }

    send_response(channel, Response::Ret(total_written as i32)).await
}

/// Drains a write stream without writing anything, used when the target
/// path could not be resolved but the client has already started
/// streaming chunks.
async fn drain_write_stream(channel: &mut dyn Channel) -> XpnResult<()> {
    loop {
        let len_bytes = channel.recv(4).await?;
        let n = i32::from_le_bytes(len_bytes.try_into().unwrap());
        if n <= 0 {
            return Ok(());
        }
        channel.recv(n as usize).await?;
    }
}
