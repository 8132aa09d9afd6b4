//! Wire protocol: opcodes, argument records, and response frames.
//!
//! Every request is `uint32 opcode | fixed-size record | streamed payload`;
//! every response is `(status | size | attr | data)` per opcode, per the
//! table in the external-interfaces section. Encoding here is little-endian
//! regardless of host byte order — the design notes flag host-endian wire
//! records as a liability once heterogeneous fleets are in play, so this
//! implementation fixes the endianness up front instead of reproducing it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::io::{self, Cursor, Read, Write};

use crate::localfs::{FileStat, VfsStat};

/// Maximum size of a single read/write streaming chunk.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024;

/// The opcode set implemented by the server request dispatcher. `WS`
/// variants keep a session-held local descriptor across requests; `WOS`
/// variants open, act, and close per request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Opcode {
    OpenWs = 0,
    OpenWos = 1,
    CreatWs = 2,
    CreatWos = 3,
    ReadWs = 4,
    ReadWos = 5,
    WriteWs = 6,
    WriteWos = 7,
    CloseWs = 8,
    Rm = 9,
    Rename = 10,
    GetAttr = 11,
    SetAttr = 12,
    Mkdir = 13,
    Opendir = 14,
    Readdir = 15,
    Closedir = 16,
    Rmdir = 17,
    Statvfs = 18,
    WriteMdataFileSize = 19,
    Flush = 20,
    Preload = 21,
    Checkpoint = 22,
    GetNodeName = 23,
    Finalize = 24,
    Disconnect = 25,
}

impl Opcode {
    pub fn from_u32(value: u32) -> io::Result<Self> {
        FromPrimitive::from_u32(value)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown opcode {value}")))
    }
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) -> io::Result<()> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.write_all(s.as_bytes())
}

pub(crate) fn read_string(cur: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Identifies the target of a READ/WRITE/CLOSE request: an open session
/// handle (`WS` opcodes) or a bare path (`WOS` opcodes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef {
    Handle(i64),
    Path(String),
}

impl FileRef {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            FileRef::Handle(h) => {
                out.write_u8(0)?;
                out.write_i64::<LittleEndian>(*h)
            }
            FileRef::Path(p) => {
                out.write_u8(1)?;
                write_string(out, p)
            }
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        match cur.read_u8()? {
            0 => Ok(FileRef::Handle(cur.read_i64::<LittleEndian>()?)),
            1 => Ok(FileRef::Path(read_string(cur)?)),
            tag => Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad FileRef tag {tag}"))),
        }
    }
}

/// Decoded request argument record, tagged by the [`Opcode`] it travels
/// with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `sessioned = true` picks `OPEN_WS` (the server retains the
    /// resulting descriptor); `false` picks `OPEN_WOS` (the server opens,
    /// validates, and closes before responding).
    Open { path: String, flags: i32, sessioned: bool },
    Creat { path: String, mode: u32, sessioned: bool },
    Read { file: FileRef, offset: u64, size: u32 },
    Write { file: FileRef, offset: u64, size: u32 },
    Close { handle: i64 },
    Rm { path: String },
    Rename { from: String, to: String },
    GetAttr { path: String },
    SetAttr { path: String, mode: Option<u32>, size: Option<u64>, mtime: Option<i64> },
    Mkdir { path: String, mode: u32 },
    Opendir { path: String },
    Readdir { handle: i64 },
    Closedir { handle: i64 },
    Rmdir { path: String },
    Statvfs { path: String },
    WriteMdataFileSize { path: String, size: u64 },
    Flush { src: String, dst: String },
    Preload { src: String, dst: String },
    Checkpoint { src: String, dst: String },
    GetNodeName,
    Finalize,
    Disconnect,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Open { sessioned: true, .. } => Opcode::OpenWs,
            Request::Open { sessioned: false, .. } => Opcode::OpenWos,
            Request::Creat { sessioned: true, .. } => Opcode::CreatWs,
            Request::Creat { sessioned: false, .. } => Opcode::CreatWos,
            Request::Read { file: FileRef::Handle(_), .. } => Opcode::ReadWs,
            Request::Read { file: FileRef::Path(_), .. } => Opcode::ReadWos,
            Request::Write { file: FileRef::Handle(_), .. } => Opcode::WriteWs,
            Request::Write { file: FileRef::Path(_), .. } => Opcode::WriteWos,
            Request::Close { .. } => Opcode::CloseWs,
            Request::Rm { .. } => Opcode::Rm,
            Request::Rename { .. } => Opcode::Rename,
            Request::GetAttr { .. } => Opcode::GetAttr,
            Request::SetAttr { .. } => Opcode::SetAttr,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Opendir { .. } => Opcode::Opendir,
            Request::Readdir { .. } => Opcode::Readdir,
            Request::Closedir { .. } => Opcode::Closedir,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::Statvfs { .. } => Opcode::Statvfs,
            Request::WriteMdataFileSize { .. } => Opcode::WriteMdataFileSize,
            Request::Flush { .. } => Opcode::Flush,
            Request::Preload { .. } => Opcode::Preload,
            Request::Checkpoint { .. } => Opcode::Checkpoint,
            Request::GetNodeName => Opcode::GetNodeName,
            Request::Finalize => Opcode::Finalize,
            Request::Disconnect => Opcode::Disconnect,
        }
    }

    /// Encodes `opcode (u32) | record` for sending over a channel.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.opcode() as u32)?;
        match self {
            Request::Open { path, flags, .. } => {
                write_string(&mut out, path)?;
                out.write_i32::<LittleEndian>(*flags)?;
            }
            Request::Creat { path, mode, .. } => {
                write_string(&mut out, path)?;
                out.write_u32::<LittleEndian>(*mode)?;
            }
            Request::Read { file, offset, size } | Request::Write { file, offset, size } => {
                file.encode(&mut out)?;
                out.write_u64::<LittleEndian>(*offset)?;
                out.write_u32::<LittleEndian>(*size)?;
            }
            Request::Close { handle } => out.write_i64::<LittleEndian>(*handle)?,
            Request::Rm { path } | Request::Rmdir { path } | Request::Statvfs { path } | Request::GetAttr { path } | Request::Opendir { path } => {
                write_string(&mut out, path)?;
            }
            Request::Rename { from, to } => {
                write_string(&mut out, from)?;
                write_string(&mut out, to)?;
            }
            Request::SetAttr { path, mode, size, mtime } => {
                write_string(&mut out, path)?;
                write_opt_u32(&mut out, *mode)?;
                write_opt_u64(&mut out, *size)?;
                write_opt_i64(&mut out, *mtime)?;
            }
            Request::Mkdir { path, mode } => {
                write_string(&mut out, path)?;
                out.write_u32::<LittleEndian>(*mode)?;
            }
            Request::Readdir { handle } | Request::Closedir { handle } => {
                out.write_i64::<LittleEndian>(*handle)?;
            }
            Request::WriteMdataFileSize { path, size } => {
                write_string(&mut out, path)?;
                out.write_u64::<LittleEndian>(*size)?;
            }
            Request::Flush { src, dst } | Request::Preload { src, dst } | Request::Checkpoint { src, dst } => {
                write_string(&mut out, src)?;
                write_string(&mut out, dst)?;
            }
            Request::GetNodeName | Request::Finalize | Request::Disconnect => {}
        }
        Ok(out)
    }

    /// Decodes a record's body (opcode already consumed) into the typed
    /// [`Request`] it represents.
    pub fn decode(opcode: Opcode, body: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(match opcode {
            Opcode::OpenWs | Opcode::OpenWos => Request::Open {
                path: read_string(&mut cur)?,
                flags: cur.read_i32::<LittleEndian>()?,
                sessioned: opcode == Opcode::OpenWs,
            },
            Opcode::CreatWs | Opcode::CreatWos => Request::Creat {
                path: read_string(&mut cur)?,
                mode: cur.read_u32::<LittleEndian>()?,
                sessioned: opcode == Opcode::CreatWs,
            },
            Opcode::ReadWs => {
                let file = FileRef::decode(&mut cur)?;
                Request::Read { file, offset: cur.read_u64::<LittleEndian>()?, size: cur.read_u32::<LittleEndian>()? }
            }
            Opcode::ReadWos => {
                let file = FileRef::decode(&mut cur)?;
                Request::Read { file, offset: cur.read_u64::<LittleEndian>()?, size: cur.read_u32::<LittleEndian>()? }
            }
            Opcode::WriteWs | Opcode::WriteWos => {
                let file = FileRef::decode(&mut cur)?;
                Request::Write { file, offset: cur.read_u64::<LittleEndian>()?, size: cur.read_u32::<LittleEndian>()? }
            }
            Opcode::CloseWs => Request::Close { handle: cur.read_i64::<LittleEndian>()? },
            Opcode::Rm => Request::Rm { path: read_string(&mut cur)? },
            Opcode::Rename => Request::Rename { from: read_string(&mut cur)?, to: read_string(&mut cur)? },
            Opcode::GetAttr => Request::GetAttr { path: read_string(&mut cur)? },
            Opcode::SetAttr => Request::SetAttr {
                path: read_string(&mut cur)?,
                mode: read_opt_u32(&mut cur)?,
                size: read_opt_u64(&mut cur)?,
                mtime: read_opt_i64(&mut cur)?,
            },
            Opcode::Mkdir => {
                Request::Mkdir { path: read_string(&mut cur)?, mode: cur.read_u32::<LittleEndian>()? }
            }
            Opcode::Opendir => Request::Opendir { path: read_string(&mut cur)? },
            Opcode::Readdir => Request::Readdir { handle: cur.read_i64::<LittleEndian>()? },
            Opcode::Closedir => Request::Closedir { handle: cur.read_i64::<LittleEndian>()? },
            Opcode::Rmdir => Request::Rmdir { path: read_string(&mut cur)? },
            Opcode::Statvfs => Request::Statvfs { path: read_string(&mut cur)? },
            Opcode::WriteMdataFileSize => Request::WriteMdataFileSize {
                path: read_string(&mut cur)?,
                size: cur.read_u64::<LittleEndian>()?,
            },
            Opcode::Flush => Request::Flush { src: read_string(&mut cur)?, dst: read_string(&mut cur)? },
            Opcode::Preload => Request::Preload { src: read_string(&mut cur)?, dst: read_string(&mut cur)? },
            Opcode::Checkpoint => {
                Request::Checkpoint { src: read_string(&mut cur)?, dst: read_string(&mut cur)? }
            }
            Opcode::GetNodeName => Request::GetNodeName,
            Opcode::Finalize => Request::Finalize,
            Opcode::Disconnect => Request::Disconnect,
        })
    }
}

fn write_opt_u32(out: &mut Vec<u8>, v: Option<u32>) -> io::Result<()> {
    match v {
        Some(v) => {
            out.write_u8(1)?;
            out.write_u32::<LittleEndian>(v)
        }
        None => out.write_u8(0),
    }
}
fn read_opt_u32(cur: &mut Cursor<&[u8]>) -> io::Result<Option<u32>> {
    Ok(if cur.read_u8()? == 1 { Some(cur.read_u32::<LittleEndian>()?) } else { None })
}
fn write_opt_u64(out: &mut Vec<u8>, v: Option<u64>) -> io::Result<()> {
    match v {
        Some(v) => {
            out.write_u8(1)?;
            out.write_u64::<LittleEndian>(v)
        }
        None => out.write_u8(0),
    }
}
fn read_opt_u64(cur: &mut Cursor<&[u8]>) -> io::Result<Option<u64>> {
    Ok(if cur.read_u8()? == 1 { Some(cur.read_u64::<LittleEndian>()?) } else { None })
}
fn write_opt_i64(out: &mut Vec<u8>, v: Option<i64>) -> io::Result<()> {
    match v {
        Some(v) => {
            out.write_u8(1)?;
            out.write_i64::<LittleEndian>(v)
        }
        None => out.write_u8(0),
    }
}
fn read_opt_i64(cur: &mut Cursor<&[u8]>) -> io::Result<Option<i64>> {
    Ok(if cur.read_u8()? == 1 { Some(cur.read_i64::<LittleEndian>()?) } else { None })
}

/// A single `(n, data)` frame of a READ/WRITE stream. `n < 0` signals an
/// error and terminates the stream; `n == 0` signals end of stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub n: i32,
    pub data: Vec<u8>,
}

impl StreamFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.write_i32::<LittleEndian>(self.n).unwrap();
        if self.n > 0 {
            out.extend_from_slice(&self.data);
        }
        out
    }

    pub fn error() -> Self {
        Self { n: -1, data: Vec::new() }
    }

    pub fn eof() -> Self {
        Self { n: 0, data: Vec::new() }
    }
}

/// A non-streaming response record, one variant per opcode family.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Session handle returned by `OPEN_WS`/`OPEN_WOS`/`CREAT_WS`/`CREAT_WOS`.
    Handle(i64),
    Ret(i32),
    GetAttr { status: i32, stat: FileStat },
    DirHandle(i64),
    ReaddirEntry { end: bool, name: Option<String>, fileid: u64 },
    Statvfs { ret: i32, stat: VfsStat },
    FlushResult { ret: i32, errno: i32 },
    NodeName { host: String, path: String },
}

impl Response {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Response::Handle(h) => out.write_i64::<LittleEndian>(*h)?,
            Response::Ret(ret) => out.write_i32::<LittleEndian>(*ret)?,
            Response::GetAttr { status, stat } => {
                out.write_i32::<LittleEndian>(*status)?;
                out.write_u64::<LittleEndian>(stat.size)?;
                out.write_u8(stat.is_dir as u8)?;
                out.write_u32::<LittleEndian>(stat.mode)?;
                out.write_i64::<LittleEndian>(stat.mtime_secs)?;
                out.write_u32::<LittleEndian>(stat.mtime_nanos)?;
                out.write_i64::<LittleEndian>(stat.atime_secs)?;
                out.write_u32::<LittleEndian>(stat.atime_nanos)?;
            }
            Response::DirHandle(h) => out.write_i64::<LittleEndian>(*h)?,
            Response::ReaddirEntry { end, name, fileid } => {
                out.write_u8(*end as u8)?;
                match name {
                    Some(n) => {
                        out.write_u8(1)?;
                        write_string(&mut out, n)?;
                    }
                    None => out.write_u8(0)?,
                }
                out.write_u64::<LittleEndian>(*fileid)?;
            }
            Response::Statvfs { ret, stat } => {
                out.write_i32::<LittleEndian>(*ret)?;
                out.write_u64::<LittleEndian>(stat.block_size)?;
                out.write_u64::<LittleEndian>(stat.total_blocks)?;
                out.write_u64::<LittleEndian>(stat.free_blocks)?;
                out.write_u64::<LittleEndian>(stat.total_files)?;
                out.write_u64::<LittleEndian>(stat.free_files)?;
            }
            Response::FlushResult { ret, errno } => {
                out.write_i32::<LittleEndian>(*ret)?;
                out.write_i32::<LittleEndian>(*errno)?;
            }
            Response::NodeName { host, path } => {
                write_string(&mut out, host)?;
                write_string(&mut out, path)?;
            }
        }
        Ok(out)
    }

    /// Decodes a response for `opcode`. The shape is fully determined by
    /// the opcode that requested it, so no separate response tag travels
    /// on the wire.
    pub fn decode(opcode: Opcode, body: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(match opcode {
            Opcode::OpenWs | Opcode::OpenWos | Opcode::CreatWs | Opcode::CreatWos => {
                Response::Handle(cur.read_i64::<LittleEndian>()?)
            }
            Opcode::GetAttr => {
                let status = cur.read_i32::<LittleEndian>()?;
                let stat = FileStat {
                    size: cur.read_u64::<LittleEndian>()?,
                    is_dir: cur.read_u8()? != 0,
                    mode: cur.read_u32::<LittleEndian>()?,
                    mtime_secs: cur.read_i64::<LittleEndian>()?,
                    mtime_nanos: cur.read_u32::<LittleEndian>()?,
                    atime_secs: cur.read_i64::<LittleEndian>()?,
                    atime_nanos: cur.read_u32::<LittleEndian>()?,
                };
                Response::GetAttr { status, stat }
            }
            Opcode::Opendir => Response::DirHandle(cur.read_i64::<LittleEndian>()?),
            Opcode::Readdir => {
                let end = cur.read_u8()? != 0;
                let name = if cur.read_u8()? == 1 { Some(read_string(&mut cur)?) } else { None };
                let fileid = cur.read_u64::<LittleEndian>()?;
                Response::ReaddirEntry { end, name, fileid }
            }
            Opcode::Statvfs => {
                let ret = cur.read_i32::<LittleEndian>()?;
                let stat = VfsStat {
                    block_size: cur.read_u64::<LittleEndian>()?,
                    total_blocks: cur.read_u64::<LittleEndian>()?,
                    free_blocks: cur.read_u64::<LittleEndian>()?,
                    total_files: cur.read_u64::<LittleEndian>()?,
                    free_files: cur.read_u64::<LittleEndian>()?,
                };
                Response::Statvfs { ret, stat }
            }
            Opcode::Flush | Opcode::Preload | Opcode::Checkpoint => {
                Response::FlushResult { ret: cur.read_i32::<LittleEndian>()?, errno: cur.read_i32::<LittleEndian>()? }
            }
            Opcode::GetNodeName => {
                Response::NodeName { host: read_string(&mut cur)?, path: read_string(&mut cur)? }
            }
            _ => Response::Ret(cur.read_i32::<LittleEndian>()?),
        })
    }
}

/// Prefixes `payload` with its own length so a reader that only knows how
/// to recv a fixed number of bytes at a time can frame variable-length
/// messages (request records and non-streaming responses both carry
/// variable-length strings).
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(payload);
    out
}
