//! Wire protocol: command codes, request/response framing, chunked streams.
//!
//! A request is one command byte followed by command-specific parameters in
//! the codec encodings. A response is a 4-byte status (200/500) and a 4-byte
//! body length; length -1 announces a chunk stream instead of a fixed body.
//! Error responses carry an encoded [`ErrorRecord`] body.
//!
//! Chunk streams are length-prefixed: a sequence of [i32 len > 0][len bytes]
//! ended by [i32 0] plus the 3-byte trailer `EOL`. The trailer is the
//! historical end-of-logical-message delimiter; with the length prefixes in
//! front of it, payloads containing those bytes can no longer corrupt
//! framing.

use crate::codec::records::{
    decode_error, decode_filter, decode_item, encode_error, encode_filter, encode_item,
    ErrorRecord,
};
use crate::codec::{ByteBuffer, DataReader, DataWriter};
use crate::error::{Error, Result};
use crate::model::{PathFilter, SyncItem};

pub const PROTOCOL_VERSION: i32 = 1;

pub const STATUS_OK: i32 = 200;
pub const STATUS_ERROR: i32 = 500;

/// Body-length sentinel announcing a chunk stream.
pub const CHUNKED_BODY: i32 = -1;

/// End-of-logical-message trailer, written after a chunk stream's zero
/// terminator and verified on read.
pub const CHUNK_TRAILER: [u8; 3] = [0x45, 0x4F, 0x4C];

/// Upper bound on a single chunk or fixed body, against corrupted frames.
pub const MAX_FRAME_SIZE: i32 = 64 * 1024 * 1024;

// =============================================================================
// Commands
// =============================================================================

/// Closed set of protocol operations, one byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncCommand {
    Connect = 0x01,
    ListSender = 0x02,
    OpenRead = 0x03,
    CreateDir = 0x04,
    ListReceiver = 0x05,
    DeleteEntry = 0x06,
    SetDirMetadata = 0x07,
    WriteChunk = 0x08,
    Validate = 0x09,
    OpenWrite = 0x0A,
}

impl SyncCommand {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::ListSender),
            0x03 => Some(Self::OpenRead),
            0x04 => Some(Self::CreateDir),
            0x05 => Some(Self::ListReceiver),
            0x06 => Some(Self::DeleteEntry),
            0x07 => Some(Self::SetDirMetadata),
            0x08 => Some(Self::WriteChunk),
            0x09 => Some(Self::Validate),
            0x0A => Some(Self::OpenWrite),
            _ => None,
        }
    }
}

/// Per-connection protocol state, server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingCommand,
    Dispatching,
    WritingErrorResponse,
}

// =============================================================================
// Requests
// =============================================================================

/// A decoded request: command plus parameters.
#[derive(Debug, Clone)]
pub enum Request {
    Connect {
        version: i32,
        root: String,
    },
    ListSender {
        follow_symlinks: bool,
        checksum: bool,
        filter: PathFilter,
    },
    OpenRead {
        path: String,
    },
    CreateDir {
        item: SyncItem,
    },
    ListReceiver {
        follow_symlinks: bool,
        checksum: bool,
        filter: PathFilter,
    },
    DeleteEntry {
        path: String,
        follow_symlinks: bool,
    },
    SetDirMetadata {
        item: SyncItem,
    },
    /// Data appended to the connection's open destination file.
    WriteChunk {
        data: Vec<u8>,
    },
    Validate {
        item: SyncItem,
        with_checksum: bool,
    },
    OpenWrite {
        item: SyncItem,
    },
}

impl Request {
    pub fn command(&self) -> SyncCommand {
        match self {
            Request::Connect { .. } => SyncCommand::Connect,
            Request::ListSender { .. } => SyncCommand::ListSender,
            Request::OpenRead { .. } => SyncCommand::OpenRead,
            Request::CreateDir { .. } => SyncCommand::CreateDir,
            Request::ListReceiver { .. } => SyncCommand::ListReceiver,
            Request::DeleteEntry { .. } => SyncCommand::DeleteEntry,
            Request::SetDirMetadata { .. } => SyncCommand::SetDirMetadata,
            Request::WriteChunk { .. } => SyncCommand::WriteChunk,
            Request::Validate { .. } => SyncCommand::Validate,
            Request::OpenWrite { .. } => SyncCommand::OpenWrite,
        }
    }
}

pub fn encode_request<W: DataWriter>(w: &mut W, request: &Request) -> Result<()> {
    w.write_i8(request.command() as u8 as i8)?;
    match request {
        Request::Connect { version, root } => {
            w.write_i32(*version)?;
            w.write_string(root)
        }
        Request::ListSender {
            follow_symlinks,
            checksum,
            filter,
        }
        | Request::ListReceiver {
            follow_symlinks,
            checksum,
            filter,
        } => {
            w.write_bool(*follow_symlinks)?;
            w.write_bool(*checksum)?;
            encode_filter(w, filter)
        }
        Request::OpenRead { path } => w.write_string(path),
        Request::CreateDir { item }
        | Request::SetDirMetadata { item }
        | Request::OpenWrite { item } => encode_item(w, item),
        Request::DeleteEntry {
            path,
            follow_symlinks,
        } => {
            w.write_string(path)?;
            w.write_bool(*follow_symlinks)
        }
        Request::WriteChunk { data } => {
            write_chunk(w, data)?;
            end_chunks(w)
        }
        Request::Validate {
            item,
            with_checksum,
        } => {
            encode_item(w, item)?;
            w.write_bool(*with_checksum)
        }
    }
}

/// Decode one request.
///
/// Running out of bytes mid-request surfaces as `UnexpectedEof` (see
/// [`crate::codec::is_eof`]); the caller keeps the buffer and retries after
/// the next read. An unknown command byte is a protocol error.
pub fn decode_request<R: DataReader>(r: &mut R) -> Result<Request> {
    let code = r.read_i8()? as u8;
    let command = SyncCommand::from_u8(code).ok_or(Error::UnknownCommand(code))?;

    match command {
        SyncCommand::Connect => Ok(Request::Connect {
            version: r.read_i32()?,
            root: r.read_string()?,
        }),
        SyncCommand::ListSender => Ok(Request::ListSender {
            follow_symlinks: r.read_bool()?,
            checksum: r.read_bool()?,
            filter: decode_filter(r)?,
        }),
        SyncCommand::ListReceiver => Ok(Request::ListReceiver {
            follow_symlinks: r.read_bool()?,
            checksum: r.read_bool()?,
            filter: decode_filter(r)?,
        }),
        SyncCommand::OpenRead => Ok(Request::OpenRead {
            path: r.read_string()?,
        }),
        SyncCommand::CreateDir => Ok(Request::CreateDir {
            item: decode_item(r)?,
        }),
        SyncCommand::DeleteEntry => Ok(Request::DeleteEntry {
            path: r.read_string()?,
            follow_symlinks: r.read_bool()?,
        }),
        SyncCommand::SetDirMetadata => Ok(Request::SetDirMetadata {
            item: decode_item(r)?,
        }),
        SyncCommand::WriteChunk => {
            let mut data = Vec::new();
            read_chunks_into(r, &mut data)?;
            Ok(Request::WriteChunk { data })
        }
        SyncCommand::Validate => Ok(Request::Validate {
            item: decode_item(r)?,
            with_checksum: r.read_bool()?,
        }),
        SyncCommand::OpenWrite => Ok(Request::OpenWrite {
            item: decode_item(r)?,
        }),
    }
}

// =============================================================================
// Responses
// =============================================================================

pub fn write_ok_response<W: DataWriter>(w: &mut W, body: &[u8]) -> Result<()> {
    w.write_i32(STATUS_OK)?;
    w.write_i32(body.len() as i32)?;
    w.write_bytes(body)
}

/// Status 200 with the chunked-body sentinel; chunks follow.
pub fn write_chunked_header<W: DataWriter>(w: &mut W) -> Result<()> {
    w.write_i32(STATUS_OK)?;
    w.write_i32(CHUNKED_BODY)
}

pub fn write_error_response<W: DataWriter>(w: &mut W, err: &Error) -> Result<()> {
    let record = ErrorRecord::from_error(err);
    let mut body = ByteBuffer::new();
    encode_error(&mut body, &record)?;
    w.write_i32(STATUS_ERROR)?;
    w.write_i32(body.remaining() as i32)?;
    w.write_bytes(body.filled())
}

/// A successful response body, fixed or announced as chunked.
#[derive(Debug)]
pub enum ResponseBody {
    Data(Vec<u8>),
    /// Chunk stream follows on the same reader.
    Chunked,
}

/// Read a response header and body; a 500 decodes into `Error::Remote`.
pub fn read_response<R: DataReader>(r: &mut R) -> Result<ResponseBody> {
    let status = r.read_i32()?;
    let len = r.read_i32()?;

    if len == CHUNKED_BODY {
        if status != STATUS_OK {
            return Err(Error::protocol("chunked body on non-200 response"));
        }
        return Ok(ResponseBody::Chunked);
    }
    if len < 0 || len > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("bad response body length {len}")));
    }

    let body = r.read_byte_vec(len as usize)?;
    match status {
        STATUS_OK => Ok(ResponseBody::Data(body)),
        STATUS_ERROR => {
            let mut body_reader = crate::codec::SliceReader::new(&body);
            Err(decode_error(&mut body_reader)?.into_error())
        }
        other => Err(Error::protocol(format!("unknown status code {other}"))),
    }
}

// =============================================================================
// Chunk streams
// =============================================================================

pub fn write_chunk<W: DataWriter>(w: &mut W, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    w.write_i32(data.len() as i32)?;
    w.write_bytes(data)
}

pub fn end_chunks<W: DataWriter>(w: &mut W) -> Result<()> {
    w.write_i32(0)?;
    w.write_bytes(&CHUNK_TRAILER)
}

/// Read one chunk length: `Some(len)` for a data chunk, `None` at the zero
/// terminator (after verifying the trailer).
pub fn read_chunk_len<R: DataReader>(r: &mut R) -> Result<Option<usize>> {
    let len = r.read_i32()?;
    if len == 0 {
        let mut trailer = [0u8; 3];
        r.read_exact(&mut trailer)?;
        if trailer != CHUNK_TRAILER {
            return Err(Error::protocol("missing end-of-message trailer"));
        }
        return Ok(None);
    }
    if len < 0 || len > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("bad chunk length {len}")));
    }
    Ok(Some(len as usize))
}

/// Consume a chunk stream, handing each chunk to `f`.
pub fn for_each_chunk<R, F>(r: &mut R, mut f: F) -> Result<()>
where
    R: DataReader,
    F: FnMut(&[u8]) -> Result<()>,
{
    while let Some(len) = read_chunk_len(r)? {
        let chunk = r.read_byte_vec(len)?;
        f(&chunk)?;
    }
    Ok(())
}

/// Accumulate a whole chunk stream into `out`.
pub fn read_chunks_into<R: DataReader>(r: &mut R, out: &mut Vec<u8>) -> Result<()> {
    for_each_chunk(r, |chunk| {
        out.extend_from_slice(chunk);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{is_eof, SliceReader};

    #[test]
    fn test_command_mapping_total_and_bidirectional() {
        let all = [
            SyncCommand::Connect,
            SyncCommand::ListSender,
            SyncCommand::OpenRead,
            SyncCommand::CreateDir,
            SyncCommand::ListReceiver,
            SyncCommand::DeleteEntry,
            SyncCommand::SetDirMetadata,
            SyncCommand::WriteChunk,
            SyncCommand::Validate,
            SyncCommand::OpenWrite,
        ];
        for cmd in all {
            assert_eq!(SyncCommand::from_u8(cmd as u8), Some(cmd));
        }
        assert_eq!(SyncCommand::from_u8(0x00), None);
        assert_eq!(SyncCommand::from_u8(0x0B), None);
        assert_eq!(SyncCommand::from_u8(0xFF), None);
    }

    fn roundtrip(request: Request) -> Request {
        let mut buf = ByteBuffer::new();
        encode_request(&mut buf, &request).unwrap();
        let mut r = SliceReader::new(buf.filled());
        let decoded = decode_request(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        decoded
    }

    #[test]
    fn test_request_roundtrip_connect() {
        match roundtrip(Request::Connect {
            version: PROTOCOL_VERSION,
            root: "data/tree".to_string(),
        }) {
            Request::Connect { version, root } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert_eq!(root, "data/tree");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_request_roundtrip_list() {
        let filter = PathFilter::new(vec!["*.tmp".to_string()]);
        match roundtrip(Request::ListSender {
            follow_symlinks: true,
            checksum: false,
            filter: filter.clone(),
        }) {
            Request::ListSender {
                follow_symlinks,
                checksum,
                filter: f,
            } => {
                assert!(follow_symlinks);
                assert!(!checksum);
                assert_eq!(f, filter);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_request_roundtrip_write_chunk() {
        match roundtrip(Request::WriteChunk {
            data: vec![1, 2, 3, 4, 5],
        }) {
            Request::WriteChunk { data } => assert_eq!(data, vec![1, 2, 3, 4, 5]),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_request_roundtrip_validate() {
        let item = SyncItem::file("a/b", 9, 99);
        match roundtrip(Request::Validate {
            item: item.clone(),
            with_checksum: true,
        }) {
            Request::Validate {
                item: i,
                with_checksum,
            } => {
                assert_eq!(i, item);
                assert!(with_checksum);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_partial_request_reports_eof() {
        let mut buf = ByteBuffer::new();
        encode_request(
            &mut buf,
            &Request::OpenRead {
                path: "some/long/path.bin".to_string(),
            },
        )
        .unwrap();
        let bytes = buf.filled();

        // Every strict prefix must decode as incomplete, not as garbage.
        for cut in 0..bytes.len() {
            let mut r = SliceReader::new(&bytes[..cut]);
            let err = decode_request(&mut r).unwrap_err();
            assert!(is_eof(&err), "prefix of {cut} bytes: {err}");
        }
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut r = SliceReader::new(&[0x7F]);
        match decode_request(&mut r) {
            Err(Error::UnknownCommand(0x7F)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_response_ok_roundtrip() {
        let mut buf = ByteBuffer::new();
        write_ok_response(&mut buf, b"payload").unwrap();
        match read_response(&mut buf).unwrap() {
            ResponseBody::Data(body) => assert_eq!(body, b"payload"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_response_error_roundtrip() {
        let mut buf = ByteBuffer::new();
        let err = Error::Validation {
            path: "a/b".to_string(),
            reason: "size mismatch".to_string(),
        };
        write_error_response(&mut buf, &err).unwrap();
        match read_response(&mut buf).unwrap_err() {
            Error::Remote { code, path, .. } => {
                assert_eq!(code, 4);
                assert_eq!(path.as_deref(), Some("a/b"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_chunk_stream_roundtrip() {
        let mut buf = ByteBuffer::new();
        write_chunked_header(&mut buf).unwrap();
        write_chunk(&mut buf, b"first").unwrap();
        write_chunk(&mut buf, b"").unwrap();
        write_chunk(&mut buf, b"second").unwrap();
        end_chunks(&mut buf).unwrap();

        match read_response(&mut buf).unwrap() {
            ResponseBody::Chunked => {}
            other => panic!("unexpected body {other:?}"),
        }
        let mut out = Vec::new();
        read_chunks_into(&mut buf, &mut out).unwrap();
        assert_eq!(out, b"firstsecond");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunk_payload_may_contain_trailer_bytes() {
        // The length prefix makes the trailer inert inside payloads.
        let payload = [b'x', 0x45, 0x4F, 0x4C, b'y'];
        let mut buf = ByteBuffer::new();
        write_chunk(&mut buf, &payload).unwrap();
        end_chunks(&mut buf).unwrap();

        let mut out = Vec::new();
        read_chunks_into(&mut buf, &mut out).unwrap();
        assert_eq!(out, payload);
    }
}
