//! Command execution against the local filesystem collaborator.
//!
//! One call per decoded request: runs the operation and writes the complete
//! response. Operation failures become status-500 responses on this
//! connection only; an error returned from here means the transport itself
//! broke and the connection must be dropped.

use crate::codec::records::encode_item;
use crate::codec::{ByteBuffer, DataWriter};
use crate::error::{Error, Result};
use crate::fs::{clean_relative, LocalTree, TreeSource, TreeTarget};
use crate::pool::{BufferPool, FixedBufferPool};
use crate::protocol::{
    end_chunks, write_chunk, write_chunked_header, write_error_response, write_ok_response,
    Request, PROTOCOL_VERSION,
};
use crate::server::session::{OpenFile, Session};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, warn};

pub(crate) fn handle<W: DataWriter>(
    session: &mut Session,
    serve_root: &Path,
    pool: &FixedBufferPool,
    request: Request,
    w: &mut W,
) -> Result<()> {
    let command = request.command();
    session.last_command = Some(command);

    match request {
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
            let listing = tree(session)
                .and_then(|t| TreeSource::enumerate(t, follow_symlinks, checksum, &filter));
            match listing {
                Ok(items) => {
                    debug!(peer = %session.peer, ?command, count = items.len(), "listing tree");
                    write_chunked_header(w)?;
                    let mut staged = ByteBuffer::new();
                    for item in &items {
                        staged.clear();
                        encode_item(&mut staged, item)?;
                        write_chunk(w, staged.filled())?;
                    }
                    end_chunks(w)
                }
                Err(e) => respond_error(session, w, &e),
            }
        }

        Request::OpenRead { path } => match tree(session).and_then(|t| t.open_read(&path)) {
            Ok(mut reader) => {
                debug!(peer = %session.peer, path, "streaming file");
                write_chunked_header(w)?;
                let mut lease = pool.lease(pool.default_size());
                loop {
                    lease.clear();
                    let n = lease.fill_from(pool.default_size(), |space| reader.read(space))?;
                    if n == 0 {
                        break;
                    }
                    write_chunk(w, lease.filled())?;
                }
                end_chunks(w)
            }
            Err(e) => respond_error(session, w, &e),
        },

        other => match execute(session, serve_root, other) {
            Ok(body) => write_ok_response(w, body.filled()),
            Err(e) => respond_error(session, w, &e),
        },
    }
}

/// Fixed-body commands: run the operation, return the response body.
fn execute(session: &mut Session, serve_root: &Path, request: Request) -> Result<ByteBuffer> {
    let mut body = ByteBuffer::new();
    match request {
        Request::Connect { version, root } => {
            if version != PROTOCOL_VERSION {
                return Err(Error::protocol(format!(
                    "peer speaks protocol {version}, this server speaks {PROTOCOL_VERSION}"
                )));
            }
            let tree_root = if root.is_empty() {
                serve_root.to_path_buf()
            } else {
                serve_root.join(clean_relative(&root)?)
            };
            if !tree_root.exists() {
                std::fs::create_dir_all(&tree_root)?;
            }
            debug!(peer = %session.peer, root = %tree_root.display(), "peer connected");
            session.tree = Some(LocalTree::new(tree_root));
            body.write_i32(PROTOCOL_VERSION)?;
        }

        Request::CreateDir { item } => {
            tree(session)?.create_dir(&item)?;
        }

        Request::DeleteEntry {
            path,
            follow_symlinks,
        } => {
            tree(session)?.delete(&path, follow_symlinks)?;
        }

        Request::SetDirMetadata { item } => {
            // Applying metadata to the in-flight file finalizes the transfer.
            if session
                .open_file
                .as_ref()
                .is_some_and(|open| open.item.path == item.path)
            {
                session.close_open_file()?;
            }
            tree(session)?.apply_metadata(&item)?;
        }

        Request::OpenWrite { item } => {
            if session.open_file.is_some() {
                warn!(peer = %session.peer, path = item.path, "open-write with a transfer in flight");
                session.close_open_file()?;
            }
            let sink = tree(session)?.open_write(&item)?;
            session.open_file = Some(OpenFile { sink, item });
        }

        Request::WriteChunk { data } => {
            let open = session
                .open_file
                .as_mut()
                .ok_or_else(|| Error::protocol("write-chunk with no open file"))?;
            open.sink.write_all(&data)?;
        }

        Request::Validate {
            item,
            with_checksum,
        } => {
            if session
                .open_file
                .as_ref()
                .is_some_and(|open| open.item.path == item.path)
            {
                session.close_open_file()?;
            }
            let failure = tree(session)?.validate(&item, with_checksum)?;
            body.write_opt_string(failure.as_deref())?;
        }

        // Chunked commands are handled in `handle`.
        Request::ListSender { .. } | Request::ListReceiver { .. } | Request::OpenRead { .. } => {
            unreachable!("chunked command routed to execute")
        }
    }
    Ok(body)
}

fn tree(session: &mut Session) -> Result<&mut LocalTree> {
    session
        .tree
        .as_mut()
        .ok_or_else(|| Error::protocol("connect required before this command"))
}

fn respond_error<W: DataWriter>(session: &mut Session, w: &mut W, err: &Error) -> Result<()> {
    use crate::protocol::ConnectionState;
    debug!(peer = %session.peer, error = %err, "command failed");
    session.state = ConnectionState::WritingErrorResponse;
    write_error_response(w, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DataReader, SliceReader};
    use crate::model::{PathFilter, SyncItem};
    use crate::protocol::{read_chunks_into, read_response, ResponseBody};
    use crate::codec::records::decode_item;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn peer() -> SocketAddr {
        "127.0.0.1:50001".parse().unwrap()
    }

    struct Fixture {
        session: Session,
        pool: Arc<FixedBufferPool>,
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let pool = Arc::new(FixedBufferPool::new(1024));
            Self {
                session: Session::new(peer(), &pool),
                pool,
                root: TempDir::new().unwrap(),
            }
        }

        fn run(&mut self, request: Request) -> ByteBuffer {
            let mut out = ByteBuffer::new();
            handle(
                &mut self.session,
                self.root.path(),
                &self.pool,
                request,
                &mut out,
            )
            .unwrap();
            out
        }

        fn connect(&mut self) {
            let mut out = self.run(Request::Connect {
                version: PROTOCOL_VERSION,
                root: String::new(),
            });
            match read_response(&mut out).unwrap() {
                ResponseBody::Data(body) => {
                    let mut r = SliceReader::new(&body);
                    assert_eq!(r.read_i32().unwrap(), PROTOCOL_VERSION);
                }
                other => panic!("unexpected body {other:?}"),
            }
        }
    }

    #[test]
    fn test_commands_before_connect_fail() {
        let mut fx = Fixture::new();
        let mut out = fx.run(Request::DeleteEntry {
            path: "x".to_string(),
            follow_symlinks: false,
        });
        assert!(matches!(
            read_response(&mut out),
            Err(Error::Remote { .. })
        ));
    }

    #[test]
    fn test_connect_version_mismatch() {
        let mut fx = Fixture::new();
        let mut out = fx.run(Request::Connect {
            version: 99,
            root: String::new(),
        });
        assert!(read_response(&mut out).is_err());
    }

    #[test]
    fn test_connect_rejects_escaping_root() {
        let mut fx = Fixture::new();
        let mut out = fx.run(Request::Connect {
            version: PROTOCOL_VERSION,
            root: "../elsewhere".to_string(),
        });
        assert!(read_response(&mut out).is_err());
    }

    #[test]
    fn test_list_streams_items() {
        let mut fx = Fixture::new();
        std::fs::write(fx.root.path().join("one.txt"), "1").unwrap();
        std::fs::create_dir(fx.root.path().join("d")).unwrap();
        fx.connect();

        let mut out = fx.run(Request::ListSender {
            follow_symlinks: false,
            checksum: false,
            filter: PathFilter::default(),
        });
        match read_response(&mut out).unwrap() {
            ResponseBody::Chunked => {}
            other => panic!("unexpected body {other:?}"),
        }
        let mut items = Vec::new();
        crate::protocol::for_each_chunk(&mut out, |chunk| {
            let mut r = SliceReader::new(chunk);
            items.push(decode_item(&mut r)?);
            Ok(())
        })
        .unwrap();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<_> = items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["d", "one.txt"]);
    }

    #[test]
    fn test_write_flow_then_validate() {
        let mut fx = Fixture::new();
        fx.connect();

        let item = SyncItem::file("sub/new.bin", 6, 1_700_000_000);
        let mut out = fx.run(Request::OpenWrite { item: item.clone() });
        assert!(matches!(
            read_response(&mut out).unwrap(),
            ResponseBody::Data(b) if b.is_empty()
        ));
        assert_eq!(fx.session.last_command, Some(crate::protocol::SyncCommand::OpenWrite));

        let mut out = fx.run(Request::WriteChunk {
            data: b"abc".to_vec(),
        });
        read_response(&mut out).unwrap();
        let mut out = fx.run(Request::WriteChunk {
            data: b"def".to_vec(),
        });
        read_response(&mut out).unwrap();

        let mut out = fx.run(Request::Validate {
            item: item.clone(),
            with_checksum: false,
        });
        match read_response(&mut out).unwrap() {
            ResponseBody::Data(body) => {
                let mut r = SliceReader::new(&body);
                assert_eq!(r.read_opt_string().unwrap(), None, "validation must pass");
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert!(fx.session.open_file.is_none(), "validate finalizes the transfer");
        assert_eq!(
            std::fs::read(fx.root.path().join("sub/new.bin")).unwrap(),
            b"abcdef"
        );
    }

    #[test]
    fn test_write_chunk_without_open_file() {
        let mut fx = Fixture::new();
        fx.connect();
        let mut out = fx.run(Request::WriteChunk {
            data: b"zz".to_vec(),
        });
        assert!(read_response(&mut out).is_err());
    }

    #[test]
    fn test_open_read_streams_content() {
        let mut fx = Fixture::new();
        std::fs::write(fx.root.path().join("payload"), b"stream me").unwrap();
        fx.connect();

        let mut out = fx.run(Request::OpenRead {
            path: "payload".to_string(),
        });
        assert!(matches!(
            read_response(&mut out).unwrap(),
            ResponseBody::Chunked
        ));
        let mut data = Vec::new();
        read_chunks_into(&mut out, &mut data).unwrap();
        assert_eq!(data, b"stream me");
    }

    #[test]
    fn test_open_read_missing_file_is_500() {
        let mut fx = Fixture::new();
        fx.connect();
        let mut out = fx.run(Request::OpenRead {
            path: "absent".to_string(),
        });
        assert!(read_response(&mut out).is_err());
    }
}
