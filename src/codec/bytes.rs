//! Codec bindings for the `bytes` crate types.
//!
//! `BytesMut` is the sink and `Bytes` the source, so encoders can write
//! straight into network-facing buffers without an intermediate copy.

use crate::codec::{DataReader, DataWriter};
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

impl DataWriter for BytesMut {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl DataReader for Bytes {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.remaining() < buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "bytes exhausted",
            )));
        }
        self.copy_to_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let mut sink = BytesMut::new();
        sink.write_i64(i64::MIN).unwrap();
        sink.write_string("path/to/file").unwrap();
        sink.write_opt_i32(None).unwrap();

        let mut source = sink.freeze();
        assert_eq!(source.read_i64().unwrap(), i64::MIN);
        assert_eq!(source.read_string().unwrap(), "path/to/file");
        assert_eq!(source.read_opt_i32().unwrap(), None);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_bytes_underflow() {
        let mut source = Bytes::from_static(&[0u8; 3]);
        assert!(source.read_i32().is_err());
    }
}
