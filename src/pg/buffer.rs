//! Byte buffers for the wire protocol.
//!
//! `ReadBuffer` is a bounds-checked cursor over one message body: every read
//! that would run past the end reports a protocol error instead of panicking,
//! so a truncated or malformed frame can never be silently misparsed.
//! Frames themselves are split off the connection's receive buffer by
//! [`split_frame`], which only ever yields whole messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};

/// Largest message we accept from the server (1 GiB, the server's own limit
/// for a single field).
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Size of the tag byte plus the length word that start every backend message.
const HEADER_LEN: usize = 5;

/// Split one complete `(tag, body)` frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; in that case enough
/// capacity for the rest of the frame has been reserved.
pub fn split_frame(buf: &mut BytesMut) -> PgResult<Option<(u8, Bytes)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(PgError::Protocol(format!(
            "invalid length {} for message '{}'",
            len,
            tag as char
        )));
    }

    // The length word counts itself but not the tag.
    let total = 1 + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(total).freeze();
    frame.advance(HEADER_LEN);
    Ok(Some((tag, frame)))
}

/// Bounds-checked reader over a message body.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    buf: Bytes,
}

impl ReadBuffer {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes left unread.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol(format!(
                "truncated message: need {} bytes for {}, have {}",
                n,
                what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        self.need(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        self.need(2, "int16")?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        self.need(4, "int32")?;
        Ok(self.buf.get_i32())
    }

    /// Read a non-negative int16 count.
    pub fn read_count(&mut self) -> PgResult<usize> {
        let n = self.read_i16()?;
        usize::try_from(n).map_err(|_| PgError::Protocol(format!("negative count {}", n)))
    }

    /// Read `len` raw bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> PgResult<Bytes> {
        self.need(len, "field")?;
        Ok(self.buf.split_to(len))
    }

    /// Read an int32-length-prefixed field; length -1 encodes SQL NULL.
    pub fn read_nullable(&mut self) -> PgResult<Option<Bytes>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        self.read_bytes(len as usize).map(Some)
    }

    /// Read a null-terminated string of any length.
    pub fn read_cstr(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("missing null terminator in string".to_string()))?;

        let raw = self.buf.split_to(end);
        self.buf.advance(1);

        // Server strings are UTF-8 under the client_encoding we request
        Ok(match String::from_utf8(raw.to_vec()) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    /// Everything not yet read.
    pub fn into_rest(self) -> Bytes {
        self.buf
    }
}

/// Append a null-terminated string.
#[inline]
pub fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Append a tagged message, back-patching the length word once `body` has
/// written its contents.
pub fn write_message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    write_untagged(buf, body);
}

/// Append a message that has a length word but no tag (the startup message).
pub fn write_untagged(buf: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_frame_waits_for_whole_message() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'C', 0, 0, 0, 13]);
        buf.extend_from_slice(b"SELECT");
        assert!(split_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" 1\0Z");
        let (tag, body) = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(tag, b'C');
        assert_eq!(&body[..], b"SELECT 1\0");
        // The following message's first byte stays buffered
        assert_eq!(&buf[..], b"Z");
    }

    #[test]
    fn test_split_frame_rejects_bad_length() {
        let mut buf = BytesMut::from(&[b'D', 0, 0, 0, 2][..]);
        assert!(matches!(split_frame(&mut buf), Err(PgError::Protocol(_))));

        let mut buf = BytesMut::from(&[b'D', 0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(split_frame(&mut buf), Err(PgError::Protocol(_))));
    }

    #[test]
    fn test_read_cstr_large() {
        let msg = "0".repeat(1024 * 100);
        let mut raw = BytesMut::new();
        put_cstr(&mut raw, &msg);
        put_cstr(&mut raw, "next");

        let mut rb = ReadBuffer::new(raw.freeze());
        assert_eq!(rb.read_cstr().unwrap(), msg);
        assert_eq!(rb.read_cstr().unwrap(), "next");
        assert_eq!(rb.remaining(), 0);
    }

    #[test]
    fn test_truncated_reads_are_errors() {
        let mut rb = ReadBuffer::new(Bytes::from_static(&[0, 1, 0]));
        assert_eq!(rb.read_i16().unwrap(), 1);
        assert!(matches!(rb.read_i32(), Err(PgError::Protocol(_))));

        let mut rb = ReadBuffer::new(Bytes::from_static(b"no terminator"));
        assert!(matches!(rb.read_cstr(), Err(PgError::Protocol(_))));

        let mut rb = ReadBuffer::new(Bytes::from_static(&[0, 0, 0, 9, 1, 2]));
        assert!(matches!(rb.read_nullable(), Err(PgError::Protocol(_))));
    }

    #[test]
    fn test_read_nullable() {
        let mut rb = ReadBuffer::new(Bytes::from_static(&[
            0xff, 0xff, 0xff, 0xff, 0, 0, 0, 2, b'h', b'i',
        ]));
        assert_eq!(rb.read_nullable().unwrap(), None);
        assert_eq!(rb.read_nullable().unwrap(), Some(Bytes::from_static(b"hi")));
    }

    #[test]
    fn test_write_message_backpatches_length() {
        let mut buf = BytesMut::new();
        write_message(&mut buf, b'Q', |b| put_cstr(b, "SELECT 1"));
        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len, 13);
        assert_eq!(buf.len(), 14);
    }
}
