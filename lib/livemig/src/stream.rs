// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-oriented migration stream.
//!
//! A [`Stream`] is opened either for output or for input over some
//! transport.  All multi-byte integers are big-endian.  Errors are sticky:
//! once an I/O error or end-of-stream has been observed, every later read
//! returns zeroes and every later write is dropped, and [`Stream::error`]
//! keeps reporting the first failure.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Amount of buffered output accumulated before it is pushed to the sink.
const OUTPUT_FLUSH_THRESHOLD: usize = 32 * 1024;

/// Granularity of reads from the input source.
const INPUT_CHUNK: usize = 32 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("unexpected end of stream")]
    Eof,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("stream is not open for {0}")]
    WrongDirection(&'static str),

    #[error("counted string of {0} bytes does not fit a length byte")]
    StringTooLong(usize),

    #[error("stream aborted: {0}")]
    Aborted(String),
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StreamError::Eof
        } else {
            StreamError::Io(e.to_string())
        }
    }
}

enum Inner {
    Output {
        sink: Box<dyn Write + Send>,
        buf: BytesMut,
    },
    Input {
        source: Box<dyn Read + Send>,
        buf: Vec<u8>,
        pos: usize,
        exhausted: bool,
    },
}

pub struct Stream {
    inner: Inner,
    error: Option<StreamError>,

    /// Bytes produced or consumed through this stream.
    transferred: u64,

    rate_limit_max: u64,
    rate_limit_used: u64,
}

impl Stream {
    /// Open a stream which writes to `sink`.
    pub fn output(sink: impl Write + Send + 'static) -> Self {
        Self::new(Inner::Output {
            sink: Box::new(sink),
            buf: BytesMut::with_capacity(OUTPUT_FLUSH_THRESHOLD),
        })
    }

    /// Open a stream which reads from `source`.
    pub fn input(source: impl Read + Send + 'static) -> Self {
        Self::new(Inner::Input {
            source: Box::new(source),
            buf: Vec::new(),
            pos: 0,
            exhausted: false,
        })
    }

    /// Open an input stream over an in-memory copy of `bytes`.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::input(std::io::Cursor::new(bytes.into()))
    }

    fn new(inner: Inner) -> Self {
        Self {
            inner,
            error: None,
            transferred: 0,
            rate_limit_max: u64::MAX,
            rate_limit_used: 0,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.inner, Inner::Output { .. })
    }

    /// The first error observed on this stream, if any.
    pub fn error(&self) -> Result<(), StreamError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Record `err` unless an earlier error is already latched.
    pub fn set_error(&mut self, err: StreamError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Total bytes written to (or read from) the stream so far, including
    /// output which is still buffered.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    // Output

    fn out_buf(&mut self) -> Option<&mut BytesMut> {
        if self.error.is_some() {
            return None;
        }
        match &mut self.inner {
            Inner::Output { buf, .. } => Some(buf),
            Inner::Input { .. } => {
                self.error = Some(StreamError::WrongDirection("output"));
                None
            }
        }
    }

    fn account_output(&mut self, len: usize) {
        self.transferred += len as u64;
        self.rate_limit_used += len as u64;
        let full = match &self.inner {
            Inner::Output { buf, .. } => buf.len() >= OUTPUT_FLUSH_THRESHOLD,
            Inner::Input { .. } => false,
        };
        if full {
            self.flush();
        }
    }

    pub fn put_byte(&mut self, v: u8) {
        if let Some(buf) = self.out_buf() {
            buf.put_u8(v);
            self.account_output(1);
        }
    }

    pub fn put_be16(&mut self, v: u16) {
        if let Some(buf) = self.out_buf() {
            buf.put_u16(v);
            self.account_output(2);
        }
    }

    pub fn put_be32(&mut self, v: u32) {
        if let Some(buf) = self.out_buf() {
            buf.put_u32(v);
            self.account_output(4);
        }
    }

    pub fn put_be64(&mut self, v: u64) {
        if let Some(buf) = self.out_buf() {
            buf.put_u64(v);
            self.account_output(8);
        }
    }

    pub fn put_buffer(&mut self, data: &[u8]) {
        if let Some(buf) = self.out_buf() {
            buf.put_slice(data);
            self.account_output(data.len());
        }
    }

    /// Write a string prefixed by its length as a single byte.
    pub fn put_counted_string(&mut self, s: &str) {
        match u8::try_from(s.len()) {
            Ok(len) => {
                self.put_byte(len);
                self.put_buffer(s.as_bytes());
            }
            Err(_) => self.set_error(StreamError::StringTooLong(s.len())),
        }
    }

    /// Push any buffered output to the sink.
    pub fn flush(&mut self) {
        if self.error.is_some() {
            return;
        }
        if let Inner::Output { sink, buf } = &mut self.inner {
            let res = sink.write_all(buf).and_then(|_| sink.flush());
            buf.clear();
            if let Err(e) = res {
                self.error = Some(e.into());
            }
        }
    }

    // Input

    /// Make at least `want` unread bytes available in the input buffer.
    /// Returns false (latching [`StreamError::Eof`] when `latch` is set) if
    /// the source ends first.
    fn fill(&mut self, want: usize, latch: bool) -> bool {
        if self.error.is_some() {
            return false;
        }
        let Inner::Input { source, buf, pos, exhausted } = &mut self.inner
        else {
            self.error = Some(StreamError::WrongDirection("input"));
            return false;
        };
        if *pos > 0 && *pos == buf.len() {
            buf.clear();
            *pos = 0;
        }
        while buf.len() - *pos < want {
            if *exhausted {
                if latch {
                    self.error = Some(StreamError::Eof);
                }
                return false;
            }
            let start = buf.len();
            buf.resize(start + INPUT_CHUNK.max(want), 0);
            match source.read(&mut buf[start..]) {
                Ok(0) => {
                    buf.truncate(start);
                    *exhausted = true;
                }
                Ok(n) => buf.truncate(start + n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    buf.truncate(start);
                }
                Err(e) => {
                    buf.truncate(start);
                    self.error = Some(e.into());
                    return false;
                }
            }
        }
        true
    }

    fn unread(&self) -> &[u8] {
        match &self.inner {
            Inner::Input { buf, pos, .. } => &buf[*pos..],
            Inner::Output { .. } => &[],
        }
    }

    fn consume(&mut self, len: usize) {
        if let Inner::Input { pos, .. } = &mut self.inner {
            *pos += len;
            self.transferred += len as u64;
        }
    }

    /// Look at the byte `offset` bytes ahead without consuming anything.
    /// Peeking past the end of the input latches [`StreamError::Eof`].
    pub fn peek_byte(&mut self, offset: usize) -> u8 {
        if self.fill(offset + 1, true) {
            self.unread()[offset]
        } else {
            0
        }
    }

    /// Look at `len` bytes starting `offset` bytes ahead.
    pub fn peek_buffer(&mut self, offset: usize, len: usize) -> Vec<u8> {
        if self.fill(offset + len, true) {
            self.unread()[offset..offset + len].to_vec()
        } else {
            Vec::new()
        }
    }

    /// Discard `len` bytes of input.
    pub fn skip(&mut self, len: usize) {
        if self.fill(len, true) {
            self.consume(len);
        }
    }

    /// Returns true if the input has been fully consumed.  Unlike the
    /// reading primitives, this does not latch an error at end-of-stream.
    pub fn at_eof(&mut self) -> bool {
        !self.fill(1, false)
    }

    pub fn get_byte(&mut self) -> u8 {
        if self.fill(1, true) {
            let v = self.unread()[0];
            self.consume(1);
            v
        } else {
            0
        }
    }

    pub fn get_be16(&mut self) -> u16 {
        if self.fill(2, true) {
            let v = BigEndian::read_u16(self.unread());
            self.consume(2);
            v
        } else {
            0
        }
    }

    pub fn get_be32(&mut self) -> u32 {
        if self.fill(4, true) {
            let v = BigEndian::read_u32(self.unread());
            self.consume(4);
            v
        } else {
            0
        }
    }

    pub fn get_be64(&mut self) -> u64 {
        if self.fill(8, true) {
            let v = BigEndian::read_u64(self.unread());
            self.consume(8);
            v
        } else {
            0
        }
    }

    /// Fill `out` from the stream.  Returns the number of bytes copied,
    /// which is short only if the stream failed.
    pub fn get_buffer(&mut self, out: &mut [u8]) -> usize {
        if self.fill(out.len(), true) {
            out.copy_from_slice(&self.unread()[..out.len()]);
            self.consume(out.len());
            out.len()
        } else {
            out.fill(0);
            0
        }
    }

    /// Read a string prefixed by a one-byte length.
    pub fn get_counted_string(&mut self) -> Result<String, StreamError> {
        let len = self.get_byte() as usize;
        let mut raw = vec![0u8; len];
        self.get_buffer(&mut raw);
        self.error()?;
        String::from_utf8(raw).map_err(|e| {
            let err = StreamError::Io(format!("invalid counted string: {e}"));
            self.set_error(err.clone());
            err
        })
    }

    // Rate limiting

    /// Limit output to `bytes` per window.  Zero disables the limit.
    pub fn set_rate_limit(&mut self, bytes: u64) {
        self.rate_limit_max = if bytes == 0 { u64::MAX } else { bytes };
    }

    /// The configured per-window byte budget; `u64::MAX` when unlimited.
    pub fn rate_limit_max(&self) -> u64 {
        self.rate_limit_max
    }

    /// Returns true once the output budget for the current window has been
    /// spent, or if the stream has failed.
    pub fn rate_limit_exceeded(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        self.rate_limit_max != u64::MAX
            && self.rate_limit_used >= self.rate_limit_max
    }

    /// Start a new rate-limit window.
    pub fn reset_rate_limit(&mut self) {
        self.rate_limit_used = 0;
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Growable in-memory sink whose contents stay reachable after the
/// [`Stream`] writing into it has been dropped.
#[derive(Clone, Default)]
pub struct MemBuffer(Arc<Mutex<Vec<u8>>>);

impl MemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for MemBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
