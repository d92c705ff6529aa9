//! Line and header reader for POP3 message streams.
//!
//! `MailReader` wraps any buffered byte source and keeps a running count of
//! the bytes it has consumed, which drives transfer progress reporting. A line
//! consisting of a lone "." marks the end of a multi-line POP3 response and is
//! reported as the end of the stream.

use crate::header::Header;
use std::io::{self, BufRead, BufReader, Read};

/// Reader used by a connected session.
pub type SessionReader = MailReader<BufReader<Box<dyn Read + Send>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Name,
    Value,
    EndOfLine { saw_lf: bool },
    Fold,
    EndOfHeaders,
    Body,
}

#[derive(Debug)]
pub struct MailReader<R> {
    inner: R,
    bytes_read: u64,
    terminated: bool,
    eof: bool,
}

impl<R: BufRead> MailReader<R> {
    pub fn new(inner: R) -> MailReader<R> {
        MailReader {
            inner,
            bytes_read: 0,
            terminated: false,
            eof: false,
        }
    }

    /// Total number of bytes consumed from the underlying stream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether a read ran into the end of the stream rather than a "."
    /// terminator line.
    pub fn at_end_of_stream(&self) -> bool {
        self.eof
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one line as text, replacing invalid UTF-8.
    ///
    /// Returns `None` at the end of the stream or on the "." terminator line.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .read_raw_line()?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }

    /// Read one line without its terminator. CRLF and a bare LF end the line;
    /// a CR that is not part of a CRLF pair is kept as data. A leading ".."
    /// is un-stuffed to ".".
    pub fn read_raw_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.terminated {
            self.terminated = false;
            return Ok(None);
        }

        let mut line = Vec::with_capacity(80);
        let mut bytes = 0u64;
        let mut last_was_cr = false;
        while let Some(c) = self.next_byte()? {
            bytes += 1;
            match c {
                b'\n' => break,
                b'\r' => {
                    if last_was_cr {
                        line.push(b'\r');
                    }
                    last_was_cr = true;
                }
                _ => {
                    if last_was_cr {
                        line.push(b'\r');
                        last_was_cr = false;
                    }
                    line.push(c);
                }
            }
        }

        if bytes == 0 {
            self.eof = true;
            return Ok(None);
        }
        self.bytes_read += bytes;

        if trim_ascii(&line) == b"." {
            return Ok(None);
        }
        if line.starts_with(b"..") {
            line.remove(0);
        }
        Ok(Some(line))
    }

    /// Consume lines up to and including the end of the stream.
    pub fn skip_to_end(&mut self) -> io::Result<()> {
        while self.read_raw_line()?.is_some() {}
        Ok(())
    }

    /// Read a header block up to the blank line separating it from the body.
    ///
    /// Folded continuation lines are joined with a single space. Returns
    /// `None` when no header field was found.
    pub fn read_header(&mut self) -> io::Result<Option<Header>> {
        if self.terminated {
            return Ok(None);
        }

        let mut header = Header::new();
        let mut name = String::new();
        let mut name_buf: Vec<u8> = Vec::new();
        let mut value_buf: Vec<u8> = Vec::new();
        let mut state = HeaderState::Name;
        let mut bytes = 0u64;

        while state != HeaderState::Body {
            if state == HeaderState::EndOfHeaders {
                if self.peek_byte()? == Some(b'\n') {
                    self.inner.consume(1);
                    bytes += 1;
                }
                state = HeaderState::Body;
                continue;
            }

            let c = match self.next_byte()? {
                Some(c) => c,
                None => break,
            };
            bytes += 1;

            state = match state {
                HeaderState::Name => match c {
                    b':' => {
                        name = String::from_utf8_lossy(&name_buf).trim().to_lowercase();
                        name_buf.clear();
                        HeaderState::Value
                    }
                    b'\r' if name_buf.is_empty() => HeaderState::EndOfHeaders,
                    b'\n' if name_buf.is_empty() => HeaderState::Body,
                    b'.' if name_buf.is_empty() => {
                        if self.at_terminator(&mut bytes)? {
                            HeaderState::Body
                        } else {
                            name_buf.push(c);
                            HeaderState::Name
                        }
                    }
                    _ => {
                        name_buf.push(c);
                        HeaderState::Name
                    }
                },
                HeaderState::Value => match c {
                    b'\r' => HeaderState::EndOfLine { saw_lf: false },
                    b'\n' => HeaderState::EndOfLine { saw_lf: true },
                    _ => {
                        value_buf.push(c);
                        HeaderState::Value
                    }
                },
                HeaderState::EndOfLine { saw_lf } => match c {
                    b'\r' => HeaderState::EndOfHeaders,
                    b'\n' if saw_lf => HeaderState::Body,
                    b'\n' => HeaderState::EndOfLine { saw_lf: true },
                    b' ' | b'\t' => HeaderState::Fold,
                    _ => {
                        commit(&mut header, &name, &mut value_buf);
                        if c == b'.' && self.at_terminator(&mut bytes)? {
                            HeaderState::Body
                        } else {
                            name_buf.push(c);
                            HeaderState::Name
                        }
                    }
                },
                HeaderState::Fold => match c {
                    b'\r' => HeaderState::EndOfLine { saw_lf: false },
                    b'\n' => HeaderState::EndOfLine { saw_lf: true },
                    b' ' | b'\t' => HeaderState::Fold,
                    _ => {
                        if !value_buf.is_empty() {
                            value_buf.push(b' ');
                        }
                        value_buf.push(c);
                        HeaderState::Value
                    }
                },
                HeaderState::EndOfHeaders | HeaderState::Body => HeaderState::Body,
            };
        }

        self.bytes_read += bytes;
        commit(&mut header, &name, &mut value_buf);

        if header.is_empty() {
            Ok(None)
        } else {
            Ok(Some(header))
        }
    }

    /// Called after a '.' at the start of a line inside a header block. If
    /// the rest of the line is empty the "." terminator has been reached: the
    /// line ending is consumed and the next `read_line` reports end of stream.
    fn at_terminator(&mut self, bytes: &mut u64) -> io::Result<bool> {
        match self.peek_byte()? {
            Some(b'\r') => {
                self.inner.consume(1);
                *bytes += 1;
                if self.peek_byte()? == Some(b'\n') {
                    self.inner.consume(1);
                    *bytes += 1;
                }
            }
            Some(b'\n') => {
                self.inner.consume(1);
                *bytes += 1;
            }
            None => {}
            Some(_) => return Ok(false),
        }
        self.terminated = true;
        Ok(true)
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let c = match self.peek_byte()? {
            Some(c) => c,
            None => return Ok(None),
        };
        self.inner.consume(1);
        Ok(Some(c))
    }

    fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        loop {
            match self.inner.fill_buf() {
                Ok(buf) => return Ok(buf.first().copied()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn commit(header: &mut Header, name: &str, value_buf: &mut Vec<u8>) {
    if !value_buf.is_empty() {
        header.insert(name, &String::from_utf8_lossy(value_buf));
        value_buf.clear();
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
