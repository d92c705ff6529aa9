//! Multipart body parsing and attachment extraction.
//!
//! Parts are read line by line. Attachments are streamed into files in the
//! attachment directory as they arrive, decoding base64 on the fly, so a
//! message is never held in memory as a whole.

use crate::base64;
use crate::errors::*;
use crate::header::Header;
use crate::message::{BodyReader, MessagePart, DEFAULT_CONTENT_TYPE};
use crate::utils;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Output of an attachment part. Base64 input is decoded in groups of four
/// symbols; a tail that does not fill a group is carried to the next line.
///
/// Write failures are reported as `Storage` errors: they concern the local
/// file, not the connection the message is read from.
struct AttachmentSink {
    path: PathBuf,
    out: BufWriter<File>,
    base64: bool,
    carry: Vec<u8>,
}

impl AttachmentSink {
    fn new(path: PathBuf, file: File, base64: bool) -> AttachmentSink {
        AttachmentSink {
            path,
            out: BufWriter::new(file),
            base64,
            carry: Vec::new(),
        }
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.write_decoded(line)
            .map_err(|e| storage_error(&self.path, e))
    }

    fn finish(self) -> Result<()> {
        let path = self.path.clone();
        self.flush_all().map_err(|e| storage_error(&path, e))
    }

    fn write_decoded(&mut self, line: &[u8]) -> io::Result<()> {
        if !self.base64 {
            self.out.write_all(line)?;
            return self.out.write_all(utils::LINE_SEPARATOR.as_bytes());
        }

        self.carry
            .extend(line.iter().filter(|c| !c.is_ascii_whitespace()));
        let aligned = self.carry.len() - self.carry.len() % 4;
        if aligned > 0 {
            let decoded = base64::decode(&self.carry[..aligned]);
            self.out.write_all(&decoded)?;
            self.carry = self.carry.split_off(aligned);
        }
        Ok(())
    }

    fn flush_all(mut self) -> io::Result<()> {
        if !self.carry.is_empty() {
            let decoded = base64::decode(&self.carry);
            self.out.write_all(&decoded)?;
        }
        self.out.flush()
    }
}

fn storage_error(path: &Path, err: io::Error) -> Error {
    ErrorKind::Storage(format!("cannot save attachment {}: {}", path.display(), err)).into()
}

enum PendingPart {
    Text(MessagePart),
    File(MessagePart, AttachmentSink),
}

/// Parser state carried through the line loop: the part being read, if any,
/// and the parts completed so far.
#[derive(Default)]
struct PartsState {
    current: Option<PendingPart>,
    parts: Vec<MessagePart>,
}

impl PartsState {
    fn begin(&mut self, header: &Header, attachment_dir: &Path) -> Result<()> {
        self.finish_part()?;
        self.current = Some(open_part(header, attachment_dir)?);
        Ok(())
    }

    /// Lines outside of any part (the preamble) are dropped.
    fn accept_line(&mut self, line: &[u8]) -> Result<()> {
        match self.current {
            Some(PendingPart::Text(ref mut part)) => part.append(&String::from_utf8_lossy(line)),
            Some(PendingPart::File(_, ref mut sink)) => sink.write_line(line)?,
            None => {}
        }
        Ok(())
    }

    fn finish_part(&mut self) -> Result<()> {
        match self.current.take() {
            Some(PendingPart::Text(mut part)) => {
                part.finish_text();
                self.parts.push(part);
            }
            Some(PendingPart::File(part, sink)) => {
                sink.finish()?;
                self.parts.push(part);
            }
            None => {}
        }
        Ok(())
    }
}

/// Decide from a part header whether the part is inline text or a file. A
/// part is a file iff its content-disposition names a filename; the file is
/// created right away under a name that does not collide with existing ones.
fn open_part(header: &Header, attachment_dir: &Path) -> Result<PendingPart> {
    let content_type = header.get("content-type").unwrap_or(DEFAULT_CONTENT_TYPE);
    let filename = header
        .get("content-disposition")
        .and_then(|d| utils::mime_parameter(d, "filename"));

    let filename = match filename {
        Some(filename) => filename,
        None => return Ok(PendingPart::Text(MessagePart::new_text(content_type))),
    };

    let encoding = header.get("content-transfer-encoding");
    let is_base64 = encoding.map_or(false, |e| e.trim().eq_ignore_ascii_case("base64"));
    let (path, file) = utils::create_unique_file(attachment_dir, &filename)
        .map_err(|e| storage_error(&attachment_dir.join(&filename), e))?;
    debug!("Saving attachment \"{}\" to {}", filename, path.display());

    let name = utils::mime_parameter(content_type, "name").or(Some(filename));
    let part = MessagePart::new_file(name, path.clone(), content_type, encoding);
    Ok(PendingPart::File(part, AttachmentSink::new(path, file, is_base64)))
}

/// Parse a multipart body. `content_type` is the message's Content-Type
/// value and must carry a boundary parameter.
///
/// Reading stops at the end of the body; anything after the closing
/// boundary is discarded. A final part that is not closed by a boundary is
/// kept.
pub fn parse_multipart<R: BufRead>(
    body: &mut BodyReader<'_, R>,
    content_type: &str,
    attachment_dir: &Path,
) -> Result<Vec<MessagePart>> {
    let boundary = match utils::mime_parameter(content_type, "boundary") {
        Some(boundary) => boundary,
        None => {
            body.skip_to_end()?;
            bail!(ErrorKind::Protocol(
                "no boundary found in multipart message".to_string()
            ));
        }
    };
    trace!("Multipart boundary: {}", boundary);
    let marker = format!("--{}", boundary).into_bytes();

    let mut state = PartsState::default();
    let mut closed = false;
    while let Some(line) = body.read_raw_line()? {
        if closed {
            continue;
        }
        if !line.starts_with(&marker) {
            state.accept_line(&line)?;
            continue;
        }
        if line[marker.len()..].starts_with(b"--") {
            state.finish_part()?;
            closed = true;
            continue;
        }
        let header = body.read_header()?.unwrap_or_default();
        state.begin(&header, attachment_dir)?;
    }
    state.finish_part()?;

    if state.parts.is_empty() {
        bail!(ErrorKind::Protocol(format!(
            "no parts found for boundary \"{}\"",
            boundary
        )));
    }
    Ok(state.parts)
}

/// Parse a body that is a single attachment described by the message
/// header itself.
pub fn parse_single_attachment<R: BufRead>(
    body: &mut BodyReader<'_, R>,
    header: &Header,
    attachment_dir: &Path,
) -> Result<Vec<MessagePart>> {
    let mut state = PartsState::default();
    state.begin(header, attachment_dir)?;
    while let Some(line) = body.read_raw_line()? {
        state.accept_line(&line)?;
    }
    state.finish_part()?;
    Ok(state.parts)
}
