//! Retrieved messages and the assembler that builds them from a RETR stream.

use crate::errors::*;
use crate::header::Header;
use crate::multipart;
use crate::status::StatusNotifier;
use crate::tcpreader::MailReader;
use crate::utils;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// One body part of a retrieved message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    /// Inline text, lines joined with '\n'.
    Text {
        content: String,
        content_type: String,
        charset: Option<String>,
    },
    /// An attachment that was decoded into `filename`.
    File {
        name: Option<String>,
        filename: PathBuf,
        content_type: String,
        encoding: Option<String>,
    },
}

impl MessagePart {
    /// An empty text part. `content_type` is the raw header value, its
    /// charset parameter is extracted.
    pub(crate) fn new_text(content_type: &str) -> MessagePart {
        MessagePart::Text {
            content: String::new(),
            content_type: media_type(content_type),
            charset: utils::mime_parameter(content_type, "charset"),
        }
    }

    pub(crate) fn new_file(
        name: Option<String>,
        filename: PathBuf,
        content_type: &str,
        encoding: Option<&str>,
    ) -> MessagePart {
        MessagePart::File {
            name,
            filename,
            content_type: media_type(content_type),
            encoding: encoding.map(|e| e.trim().to_string()),
        }
    }

    /// Append a line to a text part. Ignored for file parts. Every line is
    /// kept, blank ones included; `finish_text` drops the final separator.
    pub(crate) fn append(&mut self, line: &str) {
        if let MessagePart::Text {
            ref mut content, ..
        } = *self
        {
            content.push_str(line);
            content.push('\n');
        }
    }

    pub(crate) fn finish_text(&mut self) {
        if let MessagePart::Text {
            ref mut content, ..
        } = *self
        {
            if content.ends_with('\n') {
                content.pop();
            }
        }
    }

    pub fn is_file(&self) -> bool {
        match *self {
            MessagePart::File { .. } => true,
            MessagePart::Text { .. } => false,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match *self {
            MessagePart::Text { ref content, .. } => Some(content),
            MessagePart::File { .. } => None,
        }
    }

    /// Media type without parameters, e.g. "text/html".
    pub fn content_type(&self) -> &str {
        match *self {
            MessagePart::Text {
                ref content_type, ..
            }
            | MessagePart::File {
                ref content_type, ..
            } => content_type,
        }
    }

    pub fn charset(&self) -> Option<&str> {
        match *self {
            MessagePart::Text { ref charset, .. } => charset.as_deref(),
            MessagePart::File { .. } => None,
        }
    }

    /// Name the sender gave the attachment.
    pub fn name(&self) -> Option<&str> {
        match *self {
            MessagePart::File { ref name, .. } => name.as_deref(),
            MessagePart::Text { .. } => None,
        }
    }

    /// Where the attachment was saved.
    pub fn filename(&self) -> Option<&Path> {
        match *self {
            MessagePart::File { ref filename, .. } => Some(filename),
            MessagePart::Text { .. } => None,
        }
    }

    pub fn encoding(&self) -> Option<&str> {
        match *self {
            MessagePart::File { ref encoding, .. } => encoding.as_deref(),
            MessagePart::Text { .. } => None,
        }
    }
}

fn media_type(content_type: &str) -> String {
    let media = content_type.split(';').next().unwrap_or("").trim();
    if media.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        media.to_string()
    }
}

/// Transfer counters of a message being read. Safe to poll from another
/// thread while the message is being retrieved.
#[derive(Debug, Default)]
pub struct MessageProgress {
    total: AtomicU64,
    size: Option<u64>,
}

impl MessageProgress {
    pub fn new(size: Option<u64>) -> MessageProgress {
        MessageProgress {
            total: AtomicU64::new(0),
            size,
        }
    }

    /// Bytes read so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Size announced by LIST, if known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    fn add(&self, bytes: u64) -> u64 {
        self.total.fetch_add(bytes, Ordering::SeqCst) + bytes
    }
}

/// Line and header reads over a message body that update a
/// `MessageProgress` and fire a progress event for every chunk read.
///
/// Once the end of the body has been reported every further read returns
/// `None`, so the reader never runs into the next server response.
pub struct BodyReader<'a, R> {
    reader: &'a mut MailReader<R>,
    progress: &'a MessageProgress,
    notifier: Option<&'a StatusNotifier>,
    mark: u64,
    finished: bool,
}

impl<'a, R: BufRead> BodyReader<'a, R> {
    pub fn new(
        reader: &'a mut MailReader<R>,
        progress: &'a MessageProgress,
        notifier: Option<&'a StatusNotifier>,
    ) -> BodyReader<'a, R> {
        let mark = reader.bytes_read();
        BodyReader {
            reader,
            progress,
            notifier,
            mark,
            finished: false,
        }
    }

    pub fn read_raw_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        let line = self.reader.read_raw_line()?;
        self.report();
        self.finished = line.is_none();
        Ok(line)
    }

    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .read_raw_line()?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }

    pub fn read_header(&mut self) -> io::Result<Option<Header>> {
        if self.finished {
            return Ok(None);
        }
        let header = self.reader.read_header()?;
        self.report();
        Ok(header)
    }

    pub fn skip_to_end(&mut self) -> io::Result<()> {
        while self.read_raw_line()?.is_some() {}
        Ok(())
    }

    /// Whether the end of the body has been reached.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn report(&mut self) {
        let now = self.reader.bytes_read();
        let bytes = now.saturating_sub(self.mark);
        if bytes == 0 {
            return;
        }
        self.mark = now;
        let total = self.progress.add(bytes);
        if let Some(notifier) = self.notifier {
            notifier.fire_progress(bytes, total, self.progress.size());
        }
    }
}

/// A message read from a POP3 server.
#[derive(Debug)]
pub struct MailMessage {
    header: Header,
    parts: Vec<MessagePart>,
    progress: Arc<MessageProgress>,
}

impl MailMessage {
    /// Read a complete message from `reader`. Attachments are decoded into
    /// files in `attachment_dir`.
    pub fn read<R: BufRead>(
        reader: &mut MailReader<R>,
        attachment_dir: &Path,
        message_size: Option<u64>,
        notifier: Option<&StatusNotifier>,
    ) -> Result<MailMessage> {
        let progress = Arc::new(MessageProgress::new(message_size));
        MailMessage::read_with_progress(reader, attachment_dir, progress, notifier)
    }

    /// Like `read`, with counters the caller may poll from another thread.
    ///
    /// If the message cannot be processed for a reason other than a
    /// transport failure, the rest of it is still read and discarded, so the
    /// stream stays positioned after the message.
    pub fn read_with_progress<R: BufRead>(
        reader: &mut MailReader<R>,
        attachment_dir: &Path,
        progress: Arc<MessageProgress>,
        notifier: Option<&StatusNotifier>,
    ) -> Result<MailMessage> {
        let (header, parts) = {
            let mut body = BodyReader::new(reader, &progress, notifier);
            let parsed = read_parts(&mut body, attachment_dir);
            if let Err(ref e) = parsed {
                if e.category() != ErrorCategory::Transport && !body.is_finished() {
                    debug!("Discarding the rest of the message: {}", e);
                    body.skip_to_end()?;
                }
            }
            parsed?
        };
        trace!(
            "Read message: {} header fields, {} parts, {} bytes",
            header.len(),
            parts.len(),
            progress.total()
        );
        Ok(MailMessage {
            header,
            parts,
            progress,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.header.get(name)
    }

    pub fn headers(&self) -> crate::header::Iter<'_> {
        self.header.iter()
    }

    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<MessagePart> {
        self.parts
    }

    pub fn progress(&self) -> Arc<MessageProgress> {
        self.progress.clone()
    }

    /// Bytes read for this message.
    pub fn message_total(&self) -> u64 {
        self.progress.total()
    }

    pub fn message_size(&self) -> Option<u64> {
        self.progress.size()
    }

    /// Write the header as "name: value" lines.
    pub fn dump_header<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (name, value) in &self.header {
            writeln!(out, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

fn read_parts<R: BufRead>(
    body: &mut BodyReader<'_, R>,
    attachment_dir: &Path,
) -> Result<(Header, Vec<MessagePart>)> {
    let header = body.read_header()?.unwrap_or_default();
    let parts = assemble(body, &header, attachment_dir)?;
    Ok((header, parts))
}

fn assemble<R: BufRead>(
    body: &mut BodyReader<'_, R>,
    header: &Header,
    attachment_dir: &Path,
) -> Result<Vec<MessagePart>> {
    let content_type = header
        .get("content-type")
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    if content_type.to_lowercase().contains("multipart") {
        debug!("Multipart message: {}", content_type);
        return multipart::parse_multipart(body, &content_type, attachment_dir);
    }

    let is_attachment = header
        .get("content-disposition")
        .map_or(false, |d| d.to_lowercase().contains("attachment"));
    if is_attachment {
        debug!("Single attachment message");
        return multipart::parse_single_attachment(body, header, attachment_dir);
    }

    let mut part = MessagePart::new_text(&content_type);
    while let Some(line) = body.read_line()? {
        part.append(&line);
    }
    part.finish_text();
    Ok(vec![part])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MailStatusEvent;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn read(data: &str, notifier: Option<&StatusNotifier>) -> MailMessage {
        let mut reader = MailReader::new(Cursor::new(data.as_bytes().to_vec()));
        MailMessage::read(&mut reader, &utils::system_temp_dir(), Some(data.len() as u64), notifier)
            .unwrap()
    }

    #[test]
    fn plain_text_message() {
        let message = read(
            "From: jane@example.com\r\nSubject: Hi\r\nContent-Type: text/plain; charset=\"utf-8\"\r\n\r\nline one\r\n..dotted\r\n\r\nlast\r\n.\r\n",
            None,
        );
        assert_eq!(message.header_value("SUBJECT"), Some("Hi"));
        assert_eq!(message.parts().len(), 1);
        let part = &message.parts()[0];
        assert_eq!(part.text(), Some("line one\n.dotted\n\nlast"));
        assert_eq!(part.content_type(), "text/plain");
        assert_eq!(part.charset(), Some("utf-8"));
        assert!(!part.is_file());
    }

    #[test]
    fn leading_blank_lines_are_kept() {
        let message = read("Subject: x\r\n\r\n\r\n\r\nHello\r\n.\r\n", None);
        assert_eq!(message.parts()[0].text(), Some("\n\nHello"));
    }

    #[test]
    fn storage_failure_consumes_the_rest_of_the_message() {
        let data = concat!(
            "Subject: x\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"a.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0=\r\n",
            ".\r\n",
            "+OK next response\r\n",
        );
        let mut reader = MailReader::new(Cursor::new(data.as_bytes().to_vec()));
        let err = MailMessage::read(
            &mut reader,
            Path::new("/nonexistent/mailclient/attachments"),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("+OK next response"));
    }

    #[test]
    fn missing_content_type_defaults_to_text_plain() {
        let message = read("Subject: x\r\n\r\nbody\r\n.\r\n", None);
        assert_eq!(message.parts()[0].content_type(), "text/plain");
        assert_eq!(message.parts()[0].charset(), None);
    }

    #[test]
    fn progress_covers_the_whole_message() {
        let data = "Subject: x\r\n\r\none\r\ntwo\r\n.\r\n";
        let events = Arc::new(Mutex::new(Vec::new()));
        let notifier = StatusNotifier::new();
        let sink = events.clone();
        notifier.add_listener(Arc::new(move |e: &MailStatusEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        let message = read(data, Some(&notifier));
        assert_eq!(message.message_total(), data.len() as u64);
        assert_eq!(message.message_size(), Some(data.len() as u64));

        let events = events.lock().unwrap();
        let mut sum = 0;
        for event in events.iter() {
            match *event {
                MailStatusEvent::Progress {
                    bytes,
                    total,
                    message_size,
                } => {
                    sum += bytes;
                    assert_eq!(total, sum);
                    assert_eq!(message_size, Some(data.len() as u64));
                }
                ref other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(sum, data.len() as u64);
    }

    #[test]
    fn dump_header_lists_fields() {
        let message = read("Subject: x\r\nTo: bob@example.com\r\n\r\n.\r\n", None);
        let mut out = Vec::new();
        message.dump_header(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "subject: x\nto: bob@example.com\n");
        assert_eq!(message.parts()[0].text(), Some(""));
    }
}
