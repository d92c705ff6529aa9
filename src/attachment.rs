//! Outbound attachments and MIME type resolution.

use crate::errors::*;
use reqwest::Url;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

lazy_static! {
    static ref DEFAULT_TYPES: HashMap<&'static str, &'static str> = [
        ("txt", "text/plain"),
        ("text", "text/plain"),
        ("log", "text/plain"),
        ("csv", "text/csv"),
        ("htm", "text/html"),
        ("html", "text/html"),
        ("css", "text/css"),
        ("xml", "text/xml"),
        ("rtf", "application/rtf"),
        ("js", "application/javascript"),
        ("json", "application/json"),
        ("pdf", "application/pdf"),
        ("ps", "application/postscript"),
        ("zip", "application/zip"),
        ("gz", "application/gzip"),
        ("tar", "application/x-tar"),
        ("doc", "application/msword"),
        ("xls", "application/vnd.ms-excel"),
        ("ppt", "application/vnd.ms-powerpoint"),
        ("gif", "image/gif"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("png", "image/png"),
        ("bmp", "image/bmp"),
        ("tif", "image/tiff"),
        ("tiff", "image/tiff"),
        ("svg", "image/svg+xml"),
        ("wav", "audio/x-wav"),
        ("mp3", "audio/mpeg"),
        ("mpg", "video/mpeg"),
        ("mpeg", "video/mpeg"),
        ("mov", "video/quicktime"),
        ("avi", "video/x-msvideo"),
        ("eml", "message/rfc822"),
    ]
    .iter()
    .cloned()
    .collect();
}

/// Resolves the MIME type of an outbound attachment from its name.
pub trait MimeTypeLookup: Send + Sync {
    fn content_type_for_filename(&self, filename: &str) -> Option<String>;
}

/// Extension based lookup: a built-in table of common types, optionally
/// overridden by `ext=type` mappings.
#[derive(Debug, Clone, Default)]
pub struct ExtensionTable {
    overrides: HashMap<String, String>,
}

impl ExtensionTable {
    pub fn new() -> ExtensionTable {
        ExtensionTable::default()
    }

    /// Load overrides in properties format, one `ext=type` per line. Lines
    /// starting with '#' or '!' are comments.
    pub fn with_overrides(map: &str) -> ExtensionTable {
        let mut table = ExtensionTable::new();
        for line in map.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line.find(|c| c == '=' || c == ':');
            if let Some(index) = split {
                let ext = line[..index].trim();
                let mime_type = line[index + 1..].trim();
                if !ext.is_empty() && !mime_type.is_empty() {
                    table.insert(ext, mime_type);
                }
            }
        }
        table
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ExtensionTable> {
        let map = fs::read_to_string(path)?;
        Ok(ExtensionTable::with_overrides(&map))
    }

    pub fn insert(&mut self, extension: &str, mime_type: &str) {
        self.overrides
            .insert(extension.to_ascii_lowercase(), mime_type.to_string());
    }
}

impl MimeTypeLookup for ExtensionTable {
    fn content_type_for_filename(&self, filename: &str) -> Option<String> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(filename);
        let ext = match name.rfind('.') {
            Some(index) => &name[index + 1..],
            None => name,
        };
        let ext = ext.to_ascii_lowercase();
        self.overrides
            .get(&ext)
            .cloned()
            .or_else(|| DEFAULT_TYPES.get(ext.as_str()).map(|t| t.to_string()))
    }
}

/// A caller supplied stream, consumed by the first send that reads it.
#[derive(Clone)]
pub struct SharedStream(Arc<Mutex<Option<Box<dyn Read + Send>>>>);

impl SharedStream {
    fn new(stream: Box<dyn Read + Send>) -> SharedStream {
        SharedStream(Arc::new(Mutex::new(Some(stream))))
    }

    fn take(&self) -> Option<Box<dyn Read + Send>> {
        match self.0.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn is_consumed(&self) -> bool {
        match self.0.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedStream")
    }
}

#[derive(Debug, Clone)]
pub enum AttachmentSource {
    File(PathBuf),
    Stream(SharedStream),
    Text(String),
    Url(Url),
}

#[derive(Debug, Clone)]
pub struct Attachment {
    name: Option<String>,
    mime_type: Option<String>,
    source: AttachmentSource,
}

impl Attachment {
    /// A file on disk. Fails if the file cannot be opened for reading.
    pub fn file<P: AsRef<Path>>(path: P) -> Result<Attachment> {
        let path = path.as_ref();
        check_readable(path)?;
        Ok(Attachment::from_source(AttachmentSource::File(path.to_path_buf())))
    }

    pub fn stream<R: Read + Send + 'static>(name: &str, stream: R) -> Attachment {
        Attachment::from_source(AttachmentSource::Stream(SharedStream::new(Box::new(stream))))
            .with_name(name)
    }

    pub fn text(name: &str, text: &str) -> Attachment {
        Attachment::from_source(AttachmentSource::Text(text.to_string())).with_name(name)
    }

    /// A document fetched over HTTP when the message is sent.
    pub fn url(url: &str) -> Result<Attachment> {
        let url = Url::parse(url)
            .map_err(|e| ErrorKind::Validation(format!("invalid attachment URL {}: {}", url, e)))?;
        Ok(Attachment::from_source(AttachmentSource::Url(url)))
    }

    fn from_source(source: AttachmentSource) -> Attachment {
        Attachment {
            name: None,
            mime_type: None,
            source,
        }
    }

    pub fn with_name(mut self, name: &str) -> Attachment {
        let name = name.trim();
        self.name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        self
    }

    pub fn with_mime_type(mut self, mime_type: &str) -> Attachment {
        let mime_type = mime_type.trim();
        self.mime_type = if mime_type.is_empty() {
            None
        } else {
            Some(mime_type.to_string())
        };
        self
    }

    pub fn source(&self) -> &AttachmentSource {
        &self.source
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Declared name, else the file name or the last segment of the URL path.
    pub fn resolved_name(&self) -> Option<String> {
        if let Some(ref name) = self.name {
            return Some(name.clone());
        }
        match self.source {
            AttachmentSource::File(ref path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            AttachmentSource::Url(ref url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(String::from),
            AttachmentSource::Stream(_) | AttachmentSource::Text(_) => None,
        }
    }

    pub fn resolved_type(&self, lookup: &dyn MimeTypeLookup) -> String {
        if let Some(ref mime_type) = self.mime_type {
            return mime_type.clone();
        }
        self.resolved_name()
            .and_then(|name| lookup.content_type_for_filename(&name))
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
    }

    /// Content length when it is known before reading.
    pub fn size(&self) -> Option<u64> {
        match self.source {
            AttachmentSource::File(ref path) => fs::metadata(path).ok().map(|m| m.len()),
            AttachmentSource::Text(ref text) => Some(text.len() as u64),
            AttachmentSource::Stream(_) | AttachmentSource::Url(_) => None,
        }
    }

    /// Check that a file attachment is still readable and that a stream
    /// attachment has not been consumed by an earlier send.
    pub fn validate(&self) -> Result<()> {
        match self.source {
            AttachmentSource::File(ref path) => check_readable(path),
            AttachmentSource::Stream(ref stream) if stream.is_consumed() => {
                bail!(ErrorKind::Validation(format!(
                    "attachment stream {} was already consumed",
                    self.name.as_deref().unwrap_or("(unnamed)")
                )))
            }
            _ => Ok(()),
        }
    }

    /// Open the attachment content for encoding.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self.source {
            AttachmentSource::File(ref path) => Ok(Box::new(File::open(path)?)),
            AttachmentSource::Stream(ref stream) => stream.take().ok_or_else(|| {
                ErrorKind::Validation("attachment stream was already consumed".to_string()).into()
            }),
            AttachmentSource::Text(ref text) => Ok(Box::new(Cursor::new(text.clone().into_bytes()))),
            AttachmentSource::Url(ref url) => {
                debug!("Fetching attachment {}", url);
                let response = reqwest::blocking::get(url.clone())?.error_for_status()?;
                Ok(Box::new(response))
            }
        }
    }
}

fn check_readable(path: &Path) -> Result<()> {
    match File::open(path) {
        Ok(ref file) if file.metadata().map(|m| m.is_file()).unwrap_or(false) => Ok(()),
        Ok(_) => bail!(ErrorKind::Validation(format!(
            "attachment {} is not a file",
            path.display()
        ))),
        Err(e) => bail!(ErrorKind::Validation(format!(
            "cannot read attachment {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Fill `buf` as far as the reader allows. Returns fewer bytes than
/// `buf.len()` only at the end of the stream.
pub(crate) fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
