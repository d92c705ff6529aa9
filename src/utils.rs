use chrono::{DateTime, FixedOffset, Local, TimeZone};
use md5::{Digest, Md5};
use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Platform line separator, used when writing undecoded attachment lines.
#[cfg(windows)]
pub const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &str = "\n";

const RFC822_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

pub fn get_apop_digest(timestamp: &str, password: &str) -> String {
    let hasher = Md5::new().chain(timestamp).chain(password);
    format!("{:x}", hasher.result())
}

pub fn system_temp_dir() -> PathBuf {
    env::temp_dir()
}

/// Format `date` as used in the Date header, e.g.
/// "Tue, 15 Nov 1994 08:12:31 +0100".
pub fn format_rfc822_date<Tz>(date: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    date.format(RFC822_FORMAT).to_string()
}

pub fn rfc822_now() -> String {
    format_rfc822_date(&Local::now())
}

pub fn parse_rfc822_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_str(value, RFC822_FORMAT))
        .ok()
}

/// Strip one pair of surrounding double quotes. A value that opens a quote
/// without closing it is malformed and yields `None`.
pub fn remove_quotes(value: &str) -> Option<&str> {
    let value = value.trim();
    match value.strip_prefix('"') {
        Some(rest) => rest.find('"').map(|end| &rest[..end]),
        None => Some(value),
    }
}

/// Value of parameter `param` in a structured header value such as
/// `multipart/mixed; boundary="XYZ"`. The name is matched
/// case-insensitively and must start the value or follow ';' or whitespace.
pub fn mime_parameter(value: &str, param: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let key = format!("{}=", param.to_ascii_lowercase());
    let mut from = 0;
    while let Some(pos) = lower[from..].find(&key) {
        let at = from + pos;
        let starts_word = at == 0 || matches!(lower.as_bytes()[at - 1], b';' | b' ' | b'\t');
        if starts_word {
            let rest = value[at + key.len()..].trim_start();
            let found = if rest.starts_with('"') {
                remove_quotes(rest)?
            } else {
                let end = rest.find(|c: char| c == ';' || c.is_whitespace());
                &rest[..end.unwrap_or_else(|| rest.len())]
            };
            let found = found.trim();
            return if found.is_empty() {
                None
            } else {
                Some(found.to_string())
            };
        }
        from = at + key.len();
    }
    None
}

/// Candidate names for `name`: "report.pdf", "report1.pdf", "report2.pdf"...
fn numbered_name(name: &str, times: u32) -> String {
    if times == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(index) => format!("{}{}{}", &name[..index], times, &name[index..]),
        None => format!("{}{}", name, times),
    }
}

/// A path in `dir` for `name` that does not exist yet. Only the final path
/// component of `name` is used.
pub fn unique_filename(dir: &Path, name: &str) -> PathBuf {
    let name = safe_file_name(name);
    (0..)
        .map(|times| dir.join(numbered_name(&name, times)))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(&name))
}

/// Create a new, empty file in `dir` named after `name`, appending a number
/// before the extension until the name is free.
pub fn create_unique_file(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let name = safe_file_name(name);
    for times in 0.. {
        let path = dir.join(numbered_name(&name, times));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free file name left",
    ))
}

fn safe_file_name(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("attachment")
        .to_string()
}
