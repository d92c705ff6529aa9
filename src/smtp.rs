//! SMTP submission.
//!
//! `SMTPConnection` holds the configuration and the message being composed.
//! Each send opens a connection, runs the whole dialog and closes it again.

use crate::attachment::{self, Attachment, ExtensionTable, MimeTypeLookup};
use crate::base64;
use crate::config::{AuthType, SmtpConfig};
use crate::errors::*;
use crate::status::{MailStatusEvent, StatusListener, StatusNotifier};
use crate::tcpreader::{MailReader, SessionReader};
use crate::tcpstream::{Connection, Connector, TcpConnector};
use crate::utils;
use chrono::Utc;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;

const CRLF: &str = "\r\n";

/// Input bytes per encoded attachment line; yields 64 base64 characters.
const ATTACHMENT_CHUNK: usize = 48;

lazy_static! {
    static ref REPLY_REGEX: Regex = Regex::new(r"^(?P<code>\d{3})(?P<sep>[ -]?)").unwrap();
}

/// A mailbox: an optional display name and an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    full_name: Option<String>,
    address: String,
}

impl Address {
    pub fn new(full_name: Option<&str>, address: &str) -> Address {
        Address {
            full_name: full_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from),
            address: address.trim().to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.address.is_empty()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn full_name(&self) -> Option<&str> {
        self.full_name.as_deref()
    }

    /// Header form: `"Jane Doe" <jane@example.com>` or the bare address.
    pub fn full_address(&self) -> String {
        match self.full_name {
            Some(ref name) => format!("{} <{}>", quote_name(name), self.address),
            None => self.address.clone(),
        }
    }

    /// Form used in MAIL FROM: `"Jane Doe" <jane@example.com>` or
    /// `<jane@example.com>`.
    pub fn path_address(&self) -> String {
        match self.full_name {
            Some(_) => self.full_address(),
            None => self.bare_path(),
        }
    }

    pub fn bare_path(&self) -> String {
        format!("<{}>", self.address)
    }

    /// The part after '@', if the address has exactly one.
    pub fn domain(&self) -> Option<&str> {
        let mut split = self.address.split('@');
        match (split.next(), split.next(), split.next()) {
            (Some(_), Some(domain), None) if !domain.is_empty() => Some(domain),
            _ => None,
        }
    }
}

fn quote_name(name: &str) -> String {
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\\\""))
    }
}

/// A message being composed for sending.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    from: Option<Address>,
    sender: Option<Address>,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    reply_to: Vec<Address>,
    subject: String,
    header_fields: Vec<(String, String)>,
    body: String,
    attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn new() -> OutgoingMessage {
        OutgoingMessage::default()
    }

    pub fn set_from(&mut self, full_name: Option<&str>, address: &str) {
        self.from = Some(Address::new(full_name, address));
    }

    /// Address reported in the X-Sender header.
    pub fn set_sender(&mut self, address: &str) {
        let sender = Address::new(None, address);
        self.sender = if sender.is_valid() { Some(sender) } else { None };
    }

    /// Add a To recipient. Returns false, ignoring the entry, if the
    /// address is empty.
    pub fn add_to(&mut self, full_name: Option<&str>, address: &str) -> bool {
        push_valid(&mut self.to, full_name, address)
    }

    pub fn add_cc(&mut self, full_name: Option<&str>, address: &str) -> bool {
        push_valid(&mut self.cc, full_name, address)
    }

    pub fn add_bcc(&mut self, full_name: Option<&str>, address: &str) -> bool {
        push_valid(&mut self.bcc, full_name, address)
    }

    pub fn add_reply_to(&mut self, full_name: Option<&str>, address: &str) -> bool {
        push_valid(&mut self.reply_to, full_name, address)
    }

    /// Add a header field emitted after Subject.
    pub fn add_header_field(&mut self, name: &str, value: &str) {
        self.header_fields
            .push((name.trim().to_string(), value.to_string()));
    }

    pub fn set_subject(&mut self, subject: &str) {
        self.subject = subject.to_string();
    }

    pub fn set_body(&mut self, body: &str) {
        self.body = body.to_string();
    }

    pub fn add_body(&mut self, text: &str) {
        self.body.push_str(text);
    }

    /// Append the lines of a text file to the body.
    pub fn add_body_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::from(ErrorKind::Validation(format!(
                "cannot read body file {}: {}",
                path.display(),
                e
            )))
        })?;
        for line in BufReader::new(file).lines() {
            self.body.push_str(&line?);
            self.body.push_str(CRLF);
        }
        Ok(())
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    /// Attach a file, failing right away if it cannot be read.
    pub fn add_attachment_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let attachment = Attachment::file(path)?;
        self.attachments.push(with_type(attachment, mime_type));
        Ok(())
    }

    pub fn add_attachment_stream<R>(&mut self, stream: R, mime_type: Option<&str>)
    where
        R: std::io::Read + Send + 'static,
    {
        let attachment = Attachment::stream("", stream);
        self.attachments.push(with_type(attachment, mime_type));
    }

    pub fn add_attachment_url(&mut self, url: &str, mime_type: Option<&str>) -> Result<()> {
        let attachment = Attachment::url(url)?;
        self.attachments.push(with_type(attachment, mime_type));
        Ok(())
    }

    pub fn clear_recipients(&mut self) {
        self.clear_to();
        self.clear_cc();
        self.clear_bcc();
    }

    pub fn clear_to(&mut self) {
        self.to.clear();
    }

    pub fn clear_cc(&mut self) {
        self.cc.clear();
    }

    pub fn clear_bcc(&mut self) {
        self.bcc.clear();
    }

    pub fn clear_reply_to(&mut self) {
        self.reply_to.clear();
    }

    pub fn clear_header_fields(&mut self) {
        self.header_fields.clear();
    }

    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    pub fn clear_attachments(&mut self) {
        self.attachments.clear();
    }

    /// Clear everything except the From and X-Sender addresses.
    pub fn reset(&mut self) {
        self.subject.clear();
        self.clear_recipients();
        self.clear_reply_to();
        self.clear_header_fields();
        self.clear_body();
        self.clear_attachments();
    }

    pub fn from(&self) -> Option<&Address> {
        self.from.as_ref()
    }

    pub fn to(&self) -> &[Address] {
        &self.to
    }

    pub fn cc(&self) -> &[Address] {
        &self.cc
    }

    pub fn bcc(&self) -> &[Address] {
        &self.bcc
    }

    pub fn reply_to(&self) -> &[Address] {
        &self.reply_to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Checks done before connecting: a From address, at least one To
    /// recipient and readable attachment files.
    pub fn validate(&self) -> Result<()> {
        match self.from {
            Some(ref from) if from.is_valid() => {}
            _ => bail!(ErrorKind::Validation(
                "no from address specified".to_string()
            )),
        }
        if self.to.is_empty() {
            bail!(ErrorKind::Validation(
                "no to destination specified".to_string()
            ));
        }
        for attachment in &self.attachments {
            attachment.validate()?;
        }
        Ok(())
    }
}

fn push_valid(list: &mut Vec<Address>, full_name: Option<&str>, address: &str) -> bool {
    let entry = Address::new(full_name, address);
    if entry.is_valid() {
        list.push(entry);
        true
    } else {
        debug!("Ignoring empty recipient address");
        false
    }
}

fn with_type(attachment: Attachment, mime_type: Option<&str>) -> Attachment {
    match mime_type {
        Some(mime_type) => attachment.with_mime_type(mime_type),
        None => attachment,
    }
}

/// Everything a send needs besides the message. Cloned into the worker
/// thread of a background send.
#[derive(Clone)]
struct SmtpTransport {
    config: SmtpConfig,
    connector: Arc<dyn Connector>,
    mime_lookup: Arc<dyn MimeTypeLookup>,
    notifier: StatusNotifier,
}

impl SmtpTransport {
    /// Validate and send `message`. The last server reply is stored in
    /// `last_response` whether or not the send succeeded.
    fn deliver(&self, message: &OutgoingMessage, last_response: &mut Option<String>) -> Result<()> {
        message.validate()?;
        trace!("Initiate SMTP Connection");
        let mut dialog = Dialog::open(self)?;
        let result = dialog.converse(message);
        dialog.finish();
        if dialog.last_response.is_some() {
            *last_response = dialog.last_response.take();
        }
        result
    }
}

/// One SMTP conversation over an open connection.
struct Dialog<'a> {
    transport: &'a SmtpTransport,
    stream: Box<dyn Connection>,
    reader: SessionReader,
    greeted: bool,
    in_data: bool,
    last_response: Option<String>,
}

impl<'a> Dialog<'a> {
    fn open(transport: &'a SmtpTransport) -> Result<Dialog<'a>> {
        let config = &transport.config;
        let mut stream = transport.connector.open(&config.host, config.port)?;
        stream.set_timeout(config.timeout())?;
        let reader = MailReader::new(BufReader::new(stream.reader()?));
        trace!("Connection Established");
        Ok(Dialog {
            transport,
            stream,
            reader,
            greeted: false,
            in_data: false,
            last_response: None,
        })
    }

    fn converse(&mut self, message: &OutgoingMessage) -> Result<()> {
        let transport = self.transport;
        let config = &transport.config;
        let from = match message.from {
            Some(ref from) => from,
            None => bail!(ErrorKind::Validation(
                "no from address specified".to_string()
            )),
        };

        self.expect("220")?;
        self.greeted = true;

        let sender_host = config
            .sender_host
            .as_deref()
            .or_else(|| from.domain())
            .unwrap_or("localhost");
        match (config.auth, config.username.as_ref(), config.password.as_ref()) {
            (AuthType::Plain, Some(username), Some(password)) => {
                self.command(&format!("EHLO {}", sender_host), "250")?;
                self.auth_plain(username, password)?;
            }
            (AuthType::Login, Some(username), Some(password)) => {
                self.command(&format!("EHLO {}", sender_host), "250")?;
                self.auth_login(username, password)?;
            }
            _ => self.command(&format!("HELO {}", sender_host), "250")?,
        }

        self.mail_from(from)?;
        for rcpt in message.to.iter().chain(&message.cc).chain(&message.bcc) {
            self.command(&format!("RCPT TO: {}", rcpt.bare_path()), "250")?;
        }

        self.command("DATA", "354")?;
        trace!("Sending message data");
        self.in_data = true;
        {
            let mut out = BufWriter::new(&mut self.stream);
            write_message(&mut out, message, transport)?;
            out.flush()?;
        }
        self.in_data = false;
        self.expect("250")
    }

    /// MAIL FROM with the display name. If the server rejects that with a
    /// well formed reply, retry once with the bare address.
    fn mail_from(&mut self, from: &Address) -> Result<()> {
        let first = self.command(&format!("MAIL FROM: {}", from.path_address()), "250");
        let err = match first {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let retry = from.full_name().is_some()
            && err.category() == ErrorCategory::Protocol
            && self.last_response.as_ref().map_or(false, |r| r.len() >= 4);
        if !retry {
            return Err(err);
        }
        debug!("MAIL FROM rejected, retrying with the bare address");
        self.command(&format!("MAIL FROM: {}", from.bare_path()), "250")
    }

    fn auth_plain(&mut self, username: &str, password: &str) -> Result<()> {
        trace!("Authenticating using AUTH PLAIN");
        let credentials = format!("\0{}\0{}", username, password);
        let encoded = base64::encode_to_string(credentials.as_bytes());
        self.send_masked(&format!("AUTH PLAIN {}", encoded), "AUTH PLAIN ********")?;
        self.expect("235")
    }

    fn auth_login(&mut self, username: &str, password: &str) -> Result<()> {
        trace!("Authenticating using AUTH LOGIN");
        self.command("AUTH LOGIN", "334")?;
        self.send_masked(&base64::encode_to_string(username.as_bytes()), "********")?;
        self.expect("334")?;
        self.send_masked(&base64::encode_to_string(password.as_bytes()), "********")?;
        self.expect("235")
    }

    fn command(&mut self, command: &str, expected: &str) -> Result<()> {
        self.send_masked(command, command)?;
        self.expect(expected)
    }

    fn send_masked(&mut self, command: &str, shown: &str) -> Result<()> {
        info!("C: {}", shown);
        self.transport.notifier.fire_command(shown);
        self.stream.write_string(command)?;
        Ok(())
    }

    /// Read a reply, following "250-" continuation lines, and check its
    /// code.
    fn expect(&mut self, expected: &str) -> Result<()> {
        loop {
            let line = match self.reader.read_line()? {
                Some(line) => line,
                None => bail!(ErrorKind::Transport(
                    "empty response from server".to_string()
                )),
            };
            info!("S: {}", line);
            self.transport.notifier.fire_response(&line);
            self.last_response = Some(line.clone());

            let (code, more) = match REPLY_REGEX.captures(&line) {
                Some(cap) => (cap["code"].to_string(), &cap["sep"] == "-"),
                None => bail!(ErrorKind::Protocol(format!(
                    "malformed response from server: \"{}\"",
                    line
                ))),
            };
            if code != expected {
                bail!(ErrorKind::Protocol(format!(
                    "got response code \"{}\" expected \"{}\": {}",
                    code, expected, line
                )));
            }
            if !more {
                return Ok(());
            }
        }
    }

    /// Best-effort QUIT once the server greeted us, then close. The reply
    /// to the last real command is kept as the last response. A dialog that
    /// failed halfway through the message data is closed without QUIT, since
    /// the server would read it as message content.
    fn finish(&mut self) {
        if self.in_data {
            debug!("Message data incomplete, closing without QUIT");
        } else if self.greeted {
            let saved = self.last_response.clone();
            trace!("Cmd: QUIT");
            if let Err(e) = self.command("QUIT", "221") {
                warn!("QUIT failed: {}", e);
            }
            self.last_response = saved;
        }
        if let Err(e) = self.stream.close() {
            debug!("Error closing connection: {}", e);
        }
    }
}

fn write_message<W: Write>(
    out: &mut W,
    message: &OutgoingMessage,
    transport: &SmtpTransport,
) -> Result<()> {
    let config = &transport.config;
    let mut header = String::new();
    if let Some(ref sender) = message.sender {
        push_field(&mut header, "X-Sender", sender.address());
    }
    if let Some(ref mailer) = config.mailer {
        push_field(&mut header, "X-Mailer", mailer);
    }
    push_field(&mut header, "Date", &utils::rfc822_now());
    push_addresses(&mut header, "To", &message.to);
    push_addresses(&mut header, "CC", &message.cc);
    push_addresses(&mut header, "BCC", &message.bcc);
    if let Some(ref from) = message.from {
        push_field(&mut header, "From", &from.full_address());
    }
    push_addresses(&mut header, "Reply-To", &message.reply_to);
    push_field(&mut header, "Subject", &message.subject);
    for &(ref name, ref value) in &message.header_fields {
        push_field(&mut header, name, value);
    }
    push_field(&mut header, "Mime-Version", "1.0");

    let text_type = format!("text/plain; charset=\"{}\"", config.charset);
    if message.attachments.is_empty() {
        push_field(&mut header, "Content-Type", &text_type);
        header.push_str(CRLF);
        out.write_all(header.as_bytes())?;
        write_text(out, &message.body)?;
    } else {
        let boundary = format!("=====================_{}==_", Utc::now().timestamp_millis());
        push_field(
            &mut header,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        );
        header.push_str(CRLF);
        header.push_str(&format!("--{}{}", boundary, CRLF));
        push_field(&mut header, "Content-Type", &text_type);
        header.push_str(CRLF);
        out.write_all(header.as_bytes())?;
        write_text(out, &message.body)?;

        for attachment in &message.attachments {
            write_attachment(out, attachment, &boundary, transport)?;
        }
        write!(out, "--{}--{}", boundary, CRLF)?;
    }
    write!(out, ".{}", CRLF)?;
    Ok(())
}

fn push_field(header: &mut String, name: &str, value: &str) {
    let value = value.replace(&['\r', '\n'][..], " ");
    header.push_str(name);
    header.push_str(": ");
    header.push_str(&value);
    header.push_str(CRLF);
}

fn push_addresses(header: &mut String, name: &str, addresses: &[Address]) {
    if addresses.is_empty() {
        return;
    }
    let list = addresses
        .iter()
        .map(Address::full_address)
        .collect::<Vec<_>>()
        .join(", ");
    push_field(header, name, &list);
}

/// Write body text with CRLF line endings, doubling a leading '.' so a
/// body line cannot end the DATA section.
fn write_text<W: Write>(out: &mut W, text: &str) -> Result<()> {
    for line in text.lines() {
        if line.starts_with('.') {
            out.write_all(b".")?;
        }
        out.write_all(line.as_bytes())?;
        out.write_all(CRLF.as_bytes())?;
    }
    Ok(())
}

fn write_attachment<W: Write>(
    out: &mut W,
    attachment: &Attachment,
    boundary: &str,
    transport: &SmtpTransport,
) -> Result<()> {
    let name = attachment.resolved_name();
    let mime_type = attachment.resolved_type(transport.mime_lookup.as_ref());
    debug!("Attaching {:?} as {}", name, mime_type);

    write!(out, "--{}{}Content-Type: {}", boundary, CRLF, mime_type)?;
    if let Some(ref name) = name {
        write!(out, "; name=\"{}\"", name)?;
    }
    write!(out, "{}Content-Transfer-Encoding: base64", CRLF)?;
    write!(out, "{}Content-Disposition: attachment", CRLF)?;
    if let Some(ref name) = name {
        write!(out, "; filename=\"{}\"", name)?;
    }
    write!(out, "{}{}", CRLF, CRLF)?;

    let size = attachment.size();
    let mut input = attachment.open()?;
    let mut chunk = [0u8; ATTACHMENT_CHUNK];
    let mut total = 0u64;
    loop {
        let n = attachment::read_full(&mut *input, &mut chunk).map_err(|e| {
            Error::from(ErrorKind::Storage(format!(
                "cannot read attachment {}: {}",
                name.as_deref().unwrap_or("(unnamed)"),
                e
            )))
        })?;
        if n == 0 {
            break;
        }
        out.write_all(&base64::encode(&chunk[..n]))?;
        out.write_all(CRLF.as_bytes())?;
        total += n as u64;
        transport.notifier.fire_progress(n as u64, total, size);
        if n < ATTACHMENT_CHUNK {
            break;
        }
    }
    Ok(())
}

/// An SMTP client holding one message under composition.
///
/// `send` runs the dialog on the calling thread and returns its outcome.
/// `background_send` runs it on a worker thread with a snapshot of the
/// message and reports the outcome only through status events.
pub struct SMTPConnection {
    transport: SmtpTransport,
    message: OutgoingMessage,
    last_response: Option<String>,
}

impl SMTPConnection {
    pub fn new(config: SmtpConfig) -> SMTPConnection {
        SMTPConnection::with_connector(config, Arc::new(TcpConnector))
    }

    pub fn with_connector(config: SmtpConfig, connector: Arc<dyn Connector>) -> SMTPConnection {
        SMTPConnection {
            transport: SmtpTransport {
                config,
                connector,
                mime_lookup: Arc::new(ExtensionTable::new()),
                notifier: StatusNotifier::new(),
            },
            message: OutgoingMessage::new(),
            last_response: None,
        }
    }

    /// Replace the lookup used to type attachments declared without a
    /// MIME type.
    pub fn set_mime_lookup(&mut self, lookup: Arc<dyn MimeTypeLookup>) {
        self.transport.mime_lookup = lookup;
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.transport.config
    }

    pub fn config_mut(&mut self) -> &mut SmtpConfig {
        &mut self.transport.config
    }

    pub fn message(&self) -> &OutgoingMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut OutgoingMessage {
        &mut self.message
    }

    pub fn set_message(&mut self, message: OutgoingMessage) {
        self.message = message;
    }

    /// Start a new message, keeping the From and X-Sender addresses.
    pub fn reset_message(&mut self) {
        self.message.reset();
        self.last_response = None;
    }

    /// The last reply line received from the server.
    pub fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    pub fn status_notifier(&self) -> StatusNotifier {
        self.transport.notifier.clone()
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> bool {
        self.transport.notifier.add_listener(listener)
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn StatusListener>) -> bool {
        self.transport.notifier.remove_listener(listener)
    }

    pub fn send(&mut self) -> Result<()> {
        trace!("Cmd: SEND");
        self.transport.deliver(&self.message, &mut self.last_response)
    }

    /// Send a snapshot of the current message on a worker thread. The
    /// outcome is reported as a `Done` or `Exception` event.
    pub fn background_send(&self) {
        let transport = self.transport.clone();
        let message = self.message.clone();
        let spawned = thread::Builder::new()
            .name("smtp-send".to_string())
            .spawn(move || {
                transport
                    .notifier
                    .fire(MailStatusEvent::Start("Sending message".to_string()));
                let mut last_response = None;
                match transport.deliver(&message, &mut last_response) {
                    Ok(()) => transport
                        .notifier
                        .fire(MailStatusEvent::Done("Done".to_string())),
                    Err(e) => {
                        warn!("Background send failed: {}", e);
                        transport
                            .notifier
                            .fire(MailStatusEvent::Exception(e.to_string()));
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Could not start background send: {}", e);
            self.transport
                .notifier
                .fire(MailStatusEvent::Exception(e.to_string()));
        }
    }
}
