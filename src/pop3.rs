use crate::config::Pop3Config;
use crate::errors::*;
use crate::message::{MailMessage, MessageProgress};
use crate::pop3result::{MailboxInfo, MessageInfo, POP3Response};
use crate::status::{StatusListener, StatusNotifier};
use crate::tcpreader::{MailReader, SessionReader};
use crate::tcpstream::{Connection, Connector, TcpConnector};
use crate::utils;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum POP3State {
    DISCONNECTED,
    AUTHORIZATION,
    TRANSACTION,
    UPDATE,
}

/// A POP3 client session.
///
/// Every operation takes `&mut self`, so one session runs one command at a
/// time. Any transport failure closes the connection and returns the
/// session to `DISCONNECTED`.
pub struct POP3Connection {
    config: Pop3Config,
    connector: Arc<dyn Connector>,
    stream: Option<Box<dyn Connection>>,
    reader: Option<SessionReader>,
    state: POP3State,
    timestamp: Option<String>,
    last_command: Option<String>,
    last_response: Option<POP3Response>,
    notifier: StatusNotifier,
}

impl POP3Connection {
    pub fn new(config: Pop3Config) -> POP3Connection {
        POP3Connection::with_connector(config, Arc::new(TcpConnector))
    }

    pub fn with_connector(config: Pop3Config, connector: Arc<dyn Connector>) -> POP3Connection {
        POP3Connection {
            config,
            connector,
            stream: None,
            reader: None,
            state: POP3State::DISCONNECTED,
            timestamp: None,
            last_command: None,
            last_response: None,
            notifier: StatusNotifier::new(),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.require("connect", &[POP3State::DISCONNECTED])?;
        trace!("Initiate POP3 Connection");
        let mut stream = self.connector.open(&self.config.host, self.config.port)?;
        stream.set_timeout(self.config.timeout())?;
        let reader = MailReader::new(BufReader::new(stream.reader()?));
        self.stream = Some(stream);
        self.reader = Some(reader);
        trace!("Connection Established");

        let greeting = self.read_response()?;
        if !greeting.is_ok() {
            self.drop_connection();
            bail!(ErrorKind::Protocol(format!(
                "server rejected connection: {}",
                greeting.status_line()
            )));
        }
        self.timestamp = greeting.timestamp();
        self.set_state(POP3State::AUTHORIZATION);
        Ok(())
    }

    /// USER/PASS authentication.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.require("login", &[POP3State::AUTHORIZATION])?;
        trace!("Attempting to Login");
        self.command(&format!("USER {}", username))?;
        self.command(&format!("PASS {}", password))?;
        self.set_state(POP3State::TRANSACTION);
        Ok(())
    }

    /// APOP authentication with the timestamp from the server greeting.
    pub fn login_apop(&mut self, username: &str, password: &str) -> Result<()> {
        self.require("login_apop", &[POP3State::AUTHORIZATION])?;
        trace!("Authenticating using APOP");
        let digest = match self.timestamp {
            Some(ref timestamp) => utils::get_apop_digest(timestamp, password),
            None => bail!(ErrorKind::Protocol(
                "server greeting carried no APOP timestamp".to_string()
            )),
        };
        self.command(&format!("APOP {} {}", username, digest))?;
        self.set_state(POP3State::TRANSACTION);
        Ok(())
    }

    /// Send QUIT and close the connection. From `TRANSACTION` the session
    /// moves to `UPDATE` and the server commits pending deletions.
    pub fn logout(&mut self) -> Result<()> {
        self.require(
            "logout",
            &[POP3State::AUTHORIZATION, POP3State::TRANSACTION],
        )?;
        trace!("Cmd: QUIT");
        let result = self.command("QUIT");
        let next = match (self.state, &result) {
            (POP3State::TRANSACTION, &Ok(_)) => POP3State::UPDATE,
            _ => POP3State::DISCONNECTED,
        };
        self.drop_connection();
        self.set_state(next);
        result.map(|_| ())
    }

    pub fn status(&mut self) -> Result<MailboxInfo> {
        self.require("status", &[POP3State::TRANSACTION])?;
        trace!("Cmd: STAT");
        let response = self.command("STAT")?;
        MailboxInfo::parse(&response)
    }

    pub fn list_message(&mut self, number: u32) -> Result<MessageInfo> {
        self.require("list_message", &[POP3State::TRANSACTION])?;
        trace!("Cmd: LIST");
        let response = self.command(&format!("LIST {}", number))?;
        MessageInfo::parse_size_response(&response)
    }

    pub fn list_messages(&mut self) -> Result<Vec<MessageInfo>> {
        self.require("list_messages", &[POP3State::TRANSACTION])?;
        trace!("Cmd: LIST");
        let response = self.multiline_command("LIST")?;
        MessageInfo::parse_size_listing(response.lines())
    }

    pub fn list_unique_identifier(&mut self, number: u32) -> Result<MessageInfo> {
        self.require("list_unique_identifier", &[POP3State::TRANSACTION])?;
        trace!("Cmd: UIDL");
        let response = self.command(&format!("UIDL {}", number))?;
        MessageInfo::parse_uid_response(&response)
    }

    pub fn list_unique_identifiers(&mut self) -> Result<Vec<MessageInfo>> {
        self.require("list_unique_identifiers", &[POP3State::TRANSACTION])?;
        trace!("Cmd: UIDL");
        let response = self.multiline_command("UIDL")?;
        MessageInfo::parse_uid_listing(response.lines())
    }

    pub fn retrieve_message(&mut self, number: u32) -> Result<MailMessage> {
        self.retrieve_message_with_progress(number, Arc::new(MessageProgress::new(None)))
    }

    /// Retrieve a listed message. The size from LIST, if present, is
    /// reported in progress events.
    pub fn retrieve_message_info(&mut self, info: &MessageInfo) -> Result<MailMessage> {
        let progress = Arc::new(MessageProgress::new(info.size()));
        self.retrieve_message_with_progress(info.number, progress)
    }

    /// Retrieve a message, updating `progress` as it is read. The counters
    /// may be polled from another thread during the transfer.
    pub fn retrieve_message_with_progress(
        &mut self,
        number: u32,
        progress: Arc<MessageProgress>,
    ) -> Result<MailMessage> {
        self.require("retrieve_message", &[POP3State::TRANSACTION])?;
        trace!("Cmd: RETR");
        self.command(&format!("RETR {}", number))?;

        let result = match self.reader {
            Some(ref mut reader) => MailMessage::read_with_progress(
                reader,
                &self.config.attachment_dir,
                progress,
                Some(&self.notifier),
            ),
            None => Err(not_connected()),
        };
        if let Err(ref e) = result {
            if e.category() == ErrorCategory::Transport {
                self.drop_connection();
            }
        }
        let message = result?;
        self.check_terminated()?;
        Ok(message)
    }

    /// Send RETR and hand out the session reader positioned at the start of
    /// the message. The caller must read up to the end of the message (the
    /// reader reports it as end of stream) before issuing another command.
    pub fn message_reader(&mut self, number: u32) -> Result<&mut SessionReader> {
        self.require("message_reader", &[POP3State::TRANSACTION])?;
        trace!("Cmd: RETR");
        self.command(&format!("RETR {}", number))?;
        match self.reader {
            Some(ref mut reader) => Ok(reader),
            None => Err(not_connected()),
        }
    }

    /// The header and the first `lines` body lines of a message.
    pub fn retrieve_message_top(&mut self, number: u32, lines: u32) -> Result<Vec<String>> {
        self.require("retrieve_message_top", &[POP3State::TRANSACTION])?;
        trace!("Cmd: TOP");
        let response = self.multiline_command(&format!("TOP {} {}", number, lines))?;
        Ok(response.lines().to_vec())
    }

    /// Mark a message for deletion when the session ends.
    pub fn delete_message(&mut self, number: u32) -> Result<()> {
        self.require("delete_message", &[POP3State::TRANSACTION])?;
        trace!("Cmd: DELE");
        self.command(&format!("DELE {}", number))?;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.require("reset", &[POP3State::TRANSACTION])?;
        trace!("Cmd: RSET");
        self.command("RSET")?;
        Ok(())
    }

    pub fn noop(&mut self) -> Result<()> {
        self.require("noop", &[POP3State::TRANSACTION])?;
        trace!("Cmd: NOOP");
        self.command("NOOP")?;
        Ok(())
    }

    /// Close the connection without QUIT, from any state.
    pub fn disconnect(&mut self) -> Result<()> {
        let closed = match self.stream.take() {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        };
        self.reader = None;
        self.set_state(POP3State::DISCONNECTED);
        closed.map_err(Error::from)
    }

    pub fn state(&self) -> POP3State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The last command sent, with credentials masked.
    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    pub fn last_response(&self) -> Option<&POP3Response> {
        self.last_response.as_ref()
    }

    pub fn timeout(&self) -> u64 {
        self.config.timeout_ms
    }

    /// Change the read timeout, applied right away when connected.
    pub fn set_timeout(&mut self, timeout_ms: u64) -> Result<()> {
        self.config.timeout_ms = timeout_ms;
        if let Some(ref mut stream) = self.stream {
            stream.set_timeout(self.config.timeout())?;
        }
        Ok(())
    }

    pub fn attachment_dir(&self) -> &Path {
        &self.config.attachment_dir
    }

    pub fn set_attachment_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        self.config.attachment_dir = dir.into();
    }

    pub fn config(&self) -> &Pop3Config {
        &self.config
    }

    /// A handle on this session's listener registry.
    pub fn status_notifier(&self) -> StatusNotifier {
        self.notifier.clone()
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> bool {
        self.notifier.add_listener(listener)
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn StatusListener>) -> bool {
        self.notifier.remove_listener(listener)
    }

    fn require(&self, operation: &str, states: &[POP3State]) -> Result<()> {
        if states.contains(&self.state) {
            return Ok(());
        }
        let required = states
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join(" or ");
        bail!(ErrorKind::State(operation.to_string(), required))
    }

    fn set_state(&mut self, state: POP3State) {
        self.state = state;
        debug!("POP3State::{:?}", self.state);
    }

    /// Send a command and read a single line response, failing on "-ERR".
    fn command(&mut self, command: &str) -> Result<POP3Response> {
        self.send_command(command)?;
        let response = self.read_response()?;
        check_ok(response)
    }

    /// Send a command and read a multi-line response, failing on "-ERR".
    fn multiline_command(&mut self, command: &str) -> Result<POP3Response> {
        self.send_command(command)?;
        let first = self.read_response()?;
        if !first.is_ok() {
            return check_ok(first);
        }

        let mut lines = Vec::new();
        while let Some(line) = self.next_line()? {
            trace!("S: {}", line);
            self.notifier.fire_response(&line);
            lines.push(line);
        }
        self.check_terminated()?;
        let response = POP3Response::parse_multiline(first.status_line(), lines);
        self.last_response = Some(response.clone());
        Ok(response)
    }

    fn send_command(&mut self, command: &str) -> Result<()> {
        let shown = redact(command);
        let sent = match self.stream {
            Some(ref mut stream) => {
                info!("C: {}", shown);
                self.notifier.fire_command(&shown);
                stream.write_string(command)
            }
            None => return Err(not_connected()),
        };
        self.last_command = Some(shown);
        if let Err(e) = sent {
            self.drop_connection();
            return Err(e.into());
        }
        Ok(())
    }

    fn read_response(&mut self) -> Result<POP3Response> {
        let line = match self.next_line()? {
            Some(line) => line,
            None => {
                self.drop_connection();
                bail!(ErrorKind::Transport(
                    "no data while reading POP3 response".to_string()
                ));
            }
        };
        info!("S: {}", line);
        self.notifier.fire_response(&line);
        let response = POP3Response::parse(&line);
        self.last_response = Some(response.clone());
        Ok(response)
    }

    /// Next line from the server, `None` on the "." terminator or at the end
    /// of the stream.
    fn next_line(&mut self) -> Result<Option<String>> {
        let line = match self.reader {
            Some(ref mut reader) => reader.read_line(),
            None => return Err(not_connected()),
        };
        line.or_else(|e| {
            self.drop_connection();
            Err(e.into())
        })
    }

    /// Fails when the last multi-line read stopped at the end of the stream
    /// instead of the "." line.
    fn check_terminated(&mut self) -> Result<()> {
        let eof = self
            .reader
            .as_ref()
            .map_or(true, |reader| reader.at_end_of_stream());
        if eof {
            self.drop_connection();
            bail!(ErrorKind::Transport(
                "connection closed before end of response".to_string()
            ));
        }
        Ok(())
    }

    fn drop_connection(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close() {
                debug!("Error closing connection: {}", e);
            }
        }
        self.reader = None;
        if self.state != POP3State::DISCONNECTED {
            self.set_state(POP3State::DISCONNECTED);
        }
    }
}

fn check_ok(response: POP3Response) -> Result<POP3Response> {
    if response.is_ok() {
        Ok(response)
    } else {
        Err(ErrorKind::Protocol(format!("Bad response: {}", response.status_line())).into())
    }
}

fn not_connected() -> Error {
    ErrorKind::Transport("not connected".to_string()).into()
}

fn redact(command: &str) -> String {
    if command.get(..5).map_or(false, |c| c.eq_ignore_ascii_case("PASS ")) {
        "PASS ********".to_string()
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MailStatusEvent;
    use crate::tcpstream::scripted::ScriptedConnector;
    use std::sync::Mutex;

    fn session(transcript: &str) -> (POP3Connection, Arc<ScriptedConnector>) {
        let connector = ScriptedConnector::new(transcript);
        let pop3 = POP3Connection::with_connector(Pop3Config::default(), connector.clone());
        (pop3, connector)
    }

    #[test]
    fn retrieve_outside_transaction_sends_nothing() {
        let (mut pop3, server) = session("+OK ready\r\n");
        pop3.connect().unwrap();
        assert_eq!(pop3.state(), POP3State::AUTHORIZATION);

        let err = pop3.retrieve_message(1).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::State);
        assert_eq!(err.to_string(), "retrieve_message: not in TRANSACTION state");
        assert_eq!(server.sent(), "");
        assert_eq!(pop3.state(), POP3State::AUTHORIZATION);
    }

    #[test]
    fn operations_before_connect_are_state_errors() {
        let (mut pop3, _) = session("");
        assert_eq!(pop3.noop().unwrap_err().category(), ErrorCategory::State);
        assert_eq!(
            pop3.login("jane", "secret").unwrap_err().category(),
            ErrorCategory::State
        );
        assert_eq!(pop3.logout().unwrap_err().category(), ErrorCategory::State);
    }

    #[test]
    fn login_masks_the_password() {
        let (mut pop3, server) =
            session("+OK ready\r\n+OK\r\n+OK logged in\r\n+OK 2 320\r\n+OK bye\r\n");
        let commands = Arc::new(Mutex::new(Vec::new()));
        let sink = commands.clone();
        pop3.add_status_listener(Arc::new(move |e: &MailStatusEvent| {
            if let MailStatusEvent::Command(ref c) = *e {
                sink.lock().unwrap().push(c.clone());
            }
        }));

        pop3.connect().unwrap();
        pop3.login("jane", "secret").unwrap();
        assert_eq!(pop3.last_command(), Some("PASS ********"));
        assert_eq!(pop3.state(), POP3State::TRANSACTION);

        let info = pop3.status().unwrap();
        assert_eq!(info.message_count, 2);
        assert_eq!(info.mailbox_size, 320);

        pop3.logout().unwrap();
        assert_eq!(pop3.state(), POP3State::UPDATE);
        assert!(!pop3.is_connected());

        assert_eq!(
            *commands.lock().unwrap(),
            vec!["USER jane", "PASS ********", "STAT", "QUIT"]
        );
        assert_eq!(
            server.sent(),
            "USER jane\r\nPASS secret\r\nSTAT\r\nQUIT\r\n"
        );
    }

    #[test]
    fn rejected_password_keeps_authorization_state() {
        let (mut pop3, _) = session("+OK ready\r\n+OK\r\n-ERR invalid password\r\n");
        pop3.connect().unwrap();
        let err = pop3.login("jane", "wrong").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert_eq!(pop3.state(), POP3State::AUTHORIZATION);
        assert_eq!(
            pop3.last_response().map(|r| r.status_line()),
            Some("-ERR invalid password")
        );
    }

    #[test]
    fn lost_connection_resets_to_disconnected() {
        let (mut pop3, _) = session("+OK ready\r\n");
        pop3.connect().unwrap();
        let err = pop3.login("jane", "secret").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(pop3.state(), POP3State::DISCONNECTED);
        assert!(!pop3.is_connected());
    }

    #[test]
    fn negative_greeting_fails_connect() {
        let (mut pop3, _) = session("-ERR go away\r\n");
        let err = pop3.connect().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert_eq!(pop3.state(), POP3State::DISCONNECTED);
    }

    #[test]
    fn apop_uses_greeting_timestamp() {
        let (mut pop3, server) =
            session("+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n+OK maildrop locked\r\n");
        pop3.connect().unwrap();
        pop3.login_apop("mrose", "tanstaaf").unwrap();
        assert_eq!(pop3.state(), POP3State::TRANSACTION);
        assert_eq!(
            server.sent(),
            "APOP mrose c4c9334bac560ecc979e58001b3e22fb\r\n"
        );

        let (mut pop3, _) = session("+OK ready\r\n");
        pop3.connect().unwrap();
        assert_eq!(
            pop3.login_apop("mrose", "tanstaaf").unwrap_err().category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn listings_and_top() {
        let (mut pop3, server) = session(concat!(
            "+OK ready\r\n+OK\r\n+OK\r\n",
            "+OK 2 messages\r\n1 120\r\n2 200\r\n.\r\n",
            "+OK\r\n1 whqtswO00WBw418f9t5JxYwZ\r\n2 QhdPYR:00WBw1Ph7x7\r\n.\r\n",
            "+OK 2 200\r\n",
            "+OK top of message follows\r\nSubject: hi\r\n\r\nfirst line\r\n.\r\n",
            "-ERR no such message\r\n",
        ));
        pop3.connect().unwrap();
        pop3.login("jane", "secret").unwrap();

        let sizes = pop3.list_messages().unwrap();
        assert_eq!(
            sizes,
            vec![MessageInfo::with_size(1, 120), MessageInfo::with_size(2, 200)]
        );
        let uids = pop3.list_unique_identifiers().unwrap();
        assert_eq!(uids[1].unique_id(), Some("QhdPYR:00WBw1Ph7x7"));
        assert_eq!(pop3.list_message(2).unwrap(), MessageInfo::with_size(2, 200));

        let top = pop3.retrieve_message_top(1, 1).unwrap();
        assert_eq!(top, vec!["Subject: hi", "", "first line"]);

        let err = pop3.delete_message(9).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert_eq!(pop3.state(), POP3State::TRANSACTION);
        assert!(server.sent().ends_with("LIST\r\nUIDL\r\nLIST 2\r\nTOP 1 1\r\nDELE 9\r\n"));
    }

    #[test]
    fn retrieve_message_reads_up_to_terminator() {
        let (mut pop3, _) = session(concat!(
            "+OK ready\r\n+OK\r\n+OK\r\n",
            "+OK 40 octets\r\nSubject: hello\r\n\r\nbody text\r\n.\r\n",
            "+OK\r\n",
        ));
        pop3.connect().unwrap();
        pop3.login("jane", "secret").unwrap();

        let info = MessageInfo::with_size(1, 40);
        let message = pop3.retrieve_message_info(&info).unwrap();
        assert_eq!(message.header_value("subject"), Some("hello"));
        assert_eq!(message.parts()[0].text(), Some("body text"));
        assert_eq!(message.message_size(), Some(40));

        pop3.noop().unwrap();
        assert_eq!(pop3.last_command(), Some("NOOP"));
    }

    #[test]
    fn listing_cut_short_is_a_transport_error() {
        let (mut pop3, _) = session("+OK ready\r\n+OK\r\n+OK\r\n+OK 2 messages\r\n1 120\r\n");
        pop3.connect().unwrap();
        pop3.login("jane", "secret").unwrap();

        let err = pop3.list_messages().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(pop3.state(), POP3State::DISCONNECTED);
        assert!(!pop3.is_connected());
    }

    #[test]
    fn message_cut_short_is_a_transport_error() {
        let (mut pop3, _) = session(concat!(
            "+OK ready\r\n+OK\r\n+OK\r\n",
            "+OK message follows\r\nSubject: hello\r\n\r\nbody text\r\n",
        ));
        pop3.connect().unwrap();
        pop3.login("jane", "secret").unwrap();

        let err = pop3.retrieve_message(1).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(pop3.state(), POP3State::DISCONNECTED);
    }

    #[test]
    fn unwritable_attachment_dir_keeps_the_session() {
        let (mut pop3, server) = session(concat!(
            "+OK ready\r\n+OK\r\n+OK\r\n",
            "+OK message follows\r\n",
            "Subject: report\r\n",
            "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--b1\r\n",
            "Content-Type: application/octet-stream; name=\"r.bin\"\r\n",
            "Content-Disposition: attachment; filename=\"r.bin\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "AAECAw==\r\n",
            "--b1--\r\n",
            "trailing text\r\n",
            ".\r\n",
            "+OK\r\n",
        ));
        pop3.connect().unwrap();
        pop3.login("jane", "secret").unwrap();
        pop3.set_attachment_dir("/nonexistent/mailclient/attachments");

        let err = pop3.retrieve_message(1).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(pop3.state(), POP3State::TRANSACTION);
        assert!(pop3.is_connected());

        pop3.noop().unwrap();
        assert_eq!(pop3.last_response().map(|r| r.status_line()), Some("+OK"));
        assert!(server.sent().ends_with("RETR 1\r\nNOOP\r\n"));
    }

    #[test]
    fn disconnect_from_any_state() {
        let (mut pop3, _) = session("+OK ready\r\n");
        pop3.connect().unwrap();
        pop3.disconnect().unwrap();
        assert_eq!(pop3.state(), POP3State::DISCONNECTED);
        pop3.disconnect().unwrap();
    }

    #[test]
    fn settings_apply_to_the_session() {
        let (mut pop3, _) = session("+OK ready\r\n");
        assert_eq!(pop3.timeout(), 10_000);
        pop3.set_timeout(2_500).unwrap();
        assert_eq!(pop3.config().timeout_ms, 2_500);

        pop3.connect().unwrap();
        pop3.set_timeout(0).unwrap();
        assert_eq!(pop3.timeout(), 0);

        pop3.set_attachment_dir("/var/tmp/mail");
        assert_eq!(pop3.attachment_dir(), Path::new("/var/tmp/mail"));
    }
}
