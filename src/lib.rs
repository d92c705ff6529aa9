//! Client side implementation of the POP3 and SMTP mail protocols.
//!
//! `POP3Connection` retrieves messages and parses them into `MailMessage`
//! values, streaming attachments to disk while decoding them. `SMTPConnection`
//! composes plain or multipart MIME messages and submits them, optionally on a
//! background thread. Both sessions report their progress through a
//! `StatusNotifier`.

#[macro_use]
extern crate log;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;
extern crate chrono;
extern crate md5;
extern crate regex;
extern crate reqwest;

pub mod errors {
    error_chain! {
        foreign_links {
            Io(::std::io::Error);
            Http(::reqwest::Error);
        }

        errors {
            State(operation: String, required: String) {
                description("operation attempted outside of its required session state")
                display("{}: not in {} state", operation, required)
            }
            Protocol(message: String) {
                description("unexpected response from the server")
                display("protocol error: {}", message)
            }
            Transport(message: String) {
                description("connection failure")
                display("transport error: {}", message)
            }
            Validation(message: String) {
                description("message failed validation")
                display("validation error: {}", message)
            }
            Storage(message: String) {
                description("local attachment storage failure")
                display("storage error: {}", message)
            }
        }
    }

    /// Coarse classification of an `Error`, used to decide whether to retry,
    /// reconnect or abort.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorCategory {
        State,
        Protocol,
        Transport,
        Validation,
        /// Reading or writing attachment data on the local side. The
        /// connection is unaffected.
        Storage,
    }

    impl Error {
        pub fn category(&self) -> ErrorCategory {
            match *self.kind() {
                ErrorKind::State(..) => ErrorCategory::State,
                ErrorKind::Validation(_) => ErrorCategory::Validation,
                ErrorKind::Storage(_) => ErrorCategory::Storage,
                ErrorKind::Transport(_) | ErrorKind::Io(_) | ErrorKind::Http(_) => {
                    ErrorCategory::Transport
                }
                _ => ErrorCategory::Protocol,
            }
        }
    }
}

pub mod attachment;
pub mod base64;
pub mod config;
pub mod header;
mod message;
mod multipart;
mod pop3;
mod pop3result;
mod pop3resultimpl;
mod smtp;
pub mod status;
pub mod tcpreader;
pub mod tcpstream;
pub mod utils;

pub use attachment::{Attachment, ExtensionTable, MimeTypeLookup};
pub use config::{AuthType, Pop3Config, SmtpConfig};
pub use errors::{Error, ErrorCategory, ErrorKind, Result};
pub use header::Header;
pub use message::{BodyReader, MailMessage, MessagePart, MessageProgress};
pub use multipart::{parse_multipart, parse_single_attachment};
pub use pop3::{POP3Connection, POP3State};
pub use pop3result::{MailboxInfo, MessageDetail, MessageInfo, POP3Response};
pub use smtp::{Address, OutgoingMessage, SMTPConnection};
pub use status::{EventType, MailStatusEvent, StatusListener, StatusNotifier};
pub use tcpreader::MailReader;
pub use tcpstream::{Connection, Connector, TcpConnection, TcpConnector};
