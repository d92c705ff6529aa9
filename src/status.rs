//! Status and progress notification for POP3 and SMTP sessions.
//!
//! Listeners are kept in a registry behind a lock. Delivery clones the
//! registry into a snapshot first, so listeners may be added or removed from
//! other threads, or from inside a callback, while an event is being
//! delivered.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Command,
    Response,
    Progress,
    Start,
    Done,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailStatusEvent {
    /// A command sent to the server, credentials redacted.
    Command(String),
    /// A response line received from the server.
    Response(String),
    /// Bytes transferred: this chunk, the running total for the current
    /// message, and the message size when known.
    Progress {
        bytes: u64,
        total: u64,
        message_size: Option<u64>,
    },
    Start(String),
    Done(String),
    Exception(String),
}

impl MailStatusEvent {
    pub fn event_type(&self) -> EventType {
        match *self {
            MailStatusEvent::Command(_) => EventType::Command,
            MailStatusEvent::Response(_) => EventType::Response,
            MailStatusEvent::Progress { .. } => EventType::Progress,
            MailStatusEvent::Start(_) => EventType::Start,
            MailStatusEvent::Done(_) => EventType::Done,
            MailStatusEvent::Exception(_) => EventType::Exception,
        }
    }

    /// The message carried by every event except `Progress`.
    pub fn message(&self) -> Option<&str> {
        match *self {
            MailStatusEvent::Command(ref m)
            | MailStatusEvent::Response(ref m)
            | MailStatusEvent::Start(ref m)
            | MailStatusEvent::Done(ref m)
            | MailStatusEvent::Exception(ref m) => Some(m),
            MailStatusEvent::Progress { .. } => None,
        }
    }
}

impl fmt::Display for MailStatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MailStatusEvent::Command(ref m) => write!(f, "C: {}", m),
            MailStatusEvent::Response(ref m) => write!(f, "S: {}", m),
            MailStatusEvent::Progress {
                bytes,
                total,
                message_size: Some(size),
            } => write!(f, "{} bytes ({}/{})", bytes, total, size),
            MailStatusEvent::Progress { bytes, total, .. } => {
                write!(f, "{} bytes ({})", bytes, total)
            }
            MailStatusEvent::Start(ref m) => write!(f, "start: {}", m),
            MailStatusEvent::Done(ref m) => write!(f, "done: {}", m),
            MailStatusEvent::Exception(ref m) => write!(f, "exception: {}", m),
        }
    }
}

pub trait StatusListener: Send + Sync {
    fn mail_status(&self, event: &MailStatusEvent);
}

impl<F> StatusListener for F
where
    F: Fn(&MailStatusEvent) + Send + Sync,
{
    fn mail_status(&self, event: &MailStatusEvent) {
        self(event)
    }
}

/// Shared listener registry. Clones refer to the same set of listeners.
#[derive(Clone, Default)]
pub struct StatusNotifier {
    listeners: Arc<Mutex<Vec<Arc<dyn StatusListener>>>>,
}

impl StatusNotifier {
    pub fn new() -> StatusNotifier {
        StatusNotifier::default()
    }

    /// Register `listener`. Returns false if it is already registered.
    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) -> bool {
        let mut listeners = self.lock();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister `listener`. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn StatusListener>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    pub fn fire(&self, event: MailStatusEvent) {
        let snapshot: Vec<Arc<dyn StatusListener>> = {
            let listeners = self.lock();
            if listeners.is_empty() {
                return;
            }
            listeners.clone()
        };
        for listener in &snapshot {
            listener.mail_status(&event);
        }
    }

    pub fn fire_command(&self, command: &str) {
        self.fire(MailStatusEvent::Command(command.to_string()));
    }

    pub fn fire_response(&self, response: &str) {
        self.fire(MailStatusEvent::Response(response.to_string()));
    }

    pub fn fire_progress(&self, bytes: u64, total: u64, message_size: Option<u64>) {
        self.fire(MailStatusEvent::Progress {
            bytes,
            total,
            message_size,
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn StatusListener>>> {
        // A listener that panicked must not silence the others.
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for StatusNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn same_listener(a: &Arc<dyn StatusListener>, b: &Arc<dyn StatusListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
