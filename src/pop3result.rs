/// Result of a STAT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxInfo {
    pub message_count: u32,
    pub mailbox_size: u64,
}

/// What a listing reported about a message: its size (LIST) or its unique
/// identifier (UIDL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDetail {
    Size(u64),
    UniqueId(String),
}

/// One entry of a LIST or UIDL listing. Message numbers are 1-based and
/// stable for the duration of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub number: u32,
    pub detail: MessageDetail,
}

impl MessageInfo {
    pub fn with_size(number: u32, size: u64) -> MessageInfo {
        MessageInfo {
            number,
            detail: MessageDetail::Size(size),
        }
    }

    pub fn with_unique_id(number: u32, uid: &str) -> MessageInfo {
        MessageInfo {
            number,
            detail: MessageDetail::UniqueId(uid.to_string()),
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self.detail {
            MessageDetail::Size(size) => Some(size),
            MessageDetail::UniqueId(_) => None,
        }
    }

    pub fn unique_id(&self) -> Option<&str> {
        match self.detail {
            MessageDetail::UniqueId(ref uid) => Some(uid),
            MessageDetail::Size(_) => None,
        }
    }
}

/// A server response: the status line, whether it was "+OK", its
/// whitespace-separated tokens, and for multi-line responses the lines that
/// followed it, without the "." terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct POP3Response {
    pub(crate) status_line: String,
    pub(crate) ok: bool,
    pub(crate) tokens: Vec<String>,
    pub(crate) lines: Vec<String>,
}
