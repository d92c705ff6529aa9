use crate::errors::*;
use crate::pop3result::{MailboxInfo, MessageInfo, POP3Response};
use regex::Regex;

lazy_static! {
    static ref LISTING_REGEX: Regex = Regex::new(r"^\s*(?P<nmsg>\S+)\s+(?P<arg>\S+)").unwrap();
    static ref TIMESTAMP_REGEX: Regex = Regex::new(r"(<[^<>]+>)").unwrap();
}

impl POP3Response {
    pub fn parse(line: &str) -> POP3Response {
        let ok = line.trim_start().starts_with("+OK");
        let tokens = if ok {
            line.split_whitespace().map(String::from).collect()
        } else {
            Vec::new()
        };
        POP3Response {
            status_line: line.to_string(),
            ok,
            tokens,
            lines: Vec::new(),
        }
    }

    pub fn parse_multiline(first: &str, lines: Vec<String>) -> POP3Response {
        let mut response = POP3Response::parse(first);
        response.lines = lines;
        response
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// The raw status line as received.
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    /// Continuation lines of a multi-line response.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Token `index` of a positive status line; token 0 is "+OK".
    pub fn token(&self, index: usize) -> Result<&str> {
        self.tokens.get(index).map(|t| t.as_str()).ok_or_else(|| {
            ErrorKind::Protocol(format!(
                "missing token {} in response \"{}\"",
                index, self.status_line
            ))
            .into()
        })
    }

    pub fn int_token(&self, index: usize) -> Result<u64> {
        let token = self.token(index)?;
        token.parse::<u64>().map_err(|_| {
            ErrorKind::Protocol(format!(
                "token {} of response \"{}\" is not a number",
                index, self.status_line
            ))
            .into()
        })
    }

    /// The APOP timestamp "<...>" of a server greeting, if any.
    pub fn timestamp(&self) -> Option<String> {
        TIMESTAMP_REGEX
            .captures(&self.status_line)
            .map(|cap| cap[1].to_string())
    }
}

impl MailboxInfo {
    pub fn parse(response: &POP3Response) -> Result<MailboxInfo> {
        Ok(MailboxInfo {
            message_count: to_u32(response.int_token(1)?)?,
            mailbox_size: response.int_token(2)?,
        })
    }
}

impl MessageInfo {
    /// Parse the "+OK n size" answer to a single-message LIST.
    pub fn parse_size_response(response: &POP3Response) -> Result<MessageInfo> {
        Ok(MessageInfo::with_size(
            to_u32(response.int_token(1)?)?,
            response.int_token(2)?,
        ))
    }

    /// Parse the "+OK n uid" answer to a single-message UIDL.
    pub fn parse_uid_response(response: &POP3Response) -> Result<MessageInfo> {
        Ok(MessageInfo::with_unique_id(
            to_u32(response.int_token(1)?)?,
            response.token(2)?,
        ))
    }

    /// Parse a "n size" line of a LIST listing.
    pub fn parse_size_line(line: &str) -> Result<MessageInfo> {
        let (number, size) = split_listing_line(line, "LIST")?;
        let size = size.parse::<u64>().map_err(|_| malformed("LIST", line))?;
        Ok(MessageInfo::with_size(number, size))
    }

    /// Parse a "n uid" line of a UIDL listing.
    pub fn parse_uid_line(line: &str) -> Result<MessageInfo> {
        let (number, uid) = split_listing_line(line, "UIDL")?;
        Ok(MessageInfo::with_unique_id(number, uid))
    }

    pub fn parse_size_listing(lines: &[String]) -> Result<Vec<MessageInfo>> {
        lines.iter().map(|l| MessageInfo::parse_size_line(l)).collect()
    }

    pub fn parse_uid_listing(lines: &[String]) -> Result<Vec<MessageInfo>> {
        lines.iter().map(|l| MessageInfo::parse_uid_line(l)).collect()
    }
}

fn split_listing_line<'a>(line: &'a str, command: &str) -> Result<(u32, &'a str)> {
    let cap = LISTING_REGEX
        .captures(line)
        .ok_or_else(|| malformed(command, line))?;
    let number = cap
        .name("nmsg")
        .map_or("", |m| m.as_str())
        .parse::<u32>()
        .map_err(|_| malformed(command, line))?;
    let arg = cap.name("arg").map_or("", |m| m.as_str());
    Ok((number, arg))
}

fn malformed(command: &str, line: &str) -> Error {
    ErrorKind::Protocol(format!("malformed {} response \"{}\"", command, line)).into()
}

fn to_u32(value: u64) -> Result<u32> {
    if value > u64::from(u32::max_value()) {
        bail!(ErrorKind::Protocol(format!("message number {} out of range", value)));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_classification() {
        let ok = POP3Response::parse("+OK 2 320");
        assert!(ok.is_ok());
        assert_eq!(ok.token(0).unwrap(), "+OK");
        assert_eq!(ok.int_token(2).unwrap(), 320);

        let err = POP3Response::parse("-ERR no such message");
        assert!(!err.is_ok());
        assert_eq!(err.status_line(), "-ERR no such message");
        assert_eq!(err.token(1).unwrap_err().category(), ErrorCategory::Protocol);
    }

    #[test]
    fn stat_response() {
        let info = MailboxInfo::parse(&POP3Response::parse("+OK 2 320")).unwrap();
        assert_eq!(
            info,
            MailboxInfo {
                message_count: 2,
                mailbox_size: 320
            }
        );
        assert!(MailboxInfo::parse(&POP3Response::parse("+OK")).is_err());
        assert!(MailboxInfo::parse(&POP3Response::parse("+OK two 320")).is_err());
    }

    #[test]
    fn list_listing() {
        let lines = vec!["1 2200".to_string(), "2 1525".to_string()];
        assert_eq!(
            MessageInfo::parse_size_listing(&lines).unwrap(),
            vec![MessageInfo::with_size(1, 2200), MessageInfo::with_size(2, 1525)]
        );
    }

    #[test]
    fn listing_line_needs_two_tokens() {
        let lines = vec!["1 2200".to_string(), "2".to_string()];
        let err = MessageInfo::parse_size_listing(&lines).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert!(MessageInfo::parse_uid_line("").is_err());
        assert!(MessageInfo::parse_size_line("x 12").is_err());
    }

    #[test]
    fn uidl_listing_and_single_responses() {
        let info = MessageInfo::parse_uid_line("3 QhdPYR:00WBw1Ph7x7").unwrap();
        assert_eq!(info.number, 3);
        assert_eq!(info.unique_id(), Some("QhdPYR:00WBw1Ph7x7"));
        assert_eq!(info.size(), None);

        let single = POP3Response::parse("+OK 2 200");
        assert_eq!(
            MessageInfo::parse_size_response(&single).unwrap(),
            MessageInfo::with_size(2, 200)
        );
        let single = POP3Response::parse("+OK 2 abc123");
        assert_eq!(
            MessageInfo::parse_uid_response(&single).unwrap().unique_id(),
            Some("abc123")
        );
    }

    #[test]
    fn greeting_timestamp() {
        let greeting = POP3Response::parse("+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>");
        assert_eq!(
            greeting.timestamp().as_deref(),
            Some("<1896.697170952@dbc.mtview.ca.us>")
        );
        assert_eq!(POP3Response::parse("+OK ready").timestamp(), None);
    }
}
