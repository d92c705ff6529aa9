//! Connection abstraction shared by the POP3 and SMTP sessions.
//!
//! A `Connector` opens a `Connection` once per session; the protocol engines
//! only ever see the trait objects, so alternative transports can be plugged
//! in without touching them.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

pub trait Connection: Write + Send {
    /// Apply a read timeout. A zero duration disables the timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// An independent handle for reading from the connection.
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    fn close(&mut self) -> io::Result<()>;

    /// Write `line` followed by CRLF and flush.
    fn write_string(&mut self, line: &str) -> io::Result<()> {
        self.write_all(line.as_bytes())?;
        self.write_all(b"\r\n")?;
        self.flush()
    }
}

pub trait Connector: Send + Sync {
    fn open(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>>;
}

#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn open(host: &str, port: u16) -> io::Result<TcpConnection> {
        trace!("Opening TCP connection to {}:{}", host, port);
        let stream = TcpStream::connect((host, port))?;
        Ok(TcpConnection { stream })
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for TcpConnection {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = if timeout == Duration::from_millis(0) {
            None
        } else {
            Some(timeout)
        };
        self.stream.set_read_timeout(timeout)
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.stream.try_clone()?))
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Plain TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(TcpConnection::open(host, port)?))
    }
}

/// In-memory connection replaying a canned server transcript and recording
/// everything the client writes.
#[cfg(test)]
pub(crate) mod scripted {
    use super::{Connection, Connector};
    use std::io::{self, Cursor, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ScriptedConnection {
        input: Vec<u8>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for ScriptedConnection {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Connection for ScriptedConnection {
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(self.input.clone())))
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) struct ScriptedConnector {
        input: Vec<u8>,
        written: Arc<Mutex<Vec<u8>>>,
        opened: Arc<Mutex<u32>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(transcript: &str) -> Arc<ScriptedConnector> {
            Arc::new(ScriptedConnector {
                input: transcript.as_bytes().to_vec(),
                written: Arc::new(Mutex::new(Vec::new())),
                opened: Arc::new(Mutex::new(0)),
            })
        }

        /// Everything written by the client so far.
        pub(crate) fn sent(&self) -> String {
            String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
        }

        pub(crate) fn times_opened(&self) -> u32 {
            *self.opened.lock().unwrap()
        }
    }

    impl Connector for ScriptedConnector {
        fn open(&self, _host: &str, _port: u16) -> io::Result<Box<dyn Connection>> {
            *self.opened.lock().unwrap() += 1;
            Ok(Box::new(ScriptedConnection {
                input: self.input.clone(),
                written: self.written.clone(),
            }))
        }
    }
}
