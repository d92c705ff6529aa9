//! Scripted line-based server for integration testing.
//!
//! The server listens on `127.0.0.1:0`, accepts a single client and plays a
//! script of steps against it: write a canned reply, read one command line,
//! or read a DATA section up to the lone "." line. Everything the client
//! sent is recorded and returned by `FakeServer::finish`.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

pub enum Step {
    /// Write these lines, each followed by CRLF.
    Reply(&'static [&'static str]),
    /// Read one command line.
    Read,
    /// Read lines up to and including the "." terminator.
    ReadData,
}

pub use self::Step::*;

pub struct FakeServer {
    port: u16,
    handle: JoinHandle<Vec<String>>,
}

impl FakeServer {
    pub fn start(script: Vec<Step>) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut out = stream.try_clone().unwrap();
            let mut input = BufReader::new(stream);
            let mut received = Vec::new();

            for step in script {
                match step {
                    Reply(lines) => {
                        for line in lines {
                            out.write_all(line.as_bytes()).unwrap();
                            out.write_all(b"\r\n").unwrap();
                        }
                        out.flush().unwrap();
                    }
                    Read => match read_line(&mut input) {
                        Some(line) => received.push(line),
                        None => break,
                    },
                    ReadData => loop {
                        match read_line(&mut input) {
                            Some(line) => {
                                let done = line == ".";
                                received.push(line);
                                if done {
                                    break;
                                }
                            }
                            None => break,
                        }
                    },
                }
            }
            received
        });
        FakeServer { port, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the script to complete and return the lines the client
    /// sent, without line terminators.
    pub fn finish(self) -> Vec<String> {
        self.handle.join().unwrap()
    }
}

fn read_line<R: BufRead>(input: &mut R) -> Option<String> {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
