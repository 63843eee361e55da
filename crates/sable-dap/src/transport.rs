//! Client transport abstraction.
//!
//! The session engine never touches sockets directly: it drains decoded
//! requests from a [`DapTransport`] and pushes structured messages back. The
//! poll side must never block, because the suspend loop interleaves polling
//! with bounded sleeps while the host thread is parked.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::Value;

use crate::dap::codec::{self, FrameDecoder};
use crate::dap::messages::Request;

pub trait DapTransport {
    /// Next decoded client request, if one is available right now.
    ///
    /// An `Err` is a transport failure and tears the session down.
    fn poll_request(&mut self) -> io::Result<Option<Request>>;

    fn send_message(&mut self, message: &Value) -> io::Result<()>;
}

/// TCP transport with a short read timeout so polls return promptly.
pub struct TcpTransport {
    stream: TcpStream,
    decoder: FrameDecoder,
    scratch: [u8; 4096],
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            scratch: [0; 4096],
        })
    }
}

impl DapTransport for TcpTransport {
    fn poll_request(&mut self) -> io::Result<Option<Request>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                let request = serde_json::from_slice(&frame).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed DAP request: {err}"),
                    )
                })?;
                return Ok(Some(request));
            }

            match self.stream.read(&mut self.scratch) {
                // Peer closed the connection.
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "client disconnected",
                    ))
                }
                Ok(n) => self.decoder.push(&self.scratch[..n]),
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn send_message(&mut self, message: &Value) -> io::Result<()> {
        codec::write_message(&mut self.stream, message)
    }
}

/// In-memory transport double used by the test suites.
///
/// Requests are queued up front; everything the engine sends is captured in
/// order for later assertions.
#[derive(Default)]
pub struct QueueTransport {
    incoming: VecDeque<Request>,
    fail_next_poll: bool,
    fail_sends: bool,
    pub sent: Vec<Value>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_request(&mut self, request: Value) {
        let request =
            serde_json::from_value(request).expect("QueueTransport given a malformed request");
        self.incoming.push_back(request);
    }

    /// Make the next poll report a dropped connection.
    pub fn disconnect(&mut self) {
        self.fail_next_poll = true;
    }

    /// Make every subsequent send fail with a broken pipe.
    pub fn break_pipe(&mut self) {
        self.fail_sends = true;
    }

    pub fn sent_of_type(&self, type_: &str) -> Vec<&Value> {
        self.sent
            .iter()
            .filter(|msg| msg.get("type").and_then(Value::as_str) == Some(type_))
            .collect()
    }

    pub fn events_named(&self, event: &str) -> Vec<&Value> {
        self.sent
            .iter()
            .filter(|msg| {
                msg.get("type").and_then(Value::as_str) == Some("event")
                    && msg.get("event").and_then(Value::as_str) == Some(event)
            })
            .collect()
    }
}

impl DapTransport for QueueTransport {
    fn poll_request(&mut self) -> io::Result<Option<Request>> {
        if self.fail_next_poll {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client disconnected",
            ));
        }
        Ok(self.incoming.pop_front())
    }

    fn send_message(&mut self, message: &Value) -> io::Result<()> {
        if self.fail_sends {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        self.sent.push(message.clone());
        Ok(())
    }
}
