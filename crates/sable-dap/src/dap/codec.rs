//! DAP wire framing.
//!
//! Messages are JSON bodies framed by an HTTP-like header section:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```
//!
//! Two entry points: blocking [`read_message`]/[`write_message`] over
//! `BufRead`/`Write` streams, and the incremental [`FrameDecoder`] used by the
//! non-blocking transport, which accepts bytes as they arrive and yields
//! complete frames.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, Read, Write};

use super::{MAX_HEADER_LINE_BYTES, MAX_MESSAGE_BYTES};

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn parse_content_length(headers: &str) -> io::Result<usize> {
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            let length: usize = value
                .parse()
                .map_err(|err| invalid_data(format!("invalid Content-Length {value:?}: {err}")))?;
            if length > MAX_MESSAGE_BYTES {
                return Err(invalid_data(format!(
                    "Content-Length {length} exceeds maximum message size {MAX_MESSAGE_BYTES}"
                )));
            }
            return Ok(length);
        }
    }
    Err(invalid_data("DAP message missing Content-Length header"))
}

/// Read one framed JSON message. `Ok(None)` means clean EOF before any header.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut headers = String::new();
    loop {
        let mut line = String::new();
        let n =
            Read::take(&mut *reader, MAX_HEADER_LINE_BYTES as u64 + 1).read_line(&mut line)?;
        if n == 0 {
            if headers.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF while reading DAP headers",
            ));
        }
        if line.len() > MAX_HEADER_LINE_BYTES {
            return Err(invalid_data(format!(
                "DAP header line exceeds maximum size ({MAX_HEADER_LINE_BYTES} bytes)"
            )));
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
        headers.push_str(&line);
    }

    let length = parse_content_length(&headers)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    let parsed = serde_json::from_slice(&body)
        .map_err(|err| invalid_data(format!("malformed DAP message body: {err}")))?;
    Ok(Some(parsed))
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let body = serde_json::to_vec(message)
        .map_err(|err| invalid_data(format!("unserializable DAP message: {err}")))?;
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Incremental frame decoder for non-blocking reads.
///
/// Feed bytes with [`push`](Self::push), then drain complete frames with
/// [`next_frame`](Self::next_frame). Incomplete frames are kept buffered.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract the next complete frame body, if one is fully buffered.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(header_end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            if self.buffer.len() > MAX_HEADER_LINE_BYTES {
                return Err(invalid_data("DAP header section exceeds maximum size"));
            }
            return Ok(None);
        };

        let headers = std::str::from_utf8(&self.buffer[..header_end])
            .map_err(|_| invalid_data("DAP headers are not UTF-8"))?;
        let length = parse_content_length(headers)?;

        let body_start = header_end + 4;
        if self.buffer.len() < body_start + length {
            return Ok(None);
        }

        let body = self.buffer[body_start..body_start + length].to_vec();
        self.buffer.drain(..body_start + length);
        Ok(Some(body))
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Cursor;

    #[test]
    fn roundtrips_framed_message() {
        let msg = json!({
            "seq": 1,
            "type": "request",
            "command": "initialize",
            "arguments": {"adapterID": "sable"}
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).unwrap();

        let body = serde_json::to_vec(&msg).unwrap();
        assert!(buf.starts_with(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes()));

        let mut cursor = Cursor::new(buf);
        let decoded: Value = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn tolerates_extra_headers() {
        let body = br#"{"seq":1,"type":"request","command":"threads"}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            std::str::from_utf8(body).unwrap()
        );
        let mut cursor = Cursor::new(framed.into_bytes());
        let decoded: Value = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded["command"], "threads");
    }

    #[test]
    fn rejects_oversized_content_length_before_allocating() {
        let framed = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(framed.into_bytes());
        let err = read_message::<_, Value>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_header_lines() {
        let mut garbage = vec![b'X'; MAX_HEADER_LINE_BYTES + 16];
        garbage.extend_from_slice(b"\r\n\r\n");
        let mut cursor = Cursor::new(garbage);
        let err = read_message::<_, Value>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_mid_headers_is_not_a_clean_eof() {
        let mut cursor = Cursor::new(b"Content-Length: 2\r\n".to_vec());
        let err = read_message::<_, Value>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn decoder_yields_frames_across_partial_pushes() {
        let body = br#"{"seq":7,"type":"request","command":"pause"}"#;
        let framed = format!(
            "Content-Length: {}\r\n\r\n{}",
            body.len(),
            std::str::from_utf8(body).unwrap()
        );
        let bytes = framed.as_bytes();

        let mut decoder = FrameDecoder::new();
        let split = bytes.len() / 2;
        decoder.push(&bytes[..split]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&bytes[split..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), body.to_vec());
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_handles_back_to_back_frames() {
        let mut framed = Vec::new();
        for command in ["threads", "pause"] {
            let body = format!(r#"{{"seq":1,"type":"request","command":"{command}"}}"#);
            framed.extend_from_slice(
                format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes(),
            );
        }

        let mut decoder = FrameDecoder::new();
        decoder.push(&framed);
        let first: Value = serde_json::from_slice(&decoder.next_frame().unwrap().unwrap()).unwrap();
        let second: Value =
            serde_json::from_slice(&decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(first["command"], "threads");
        assert_eq!(second["command"], "pause");
    }
}
