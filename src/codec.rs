// codec.rs - Tokio codec for SIP message framing on stream transports

use crate::{parse_sip_message, SipMessage, SipParseError, MAX_BODY_LENGTH, MAX_HEADER_LENGTH};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Frames SIP messages on a byte stream using the blank line after the
/// headers plus Content-Length (RFC 3261 §18.3). Frames that fail to parse
/// are dropped and decoding continues with the next frame.
pub struct SipCodec {
    /// Maximum allowed message size for security
    max_message_size: usize,
    /// Body length still owed by the frame at the head of the buffer
    state: CodecState,
}

#[derive(Debug, Clone, Copy)]
enum CodecState {
    Headers,
    Body { headers_end: usize, body_len: usize },
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SipCodec {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_HEADER_LENGTH + MAX_BODY_LENGTH)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: CodecState::Headers,
        }
    }

    /// Find the end of headers (empty line)
    fn find_headers_end(buf: &[u8]) -> Option<usize> {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return Some(pos + 4);
        }

        // Bare LF line endings are tolerated
        buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
    }

    /// Extract Content-Length (long or compact form) from the header block
    fn extract_content_length(headers: &[u8]) -> Result<Option<usize>, SipParseError> {
        let headers_str = std::str::from_utf8(headers)
            .map_err(|_| SipParseError::ParseError("Invalid UTF-8 in headers".to_string()))?;

        for line in headers_str.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if !(name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l")) {
                continue;
            }
            let value = value.trim();
            let len = value.parse::<usize>().map_err(|_| {
                SipParseError::MalformedHeader(format!("Invalid Content-Length: {}", value))
            })?;
            if len > MAX_BODY_LENGTH {
                return Err(SipParseError::BodyTooLong(len, MAX_BODY_LENGTH));
            }
            return Ok(Some(len));
        }

        Ok(None)
    }

    /// Drop keep-alive CRLFs between messages (RFC 5626 §3.5.1).
    fn skip_keepalives(buf: &mut BytesMut) {
        let leading = buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if leading > 0 {
            buf.advance(leading);
        }
    }

    fn invalid(err: SipParseError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let frame_len = match self.state {
                CodecState::Headers => {
                    Self::skip_keepalives(buf);
                    let Some(headers_end) = Self::find_headers_end(buf) else {
                        if buf.len() > MAX_HEADER_LENGTH {
                            return Err(Self::invalid(SipParseError::HeaderTooLong(
                                buf.len(),
                                MAX_HEADER_LENGTH,
                            )));
                        }
                        return Ok(None);
                    };

                    if headers_end > MAX_HEADER_LENGTH {
                        return Err(Self::invalid(SipParseError::HeaderTooLong(
                            headers_end,
                            MAX_HEADER_LENGTH,
                        )));
                    }

                    // Stream transports require Content-Length; absent means empty body
                    let body_len = Self::extract_content_length(&buf[..headers_end])
                        .map_err(Self::invalid)?
                        .unwrap_or(0);
                    if headers_end + body_len > self.max_message_size {
                        return Err(Self::invalid(SipParseError::SecurityViolation(format!(
                            "Message too large: {} bytes",
                            headers_end + body_len
                        ))));
                    }
                    self.state = CodecState::Body {
                        headers_end,
                        body_len,
                    };
                    headers_end + body_len
                }
                CodecState::Body {
                    headers_end,
                    body_len,
                } => headers_end + body_len,
            };

            if buf.len() < frame_len {
                buf.reserve(frame_len - buf.len());
                return Ok(None);
            }

            let frame = buf.split_to(frame_len).freeze();
            self.state = CodecState::Headers;

            match parse_sip_message(&frame) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    debug!("Discarding malformed frame of {} bytes: {}", frame.len(), e);
                    continue;
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.iter().all(|b| b.is_ascii_whitespace()) => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Incomplete SIP message at EOF",
            )),
        }
    }
}

/// Pre-serialized messages, as buffered by transactions.
impl Encoder<Bytes> for SipCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_message_size {
            return Err(Self::invalid(SipParseError::SecurityViolation(format!(
                "Message too large: {} bytes",
                item.len()
            ))));
        }
        buf.extend_from_slice(&item);
        Ok(())
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = io::Error;

    fn encode(&mut self, message: SipMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        message.validate().map_err(Self::invalid)?;
        <Self as Encoder<Bytes>>::encode(self, message.to_bytes(), buf)
    }
}
