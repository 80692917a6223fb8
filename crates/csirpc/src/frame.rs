//! Unary frame protocol.
//!
//! Each connectionless exchange (one request, one response) is a sequence of
//! frames over a byte stream. The request side opens with a method header:
//!
//! ```text
//! [2 bytes] method_len (big-endian u16)
//! [N bytes] method path, e.g. "/csi.v1.Controller/CreateVolume"
//! ```
//!
//! Frame types (after the request header):
//! ```text
//! [1 byte] frame_type:
//!   0x01 = DATA   → [4 bytes length] + [N bytes envelope]
//!   0x02 = END    → no payload (request end marker)
//!   0x03 = STATUS → [4 bytes length] + [N bytes encoded Status]
//! ```
//!
//! A request is `header DATA END`; a response is `DATA STATUS(ok)` or a bare
//! `STATUS(err)`. A state machine rejects out-of-order frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::status::Status;

/// Maximum frame length: 16 MiB
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Maximum method path length
const MAX_METHOD_LEN: u16 = 1024;

/// Frame type constants
const FRAME_TYPE_DATA: u8 = 0x01;
const FRAME_TYPE_END: u8 = 0x02;
const FRAME_TYPE_STATUS: u8 = 0x03;

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA frame containing an encoded envelope
    Data(Vec<u8>),
    /// END frame marking the end of a request
    End,
    /// STATUS frame carrying an encoded [`Status`]
    Status(Vec<u8>),
}

/// Stream states for frame sequence validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Expecting the first DATA frame (or an early STATUS on responses)
    ExpectData,
    /// Expecting the closing STATUS frame (response after DATA)
    ExpectStatusOnly,
    /// Expecting the closing END frame (request after DATA)
    ExpectEndOnly,
    /// Terminal state, no more frames expected
    Terminal,
}

/// Stateful frame reader.
pub struct FrameReader<R: AsyncRead + Unpin> {
    /// Underlying reader
    reader: R,
    /// Current stream state
    state: StreamState,
    /// Whether this reader consumes a response (allows early STATUS)
    is_response: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader for the response side of an exchange.
    #[inline]
    pub fn new_response(reader: R) -> Self {
        Self {
            reader,
            state: StreamState::ExpectData,
            is_response: true,
        }
    }

    /// Create a reader for the request side of an exchange.
    #[inline]
    pub fn new_request(reader: R) -> Self {
        Self {
            reader,
            state: StreamState::ExpectData,
            is_response: false,
        }
    }

    /// Read the next frame, validating it against the stream state.
    ///
    /// # Errors
    /// Returns an [`Status::internal`] error on malformed or out-of-order
    /// frames, and an [`Status::unavailable`] error when the peer hangs up
    /// before the exchange completes.
    pub async fn read_frame(&mut self) -> Result<Frame, Status> {
        if self.state == StreamState::Terminal {
            return Err(Status::internal(
                "protocol violation: frame received after terminal frame",
            ));
        }

        let frame_type = match self.reader.read_u8().await {
            Ok(ft) => ft,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Status::unavailable("peer closed mid-exchange"));
            }
            Err(e) => {
                return Err(Status::internal(format!("read frame type error: {e}")));
            }
        };

        let frame = match frame_type {
            FRAME_TYPE_DATA => {
                let len = self
                    .reader
                    .read_u32()
                    .await
                    .map_err(|e| Status::internal(format!("read DATA length error: {e}")))?;
                if len > MAX_FRAME_LEN {
                    return Err(Status::internal("frame too large"));
                }
                let mut data = vec![0u8; len as usize];
                self.reader
                    .read_exact(&mut data)
                    .await
                    .map_err(|e| Status::internal(format!("read DATA payload error: {e}")))?;
                Frame::Data(data)
            }
            FRAME_TYPE_END => Frame::End,
            FRAME_TYPE_STATUS => {
                let len = self
                    .reader
                    .read_u32()
                    .await
                    .map_err(|e| Status::internal(format!("read STATUS length error: {e}")))?;
                if len > MAX_FRAME_LEN {
                    return Err(Status::internal("STATUS frame too large"));
                }
                let mut payload = vec![0u8; len as usize];
                if len > 0 {
                    self.reader
                        .read_exact(&mut payload)
                        .await
                        .map_err(|e| Status::internal(format!("read STATUS payload error: {e}")))?;
                }
                Frame::Status(payload)
            }
            _ => {
                return Err(Status::internal(format!(
                    "unknown frame type 0x{frame_type:02X}"
                )));
            }
        };

        self.validate_and_transition(&frame)?;

        Ok(frame)
    }

    /// Validate a frame against the current state and advance the machine.
    fn validate_and_transition(&mut self, frame: &Frame) -> Result<(), Status> {
        match (self.state, frame) {
            (StreamState::ExpectData, Frame::Data(_)) => {
                self.state = if self.is_response {
                    StreamState::ExpectStatusOnly
                } else {
                    StreamState::ExpectEndOnly
                };
            }
            // The peer may fail an exchange before producing any data.
            (StreamState::ExpectData, Frame::Status(_)) if self.is_response => {
                self.state = StreamState::Terminal;
            }
            (StreamState::ExpectStatusOnly, Frame::Status(_)) => {
                self.state = StreamState::Terminal;
            }
            (StreamState::ExpectEndOnly, Frame::End) => {
                self.state = StreamState::Terminal;
            }
            (state, frame) => {
                return Err(Status::internal(format!(
                    "protocol violation: unexpected {frame:?} in state {state:?}"
                )));
            }
        }
        Ok(())
    }

    /// Check whether the exchange has been fully consumed.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state == StreamState::Terminal
    }
}

/// Frame writer.
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    /// Underlying writer
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a new frame writer
    #[inline]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame.
    ///
    /// # Errors
    /// Returns an [`Status::internal`] error when the underlying write fails.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Status> {
        match *frame {
            Frame::Data(ref data) => {
                self.writer
                    .write_u8(FRAME_TYPE_DATA)
                    .await
                    .map_err(|e| Status::internal(format!("write DATA type error: {e}")))?;
                self.writer
                    .write_u32(data.len() as u32)
                    .await
                    .map_err(|e| Status::internal(format!("write DATA length error: {e}")))?;
                self.writer
                    .write_all(data)
                    .await
                    .map_err(|e| Status::internal(format!("write DATA payload error: {e}")))?;
            }
            Frame::End => {
                self.writer
                    .write_u8(FRAME_TYPE_END)
                    .await
                    .map_err(|e| Status::internal(format!("write END error: {e}")))?;
            }
            Frame::Status(ref payload) => {
                self.writer
                    .write_u8(FRAME_TYPE_STATUS)
                    .await
                    .map_err(|e| Status::internal(format!("write STATUS type error: {e}")))?;
                self.writer
                    .write_u32(payload.len() as u32)
                    .await
                    .map_err(|e| Status::internal(format!("write STATUS length error: {e}")))?;
                if !payload.is_empty() {
                    self.writer
                        .write_all(payload)
                        .await
                        .map_err(|e| Status::internal(format!("write STATUS payload error: {e}")))?;
                }
            }
        }

        Ok(())
    }

    /// Flush buffered data to the underlying writer.
    ///
    /// # Errors
    /// Returns an [`Status::internal`] error when the flush fails.
    pub async fn flush(&mut self) -> Result<(), Status> {
        self.writer
            .flush()
            .await
            .map_err(|e| Status::internal(format!("flush error: {e}")))
    }

    /// Consume the writer and return the underlying stream.
    #[inline]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Write the request method header.
///
/// # Errors
/// Returns an error when the method path is over-long or the write fails.
pub async fn write_method<W: AsyncWrite + Unpin>(w: &mut W, method: &str) -> Result<(), Status> {
    let bytes = method.as_bytes();
    if bytes.len() > MAX_METHOD_LEN as usize {
        return Err(Status::internal("method path too long"));
    }
    w.write_u16(bytes.len() as u16)
        .await
        .map_err(|e| Status::internal(format!("write method length error: {e}")))?;
    w.write_all(bytes)
        .await
        .map_err(|e| Status::internal(format!("write method error: {e}")))?;
    Ok(())
}

/// Read the request method header.
///
/// # Errors
/// Returns an error on malformed headers; an immediate EOF (the peer opened
/// and closed the connection without a request) surfaces as
/// [`Status::unavailable`].
pub async fn read_method<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, Status> {
    let len = match r.read_u16().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Status::unavailable("peer closed before request"));
        }
        Err(e) => return Err(Status::internal(format!("read method length error: {e}"))),
    };
    if len > MAX_METHOD_LEN {
        return Err(Status::internal("method path too long"));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)
        .await
        .map_err(|e| Status::internal(format!("read method error: {e}")))?;
    String::from_utf8(bytes).map_err(|e| Status::internal(format!("invalid method encoding: {e}")))
}
