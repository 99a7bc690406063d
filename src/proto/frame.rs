use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CONTROLLER_INDEX, EVENT_BIT, STATUS_OPCODE, Service, WireError};

const HEADER_LEN: usize = 5;
const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Errors raised while reading a frame off a byte stream.
#[derive(Debug, Error)]
pub enum FrameReadError {
    /// The transport failed or closed mid-frame.
    #[error("transport failed while reading a frame: {0}")]
    Io(#[from] std::io::Error),
    /// The stream carried bytes that do not form a valid frame.
    #[error("malformed frame on the wire: {0}")]
    Wire(#[from] WireError),
}

/// One decoded control-protocol frame.
///
/// The same shape carries commands, responses and events; the opcode's high
/// bit separates events from the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: Service,
    pub opcode: u8,
    pub index: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a command or response frame for the default controller.
    #[must_use]
    pub fn new(service: Service, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            service,
            opcode,
            index: CONTROLLER_INDEX,
            payload,
        }
    }

    /// Whether this frame is an unsolicited event.
    ///
    /// ```
    /// use certbridge::{Frame, Service};
    ///
    /// assert!(Frame::new(Service::Gap, 0x81, vec![]).is_event());
    /// assert!(!Frame::new(Service::Gap, 0x02, vec![]).is_event());
    /// ```
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.opcode & EVENT_BIT != 0
    }

    /// Whether this frame is a command-rejection status response.
    #[must_use]
    pub fn is_status(&self) -> bool {
        self.opcode == STATUS_OPCODE
    }
}

/// Encodes and decodes control-protocol frames.
///
/// Frame layout: `service (1) | opcode (1) | index (1) | payload length
/// (2, little-endian) | payload`.
pub struct FrameCodec;

impl FrameCodec {
    /// Encodes a frame into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload exceeds the 16-bit length field.
    ///
    /// ```
    /// use certbridge::{Frame, FrameCodec, Service};
    ///
    /// let frame = Frame::new(Service::Gap, 0x05, vec![0x01]);
    /// assert_eq!(vec![0x01, 0x05, 0x00, 0x01, 0x00, 0x01], FrameCodec::encode(&frame)?);
    /// # Ok::<(), certbridge::WireError>(())
    /// ```
    pub fn encode(frame: &Frame) -> Result<Vec<u8>, WireError> {
        let payload_len =
            u16::try_from(frame.payload.len()).map_err(|_overflow| WireError::PayloadTooLarge {
                payload_len: frame.payload.len(),
                max_payload_len: MAX_PAYLOAD_LEN,
            })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + frame.payload.len());
        bytes.push(frame.service.id());
        bytes.push(frame.opcode);
        bytes.push(frame.index);
        bytes.extend_from_slice(&payload_len.to_le_bytes());
        bytes.extend_from_slice(&frame.payload);
        Ok(bytes)
    }

    /// Decodes a complete frame from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error when the buffer is shorter than a header, names an
    /// unknown service, or declares a payload length that does not match the
    /// bytes that follow.
    pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::HeaderTooShort {
                actual: bytes.len(),
            });
        }

        let service =
            Service::from_id(bytes[0]).ok_or(WireError::UnknownService { id: bytes[0] })?;
        let declared = usize::from(u16::from_le_bytes([bytes[3], bytes[4]]));
        let actual = bytes.len() - HEADER_LEN;
        if declared != actual {
            return Err(WireError::LengthMismatch { declared, actual });
        }

        Ok(Frame {
            service,
            opcode: bytes[1],
            index: bytes[2],
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// Reads one frame off an async byte stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport fails (including clean EOF, which
    /// surfaces as [`std::io::ErrorKind::UnexpectedEof`]) or the header names
    /// an unknown service.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let service =
            Service::from_id(header[0]).ok_or(WireError::UnknownService { id: header[0] })?;
        let payload_len = usize::from(u16::from_le_bytes([header[3], header[4]]));
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Frame {
            service,
            opcode: header[1],
            index: header[2],
            payload,
        })
    }

    /// Writes one frame to an async byte stream and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding fails or the transport rejects the
    /// write.
    pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameReadError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = Self::encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encode_writes_header_and_little_endian_length() {
        let frame = Frame::new(Service::Gap, 0x09, vec![0xAA; 0x0103]);
        let bytes = FrameCodec::encode(&frame).expect("frame should encode");

        assert_eq!(&[0x01, 0x09, 0x00, 0x03, 0x01], &bytes[..HEADER_LEN]);
        assert_eq!(HEADER_LEN + 0x0103, bytes.len());
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let frame = Frame::new(Service::Core, 0x03, vec![0x00; MAX_PAYLOAD_LEN + 1]);
        let result = FrameCodec::encode(&frame);
        assert_matches!(
            result,
            Err(WireError::PayloadTooLarge {
                payload_len,
                max_payload_len: MAX_PAYLOAD_LEN,
            }) if payload_len == MAX_PAYLOAD_LEN + 1
        );
    }

    #[test]
    fn decode_round_trips_encode() {
        let frame = Frame::new(Service::Mesh, 0x02, vec![0x01, 0x02, 0x03]);
        let bytes = FrameCodec::encode(&frame).expect("frame should encode");
        assert_eq!(frame, FrameCodec::decode(&bytes).expect("should decode"));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let result = FrameCodec::decode(&[0x01, 0x02, 0x00]);
        assert_matches!(result, Err(WireError::HeaderTooShort { actual: 3 }));
    }

    #[test]
    fn decode_rejects_unknown_service() {
        let result = FrameCodec::decode(&[0x07, 0x02, 0x00, 0x00, 0x00]);
        assert_matches!(result, Err(WireError::UnknownService { id: 0x07 }));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let result = FrameCodec::decode(&[0x01, 0x02, 0x00, 0x05, 0x00, 0xAA]);
        assert_matches!(
            result,
            Err(WireError::LengthMismatch {
                declared: 5,
                actual: 1,
            })
        );
    }

    #[test]
    fn status_frame_is_not_an_event() {
        let status = Frame::new(Service::Gap, STATUS_OPCODE, vec![0x01]);
        assert!(status.is_status());
        assert!(!status.is_event());
    }

    #[tokio::test]
    async fn read_frame_consumes_exactly_one_frame() {
        let first = Frame::new(Service::Gap, 0x81, vec![0x01, 0x02]);
        let second = Frame::new(Service::Core, 0x03, vec![]);
        let mut stream = Vec::new();
        stream.extend(FrameCodec::encode(&first).expect("first frame should encode"));
        stream.extend(FrameCodec::encode(&second).expect("second frame should encode"));

        let mut reader = stream.as_slice();
        let decoded_first = FrameCodec::read_frame(&mut reader)
            .await
            .expect("first frame should read");
        let decoded_second = FrameCodec::read_frame(&mut reader)
            .await
            .expect("second frame should read");

        assert_eq!(first, decoded_first);
        assert_eq!(second, decoded_second);
    }

    #[tokio::test]
    async fn read_frame_reports_eof_mid_frame() {
        let mut reader: &[u8] = &[0x01, 0x02];
        let result = FrameCodec::read_frame(&mut reader).await;
        assert_matches!(result, Err(FrameReadError::Io(_)));
    }
}
