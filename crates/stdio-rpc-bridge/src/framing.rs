//! Newline-delimited JSON-RPC framing.
//!
//! One scan of the underlying reader produces at most one [`Frame`]; there
//! is no buffering semantics beyond that. Built on `AsyncBufReadExt` the way
//! a `BufReader::lines()` loop over a child's stdout normally is, generalised
//! here to enforce a maximum line length instead of trusting
//! `AsyncBufReadExt::lines` (which has no cap).

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::frame::Frame;

/// Default cap on a single framed line, matching the "at least 10 MiB"
/// requirement.
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("line exceeded the {limit} byte cap")]
    TooLarge { limit: usize },
    #[error("malformed JSON-RPC frame: {0}")]
    Json(#[source] serde_json::Error),
    #[error("underlying stream error: {0}")]
    Io(#[source] std::io::Error),
}

/// The outcome of one scan over the byte stream.
pub enum ScanOutcome {
    /// End of stream: the child closed stdout.
    Eof,
    /// A blank line was skipped; callers should scan again.
    Empty,
    /// A line was read and decoded successfully.
    Frame(Frame),
    /// A line was read but failed to decode. The pump logs this and keeps
    /// scanning; it is never fatal.
    Decode(DecodeError),
}

/// Reads one line from `reader` (a line is a single frame) and decodes it.
/// Enforces `max_line_bytes` by reading in a bounded loop rather than
/// trusting the underlying reader to stop on its own. Returns the raw byte
/// count read alongside the outcome, so callers can account bytes against a
/// received-bytes counter even on decode failure.
pub async fn scan_frame<R>(reader: &mut R, max_line_bytes: usize) -> (usize, ScanOutcome)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return (line.len(), ScanOutcome::Eof),
            Ok(_) => {
                let bytes_read = line.len();
                if line.len() > max_line_bytes {
                    // Drain is unnecessary: read_until already stopped at
                    // the first newline or EOF, so `line` holds exactly one
                    // logical line.
                    return (
                        bytes_read,
                        ScanOutcome::Decode(DecodeError::TooLarge {
                            limit: max_line_bytes,
                        }),
                    );
                }
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    return (bytes_read, ScanOutcome::Empty);
                }
                let outcome = match serde_json::from_slice::<Frame>(&line) {
                    Ok(frame) => ScanOutcome::Frame(frame),
                    Err(err) => ScanOutcome::Decode(DecodeError::Json(err)),
                };
                return (bytes_read, outcome);
            }
            Err(err) => return (line.len(), ScanOutcome::Decode(DecodeError::Io(err))),
        }
    }
}

/// Encodes a frame as canonical JSON followed by a single `\n`.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RequestId;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn skips_empty_lines() {
        let data = b"\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n".to_vec();
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(
            scan_frame(&mut reader, DEFAULT_MAX_LINE_BYTES).await.1,
            ScanOutcome::Empty
        ));
        assert!(matches!(
            scan_frame(&mut reader, DEFAULT_MAX_LINE_BYTES).await.1,
            ScanOutcome::Empty
        ));
        match scan_frame(&mut reader, DEFAULT_MAX_LINE_BYTES).await.1 {
            ScanOutcome::Frame(frame) => assert_eq!(frame.id, Some(RequestId::Number(1))),
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn oversize_line_is_recoverable_not_fatal() {
        let mut data = vec![b'{'];
        data.extend(std::iter::repeat(b' ').take(32));
        data.push(b'\n');
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(
            scan_frame(&mut reader, 8).await.1,
            ScanOutcome::Decode(DecodeError::TooLarge { limit: 8 })
        ));
    }

    #[tokio::test]
    async fn malformed_json_is_recoverable() {
        let data = b"not json\n".to_vec();
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(
            scan_frame(&mut reader, DEFAULT_MAX_LINE_BYTES).await.1,
            ScanOutcome::Decode(DecodeError::Json(_))
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::success(RequestId::Str("abc".into()), serde_json::json!({"ok": true}));
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(*encoded.last().unwrap(), b'\n');
        let decoded: Frame = serde_json::from_slice(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(decoded.id, frame.id);
    }
}
