//! Newline-delimited JSON framing for the ElectrumX protocol.
//!
//! Frame format: one UTF-8 JSON object followed by `\n`.
//! Maximum frame size: 8MB (a full 2016-header chunk is ~330KB of hex).
//!
//! Frames are split as raw bytes; UTF-8 is checked when the JSON is parsed,
//! so a bad frame costs one message rather than the connection.

use serde_json::Value;
use tokio_util::codec::AnyDelimiterCodec;

use crate::network::message::Request;

/// Maximum allowed frame size (8MB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Codec for the receive side. Overlong frames are reported as errors and
/// skipped up to the next newline.
pub fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_FRAME_SIZE)
}

/// Serialize a request into a newline-terminated frame.
pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<Vec<u8>, String> {
    let mut frame = serde_json::to_vec(&Request { id, method, params })
        .map_err(|e| format!("Failed to serialize request: {}", e))?;

    if frame.len() >= MAX_FRAME_SIZE {
        return Err(format!(
            "Request too large: {} bytes (max: {})",
            frame.len(),
            MAX_FRAME_SIZE
        ));
    }

    frame.push(b'\n');
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_frame_is_newline_terminated() {
        let frame = encode_request(1, "server.ping", &serde_json::json!([])).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let huge = Value::String("a".repeat(MAX_FRAME_SIZE));
        assert!(encode_request(1, "blockchain.transaction.broadcast", &huge).is_err());
    }

    #[tokio::test]
    async fn test_codec_splits_lines() {
        let input: &[u8] = b"{\"id\":1,\"result\":1}\n{\"id\":2,\"result\":2}\n";
        let mut framed = FramedRead::new(input, line_codec());
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"{\"id\":1,\"result\":1}");
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"{\"id\":2,\"result\":2}");
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_codec_passes_non_utf8_frames_through() {
        let input: &[u8] = b"\xff\xfe garbage\n{\"id\":1,\"result\":1}\n";
        let mut framed = FramedRead::new(input, line_codec());
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"\xff\xfe garbage");
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"{\"id\":1,\"result\":1}");
    }
}
