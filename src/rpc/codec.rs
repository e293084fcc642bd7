//! Delimiter framing
//!
//! Accumulates bytes until a delimiter boundary appears, yields each
//! boundary-delimited document and carries any remainder over to the
//! next read. Handles partial reads and multiple pipelined documents per
//! read.

use crate::rpc::DELIMITER;

/// Incremental frame decoder
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete document
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(index) = find_delimiter(&self.buffer) {
            let frame = self.buffer[..index].to_vec();
            self.buffer.drain(..index + DELIMITER.len());
            frames.push(String::from_utf8_lossy(&frame).into_owned());
        }
        frames
    }

    /// Bytes waiting for their delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

/// Append the delimiter to an encoded document
pub fn frame(document: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(document.len() + DELIMITER.len());
    out.extend_from_slice(document.as_bytes());
    out.extend_from_slice(DELIMITER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut codec = FrameCodec::new();
        let frames = codec.push(&frame(r#"{"method":"load"}"#));
        assert_eq!(frames, vec![r#"{"method":"load"}"#.to_string()]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_two_documents_across_three_arbitrary_splits() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(r#"{"id":1}"#));
        stream.extend_from_slice(&frame(r#"{"id":2}"#));

        // split boundaries chosen to cut through a document and through
        // the delimiter itself
        for (a, b) in [(3, 11), (1, stream.len() - 2), (9, 19)] {
            let mut codec = FrameCodec::new();
            let mut frames = Vec::new();
            frames.extend(codec.push(&stream[..a]));
            frames.extend(codec.push(&stream[a..b]));
            frames.extend(codec.push(&stream[b..]));
            assert_eq!(
                frames,
                vec![r#"{"id":1}"#.to_string(), r#"{"id":2}"#.to_string()],
                "splits at {} and {}",
                a,
                b
            );
            assert_eq!(codec.pending(), 0);
        }
    }

    #[test]
    fn test_pipelined_documents_in_one_read() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame("a"));
        stream.extend_from_slice(&frame("b"));
        stream.extend_from_slice(&frame("c"));

        let mut codec = FrameCodec::new();
        let frames = codec.push(&stream);
        assert_eq!(frames, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remainder_carries_over() {
        let mut codec = FrameCodec::new();
        assert!(codec.push(b"{\"id\":1}END").is_empty());
        assert!(codec.pending() > 0);
        let frames = codec.push(b"LOOM\n");
        assert_eq!(frames, vec![r#"{"id":1}"#.to_string()]);
    }

    #[test]
    fn test_empty_chunk_yields_nothing() {
        let mut codec = FrameCodec::new();
        assert!(codec.push(b"").is_empty());
    }
}
