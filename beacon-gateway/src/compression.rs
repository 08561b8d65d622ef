//! zlib-stream decompression.
//!
//! The gateway compresses traffic as one continuous zlib stream: every
//! logical payload ends with the SYNC_FLUSH suffix `00 00 FF FF`, and the
//! dictionary built up by earlier frames is needed to inflate later ones.
//! One [`ZlibInflater`] therefore lives for the whole connection and is
//! discarded only when a new socket is opened.

use flate2::{Decompress, FlushDecompress, Status};

/// Suffix marking the end of a complete compressed payload.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Streaming inflater shared across the frames of one connection.
pub struct ZlibInflater {
    /// Compressed input accumulated until the suffix arrives.
    input: Vec<u8>,
    /// Reused output buffer.
    output: Vec<u8>,
    inflater: Decompress,
}

impl ZlibInflater {
    pub fn new() -> Self {
        Self {
            input: Vec::with_capacity(8 * 1024),
            output: Vec::with_capacity(32 * 1024),
            // The gateway sends a zlib header on the first frame.
            inflater: Decompress::new(true),
        }
    }

    /// Feed one binary frame. Returns the inflated payload once a frame
    /// ending in the SYNC_FLUSH suffix completes it, `None` while a logical
    /// payload is still split across frames.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<&[u8]>, std::io::Error> {
        self.input.extend_from_slice(data);
        if self.input.len() < 4 || self.input[self.input.len() - 4..] != ZLIB_SUFFIX {
            return Ok(None);
        }
        self.inflate_pending()?;
        self.input.clear();
        Ok(Some(&self.output))
    }

    fn inflate_pending(&mut self) -> Result<(), std::io::Error> {
        self.output.clear();
        let mut consumed_total = 0usize;

        loop {
            if self.output.len() == self.output.capacity() {
                self.output.reserve(32 * 1024);
            }
            let filled = self.output.len();
            let capacity = self.output.capacity();
            self.output.resize(capacity, 0);

            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = self
                .inflater
                .decompress(
                    &self.input[consumed_total..],
                    &mut self.output[filled..],
                    FlushDecompress::Sync,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            consumed_total += (self.inflater.total_in() - before_in) as usize;
            let written = (self.inflater.total_out() - before_out) as usize;
            self.output.truncate(filled + written);

            match status {
                Status::Ok if consumed_total >= self.input.len() => break,
                Status::Ok | Status::BufError => continue,
                Status::StreamEnd => break,
            }
        }
        Ok(())
    }
}

impl Default for ZlibInflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, FlushCompress};

    /// Compress payloads the way the gateway does: one shared deflate
    /// context, each payload flushed with SYNC so it ends in `00 00 FF FF`.
    struct StreamCompressor(Compress);

    impl StreamCompressor {
        fn new() -> Self {
            Self(Compress::new(flate2::Compression::default(), true))
        }

        fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            let mut consumed = 0usize;
            loop {
                out.reserve(1024);
                let before_in = self.0.total_in();
                self.0
                    .compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)
                    .unwrap();
                consumed += (self.0.total_in() - before_in) as usize;
                if consumed >= payload.len() && out.ends_with(&ZLIB_SUFFIX) {
                    break;
                }
            }
            out
        }
    }

    #[test]
    fn test_shared_context_across_frames() {
        let msg1 = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let msg2 = br#"{"t":"READY","s":1,"op":0,"d":{"v":9}}"#;

        let mut compressor = StreamCompressor::new();
        let frame1 = compressor.frame(msg1);
        let frame2 = compressor.frame(msg2);

        let mut inflater = ZlibInflater::new();
        let out1 = inflater.push(&frame1).unwrap().unwrap().to_vec();
        assert_eq!(out1, msg1);
        let out2 = inflater.push(&frame2).unwrap().unwrap().to_vec();
        assert_eq!(out2, msg2);
    }

    #[test]
    fn test_payload_split_across_frames() {
        let msg = br#"{"op":11}"#;
        let mut compressor = StreamCompressor::new();
        let frame = compressor.frame(msg);

        let mut inflater = ZlibInflater::new();
        let (head, tail) = frame.split_at(frame.len() / 2);
        assert!(inflater.push(head).unwrap().is_none());
        let out = inflater.push(tail).unwrap().unwrap().to_vec();
        assert_eq!(out, msg);
    }

    #[test]
    fn test_concatenation_matches_per_payload_decode() {
        // Inflating a frame sequence payload by payload yields exactly the
        // concatenation of the logical payloads.
        let payloads: Vec<Vec<u8>> = (0..16)
            .map(|i| format!(r#"{{"op":0,"s":{i},"d":{{"n":{i}}}}}"#).into_bytes())
            .collect();

        let mut compressor = StreamCompressor::new();
        let mut inflater = ZlibInflater::new();
        let mut decoded = Vec::new();
        for payload in &payloads {
            let frame = compressor.frame(payload);
            decoded.extend_from_slice(inflater.push(&frame).unwrap().unwrap());
        }
        let expected: Vec<u8> = payloads.concat();
        assert_eq!(decoded, expected);
    }
}
