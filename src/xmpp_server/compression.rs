//! zlib stream compression (XEP-0138).
//!
//! One codec per connection: both directions are single zlib streams that
//! live as long as the connection. Every outbound write is sync-flushed so
//! the peer can decode it without waiting for more data.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::error::XmppError;

const CHUNK: usize = 8 * 1024;

pub struct ZlibStream {
    inflate: Decompress,
    deflate: Compress,
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStream {
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(true),
            deflate: Compress::new(Compression::default(), true),
        }
    }

    /// Inflate bytes read from the socket.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, XmppError> {
        let mut out = Vec::with_capacity(input.len() * 2 + CHUNK);
        let mut consumed = 0;
        loop {
            if out.capacity() - out.len() < CHUNK {
                out.reserve(CHUNK);
            }
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| XmppError::internal(format!("zlib inflate failed: {}", e)))?;
            let read = (self.inflate.total_in() - before_in) as usize;
            let produced = self.inflate.total_out() - before_out;
            consumed += read;

            match status {
                Status::StreamEnd => break,
                _ if consumed >= input.len() && out.len() < out.capacity() => break,
                _ if read == 0 && produced == 0 => break,
                _ => continue,
            }
        }
        Ok(out)
    }

    /// Deflate bytes for the socket, sync-flushed.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, XmppError> {
        let mut out = Vec::with_capacity(input.len() / 2 + CHUNK);
        let mut consumed = 0;
        loop {
            if out.capacity() - out.len() < CHUNK {
                out.reserve(CHUNK);
            }
            let before_in = self.deflate.total_in();
            self.deflate
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| XmppError::internal(format!("zlib deflate failed: {}", e)))?;
            consumed += (self.deflate.total_in() - before_in) as usize;

            // Output space left over means the flush completed.
            if consumed >= input.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }
}
