use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

/// Incremental gzip compressor for chunked transfer encoding.
///
/// Each `compress()` round feeds a bounded slice of new input and
/// returns the complete compressed output produced for it (a sync
/// flush, or the final flush with the gzip trailer). The returned
/// bytes become exactly one HTTP chunk.
pub struct Deflater {
    enc: GzEncoder<Vec<u8>>,
    finished: bool,
    total_out: u64,
}

impl Deflater {
    pub fn new(level: u32) -> Self {
        Self {
            enc: GzEncoder::new(Vec::new(), Compression::new(level)),
            finished: false,
            total_out: 0,
        }
    }

    /// Compress `input`, finishing the gzip stream when `finish` is
    /// set. Returns the produced output bytes.
    pub fn compress(&mut self, input: &[u8], finish: bool) -> io::Result<Vec<u8>> {
        if self.finished {
            return Ok(Vec::new());
        }

        self.enc.write_all(input)?;
        if finish {
            self.enc.try_finish()?;
            self.finished = true;
        }
        else {
            self.enc.flush()?;
        }

        let out = std::mem::take(self.enc.get_mut());
        self.total_out += out.len() as u64;
        Ok(out)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Compressed bytes produced so far, for the access log ratio.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }
}
