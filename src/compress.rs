// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Deflates a whole buffer into a fresh vector (zlib framing).
pub fn deflate(src: &[u8]) -> Result<Vec<u8>> {
    let mut compress = Compress::new(Compression::best(), true);
    let mut out = Vec::with_capacity(src.len() / 2 + 64);

    loop {
        let consumed = compress.total_in() as usize;

        match compress
            .compress_vec(&src[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|_| Error::Zlib)?
        {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                out.reserve(src.len() / 2 + 64);
            }
        }
    }
}

/// Inflates a whole zlib stream.
///
/// `max_out` bounds the output (the uncompressed payload of a log block never
/// exceeds the block size). Returns the inflated bytes plus the number of
/// *input* bytes consumed, which is the compressed payload's on-disk extent.
pub fn inflate(src: &[u8], max_out: usize) -> Result<(Vec<u8>, usize)> {
    let mut decompress = Decompress::new(true);
    let mut out = Vec::with_capacity(max_out);

    loop {
        let consumed = decompress.total_in() as usize;

        match decompress
            .decompress_vec(&src[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|_| Error::Zlib)?
        {
            Status::StreamEnd => return Ok((out, decompress.total_in() as usize)),
            Status::Ok | Status::BufError => {
                if out.len() >= max_out || consumed >= src.len() {
                    // Neither producing nor consuming anything anymore
                    return Err(Error::Zlib);
                }
            }
        }
    }
}
