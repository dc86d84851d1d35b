//! zlib compression for TUN frames, matching `iodined.c`'s use of
//! `compress2()`/`uncompress()` at level 9.

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;

/// Compress a raw TUN frame (link header + IP packet) at maximum
/// compression, for storage in a user's `outpacket` buffer.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(data, Compression::best());
    let mut out = Vec::with_capacity(data.len());
    encoder
        .read_to_end(&mut out)
        .expect("in-memory zlib compression cannot fail");
    out
}

/// Decompress an assembled upstream datagram back into a raw TUN frame.
/// Returns `None` on malformed/truncated input, mirroring `uncompress()`
/// returning a non-`Z_OK` status in the original.
pub fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let frame = [0u8; 4]
            .iter()
            .chain(b"not really an ip packet but close enough")
            .copied()
            .collect::<Vec<u8>>();
        let compressed = compress(&frame);
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, frame);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decompress(b"not zlib data at all").is_none());
    }
}
