use std::io::Write as _;

use flate2::write::GzEncoder;
use flate2::Compression;

/// Responses smaller than this are not worth compressing.
pub const MIN_COMPRESSION_SIZE: usize = 1024;

const COMPRESSIBLE_TYPES: &[&str] = &[
    "text/",
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-javascript",
    "application/ld+json",
    "application/manifest+json",
    "application/vnd.api+json",
];

/// Whether the `Accept-Encoding` value admits gzip, including entries with
/// quality values like `gzip;q=0.8`.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding
        .split(',')
        .any(|encoding| encoding.trim().starts_with("gzip"))
}

fn is_compressible_content_type(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    COMPRESSIBLE_TYPES
        .iter()
        .any(|kind| content_type.contains(kind))
}

/// Gates client-facing compression: the caller must accept gzip, the body
/// must be large enough to benefit, and the content type must be text-like.
pub fn should_compress(accept_encoding: &str, content_type: &str, body_size: usize) -> bool {
    accepts_gzip(accept_encoding)
        && body_size >= MIN_COMPRESSION_SIZE
        && is_compressible_content_type(content_type)
}

pub fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    #[test]
    fn accept_encoding_parsing_handles_quality_values() {
        assert!(accepts_gzip("gzip"));
        assert!(accepts_gzip("deflate, gzip;q=0.8"));
        assert!(accepts_gzip(" gzip , br"));
        assert!(!accepts_gzip("br, deflate"));
        assert!(!accepts_gzip(""));
    }

    #[test]
    fn compression_gates() {
        let big = MIN_COMPRESSION_SIZE;
        assert!(should_compress("gzip", "application/json", big));
        assert!(should_compress("gzip", "text/plain; charset=utf-8", big));
        assert!(!should_compress("gzip", "application/json", big - 1));
        assert!(!should_compress("br", "application/json", big));
        assert!(!should_compress("gzip", "image/png", big));
        assert!(!should_compress("gzip", "application/octet-stream", big));
    }

    #[test]
    fn gzip_round_trips() {
        let payload = vec![b'a'; 4096];
        let compressed = gzip_compress(&payload).expect("compress");
        assert!(compressed.len() < payload.len());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).expect("decompress");
        assert_eq!(decompressed, payload);
    }
}
