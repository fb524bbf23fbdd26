//! Chunked transfer encoding support
//!
//! Encoding of chunked bodies, the chunk-size line grammar, and a one-shot
//! decoder built on the incremental body decoder in [`super::parser`].

use super::parser::{BodyDecoder, BodyProgress};
use super::{Error, Result, CRLF};
use std::io::Write;

/// Upper bound on a single chunk, guards the hex parse against overflow
pub const MAX_CHUNK_SIZE: usize = 1 << 40;

/// Chunked encoder
///
/// Encodes data in HTTP chunked transfer encoding format
pub struct ChunkedEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedEncoder<W> {
    /// Create a new chunked encoder
    pub fn new(writer: W) -> Self {
        ChunkedEncoder { writer }
    }

    /// Write a chunk of data
    ///
    /// Empty input is skipped: a zero-length chunk would end the body.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        write!(self.writer, "{:x}{}", data.len(), CRLF)?;
        self.writer.write_all(data)?;
        self.writer.write_all(CRLF.as_bytes())?;

        Ok(())
    }

    /// Write the final chunk (0-sized chunk)
    pub fn finish(&mut self) -> Result<()> {
        write!(self.writer, "0{}{}", CRLF, CRLF)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Consume the encoder and return the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Parse a chunk-size line (without its CRLF)
///
/// Chunk extensions after `;` are ignored. Anything other than a non-empty
/// run of hex digits is fatal.
pub fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let line = String::from_utf8_lossy(line);
    let size_str = line.split(';').next().unwrap_or_default().trim();

    if size_str.is_empty() || !size_str.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidChunkSize(size_str.to_string()));
    }

    let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;
    if size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidChunkSize(size_str.to_string()));
    }
    Ok(size)
}

/// Decode complete chunked body from bytes
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = BodyDecoder::chunked();
    let mut backlog = bytes::BytesMut::from(input);
    let mut output = Vec::new();

    match decoder.decode(&mut backlog, &mut output, &mut |_| true)? {
        BodyProgress::Complete => Ok(output),
        _ => Err(Error::Incomplete),
    }
}

/// Encode data as chunked body
pub fn encode_chunked_body(data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let mut encoder = ChunkedEncoder::new(Vec::new());

    for chunk in data.chunks(chunk_size.max(1)) {
        encoder.write_chunk(chunk)?;
    }
    encoder.finish()?;

    Ok(encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_multiple_chunks() {
        let mut encoder = ChunkedEncoder::new(Vec::new());

        encoder.write_chunk(b"Hello").unwrap();
        encoder.write_chunk(b"").unwrap();
        encoder.write_chunk(b"World").unwrap();
        encoder.finish().unwrap();

        assert_eq!(encoder.into_inner(), b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n");
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"1a").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"FF").unwrap(), 255);
        assert_eq!(parse_chunk_size(b"5;name=value").unwrap(), 5);
        assert_eq!(parse_chunk_size(b" 10 ").unwrap(), 16);

        assert!(matches!(parse_chunk_size(b"xyz"), Err(Error::InvalidChunkSize(_))));
        assert!(parse_chunk_size(b"").is_err());
        assert!(parse_chunk_size(b"-5").is_err());
        assert!(parse_chunk_size(b"ffffffffffffffffffff").is_err());
    }

    #[test]
    fn test_decode_with_extension() {
        let input = b"5;extension=value\r\nHello\r\n0\r\n\r\n";
        assert_eq!(decode_chunked_body(input).unwrap(), b"Hello");
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            decode_chunked_body(b"5\r\nHel"),
            Err(Error::Incomplete)
        ));
    }

    #[test]
    fn test_encode_then_decode() {
        let data = b"Hello, World!";
        let encoded = encode_chunked_body(data, 5).unwrap();
        assert!(encoded.starts_with(b"5\r\nHello\r\n"));
        assert_eq!(decode_chunked_body(&encoded).unwrap(), data);
    }
}
