use std::io::{Read as _, Write as _};

use flate2::{
    Compression,
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
};

/// Content-encoding tokens the proxy can produce.
pub const GZIP: &str = "gzip";
pub const DEFLATE: &str = "deflate";
pub const IDENTITY: &str = "identity";

#[derive(Debug)]
pub enum CodecError {
    UnknownEncoding(String),
    NoSupportedEncoding(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEncoding(encoding) => {
                write!(f, "unknown compression `{encoding}`")
            }
            Self::NoSupportedEncoding(accept) => {
                write!(f, "no supported encoding in accept list `{accept}`")
            }
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Decodes `bytes` according to a `Content-Encoding` token. An empty or
/// `identity` encoding returns the input unchanged. Brotli is recognized as a
/// name in the wild but is intentionally not decodable here.
pub fn decompress(encoding: &str, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | IDENTITY => Ok(bytes.to_vec()),
        GZIP => {
            let mut out = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
        DEFLATE => {
            let mut out = Vec::new();
            ZlibDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(CodecError::UnknownEncoding(other.to_owned())),
    }
}

/// Encodes `bytes` into the first encoding the `accept` list supports,
/// preferring gzip over deflate. Returns the chosen `Content-Encoding` token
/// alongside the encoded bytes.
pub fn compress(accept: &str, bytes: &[u8]) -> Result<(Vec<u8>, &'static str), CodecError> {
    let accept_lc = accept.to_ascii_lowercase();
    if accept_lc.contains(GZIP) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes)?;
        return Ok((encoder.finish()?, GZIP));
    }
    if accept_lc.contains(DEFLATE) {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes)?;
        return Ok((encoder.finish()?, DEFLATE));
    }
    Err(CodecError::NoSupportedEncoding(accept.to_owned()))
}
