/// PNG container for vibe envelopes
///
/// The envelope JSON lives in a single text chunk with a reserved keyword.
/// Embedding is chunk surgery, not re-encoding: every other chunk (pixels,
/// color profile, other text) is copied through as the exact bytes it was
/// read from, in the same order.
use image::ImageFormat;

use super::envelope::{self, Envelope};
use crate::error::{CodecError, CodecResult};
use crate::state::data::VibeReference;

/// Keyword of the text chunk that carries the envelope
pub const VIBE_KEYWORD: &str = "naiv4vibe";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Largest chunk length the PNG format allows
const MAX_CHUNK_LEN: usize = 0x7FFF_FFFF;

/// One chunk as found in the file
#[derive(Debug, Clone, Copy)]
struct Chunk<'a> {
    kind: [u8; 4],
    data: &'a [u8],
    /// Length, type, data and CRC exactly as stored
    raw: &'a [u8],
}

impl Chunk<'_> {
    fn is(&self, kind: &[u8; 4]) -> bool {
        &self.kind == kind
    }

    fn is_vibe(&self) -> bool {
        (self.is(b"tEXt") || self.is(b"iTXt")) && has_keyword(self.data)
    }
}

/// Parsed chunk stream plus anything found after `IEND`
struct ChunkStream<'a> {
    chunks: Vec<Chunk<'a>>,
    trailing: &'a [u8],
}

/// Embed `envelope` into `png`, replacing an existing vibe chunk if any
pub fn embed(png: &[u8], envelope: &Envelope) -> CodecResult<Vec<u8>> {
    // Fail with a clear error before touching any bytes
    validate_image(png)?;
    let stream = parse_chunks(png)?;

    let json = envelope.to_json()?;
    let vibe_chunk = build_chunk(b"iTXt", &itxt_payload(&json));

    let mut out = Vec::with_capacity(png.len() + vibe_chunk.len());
    out.extend_from_slice(&PNG_SIGNATURE);

    let mut written = false;
    for chunk in &stream.chunks {
        if chunk.is_vibe() {
            // Replace the first in place, drop any duplicates
            if !written {
                out.extend_from_slice(&vibe_chunk);
                written = true;
            }
            continue;
        }
        if chunk.is(b"IEND") && !written {
            out.extend_from_slice(&vibe_chunk);
            written = true;
        }
        out.extend_from_slice(chunk.raw);
    }
    out.extend_from_slice(stream.trailing);

    tracing::debug!(
        input_bytes = png.len(),
        output_bytes = out.len(),
        "embedded vibe chunk"
    );
    Ok(out)
}

/// Read the envelope stored in `png`
///
/// `Ok(None)` means a valid PNG that simply carries no vibe.
pub fn extract(png: &[u8]) -> CodecResult<Option<Envelope>> {
    let stream = parse_chunks(png)?;
    let Some(chunk) = stream.chunks.iter().find(|c| c.is_vibe()) else {
        return Ok(None);
    };

    let text = chunk_text(chunk)?;
    envelope::decode_envelope(&text).map(Some)
}

/// `extract` followed by conversion into a reference
pub fn extract_reference(png: &[u8]) -> CodecResult<Option<VibeReference>> {
    extract(png)?.map(Envelope::into_reference).transpose()
}

/// True if the PNG already carries a vibe chunk
pub fn has_vibe_chunk(png: &[u8]) -> CodecResult<bool> {
    Ok(parse_chunks(png)?.chunks.iter().any(|c| c.is_vibe()))
}

/// Remove every vibe chunk, leaving the rest untouched
pub fn strip(png: &[u8]) -> CodecResult<Vec<u8>> {
    let stream = parse_chunks(png)?;
    let mut out = Vec::with_capacity(png.len());
    out.extend_from_slice(&PNG_SIGNATURE);
    for chunk in stream.chunks.iter().filter(|c| !c.is_vibe()) {
        out.extend_from_slice(chunk.raw);
    }
    out.extend_from_slice(stream.trailing);
    Ok(out)
}

/// Full decode through the image crate (dimensions, CRCs, pixel data)
fn validate_image(png: &[u8]) -> CodecResult<()> {
    image::load_from_memory_with_format(png, ImageFormat::Png)
        .map(|_| ())
        .map_err(|e| CodecError::InvalidImageFormat(e.to_string()))
}

fn parse_chunks(bytes: &[u8]) -> CodecResult<ChunkStream<'_>> {
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..8] != PNG_SIGNATURE {
        return Err(CodecError::InvalidImageFormat("missing PNG signature".into()));
    }

    let mut chunks = Vec::new();
    let mut pos = PNG_SIGNATURE.len();
    loop {
        if bytes.len() - pos < 12 {
            return Err(CodecError::InvalidImageFormat(format!(
                "truncated chunk header at offset {}",
                pos
            )));
        }
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
        if len > MAX_CHUNK_LEN || bytes.len() - pos - 12 < len {
            return Err(CodecError::InvalidImageFormat(format!(
                "chunk at offset {} overruns the file",
                pos
            )));
        }

        let kind = [bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]];
        let data = &bytes[pos + 8..pos + 8 + len];
        let crc_at = pos + 8 + len;
        let stored = u32::from_be_bytes([bytes[crc_at], bytes[crc_at + 1], bytes[crc_at + 2], bytes[crc_at + 3]]);
        if stored != chunk_crc(&kind, data) {
            return Err(CodecError::InvalidImageFormat(format!(
                "CRC mismatch in {} chunk",
                String::from_utf8_lossy(&kind)
            )));
        }

        let chunk = Chunk {
            kind,
            data,
            raw: &bytes[pos..crc_at + 4],
        };
        pos = crc_at + 4;
        chunks.push(chunk);

        if chunk.is(b"IEND") {
            break;
        }
    }

    match chunks.first() {
        Some(ihdr) if ihdr.is(b"IHDR") && ihdr.data.len() == 13 => {
            let width = u32::from_be_bytes([ihdr.data[0], ihdr.data[1], ihdr.data[2], ihdr.data[3]]);
            let height = u32::from_be_bytes([ihdr.data[4], ihdr.data[5], ihdr.data[6], ihdr.data[7]]);
            if width == 0 || height == 0 {
                return Err(CodecError::InvalidImageFormat("zero image dimension".into()));
            }
        }
        _ => return Err(CodecError::InvalidImageFormat("IHDR must come first".into())),
    }
    if !chunks.iter().any(|c| c.is(b"IDAT")) {
        return Err(CodecError::InvalidImageFormat("no image data".into()));
    }

    Ok(ChunkStream {
        chunks,
        trailing: &bytes[pos..],
    })
}

fn chunk_crc(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    hasher.finalize()
}

fn build_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 12);
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(kind);
    buf.extend_from_slice(data);
    buf.extend_from_slice(&chunk_crc(kind, data).to_be_bytes());
    buf
}

fn has_keyword(data: &[u8]) -> bool {
    let kw = VIBE_KEYWORD.as_bytes();
    data.len() > kw.len() && data.starts_with(kw) && data[kw.len()] == 0
}

/// Uncompressed iTXt body: keyword, flags, empty language and translation
fn itxt_payload(text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(VIBE_KEYWORD.len() + 5 + text.len());
    data.extend_from_slice(VIBE_KEYWORD.as_bytes());
    data.push(0); // keyword terminator
    data.push(0); // compression flag
    data.push(0); // compression method
    data.push(0); // language tag terminator
    data.push(0); // translated keyword terminator
    data.extend_from_slice(text.as_bytes());
    data
}

fn chunk_text(chunk: &Chunk<'_>) -> CodecResult<String> {
    let body = &chunk.data[VIBE_KEYWORD.len() + 1..];

    if chunk.is(b"tEXt") {
        // Latin-1
        return Ok(body.iter().map(|&b| b as char).collect());
    }

    let (&flag, rest) = body
        .split_first()
        .ok_or_else(|| CodecError::MalformedEnvelope("truncated iTXt chunk".into()))?;
    if flag != 0 {
        return Err(CodecError::MalformedEnvelope("compressed vibe chunk".into()));
    }
    // compression method, then two NUL-terminated strings
    let rest = rest.get(1..).unwrap_or_default();
    let mut parts = rest.splitn(3, |&b| b == 0);
    let (Some(_lang), Some(_translated), Some(text)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CodecError::MalformedEnvelope("truncated iTXt chunk".into()));
    };
    String::from_utf8(text.to_vec())
        .map_err(|_| CodecError::MalformedEnvelope("iTXt text is not UTF-8".into()))
}
