/// Share encoding for vibe references
///
/// An envelope is the small, versioned JSON document that carries a vibe
/// between users. It comes in three textual forms: plain JSON, standard
/// Base64, and URL-safe Base64 (no padding). Only the values needed to reuse
/// the vibe are written; local paths and catalog ids stay on this machine.
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodecError, CodecResult};
use crate::state::data::{VibeEncoding, VibeReference, VibeSource};
use crate::state::edit::is_unit;

/// Envelope format revision written by this build
pub const ENVELOPE_VERSION: u32 = 1;

/// Inputs at or above this size are rejected before parsing
pub const MAX_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

/// How many Base64 characters `is_vibe_encoding` looks at
const SNIFF_CHARS: usize = 64;

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Envelope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A vibe that already has its encoding
    Single,
    /// An image that still needs encoding; `imageData` carries it
    Raw,
}

impl EnvelopeKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(EnvelopeKind::Single),
            "raw" => Some(EnvelopeKind::Raw),
            _ => None,
        }
    }
}

/// The vibe values inside an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub name: String,
    pub strength: f64,
    pub info_extracted: f64,
    pub vibe_encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
}

/// Versioned share representation of one vibe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Unix milliseconds at encode time
    pub timestamp: i64,
    pub data: EnvelopeData,
}

/// Knobs for decode policy
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Accept envelopes newer than `ENVELOPE_VERSION`
    pub accept_future_versions: bool,
}

impl Envelope {
    /// Build the envelope for a reference, stamped with the current time
    pub fn from_reference(reference: &VibeReference) -> Self {
        let (kind, vibe_encoding, image_data) = match &reference.source {
            VibeSource::RawImage(bytes) => (EnvelopeKind::Raw, String::new(), Some(STANDARD.encode(bytes))),
            VibeSource::PreEncoded(e) | VibeSource::EncodedPayload(e) => {
                (EnvelopeKind::Single, e.as_str().to_string(), None)
            }
        };

        Self {
            version: ENVELOPE_VERSION,
            kind,
            timestamp: Utc::now().timestamp_millis(),
            data: EnvelopeData {
                name: reference.display_name.clone(),
                strength: reference.strength,
                info_extracted: reference.info_extracted,
                vibe_encoding,
                image_data,
            },
        }
    }

    /// Semantic checks; shape is assumed already valid
    pub fn validate(&self, options: &DecodeOptions) -> CodecResult<()> {
        if self.version == 0 {
            return Err(CodecError::InvalidPayload("envelope version 0".into()));
        }
        if self.version > ENVELOPE_VERSION && !options.accept_future_versions {
            return Err(CodecError::InvalidPayload(format!(
                "unsupported envelope version {} (newest known is {})",
                self.version, ENVELOPE_VERSION
            )));
        }
        if !is_unit(self.data.strength) {
            return Err(CodecError::InvalidPayload(format!(
                "strength {} outside 0..=1",
                self.data.strength
            )));
        }
        if !is_unit(self.data.info_extracted) {
            return Err(CodecError::InvalidPayload(format!(
                "infoExtracted {} outside 0..=1",
                self.data.info_extracted
            )));
        }
        match self.kind {
            EnvelopeKind::Single => {
                if self.data.vibe_encoding.trim().is_empty() {
                    return Err(CodecError::InvalidPayload("empty vibeEncoding".into()));
                }
            }
            EnvelopeKind::Raw => match &self.data.image_data {
                Some(data) if !data.is_empty() => {}
                _ => return Err(CodecError::InvalidPayload("raw envelope without imageData".into())),
            },
        }
        Ok(())
    }

    /// Turn a validated envelope into a reference
    pub fn into_reference(self) -> CodecResult<VibeReference> {
        self.validate(&DecodeOptions {
            accept_future_versions: true,
        })?;

        let source = match self.kind {
            EnvelopeKind::Single => {
                let encoding = VibeEncoding::new(self.data.vibe_encoding)
                    .ok_or_else(|| CodecError::InvalidPayload("empty vibeEncoding".into()))?;
                VibeSource::PreEncoded(encoding)
            }
            EnvelopeKind::Raw => {
                let text = self.data.image_data.unwrap_or_default();
                let bytes = STANDARD_LENIENT
                    .decode(text.as_bytes())
                    .map_err(|e| CodecError::InvalidPayload(format!("imageData is not base64: {}", e)))?;
                VibeSource::RawImage(bytes)
            }
        };

        Ok(VibeReference {
            display_name: self.data.name,
            source,
            strength: self.data.strength,
            info_extracted: self.data.info_extracted,
            bundle_source: None,
        })
    }

    pub fn to_json(&self) -> CodecResult<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| CodecError::InvalidPayload(format!("could not serialize envelope: {}", e)))?;
        check_size(json.len())?;
        Ok(json)
    }
}

/// Encode a reference as envelope JSON
pub fn encode_to_json(reference: &VibeReference) -> CodecResult<String> {
    Envelope::from_reference(reference).to_json()
}

/// Encode a reference as standard (padded) Base64 of the envelope JSON
pub fn encode_to_base64(reference: &VibeReference) -> CodecResult<String> {
    let json = encode_to_json(reference)?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Encode a reference as URL-safe Base64 without padding
pub fn encode_to_url_safe_base64(reference: &VibeReference) -> CodecResult<String> {
    let json = encode_to_json(reference)?;
    Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
}

/// Decode any of the three share forms into a reference
pub fn decode(input: &str) -> CodecResult<VibeReference> {
    decode_with(input, &DecodeOptions::default())
}

pub fn decode_with(input: &str, options: &DecodeOptions) -> CodecResult<VibeReference> {
    decode_envelope_with(input, options)?.into_reference()
}

/// Decode into the envelope itself
pub fn decode_envelope(input: &str) -> CodecResult<Envelope> {
    decode_envelope_with(input, &DecodeOptions::default())
}

/// Decode an envelope from file bytes (JSON or Base64 text)
pub fn decode_envelope_bytes(bytes: &[u8]) -> CodecResult<Envelope> {
    check_size(bytes.len())?;
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::MalformedEnvelope("envelope is not UTF-8 text".into()))?;
    decode_envelope(text)
}

pub fn decode_envelope_with(input: &str, options: &DecodeOptions) -> CodecResult<Envelope> {
    // 1. size guard, before anything looks at the content
    check_size(input.len())?;

    // 2. structure
    let json = to_json_bytes(input)?;
    let value: Value = serde_json::from_slice(&json)
        .map_err(|e| CodecError::MalformedEnvelope(format!("not JSON: {}", e)))?;
    check_shape(&value)?;

    // 3. semantics
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if EnvelopeKind::parse(kind).is_none() {
        return Err(CodecError::InvalidPayload(format!("unknown envelope type {:?}", kind)));
    }
    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
    envelope.validate(options)?;
    Ok(envelope)
}

/// Cheap probe: does this string look like a supported envelope?
///
/// Decodes at most a short prefix and never fails loudly.
pub fn is_vibe_encoding(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.len() >= MAX_PAYLOAD_BYTES {
        return false;
    }

    if trimmed.starts_with('{') {
        let end = trimmed
            .char_indices()
            .nth(SNIFF_CHARS * 2)
            .map(|(i, _)| i)
            .unwrap_or(trimmed.len());
        return looks_like_envelope_json(trimmed[..end].as_bytes());
    }

    // Line-wrapped Base64 is still Base64
    let mut prefix: Vec<u8> = trimmed
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .take(SNIFF_CHARS)
        .collect();
    prefix.truncate(prefix.len() / 4 * 4);
    if prefix.len() < 8 {
        return false;
    }
    if !prefix.iter().all(|b| is_base64_char(*b)) {
        return false;
    }

    let engine = if prefix.iter().any(|b| *b == b'-' || *b == b'_') {
        &URL_SAFE_LENIENT
    } else {
        &STANDARD_LENIENT
    };
    match engine.decode(&prefix) {
        Ok(decoded) => looks_like_envelope_json(&decoded),
        Err(_) => false,
    }
}

fn looks_like_envelope_json(prefix: &[u8]) -> bool {
    let text = String::from_utf8_lossy(prefix);
    let text = text.trim_start();
    text.starts_with('{') && text.contains("\"version\"")
}

fn is_base64_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_' | b'=')
}

pub(crate) fn check_size(len: usize) -> CodecResult<()> {
    if len >= MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// JSON text as-is, otherwise Base64 (standard or URL-safe, padding optional)
fn to_json_bytes(input: &str) -> CodecResult<Vec<u8>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CodecError::MalformedEnvelope("empty input".into()));
    }
    if trimmed.starts_with('{') {
        return Ok(trimmed.as_bytes().to_vec());
    }

    // Shared strings often get wrapped by chat clients
    let compact: Vec<u8> = trimmed
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    STANDARD_LENIENT
        .decode(&compact)
        .or_else(|_| URL_SAFE_LENIENT.decode(&compact))
        .map_err(|_| CodecError::MalformedEnvelope("neither JSON nor Base64".into()))
}

fn check_shape(value: &Value) -> CodecResult<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| CodecError::MalformedEnvelope("envelope is not an object".into()))?;

    require(obj, "version", "an unsigned integer", Value::is_u64)?;
    require(obj, "type", "a string", Value::is_string)?;
    require(obj, "timestamp", "an integer", |v| v.is_i64() || v.is_u64())?;
    let data = require(obj, "data", "an object", Value::is_object)?;

    let data = data.as_object().ok_or_else(|| CodecError::MalformedEnvelope("data".into()))?;
    require(data, "name", "a string", Value::is_string)?;
    require(data, "strength", "a number", Value::is_number)?;
    require(data, "infoExtracted", "a number", Value::is_number)?;
    require(data, "vibeEncoding", "a string", Value::is_string)?;
    if let Some(image) = data.get("imageData") {
        if !image.is_string() && !image.is_null() {
            return Err(CodecError::MalformedEnvelope("imageData must be a string".into()));
        }
    }
    Ok(())
}

fn require<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &str,
    expected: &str,
    check: impl Fn(&Value) -> bool,
) -> CodecResult<&'a Value> {
    match obj.get(field) {
        Some(v) if check(v) => Ok(v),
        Some(_) => Err(CodecError::MalformedEnvelope(format!("{} must be {}", field, expected))),
        None => Err(CodecError::MalformedEnvelope(format!("missing field {}", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::edit::VibeParams;

    fn sunset() -> VibeReference {
        VibeReference::pre_encoded("Sunset", VibeEncoding::new("AQIDBAUGBwgJ").unwrap())
            .with_params(VibeParams::new(0.7, 0.3))
    }

    /// Deterministic filler, same alphabet as Base64 output
    fn noise(len: usize) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ALPHABET[(state >> 58) as usize] as char
            })
            .collect()
    }

    #[test]
    fn test_all_three_forms_decode() {
        let vibe = sunset();
        for text in [
            encode_to_json(&vibe).unwrap(),
            encode_to_base64(&vibe).unwrap(),
            encode_to_url_safe_base64(&vibe).unwrap(),
        ] {
            let decoded = decode(&text).unwrap();
            assert_eq!(decoded, vibe);
        }
    }

    #[test]
    fn test_json_has_no_local_data() {
        let mut vibe = sunset();
        vibe.bundle_source = Some("/home/me/bundles/pack".into());
        let json = encode_to_json(&vibe).unwrap();
        assert!(!json.contains("/home/me"));
        assert!(json.contains("\"infoExtracted\":0.3"));
        assert!(json.contains("\"type\":\"single\""));
    }

    #[test]
    fn test_size_guard_runs_first() {
        let huge = "{".repeat(MAX_PAYLOAD_BYTES);
        assert_eq!(
            decode(&huge),
            Err(CodecError::PayloadTooLarge {
                size: MAX_PAYLOAD_BYTES,
                limit: MAX_PAYLOAD_BYTES
            })
        );
        // garbage that would otherwise be malformed
        let junk = "!".repeat(MAX_PAYLOAD_BYTES + 10);
        assert!(matches!(decode(&junk), Err(CodecError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_shape_errors_are_malformed() {
        assert!(matches!(decode("not a vibe"), Err(CodecError::MalformedEnvelope(_))));
        assert!(matches!(decode("{\"version\":1}"), Err(CodecError::MalformedEnvelope(_))));
        let wrong_type = r#"{"version":1,"type":"single","timestamp":1,"data":{"name":"a","strength":"high","infoExtracted":0.5,"vibeEncoding":"x"}}"#;
        assert!(matches!(decode(wrong_type), Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_semantic_errors_are_invalid_payload() {
        let empty = r#"{"version":1,"type":"single","timestamp":1,"data":{"name":"a","strength":0.5,"infoExtracted":0.5,"vibeEncoding":""}}"#;
        assert!(matches!(decode(empty), Err(CodecError::InvalidPayload(_))));

        let range = r#"{"version":1,"type":"single","timestamp":1,"data":{"name":"a","strength":4.0,"infoExtracted":0.5,"vibeEncoding":"x"}}"#;
        assert!(matches!(decode(range), Err(CodecError::InvalidPayload(_))));

        let kind = r#"{"version":1,"type":"mystery","timestamp":1,"data":{"name":"a","strength":0.5,"infoExtracted":0.5,"vibeEncoding":"x"}}"#;
        assert!(matches!(decode(kind), Err(CodecError::InvalidPayload(_))));
    }

    #[test]
    fn test_future_version_policy() {
        let future = r#"{"version":9,"type":"single","timestamp":1,"data":{"name":"a","strength":0.5,"infoExtracted":0.5,"vibeEncoding":"x"}}"#;
        assert!(matches!(decode(future), Err(CodecError::InvalidPayload(_))));

        let options = DecodeOptions {
            accept_future_versions: true,
        };
        let vibe = decode_with(future, &options).unwrap();
        assert_eq!(vibe.display_name, "a");
    }

    #[test]
    fn test_raw_envelope_round_trip() {
        let vibe = VibeReference::raw_image("photo", vec![0x89, b'P', b'N', b'G']);
        let json = encode_to_json(&vibe).unwrap();
        assert!(json.contains("\"type\":\"raw\""));
        let decoded = decode(&json).unwrap();
        assert_eq!(decoded.raw_image_data(), Some(&[0x89, b'P', b'N', b'G'][..]));
    }

    #[test]
    fn test_wrapped_base64_still_decodes() {
        let b64 = encode_to_base64(&sunset()).unwrap();
        let wrapped: String = b64
            .as_bytes()
            .chunks(20)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(decode(&wrapped).unwrap().display_name, "Sunset");
        assert!(is_vibe_encoding(&wrapped));
        assert!(is_vibe_encoding(&wrapped.replace('\n', "\r\n")));
    }

    #[test]
    fn test_is_vibe_encoding() {
        let vibe = sunset();
        let b64 = encode_to_base64(&vibe).unwrap();
        assert!(is_vibe_encoding(&b64));
        assert!(is_vibe_encoding(&encode_to_url_safe_base64(&vibe).unwrap()));
        assert!(is_vibe_encoding(&encode_to_json(&vibe).unwrap()));

        assert!(!is_vibe_encoding(&noise(b64.len())));
        assert!(!is_vibe_encoding(""));
        assert!(!is_vibe_encoding("hello world"));
        assert!(!is_vibe_encoding("ÿÿÿÿÿÿÿÿÿÿÿÿ"));
    }
}
