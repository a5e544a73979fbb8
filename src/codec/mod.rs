/// Vibe payload codecs
///
/// This module handles:
/// - The share envelope (JSON / Base64 / URL-safe Base64)
/// - Embedding envelopes in PNG files
/// - Multi-vibe bundle files
///
/// Everything here is pure and stateless, so imports can run these
/// concurrently before handing results to the library one at a time.

pub mod bundle;
pub mod envelope;
pub mod png;

pub use bundle::{BundleEntry, BundleItem, BundleReader};
pub use envelope::{
    decode, encode_to_base64, encode_to_json, encode_to_url_safe_base64, is_vibe_encoding, DecodeOptions,
    Envelope, EnvelopeKind,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_png, sunset_envelope};

    #[test]
    fn test_sunset_end_to_end() {
        let png = sample_png(64, 64);
        let envelope = sunset_envelope();

        let embedded = png::embed(&png, &envelope).unwrap();
        let extracted = png::extract(&embedded).unwrap().unwrap();
        assert_eq!(extracted, envelope);
        assert_eq!(extracted.data.name, "Sunset");
        assert_eq!(extracted.data.strength, 0.7);
        assert_eq!(extracted.data.info_extracted, 0.3);

        let reference = extracted.into_reference().unwrap();
        let b64 = encode_to_base64(&reference).unwrap();
        assert!(is_vibe_encoding(&b64));

        let random: String = (0..b64.len())
            .map(|i| (b'a' + ((i * 7 + 3) % 26) as u8) as char)
            .collect();
        assert_eq!(random.len(), b64.len());
        assert!(!is_vibe_encoding(&random));
    }
}
