//! Fixtures shared by unit tests
use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};

use crate::codec::envelope::{Envelope, EnvelopeData, EnvelopeKind, ENVELOPE_VERSION};
use crate::state::data::{VibeEncoding, VibeReference};
use crate::state::edit::VibeParams;

/// A small gradient PNG written by the image crate
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 4) as u8, (y * 4) as u8, 128, 255])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Same as `sample_png` but with a different color so content hashes differ
pub fn other_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, _| Rgba([255, (x * 3) as u8, 0, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn sunset_envelope() -> Envelope {
    Envelope {
        version: ENVELOPE_VERSION,
        kind: EnvelopeKind::Single,
        timestamp: 1_700_000_000_000,
        data: EnvelopeData {
            name: "Sunset".into(),
            strength: 0.7,
            info_extracted: 0.3,
            vibe_encoding: "AQIDBAUGBwgJCgsMDQ4P".into(),
            image_data: None,
        },
    }
}

pub fn reference(name: &str, encoding: &str) -> VibeReference {
    VibeReference::pre_encoded(name, VibeEncoding::new(encoding).unwrap())
        .with_params(VibeParams::new(0.5, 0.8))
}
