/// Shared data structures for the vibe library
///
/// These structs represent the data model that flows between
/// the codecs, the catalog, and callers.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::edit::VibeParams;

/// Schema version written by this build for catalog records
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// A vibe encoding string that is guaranteed to be non-empty
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VibeEncoding(String);

impl VibeEncoding {
    /// Wrap an encoding; returns `None` for an empty or whitespace-only string
    pub fn new(encoding: impl Into<String>) -> Option<Self> {
        let encoding = encoding.into();
        if encoding.trim().is_empty() {
            None
        } else {
            Some(Self(encoding))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VibeEncoding {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VibeEncoding::new(value).ok_or("vibe encoding must not be empty")
    }
}

impl From<VibeEncoding> for String {
    fn from(value: VibeEncoding) -> Self {
        value.0
    }
}

impl fmt::Debug for VibeEncoding {
    // Encodings are long; show a prefix only
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(16).collect();
        write!(f, "VibeEncoding({}.., {} chars)", prefix, self.0.len())
    }
}

/// Where the usable vibe data of a reference comes from
#[derive(Debug, Clone, PartialEq)]
pub enum VibeSource {
    /// An image that still needs the (paid) encode step
    RawImage(Vec<u8>),
    /// Encoding received ready-made from a share string, PNG, or bundle
    PreEncoded(VibeEncoding),
    /// Encoding produced locally from a raw image
    EncodedPayload(VibeEncoding),
}

/// Discriminator of `VibeSource` without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    RawImage,
    PreEncoded,
    EncodedPayload,
}

/// One usable vibe held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct VibeReference {
    pub display_name: String,
    pub source: VibeSource,
    /// 0.0 to 1.0
    pub strength: f64,
    /// 0.0 to 1.0
    pub info_extracted: f64,
    /// Title of the bundle this reference was extracted from
    pub bundle_source: Option<String>,
}

impl VibeReference {
    /// A reference whose encoding arrived already computed
    pub fn pre_encoded(name: impl Into<String>, encoding: VibeEncoding) -> Self {
        Self::with_source(name, VibeSource::PreEncoded(encoding))
    }

    /// A reference that still holds the source image
    pub fn raw_image(name: impl Into<String>, image: Vec<u8>) -> Self {
        Self::with_source(name, VibeSource::RawImage(image))
    }

    fn with_source(name: impl Into<String>, source: VibeSource) -> Self {
        let params = VibeParams::default();
        Self {
            display_name: name.into(),
            source,
            strength: params.strength,
            info_extracted: params.info_extracted,
            bundle_source: None,
        }
    }

    /// Builder-style parameter override
    pub fn with_params(mut self, params: VibeParams) -> Self {
        self.set_params(params);
        self
    }

    pub fn set_params(&mut self, params: VibeParams) {
        let params = params.clamped();
        self.strength = params.strength;
        self.info_extracted = params.info_extracted;
    }

    pub fn params(&self) -> VibeParams {
        VibeParams {
            strength: self.strength,
            info_extracted: self.info_extracted,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self.source {
            VibeSource::RawImage(_) => SourceType::RawImage,
            VibeSource::PreEncoded(_) => SourceType::PreEncoded,
            VibeSource::EncodedPayload(_) => SourceType::EncodedPayload,
        }
    }

    /// The encoding, or `None` while the reference is still a raw image
    pub fn vibe_encoding(&self) -> Option<&VibeEncoding> {
        match &self.source {
            VibeSource::RawImage(_) => None,
            VibeSource::PreEncoded(e) | VibeSource::EncodedPayload(e) => Some(e),
        }
    }

    pub fn raw_image_data(&self) -> Option<&[u8]> {
        match &self.source {
            VibeSource::RawImage(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_encoded(&self) -> bool {
        self.vibe_encoding().is_some()
    }

    /// Finish the encode step: the image buffer is dropped and replaced by
    /// the encoding. A reference that was already encoded keeps its source.
    pub fn complete_encoding(&mut self, encoding: VibeEncoding) {
        if matches!(self.source, VibeSource::RawImage(_)) {
            self.source = VibeSource::EncodedPayload(encoding);
        }
    }
}

/// Persisted catalog record for one saved vibe or bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VibeLibraryEntry {
    pub id: String,
    pub name: String,
    pub schema_version: u32,
    /// Present for single vibes, `None` for bundles
    #[serde(default)]
    pub vibe_encoding: Option<String>,
    pub strength: f64,
    pub info_extracted: f64,
    /// PNG thumbnail bytes
    #[serde(default, with = "b64_opt")]
    pub thumbnail: Option<Vec<u8>>,
    /// blake3 hex of the thumbnail (singles) or of the bundle file (bundles)
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub bundled_vibe_names: Vec<String>,
    #[serde(default, with = "b64_vec")]
    pub bundled_vibe_previews: Vec<Vec<u8>>,
    pub used_count: u32,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl VibeLibraryEntry {
    /// A fresh record for a newly imported vibe (first use already counted)
    pub fn new(name: impl Into<String>, params: VibeParams) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            vibe_encoding: None,
            strength: params.strength,
            info_extracted: params.info_extracted,
            thumbnail: None,
            content_hash: None,
            file_path: None,
            bundle_id: None,
            bundled_vibe_names: Vec::new(),
            bundled_vibe_previews: Vec::new(),
            used_count: 1,
            last_used_at: None,
            created_at: Utc::now(),
            is_favorite: false,
            tags: Vec::new(),
        }
    }

    pub fn is_bundle(&self) -> bool {
        !self.bundled_vibe_names.is_empty()
    }

    pub fn bundled_vibe_count(&self) -> usize {
        self.bundled_vibe_names.len()
    }

    pub fn params(&self) -> VibeParams {
        VibeParams {
            strength: self.strength,
            info_extracted: self.info_extracted,
        }
    }
}

/// serde helper: `Option<Vec<u8>>` as a base64 string
pub(crate) mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// serde helper: `Vec<Vec<u8>>` as a list of base64 strings
pub(crate) mod b64_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(value.iter().map(|bytes| STANDARD.encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let texts: Vec<String> = Vec::deserialize(d)?;
        texts
            .into_iter()
            .map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
            .collect()
    }
}
