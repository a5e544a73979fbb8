/// Bundle container: many vibes in one file
///
/// Layout (little-endian):
///
/// ```text
/// "VIBB" | u16 version | u16 reserved | u32 count | u16 title_len | title
/// count x (u64 offset | u32 length | u32 crc32)      offsets are relative to the data section
/// u32 crc32 of everything above
/// data section: count x block
///     u16 name_len | name | u32 preview_len | preview | u32 payload_len | envelope JSON
/// ```
///
/// The index table up front lets a reader seek straight to item `i` without
/// decoding the items before it.
use std::io::{Cursor, Read, Seek, SeekFrom};

use super::envelope::{self, Envelope};
use crate::error::{CodecError, CodecResult};
use crate::state::data::VibeReference;

pub const BUNDLE_MAGIC: [u8; 4] = *b"VIBB";
pub const BUNDLE_FORMAT_VERSION: u16 = 1;

/// Upper bound on items, checked before the index table is allocated
pub const MAX_BUNDLE_ITEMS: u32 = 4096;

const INDEX_ENTRY_LEN: u64 = 16;

/// One item to put into a bundle
#[derive(Debug, Clone, PartialEq)]
pub struct BundleItem {
    pub reference: VibeReference,
    /// Thumbnail bytes shown in pickers; may be empty
    pub preview: Vec<u8>,
}

/// One item read back from a bundle
#[derive(Debug, Clone, PartialEq)]
pub struct BundleEntry {
    pub name: String,
    pub preview: Vec<u8>,
    pub reference: VibeReference,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    len: u32,
    crc: u32,
}

/// Serialize `items` into a bundle titled `title`
pub fn create(title: &str, items: &[BundleItem]) -> CodecResult<Vec<u8>> {
    if items.len() > MAX_BUNDLE_ITEMS as usize {
        return Err(CodecError::InvalidPayload(format!(
            "{} items exceed the bundle limit of {}",
            items.len(),
            MAX_BUNDLE_ITEMS
        )));
    }
    let title_len = u16::try_from(title.len())
        .map_err(|_| CodecError::InvalidPayload("bundle title too long".into()))?;

    let blocks = items.iter().map(encode_block).collect::<CodecResult<Vec<_>>>()?;

    let mut header = Vec::new();
    header.extend_from_slice(&BUNDLE_MAGIC);
    header.extend_from_slice(&BUNDLE_FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&(items.len() as u32).to_le_bytes());
    header.extend_from_slice(&title_len.to_le_bytes());
    header.extend_from_slice(title.as_bytes());

    let mut offset = 0u64;
    for block in &blocks {
        let len = u32::try_from(block.len())
            .map_err(|_| CodecError::InvalidPayload("bundle item too large".into()))?;
        header.extend_from_slice(&offset.to_le_bytes());
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&crc32fast::hash(block).to_le_bytes());
        offset += u64::from(len);
    }

    let header_crc = crc32fast::hash(&header);
    let mut out = Vec::with_capacity(header.len() + 4 + offset as usize);
    out.extend_from_slice(&header);
    out.extend_from_slice(&header_crc.to_le_bytes());
    for block in blocks {
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Number of items, reading only the header
pub fn item_count(bundle: &[u8]) -> CodecResult<usize> {
    Ok(BundleReader::new(Cursor::new(bundle))?.len())
}

/// Reference at `index`, or `None` when out of range
pub fn extract_at(bundle: &[u8], index: usize) -> CodecResult<Option<VibeReference>> {
    BundleReader::new(Cursor::new(bundle))?.read_reference(index)
}

pub fn title(bundle: &[u8]) -> CodecResult<String> {
    Ok(BundleReader::new(Cursor::new(bundle))?.title().to_string())
}

pub fn item_names(bundle: &[u8]) -> CodecResult<Vec<String>> {
    BundleReader::new(Cursor::new(bundle))?.names()
}

pub fn preview_at(bundle: &[u8], index: usize) -> CodecResult<Option<Vec<u8>>> {
    Ok(BundleReader::new(Cursor::new(bundle))?
        .read_item(index)?
        .map(|item| item.preview))
}

/// Every item, in order
pub fn read_all(bundle: &[u8]) -> CodecResult<Vec<BundleEntry>> {
    let mut reader = BundleReader::new(Cursor::new(bundle))?;
    (0..reader.len())
        .filter_map(|i| reader.read_item(i).transpose())
        .collect()
}

/// Random-access reader over any seekable source
pub struct BundleReader<R> {
    reader: R,
    title: String,
    index: Vec<IndexEntry>,
    data_start: u64,
}

impl<R: Read + Seek> BundleReader<R> {
    /// Read and verify the header and index table
    pub fn new(mut reader: R) -> CodecResult<Self> {
        let mut header = Vec::new();

        let magic = read_array::<4, _>(&mut reader, &mut header)?;
        if magic != BUNDLE_MAGIC {
            return Err(CodecError::MalformedBundle("bad magic".into()));
        }
        let version = u16::from_le_bytes(read_array::<2, _>(&mut reader, &mut header)?);
        if version != BUNDLE_FORMAT_VERSION {
            return Err(CodecError::MalformedBundle(format!(
                "unsupported bundle version {}",
                version
            )));
        }
        let _reserved = read_array::<2, _>(&mut reader, &mut header)?;
        let count = u32::from_le_bytes(read_array::<4, _>(&mut reader, &mut header)?);
        if count > MAX_BUNDLE_ITEMS {
            return Err(CodecError::MalformedBundle(format!("{} items is too many", count)));
        }

        let title_len = u16::from_le_bytes(read_array::<2, _>(&mut reader, &mut header)?) as usize;
        let title_bytes = read_vec(&mut reader, title_len, &mut header)?;
        let title = String::from_utf8(title_bytes)
            .map_err(|_| CodecError::MalformedBundle("title is not UTF-8".into()))?;

        let mut index = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = u64::from_le_bytes(read_array::<8, _>(&mut reader, &mut header)?);
            let len = u32::from_le_bytes(read_array::<4, _>(&mut reader, &mut header)?);
            let crc = u32::from_le_bytes(read_array::<4, _>(&mut reader, &mut header)?);
            index.push(IndexEntry { offset, len, crc });
        }

        let stored = u32::from_le_bytes(read_array::<4, _>(&mut reader, &mut Vec::new())?);
        if stored != crc32fast::hash(&header) {
            return Err(CodecError::MalformedBundle("header checksum mismatch".into()));
        }

        let data_start = 4 + 2 + 2 + 4 + 2 + title_len as u64 + u64::from(count) * INDEX_ENTRY_LEN + 4;
        let total = reader.seek(SeekFrom::End(0)).map_err(io_err)?;
        let data_len = total.saturating_sub(data_start);
        for (i, entry) in index.iter().enumerate() {
            let end = entry.offset.checked_add(u64::from(entry.len));
            if end.map_or(true, |end| end > data_len) {
                return Err(CodecError::MalformedBundle(format!("item {} lies outside the file", i)));
            }
        }

        Ok(Self {
            reader,
            title,
            index,
            data_start,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Item `index` with its reference tagged by the bundle title
    pub fn read_item(&mut self, index: usize) -> CodecResult<Option<BundleEntry>> {
        let Some(block) = self.read_block(index)? else {
            return Ok(None);
        };
        let (name, preview, payload) = split_block(&block)?;

        let envelope = envelope::decode_envelope_bytes(payload)?;
        let mut reference = envelope.into_reference()?;
        reference.bundle_source = Some(self.title.clone());

        Ok(Some(BundleEntry {
            name,
            preview: preview.to_vec(),
            reference,
        }))
    }

    pub fn read_reference(&mut self, index: usize) -> CodecResult<Option<VibeReference>> {
        Ok(self.read_item(index)?.map(|item| item.reference))
    }

    /// Item names, reading only the start of each block
    pub fn names(&mut self) -> CodecResult<Vec<String>> {
        let mut names = Vec::with_capacity(self.index.len());
        for i in 0..self.index.len() {
            let entry = self.index[i];
            self.reader
                .seek(SeekFrom::Start(self.data_start + entry.offset))
                .map_err(io_err)?;
            let len = u16::from_le_bytes(read_array::<2, _>(&mut self.reader, &mut Vec::new())?) as usize;
            if len + 2 > entry.len as usize {
                return Err(CodecError::MalformedBundle(format!("item {} name overruns block", i)));
            }
            let bytes = read_vec(&mut self.reader, len, &mut Vec::new())?;
            names.push(
                String::from_utf8(bytes)
                    .map_err(|_| CodecError::MalformedBundle("item name is not UTF-8".into()))?,
            );
        }
        Ok(names)
    }

    fn read_block(&mut self, index: usize) -> CodecResult<Option<Vec<u8>>> {
        let Some(entry) = self.index.get(index).copied() else {
            return Ok(None);
        };
        self.reader
            .seek(SeekFrom::Start(self.data_start + entry.offset))
            .map_err(io_err)?;
        let block = read_vec(&mut self.reader, entry.len as usize, &mut Vec::new())?;
        if crc32fast::hash(&block) != entry.crc {
            return Err(CodecError::MalformedBundle(format!("item {} checksum mismatch", index)));
        }
        Ok(Some(block))
    }
}

fn encode_block(item: &BundleItem) -> CodecResult<Vec<u8>> {
    if !item.reference.is_encoded() {
        return Err(CodecError::InvalidPayload(format!(
            "bundle item {:?} has not been encoded",
            item.reference.display_name
        )));
    }
    let name = item.reference.display_name.as_bytes();
    let name_len = u16::try_from(name.len())
        .map_err(|_| CodecError::InvalidPayload("item name too long".into()))?;
    let preview_len = u32::try_from(item.preview.len())
        .map_err(|_| CodecError::InvalidPayload("preview too large".into()))?;
    let payload = Envelope::from_reference(&item.reference).to_json()?;

    let mut block = Vec::with_capacity(2 + name.len() + 4 + item.preview.len() + 4 + payload.len());
    block.extend_from_slice(&name_len.to_le_bytes());
    block.extend_from_slice(name);
    block.extend_from_slice(&preview_len.to_le_bytes());
    block.extend_from_slice(&item.preview);
    block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    block.extend_from_slice(payload.as_bytes());
    Ok(block)
}

fn split_block(block: &[u8]) -> CodecResult<(String, &[u8], &[u8])> {
    let mut rest = block;
    let name = take_field(&mut rest, 2)?;
    let preview = take_field(&mut rest, 4)?;
    let payload = take_field(&mut rest, 4)?;
    if !rest.is_empty() {
        return Err(CodecError::MalformedBundle("trailing bytes in item".into()));
    }
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| CodecError::MalformedBundle("item name is not UTF-8".into()))?;
    Ok((name, preview, payload))
}

/// Length-prefixed field with a 2- or 4-byte little-endian length
fn take_field<'a>(rest: &mut &'a [u8], width: usize) -> CodecResult<&'a [u8]> {
    if rest.len() < width {
        return Err(CodecError::MalformedBundle("truncated item".into()));
    }
    let (len_bytes, tail) = rest.split_at(width);
    let len = match width {
        2 => u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize,
        _ => u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize,
    };
    if tail.len() < len {
        return Err(CodecError::MalformedBundle("truncated item".into()));
    }
    let (field, tail) = tail.split_at(len);
    *rest = tail;
    Ok(field)
}

fn read_array<const N: usize, R: Read>(reader: &mut R, acc: &mut Vec<u8>) -> CodecResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(io_err)?;
    acc.extend_from_slice(&buf);
    Ok(buf)
}

fn read_vec<R: Read>(reader: &mut R, len: usize, acc: &mut Vec<u8>) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(io_err)?;
    if buf.len() != len {
        return Err(CodecError::MalformedBundle("unexpected end of bundle".into()));
    }
    acc.extend_from_slice(&buf);
    Ok(buf)
}

fn io_err(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::MalformedBundle("unexpected end of bundle".into())
    } else {
        CodecError::MalformedBundle(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::reference;

    fn items() -> Vec<BundleItem> {
        ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| BundleItem {
                reference: reference(name, &format!("ENC{}", name.to_uppercase())),
                preview: vec![i as u8; 10 + i],
            })
            .collect()
    }

    #[test]
    fn test_random_access() {
        let items = items();
        let bundle = create("Pack", &items).unwrap();

        assert_eq!(item_count(&bundle).unwrap(), 3);

        let mut expected = items[1].reference.clone();
        expected.bundle_source = Some("Pack".into());
        assert_eq!(extract_at(&bundle, 1).unwrap(), Some(expected));
        assert_eq!(extract_at(&bundle, 3).unwrap(), None);
        assert_eq!(extract_at(&bundle, usize::MAX).unwrap(), None);
    }

    #[test]
    fn test_names_and_previews_are_parallel() {
        let bundle = create("Pack", &items()).unwrap();
        assert_eq!(title(&bundle).unwrap(), "Pack");
        assert_eq!(item_names(&bundle).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(preview_at(&bundle, 2).unwrap(), Some(vec![2u8; 12]));
        assert_eq!(read_all(&bundle).unwrap().len(), 3);
    }

    #[test]
    fn test_item_read_skips_earlier_blocks() {
        let bundle = create("Pack", &items()).unwrap();
        let data_start = bundle.len()
            - items()
                .iter()
                .map(|i| encode_block(i).unwrap().len())
                .sum::<usize>();

        // damage item 0 only
        let mut damaged = bundle.clone();
        damaged[data_start + 3] ^= 0xFF;

        assert!(extract_at(&damaged, 2).unwrap().is_some());
        assert!(matches!(extract_at(&damaged, 0), Err(CodecError::MalformedBundle(_))));
    }

    #[test]
    fn test_header_damage_detected() {
        let mut bundle = create("Pack", &items()).unwrap();
        bundle[12] ^= 0x01; // inside the title length
        assert!(matches!(item_count(&bundle), Err(CodecError::MalformedBundle(_))));

        assert!(matches!(item_count(b"VIB"), Err(CodecError::MalformedBundle(_))));
        assert!(matches!(item_count(b"PNG!...."), Err(CodecError::MalformedBundle(_))));
    }

    #[test]
    fn test_truncated_bundle_rejected() {
        let bundle = create("Pack", &items()).unwrap();
        let cut = &bundle[..bundle.len() - 5];
        assert!(matches!(item_count(cut), Err(CodecError::MalformedBundle(_))));
    }

    #[test]
    fn test_raw_items_rejected() {
        let raw = BundleItem {
            reference: VibeReference::raw_image("photo", vec![1, 2, 3]),
            preview: Vec::new(),
        };
        assert!(matches!(create("Pack", &[raw]), Err(CodecError::InvalidPayload(_))));
    }

    #[test]
    fn test_empty_bundle() {
        let bundle = create("", &[]).unwrap();
        assert_eq!(item_count(&bundle).unwrap(), 0);
        assert_eq!(extract_at(&bundle, 0).unwrap(), None);
    }
}
