//! Owned generation images with bounds-checked item access.

use genstore_types::GenId;

use super::{DESCRIPTOR_SIZE, Descriptor, GenHeader, HEADER_SIZE, ITEM_ALIGN};
use crate::error::{Error, Result};

/// A generation's byte image together with its decoded header.
///
/// Every item access goes through an offset check: offsets must be aligned,
/// lie past the header and leave room for the descriptor and payload inside
/// the used part of the image. A bad offset yields [`Error::Corrupted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenImage {
    header: GenHeader,
    bytes: Vec<u8>,
}

impl GenImage {
    /// Wraps raw bytes read from disk or memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the header does not decode or the
    /// buffer is shorter than the header says it should be.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let header = GenHeader::decode(&bytes)?;
        if header.is_compacted() {
            if header.compact_size_bytes < header.data_start()
                || header.compact_size_bytes > header.mem_size_bytes
                || header.compact_size_bytes > bytes.len() as u64
            {
                return Err(Error::corrupted(format!(
                    "generation {}: compact size {} disagrees with image length {}",
                    header.gen_id,
                    header.compact_size_bytes,
                    bytes.len()
                )));
            }
        } else if (bytes.len() as u64) < header.mem_size_bytes {
            return Err(Error::corrupted(format!(
                "generation {}: image length {} below memory size {}",
                header.gen_id,
                bytes.len(),
                header.mem_size_bytes
            )));
        }
        Ok(Self { header, bytes })
    }

    /// Pairs an already-encoded buffer with its header.
    pub(crate) fn from_parts(header: GenHeader, bytes: Vec<u8>) -> Self {
        Self { header, bytes }
    }

    /// Decoded header.
    #[inline]
    pub fn header(&self) -> &GenHeader {
        &self.header
    }

    /// Generation id.
    #[inline]
    pub fn gen_id(&self) -> GenId {
        self.header.gen_id
    }

    /// Returns `true` when the image is compacted.
    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.header.is_compacted()
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the image, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Buffer length, including any block padding.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` for an empty buffer (never the case for a decoded image).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes holding header and items.
    pub fn used_len(&self) -> usize {
        if self.header.is_compacted() {
            self.header.compact_size_bytes as usize
        } else {
            self.header.mem_size_bytes as usize
        }
    }

    /// Replaces the header and re-encodes it into the image.
    pub fn set_header(&mut self, header: GenHeader) {
        header.encode(&mut self.bytes[..HEADER_SIZE]);
        self.header = header;
    }

    fn check_item(&self, offset: u64) -> Result<usize> {
        let at = usize::try_from(offset)
            .map_err(|_| Error::corrupted(format!("offset {offset:#x} out of range")))?;
        if at % ITEM_ALIGN != 0
            || (at as u64) < self.header.data_start()
            || at + DESCRIPTOR_SIZE > self.used_len()
        {
            return Err(Error::corrupted(format!(
                "generation {}: no item at offset {offset:#x}",
                self.header.gen_id
            )));
        }
        Ok(at)
    }

    /// Descriptor of the item at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `offset` cannot hold an item.
    pub fn descriptor(&self, offset: u64) -> Result<Descriptor> {
        let at = self.check_item(offset)?;
        Descriptor::decode(&self.bytes[at..at + DESCRIPTOR_SIZE])
    }

    /// Overwrites the descriptor at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `offset` cannot hold an item.
    pub fn set_descriptor(&mut self, offset: u64, desc: &Descriptor) -> Result<()> {
        let at = self.check_item(offset)?;
        desc.encode(&mut self.bytes[at..at + DESCRIPTOR_SIZE]);
        Ok(())
    }

    fn payload_range(&self, offset: u64) -> Result<(usize, usize)> {
        let desc = self.descriptor(offset)?;
        let start = offset as usize + DESCRIPTOR_SIZE;
        let end = start + desc.data_length as usize;
        if end > self.used_len() {
            return Err(Error::corrupted(format!(
                "generation {}: item at {offset:#x} overruns the image",
                self.header.gen_id
            )));
        }
        if !self.header.is_compacted() {
            let pool = self.header.pools.get(desc.pool_id as usize);
            let fits = pool.is_some_and(|p| {
                p.granule_at(offset).is_some()
                    && DESCRIPTOR_SIZE + desc.data_length as usize <= p.granule_size as usize
            });
            if !fits {
                return Err(Error::corrupted(format!(
                    "generation {}: item at {offset:#x} does not fit its granule",
                    self.header.gen_id
                )));
            }
        }
        Ok((start, end))
    }

    /// Payload of the item at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the claimed length leaves the granule
    /// (expanded image) or the used image (compacted image).
    pub fn payload(&self, offset: u64) -> Result<&[u8]> {
        let (start, end) = self.payload_range(offset)?;
        Ok(&self.bytes[start..end])
    }

    /// Mutable payload of the item at `offset`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::payload`].
    pub fn payload_mut(&mut self, offset: u64) -> Result<&mut [u8]> {
        let (start, end) = self.payload_range(offset)?;
        Ok(&mut self.bytes[start..end])
    }

    /// Writes a descriptor and its payload at `offset`.
    ///
    /// `desc.data_length` is set from `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the item does not fit.
    pub fn write_item(&mut self, offset: u64, desc: &Descriptor, payload: &[u8]) -> Result<()> {
        let mut desc = *desc;
        desc.data_length = payload.len() as u32;
        let at = self.check_item(offset)?;
        let end = at + DESCRIPTOR_SIZE + payload.len();
        if end > self.used_len() {
            return Err(Error::corrupted(format!(
                "generation {}: item at {offset:#x} overruns the image",
                self.header.gen_id
            )));
        }
        desc.encode(&mut self.bytes[at..at + DESCRIPTOR_SIZE]);
        self.bytes[at + DESCRIPTOR_SIZE..end].copy_from_slice(payload);
        Ok(())
    }

    /// Canonical (expanded) offset of an item from its descriptor coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the pool or granule index is out of range.
    pub fn canonical_offset(&self, desc: &Descriptor) -> Result<u64> {
        let pool = self.header.pools.get(desc.pool_id as usize).ok_or_else(|| {
            Error::corrupted(format!("generation {}: bad pool {}", self.header.gen_id, desc.pool_id))
        })?;
        if desc.granule_index >= pool.granule_count {
            return Err(Error::corrupted(format!(
                "generation {}: granule {} beyond pool {}",
                self.header.gen_id, desc.granule_index, desc.pool_id
            )));
        }
        Ok(pool.granule_offset(desc.granule_index))
    }

    /// Canonical granule offsets of every pool, in ascending order.
    pub fn granule_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.header
            .pools
            .iter()
            .flat_map(|p| (0..p.granule_count).map(move |i| p.granule_offset(i)))
    }

    /// Walks the items of a compacted image in image order.
    pub fn compacted_items(&self) -> CompactedItems<'_> {
        CompactedItems { image: self, at: self.header.data_start(), failed: false }
    }

    /// For a compacted image, the item following `at` if it continues the chain
    /// of `desc`.
    ///
    /// The chain continues when `desc` links to a same-generation handle whose
    /// canonical offset equals that of the next item in image order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the next item cannot be decoded.
    pub fn compacted_chain_next(
        &self,
        at: u64,
        desc: &Descriptor,
    ) -> Result<Option<(u64, Descriptor)>> {
        let link = desc.next_handle;
        if link.is_end() || link.gen_id() != self.header.gen_id {
            return Ok(None);
        }
        let next_at = at + desc.footprint() as u64;
        if next_at + DESCRIPTOR_SIZE as u64 > self.header.compact_size_bytes {
            return Ok(None);
        }
        let next = self.descriptor(next_at)?;
        match self.canonical_offset(&next) {
            Ok(canonical) if canonical == link.offset() => Ok(Some((next_at, next))),
            _ => Ok(None),
        }
    }
}

/// Iterator over `(image_offset, descriptor)` of a compacted image.
pub struct CompactedItems<'a> {
    image: &'a GenImage,
    at: u64,
    failed: bool,
}

impl Iterator for CompactedItems<'_> {
    type Item = Result<(u64, Descriptor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.at + DESCRIPTOR_SIZE as u64 > self.image.header.compact_size_bytes {
            return None;
        }
        let at = self.at;
        match self.image.descriptor(at) {
            Ok(desc) => {
                let next = at + desc.footprint() as u64;
                if next > self.image.header.compact_size_bytes {
                    self.failed = true;
                    return Some(Err(Error::corrupted(format!(
                        "generation {}: compacted item at {at:#x} overruns compact size",
                        self.image.gen_id()
                    ))));
                }
                self.at = next;
                Some(Ok((at, desc)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

const ABSENT: u64 = 0;

/// Granule index of a compacted image: canonical granule to image offset.
///
/// Built lazily when a handle into a compacted generation must be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenMap {
    pools: Vec<Vec<u64>>,
}

impl GenMap {
    /// Builds the map for a compacted image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for an expanded image and
    /// [`Error::Corrupted`] if an item names a granule outside its pool.
    pub fn build(image: &GenImage) -> Result<Self> {
        if !image.is_compacted() {
            return Err(Error::bad_parameter("generation map requires a compacted image"));
        }
        let mut pools: Vec<Vec<u64>> = image
            .header()
            .pools
            .iter()
            .map(|p| vec![ABSENT; p.granule_count as usize])
            .collect();
        for item in image.compacted_items() {
            let (at, desc) = item?;
            image.canonical_offset(&desc)?;
            pools[desc.pool_id as usize][desc.granule_index as usize] = at;
        }
        Ok(Self { pools })
    }

    /// Image offset of the item whose canonical offset is `canonical`.
    pub fn resolve(&self, header: &GenHeader, canonical: u64) -> Option<u64> {
        let (pool, index) = header.locate(canonical)?;
        let at = *self.pools.get(pool)?.get(index as usize)?;
        (at != ABSENT).then_some(at)
    }

    /// Memory held by the map.
    pub fn byte_size(&self) -> u64 {
        self.pools.iter().map(|p| (p.len() * std::mem::size_of::<u64>()) as u64).sum()
    }

    /// Bytes a map for `header` would need.
    pub fn byte_size_for(header: &GenHeader) -> u64 {
        header.granule_count() * std::mem::size_of::<u64>() as u64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use genstore_types::Handle;

    use super::*;
    use crate::layout::{DataType, GenerationBuilder};

    fn image() -> GenImage {
        GenerationBuilder::new(GenId(5)).pool(64, 8).pool(256, 2).build().unwrap()
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let img = image();
        let again = GenImage::from_bytes(img.as_bytes().to_vec()).unwrap();
        assert_eq!(again, img);
    }

    #[test]
    fn test_from_bytes_rejects_short_buffer() {
        let img = image();
        let mut bytes = img.into_bytes();
        bytes.truncate(bytes.len() - 8);
        assert!(GenImage::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_descriptor_bounds() {
        let img = image();
        assert!(img.descriptor(img.header().data_start()).is_ok());
        // misaligned
        assert!(img.descriptor(img.header().data_start() + 4).is_err());
        // inside header
        assert!(img.descriptor(8).is_err());
        // past end
        assert!(img.descriptor(img.len() as u64).is_err());
    }

    #[test]
    fn test_fresh_granules_are_free() {
        let img = image();
        for offset in img.granule_offsets() {
            let desc = img.descriptor(offset).unwrap();
            assert_eq!(desc.data_type, DataType::FREE_GRANULE);
            assert_eq!(img.canonical_offset(&desc).unwrap(), offset);
        }
        assert_eq!(img.granule_offsets().count(), 10);
    }

    #[test]
    fn test_payload_must_fit_granule() {
        let mut img = image();
        let offset = img.header().data_start();
        let mut desc = img.descriptor(offset).unwrap();
        desc.data_type = DataType::MESSAGE;
        desc.data_length = 64;
        img.set_descriptor(offset, &desc).unwrap();
        assert!(img.payload(offset).unwrap_err().to_string().contains("does not fit"));
    }

    #[test]
    fn test_write_item_and_payload() {
        let mut img = image();
        let offset = img.header().data_start();
        let mut desc = img.descriptor(offset).unwrap();
        desc.data_type = DataType::MESSAGE;
        img.write_item(offset, &desc, b"hello").unwrap();
        assert_eq!(img.payload(offset).unwrap(), b"hello");
        img.payload_mut(offset).unwrap()[0] = b'j';
        assert_eq!(img.payload(offset).unwrap(), b"jello");
    }

    #[test]
    fn test_gen_map_requires_compacted_image() {
        assert!(matches!(GenMap::build(&image()), Err(Error::BadParameter { .. })));
    }

    #[test]
    fn test_chain_next_ignores_foreign_generation() {
        let img = image();
        let desc = Descriptor { next_handle: Handle::new(GenId(9), 256), ..Descriptor::default() };
        assert!(img.compacted_chain_next(256, &desc).unwrap().is_none());
    }
}
