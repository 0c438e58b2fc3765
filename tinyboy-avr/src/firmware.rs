use std::path::Path;

use anyhow::Context;

/// The value read from flash locations that were never programmed.
pub const ERASED: u8 = 0xff;

/// An immutable snapshot of the program flash. The size of the image bounds the address space
/// scanned by the analysis and the amount of data uploaded to an emulator.
#[derive(Clone, PartialEq, Eq)]
pub struct FlashImage {
    bytes: Vec<u8>,
}

impl FlashImage {
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        // Instructions are fetched a word at a time.
        if bytes.len() % 2 != 0 {
            bytes.push(ERASED);
        }
        Self { bytes }
    }

    /// Loads an image from disk, treating files with a `.hex` or `.ihex` extension as Intel HEX and
    /// anything else as a raw binary image.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let is_ihex = path.extension().map_or(false, |ext| ext == "hex" || ext == "ihex");
        match is_ihex {
            true => Self::from_ihex(&data),
            false => Ok(Self::from_bytes(data)),
        }
        .with_context(|| format!("error loading {}", path.display()))
    }

    pub fn from_ihex(data: &[u8]) -> anyhow::Result<Self> {
        let input =
            std::str::from_utf8(data).map_err(|e| anyhow::format_err!("invalid ihex file: {e}"))?;

        let mut bytes = vec![];
        let mut base_addr = 0_usize;
        for entry in ihex::Reader::new(input) {
            match entry.map_err(|e| anyhow::format_err!("invalid ihex file: {e}"))? {
                ihex::Record::Data { offset, value } => {
                    let addr = base_addr + offset as usize;
                    let end = addr + value.len();
                    if bytes.len() < end {
                        bytes.resize(end, ERASED);
                    }
                    bytes[addr..end].copy_from_slice(&value);
                }
                ihex::Record::ExtendedLinearAddress(upper) => base_addr = (upper as usize) << 16,
                ihex::Record::ExtendedSegmentAddress(segment) => base_addr = (segment as usize) << 4,
                // The reset vector is always at address zero.
                ihex::Record::StartLinearAddress(_) | ihex::Record::StartSegmentAddress { .. } => {}
                ihex::Record::EndOfFile => break,
            }
        }

        anyhow::ensure!(!bytes.is_empty(), "ihex file contains no data records");
        tracing::debug!("loaded {} bytes of flash from ihex", bytes.len());
        Ok(Self::from_bytes(bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reads the little-endian word at byte address `addr`, if it is inside the image.
    pub fn word(&self, addr: u32) -> Option<u16> {
        let addr = addr as usize;
        let bytes = self.bytes.get(addr..addr.checked_add(2)?)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl std::fmt::Debug for FlashImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashImage").field("len", &self.bytes.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_ihex(records: &[ihex::Record]) -> String {
        ihex::create_object_file_representation(records).unwrap()
    }

    #[test]
    fn data_records_fill_gaps_with_erased_flash() {
        let hex = to_ihex(&[
            ihex::Record::Data { offset: 0x0000, value: vec![0x0c, 0x94] },
            ihex::Record::Data { offset: 0x0006, value: vec![0x08, 0x95] },
            ihex::Record::EndOfFile,
        ]);
        let image = FlashImage::from_ihex(hex.as_bytes()).unwrap();
        assert_eq!(image.as_bytes(), &[0x0c, 0x94, 0xff, 0xff, 0xff, 0xff, 0x08, 0x95]);
        assert_eq!(image.word(0), Some(0x940c));
        assert_eq!(image.word(6), Some(0x9508));
        assert_eq!(image.word(8), None);
    }

    #[test]
    fn extended_linear_address_moves_base() {
        let hex = to_ihex(&[
            ihex::Record::ExtendedLinearAddress(0x0001),
            ihex::Record::Data { offset: 0x0002, value: vec![0xaa] },
            ihex::Record::EndOfFile,
        ]);
        let image = FlashImage::from_ihex(hex.as_bytes()).unwrap();
        assert_eq!(image.len(), 0x1_0004);
        assert_eq!(image.as_bytes()[0x1_0002], 0xaa);
        assert_eq!(image.as_bytes()[0x1_0003], ERASED);
    }

    #[test]
    fn rejects_images_without_data() {
        let hex = to_ihex(&[ihex::Record::EndOfFile]);
        assert!(FlashImage::from_ihex(hex.as_bytes()).is_err());
        assert!(FlashImage::from_ihex(b":zz").is_err());
    }
}
