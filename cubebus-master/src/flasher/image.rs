//! Flash geometry and firmware image access.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Largest firmware image a node layout may describe.
pub const MAX_IMAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Per-node flash geometry, discovered from the bootloader at run time.
///
/// Field-for-field equality is meaningful: nodes whose layouts compare equal
/// can be flashed together from the same image slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryLayout {
    /// First physical address of the writable range.
    pub start: u32,
    /// One past the last physical address of the writable range.
    pub end: u32,
    /// Bytes per programming word.
    pub word_size: u32,
    /// Bytes per flash row, the unit of burn and verification.
    pub row_size: u32,
    /// Bytes per erase page; zero when the bootloader does not report one.
    pub page_size: u32,
}

/// Raised when a discovered layout cannot describe a flashable range.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("empty address range 0x{start:08x}..0x{end:08x}")]
    EmptyRange { start: u32, end: u32 },
    #[error("range of {size} bytes exceeds the {MAX_IMAGE_SIZE} byte limit")]
    TooLarge { size: u32 },
    #[error("zero {unit} size")]
    ZeroUnit { unit: &'static str },
    #[error("range of {size} bytes not divisible by {unit} size {unit_size}")]
    Misaligned {
        size: u32,
        unit: &'static str,
        unit_size: u32,
    },
    #[error("row size {row_size} not divisible by word size {word_size}")]
    RowWordMismatch { row_size: u32, word_size: u32 },
}

impl MemoryLayout {
    /// Size of the writable range in bytes.
    pub fn size(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// Checks that the layout describes a range this tool can flash.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.end <= self.start {
            return Err(LayoutError::EmptyRange {
                start: self.start,
                end: self.end,
            });
        }
        let size = self.size();
        if size > MAX_IMAGE_SIZE {
            return Err(LayoutError::TooLarge { size });
        }
        if self.word_size == 0 {
            return Err(LayoutError::ZeroUnit { unit: "word" });
        }
        if self.row_size == 0 {
            return Err(LayoutError::ZeroUnit { unit: "row" });
        }
        if self.row_size % self.word_size != 0 {
            return Err(LayoutError::RowWordMismatch {
                row_size: self.row_size,
                word_size: self.word_size,
            });
        }
        for (unit, unit_size) in [
            ("word", self.word_size),
            ("row", self.row_size),
            ("page", self.page_size),
        ] {
            // A missing page size is allowed; missing word/row sizes are
            // caught above.
            if unit_size != 0 && size % unit_size != 0 {
                return Err(LayoutError::Misaligned {
                    size,
                    unit,
                    unit_size,
                });
            }
        }
        Ok(())
    }
}

/// Firmware bytes covering exactly one layout's writable range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlob {
    data: Vec<u8>,
}

impl MemoryBlob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Raised when an image cannot be produced for a layout.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),
    #[error("image is {actual} bytes but the target range holds {capacity}")]
    Overflow { actual: usize, capacity: usize },
}

/// Source of firmware images.
///
/// The flasher asks for the portion of the image file that covers one
/// validated layout; how the file format is parsed is this trait's business.
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path, layout: &MemoryLayout) -> Result<MemoryBlob, ImageError>;
}

/// Loads raw binary images.
///
/// The file content is placed at the start of the layout's range and padded
/// to the full range with `0xFF`, the erased-flash value.
pub struct BinImageLoader;

impl BinImageLoader {
    fn place(bytes: &[u8], layout: &MemoryLayout) -> Result<MemoryBlob, ImageError> {
        let capacity = layout.size() as usize;
        if bytes.len() > capacity {
            return Err(ImageError::Overflow {
                actual: bytes.len(),
                capacity,
            });
        }
        let mut data = vec![0xFF; capacity];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(MemoryBlob::new(data))
    }
}

impl ImageLoader for BinImageLoader {
    fn load(&self, path: &Path, layout: &MemoryLayout) -> Result<MemoryBlob, ImageError> {
        let bytes = std::fs::read(path)?;
        Self::place(&bytes, layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn layout(start: u32, end: u32, word: u32, row: u32, page: u32) -> MemoryLayout {
        MemoryLayout {
            start,
            end,
            word_size: word,
            row_size: row,
            page_size: page,
        }
    }

    #[test_case(layout(0x2000, 0x2800, 2, 16, 64); "typical")]
    #[test_case(layout(0, 4, 4, 4, 0); "single row, no page size")]
    #[test_case(layout(0x1000, 0x1000 + MAX_IMAGE_SIZE, 4, 256, 4096); "at the size limit")]
    fn valid_layouts(l: MemoryLayout) {
        assert_eq!(l.validate(), Ok(()));
    }

    #[test_case(layout(0x2000, 0x2000, 2, 16, 0); "empty range")]
    #[test_case(layout(0x2800, 0x2000, 2, 16, 0); "inverted range")]
    #[test_case(layout(0, MAX_IMAGE_SIZE + 4, 4, 16, 0); "over the size limit")]
    #[test_case(layout(0x2000, 0x2800, 0, 16, 0); "zero word size")]
    #[test_case(layout(0x2000, 0x2800, 2, 0, 0); "zero row size")]
    #[test_case(layout(0x2000, 0x2800, 4, 6, 0); "row not word multiple")]
    #[test_case(layout(0x2000, 0x2801, 1, 16, 0); "size not row multiple")]
    #[test_case(layout(0x2000, 0x2800, 2, 16, 96); "size not page multiple")]
    fn invalid_layouts(l: MemoryLayout) {
        assert!(l.validate().is_err());
    }

    #[test]
    fn short_images_pad_with_erased_flash() {
        let l = layout(0x100, 0x110, 2, 8, 0);
        let blob = BinImageLoader::place(&[1, 2, 3], &l).unwrap();
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob.data()[..3], &[1, 2, 3]);
        assert!(blob.data()[3..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn oversized_images_are_rejected() {
        let l = layout(0x100, 0x104, 2, 4, 0);
        assert!(matches!(
            BinImageLoader::place(&[0; 5], &l),
            Err(ImageError::Overflow {
                actual: 5,
                capacity: 4
            })
        ));
    }
}
