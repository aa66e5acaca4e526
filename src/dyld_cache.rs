/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reader for `dyld_shared_cache_armv7` files. On armv7 iOS most system
//! dylibs live only inside the shared cache, not as standalone files, so the
//! loader tries the cache before falling back to the chroot filesystem.

use crate::error::LoaderError;

const MAGIC: &[u8; 16] = b"dyld_v1   armv7\0";

struct Mapping {
    address: u64,
    file_offset: u64,
}

struct ImageEntry {
    address: u64,
    path: String,
}

/// A shared cache file held fully in memory, indexed by contained image path.
pub struct DyldCache {
    buffer: Vec<u8>,
    mappings: Vec<Mapping>,
    images: Vec<ImageEntry>,
}

impl DyldCache {
    pub fn load(path: &std::path::Path) -> Result<DyldCache, LoaderError> {
        let buffer = std::fs::read(path)?;
        if buffer.len() < 16 || &buffer[..16] != MAGIC {
            return Err(LoaderError::BadMagic);
        }

        let mapping_count = read_u32(&buffer, 0x10)? as usize;
        let mapping_offset = read_u32(&buffer, 0x14)? as usize;
        let image_count = read_u32(&buffer, 0x18)? as usize;
        let image_offset = read_u32(&buffer, 0x1c)? as usize;

        let mut mappings = Vec::with_capacity(mapping_count);
        for i in 0..mapping_count {
            // dyld_cache_mapping_info: address(u64), size(u64), fileOffset(u64), ...
            let entry = mapping_offset + i * 32;
            let address = read_u64(&buffer, entry)?;
            let file_offset = read_u64(&buffer, entry + 16)?;
            mappings.push(Mapping { address, file_offset });
        }

        let mut images = Vec::with_capacity(image_count);
        for i in 0..image_count {
            // dyld_cache_image_info: address(u64), modTime(u64), inode(u64), pathFileOffset(u32), pad(u32)
            let entry = image_offset + i * 32;
            let address = read_u64(&buffer, entry)?;
            let path_offset = read_u32(&buffer, entry + 24)? as usize;
            let path = read_cstr(&buffer, path_offset)?;
            images.push(ImageEntry { address, path });
        }

        Ok(DyldCache { buffer, mappings, images })
    }

    /// Look up `guest_path` among the cache's contained images and, if
    /// present, return `(file_offset, full_buffer)`: the byte offset within
    /// the cache buffer where that image's Mach-O header begins, and the
    /// whole cache buffer so loader code can resolve section file offsets
    /// that fall in other mappings.
    pub fn try_cache(&self, guest_path: &str) -> Option<(usize, &[u8])> {
        let image = self.images.iter().find(|i| i.path == guest_path)?;
        let offset = self.file_offset_for_address(image.address)?;
        Some((offset, &self.buffer))
    }

    /// `file_offset = mapping.fileOffset + (address - mapping.address)` for
    /// whichever mapping covers `address`.
    pub fn file_offset_for_address(&self, address: u64) -> Option<usize> {
        self.mappings
            .iter()
            .find(|m| address >= m.address)
            .map(|m| (m.file_offset + (address - m.address)) as usize)
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, LoaderError> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(LoaderError::TruncatedLoadCommand)
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, LoaderError> {
    buf.get(offset..offset + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or(LoaderError::TruncatedLoadCommand)
}

fn read_cstr(buf: &[u8], offset: usize) -> Result<String, LoaderError> {
    let bytes = buf.get(offset..).ok_or(LoaderError::TruncatedLoadCommand)?;
    let end = bytes.iter().position(|&b| b == 0).ok_or(LoaderError::TruncatedLoadCommand)?;
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_fake_cache() -> Vec<u8> {
        let mut buf = vec![0u8; 0x1000];
        buf[..16].copy_from_slice(MAGIC);
        buf[0x10..0x14].copy_from_slice(&1u32.to_le_bytes()); // mapping_count
        buf[0x14..0x18].copy_from_slice(&0x100u32.to_le_bytes()); // mapping_offset
        buf[0x18..0x1c].copy_from_slice(&1u32.to_le_bytes()); // image_count
        buf[0x1c..0x20].copy_from_slice(&0x200u32.to_le_bytes()); // image_offset

        // one mapping: address=0x1000, fileOffset=0x400
        buf[0x100..0x108].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[0x110..0x118].copy_from_slice(&0x400u64.to_le_bytes());

        // one image: address=0x1040, pathFileOffset=0x300
        buf[0x200..0x208].copy_from_slice(&0x1040u64.to_le_bytes());
        buf[0x218..0x21c].copy_from_slice(&0x300u32.to_le_bytes());
        let path = b"/usr/lib/libSystem.B.dylib\0";
        buf[0x300..0x300 + path.len()].copy_from_slice(path);
        buf
    }

    #[test]
    fn resolves_image_offset_through_mapping() {
        let buffer = build_fake_cache();
        assert_eq!(&buffer[..16], MAGIC);
        let cache = DyldCache {
            mappings: vec![Mapping { address: 0x1000, file_offset: 0x400 }],
            images: vec![ImageEntry { address: 0x1040, path: "/usr/lib/libSystem.B.dylib".to_string() }],
            buffer,
        };
        let (offset, _) = cache.try_cache("/usr/lib/libSystem.B.dylib").unwrap();
        assert_eq!(offset, 0x400 + 0x40);
        assert!(cache.try_cache("/nonexistent").is_none());
    }
}
