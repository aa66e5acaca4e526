/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Types related to the virtual memory of the emulated guest.
//!
//! The virtual address space is 32-bit, as is the pointer size. No attempt is
//! made to do endianness conversion for reads and writes, because the host is
//! assumed little-endian, same as the guest.
//!
//! Unlike a real MMU, there is no notion of a guest fault: accessing an
//! address that isn't covered by any mapped page is a fatal error for the
//! whole run (see [crate::error::EmuError::MemoryFault]).

use crate::error::EmuError;

/// Equivalent of `usize` for guest memory.
pub type GuestUSize = u32;
/// Equivalent of `isize` for guest memory.
pub type GuestISize = i32;

/// [std::mem::size_of], but returning a [GuestUSize].
pub const fn guest_size_of<T: Sized>() -> GuestUSize {
    std::mem::size_of::<T>() as u32
}

/// Internal type for representing an untyped virtual address.
pub type VAddr = GuestUSize;

/// Pointer type for guest memory, or the "guest pointer" type.
///
/// The `MUT` type parameter determines whether this is mutable or not. Don't
/// write it out explicitly, use [ConstPtr], [MutPtr], [ConstVoidPtr] or
/// [MutVoidPtr] instead.
#[repr(transparent)]
pub struct Ptr<T, const MUT: bool>(VAddr, std::marker::PhantomData<T>);

impl<T, const MUT: bool> Clone for Ptr<T, MUT> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T, const MUT: bool> Copy for Ptr<T, MUT> {}
impl<T, const MUT: bool> PartialEq for Ptr<T, MUT> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T, const MUT: bool> Eq for Ptr<T, MUT> {}
impl<T, const MUT: bool> std::hash::Hash for Ptr<T, MUT> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Constant guest pointer type (like Rust's `*const T`).
pub type ConstPtr<T> = Ptr<T, false>;
/// Mutable guest pointer type (like Rust's `*mut T`).
pub type MutPtr<T> = Ptr<T, true>;
/// Constant guest pointer-to-void type (like C's `const void *`).
pub type ConstVoidPtr = ConstPtr<std::ffi::c_void>;
/// Mutable guest pointer-to-void type (like C's `void *`).
pub type MutVoidPtr = MutPtr<std::ffi::c_void>;

impl<T, const MUT: bool> Ptr<T, MUT> {
    pub const fn null() -> Self {
        Ptr(0, std::marker::PhantomData)
    }
    pub fn to_bits(self) -> VAddr {
        self.0
    }
    pub const fn from_bits(bits: VAddr) -> Self {
        Ptr(bits, std::marker::PhantomData)
    }
    pub fn cast<U>(self) -> Ptr<U, MUT> {
        Ptr::<U, MUT>::from_bits(self.to_bits())
    }
    pub fn is_null(self) -> bool {
        self.to_bits() == 0
    }
}
impl<T> MutPtr<T> {
    pub fn cast_const(self) -> ConstPtr<T> {
        Ptr::from_bits(self.to_bits())
    }
}

impl<T, const MUT: bool> Default for Ptr<T, MUT> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, const MUT: bool> std::fmt::Debug for Ptr<T, MUT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "{:#x}", self.to_bits())
        }
    }
}

impl<T, const MUT: bool> std::ops::Add<GuestUSize> for Ptr<T, MUT> {
    type Output = Self;
    fn add(self, other: GuestUSize) -> Self {
        let size = guest_size_of::<T>().max(1);
        Self::from_bits(self.to_bits().wrapping_add(other.wrapping_mul(size)))
    }
}
impl<T, const MUT: bool> std::ops::Sub<GuestUSize> for Ptr<T, MUT> {
    type Output = Self;
    fn sub(self, other: GuestUSize) -> Self {
        let size = guest_size_of::<T>().max(1);
        Self::from_bits(self.to_bits().wrapping_sub(other.wrapping_mul(size)))
    }
}

/// Marker trait for types that can be safely read from guest memory.
///
/// # Safety
/// Reading from guest memory is essentially a [std::mem::transmute]. Only
/// types for which all possible bit patterns are legal should implement this.
pub unsafe trait SafeRead: Sized {}
unsafe impl SafeRead for u8 {}
unsafe impl SafeRead for i8 {}
unsafe impl SafeRead for u16 {}
unsafe impl SafeRead for i16 {}
unsafe impl SafeRead for u32 {}
unsafe impl SafeRead for i32 {}
unsafe impl SafeRead for u64 {}
unsafe impl SafeRead for i64 {}
unsafe impl<T, const MUT: bool> SafeRead for Ptr<T, MUT> {}

/// Marker trait for types that can be written to guest memory.
pub trait SafeWrite: Sized {}
impl<T: SafeRead> SafeWrite for T {}

/// Size, in bytes, of a freshly allocated page (see [Mem::alloc_page]).
pub const PAGE_SIZE: GuestUSize = 4096;

/// Address the page allocator cursor starts handing out fresh mappings from.
const ALLOC_CURSOR_START: VAddr = 0x8000_0000;

/// Low end of the pre-mapped main stack.
pub const STACK_LOW: VAddr = 0xd000_0000 - 512 * 1024;
/// Base of the pre-mapped main stack. `SP` starts here.
pub const STACK_BASE: VAddr = 0xd000_0000;
/// High end of the pre-mapped main stack.
pub const STACK_HIGH: VAddr = 0xd000_0000 + 512 * 1024;

/// The hypervisor-return sentinel address: a one-word page pre-mapped with
/// the ARM breakpoint encoding, used by [crate::machine::Machine::execute_function].
pub const HYPERVISOR_RETURN: VAddr = 0xffff_fff0;

/// Base of the kernel user-helper ("ARM_TP") page some libc code probes.
pub const ARM_TP_PAGE: VAddr = 0xffff_1000;
/// Offset within [ARM_TP_PAGE] of the hardware-capability flags word.
pub const ARM_TP_HWCAP_OFFSET: VAddr = 0x20;
const ARM_TP_HWCAP_VALUE: u32 = 0x9000;

/// A mapped region of guest memory backed by host bytes.
struct Page {
    base: VAddr,
    bytes: Vec<u8>,
}

impl Page {
    fn end(&self) -> VAddr {
        self.base + self.bytes.len() as VAddr
    }
    fn contains_range(&self, addr: VAddr, size: GuestUSize) -> bool {
        addr >= self.base && (addr as u64) + (size as u64) <= self.end() as u64
    }
}

/// The sparse address-to-host-byte map that backs all guest memory accesses.
///
/// Pages are kept sorted by base address so lookups are a binary search
/// rather than a linear scan over however many regions happen to be mapped.
pub struct Mem {
    pages: Vec<Page>,
    alloc_cursor: VAddr,
}

impl Mem {
    /// Create a fresh instance of guest memory, with the fixed pages named in
    /// the external interfaces (stack, hypervisor-return sentinel, ARM_TP)
    /// already mapped.
    pub fn new() -> Mem {
        let mut mem = Mem {
            pages: Vec::new(),
            alloc_cursor: ALLOC_CURSOR_START,
        };
        // The TLS page (spec: "Fixed guest addresses") lives at the same
        // address the page allocator starts handing pages out from, so it's
        // pre-mapped here rather than via `alloc_page`, which would otherwise
        // hand the same range out again to the first caller.
        mem.map(ALLOC_CURSOR_START, PAGE_SIZE);
        mem.alloc_cursor += PAGE_SIZE;
        mem.map(STACK_LOW, STACK_HIGH - STACK_LOW);
        mem.map(HYPERVISOR_RETURN, 4);
        mem.write_sized(HYPERVISOR_RETURN, 4, crate::decoder::BREAKPOINT_ENCODING as u64)
            .unwrap();
        mem.map(ARM_TP_PAGE, PAGE_SIZE);
        mem.write_sized(
            ARM_TP_PAGE + ARM_TP_HWCAP_OFFSET,
            4,
            ARM_TP_HWCAP_VALUE as u64,
        )
        .unwrap();
        mem
    }

    /// Map `length` fresh, zeroed bytes at `base`. The caller must ensure the
    /// new region doesn't overlap an existing one.
    pub fn map(&mut self, base: VAddr, length: GuestUSize) {
        let idx = self.pages.partition_point(|p| p.base < base);
        self.pages.insert(
            idx,
            Page {
                base,
                bytes: vec![0u8; length as usize],
            },
        );
    }

    /// Copy `data` into memory already mapped at `base`.
    pub fn map_bytes(&mut self, base: VAddr, data: &[u8]) {
        self.map(base, data.len() as GuestUSize);
        let page = self.find_page_mut(base, data.len() as GuestUSize).unwrap();
        let start = (base - page.base) as usize;
        page.bytes[start..][..data.len()].copy_from_slice(data);
    }

    /// Hand out a fresh page-aligned range from the allocator cursor and map
    /// it. Used for breakpoint trampolines and constructor-invoked `malloc`
    /// shims alike.
    pub fn alloc_page(&mut self) -> VAddr {
        let base = self.alloc_cursor;
        self.alloc_cursor += PAGE_SIZE;
        self.map(base, PAGE_SIZE);
        base
    }

    fn find_page(&self, addr: VAddr, size: GuestUSize) -> Option<&Page> {
        let idx = self.pages.partition_point(|p| p.base <= addr);
        let idx = idx.checked_sub(1)?;
        let page = &self.pages[idx];
        page.contains_range(addr, size).then_some(page)
    }
    fn find_page_mut(&mut self, addr: VAddr, size: GuestUSize) -> Option<&mut Page> {
        let idx = self.pages.partition_point(|p| p.base <= addr);
        let idx = idx.checked_sub(1)?;
        let page = &mut self.pages[idx];
        page.contains_range(addr, size).then_some(page)
    }

    /// Read `size` (1/2/4/8) little-endian bytes at `addr`. This is the
    /// primitive the decoder/executor use directly, widened to `u64` to
    /// cover all four sizes uniformly.
    pub fn read_sized(&self, addr: VAddr, size: u8) -> Result<u64, EmuError> {
        let page = self
            .find_page(addr, size as GuestUSize)
            .ok_or(EmuError::MemoryFault { addr, size })?;
        let start = (addr - page.base) as usize;
        let bytes = &page.bytes[start..][..size as usize];
        let mut buf = [0u8; 8];
        buf[..size as usize].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write `size` (1/2/4/8) little-endian bytes of `value` at `addr`.
    pub fn write_sized(&mut self, addr: VAddr, size: u8, value: u64) -> Result<(), EmuError> {
        let page = self
            .find_page_mut(addr, size as GuestUSize)
            .ok_or(EmuError::MemoryFault { addr, size })?;
        let start = (addr - page.base) as usize;
        let bytes = value.to_le_bytes();
        page.bytes[start..][..size as usize].copy_from_slice(&bytes[..size as usize]);
        Ok(())
    }

    /// Typed read, for loader/symbol-table code that deals in [Ptr]s rather
    /// than raw addresses and sizes.
    pub fn read<T, const MUT: bool>(&self, ptr: Ptr<T, MUT>) -> Result<T, EmuError>
    where
        T: SafeRead,
    {
        let size = guest_size_of::<T>();
        let addr = ptr.to_bits();
        let page = self
            .find_page(addr, size)
            .ok_or(EmuError::MemoryFault { addr, size: size as u8 })?;
        let start = (addr - page.base) as usize;
        let src = &page.bytes[start..][..size as usize];
        let mut value = std::mem::MaybeUninit::<T>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), value.as_mut_ptr().cast::<u8>(), size as usize);
            Ok(value.assume_init())
        }
    }

    /// Typed write, the counterpart to [Self::read].
    pub fn write<T>(&mut self, ptr: MutPtr<T>, value: T) -> Result<(), EmuError>
    where
        T: SafeWrite,
    {
        let size = guest_size_of::<T>();
        let addr = ptr.to_bits();
        let page = self
            .find_page_mut(addr, size)
            .ok_or(EmuError::MemoryFault { addr, size: size as u8 })?;
        let start = (addr - page.base) as usize;
        let dst = &mut page.bytes[start..][..size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping((&value as *const T).cast::<u8>(), dst.as_mut_ptr(), size as usize);
        }
        std::mem::forget(value);
        Ok(())
    }

    /// Read a NUL-terminated byte string at `ptr`, not including the NUL.
    pub fn cstr_at(&self, ptr: ConstPtr<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut p = ptr;
        loop {
            let byte: u8 = self.read(p).unwrap_or(0);
            if byte == 0 {
                break;
            }
            out.push(byte);
            p = p + 1;
        }
        out
    }
}

impl Default for Mem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_byte_order() {
        let mut mem = Mem::new();
        mem.map(0x1000, PAGE_SIZE);
        mem.write_sized(0x1000, 4, 0xCAFEBABE).unwrap();
        assert_eq!(mem.read_sized(0x1000, 1).unwrap(), 0xBE);
        assert_eq!(mem.read_sized(0x1000, 4).unwrap(), 0xCAFEBABE);
    }

    #[test]
    fn unmapped_access_is_a_memory_fault() {
        let mem = Mem::new();
        assert!(matches!(
            mem.read_sized(0x1000, 4),
            Err(EmuError::MemoryFault { addr: 0x1000, size: 4 })
        ));
    }

    #[test]
    fn alloc_page_hands_out_growing_ranges() {
        let mut mem = Mem::new();
        let a = mem.alloc_page();
        let b = mem.alloc_page();
        // Mem::new() pre-maps the TLS page at ALLOC_CURSOR_START and advances
        // the cursor past it, so the first alloc_page() lands one page later.
        assert_eq!(a, ALLOC_CURSOR_START + PAGE_SIZE);
        assert_eq!(b, a + PAGE_SIZE);
    }

    #[test]
    fn typed_read_write_roundtrip() {
        let mut mem = Mem::new();
        mem.map(0x2000, PAGE_SIZE);
        let ptr: MutPtr<u32> = Ptr::from_bits(0x2000);
        mem.write(ptr, 0x1234_5678).unwrap();
        assert_eq!(mem.read(ptr).unwrap(), 0x1234_5678);
    }
}
