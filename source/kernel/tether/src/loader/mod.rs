// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ELF64 loader for a runtime image handed over at boot
//! OWNERS: @kernel-team
//! PUBLIC API: ElfImage::parse, load(image, sink), SegmentSink, KernelSink, StackImage, enter()
//! DEPENDS_ON: mm (fresh frames, page protection), arch::aarch64 (I-cache, entry trampoline)
//! INVARIANTS: Only ELF64/LE/AArch64/EXEC images; segments page aligned and disjoint;
//!             no segment both writable and executable; any integrity failure is a LoadError

extern crate alloc;

pub mod stack;

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use tether_abi::auxv;

use crate::hal::Mmu;
use crate::mm::{self, align_down, align_up, FaultError, MapError, Permissions, PAGE_SIZE};

pub use stack::StackImage;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_AARCH64: u16 = 183;
const PT_LOAD: u32 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// `AT_HWCAP` bits advertised to the runtime: FP and ASIMD.
pub const HWCAP: u64 = 0b11;

bitflags! {
    /// Segment permission bits (`p_flags`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

impl Prot {
    /// Final page permissions once the segment contents are in place.
    pub fn permissions(self) -> Permissions {
        if self.contains(Prot::X) {
            Permissions::ReadExecute
        } else if self.contains(Prot::W) {
            Permissions::ReadWrite
        } else {
            Permissions::ReadOnly
        }
    }
}

/// Errors surfaced while parsing or loading an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// Input shorter than a header or table it claims to contain.
    Truncated,
    BadMagic,
    WrongClass,
    WrongEndian,
    WrongMachine(u16),
    NotExecutable(u16),
    /// Program header table fields out of range.
    BadPhTable,
    /// Segment bounds invalid, misaligned or overlapping another segment.
    SegmentOutOfRange { vaddr: u64 },
    /// Segment requests both write and execute.
    WritableExecutable { vaddr: u64 },
    NoLoadableSegments,
    /// Not enough room for the initial stack image.
    StackOverflow { needed: usize },
    /// Kernel address space not installed yet.
    NoAddressSpace,
    Map(FaultError),
    Protect(MapError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("image truncated"),
            Self::BadMagic => f.write_str("not an ELF image"),
            Self::WrongClass => f.write_str("not ELF64"),
            Self::WrongEndian => f.write_str("not little endian"),
            Self::WrongMachine(m) => write!(f, "machine {} is not AArch64", m),
            Self::NotExecutable(t) => write!(f, "type {} is not ET_EXEC", t),
            Self::BadPhTable => f.write_str("program header table out of range"),
            Self::SegmentOutOfRange { vaddr } => write!(f, "segment at {:#x} out of range", vaddr),
            Self::WritableExecutable { vaddr } => write!(f, "segment at {:#x} is writable and executable", vaddr),
            Self::NoLoadableSegments => f.write_str("no PT_LOAD segments"),
            Self::StackOverflow { needed } => write!(f, "startup image needs {} bytes", needed),
            Self::NoAddressSpace => f.write_str("address space not installed"),
            Self::Map(err) => write!(f, "segment map failed: {}", err),
            Self::Protect(err) => write!(f, "segment protect failed: {}", err),
        }
    }
}

/// One `PT_LOAD` segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub prot: Prot,
}

impl Segment {
    /// Page-rounded virtual range the segment occupies.
    pub fn pages(&self) -> core::ops::Range<usize> {
        align_down(self.vaddr as usize, PAGE_SIZE)..align_up((self.vaddr + self.memsz) as usize, PAGE_SIZE)
    }
}

/// Validated view of an executable image.
#[derive(Debug)]
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    pub entry: u64,
    pub phoff: u64,
    pub phnum: u16,
    pub segments: Vec<Segment>,
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl<'a> ElfImage<'a> {
    /// Checks the header and collects the loadable segments sorted by address.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, LoadError> {
        if bytes.len() < EHDR_SIZE {
            return Err(LoadError::Truncated);
        }
        if &bytes[..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if bytes[4] != ELFCLASS64 {
            return Err(LoadError::WrongClass);
        }
        if bytes[5] != ELFDATA2LSB {
            return Err(LoadError::WrongEndian);
        }
        let e_type = le_u16(bytes, 16);
        if e_type != ET_EXEC {
            return Err(LoadError::NotExecutable(e_type));
        }
        let machine = le_u16(bytes, 18);
        if machine != EM_AARCH64 {
            return Err(LoadError::WrongMachine(machine));
        }
        let entry = le_u64(bytes, 24);
        let phoff = le_u64(bytes, 32);
        let phentsize = le_u16(bytes, 54) as usize;
        let phnum = le_u16(bytes, 56);
        if phentsize != PHDR_SIZE {
            return Err(LoadError::BadPhTable);
        }
        let table_end = (phnum as usize)
            .checked_mul(PHDR_SIZE)
            .and_then(|len| len.checked_add(phoff as usize))
            .ok_or(LoadError::BadPhTable)?;
        if table_end > bytes.len() {
            return Err(LoadError::Truncated);
        }

        let mut segments = Vec::new();
        for index in 0..phnum as usize {
            let at = phoff as usize + index * PHDR_SIZE;
            if le_u32(bytes, at) != PT_LOAD {
                continue;
            }
            segments.push(Self::segment(bytes, at)?);
        }
        if segments.is_empty() {
            return Err(LoadError::NoLoadableSegments);
        }
        segments.sort_by_key(|s| s.vaddr);
        for pair in segments.windows(2) {
            if pair[0].pages().end > pair[1].pages().start {
                return Err(LoadError::SegmentOutOfRange { vaddr: pair[1].vaddr });
            }
        }
        if !segments.iter().any(|s| s.prot.contains(Prot::X) && s.pages().contains(&(entry as usize))) {
            return Err(LoadError::SegmentOutOfRange { vaddr: entry });
        }
        Ok(Self { bytes, entry, phoff, phnum, segments })
    }

    fn segment(bytes: &[u8], at: usize) -> Result<Segment, LoadError> {
        let prot = Prot::from_bits_truncate(le_u32(bytes, at + 4));
        let offset = le_u64(bytes, at + 8);
        let vaddr = le_u64(bytes, at + 16);
        let filesz = le_u64(bytes, at + 32);
        let memsz = le_u64(bytes, at + 40);
        if prot.contains(Prot::W | Prot::X) {
            return Err(LoadError::WritableExecutable { vaddr });
        }
        let out_of_range = LoadError::SegmentOutOfRange { vaddr };
        let page = PAGE_SIZE as u64;
        // File offset and address only need to agree within a page; the first page
        // is mapped from its rounded-down start.
        if vaddr % page != offset % page || vaddr < page || filesz > memsz {
            return Err(out_of_range);
        }
        let end = vaddr.checked_add(memsz).ok_or(out_of_range)?;
        end.checked_add(page - 1).ok_or(out_of_range)?;
        let file_end = offset.checked_add(filesz).ok_or(out_of_range)?;
        if file_end > bytes.len() as u64 {
            return Err(LoadError::Truncated);
        }
        Ok(Segment { vaddr, memsz, filesz, offset, prot })
    }

    /// File-backed bytes of `segment`.
    pub fn data(&self, segment: &Segment) -> &'a [u8] {
        &self.bytes[segment.offset as usize..(segment.offset + segment.filesz) as usize]
    }

    /// Runtime address of the program header table, if a segment carries it.
    pub fn phdr_address(&self) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| self.phoff >= s.offset && self.phoff < s.offset + s.filesz)
            .map(|s| s.vaddr + (self.phoff - s.offset))
    }

    /// Image-derived auxiliary vector entries.
    pub fn aux_entries(&self) -> Vec<(u64, u64)> {
        let mut aux = Vec::with_capacity(5);
        if let Some(phdr) = self.phdr_address() {
            aux.push((auxv::AT_PHDR, phdr));
        }
        aux.push((auxv::AT_PHENT, PHDR_SIZE as u64));
        aux.push((auxv::AT_PHNUM, self.phnum as u64));
        aux.push((auxv::AT_ENTRY, self.entry));
        aux.push((auxv::AT_HWCAP, HWCAP));
        aux
    }
}

/// Destination for segment contents.
pub trait SegmentSink {
    fn load_segment(&mut self, segment: &Segment, data: &[u8]) -> Result<(), LoadError>;
}

/// Copies every segment through `sink`; returns the entry address.
pub fn load<S: SegmentSink>(image: &ElfImage<'_>, sink: &mut S) -> Result<u64, LoadError> {
    for segment in &image.segments {
        sink.load_segment(segment, image.data(segment))?;
        crate::log_debug!(
            target: "loader",
            "segment {:#x}+{:#x} {}",
            segment.vaddr,
            segment.memsz,
            segment.prot.permissions()
        );
    }
    Ok(image.entry)
}

/// Loads into the kernel address space: fresh zeroed frames mapped writable,
/// contents copied, then each page narrowed to the segment's permissions.
pub struct KernelSink;

impl SegmentSink for KernelSink {
    fn load_segment(&mut self, segment: &Segment, data: &[u8]) -> Result<(), LoadError> {
        let pages = segment.pages();
        mm::with_kernel_space(|space| {
            for va in pages.clone().step_by(PAGE_SIZE) {
                space.map_fresh_page(va, Permissions::ReadWrite).map_err(LoadError::Map)?;
                // SAFETY: mapped writable just above, nothing else refers to the frame.
                unsafe { space.mmu().zero_page(va) };
            }
            Ok(())
        })
        .ok_or(LoadError::NoAddressSpace)??;

        // SAFETY: the destination pages were mapped writable above and are disjoint from `data`.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), segment.vaddr as *mut u8, data.len());
        }

        let perms = segment.prot.permissions();
        if perms == Permissions::ReadExecute {
            crate::arch::aarch64::sync_instruction_cache(pages.start, pages.len());
        }
        if perms != Permissions::ReadWrite {
            mm::with_kernel_space(|space| {
                for va in pages.clone().step_by(PAGE_SIZE) {
                    space.protect_page(va, perms).map_err(LoadError::Protect)?;
                }
                Ok(())
            })
            .ok_or(LoadError::NoAddressSpace)??;
        }
        Ok(())
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    fn __enter_image(entry: u64, sp: u64, argc: u64, argv: u64) -> !;
}

/// Jumps to `entry` with `x0 = argc`, `x1 = argv` and `sp` at the startup image.
///
/// # Safety
///
/// `entry` must be the entry point of a loaded image and `stack` must have been
/// built in memory that stays mapped for the lifetime of the runtime.
pub unsafe fn enter(entry: u64, stack: &StackImage) -> ! {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        __enter_image(entry, stack.sp as u64, stack.argc as u64, stack.argv as u64)
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = (entry, stack);
        crate::arch::aarch64::halt()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::vec;

    use super::*;

    pub(crate) const TEXT: u64 = 0x4900_0000;
    pub(crate) const DATA: u64 = 0x4900_2000;

    fn put_u16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u64(buf: &mut [u8], at: usize, v: u64) {
        buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Two-segment executable: text carrying the headers, then data with a bss tail.
    pub(crate) fn sample_image() -> Vec<u8> {
        let mut buf = vec![0u8; 0x2000];
        buf[..4].copy_from_slice(ELF_MAGIC);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1;
        put_u16(&mut buf, 16, ET_EXEC);
        put_u16(&mut buf, 18, EM_AARCH64);
        put_u32(&mut buf, 20, 1);
        put_u64(&mut buf, 24, TEXT + 0x100);
        put_u64(&mut buf, 32, EHDR_SIZE as u64);
        put_u16(&mut buf, 52, EHDR_SIZE as u16);
        put_u16(&mut buf, 54, PHDR_SIZE as u16);
        put_u16(&mut buf, 56, 3);

        let text = EHDR_SIZE;
        put_u32(&mut buf, text, PT_LOAD);
        put_u32(&mut buf, text + 4, (Prot::R | Prot::X).bits());
        put_u64(&mut buf, text + 8, 0);
        put_u64(&mut buf, text + 16, TEXT);
        put_u64(&mut buf, text + 32, 0x1000);
        put_u64(&mut buf, text + 40, 0x1000);

        let data = text + PHDR_SIZE;
        put_u32(&mut buf, data, PT_LOAD);
        put_u32(&mut buf, data + 4, (Prot::R | Prot::W).bits());
        put_u64(&mut buf, data + 8, 0x1000);
        put_u64(&mut buf, data + 16, DATA);
        put_u64(&mut buf, data + 32, 0x800);
        put_u64(&mut buf, data + 40, 0x3000);

        // PT_GNU_STACK, ignored.
        put_u32(&mut buf, data + PHDR_SIZE, 0x6474_e551);
        buf[0x100] = 0xd5;
        buf[0x1000] = 0x2a;
        buf
    }

    struct RecordingSink {
        loaded: Vec<(Segment, usize)>,
    }

    impl SegmentSink for RecordingSink {
        fn load_segment(&mut self, segment: &Segment, data: &[u8]) -> Result<(), LoadError> {
            self.loaded.push((*segment, data.len()));
            Ok(())
        }
    }

    #[test]
    fn parses_segments_and_aux() {
        let bytes = sample_image();
        let image = ElfImage::parse(&bytes).expect("valid image");
        assert_eq!(image.entry, TEXT + 0x100);
        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.segments[0].prot.permissions(), Permissions::ReadExecute);
        assert_eq!(image.segments[1].prot.permissions(), Permissions::ReadWrite);
        assert_eq!(image.segments[1].pages(), DATA as usize..DATA as usize + 0x3000);
        assert_eq!(image.phdr_address(), Some(TEXT + EHDR_SIZE as u64));
        let aux = image.aux_entries();
        assert!(aux.contains(&(auxv::AT_PHNUM, 3)));
        assert!(aux.contains(&(auxv::AT_ENTRY, TEXT + 0x100)));
        assert_eq!(image.data(&image.segments[1])[0], 0x2a);
    }

    #[test]
    fn load_walks_segments_in_address_order() {
        let bytes = sample_image();
        let image = ElfImage::parse(&bytes).expect("valid image");
        let mut sink = RecordingSink { loaded: Vec::new() };
        assert_eq!(load(&image, &mut sink), Ok(TEXT + 0x100));
        assert_eq!(sink.loaded.len(), 2);
        assert_eq!(sink.loaded[0].1, 0x1000);
        assert_eq!(sink.loaded[1].1, 0x800);
    }

    #[test]
    fn rejects_integrity_failures() {
        let good = sample_image();
        assert_eq!(ElfImage::parse(&good[..32]).err(), Some(LoadError::Truncated));

        let mut bad = good.clone();
        bad[0] = 0;
        assert_eq!(ElfImage::parse(&bad).err(), Some(LoadError::BadMagic));

        let mut bad = good.clone();
        put_u16(&mut bad, 18, 62);
        assert_eq!(ElfImage::parse(&bad).err(), Some(LoadError::WrongMachine(62)));

        let mut bad = good.clone();
        put_u16(&mut bad, 16, 3);
        assert_eq!(ElfImage::parse(&bad).err(), Some(LoadError::NotExecutable(3)));

        let mut bad = good.clone();
        put_u32(&mut bad, EHDR_SIZE + PHDR_SIZE + 4, (Prot::W | Prot::X).bits());
        assert_eq!(ElfImage::parse(&bad).err(), Some(LoadError::WritableExecutable { vaddr: DATA }));

        let mut bad = good.clone();
        put_u64(&mut bad, EHDR_SIZE + PHDR_SIZE + 32, 0x10_0000);
        assert_eq!(ElfImage::parse(&bad).err(), Some(LoadError::Truncated));

        let mut bad = good.clone();
        put_u64(&mut bad, EHDR_SIZE + PHDR_SIZE + 16, TEXT + 0x800);
        assert!(matches!(ElfImage::parse(&bad), Err(LoadError::SegmentOutOfRange { .. })));

        let mut bad = good;
        put_u64(&mut bad, 24, DATA);
        assert_eq!(ElfImage::parse(&bad).err(), Some(LoadError::SegmentOutOfRange { vaddr: DATA }));
    }

    #[test]
    fn segment_end_near_address_limit_is_rejected() {
        let mut bad = sample_image();
        let data = EHDR_SIZE + PHDR_SIZE;
        put_u64(&mut bad, data + 16, 0xFFFF_FFFF_FFFF_F000);
        put_u64(&mut bad, data + 40, 0x800);
        assert_eq!(
            ElfImage::parse(&bad).err(),
            Some(LoadError::SegmentOutOfRange { vaddr: 0xFFFF_FFFF_FFFF_F000 })
        );
    }

    #[test]
    fn unaligned_segment_congruent_with_offset_is_accepted() {
        let mut bytes = sample_image();
        let data = EHDR_SIZE + PHDR_SIZE;
        put_u64(&mut bytes, data + 8, 0x1010);
        put_u64(&mut bytes, data + 16, DATA + 0x10);
        let image = ElfImage::parse(&bytes).expect("congruent segment");
        let segment = image.segments[1];
        assert_eq!(segment.pages(), DATA as usize..DATA as usize + 0x4000);
        assert_eq!(image.data(&segment).len(), 0x800);

        put_u64(&mut bytes, data + 8, 0x1020);
        assert_eq!(
            ElfImage::parse(&bytes).err(),
            Some(LoadError::SegmentOutOfRange { vaddr: DATA + 0x10 })
        );
    }
}
