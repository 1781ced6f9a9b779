//! ELF image staging.
//!
//! The microkernel and its extensions arrive as ELF64 images in user
//! memory. Staging happens in two steps:
//!
//! 1. [`ElfFile::copy_from_user`] pulls the whole image into kernel-owned
//!    pages (the only copy ever taken of user memory).
//! 2. [`ElfSegments::stage`] parses the program headers of the copied
//!    microkernel image and materializes each `PT_LOAD` segment into its
//!    own page-rounded allocation: file bytes first, the `memsz` tail
//!    left zero.
//!
//! Only little-endian x86-64 executables are accepted. Parsing uses
//! explicit offsets rather than transmuting headers.

use crate::error::{Error, Result};
use crate::layout::{align_up, PAGE_SIZE};
use crate::platform::{alloc_pages, Platform};
use crate::span::{MutableSpan, Span};

/// ELF header and program header offsets (ELF64).
#[allow(dead_code)]
mod elf64 {
    pub const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
    pub const CLASS: usize = 4;
    pub const CLASS_64: u8 = 2;
    pub const DATA: usize = 5;
    pub const DATA_LSB: u8 = 1;
    pub const TYPE: usize = 16;
    pub const TYPE_EXEC: u16 = 2;
    pub const MACHINE: usize = 18;
    pub const MACHINE_X86_64: u16 = 62;
    pub const ENTRY: usize = 24;
    pub const PHOFF: usize = 32;
    pub const PHENTSIZE: usize = 54;
    pub const PHNUM: usize = 56;
    pub const EHDR_SIZE: usize = 64;
    pub const PHDR_SIZE: usize = 56;

    pub const PT_LOAD: u32 = 1;
    pub const PF_X: u32 = 1;
    pub const PF_W: u32 = 2;
    pub const PF_R: u32 = 4;

    pub const P_TYPE: usize = 0;
    pub const P_FLAGS: usize = 4;
    pub const P_OFFSET: usize = 8;
    pub const P_VADDR: usize = 16;
    pub const P_FILESZ: usize = 32;
    pub const P_MEMSZ: usize = 40;
}

/// A kernel-owned copy of a user-submitted ELF image.
#[derive(Debug, Default)]
pub struct ElfFile {
    region: MutableSpan,
}

impl ElfFile {
    /// Copy an ELF image out of user memory into fresh pages.
    ///
    /// The span has already been validated against `MAX_ELF_FILE_SIZE`;
    /// the allocation is page-rounded so the image can be mapped whole.
    pub fn copy_from_user(platform: &dyn Platform, user: Span) -> Result<Self> {
        let mut region = alloc_pages(platform, align_up(user.size, PAGE_SIZE), "elf file")?;

        let dst = unsafe { &mut region.as_mut_slice()[..user.size as usize] };
        if platform.copy_from_user(dst, user.addr) != 0 {
            log::error!("copying ELF image from user memory faulted");
            region.free(platform);
            return Err(Error::UserCopyFault);
        }

        Ok(Self { region })
    }

    /// Host-virtual address of the copied image.
    pub fn addr(&self) -> *const u8 {
        self.region.addr
    }

    /// Page-rounded size of the copy.
    pub fn size(&self) -> u64 {
        self.region.size
    }

    /// Whether this handle holds an image.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    fn bytes(&self) -> &[u8] {
        unsafe { self.region.as_slice() }
    }

    /// Log the image's location.
    pub fn dump(&self, name: &str) {
        log::debug!("{name}: addr {:p} size 0x{:x}", self.region.addr, self.region.size);
    }

    /// Release the copy.
    pub fn free(&mut self, platform: &dyn Platform) {
        self.region.free(platform);
    }
}

/// One staged `PT_LOAD` segment.
#[derive(Debug)]
pub struct ElfSegment {
    /// Link-time virtual address of the segment.
    pub vaddr: u64,
    /// ELF `p_flags` of the segment.
    pub flags: u32,
    /// In-memory size of the segment in bytes (unrounded).
    pub memsz: u64,
    /// Pages carrying the segment bytes.
    pub pages: MutableSpan,
}

impl ElfSegment {
    /// Whether the segment is executable.
    pub fn executable(&self) -> bool {
        self.flags & elf64::PF_X != 0
    }

    /// Whether the segment is writable.
    pub fn writable(&self) -> bool {
        self.flags & elf64::PF_W != 0
    }
}

/// The staged loadable segments of the microkernel image.
#[derive(Debug, Default)]
pub struct ElfSegments {
    entry: u64,
    segments: Vec<ElfSegment>,
}

impl ElfSegments {
    /// Parse the program headers of a copied image and stage every
    /// `PT_LOAD` segment into its own allocation.
    pub fn stage(platform: &dyn Platform, file: &ElfFile) -> Result<Self> {
        let image = file.bytes();
        let entry = validate_ehdr(image)?;

        let phoff = read_u64(image, elf64::PHOFF) as usize;
        let phentsize = read_u16(image, elf64::PHENTSIZE) as usize;
        let phnum = read_u16(image, elf64::PHNUM) as usize;

        if phentsize != elf64::PHDR_SIZE {
            return Err(Error::InvalidArgument(format!(
                "unexpected program header size {phentsize}"
            )));
        }
        let table_end = phoff
            .checked_add(phnum * phentsize)
            .ok_or_else(|| Error::InvalidArgument("program header table overflows".into()))?;
        if table_end > image.len() {
            return Err(Error::InvalidArgument(
                "program header table is out of bounds".into(),
            ));
        }

        let mut staged = Self {
            entry,
            segments: Vec::new(),
        };

        for idx in 0..phnum {
            let phdr = &image[phoff + idx * phentsize..phoff + (idx + 1) * phentsize];
            if read_u32(phdr, elf64::P_TYPE) != elf64::PT_LOAD {
                continue;
            }

            match Self::stage_segment(platform, image, phdr) {
                Ok(segment) => staged.segments.push(segment),
                Err(e) => {
                    staged.free(platform);
                    return Err(e);
                }
            }
        }

        if staged.segments.is_empty() {
            return Err(Error::InvalidArgument("image has no loadable segments".into()));
        }

        Ok(staged)
    }

    fn stage_segment(
        platform: &dyn Platform,
        image: &[u8],
        phdr: &[u8],
    ) -> Result<ElfSegment> {
        let offset = read_u64(phdr, elf64::P_OFFSET) as usize;
        let vaddr = read_u64(phdr, elf64::P_VADDR);
        let filesz = read_u64(phdr, elf64::P_FILESZ) as usize;
        let memsz = read_u64(phdr, elf64::P_MEMSZ);

        if vaddr % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "segment vaddr 0x{vaddr:x} is not page aligned"
            )));
        }
        if (filesz as u64) > memsz {
            return Err(Error::InvalidArgument("segment filesz exceeds memsz".into()));
        }
        let file_end = offset
            .checked_add(filesz)
            .ok_or_else(|| Error::InvalidArgument("segment file range overflows".into()))?;
        if file_end > image.len() {
            return Err(Error::InvalidArgument("segment is out of bounds".into()));
        }

        let mut pages = alloc_pages(platform, align_up(memsz, PAGE_SIZE), "elf segment")?;
        // File bytes up front; the allocation is already zeroed, which
        // covers the memsz tail (.bss).
        unsafe {
            pages.as_mut_slice()[..filesz].copy_from_slice(&image[offset..file_end]);
        }

        Ok(ElfSegment {
            vaddr,
            flags: read_u32(phdr, elf64::P_FLAGS),
            memsz,
            pages,
        })
    }

    /// Link-time entry point of the image.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// The staged segments.
    pub fn segments(&self) -> &[ElfSegment] {
        &self.segments
    }

    /// Log every staged segment.
    pub fn dump(&self) {
        for (idx, seg) in self.segments.iter().enumerate() {
            log::debug!(
                "mk segment #{idx}: vaddr 0x{:016x} memsz 0x{:x} flags 0x{:x}",
                seg.vaddr,
                seg.memsz,
                seg.flags
            );
        }
    }

    /// Release every staged segment.
    pub fn free(&mut self, platform: &dyn Platform) {
        for segment in self.segments.iter_mut().rev() {
            segment.pages.free(platform);
        }
        self.segments.clear();
        self.entry = 0;
    }
}

fn validate_ehdr(image: &[u8]) -> Result<u64> {
    if image.len() < elf64::EHDR_SIZE {
        return Err(Error::InvalidArgument("image is too small for an ELF header".into()));
    }
    if image[..4] != elf64::MAGIC {
        return Err(Error::InvalidArgument("image is not an ELF file".into()));
    }
    if image[elf64::CLASS] != elf64::CLASS_64 || image[elf64::DATA] != elf64::DATA_LSB {
        return Err(Error::InvalidArgument(
            "image is not a little-endian ELF64 file".into(),
        ));
    }
    if read_u16(image, elf64::TYPE) != elf64::TYPE_EXEC {
        return Err(Error::InvalidArgument("image is not an executable".into()));
    }
    if read_u16(image, elf64::MACHINE) != elf64::MACHINE_X86_64 {
        return Err(Error::InvalidArgument("image is not x86-64".into()));
    }
    Ok(read_u64(image, elf64::ENTRY))
}

fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(raw[offset..offset + 2].try_into().unwrap())
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::elf64;

    pub struct TestSegment {
        pub vaddr: u64,
        pub flags: u32,
        pub data: Vec<u8>,
        pub memsz: u64,
    }

    /// Build a minimal ELF64 executable image from segment descriptions.
    pub fn build_elf(entry: u64, segments: &[TestSegment]) -> Vec<u8> {
        let phoff = elf64::EHDR_SIZE;
        let data_off = phoff + segments.len() * elf64::PHDR_SIZE;

        let mut image = vec![0u8; data_off];
        image[..4].copy_from_slice(&elf64::MAGIC);
        image[elf64::CLASS] = elf64::CLASS_64;
        image[elf64::DATA] = elf64::DATA_LSB;
        image[6] = 1; // EV_CURRENT
        image[elf64::TYPE..elf64::TYPE + 2].copy_from_slice(&elf64::TYPE_EXEC.to_le_bytes());
        image[elf64::MACHINE..elf64::MACHINE + 2]
            .copy_from_slice(&elf64::MACHINE_X86_64.to_le_bytes());
        image[elf64::ENTRY..elf64::ENTRY + 8].copy_from_slice(&entry.to_le_bytes());
        image[elf64::PHOFF..elf64::PHOFF + 8].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[elf64::PHENTSIZE..elf64::PHENTSIZE + 2]
            .copy_from_slice(&(elf64::PHDR_SIZE as u16).to_le_bytes());
        image[elf64::PHNUM..elf64::PHNUM + 2]
            .copy_from_slice(&(segments.len() as u16).to_le_bytes());

        let mut offset = data_off;
        for (idx, seg) in segments.iter().enumerate() {
            let phdr = phoff + idx * elf64::PHDR_SIZE;
            let p = &mut image[phdr..phdr + elf64::PHDR_SIZE];
            p[elf64::P_TYPE..elf64::P_TYPE + 4].copy_from_slice(&elf64::PT_LOAD.to_le_bytes());
            p[elf64::P_FLAGS..elf64::P_FLAGS + 4].copy_from_slice(&seg.flags.to_le_bytes());
            p[elf64::P_OFFSET..elf64::P_OFFSET + 8]
                .copy_from_slice(&(offset as u64).to_le_bytes());
            p[elf64::P_VADDR..elf64::P_VADDR + 8].copy_from_slice(&seg.vaddr.to_le_bytes());
            p[elf64::P_FILESZ..elf64::P_FILESZ + 8]
                .copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
            p[elf64::P_MEMSZ..elf64::P_MEMSZ + 8].copy_from_slice(&seg.memsz.to_le_bytes());
            offset += seg.data.len();
        }

        for seg in segments {
            image.extend_from_slice(&seg.data);
        }
        image
    }

    /// A two-segment (text + data/bss) executable for end-to-end tests.
    pub fn small_mk_image() -> Vec<u8> {
        build_elf(
            0x40_0000,
            &[
                TestSegment {
                    vaddr: 0x40_0000,
                    flags: elf64::PF_R | elf64::PF_X,
                    data: vec![0x90; 0x200],
                    memsz: 0x200,
                },
                TestSegment {
                    vaddr: 0x40_2000,
                    flags: elf64::PF_R | elf64::PF_W,
                    data: vec![0xAA; 0x100],
                    memsz: 0x1800,
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_elf, small_mk_image, TestSegment};
    use super::*;
    use crate::mock::MockPlatform;

    fn span_of(image: &[u8]) -> Span {
        Span::new(image.as_ptr(), image.len() as u64)
    }

    #[test]
    fn test_copy_from_user_rounds_to_pages() {
        let platform = MockPlatform::new(1);
        let image = small_mk_image();
        let mut file = ElfFile::copy_from_user(&platform, span_of(&image)).unwrap();
        assert_eq!(file.size() % PAGE_SIZE, 0);
        assert_eq!(&file.bytes()[..image.len()], &image[..]);
        file.free(&platform);
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_stage_extracts_load_segments() {
        let platform = MockPlatform::new(1);
        let image = small_mk_image();
        let mut file = ElfFile::copy_from_user(&platform, span_of(&image)).unwrap();
        let mut segments = ElfSegments::stage(&platform, &file).unwrap();

        assert_eq!(segments.entry(), 0x40_0000);
        assert_eq!(segments.segments().len(), 2);

        let text = &segments.segments()[0];
        assert!(text.executable());
        assert!(!text.writable());
        assert_eq!(unsafe { text.pages.as_slice() }[0], 0x90);

        let data = &segments.segments()[1];
        assert!(data.writable());
        assert_eq!(data.pages.size, 0x2000);
        // File bytes first, zero tail after.
        let bytes = unsafe { data.pages.as_slice() };
        assert_eq!(bytes[0xFF], 0xAA);
        assert_eq!(bytes[0x100], 0);

        segments.free(&platform);
        file.free(&platform);
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let platform = MockPlatform::new(1);
        let mut image = small_mk_image();
        image[0] = 0;
        let mut file = ElfFile::copy_from_user(&platform, span_of(&image)).unwrap();
        assert!(ElfSegments::stage(&platform, &file).is_err());
        file.free(&platform);
    }

    #[test]
    fn test_unaligned_vaddr_rejected() {
        let platform = MockPlatform::new(1);
        let image = build_elf(
            0x1000,
            &[TestSegment {
                vaddr: 0x1008,
                flags: elf64::PF_R | elf64::PF_X,
                data: vec![0x90; 16],
                memsz: 16,
            }],
        );
        let mut file = ElfFile::copy_from_user(&platform, span_of(&image)).unwrap();
        assert!(ElfSegments::stage(&platform, &file).is_err());
        file.free(&platform);
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_no_load_segments_rejected() {
        let platform = MockPlatform::new(1);
        let image = build_elf(0x1000, &[]);
        let mut file = ElfFile::copy_from_user(&platform, span_of(&image)).unwrap();
        assert!(ElfSegments::stage(&platform, &file).is_err());
        file.free(&platform);
    }

    #[test]
    fn test_stage_rollback_on_oom() {
        let platform = MockPlatform::new(1);
        let image = small_mk_image();
        let mut file = ElfFile::copy_from_user(&platform, span_of(&image)).unwrap();
        let before = platform.live_allocations();

        // First segment stages, second hits OOM; the first is released.
        platform.fail_allocation_number(2);
        assert!(ElfSegments::stage(&platform, &file).is_err());
        assert_eq!(platform.live_allocations(), before);
        file.free(&platform);
    }
}
