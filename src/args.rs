//! Start request payload.
//!
//! The request arrives from user space as a packed little-endian record:
//!
//! ```text
//! offset 0   u64       ver             (must be 1)
//! offset 8   span      mk_elf_file     (addr u64, size u64)
//! offset 24  span[2]   ext_elf_files   (MAX_EXTENSIONS entries)
//! offset 56  u32       page_pool_size  (pages; 0 = default)
//! ```
//!
//! The record is copied out of user memory exactly once; after
//! [`StartArgs::copy_from_user`] returns, the user-supplied pointer is
//! never touched again. The embedded spans still point into user memory
//! and are themselves copied by the ELF staging step.

use crate::error::{Error, Result};
use crate::layout::{MAX_ELF_FILE_SIZE, MAX_EXTENSIONS};
use crate::platform::Platform;
use crate::span::Span;

/// Supported ABI version.
pub const ABI_VERSION: u64 = 1;

/// Field offsets within the packed request record.
#[allow(dead_code)]
mod wire {
    pub const VER: usize = 0;
    pub const MK_ELF_FILE: usize = 8;
    pub const EXT_ELF_FILES: usize = 24;
    pub const PAGE_POOL_SIZE: usize = 24 + super::MAX_EXTENSIONS * 16;
}

/// Arguments to a `start` request.
#[derive(Debug, Clone, Copy)]
pub struct StartArgs {
    /// ABI version of the request.
    pub ver: u64,
    /// User-memory span of the microkernel ELF image.
    pub mk_elf_file: Span,
    /// User-memory spans of the extension ELF images. Unused slots are
    /// the empty span.
    pub ext_elf_files: [Span; MAX_EXTENSIONS],
    /// Requested page pool size in pages; 0 selects the default.
    pub page_pool_size: u32,
}

impl StartArgs {
    /// Size of the packed wire record in bytes.
    pub const WIRE_SIZE: usize = wire::PAGE_POOL_SIZE + 4;

    /// Copy the request record out of user memory.
    pub fn copy_from_user(platform: &dyn Platform, user_args: *const u8) -> Result<Self> {
        if user_args.is_null() {
            log::error!("start request pointer is null");
            return Err(Error::InvalidArgument("start request pointer is null".into()));
        }

        let mut raw = [0u8; Self::WIRE_SIZE];
        if platform.copy_from_user(&mut raw, user_args) != 0 {
            log::error!("copying the start request from user memory faulted");
            return Err(Error::UserCopyFault);
        }

        Ok(Self::parse(&raw))
    }

    /// Decode a packed wire record.
    pub fn parse(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut ext_elf_files = [Span::empty(); MAX_EXTENSIONS];
        for (idx, slot) in ext_elf_files.iter_mut().enumerate() {
            *slot = read_span(raw, wire::EXT_ELF_FILES + idx * 16);
        }

        Self {
            ver: read_u64(raw, wire::VER),
            mk_elf_file: read_span(raw, wire::MK_ELF_FILE),
            ext_elf_files,
            page_pool_size: u32::from_le_bytes(
                raw[wire::PAGE_POOL_SIZE..wire::PAGE_POOL_SIZE + 4]
                    .try_into()
                    .unwrap(),
            ),
        }
    }

    /// Validate the decoded record.
    pub fn validate(&self) -> Result<()> {
        if self.ver != ABI_VERSION {
            return Err(Error::InvalidArgument(format!(
                "ABI version {} is not supported",
                self.ver
            )));
        }

        if self.mk_elf_file.addr.is_null() {
            return Err(Error::InvalidArgument("the microkernel is required".into()));
        }

        if self.mk_elf_file.size == 0 || self.mk_elf_file.size >= MAX_ELF_FILE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "mk_elf_file.size 0x{:x} is invalid",
                self.mk_elf_file.size
            )));
        }

        if self.ext_elf_files[0].addr.is_null() {
            return Err(Error::InvalidArgument(
                "at least one extension is required".into(),
            ));
        }

        for (idx, ext) in self.ext_elf_files.iter().enumerate() {
            if ext.addr.is_null() != (ext.size == 0) {
                return Err(Error::InvalidArgument(format!(
                    "ext_elf_files[{idx}] address/size combination is invalid"
                )));
            }
            if ext.size >= MAX_ELF_FILE_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "ext_elf_files[{idx}].size 0x{:x} is invalid",
                    ext.size
                )));
            }
        }

        Ok(())
    }
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap())
}

fn read_span(raw: &[u8], offset: usize) -> Span {
    Span {
        addr: read_u64(raw, offset) as *const u8,
        size: read_u64(raw, offset + 8),
    }
}
