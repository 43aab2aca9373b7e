//! PE container access.
//!
//! ReadyToRun code always lives inside a PE image, even on non-Windows
//! targets. This module validates the container, keeps its section table
//! for RVA translation, and exposes the few header fields the R2R reader
//! needs (machine, image base, CLI header, exports).

mod pe;

use std::fmt;

use crate::error::{R2rError, Result};

pub use pe::{Cor20Header, PeLayout};

/// Information about a section in the binary.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub name: String,
    pub rva: u32,
    pub virtual_size: u32,
    pub file_offset: u64,
    pub raw_size: u64,
}

impl SectionInfo {
    /// Returns true if `rva` falls inside the section's file-backed range.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva && u64::from(rva - self.rva) < self.raw_size
    }

    /// RVA one past the last file-backed byte.
    pub fn end_rva(&self) -> u32 {
        self.rva.saturating_add(self.raw_size as u32)
    }
}

/// CPU architecture of the native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    I386,
    Amd64,
    ArmThumb2,
    Arm64,
    LoongArch64,
    RiscV64,
    Unknown(u16),
}

/// Operating system the image was compiled for.
///
/// Non-Windows R2R images XOR the machine field with an OS specific value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetOs {
    Windows,
    Apple,
    FreeBsd,
    Linux,
    NetBsd,
    SunOs,
}

const IMAGE_FILE_MACHINE_LOONGARCH64: u16 = 0x6264;
const IMAGE_FILE_MACHINE_RISCV64: u16 = 0x5064;

const OS_OVERRIDES: [(TargetOs, u16); 6] = [
    (TargetOs::Windows, 0),
    (TargetOs::Apple, 0x4644),
    (TargetOs::FreeBsd, 0xADC4),
    (TargetOs::Linux, 0x7B79),
    (TargetOs::NetBsd, 0x1993),
    (TargetOs::SunOs, 0x1992),
];

/// The decoded COFF machine field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Machine {
    pub raw: u16,
    pub architecture: Architecture,
    pub os: TargetOs,
}

impl Machine {
    /// Splits a raw machine value into architecture and target OS.
    pub fn decode(raw: u16) -> Self {
        for (os, mask) in OS_OVERRIDES {
            let architecture = match raw ^ mask {
                object::pe::IMAGE_FILE_MACHINE_I386 => Architecture::I386,
                object::pe::IMAGE_FILE_MACHINE_AMD64 => Architecture::Amd64,
                object::pe::IMAGE_FILE_MACHINE_ARMNT => Architecture::ArmThumb2,
                object::pe::IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
                IMAGE_FILE_MACHINE_LOONGARCH64 => Architecture::LoongArch64,
                IMAGE_FILE_MACHINE_RISCV64 => Architecture::RiscV64,
                _ => continue,
            };
            return Self {
                raw,
                architecture,
                os,
            };
        }

        Self {
            raw,
            architecture: Architecture::Unknown(raw),
            os: TargetOs::Windows,
        }
    }

    /// Size of a target pointer in bytes.
    pub fn pointer_size(&self) -> usize {
        match self.architecture {
            Architecture::I386 | Architecture::ArmThumb2 => 4,
            _ => 8,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.architecture {
            Architecture::Unknown(raw) => write!(f, "Unknown({raw:#06x})"),
            arch => write!(f, "{arch:?}"),
        }?;
        if self.os != TargetOs::Windows {
            write!(f, " ({:?})", self.os)?;
        }
        Ok(())
    }
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset)
        .copied()
        .ok_or_else(|| R2rError::malformed(offset, "read past end of data"))
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data
        .get(offset..offset.wrapping_add(2))
        .ok_or_else(|| R2rError::malformed(offset, "read past end of data"))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset.wrapping_add(4))
        .ok_or_else(|| R2rError::malformed(offset, "read past end of data"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    let lo = read_u32(data, offset)?;
    let hi = read_u32(data, offset + 4)?;
    Ok(u64::from(lo) | (u64::from(hi) << 32))
}

/// Reads a NUL terminated ASCII string starting at `offset`.
pub(crate) fn read_cstr(data: &[u8], offset: usize) -> Result<String> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| R2rError::malformed(offset, "string offset out of bounds"))?;
    let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}
