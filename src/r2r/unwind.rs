//! Unwind info and exception clauses attached to runtime functions.

use std::fmt;

use crate::binary::{read_u16, read_u32, read_u8};
use crate::error::{R2rError, Result};

const AMD64_REGISTERS: [&str; 16] = [
    "RAX", "RCX", "RDX", "RBX", "RSP", "RBP", "RSI", "RDI", "R8", "R9", "R10", "R11", "R12",
    "R13", "R14", "R15",
];

const UNW_FLAG_EHANDLER: u8 = 0x1;
const UNW_FLAG_UHANDLER: u8 = 0x2;
const UNW_FLAG_CHAININFO: u8 = 0x4;

/// An x64 unwind operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    PushNonvol { register: u8 },
    AllocLarge { size: u32 },
    AllocSmall { size: u32 },
    SetFpreg,
    SaveNonvol { register: u8, offset: u32 },
    Epilog { info: u8 },
    SaveXmm128 { register: u8, offset: u32 },
    PushMachframe { error_code: bool },
    Other { op: u8, info: u8 },
}

/// One decoded x64 unwind code, possibly spanning several slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    pub code_offset: u8,
    pub op: UnwindOp,
}

impl fmt::Display for UnwindCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = |r: u8| AMD64_REGISTERS[(r & 0xF) as usize];
        write!(f, "CodeOffset: {:#04x} ", self.code_offset)?;
        match self.op {
            UnwindOp::PushNonvol { register } => write!(f, "UWOP_PUSH_NONVOL {}", reg(register)),
            UnwindOp::AllocLarge { size } => write!(f, "UWOP_ALLOC_LARGE {size:#x}"),
            UnwindOp::AllocSmall { size } => write!(f, "UWOP_ALLOC_SMALL {size:#x}"),
            UnwindOp::SetFpreg => write!(f, "UWOP_SET_FPREG"),
            UnwindOp::SaveNonvol { register, offset } => {
                write!(f, "UWOP_SAVE_NONVOL {} {offset:#x}", reg(register))
            }
            UnwindOp::Epilog { info } => write!(f, "UWOP_EPILOG {info:#x}"),
            UnwindOp::SaveXmm128 { register, offset } => {
                write!(f, "UWOP_SAVE_XMM128 XMM{register} {offset:#x}")
            }
            UnwindOp::PushMachframe { error_code } => {
                write!(f, "UWOP_PUSH_MACHFRAME error code: {error_code}")
            }
            UnwindOp::Other { op, info } => write!(f, "UWOP({op}) {info:#x}"),
        }
    }
}

/// x64 `UNWIND_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amd64UnwindInfo {
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    pub code_count: u8,
    pub frame_register: u8,
    pub frame_offset: u8,
    pub codes: Vec<UnwindCode>,
    pub personality_rva: u32,
    pub size: usize,
}

impl Amd64UnwindInfo {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let b0 = read_u8(data, offset)?;
        let version = b0 & 0x7;
        let flags = b0 >> 3;
        let prolog_size = read_u8(data, offset + 1)?;
        let code_count = read_u8(data, offset + 2)?;
        let frame = read_u8(data, offset + 3)?;

        let slot = |i: usize| read_u16(data, offset + 4 + 2 * i);
        let mut codes = Vec::new();
        let mut i = 0;
        while i < code_count as usize {
            let raw = slot(i)?;
            let code_offset = (raw & 0xFF) as u8;
            let op = ((raw >> 8) & 0xF) as u8;
            let info = (raw >> 12) as u8;
            let (op, extra) = match op {
                0 => (UnwindOp::PushNonvol { register: info }, 0),
                1 if info == 0 => (UnwindOp::AllocLarge { size: u32::from(slot(i + 1)?) * 8 }, 1),
                1 => {
                    let size = u32::from(slot(i + 1)?) | (u32::from(slot(i + 2)?) << 16);
                    (UnwindOp::AllocLarge { size }, 2)
                }
                2 => (UnwindOp::AllocSmall { size: u32::from(info) * 8 + 8 }, 0),
                3 => (UnwindOp::SetFpreg, 0),
                4 => {
                    let offset = u32::from(slot(i + 1)?) * 8;
                    (UnwindOp::SaveNonvol { register: info, offset }, 1)
                }
                5 => {
                    let offset = u32::from(slot(i + 1)?) | (u32::from(slot(i + 2)?) << 16);
                    (UnwindOp::SaveNonvol { register: info, offset }, 2)
                }
                6 if version >= 2 => (UnwindOp::Epilog { info }, 0),
                8 => {
                    let offset = u32::from(slot(i + 1)?) * 16;
                    (UnwindOp::SaveXmm128 { register: info, offset }, 1)
                }
                9 => {
                    let offset = u32::from(slot(i + 1)?) | (u32::from(slot(i + 2)?) << 16);
                    (UnwindOp::SaveXmm128 { register: info, offset }, 2)
                }
                10 => (UnwindOp::PushMachframe { error_code: info != 0 }, 0),
                6 => (UnwindOp::Other { op, info }, 1),
                _ => (UnwindOp::Other { op, info }, 2),
            };
            codes.push(UnwindCode { code_offset, op });
            i += 1 + extra;
        }

        // Codes are padded to an even count; R2R always appends the personality routine.
        let codes_size = 4 + 2 * code_count as usize;
        let aligned = (codes_size + 3) & !3;
        let personality_rva = read_u32(data, offset + aligned)?;

        Ok(Self {
            version,
            flags,
            prolog_size,
            code_count,
            frame_register: frame & 0xF,
            frame_offset: frame >> 4,
            codes,
            personality_rva,
            size: aligned + 4,
        })
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.flags & UNW_FLAG_EHANDLER != 0 {
            names.push("UNW_FLAG_EHANDLER");
        }
        if self.flags & UNW_FLAG_UHANDLER != 0 {
            names.push("UNW_FLAG_UHANDLER");
        }
        if self.flags & UNW_FLAG_CHAININFO != 0 {
            names.push("UNW_FLAG_CHAININFO");
        }
        if names.is_empty() {
            names.push("UNW_FLAG_NHANDLER");
        }
        names
    }

    pub fn frame_register_name(&self) -> Option<&'static str> {
        (self.frame_register != 0).then(|| AMD64_REGISTERS[self.frame_register as usize])
    }
}

/// ARM64 `.xdata` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arm64UnwindInfo {
    pub function_length: u32,
    pub version: u8,
    pub x_bit: bool,
    pub e_bit: bool,
    pub epilog_count: u32,
    pub code_words: u32,
    pub size: usize,
}

impl Arm64UnwindInfo {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let dw = read_u32(data, offset)?;
        let bits = |shift: u32, width: u32| (dw >> shift) & ((1 << width) - 1);

        let function_length = bits(0, 18) * 4;
        let version = bits(18, 2) as u8;
        let x_bit = bits(20, 1) != 0;
        let e_bit = bits(21, 1) != 0;
        let mut epilog_count = bits(22, 5);
        let mut code_words = bits(27, 5);

        let mut size = 4;
        if epilog_count == 0 && code_words == 0 {
            let ext = read_u32(data, offset + 4)?;
            epilog_count = ext & 0xFFFF;
            code_words = (ext >> 16) & 0xFF;
            size += 4;
        }
        if !e_bit {
            size += epilog_count as usize * 4;
        }
        size += code_words as usize * 4;
        if x_bit {
            size += 4;
        }
        if offset + size > data.len() {
            return Err(R2rError::malformed(offset, "ARM64 unwind info exceeds file bounds"));
        }

        Ok(Self {
            function_length,
            version,
            x_bit,
            e_bit,
            epilog_count,
            code_words,
            size,
        })
    }
}

/// Unwind info of one runtime function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindInfo {
    Amd64(Amd64UnwindInfo),
    Arm64(Arm64UnwindInfo),
    /// Architectures whose unwind format is not decoded.
    Undecoded,
}

impl UnwindInfo {
    /// Bytes covered by the unwind info, when known.
    pub fn size(&self) -> Option<usize> {
        match self {
            UnwindInfo::Amd64(info) => Some(info.size),
            UnwindInfo::Arm64(info) => Some(info.size),
            UnwindInfo::Undecoded => None,
        }
    }
}

/// Kind of exception clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Typed,
    Filter,
    Finally,
    Fault,
}

/// A native exception-handling clause, offsets relative to the method start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhClause {
    pub flags: u32,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    /// Class token for typed clauses, filter offset for filters.
    pub class_token_or_filter: u32,
}

impl EhClause {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            flags: read_u32(data, offset)?,
            try_start: read_u32(data, offset + 4)?,
            try_end: read_u32(data, offset + 8)?,
            handler_start: read_u32(data, offset + 12)?,
            handler_end: read_u32(data, offset + 16)?,
            class_token_or_filter: read_u32(data, offset + 20)?,
        })
    }

    pub fn kind(&self) -> ClauseKind {
        match self.flags & 0x7 {
            0 => ClauseKind::Typed,
            f if f & 0x1 != 0 => ClauseKind::Filter,
            f if f & 0x2 != 0 => ClauseKind::Finally,
            _ => ClauseKind::Fault,
        }
    }
}

impl fmt::Display for EhClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} try [{:#x}, {:#x}) handler [{:#x}, {:#x})",
            self.kind(),
            self.try_start,
            self.try_end,
            self.handler_start,
            self.handler_end
        )?;
        match self.kind() {
            ClauseKind::Typed => write!(f, " class {:#010x}", self.class_token_or_filter),
            ClauseKind::Filter => write!(f, " filter {:#x}", self.class_token_or_filter),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amd64_push_and_alloc() {
        // version 1, no flags, prolog 5, 2 codes, no frame register
        let data = [
            0x01, 0x05, 0x02, 0x00, // header
            0x05, 0x42, // offset 5: ALLOC_SMALL info 4 -> 0x28
            0x01, 0x50, // offset 1: PUSH_NONVOL RBP
            0x78, 0x56, 0x34, 0x12, // personality routine
        ];
        let info = Amd64UnwindInfo::parse(&data, 0).unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.prolog_size, 5);
        assert_eq!(info.codes.len(), 2);
        assert_eq!(info.codes[0].op, UnwindOp::AllocSmall { size: 0x28 });
        assert_eq!(info.codes[1].op, UnwindOp::PushNonvol { register: 5 });
        assert_eq!(info.codes[1].to_string(), "CodeOffset: 0x01 UWOP_PUSH_NONVOL RBP");
        assert_eq!(info.personality_rva, 0x1234_5678);
        assert_eq!(info.size, 12);
        assert_eq!(info.flag_names(), vec!["UNW_FLAG_NHANDLER"]);
    }

    #[test]
    fn amd64_odd_code_count_is_padded() {
        let data = [0x01, 0x01, 0x01, 0x00, 0x01, 0x50, 0x00, 0x00, 0xEF, 0xBE, 0, 0];
        let info = Amd64UnwindInfo::parse(&data, 0).unwrap();
        assert_eq!(info.size, 12);
        assert_eq!(info.personality_rva, 0xBEEF);
    }

    #[test]
    fn arm64_header_sizes() {
        // FunctionLength 0x10 words, E bit set, 1 epilog, 2 code words.
        let dw: u32 = 0x10 | (1 << 21) | (1 << 22) | (2 << 27);
        let mut data = dw.to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 8]);
        let info = Arm64UnwindInfo::parse(&data, 0).unwrap();
        assert_eq!(info.function_length, 0x40);
        assert!(info.e_bit);
        assert_eq!(info.size, 12);

        // Extended header: 3 epilog scopes, 1 code word.
        let mut ext = 0u32.to_le_bytes().to_vec();
        ext.extend_from_slice(&(3u32 | (1 << 16)).to_le_bytes());
        ext.extend_from_slice(&[0; 16]);
        let info = Arm64UnwindInfo::parse(&ext, 0).unwrap();
        assert_eq!(info.epilog_count, 3);
        assert_eq!(info.size, 8 + 12 + 4);
    }

    #[test]
    fn clause_kinds() {
        let mut data = Vec::new();
        for v in [2u32, 0x10, 0x20, 0x30, 0x40, 0] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let clause = EhClause::parse(&data, 0).unwrap();
        assert_eq!(clause.kind(), ClauseKind::Finally);
        assert_eq!(clause.to_string(), "Finally try [0x10, 0x20) handler [0x30, 0x40)");
    }
}
