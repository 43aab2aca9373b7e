//! Disassembler adapter over `iced-x86`.

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::binary::{Architecture, Machine};
use crate::error::{R2rError, Result};

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub text: String,
}

/// Decoder for the code of one image's machine.
#[derive(Debug, Clone, Copy)]
pub struct Disassembler {
    bitness: u32,
}

impl Disassembler {
    /// Fails for architectures the decoder does not handle.
    pub fn new(machine: Machine) -> Result<Self> {
        let bitness = match machine.architecture {
            Architecture::I386 => 32,
            Architecture::Amd64 => 64,
            _ => {
                return Err(R2rError::UnsupportedArchitecture(format!(
                    "no disassembler for {machine}"
                )))
            }
        };
        Ok(Self { bitness })
    }

    /// Lazily decodes `code` as if loaded at `base_address`.
    ///
    /// Every call starts a fresh decoder, so the same range can be decoded
    /// any number of times.
    pub fn disassemble<'a>(&self, code: &'a [u8], base_address: u64) -> Instructions<'a> {
        let mut decoder = Decoder::new(self.bitness, code, DecoderOptions::NONE);
        decoder.set_ip(base_address);
        Instructions {
            decoder,
            formatter: IntelFormatter::new(),
            code,
            base_address,
        }
    }
}

/// Iterator returned by [`Disassembler::disassemble`].
pub struct Instructions<'a> {
    decoder: Decoder<'a>,
    formatter: IntelFormatter,
    code: &'a [u8],
    base_address: u64,
}

impl Iterator for Instructions<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.decoder.can_decode() {
            return None;
        }

        let instr = self.decoder.decode();
        let mut text = String::new();
        self.formatter.format(&instr, &mut text);

        let start = instr.ip().wrapping_sub(self.base_address) as usize;
        let end = (start + instr.len()).min(self.code.len());
        Some(Instruction {
            address: instr.ip(),
            bytes: self.code.get(start..end).unwrap_or_default().to_vec(),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_x64_prolog() {
        let code = [0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3];
        let disasm = Disassembler::new(Machine::decode(0x8664)).unwrap();
        let instrs: Vec<_> = disasm.disassemble(&code, 0x1000).collect();
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[0].address, 0x1000);
        assert_eq!(instrs[0].text, "push rbp");
        assert_eq!(instrs[1].bytes, vec![0x48, 0x89, 0xE5]);
        assert_eq!(instrs[3].text, "ret");
    }

    #[test]
    fn restartable() {
        let code = [0x90, 0xC3];
        let disasm = Disassembler::new(Machine::decode(0x14C)).unwrap();
        let first: Vec<_> = disasm.disassemble(&code, 0).collect();
        let second: Vec<_> = disasm.disassemble(&code, 0).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn arm64_is_unsupported() {
        let err = Disassembler::new(Machine::decode(0xAA64)).unwrap_err();
        assert!(matches!(err, R2rError::UnsupportedArchitecture(_)));
    }
}
