//! Signature blob decoding.
//!
//! Decodes ECMA-335 method and type signatures, plus the R2R extensions
//! (`__Canon`, module overrides) that appear in instance entry point
//! signatures, straight into display text.

use std::rc::Rc;

use super::tables::{table, CodedIndex};
use super::EcmaMetadata;
use crate::error::{R2rError, Result};

pub const ELEMENT_TYPE_VOID: u8 = 0x01;
pub const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
pub const ELEMENT_TYPE_CHAR: u8 = 0x03;
pub const ELEMENT_TYPE_I1: u8 = 0x04;
pub const ELEMENT_TYPE_U1: u8 = 0x05;
pub const ELEMENT_TYPE_I2: u8 = 0x06;
pub const ELEMENT_TYPE_U2: u8 = 0x07;
pub const ELEMENT_TYPE_I4: u8 = 0x08;
pub const ELEMENT_TYPE_U4: u8 = 0x09;
pub const ELEMENT_TYPE_I8: u8 = 0x0a;
pub const ELEMENT_TYPE_U8: u8 = 0x0b;
pub const ELEMENT_TYPE_R4: u8 = 0x0c;
pub const ELEMENT_TYPE_R8: u8 = 0x0d;
pub const ELEMENT_TYPE_STRING: u8 = 0x0e;
pub const ELEMENT_TYPE_PTR: u8 = 0x0f;
pub const ELEMENT_TYPE_BYREF: u8 = 0x10;
pub const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
pub const ELEMENT_TYPE_CLASS: u8 = 0x12;
pub const ELEMENT_TYPE_VAR: u8 = 0x13;
pub const ELEMENT_TYPE_ARRAY: u8 = 0x14;
pub const ELEMENT_TYPE_GENERICINST: u8 = 0x15;
pub const ELEMENT_TYPE_TYPEDBYREF: u8 = 0x16;
pub const ELEMENT_TYPE_I: u8 = 0x18;
pub const ELEMENT_TYPE_U: u8 = 0x19;
pub const ELEMENT_TYPE_FNPTR: u8 = 0x1b;
pub const ELEMENT_TYPE_OBJECT: u8 = 0x1c;
pub const ELEMENT_TYPE_SZARRAY: u8 = 0x1d;
pub const ELEMENT_TYPE_MVAR: u8 = 0x1e;
pub const ELEMENT_TYPE_CMOD_REQD: u8 = 0x1f;
pub const ELEMENT_TYPE_CMOD_OPT: u8 = 0x20;
pub const ELEMENT_TYPE_SENTINEL: u8 = 0x41;
pub const ELEMENT_TYPE_PINNED: u8 = 0x45;
/// R2R: a native value type wrapper.
pub const ELEMENT_TYPE_NATIVE_VALUETYPE_ZAPSIG: u8 = 0x3d;
/// R2R: the shared canonical type `System.__Canon`.
pub const ELEMENT_TYPE_CANON_ZAPSIG: u8 = 0x3e;
/// R2R: the following type lives in another module.
pub const ELEMENT_TYPE_MODULE_ZAPSIG: u8 = 0x3f;

const SIG_GENERIC: u8 = 0x10;
const SIG_HASTHIS: u8 = 0x20;
const MAX_DEPTH: u32 = 64;

/// Reads an ECMA-335 compressed unsigned integer (II.23.2).
pub fn read_compressed_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let at = |i: usize| {
        data.get(i)
            .map(|&b| u32::from(b))
            .ok_or_else(|| R2rError::malformed(i, "compressed integer truncated"))
    };

    let first = at(*pos)?;
    let (value, len) = if first & 0x80 == 0 {
        (first, 1)
    } else if first & 0xC0 == 0x80 {
        (((first & 0x3F) << 8) | at(*pos + 1)?, 2)
    } else if first & 0xE0 == 0xC0 {
        (
            ((first & 0x1F) << 24) | (at(*pos + 1)? << 16) | (at(*pos + 2)? << 8) | at(*pos + 3)?,
            4,
        )
    } else {
        return Err(R2rError::malformed(*pos, "invalid compressed integer"));
    };
    *pos += len;
    Ok(value)
}

/// Resolves the module index of an `ELEMENT_TYPE_MODULE_ZAPSIG` prefix.
pub trait ModuleResolver {
    /// Returns the metadata of module `index`, or a label to show with
    /// raw tokens when the module cannot be loaded.
    fn resolve_module(&mut self, index: u32) -> std::result::Result<Rc<EcmaMetadata>, String>;
}

/// Generic arguments and declaring entities used to render `VAR`/`MVAR`.
#[derive(Debug, Clone, Default)]
pub struct GenericContext {
    pub type_args: Vec<String>,
    pub method_args: Vec<String>,
    /// TypeDef that declares the type parameters.
    pub type_owner: Option<u32>,
    /// MethodDef that declares the method parameters.
    pub method_owner: Option<u32>,
}

/// A decoded method signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSignature {
    pub has_this: bool,
    pub generic_param_count: u32,
    pub return_type: String,
    pub parameters: Vec<String>,
}

/// Cursor over one signature blob.
pub struct SignatureDecoder<'a> {
    metadata: Rc<EcmaMetadata>,
    data: &'a [u8],
    pos: usize,
    context: &'a GenericContext,
    modules: Option<&'a mut dyn ModuleResolver>,
    /// Set while decoding inside a module override that could not be loaded.
    unresolved_module: Option<String>,
    depth: u32,
}

impl<'a> SignatureDecoder<'a> {
    pub fn new(metadata: Rc<EcmaMetadata>, data: &'a [u8], context: &'a GenericContext) -> Self {
        Self {
            metadata,
            data,
            pos: 0,
            context,
            modules: None,
            unresolved_module: None,
            depth: 0,
        }
    }

    /// Enables module override resolution.
    pub fn with_modules(mut self, modules: &'a mut dyn ModuleResolver) -> Self {
        self.modules = Some(modules);
        self
    }

    /// Current position within the blob.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| R2rError::malformed(self.pos, "signature truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn peek_u8(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| R2rError::malformed(self.pos, "signature truncated"))
    }

    pub fn read_compressed(&mut self) -> Result<u32> {
        read_compressed_u32(self.data, &mut self.pos)
    }

    /// Decodes a `MethodDefSig`/`MethodRefSig`.
    pub fn read_method_signature(&mut self) -> Result<MethodSignature> {
        let conv = self.read_u8()?;
        let generic_param_count = if conv & SIG_GENERIC != 0 {
            self.read_compressed()?
        } else {
            0
        };
        let count = self.read_compressed()?;
        let return_type = self.read_type()?;

        let mut parameters = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            if self.peek_u8()? == ELEMENT_TYPE_SENTINEL {
                self.pos += 1;
                parameters.push("...".to_string());
            }
            parameters.push(self.read_type()?);
        }

        Ok(MethodSignature {
            has_this: conv & SIG_HASTHIS != 0,
            generic_param_count,
            return_type,
            parameters,
        })
    }

    /// Decodes a type, returning its display name.
    pub fn read_type(&mut self) -> Result<String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(R2rError::malformed(self.pos, "signature nesting too deep"));
        }
        let result = self.read_type_inner();
        self.depth -= 1;
        result
    }

    /// Decodes a type and, for generic instantiations, also returns the
    /// rendered type arguments so callers can substitute `!n`.
    pub fn read_type_with_args(&mut self) -> Result<(String, Vec<String>)> {
        if self.peek_u8()? != ELEMENT_TYPE_GENERICINST {
            return Ok((self.read_type()?, Vec::new()));
        }
        self.pos += 1;
        let (name, args) = self.read_generic_inst()?;
        Ok((format!("{}<{}>", name, args.join(", ")), args))
    }

    fn read_type_inner(&mut self) -> Result<String> {
        let start = self.pos;
        let element = self.read_u8()?;
        let name = match element {
            ELEMENT_TYPE_VOID => "void".to_string(),
            ELEMENT_TYPE_BOOLEAN => "bool".to_string(),
            ELEMENT_TYPE_CHAR => "char".to_string(),
            ELEMENT_TYPE_I1 => "sbyte".to_string(),
            ELEMENT_TYPE_U1 => "byte".to_string(),
            ELEMENT_TYPE_I2 => "short".to_string(),
            ELEMENT_TYPE_U2 => "ushort".to_string(),
            ELEMENT_TYPE_I4 => "int".to_string(),
            ELEMENT_TYPE_U4 => "uint".to_string(),
            ELEMENT_TYPE_I8 => "long".to_string(),
            ELEMENT_TYPE_U8 => "ulong".to_string(),
            ELEMENT_TYPE_R4 => "float".to_string(),
            ELEMENT_TYPE_R8 => "double".to_string(),
            ELEMENT_TYPE_STRING => "string".to_string(),
            ELEMENT_TYPE_OBJECT => "object".to_string(),
            ELEMENT_TYPE_I => "IntPtr".to_string(),
            ELEMENT_TYPE_U => "UIntPtr".to_string(),
            ELEMENT_TYPE_TYPEDBYREF => "TypedReference".to_string(),
            ELEMENT_TYPE_CANON_ZAPSIG => "__Canon".to_string(),
            ELEMENT_TYPE_PTR => format!("{}*", self.read_type()?),
            ELEMENT_TYPE_BYREF => format!("ref {}", self.read_type()?),
            ELEMENT_TYPE_PINNED | ELEMENT_TYPE_NATIVE_VALUETYPE_ZAPSIG => self.read_type()?,
            ELEMENT_TYPE_SZARRAY => format!("{}[]", self.read_type()?),
            ELEMENT_TYPE_CLASS | ELEMENT_TYPE_VALUETYPE => {
                let coded = self.read_compressed()?;
                self.type_def_or_ref_name(coded)
            }
            ELEMENT_TYPE_CMOD_REQD | ELEMENT_TYPE_CMOD_OPT => {
                self.read_compressed()?;
                self.read_type()?
            }
            ELEMENT_TYPE_VAR => {
                let n = self.read_compressed()?;
                self.generic_name(n, false)
            }
            ELEMENT_TYPE_MVAR => {
                let n = self.read_compressed()?;
                self.generic_name(n, true)
            }
            ELEMENT_TYPE_GENERICINST => {
                let (name, args) = self.read_generic_inst()?;
                format!("{}<{}>", name, args.join(", "))
            }
            ELEMENT_TYPE_ARRAY => {
                let element = self.read_type()?;
                let rank = self.read_compressed()?;
                let sizes = self.read_compressed()?;
                for _ in 0..sizes {
                    self.read_compressed()?;
                }
                let lower_bounds = self.read_compressed()?;
                for _ in 0..lower_bounds {
                    self.read_compressed()?;
                }
                format!("{}[{}]", element, ",".repeat(rank.saturating_sub(1) as usize))
            }
            ELEMENT_TYPE_FNPTR => {
                let sig = self.read_method_signature()?;
                format!("method {} *({})", sig.return_type, sig.parameters.join(", "))
            }
            ELEMENT_TYPE_MODULE_ZAPSIG => {
                let index = self.read_compressed()?;
                self.read_type_in_module(index)?
            }
            other => {
                return Err(R2rError::malformed(
                    start,
                    format!("unknown element type {other:#04x}"),
                ))
            }
        };
        Ok(name)
    }

    fn read_generic_inst(&mut self) -> Result<(String, Vec<String>)> {
        let base = self.read_type()?;
        let count = self.read_compressed()?;
        let mut args = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            args.push(self.read_type()?);
        }
        Ok((strip_arity(&base).to_string(), args))
    }

    fn read_type_in_module(&mut self, index: u32) -> Result<String> {
        let lookup = match self.modules.as_deref_mut() {
            Some(modules) => modules.resolve_module(index),
            None => Err(format!("#{index}")),
        };

        match lookup {
            Ok(metadata) => {
                let saved = std::mem::replace(&mut self.metadata, metadata);
                let name = self.read_type();
                self.metadata = saved;
                name
            }
            Err(label) => {
                let saved = self.unresolved_module.replace(label);
                let name = self.read_type();
                self.unresolved_module = saved;
                name
            }
        }
    }

    fn generic_name(&self, n: u32, method: bool) -> String {
        let (args, owner) = if method {
            (&self.context.method_args, self.context.method_owner.map(|o| (table::METHOD_DEF, o)))
        } else {
            (&self.context.type_args, self.context.type_owner.map(|o| (table::TYPE_DEF, o)))
        };

        if let Some(arg) = args.get(n as usize) {
            return arg.clone();
        }
        owner
            .and_then(|(t, rid)| self.metadata.generic_param_name(t, rid, n))
            .unwrap_or_else(|| format!("{}{}", if method { "!!" } else { "!" }, n))
    }

    /// Renders a `TypeDefOrRef` coded token; falls back to the raw token.
    fn type_def_or_ref_name(&mut self, coded: u32) -> String {
        let Some((table, rid)) = CodedIndex::TypeDefOrRef.decode(coded) else {
            return format!("{coded:#x}");
        };
        let token = (u32::from(table) << 24) | rid;

        if let Some(label) = &self.unresolved_module {
            return format!("[{label}]{token:#010x}");
        }

        let name = match table {
            table::TYPE_DEF => self.metadata.type_def_name(rid),
            table::TYPE_REF => self.metadata.type_ref_name(rid),
            _ => self.type_spec_name(rid),
        };
        name.unwrap_or_else(|_| format!("{token:#010x}"))
    }

    fn type_spec_name(&mut self, rid: u32) -> Result<String> {
        let metadata = Rc::clone(&self.metadata);
        let blob = metadata.type_spec(rid)?;
        let mut nested = SignatureDecoder::new(Rc::clone(&metadata), blob, self.context);
        if let Some(modules) = self.modules.as_deref_mut() {
            nested = nested.with_modules(modules);
        }
        nested.depth = self.depth;
        nested.read_type()
    }
}

/// Drops the "`N" arity suffix of a generic type name.
pub fn strip_arity(name: &str) -> &str {
    match name.rfind('`') {
        Some(i) if name[i + 1..].chars().all(|c| c.is_ascii_digit()) => &name[..i],
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_integers() {
        let data = [0x03, 0x80, 0x80, 0xC0, 0x00, 0x40, 0x00, 0xFF];
        let mut pos = 0;
        assert_eq!(read_compressed_u32(&data, &mut pos).unwrap(), 3);
        assert_eq!(read_compressed_u32(&data, &mut pos).unwrap(), 0x80);
        assert_eq!(pos, 3);
        assert_eq!(read_compressed_u32(&data, &mut pos).unwrap(), 0x4000);
        assert_eq!(pos, 7);
        assert!(read_compressed_u32(&data, &mut pos).is_err());
    }

    #[test]
    fn arity_suffix() {
        assert_eq!(strip_arity("List`1"), "List");
        assert_eq!(strip_arity("Dictionary`2"), "Dictionary");
        assert_eq!(strip_arity("Plain"), "Plain");
        assert_eq!(strip_arity("Odd`x"), "Odd`x");
    }
}
