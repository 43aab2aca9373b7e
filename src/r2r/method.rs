//! Methods and their native code bodies.

use std::rc::Rc;

use crate::error::Result;
use crate::metadata::signature::{strip_arity, GenericContext, ModuleResolver, SignatureDecoder};
use crate::metadata::tables::{table, CodedIndex};
use crate::metadata::EcmaMetadata;
use crate::options::parse_number;

use super::native::FixupCell;
use super::unwind::{EhClause, UnwindInfo};

/// A byte range of the image, by RVA and file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub rva: u32,
    pub offset: usize,
    pub len: usize,
}

/// One contiguous native code body.
#[derive(Debug, Clone)]
pub struct RuntimeFunction {
    /// Index in the runtime function table.
    pub id: u32,
    pub start_rva: u32,
    pub size: u32,
    pub unwind_rva: u32,
    pub unwind: UnwindInfo,
    /// GC info of the main body; funclets have none.
    pub gc_info: Option<ByteSpan>,
    pub eh_clauses: Vec<EhClause>,
}

impl RuntimeFunction {
    /// True if `address` lies in `[start, start + size)`.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_rva
            && u64::from(address) < u64::from(self.start_rva) + u64::from(self.size)
    }

    pub fn end_rva(&self) -> u32 {
        self.start_rva.saturating_add(self.size)
    }
}

/// Where a method's entry point was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointKind {
    MethodDef,
    Instance,
}

/// A managed method with native code in the image.
#[derive(Debug, Clone)]
pub struct Method {
    pub rid: u32,
    pub token: u32,
    pub name: String,
    pub owning_type: String,
    pub return_type: String,
    pub parameters: Vec<String>,
    /// Method instantiation, or the generic parameter names of a generic definition.
    pub method_args: Vec<String>,
    /// `DeclaringType.Name<MethodArgs>(Param1, Param2)`.
    pub signature: String,
    pub signature_bytes: Vec<u8>,
    pub fixups: Vec<FixupCell>,
    pub entry_point: EntryPointKind,
    /// Main body first, then funclets.
    pub runtime_functions: Vec<RuntimeFunction>,
}

impl Method {
    /// Id of the runtime function the entry point refers to.
    pub fn entry_point_id(&self) -> Option<u32> {
        self.runtime_functions.first().map(|rtf| rtf.id)
    }

    /// Total size of all code bodies.
    pub fn code_size(&self) -> u64 {
        self.runtime_functions.iter().map(|rtf| u64::from(rtf.size)).sum()
    }

    /// Query matching, ignoring case and whitespace.
    ///
    /// Exact queries match the simple name, the signature with or without
    /// its parameter list, or a `.`-separated suffix of either. Partial
    /// queries match any substring of the return type plus signature.
    /// Numeric queries also match the row id or the token's row.
    pub fn matches(&self, query: &str, exact: bool) -> bool {
        if let Some(n) = parse_number(query) {
            if n == self.rid || n == self.token & 0x00FF_FFFF {
                return true;
            }
        }

        let q = squash(query);
        if q.is_empty() {
            return false;
        }

        if !exact {
            return squash(&format!("{}{}", self.return_type, self.signature)).contains(&q);
        }

        if self.name.to_lowercase() == q {
            return true;
        }
        let sig = squash(&self.signature);
        let without_params = sig.find('(').map_or(sig.as_str(), |i| &sig[..i]);
        [sig.as_str(), without_params].iter().any(|candidate| {
            *candidate == q
                || (candidate.len() > q.len()
                    && candidate.ends_with(&q)
                    && candidate.as_bytes()[candidate.len() - q.len() - 1] == b'.')
        })
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// The name and signature parts of a method, resolved from metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDescription {
    pub name: String,
    pub owning_type: String,
    pub return_type: String,
    pub parameters: Vec<String>,
    pub method_args: Vec<String>,
    pub signature: String,
    pub signature_bytes: Vec<u8>,
}

/// An owner type taken from an instance entry point signature.
#[derive(Debug, Clone, Default)]
pub struct OwnerType {
    pub name: String,
    pub args: Vec<String>,
}

/// Resolves a MethodDef or MemberRef token to its name and signature.
pub fn describe_method(
    metadata: &Rc<EcmaMetadata>,
    token: u32,
    owner: Option<OwnerType>,
    method_args: Vec<String>,
    modules: &mut dyn ModuleResolver,
) -> Result<MethodDescription> {
    let rid = token & 0x00FF_FFFF;
    let is_member_ref = (token >> 24) as u8 == table::MEMBER_REF;

    let (name, blob_index, declared_owner, type_owner, method_owner) = if is_member_ref {
        let row = metadata.member_ref(rid)?;
        let (owner_name, type_owner) = member_ref_parent(metadata, row.class, modules);
        (row.name, row.signature, owner_name, type_owner, None)
    } else {
        let row = metadata.method_def(rid)?;
        let type_owner = metadata.method_owner(rid);
        let owner_name = match type_owner {
            Some(t) => metadata
                .type_def_name(t)
                .map(|n| strip_arity(&n).to_string())
                .unwrap_or_else(|_| format!("{:#010x}", 0x0200_0000 | t)),
            None => String::new(),
        };
        (row.name, row.signature, owner_name, type_owner, Some(rid))
    };

    let (owning_type, type_args) = match owner {
        Some(o) => (o.name, o.args),
        None => (declared_owner, Vec::new()),
    };

    let blob = metadata.blob(blob_index)?;
    let context = GenericContext {
        type_args,
        method_args: method_args.clone(),
        type_owner,
        method_owner,
    };
    let sig = SignatureDecoder::new(Rc::clone(metadata), blob, &context)
        .with_modules(modules)
        .read_method_signature()?;

    let method_args = if !method_args.is_empty() {
        method_args
    } else {
        (0..sig.generic_param_count)
            .map(|n| {
                method_owner
                    .and_then(|m| metadata.generic_param_name(table::METHOD_DEF, m, n))
                    .unwrap_or_else(|| format!("!!{n}"))
            })
            .collect()
    };

    let mut signature = if owning_type.is_empty() {
        name.clone()
    } else {
        format!("{owning_type}.{name}")
    };
    if !method_args.is_empty() {
        signature.push_str(&format!("<{}>", method_args.join(", ")));
    }
    signature.push_str(&format!("({})", sig.parameters.join(", ")));

    Ok(MethodDescription {
        name,
        owning_type,
        return_type: sig.return_type,
        parameters: sig.parameters,
        method_args,
        signature,
        signature_bytes: blob.to_vec(),
    })
}

/// Display name of a `MemberRefParent`, and its TypeDef rid when local.
fn member_ref_parent(
    metadata: &Rc<EcmaMetadata>,
    coded: u32,
    modules: &mut dyn ModuleResolver,
) -> (String, Option<u32>) {
    let Some((parent_table, rid)) = CodedIndex::MemberRefParent.decode(coded) else {
        return (format!("{coded:#x}"), None);
    };
    let token = (u32::from(parent_table) << 24) | rid;
    let raw = || format!("{token:#010x}");

    match parent_table {
        table::TYPE_DEF => (
            metadata
                .type_def_name(rid)
                .map(|n| strip_arity(&n).to_string())
                .unwrap_or_else(|_| raw()),
            Some(rid),
        ),
        table::TYPE_REF => (
            metadata
                .type_ref_name(rid)
                .map(|n| strip_arity(&n).to_string())
                .unwrap_or_else(|_| raw()),
            None,
        ),
        table::TYPE_SPEC => {
            let context = GenericContext::default();
            let name = metadata
                .type_spec(rid)
                .and_then(|blob| {
                    SignatureDecoder::new(Rc::clone(metadata), blob, &context)
                        .with_modules(modules)
                        .read_type()
                })
                .unwrap_or_else(|_| raw());
            (name, None)
        }
        table::METHOD_DEF => {
            let owner = metadata.method_owner(rid);
            let name = owner
                .and_then(|t| metadata.type_def_name(t).ok())
                .map(|n| strip_arity(&n).to_string())
                .unwrap_or_else(raw);
            (name, owner)
        }
        _ => ("<Module>".to_string(), None),
    }
}
