//! ECMA-335 metadata reader.
//!
//! A thin, read-only view over the metadata tables of a managed assembly:
//! just enough to turn tokens into type names, method names and
//! signatures for the native code the R2R sections describe.

pub mod signature;
pub mod tables;

use std::ops::Range;
use std::path::Path;

use tracing::debug;

use crate::binary::{read_cstr, read_u16, read_u32, read_u64, read_u8, PeLayout};
use crate::error::{R2rError, Result};
use signature::read_compressed_u32;
use tables::{table, CodedIndex, HeapSizes, TableLayout, TABLE_SLOTS};

/// Metadata root signature ("BSJB").
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// A TypeDef row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefRow {
    pub flags: u32,
    pub name: String,
    pub namespace: String,
    pub method_list: u32,
}

/// A MethodDef row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDefRow {
    pub rva: u32,
    pub flags: u16,
    pub name: String,
    pub signature: u32,
}

/// A MemberRef row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRefRow {
    /// `MemberRefParent` coded index.
    pub class: u32,
    pub name: String,
    pub signature: u32,
}

/// Parsed metadata of one assembly.
#[derive(Debug, Clone)]
pub struct EcmaMetadata {
    data: Vec<u8>,
    version: String,
    strings: Range<usize>,
    blobs: Range<usize>,
    layout: TableLayout,
    /// Declaring TypeDef rid of every MethodDef, indexed by `rid - 1`.
    method_owners: Vec<u32>,
}

impl EcmaMetadata {
    /// Parses a metadata blob (starting with the BSJB root).
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if read_u32(&data, 0)? != METADATA_SIGNATURE {
            return Err(R2rError::format("Invalid metadata signature"));
        }

        let version_len = read_u32(&data, 12)? as usize;
        let version_bytes = data
            .get(16..16 + version_len)
            .ok_or_else(|| R2rError::malformed(16, "metadata version string truncated"))?;
        let version = read_cstr(version_bytes, 0)?;
        let streams_header = 16 + version_len;
        let stream_count = read_u16(&data, streams_header + 2)?;

        let mut tables = None;
        let mut strings = 0..0;
        let mut blobs = 0..0;
        let mut offset = streams_header + 4;
        for _ in 0..stream_count {
            let stream_offset = read_u32(&data, offset)? as usize;
            let stream_size = read_u32(&data, offset + 4)? as usize;
            let name = read_cstr(&data, offset + 8)?;
            offset += 8 + ((name.len() + 4) & !3);

            let range = stream_offset..stream_offset.saturating_add(stream_size);
            if range.end > data.len() {
                return Err(R2rError::malformed(
                    stream_offset,
                    format!("stream {name} exceeds metadata bounds"),
                ));
            }
            match name.as_str() {
                "#~" | "#-" => tables = Some(range),
                "#Strings" => strings = range,
                "#Blob" => blobs = range,
                _ => {}
            }
        }

        let tables = tables.ok_or_else(|| R2rError::format("Metadata has no table stream"))?;
        let layout = read_table_header(&data, tables.start)?;
        debug!(version = %version, "parsed metadata root");

        let mut metadata = Self {
            data,
            version,
            strings,
            blobs,
            layout,
            method_owners: Vec::new(),
        };
        metadata.method_owners = metadata.compute_method_owners()?;
        Ok(metadata)
    }

    /// Loads the metadata of a managed PE file.
    pub fn from_pe(data: &[u8]) -> Result<Self> {
        let layout = PeLayout::parse(data)?;
        let cor20 = layout
            .cor20
            .ok_or_else(|| R2rError::format("Image has no CLI header"))?;
        let bytes = layout.bytes_at(data, cor20.metadata_rva, cor20.metadata_size as usize)?;
        Self::parse(bytes.to_vec())
    }

    /// Maps and loads the metadata of a managed PE file on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Self::from_pe(&mmap)
    }

    /// Runtime version string from the metadata root.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: u8) -> u32 {
        self.layout.rows.get(table as usize).copied().unwrap_or(0)
    }

    /// Reads one cell. `rid` is 1-based.
    pub fn cell(&self, table: u8, rid: u32, col: usize) -> Result<u32> {
        if rid == 0 || rid > self.row_count(table) {
            return Err(R2rError::format(format!(
                "Token {:#010x} out of range",
                (u32::from(table) << 24) | rid
            )));
        }
        let (col_offset, width) = self
            .layout
            .column(table, col)
            .ok_or_else(|| R2rError::format(format!("Table {table:#x} has no column {col}")))?;
        let offset = self.layout.offsets[table as usize]
            + self.layout.row_sizes[table as usize] * (rid as usize - 1)
            + col_offset;
        match width {
            2 => read_u16(&self.data, offset).map(u32::from),
            _ => read_u32(&self.data, offset),
        }
    }

    /// String from the `#Strings` heap.
    pub fn string(&self, index: u32) -> Result<String> {
        if index == 0 {
            return Ok(String::new());
        }
        read_cstr(&self.data[self.strings.clone()], index as usize)
    }

    /// Blob from the `#Blob` heap, without its length prefix.
    pub fn blob(&self, index: u32) -> Result<&[u8]> {
        let heap = &self.data[self.blobs.clone()];
        let mut pos = index as usize;
        let len = read_compressed_u32(heap, &mut pos)? as usize;
        heap.get(pos..pos + len)
            .ok_or_else(|| R2rError::malformed(pos, "blob exceeds heap bounds"))
    }

    /// Name of the assembly described by this metadata.
    pub fn assembly_name(&self) -> Option<String> {
        self.cell(table::ASSEMBLY, 1, 7)
            .and_then(|idx| self.string(idx))
            .ok()
    }

    /// Simple name of an AssemblyRef row.
    pub fn assembly_ref_name(&self, rid: u32) -> Result<String> {
        self.string(self.cell(table::ASSEMBLY_REF, rid, 6)?)
    }

    pub fn type_def(&self, rid: u32) -> Result<TypeDefRow> {
        Ok(TypeDefRow {
            flags: self.cell(table::TYPE_DEF, rid, 0)?,
            name: self.string(self.cell(table::TYPE_DEF, rid, 1)?)?,
            namespace: self.string(self.cell(table::TYPE_DEF, rid, 2)?)?,
            method_list: self.cell(table::TYPE_DEF, rid, 5)?,
        })
    }

    pub fn method_def(&self, rid: u32) -> Result<MethodDefRow> {
        Ok(MethodDefRow {
            rva: self.cell(table::METHOD_DEF, rid, 0)?,
            flags: self.cell(table::METHOD_DEF, rid, 2)? as u16,
            name: self.string(self.cell(table::METHOD_DEF, rid, 3)?)?,
            signature: self.cell(table::METHOD_DEF, rid, 4)?,
        })
    }

    pub fn member_ref(&self, rid: u32) -> Result<MemberRefRow> {
        Ok(MemberRefRow {
            class: self.cell(table::MEMBER_REF, rid, 0)?,
            name: self.string(self.cell(table::MEMBER_REF, rid, 1)?)?,
            signature: self.cell(table::MEMBER_REF, rid, 2)?,
        })
    }

    /// Signature blob of a TypeSpec row.
    pub fn type_spec(&self, rid: u32) -> Result<&[u8]> {
        self.blob(self.cell(table::TYPE_SPEC, rid, 0)?)
    }

    /// Declaring TypeDef of a MethodDef.
    pub fn method_owner(&self, method_rid: u32) -> Option<u32> {
        self.method_owners
            .get((method_rid as usize).checked_sub(1)?)
            .copied()
            .filter(|&owner| owner != 0)
    }

    /// Enclosing TypeDef of a nested TypeDef.
    pub fn enclosing_type(&self, rid: u32) -> Option<u32> {
        (1..=self.row_count(table::NESTED_CLASS)).find_map(|row| {
            let nested = self.cell(table::NESTED_CLASS, row, 0).ok()?;
            (nested == rid)
                .then(|| self.cell(table::NESTED_CLASS, row, 1).ok())
                .flatten()
        })
    }

    /// Name of generic parameter `number` declared by `owner` (`TypeDef` or `MethodDef`).
    pub fn generic_param_name(
        &self,
        owner_table: u8,
        owner_rid: u32,
        number: u32,
    ) -> Option<String> {
        (1..=self.row_count(table::GENERIC_PARAM)).find_map(|row| {
            let owner = self.cell(table::GENERIC_PARAM, row, 2).ok()?;
            let n = self.cell(table::GENERIC_PARAM, row, 0).ok()?;
            if n != number
                || CodedIndex::TypeOrMethodDef.decode(owner) != Some((owner_table, owner_rid))
            {
                return None;
            }
            self.string(self.cell(table::GENERIC_PARAM, row, 3).ok()?).ok()
        })
    }

    /// Namespace-qualified name of a TypeDef, with enclosing types for nested types.
    pub fn type_def_name(&self, rid: u32) -> Result<String> {
        let row = self.type_def(rid)?;
        let mut name = qualify(&row.namespace, &row.name);
        let mut current = rid;
        let mut depth = 0;
        while let Some(outer) = self.enclosing_type(current) {
            depth += 1;
            if depth > 32 || outer == current {
                break;
            }
            let outer_row = self.type_def(outer)?;
            name = format!("{}.{}", qualify(&outer_row.namespace, &outer_row.name), name);
            current = outer;
        }
        Ok(name)
    }

    /// Namespace-qualified name of a TypeRef, following TypeRef resolution scopes.
    pub fn type_ref_name(&self, rid: u32) -> Result<String> {
        let scope = self.cell(table::TYPE_REF, rid, 0)?;
        let name = self.string(self.cell(table::TYPE_REF, rid, 1)?)?;
        let namespace = self.string(self.cell(table::TYPE_REF, rid, 2)?)?;
        let name = qualify(&namespace, &name);

        match CodedIndex::ResolutionScope.decode(scope) {
            Some((table::TYPE_REF, outer)) if outer != rid => {
                Ok(format!("{}.{}", self.type_ref_name(outer)?, name))
            }
            _ => Ok(name),
        }
    }

    fn compute_method_owners(&self) -> Result<Vec<u32>> {
        let methods = self.row_count(table::METHOD_DEF) as usize;
        let types = self.row_count(table::TYPE_DEF);
        let mut owners = vec![0u32; methods];

        for rid in 1..=types {
            let start = self.cell(table::TYPE_DEF, rid, 5)? as usize;
            let end = if rid < types {
                self.cell(table::TYPE_DEF, rid + 1, 5)? as usize
            } else {
                methods + 1
            };
            for method in start.max(1)..end.min(methods + 1) {
                owners[method - 1] = rid;
            }
        }
        Ok(owners)
    }
}

fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// Reads the `#~` header and lays out the tables that follow it.
fn read_table_header(data: &[u8], start: usize) -> Result<TableLayout> {
    let heap_flags = read_u8(data, start + 6)?;
    let valid = read_u64(data, start + 8)?;

    let mut rows = [0u32; TABLE_SLOTS];
    let mut offset = start + 24;
    for (table, count) in rows.iter_mut().enumerate() {
        if valid & (1u64 << table) != 0 {
            *count = read_u32(data, offset)?;
            offset += 4;
        }
    }
    if heap_flags & 0x40 != 0 {
        offset += 4;
    }

    let layout = TableLayout::new(rows, HeapSizes::from_flags(heap_flags), offset);
    for id in 0..TABLE_SLOTS {
        let end = (layout.rows[id] as usize)
            .checked_mul(layout.row_sizes[id])
            .and_then(|len| len.checked_add(layout.offsets[id]));
        if end.map_or(true, |end| end > data.len()) {
            return Err(R2rError::malformed(
                layout.offsets[id],
                format!(
                    "table {id:#04x} with {} rows exceeds metadata bounds",
                    layout.rows[id]
                ),
            ));
        }
    }
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables_stream(method_defs: u32, row_bytes: usize) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 0, 2, 0, 0, 1];
        data.extend_from_slice(&(1u64 << table::METHOD_DEF).to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&method_defs.to_le_bytes());
        data.resize(data.len() + row_bytes, 0);
        data
    }

    #[test]
    fn table_rows_fit_the_stream() {
        // RVA, ImplFlags, Flags, Name, Signature, ParamList
        let data = tables_stream(2, 2 * 14);
        let layout = read_table_header(&data, 0).unwrap();
        assert_eq!(layout.rows[table::METHOD_DEF as usize], 2);
        assert_eq!(layout.row_sizes[table::METHOD_DEF as usize], 14);
    }

    #[test]
    fn oversized_row_count_is_rejected() {
        let data = tables_stream(0xFFFF_FFF0, 14);
        let err = read_table_header(&data, 0).unwrap_err();
        assert!(matches!(err, R2rError::Malformed { .. }));
    }
}
