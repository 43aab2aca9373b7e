//! ECMA-335 table schema and row layout.
//!
//! Rows are never materialized; the layout records where each table starts
//! and how wide its rows and columns are so that single cells can be read
//! on demand.

/// Table numbers used by the reader.
pub mod table {
    pub const MODULE: u8 = 0x00;
    pub const TYPE_REF: u8 = 0x01;
    pub const TYPE_DEF: u8 = 0x02;
    pub const FIELD_PTR: u8 = 0x03;
    pub const FIELD: u8 = 0x04;
    pub const METHOD_PTR: u8 = 0x05;
    pub const METHOD_DEF: u8 = 0x06;
    pub const PARAM_PTR: u8 = 0x07;
    pub const PARAM: u8 = 0x08;
    pub const INTERFACE_IMPL: u8 = 0x09;
    pub const MEMBER_REF: u8 = 0x0A;
    pub const CONSTANT: u8 = 0x0B;
    pub const CUSTOM_ATTRIBUTE: u8 = 0x0C;
    pub const FIELD_MARSHAL: u8 = 0x0D;
    pub const DECL_SECURITY: u8 = 0x0E;
    pub const CLASS_LAYOUT: u8 = 0x0F;
    pub const FIELD_LAYOUT: u8 = 0x10;
    pub const STAND_ALONE_SIG: u8 = 0x11;
    pub const EVENT_MAP: u8 = 0x12;
    pub const EVENT_PTR: u8 = 0x13;
    pub const EVENT: u8 = 0x14;
    pub const PROPERTY_MAP: u8 = 0x15;
    pub const PROPERTY_PTR: u8 = 0x16;
    pub const PROPERTY: u8 = 0x17;
    pub const METHOD_SEMANTICS: u8 = 0x18;
    pub const METHOD_IMPL: u8 = 0x19;
    pub const MODULE_REF: u8 = 0x1A;
    pub const TYPE_SPEC: u8 = 0x1B;
    pub const IMPL_MAP: u8 = 0x1C;
    pub const FIELD_RVA: u8 = 0x1D;
    pub const ENC_LOG: u8 = 0x1E;
    pub const ENC_MAP: u8 = 0x1F;
    pub const ASSEMBLY: u8 = 0x20;
    pub const ASSEMBLY_PROCESSOR: u8 = 0x21;
    pub const ASSEMBLY_OS: u8 = 0x22;
    pub const ASSEMBLY_REF: u8 = 0x23;
    pub const ASSEMBLY_REF_PROCESSOR: u8 = 0x24;
    pub const ASSEMBLY_REF_OS: u8 = 0x25;
    pub const FILE: u8 = 0x26;
    pub const EXPORTED_TYPE: u8 = 0x27;
    pub const MANIFEST_RESOURCE: u8 = 0x28;
    pub const NESTED_CLASS: u8 = 0x29;
    pub const GENERIC_PARAM: u8 = 0x2A;
    pub const METHOD_SPEC: u8 = 0x2B;
    pub const GENERIC_PARAM_CONSTRAINT: u8 = 0x2C;
}

/// Number of table slots in the `Valid` bit vector.
pub const TABLE_SLOTS: usize = 64;

const UNUSED: u8 = 0xFF;

/// Coded index kinds (ECMA-335 II.24.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndex {
    /// Candidate tables in tag order.
    pub fn tables(self) -> &'static [u8] {
        use table::*;
        match self {
            CodedIndex::TypeDefOrRef => &[TYPE_DEF, TYPE_REF, TYPE_SPEC],
            CodedIndex::HasConstant => &[FIELD, PARAM, PROPERTY],
            CodedIndex::HasCustomAttribute => &[
                METHOD_DEF,
                FIELD,
                TYPE_REF,
                TYPE_DEF,
                PARAM,
                INTERFACE_IMPL,
                MEMBER_REF,
                MODULE,
                DECL_SECURITY,
                PROPERTY,
                EVENT,
                STAND_ALONE_SIG,
                MODULE_REF,
                TYPE_SPEC,
                ASSEMBLY,
                ASSEMBLY_REF,
                FILE,
                EXPORTED_TYPE,
                MANIFEST_RESOURCE,
                GENERIC_PARAM,
                GENERIC_PARAM_CONSTRAINT,
                METHOD_SPEC,
            ],
            CodedIndex::HasFieldMarshal => &[FIELD, PARAM],
            CodedIndex::HasDeclSecurity => &[TYPE_DEF, METHOD_DEF, ASSEMBLY],
            CodedIndex::MemberRefParent => &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC],
            CodedIndex::HasSemantics => &[EVENT, PROPERTY],
            CodedIndex::MethodDefOrRef => &[METHOD_DEF, MEMBER_REF],
            CodedIndex::MemberForwarded => &[FIELD, METHOD_DEF],
            CodedIndex::Implementation => &[FILE, ASSEMBLY_REF, EXPORTED_TYPE],
            CodedIndex::CustomAttributeType => &[UNUSED, UNUSED, METHOD_DEF, MEMBER_REF, UNUSED],
            CodedIndex::ResolutionScope => &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF],
            CodedIndex::TypeOrMethodDef => &[TYPE_DEF, METHOD_DEF],
        }
    }

    /// Number of low bits holding the tag.
    pub fn tag_bits(self) -> u32 {
        let n = self.tables().len() as u32;
        32 - (n - 1).leading_zeros()
    }

    /// Splits a coded value into `(table, rid)`.
    pub fn decode(self, value: u32) -> Option<(u8, u32)> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        let table = *self.tables().get(tag)?;
        (table != UNUSED).then_some((table, value >> bits))
    }
}

/// Column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Col {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Table(u8),
    Coded(CodedIndex),
}

/// Column schema of each table, `None` for slots ECMA-335 does not define.
pub fn schema(table: u8) -> Option<&'static [Col]> {
    use table::*;
    use CodedIndex as C;
    use Col::*;
    let cols: &'static [Col] = match table {
        MODULE => &[U16, Str, Guid, Guid, Guid],
        TYPE_REF => &[Coded(C::ResolutionScope), Str, Str],
        TYPE_DEF => &[U32, Str, Str, Coded(C::TypeDefOrRef), Table(FIELD), Table(METHOD_DEF)],
        FIELD_PTR => &[Table(FIELD)],
        FIELD => &[U16, Str, Blob],
        METHOD_PTR => &[Table(METHOD_DEF)],
        METHOD_DEF => &[U32, U16, U16, Str, Blob, Table(PARAM)],
        PARAM_PTR => &[Table(PARAM)],
        PARAM => &[U16, U16, Str],
        INTERFACE_IMPL => &[Table(TYPE_DEF), Coded(C::TypeDefOrRef)],
        MEMBER_REF => &[Coded(C::MemberRefParent), Str, Blob],
        CONSTANT => &[U16, Coded(C::HasConstant), Blob],
        CUSTOM_ATTRIBUTE => &[Coded(C::HasCustomAttribute), Coded(C::CustomAttributeType), Blob],
        FIELD_MARSHAL => &[Coded(C::HasFieldMarshal), Blob],
        DECL_SECURITY => &[U16, Coded(C::HasDeclSecurity), Blob],
        CLASS_LAYOUT => &[U16, U32, Table(TYPE_DEF)],
        FIELD_LAYOUT => &[U32, Table(FIELD)],
        STAND_ALONE_SIG => &[Blob],
        EVENT_MAP => &[Table(TYPE_DEF), Table(EVENT)],
        EVENT_PTR => &[Table(EVENT)],
        EVENT => &[U16, Str, Coded(C::TypeDefOrRef)],
        PROPERTY_MAP => &[Table(TYPE_DEF), Table(PROPERTY)],
        PROPERTY_PTR => &[Table(PROPERTY)],
        PROPERTY => &[U16, Str, Blob],
        METHOD_SEMANTICS => &[U16, Table(METHOD_DEF), Coded(C::HasSemantics)],
        METHOD_IMPL => &[Table(TYPE_DEF), Coded(C::MethodDefOrRef), Coded(C::MethodDefOrRef)],
        MODULE_REF => &[Str],
        TYPE_SPEC => &[Blob],
        IMPL_MAP => &[U16, Coded(C::MemberForwarded), Str, Table(MODULE_REF)],
        FIELD_RVA => &[U32, Table(FIELD)],
        ENC_LOG => &[U32, U32],
        ENC_MAP => &[U32],
        ASSEMBLY => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        ASSEMBLY_PROCESSOR => &[U32],
        ASSEMBLY_OS => &[U32, U32, U32],
        ASSEMBLY_REF => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        ASSEMBLY_REF_PROCESSOR => &[U32, Table(ASSEMBLY_REF)],
        ASSEMBLY_REF_OS => &[U32, U32, U32, Table(ASSEMBLY_REF)],
        FILE => &[U32, Str, Blob],
        EXPORTED_TYPE => &[U32, U32, Str, Str, Coded(C::Implementation)],
        MANIFEST_RESOURCE => &[U32, U32, Str, Coded(C::Implementation)],
        NESTED_CLASS => &[Table(TYPE_DEF), Table(TYPE_DEF)],
        GENERIC_PARAM => &[U16, U16, Coded(C::TypeOrMethodDef), Str],
        METHOD_SPEC => &[Coded(C::MethodDefOrRef), Blob],
        GENERIC_PARAM_CONSTRAINT => &[Table(GENERIC_PARAM), Coded(C::TypeDefOrRef)],
        _ => return None,
    };
    Some(cols)
}

/// Widths of heap indices, from the `HeapSizes` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSizes {
    pub string: usize,
    pub guid: usize,
    pub blob: usize,
}

impl HeapSizes {
    pub fn from_flags(flags: u8) -> Self {
        let width = |bit: u8| if flags & bit != 0 { 4 } else { 2 };
        Self {
            string: width(0x01),
            guid: width(0x02),
            blob: width(0x04),
        }
    }
}

/// Location and row width of every present table.
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub rows: [u32; TABLE_SLOTS],
    pub offsets: [usize; TABLE_SLOTS],
    pub row_sizes: [usize; TABLE_SLOTS],
    pub heaps: HeapSizes,
}

impl TableLayout {
    /// Lays out the tables sequentially starting at `start`.
    pub fn new(rows: [u32; TABLE_SLOTS], heaps: HeapSizes, start: usize) -> Self {
        let mut layout = Self {
            rows,
            offsets: [0; TABLE_SLOTS],
            row_sizes: [0; TABLE_SLOTS],
            heaps,
        };

        let mut offset = start;
        for table in 0..TABLE_SLOTS {
            let row_size = schema(table as u8)
                .map(|cols| cols.iter().map(|&c| layout.col_size(c)).sum())
                .unwrap_or(0);
            layout.offsets[table] = offset;
            layout.row_sizes[table] = row_size;
            offset += row_size * rows[table] as usize;
        }
        layout
    }

    /// Width of a column in bytes.
    pub fn col_size(&self, col: Col) -> usize {
        match col {
            Col::U16 => 2,
            Col::U32 => 4,
            Col::Str => self.heaps.string,
            Col::Guid => self.heaps.guid,
            Col::Blob => self.heaps.blob,
            Col::Table(t) => {
                if self.rows[t as usize] < 0x1_0000 {
                    2
                } else {
                    4
                }
            }
            Col::Coded(kind) => {
                let max_rows = kind
                    .tables()
                    .iter()
                    .filter(|&&t| t != UNUSED)
                    .map(|&t| self.rows[t as usize])
                    .max()
                    .unwrap_or(0);
                if max_rows < (1 << (16 - kind.tag_bits())) {
                    2
                } else {
                    4
                }
            }
        }
    }

    /// Byte offset of column `col` within a row of `table`, and its width.
    pub fn column(&self, table: u8, col: usize) -> Option<(usize, usize)> {
        let cols = schema(table)?;
        let width = self.col_size(*cols.get(col)?);
        let offset = cols[..col].iter().map(|&c| self.col_size(c)).sum();
        Some((offset, width))
    }
}
