//! Synthetic ReadyToRun images.
//!
//! Builds a minimal x64 PE32+ file with one `.text` section holding a CLI
//! header, ECMA metadata for `Demo.Widget` (`Run()`, `Add(int, int)`,
//! `Echo<T>(T)` and one TypeSpec), an R2R header and the tables the reader
//! decodes. `Run` has a main body
//! and one funclet; `Add` has a fixup list. With `instance_entries` the
//! image also instantiates `Echo<T>(T)` over `int` and carries a slot-based
//! instance entry plus an AvailableTypes table.
//!
//! The section directory is written out of type order.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub const IMAGE_BASE: u64 = 0x1_8000_0000;
pub const TEXT_RVA: u32 = 0x1000;
const TEXT_FILE_OFFSET: usize = 0x200;
const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;

/// push rbp; mov rbp, rsp; pop rbp; ret
pub const RUN_CODE: [u8; 6] = [0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3];
/// nop; ret
pub const FUNCLET_CODE: [u8; 2] = [0x90, 0xC3];
/// lea eax, [rcx+rdx]; ret
pub const ADD_CODE: [u8; 4] = [0x8D, 0x04, 0x11, 0xC3];
/// mov eax, ecx; ret
pub const ECHO_CODE: [u8; 3] = [0x89, 0xC8, 0xC3];
/// xor eax, eax; ret
pub const SLOT_CODE: [u8; 3] = [0x31, 0xC0, 0xC3];

pub const RUN_SIGNATURE: &str = "Demo.Widget.Run()";
pub const ADD_SIGNATURE: &str = "Demo.Widget.Add(int, int)";
pub const ECHO_SIGNATURE: &str = "Demo.Widget.Echo<int>(int)";

/// Section types in the order the directory lists them.
pub const SECTION_ORDER: [u32; 5] = [103, 100, 104, 101, 102];
/// Extra sections written when `instance_entries` is set.
pub const INSTANCE_SECTION_ORDER: [u32; 2] = [109, 108];

/// What to vary between images.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub major_version: u16,
    pub minor_version: u16,
    pub flags: u32,
    pub compiler_identifier: String,
    pub add_code: Vec<u8>,
    /// When false the CLI header has no managed native header.
    pub ready_to_run: bool,
    /// Adds InstanceMethodEntryPoints and AvailableTypes sections.
    pub instance_entries: bool,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            major_version: 9,
            minor_version: 2,
            flags: 0,
            compiler_identifier: "Synthetic R2R compiler 1.0".to_string(),
            add_code: ADD_CODE.to_vec(),
            ready_to_run: true,
            instance_entries: false,
        }
    }
}

/// RVAs of the parts tests look up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Placement {
    pub header_rva: u32,
    pub run_rva: u32,
    pub funclet_rva: u32,
    pub add_rva: u32,
    pub run_gc_rva: u32,
    pub echo_rva: u32,
    pub slot_rva: u32,
}

pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub placement: Placement,
}

#[derive(Default)]
struct Text {
    bytes: Vec<u8>,
}

impl Text {
    fn rva(&self) -> u32 {
        TEXT_RVA + self.bytes.len() as u32
    }

    fn align(&mut self, n: usize) {
        while self.bytes.len() % n != 0 {
            self.bytes.push(0);
        }
    }

    fn put(&mut self, data: &[u8]) -> u32 {
        let rva = self.rva();
        self.bytes.extend_from_slice(data);
        rva
    }

    fn patch(&mut self, rva: u32, data: &[u8]) {
        let at = (rva - TEXT_RVA) as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }
}

fn u16s(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn put_at(file: &mut [u8], at: usize, data: &[u8]) {
    file[at..at + data.len()].copy_from_slice(data);
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

fn add_string(heap: &mut Vec<u8>, s: &str) -> u16 {
    let at = heap.len() as u16;
    heap.extend_from_slice(s.as_bytes());
    heap.push(0);
    at
}

fn pad4(bytes: &mut Vec<u8>) {
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
}

/// Metadata with `<Module>`, `Demo.Widget` and its three methods.
fn metadata_blob() -> Vec<u8> {
    let mut strings = vec![0u8];
    let module = add_string(&mut strings, "Demo.dll");
    let module_type = add_string(&mut strings, "<Module>");
    let widget = add_string(&mut strings, "Widget");
    let demo = add_string(&mut strings, "Demo");
    let run = add_string(&mut strings, "Run");
    let add = add_string(&mut strings, "Add");
    let echo = add_string(&mut strings, "Echo");
    pad4(&mut strings);

    // instance void Run(); static int Add(int, int); static !!0 Echo<T>(!!0)
    let mut blobs = vec![0u8];
    let run_sig = blobs.len() as u16;
    blobs.extend_from_slice(&[3, 0x20, 0x00, 0x01]);
    let add_sig = blobs.len() as u16;
    blobs.extend_from_slice(&[5, 0x00, 0x02, 0x08, 0x08, 0x08]);
    let echo_sig = blobs.len() as u16;
    blobs.extend_from_slice(&[7, 0x10, 0x01, 0x01, 0x1E, 0x00, 0x1E, 0x00]);
    // TypeSpec 1: Demo.Widget behind a module 1 override
    let widget_spec = blobs.len() as u16;
    blobs.extend_from_slice(&[4, 0x3F, 0x01, 0x11, 0x08]);
    pad4(&mut blobs);

    let mut tables = Vec::new();
    tables.extend_from_slice(&0u32.to_le_bytes());
    tables.extend_from_slice(&[2, 0, 0, 1]);
    // Module, TypeDef, MethodDef, TypeSpec
    tables.extend_from_slice(&(0x45u64 | 1 << 0x1B).to_le_bytes());
    tables.extend_from_slice(&0u64.to_le_bytes());
    tables.extend_from_slice(&u32s(&[1, 2, 3, 1]));
    tables.extend_from_slice(&u16s(&[0, module, 0, 0, 0]));
    tables.extend_from_slice(&0u32.to_le_bytes());
    tables.extend_from_slice(&u16s(&[module_type, 0, 0, 1, 1]));
    tables.extend_from_slice(&0x0010_0001u32.to_le_bytes());
    tables.extend_from_slice(&u16s(&[widget, demo, 0, 1, 1]));
    tables.extend_from_slice(&0u32.to_le_bytes());
    tables.extend_from_slice(&u16s(&[0, 0x0086, run, run_sig, 1]));
    tables.extend_from_slice(&0u32.to_le_bytes());
    tables.extend_from_slice(&u16s(&[0, 0x0096, add, add_sig, 1]));
    tables.extend_from_slice(&0u32.to_le_bytes());
    tables.extend_from_slice(&u16s(&[0, 0x0096, echo, echo_sig, 1]));
    tables.extend_from_slice(&u16s(&[widget_spec]));
    pad4(&mut tables);

    let version = b"v4.0.30319\0\0";
    let headers_len = 12 + 20 + 16;
    let tables_at = 16 + version.len() + 4 + headers_len;
    let strings_at = tables_at + tables.len();
    let blobs_at = strings_at + strings.len();

    let mut md = Vec::new();
    md.extend_from_slice(&0x424A_5342u32.to_le_bytes());
    md.extend_from_slice(&u16s(&[1, 1]));
    md.extend_from_slice(&0u32.to_le_bytes());
    md.extend_from_slice(&(version.len() as u32).to_le_bytes());
    md.extend_from_slice(version);
    md.extend_from_slice(&u16s(&[0, 3]));
    for (at, len, name) in [
        (tables_at, tables.len(), &b"#~\0\0"[..]),
        (strings_at, strings.len(), &b"#Strings\0\0\0\0"[..]),
        (blobs_at, blobs.len(), &b"#Blob\0\0\0"[..]),
    ] {
        md.extend_from_slice(&u32s(&[at as u32, len as u32]));
        md.extend_from_slice(name);
    }
    assert_eq!(md.len(), tables_at);
    md.extend_from_slice(&tables);
    md.extend_from_slice(&strings);
    md.extend_from_slice(&blobs);
    md
}

/// Entry point array for MethodDef rids 1 and 2.
///
/// Rid 1 enters runtime function 0; rid 2 enters runtime function 2 with
/// inline fixups (import section 1, slots 2 and 3).
fn entry_points() -> Vec<u8> {
    vec![
        (2 << 2) << 1,       // two elements, byte-sized block offsets
        1,                   // block 0 root, relative to the base
        1 << 1,              // bit 8: left only
        1 << 1,              // bit 4: left only
        1 << 1,              // bit 2: left only
        ((2 << 2) | 3) << 1, // bit 1: both, right two bytes ahead
        0,                   // rid 1: runtime function 0
        ((2 << 2) | 1) << 1, // rid 2: runtime function 2, fixups follow
        0x21,
        0x01,
        0x00,
    ]
}

/// A one-bucket NativeHashtable whose entries point at `payloads`, which
/// follow the bucket in order.
fn hashtable(payloads: &[&[u8]]) -> Vec<u8> {
    let entries_len = 2 * payloads.len();
    let mut table = vec![0x00, 2, (2 + entries_len) as u8];

    let mut target = 3 + entries_len;
    for payload in payloads {
        let origin = table.len() + 1;
        table.push(0x00);
        table.push(((target - origin) as u8) << 1);
        target += payload.len();
    }
    for payload in payloads {
        table.extend_from_slice(payload);
    }
    table
}

/// Instance entries: `Echo<int>` on runtime function 3 and a slot-based
/// entry (slot 5) on runtime function 4.
fn instance_entry_points() -> Vec<u8> {
    hashtable(&[
        // owner type + method instantiation, Demo.Widget, MethodDef 3, <int>
        &[0x44, 0x12, 0x08, 0x03, 0x01, 0x08, 3 << 2],
        // owner type + slot, Demo.Widget, slot 5
        &[0x48, 0x12, 0x08, 0x05, 4 << 2],
    ])
}

/// Builds the image bytes for `spec`.
pub fn build(spec: &ImageSpec) -> BuiltImage {
    let mut text = Text::default();
    let mut placement = Placement::default();

    let cor20_rva = text.put(&[0; 72]);
    text.align(4);
    let metadata = metadata_blob();
    let metadata_rva = text.put(&metadata);
    text.align(4);
    let section_count = SECTION_ORDER.len()
        + if spec.instance_entries {
            INSTANCE_SECTION_ORDER.len()
        } else {
            0
        };
    let header_size = 16 + 12 * section_count;
    let header_rva = text.put(&vec![0; header_size]);
    placement.header_rva = header_rva;

    let compiler_id = format!("{}\0", spec.compiler_identifier);
    let compiler_rva = text.put(compiler_id.as_bytes());
    text.align(8);

    // One import section with two pointer-sized slots.
    let slots_rva = text.put(&[0; 16]);
    let fixup_kinds_rva = text.put(&[0x12, 0x00, 0x13, 0x00]);
    let signatures_rva = text.put(&u32s(&[fixup_kinds_rva, fixup_kinds_rva + 2]));
    let mut import = u32s(&[slots_rva, 16]);
    import.extend_from_slice(&0x0001u16.to_le_bytes());
    import.extend_from_slice(&[2, 8]);
    import.extend_from_slice(&u32s(&[signatures_rva, 0]));
    let imports_rva = text.put(&import);

    text.align(16);
    placement.run_rva = text.put(&RUN_CODE);
    placement.funclet_rva = text.put(&FUNCLET_CODE);
    placement.add_rva = text.put(&spec.add_code);
    if spec.instance_entries {
        placement.echo_rva = text.put(&ECHO_CODE);
        placement.slot_rva = text.put(&SLOT_CODE);
    }
    text.align(4);

    let rtf_count = if spec.instance_entries { 5 } else { 3 };
    let rtf_size = 12 * rtf_count;
    let rtf_rva = text.put(&vec![0; rtf_size]);
    let entry_points = entry_points();
    let entry_points_rva = text.put(&entry_points);
    let instances = instance_entry_points();
    let instances_rva = text.put(&instances);
    // Demo.Widget, not exported
    let available_types = hashtable(&[&[2 << 2]]);
    let available_types_rva = text.put(&available_types);
    text.align(4);

    // Finally clause of Run: try [1, 3) handler [4, 5).
    let clause_rva = text.put(&u32s(&[2, 1, 3, 4, 5, 0]));
    let eh_lookup_rva = text.put(&u32s(&[
        placement.run_rva,
        clause_rva,
        u32::MAX,
        clause_rva + 24,
    ]));

    // Unwind info and GC info last, so the final GC blob ends the section.
    text.align(4);
    let run_unwind = text.put(&[
        0x01, 0x04, 0x02, 0x05, // version 1, prolog 4, 2 codes, frame register RBP
        0x04, 0x03, // offset 4: SET_FPREG
        0x01, 0x50, // offset 1: PUSH_NONVOL RBP
        0, 0, 0, 0,
    ]);
    placement.run_gc_rva = text.put(&[0x01, 0x02, 0x03, 0x04]);
    let funclet_unwind = text.put(&[0x01, 0, 0, 0, 0, 0, 0, 0]);
    let add_unwind = text.put(&[0x01, 0, 0, 0, 0, 0, 0, 0]);
    text.put(&[0xAA, 0xBB]);

    let add_end = placement.add_rva + spec.add_code.len() as u32;
    let mut functions = vec![
        placement.run_rva,
        placement.funclet_rva,
        run_unwind,
        placement.funclet_rva,
        placement.add_rva,
        funclet_unwind,
        placement.add_rva,
        add_end,
        add_unwind,
    ];
    if spec.instance_entries {
        let echo_unwind = text.put(&[0x01, 0, 0, 0, 0, 0, 0, 0]);
        let slot_unwind = text.put(&[0x01, 0, 0, 0, 0, 0, 0, 0]);
        functions.extend_from_slice(&[
            placement.echo_rva,
            placement.echo_rva + ECHO_CODE.len() as u32,
            echo_unwind,
            placement.slot_rva,
            placement.slot_rva + SLOT_CODE.len() as u32,
            slot_unwind,
        ]);
    }
    text.patch(rtf_rva, &u32s(&functions));

    let mut header = u32s(&[0x0052_5452]);
    header.extend_from_slice(&u16s(&[spec.major_version, spec.minor_version]));
    header.extend_from_slice(&u32s(&[spec.flags, section_count as u32]));
    let directory = |kind: u32| match kind {
        100 => [compiler_rva, compiler_id.len() as u32],
        101 => [imports_rva, 20],
        102 => [rtf_rva, rtf_size as u32],
        103 => [entry_points_rva, entry_points.len() as u32],
        104 => [eh_lookup_rva, 16],
        108 => [available_types_rva, available_types.len() as u32],
        109 => [instances_rva, instances.len() as u32],
        _ => unreachable!("no builder for section {kind}"),
    };
    let extra: &[u32] = if spec.instance_entries {
        &INSTANCE_SECTION_ORDER
    } else {
        &[]
    };
    for &kind in SECTION_ORDER.iter().chain(extra) {
        let [rva, size] = directory(kind);
        header.extend_from_slice(&u32s(&[kind, rva, size]));
    }
    text.patch(header_rva, &header);

    let mut cor20 = u32s(&[72]);
    cor20.extend_from_slice(&u16s(&[2, 5]));
    cor20.extend_from_slice(&u32s(&[metadata_rva, metadata.len() as u32, 0x0000_0001]));
    text.patch(cor20_rva, &cor20);
    if spec.ready_to_run {
        text.patch(cor20_rva + 64, &u32s(&[header_rva, header_size as u32]));
    }

    BuiltImage {
        bytes: pe_file(&text.bytes, cor20_rva),
        placement,
    }
}

/// Wraps `text` in a PE32+ x64 file.
fn pe_file(text: &[u8], cor20_rva: u32) -> Vec<u8> {
    let raw_size = align_up(text.len(), FILE_ALIGNMENT);
    let mut file = vec![0u8; TEXT_FILE_OFFSET + raw_size];

    put_at(&mut file, 0, b"MZ");
    put_at(&mut file, 0x3C, &0x80u32.to_le_bytes());

    let nt = 0x80;
    put_at(&mut file, nt, b"PE\0\0");
    let fh = nt + 4;
    put_at(&mut file, fh, &u16s(&[0x8664, 1]));
    put_at(&mut file, fh + 16, &u16s(&[240, 0x2022]));

    let oh = fh + 20;
    put_at(&mut file, oh, &0x20Bu16.to_le_bytes());
    put_at(&mut file, oh + 4, &(raw_size as u32).to_le_bytes());
    put_at(&mut file, oh + 20, &TEXT_RVA.to_le_bytes());
    put_at(&mut file, oh + 24, &IMAGE_BASE.to_le_bytes());
    put_at(&mut file, oh + 32, &u32s(&[SECTION_ALIGNMENT as u32, FILE_ALIGNMENT as u32]));
    put_at(&mut file, oh + 40, &u16s(&[6, 0, 0, 0, 6, 0]));
    let image_size = align_up(TEXT_RVA as usize + text.len(), SECTION_ALIGNMENT);
    put_at(&mut file, oh + 56, &u32s(&[image_size as u32, TEXT_FILE_OFFSET as u32]));
    put_at(&mut file, oh + 68, &u16s(&[3, 0x8160]));
    put_at(&mut file, oh + 108, &16u32.to_le_bytes());
    put_at(&mut file, oh + 112 + 14 * 8, &u32s(&[cor20_rva, 72]));

    let sh = oh + 240;
    put_at(&mut file, sh, b".text\0\0\0");
    put_at(
        &mut file,
        sh + 8,
        &u32s(&[
            text.len() as u32,
            TEXT_RVA,
            raw_size as u32,
            TEXT_FILE_OFFSET as u32,
        ]),
    );
    put_at(&mut file, sh + 36, &0x6000_0020u32.to_le_bytes());

    put_at(&mut file, TEXT_FILE_OFFSET, text);
    file
}

/// Builds an image and writes it to `dir/name`.
pub fn write_image(dir: &Path, name: &str, spec: &ImageSpec) -> (PathBuf, Placement) {
    let built = build(spec);
    let path = dir.join(name);
    fs::write(&path, &built.bytes).expect("Failed to write synthetic image");
    (path, built.placement)
}
