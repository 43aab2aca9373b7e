//! Structural comparison of two images.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use crate::error::Result;
use crate::r2r::header::{R2rHeader, Section, SectionType};
use crate::r2r::method::Method;
use crate::r2r::R2rImage;

/// A header field whose value differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub left: String,
    pub right: String,
}

/// What happened to one section or method between the two images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added,
    Removed,
    /// Section size in bytes.
    Resized { left: u32, right: u32 },
    /// Total code size and runtime function count of a method.
    CodeChanged {
        left_size: u64,
        right_size: u64,
        left_functions: usize,
        right_functions: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub name: String,
    pub change: Change,
}

/// Differences between two images, in header, section, method order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffReport {
    pub left: String,
    pub right: String,
    pub header: Vec<FieldChange>,
    pub sections: Vec<Difference>,
    pub methods: Vec<Difference>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.sections.is_empty() && self.methods.is_empty()
    }

    /// Renders the report as text.
    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "Comparing {} with {}", self.left, self.right)?;
        writeln!(out)?;

        writeln!(out, "Header differences: {}", self.header.len())?;
        for c in &self.header {
            writeln!(out, "  {}: {} -> {}", c.field, c.left, c.right)?;
        }
        writeln!(out)?;

        writeln!(out, "Section differences: {}", self.sections.len())?;
        for d in &self.sections {
            writeln!(out, "  {d}")?;
        }
        writeln!(out)?;

        writeln!(out, "Method differences: {}", self.methods.len())?;
        for d in &self.methods {
            writeln!(out, "  {d}")?;
        }
        writeln!(out)?;
        Ok(())
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.change {
            Change::Added => write!(f, "+ {}", self.name),
            Change::Removed => write!(f, "- {}", self.name),
            Change::Resized { left, right } => {
                write!(f, "~ {}: {left} -> {right} bytes", self.name)
            }
            Change::CodeChanged {
                left_size,
                right_size,
                left_functions,
                right_functions,
            } => write!(
                f,
                "~ {}: code size {left_size} -> {right_size} bytes, runtime functions {left_functions} -> {right_functions}",
                self.name
            ),
        }
    }
}

/// Compares `left` with `right`.
pub fn diff_images(left: &R2rImage, right: &R2rImage) -> DiffReport {
    DiffReport {
        left: left.path().display().to_string(),
        right: right.path().display().to_string(),
        header: diff_headers(&left.header, &right.header),
        sections: diff_sections(&left.header.sections, &right.header.sections),
        methods: diff_methods(&left.methods, &right.methods),
    }
}

fn diff_headers(left: &R2rHeader, right: &R2rHeader) -> Vec<FieldChange> {
    let pairs = [
        (
            "MajorVersion",
            left.major_version.to_string(),
            right.major_version.to_string(),
        ),
        (
            "MinorVersion",
            left.minor_version.to_string(),
            right.minor_version.to_string(),
        ),
        (
            "Flags",
            format!("0x{:08X}", left.flags),
            format!("0x{:08X}", right.flags),
        ),
        ("Machine", left.machine.to_string(), right.machine.to_string()),
        (
            "NumberOfSections",
            left.sections.len().to_string(),
            right.sections.len().to_string(),
        ),
    ];
    pairs
        .into_iter()
        .filter(|(_, l, r)| l != r)
        .map(|(field, left, right)| FieldChange { field, left, right })
        .collect()
}

fn diff_sections(left: &[Section], right: &[Section]) -> Vec<Difference> {
    let left: BTreeMap<SectionType, u32> = left.iter().map(|s| (s.kind, s.size)).collect();
    let right: BTreeMap<SectionType, u32> = right.iter().map(|s| (s.kind, s.size)).collect();

    let mut kinds: Vec<SectionType> = left.keys().chain(right.keys()).copied().collect();
    kinds.sort_by_key(|k| k.value());
    kinds.dedup();

    kinds
        .into_iter()
        .filter_map(|kind| {
            let change = match (left.get(&kind), right.get(&kind)) {
                (Some(_), None) => Change::Removed,
                (None, Some(_)) => Change::Added,
                (Some(&l), Some(&r)) if l != r => Change::Resized { left: l, right: r },
                _ => return None,
            };
            Some(Difference {
                name: kind.to_string(),
                change,
            })
        })
        .collect()
}

fn diff_methods(left: &[Method], right: &[Method]) -> Vec<Difference> {
    // Signatures shared by several entry points compare their first occurrence.
    fn by_signature(methods: &[Method]) -> BTreeMap<&str, &Method> {
        let mut map = BTreeMap::new();
        for m in methods {
            map.entry(m.signature.as_str()).or_insert(m);
        }
        map
    }
    let left = by_signature(left);
    let right = by_signature(right);

    let mut differences = Vec::new();
    for (&signature, l) in &left {
        let change = match right.get(signature) {
            None => Change::Removed,
            Some(r)
                if l.code_size() != r.code_size()
                    || l.runtime_functions.len() != r.runtime_functions.len() =>
            {
                Change::CodeChanged {
                    left_size: l.code_size(),
                    right_size: r.code_size(),
                    left_functions: l.runtime_functions.len(),
                    right_functions: r.runtime_functions.len(),
                }
            }
            Some(_) => continue,
        };
        differences.push(Difference {
            name: signature.to_string(),
            change,
        });
    }
    for &signature in right.keys() {
        if !left.contains_key(signature) {
            differences.push(Difference {
                name: signature.to_string(),
                change: Change::Added,
            });
        }
    }
    differences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r2r::header::SectionContents;
    use crate::r2r::method::{EntryPointKind, RuntimeFunction};
    use crate::r2r::unwind::UnwindInfo;

    fn section(kind: SectionType, size: u32) -> Section {
        Section {
            kind,
            rva: 0x1000,
            size,
            file_offset: 0x400,
            contents: SectionContents::Opaque,
        }
    }

    fn method(signature: &str, sizes: &[u32]) -> Method {
        Method {
            rid: 1,
            token: 0x0600_0001,
            name: "M".to_string(),
            owning_type: "C".to_string(),
            return_type: "void".to_string(),
            parameters: Vec::new(),
            method_args: Vec::new(),
            signature: signature.to_string(),
            signature_bytes: Vec::new(),
            fixups: Vec::new(),
            entry_point: EntryPointKind::MethodDef,
            runtime_functions: sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| RuntimeFunction {
                    id: i as u32,
                    start_rva: 0x2000,
                    size,
                    unwind_rva: 0x3000,
                    unwind: UnwindInfo::Undecoded,
                    gc_info: None,
                    eh_clauses: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn identical_sections_have_no_differences() {
        let sections = vec![
            section(SectionType::RuntimeFunctions, 24),
            section(SectionType::ImportSections, 40),
        ];
        assert!(diff_sections(&sections, &sections).is_empty());
    }

    #[test]
    fn section_changes() {
        let left = vec![
            section(SectionType::RuntimeFunctions, 24),
            section(SectionType::ImportSections, 40),
        ];
        let right = vec![
            section(SectionType::RuntimeFunctions, 36),
            section(SectionType::CompilerIdentifier, 8),
        ];
        let diff = diff_sections(&left, &right);
        assert_eq!(
            diff,
            vec![
                Difference {
                    name: "CompilerIdentifier".to_string(),
                    change: Change::Added,
                },
                Difference {
                    name: "ImportSections".to_string(),
                    change: Change::Removed,
                },
                Difference {
                    name: "RuntimeFunctions".to_string(),
                    change: Change::Resized { left: 24, right: 36 },
                },
            ]
        );
    }

    #[test]
    fn method_changes() {
        let left = vec![method("C.A()", &[10]), method("C.B()", &[10]), method("C.D()", &[4])];
        let right = vec![method("C.A()", &[10]), method("C.B()", &[10, 6]), method("C.E()", &[4])];
        let diff = diff_methods(&left, &right);

        assert_eq!(diff.len(), 3);
        assert_eq!(
            diff[0].change,
            Change::CodeChanged {
                left_size: 10,
                right_size: 16,
                left_functions: 1,
                right_functions: 2,
            }
        );
        assert_eq!(diff[1].to_string(), "- C.D()");
        assert_eq!(diff[2].to_string(), "+ C.E()");
    }

    #[test]
    fn report_text() {
        let report = DiffReport {
            left: "a.dll".to_string(),
            right: "b.dll".to_string(),
            header: vec![FieldChange {
                field: "MinorVersion",
                left: "1".to_string(),
                right: "2".to_string(),
            }],
            sections: Vec::new(),
            methods: Vec::new(),
        };
        let mut out = Vec::new();
        report.write(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Comparing a.dll with b.dll\n"));
        assert!(text.contains("Header differences: 1\n  MinorVersion: 1 -> 2\n"));
        assert!(text.contains("Method differences: 0\n"));
    }
}
