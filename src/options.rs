//! Dump configuration and reference assembly lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use normalize_path::NormalizePath;
use tracing::{debug, warn};

use crate::error::{R2rError, Result};
use crate::metadata::signature::ModuleResolver;
use crate::metadata::tables::table;
use crate::metadata::EcmaMetadata;

/// Extensions tried under each reference directory, in order.
pub const SEARCH_EXTENSIONS: [&str; 4] = [".ni.exe", ".ni.dll", ".exe", ".dll"];

/// Options for one invocation. Built once, then only borrowed.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub inputs: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub xml: bool,
    pub raw: bool,
    pub naked: bool,
    pub header: bool,
    pub disasm: bool,
    pub unwind: bool,
    pub gc: bool,
    pub section_contents: bool,
    pub entrypoints: bool,
    pub normalize: bool,
    pub queries: Vec<String>,
    pub keywords: Vec<String>,
    pub runtime_functions: Vec<u32>,
    pub sections: Vec<String>,
    pub diff: bool,
    pub ignore_sensitive: bool,
    pub references: Vec<PathBuf>,
    pub reference_paths: Vec<PathBuf>,
    pub signature_binary: bool,
    pub inline_signature_binary: bool,
}

impl DumpOptions {
    /// Turns on everything `--verbose` implies.
    pub fn verbose(mut self) -> Self {
        self.disasm = true;
        self.unwind = true;
        self.gc = true;
        self.section_contents = true;
        self.entrypoints = true;
        self
    }

    /// Rejects option sets that cannot run. Nothing is opened here.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(R2rError::Configuration(
                "Input filename must be specified (--in <file>)".to_string(),
            ));
        }
        if self.diff && self.inputs.len() < 2 {
            return Err(R2rError::Configuration(
                "Need at least 2 input files in diff mode".to_string(),
            ));
        }
        if self.naked && self.raw {
            return Err(R2rError::Configuration(
                "The option '--naked' is incompatible with '--raw'".to_string(),
            ));
        }
        Ok(())
    }

    /// True when any query, keyword, runtime function or section filter is set.
    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
            || !self.keywords.is_empty()
            || !self.runtime_functions.is_empty()
            || !self.sections.is_empty()
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("0x") => u32::from_str_radix(&s[2..], 16).ok(),
        _ => s.parse().ok(),
    }
}

/// Locates a reference assembly by simple name.
///
/// The explicit `references` win by case-insensitive file stem; otherwise
/// the parent's directory and then `reference_paths` are searched with
/// [`SEARCH_EXTENSIONS`].
pub fn find_assembly(
    simple_name: &str,
    parent: &Path,
    references: &[PathBuf],
    reference_paths: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(found) = references.iter().find(|r| {
        r.file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem.eq_ignore_ascii_case(simple_name))
    }) {
        return Some(found.clone());
    }

    let parent_dir = parent
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    std::iter::once(&parent_dir)
        .chain(reference_paths.iter())
        .flat_map(|dir| {
            SEARCH_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("{simple_name}{ext}")).normalize())
        })
        .find(|candidate| candidate.is_file())
}

/// Resolves module overrides in signatures to reference assembly metadata.
///
/// Module 0 is the image itself; `1..=AssemblyRef count` are its assembly
/// references. Lookups and loaded metadata are memoized per image.
pub struct AssemblyResolver<'a> {
    metadata: Rc<EcmaMetadata>,
    parent: PathBuf,
    options: &'a DumpOptions,
    loaded: HashMap<String, std::result::Result<Rc<EcmaMetadata>, String>>,
}

impl<'a> AssemblyResolver<'a> {
    pub fn new(metadata: Rc<EcmaMetadata>, parent: &Path, options: &'a DumpOptions) -> Self {
        Self {
            metadata,
            parent: parent.to_path_buf(),
            options,
            loaded: HashMap::new(),
        }
    }

    fn load(&self, name: &str) -> std::result::Result<Rc<EcmaMetadata>, String> {
        let Some(path) = find_assembly(
            name,
            &self.parent,
            &self.options.references,
            &self.options.reference_paths,
        ) else {
            warn!(assembly = name, "reference assembly not found");
            return Err(name.to_string());
        };

        match EcmaMetadata::open(&path) {
            Ok(metadata) => {
                debug!(assembly = name, path = %path.display(), "loaded reference assembly");
                Ok(Rc::new(metadata))
            }
            Err(e) => {
                warn!(
                    assembly = name,
                    path = %path.display(),
                    error = %e,
                    "failed to load reference assembly"
                );
                Err(name.to_string())
            }
        }
    }
}

impl ModuleResolver for AssemblyResolver<'_> {
    fn resolve_module(&mut self, index: u32) -> std::result::Result<Rc<EcmaMetadata>, String> {
        if index == 0 {
            return Ok(Rc::clone(&self.metadata));
        }
        if index > self.metadata.row_count(table::ASSEMBLY_REF) {
            return Err(format!("#{index}"));
        }

        let name = self
            .metadata
            .assembly_ref_name(index)
            .map_err(|_| format!("#{index}"))?;
        let key = name.to_lowercase();
        if let Some(cached) = self.loaded.get(&key) {
            return cached.clone();
        }
        let result = self.load(&name);
        self.loaded.insert(key, result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn validation_rules() {
        let mut options = DumpOptions::default();
        assert!(matches!(options.validate(), Err(R2rError::Configuration(_))));

        options.inputs = vec![PathBuf::from("a.dll")];
        assert!(options.validate().is_ok());

        options.diff = true;
        let err = options.validate().unwrap_err();
        assert_eq!(err.to_string(), "Need at least 2 input files in diff mode");

        options.diff = false;
        options.raw = true;
        options.naked = true;
        assert!(matches!(options.validate(), Err(R2rError::Configuration(_))));
    }

    #[test]
    fn verbose_expands() {
        let options = DumpOptions::default().verbose();
        assert!(options.disasm && options.unwind && options.gc);
        assert!(options.section_contents && options.entrypoints);
        assert!(!options.raw);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x2A"), Some(42));
        assert_eq!(parse_number(" 0X2a "), Some(42));
        assert_eq!(parse_number("Foo"), None);
        assert_eq!(parse_number("0x"), None);
    }

    #[test]
    fn explicit_reference_wins_over_search() {
        let dir = tempfile::tempdir().unwrap();
        let refs = dir.path().join("refs");
        fs::create_dir(&refs).unwrap();
        fs::write(refs.join("Foo.dll"), b"x").unwrap();

        let explicit = dir.path().join("explicit").join("Foo.dll");
        let found = find_assembly(
            "foo",
            &dir.path().join("app.dll"),
            std::slice::from_ref(&explicit),
            std::slice::from_ref(&refs),
        );
        assert_eq!(found, Some(explicit));
    }

    #[test]
    fn search_order() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("app.dll");
        let refs = dir.path().join("refs");
        fs::create_dir(&refs).unwrap();

        assert_eq!(find_assembly("Bar", &parent, &[], &[refs.clone()]), None);

        fs::write(refs.join("Bar.dll"), b"x").unwrap();
        fs::write(refs.join("Bar.ni.dll"), b"x").unwrap();
        assert_eq!(
            find_assembly("Bar", &parent, &[], &[refs.clone()]),
            Some(refs.join("Bar.ni.dll"))
        );

        // The parent's directory is searched before reference paths.
        fs::write(dir.path().join("Bar.exe"), b"x").unwrap();
        assert_eq!(
            find_assembly("Bar", &parent, &[], &[refs]),
            Some(dir.path().join("Bar.exe"))
        );
    }
}
