//! Integration tests for r2rdump.
//!
//! These tests verify that images parse and dump correctly across different:
//!   - Runtime versions
//!   - Target platforms (Windows, Linux) and CPU architectures (x64, arm64)
//!
//! Fixtures are configured in `tests/fixtures/fixtures.toml`.
//! Synthetic images are built by `tests/common`.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use r2rdump::{create_dumper, dump_image, DumpOptions, R2rImage};
use serde::Deserialize;

use common::{ImageSpec, ADD_SIGNATURE, ECHO_SIGNATURE, RUN_SIGNATURE};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    fixture: Vec<Fixture>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    name: String,
    runtime: String,
    arch: String,
    binary: String,
    machine: String,
    major_version: u16,
    min_methods: usize,
}

impl Fixture {
    /// Unique identifier: `{name}-{runtime}-{arch}`
    fn id(&self) -> String {
        format!("{}-{}-{}", self.name, self.runtime, self.arch)
    }

    fn binary_path(&self) -> PathBuf {
        fixture_dir().join(&self.binary)
    }
}

// ============================================================================
// Logging
// ============================================================================

mod log {
    pub fn skip(id: &str, reason: &str) {
        eprintln!("⏭️  [{id}] Skipped: {reason}");
    }

    pub fn success(id: &str, methods: usize, functions: u32) {
        eprintln!("✅ [{id}] {methods} methods, {functions} runtime functions");
    }
}

// ============================================================================
// Infrastructure
// ============================================================================

fn fixture_dir() -> &'static PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures"))
}

fn load_config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let path = fixture_dir().join("fixtures.toml");
        let content = fs::read_to_string(&path).expect("Failed to read fixtures.toml");
        toml::from_str(&content).expect("Failed to parse fixtures.toml")
    })
}

// ============================================================================
// Test Runner
// ============================================================================

/// Parse and dump a single fixture.
/// Returns `true` if tested, `false` if skipped (binary not found).
fn test_fixture(f: &Fixture) -> bool {
    let id = f.id();
    let binary_path = f.binary_path();

    if !binary_path.exists() {
        log::skip(&id, "Binary not found. Copy it from a .NET runtime installation");
        return false;
    }

    let options = DumpOptions {
        inputs: vec![binary_path.clone()],
        ..Default::default()
    };
    let image = R2rImage::open(&binary_path, &options)
        .unwrap_or_else(|e| panic!("[{id}] Open failed: {e}"));

    assert_eq!(image.header.machine.to_string(), f.machine, "[{id}] Machine mismatch");
    assert_eq!(
        image.header.major_version, f.major_version,
        "[{id}] Major version mismatch"
    );
    assert!(
        image.methods.len() >= f.min_methods,
        "[{id}] Only {} methods",
        image.methods.len()
    );

    // Every method owns at least its main body, and ids are unique.
    let mut ids: Vec<u32> = image.runtime_functions().map(|rtf| rtf.id).collect();
    for method in &image.methods {
        assert!(
            !method.runtime_functions.is_empty(),
            "[{id}] Method without code: {}",
            method.signature
        );
        assert!(!method.signature.is_empty(), "[{id}] Empty signature");
    }
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total, "[{id}] Runtime function owned twice");

    // A header dump must succeed without touching the method bodies.
    let header_only = DumpOptions {
        header: true,
        ..options
    };
    let mut out = Vec::new();
    let mut dumper = create_dumper(&image, &header_only, None, &mut out);
    dump_image(dumper.as_mut(), &image, &header_only)
        .unwrap_or_else(|e| panic!("[{id}] Header dump failed: {e}"));
    drop(dumper);
    assert!(String::from_utf8_lossy(&out).contains("NumberOfSections"));

    log::success(&id, image.methods.len(), image.runtime_function_count);
    true
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_all_fixtures() {
    let config = load_config();
    let total = config.fixture.len();
    let tested: usize = config
        .fixture
        .iter()
        .map(|f| test_fixture(f) as usize)
        .sum();

    // Ensure at least one fixture was tested if any binary exists
    let any_exists = config.fixture.iter().any(|f| f.binary_path().exists());
    if any_exists {
        assert!(tested > 0, "All fixtures failed despite binaries existing");
    }

    eprintln!("📊 Summary: {tested}/{total} fixtures tested");
}

#[test]
fn synthetic_image_parses() {
    let dir = tempfile::tempdir().unwrap();
    let (path, placement) = common::write_image(dir.path(), "Demo.dll", &ImageSpec::default());
    let image = R2rImage::open(&path, &DumpOptions::default()).unwrap();

    assert_eq!(image.header.major_version, 9);
    assert_eq!(image.header.minor_version, 2);
    assert_eq!(image.header.sections.len(), 5);
    assert_eq!(image.header.rva, placement.header_rva);
    assert_eq!(image.layout().image_base, common::IMAGE_BASE);
    assert_eq!(image.compiler_identifier(), Some("Synthetic R2R compiler 1.0"));
    assert_eq!(image.runtime_function_count, 3);
    assert!(!image.is_composite);

    let cor20 = image.layout().cor20.unwrap();
    assert_eq!(cor20.cb, 72);
    assert_eq!((cor20.major_runtime_version, cor20.minor_runtime_version), (2, 5));
    assert_eq!(cor20.flags, 1);
    assert_eq!(cor20.managed_native_header_rva, placement.header_rva);

    let signatures: Vec<&str> = image.methods.iter().map(|m| m.signature.as_str()).collect();
    assert_eq!(signatures, vec![RUN_SIGNATURE, ADD_SIGNATURE]);

    let run = &image.methods[0];
    assert_eq!(run.return_type, "void");
    assert_eq!(run.token, 0x0600_0001);
    assert_eq!(run.runtime_functions.len(), 2);
    assert_eq!(run.runtime_functions[0].start_rva, placement.run_rva);
    assert_eq!(run.runtime_functions[0].size, 6);
    assert_eq!(run.runtime_functions[1].size, 2);
    assert_eq!(run.runtime_functions[0].eh_clauses.len(), 1);

    let gc = run.runtime_functions[0].gc_info.unwrap();
    assert_eq!(gc.rva, placement.run_gc_rva);
    assert_eq!(gc.len, 4);
    assert!(run.runtime_functions[1].gc_info.is_none());

    let add = &image.methods[1];
    assert_eq!(add.return_type, "int");
    assert_eq!(add.parameters, vec!["int", "int"]);
    assert_eq!(add.signature_bytes, vec![0x00, 0x02, 0x08, 0x08, 0x08]);
    assert_eq!(add.entry_point_id(), Some(2));
    assert_eq!(add.fixups.len(), 2);
    assert_eq!(add.fixups[1].slot, 3);
}

#[test]
fn instance_entry_points_and_slot_entries() {
    use r2rdump::r2r::method::EntryPointKind;

    let dir = tempfile::tempdir().unwrap();
    let spec = ImageSpec {
        instance_entries: true,
        ..Default::default()
    };
    let (path, placement) = common::write_image(dir.path(), "Generic.dll", &spec);
    let image = R2rImage::open(&path, &DumpOptions::default()).unwrap();

    assert_eq!(image.header.sections.len(), 7);
    assert_eq!(image.runtime_function_count, 5);

    let signatures: Vec<&str> = image.methods.iter().map(|m| m.signature.as_str()).collect();
    assert_eq!(signatures, vec![RUN_SIGNATURE, ADD_SIGNATURE, ECHO_SIGNATURE]);

    let echo = &image.methods[2];
    assert_eq!(echo.entry_point, EntryPointKind::Instance);
    assert_eq!(echo.owning_type, "Demo.Widget");
    assert_eq!(echo.method_args, vec!["int"]);
    assert_eq!(echo.return_type, "int");
    assert_eq!(echo.parameters, vec!["int"]);
    assert_eq!(echo.token, 0x0600_0003);

    // The slot-based entry's body is not a funclet of the method before it.
    assert_eq!(echo.runtime_functions.len(), 1);
    assert_eq!(echo.runtime_functions[0].start_rva, placement.echo_rva);
    assert_eq!(echo.code_size(), common::ECHO_CODE.len() as u64);
    assert!(image.runtime_functions().all(|rtf| rtf.id != 4));
    assert_eq!(image.methods[1].runtime_functions.len(), 1);
}

// ============================================================================
// Edge Cases
// ============================================================================

mod edge_cases {
    use super::*;
    use r2rdump::R2rError;

    #[test]
    fn reject_invalid_binary() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        fs::write(temp.path(), b"not a valid binary").unwrap();

        assert!(R2rImage::open(temp.path(), &DumpOptions::default()).is_err());
    }

    #[test]
    fn reject_empty_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();

        assert!(R2rImage::open(temp.path(), &DumpOptions::default()).is_err());
    }

    #[test]
    fn reject_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = R2rImage::open(&dir.path().join("absent.dll"), &DumpOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, R2rError::Io(_)));
    }

    #[test]
    fn reject_managed_image_without_r2r_header() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ImageSpec {
            ready_to_run: false,
            ..Default::default()
        };
        let (path, _) = common::write_image(dir.path(), "IlOnly.dll", &spec);

        let err = R2rImage::open(&path, &DumpOptions::default()).err().unwrap();
        assert!(err.is_format_error());
        assert!(err.to_string().contains("not a ReadyToRun image"));
    }

    #[test]
    fn reject_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ImageSpec {
            major_version: 99,
            ..Default::default()
        };
        let (path, _) = common::write_image(dir.path(), "Future.dll", &spec);

        let err = R2rImage::open(&path, &DumpOptions::default()).err().unwrap();
        assert!(err.to_string().contains("Unsupported R2R version 99.2"));
    }
}
