//! NATV container round-trip plus the loader scenarios from the spec's
//! testable-properties list: module load/resolve, the symbol-cache
//! hit/hit/miss-after-unload sequence, and version satisfaction.

use natv_format::{Architecture, Export, ExportType, Module, ModuleType, Version};
use natv_loader::{Loader, LoaderConfig, LoaderError, ModuleDirectory};
use std::fs::File;
use std::io::{Cursor, Write as _};

fn write_native_file(dir: &std::path::Path, name: &str, arch: Architecture, exports: Vec<Export>) {
    let code = vec![0x90, 0x90, 0x90, 0xC3];
    let mut buf = Vec::new();
    natv_format::write_module(&mut buf, arch, ModuleType::User, &code, &[], &exports, 0, 0).unwrap();
    let path = dir.join(format!("{name}_{}.native", arch.suffix()));
    File::create(path).unwrap().write_all(&buf).unwrap();
}

#[test]
fn write_then_read_preserves_every_field_and_resolves_exports() {
    let exports = vec![
        Export { name: "run".into(), export_type: ExportType::Function, flags: 0, offset: 0, size: 4 },
        Export { name: "VERSION".into(), export_type: ExportType::Constant, flags: 0, offset: 0, size: 4 },
    ];
    let code = vec![0xC3u8; 4];
    let data = 7i32.to_le_bytes().to_vec();
    let mut buf = Vec::new();
    natv_format::write_module(&mut buf, Architecture::X86_64, ModuleType::User, &code, &data, &exports, 0, 0).unwrap();

    let module: Module = natv_format::read_module(&mut Cursor::new(buf)).unwrap();
    assert_eq!(module.code, code);
    assert_eq!(module.data, data);
    assert_eq!(module.resolve("run"), Some(natv_format::HEADER_SIZE as u64));
    assert_eq!(module.resolve("VERSION"), Some((natv_format::HEADER_SIZE + code.len()) as u64));
    assert_eq!(module.resolve("missing"), None);
}

#[test]
fn loader_resolves_module_by_path_convention_and_caches_it() {
    let dir = tempfile::tempdir().unwrap();
    write_native_file(
        dir.path(),
        "pipeline",
        Architecture::X86_64,
        vec![Export { name: "start".into(), export_type: ExportType::Function, flags: 0, offset: 0, size: 4 }],
    );
    let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
    let module = loader.load("pipeline").unwrap();
    assert_eq!(loader.resolve(&module, "start"), Some(natv_format::HEADER_SIZE as u64));
}

#[test]
fn symbol_cache_hits_twice_then_misses_after_unload() {
    let dir = tempfile::tempdir().unwrap();
    write_native_file(
        dir.path(),
        "pipeline",
        Architecture::X86_64,
        vec![Export { name: "start".into(), export_type: ExportType::Function, flags: 0, offset: 0, size: 4 }],
    );
    let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
    loader.load("pipeline").unwrap();

    assert!(loader.resolve_global("start").is_some()); // cold: scans modules, populates cache
    assert!(loader.resolve_global("start").is_some()); // warm: served from the symbol cache
    loader.unload("pipeline").unwrap();
    assert!(loader.resolve_global("start").is_none()); // unload invalidates the whole cache
}

#[test]
fn unloading_an_unknown_module_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
    assert!(matches!(loader.unload("ghost"), Err(LoaderError::NotFound(_))));
}

#[test]
fn version_satisfaction_matches_the_lexicographic_rule() {
    let installed = Version::new(1, 2, 3);
    assert!(installed.satisfies(&Version::new(1, 2, 0)));
    assert!(installed.satisfies(&Version::new(1, 0, 0)));
    assert!(installed.satisfies(&Version::new(1, 2, 3)));
    assert!(!installed.satisfies(&Version::new(1, 3, 0)));
    assert!(!installed.satisfies(&Version::new(2, 0, 0)));
}
