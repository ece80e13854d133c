//! # Native module loader
//!
//! Resolves module names to `.native` files on disk, maps them read-only,
//! validates their NATV header and checksum, and caches both the modules
//! themselves and symbol lookups across them.
//!
//! Single-threaded by design: state lives behind `RefCell`, not `Mutex` —
//! see [`default_loader`] for the one seam that needs real synchronization.

use natv_format::{Architecture, Module, NatvFormatError};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};

const SYMBOL_CACHE_BUCKETS: usize = 512;
const BOOTSTRAP_NAME: &str = "<loader>";

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderError {
    InvalidArgument(String),
    FileNotFound(String),
    PermissionDenied(String),
    NotFound(String),
    LoadFailed(String),
    InvalidFormat(String),
    ChecksumMismatch(String),
    SymbolNotFound(String),
    InitFailed(String),
    VersionMismatch(String),
    ApiMismatch(String),
    ResourceExhausted(String),
    PlatformUnsupported(String),
    Io(String),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            LoaderError::FileNotFound(m) => write!(f, "file not found: {m}"),
            LoaderError::PermissionDenied(m) => write!(f, "permission denied: {m}"),
            LoaderError::NotFound(m) => write!(f, "module not found: {m}"),
            LoaderError::LoadFailed(m) => write!(f, "load failed: {m}"),
            LoaderError::InvalidFormat(m) => write!(f, "invalid format: {m}"),
            LoaderError::ChecksumMismatch(m) => write!(f, "checksum mismatch: {m}"),
            LoaderError::SymbolNotFound(m) => write!(f, "symbol not found: {m}"),
            LoaderError::InitFailed(m) => write!(f, "init failed: {m}"),
            LoaderError::VersionMismatch(m) => write!(f, "version mismatch: {m}"),
            LoaderError::ApiMismatch(m) => write!(f, "api mismatch: {m}"),
            LoaderError::ResourceExhausted(m) => write!(f, "resource exhausted: {m}"),
            LoaderError::PlatformUnsupported(m) => write!(f, "platform unsupported: {m}"),
            LoaderError::Io(m) => write!(f, "I/O error: {m}"),
        }
    }
}

impl std::error::Error for LoaderError {}

impl From<NatvFormatError> for LoaderError {
    fn from(e: NatvFormatError) -> Self {
        match e {
            NatvFormatError::ChecksumMismatch { .. } => LoaderError::ChecksumMismatch(e.to_string()),
            NatvFormatError::UnsupportedVersion(_) => LoaderError::VersionMismatch(e.to_string()),
            other => LoaderError::InvalidFormat(other.to_string()),
        }
    }
}

static ERROR_HOOK: OnceLock<fn(&LoaderError)> = OnceLock::new();

pub fn set_error_hook(hook: fn(&LoaderError)) {
    let _ = ERROR_HOOK.set(hook);
}

fn fire_error_hook(err: &LoaderError) {
    if let Some(hook) = ERROR_HOOK.get() {
        hook(err);
    }
}

/// Search base directory plus the architecture this loader resolves module
/// names against. Detected at construction time rather than baked in as a
/// compile-time constant, so tests can point it at a temp directory.
#[derive(Debug, Clone)]
pub struct ModuleDirectory {
    pub base: PathBuf,
    pub architecture: Architecture,
}

impl ModuleDirectory {
    pub fn new(base: PathBuf, architecture: Architecture) -> Self {
        Self { base, architecture }
    }

    /// Detects the host architecture from `std::env::consts::ARCH`.
    pub fn detect(base: PathBuf) -> Result<Self, LoaderError> {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => Architecture::X86_64,
            "x86" => Architecture::X86_32,
            "aarch64" => Architecture::Arm64,
            other => return Err(LoaderError::PlatformUnsupported(format!("unsupported host architecture {other}"))),
        };
        Ok(Self { base, architecture })
    }

    /// `pipeline` under an x86_64 host resolves to `pipeline_x64_64.native`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.base.join(format!("{name}_{}.native", self.architecture.suffix()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    pub max_modules: usize,
    pub max_dependencies_per_module: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { max_modules: 128, max_dependencies_per_module: 32 }
    }
}

/// A cached, mapped module. Holds the backing `Mmap` alive for as long as
/// the entry is cached; dropped (and the mapping released) exactly once, on
/// `unload`.
pub struct ModuleEntry {
    name: String,
    module: Module,
    _mapping: Option<memmap2::Mmap>,
    dependencies: RefCell<Vec<String>>,
    unloadable: bool,
}

impl ModuleEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.module.resolve(symbol)
    }
}

fn djb2_bucket(symbol: &str) -> usize {
    let mut hash: u32 = 5381;
    for byte in symbol.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    (hash as usize) % SYMBOL_CACHE_BUCKETS
}

pub struct Loader {
    config: LoaderConfig,
    directory: ModuleDirectory,
    modules: RefCell<Vec<Rc<ModuleEntry>>>,
    index: RefCell<HashMap<String, usize>>,
    /// Chained symbol cache, 512 buckets, front-inserted on miss. Cleared in
    /// full on any `unload` — coarse, but a correct invalidation strategy.
    symbol_cache: RefCell<Vec<Vec<(String, u64)>>>,
}

impl Loader {
    pub fn new(directory: ModuleDirectory, config: LoaderConfig) -> Self {
        let bootstrap = Rc::new(ModuleEntry {
            name: BOOTSTRAP_NAME.to_string(),
            module: Module {
                architecture: directory.architecture,
                module_type: natv_format::ModuleType::Vm,
                entry_point_offset: 0,
                flags: 0,
                code: Vec::new(),
                data: Vec::new(),
                exports: Vec::new(),
            },
            _mapping: None,
            dependencies: RefCell::new(Vec::new()),
            unloadable: false,
        });
        let mut index = HashMap::new();
        index.insert(BOOTSTRAP_NAME.to_string(), 0usize);
        Self {
            config,
            directory,
            modules: RefCell::new(vec![bootstrap]),
            index: RefCell::new(index),
            symbol_cache: RefCell::new(vec![Vec::new(); SYMBOL_CACHE_BUCKETS]),
        }
    }

    pub fn cached_count(&self) -> usize {
        self.modules.borrow().len()
    }

    /// Returns a cached module if present; otherwise resolves its path,
    /// maps the file, validates it, and inserts it into the cache.
    pub fn load(&self, name: &str) -> Result<Rc<ModuleEntry>, LoaderError> {
        if let Some(&idx) = self.index.borrow().get(name) {
            log::trace!("module cache hit for {name}");
            return Ok(self.modules.borrow()[idx].clone());
        }
        if self.modules.borrow().len() >= self.config.max_modules {
            let err = LoaderError::ResourceExhausted(format!("module cache capacity {} reached", self.config.max_modules));
            fire_error_hook(&err);
            return Err(err);
        }

        let path = self.directory.path_for(name);
        let result = (|| -> Result<Rc<ModuleEntry>, LoaderError> {
            let file = File::open(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LoaderError::FileNotFound(path.display().to_string()),
                std::io::ErrorKind::PermissionDenied => LoaderError::PermissionDenied(path.display().to_string()),
                _ => LoaderError::Io(e.to_string()),
            })?;
            // SAFETY: the file is opened read-only above and never mutated
            // through this mapping or otherwise for the lifetime of the cache
            // entry; NATV modules are meant to be mapped and executed in
            // place, not written back to.
            let mapping = unsafe { memmap2::Mmap::map(&file) }
                .map_err(|e| LoaderError::LoadFailed(format!("failed to map {}: {e}", path.display())))?;
            let module = natv_format::read_module(&mut Cursor::new(&mapping[..]))?;
            Ok(Rc::new(ModuleEntry {
                name: name.to_string(),
                module,
                _mapping: Some(mapping),
                dependencies: RefCell::new(Vec::new()),
                unloadable: true,
            }))
        })();

        match result {
            Ok(entry) => {
                let idx = self.modules.borrow().len();
                self.modules.borrow_mut().push(entry.clone());
                self.index.borrow_mut().insert(name.to_string(), idx);
                log::info!("loaded module {name} from {}", path.display());
                Ok(entry)
            }
            Err(err) => {
                log::info!("failed to load module {name}: {err}");
                fire_error_hook(&err);
                Err(err)
            }
        }
    }

    /// Removes a module from the cache, invalidates the whole symbol cache,
    /// and drops its mapping. The bootstrap entry can never be unloaded.
    pub fn unload(&self, name: &str) -> Result<(), LoaderError> {
        let idx = *self.index.borrow().get(name).ok_or_else(|| LoaderError::NotFound(name.to_string()))?;
        if !self.modules.borrow()[idx].unloadable {
            let err = LoaderError::InvalidArgument("the bootstrap loader module cannot be unloaded".into());
            fire_error_hook(&err);
            return Err(err);
        }
        self.modules.borrow_mut().remove(idx);
        self.index.borrow_mut().remove(name);
        for existing_idx in self.index.borrow_mut().values_mut() {
            if *existing_idx > idx {
                *existing_idx -= 1;
            }
        }
        for bucket in self.symbol_cache.borrow_mut().iter_mut() {
            bucket.clear();
        }
        log::info!("unloaded module {name}");
        Ok(())
    }

    pub fn resolve(&self, module: &ModuleEntry, symbol: &str) -> Option<u64> {
        module.resolve(symbol)
    }

    /// Scans all cached modules in insertion order (bootstrap first),
    /// returning the first hit. Hits and misses are memoized in the symbol
    /// cache keyed by `djb2(symbol) % 512`.
    pub fn resolve_global(&self, symbol: &str) -> Option<u64> {
        let bucket = djb2_bucket(symbol);
        if let Some((_, addr)) = self.symbol_cache.borrow()[bucket].iter().find(|(s, _)| s == symbol) {
            log::trace!("symbol cache hit for {symbol}");
            return Some(*addr);
        }
        log::trace!("symbol cache miss for {symbol}");
        let hit = self.modules.borrow().iter().find_map(|entry| entry.resolve(symbol));
        if let Some(addr) = hit {
            self.symbol_cache.borrow_mut()[bucket].insert(0, (symbol.to_string(), addr));
        }
        hit
    }

    /// Declares that `module` lazily depends on `dep_name`, without loading
    /// it yet. Idempotent for an already-registered name.
    pub fn register_dependency(&self, module: &ModuleEntry, dep_name: &str) -> Result<(), LoaderError> {
        let mut deps = module.dependencies.borrow_mut();
        if deps.iter().any(|d| d == dep_name) {
            return Ok(());
        }
        if deps.len() >= self.config.max_dependencies_per_module {
            let err = LoaderError::ResourceExhausted(format!(
                "dependency cap {} reached for module {}",
                self.config.max_dependencies_per_module, module.name
            ));
            fire_error_hook(&err);
            return Err(err);
        }
        deps.push(dep_name.to_string());
        Ok(())
    }

    /// Loads every dependency registered against `module` that isn't cached
    /// yet, returning all of them in registration order.
    pub fn resolve_dependencies(&self, module: &ModuleEntry) -> Result<Vec<Rc<ModuleEntry>>, LoaderError> {
        let names = module.dependencies.borrow().clone();
        names.iter().map(|name| self.load(name)).collect()
    }
}

/// Process-wide default loader (spec's "for convenience a process-wide
/// default context may be provided"). `Loader` itself uses `RefCell`, not
/// `Mutex` — it has no `Sync` bound and can't live directly in a `'static`
/// slot, so the default instance is wrapped in a `Mutex` purely to make the
/// `OnceLock` legal; callers lock it for the duration of each call, same as
/// they would hold an owned `Loader` for a scoped sequence of operations.
pub fn default_loader() -> &'static Mutex<Loader> {
    static LOADER: OnceLock<Mutex<Loader>> = OnceLock::new();
    LOADER.get_or_init(|| {
        let directory = ModuleDirectory::detect(PathBuf::from(".")).unwrap_or(ModuleDirectory {
            base: PathBuf::from("."),
            architecture: Architecture::X86_64,
        });
        Mutex::new(Loader::new(directory, LoaderConfig::default()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use natv_format::{Export, ExportType, ModuleType};
    use std::io::Write as _;

    fn write_sample_module(dir: &std::path::Path, name: &str, arch: Architecture) {
        let exports = vec![Export { name: "entry".into(), export_type: ExportType::Function, flags: 0, offset: 0, size: 4 }];
        let mut buf = Vec::new();
        natv_format::write_module(&mut buf, arch, ModuleType::User, &[0x90, 0x90, 0x90, 0xC3], &[], &exports, 0, 0).unwrap();
        let path = dir.join(format!("{name}_{}.native", arch.suffix()));
        File::create(path).unwrap().write_all(&buf).unwrap();
    }

    #[test]
    fn load_resolves_path_maps_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_module(dir.path(), "pipeline", Architecture::X86_64);
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
        let first = loader.load("pipeline").unwrap();
        let second = loader.load("pipeline").unwrap();
        assert!(Rc::ptr_eq(&first, &second), "second load should hit the module cache");
        assert_eq!(loader.cached_count(), 2); // bootstrap + pipeline
    }

    #[test]
    fn missing_module_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
        assert!(matches!(loader.load("nowhere"), Err(LoaderError::FileNotFound(_))));
    }

    #[test]
    fn bootstrap_module_cannot_be_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
        assert!(matches!(loader.unload(BOOTSTRAP_NAME), Err(LoaderError::InvalidArgument(_))));
    }

    #[test]
    fn resolve_global_scans_insertion_order_and_unload_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_module(dir.path(), "pipeline", Architecture::X86_64);
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
        loader.load("pipeline").unwrap();

        assert!(loader.resolve_global("entry").is_some()); // miss, then cached
        assert!(loader.resolve_global("entry").is_some()); // hit
        loader.unload("pipeline").unwrap();
        assert!(loader.resolve_global("entry").is_none()); // cache invalidated, module gone
    }

    #[test]
    fn module_cache_capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            write_sample_module(dir.path(), &format!("m{i}"), Architecture::X86_64);
        }
        let config = LoaderConfig { max_modules: 2, max_dependencies_per_module: 32 };
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), config);
        loader.load("m0").unwrap(); // bootstrap + m0 = 2, at cap
        assert!(matches!(loader.load("m1"), Err(LoaderError::ResourceExhausted(_))));
    }

    #[test]
    fn dependency_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_module(dir.path(), "pipeline", Architecture::X86_64);
        let config = LoaderConfig { max_modules: 128, max_dependencies_per_module: 1 };
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), config);
        let module = loader.load("pipeline").unwrap();
        loader.register_dependency(&module, "a").unwrap();
        assert!(matches!(loader.register_dependency(&module, "b"), Err(LoaderError::ResourceExhausted(_))));
    }

    #[test]
    fn resolve_dependencies_loads_each_registered_name() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_module(dir.path(), "pipeline", Architecture::X86_64);
        write_sample_module(dir.path(), "helper", Architecture::X86_64);
        let loader = Loader::new(ModuleDirectory::new(dir.path().into(), Architecture::X86_64), LoaderConfig::default());
        let module = loader.load("pipeline").unwrap();
        loader.register_dependency(&module, "helper").unwrap();
        let deps = loader.resolve_dependencies(&module).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name(), "helper");
    }

    #[test]
    fn path_for_matches_architecture_and_bit_width_convention() {
        let directory = ModuleDirectory::new(PathBuf::from("/modules"), Architecture::X86_64);
        assert_eq!(directory.path_for("pipeline"), PathBuf::from("/modules/pipeline_x64_64.native"));
    }
}
