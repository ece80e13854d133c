//! # NATV native module container
//!
//! Position-independent code packaged with a flat export table: a 128-byte
//! header, then code, data, and export-table sections back to back.
//! Layout (little-endian, matches spec.md §6):
//!
//! ```text
//! magic                u32 = 0x5654414E ("NATV")
//! format_version       u32 = 1
//! architecture         u32
//! module_type          u32
//! code_size/offset     u64 / u64
//! data_size/offset     u64 / u64
//! export_table_offset  u64
//! export_count         u32
//! entry_point_offset   u32   within code
//! metadata_offset      u64
//! crc64                u64   over code‖data‖export-entries
//! flags                u32
//! relocation_count     u32
//! relocation_offset    u64
//! reserved             padding out to 128 bytes
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::OnceLock;

pub const MAGIC: u32 = 0x5654_414E;
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
pub const EXPORT_ENTRY_SIZE: usize = 280;
pub const MAX_EXPORT_COUNT: u32 = 1024;
pub const MAX_NAME_LEN: usize = 256;

const CRC64_POLY: u64 = 0xC96C_5795_D787_0F42;
const CRC64_INIT: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const CRC64_XOROUT: u64 = 0xFFFF_FFFF_FFFF_FFFF;

fn crc64_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u64; 256];
        let mut i = 0usize;
        while i < 256 {
            let mut crc = i as u64;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 == 1 { (crc >> 1) ^ CRC64_POLY } else { crc >> 1 };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    })
}

/// CRC64 over `data`, bytewise-reflected, with spec.md §6's polynomial,
/// initial value, and final XOR.
pub fn crc64(data: &[u8]) -> u64 {
    let table = crc64_table();
    let mut crc = CRC64_INIT;
    for &byte in data {
        let idx = ((crc ^ byte as u64) & 0xFF) as usize;
        crc = table[idx] ^ (crc >> 8);
    }
    crc ^ CRC64_XOROUT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Architecture {
    X86_64 = 0,
    X86_32 = 1,
    Arm64 = 2,
}

impl Architecture {
    fn from_u32(v: u32) -> Result<Self, NatvFormatError> {
        match v {
            0 => Ok(Architecture::X86_64),
            1 => Ok(Architecture::X86_32),
            2 => Ok(Architecture::Arm64),
            other => Err(NatvFormatError::InvalidFormat(format!("unknown architecture tag {other}"))),
        }
    }

    /// The path-resolution suffix spec.md §6 names for this architecture
    /// ("Loader environment": x86_64 → "x64_64", arm64 → "arm64_64", …).
    pub fn suffix(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x64_64",
            Architecture::X86_32 => "x86_32",
            Architecture::Arm64 => "arm64_64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ModuleType {
    Vm = 0,
    LibcForward = 1,
    User = 2,
}

impl ModuleType {
    fn from_u32(v: u32) -> Result<Self, NatvFormatError> {
        match v {
            0 => Ok(ModuleType::Vm),
            1 => Ok(ModuleType::LibcForward),
            2 => Ok(ModuleType::User),
            other => Err(NatvFormatError::InvalidFormat(format!("unknown module-type tag {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExportType {
    Function = 0,
    Variable = 1,
    Constant = 2,
    Type = 3,
    Interface = 4,
}

impl ExportType {
    fn from_u32(v: u32) -> Result<Self, NatvFormatError> {
        match v {
            0 => Ok(ExportType::Function),
            1 => Ok(ExportType::Variable),
            2 => Ok(ExportType::Constant),
            3 => Ok(ExportType::Type),
            4 => Ok(ExportType::Interface),
            other => Err(NatvFormatError::InvalidFormat(format!("unknown export-type tag {other}"))),
        }
    }
}

/// A single export-table entry: name, kind, flags, and its location within
/// the module's sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub export_type: ExportType,
    pub flags: u32,
    pub offset: u64,
    pub size: u64,
}

/// A semantic module version, independent of the fixed on-disk
/// `FORMAT_VERSION`. Spec.md §4.F's version-satisfaction rule operates on
/// this triple; the NATV v1 header carries no such field itself, so
/// callers (the loader's dependency table) supply it out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// `self` satisfies `required` iff majors match and (minor, patch) is
    /// lexicographically >= the requirement's.
    pub fn satisfies(&self, required: &Version) -> bool {
        self.major == required.major && (self.minor, self.patch) >= (required.minor, required.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A fully parsed NATV module: header fields plus its sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub architecture: Architecture,
    pub module_type: ModuleType,
    pub entry_point_offset: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub exports: Vec<Export>,
}

impl Module {
    /// Resolve an export by name via linear scan, returning an address
    /// relative to the mapped module base (`header_size + offset` for
    /// function exports, the raw data-section offset for everything else).
    pub fn resolve(&self, name: &str) -> Option<u64> {
        let export = self.exports.iter().find(|e| e.name == name)?;
        match export.export_type {
            ExportType::Function => Some(HEADER_SIZE as u64 + export.offset),
            _ => Some((HEADER_SIZE + self.code.len()) as u64 + export.offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatvFormatError {
    InvalidFormat(String),
    UnsupportedVersion(u32),
    ChecksumMismatch { expected: u64, computed: u64 },
    TooManyExports(usize),
    NameTooLong(String),
    Io(String),
}

impl fmt::Display for NatvFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatvFormatError::InvalidFormat(msg) => write!(f, "invalid NATV format: {msg}"),
            NatvFormatError::UnsupportedVersion(v) => write!(f, "unsupported NATV format version {v}"),
            NatvFormatError::ChecksumMismatch { expected, computed } => {
                write!(f, "CRC64 mismatch: header says {expected:#018x}, computed {computed:#018x}")
            }
            NatvFormatError::TooManyExports(n) => write!(f, "{n} exports exceeds the cap of {MAX_EXPORT_COUNT}"),
            NatvFormatError::NameTooLong(name) => write!(f, "export name `{name}` exceeds {MAX_NAME_LEN} bytes including NUL"),
            NatvFormatError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for NatvFormatError {}

fn io_err(e: io::Error) -> NatvFormatError {
    NatvFormatError::Io(e.to_string())
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), NatvFormatError> {
    r.read_exact(buf).map_err(io_err)
}

fn encode_export(export: &Export) -> Result<[u8; EXPORT_ENTRY_SIZE], NatvFormatError> {
    let name_bytes = export.name.as_bytes();
    if name_bytes.len() + 1 > MAX_NAME_LEN {
        return Err(NatvFormatError::NameTooLong(export.name.clone()));
    }
    let mut buf = [0u8; EXPORT_ENTRY_SIZE];
    buf[..name_bytes.len()].copy_from_slice(name_bytes);
    // buf[name_bytes.len()] stays 0 as the NUL terminator; rest of the
    // 256-byte field is zero-padded.
    buf[256..260].copy_from_slice(&(export.export_type as u32).to_le_bytes());
    buf[260..264].copy_from_slice(&export.flags.to_le_bytes());
    buf[264..272].copy_from_slice(&export.offset.to_le_bytes());
    buf[272..280].copy_from_slice(&export.size.to_le_bytes());
    Ok(buf)
}

fn decode_export(buf: &[u8; EXPORT_ENTRY_SIZE]) -> Result<Export, NatvFormatError> {
    let nul = buf[..256].iter().position(|&b| b == 0).unwrap_or(256);
    let name = String::from_utf8(buf[..nul].to_vec())
        .map_err(|e| NatvFormatError::InvalidFormat(format!("export name is not valid UTF-8: {e}")))?;
    let export_type = ExportType::from_u32(u32::from_le_bytes(buf[256..260].try_into().unwrap()))?;
    let flags = u32::from_le_bytes(buf[260..264].try_into().unwrap());
    let offset = u64::from_le_bytes(buf[264..272].try_into().unwrap());
    let size = u64::from_le_bytes(buf[272..280].try_into().unwrap());
    Ok(Export { name, export_type, flags, offset, size })
}

/// Write a complete NATV module: header, code, data, export table.
pub fn write_module(
    w: &mut impl Write,
    architecture: Architecture,
    module_type: ModuleType,
    code: &[u8],
    data: &[u8],
    exports: &[Export],
    entry_point_offset: u32,
    flags: u32,
) -> Result<(), NatvFormatError> {
    if exports.len() as u32 > MAX_EXPORT_COUNT {
        return Err(NatvFormatError::TooManyExports(exports.len()));
    }
    let mut export_entries = Vec::with_capacity(exports.len() * EXPORT_ENTRY_SIZE);
    for export in exports {
        export_entries.extend_from_slice(&encode_export(export)?);
    }

    let code_offset = HEADER_SIZE as u64;
    let data_offset = code_offset + code.len() as u64;
    let export_table_offset = data_offset + data.len() as u64;
    let metadata_offset = export_table_offset + export_entries.len() as u64;

    let mut checksum_input = Vec::with_capacity(code.len() + data.len() + export_entries.len());
    checksum_input.extend_from_slice(code);
    checksum_input.extend_from_slice(data);
    checksum_input.extend_from_slice(&export_entries);
    let checksum = crc64(&checksum_input);

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(architecture as u32).to_le_bytes());
    header[12..16].copy_from_slice(&(module_type as u32).to_le_bytes());
    header[16..24].copy_from_slice(&(code.len() as u64).to_le_bytes());
    header[24..32].copy_from_slice(&code_offset.to_le_bytes());
    header[32..40].copy_from_slice(&(data.len() as u64).to_le_bytes());
    header[40..48].copy_from_slice(&data_offset.to_le_bytes());
    header[48..56].copy_from_slice(&export_table_offset.to_le_bytes());
    header[56..60].copy_from_slice(&(exports.len() as u32).to_le_bytes());
    header[60..64].copy_from_slice(&entry_point_offset.to_le_bytes());
    header[64..72].copy_from_slice(&metadata_offset.to_le_bytes());
    header[72..80].copy_from_slice(&checksum.to_le_bytes());
    header[80..84].copy_from_slice(&flags.to_le_bytes());
    header[84..88].copy_from_slice(&0u32.to_le_bytes()); // relocation_count: PIC code, none emitted
    header[88..96].copy_from_slice(&metadata_offset.to_le_bytes()); // relocation_offset: empty region
    // header[96..128] reserved, stays zeroed

    w.write_all(&header).map_err(io_err)?;
    w.write_all(code).map_err(io_err)?;
    w.write_all(data).map_err(io_err)?;
    w.write_all(&export_entries).map_err(io_err)?;
    log::debug!(
        "wrote NATV module: {} export(s), code={} bytes, data={} bytes, crc64={checksum:#018x}",
        exports.len(),
        code.len(),
        data.len()
    );
    Ok(())
}

/// Read and fully validate a NATV module: magic, version, architecture,
/// module type, and CRC64 over code‖data‖export-entries.
pub fn read_module(r: &mut impl Read) -> Result<Module, NatvFormatError> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact(r, &mut header)?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(NatvFormatError::InvalidFormat(format!("bad magic {magic:#010x}")));
    }
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(NatvFormatError::UnsupportedVersion(version));
    }
    let architecture = Architecture::from_u32(u32::from_le_bytes(header[8..12].try_into().unwrap()))?;
    let module_type = ModuleType::from_u32(u32::from_le_bytes(header[12..16].try_into().unwrap()))?;
    let code_size = u64::from_le_bytes(header[16..24].try_into().unwrap());
    let data_size = u64::from_le_bytes(header[32..40].try_into().unwrap());
    let export_count = u32::from_le_bytes(header[56..60].try_into().unwrap());
    let entry_point_offset = u32::from_le_bytes(header[60..64].try_into().unwrap());
    let stored_crc64 = u64::from_le_bytes(header[72..80].try_into().unwrap());
    let flags = u32::from_le_bytes(header[80..84].try_into().unwrap());

    if export_count > MAX_EXPORT_COUNT {
        return Err(NatvFormatError::TooManyExports(export_count as usize));
    }

    let mut code = vec![0u8; code_size as usize];
    read_exact(r, &mut code)?;
    let mut data = vec![0u8; data_size as usize];
    read_exact(r, &mut data)?;

    let mut export_entries = vec![0u8; export_count as usize * EXPORT_ENTRY_SIZE];
    read_exact(r, &mut export_entries)?;

    let mut checksum_input = Vec::with_capacity(code.len() + data.len() + export_entries.len());
    checksum_input.extend_from_slice(&code);
    checksum_input.extend_from_slice(&data);
    checksum_input.extend_from_slice(&export_entries);
    let computed = crc64(&checksum_input);
    if computed != stored_crc64 {
        return Err(NatvFormatError::ChecksumMismatch { expected: stored_crc64, computed });
    }

    let mut exports = Vec::with_capacity(export_count as usize);
    for chunk in export_entries.chunks_exact(EXPORT_ENTRY_SIZE) {
        let entry: [u8; EXPORT_ENTRY_SIZE] = chunk.try_into().unwrap();
        let export = decode_export(&entry)?;
        let section_len = match export.export_type {
            ExportType::Function => code.len() as u64,
            _ => data.len() as u64,
        };
        let out_of_bounds = export.offset.checked_add(export.size).map_or(true, |end| end > section_len);
        if out_of_bounds {
            return Err(NatvFormatError::InvalidFormat(format!(
                "export `{}` offset {} size {} exceeds its section ({section_len} bytes)",
                export.name, export.offset, export.size
            )));
        }
        exports.push(export);
    }

    log::debug!("read NATV module: {} export(s), crc64 ok", exports.len());
    Ok(Module { architecture, module_type, entry_point_offset, flags, code, data, exports })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_exports() -> Vec<Export> {
        vec![Export { name: "fib".into(), export_type: ExportType::Function, flags: 0, offset: 0, size: 16 }]
    }

    #[test]
    fn round_trip_preserves_module_and_validates_checksum() {
        let code = vec![0x90u8; 16];
        let data = vec![];
        let mut buf = Vec::new();
        write_module(&mut buf, Architecture::X86_64, ModuleType::User, &code, &data, &sample_exports(), 0, 0).unwrap();
        let module = read_module(&mut Cursor::new(buf)).unwrap();
        assert_eq!(module.code, code);
        assert_eq!(module.exports, sample_exports());
    }

    #[test]
    fn resolve_matches_header_size_plus_offset() {
        let code = vec![0xCCu8; 32];
        let mut buf = Vec::new();
        write_module(&mut buf, Architecture::X86_64, ModuleType::User, &code, &[], &sample_exports(), 0, 0).unwrap();
        let module = read_module(&mut Cursor::new(buf)).unwrap();
        assert_eq!(module.resolve("fib"), Some(HEADER_SIZE as u64));
        assert_eq!(module.resolve("missing"), None);
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let code = vec![1, 2, 3, 4];
        let mut buf = Vec::new();
        write_module(&mut buf, Architecture::X86_64, ModuleType::User, &code, &[], &[], 0, 0).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(read_module(&mut Cursor::new(buf)), Err(NatvFormatError::ChecksumMismatch { .. })));
    }

    #[test]
    fn export_offset_out_of_bounds_is_invalid_format() {
        let code = vec![0u8; 4];
        let exports = vec![Export { name: "oob".into(), export_type: ExportType::Function, flags: 0, offset: 0, size: 999 }];
        let mut buf = Vec::new();
        write_module(&mut buf, Architecture::X86_64, ModuleType::User, &code, &[], &exports, 0, 0).unwrap();
        assert!(matches!(read_module(&mut Cursor::new(buf)), Err(NatvFormatError::InvalidFormat(_))));
    }

    #[test]
    fn version_satisfaction_rules() {
        let v123 = Version::new(1, 2, 3);
        assert!(v123.satisfies(&Version::new(1, 2, 0)));
        assert!(v123.satisfies(&Version::new(1, 0, 0)));
        assert!(!v123.satisfies(&Version::new(1, 3, 0)));
        assert!(!v123.satisfies(&Version::new(2, 0, 0)));
    }

    #[test]
    fn too_many_exports_is_rejected() {
        let exports: Vec<Export> = (0..(MAX_EXPORT_COUNT + 1))
            .map(|i| Export { name: format!("e{i}"), export_type: ExportType::Constant, flags: 0, offset: 0, size: 0 })
            .collect();
        let mut buf = Vec::new();
        assert!(matches!(
            write_module(&mut buf, Architecture::X86_64, ModuleType::User, &[], &[], &exports, 0, 0),
            Err(NatvFormatError::TooManyExports(_))
        ));
    }
}
