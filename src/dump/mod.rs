// This module implements the diagnostic layer that lets a driver intercept the artifacts of a
// compilation unit. A ShaderDumper is a sink for intermediate artifacts: binaries, text
// listings and kernel graph modules, each stored under a caller-chosen name. The file-system
// dumper writes one file per artifact below its directory, creating the directory on first
// use; the null dumper discards everything. A ShaderOverrider may substitute an artifact
// before it is used. It is asked with a buffer, the artifact name and one of four kinds
// (textual assembly, binary ISA, kernel data, graph listing); when it has a replacement it
// overwrites the buffer and answers true. The file-system overrider looks for
// `<dir>/<name>.<ext>`. I/O failures while dumping are reported to the caller; a replacement
// that cannot be read is logged and ignored, so the generated artifact is used instead.

//! Shader dump and override hooks.

pub mod zebin;

use crate::core::CompileResult;
use crate::ir::Module;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Sink for the intermediate artifacts of a compilation.
pub trait ShaderDumper: Send + Sync {
    fn dump_binary(&self, bytes: &[u8], name: &str) -> CompileResult<()>;

    fn dump_text(&self, text: &str, name: &str) -> CompileResult<()>;

    /// Dump `module` in its textual form.
    fn dump_module(&self, module: &Module, name: &str) -> CompileResult<()> {
        self.dump_text(&module.to_string(), name)
    }

    /// Where an artifact called `name` goes, if this dumper writes files at all.
    fn compose_dump_path(&self, name: &str) -> Option<PathBuf>;
}

/// Replace characters that cannot appear in a file name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

/// Writes every artifact to a file below `dir`.
#[derive(Debug, Clone)]
pub struct FsShaderDumper {
    dir: PathBuf,
}

impl FsShaderDumper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, name: &str, contents: &[u8]) -> CompileResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(sanitize(name));
        fs::write(&path, contents)?;
        debug!("dumped {} byte(s) to {}", contents.len(), path.display());
        Ok(())
    }
}

impl ShaderDumper for FsShaderDumper {
    fn dump_binary(&self, bytes: &[u8], name: &str) -> CompileResult<()> {
        self.write(name, bytes)
    }

    fn dump_text(&self, text: &str, name: &str) -> CompileResult<()> {
        self.write(name, text.as_bytes())
    }

    fn compose_dump_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.dir.join(sanitize(name)))
    }
}

/// Discards every artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullShaderDumper;

impl ShaderDumper for NullShaderDumper {
    fn dump_binary(&self, _bytes: &[u8], _name: &str) -> CompileResult<()> {
        Ok(())
    }

    fn dump_text(&self, _text: &str, _name: &str) -> CompileResult<()> {
        Ok(())
    }

    fn compose_dump_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// Kind of artifact an override replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideKind {
    /// Textual assembly.
    Asm,
    /// The kernel container.
    Isa,
    /// Encoded kernel bits.
    Dat,
    /// Kernel graph listing.
    Ll,
}

impl OverrideKind {
    pub fn extension(self) -> &'static str {
        match self {
            OverrideKind::Asm => "asm",
            OverrideKind::Isa => "isa",
            OverrideKind::Dat => "dat",
            OverrideKind::Ll => "ll",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "asm" => OverrideKind::Asm,
            "isa" => OverrideKind::Isa,
            "dat" => OverrideKind::Dat,
            "ll" => OverrideKind::Ll,
            _ => return None,
        })
    }
}

/// Substitutes generated artifacts.
pub trait ShaderOverrider: Send + Sync {
    /// Replace `buffer` with the override for `name`, if there is one.
    fn override_shader(&self, buffer: &mut Vec<u8>, name: &str, kind: OverrideKind) -> bool;
}

/// Reads replacements from `<dir>/<name>.<ext>`.
#[derive(Debug, Clone)]
pub struct FsShaderOverrider {
    dir: PathBuf,
}

impl FsShaderOverrider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn override_path(&self, name: &str, kind: OverrideKind) -> PathBuf {
        self.dir.join(format!("{}.{}", sanitize(name), kind.extension()))
    }
}

impl ShaderOverrider for FsShaderOverrider {
    fn override_shader(&self, buffer: &mut Vec<u8>, name: &str, kind: OverrideKind) -> bool {
        let path = self.override_path(name, kind);
        if !path.is_file() {
            return false;
        }
        match fs::read(&path) {
            Ok(replacement) => {
                warn!("'{}' overridden by {} ({} byte(s))", name, path.display(), replacement.len());
                *buffer = replacement;
                true
            }
            Err(err) => {
                warn!("override {} unreadable, keeping the generated {}: {}", path.display(), kind.extension(), err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    #[test]
    fn fs_dumper_writes_named_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dumper = FsShaderDumper::new(tmp.path().join("dumps"));
        dumper.dump_binary(&[1, 2, 3], "k.dat").unwrap();
        dumper.dump_text("mov", "k/asm listing").unwrap();
        let module = parse_module("m", "kernel @k() {\nentry:\n  ret\n}").unwrap();
        dumper.dump_module(&module, "m.kir").unwrap();

        let path = dumper.compose_dump_path("k.dat").unwrap();
        assert_eq!(fs::read(path).unwrap(), vec![1, 2, 3]);
        assert_eq!(fs::read_to_string(tmp.path().join("dumps/k_asm_listing")).unwrap(), "mov");
        let listing = fs::read_to_string(dumper.compose_dump_path("m.kir").unwrap()).unwrap();
        assert!(listing.contains("kernel @k"));
    }

    #[test]
    fn null_dumper_has_no_paths() {
        let dumper = NullShaderDumper;
        dumper.dump_text("x", "y").unwrap();
        assert_eq!(dumper.compose_dump_path("y"), None);
    }

    #[test]
    fn overrides_replace_only_matching_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("k.dat"), [0xaa, 0xbb]).unwrap();
        let overrider = FsShaderOverrider::new(tmp.path());

        let mut buffer = vec![1, 2, 3];
        assert!(!overrider.override_shader(&mut buffer, "k", OverrideKind::Isa));
        assert_eq!(buffer, vec![1, 2, 3]);
        assert!(overrider.override_shader(&mut buffer, "k", OverrideKind::Dat));
        assert_eq!(buffer, vec![0xaa, 0xbb]);
        assert!(!overrider.override_shader(&mut buffer, "other", OverrideKind::Dat));
    }

    #[test]
    fn extensions_round_trip() {
        for kind in [OverrideKind::Asm, OverrideKind::Isa, OverrideKind::Dat, OverrideKind::Ll] {
            assert_eq!(OverrideKind::from_extension(kind.extension()), Some(kind));
        }
        assert_eq!(OverrideKind::from_extension("bin"), None);
    }
}
