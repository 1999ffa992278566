// This module writes and reads the ELF container that packages the encoded kernels of a
// compilation unit. The container is a relocatable ELF64 for the Intel GT machine type. Every
// kernel gets its own `.text.<kernel>` section holding its bits, and a global function
// symbol of the same name covering the whole section. Relocations produced by the encoder
// go into a `.rel.text.<kernel>` section: 64-bit absolute symbol addresses in mov
// immediates and 32-bit call offsets. Symbols that no kernel of the container defines are
// emitted as undefined globals for the loader to resolve. The `.ze_info` section is a small
// YAML document describing every kernel's execution environment: SIMD width, private memory
// size, whether EU fusion must be disabled, and the binding table indices of its buffer
// arguments. The section layout is produced with the low-level writer of the object crate so
// the machine type and section types can be the GPU ones.

//! Kernel container (zebin) writer and reader.

use crate::core::{CompileError, CompileResult};
use crate::encoder::ged::Platform;
use crate::encoder::{RelocKind, Relocation};
use crate::metadata::BindingEntry;
use log::debug;
use object::elf;
use object::read::{Object, ObjectSection};
use object::write::elf::{FileHeader, Rel, SectionHeader, Sym, Writer};
use object::Endianness;

/// ELF machine type of Intel GPUs.
pub const EM_INTELGT: u16 = 205;

/// Section type of the `.ze_info` section.
pub const SHT_ZEBIN_ZEINFO: u32 = 0xff00_0011;

/// 64-bit absolute symbol address.
pub const R_ZE_SYM_ADDR: u32 = 1;

/// 32-bit symbol offset.
pub const R_ZE_SYM_ADDR_32: u32 = 2;

pub const ZE_INFO_SECTION: &str = ".ze_info";
pub const TEXT_PREFIX: &str = ".text.";

const ZE_INFO_VERSION: &str = "1.8";
const CODE_ALIGN: usize = 64;

/// One kernel as it goes into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub name: String,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub simd: u32,
    /// Private memory per lane group, in bytes.
    pub private_size: u64,
    pub require_disable_eufusion: bool,
    pub bti: Vec<BindingEntry>,
}

fn reloc_type(kind: RelocKind) -> u32 {
    match kind {
        RelocKind::Abs64 => R_ZE_SYM_ADDR,
        RelocKind::CallPcRel32 => R_ZE_SYM_ADDR_32,
    }
}

/// Platform code carried in the ELF header flags.
fn platform_flags(platform: Platform) -> u32 {
    match platform {
        Platform::Gen8 => 8,
        Platform::Gen9 => 9,
        Platform::Gen11 => 11,
        Platform::XeLp => 12,
        Platform::XeHpc => 13,
    }
}

/// The `.ze_info` document for `kernels`.
pub fn ze_info(kernels: &[KernelImage]) -> String {
    let mut out = format!("version: '{ZE_INFO_VERSION}'\nkernels:\n");
    for k in kernels {
        out.push_str(&format!("  - name: {}\n", k.name));
        out.push_str("    execution_env:\n");
        out.push_str(&format!("      simd_size: {}\n", k.simd));
        if k.private_size > 0 {
            out.push_str(&format!("      private_size: {}\n", k.private_size));
        }
        if k.require_disable_eufusion {
            out.push_str("      require_disable_eufusion: true\n");
        }
        if !k.bti.is_empty() {
            out.push_str("    binding_table_indices:\n");
            for entry in &k.bti {
                out.push_str(&format!("      - bti_value: {}\n        arg_index: {}\n", entry.bti, entry.arg));
            }
        }
    }
    out
}

/// Write the container for `kernels`.
pub fn write_zebin(kernels: &[KernelImage], platform: Platform) -> CompileResult<Vec<u8>> {
    let text_names: Vec<String> = kernels.iter().map(|k| format!("{TEXT_PREFIX}{}", k.name)).collect();
    let rel_names: Vec<String> = kernels.iter().map(|k| format!(".rel{TEXT_PREFIX}{}", k.name)).collect();
    let mut externals: Vec<&str> = Vec::new();
    for r in kernels.iter().flat_map(|k| &k.relocations) {
        if !externals.contains(&r.symbol.as_str()) && !kernels.iter().any(|k| k.name == r.symbol) {
            externals.push(&r.symbol);
        }
    }
    let info = ze_info(kernels);

    let mut buffer = Vec::new();
    {
        let mut writer = Writer::new(Endianness::Little, true, &mut buffer);
        writer.reserve_file_header();
        writer.reserve_null_section_index();

        let mut texts = Vec::with_capacity(kernels.len());
        for (k, name) in kernels.iter().zip(&text_names) {
            let name = writer.add_section_name(name.as_bytes());
            let index = writer.reserve_section_index();
            let offset = writer.reserve(k.code.len(), CODE_ALIGN);
            texts.push((name, index, offset));
        }
        let info_name = writer.add_section_name(ZE_INFO_SECTION.as_bytes());
        writer.reserve_section_index();
        let info_offset = writer.reserve(info.len(), 8);

        writer.reserve_null_symbol_index();
        let mut kernel_syms = Vec::with_capacity(kernels.len());
        for (k, (_, section, _)) in kernels.iter().zip(&texts) {
            let name = writer.add_string(k.name.as_bytes());
            let index = writer.reserve_symbol_index(Some(*section));
            kernel_syms.push((name, index));
        }
        let mut external_syms = Vec::with_capacity(externals.len());
        for symbol in &externals {
            let name = writer.add_string(symbol.as_bytes());
            let index = writer.reserve_symbol_index(None);
            external_syms.push((name, index));
        }

        let mut rels = Vec::new();
        for (i, (k, name)) in kernels.iter().zip(&rel_names).enumerate() {
            if k.relocations.is_empty() {
                continue;
            }
            let name = writer.add_section_name(name.as_bytes());
            writer.reserve_section_index();
            let offset = writer.reserve_relocations(k.relocations.len(), false);
            rels.push((i, name, offset));
        }

        writer.reserve_symtab_section_index();
        writer.reserve_symtab();
        writer.reserve_strtab_section_index();
        writer.reserve_strtab();
        writer.reserve_shstrtab_section_index();
        writer.reserve_shstrtab();
        writer.reserve_section_headers();

        writer.write_file_header(&FileHeader {
            os_abi: elf::ELFOSABI_NONE,
            abi_version: 0,
            e_type: elf::ET_REL,
            e_machine: EM_INTELGT,
            e_entry: 0,
            e_flags: platform_flags(platform),
        })?;

        for k in kernels {
            if !k.code.is_empty() {
                writer.write_align(CODE_ALIGN);
                writer.write(&k.code);
            }
        }
        writer.write_align(8);
        writer.write(info.as_bytes());

        for (i, _, _) in &rels {
            writer.write_align_relocation();
            for r in &kernels[*i].relocations {
                let symbol = match kernels.iter().position(|k| k.name == r.symbol) {
                    Some(k) => kernel_syms[k].1,
                    None => {
                        let e = externals.iter().position(|s| *s == r.symbol).unwrap_or_default();
                        external_syms[e].1
                    }
                };
                writer.write_relocation(
                    false,
                    &Rel { r_offset: r.offset, r_sym: symbol.0 as u32, r_type: reloc_type(r.kind), r_addend: 0 },
                );
            }
        }

        writer.write_null_symbol();
        for ((k, (name, _)), (_, section, _)) in kernels.iter().zip(&kernel_syms).zip(&texts) {
            writer.write_symbol(&Sym {
                name: Some(*name),
                section: Some(*section),
                st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                st_other: elf::STV_DEFAULT,
                st_shndx: 0,
                st_value: 0,
                st_size: k.code.len() as u64,
            });
        }
        for (name, _) in &external_syms {
            writer.write_symbol(&Sym {
                name: Some(*name),
                section: None,
                st_info: (elf::STB_GLOBAL << 4) | elf::STT_NOTYPE,
                st_other: elf::STV_DEFAULT,
                st_shndx: elf::SHN_UNDEF,
                st_value: 0,
                st_size: 0,
            });
        }
        writer.write_strtab();
        writer.write_shstrtab();

        writer.write_null_section_header();
        for (k, (name, _, offset)) in kernels.iter().zip(&texts) {
            writer.write_section_header(&SectionHeader {
                name: Some(*name),
                sh_type: elf::SHT_PROGBITS,
                sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
                sh_addr: 0,
                sh_offset: *offset as u64,
                sh_size: k.code.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: CODE_ALIGN as u64,
                sh_entsize: 0,
            });
        }
        writer.write_section_header(&SectionHeader {
            name: Some(info_name),
            sh_type: SHT_ZEBIN_ZEINFO,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: info_offset as u64,
            sh_size: info.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 8,
            sh_entsize: 0,
        });
        let symtab = writer.symtab_index();
        for (i, name, offset) in &rels {
            writer.write_relocation_section_header(*name, texts[*i].1, symtab, *offset, kernels[*i].relocations.len(), false);
        }
        // Only the null symbol is local.
        writer.write_symtab_section_header(1);
        writer.write_strtab_section_header();
        writer.write_shstrtab_section_header();
    }

    debug!("container: {} kernel(s), {} undefined symbol(s), {} byte(s)", kernels.len(), externals.len(), buffer.len());
    Ok(buffer)
}

/// Code of every kernel in a container, in section order.
pub fn read_kernels(container: &[u8]) -> CompileResult<Vec<(String, Vec<u8>)>> {
    let file = object::File::parse(container)?;
    let mut kernels = Vec::new();
    for section in file.sections() {
        let name = section.name()?;
        if let Some(kernel) = name.strip_prefix(TEXT_PREFIX) {
            kernels.push((kernel.to_string(), section.data()?.to_vec()));
        }
    }
    Ok(kernels)
}

/// Code of kernel `name` in a container.
pub fn read_kernel(container: &[u8], name: &str) -> CompileResult<Vec<u8>> {
    read_kernels(container)?
        .into_iter()
        .find(|(kernel, _)| kernel == name)
        .map(|(_, code)| code)
        .ok_or_else(|| CompileError::FunctionNotFound { name: name.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ObjectSymbol, RelocationFlags, RelocationTarget};

    fn image(name: &str, code: Vec<u8>, relocations: Vec<Relocation>) -> KernelImage {
        KernelImage {
            name: name.into(),
            code,
            relocations,
            simd: 16,
            private_size: 0,
            require_disable_eufusion: false,
            bti: vec![BindingEntry { arg: 0, bti: 0 }],
        }
    }

    #[test]
    fn sections_symbols_and_relocations() {
        let a = image(
            "a",
            vec![0x11; 48],
            vec![
                Relocation { offset: 12, symbol: "helper".into(), kind: RelocKind::CallPcRel32 },
                Relocation { offset: 24, symbol: "b".into(), kind: RelocKind::Abs64 },
            ],
        );
        let mut b = image("b", vec![0x22; 16], Vec::new());
        b.private_size = 64;
        b.require_disable_eufusion = true;

        let bytes = write_zebin(&[a, b], Platform::XeHpc).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.section_by_name(".text.a").unwrap().data().unwrap(), &[0x11; 48][..]);
        assert_eq!(file.section_by_name(".text.b").unwrap().data().unwrap(), &[0x22; 16][..]);
        assert!(file.symbol_by_name("a").unwrap().is_definition());
        assert!(file.symbol_by_name("helper").unwrap().is_undefined());

        let text = file.section_by_name(".text.a").unwrap();
        let relocs: Vec<(u64, String, u32)> = text
            .relocations()
            .map(|(offset, reloc)| {
                let RelocationTarget::Symbol(index) = reloc.target() else { panic!("not a symbol") };
                let RelocationFlags::Elf { r_type } = reloc.flags() else { panic!("not elf") };
                (offset, file.symbol_by_index(index).unwrap().name().unwrap().to_string(), r_type)
            })
            .collect();
        assert_eq!(
            relocs,
            vec![(12, "helper".to_string(), R_ZE_SYM_ADDR_32), (24, "b".to_string(), R_ZE_SYM_ADDR)]
        );

        let info = file.section_by_name(ZE_INFO_SECTION).unwrap();
        let info = std::str::from_utf8(info.data().unwrap()).unwrap();
        assert!(info.contains("  - name: b\n    execution_env:\n      simd_size: 16\n      private_size: 64\n"));
        assert!(info.contains("require_disable_eufusion: true"));
        assert_eq!(info.matches("bti_value: 0").count(), 2);
    }

    #[test]
    fn kernels_read_back() {
        let bytes = write_zebin(&[image("k", vec![1, 2, 3, 4], Vec::new())], Platform::XeLp).unwrap();
        assert_eq!(read_kernels(&bytes).unwrap(), vec![("k".to_string(), vec![1, 2, 3, 4])]);
        assert_eq!(read_kernel(&bytes, "k").unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(read_kernel(&bytes, "x"), Err(CompileError::FunctionNotFound { .. })));
        assert!(matches!(read_kernels(b"not an elf"), Err(CompileError::Container(_))));
    }

    #[test]
    fn ze_info_omits_defaults() {
        let mut k = image("k", Vec::new(), Vec::new());
        k.bti.clear();
        assert_eq!(ze_info(&[k]), "version: '1.8'\nkernels:\n  - name: k\n    execution_env:\n      simd_size: 16\n");
    }
}
