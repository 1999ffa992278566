// This module implements the driver that takes one compilation unit from kernel graph to
// kernel container. A unit owns its module, a session arena, an annotation table and an
// analysis cache. The driver runs the default pass pipeline, then reaches the pre-encode
// checkpoint: the optimized module is dumped as `<unit>.ll` and the overrider may replace
// it, in which case the replacement is parsed and the metadata-producing passes run again
// on a fresh annotation table and the caller's option switches. Every kernel definition is then lowered and encoded. Its
// machine listing and bits are dumped as `<unit>.<kernel>.asm` and `.dat` at the
// post-encode checkpoint, and the bits may be overridden. Per-kernel failures (unknown
// stack usage, missing metadata, register pressure, unsupported instructions) are collected
// while the remaining kernels continue; any other error aborts the unit. The surviving
// kernels are packaged into the container, dumped as `<unit>.isa` and offered to the
// overrider once more. compile_batch compiles independent units on the rayon thread pool,
// each with its own driver state.

//! Compilation driver: pipeline, checkpoints, lowering, encoding and packaging.

use crate::analysis::AnalysisCache;
use crate::core::{CompilationSession, CompileError, CompileOptions, CompileResult, SessionStats};
use crate::dump::zebin::{write_zebin, KernelImage};
use crate::dump::{FsShaderDumper, FsShaderOverrider, NullShaderDumper, OverrideKind, ShaderDumper, ShaderOverrider};
use crate::encoder::{lower_kernel, Encoder, EncoderOpts};
use crate::ir::{parse_module, FuncId, Module};
use crate::metadata::AnnotationTable;
use crate::passes::{block_type, eu_fusion, kernel_md, stack_usage, PassContext, PassPipeline, PassRegistry};
use bumpalo::Bump;
use log::{debug, info, warn};
use rayon::prelude::*;

/// Passes that rebuild the annotations of a module replaced at the pre-encode checkpoint.
const REFRESH_PASSES: [&str; 4] = [kernel_md::NAME, block_type::NAME, stack_usage::NAME, eu_fusion::NAME];

/// A kernel that could not be compiled while the rest of its unit was.
#[derive(Debug)]
pub struct KernelFailure {
    pub kernel: String,
    pub error: CompileError,
}

/// Result of compiling one unit.
#[derive(Debug)]
pub struct CompileOutput {
    /// The module after the pipeline, or its override.
    pub module: Module,
    pub annotations: AnnotationTable,
    /// Options as left by the pipeline.
    pub options: CompileOptions,
    pub kernels: Vec<KernelImage>,
    pub failures: Vec<KernelFailure>,
    pub container: Vec<u8>,
    pub stats: SessionStats,
}

impl CompileOutput {
    pub fn kernel(&self, name: &str) -> Option<&KernelImage> {
        self.kernels.iter().find(|k| k.name == name)
    }

    /// Every kernel of the unit compiled.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Driver {
    options: CompileOptions,
    registry: PassRegistry,
    dumper: Box<dyn ShaderDumper>,
    overrider: Option<Box<dyn ShaderOverrider>>,
}

impl Driver {
    /// A driver whose dump and override hooks follow the directories in `options`.
    pub fn new(options: CompileOptions) -> Self {
        let dumper: Box<dyn ShaderDumper> = match &options.dump_dir {
            Some(dir) => Box::new(FsShaderDumper::new(dir)),
            None => Box::new(NullShaderDumper),
        };
        let overrider =
            options.override_dir.as_ref().map(|dir| Box::new(FsShaderOverrider::new(dir)) as Box<dyn ShaderOverrider>);
        Self { options, registry: PassRegistry::with_builtin_passes(), dumper, overrider }
    }

    pub fn with_dumper(mut self, dumper: Box<dyn ShaderDumper>) -> Self {
        self.dumper = dumper;
        self
    }

    pub fn with_overrider(mut self, overrider: Box<dyn ShaderOverrider>) -> Self {
        self.overrider = Some(overrider);
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn registry_mut(&mut self) -> &mut PassRegistry {
        &mut self.registry
    }

    fn try_override(&self, buffer: &mut Vec<u8>, name: &str, kind: OverrideKind) -> bool {
        self.overrider.as_ref().is_some_and(|o| o.override_shader(buffer, name, kind))
    }

    pub fn compile(&self, mut module: Module) -> CompileResult<CompileOutput> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let unit = session.intern_str(&module.name);
        let mut options = self.options.clone();
        let mut annotations = AnnotationTable::new();
        let mut analyses = AnalysisCache::new();
        debug!("compiling unit '{}' for {}", unit, options.platform);

        let mut pipeline = PassPipeline::default_pipeline(&self.registry, &options)?;
        {
            let mut ctx =
                PassContext { options: &mut options, annotations: &mut annotations, analyses: &mut analyses, session: &session };
            pipeline.run(&mut module, &mut ctx)?;
        }

        self.dumper.dump_module(&module, &format!("{unit}.ll"))?;
        let mut listing = module.to_string().into_bytes();
        if self.try_override(&mut listing, unit, OverrideKind::Ll) {
            let text = String::from_utf8(listing)
                .map_err(|err| CompileError::Parse { line: 0, message: format!("override of '{unit}' is not UTF-8: {err}") })?;
            module = parse_module(unit, &text)?;
            annotations = AnnotationTable::new();
            analyses.clear();
            // Switches raised by the pipeline described the discarded module.
            options.disable_eu_fusion = self.options.disable_eu_fusion;
            let mut refresh = PassPipeline::from_names(&self.registry, &REFRESH_PASSES)?;
            let mut ctx =
                PassContext { options: &mut options, annotations: &mut annotations, analyses: &mut analyses, session: &session };
            refresh.run(&mut module, &mut ctx)?;
        }

        let mut encoder = Encoder::new(
            options.platform,
            EncoderOpts {
                auto_compact: options.enable_compaction,
                explicit_compact_miss_is_warning: false,
                enable_timing: options.encoder_timing,
            },
        );
        let mut kernels = Vec::new();
        let mut failures = Vec::new();
        let ids: Vec<FuncId> = module.kernels().filter(|k| !module.func(*k).is_declaration()).collect();
        for id in ids {
            let name = &module.func(id).name;
            match self.compile_kernel(&module, id, &annotations, &options, &mut encoder, unit) {
                Ok((image, instructions, compacted)) => {
                    session.record_kernel_encoded(&image.name, image.code.len(), instructions, compacted);
                    kernels.push(image);
                }
                Err(error) if error.is_per_kernel() => {
                    warn!("kernel '{}' not compiled: {}", name, error);
                    session.record_kernel_failed(name);
                    failures.push(KernelFailure { kernel: name.clone(), error });
                }
                Err(error) => return Err(error),
            }
        }

        let mut container = write_zebin(&kernels, options.platform)?;
        self.dumper.dump_binary(&container, &format!("{unit}.isa"))?;
        self.try_override(&mut container, unit, OverrideKind::Isa);

        let stats = session.stats();
        info!(
            "unit '{}': {} kernel(s) compiled, {} failed, {} byte(s) of code",
            unit,
            kernels.len(),
            failures.len(),
            stats.total_code_size
        );
        Ok(CompileOutput { module, annotations, options, kernels, failures, container, stats })
    }

    /// Lower, encode and dump one kernel. Returns the image with its instruction and
    /// compacted-instruction counts.
    fn compile_kernel(
        &self,
        module: &Module,
        id: FuncId,
        annotations: &AnnotationTable,
        options: &CompileOptions,
        encoder: &mut Encoder,
        unit: &str,
    ) -> CompileResult<(KernelImage, usize, usize)> {
        let func = module.func(id);
        let machine = lower_kernel(module, id, annotations, options)?;
        let bti = annotations.kernel_internal(id).map(|md| md.bti.clone()).unwrap_or_default();
        let encoded = encoder.encode_kernel(&machine)?;
        if let Some(report) = &encoded.timings {
            debug!("'{}' encoder timing:\n{}", func.name, report);
        }

        let name = format!("{unit}.{}", func.name);
        self.dumper.dump_text(&machine.to_string(), &format!("{name}.asm"))?;
        let mut code = encoded.bits;
        self.dumper.dump_binary(&code, &format!("{name}.dat"))?;
        if self.try_override(&mut code, &name, OverrideKind::Dat) {
            debug!("'{}' uses {} byte(s) of overridden code", func.name, code.len());
        }

        let image = KernelImage {
            name: func.name.clone(),
            code,
            relocations: encoded.relocations,
            simd: machine.simd,
            private_size: annotations.stack_amount(id).unwrap_or_default(),
            require_disable_eufusion: options.disable_eu_fusion,
            bti,
        };
        Ok((image, encoded.instruction_count, encoded.compacted_count))
    }
}

/// Compile `module` with hooks taken from `options`.
pub fn compile(module: Module, options: CompileOptions) -> CompileResult<CompileOutput> {
    Driver::new(options).compile(module)
}

/// Compile independent units in parallel. Results keep the order of `modules`.
pub fn compile_batch(modules: Vec<Module>, options: &CompileOptions) -> Vec<CompileResult<CompileOutput>> {
    modules.into_par_iter().map(|module| compile(module, options.clone())).collect()
}
