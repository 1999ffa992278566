//! `xec`: compiles `.kir` kernel graph files into kernel containers.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use xe_codegen::dump::zebin::read_kernels;
use xe_codegen::encoder::{disassemble, Platform};
use xe_codegen::ir::{parse_module, Module};
use xe_codegen::{compile_batch, CompileOptions, CompileOutput, CompileResult};

#[derive(Parser)]
#[command(name = "xec", version, about = "GPU kernel backend: .kir in, kernel container out")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile one or more .kir files, each as its own unit
    Compile {
        /// Input .kir files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output directory for the containers (default: next to each input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Target platform (gen9, gen11, xelp, xehpc)
        #[arg(long, default_value = "xehpc")]
        platform: Platform,
        /// SIMD width of kernels that do not request one
        #[arg(long, default_value_t = 16)]
        simd: u32,
        /// Never emit compacted instructions
        #[arg(long)]
        no_compact: bool,
        /// Report encoder phase timings
        #[arg(long)]
        timing: bool,
        /// Mark every function no-inline
        #[arg(long)]
        disable_inlining: bool,
        /// Recompile a unit with retry settings when one of its kernels fails
        #[arg(long)]
        retry_on_failure: bool,
        /// Write intermediate artifacts to this directory
        #[arg(long, value_name = "DIR")]
        dump_dir: Option<PathBuf>,
        /// Read artifact replacements from this directory
        #[arg(long, value_name = "DIR")]
        override_dir: Option<PathBuf>,
        /// Print session statistics
        #[arg(long)]
        stats: bool,
    },
    /// Disassemble the kernels of a container
    Disasm {
        /// Container file
        input: PathBuf,
        #[arg(long, default_value = "xehpc")]
        platform: Platform,
    },
}

fn load(path: &Path) -> CompileResult<Module> {
    let text = fs::read_to_string(path)?;
    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unit");
    parse_module(name, &text)
}

fn report(path: &Path, output: &CompileOutput, stats: bool) {
    for failure in &output.failures {
        eprintln!("{}: kernel '{}': {}", path.display(), failure.kernel, failure.error);
    }
    if stats {
        println!("{}: {}", path.display(), output.stats);
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Compile {
            inputs,
            output,
            platform,
            simd,
            no_compact,
            timing,
            disable_inlining,
            retry_on_failure,
            dump_dir,
            override_dir,
            stats,
        } => {
            let mut options = CompileOptions::new()
                .with_platform(platform)
                .with_default_simd(simd)
                .with_compaction(!no_compact)
                .with_encoder_timing(timing)
                .with_disable_inlining(disable_inlining)
                .apply_env();
            if let Some(dir) = dump_dir {
                options = options.with_dump_dir(dir);
            }
            if let Some(dir) = override_dir {
                options = options.with_override_dir(dir);
            }

            let mut modules = Vec::with_capacity(inputs.len());
            for path in &inputs {
                match load(path) {
                    Ok(module) => modules.push(module),
                    Err(err) => {
                        eprintln!("{}: {}", path.display(), err);
                        process::exit(1);
                    }
                }
            }

            let mut failed = false;
            let results = compile_batch(modules.clone(), &options);
            for ((path, module), result) in inputs.iter().zip(modules).zip(results) {
                let result = match result {
                    Ok(out) if !out.is_complete() && retry_on_failure => {
                        report(path, &out, false);
                        eprintln!("{}: retrying", path.display());
                        xe_codegen::compile(module, options.clone().with_retry(true))
                    }
                    other => other,
                };
                let out = match result {
                    Ok(out) => out,
                    Err(err) => {
                        eprintln!("{}: {}", path.display(), err);
                        failed = true;
                        continue;
                    }
                };
                report(path, &out, stats);
                failed |= !out.is_complete();

                let target = match &output {
                    Some(dir) => dir.join(path.with_extension("zebin").file_name().unwrap_or_default()),
                    None => path.with_extension("zebin"),
                };
                if let Err(err) = fs::write(&target, &out.container) {
                    eprintln!("{}: {}", target.display(), err);
                    failed = true;
                }
            }
            if failed {
                process::exit(1);
            }
        }
        Command::Disasm { input, platform } => {
            let result = fs::read(&input).map_err(Into::into).and_then(|bytes| read_kernels(&bytes));
            let kernels = match result {
                Ok(kernels) => kernels,
                Err(err) => {
                    eprintln!("{}: {}", input.display(), err);
                    process::exit(1);
                }
            };
            for (name, code) in kernels {
                println!("// kernel {name}");
                match disassemble(platform, &code) {
                    Ok(text) => print!("{text}"),
                    Err(err) => eprintln!("{name}: {err}"),
                }
            }
        }
    }
}
