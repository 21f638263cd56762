//! Thin command-line wrapper around the compiler core.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vc4cc::{determine_source_type, SourceType};

#[derive(Parser)]
#[command(name = "vc4cc")]
#[command(about = "OpenCL C to VideoCore IV QPU compiler", long_about = None)]
struct Cli {
    /// Input file (reads from stdin if not provided)
    input: Option<PathBuf>,

    /// Output file
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Optimization level (0-2)
    #[arg(short = 'O', default_value_t = 2)]
    optimization_level: u8,

    /// Force the input type instead of auto-detecting it
    #[arg(long)]
    input_type: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Dump profiling results after compilation
    #[arg(long)]
    profile: bool,
}

fn parse_source_type(name: &str) -> Option<SourceType> {
    match name {
        "cl" | "opencl" => Some(SourceType::OpenClC),
        "ll" | "llvm-text" => Some(SourceType::LlvmIrText),
        "bc" | "llvm-bin" => Some(SourceType::LlvmIrBin),
        "spirv" | "spirv-bin" => Some(SourceType::SpirvBin),
        "spirv-text" => Some(SourceType::SpirvText),
        "hex" => Some(SourceType::QpuAsmHex),
        "bin" => Some(SourceType::QpuAsmBin),
        _ => None,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder().filter_level(level).init();

    let data = match &cli.input {
        Some(path) => match fs::read(path) {
            Ok(data) => data,
            Err(error) => {
                eprintln!("Failed to read {}: {error}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => {
            let mut buffer = Vec::new();
            if let Err(error) = io::stdin().read_to_end(&mut buffer) {
                eprintln!("Failed to read stdin: {error}");
                return ExitCode::FAILURE;
            }
            buffer
        }
    };

    let source_type = cli
        .input_type
        .as_deref()
        .and_then(parse_source_type)
        .unwrap_or_else(|| determine_source_type(&data));
    log::info!(
        "Detected input type: {source_type:?} (optimization level {})",
        cli.optimization_level
    );

    let result = run(source_type, &data, &cli);
    if cli.profile {
        vc4cc::profiler::dump_results(true);
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(source_type: SourceType, data: &[u8], cli: &Cli) -> vc4cc::CompileResult<()> {
    match source_type {
        SourceType::QpuAsmBin | SourceType::QpuAsmHex => {
            // already compiled: plain pass-through
            if let Some(output) = &cli.output {
                fs::write(output, data).map_err(|error| {
                    vc4cc::CompileError::linker(format!("failed to write output: {error}"))
                })?;
            }
            Ok(())
        }
        SourceType::Unknown => Err(vc4cc::CompileError::front_end(
            "could not determine the type of the input",
        )),
        other => {
            // parsing the IR into a module is performed by a front-end
            // collaborator, which no external toolchain provided here
            Err(vc4cc::CompileError::front_end(format!(
                "no front-end available for input of type {other:?}; \
                 provide pre-parsed IR through the library interface"
            )))
        }
    }
}
