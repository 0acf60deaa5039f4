use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use basalt_core::spirv::module::CompiledModule;

mod kernels;

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "Compile Basalt image kernels to SPIR-V compute modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile one or more built-in kernels into a module
    Compile {
        /// Kernel names (see `basalt kernels`); all of them if omitted
        #[arg(value_name = "KERNEL")]
        names: Vec<String>,

        /// Output file (defaults to basalt.spvmod)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Print the descriptor-set header of a compiled module
    Header {
        /// Compiled module file
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// List the built-in kernels
    Kernels,
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compilation error: {0}")]
    Compilation(#[from] basalt_core::CompilerError),

    #[error("unknown kernel: {0} (try `basalt kernels`)")]
    UnknownKernel(String),
}

fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { names, output } => compile(names, output),
        Commands::Header { input } => dump_header(input),
        Commands::Kernels => {
            for name in kernels::KERNEL_NAMES {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn compile(names: Vec<String>, output: Option<PathBuf>) -> Result<(), DriverError> {
    let names: Vec<String> = if names.is_empty() {
        kernels::KERNEL_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        names
    };
    let mut selected = Vec::with_capacity(names.len());
    for name in &names {
        let kernel =
            kernels::by_name(name).ok_or_else(|| DriverError::UnknownKernel(name.clone()))?;
        selected.push(kernel);
    }

    let module = basalt_core::emit_module(&selected)?;
    let path = output.unwrap_or_else(|| PathBuf::from("basalt.spvmod"));
    fs::write(&path, module.to_bytes())?;
    info!(
        "wrote {} entry points ({} words) to {}",
        names.len(),
        module.header.len() + module.body.len(),
        path.display()
    );
    Ok(())
}

fn dump_header(input: PathBuf) -> Result<(), DriverError> {
    let bytes = fs::read(&input)?;
    let module = CompiledModule::from_bytes(&bytes)?;
    let sets = module.parse_header()?;
    println!("{} entry point(s)", sets.len());
    for ds in sets {
        println!(
            "  {}: uniform_buffers={} storage_buffers={}",
            ds.entry_point_name, ds.uniform_buffer_count, ds.storage_buffer_count
        );
    }
    Ok(())
}
