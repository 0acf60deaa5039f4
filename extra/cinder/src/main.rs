//! Command-line runner for Basalt compiled modules.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cinder::allocator::MemoryRegion;
use cinder::{parse_module, DeviceRuntime};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(about = "Run Basalt compute modules on Vulkan", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the entry points of a compiled module
    Info {
        /// Compiled module file (.spvmod)
        #[arg(value_name = "MODULE")]
        module: PathBuf,
    },

    /// Dispatch one entry point over byte buffers loaded from files
    Run {
        /// Compiled module file (.spvmod)
        #[arg(value_name = "MODULE")]
        module: PathBuf,

        /// Entry point name
        #[arg(short, long)]
        entry: String,

        /// Workgroup counts, x,y,z
        #[arg(short, long, value_delimiter = ',', num_args = 3, default_value = "1,1,1")]
        blocks: Vec<u32>,

        /// Input/output buffer files, bound in order
        #[arg(short = 'f', long = "buffer", value_name = "FILE")]
        buffers: Vec<PathBuf>,

        /// Scalar argument bytes, hex encoded (e.g. 28 for a u8 bias of 40)
        #[arg(short, long, default_value = "")]
        scalars: String,

        /// Write each buffer back to its file after the dispatch
        #[arg(short, long)]
        writeback: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Info { module } => info(module),
        Commands::Run {
            module,
            entry,
            blocks,
            buffers,
            scalars,
            writeback,
        } => run(module, entry, blocks, buffers, scalars, writeback),
    }
}

fn info(module: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&module)
        .with_context(|| format!("failed to read {}", module.display()))?;
    let parsed = parse_module(&bytes)?;
    println!("{} entry point(s)", parsed.entry_points.len());
    for ep in &parsed.entry_points {
        println!(
            "  {}: uniform_buffers={} storage_buffers={}",
            ep.name, ep.uniform_buffer_count, ep.storage_buffer_count
        );
    }
    println!("body: {} words", parsed.spirv.len());
    Ok(())
}

fn run(
    module: PathBuf,
    entry: String,
    blocks: Vec<u32>,
    buffer_paths: Vec<PathBuf>,
    scalars: String,
    writeback: bool,
) -> Result<()> {
    let module_bytes = std::fs::read(&module)
        .with_context(|| format!("failed to read {}", module.display()))?;
    let scalar_bytes = decode_hex(&scalars)?;

    let mut runtime = DeviceRuntime::new().context("failed to initialize the device runtime")?;
    println!("device: {}", runtime.context().device_name());
    runtime.initialize_kernels(&module_bytes)?;

    let mut regions: Vec<(MemoryRegion, Vec<u8>)> = Vec::new();
    for path in &buffer_paths {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let region = runtime.device_and_host_malloc(data.len() as u64)?;
        runtime.copy_to_device(region, &data)?;
        regions.push((region, data));
    }

    let block_dims = [blocks[0], blocks[1], blocks[2]];
    let buffer_regions: Vec<MemoryRegion> = regions.iter().map(|(r, _)| *r).collect();
    runtime
        .run(&module_bytes, &entry, block_dims, &scalar_bytes, &buffer_regions)
        .with_context(|| format!("dispatch of {} failed", entry))?;
    runtime.device_sync()?;

    if writeback {
        for (path, (region, data)) in buffer_paths.iter().zip(regions.iter_mut()) {
            runtime.copy_to_host(*region, data)?;
            std::fs::write(path, data.as_slice())
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }

    for (region, _) in regions {
        runtime.device_free(region);
    }
    runtime.finalize_kernels();
    println!("ok");
    Ok(())
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }
    if s.len() % 2 != 0 {
        bail!("scalar hex string has odd length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).context("invalid hex in scalar string"))
        .collect()
}
