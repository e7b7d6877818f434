use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr};
use console::style;
use itertools::Itertools;
use serde::Deserialize;
use simtcore::{
    address, config,
    dim::Dim,
    instruction::{MemorySpace, WarpInstruction},
    kernel::{Kernel, KernelEntry},
    opcodes::ArchOp,
    resources, warp,
};
use std::path::{Path, PathBuf};

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration as YAML
    Config,
    /// Generate the memory accesses of a single warp memory instruction
    Coalesce {
        /// JSON description of the instruction
        #[arg(value_name = "INSTRUCTION")]
        path: PathBuf,
    },
    /// Print the dispatch order of the blocks of a kernel
    Blocks {
        #[arg(short, long)]
        grid: Dim,
        #[arg(short, long)]
        block: Dim,
    },
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// YAML configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

/// Warp memory instruction as read from JSON.
#[derive(Debug, Deserialize)]
struct MemoryInstruction {
    pc: address,
    opcode: ArchOp,
    space: MemorySpace,
    data_size: u32,
    #[serde(default)]
    is_atomic: bool,
    /// Effective address per lane, inactive lanes are `null`.
    addresses: Vec<Option<address>>,
}

fn load_config(path: Option<&Path>) -> eyre::Result<config::GPU> {
    let config = match path {
        Some(path) => config::GPU::from_yaml_file(path)?,
        None => config::GPU::default(),
    };
    config.validate()?;
    Ok(config)
}

fn coalesce(config: &config::GPU, path: &Path) -> eyre::Result<()> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?,
    );
    let desc: MemoryInstruction = serde_json::from_reader(reader)?;
    if desc.addresses.len() > config.warp_size {
        eyre::bail!(
            "{} addresses exceed warp size {}",
            desc.addresses.len(),
            config.warp_size
        );
    }

    let mut inst = WarpInstruction::new(config.warp_size);
    inst.pc = desc.pc;
    inst.opcode = desc.opcode;
    inst.memory_space = Some(desc.space);
    inst.data_size = desc.data_size;
    inst.is_atomic = desc.is_atomic;
    let active = warp::mask_from_lanes(
        desc.addresses
            .iter()
            .positions(Option::is_some),
    );
    inst.issue(active, 0, 0, 0, false);
    for (lane, addr) in desc.addresses.iter().enumerate() {
        if let Some(addr) = addr {
            inst.set_addr(lane, *addr);
        }
    }

    let mut resources = resources::ResourceAccounting::new(config);
    let mut stats = stats::Stats::new();
    inst.generate_mem_accesses(config, &mut resources, &mut stats);

    println!(
        "{} ({} active lanes, initiation interval {})",
        style(&inst).bold(),
        inst.active_count(),
        inst.initiation_interval
    );
    for access in &inst.mem_access_queue {
        println!(
            "  {} mask={} sectors={}",
            style(access).cyan(),
            warp::ToBitString::to_bit_string(&access.warp_active_mask[..config.warp_size]),
            warp::ToBitString::to_bit_string(&access.sector_mask[..4]),
        );
    }
    println!("accesses: {:#?}", stats.accesses);
    println!("instructions: {:?}", stats.instructions.get(desc.space.into()));
    println!("pc: {:#?}", stats.pc.get(inst.pc));
    if resources.bypass != resources::BypassCounters::default() {
        println!("bypassed: {:?}", resources.bypass);
    }
    Ok(())
}

fn blocks(config: &config::GPU, grid: Dim, block: Dim) {
    let mut resources = resources::ResourceAccounting::new(config);
    let mut kernel = Kernel::new(grid, block, KernelEntry::new("cli", 0), config);
    let mut order = Vec::new();
    while !kernel.no_more_ctas_to_run() {
        order.push(format!(
            "{}={}",
            kernel.next_cta_id(),
            kernel.next_block_id()
        ));
        kernel.increment_cta_id(config, &mut resources);
    }
    println!(
        "{} blocks of {} threads: {}",
        style(kernel.num_blocks()).bold(),
        kernel.threads_per_cta(),
        order.join(" ")
    );
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    let config = load_config(options.config.as_deref())?;
    match options.command {
        Command::Config => print!("{}", serde_yaml::to_string(&config)?),
        Command::Coalesce { path } => coalesce(&config, &path)?,
        Command::Blocks { grid, block } => blocks(&config, grid, block),
    }
    Ok(())
}
