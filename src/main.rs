mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{run_bench, run_check, BenchArgs, CheckArgs};

/// slotscan: gated slot attention and IPLR delta-rule kernels
#[derive(Parser, Debug)]
#[command(name = "slotscan")]
#[command(about = "Fused and chunked recurrent attention kernels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare chunked and fused kernels (outputs, states, gradients)
    Check(CheckArgs),
    /// Time the slot attention layer in each kernel mode
    Bench(BenchArgs),
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => run_check(args),
        Command::Bench(args) => run_bench(args),
    }
}
