mod cache;
mod cli;
mod codegen;
mod compiler;
mod config;
mod diagnostics;
mod icall;
mod interfaces;
mod ir;
mod lowering;
mod mangle;
mod metadata;
mod nullable;
mod opcodes;
mod passes;
mod reachability;
mod regions;
mod runtime;
mod timings;

use anyhow::Result;
use cli::Cli;

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse_args()?;
    cli.execute()
}
