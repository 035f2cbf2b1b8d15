use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;

use usym::Format;

/// usym - convert PDB or DWARF debug info into a Universal Symbol Format file
#[derive(Parser)]
#[command(name = "usym")]
#[command(version)]
#[command(about = "convert PDB or DWARF debug info into a Universal Symbol Format file", long_about = None)]
struct Cli {
    /// debug info source (.pdb, or an ELF / Mach-O / PE image or object file)
    input: PathBuf,

    /// output path without extension (defaults to the input path without its
    /// extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// output encoding
    #[arg(short, long, default_value = "json", value_parser = ["binary", "json"])]
    format: String,

    /// refuse to write a graph with unresolved type references
    #[arg(long)]
    strict: bool,

    /// suppress informational messages
    #[arg(short = 'q', long)]
    quiet: bool,

    /// verbose logging to console (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logger(cli.verbose, cli.quiet);

    let format = Format::from_name(&cli.format)
        .ok_or_else(|| anyhow!("invalid output format: {}", cli.format))?;

    info!("input: {}", cli.input.display());
    info!("format: {}", format.as_str());

    debug!("load debug info: {}", cli.input.display());
    let mut graph = usym::create_graph_from_file(&cli.input)
        .with_context(|| format!("failed to read symbols from {}", cli.input.display()))?;

    if graph.type_symbols.is_empty() && graph.function_symbols.is_empty() {
        warn!(
            "no symbols found in the input. maybe it was compiled without debug info, or stripped?"
        );
    }

    if cli.strict {
        graph.deduplicate();
        if !graph.verify_type_ids() {
            bail!("symbol graph has unresolved type references");
        }
    }

    let output = cli.output.unwrap_or_else(|| cli.input.with_extension(""));

    graph.set_serializer(format);
    graph
        .serialize(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    info!(
        "{} types, {} functions",
        graph.type_symbols.len(),
        graph.function_symbols.len()
    );

    Ok(())
}

fn init_logger(verbose: u8, quiet: bool) {
    // If quiet mode is enabled, only show warnings and errors
    let log_level = if quiet {
        log::LevelFilter::Warn
    } else {
        match verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();
}
