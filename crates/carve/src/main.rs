//! carve - recovers C structure layouts from compiled x86-64 PE binaries.
//!
//! Usage:
//!   carve <binary>
//!
//! The recovered definitions are printed to stdout as C header text;
//! diagnostics go to stderr through the logger (set RUST_LOG=debug for
//! per-function detail).

use anyhow::{Context as _, Result};
use carve_analysis::{render_all, va_bounds, Pipeline};
use carve_pe::PeImage;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "carve")]
#[command(about = "Recovers C structure layouts from compiled x86-64 PE binaries", long_about = None)]
struct Cli {
    /// Path to the PE file to analyze
    binary: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let image = PeImage::open(&cli.binary)
        .with_context(|| format!("cannot load {}", cli.binary.display()))?;

    println!("// Control flow recovery ...");
    let start = Instant::now();
    let mut pipeline = Pipeline::recover(&image)?;
    let (low, high) = va_bounds(&image, &pipeline.funcs);
    println!(
        "// Analyzed: [{:08x}; {:08x}], {} functions in {}ms",
        low,
        high,
        pipeline.funcs.len(),
        start.elapsed().as_millis()
    );

    println!("// Context propagation ...");
    let start = Instant::now();
    pipeline.propagate();
    println!(
        "// Analyzed {} functions in {}ms",
        pipeline.propagation.len(),
        start.elapsed().as_millis()
    );

    println!("// Structure synthesis ...");
    let start = Instant::now();
    let strucs = pipeline.synthesize();
    println!(
        "// Analyzed {} functions in {}ms",
        pipeline.propagation.len(),
        start.elapsed().as_millis()
    );
    println!("// Recovered {} structures", strucs.len());
    println!();
    print!("{}", render_all(&strucs));
    Ok(())
}
