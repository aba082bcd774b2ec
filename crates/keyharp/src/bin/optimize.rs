// keyharp-optimize — offline note-spacing pass for MIDI files.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use keyharp_midi::optimize;

#[derive(Parser, Debug)]
#[command(
    name = "keyharp-optimize",
    about = "Spread MIDI note-ons so consecutive strikes satisfy the skill cooldown"
)]
struct Args {
    /// Input MIDI file.
    input: PathBuf,

    /// Output path; defaults to "<input stem>-optimized.mid".
    output: Option<PathBuf>,

    /// Minimum note-on spacing in milliseconds.
    #[arg(long, default_value_t = 125)]
    cooldown_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let mut smf = midly::Smf::parse(&bytes)?;

    let reports = optimize::resolve_conflicts(&mut smf, Duration::from_millis(args.cooldown_ms))?;
    for (index, report) in reports.iter().enumerate() {
        info!(
            "track {}/{}: {} conflicts resolved in {} rounds",
            index + 1,
            reports.len(),
            report.conflicts,
            report.rounds
        );
    }

    let output = args.output.unwrap_or_else(|| {
        let stem = args
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        args.input.with_file_name(format!("{stem}-optimized.mid"))
    });
    smf.save(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!("wrote {}", output.display());
    Ok(())
}
