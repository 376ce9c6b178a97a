use std::path::PathBuf;

use clap::Parser;

use snapmem_core::{CancellationToken, RunContext, RunOptions};

#[derive(Parser)]
#[command(
    name = "snapmem-rs-cli",
    version,
    about = "Snapchat Memories downloader - fetch, overlay-merge and convert exported memories"
)]
struct Cli {
    /// memories_history.json from the Snapchat export
    export_json: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Download attempts per record
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Keep videos in their original encoding
    #[arg(long)]
    no_convert: bool,

    /// Probe existing videos and re-encode ones that are not H.264
    #[arg(long)]
    check_existing: bool,

    /// Seconds before a hung conversion backend is killed
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let t_total = std::time::Instant::now();

    let bytes = std::fs::read(&cli.export_json)?;
    let (records, unparsed) = snapmem_core::export::parse_export(&bytes)?;
    eprintln!("Found {} media item(s) in export", records.len());
    for index in &unparsed {
        eprintln!("  skipping entry {}: missing URL, date or media type", index);
    }

    let options = RunOptions {
        output: cli.output,
        max_retries: cli.max_retries,
        convert_videos: !cli.no_convert,
        check_existing: cli.check_existing,
        backend_timeout_secs: cli.timeout_secs,
        ..RunOptions::default()
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current item...");
        handler_token.cancel();
    })?;

    let ctx = RunContext::new(
        token,
        Box::new(|status, index, total, message| {
            eprintln!("[{}/{}] {}: {}", index, total, status, message);
        }),
        Box::new(|line| {
            eprintln!("{}", line);
        }),
    );

    let summary = snapmem_core::process(&records, &options, &ctx)?;

    eprintln!(
        "Done! {} ok ({} merged), {} failed, {} skipped, {} re-encoded of {} ({:.2}s)",
        summary.succeeded,
        summary.merged,
        summary.failed,
        summary.skipped,
        summary.reconverted,
        summary.total,
        t_total.elapsed().as_secs_f64()
    );
    if summary.cancelled {
        eprintln!("Run was cancelled before completing all records");
    }
    for failure in &summary.failures {
        eprintln!("  failed [{}] {}: {}", failure.kind, failure.id, failure.reason);
    }

    Ok(())
}
