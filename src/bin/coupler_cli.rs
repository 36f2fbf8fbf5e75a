use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use coupler::config::CodeTopology;
use coupler::lock::{read_done, Filesystem, LocalFs, OwnerRecord, SentinelPaths};
use coupler::transport::file::read_all_steps;

#[derive(Parser)]
#[command(name = "coupler-cli", version, about = "Inspect and repair coupled group files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show busy sentinels and the done marker of a data file.
    Status {
        filename: PathBuf,
        /// Reader codes of the group; repeat for each.
        #[arg(long = "code")]
        codes: Vec<String>,
        #[arg(long = "reader-id", default_value = "")]
        reader_id: String,
    },
    /// Remove busy sentinels left behind by a crashed code.
    Clear {
        filename: PathBuf,
        #[arg(long = "code")]
        codes: Vec<String>,
        #[arg(long = "reader-id", default_value = "")]
        reader_id: String,
        #[arg(long = "force")]
        force: bool,
    },
    /// Print the steps committed to a file-engine output.
    Steps {
        filename: PathBuf,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Status {
            filename,
            codes,
            reader_id,
        } => cmd_status(&filename, &sentinels(&filename, codes, reader_id), &mut out)?,
        Commands::Clear {
            filename,
            codes,
            reader_id,
            force,
        } => cmd_clear(&sentinels(&filename, codes, reader_id), force, &mut out)?,
        Commands::Steps { filename, limit } => cmd_steps(&filename, limit, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn sentinels(filename: &Path, codes: Vec<String>, reader_id: String) -> SentinelPaths {
    let topology = if codes.is_empty() {
        CodeTopology::default()
    } else {
        CodeTopology::new("coupler-cli", codes)
    };
    SentinelPaths::derive(filename, &topology.with_reader_id(reader_id))
}

fn busy_markers(paths: &SentinelPaths) -> impl Iterator<Item = &Path> {
    std::iter::once(paths.writer()).chain(paths.readers().iter().map(PathBuf::as_path))
}

fn describe_owner(fs: &dyn Filesystem, path: &Path) -> String {
    match fs.read_to_string(path).ok().as_deref().and_then(OwnerRecord::parse) {
        Some(owner) if owner.is_alive() => format!("held by pid {}", owner.pid),
        Some(owner) => format!("orphaned (pid {} is gone)", owner.pid),
        None => "held (owner unknown)".to_string(),
    }
}

fn cmd_status(filename: &Path, paths: &SentinelPaths, out: &mut dyn Write) -> Result<()> {
    let fs = LocalFs;
    writeln!(out, "file: {}", filename.display())?;
    for marker in busy_markers(paths) {
        let state = if fs.exists(marker) {
            describe_owner(&fs, marker)
        } else {
            "free".to_string()
        };
        writeln!(out, "  {}: {state}", marker.display())?;
    }
    match read_done(&fs, filename) {
        Some(Some(step)) => writeln!(out, "  done at step {step}")?,
        Some(None) => writeln!(out, "  done")?,
        None => writeln!(out, "  not done")?,
    }
    Ok(())
}

fn cmd_clear(paths: &SentinelPaths, force: bool, out: &mut dyn Write) -> Result<()> {
    let fs = LocalFs;
    let present: Vec<&Path> = busy_markers(paths).filter(|marker| fs.exists(marker)).collect();
    if present.is_empty() {
        writeln!(out, "no busy sentinels")?;
        return Ok(());
    }
    if !force {
        for marker in &present {
            writeln!(out, "would remove {}", marker.display())?;
        }
        bail!("refusing to remove sentinels without --force; make sure no coupled code is running");
    }
    for marker in present {
        if fs.remove(marker)? {
            log::warn!("removed sentinel {}", marker.display());
            writeln!(out, "removed {}", marker.display())?;
        }
    }
    Ok(())
}

fn cmd_steps(filename: &Path, limit: Option<usize>, out: &mut dyn Write) -> Result<()> {
    let steps = read_all_steps(filename)?;
    let limit = limit.unwrap_or(steps.len());
    for (index, step) in steps.iter().enumerate().take(limit) {
        writeln!(out, "{index}: {}", serde_json::to_string(step)?)?;
    }
    Ok(())
}
