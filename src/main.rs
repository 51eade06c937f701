use std::{
    io::{self, BufRead, IsTerminal, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::{error::ErrorKind, Parser};
use ilunpack::deobfuscation::{write_stub_failures, write_unresolved, UnpackConfig, Unpacker};
use log::info;

/// ilunpack - unpacker for ILProtector protected .NET executables
#[derive(Debug, Parser)]
#[command(name = "ilunpack", version, about, long_about = None)]
struct Cli {
    /// Path to the protected executable.
    #[arg(value_name = "FILE")]
    path: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default info level
    env_logger::Builder::new()
        .filter_module("ilunpack", log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) if matches!(error.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            error.exit()
        }
        Err(_) => return Ok(()),
    };
    let Some(path) = cli.path.filter(|path| path.is_file()) else {
        return Ok(());
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(error) = unpack(&path, &mut out) {
        let _ = writeln!(out, "Error: {error:#}");
    }
    let _ = writeln!(out, "Press any key to exit...");
    let _ = out.flush();
    drop(out);

    let stdin = io::stdin();
    if stdin.is_terminal() {
        let _ = stdin.lock().read_line(&mut String::new());
    }
    Ok(())
}

fn unpack(path: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    let unpacker = Unpacker::new(UnpackConfig::default());

    let mut target = unpacker.load(path)?;
    write_unresolved(out, &target.unresolved_errors())?;

    let mut report = unpacker.unpack(&mut target)?;
    write_stub_failures(out, &report.stub_failures)?;

    let output = unpacker
        .save(&target)
        .with_context(|| format!("failed to write output for {}", path.display()))?;
    report.output = Some(output);
    info!("{}", report.summary());
    Ok(())
}
