use clap::Parser;
use log::{debug, error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use object_patching::logger::PrefixLogger;
use object_patching::{build_patch, BuildOutcome};

/// Build a differential patch object from an original/patched pair of
/// relocatable ELFs, resolved against the running binary.
#[derive(Parser, Debug)]
#[command(
    name = "object-patching",
    version,
    about = "Generate a patch object from a source/patched object pair"
)]
struct Args {
    /// Source object
    #[arg(short = 's', long, value_name = "FILE")]
    source: PathBuf,

    /// Patched object
    #[arg(short = 'p', long, value_name = "FILE")]
    patched: PathBuf,

    /// Running binary file
    #[arg(short = 'r', long, value_name = "FILE")]
    running: PathBuf,

    /// Output object
    #[arg(short = 'o', long, value_name = "FILE")]
    output: PathBuf,

    /// Show debug output
    #[arg(short = 'd', long, action = clap::ArgAction::SetTrue)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let prefix = args
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "object-patching".to_string());
    if PrefixLogger::init(args.debug, prefix).is_err() {
        eprintln!("object-patching: cannot install the logger");
        return ExitCode::FAILURE;
    }

    debug!("source object: {}", args.source.display());
    debug!("patched object: {}", args.patched.display());
    debug!("running binary: {}", args.running.display());
    debug!("output object: {}", args.output.display());

    match build_patch(&args.source, &args.patched, &args.running, &args.output) {
        Ok(BuildOutcome::NoChanges) => ExitCode::SUCCESS,
        Ok(BuildOutcome::Written {
            changed_functions,
            new_globals,
        }) => {
            info!(
                "patch object written to {} ({} changed functions, {} new globals)",
                args.output.display(),
                changed_functions,
                new_globals
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
