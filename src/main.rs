use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use aout86::aout::Exec;
use aout86::controller::{self, RunConfig};
use aout86::error::Error;
use aout86::uselib::LibraryMap;
use aout86::wait::SignalPolicy;

/// Runs legacy i386 a.out executables by steering a traced helper binary.
#[derive(Parser, Debug)]
#[command(name = "aout86", version)]
struct Args {
    /// Log to FILE at debug level; use "stdout" for the terminal.
    #[arg(short = 'l', long = "log", value_name = "FILE")]
    log: Option<String>,

    /// Print the a.out header, then exit.
    #[arg(short = 'p', long = "print-header")]
    print_header: bool,

    /// Helper binary that performs the mappings inside the tracee.
    #[arg(long, value_name = "PATH", default_value = "./trampoline")]
    trampoline: PathBuf,

    /// Library name mapping file, one `name:replacement` per line.
    #[arg(long, value_name = "FILE", default_value = "uselib.conf")]
    map: PathBuf,

    /// Abort after N single-steps without instruction-pointer progress.
    #[arg(long, value_name = "N", default_value_t = 2)]
    stall_limit: u32,

    /// The a.out executable to run.
    program: PathBuf,

    /// Arguments forwarded to the program unchanged.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_logging(args.log.as_deref()) {
        eprintln!("aout86: {err}");
        return ExitCode::FAILURE;
    }
    match run(args) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("aout86: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log: Option<&str>) -> std::io::Result<()> {
    match log {
        Some("stdout") => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_env_filter(EnvFilter::new("debug"))
                .init();
        }
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_target(false)
                .with_ansi(false)
                .with_env_filter(EnvFilter::new("debug"))
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .init();
        }
    }
    Ok(())
}

fn run(args: Args) -> aout86::Result<i32> {
    if args.print_header {
        let mut source = File::open(&args.program).map_err(|source| Error::Image {
            path: args.program.clone(),
            source,
        })?;
        let header = Exec::read_from(&mut source).map_err(|source| Error::Image {
            path: args.program.clone(),
            source,
        })?;
        print!("{header}");
        return Ok(0);
    }

    let library_map = LibraryMap::load(&args.map)?;
    controller::run(RunConfig {
        program: args.program,
        args: args.args,
        trampoline: args.trampoline,
        library_map,
        stall_limit: args.stall_limit,
        signal_policy: SignalPolicy::default(),
    })
}
