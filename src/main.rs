use std::env;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use brandy::config::parse_size;
use brandy::keyboard::{StdinKeys, TerminalKeys};
use brandy::vdu::mode_info;
use brandy::video::Video;
use brandy::{Config, Interpreter, Keyboard};

/// Exit status when a program run with `-quit` stops with an error
const ERROR_STATUS: u8 = 255;

/// Options that Brandy spells with a single dash
const LONG_OPTIONS: &[&str] =
    &["help", "version", "size", "load", "chain", "quit", "lib", "path", "ignore", "strict", "nostar", "tek"];

#[derive(Parser, Debug)]
#[command(name = "brandy", version, about = "BBC BASIC V/VI interpreter")]
struct Args {
    /// Workspace size: N, NK, NM or NG
    #[arg(long, value_name = "SIZE")]
    size: Option<String>,

    /// Load a program and wait at the prompt
    #[arg(long, value_name = "FILE")]
    load: Option<String>,

    /// Load and run a program
    #[arg(long, value_name = "FILE")]
    chain: Option<String>,

    /// Load and run a program, then exit
    #[arg(long, value_name = "FILE")]
    quit: Option<String>,

    /// Install a library before starting
    #[arg(long, value_name = "FILE")]
    lib: Vec<String>,

    /// Directories searched for programs and libraries
    #[arg(long, value_name = "DIRLIST")]
    path: Option<String>,

    /// Suppress cosmetic warnings
    #[arg(long)]
    ignore: bool,

    /// Treat behaviour warnings as errors
    #[arg(long)]
    strict: bool,

    /// Pass every `*` command to the host
    #[arg(long)]
    nostar: bool,

    /// Tektronix graphics on the text terminal
    #[arg(long)]
    tek: bool,

    /// Program to run
    file: Option<String>,

    /// Arguments for the BASIC program
    #[arg(last = true)]
    program_args: Vec<String>,
}

/// Turn `-size` into `--size` so clap sees a long option. Anything after
/// `--` is left alone.
fn normalise(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut passthrough = false;
    for arg in args {
        if !passthrough {
            if arg == "--" {
                passthrough = true;
            } else if let Some(name) = arg.strip_prefix('-').filter(|n| !n.starts_with('-')) {
                if LONG_OPTIONS.iter().any(|o| o.eq_ignore_ascii_case(name)) {
                    out.push(format!("--{}", name.to_ascii_lowercase()));
                    continue;
                }
            }
        }
        out.push(arg);
    }
    out
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("BRANDY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

/// Settings from the rc file, overridden by the command line
fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::load_rc();
    if let Some(size) = &args.size {
        config.size = parse_size(size).ok_or_else(|| anyhow!("bad workspace size '{}'", size))?;
    }
    if let Some(path) = &args.path {
        config.set_option("path", Some(path));
    }
    config.libs.extend(args.lib.iter().map(PathBuf::from));
    config.ignore |= args.ignore;
    config.strict |= args.strict;
    config.nostar |= args.nostar;
    config.tek_enabled |= args.tek;
    Ok(config)
}

fn start(args: Args) -> anyhow::Result<u8> {
    let config = build_config(&args)?;

    let escape = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&escape);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)).context("installing the SIGINT handler")?;

    let interactive = io::stdin().is_terminal();
    let keyboard = if interactive {
        Keyboard::new(Box::new(TerminalKeys::new(Arc::clone(&escape))), escape)
    } else {
        Keyboard::new(Box::new(StdinKeys::default()), escape)
    };
    let (width, height) = mode_info(config.startup_mode).map_or((640, 512), |m| m.display_size());
    let video = Arc::new(Video::start(width, height));
    let libs = config.libs.clone();

    let mut interp = Interpreter::new(config, video, keyboard).context("starting the interpreter")?;
    interp.screen.set_echo(Box::new(io::stdout()));
    interp.set_args(args.program_args.clone());

    for lib in &libs {
        let name = lib.display().to_string();
        if let Err(err) = interp.install_library(&name) {
            let _ = interp.screen.write_str(&format!("{}\r\n", err.message()));
        }
    }

    let (program, run, quit) = match (&args.quit, &args.chain, &args.load, &args.file) {
        (Some(f), _, _, _) => (Some(f), true, true),
        (None, Some(f), _, _) => (Some(f), true, false),
        (None, None, Some(f), _) => (Some(f), false, false),
        (None, None, None, Some(f)) => (Some(f), true, false),
        _ => (None, false, false),
    };

    match program {
        Some(name) => {
            info!(program = %name, run, quit, "starting");
            if let Err(err) = interp.load_program(name) {
                let _ = interp.screen.write_str(&format!("{}\r\n", err.message()));
                interp.screen.flush();
                if quit {
                    return Ok(ERROR_STATUS);
                }
            } else if run {
                let result = interp.run();
                interp.screen.flush();
                if quit {
                    return Ok(match (interp.quit_code(), result) {
                        (Some(code), _) => code as u8,
                        (None, Ok(())) => 0,
                        (None, Err(_)) => ERROR_STATUS,
                    });
                }
            }
        }
        None => {
            let banner = format!("Brandy BASIC V version {}\r\n\r\n", env!("CARGO_PKG_VERSION"));
            let _ = interp.screen.write_str(&banner);
        }
    }
    if let Some(code) = interp.quit_code() {
        return Ok(code as u8);
    }
    let code = interp.repl();
    debug!(code, "leaving");
    Ok(code as u8)
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse_from(normalise(env::args()));
    match start(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("brandy: {:#}", err);
            ExitCode::from(ERROR_STATUS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_dash_options() {
        let out = normalise(strings(&["brandy", "-size", "1M", "-quit", "prog", "--", "-size"]));
        assert_eq!(out, strings(&["brandy", "--size", "1M", "--quit", "prog", "--", "-size"]));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(normalise(strings(&["brandy", "-chain", "game", "-lib", "a", "-lib", "b", "--", "x"])));
        assert_eq!(args.chain.as_deref(), Some("game"));
        assert_eq!(args.lib, vec!["a", "b"]);
        assert_eq!(args.program_args, vec!["x"]);
    }
}
