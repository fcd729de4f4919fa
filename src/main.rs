use clap::Parser;
use log::error;

use gdbridge::debuggee::NoSymbols;
use gdbridge::transport;
use gdbridge::transport::GdbLaunch;
use gdbridge::transport::ServeOptions;

type DynResult<T> = Result<T, Box<dyn std::error::Error>>;

/// GDB Remote Serial Protocol proxy.
///
/// Attaches to (or spawns) a debuggee and exposes it to an unmodified
/// GDB client over TCP. By default a local GDB is started
/// automatically; use --no-start to connect one by hand.
#[derive(Debug, Parser)]
#[command(name = "gdbridge", version, about)]
struct Cli {
    /// Do not start a local GDB; print the port to connect to instead
    #[arg(long = "no-start")]
    no_start: bool,

    /// Start GDB inside a terminal emulator
    #[arg(long = "with-xterm")]
    with_xterm: bool,

    /// Listen on a fixed TCP port instead of an ephemeral one
    #[arg(long)]
    port: Option<u16>,

    /// Debugger executable used for auto-launch
    #[arg(long, env = "GDBRIDGE_GDB", default_value = "gdb")]
    gdb: String,

    /// Process id to attach to, or a command line to spawn
    #[arg(required = true, trailing_var_arg = true)]
    target: Vec<String>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()) {
        error!("{}", e);
        eprintln!("gdbridge: {}", e);
        std::process::exit(1);
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        fn run(cli: Cli) -> DynResult<()> {
            use gdbridge::debuggee::PtraceDebuggee;

            let mut dbg = match cli.target.as_slice() {
                [pid] if pid.chars().all(|c| c.is_ascii_digit()) => {
                    PtraceDebuggee::attach(pid.parse()?)?
                }
                argv => PtraceDebuggee::spawn(argv)?,
            };

            let launch = if cli.no_start {
                GdbLaunch::None
            } else if cli.with_xterm {
                GdbLaunch::Xterm
            } else {
                GdbLaunch::Local
            };

            let reason = transport::serve(
                &mut dbg,
                &NoSymbols,
                &ServeOptions {
                    port: cli.port,
                    launch,
                    gdb_path: cli.gdb,
                },
            )?;

            log::info!("done: {:?}", reason);
            Ok(())
        }
    } else {
        fn run(_cli: Cli) -> DynResult<()> {
            Err("no native debuggee backend for this platform".into())
        }
    }
}
