//! TCP transport: bind, optionally hand a local GDB the connection
//! details, accept, and run the session.

use std::io::Write;
use std::net::Ipv4Addr;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;

use log::info;
use log::warn;
use thiserror::Error;

use crate::debuggee::DebuggeeError;
use crate::debuggee::EventSource;
use crate::debuggee::SymbolProvider;
use crate::proxy::DisconnectReason;
use crate::proxy::ProxyError;
use crate::proxy::Session;

/// How to get a GDB client talking to us.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GdbLaunch {
    /// Print the port and wait for a manually started client.
    None,
    /// Spawn the local debugger against the bound port.
    Local,
    /// Spawn the local debugger inside a terminal emulator.
    Xterm,
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Fixed listen port; `None` picks an ephemeral one.
    pub port: Option<u16>,
    pub launch: GdbLaunch,
    /// Debugger executable used for auto-launch.
    pub gdb_path: String,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Debuggee(#[from] DebuggeeError),
    #[error("session failed: {0}")]
    Session(ProxyError<std::io::Error>),
}

/// Drive one complete debug session over TCP.
///
/// The debuggee is pumped to its initial stop first, so the connecting
/// client immediately finds a trapped thread to inspect.
pub fn serve<E: EventSource>(
    dbg: &mut E,
    symbols: &dyn SymbolProvider,
    opts: &ServeOptions,
) -> Result<DisconnectReason, ServeError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, opts.port.unwrap_or(0)))?;
    let port = listener.local_addr()?.port();

    let mut session = Session::new(dbg, symbols);
    session.wait_initial_stop()?;

    let mut gdb = match opts.launch {
        GdbLaunch::None => {
            eprintln!(
                "listening on port {}; connect with: target remote localhost:{}",
                port, port
            );
            None
        }
        GdbLaunch::Local | GdbLaunch::Xterm => Some(launch_gdb(opts, port)?),
    };

    let (mut stream, peer) = listener.accept()?;
    info!("client connected from {}", peer);

    let result = session.run(&mut stream);

    if let Some(launched) = gdb.as_mut() {
        // auto-launch mode owns the client; reap it so the terminal
        // comes back clean
        let _ = launched.child.wait();
    }

    result.map_err(ServeError::Session)
}

struct LaunchedGdb {
    child: Child,
    script: PathBuf,
}

impl Drop for LaunchedGdb {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.script) {
            warn!("could not remove {}: {}", self.script.display(), e);
        }
    }
}

/// Start the local debugger against `port`, pointing it at a generated
/// init script in the temp directory.
fn launch_gdb(opts: &ServeOptions, port: u16) -> Result<LaunchedGdb, std::io::Error> {
    let script = std::env::temp_dir().join(format!("gdbridge-{}.gdb", std::process::id()));
    {
        let mut file = std::fs::File::create(&script)?;
        writeln!(file, "target remote localhost:{}", port)?;
    }

    let mut cmd = match opts.launch {
        GdbLaunch::Xterm => {
            let mut cmd = Command::new("xterm");
            cmd.arg("-e").arg(&opts.gdb_path);
            cmd
        }
        _ => Command::new(&opts.gdb_path),
    };
    cmd.arg("-x").arg(&script);

    info!("starting {} against port {}", opts.gdb_path, port);
    let child = cmd.spawn()?;
    Ok(LaunchedGdb { child, script })
}
