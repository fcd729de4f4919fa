//! `qRcmd` monitor commands. Each handler streams `O<hex-text>` lines
//! (one packet per line, flushed immediately) and leaves the final `OK`
//! to the dispatcher.

use crate::conn::Connection;
use crate::debuggee::EventSource;
use crate::protocol::ResponseWriter;
use crate::protocol::ResponseWriterError;

use super::Error;
use super::HandlerStatus;
use super::Session;

/// The monitor command table; names as typed after `monitor `.
const MONITOR_COMMANDS: &[(&str, &str)] = &[
    ("help", "list monitor commands"),
    ("proc", "list debuggable processes"),
    ("mod", "list modules loaded by the debuggee"),
];

fn console_line<C: Connection>(
    conn: &mut C,
    text: &str,
) -> Result<(), ResponseWriterError<C::Error>> {
    let mut res = ResponseWriter::new(conn);
    res.write_str("O")?;
    res.write_hex_buf(text.as_bytes())?;
    res.write_hex_buf(b"\n")?;
    res.flush()
}

impl<'a, E: EventSource> Session<'a, E> {
    pub(crate) fn handle_monitor_cmd<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        cmd: &[u8],
    ) -> Result<HandlerStatus, Error<C::Error>> {
        let cmd = String::from_utf8_lossy(cmd);
        let name = cmd.split_whitespace().next().unwrap_or("");

        match name {
            "help" | "" => {
                for (name, what) in MONITOR_COMMANDS {
                    console_line(res.as_conn(), &format!("{:<6} {}", name, what))?;
                }
            }
            "proc" => self.monitor_proc(res)?,
            "mod" => self.monitor_mod(res)?,
            other => {
                console_line(
                    res.as_conn(),
                    &format!("unknown command '{}'; try 'monitor help'", other),
                )?;
            }
        }

        Ok(HandlerStatus::NeedsOk)
    }

    fn monitor_proc<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
    ) -> Result<(), Error<C::Error>> {
        let procs = match self.dbg.processes() {
            Ok(procs) => procs,
            Err(e) => {
                console_line(res.as_conn(), &format!("cannot list processes: {}", e))?;
                return Ok(());
            }
        };

        console_line(res.as_conn(), " pid    threads  name")?;
        for process in procs {
            let marker = if process.pid == self.registry.pid() {
                '>'
            } else {
                ' '
            };
            console_line(
                res.as_conn(),
                &format!(
                    "{}{:<6} {:<8} {}",
                    marker, process.pid, process.threads, process.name
                ),
            )?;
        }
        Ok(())
    }

    fn monitor_mod<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
    ) -> Result<(), Error<C::Error>> {
        // prefer the symbol provider's richer listing; fall back to the
        // registry's load events
        let mut modules = self.symbols.modules(self.registry.pid());
        if modules.is_empty() {
            modules = self.registry.modules().to_vec();
        }

        if modules.is_empty() {
            console_line(res.as_conn(), "no modules recorded")?;
            return Ok(());
        }

        console_line(res.as_conn(), "base                name")?;
        for module in modules {
            console_line(
                res.as_conn(),
                &format!("{:#018x}  {}", module.base, module.name),
            )?;
        }
        Ok(())
    }
}
