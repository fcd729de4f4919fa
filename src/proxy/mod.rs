//! The proxy engine: one [`Session`] per connected client, pumping
//! packets while the debuggee is trapped and debug events while it runs
//! free.

use std::time::Duration;

use log::debug;
use log::info;
use log::trace;
use log::warn;
use thiserror::Error;

use crate::arch::Cpu;
use crate::common::Signal;
use crate::common::Tid;
use crate::conn::ConnectionExt;
use crate::debuggee::DebuggeeError;
use crate::debuggee::EventSource;
use crate::debuggee::Registry;
use crate::debuggee::SymbolProvider;
use crate::errno;
use crate::protocol::commands::Command;
use crate::protocol::Inbound;
use crate::protocol::RecvBuffer;
use crate::protocol::ResponseWriter;
use crate::protocol::ResponseWriterError;

mod dispatch;
mod monitor;
mod resume;
mod translate;
mod xpoints;

use xpoints::XpointSet;

/// How long one debug-event wait may block while the debuggee runs
/// free; bounds the latency of servicing the interrupt byte.
const EVENT_POLL: Duration = Duration::from_millis(50);

/// Advertised packet-buffer size (`qSupported` `PacketSize`).
const PACKET_SIZE: usize = 0x4000;

/// Why a session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Debuggee exited with the given status.
    TargetExited(u32),
    /// Client asked to detach; the debuggee keeps running.
    Detach,
    /// Client asked to kill the debuggee.
    Kill,
}

#[derive(Debug, Error)]
pub enum ProxyError<C> {
    #[error("connection i/o failed")]
    Connection(C),
    #[error("client hung up")]
    ClientHangup,
    #[error(transparent)]
    Debuggee(DebuggeeError),
}

/// Handler outcome. `Handled` means the handler composed its own reply
/// (possibly the empty one); `NeedsOk` asks the dispatcher to append
/// the generic `OK`; errors become `E<nn>` replies upstream.
pub(crate) enum HandlerStatus {
    Handled,
    NeedsOk,
    /// The debuggee was set running; no reply until the next stop.
    Resumed,
    Disconnect(DisconnectReason),
}

/// Internal handler error. `NonFatal` carries the errno for an `E`
/// reply; everything else tears the session down.
pub(crate) enum Error<C> {
    NonFatal(u8),
    Response(ResponseWriterError<C>),
    Fatal(DebuggeeError),
}

impl<C> From<ResponseWriterError<C>> for Error<C> {
    fn from(e: ResponseWriterError<C>) -> Self {
        Error::Response(e)
    }
}

/// Eases mapping debuggee-side failures onto `E<nn>` replies.
pub(crate) trait DebuggeeResultExt<V, C> {
    fn op_err(self) -> Result<V, Error<C>>;
}

impl<V, C> DebuggeeResultExt<V, C> for Result<V, DebuggeeError> {
    fn op_err(self) -> Result<V, Error<C>> {
        self.map_err(|e| match e {
            DebuggeeError::MemoryFault { .. } => Error::NonFatal(errno::EFAULT),
            DebuggeeError::NoThread(_) => Error::NonFatal(errno::ESRCH),
            DebuggeeError::Gone => Error::Fatal(DebuggeeError::Gone),
            DebuggeeError::Backend(_) => Error::NonFatal(errno::EPERM),
        })
    }
}

/// Session run state. The thread selectors and `last_signal` are only
/// meaningful in `Trapped`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RunState {
    Running,
    Trapped { tid: Tid },
    Terminated { code: u32 },
}

/// One RSP session: everything the dispatcher needs, threaded through
/// every handler call.
pub struct Session<'a, E: EventSource> {
    dbg: &'a mut E,
    symbols: &'a dyn SymbolProvider,
    cpu: &'static dyn Cpu,
    recv: RecvBuffer,
    registry: Registry,
    xpoints: XpointSet,
    state: RunState,
    last_signal: Signal,
    exec_thread: Option<Tid>,
    other_thread: Option<Tid>,
    /// Threads with the single-step flag armed.
    step_tids: Vec<Tid>,
    /// Threads we suspended to satisfy the last vCont.
    vcont_suspended: Vec<Tid>,
}

impl<'a, E: EventSource> Session<'a, E> {
    pub fn new(dbg: &'a mut E, symbols: &'a dyn SymbolProvider) -> Session<'a, E> {
        let cpu = dbg.cpu();
        Session {
            dbg,
            symbols,
            cpu,
            recv: RecvBuffer::new(),
            registry: Registry::new(),
            xpoints: XpointSet::new(),
            state: RunState::Running,
            last_signal: Signal::SIGTRAP,
            exec_thread: None,
            other_thread: None,
            step_tids: Vec::new(),
            vcont_suspended: Vec::new(),
        }
    }

    /// Pump debug events until the debuggee reaches its first reportable
    /// stop (the initial breakpoint). Call before accepting a client, so
    /// `?` has a trap to describe.
    pub fn wait_initial_stop(&mut self) -> Result<(), DebuggeeError> {
        loop {
            if matches!(self.state, RunState::Trapped { .. } | RunState::Terminated { .. }) {
                return Ok(());
            }
            if let Some(event) = self.dbg.wait_event(EVENT_POLL)? {
                match self.translate_event(event)? {
                    translate::Disposition::Absorb(status) => self.dbg.resume(status)?,
                    translate::Disposition::Report { tid, signal } => {
                        self.enter_trap(tid, signal)?;
                    }
                    translate::Disposition::Exited(code) => {
                        self.state = RunState::Terminated { code };
                    }
                }
            }
        }
    }

    /// Run the session until the client or the debuggee goes away.
    pub fn run<C: ConnectionExt>(
        &mut self,
        conn: &mut C,
    ) -> Result<DisconnectReason, ProxyError<C::Error>> {
        conn.on_session_start().map_err(ProxyError::Connection)?;
        info!("session started ({})", self.cpu.name());

        loop {
            let reason = match self.state {
                RunState::Running => self.pump_running(conn)?,
                RunState::Trapped { .. } | RunState::Terminated { .. } => {
                    self.pump_trapped(conn)?
                }
            };

            if let Some(reason) = reason {
                info!("session over: {:?}", reason);
                return Ok(reason);
            }
        }
    }

    /// Blocking half: the debuggee is stopped, so the only thing that
    /// can happen is client input.
    fn pump_trapped<C: ConnectionExt>(
        &mut self,
        conn: &mut C,
    ) -> Result<Option<DisconnectReason>, ProxyError<C::Error>> {
        if let Some(item) = self.recv.scan() {
            return self.handle_inbound(conn, item);
        }

        let mut buf = [0u8; 4096];
        let n = conn
            .read_available(&mut buf)
            .map_err(ProxyError::Connection)?;
        if n == 0 {
            return Err(ProxyError::ClientHangup);
        }
        self.recv.push(&buf[..n]);

        match self.recv.scan() {
            Some(item) => self.handle_inbound(conn, item),
            None => Ok(None),
        }
    }

    /// Polling half: the debuggee runs free; watch for debug events and
    /// service nothing from the client but the interrupt byte.
    fn pump_running<C: ConnectionExt>(
        &mut self,
        conn: &mut C,
    ) -> Result<Option<DisconnectReason>, ProxyError<C::Error>> {
        if conn.data_ready().map_err(ProxyError::Connection)? {
            let mut buf = [0u8; 4096];
            let n = conn
                .read_available(&mut buf)
                .map_err(ProxyError::Connection)?;
            if n == 0 {
                return Err(ProxyError::ClientHangup);
            }
            self.recv.push(&buf[..n]);

            while let Some(item) = self.recv.scan() {
                match item {
                    Inbound::Interrupt => {
                        debug!("interrupt byte: forcing a suspend");
                        self.dbg.break_in().map_err(ProxyError::Debuggee)?;
                    }
                    Inbound::Frame { .. } => {
                        warn!("dropping packet received while the debuggee is running");
                    }
                }
            }
        }

        let event = self
            .dbg
            .wait_event(EVENT_POLL)
            .map_err(ProxyError::Debuggee)?;

        match event {
            None => Ok(None),
            Some(event) => self.process_event(conn, event),
        }
    }

    fn process_event<C: ConnectionExt>(
        &mut self,
        conn: &mut C,
        event: crate::debuggee::DebugEvent,
    ) -> Result<Option<DisconnectReason>, ProxyError<C::Error>> {
        match self.translate_event(event).map_err(ProxyError::Debuggee)? {
            translate::Disposition::Absorb(status) => {
                self.dbg.resume(status).map_err(ProxyError::Debuggee)?;
                Ok(None)
            }
            translate::Disposition::Report { tid, signal } => {
                self.enter_trap(tid, signal).map_err(ProxyError::Debuggee)?;
                let mut res = ResponseWriter::new(conn);
                self.write_status(&mut res)
                    .map_err(|e| ProxyError::Connection(e.0))?;
                res.flush().map_err(|e| ProxyError::Connection(e.0))?;
                Ok(None)
            }
            translate::Disposition::Exited(code) => {
                self.state = RunState::Terminated { code };
                // one final status reply, then teardown
                let mut res = ResponseWriter::new(conn);
                let r: Result<(), ResponseWriterError<C::Error>> = (|| {
                    res.write_str("W")?;
                    res.write_num(code)?;
                    res.flush()
                })();
                r.map_err(|e| ProxyError::Connection(e.0))?;
                Ok(Some(DisconnectReason::TargetExited(code)))
            }
        }
    }

    /// Bookkeeping on entry to the trapped state: clear pending step
    /// flags, lift vCont suspensions, point both selectors at the
    /// stopping thread.
    fn enter_trap(&mut self, tid: Tid, signal: Signal) -> Result<(), DebuggeeError> {
        for step_tid in core::mem::take(&mut self.step_tids) {
            let mut ctx = vec![0u8; self.cpu.context_size()];
            self.dbg.get_context(step_tid, &mut ctx)?;
            if self.cpu.single_step(&mut ctx, false).is_ok() {
                self.dbg.set_context(step_tid, &ctx)?;
            }
        }

        for suspended in core::mem::take(&mut self.vcont_suspended) {
            self.dbg.resume_thread(suspended)?;
        }

        self.state = RunState::Trapped { tid };
        self.last_signal = signal;
        self.exec_thread = Some(tid);
        self.other_thread = Some(tid);
        debug!("trapped: thread {} signal {}", tid, signal);
        Ok(())
    }

    fn handle_inbound<C: ConnectionExt>(
        &mut self,
        conn: &mut C,
        item: Inbound,
    ) -> Result<Option<DisconnectReason>, ProxyError<C::Error>> {
        let (body, checksum_ok) = match item {
            Inbound::Interrupt => {
                trace!("interrupt byte while trapped; nothing to suspend");
                return Ok(None);
            }
            Inbound::Frame { body, checksum_ok } => (body, checksum_ok),
        };

        // the frame ack goes out before the checksum is verified; a bad
        // checksum then drops the packet with no reply of any kind
        conn.write(b'+').map_err(ProxyError::Connection)?;
        if !checksum_ok {
            return Ok(None);
        }

        let cmd = match Command::from_body(&body) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("unparseable packet ({:?}); answering unsupported", e);
                let res = ResponseWriter::new(conn);
                res.flush().map_err(|e| ProxyError::Connection(e.0))?;
                return Ok(None);
            }
        };

        let mut res = ResponseWriter::new(conn);
        let outcome = self.handle_command(&mut res, cmd);

        match outcome {
            Ok(HandlerStatus::Handled) => {
                res.flush().map_err(|e| ProxyError::Connection(e.0))?;
                Ok(None)
            }
            Ok(HandlerStatus::NeedsOk) => {
                let r: Result<(), ResponseWriterError<C::Error>> = (|| {
                    res.write_str("OK")?;
                    res.flush()
                })();
                r.map_err(|e| ProxyError::Connection(e.0))?;
                Ok(None)
            }
            Ok(HandlerStatus::Resumed) => {
                // reply comes from the next stop; nothing was written
                Ok(None)
            }
            Ok(HandlerStatus::Disconnect(reason)) => {
                res.flush().map_err(|e| ProxyError::Connection(e.0))?;
                Ok(Some(reason))
            }
            Err(Error::NonFatal(code)) => {
                let r: Result<(), ResponseWriterError<C::Error>> = (|| {
                    res.write_str("E")?;
                    res.write_hex(code)?;
                    res.flush()
                })();
                r.map_err(|e| ProxyError::Connection(e.0))?;
                Ok(None)
            }
            Err(Error::Response(e)) => Err(ProxyError::Connection(e.0)),
            Err(Error::Fatal(e)) => Err(ProxyError::Debuggee(e)),
        }
    }

    /// The thread register/memory commands operate on: the `Hg`
    /// selection, falling back to the trapped thread.
    fn inspect_tid<C>(&self) -> Result<Tid, Error<C>> {
        match self.state {
            RunState::Trapped { tid } => Ok(self.other_thread.unwrap_or(tid)),
            _ => Err(Error::NonFatal(errno::EPERM)),
        }
    }

    /// The thread `c`/`s` resume semantics center on.
    fn exec_tid<C>(&self) -> Result<Tid, Error<C>> {
        match self.state {
            RunState::Trapped { tid } => Ok(self.exec_thread.unwrap_or(tid)),
            _ => Err(Error::NonFatal(errno::EPERM)),
        }
    }

    /// Context and memory may only be touched while trapped.
    fn require_trap<C>(&self) -> Result<Tid, Error<C>> {
        match self.state {
            RunState::Trapped { tid } => Ok(tid),
            _ => Err(Error::NonFatal(errno::EPERM)),
        }
    }

    fn fetch_context<C>(&mut self, tid: Tid) -> Result<Vec<u8>, Error<C>> {
        let mut ctx = vec![0u8; self.cpu.context_size()];
        self.dbg.get_context(tid, &mut ctx).op_err()?;
        Ok(ctx)
    }
}
