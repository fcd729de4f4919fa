//! Linux ptrace adapter: an [`EventSource`] over a local x86-64
//! process, for using the proxy against ordinary native debuggees.
//!
//! The adapter presents ptrace stops in the native event model the
//! translator expects: one synthetic process-created event, thread
//! create/exit notifications, and signal stops mapped onto exception
//! codes. While an exception is being reported every thread is held
//! stopped, so context and memory access during the trap is always
//! legal.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::kill as send_signal;
use nix::sys::signal::Signal as NixSignal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid as NixPid;

use crate::arch::find_reg;
use crate::arch::x86_64;
use crate::arch::Cpu;
use crate::common::Tid;
use crate::debuggee::excpt;
use crate::debuggee::DebugEvent;
use crate::debuggee::DebuggeeError;
use crate::debuggee::EventKind;
use crate::debuggee::EventSource;
use crate::debuggee::ProcessListing;
use crate::debuggee::ResumeStatus;

const WAIT_SLICE: Duration = Duration::from_millis(5);

// si_code values for SIGFPE. These are not exposed by the `libc` crate on
// Linux targets, so they are provided here with their stable kernel ABI
// values from <asm-generic/siginfo.h> (identical across all Linux arches).
const FPE_INTOVF: libc::c_int = 2;
const FPE_FLTDIV: libc::c_int = 3;

fn be(e: Errno) -> DebuggeeError {
    DebuggeeError::Backend(e.to_string())
}

#[derive(Debug, Default)]
struct Thread {
    stopped: bool,
    suspended: bool,
    /// Signal to re-deliver when the thread next continues.
    pending: Option<NixSignal>,
}

pub struct PtraceDebuggee {
    pid: NixPid,
    threads: HashMap<i32, Thread>,
    /// Pre-buffered events (process/thread creation, the initial stop).
    /// While any are queued the world stays stopped and `resume` is a
    /// no-op.
    queue: VecDeque<DebugEvent>,
    /// The thread whose exception is currently reported, with the
    /// original signal for pass-exception resumption.
    current_stop: Option<(i32, Option<NixSignal>)>,
    /// A `break_in` is outstanding; the next SIGSTOP is the answer.
    interrupt_pending: bool,
    spawned: bool,
}

impl PtraceDebuggee {
    /// Spawn `argv` stopped at its entry point.
    pub fn spawn(argv: &[String]) -> Result<PtraceDebuggee, DebuggeeError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DebuggeeError::Backend("empty command line".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(|| {
                ptrace::traceme().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| DebuggeeError::Backend(format!("spawn {}: {}", program, e)))?;
        let pid = NixPid::from_raw(child.id() as i32);

        let mut dbg = PtraceDebuggee::init(pid, true)?;
        dbg.expect_initial_stop()?;
        Ok(dbg)
    }

    /// Attach to a running process (and all of its threads).
    pub fn attach(pid: u32) -> Result<PtraceDebuggee, DebuggeeError> {
        let pid = NixPid::from_raw(pid as i32);
        ptrace::attach(pid).map_err(be)?;

        let mut dbg = PtraceDebuggee::init(pid, false)?;
        dbg.expect_initial_stop()?;
        dbg.attach_existing_threads()?;
        Ok(dbg)
    }

    fn init(pid: NixPid, spawned: bool) -> Result<PtraceDebuggee, DebuggeeError> {
        Ok(PtraceDebuggee {
            pid,
            threads: HashMap::new(),
            queue: VecDeque::new(),
            current_stop: None,
            interrupt_pending: false,
            spawned,
        })
    }

    /// Reap the attach/exec stop of the main thread and pre-buffer the
    /// creation events plus the initial trap.
    fn expect_initial_stop(&mut self) -> Result<(), DebuggeeError> {
        match waitpid(self.pid, None).map_err(be)? {
            WaitStatus::Stopped(_, _) => {}
            other => {
                return Err(DebuggeeError::Backend(format!(
                    "unexpected initial wait status {:?}",
                    other
                )))
            }
        }

        let mut options = ptrace::Options::PTRACE_O_TRACECLONE;
        if self.spawned {
            options |= ptrace::Options::PTRACE_O_EXITKILL;
        }
        ptrace::setoptions(self.pid, options).map_err(be)?;

        self.threads.insert(
            self.pid.as_raw(),
            Thread {
                stopped: true,
                ..Thread::default()
            },
        );

        let tid = self.pid.as_raw() as Tid;
        self.queue.push_back(DebugEvent {
            tid,
            kind: EventKind::ProcessCreated {
                pid: self.pid.as_raw() as u32,
                image_base: image_base(self.pid).unwrap_or(0),
                load_bias: 0,
            },
        });
        // not a patched trap, so no PC bias must be applied: report the
        // initial stop as a single-step exception
        self.queue.push_back(DebugEvent {
            tid,
            kind: EventKind::Exception {
                code: excpt::SINGLE_STEP,
                address: 0,
                first_chance: true,
            },
        });
        self.current_stop = Some((self.pid.as_raw(), None));
        Ok(())
    }

    fn attach_existing_threads(&mut self) -> Result<(), DebuggeeError> {
        let tasks = std::fs::read_dir(format!("/proc/{}/task", self.pid))
            .map_err(|e| DebuggeeError::Backend(e.to_string()))?;

        // creation events slot in after process-created but before the
        // initial trap already sitting at the back of the queue
        let mut insert_at = self.queue.len().saturating_sub(1);
        for entry in tasks.flatten() {
            let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if tid == self.pid.as_raw() || self.threads.contains_key(&tid) {
                continue;
            }

            let tid_pid = NixPid::from_raw(tid);
            if ptrace::attach(tid_pid).is_err() {
                continue; // raced with thread exit
            }
            let _ = waitpid(tid_pid, None);
            self.threads.insert(
                tid,
                Thread {
                    stopped: true,
                    ..Thread::default()
                },
            );
            self.queue.insert(
                insert_at,
                DebugEvent {
                    tid: tid as Tid,
                    kind: EventKind::ThreadCreated,
                },
            );
            insert_at += 1;
        }
        Ok(())
    }

    /// Freeze every other thread so the trap invariant holds while the
    /// session inspects the debuggee.
    fn stop_the_world(&mut self, reporting: i32) {
        let tids: Vec<i32> = self.threads.keys().copied().collect();
        for tid in tids {
            match self.threads.get(&tid) {
                Some(thread) if tid != reporting && !thread.stopped => {}
                _ => continue,
            }

            let tid_pid = NixPid::from_raw(tid);
            if send_signal(tid_pid, NixSignal::SIGSTOP).is_err() {
                self.forget_thread(tid);
                continue;
            }

            loop {
                match waitpid(tid_pid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, NixSignal::SIGSTOP)) => {
                        self.threads.get_mut(&tid).map(|t| t.stopped = true);
                        break;
                    }
                    Ok(WaitStatus::Stopped(_, other)) => {
                        // keep the stop, remember the signal for later
                        if let Some(t) = self.threads.get_mut(&tid) {
                            t.stopped = true;
                            t.pending = Some(other);
                        }
                        break;
                    }
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => {
                        self.forget_thread(tid);
                        break;
                    }
                    Ok(_) => continue,
                }
            }
        }
    }

    fn forget_thread(&mut self, tid: i32) {
        if self.threads.remove(&tid).is_some() {
            self.queue.push_back(DebugEvent {
                tid: tid as Tid,
                kind: EventKind::ThreadExited { code: 0 },
            });
        }
    }

    /// Map one ptrace wait status onto a native event, or `None` when
    /// it was absorbed (auto-continued) at this layer.
    fn map_status(&mut self, status: WaitStatus) -> Result<Option<DebugEvent>, DebuggeeError> {
        match status {
            WaitStatus::StillAlive => Ok(None),

            WaitStatus::Exited(pid, code) if pid == self.pid => Ok(Some(DebugEvent {
                tid: pid.as_raw() as Tid,
                kind: EventKind::ProcessExited { code: code as u32 },
            })),
            WaitStatus::Signaled(pid, sig, _) if pid == self.pid => Ok(Some(DebugEvent {
                tid: pid.as_raw() as Tid,
                kind: EventKind::ProcessExited {
                    code: 128 + sig as u32,
                },
            })),
            WaitStatus::Exited(pid, code) => {
                self.threads.remove(&pid.as_raw());
                Ok(Some(DebugEvent {
                    tid: pid.as_raw() as Tid,
                    kind: EventKind::ThreadExited { code: code as u32 },
                }))
            }
            WaitStatus::Signaled(pid, _, _) => {
                self.threads.remove(&pid.as_raw());
                Ok(Some(DebugEvent {
                    tid: pid.as_raw() as Tid,
                    kind: EventKind::ThreadExited { code: 0 },
                }))
            }

            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_CLONE => {
                let new_tid = ptrace::getevent(pid).map_err(be)? as i32;
                debug!("thread {} cloned {}", pid, new_tid);
                // the new thread reports its own attach stop; mark it
                // running until that arrives
                self.threads.entry(new_tid).or_default();
                self.threads.get_mut(&pid.as_raw()).map(|t| t.stopped = true);
                self.current_stop = Some((pid.as_raw(), None));
                Ok(Some(DebugEvent {
                    tid: new_tid as Tid,
                    kind: EventKind::ThreadCreated,
                }))
            }
            WaitStatus::PtraceEvent(pid, _, _) => {
                let _ = ptrace::cont(pid, None);
                Ok(None)
            }

            WaitStatus::Stopped(pid, sig) => self.map_signal_stop(pid, sig),

            WaitStatus::Continued(_) | WaitStatus::PtraceSyscall(_) => Ok(None),
        }
    }

    fn map_signal_stop(
        &mut self,
        pid: NixPid,
        sig: NixSignal,
    ) -> Result<Option<DebugEvent>, DebuggeeError> {
        let tid = pid.as_raw();
        let thread = self.threads.entry(tid).or_default();
        thread.stopped = true;

        let code = match sig {
            NixSignal::SIGTRAP => {
                // distinguish a patched trap from a hardware step so
                // the PC bias is only applied where an int3 ran
                match ptrace::getsiginfo(pid) {
                    Ok(info) if info.si_code == libc::TRAP_TRACE => excpt::SINGLE_STEP,
                    Ok(info) if info.si_code == libc::TRAP_HWBKPT => excpt::SINGLE_STEP,
                    _ => excpt::BREAKPOINT,
                }
            }
            NixSignal::SIGSTOP => {
                if self.interrupt_pending {
                    self.interrupt_pending = false;
                    excpt::DBG_CONTROL_C
                } else {
                    // stray stop (group-stop leftovers): swallow it
                    let _ = ptrace::cont(pid, None);
                    self.threads.get_mut(&tid).map(|t| t.stopped = false);
                    return Ok(None);
                }
            }
            NixSignal::SIGINT => excpt::DBG_CONTROL_C,
            NixSignal::SIGSEGV => excpt::ACCESS_VIOLATION,
            NixSignal::SIGILL => excpt::ILLEGAL_INSTRUCTION,
            NixSignal::SIGBUS => excpt::DATATYPE_MISALIGNMENT,
            NixSignal::SIGFPE => match ptrace::getsiginfo(pid) {
                Ok(info) if info.si_code == FPE_FLTDIV => excpt::FLT_DIVIDE_BY_ZERO,
                Ok(info) if info.si_code == FPE_INTOVF => excpt::INT_OVERFLOW,
                _ => excpt::INT_DIVIDE_BY_ZERO,
            },
            other => {
                // debugger-transparent: re-deliver and keep going
                let _ = ptrace::cont(pid, Some(other));
                self.threads.get_mut(&tid).map(|t| t.stopped = false);
                return Ok(None);
            }
        };

        let address = ptrace::getsiginfo(pid)
            .ok()
            .map(|info| unsafe { info.si_addr() } as u64)
            .unwrap_or(0);

        let deliver = match sig {
            NixSignal::SIGTRAP | NixSignal::SIGSTOP => None,
            other => Some(other),
        };

        self.stop_the_world(tid);
        self.current_stop = Some((tid, deliver));

        Ok(Some(DebugEvent {
            tid: tid as Tid,
            kind: EventKind::Exception {
                code,
                address,
                first_chance: true,
            },
        }))
    }
}

impl EventSource for PtraceDebuggee {
    fn cpu(&self) -> &'static dyn Cpu {
        &x86_64::X86_64
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, DebuggeeError> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;
        loop {
            // poll only the threads this adapter traces; a blanket
            // waitpid(-1) would also reap unrelated children, such as
            // an auto-launched debugger
            let tids: Vec<i32> = self.threads.keys().copied().collect();
            if tids.is_empty() {
                return Err(DebuggeeError::Gone);
            }

            let mut progressed = false;
            for tid in tids {
                let status = waitpid(
                    NixPid::from_raw(tid),
                    Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
                );
                match status {
                    Ok(WaitStatus::StillAlive) => {}
                    Ok(status) => {
                        progressed = true;
                        if let Some(event) = self.map_status(status)? {
                            return Ok(Some(event));
                        }
                    }
                    Err(Errno::ECHILD) => {
                        // not our child anymore; drop it from the set
                        self.forget_thread(tid);
                        progressed = true;
                    }
                    Err(e) => return Err(be(e)),
                }
            }

            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if progressed {
                continue;
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WAIT_SLICE);
        }
    }

    fn resume(&mut self, status: ResumeStatus) -> Result<(), DebuggeeError> {
        // the pre-buffered creation events describe an already-stopped
        // world; nothing actually runs until they are drained
        if !self.queue.is_empty() {
            return Ok(());
        }

        let pass = self
            .current_stop
            .take()
            .and_then(|(tid, sig)| match status {
                ResumeStatus::PassException => sig.map(|s| (tid, s)),
                ResumeStatus::Handled => None,
            });

        for (&tid, thread) in self.threads.iter_mut() {
            if !thread.stopped || thread.suspended {
                continue;
            }

            let mut sig = thread.pending.take();
            if let Some((pass_tid, pass_sig)) = pass {
                if pass_tid == tid {
                    sig = Some(pass_sig);
                }
            }

            match ptrace::cont(NixPid::from_raw(tid), sig) {
                Ok(()) => thread.stopped = false,
                Err(Errno::ESRCH) => warn!("thread {} vanished before resume", tid),
                Err(e) => return Err(be(e)),
            }
        }
        Ok(())
    }

    fn suspend_thread(&mut self, tid: Tid) -> Result<(), DebuggeeError> {
        self.threads
            .get_mut(&(tid as i32))
            .ok_or(DebuggeeError::NoThread(tid))?
            .suspended = true;
        Ok(())
    }

    fn resume_thread(&mut self, tid: Tid) -> Result<(), DebuggeeError> {
        self.threads
            .get_mut(&(tid as i32))
            .ok_or(DebuggeeError::NoThread(tid))?
            .suspended = false;
        Ok(())
    }

    fn break_in(&mut self) -> Result<(), DebuggeeError> {
        self.interrupt_pending = true;
        send_signal(self.pid, NixSignal::SIGSTOP).map_err(be)
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, DebuggeeError> {
        let word = core::mem::size_of::<libc::c_long>();
        let mut done = 0;

        while done < buf.len() {
            let at = (addr + done as u64) as ptrace::AddressType;
            match ptrace::read(self.pid, at) {
                Ok(data) => {
                    let bytes = data.to_ne_bytes();
                    let n = (buf.len() - done).min(word);
                    buf[done..done + n].copy_from_slice(&bytes[..n]);
                    done += n;
                }
                Err(_) if done > 0 => return Ok(done),
                Err(_) => return Err(DebuggeeError::MemoryFault { addr }),
            }
        }
        Ok(done)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), DebuggeeError> {
        let word = core::mem::size_of::<libc::c_long>();
        let mut done = 0;

        while done < data.len() {
            let at = (addr + done as u64) as ptrace::AddressType;
            let remaining = data.len() - done;

            let value = if remaining >= word {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[done..done + word]);
                libc::c_long::from_ne_bytes(bytes)
            } else {
                // partial trailing word: read-modify-write
                let current = ptrace::read(self.pid, at).map_err(|_| {
                    DebuggeeError::MemoryFault {
                        addr: addr + done as u64,
                    }
                })?;
                let mut bytes = current.to_ne_bytes();
                bytes[..remaining].copy_from_slice(&data[done..]);
                libc::c_long::from_ne_bytes(bytes)
            };

            unsafe { ptrace::write(self.pid, at, value as *mut libc::c_void) }.map_err(|_| {
                DebuggeeError::MemoryFault {
                    addr: addr + done as u64,
                }
            })?;
            done += word.min(remaining);
        }
        Ok(())
    }

    fn get_context(&mut self, tid: Tid, ctx: &mut [u8]) -> Result<(), DebuggeeError> {
        let pid = NixPid::from_raw(tid as i32);
        let regs = ptrace::getregs(pid).map_err(|e| match e {
            Errno::ESRCH => DebuggeeError::NoThread(tid),
            e => be(e),
        })?;

        let map = self.cpu().regs();
        let mut set = |name: &str, val: u64| {
            if let Some(entry) = find_reg(map, name) {
                entry.set_u64(ctx, val);
            }
        };

        set("rax", regs.rax);
        set("rbx", regs.rbx);
        set("rcx", regs.rcx);
        set("rdx", regs.rdx);
        set("rsi", regs.rsi);
        set("rdi", regs.rdi);
        set("rbp", regs.rbp);
        set("rsp", regs.rsp);
        set("r8", regs.r8);
        set("r9", regs.r9);
        set("r10", regs.r10);
        set("r11", regs.r11);
        set("r12", regs.r12);
        set("r13", regs.r13);
        set("r14", regs.r14);
        set("r15", regs.r15);
        set("rip", regs.rip);
        set("eflags", regs.eflags);
        set("cs", regs.cs);
        set("ss", regs.ss);
        set("ds", regs.ds);
        set("es", regs.es);
        set("fs", regs.fs);
        set("gs", regs.gs);

        for (i, &user_idx) in [0usize, 1, 2, 3, 6, 7].iter().enumerate() {
            let offset = debugreg_offset(user_idx);
            if let Ok(val) = ptrace::read_user(pid, offset as ptrace::AddressType) {
                crate::arch::ctx_set(ctx, x86_64::DR_OFFSETS[i], 8, val as u64);
            }
        }
        Ok(())
    }

    fn set_context(&mut self, tid: Tid, ctx: &[u8]) -> Result<(), DebuggeeError> {
        let pid = NixPid::from_raw(tid as i32);
        let mut regs = ptrace::getregs(pid).map_err(|e| match e {
            Errno::ESRCH => DebuggeeError::NoThread(tid),
            e => be(e),
        })?;

        let map = self.cpu().regs();
        let get = |name: &str| find_reg(map, name).map(|e| e.get_u64(ctx)).unwrap_or(0);

        regs.rax = get("rax");
        regs.rbx = get("rbx");
        regs.rcx = get("rcx");
        regs.rdx = get("rdx");
        regs.rsi = get("rsi");
        regs.rdi = get("rdi");
        regs.rbp = get("rbp");
        regs.rsp = get("rsp");
        regs.r8 = get("r8");
        regs.r9 = get("r9");
        regs.r10 = get("r10");
        regs.r11 = get("r11");
        regs.r12 = get("r12");
        regs.r13 = get("r13");
        regs.r14 = get("r14");
        regs.r15 = get("r15");
        regs.rip = get("rip");
        regs.eflags = get("eflags");
        regs.cs = get("cs");
        regs.ss = get("ss");
        regs.ds = get("ds");
        regs.es = get("es");
        regs.fs = get("fs");
        regs.gs = get("gs");

        ptrace::setregs(pid, regs).map_err(be)?;

        for (i, &user_idx) in [0usize, 1, 2, 3, 6, 7].iter().enumerate() {
            let val = crate::arch::ctx_get(ctx, x86_64::DR_OFFSETS[i], 8);
            let offset = debugreg_offset(user_idx);
            let current = ptrace::read_user(pid, offset as ptrace::AddressType).unwrap_or(0);
            if current as u64 == val {
                continue;
            }
            unsafe {
                ptrace::write_user(pid, offset as ptrace::AddressType, val as *mut libc::c_void)
            }
            .map_err(be)?;
        }
        Ok(())
    }

    fn processes(&mut self) -> Result<Vec<ProcessListing>, DebuggeeError> {
        let mut out = Vec::new();
        let entries =
            std::fs::read_dir("/proc").map_err(|e| DebuggeeError::Backend(e.to_string()))?;

        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let Ok(name) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) else {
                continue;
            };
            let threads = std::fs::read_dir(format!("/proc/{}/task", pid))
                .map(|tasks| tasks.count())
                .unwrap_or(1);
            out.push(ProcessListing {
                pid,
                threads,
                name: name.trim_end().to_owned(),
            });
        }
        Ok(out)
    }

    fn kill(&mut self) -> Result<(), DebuggeeError> {
        send_signal(self.pid, NixSignal::SIGKILL).map_err(be)?;
        let _ = waitpid(self.pid, None);
        Ok(())
    }

    fn detach(&mut self) -> Result<(), DebuggeeError> {
        for &tid in self.threads.keys() {
            let _ = ptrace::detach(NixPid::from_raw(tid), None);
        }
        self.threads.clear();
        Ok(())
    }
}

/// Byte offset of `u_debugreg[idx]` in the ptrace `user` area.
fn debugreg_offset(idx: usize) -> usize {
    core::mem::offset_of!(libc::user, u_debugreg) + idx * core::mem::size_of::<libc::c_ulong>()
}

/// Base address of the first executable mapping, from /proc.
fn image_base(pid: NixPid) -> Option<u64> {
    let maps = std::fs::read_to_string(format!("/proc/{}/maps", pid)).ok()?;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        if perms.contains('x') {
            let (start, _) = range.split_once('-')?;
            return u64::from_str_radix(start, 16).ok();
        }
    }
    None
}
