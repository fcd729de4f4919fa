//! The debuggee side of the bridge: the native debug-event model, the
//! collaborator traits a concrete execution environment implements, and
//! the process/thread bookkeeping fed by those events.

use std::time::Duration;

use thiserror::Error;

use crate::arch::Cpu;
use crate::common::Pid;
use crate::common::Tid;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        mod ptrace;
        pub use ptrace::PtraceDebuggee;
    }
}

/// Native exception codes, as reported by the execution environment.
#[rustfmt::skip]
pub mod excpt {
    pub const GUARD_PAGE:             u32 = 0x8000_0001;
    pub const DATATYPE_MISALIGNMENT:  u32 = 0x8000_0002;
    pub const BREAKPOINT:             u32 = 0x8000_0003;
    pub const SINGLE_STEP:            u32 = 0x8000_0004;
    pub const ACCESS_VIOLATION:       u32 = 0xc000_0005;
    pub const INVALID_HANDLE:         u32 = 0xc000_0008;
    pub const ILLEGAL_INSTRUCTION:    u32 = 0xc000_001d;
    pub const FLT_DENORMAL_OPERAND:   u32 = 0xc000_008d;
    pub const FLT_DIVIDE_BY_ZERO:     u32 = 0xc000_008e;
    pub const FLT_INEXACT_RESULT:     u32 = 0xc000_008f;
    pub const FLT_INVALID_OPERATION:  u32 = 0xc000_0090;
    pub const FLT_OVERFLOW:           u32 = 0xc000_0091;
    pub const FLT_STACK_CHECK:        u32 = 0xc000_0092;
    pub const FLT_UNDERFLOW:          u32 = 0xc000_0093;
    pub const INT_DIVIDE_BY_ZERO:     u32 = 0xc000_0094;
    pub const INT_OVERFLOW:           u32 = 0xc000_0095;
    pub const PRIV_INSTRUCTION:       u32 = 0xc000_0096;
    pub const STACK_OVERFLOW:         u32 = 0xc000_00fd;
    pub const CONTROL_C_EXIT:         u32 = 0xc000_013a;
    pub const POSSIBLE_DEADLOCK:      u32 = 0xc000_0194;
    pub const DBG_CONTROL_C:          u32 = 0x4001_0005;
    pub const DBG_CONTROL_BREAK:      u32 = 0x4001_0008;
    /// Thread-rename notification raised by debuggee-side runtimes.
    pub const THREAD_NAME:            u32 = 0x406d_1388;
}

/// One native debug event. `tid` is the thread the event concerns: the
/// faulting thread for exceptions, the new thread for creation events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub tid: Tid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    ProcessCreated {
        pid: Pid,
        image_base: u64,
        load_bias: u64,
    },
    ProcessExited {
        code: u32,
    },
    ThreadCreated,
    ThreadExited {
        code: u32,
    },
    ModuleLoaded {
        base: u64,
        name: String,
    },
    ModuleUnloaded {
        base: u64,
    },
    /// Debug output string; absorbed, never forwarded to the client.
    DebugString(String),
    Exception {
        code: u32,
        address: u64,
        first_chance: bool,
    },
}

/// How to resume from the event currently being reported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResumeStatus {
    /// The event is dealt with; the debuggee continues cleanly.
    Handled,
    /// Re-deliver the exception to the debuggee's own handlers.
    PassException,
}

#[derive(Debug, Error)]
pub enum DebuggeeError {
    #[error("memory access fault at {addr:#x}")]
    MemoryFault { addr: u64 },
    #[error("no such thread {0}")]
    NoThread(Tid),
    #[error("debuggee exited")]
    Gone,
    #[error("debuggee backend: {0}")]
    Backend(String),
}

/// One row of a `monitor proc` listing.
#[derive(Debug, Clone)]
pub struct ProcessListing {
    pub pid: Pid,
    pub threads: usize,
    pub name: String,
}

/// One row of a `monitor mod` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleListing {
    pub base: u64,
    pub name: String,
}

/// Control interface over a live debuggee.
///
/// The proxy drives the debuggee exclusively through this trait; how a
/// handle is obtained in the first place (spawn, attach, environment
/// enumeration) is the implementor's business. Context snapshots are
/// raw byte blobs laid out per the register map of [`cpu()`](Self::cpu).
///
/// Contract: context and memory mutation is only legal between a
/// reported event and the following [`resume`](Self::resume).
pub trait EventSource {
    /// The architecture backend matching this debuggee.
    fn cpu(&self) -> &'static dyn Cpu;

    /// Block up to `timeout` for the next debug event.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, DebuggeeError>;

    /// Resume from the event last reported by [`wait_event`](Self::wait_event).
    fn resume(&mut self, status: ResumeStatus) -> Result<(), DebuggeeError>;

    /// Keep `tid` off the scheduler across the next `resume`.
    fn suspend_thread(&mut self, tid: Tid) -> Result<(), DebuggeeError>;

    /// Undo [`suspend_thread`](Self::suspend_thread).
    fn resume_thread(&mut self, tid: Tid) -> Result<(), DebuggeeError>;

    /// Force a suspension instead of waiting for a natural event. The
    /// stop surfaces as a console-break exception from `wait_event`.
    fn break_in(&mut self) -> Result<(), DebuggeeError>;

    /// Read debuggee memory. Short reads are allowed; the returned
    /// count is how many leading bytes are valid.
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, DebuggeeError>;

    /// Write debuggee memory, completely or not at all.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), DebuggeeError>;

    fn get_context(&mut self, tid: Tid, ctx: &mut [u8]) -> Result<(), DebuggeeError>;

    fn set_context(&mut self, tid: Tid, ctx: &[u8]) -> Result<(), DebuggeeError>;

    /// Enumerate debuggable processes in the environment.
    fn processes(&mut self) -> Result<Vec<ProcessListing>, DebuggeeError>;

    fn kill(&mut self) -> Result<(), DebuggeeError>;

    fn detach(&mut self) -> Result<(), DebuggeeError>;
}

/// Formats human-readable listings for the monitor commands. Everything
/// else in the proxy is symbol-free.
pub trait SymbolProvider {
    fn modules(&self, _pid: Pid) -> Vec<ModuleListing> {
        Vec::new()
    }
}

/// The empty provider, for environments without symbol machinery.
pub struct NoSymbols;

impl SymbolProvider for NoSymbols {}

/// Live process/thread bookkeeping, fed by the event translator.
#[derive(Debug, Default)]
pub struct Registry {
    pid: Pid,
    image_base: u64,
    load_bias: u64,
    threads: Vec<Tid>,
    modules: Vec<ModuleListing>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn set_process(&mut self, pid: Pid, image_base: u64, load_bias: u64) {
        self.pid = pid;
        self.image_base = image_base;
        self.load_bias = load_bias;
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn add_thread(&mut self, tid: Tid) {
        if !self.threads.contains(&tid) {
            self.threads.push(tid);
        }
    }

    pub fn remove_thread(&mut self, tid: Tid) {
        self.threads.retain(|&t| t != tid);
    }

    pub fn threads(&self) -> &[Tid] {
        &self.threads
    }

    pub fn is_alive(&self, tid: Tid) -> bool {
        self.threads.contains(&tid)
    }

    /// Any live thread, used when the client asks for "thread 0".
    pub fn any_thread(&self) -> Option<Tid> {
        self.threads.first().copied()
    }

    pub fn add_module(&mut self, base: u64, name: String) {
        self.modules.push(ModuleListing { base, name });
    }

    pub fn remove_module(&mut self, base: u64) {
        self.modules.retain(|m| m.base != base);
    }

    pub fn modules(&self) -> &[ModuleListing] {
        &self.modules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_threads_in_creation_order() {
        let mut reg = Registry::new();
        reg.add_thread(12);
        reg.add_thread(7);
        reg.add_thread(12); // duplicate create events are harmless
        assert_eq!(reg.threads(), [12, 7]);
        assert_eq!(reg.any_thread(), Some(12));

        reg.remove_thread(12);
        assert!(!reg.is_alive(12));
        assert_eq!(reg.any_thread(), Some(7));
    }

    #[test]
    fn registry_tracks_modules() {
        let mut reg = Registry::new();
        reg.add_module(0x40_0000, "app.exe".into());
        reg.add_module(0x7ff0_0000, "ntdll.dll".into());
        reg.remove_module(0x40_0000);
        assert_eq!(
            reg.modules(),
            [ModuleListing {
                base: 0x7ff0_0000,
                name: "ntdll.dll".into()
            }]
        );
    }
}
