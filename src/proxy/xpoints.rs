//! Session-side xpoint bookkeeping: saved breakpoint bytes and the
//! hardware debug-register pool.

use log::debug;
use log::warn;

use crate::arch::Cpu;
use crate::arch::DrPool;
use crate::arch::XpointKind;
use crate::debuggee::EventSource;
use crate::debuggee::Registry;
use crate::errno;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum XpointError {
    /// Memory could not be read or written.
    Fault,
    /// All hardware slots are claimed.
    NoSlot,
    /// The backend cannot express this xpoint.
    Unsupported,
    /// Removal of an xpoint that was never inserted.
    NotFound,
    BadLength,
}

impl XpointError {
    pub(crate) fn errno(&self) -> u8 {
        match self {
            XpointError::Fault => errno::EFAULT,
            XpointError::NoSlot => errno::ENOSPC,
            XpointError::Unsupported => errno::EPERM,
            XpointError::NotFound => errno::EINVAL,
            XpointError::BadLength => errno::EINVAL,
        }
    }
}

#[derive(Debug)]
enum State {
    /// Software breakpoint. `saved` holds the original instruction
    /// bytes while installed; an uninstalled entry is pending a
    /// mapping and retried on module load.
    Code { saved: Vec<u8>, installed: bool },
    /// Hardware watchpoint occupying a pool slot.
    Hw { slot: usize },
}

#[derive(Debug)]
struct Xpoint {
    kind: XpointKind,
    addr: u64,
    size: u64,
    state: State,
}

#[derive(Debug, Default)]
pub(crate) struct XpointSet {
    list: Vec<Xpoint>,
    pool: DrPool,
}

impl XpointSet {
    pub(crate) fn new() -> XpointSet {
        XpointSet::default()
    }

    pub(crate) fn insert<E: EventSource>(
        &mut self,
        dbg: &mut E,
        cpu: &'static dyn Cpu,
        registry: &Registry,
        kind: XpointKind,
        addr: u64,
        size: u64,
    ) -> Result<(), XpointError> {
        match kind {
            XpointKind::Code => self.insert_code(dbg, cpu, addr, size),
            _ => self.insert_watch(dbg, cpu, registry, kind, addr, size),
        }
    }

    pub(crate) fn remove<E: EventSource>(
        &mut self,
        dbg: &mut E,
        cpu: &'static dyn Cpu,
        registry: &Registry,
        kind: XpointKind,
        addr: u64,
    ) -> Result<(), XpointError> {
        let idx = self
            .list
            .iter()
            .position(|x| x.kind == kind && x.addr == addr)
            .ok_or(XpointError::NotFound)?;
        let xpoint = self.list.remove(idx);
        debug!(
            "removing {:?} xpoint at {:#x} (size {})",
            xpoint.kind, xpoint.addr, xpoint.size
        );

        match xpoint.state {
            State::Code { saved, installed } => {
                if !installed {
                    return Ok(());
                }
                // restore the original bytes exactly
                dbg.write_memory(addr, &saved)
                    .map_err(|_| XpointError::Fault)
            }
            State::Hw { slot } => {
                for &tid in registry.threads() {
                    let mut ctx = vec![0u8; cpu.context_size()];
                    if dbg.get_context(tid, &mut ctx).is_err() {
                        continue;
                    }
                    if cpu.clear_watch(&mut ctx, slot).is_ok() {
                        let _ = dbg.set_context(tid, &ctx);
                    }
                }
                self.pool.free(slot);
                Ok(())
            }
        }
    }

    fn insert_code<E: EventSource>(
        &mut self,
        dbg: &mut E,
        cpu: &'static dyn Cpu,
        addr: u64,
        size: u64,
    ) -> Result<(), XpointError> {
        if self
            .list
            .iter()
            .any(|x| x.kind == XpointKind::Code && x.addr == addr)
        {
            // the client lost track and re-sent; the trap is in place
            return Ok(());
        }

        let mut xpoint = Xpoint {
            kind: XpointKind::Code,
            addr,
            size,
            state: State::Code {
                saved: Vec::new(),
                installed: false,
            },
        };

        let result = install_code(dbg, cpu, &mut xpoint);
        // an uninstallable breakpoint stays pending: a later module
        // load may map its page
        self.list.push(xpoint);
        result
    }

    fn insert_watch<E: EventSource>(
        &mut self,
        dbg: &mut E,
        cpu: &'static dyn Cpu,
        registry: &Registry,
        kind: XpointKind,
        addr: u64,
        len: u64,
    ) -> Result<(), XpointError> {
        if cpu.watch_slots() == 0 {
            return Err(XpointError::Unsupported);
        }

        let slot = self.pool.alloc().ok_or(XpointError::NoSlot)?;

        for &tid in registry.threads() {
            let mut ctx = vec![0u8; cpu.context_size()];
            if dbg.get_context(tid, &mut ctx).is_err() {
                self.pool.free(slot);
                return Err(XpointError::Fault);
            }
            if let Err(e) = cpu.encode_watch(&mut ctx, slot, kind, addr, len) {
                self.pool.free(slot);
                return Err(match e {
                    crate::arch::CpuError::BadLength(_) => XpointError::BadLength,
                    _ => XpointError::Unsupported,
                });
            }
            if dbg.set_context(tid, &ctx).is_err() {
                self.pool.free(slot);
                return Err(XpointError::Fault);
            }
        }

        debug!("watchpoint at {:#x} in slot {}", addr, slot);
        self.list.push(Xpoint {
            kind,
            addr,
            size: len,
            state: State::Hw { slot },
        });
        Ok(())
    }

    /// Try again to install code breakpoints whose pages were unmapped
    /// when they were created.
    pub(crate) fn retry_pending<E: EventSource>(&mut self, dbg: &mut E, cpu: &'static dyn Cpu) {
        for xpoint in &mut self.list {
            if matches!(xpoint.state, State::Code { installed: false, .. }) {
                if install_code(dbg, cpu, xpoint).is_ok() {
                    debug!("pending breakpoint at {:#x} resolved", xpoint.addr);
                } else {
                    warn!("breakpoint at {:#x} still pending", xpoint.addr);
                }
            }
        }
    }
}

/// Patch the trap instruction in, saving what it overwrites. Never
/// leaves a partial write behind: the payload goes in via a single
/// all-or-nothing memory write.
fn install_code<E: EventSource>(
    dbg: &mut E,
    cpu: &'static dyn Cpu,
    xpoint: &mut Xpoint,
) -> Result<(), XpointError> {
    let insn = cpu.sw_break_insn();
    let mut original = vec![0u8; insn.len()];

    match dbg.read_memory(xpoint.addr, &mut original) {
        Ok(n) if n == insn.len() => {}
        _ => return Err(XpointError::Fault),
    }

    dbg.write_memory(xpoint.addr, insn)
        .map_err(|_| XpointError::Fault)?;

    xpoint.state = State::Code {
        saved: original,
        installed: true,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::arch;
    use crate::common::Tid;
    use crate::debuggee::DebugEvent;
    use crate::debuggee::DebuggeeError;
    use crate::debuggee::ProcessListing;
    use crate::debuggee::ResumeStatus;

    /// Sparse byte map standing in for debuggee memory; pages can be
    /// mapped after the fact.
    struct MiniDbg {
        mem: HashMap<u64, u8>,
    }

    impl crate::debuggee::EventSource for MiniDbg {
        fn cpu(&self) -> &'static dyn Cpu {
            arch::lookup("i386").unwrap()
        }

        fn wait_event(&mut self, _: Duration) -> Result<Option<DebugEvent>, DebuggeeError> {
            Ok(None)
        }

        fn resume(&mut self, _: ResumeStatus) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn suspend_thread(&mut self, _: Tid) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn resume_thread(&mut self, _: Tid) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn break_in(&mut self) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, DebuggeeError> {
            for (i, out) in buf.iter_mut().enumerate() {
                match self.mem.get(&(addr + i as u64)) {
                    Some(&b) => *out = b,
                    None if i > 0 => return Ok(i),
                    None => return Err(DebuggeeError::MemoryFault { addr }),
                }
            }
            Ok(buf.len())
        }

        fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), DebuggeeError> {
            if (0..data.len() as u64).any(|i| !self.mem.contains_key(&(addr + i))) {
                return Err(DebuggeeError::MemoryFault { addr });
            }
            for (i, &b) in data.iter().enumerate() {
                self.mem.insert(addr + i as u64, b);
            }
            Ok(())
        }

        fn get_context(&mut self, _: Tid, _: &mut [u8]) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn set_context(&mut self, _: Tid, _: &[u8]) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn processes(&mut self) -> Result<Vec<ProcessListing>, DebuggeeError> {
            Ok(Vec::new())
        }

        fn kill(&mut self) -> Result<(), DebuggeeError> {
            Ok(())
        }

        fn detach(&mut self) -> Result<(), DebuggeeError> {
            Ok(())
        }
    }

    #[test]
    fn unmapped_breakpoint_fails_then_resolves_on_retry() {
        let mut dbg = MiniDbg {
            mem: HashMap::new(),
        };
        let cpu = arch::lookup("i386").unwrap();
        let mut set = XpointSet::new();

        // the page is not mapped yet: the insert fails loudly but the
        // xpoint is kept pending
        assert_eq!(
            set.insert(
                &mut dbg,
                cpu,
                &crate::debuggee::Registry::new(),
                XpointKind::Code,
                0x2000,
                1
            ),
            Err(XpointError::Fault)
        );

        dbg.mem.insert(0x2000, 0x55);
        set.retry_pending(&mut dbg, cpu);
        assert_eq!(dbg.mem[&0x2000], 0xcc);

        // removal restores the original byte
        set.remove(
            &mut dbg,
            cpu,
            &crate::debuggee::Registry::new(),
            XpointKind::Code,
            0x2000,
        )
        .unwrap();
        assert_eq!(dbg.mem[&0x2000], 0x55);
    }
}
