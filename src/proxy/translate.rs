//! Native debug-event consumption: registry bookkeeping plus the
//! exception-to-signal classification table.

use log::debug;
use log::trace;

use crate::arch::AddrKind;
use crate::common::Signal;
use crate::common::Tid;
use crate::debuggee::excpt;
use crate::debuggee::DebugEvent;
use crate::debuggee::DebuggeeError;
use crate::debuggee::EventKind;
use crate::debuggee::EventSource;
use crate::debuggee::ResumeStatus;

use super::Session;

/// What the session loop does with a consumed event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// No RSP-visible effect; silently resume the debuggee.
    Absorb(ResumeStatus),
    /// Stop and report a signal for `tid`.
    Report { tid: Tid, signal: Signal },
    /// The process is gone; report `W<code>` and end the session.
    Exited(u32),
}

/// The fixed exception classification table. `None` marks the
/// pseudo-exceptions that are absorbed outright.
fn classify(code: u32) -> Option<Signal> {
    let signal = match code {
        excpt::ACCESS_VIOLATION
        | excpt::PRIV_INSTRUCTION
        | excpt::STACK_OVERFLOW
        | excpt::GUARD_PAGE => Signal::SIGSEGV,

        excpt::DATATYPE_MISALIGNMENT => Signal::SIGBUS,

        excpt::BREAKPOINT | excpt::SINGLE_STEP => Signal::SIGTRAP,

        excpt::FLT_DENORMAL_OPERAND
        | excpt::FLT_DIVIDE_BY_ZERO
        | excpt::FLT_INEXACT_RESULT
        | excpt::FLT_INVALID_OPERATION
        | excpt::FLT_OVERFLOW
        | excpt::FLT_STACK_CHECK
        | excpt::FLT_UNDERFLOW
        | excpt::INT_DIVIDE_BY_ZERO
        | excpt::INT_OVERFLOW => Signal::SIGFPE,

        excpt::ILLEGAL_INSTRUCTION => Signal::SIGILL,

        excpt::CONTROL_C_EXIT | excpt::DBG_CONTROL_C | excpt::DBG_CONTROL_BREAK => Signal::SIGINT,

        excpt::POSSIBLE_DEADLOCK => Signal::SIGALRM,

        excpt::THREAD_NAME | excpt::INVALID_HANDLE => return None,

        other => {
            debug!("unrecognized exception {:#010x}", other);
            Signal::SIGABRT
        }
    };
    Some(signal)
}

impl<'a, E: EventSource> Session<'a, E> {
    /// Consume exactly one native event.
    pub(crate) fn translate_event(
        &mut self,
        event: DebugEvent,
    ) -> Result<Disposition, DebuggeeError> {
        let tid = event.tid;
        let disposition = match event.kind {
            EventKind::ProcessCreated {
                pid,
                image_base,
                load_bias,
            } => {
                debug!("process {} created, image at {:#x}", pid, image_base);
                self.registry.set_process(pid, image_base, load_bias);
                self.registry.add_thread(tid);
                Disposition::Absorb(ResumeStatus::Handled)
            }
            EventKind::ThreadCreated => {
                self.registry.add_thread(tid);
                Disposition::Absorb(ResumeStatus::Handled)
            }
            EventKind::ThreadExited { code } => {
                trace!("thread {} exited ({})", tid, code);
                self.registry.remove_thread(tid);
                Disposition::Absorb(ResumeStatus::Handled)
            }
            EventKind::ModuleLoaded { base, name } => {
                self.registry.add_module(base, name);
                // a fresh mapping may cover xpoints that could not be
                // installed earlier
                self.xpoints.retry_pending(self.dbg, self.cpu);
                Disposition::Absorb(ResumeStatus::Handled)
            }
            EventKind::ModuleUnloaded { base } => {
                self.registry.remove_module(base);
                Disposition::Absorb(ResumeStatus::Handled)
            }
            EventKind::DebugString(msg) => {
                debug!("debuggee output: {}", msg.trim_end());
                Disposition::Absorb(ResumeStatus::Handled)
            }
            EventKind::ProcessExited { code } => {
                debug!("process exited with {}", code);
                Disposition::Exited(code)
            }
            EventKind::Exception {
                code,
                address,
                first_chance,
            } => {
                trace!(
                    "exception {:#010x} at {:#x} (first chance: {})",
                    code,
                    address,
                    first_chance
                );
                match classify(code) {
                    None => Disposition::Absorb(ResumeStatus::Handled),
                    Some(signal) => {
                        if code == excpt::BREAKPOINT {
                            self.fixup_break_pc(tid)?;
                        }
                        Disposition::Report { tid, signal }
                    }
                }
            }
        };
        Ok(disposition)
    }

    /// Architectures that report a breakpoint trap one instruction past
    /// the break site need the PC pulled back before the client reads
    /// it.
    fn fixup_break_pc(&mut self, tid: Tid) -> Result<(), DebuggeeError> {
        let bias = self.cpu.pc_bias_after_break();
        if bias == 0 {
            return Ok(());
        }

        let mut ctx = vec![0u8; self.cpu.context_size()];
        self.dbg.get_context(tid, &mut ctx)?;
        let pc = self.cpu.get_addr(&ctx, AddrKind::Pc).wrapping_add(bias as u64);
        self.cpu.set_pc(&mut ctx, pc);
        self.dbg.set_context(tid, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(classify(excpt::ACCESS_VIOLATION), Some(Signal::SIGSEGV));
        assert_eq!(classify(excpt::GUARD_PAGE), Some(Signal::SIGSEGV));
        assert_eq!(classify(excpt::STACK_OVERFLOW), Some(Signal::SIGSEGV));
        assert_eq!(classify(excpt::PRIV_INSTRUCTION), Some(Signal::SIGSEGV));
        assert_eq!(classify(excpt::DATATYPE_MISALIGNMENT), Some(Signal::SIGBUS));
        assert_eq!(classify(excpt::BREAKPOINT), Some(Signal::SIGTRAP));
        assert_eq!(classify(excpt::SINGLE_STEP), Some(Signal::SIGTRAP));
        assert_eq!(classify(excpt::FLT_DIVIDE_BY_ZERO), Some(Signal::SIGFPE));
        assert_eq!(classify(excpt::INT_OVERFLOW), Some(Signal::SIGFPE));
        assert_eq!(classify(excpt::ILLEGAL_INSTRUCTION), Some(Signal::SIGILL));
        assert_eq!(classify(excpt::DBG_CONTROL_C), Some(Signal::SIGINT));
        assert_eq!(classify(excpt::POSSIBLE_DEADLOCK), Some(Signal::SIGALRM));
        // anything unrecognized comes out as an abort
        assert_eq!(classify(0xdead_beef), Some(Signal::SIGABRT));
    }

    #[test]
    fn pseudo_exceptions_are_absorbed() {
        assert_eq!(classify(excpt::THREAD_NAME), None);
        assert_eq!(classify(excpt::INVALID_HANDLE), None);
    }
}
