//! The resume family: `c`/`C`/`s`/`S` and the per-thread `vCont`
//! algorithm. A handler here never composes a reply; the status packet
//! goes out when the next debug event stops the debuggee again.

use log::warn;

use crate::common::Tid;
use crate::debuggee::EventSource;
use crate::debuggee::ResumeStatus;
use crate::errno;
use crate::protocol::commands::VContAction;
use crate::protocol::commands::VContKind;

use super::DebuggeeResultExt;
use super::Error;
use super::HandlerStatus;
use super::RunState;
use super::Session;

impl<'a, E: EventSource> Session<'a, E> {
    /// A signal forced by `C`/`S` must match the last reported one;
    /// resuming with it means handing the exception back to the
    /// debuggee instead of swallowing it.
    fn resume_status_for<C>(&self, sig: Option<u8>) -> Result<ResumeStatus, Error<C>> {
        match sig {
            None => Ok(ResumeStatus::Handled),
            Some(sig) if sig == self.last_signal.0 => Ok(ResumeStatus::PassException),
            Some(_) => Err(Error::NonFatal(errno::EINVAL)),
        }
    }

    /// Arm the single-step flag on `tid`.
    fn arm_step<C>(&mut self, tid: Tid) -> Result<(), Error<C>> {
        let mut ctx = self.fetch_context(tid)?;
        self.cpu.single_step(&mut ctx, true).map_err(|_| {
            warn!("{} cannot single-step", self.cpu.name());
            Error::NonFatal(errno::EPERM)
        })?;
        self.dbg.set_context(tid, &ctx).op_err()?;
        self.step_tids.push(tid);
        Ok(())
    }

    fn set_running(&mut self) {
        self.state = RunState::Running;
        self.exec_thread = None;
        self.other_thread = None;
    }

    pub(crate) fn handle_continue<C>(
        &mut self,
        addr: Option<u64>,
        sig: Option<u8>,
    ) -> Result<HandlerStatus, Error<C>> {
        let tid = self.exec_tid()?;
        let status = self.resume_status_for(sig)?;

        if let Some(addr) = addr {
            let mut ctx = self.fetch_context(tid)?;
            self.cpu.set_pc(&mut ctx, addr);
            self.dbg.set_context(tid, &ctx).op_err()?;
        }

        self.dbg.resume(status).op_err()?;
        self.set_running();
        Ok(HandlerStatus::Resumed)
    }

    pub(crate) fn handle_step<C>(
        &mut self,
        addr: Option<u64>,
        sig: Option<u8>,
    ) -> Result<HandlerStatus, Error<C>> {
        let tid = self.exec_tid()?;
        let status = self.resume_status_for(sig)?;

        if let Some(addr) = addr {
            let mut ctx = self.fetch_context(tid)?;
            self.cpu.set_pc(&mut ctx, addr);
            self.dbg.set_context(tid, &ctx).op_err()?;
        }

        self.arm_step(tid)?;
        self.dbg.resume(status).op_err()?;
        self.set_running();
        Ok(HandlerStatus::Resumed)
    }

    /// The vCont algorithm: (1) all actions are already parsed; (2)
    /// explicit per-thread actions are applied first, consuming their
    /// threads; (3) the single default action covers every thread not
    /// yet consumed; threads left without an action stay suspended
    /// until the next stop. Only then does the debuggee resume, once.
    pub(crate) fn handle_vcont<C>(
        &mut self,
        actions: Vec<VContAction>,
    ) -> Result<HandlerStatus, Error<C>> {
        self.require_trap()?;

        // a thread id of -1 means "all threads", i.e. another spelling
        // of the default action
        let explicit: Vec<(Tid, VContKind)> = actions
            .iter()
            .filter_map(|a| match a.tid {
                Some(tid) if tid > 0 => Some((tid as Tid, a.kind)),
                _ => None,
            })
            .collect();
        let defaults: Vec<VContKind> = actions
            .iter()
            .filter(|a| !matches!(a.tid, Some(tid) if tid > 0))
            .map(|a| a.kind)
            .collect();

        if defaults.len() > 1 {
            return Err(Error::NonFatal(errno::EINVAL));
        }
        let default = defaults.first().copied();

        // validate every forced signal before touching any thread
        let mut status = ResumeStatus::Handled;
        for kind in explicit.iter().map(|(_, k)| *k).chain(default) {
            if let VContKind::ContinueWithSig(sig) | VContKind::StepWithSig(sig) = kind {
                if self.resume_status_for::<C>(Some(sig))? == ResumeStatus::PassException {
                    status = ResumeStatus::PassException;
                }
            }
        }

        let threads: Vec<Tid> = self.registry.threads().to_vec();
        let mut consumed = vec![false; threads.len()];

        for (tid, kind) in &explicit {
            let Some(slot) = threads.iter().position(|t| t == tid) else {
                warn!("vCont names unknown thread {}", tid);
                continue;
            };
            if consumed[slot] {
                // each thread is served exactly once; later duplicates
                // are client noise
                continue;
            }
            consumed[slot] = true;
            self.apply_vcont_action(*tid, *kind)?;
        }

        for (slot, &tid) in threads.iter().enumerate() {
            if consumed[slot] {
                continue;
            }
            match default {
                Some(kind) => self.apply_vcont_action(tid, kind)?,
                None => {
                    self.dbg.suspend_thread(tid).op_err()?;
                    self.vcont_suspended.push(tid);
                }
            }
        }

        self.dbg.resume(status).op_err()?;
        self.set_running();
        Ok(HandlerStatus::Resumed)
    }

    fn apply_vcont_action<C>(&mut self, tid: Tid, kind: VContKind) -> Result<(), Error<C>> {
        match kind {
            VContKind::Continue | VContKind::ContinueWithSig(_) => Ok(()),
            VContKind::Step | VContKind::StepWithSig(_) => self.arm_step(tid),
        }
    }
}
