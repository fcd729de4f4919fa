//! Command handlers, minus the resume family (see `resume.rs`).

use log::info;

use crate::arch::XpointKind;
use crate::conn::Connection;
use crate::debuggee::EventSource;
use crate::errno;
use crate::protocol::commands;
use crate::protocol::commands::Command;
use crate::protocol::commands::HOp;
use crate::protocol::ResponseWriter;
use crate::protocol::ResponseWriterError;

use super::DebuggeeResultExt;
use super::DisconnectReason;
use super::Error;
use super::HandlerStatus;
use super::RunState;
use super::Session;
use super::PACKET_SIZE;

/// Memory reads are answered in bounded pieces of this many bytes.
const MEM_CHUNK: usize = 256;

impl<'a, E: EventSource> Session<'a, E> {
    pub(crate) fn handle_command<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        cmd: Command,
    ) -> Result<HandlerStatus, Error<C::Error>> {
        match cmd {
            Command::QuestionMark(_) => {
                self.write_status(res)?;
                // after the exit report there is nothing left to serve
                if let RunState::Terminated { code } = self.state {
                    return Ok(HandlerStatus::Disconnect(DisconnectReason::TargetExited(
                        code,
                    )));
                }
                Ok(HandlerStatus::Handled)
            }

            Command::g(_) => self.handle_read_registers(res),
            Command::G(cmd) => self.handle_write_registers(cmd),
            Command::p(cmd) => self.handle_read_register(res, cmd),
            Command::P(cmd) => self.handle_write_register(cmd),
            Command::m(cmd) => self.handle_read_memory(res, cmd),
            Command::M(cmd) => self.handle_write_memory(cmd),

            Command::H(cmd) => self.handle_set_thread(cmd),
            Command::T(cmd) => self.handle_thread_alive(cmd),
            Command::qC(_) => {
                res.write_str("QC")?;
                res.write_num(self.inspect_tid()?)?;
                Ok(HandlerStatus::Handled)
            }
            Command::qfThreadInfo(_) => {
                res.write_str("m")?;
                let mut first = true;
                for &tid in self.registry.threads() {
                    if !first {
                        res.write_str(",")?;
                    }
                    first = false;
                    res.write_num(tid)?;
                }
                Ok(HandlerStatus::Handled)
            }
            Command::qsThreadInfo(_) => {
                res.write_str("l")?;
                Ok(HandlerStatus::Handled)
            }

            Command::qOffsets(_) => {
                let bias = self.registry.load_bias();
                res.write_str("Text=")?;
                res.write_num(bias)?;
                res.write_str(";Data=")?;
                res.write_num(bias)?;
                res.write_str(";Bss=")?;
                res.write_num(bias)?;
                Ok(HandlerStatus::Handled)
            }
            Command::qSupported(_) => {
                res.write_str("PacketSize=")?;
                res.write_num(PACKET_SIZE as u64)?;
                res.write_str(";vContSupported+")?;
                if self.cpu.target_xml().is_some() {
                    res.write_str(";qXfer:features:read+")?;
                }
                Ok(HandlerStatus::Handled)
            }
            Command::qXferFeaturesRead(cmd) => self.handle_features_read(res, cmd),
            Command::qRcmd(cmd) => self.handle_monitor_cmd(res, &cmd.cmd),

            Command::Z(commands::Z(cmd)) => self.handle_xpoint(cmd, true),
            Command::z(commands::z(cmd)) => self.handle_xpoint(cmd, false),

            Command::D(_) => {
                self.dbg.detach().op_err()?;
                res.write_str("OK")?;
                Ok(HandlerStatus::Disconnect(DisconnectReason::Detach))
            }
            Command::k(_) => {
                self.dbg.kill().op_err()?;
                res.write_str("OK")?;
                Ok(HandlerStatus::Disconnect(DisconnectReason::Kill))
            }

            Command::c(cmd) => self.handle_continue(cmd.addr, None),
            Command::C(cmd) => self.handle_continue(cmd.addr, Some(cmd.sig)),
            Command::s(cmd) => self.handle_step(cmd.addr, None),
            Command::S(cmd) => self.handle_step(cmd.addr, Some(cmd.sig)),
            Command::vContQuestionMark(_) => {
                res.write_str("vCont;c;C;s;S")?;
                Ok(HandlerStatus::Handled)
            }
            Command::vCont(cmd) => self.handle_vcont(cmd.actions),

            Command::Unknown(raw) => {
                // the empty reply tells the client this packet is
                // unsupported
                info!(
                    "unknown command: {:?}",
                    core::str::from_utf8(&raw).unwrap_or("<non-ascii>")
                );
                Ok(HandlerStatus::Handled)
            }
        }
    }

    /// The stop/status reply: `T<sig>thread:<tid>;<n>:<bytes>;...` while
    /// trapped, `W<code>` once the debuggee is gone.
    pub(crate) fn write_status<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
    ) -> Result<(), ResponseWriterError<C::Error>> {
        match self.state {
            RunState::Terminated { code } => {
                res.write_str("W")?;
                res.write_num(code)?;
            }
            RunState::Running => {
                res.write_str("S")?;
                res.write_hex(self.last_signal.0)?;
            }
            RunState::Trapped { tid } => {
                res.write_str("T")?;
                res.write_hex(self.last_signal.0)?;
                res.write_str("thread:")?;
                res.write_num(tid)?;
                res.write_str(";")?;

                let mut ctx = vec![0u8; self.cpu.context_size()];
                if self.dbg.get_context(tid, &mut ctx).is_ok() {
                    for (i, reg) in self.cpu.regs().iter().enumerate() {
                        res.write_num(i as u64)?;
                        res.write_str(":")?;
                        res.write_hex_buf(reg.wire_bytes(&ctx))?;
                        res.write_str(";")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_read_registers<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
    ) -> Result<HandlerStatus, Error<C::Error>> {
        let tid = self.inspect_tid()?;
        let ctx = self.fetch_context(tid)?;
        for reg in self.cpu.regs() {
            res.write_hex_buf(reg.wire_bytes(&ctx))?;
        }
        Ok(HandlerStatus::Handled)
    }

    fn handle_write_registers<C>(
        &mut self,
        cmd: commands::G,
    ) -> Result<HandlerStatus, Error<C>> {
        let tid = self.inspect_tid()?;
        let wire_len: usize = self.cpu.regs().iter().map(|r| r.wire_size).sum();
        if cmd.vals.len() != wire_len {
            return Err(Error::NonFatal(errno::EINVAL));
        }

        let mut ctx = self.fetch_context(tid)?;
        let mut offset = 0;
        for reg in self.cpu.regs() {
            reg.set_wire_bytes(&mut ctx, &cmd.vals[offset..offset + reg.wire_size]);
            offset += reg.wire_size;
        }
        self.dbg.set_context(tid, &ctx).op_err()?;
        Ok(HandlerStatus::NeedsOk)
    }

    fn handle_read_register<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        cmd: commands::p,
    ) -> Result<HandlerStatus, Error<C::Error>> {
        let tid = self.inspect_tid()?;
        // an out-of-range index is a client bug, not a fault
        let reg = self
            .cpu
            .regs()
            .get(cmd.reg)
            .ok_or(Error::NonFatal(errno::EINVAL))?;
        let ctx = self.fetch_context(tid)?;
        res.write_hex_buf(reg.wire_bytes(&ctx))?;
        Ok(HandlerStatus::Handled)
    }

    fn handle_write_register<C>(
        &mut self,
        cmd: commands::P,
    ) -> Result<HandlerStatus, Error<C>> {
        let tid = self.inspect_tid()?;
        let reg = self
            .cpu
            .regs()
            .get(cmd.reg)
            .ok_or(Error::NonFatal(errno::EINVAL))?;
        if cmd.vals.len() != reg.wire_size {
            return Err(Error::NonFatal(errno::EINVAL));
        }

        let mut ctx = self.fetch_context(tid)?;
        reg.set_wire_bytes(&mut ctx, &cmd.vals);
        self.dbg.set_context(tid, &ctx).op_err()?;
        Ok(HandlerStatus::NeedsOk)
    }

    fn handle_read_memory<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        cmd: commands::m,
    ) -> Result<HandlerStatus, Error<C::Error>> {
        self.require_trap()?;

        let mut done = 0;
        while done < cmd.len {
            let chunk = (cmd.len - done).min(MEM_CHUNK);
            let mut buf = vec![0u8; chunk];
            let got = match self.dbg.read_memory(cmd.addr + done as u64, &mut buf) {
                Ok(got) => got,
                Err(_) if done > 0 => break,
                Err(e) => return Err(e).op_err(),
            };
            if got == 0 && done == 0 {
                return Err(Error::NonFatal(errno::EFAULT));
            }

            res.write_hex_buf(&buf[..got])?;
            done += got;

            // a short read means the rest of the range is unmapped; the
            // partial payload goes back with no error marker
            if got < chunk {
                break;
            }
        }
        Ok(HandlerStatus::Handled)
    }

    fn handle_write_memory<C>(
        &mut self,
        cmd: commands::M,
    ) -> Result<HandlerStatus, Error<C>> {
        self.require_trap()?;

        // reject before anything is written
        if cmd.vals.len() != cmd.len {
            return Err(Error::NonFatal(errno::EINVAL));
        }

        self.dbg.write_memory(cmd.addr, &cmd.vals).op_err()?;
        Ok(HandlerStatus::NeedsOk)
    }

    fn handle_set_thread<C>(&mut self, cmd: commands::H) -> Result<HandlerStatus, Error<C>> {
        let selection = match cmd.id {
            -1 | 0 => None,
            id => {
                let tid = id as crate::common::Tid;
                if !self.registry.is_alive(tid) {
                    return Err(Error::NonFatal(errno::ESRCH));
                }
                Some(tid)
            }
        };

        match cmd.op {
            HOp::Exec => self.exec_thread = selection,
            HOp::Other => self.other_thread = selection,
        }
        Ok(HandlerStatus::NeedsOk)
    }

    fn handle_thread_alive<C>(&mut self, cmd: commands::T) -> Result<HandlerStatus, Error<C>> {
        if cmd.id > 0 && self.registry.is_alive(cmd.id as crate::common::Tid) {
            Ok(HandlerStatus::NeedsOk)
        } else {
            Err(Error::NonFatal(errno::ESRCH))
        }
    }

    fn handle_features_read<C: Connection>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        cmd: commands::qXferFeaturesRead,
    ) -> Result<HandlerStatus, Error<C::Error>> {
        let Some(xml) = self.cpu.target_xml() else {
            // no blob for this architecture: the packet is unsupported
            return Ok(HandlerStatus::Handled);
        };

        if cmd.annex != "target.xml" {
            return Err(Error::NonFatal(errno::EINVAL));
        }

        if cmd.offset >= xml.len() {
            res.write_str("l")?;
            return Ok(HandlerStatus::Handled);
        }

        // the blob is plain ASCII, so byte offsets are char offsets
        let end = (cmd.offset + cmd.len).min(xml.len());
        res.write_str(if end == xml.len() { "l" } else { "m" })?;
        res.write_str(&xml[cmd.offset..end])?;
        Ok(HandlerStatus::Handled)
    }

    fn handle_xpoint<C>(
        &mut self,
        cmd: commands::XpointCmd,
        insert: bool,
    ) -> Result<HandlerStatus, Error<C>> {
        self.require_trap()?;

        let kind = match cmd.type_ {
            0 => XpointKind::Code,
            1 => XpointKind::WatchExec,
            2 => XpointKind::WatchWrite,
            3 => XpointKind::WatchRead,
            // access watchpoints and anything newer: unsupported
            _ => return Ok(HandlerStatus::Handled),
        };

        let result = if insert {
            self.xpoints.insert(
                self.dbg,
                self.cpu,
                &self.registry,
                kind,
                cmd.addr,
                cmd.kind,
            )
        } else {
            self.xpoints
                .remove(self.dbg, self.cpu, &self.registry, kind, cmd.addr)
        };

        match result {
            Ok(()) => Ok(HandlerStatus::NeedsOk),
            Err(e) => Err(Error::NonFatal(e.errno())),
        }
    }
}
