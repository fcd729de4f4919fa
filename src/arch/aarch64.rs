//! AArch64 backend.
//!
//! Core register set only (`org.gnu.gdb.aarch64.core`): x0-x30, sp, pc
//! and the 32-bit pseudo-CPSR.

use crate::arch::ctx_get;
use crate::arch::ctx_set;
use crate::arch::AddrKind;
use crate::arch::Cpu;
use crate::arch::CpuError;
use crate::arch::RegEntry;
use crate::arch::XpointKind;

/// PSTATE software-step bit.
const PSTATE_SS: u64 = 1 << 21;

/// Native AArch64 thread context snapshot.
#[repr(C)]
#[derive(Debug)]
pub struct AArch64Context {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    pub x7: u64,
    pub x8: u64,
    pub x9: u64,
    pub x10: u64,
    pub x11: u64,
    pub x12: u64,
    pub x13: u64,
    pub x14: u64,
    pub x15: u64,
    pub x16: u64,
    pub x17: u64,
    pub x18: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub x29: u64,
    pub x30: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u64,
}

#[rustfmt::skip]
static REGS: &[RegEntry] = cpu_regs! {
    AArch64Context {
        "x0"   => x0:   8, 8;
        "x1"   => x1:   8, 8;
        "x2"   => x2:   8, 8;
        "x3"   => x3:   8, 8;
        "x4"   => x4:   8, 8;
        "x5"   => x5:   8, 8;
        "x6"   => x6:   8, 8;
        "x7"   => x7:   8, 8;
        "x8"   => x8:   8, 8;
        "x9"   => x9:   8, 8;
        "x10"  => x10:  8, 8;
        "x11"  => x11:  8, 8;
        "x12"  => x12:  8, 8;
        "x13"  => x13:  8, 8;
        "x14"  => x14:  8, 8;
        "x15"  => x15:  8, 8;
        "x16"  => x16:  8, 8;
        "x17"  => x17:  8, 8;
        "x18"  => x18:  8, 8;
        "x19"  => x19:  8, 8;
        "x20"  => x20:  8, 8;
        "x21"  => x21:  8, 8;
        "x22"  => x22:  8, 8;
        "x23"  => x23:  8, 8;
        "x24"  => x24:  8, 8;
        "x25"  => x25:  8, 8;
        "x26"  => x26:  8, 8;
        "x27"  => x27:  8, 8;
        "x28"  => x28:  8, 8;
        "x29"  => x29:  8, 8;
        "x30"  => x30:  8, 8;
        "sp"   => sp:   8, 8;
        "pc"   => pc:   8, 8;
        // GDB keeps the AArch32 name and a 4-byte wire width for PSTATE
        "cpsr" => cpsr: 8, 4;
    }
};

pub struct AArch64;

impl Cpu for AArch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn regs(&self) -> &'static [RegEntry] {
        REGS
    }

    fn context_size(&self) -> usize {
        core::mem::size_of::<AArch64Context>()
    }

    fn get_addr(&self, ctx: &[u8], kind: AddrKind) -> u64 {
        let offset = match kind {
            AddrKind::Pc => core::mem::offset_of!(AArch64Context, pc),
            AddrKind::Frame => core::mem::offset_of!(AArch64Context, x29),
            AddrKind::Stack => core::mem::offset_of!(AArch64Context, sp),
        };
        ctx_get(ctx, offset, 8)
    }

    fn set_pc(&self, ctx: &mut [u8], pc: u64) {
        ctx_set(ctx, core::mem::offset_of!(AArch64Context, pc), 8, pc);
    }

    fn single_step(&self, ctx: &mut [u8], enable: bool) -> Result<(), CpuError> {
        let offset = core::mem::offset_of!(AArch64Context, cpsr);
        let mut pstate = ctx_get(ctx, offset, 8);
        if enable {
            pstate |= PSTATE_SS;
        } else {
            pstate &= !PSTATE_SS;
        }
        ctx_set(ctx, offset, 8, pstate);
        Ok(())
    }

    fn sw_break_insn(&self) -> &'static [u8] {
        // brk #0
        &[0x00, 0x00, 0x20, 0xd4]
    }

    fn pc_bias_after_break(&self) -> i64 {
        0
    }

    fn encode_watch(
        &self,
        _ctx: &mut [u8],
        _slot: usize,
        _kind: XpointKind,
        _addr: u64,
        _len: u64,
    ) -> Result<(), CpuError> {
        Err(CpuError::Unsupported("aarch64 watchpoints"))
    }

    fn clear_watch(&self, _ctx: &mut [u8], _slot: usize) -> Result<(), CpuError> {
        Err(CpuError::Unsupported("aarch64 watchpoints"))
    }

    fn target_xml(&self) -> Option<&'static str> {
        Some(r#"<target version="1.0"><architecture>aarch64</architecture></target>"#)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_cpsr_wire_encoding_is_stable() {
        let cpu = AArch64;
        let mut ctx = vec![0u8; cpu.context_size()];
        let entry = crate::arch::find_reg(REGS, "cpsr").unwrap();

        // the native field is wider than the wire format; the upper
        // half never travels and must survive a wire write untouched
        entry.set_u64(&mut ctx, 0x0000_00ff_6000_03c5);
        assert_eq!(entry.wire_bytes(&ctx), [0xc5, 0x03, 0x00, 0x60]);

        entry.set_wire_bytes(&mut ctx, &[0x00, 0x00, 0x00, 0x20]);
        assert_eq!(entry.get_u64(&ctx), 0x0000_00ff_2000_0000);

        cpu.single_step(&mut ctx, true).unwrap();
        assert_eq!(entry.get_u64(&ctx) & PSTATE_SS, PSTATE_SS);
    }
}
