//! 32-bit ARM backend.
//!
//! The XML-less GDB layout for plain `arm` still carries the eight
//! legacy FPA registers (12 bytes each) plus their status word between
//! `pc` and `cpsr`, so the map includes them even though no debuggee
//! populates them anymore.
//!
//! No trap flag and no debug-register pool here: single-step and
//! hardware watchpoints report `Unsupported`, which the dispatcher
//! surfaces as an error reply.

use crate::arch::ctx_get;
use crate::arch::ctx_set;
use crate::arch::AddrKind;
use crate::arch::Cpu;
use crate::arch::CpuError;
use crate::arch::RegEntry;
use crate::arch::XpointKind;

/// Native ARM thread context snapshot.
#[repr(C)]
#[derive(Debug)]
pub struct ArmContext {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub f0: [u8; 12],
    pub f1: [u8; 12],
    pub f2: [u8; 12],
    pub f3: [u8; 12],
    pub f4: [u8; 12],
    pub f5: [u8; 12],
    pub f6: [u8; 12],
    pub f7: [u8; 12],
    pub fps: u32,
    pub cpsr: u32,
}

#[rustfmt::skip]
static REGS: &[RegEntry] = cpu_regs! {
    ArmContext {
        "r0"   => r0:    4, 4;
        "r1"   => r1:    4, 4;
        "r2"   => r2:    4, 4;
        "r3"   => r3:    4, 4;
        "r4"   => r4:    4, 4;
        "r5"   => r5:    4, 4;
        "r6"   => r6:    4, 4;
        "r7"   => r7:    4, 4;
        "r8"   => r8:    4, 4;
        "r9"   => r9:    4, 4;
        "r10"  => r10:   4, 4;
        "r11"  => r11:   4, 4;
        "r12"  => r12:   4, 4;
        "sp"   => sp:    4, 4;
        "lr"   => lr:    4, 4;
        "pc"   => pc:    4, 4;
        "f0"   => f0:   12, 12;
        "f1"   => f1:   12, 12;
        "f2"   => f2:   12, 12;
        "f3"   => f3:   12, 12;
        "f4"   => f4:   12, 12;
        "f5"   => f5:   12, 12;
        "f6"   => f6:   12, 12;
        "f7"   => f7:   12, 12;
        "fps"  => fps:   4, 4;
        "cpsr" => cpsr:  4, 4;
    }
};

pub struct Arm;

impl Cpu for Arm {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn regs(&self) -> &'static [RegEntry] {
        REGS
    }

    fn context_size(&self) -> usize {
        core::mem::size_of::<ArmContext>()
    }

    fn get_addr(&self, ctx: &[u8], kind: AddrKind) -> u64 {
        let offset = match kind {
            AddrKind::Pc => core::mem::offset_of!(ArmContext, pc),
            AddrKind::Frame => core::mem::offset_of!(ArmContext, r11),
            AddrKind::Stack => core::mem::offset_of!(ArmContext, sp),
        };
        ctx_get(ctx, offset, 4)
    }

    fn set_pc(&self, ctx: &mut [u8], pc: u64) {
        ctx_set(ctx, core::mem::offset_of!(ArmContext, pc), 4, pc);
    }

    fn single_step(&self, _ctx: &mut [u8], _enable: bool) -> Result<(), CpuError> {
        Err(CpuError::Unsupported("arm single-step"))
    }

    fn sw_break_insn(&self) -> &'static [u8] {
        // udf #0xfdee, the canonical ARM-mode breakpoint
        &[0xee, 0xfd, 0xff, 0xe7]
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
        Err(CpuError::Unsupported("arm watchpoints"))
    }

    fn clear_watch(&self, _ctx: &mut [u8], _slot: usize) -> Result<(), CpuError> {
        Err(CpuError::Unsupported("arm watchpoints"))
    }

    fn target_xml(&self) -> Option<&'static str> {
        Some(r#"<target version="1.0"><architecture>arm</architecture></target>"#)
    }
}
