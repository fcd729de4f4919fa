//! 64-bit x86 backend.
//!
//! Register layout follows the GDB `i386:x86-64` core + SSE feature set
//! (what an XML-less client assumes for this architecture).

use crate::arch::ctx_get;
use crate::arch::ctx_set;
use crate::arch::dr7_disable;
use crate::arch::dr7_enable;
use crate::arch::AddrKind;
use crate::arch::Cpu;
use crate::arch::CpuError;
use crate::arch::RegEntry;
use crate::arch::XpointKind;
use crate::arch::HW_SLOTS;

const EFLAGS_TF: u64 = 1 << 8;

/// Native x86-64 thread context snapshot.
#[repr(C)]
#[derive(Debug)]
pub struct X86_64Context {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    // x87 stack registers live in 16-byte slots; only the low 10 bytes
    // are architectural state
    pub st0: [u8; 16],
    pub st1: [u8; 16],
    pub st2: [u8; 16],
    pub st3: [u8; 16],
    pub st4: [u8; 16],
    pub st5: [u8; 16],
    pub st6: [u8; 16],
    pub st7: [u8; 16],
    pub fctrl: u32,
    pub fstat: u32,
    pub ftag: u32,
    pub fiseg: u32,
    pub fioff: u32,
    pub foseg: u32,
    pub fooff: u32,
    pub fop: u32,
    pub xmm0: [u8; 16],
    pub xmm1: [u8; 16],
    pub xmm2: [u8; 16],
    pub xmm3: [u8; 16],
    pub xmm4: [u8; 16],
    pub xmm5: [u8; 16],
    pub xmm6: [u8; 16],
    pub xmm7: [u8; 16],
    pub xmm8: [u8; 16],
    pub xmm9: [u8; 16],
    pub xmm10: [u8; 16],
    pub xmm11: [u8; 16],
    pub xmm12: [u8; 16],
    pub xmm13: [u8; 16],
    pub xmm14: [u8; 16],
    pub xmm15: [u8; 16],
    pub mxcsr: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

#[rustfmt::skip]
static REGS: &[RegEntry] = cpu_regs! {
    X86_64Context {
        "rax"    => rax:    8, 8;
        "rbx"    => rbx:    8, 8;
        "rcx"    => rcx:    8, 8;
        "rdx"    => rdx:    8, 8;
        "rsi"    => rsi:    8, 8;
        "rdi"    => rdi:    8, 8;
        "rbp"    => rbp:    8, 8;
        "rsp"    => rsp:    8, 8;
        "r8"     => r8:     8, 8;
        "r9"     => r9:     8, 8;
        "r10"    => r10:    8, 8;
        "r11"    => r11:    8, 8;
        "r12"    => r12:    8, 8;
        "r13"    => r13:    8, 8;
        "r14"    => r14:    8, 8;
        "r15"    => r15:    8, 8;
        "rip"    => rip:    8, 8;
        "eflags" => eflags: 8, 4;
        "cs"     => cs:     4, 4;
        "ss"     => ss:     4, 4;
        "ds"     => ds:     4, 4;
        "es"     => es:     4, 4;
        "fs"     => fs:     4, 4;
        "gs"     => gs:     4, 4;
        "st0"    => st0:   16, 10;
        "st1"    => st1:   16, 10;
        "st2"    => st2:   16, 10;
        "st3"    => st3:   16, 10;
        "st4"    => st4:   16, 10;
        "st5"    => st5:   16, 10;
        "st6"    => st6:   16, 10;
        "st7"    => st7:   16, 10;
        "fctrl"  => fctrl:  4, 4;
        "fstat"  => fstat:  4, 4;
        "ftag"   => ftag:   4, 4;
        "fiseg"  => fiseg:  4, 4;
        "fioff"  => fioff:  4, 4;
        "foseg"  => foseg:  4, 4;
        "fooff"  => fooff:  4, 4;
        "fop"    => fop:    4, 4;
        "xmm0"   => xmm0:  16, 16;
        "xmm1"   => xmm1:  16, 16;
        "xmm2"   => xmm2:  16, 16;
        "xmm3"   => xmm3:  16, 16;
        "xmm4"   => xmm4:  16, 16;
        "xmm5"   => xmm5:  16, 16;
        "xmm6"   => xmm6:  16, 16;
        "xmm7"   => xmm7:  16, 16;
        "xmm8"   => xmm8:  16, 16;
        "xmm9"   => xmm9:  16, 16;
        "xmm10"  => xmm10: 16, 16;
        "xmm11"  => xmm11: 16, 16;
        "xmm12"  => xmm12: 16, 16;
        "xmm13"  => xmm13: 16, 16;
        "xmm14"  => xmm14: 16, 16;
        "xmm15"  => xmm15: 16, 16;
        "mxcsr"  => mxcsr:  4, 4;
    }
};

/// Debug-register offsets inside [`X86_64Context`], dr0-dr3 then dr6/dr7.
#[rustfmt::skip]
pub const DR_OFFSETS: [usize; 6] = [
    core::mem::offset_of!(X86_64Context, dr0),
    core::mem::offset_of!(X86_64Context, dr1),
    core::mem::offset_of!(X86_64Context, dr2),
    core::mem::offset_of!(X86_64Context, dr3),
    core::mem::offset_of!(X86_64Context, dr6),
    core::mem::offset_of!(X86_64Context, dr7),
];

pub struct X86_64;

impl Cpu for X86_64 {
    fn name(&self) -> &'static str {
        "i386:x86-64"
    }

    fn regs(&self) -> &'static [RegEntry] {
        REGS
    }

    fn context_size(&self) -> usize {
        core::mem::size_of::<X86_64Context>()
    }

    fn get_addr(&self, ctx: &[u8], kind: AddrKind) -> u64 {
        let offset = match kind {
            AddrKind::Pc => core::mem::offset_of!(X86_64Context, rip),
            AddrKind::Frame => core::mem::offset_of!(X86_64Context, rbp),
            AddrKind::Stack => core::mem::offset_of!(X86_64Context, rsp),
        };
        ctx_get(ctx, offset, 8)
    }

    fn set_pc(&self, ctx: &mut [u8], pc: u64) {
        ctx_set(ctx, core::mem::offset_of!(X86_64Context, rip), 8, pc);
    }

    fn single_step(&self, ctx: &mut [u8], enable: bool) -> Result<(), CpuError> {
        let offset = core::mem::offset_of!(X86_64Context, eflags);
        let mut eflags = ctx_get(ctx, offset, 8);
        if enable {
            eflags |= EFLAGS_TF;
        } else {
            eflags &= !EFLAGS_TF;
        }
        ctx_set(ctx, offset, 8, eflags);
        Ok(())
    }

    fn sw_break_insn(&self) -> &'static [u8] {
        &[0xcc]
    }

    fn pc_bias_after_break(&self) -> i64 {
        -1
    }

    fn watch_slots(&self) -> usize {
        HW_SLOTS
    }

    fn encode_watch(
        &self,
        ctx: &mut [u8],
        slot: usize,
        kind: XpointKind,
        addr: u64,
        len: u64,
    ) -> Result<(), CpuError> {
        let dr7 = dr7_enable(ctx_get(ctx, DR_OFFSETS[5], 8), slot, kind, len, true)?;
        ctx_set(ctx, DR_OFFSETS[slot], 8, addr);
        ctx_set(ctx, DR_OFFSETS[5], 8, dr7);
        Ok(())
    }

    fn clear_watch(&self, ctx: &mut [u8], slot: usize) -> Result<(), CpuError> {
        if slot >= HW_SLOTS {
            return Err(CpuError::BadSlot(slot));
        }
        let dr7 = dr7_disable(ctx_get(ctx, DR_OFFSETS[5], 8), slot);
        ctx_set(ctx, DR_OFFSETS[slot], 8, 0);
        ctx_set(ctx, DR_OFFSETS[5], 8, dr7);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_flag_toggles() {
        let cpu = X86_64;
        let mut ctx = vec![0u8; cpu.context_size()];

        cpu.single_step(&mut ctx, true).unwrap();
        let eflags = ctx_get(&ctx, core::mem::offset_of!(X86_64Context, eflags), 8);
        assert_eq!(eflags & EFLAGS_TF, EFLAGS_TF);

        cpu.single_step(&mut ctx, false).unwrap();
        let eflags = ctx_get(&ctx, core::mem::offset_of!(X86_64Context, eflags), 8);
        assert_eq!(eflags & EFLAGS_TF, 0);
    }

    #[test]
    fn watch_encode_sets_address_and_control() {
        let cpu = X86_64;
        let mut ctx = vec![0u8; cpu.context_size()];

        cpu.encode_watch(&mut ctx, 0, XpointKind::WatchWrite, 0xdead_f000, 4)
            .unwrap();
        assert_eq!(ctx_get(&ctx, DR_OFFSETS[0], 8), 0xdead_f000);
        assert_ne!(ctx_get(&ctx, DR_OFFSETS[5], 8) & 1, 0);

        cpu.clear_watch(&mut ctx, 0).unwrap();
        assert_eq!(ctx_get(&ctx, DR_OFFSETS[0], 8), 0);
        assert_eq!(ctx_get(&ctx, DR_OFFSETS[5], 8) & 1, 0);
    }

    #[test]
    fn g_packet_wire_length() {
        // 16 gprs + rip at 8 bytes, eflags + 6 segments at 4, 8 x87 at
        // 10, 8 fpu words at 4, 16 xmm at 16, mxcsr at 4
        let wire: usize = REGS.iter().map(|r| r.wire_size).sum();
        assert_eq!(wire, 17 * 8 + 7 * 4 + 8 * 10 + 8 * 4 + 16 * 16 + 4);
    }
}
