//! The per-architecture CPU backend.
//!
//! Each backend is a stateless singleton exposing an immutable register
//! map plus the handful of operations the rest of the proxy needs:
//! context field access, trap-flag toggling, breakpoint opcodes and
//! hardware watchpoint encoding. Everything above this layer is
//! architecture-agnostic; in particular the packet engine sizes and
//! orders `g`/`G` packets purely from the register map and never
//! computes context offsets itself.

use thiserror::Error;

macro_rules! cpu_regs {
    ($ctx:ty { $($name:literal => $field:ident : $native:expr, $wire:expr;)* }) => {
        &[$(
            $crate::arch::RegEntry {
                name: $name,
                offset: core::mem::offset_of!($ctx, $field),
                native_size: $native,
                wire_size: $wire,
            },
        )*]
    };
}

pub mod aarch64;
pub mod arm;
pub mod i386;
pub mod x86_64;

/// One row of an architecture's register map.
///
/// `offset`/`native_size` locate the register inside the native context
/// snapshot; `wire_size` is how many bytes of it travel in `g`/`G`/`p`/`P`
/// packets. Invariant: `wire_size <= native_size`. When the two differ
/// (x87 registers: 16-byte native slots, 10-byte wire format) the codec
/// must move bytes one at a time from the low end, never as a
/// fixed-width integer copy.
#[derive(Debug, Copy, Clone)]
pub struct RegEntry {
    pub name: &'static str,
    pub offset: usize,
    pub native_size: usize,
    pub wire_size: usize,
}

impl RegEntry {
    /// The register's wire-format bytes, taken from the low end of its
    /// native (little-endian) storage.
    pub fn wire_bytes<'a>(&self, ctx: &'a [u8]) -> &'a [u8] {
        &ctx[self.offset..self.offset + self.wire_size]
    }

    /// Store wire-format bytes back. Bytes beyond the wire width keep
    /// their native value.
    pub fn set_wire_bytes(&self, ctx: &mut [u8], vals: &[u8]) {
        let n = vals.len().min(self.wire_size);
        ctx[self.offset..self.offset + n].copy_from_slice(&vals[..n]);
    }

    /// Read the register as an integer (up to 8 low bytes).
    pub fn get_u64(&self, ctx: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        let n = self.native_size.min(8);
        bytes[..n].copy_from_slice(&ctx[self.offset..self.offset + n]);
        u64::from_le_bytes(bytes)
    }

    /// Overwrite the register from an integer (up to 8 low bytes).
    pub fn set_u64(&self, ctx: &mut [u8], val: u64) {
        let n = self.native_size.min(8);
        ctx[self.offset..self.offset + n].copy_from_slice(&val.to_le_bytes()[..n]);
    }
}

/// Linear addresses a backend can pull out of a context snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddrKind {
    Pc,
    Frame,
    Stack,
}

/// What an xpoint traps on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum XpointKind {
    /// Software code breakpoint (patched trap instruction).
    Code,
    /// Hardware execute watchpoint.
    WatchExec,
    /// Hardware read watchpoint.
    WatchRead,
    /// Hardware write watchpoint.
    WatchWrite,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuError {
    #[error("operation not supported on {0}")]
    Unsupported(&'static str),
    #[error("invalid watchpoint length {0}")]
    BadLength(u64),
    #[error("debug register slot {0} out of range")]
    BadSlot(usize),
}

/// Number of hardware debug-register slots on the x86 family.
pub const HW_SLOTS: usize = 4;

/// Explicit arena over the hardware debug-register slots.
///
/// Allocation failure here is the "pool exhausted" error path the
/// dispatcher reports; it never fails silently.
#[derive(Debug, Default, Copy, Clone)]
pub struct DrPool {
    used: u8,
}

impl DrPool {
    pub fn new() -> DrPool {
        DrPool::default()
    }

    /// Claim a free slot, lowest index first.
    pub fn alloc(&mut self) -> Option<usize> {
        (0..HW_SLOTS).find(|&slot| {
            let free = self.used & (1 << slot) == 0;
            if free {
                self.used |= 1 << slot;
            }
            free
        })
    }

    pub fn free(&mut self, slot: usize) {
        self.used &= !(1 << slot);
    }

    pub fn is_used(&self, slot: usize) -> bool {
        self.used & (1 << slot) != 0
    }
}

/// An architecture backend. Stateless; per-session state (saved
/// breakpoint bytes, the slot pool) lives with the session's xpoint
/// table.
pub trait Cpu: Sync {
    /// Architecture name as spelled in GDB target descriptions.
    fn name(&self) -> &'static str;

    /// The register map, in `g`-packet order.
    fn regs(&self) -> &'static [RegEntry];

    /// Size in bytes of a native context snapshot.
    fn context_size(&self) -> usize;

    /// Pull a linear address out of a context snapshot.
    fn get_addr(&self, ctx: &[u8], kind: AddrKind) -> u64;

    /// Overwrite the program counter.
    fn set_pc(&self, ctx: &mut [u8], pc: u64);

    /// Toggle the single-step trap flag.
    fn single_step(&self, ctx: &mut [u8], enable: bool) -> Result<(), CpuError>;

    /// The trap instruction patched in by software breakpoints.
    fn sw_break_insn(&self) -> &'static [u8];

    /// Correction to apply to the reported PC after a software
    /// breakpoint trap: x86 reports one byte past the break site.
    fn pc_bias_after_break(&self) -> i64;

    /// Number of hardware watchpoint slots (0 = no hardware support).
    fn watch_slots(&self) -> usize {
        0
    }

    /// Encode a watchpoint into `slot` inside the context's debug
    /// registers.
    fn encode_watch(
        &self,
        ctx: &mut [u8],
        slot: usize,
        kind: XpointKind,
        addr: u64,
        len: u64,
    ) -> Result<(), CpuError>;

    /// Clear a previously encoded watchpoint slot.
    fn clear_watch(&self, ctx: &mut [u8], slot: usize) -> Result<(), CpuError>;

    /// Target description blob, when one exists for this architecture.
    /// Gates the `qXfer:features:read` advertisement.
    fn target_xml(&self) -> Option<&'static str> {
        None
    }
}

/// Read a little-endian context field of up to 8 bytes.
pub(crate) fn ctx_get(ctx: &[u8], offset: usize, size: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..size].copy_from_slice(&ctx[offset..offset + size]);
    u64::from_le_bytes(bytes)
}

/// Overwrite a little-endian context field of up to 8 bytes.
pub(crate) fn ctx_set(ctx: &mut [u8], offset: usize, size: usize, val: u64) {
    ctx[offset..offset + size].copy_from_slice(&val.to_le_bytes()[..size]);
}

/// Find a register-map entry by symbolic name.
pub fn find_reg(map: &'static [RegEntry], name: &str) -> Option<&'static RegEntry> {
    map.iter().find(|r| r.name == name)
}

/// Look up a backend by architecture name.
pub fn lookup(name: &str) -> Option<&'static dyn Cpu> {
    match name {
        "i386:x86-64" | "x86_64" | "x86-64" => Some(&x86_64::X86_64),
        "i386" | "x86" => Some(&i386::I386),
        "arm" | "armv7" => Some(&arm::Arm),
        "aarch64" | "arm64" => Some(&aarch64::AArch64),
        _ => None,
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The backend matching the host this proxy was built for.
        pub fn host() -> &'static dyn Cpu {
            &x86_64::X86_64
        }
    } else if #[cfg(target_arch = "x86")] {
        /// The backend matching the host this proxy was built for.
        pub fn host() -> &'static dyn Cpu {
            &i386::I386
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// The backend matching the host this proxy was built for.
        pub fn host() -> &'static dyn Cpu {
            &aarch64::AArch64
        }
    } else {
        /// The backend matching the host this proxy was built for.
        pub fn host() -> &'static dyn Cpu {
            &arm::Arm
        }
    }
}

bitflags::bitflags! {
    /// Static DR7 control bits (the per-slot enable/condition/length
    /// fields are computed, not named).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct Dr7: u64 {
        const LOCAL_EXACT  = 1 << 8;
        const GLOBAL_EXACT = 1 << 9;
    }
}

/// Set slot `slot` of a DR7 value to trap on `kind` accesses of `len`
/// bytes. Shared by both x86-family backends.
pub(crate) fn dr7_enable(
    dr7: u64,
    slot: usize,
    kind: XpointKind,
    len: u64,
    allow_len8: bool,
) -> Result<u64, CpuError> {
    if slot >= HW_SLOTS {
        return Err(CpuError::BadSlot(slot));
    }

    let rw_bits: u64 = match kind {
        // exec breakpoints must use length 1
        XpointKind::WatchExec => {
            if len != 1 {
                return Err(CpuError::BadLength(len));
            }
            0b00
        }
        XpointKind::WatchWrite => 0b01,
        // the x86 family cannot trap reads alone; read-write is the
        // closest condition
        XpointKind::WatchRead => 0b11,
        XpointKind::Code => return Err(CpuError::Unsupported("code xpoints use sw patching")),
    };

    let len_bits: u64 = match len {
        1 => 0b00,
        2 => 0b01,
        4 => 0b11,
        8 if allow_len8 => 0b10,
        other => return Err(CpuError::BadLength(other)),
    };

    let mut dr7 = dr7;
    dr7 |= 1 << (slot * 2); // local enable
    dr7 &= !(0b1111 << (16 + slot * 4));
    dr7 |= (rw_bits | (len_bits << 2)) << (16 + slot * 4);
    dr7 |= Dr7::LOCAL_EXACT.bits();
    Ok(dr7)
}

/// Clear slot `slot` of a DR7 value.
pub(crate) fn dr7_disable(dr7: u64, slot: usize) -> u64 {
    let mut dr7 = dr7;
    dr7 &= !(1 << (slot * 2));
    dr7 &= !(1 << (slot * 2 + 1));
    dr7 &= !(0b1111 << (16 + slot * 4));
    dr7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_each_slot_once() {
        let mut pool = DrPool::new();
        let slots: Vec<_> = (0..HW_SLOTS).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(slots, [0, 1, 2, 3]);
        assert_eq!(pool.alloc(), None);

        pool.free(2);
        assert_eq!(pool.alloc(), Some(2));
        assert_eq!(pool.alloc(), None);
    }

    #[test]
    fn dr7_roundtrip() {
        let dr7 = dr7_enable(0, 1, XpointKind::WatchWrite, 4, true).unwrap();
        assert_ne!(dr7 & (1 << 2), 0); // L1 set
        assert_eq!((dr7 >> 20) & 0b1111, 0b1101); // len=4, rw=write

        let dr7 = dr7_disable(dr7, 1);
        assert_eq!(dr7 & (1 << 2), 0);
        assert_eq!((dr7 >> 20) & 0b1111, 0);
    }

    #[test]
    fn dr7_rejects_odd_lengths() {
        assert_eq!(
            dr7_enable(0, 0, XpointKind::WatchWrite, 3, true),
            Err(CpuError::BadLength(3))
        );
        assert_eq!(
            dr7_enable(0, 0, XpointKind::WatchWrite, 8, false),
            Err(CpuError::BadLength(8))
        );
    }

    #[test]
    fn wire_roundtrip_every_entry() {
        for cpu in [
            lookup("x86_64").unwrap(),
            lookup("i386").unwrap(),
            lookup("arm").unwrap(),
            lookup("aarch64").unwrap(),
        ] {
            let mut ctx = vec![0u8; cpu.context_size()];
            for reg in cpu.regs() {
                let pattern: Vec<u8> = (0..reg.wire_size as u8).map(|i| i.wrapping_add(1)).collect();
                reg.set_wire_bytes(&mut ctx, &pattern);
                assert_eq!(
                    reg.wire_bytes(&ctx),
                    pattern.as_slice(),
                    "{}: {} does not round-trip",
                    cpu.name(),
                    reg.name
                );
            }
        }
    }

    #[test]
    fn every_backend_keeps_wire_within_native() {
        for cpu in [
            lookup("x86_64").unwrap(),
            lookup("i386").unwrap(),
            lookup("arm").unwrap(),
            lookup("aarch64").unwrap(),
        ] {
            for reg in cpu.regs() {
                assert!(
                    reg.wire_size <= reg.native_size,
                    "{}: {} wire {} > native {}",
                    cpu.name(),
                    reg.name,
                    reg.wire_size,
                    reg.native_size
                );
                assert!(reg.offset + reg.native_size <= cpu.context_size());
            }
        }
    }
}
