//! `gdbridge` lets an unmodified GDB client debug a live process that
//! is controlled through a native debug-event interface, by translating
//! between that interface and the GDB Remote Serial Protocol over TCP.
//!
//! The pieces, wired together by [`transport::serve`]:
//!
//! - [`protocol`]: the packet engine: framing, checksums, command
//!   parsing, incremental reply construction;
//! - [`proxy`]: the per-session dispatcher and resume state machine;
//! - [`arch`]: the per-architecture register/breakpoint backends
//!   (x86-64, i386, ARM, AArch64) behind one `Cpu` trait;
//! - [`debuggee`]: the native event model and the [`debuggee::EventSource`]
//!   collaborator trait a concrete execution environment implements
//!   (a Linux ptrace adapter ships in-tree);
//! - [`conn`]: byte-wise transport traits, implemented for `TcpStream`.
//!
//! The proxy never prints prose to the client: everything it says is
//! RSP-encoded, and everything a human should see goes through `log`.

pub mod arch;
pub mod common;
pub mod conn;
pub mod debuggee;
pub mod errno;
pub mod protocol;
pub mod proxy;
pub mod transport;
