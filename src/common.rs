//! Common types shared across the proxy.

/// Native process id of the debuggee.
pub type Pid = u32;

/// Native thread id within the debuggee.
pub type Tid = u32;

/// Signal numbers as defined by the GDB Remote Serial Protocol.
///
/// The protocol uses its own cross-platform numbering (transcribed from
/// `include/gdb/signals.def` in the GDB sources), which does not always
/// line up with the host's `signal.h`. Only the signals this proxy can
/// actually report are named here.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u8);

#[rustfmt::skip]
impl Signal {
    #[doc = "Hangup"]                pub const SIGHUP:  Self = Self(1);
    #[doc = "Interrupt"]             pub const SIGINT:  Self = Self(2);
    #[doc = "Illegal instruction"]   pub const SIGILL:  Self = Self(4);
    #[doc = "Trace/breakpoint trap"] pub const SIGTRAP: Self = Self(5);
    #[doc = "Aborted"]               pub const SIGABRT: Self = Self(6);
    #[doc = "Arithmetic exception"]  pub const SIGFPE:  Self = Self(8);
    #[doc = "Killed"]                pub const SIGKILL: Self = Self(9);
    #[doc = "Bus error"]             pub const SIGBUS:  Self = Self(10);
    #[doc = "Segmentation fault"]    pub const SIGSEGV: Self = Self(11);
    #[doc = "Alarm clock"]           pub const SIGALRM: Self = Self(14);
    #[doc = "Terminated"]            pub const SIGTERM: Self = Self(15);
    #[doc = "Stopped (signal)"]      pub const SIGSTOP: Self = Self(17);
}

impl core::fmt::Display for Signal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Signal::SIGHUP => "SIGHUP",
            Signal::SIGINT => "SIGINT",
            Signal::SIGILL => "SIGILL",
            Signal::SIGTRAP => "SIGTRAP",
            Signal::SIGABRT => "SIGABRT",
            Signal::SIGFPE => "SIGFPE",
            Signal::SIGKILL => "SIGKILL",
            Signal::SIGBUS => "SIGBUS",
            Signal::SIGSEGV => "SIGSEGV",
            Signal::SIGALRM => "SIGALRM",
            Signal::SIGTERM => "SIGTERM",
            Signal::SIGSTOP => "SIGSTOP",
            _ => return write!(f, "signal {}", self.0),
        };
        f.write_str(name)
    }
}
