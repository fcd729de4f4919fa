//! End-to-end session tests: scripted packets in, raw reply bytes out,
//! against a mock debuggee with scripted events.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

use gdbridge::arch;
use gdbridge::arch::Cpu;
use gdbridge::common::Tid;
use gdbridge::conn::Connection;
use gdbridge::conn::ConnectionExt;
use gdbridge::debuggee::excpt;
use gdbridge::debuggee::DebugEvent;
use gdbridge::debuggee::DebuggeeError;
use gdbridge::debuggee::EventKind;
use gdbridge::debuggee::EventSource;
use gdbridge::debuggee::NoSymbols;
use gdbridge::debuggee::ProcessListing;
use gdbridge::debuggee::ResumeStatus;
use gdbridge::protocol::checksum;
use gdbridge::proxy::DisconnectReason;
use gdbridge::proxy::ProxyError;
use gdbridge::proxy::Session;

const EFLAGS_TF: u64 = 1 << 8;

/// Frame a payload as `$<payload>#<checksum>`.
fn pkt(payload: &str) -> Vec<u8> {
    let mut out = vec![b'$'];
    out.extend_from_slice(payload.as_bytes());
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", checksum(payload.as_bytes())).as_bytes());
    out
}

/// In-memory client: one inbound chunk per read, replies accumulated.
#[derive(Default)]
struct MockConn {
    input: VecDeque<Vec<u8>>,
    out: Vec<u8>,
}

impl MockConn {
    fn script(frames: &[Vec<u8>]) -> MockConn {
        MockConn {
            input: frames.iter().cloned().collect(),
            out: Vec::new(),
        }
    }

    fn out_str(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }
}

impl Connection for MockConn {
    type Error = std::io::Error;

    fn write(&mut self, byte: u8) -> Result<(), Self::Error> {
        self.out.push(byte);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ConnectionExt for MockConn {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.input.pop_front() {
            None => Ok(0), // hang up once the script runs dry
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
        }
    }

    fn data_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.input.is_empty())
    }
}

/// Scripted debuggee: flat memory window, per-thread contexts, queued
/// events.
struct MockDbg {
    cpu: &'static dyn Cpu,
    mem_base: u64,
    mem: Vec<u8>,
    contexts: HashMap<Tid, Vec<u8>>,
    events: VecDeque<DebugEvent>,
    suspended: HashSet<Tid>,
    suspend_calls: Vec<Tid>,
    step_armed: HashSet<Tid>,
    resume_calls: Vec<ResumeStatus>,
    killed: bool,
}

impl MockDbg {
    fn new(threads: &[Tid], events: &[DebugEvent]) -> MockDbg {
        let cpu = arch::lookup("i386").unwrap();
        let contexts = threads
            .iter()
            .map(|&tid| (tid, vec![0u8; cpu.context_size()]))
            .collect();
        MockDbg {
            cpu,
            mem_base: 0x1000,
            mem: vec![0xde, 0xad, 0xbe, 0xef],
            contexts,
            events: events.iter().cloned().collect(),
            suspended: HashSet::new(),
            suspend_calls: Vec::new(),
            step_armed: HashSet::new(),
            resume_calls: Vec::new(),
            killed: false,
        }
    }

    fn eflags(&self, tid: Tid) -> u64 {
        let entry = arch::find_reg(self.cpu.regs(), "eflags").unwrap();
        entry.get_u64(&self.contexts[&tid])
    }
}

impl EventSource for MockDbg {
    fn cpu(&self) -> &'static dyn Cpu {
        self.cpu
    }

    fn wait_event(&mut self, _timeout: Duration) -> Result<Option<DebugEvent>, DebuggeeError> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None => Err(DebuggeeError::Gone),
        }
    }

    fn resume(&mut self, status: ResumeStatus) -> Result<(), DebuggeeError> {
        self.resume_calls.push(status);
        Ok(())
    }

    fn suspend_thread(&mut self, tid: Tid) -> Result<(), DebuggeeError> {
        self.suspended.insert(tid);
        self.suspend_calls.push(tid);
        Ok(())
    }

    fn resume_thread(&mut self, tid: Tid) -> Result<(), DebuggeeError> {
        self.suspended.remove(&tid);
        Ok(())
    }

    fn break_in(&mut self) -> Result<(), DebuggeeError> {
        self.events.push_front(DebugEvent {
            tid: 5,
            kind: EventKind::Exception {
                code: excpt::DBG_CONTROL_C,
                address: 0,
                first_chance: true,
            },
        });
        Ok(())
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, DebuggeeError> {
        if addr < self.mem_base || addr >= self.mem_base + self.mem.len() as u64 {
            return Err(DebuggeeError::MemoryFault { addr });
        }
        let offset = (addr - self.mem_base) as usize;
        let n = buf.len().min(self.mem.len() - offset);
        buf[..n].copy_from_slice(&self.mem[offset..offset + n]);
        Ok(n)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), DebuggeeError> {
        if addr < self.mem_base
            || addr + data.len() as u64 > self.mem_base + self.mem.len() as u64
        {
            return Err(DebuggeeError::MemoryFault { addr });
        }
        let offset = (addr - self.mem_base) as usize;
        self.mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get_context(&mut self, tid: Tid, ctx: &mut [u8]) -> Result<(), DebuggeeError> {
        let stored = self.contexts.get(&tid).ok_or(DebuggeeError::NoThread(tid))?;
        ctx.copy_from_slice(stored);
        Ok(())
    }

    fn set_context(&mut self, tid: Tid, ctx: &[u8]) -> Result<(), DebuggeeError> {
        let entry = arch::find_reg(self.cpu.regs(), "eflags").unwrap();
        if entry.get_u64(ctx) & EFLAGS_TF != 0 {
            self.step_armed.insert(tid);
        }
        self.contexts
            .get_mut(&tid)
            .ok_or(DebuggeeError::NoThread(tid))?
            .copy_from_slice(ctx);
        Ok(())
    }

    fn processes(&mut self) -> Result<Vec<ProcessListing>, DebuggeeError> {
        Ok(vec![ProcessListing {
            pid: 99,
            threads: self.contexts.len(),
            name: "debuggee.exe".into(),
        }])
    }

    fn kill(&mut self) -> Result<(), DebuggeeError> {
        self.killed = true;
        Ok(())
    }

    fn detach(&mut self) -> Result<(), DebuggeeError> {
        Ok(())
    }
}

fn trap(tid: Tid) -> DebugEvent {
    DebugEvent {
        tid,
        kind: EventKind::Exception {
            code: excpt::SINGLE_STEP,
            address: 0,
            first_chance: true,
        },
    }
}

fn startup(tids: &[Tid]) -> Vec<DebugEvent> {
    let mut events = vec![DebugEvent {
        tid: tids[0],
        kind: EventKind::ProcessCreated {
            pid: 99,
            image_base: 0x40_0000,
            load_bias: 0,
        },
    }];
    for &tid in &tids[1..] {
        events.push(DebugEvent {
            tid,
            kind: EventKind::ThreadCreated,
        });
    }
    events.push(trap(tids[0]));
    events
}

/// Run a scripted session to client hang-up and return the output.
fn drive(dbg: &mut MockDbg, frames: &[Vec<u8>]) -> String {
    let mut conn = MockConn::script(frames);
    let mut session = Session::new(dbg, &NoSymbols);
    session.wait_initial_stop().unwrap();
    match session.run(&mut conn) {
        Err(ProxyError::ClientHangup) => {}
        other => panic!("session should end on hang-up, got {:?}", other.err()),
    }
    conn.out_str()
}

#[test]
fn question_mark_reports_trap_and_registers() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("?")]);

    assert!(out.starts_with("+$T05thread:5;"), "got: {}", out);
    // the register list follows as <index>:<bytes>; pairs
    assert!(out.contains(";0:00000000;"), "got: {}", out);
}

#[test]
fn memory_read_hexdumps_bytes() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("m1000,4")]);
    assert!(out.contains("$deadbeef#"), "got: {}", out);
}

#[test]
fn bad_checksum_is_acked_but_never_answered() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let mut conn = MockConn::script(&[b"$m1000,4#00".to_vec()]);
    let mut session = Session::new(&mut dbg, &NoSymbols);
    session.wait_initial_stop().unwrap();
    assert!(matches!(
        session.run(&mut conn),
        Err(ProxyError::ClientHangup)
    ));
    assert_eq!(conn.out_str(), "+");
}

#[test]
fn memory_read_partial_returns_bytes_without_error() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    // 4 mapped bytes at 0x1000; ask for 8
    let out = drive(&mut dbg, &[pkt("m1000,8")]);
    assert!(out.contains("$deadbeef#"), "got: {}", out);
    assert!(!out.contains("$E"), "got: {}", out);
}

#[test]
fn memory_read_fault_on_first_byte_is_an_error() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("m9000,4")]);
    assert!(out.contains("$E0e#"), "got: {}", out);
}

#[test]
fn memory_write_length_mismatch_rejected_before_writing() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("M1000,4:beef"), pkt("m1000,4")]);
    assert!(out.contains("$E16#"), "got: {}", out);
    // nothing was written
    assert!(out.contains("$deadbeef#"), "got: {}", out);
}

#[test]
fn breakpoint_roundtrip_saves_and_restores() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(
        &mut dbg,
        &[
            pkt("Z0,1000,1"),
            pkt("m1000,1"),
            pkt("z0,1000,1"),
            pkt("m1000,1"),
        ],
    );

    // trap opcode visible while inserted, original byte after removal
    assert!(out.contains("$cc#"), "got: {}", out);
    assert!(out.contains("$de#"), "got: {}", out);
    assert_eq!(dbg.mem, [0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn watchpoint_pool_is_four_slots_and_fails_loudly() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(
        &mut dbg,
        &[
            pkt("Z2,1000,4"),
            pkt("Z2,2000,4"),
            pkt("Z2,3000,4"),
            pkt("Z2,4000,4"),
            pkt("Z2,5000,4"), // pool exhausted
            pkt("z2,1000,4"),
            pkt("Z2,5000,4"), // fits again
        ],
    );

    let oks = out.matches("$OK#").count();
    assert_eq!(oks, 6, "got: {}", out);
    assert!(out.contains("$E1c#"), "got: {}", out);
}

#[test]
fn register_write_read_roundtrip() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    // eax is register 0 in the i386 map
    let out = drive(&mut dbg, &[pkt("P0=78563412"), pkt("p0")]);
    assert!(out.contains("$OK#"), "got: {}", out);
    assert!(out.contains("$78563412#"), "got: {}", out);
}

#[test]
fn register_index_out_of_range_is_an_error() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("p7f")]);
    assert!(out.contains("$E16#"), "got: {}", out);
}

#[test]
fn full_register_file_roundtrips_through_g_packets() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let wire_len: usize = dbg.cpu.regs().iter().map(|r| r.wire_size).sum();

    let hex: String = (0..wire_len)
        .map(|i| format!("{:02x}", (i % 251) as u8))
        .collect();
    let out = drive(&mut dbg, &[pkt(&format!("G{}", hex)), pkt("g")]);
    assert!(out.contains("$OK#"), "got: {}", out);
    assert!(out.contains(&format!("${}#", hex)), "got: {}", out);
}

#[test]
fn thread_selection_and_listing() {
    let mut dbg = MockDbg::new(&[5, 6, 7], &startup(&[5, 6, 7]));
    let out = drive(
        &mut dbg,
        &[
            pkt("qfThreadInfo"),
            pkt("qsThreadInfo"),
            pkt("Hg6"),
            pkt("qC"),
            pkt("T7"),
            pkt("T63"), // no thread 0x63
        ],
    );

    assert!(out.contains("$m5,6,7#"), "got: {}", out);
    assert!(out.contains("$l#"), "got: {}", out);
    assert!(out.contains("$QC6#"), "got: {}", out);
    assert!(out.contains("$E03#"), "got: {}", out);
}

#[test]
fn vcont_explicit_step_with_default_continue() {
    let mut events = startup(&[5, 6, 7]);
    events.push(trap(5)); // the stop after vCont
    let mut dbg = MockDbg::new(&[5, 6, 7], &events);

    let out = drive(&mut dbg, &[pkt("vCont;s:5;c")]);

    assert_eq!(dbg.step_armed, HashSet::from([5]));
    assert!(dbg.suspend_calls.is_empty(), "no thread may be held back");
    assert!(out.contains("$T05thread:5;"), "got: {}", out);
}

#[test]
fn vcont_without_default_suspends_unnamed_threads() {
    let mut events = startup(&[5, 6, 7]);
    events.push(trap(5));
    let mut dbg = MockDbg::new(&[5, 6, 7], &events);

    drive(&mut dbg, &[pkt("vCont;s:5")]);

    assert_eq!(dbg.step_armed, HashSet::from([5]));
    let mut held: Vec<Tid> = dbg.suspend_calls.clone();
    held.sort_unstable();
    assert_eq!(held, [6, 7], "each unnamed thread suspended exactly once");
    // suspensions are lifted once the stop is reported
    assert!(dbg.suspended.is_empty());
}

#[test]
fn vcont_with_two_defaults_is_rejected() {
    let mut dbg = MockDbg::new(&[5, 6], &startup(&[5, 6]));
    let out = drive(&mut dbg, &[pkt("vCont;c;c")]);
    assert!(out.contains("$E16#"), "got: {}", out);
}

#[test]
fn forced_signal_must_match_last_reported() {
    let mut events = startup(&[5]);
    events.push(trap(5));
    let mut dbg = MockDbg::new(&[5], &events);

    let out = drive(&mut dbg, &[pkt("C0b"), pkt("C05")]);

    // SIGSEGV (0b) does not match SIGTRAP; SIGTRAP resumes by handing
    // the exception back
    assert!(out.contains("$E16#"), "got: {}", out);
    assert_eq!(dbg.resume_calls.last(), Some(&ResumeStatus::PassException));
}

#[test]
fn continue_then_exit_reports_w_and_ends() {
    let mut events = startup(&[5]);
    events.push(DebugEvent {
        tid: 5,
        kind: EventKind::ProcessExited { code: 42 },
    });
    let mut dbg = MockDbg::new(&[5], &events);

    let mut conn = MockConn::script(&[pkt("c")]);
    let mut session = Session::new(&mut dbg, &NoSymbols);
    session.wait_initial_stop().unwrap();

    match session.run(&mut conn) {
        Ok(DisconnectReason::TargetExited(42)) => {}
        other => panic!("expected exit(42), got {:?}", other),
    }
    assert!(conn.out_str().contains("$W2a#"), "got: {}", conn.out_str());
}

#[test]
fn unknown_packet_gets_the_empty_reply() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("vMustReplyEmpty")]);
    assert!(out.contains("+$#00"), "got: {}", out);
}

#[test]
fn qsupported_advertises_packet_size_without_xml_on_x86() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let out = drive(&mut dbg, &[pkt("qSupported:multiprocess+;xmlRegisters=i386")]);
    assert!(out.contains("PacketSize=4000"), "got: {}", out);
    assert!(out.contains("vContSupported+"), "got: {}", out);
    // the i386 backend carries no target description blob
    assert!(!out.contains("qXfer:features:read+"), "got: {}", out);
}

#[test]
fn monitor_help_streams_console_output() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    // "help" hex-encoded
    let out = drive(&mut dbg, &[pkt("qRcmd,68656c70")]);
    // console lines are their own O packets, then the final OK
    assert!(out.contains("$O"), "got: {}", out);
    assert!(out.contains("$OK#"), "got: {}", out);
}

#[test]
fn kill_ends_the_session() {
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));
    let mut conn = MockConn::script(&[pkt("k")]);
    let mut session = Session::new(&mut dbg, &NoSymbols);
    session.wait_initial_stop().unwrap();

    match session.run(&mut conn) {
        Ok(DisconnectReason::Kill) => {}
        other => panic!("expected kill, got {:?}", other),
    }
    assert!(dbg.killed);
}

#[test]
fn interrupt_byte_forces_a_sigint_stop() {
    // no natural event after startup: the only stop comes from break_in
    let mut dbg = MockDbg::new(&[5], &startup(&[5]));

    let mut conn = MockConn::script(&[pkt("c"), vec![0x03]]);
    let mut session = Session::new(&mut dbg, &NoSymbols);
    session.wait_initial_stop().unwrap();
    let _ = session.run(&mut conn);

    assert!(
        conn.out_str().contains("$T02thread:5;"),
        "got: {}",
        conn.out_str()
    );
}
