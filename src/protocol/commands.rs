//! Two-stage command parse: a raw packet body is first matched on its
//! command prefix, then handed to that command's own parser, yielding
//! one variant of the [`Command`] enum. The dispatcher can then match
//! exhaustively instead of re-inspecting strings.

use crate::protocol::hex::decode_hex;
use crate::protocol::hex::decode_hex_buf;

macro_rules! prefix_match {
    (
        match $val:expr => [$rest:ident] {
            $($prefix:literal => $arm:block)*
            _ => $other:block
        }
    ) => {{
        let $rest;
        match $val {
            $(_ if $val.starts_with($prefix) => {
                $rest = &$val[$prefix.len()..];
                $arm
            })*
            _ => $other
        }
    }};
}

macro_rules! commands {
    ($($name:literal => $command:ident,)*) => {
        /// Every packet this proxy understands.
        #[allow(non_camel_case_types)]
        #[derive(Debug, PartialEq, Eq)]
        pub enum Command {
            $($command($command),)*
            Unknown(Vec<u8>),
        }

        impl Command {
            pub fn from_body(body: &[u8]) -> Result<Command, CommandParseError> {
                if body.is_empty() {
                    return Err(CommandParseError::Empty);
                }

                if !body.is_ascii() {
                    return Err(CommandParseError::NotAscii);
                }

                // body is all-ASCII at this point
                let body_str = core::str::from_utf8(body).map_err(|_| CommandParseError::NotAscii)?;

                let command = prefix_match! {
                    match body_str => [rest] {
                        $($name => {
                            let cmd = $command::try_from(rest)
                                .map_err(|_| CommandParseError::Malformed($name))?;
                            Command::$command(cmd)
                        })*
                        _ => { Command::Unknown(body.to_vec()) }
                    }
                };

                Ok(command)
            }
        }
    };
}

/// Command parse error.
#[derive(Debug)]
pub enum CommandParseError {
    Empty,
    NotAscii,
    /// A known command with arguments its parser rejected.
    Malformed(&'static str),
}

commands! {
    "?" => QuestionMark,
    "D" => D,
    "g" => g,
    "G" => G,
    "H" => H,
    "k" => k,
    "m" => m,
    "M" => M,
    "p" => p,
    "P" => P,
    "T" => T,
    "qC" => qC,
    "qfThreadInfo" => qfThreadInfo,
    "qsThreadInfo" => qsThreadInfo,
    "qOffsets" => qOffsets,
    "qRcmd," => qRcmd,
    "qSupported" => qSupported,
    "qXfer:features:read:" => qXferFeaturesRead,

    // order matters: longest prefix first
    "vCont?" => vContQuestionMark,
    "vCont" => vCont,

    "z" => z,
    "Z" => Z,
    "C" => C,
    "c" => c,
    "S" => S,
    "s" => s,
}

/// Parse an RSP thread id: hex digits, `0` for "any", `-1` for "all".
fn parse_thread_id(s: &str) -> Result<i64, ()> {
    if let Some(rest) = s.strip_prefix('-') {
        let v: i64 = decode_hex(rest.as_bytes()).map_err(drop)?;
        Ok(-v)
    } else {
        decode_hex(s.as_bytes()).map_err(drop)
    }
}

/// `sig[;addr]` suffix shared by `C` and `S`.
fn parse_sig_addr(body: &str) -> Result<(u8, Option<u64>), ()> {
    let mut parts = body.split(';');
    let sig = decode_hex(parts.next().ok_or(())?.as_bytes()).map_err(drop)?;
    let addr = match parts.next() {
        Some(s) => Some(decode_hex(s.as_bytes()).map_err(drop)?),
        None => None,
    };
    Ok((sig, addr))
}

macro_rules! unit_command {
    ($($name:ident,)*) => {$(
        #[allow(non_camel_case_types)]
        #[derive(Debug, PartialEq, Eq)]
        pub struct $name;

        impl TryFrom<&str> for $name {
            type Error = ();

            fn try_from(_body: &str) -> Result<Self, ()> {
                Ok($name)
            }
        }
    )*};
}

unit_command! {
    QuestionMark,
    g,
    k,
    qfThreadInfo,
    qsThreadInfo,
    qOffsets,
    vContQuestionMark,
}

/// `qC`: current thread query. The body must be empty so that
/// longer `qC...` packets (e.g. `qCRC`) fall through as unknown.
#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct qC;

impl TryFrom<&str> for qC {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        if body.is_empty() {
            Ok(qC)
        } else {
            Err(())
        }
    }
}

/// `D`: detach. GDB may append `;pid` in multiprocess mode.
#[derive(Debug, PartialEq, Eq)]
pub struct D;

impl TryFrom<&str> for D {
    type Error = ();

    fn try_from(_body: &str) -> Result<Self, ()> {
        Ok(D)
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct c {
    pub addr: Option<u64>,
}

impl TryFrom<&str> for c {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let addr = if body.is_empty() {
            None
        } else {
            Some(decode_hex(body.as_bytes()).map_err(drop)?)
        };
        Ok(c { addr })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct C {
    pub sig: u8,
    pub addr: Option<u64>,
}

impl TryFrom<&str> for C {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let (sig, addr) = parse_sig_addr(body)?;
        Ok(C { sig, addr })
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct s {
    pub addr: Option<u64>,
}

impl TryFrom<&str> for s {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let addr = if body.is_empty() {
            None
        } else {
            Some(decode_hex(body.as_bytes()).map_err(drop)?)
        };
        Ok(s { addr })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct S {
    pub sig: u8,
    pub addr: Option<u64>,
}

impl TryFrom<&str> for S {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let (sig, addr) = parse_sig_addr(body)?;
        Ok(S { sig, addr })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct G {
    pub vals: Vec<u8>,
}

impl TryFrom<&str> for G {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        Ok(G {
            vals: decode_hex_buf(body.as_bytes()).map_err(drop)?,
        })
    }
}

/// Which later operations an `H` packet selects the thread for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HOp {
    /// `Hc`: thread used by `c`/`s` style resumption.
    Exec,
    /// `Hg`: thread used by register/memory inspection.
    Other,
}

#[derive(Debug, PartialEq, Eq)]
pub struct H {
    pub op: HOp,
    pub id: i64,
}

impl TryFrom<&str> for H {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let op = match body.as_bytes().first() {
            Some(b'c') => HOp::Exec,
            Some(b'g') => HOp::Other,
            _ => return Err(()),
        };
        let id = parse_thread_id(&body[1..])?;
        Ok(H { op, id })
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct m {
    pub addr: u64,
    pub len: usize,
}

impl TryFrom<&str> for m {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let mut body = body.split(',');
        let addr = decode_hex(body.next().ok_or(())?.as_bytes()).map_err(drop)?;
        let len = decode_hex(body.next().ok_or(())?.as_bytes()).map_err(drop)?;
        Ok(m { addr, len })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct M {
    pub addr: u64,
    pub len: usize,
    pub vals: Vec<u8>,
}

impl TryFrom<&str> for M {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let (header, payload) = body.split_once(':').ok_or(())?;
        let mut header = header.split(',');
        let addr = decode_hex(header.next().ok_or(())?.as_bytes()).map_err(drop)?;
        let len = decode_hex(header.next().ok_or(())?.as_bytes()).map_err(drop)?;
        let vals = decode_hex_buf(payload.as_bytes()).map_err(drop)?;
        Ok(M { addr, len, vals })
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct p {
    pub reg: usize,
}

impl TryFrom<&str> for p {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        Ok(p {
            reg: decode_hex(body.as_bytes()).map_err(drop)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct P {
    pub reg: usize,
    pub vals: Vec<u8>,
}

impl TryFrom<&str> for P {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let (reg, payload) = body.split_once('=').ok_or(())?;
        Ok(P {
            reg: decode_hex(reg.as_bytes()).map_err(drop)?,
            vals: decode_hex_buf(payload.as_bytes()).map_err(drop)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct T {
    pub id: i64,
}

impl TryFrom<&str> for T {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        Ok(T {
            id: parse_thread_id(body)?,
        })
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct qRcmd {
    /// The monitor command, already hex-decoded.
    pub cmd: Vec<u8>,
}

impl TryFrom<&str> for qRcmd {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        Ok(qRcmd {
            cmd: decode_hex_buf(body.as_bytes()).map_err(drop)?,
        })
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct qSupported;

impl TryFrom<&str> for qSupported {
    type Error = ();

    fn try_from(_body: &str) -> Result<Self, ()> {
        // the client's feature list is informational; nothing in it
        // changes this proxy's behavior
        Ok(qSupported)
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct qXferFeaturesRead {
    pub annex: String,
    pub offset: usize,
    pub len: usize,
}

impl TryFrom<&str> for qXferFeaturesRead {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let (annex, range) = body.split_once(':').ok_or(())?;
        let (offset, len) = range.split_once(',').ok_or(())?;
        Ok(qXferFeaturesRead {
            annex: annex.to_owned(),
            offset: decode_hex(offset.as_bytes()).map_err(drop)?,
            len: decode_hex(len.as_bytes()).map_err(drop)?,
        })
    }
}

/// One action from a `vCont` packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VContKind {
    Continue,
    ContinueWithSig(u8),
    Step,
    StepWithSig(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VContAction {
    pub kind: VContKind,
    /// `None` marks the packet's default action.
    pub tid: Option<i64>,
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct vCont {
    pub actions: Vec<VContAction>,
}

impl TryFrom<&str> for vCont {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let mut actions = Vec::new();

        for act in body.split(';').skip(1) {
            let (kind, tid) = match act.split_once(':') {
                Some((kind, tid)) => (kind, Some(parse_thread_id(tid)?)),
                None => (act, None),
            };

            let kind = match kind.as_bytes() {
                [b'c'] => VContKind::Continue,
                [b's'] => VContKind::Step,
                [b'C', sig @ ..] => VContKind::ContinueWithSig(decode_hex(sig).map_err(drop)?),
                [b'S', sig @ ..] => VContKind::StepWithSig(decode_hex(sig).map_err(drop)?),
                _ => return Err(()),
            };

            actions.push(VContAction { kind, tid });
        }

        if actions.is_empty() {
            return Err(());
        }

        Ok(vCont { actions })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct XpointCmd {
    pub type_: u8,
    pub addr: u64,
    pub kind: u64,
}

impl TryFrom<&str> for XpointCmd {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        let mut body = body.split(',');
        let type_ = decode_hex(body.next().ok_or(())?.as_bytes()).map_err(drop)?;
        let addr = decode_hex(body.next().ok_or(())?.as_bytes()).map_err(drop)?;
        let kind = decode_hex(body.next().ok_or(())?.as_bytes()).map_err(drop)?;
        Ok(XpointCmd { type_, addr, kind })
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq)]
pub struct z(pub XpointCmd);

impl TryFrom<&str> for z {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        XpointCmd::try_from(body).map(z)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Z(pub XpointCmd);

impl TryFrom<&str> for Z {
    type Error = ();

    fn try_from(body: &str) -> Result<Self, ()> {
        XpointCmd::try_from(body).map(Z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_read() {
        match Command::from_body(b"m1000,4").unwrap() {
            Command::m(cmd) => assert_eq!(cmd, m { addr: 0x1000, len: 4 }),
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn parses_memory_write_with_payload() {
        match Command::from_body(b"M20c0,2:beef").unwrap() {
            Command::M(cmd) => {
                assert_eq!(cmd.addr, 0x20c0);
                assert_eq!(cmd.len, 2);
                assert_eq!(cmd.vals, [0xbe, 0xef]);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn parses_h_selectors() {
        assert_eq!(
            Command::from_body(b"Hc-1").unwrap(),
            Command::H(H {
                op: HOp::Exec,
                id: -1
            })
        );
        assert_eq!(
            Command::from_body(b"Hg1a2").unwrap(),
            Command::H(H {
                op: HOp::Other,
                id: 0x1a2
            })
        );
    }

    #[test]
    fn malformed_vcont_action_is_rejected() {
        assert!(matches!(
            Command::from_body(b"vCont;Ss05:7;c"),
            Err(CommandParseError::Malformed("vCont"))
        ));
    }

    #[test]
    fn parses_vcont_step_with_default() {
        match Command::from_body(b"vCont;s:5;c").unwrap() {
            Command::vCont(cmd) => {
                assert_eq!(cmd.actions.len(), 2);
                assert_eq!(
                    cmd.actions[0],
                    VContAction {
                        kind: VContKind::Step,
                        tid: Some(5)
                    }
                );
                assert_eq!(
                    cmd.actions[1],
                    VContAction {
                        kind: VContKind::Continue,
                        tid: None
                    }
                );
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn vcont_query_wins_over_vcont() {
        assert_eq!(
            Command::from_body(b"vCont?").unwrap(),
            Command::vContQuestionMark(vContQuestionMark)
        );
    }

    #[test]
    fn parses_xpoint_insert() {
        match Command::from_body(b"Z0,40001000,1").unwrap() {
            Command::Z(Z(cmd)) => {
                assert_eq!(cmd.type_, 0);
                assert_eq!(cmd.addr, 0x4000_1000);
                assert_eq!(cmd.kind, 1);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_preserved() {
        match Command::from_body(b"vMustReplyEmpty").unwrap() {
            Command::Unknown(raw) => assert_eq!(raw, b"vMustReplyEmpty"),
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn continue_with_signal() {
        assert_eq!(
            Command::from_body(b"C05").unwrap(),
            Command::C(C {
                sig: 5,
                addr: None
            })
        );
    }
}
