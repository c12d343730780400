pub mod hickory;
#[cfg(test)]
pub(crate) mod testing;

use std::{fmt, io, os::fd::RawFd};

pub const RR_TYPE_A: u16 = 1;
pub const RR_TYPE_AAAA: u16 = 28;
pub const RR_CLASS_IN: u16 = 1;

/// Status codes an engine reports for rejected options, rejected queries and
/// failed resolutions. Zero is success.
pub mod status {
    pub const SOCKET: i32 = -1;
    pub const NOMEM: i32 = -2;
    pub const SYNTAX: i32 = -3;
    pub const SERVFAIL: i32 = -4;
    pub const AFTER_FINAL: i32 = -6;
    pub const INIT_FAIL: i32 = -7;
    pub const PIPE: i32 = -8;
    pub const NO_ID: i32 = -10;

    pub fn name(code: i32) -> Option<&'static str> {
        Some(match code {
            0 => "no error",
            SOCKET => "socket error",
            NOMEM => "out of memory",
            SYNTAX => "syntax error",
            SERVFAIL => "server failure",
            AFTER_FINAL => "setting change after finalize",
            INIT_FAIL => "initialization failed",
            PIPE => "pipe error",
            NO_ID => "unknown query id",
            _ => return None,
        })
    }
}

/// Identifier an engine hands out for one in-flight query.
///
/// Engines never hand out [`QueryId::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u32);

impl QueryId {
    pub const NONE: QueryId = QueryId(0);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the engine knows about a finished query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResult {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Rdata of each answer record, in the order the engine received them.
    pub data: Vec<Vec<u8>>,
    pub canonname: Option<String>,
    pub rcode: u16,
    pub has_data: bool,
    pub nxdomain: bool,
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: QueryId,
    pub status: i32,
    pub result: Option<RawResult>,
}

/// The capability the resolver needs from an external resolution engine.
///
/// Creating the engine is allocating its context; dropping it destroys the
/// context and every query still pending in it.
pub trait Engine {
    /// Sets a configuration option. Names carry their trailing colon, as in
    /// `"msg-cache-size:"`. Returns the engine status code on rejection.
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), i32>;

    /// The descriptor whose read readiness means completions are waiting.
    fn readiness_fd(&self) -> RawFd;

    /// Schedules a lookup. Never delivers the completion before returning.
    fn resolve_async(&mut self, name: &str, rrtype: u16, rrclass: u16) -> Result<QueryId, i32>;

    fn cancel(&mut self, id: QueryId) -> Result<(), i32>;

    /// Services the readiness descriptor until it would block and hands every
    /// completion that is due to `deliver`.
    fn process(&mut self, deliver: &mut dyn FnMut(Completion)) -> io::Result<()>;
}
