use super::{status, Completion, Engine, QueryId, RawResult, RR_CLASS_IN, RR_TYPE_A};
use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Ipv4Addr, Shutdown},
    os::{fd::AsRawFd, fd::RawFd, unix::net::UnixStream},
    rc::Rc,
};

/// An engine whose completions are scripted by the test through a
/// [`ScriptHandle`].
pub struct ScriptedEngine {
    state: Rc<RefCell<State>>,
    reader: UnixStream,
}

#[derive(Default)]
struct State {
    options: Vec<(String, String)>,
    rejected_options: Vec<(String, i32)>,
    reject_next: Option<i32>,
    reuse_id: Option<QueryId>,
    next_id: u32,
    pending: Vec<(QueryId, String)>,
    ready: VecDeque<Completion>,
    cancelled: Vec<QueryId>,
    process_calls: usize,
}

#[derive(Clone)]
pub struct ScriptHandle {
    state: Rc<RefCell<State>>,
    writer: Rc<UnixStream>,
}

impl ScriptedEngine {
    pub fn new() -> io::Result<(Self, ScriptHandle)> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        let state = Rc::new(RefCell::new(State {
            next_id: 1,
            ..Default::default()
        }));

        Ok((
            Self {
                state: state.clone(),
                reader,
            },
            ScriptHandle {
                state,
                writer: Rc::new(writer),
            },
        ))
    }
}

impl Engine for ScriptedEngine {
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), i32> {
        let mut state = self.state.borrow_mut();
        if let Some((_, code)) = state.rejected_options.iter().find(|(n, _)| n == name) {
            return Err(*code);
        }
        state.options.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    fn readiness_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    fn resolve_async(&mut self, name: &str, rrtype: u16, rrclass: u16) -> Result<QueryId, i32> {
        assert_eq!((rrtype, rrclass), (RR_TYPE_A, RR_CLASS_IN));

        let mut state = self.state.borrow_mut();
        if let Some(code) = state.reject_next.take() {
            return Err(code);
        }

        let id = match state.reuse_id.take() {
            Some(id) => id,
            None => {
                state.next_id += 1;
                QueryId(state.next_id - 1)
            }
        };
        state.pending.push((id, name.to_owned()));
        Ok(id)
    }

    fn cancel(&mut self, id: QueryId) -> Result<(), i32> {
        let mut state = self.state.borrow_mut();
        match state.pending.iter().position(|(p, _)| *p == id) {
            Some(index) => {
                state.pending.remove(index);
                state.cancelled.push(id);
                Ok(())
            }
            None => Err(status::NO_ID),
        }
    }

    fn process(&mut self, deliver: &mut dyn FnMut(Completion)) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        let ready: Vec<Completion> = {
            let mut state = self.state.borrow_mut();
            state.process_calls += 1;
            state.ready.drain(..).collect()
        };

        for completion in ready {
            deliver(completion);
        }

        Ok(())
    }
}

impl ScriptHandle {
    pub fn reject_next(&self, code: i32) {
        self.state.borrow_mut().reject_next = Some(code);
    }

    /// Hands out `id` for the next query even if it is still in use.
    pub fn reuse_id(&self, id: QueryId) {
        self.state.borrow_mut().reuse_id = Some(id);
    }

    pub fn reject_option(&self, name: &str, code: i32) {
        self.state
            .borrow_mut()
            .rejected_options
            .push((name.to_owned(), code));
    }

    pub fn options(&self) -> Vec<(String, String)> {
        self.state.borrow().options.clone()
    }

    pub fn pending(&self) -> Vec<(QueryId, String)> {
        self.state.borrow().pending.clone()
    }

    pub fn cancelled(&self) -> Vec<QueryId> {
        self.state.borrow().cancelled.clone()
    }

    pub fn process_calls(&self) -> usize {
        self.state.borrow().process_calls
    }

    /// Queues a completion without signalling the readiness descriptor.
    pub fn queue(&self, id: QueryId, status: i32, result: Option<RawResult>) {
        let mut state = self.state.borrow_mut();
        state.pending.retain(|(p, _)| *p != id);
        state.ready.push_back(Completion { id, status, result });
    }

    /// Makes the readiness descriptor readable.
    pub fn signal(&self) {
        let _ = (&*self.writer).write(&[1]);
    }

    /// Closes the writing end, leaving the descriptor at end of file.
    pub fn close(&self) {
        let _ = self.writer.shutdown(Shutdown::Write);
    }

    pub fn complete(&self, id: QueryId, status: i32, result: Option<RawResult>) {
        self.queue(id, status, result);
        self.signal();
    }

    pub fn answer(&self, id: QueryId, addrs: &[Ipv4Addr]) {
        self.complete(id, 0, Some(answer(addrs)));
    }
}

pub fn answer(addrs: &[Ipv4Addr]) -> RawResult {
    RawResult {
        qtype: RR_TYPE_A,
        qclass: RR_CLASS_IN,
        data: addrs.iter().map(|a| a.octets().to_vec()).collect(),
        has_data: !addrs.is_empty(),
        ttl: 300,
        ..Default::default()
    }
}

pub fn negative(rcode: u16) -> RawResult {
    RawResult {
        qtype: RR_TYPE_A,
        qclass: RR_CLASS_IN,
        rcode,
        nxdomain: rcode == 3,
        ..Default::default()
    }
}
