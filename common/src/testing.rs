use std::{
    cell::{Cell, RefCell},
    net::SocketAddrV4,
    rc::Rc,
};

use crate::{
    connection::Endpoint,
    error::{OpenStage, StackError},
    listener::{ListenSocket, Stack},
    response::StatusLed,
};

#[derive(Debug, Default)]
pub struct FakeLed {
    pub on: bool,
}

impl StatusLed for FakeLed {
    fn is_on(&self) -> bool {
        self.on
    }

    fn set(&mut self, on: bool) {
        self.on = on;
    }
}

#[derive(Debug, Default)]
pub struct EndpointLog {
    pub writes: Vec<Vec<u8>>,
    pub closes: usize,
    pub aborts: usize,
    pub recved: usize,
}

impl EndpointLog {
    pub fn written(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

pub struct RecordingEndpoint {
    log: Rc<RefCell<EndpointLog>>,
    fail_writes: bool,
    fail_close: bool,
}

impl RecordingEndpoint {
    pub fn new() -> (Self, Rc<RefCell<EndpointLog>>) {
        let log = Rc::new(RefCell::new(EndpointLog::default()));
        let endpoint = Self {
            log: log.clone(),
            fail_writes: false,
            fail_close: false,
        };
        (endpoint, log)
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

impl Endpoint for RecordingEndpoint {
    fn write(&mut self, data: &[u8]) -> Result<(), StackError> {
        if self.fail_writes {
            return Err(StackError::Write);
        }
        self.log.borrow_mut().writes.push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), StackError> {
        self.log.borrow_mut().closes += 1;
        if self.fail_close {
            return Err(StackError::Close);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.log.borrow_mut().aborts += 1;
    }

    fn recved(&mut self, len: usize) {
        self.log.borrow_mut().recved += len;
    }
}

pub struct FakeSocket {
    pub closed: Rc<Cell<bool>>,
    closes: Rc<Cell<u32>>,
}

impl ListenSocket for FakeSocket {
    fn close(&mut self) {
        self.closed.set(true);
        self.closes.set(self.closes.get() + 1);
    }
}

#[derive(Default)]
pub struct FakeStack {
    pub fail_at: Option<OpenStage>,
    pub bound: Option<SocketAddrV4>,
    pub backlog: Option<u8>,
    pub sockets_closed: Rc<Cell<u32>>,
}

impl FakeStack {
    fn check(&self, stage: OpenStage, err: StackError) -> Result<(), StackError> {
        match self.fail_at {
            Some(failing) if failing == stage => Err(err),
            _ => Ok(()),
        }
    }
}

impl Stack for FakeStack {
    type Socket = FakeSocket;
    type Endpoint = RecordingEndpoint;

    fn allocate(&mut self) -> Result<FakeSocket, StackError> {
        self.check(OpenStage::Allocate, StackError::Alloc)?;
        Ok(FakeSocket {
            closed: Rc::new(Cell::new(false)),
            closes: self.sockets_closed.clone(),
        })
    }

    fn bind(&mut self, _socket: &mut FakeSocket, addr: SocketAddrV4) -> Result<(), StackError> {
        self.check(OpenStage::Bind, StackError::AddrInUse)?;
        self.bound = Some(addr);
        Ok(())
    }

    fn listen(&mut self, _socket: &mut FakeSocket, backlog: u8) -> Result<(), StackError> {
        self.check(OpenStage::Listen, StackError::Listen)?;
        self.backlog = Some(backlog);
        Ok(())
    }
}
