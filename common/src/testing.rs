//! Host-side fakes for the pipeline seams

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::channel::OutputChannel;
use crate::constants::*;
use crate::correlation::{CorrelationTable, RecordStatus};
use crate::pipeline::ProbeEnv;
use crate::sock::{SockLayout, SockReader};
use crate::types::{Ipv4EventRecord, Ipv6EventRecord, StartRecord};

const FAKE_SOCK_SIZE: usize = 2048;

/// A connection object backed by a byte buffer.
///
/// Reads past the end of the buffer fail like an unmapped kernel page.
pub struct FakeSock {
    handle: u64,
    bytes: Vec<u8>,
}

impl FakeSock {
    pub fn new(handle: u64) -> Self {
        Self {
            handle,
            bytes: vec![0; FAKE_SOCK_SIZE],
        }
    }

    pub fn ipv4(
        layout: &SockLayout,
        handle: u64,
        local: [u8; 4],
        remote: [u8; 4],
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        let mut sock = Self::new(handle);
        sock.write(layout.skc_family, AF_INET);
        sock.write(layout.skc_state, TCP_ESTABLISHED);
        sock.write(layout.skc_rcv_saddr, u32::from_ne_bytes(local));
        sock.write(layout.skc_daddr, u32::from_ne_bytes(remote));
        sock.write(layout.skc_num, local_port);
        sock.write(layout.skc_dport, remote_port.to_be());
        sock
    }

    pub fn ipv6(
        layout: &SockLayout,
        handle: u64,
        local: [u8; 16],
        remote: [u8; 16],
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        let mut sock = Self::new(handle);
        sock.write(layout.skc_family, AF_INET6);
        sock.write(layout.skc_state, TCP_ESTABLISHED);
        sock.write(layout.skc_v6_rcv_saddr, words(local));
        sock.write(layout.skc_v6_daddr, words(remote));
        sock.write(layout.skc_num, local_port);
        sock.write(layout.skc_dport, remote_port.to_be());
        sock
    }

    pub fn set_state(&mut self, layout: &SockLayout, state: u8) {
        self.write(layout.skc_state, state);
    }

    pub fn write<T: Copy>(&mut self, offset: u32, value: T) {
        let offset = offset as usize;
        let end = offset + std::mem::size_of::<T>();
        assert!(end <= self.bytes.len(), "write past end of fake sock");
        unsafe {
            std::ptr::write_unaligned(self.bytes[offset..end].as_mut_ptr() as *mut T, value);
        }
    }

    /// Make everything from `len` onwards unreadable
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }
}

impl SockReader for FakeSock {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn read_at<T: Copy>(&self, offset: u32) -> Option<T> {
        let offset = offset as usize;
        let end = offset + std::mem::size_of::<T>();
        let bytes = self.bytes.get(offset..end)?;
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

fn words(bytes: [u8; 16]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

/// Lock-protected correlation table with an optional capacity bound
pub struct FakeTable {
    entries: Mutex<HashMap<u64, StartRecord>>,
    capacity: usize,
}

impl FakeTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for FakeTable {
    fn default() -> Self {
        Self::with_capacity(MAX_CONNECTIONS as usize)
    }
}

impl CorrelationTable for FakeTable {
    fn record(&self, handle: u64, start: &StartRecord) -> RecordStatus {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity && !entries.contains_key(&handle) {
            return RecordStatus::Full;
        }
        entries.insert(handle, *start);
        RecordStatus::Stored
    }

    fn lookup(&self, handle: u64) -> Option<StartRecord> {
        self.entries.lock().unwrap().get(&handle).copied()
    }

    fn remove(&self, handle: u64) {
        self.entries.lock().unwrap().remove(&handle);
    }
}

/// Output channel that keeps every published record
#[derive(Default)]
pub struct RecordingChannel {
    v4: RefCell<Vec<Ipv4EventRecord>>,
    v6: RefCell<Vec<Ipv6EventRecord>>,
}

impl RecordingChannel {
    pub fn v4_records(&self) -> Vec<Ipv4EventRecord> {
        self.v4.borrow().clone()
    }

    pub fn v6_records(&self) -> Vec<Ipv6EventRecord> {
        self.v6.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.borrow().is_empty() && self.v6.borrow().is_empty()
    }
}

impl OutputChannel for RecordingChannel {
    fn publish_v4(&self, record: &Ipv4EventRecord) {
        self.v4.borrow_mut().push(*record);
    }

    fn publish_v6(&self, record: &Ipv6EventRecord) {
        self.v6.borrow_mut().push(*record);
    }
}

/// Settable clock and current task
pub struct FakeEnv {
    now_ns: Cell<u64>,
    pid: Cell<u32>,
    task: Cell<[u8; TASK_COMM_LEN]>,
}

impl FakeEnv {
    pub fn new(now_ns: u64, pid: u32, name: &str) -> Self {
        Self {
            now_ns: Cell::new(now_ns),
            pid: Cell::new(pid),
            task: Cell::new(comm(name)),
        }
    }

    pub fn set_now(&self, now_ns: u64) {
        self.now_ns.set(now_ns);
    }

    pub fn set_task(&self, pid: u32, name: &str) {
        self.pid.set(pid);
        self.task.set(comm(name));
    }
}

impl ProbeEnv for FakeEnv {
    fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }

    fn pid(&self) -> u32 {
        self.pid.get()
    }

    fn task(&self) -> [u8; TASK_COMM_LEN] {
        self.task.get()
    }
}

fn comm(name: &str) -> [u8; TASK_COMM_LEN] {
    let mut task = [0u8; TASK_COMM_LEN];
    let len = name.len().min(TASK_COMM_LEN - 1);
    task[..len].copy_from_slice(&name.as_bytes()[..len]);
    task
}
