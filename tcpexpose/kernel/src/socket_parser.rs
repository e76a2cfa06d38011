//! Kernel socket access
//!
//! Wraps the `struct sock *` argument of the probed functions. Every field
//! read goes through `bpf_probe_read_kernel`, so a freed or unmapped object
//! yields a failed read instead of a fault.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use tcpexpose_common::sock::SockReader;

/// A `struct sock *` taken from a probe argument
pub struct KernelSock {
    ptr: *const u8,
}

impl KernelSock {
    /// Extract the socket pointer from the first probe argument
    ///
    /// tcp_v4_connect, tcp_v6_connect, tcp_set_state and
    /// tcp_rcv_established all take `struct sock *sk` first.
    #[inline(always)]
    pub fn from_context(ctx: &ProbeContext) -> Result<Self, i64> {
        let ptr: *const u8 = ctx.arg(0).ok_or(-1)?;
        if ptr.is_null() {
            return Err(-1);
        }
        Ok(Self { ptr })
    }
}

impl SockReader for KernelSock {
    #[inline(always)]
    fn handle(&self) -> u64 {
        self.ptr as u64
    }

    #[inline(always)]
    fn read_at<T: Copy>(&self, offset: u32) -> Option<T> {
        let field = self.ptr.wrapping_add(offset as usize) as *const T;
        unsafe { bpf_probe_read_kernel(field).ok() }
    }
}
