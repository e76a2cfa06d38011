//! tcpexpose - Kernel Space Program
//!
//! This eBPF program turns TCP connection lifecycle events into fixed-size
//! records carrying throughput, window and RTT counters, by attaching to
//! tcp_v4_connect, tcp_v6_connect, tcp_set_state and tcp_rcv_established.
//!
//! ## Architecture
//!
//! ```text
//! tcp_v{4,6}_connect()  -> StartRecord {ts, pid, comm} into START map
//!                          |
//!                          v
//! tcp_set_state()       -> opened / closed record, delta from START
//! tcp_rcv_established() -> metrics snapshot record
//!                          |
//!                          v
//! EVENTS_V4 / EVENTS_V6 -> per-CPU perf buffers drained by the daemon
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```
//!
//! The compiled bytecode is then loaded by the userspace daemon.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod socket_parser;

// Re-export kprobe functions so they're visible to the loader
pub use handlers::{trace_connect, trace_tcp_rcv_established, trace_tcp_set_state};

// Re-export maps for verification
pub use maps::{CONFIG, EVENTS_V4, EVENTS_V6, EXCLUDED_PORTS, SOCK_LAYOUT, START, STATS};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - this should never be reached
    // The verifier should catch any potential panics
    loop {}
}
