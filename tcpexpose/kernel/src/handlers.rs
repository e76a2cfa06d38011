//! Kprobe handlers for TCP lifecycle tracking
//!
//! Implements the eBPF programs that attach to kernel functions and feed
//! the shared probe pipeline.

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use tcpexpose_common::{constants::*, pipeline::ProbeOutcome, Pipeline};

use crate::{helpers::*, socket_parser::KernelSock};

/// Run `f` against a pipeline wired to the kernel maps
#[inline(always)]
fn with_pipeline<F>(ctx: &ProbeContext, f: F) -> ProbeOutcome
where
    F: FnOnce(&Pipeline<'_, StartTable, ExcludedPorts, PerfOutput<'_, ProbeContext>, KernelEnv>) -> ProbeOutcome,
{
    let config = pipeline_config();
    let layout = sock_layout();
    let output = PerfOutput { ctx };
    let pipeline = Pipeline {
        config: &config,
        layout: &layout,
        table: &StartTable,
        filter: &ExcludedPorts,
        output: &output,
        env: &KernelEnv,
    };
    f(&pipeline)
}

/// Record who issued a connect and when
///
/// Attached to: tcp_v4_connect, tcp_v6_connect
#[kprobe]
pub fn trace_connect(ctx: ProbeContext) -> u32 {
    match try_trace_connect(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_INVALID_SOCKETS);
            0
        }
    }
}

fn try_trace_connect(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_CONNECT_EVENTS);

    let sock = KernelSock::from_context(ctx)?;
    let outcome = with_pipeline(ctx, |pipeline| pipeline.on_connect(&sock));
    record_outcome(outcome);

    Ok(0)
}

/// Report connections entering or leaving ESTABLISHED
///
/// Attached to: tcp_set_state(struct sock *sk, int state)
#[kprobe]
pub fn trace_tcp_set_state(ctx: ProbeContext) -> u32 {
    match try_trace_tcp_set_state(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_INVALID_SOCKETS);
            0
        }
    }
}

fn try_trace_tcp_set_state(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_STATE_EVENTS);

    let sock = KernelSock::from_context(ctx)?;
    let new_state: i32 = ctx.arg(1).ok_or(-1)?;
    let outcome = with_pipeline(ctx, |pipeline| {
        pipeline.on_state_change(&sock, new_state as u8)
    });
    record_outcome(outcome);

    Ok(0)
}

/// Snapshot the counters of an established connection on every ACK
///
/// Attached to: tcp_rcv_established
#[kprobe]
pub fn trace_tcp_rcv_established(ctx: ProbeContext) -> u32 {
    match try_trace_tcp_rcv_established(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_INVALID_SOCKETS);
            0
        }
    }
}

fn try_trace_tcp_rcv_established(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_ACK_EVENTS);

    let sock = KernelSock::from_context(ctx)?;
    let outcome = with_pipeline(ctx, |pipeline| pipeline.on_ack(&sock));
    record_outcome(outcome);

    Ok(0)
}
