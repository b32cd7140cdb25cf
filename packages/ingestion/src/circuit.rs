//! Per-run, per-source failure tracking.
//!
//! Each run keeps a `source -> failure count` map in its metadata. Workers only
//! ever increment a count through the store (a single atomic statement), and
//! read it back together with the run status before touching the network.
//! Once a source has failed [`FAILURE_THRESHOLD`] times in a run, the
//! remaining jobs for that source fail fast.

use crate::types::RunGate;

/// Failures after which a source's circuit opens for the rest of the run.
pub const FAILURE_THRESHOLD: i64 = 5;

/// Fetch attempts per job before it counts as one source failure.
pub const MAX_CRAWL_ATTEMPTS: u32 = 3;

/// Error recorded on jobs skipped because their source circuit is open.
pub const CIRCUIT_OPEN_MESSAGE: &str = "source circuit open";

/// What a crawl worker should do with its item, given the run gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Run is finished, errored or aborted; drop the item untouched
    RunClosed,
    /// Source has failed too often; fail the job without fetching
    Open,
    /// Go ahead and fetch
    Closed,
}

impl CircuitDecision {
    pub fn for_gate(gate: &RunGate) -> Self {
        if gate.status.is_terminal() {
            CircuitDecision::RunClosed
        } else if gate.source_failures >= FAILURE_THRESHOLD {
            CircuitDecision::Open
        } else {
            CircuitDecision::Closed
        }
    }
}
