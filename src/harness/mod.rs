use serde::{Deserialize, Serialize};

use crate::engine::evaluator::ExecutionStrategy;

/// Per-cell statistics streamed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellStats {
    pub scenario: String,
    pub strategy: ExecutionStrategy,
    pub passed: bool,
    pub checks_passed: usize,
    pub checks_total: usize,
    /// Set when the cell stopped on an error rather than a failed check.
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

/// Events emitted by the matrix runner to the main thread.
#[derive(Debug, Clone)]
pub enum HarnessEvent {
    /// Diagnostic log message.
    Log(String),

    /// A cell acquired its evaluator and started evaluating.
    CellStarted {
        scenario: String,
        strategy: ExecutionStrategy,
    },

    /// A cell finished, passed or not.
    CellFinished(CellStats),

    /// Every cell and every invariance check is done.
    Finished { consistent: bool },
}

pub mod checker;
pub mod config;
pub mod oracle;
pub mod runner;
