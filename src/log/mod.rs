//! C3 log scanner + C4 log replayer: head/tail discovery across the
//! circular physical log, and two-pass transaction reassembly.

pub mod record;
pub mod replay;
pub mod scanner;

pub use replay::{Pass, Transaction, TransactionDispatcher};
pub use scanner::{LogGeom, RecordSearchResult, ZeroedState};
