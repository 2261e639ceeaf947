//! Sample applications built on [`Dlml`](crate::Dlml).
//!
//! - [`nqueens`]: counts the solutions of the N-queens puzzle with a
//!   depth-first search whose open boards are balanced across ranks.
//! - [`traffic`]: counts unique alert ids across a directory of traffic
//!   report files, one work item per file.

pub mod nqueens;
pub mod traffic;
