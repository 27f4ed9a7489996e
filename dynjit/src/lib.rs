//! Dynamic Block Translator Core
//!
//! Compiles guest basic blocks into host code on demand, runs that code,
//! and keeps the compiled-code cache coherent with a guest memory image
//! that can change underneath it.
//!
//! ## Architecture
//!
//! ```text
//!   host ──run()──► Jit ──run_code()──► CodeRuntime ──► generated code
//!                    ▲                                      │
//!                    └──────── lookup_block() ◄─────────────┘
//!                              (same call stack)
//!                                   │ miss
//!                                   ▼
//!                 Translator ──► opt passes ──► BlockEmitter::emit
//! ```
//!
//! - **Execution driver:** `Jit::run` enters generated code and drains any
//!   deferred invalidation once it returns.
//! - **Lazy lookup:** generated code re-enters the coordinator through
//!   `RunCodeCallbacks::lookup_block` whenever it needs a block that is not
//!   linked yet.
//! - **Invalidation:** requests made while code is executing only raise the
//!   halt flag; the cache is mutated at the next safe point.
//!
//! The translator, emitter and runtime are collaborators expressed as traits
//! in [`backend`]. [`threaded`] provides a complete reference pair of emitter
//! and runtime built on threaded code.

pub mod backend;
pub mod config;
pub mod error;
pub mod interval;
pub mod ir;
pub mod jit;
pub mod location;
pub mod opt;
pub mod state;
pub mod stats;
pub mod threaded;
pub mod trace;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BlockDescriptor, BlockEmitter, CodePtr, CodeRuntime, RunCodeCallbacks, Translator};
pub use config::{JitConfig, TickAccounting, UserCallbacks, UserConfig};
pub use error::JitError;
pub use interval::IntervalSet;
pub use jit::{Jit, JitHandle};
pub use location::LocationDescriptor;
pub use state::{GuestState, HaltFlag, ReturnStackBuffer, Vector};
pub use stats::JitStats;
pub use threaded::{ThreadedEmitter, ThreadedJit, ThreadedRuntime};
pub use trace::{TraceBuffer, TraceEvent, TraceRecord, TraceStats};
