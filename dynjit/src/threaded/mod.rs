//! Reference backend built on threaded code.
//!
//! IR blocks are lowered to flat op lists that a dispatcher loop executes
//! directly against [`GuestState`](crate::state::GuestState). It needs no
//! executable memory, which makes it portable and easy to test, and it
//! exercises the same lookup, linking, return-prediction and halt paths a
//! native emitter would.

mod emitter;
mod runtime;

pub use emitter::ThreadedEmitter;
pub use runtime::ThreadedRuntime;

use crate::backend::Translator;
use crate::config::{UserCallbacks, UserConfig};
use crate::error::JitError;
use crate::jit::Jit;

/// A JIT using the threaded-code backend.
pub type ThreadedJit<C, T> = Jit<C, T, ThreadedEmitter, ThreadedRuntime>;

impl<C: UserCallbacks, T: Translator> Jit<C, T, ThreadedEmitter, ThreadedRuntime> {
    /// Build a JIT whose code memory is sized from `config.jit`.
    pub fn with_threaded_backend(config: UserConfig<C>, translator: T) -> Result<Self, JitError> {
        let runtime = ThreadedRuntime::with_config(&config.jit);
        Self::new(config, translator, ThreadedEmitter::new(), runtime)
    }
}
