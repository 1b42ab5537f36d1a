//! Asynchronous shader-program build coordination.
//!
//! `CompilerService` accepts compile-and-link requests, runs them on worker
//! threads when the driver supports shared contexts (falling back to the
//! driver's own parallel-compile path, then to fully synchronous builds),
//! and hands results back to the driving thread through a per-frame `tick`.
//!
//! The caller-facing pieces:
//! - [`ProgramToken`] — consumable handle to one request and its result
//! - [`CompilerService`] — the facade owning the pool and the tick queue
//! - [`CallbackHandler`] — where completion callbacks are delivered

pub mod callback;
mod pool;
pub mod service;
pub mod token;

pub use callback::{Callback, CallbackHandler, ChannelHandler, InlineHandler};
pub use service::{CompilerService, ExecutionMode, ServiceConfig};
pub use token::{ProgramToken, TokenState};

pub use glforge_common::{CompilerError, Priority, ProgramHandle, ProgramSpec};
