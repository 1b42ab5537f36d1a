//! Program tokens: consumable handles to one compile/link request.
//!
//! A token's shared state block is reference-counted: the caller holds the
//! public `ProgramToken`, and the pool queue, tick queue, and completion
//! barriers hold internal references. All compile-state mutation goes
//! through the block's own lock; the user-data slot has a separate lock so
//! it stays usable regardless of compile progress.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use glforge_common::{CompilerError, Priority, ProgramHandle, ProgramSpec, ShaderHandle};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Where a token is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Created, not yet scheduled.
    Initializing,
    /// Waiting in a pool queue.
    Queued,
    /// Being compiled, by a worker or by the driver itself.
    Compiling,
    /// Worker result published, awaiting driving-thread finalization.
    Linked,
    /// Finalized; the program handle is available.
    Ready,
    /// Compile or link failed; the diagnostic is available.
    Error,
    /// Terminated before completion.
    Cancelled,
}

impl TokenState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenState::Ready | TokenState::Error | TokenState::Cancelled
        )
    }
}

/// A worker's compile/link outcome, pending publication on the token.
pub(crate) type BuildResult = Result<(Vec<ShaderHandle>, ProgramHandle), CompilerError>;

pub(crate) struct TokenInner {
    pub state: TokenState,
    /// Retained until the compile actually runs.
    pub spec: Option<ProgramSpec>,
    /// Stage shaders, deleted at finalization.
    pub shaders: Vec<ShaderHandle>,
    pub program: ProgramHandle,
    pub error: Option<CompilerError>,
    /// A worker finished and wrote its result. Never cleared once set.
    pub published: bool,
    /// Any result must be discarded instead of published.
    pub cancelled: bool,
}

pub(crate) struct TokenCore {
    id: u64,
    name: String,
    priority: Priority,
    pub(crate) inner: Mutex<TokenInner>,
    /// Signaled when a worker publishes or the state turns terminal.
    pub(crate) done: Condvar,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TokenCore {
    pub fn new(name: &str, spec: ProgramSpec) -> Arc<Self> {
        let priority = spec.priority;
        Arc::new(Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            priority,
            inner: Mutex::new(TokenInner {
                state: TokenState::Initializing,
                spec: Some(spec),
                shaders: Vec::new(),
                program: ProgramHandle::INVALID,
                error: None,
                published: false,
                cancelled: false,
            }),
            done: Condvar::new(),
            user_data: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TokenState {
        self.inner.lock().state
    }

    /// True iff a blocking fetch of the program would not block: the result
    /// is published or the token is already finalized.
    pub fn is_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.published || matches!(inner.state, TokenState::Ready | TokenState::Error)
    }

    pub fn published(&self) -> bool {
        self.inner.lock().published
    }

    pub fn set_state(&self, state: TokenState) {
        self.inner.lock().state = state;
    }

    /// Take the spec and enter `Compiling`. Returns `None` when the token
    /// was cancelled before the compile started.
    pub fn begin_compile(&self) -> Option<ProgramSpec> {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return None;
        }
        inner.state = TokenState::Compiling;
        inner.spec.take()
    }

    /// Publish a worker result and wake any `get_program` waiter.
    ///
    /// When a cancellation won the race the result is handed back to the
    /// caller, who must destroy the contained objects on its own context.
    /// The token lock acquisition here is the cancellation linearization
    /// point.
    pub fn publish(&self, result: BuildResult) -> Option<BuildResult> {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return Some(result);
        }
        match result {
            Ok((shaders, program)) => {
                inner.shaders = shaders;
                inner.program = program;
            }
            Err(e) => inner.error = Some(e),
        }
        inner.published = true;
        inner.state = TokenState::Linked;
        drop(inner);
        self.done.notify_all();
        None
    }

    /// Block until a result is published or the token turns terminal.
    pub fn wait_published(&self) {
        let mut inner = self.inner.lock();
        while !inner.published && !inner.state.is_terminal() {
            self.done.wait(&mut inner);
        }
    }

    pub fn error(&self) -> Option<CompilerError> {
        self.inner.lock().error.clone()
    }

    pub fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.user_data.lock() = Some(data);
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.lock().clone()
    }
}

/// Opaque handle to one in-flight or completed program build.
///
/// The handle is single-owner and deliberately not `Clone`:
/// [`CompilerService::get_program`](crate::service::CompilerService::get_program)
/// and [`CompilerService::terminate`](crate::service::CompilerService::terminate)
/// take it by value, so a consumed token cannot be reused.
pub struct ProgramToken {
    pub(crate) core: Arc<TokenCore>,
}

impl ProgramToken {
    /// Stable identity for the token's whole life.
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn priority(&self) -> Priority {
        self.core.priority()
    }

    pub fn state(&self) -> TokenState {
        self.core.state()
    }

    /// True once the compile and link have finished (successfully or not),
    /// i.e. `get_program` would not block. Non-blocking, callable from any
    /// thread, and monotonic: once true it stays true.
    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// The failure diagnostic, once the token reached `Error`.
    pub fn error(&self) -> Option<CompilerError> {
        self.core.error()
    }

    /// Attach opaque data to the token. Independent of compile progress;
    /// safe against concurrent state transitions.
    pub fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) {
        self.core.set_user_data(data);
    }

    /// Read back the attached data.
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core.user_data()
    }
}

impl std::fmt::Debug for ProgramToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramToken")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
