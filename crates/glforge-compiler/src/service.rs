//! The compiler service facade.
//!
//! Owns the worker pool and the deferred-op ("run at next tick") queue,
//! picks the execution mode at init from the driver's capabilities, and
//! implements the completion barrier. Everything here runs on the driving
//! thread; the only cross-thread traffic is through the token state blocks
//! and the pool queues.

use std::sync::Arc;

use log::{debug, trace, warn};

use glforge_common::preprocess::preprocess_source;
use glforge_common::{
    CompilerError, DriverCaps, GlContext, GlDriver, Priority, ProgramHandle, ProgramSpec,
};

use crate::callback::{Callback, CallbackHandler};
use crate::pool::CompilerThreadPool;
use crate::token::{BuildResult, ProgramToken, TokenCore, TokenState};

/// How the service executes compile requests; fixed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Worker threads compile on shared driver contexts.
    ThreadPool,
    /// The driver itself compiles asynchronously on the driving thread.
    DriverAsync,
    /// Everything runs inline on the driving thread.
    Synchronous,
}

/// Service configuration, validated against the driver's capabilities at
/// init time.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Worker threads to start when the driver supports shared contexts.
    pub thread_count: usize,
    /// Force the synchronous path even on capable drivers.
    pub force_synchronous: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            force_synchronous: false,
        }
    }
}

struct Barrier {
    /// Snapshot of the tokens outstanding at registration time.
    tokens: Vec<Arc<TokenCore>>,
    handler: Option<Arc<dyn CallbackHandler>>,
    /// Taken when the barrier fires, so it can fire only once.
    callback: Option<Callback>,
}

enum TickOp {
    /// Driving-thread finalization for one token.
    Finalize { token: Arc<TokenCore> },
    /// Completion barrier; retained until every tracked token is terminal.
    Barrier(Barrier),
}

/// Accepts compile-and-link requests and hands results back to the driving
/// thread.
///
/// All methods must be called from the driving thread, except token
/// observation (`ProgramToken::is_ready` and friends), which is free for
/// any thread. `tick` must be called at least once per frame.
pub struct CompilerService {
    driver: Arc<dyn GlDriver>,
    mode: ExecutionMode,
    pool: CompilerThreadPool,
    /// Strict insertion order; drained by `tick`.
    tick_ops: Vec<TickOp>,
}

impl CompilerService {
    /// Pick the execution mode from the driver's capabilities and start the
    /// worker pool if one is called for.
    ///
    /// Missing parallelism support is not an error: the service silently
    /// degrades to the driver-async path, then to fully synchronous builds.
    pub fn init(driver: Arc<dyn GlDriver>, config: ServiceConfig) -> Result<Self, CompilerError> {
        let caps = driver.caps();
        let mode = if config.force_synchronous {
            ExecutionMode::Synchronous
        } else if caps.contains(DriverCaps::SHARED_CONTEXTS) && config.thread_count > 0 {
            ExecutionMode::ThreadPool
        } else if caps.contains(DriverCaps::PARALLEL_COMPILE) {
            ExecutionMode::DriverAsync
        } else {
            ExecutionMode::Synchronous
        };
        let mut pool = CompilerThreadPool::new();
        if mode == ExecutionMode::ThreadPool {
            pool.init(config.thread_count, &driver)?;
        }
        debug!(
            "compiler service: {:?} mode, {} worker(s)",
            mode,
            pool.thread_count()
        );
        Ok(Self {
            driver,
            mode,
            pool,
            tick_ops: Vec::new(),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Build a program. Returns immediately in the asynchronous modes; in
    /// synchronous mode the returned token is already terminal.
    ///
    /// The token is usable with every other operation regardless of mode.
    pub fn create_program(&mut self, name: &str, spec: ProgramSpec) -> ProgramToken {
        let priority = spec.priority;
        let core = TokenCore::new(name, spec);
        trace!("create_program '{}' ({:?})", name, priority);
        match self.mode {
            ExecutionMode::Synchronous => {
                let driver = Arc::clone(&self.driver);
                Self::compile_inline(driver.primary_context(), &core);
            }
            ExecutionMode::DriverAsync => {
                let driver = Arc::clone(&self.driver);
                Self::issue_driver_async(driver.primary_context(), &core);
                self.tick_ops.push(TickOp::Finalize {
                    token: Arc::clone(&core),
                });
            }
            ExecutionMode::ThreadPool => {
                core.set_state(TokenState::Queued);
                let job_token = Arc::clone(&core);
                self.pool.queue(
                    priority,
                    Arc::clone(&core),
                    Box::new(move |ctx| run_compile_job(ctx, &job_token)),
                );
                self.tick_ops.push(TickOp::Finalize {
                    token: Arc::clone(&core),
                });
            }
        }
        ProgramToken { core }
    }

    /// True once the token's compile and link have finished, successfully
    /// or not — i.e. `get_program` would not block. Callable from any
    /// thread.
    pub fn is_program_ready(&self, token: &ProgramToken) -> bool {
        token.is_ready()
    }

    /// Block until the token is terminal and return the program handle, or
    /// the invalid sentinel on failure. Consumes the token.
    ///
    /// Driving thread only: when the token's remaining finalization can
    /// only run here, it is performed inline instead of waiting on a tick
    /// that this very thread would have to run.
    pub fn get_program(&mut self, token: ProgramToken) -> ProgramHandle {
        let core = token.core;
        if !core.state().is_terminal() {
            let driver = Arc::clone(&self.driver);
            let ctx = driver.primary_context();
            match self.mode {
                ExecutionMode::Synchronous => {}
                ExecutionMode::ThreadPool => {
                    core.wait_published();
                    self.cancel_tick_op(&core);
                    Self::finalize_published(ctx, &core);
                }
                ExecutionMode::DriverAsync => {
                    self.cancel_tick_op(&core);
                    Self::finalize_driver_async(ctx, &core, true);
                }
            }
        }
        let inner = core.inner.lock();
        debug_assert!(inner.state.is_terminal());
        inner.program
    }

    /// Cancel a token and release everything it still holds. Consumes the
    /// token; valid in any state.
    ///
    /// A job not yet picked up is removed from the queue; a running one
    /// keeps running but its result is discarded and no callback fires.
    pub fn terminate(&mut self, token: ProgramToken) {
        let core = token.core;
        self.cancel_tick_op(&core);
        if self.pool.dequeue(&core).is_some() {
            trace!("terminate '{}': dequeued before start", core.name());
        }
        let driver = Arc::clone(&self.driver);
        let ctx = driver.primary_context();
        let mut inner = core.inner.lock();
        inner.spec = None;
        for shader in inner.shaders.drain(..) {
            ctx.delete_shader(shader);
        }
        if inner.program.is_valid() {
            ctx.delete_program(inner.program);
            inner.program = ProgramHandle::INVALID;
        }
        if !inner.state.is_terminal() {
            inner.cancelled = true;
            inner.state = TokenState::Cancelled;
        }
        drop(inner);
        core.done.notify_all();
    }

    /// Fire `callback` once every program outstanding right now, in
    /// `priority`'s urgency class or higher, has reached a terminal state.
    /// Programs created after this call are not tracked.
    ///
    /// The callback is delivered through `handler` when one is given,
    /// otherwise invoked inline from `tick`. It always arrives via a tick —
    /// never synchronously from this call, even with nothing outstanding —
    /// and fires exactly once.
    pub fn notify_when_all_programs_ready(
        &mut self,
        priority: Priority,
        handler: Option<Arc<dyn CallbackHandler>>,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let tokens: Vec<Arc<TokenCore>> = self
            .tick_ops
            .iter()
            .filter_map(|op| match op {
                TickOp::Finalize { token }
                    if token.priority() <= priority && !token.state().is_terminal() =>
                {
                    Some(Arc::clone(token))
                }
                _ => None,
            })
            .collect();
        trace!(
            "barrier registered ({:?}): tracking {} token(s)",
            priority,
            tokens.len()
        );
        self.tick_ops.push(TickOp::Barrier(Barrier {
            tokens,
            handler,
            callback: Some(Box::new(callback)),
        }));
    }

    /// Run the deferred ops queued up to this call, in insertion order.
    ///
    /// Must be called at least once per frame by the driving thread. Ops
    /// that are not yet due — the driver still linking, a barrier with
    /// outstanding tokens — are retained in place for the next call; ops
    /// enqueued after this call starts run on the next call.
    pub fn tick(&mut self) {
        let ops = std::mem::take(&mut self.tick_ops);
        let mut retained = Vec::new();
        for op in ops {
            match op {
                TickOp::Finalize { token } => {
                    if !self.run_finalize(&token) {
                        retained.push(TickOp::Finalize { token });
                    }
                }
                TickOp::Barrier(mut barrier) => {
                    if !Self::run_barrier(&mut barrier) {
                        retained.push(TickOp::Barrier(barrier));
                    }
                }
            }
        }
        // anything appended while draining runs next call, after the
        // retained ops
        retained.append(&mut self.tick_ops);
        self.tick_ops = retained;
    }

    /// Stop the workers and drop all deferred work. Queued jobs never run;
    /// in-flight results are discarded through the cancellation path.
    pub fn shutdown(&mut self) {
        if self.pool.thread_count() > 0 || !self.tick_ops.is_empty() {
            debug!(
                "compiler service: shutting down, {} deferred op(s) dropped",
                self.tick_ops.len()
            );
        }
        let driver = Arc::clone(&self.driver);
        let ctx = driver.primary_context();
        for op in &self.tick_ops {
            if let TickOp::Finalize { token } = op {
                let mut inner = token.inner.lock();
                inner.spec = None;
                for shader in inner.shaders.drain(..) {
                    ctx.delete_shader(shader);
                }
                if inner.program.is_valid() {
                    ctx.delete_program(inner.program);
                    inner.program = ProgramHandle::INVALID;
                }
                if !inner.state.is_terminal() {
                    inner.cancelled = true;
                    inner.state = TokenState::Cancelled;
                }
            }
        }
        self.tick_ops.clear();
        self.pool.terminate();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Remove the pending finalize op for `token`, if it has not run yet.
    fn cancel_tick_op(&mut self, token: &Arc<TokenCore>) {
        self.tick_ops.retain(|op| match op {
            TickOp::Finalize { token: t } => !Arc::ptr_eq(t, token),
            TickOp::Barrier(_) => true,
        });
    }

    /// Returns true when the op is done and can be dropped.
    fn run_finalize(&self, token: &Arc<TokenCore>) -> bool {
        if token.state() == TokenState::Cancelled {
            return true;
        }
        let driver = Arc::clone(&self.driver);
        let ctx = driver.primary_context();
        match self.mode {
            ExecutionMode::ThreadPool => {
                if !token.published() {
                    // worker still on it, check again next tick
                    return false;
                }
                Self::finalize_published(ctx, token);
                true
            }
            ExecutionMode::DriverAsync => Self::finalize_driver_async(ctx, token, false),
            // no finalize ops are ever registered in synchronous mode
            ExecutionMode::Synchronous => true,
        }
    }

    fn run_barrier(barrier: &mut Barrier) -> bool {
        if barrier.tokens.iter().any(|t| !t.state().is_terminal()) {
            return false;
        }
        if let Some(callback) = barrier.callback.take() {
            match &barrier.handler {
                Some(handler) => handler.post(callback),
                None => callback(),
            }
        }
        true
    }

    /// Synchronous-mode build: the token is terminal before this returns.
    fn compile_inline(ctx: &dyn GlContext, token: &Arc<TokenCore>) {
        let Some(spec) = token.begin_compile() else {
            return;
        };
        let result = build_program(ctx, &spec);
        token.publish(result);
        Self::finalize_published(ctx, token);
    }

    /// Driver-async mode: issue the calls now, let the driver chew on them.
    /// The token stays `Compiling` until a completion poll succeeds.
    fn issue_driver_async(ctx: &dyn GlContext, token: &Arc<TokenCore>) {
        let Some(spec) = token.begin_compile() else {
            return;
        };
        let result = build_program(ctx, &spec);
        let mut inner = token.inner.lock();
        match result {
            Ok((shaders, program)) => {
                inner.shaders = shaders;
                inner.program = program;
            }
            // the driver rejected it synchronously after all
            Err(e) => inner.error = Some(e),
        }
    }

    /// Driving-thread finalization of a published pool or inline result:
    /// drop the stage shaders and move the token to its terminal state.
    fn finalize_published(ctx: &dyn GlContext, token: &Arc<TokenCore>) {
        let mut inner = token.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        debug_assert!(inner.published);
        for shader in inner.shaders.drain(..) {
            ctx.delete_shader(shader);
        }
        if let Some(err) = &inner.error {
            warn!("program '{}' failed: {}", token.name(), err);
            inner.state = TokenState::Error;
        } else {
            inner.state = TokenState::Ready;
        }
    }

    /// Finalization for the driver-async path. Non-blocking unless `force`:
    /// returns false when the driver has not finished yet. With `force` the
    /// link-status query is allowed to block until the driver is done.
    fn finalize_driver_async(ctx: &dyn GlContext, token: &Arc<TokenCore>, force: bool) -> bool {
        let mut inner = token.inner.lock();
        if inner.state.is_terminal() {
            return true;
        }
        if inner.error.is_none() {
            if !force && !ctx.is_program_complete(inner.program) {
                return false;
            }
            if !ctx.program_link_ok(inner.program) {
                let e = CompilerError::ProgramLinking(ctx.program_info_log(inner.program));
                ctx.delete_program(inner.program);
                inner.program = ProgramHandle::INVALID;
                inner.error = Some(e);
            }
        }
        for shader in inner.shaders.drain(..) {
            ctx.delete_shader(shader);
        }
        inner.published = true;
        if let Some(err) = &inner.error {
            warn!("program '{}' failed: {}", token.name(), err);
            inner.state = TokenState::Error;
        } else {
            inner.state = TokenState::Ready;
        }
        true
    }
}

impl Drop for CompilerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Preprocess, compile, and link a full spec on the given context. Partial
/// results are destroyed on failure.
fn build_program(ctx: &dyn GlContext, spec: &ProgramSpec) -> BuildResult {
    let mut shaders = Vec::with_capacity(spec.stages.len());
    for stage in &spec.stages {
        let source = preprocess_source(&stage.source, &spec.specialization);
        match ctx.compile_shader(stage.stage, &source) {
            Ok(handle) => shaders.push(handle),
            Err(e) => {
                for shader in shaders {
                    ctx.delete_shader(shader);
                }
                return Err(e);
            }
        }
    }
    match ctx.link_program(&shaders, &spec.attributes) {
        Ok(program) => Ok((shaders, program)),
        Err(e) => {
            for shader in shaders {
                ctx.delete_shader(shader);
            }
            Err(e)
        }
    }
}

/// Worker-side job body: compile, then publish — or clean up after losing
/// the race with a cancellation.
fn run_compile_job(ctx: &dyn GlContext, token: &Arc<TokenCore>) {
    let Some(spec) = token.begin_compile() else {
        trace!("job for '{}' cancelled before start", token.name());
        return;
    };
    let result = build_program(ctx, &spec);
    if let Some(rejected) = token.publish(result) {
        trace!("discarding cancelled result for '{}'", token.name());
        if let Ok((shaders, program)) = rejected {
            for shader in shaders {
                ctx.delete_shader(shader);
            }
            ctx.delete_program(program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::ChannelHandler;
    use glforge_common::mock::MockDriver;
    use glforge_common::{ShaderStage, SpecConstValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const VS: &str = "#version 300 es\nvoid main() {}\n";
    const FS: &str = "#version 300 es\nout vec4 color;\nvoid main() { color = vec4(1.0); }\n";

    fn service_with(caps: DriverCaps, config: ServiceConfig) -> (Arc<MockDriver>, CompilerService) {
        let _ = env_logger::builder().is_test(true).try_init();
        let driver = Arc::new(MockDriver::new(caps));
        let service =
            CompilerService::init(Arc::clone(&driver) as Arc<dyn GlDriver>, config).unwrap();
        (driver, service)
    }

    fn pool_service() -> (Arc<MockDriver>, CompilerService) {
        service_with(DriverCaps::SHARED_CONTEXTS, ServiceConfig::default())
    }

    fn async_service() -> (Arc<MockDriver>, CompilerService) {
        service_with(DriverCaps::PARALLEL_COMPILE, ServiceConfig::default())
    }

    fn sync_service() -> (Arc<MockDriver>, CompilerService) {
        service_with(DriverCaps::empty(), ServiceConfig::default())
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    // ========== mode selection ==========

    #[test]
    fn test_mode_selection() {
        assert_eq!(pool_service().1.mode(), ExecutionMode::ThreadPool);
        assert_eq!(async_service().1.mode(), ExecutionMode::DriverAsync);
        assert_eq!(sync_service().1.mode(), ExecutionMode::Synchronous);
    }

    #[test]
    fn test_force_synchronous_wins_over_caps() {
        let (_d, service) = service_with(
            DriverCaps::SHARED_CONTEXTS | DriverCaps::PARALLEL_COMPILE,
            ServiceConfig {
                force_synchronous: true,
                ..ServiceConfig::default()
            },
        );
        assert_eq!(service.mode(), ExecutionMode::Synchronous);
    }

    #[test]
    fn test_zero_threads_disables_pool() {
        let (_d, service) = service_with(
            DriverCaps::SHARED_CONTEXTS,
            ServiceConfig {
                thread_count: 0,
                ..ServiceConfig::default()
            },
        );
        assert_eq!(service.mode(), ExecutionMode::Synchronous);
    }

    // ========== synchronous fallback ==========

    #[test]
    fn test_sync_token_terminal_immediately() {
        let (_d, mut service) = sync_service();
        let token = service.create_program("tri", ProgramSpec::from_sources(VS, FS));
        assert!(token.is_ready());
        assert_eq!(token.state(), TokenState::Ready);
        let program = service.get_program(token);
        assert!(program.is_valid());
    }

    #[test]
    fn test_sync_compile_error_surfaces_on_token() {
        let (driver, mut service) = sync_service();
        driver.set_compile_error("BROKEN", "0:3: 'foo' : undeclared identifier");
        let spec = ProgramSpec::from_sources(VS, "BROKEN");
        let token = service.create_program("bad", spec);
        assert!(token.is_ready());
        assert_eq!(token.state(), TokenState::Error);
        assert!(matches!(
            token.error(),
            Some(CompilerError::ShaderCompilation(_))
        ));
        assert_eq!(service.get_program(token), ProgramHandle::INVALID);
        // the failed build leaks nothing
        assert_eq!(driver.alive_shaders(), 0);
        assert_eq!(driver.alive_programs(), 0);
    }

    #[test]
    fn test_sync_specialization_reaches_driver() {
        let (driver, mut service) = sync_service();
        let spec = ProgramSpec::from_sources(VS, FS)
            .with_constant("MAX_BONES", SpecConstValue::Int(64));
        let token = service.create_program("skinned", spec);
        assert_eq!(token.state(), TokenState::Ready);
        assert!(driver.events().iter().any(|e| e == "compile:vertex"));
    }

    // ========== thread pool mode ==========

    #[test]
    fn test_pool_end_to_end() {
        let (driver, mut service) = pool_service();
        let token = service.create_program("world", ProgramSpec::from_sources(VS, FS));
        assert!(!token.state().is_terminal());
        wait_until("publish", || token.is_ready());
        service.tick();
        assert_eq!(token.state(), TokenState::Ready);
        let program = service.get_program(token);
        assert!(program.is_valid());
        // stage shaders were cleaned up at finalization
        assert_eq!(driver.alive_shaders(), 0);
        assert_eq!(driver.alive_programs(), 1);
    }

    #[test]
    fn test_pool_get_program_without_tick_finalizes_inline() {
        let (_d, mut service) = pool_service();
        let token = service.create_program("ui", ProgramSpec::from_sources(VS, FS));
        // no tick() at all: get_program must not deadlock
        let program = service.get_program(token);
        assert!(program.is_valid());
    }

    #[test]
    fn test_pool_compile_error_is_not_fatal_to_the_pool() {
        let (driver, mut service) = pool_service();
        driver.set_compile_error("BROKEN", "syntax error");
        let bad = service.create_program("bad", ProgramSpec::from_sources("BROKEN", FS));
        wait_until("bad publish", || bad.is_ready());
        service.tick();
        assert_eq!(bad.state(), TokenState::Error);
        service.terminate(bad);

        // the pool keeps working afterwards
        driver.set_compile_error("NEVER_MATCHES", "");
        let good = service.create_program("good", ProgramSpec::from_sources(VS, FS));
        assert!(service.get_program(good).is_valid());
    }

    #[test]
    fn test_pool_priority_order_served_high_first() {
        let (driver, mut service) = pool_service();
        driver.set_compile_delay(Duration::from_millis(50));
        // single-stage specs with distinct stages so the journal shows which
        // program compiled when
        let a = service.create_program(
            "a",
            ProgramSpec::default().with_stage(ShaderStage::Vertex, VS),
        );
        let c = service.create_program(
            "c",
            ProgramSpec::default()
                .with_stage(ShaderStage::Compute, VS)
                .with_priority(Priority::Low),
        );
        let b = service.create_program(
            "b",
            ProgramSpec::default().with_stage(ShaderStage::Fragment, FS),
        );
        for token in [&a, &b, &c] {
            wait_until("publish", || token.is_ready());
        }
        let compiles: Vec<String> = driver
            .events()
            .into_iter()
            .filter(|e| e.starts_with("compile:"))
            .collect();
        assert_eq!(compiles, ["compile:vertex", "compile:fragment", "compile:compute"]);
        for token in [a, b, c] {
            service.terminate(token);
        }
    }

    #[test]
    fn test_cancellation_race_discards_in_flight_result() {
        let (driver, mut service) = pool_service();
        driver.set_compile_delay(Duration::from_millis(100));
        let token = service.create_program("doomed", ProgramSpec::from_sources(VS, FS));
        // let the worker pick the job up, then cancel while it compiles
        wait_until("worker start", || {
            driver.events().iter().any(|e| e.starts_with("compile:"))
        });
        service.terminate(token);
        // the worker finishes, notices the cancellation, and destroys its
        // result; nothing may leak
        wait_until("discard", || {
            driver.alive_shaders() == 0 && driver.alive_programs() == 0
        });
        service.tick();
        assert_eq!(driver.alive_programs(), 0);
    }

    #[test]
    fn test_terminate_before_pickup_never_compiles() {
        let (driver, mut service) = pool_service();
        driver.set_compile_delay(Duration::from_millis(100));
        // keep the single worker busy so the second job stays queued
        let busy = service.create_program("busy", ProgramSpec::from_sources(VS, FS));
        wait_until("worker start", || {
            driver.events().iter().any(|e| e.starts_with("compile:"))
        });
        let doomed = service.create_program("doomed", ProgramSpec::from_sources(VS, FS));
        service.terminate(doomed);
        wait_until("busy publish", || busy.is_ready());
        // only the first program's stages were ever compiled
        let compiles = driver
            .events()
            .iter()
            .filter(|e| e.starts_with("compile:"))
            .count();
        assert_eq!(compiles, 2);
        service.terminate(busy);
    }

    #[test]
    fn test_shutdown_drops_queued_work() {
        let (driver, mut service) = pool_service();
        driver.set_compile_delay(Duration::from_millis(100));
        let busy = service.create_program("busy", ProgramSpec::from_sources(VS, FS));
        wait_until("worker start", || {
            driver.events().iter().any(|e| e.starts_with("compile:"))
        });
        let queued = service.create_program("queued", ProgramSpec::from_sources(VS, FS));
        service.shutdown();
        assert_eq!(queued.state(), TokenState::Cancelled);
        assert!(busy.state().is_terminal());
        // the queued program never reached the driver
        let compiles = driver
            .events()
            .iter()
            .filter(|e| e.starts_with("compile:"))
            .count();
        assert_eq!(compiles, 2);
    }

    // ========== driver-async mode ==========

    #[test]
    fn test_driver_async_finalizes_after_latency_polls() {
        let (driver, mut service) = async_service();
        driver.set_link_latency(2);
        let token = service.create_program("warp", ProgramSpec::from_sources(VS, FS));
        assert_eq!(token.state(), TokenState::Compiling);
        service.tick();
        assert!(!token.is_ready());
        service.tick();
        assert!(!token.is_ready());
        service.tick();
        assert!(token.is_ready());
        assert_eq!(token.state(), TokenState::Ready);
        assert!(service.get_program(token).is_valid());
    }

    #[test]
    fn test_driver_async_get_program_blocks_via_forced_query() {
        let (driver, mut service) = async_service();
        driver.set_link_latency(1000);
        let token = service.create_program("sky", ProgramSpec::from_sources(VS, FS));
        // never ticked: the forced link-status query completes the program
        assert!(service.get_program(token).is_valid());
    }

    #[test]
    fn test_driver_async_link_failure() {
        let (driver, mut service) = async_service();
        driver.set_link_latency(1);
        driver.set_link_error("undefined symbol: u_bones");
        let token = service.create_program("skinned", ProgramSpec::from_sources(VS, FS));
        service.tick();
        service.tick();
        assert_eq!(token.state(), TokenState::Error);
        assert!(matches!(
            token.error(),
            Some(CompilerError::ProgramLinking(_))
        ));
        assert_eq!(service.get_program(token), ProgramHandle::INVALID);
        assert_eq!(driver.alive_programs(), 0);
    }

    // ========== tick ordering ==========

    #[test]
    fn test_tick_finalizes_in_insertion_order() {
        let (driver, mut service) = async_service();
        let a = service.create_program("a", ProgramSpec::from_sources(VS, FS));
        let b = service.create_program("b", ProgramSpec::from_sources(VS, FS));
        let c = service.create_program("c", ProgramSpec::from_sources(VS, FS));
        service.tick();
        let polls: Vec<String> = driver
            .events()
            .into_iter()
            .filter(|e| e.starts_with("poll:"))
            .collect();
        // program names are allocated sequentially: a=3, b=6, c=9
        assert_eq!(polls, ["poll:3", "poll:6", "poll:9"]);
        for token in [a, b, c] {
            assert_eq!(token.state(), TokenState::Ready);
            service.terminate(token);
        }
    }

    #[test]
    fn test_op_created_after_drain_waits_for_next_tick() {
        let (_d, mut service) = async_service();
        service.tick();
        let late = service.create_program("late", ProgramSpec::from_sources(VS, FS));
        assert!(!late.is_ready());
        service.tick();
        assert!(late.is_ready());
        service.terminate(late);
    }

    #[test]
    fn test_terminate_cancels_pending_tick_op() {
        let (driver, mut service) = async_service();
        let a = service.create_program("a", ProgramSpec::from_sources(VS, FS));
        let b = service.create_program("b", ProgramSpec::from_sources(VS, FS));
        let c = service.create_program("c", ProgramSpec::from_sources(VS, FS));
        service.terminate(b);
        service.tick();
        let polls: Vec<String> = driver
            .events()
            .into_iter()
            .filter(|e| e.starts_with("poll:"))
            .collect();
        // b's program (6) is never polled, and its objects are gone
        assert_eq!(polls, ["poll:3", "poll:9"]);
        assert!(driver.events().iter().any(|e| e == "delete_program:6"));
        assert_eq!(a.state(), TokenState::Ready);
        assert_eq!(c.state(), TokenState::Ready);
        service.terminate(a);
        service.terminate(c);
    }

    // ========== completion barrier ==========

    #[test]
    fn test_barrier_fires_once_after_all_tracked_tokens() {
        let (driver, mut service) = pool_service();
        driver.set_compile_delay(Duration::from_millis(50));
        let a = service.create_program("a", ProgramSpec::from_sources(VS, FS));
        let b = service.create_program("b", ProgramSpec::from_sources(VS, FS));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        service.notify_when_all_programs_ready(Priority::High, None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        // outstanding work: the barrier must hold
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wait_until("both publish", || a.is_ready() && b.is_ready());
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // and never again
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        service.terminate(a);
        service.terminate(b);
    }

    #[test]
    fn test_barrier_with_nothing_outstanding_fires_on_next_tick() {
        let (_d, mut service) = pool_service();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        service.notify_when_all_programs_ready(Priority::Low, None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        // not synchronously...
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // ...but on the very next tick
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_high_barrier_ignores_low_tokens() {
        let (driver, mut service) = async_service();
        driver.set_link_latency(1000);
        let background = service.create_program(
            "background",
            ProgramSpec::from_sources(VS, FS).with_priority(Priority::Low),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        service.notify_when_all_programs_ready(Priority::High, None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        service.terminate(background);
    }

    #[test]
    fn test_low_barrier_tracks_both_classes() {
        let (driver, mut service) = async_service();
        driver.set_link_latency(1);
        let low = service.create_program(
            "low",
            ProgramSpec::from_sources(VS, FS).with_priority(Priority::Low),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        service.notify_when_all_programs_ready(Priority::Low, None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        service.terminate(low);
    }

    #[test]
    fn test_barrier_counts_cancelled_tokens_as_done() {
        let (driver, mut service) = async_service();
        driver.set_link_latency(1000);
        let token = service.create_program("stuck", ProgramSpec::from_sources(VS, FS));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        service.notify_when_all_programs_ready(Priority::High, None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        service.terminate(token);
        service.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_barrier_delivers_through_handler() {
        let (_d, mut service) = pool_service();
        let (handler, receiver) = ChannelHandler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        service.notify_when_all_programs_ready(Priority::Low, Some(handler), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        service.tick();
        // posted, not yet run
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        for callback in receiver.try_iter() {
            callback();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // ========== token misc ==========

    #[test]
    fn test_user_data_round_trip() {
        let (_d, mut service) = sync_service();
        let token = service.create_program("x", ProgramSpec::from_sources(VS, FS));
        token.set_user_data(Arc::new("material-17".to_string()));
        let data = token.user_data().unwrap();
        assert_eq!(
            data.downcast_ref::<String>().map(String::as_str),
            Some("material-17")
        );
        service.terminate(token);
    }

    #[test]
    fn test_terminate_ready_token_releases_program() {
        let (driver, mut service) = sync_service();
        let token = service.create_program("x", ProgramSpec::from_sources(VS, FS));
        assert_eq!(driver.alive_programs(), 1);
        service.terminate(token);
        assert_eq!(driver.alive_programs(), 0);
    }
}
