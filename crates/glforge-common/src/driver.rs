//! Graphics driver abstraction the compiler service builds through.
//!
//! The service never calls a real GL API directly. Backends implement these
//! traits; tests use the scriptable mock in `crate::mock`. Context methods
//! must only be called from the thread the context is current on — the
//! service guarantees that by routing all primary-context work through the
//! driving thread and giving each worker its own shared context.

use bitflags::bitflags;

use crate::program::{AttributeBinding, ShaderStage};
use crate::CompilerError;

bitflags! {
    /// Capabilities the service adapts its execution mode to at init time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverCaps: u32 {
        /// Additional contexts can share GPU objects with the primary
        /// context, so compiled programs are usable across threads.
        const SHARED_CONTEXTS = 1 << 0;
        /// The driver compiles and links asynchronously behind synchronous-
        /// looking calls and exposes a non-blocking completion query
        /// (KHR_parallel_shader_compile style).
        const PARALLEL_COMPILE = 1 << 1;
    }
}

/// Raw shader object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u32);

/// Raw program object name. `0` is the invalid sentinel, as in GL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u32);

impl ProgramHandle {
    pub const INVALID: ProgramHandle = ProgramHandle(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// One driver context.
///
/// Compile and link calls may return before the driver has actually finished
/// the work when `DriverCaps::PARALLEL_COMPILE` is set; completion is then
/// observed through `is_program_complete` / `program_link_ok`.
pub trait GlContext {
    /// Compile one stage. An `Err` is a definitive compile failure with the
    /// driver's info log attached.
    fn compile_shader(
        &self,
        stage: ShaderStage,
        source: &str,
    ) -> Result<ShaderHandle, CompilerError>;

    /// Bind attributes and link the given shaders into a program. An `Err`
    /// is a definitive link failure with the info log attached.
    fn link_program(
        &self,
        shaders: &[ShaderHandle],
        attributes: &[AttributeBinding],
    ) -> Result<ProgramHandle, CompilerError>;

    /// Non-blocking completion query for an asynchronously linked program.
    /// Always true on drivers without `PARALLEL_COMPILE`.
    fn is_program_complete(&self, program: ProgramHandle) -> bool;

    /// Final link status. May block until the link finishes on drivers with
    /// `PARALLEL_COMPILE`; query `is_program_complete` first to avoid that.
    fn program_link_ok(&self, program: ProgramHandle) -> bool;

    /// Info log for a failed link.
    fn program_info_log(&self, program: ProgramHandle) -> String;

    fn delete_shader(&self, shader: ShaderHandle);

    fn delete_program(&self, program: ProgramHandle);
}

/// Entry point the service holds for the lifetime of the process.
pub trait GlDriver: Send + Sync {
    fn caps(&self) -> DriverCaps;

    /// The context owned by the driving thread.
    fn primary_context(&self) -> &dyn GlContext;

    /// Create a context sharing GPU objects with the primary one. Called
    /// once per worker thread; the returned context is moved into it.
    fn create_shared_context(&self) -> Result<Box<dyn GlContext + Send>, CompilerError>;
}
