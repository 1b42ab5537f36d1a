//! Shared types for the glforge shader build stack.
//!
//! Everything the compiler service needs from a graphics backend lives here:
//! the program specification, the driver traits it compiles through, source
//! preprocessing, and the mock driver the test suites run against.

pub mod driver;
pub mod mock;
pub mod preprocess;
pub mod program;

pub use driver::{DriverCaps, GlContext, GlDriver, ProgramHandle, ShaderHandle};
pub use program::{
    AttributeBinding, Priority, ProgramSpec, ShaderStage, SpecConstValue, SpecializationConstant,
    StageSource,
};

/// Errors produced while building a shader program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerError {
    /// Shader compilation failed (driver info log attached).
    ShaderCompilation(String),
    /// Program linking failed (driver info log attached).
    ProgramLinking(String),
    /// A shared driver context could not be created.
    ContextCreation(String),
    /// Generic error.
    Other(String),
}

impl std::fmt::Display for CompilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompilerError::ShaderCompilation(msg) => {
                write!(f, "Shader compilation error: {}", msg)
            }
            CompilerError::ProgramLinking(msg) => write!(f, "Program linking error: {}", msg),
            CompilerError::ContextCreation(msg) => write!(f, "Context creation error: {}", msg),
            CompilerError::Other(msg) => write!(f, "Compiler error: {}", msg),
        }
    }
}

impl std::error::Error for CompilerError {}
