//! Program specification: everything a caller supplies to build one program.
//!
//! A `ProgramSpec` carries the per-stage GLSL sources, the specialization
//! constants folded into them before compilation, and the vertex attribute
//! bindings applied before linking. The spec travels with the compile request
//! and is retained until the compile actually runs.

/// Shader stages that can make up a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Short lowercase name, used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

/// Scheduling class for a compile request.
///
/// `High` is for programs needed this frame or the next; `Low` is for
/// background warm-up work. The worker pool always drains the high queue
/// before the low one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Low,
}

/// Value of a specialization constant, injected as a `#define`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpecConstValue {
    Bool(bool),
    Int(i32),
    Float(f32),
}

impl std::fmt::Display for SpecConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecConstValue::Bool(v) => write!(f, "{}", v),
            SpecConstValue::Int(v) => write!(f, "{}", v),
            SpecConstValue::Float(v) => write!(f, "{:?}", v),
        }
    }
}

/// A named specialization constant.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecializationConstant {
    pub name: String,
    pub value: SpecConstValue,
}

impl SpecializationConstant {
    pub fn new(name: &str, value: SpecConstValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// A vertex attribute bound to an explicit location before linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeBinding {
    pub name: String,
    pub location: u8,
}

/// Source for one shader stage.
#[derive(Debug, Clone)]
pub struct StageSource {
    pub stage: ShaderStage,
    pub source: String,
}

/// Everything needed to compile and link one program.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    /// Stage sources, compiled in order.
    pub stages: Vec<StageSource>,
    /// Constants folded into every stage as `#define`s.
    pub specialization: Vec<SpecializationConstant>,
    /// Attribute bindings applied before the link.
    pub attributes: Vec<AttributeBinding>,
    /// Scheduling class; defaults to `High` (needed-soon).
    pub priority: Priority,
}

impl Default for ProgramSpec {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            specialization: Vec::new(),
            attributes: Vec::new(),
            priority: Priority::High,
        }
    }
}

impl ProgramSpec {
    /// Create a spec from the usual vertex + fragment pair.
    pub fn from_sources(vertex_src: &str, fragment_src: &str) -> Self {
        Self {
            stages: vec![
                StageSource {
                    stage: ShaderStage::Vertex,
                    source: vertex_src.to_string(),
                },
                StageSource {
                    stage: ShaderStage::Fragment,
                    source: fragment_src.to_string(),
                },
            ],
            ..Self::default()
        }
    }

    /// Add another stage.
    pub fn with_stage(mut self, stage: ShaderStage, source: &str) -> Self {
        self.stages.push(StageSource {
            stage,
            source: source.to_string(),
        });
        self
    }

    /// Set the scheduling class.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a specialization constant.
    pub fn with_constant(mut self, name: &str, value: SpecConstValue) -> Self {
        self.specialization.push(SpecializationConstant::new(name, value));
        self
    }

    /// Bind a vertex attribute to a location.
    pub fn with_attribute(mut self, name: &str, location: u8) -> Self {
        self.attributes.push(AttributeBinding {
            name: name.to_string(),
            location,
        });
        self
    }
}
