//! Scriptable in-memory driver for exercising the compiler service.
//!
//! All contexts created from one `MockDriver` share the same object table,
//! mirroring GL shared contexts. Tests can script compile failures by source
//! marker, link failures, a link-completion latency measured in poll steps
//! (for the parallel-compile path), and a wall-clock compile delay (to make
//! cancellation races observable). Every call is journaled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::driver::{DriverCaps, GlContext, GlDriver, ProgramHandle, ShaderHandle};
use crate::program::{AttributeBinding, ShaderStage};
use crate::CompilerError;

#[derive(Default)]
struct MockInner {
    next_name: u32,
    shaders: HashMap<u32, ShaderStage>,
    programs: HashMap<u32, MockProgram>,
    /// Sources containing this marker fail to compile.
    compile_error_marker: Option<(String, String)>,
    /// When set, every link fails with this log.
    link_error_log: Option<String>,
    /// Poll steps before `is_program_complete` reports true.
    link_latency: u32,
    /// Wall-clock delay inside `compile_shader`.
    compile_delay: Option<Duration>,
    /// Journal of calls, e.g. `compile:vertex`, `link:2`, `poll:3`,
    /// `delete_program:3`.
    events: Vec<String>,
}

struct MockProgram {
    steps_left: u32,
    link_ok: bool,
    log: String,
}

/// Shared state behind every context of one driver.
struct MockState {
    inner: Mutex<MockInner>,
}

/// A mock driver context; cheap to clone into worker threads.
#[derive(Clone)]
pub struct MockContext {
    state: Arc<MockState>,
}

/// The scriptable driver.
pub struct MockDriver {
    caps: DriverCaps,
    primary: MockContext,
}

impl MockDriver {
    pub fn new(caps: DriverCaps) -> Self {
        let state = Arc::new(MockState {
            inner: Mutex::new(MockInner {
                next_name: 1,
                ..MockInner::default()
            }),
        });
        Self {
            caps,
            primary: MockContext { state },
        }
    }

    /// Any source containing `marker` fails to compile with `log`.
    pub fn set_compile_error(&self, marker: &str, log: &str) {
        self.primary.state.inner.lock().compile_error_marker =
            Some((marker.to_string(), log.to_string()));
    }

    /// Every subsequent link fails with `log`.
    pub fn set_link_error(&self, log: &str) {
        self.primary.state.inner.lock().link_error_log = Some(log.to_string());
    }

    /// Programs report incomplete for the next `steps` completion polls.
    pub fn set_link_latency(&self, steps: u32) {
        self.primary.state.inner.lock().link_latency = steps;
    }

    /// Sleep this long inside every compile call.
    pub fn set_compile_delay(&self, delay: Duration) {
        self.primary.state.inner.lock().compile_delay = Some(delay);
    }

    /// Journal of driver calls so far.
    pub fn events(&self) -> Vec<String> {
        self.primary.state.inner.lock().events.clone()
    }

    /// Shader objects not yet deleted.
    pub fn alive_shaders(&self) -> usize {
        self.primary.state.inner.lock().shaders.len()
    }

    /// Program objects not yet deleted.
    pub fn alive_programs(&self) -> usize {
        self.primary.state.inner.lock().programs.len()
    }
}

impl GlDriver for MockDriver {
    fn caps(&self) -> DriverCaps {
        self.caps
    }

    fn primary_context(&self) -> &dyn GlContext {
        &self.primary
    }

    fn create_shared_context(&self) -> Result<Box<dyn GlContext + Send>, CompilerError> {
        if !self.caps.contains(DriverCaps::SHARED_CONTEXTS) {
            return Err(CompilerError::ContextCreation(
                "driver does not support shared contexts".to_string(),
            ));
        }
        Ok(Box::new(self.primary.clone()))
    }
}

impl GlContext for MockContext {
    fn compile_shader(
        &self,
        stage: ShaderStage,
        source: &str,
    ) -> Result<ShaderHandle, CompilerError> {
        let delay = {
            let mut inner = self.state.inner.lock();
            inner.events.push(format!("compile:{}", stage.name()));
            if let Some((marker, log)) = &inner.compile_error_marker {
                if source.contains(marker.as_str()) {
                    return Err(CompilerError::ShaderCompilation(log.clone()));
                }
            }
            inner.compile_delay
        };
        // sleep outside the lock so other contexts stay usable
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut inner = self.state.inner.lock();
        let name = inner.next_name;
        inner.next_name += 1;
        inner.shaders.insert(name, stage);
        Ok(ShaderHandle(name))
    }

    fn link_program(
        &self,
        shaders: &[ShaderHandle],
        _attributes: &[AttributeBinding],
    ) -> Result<ProgramHandle, CompilerError> {
        let mut inner = self.state.inner.lock();
        inner.events.push(format!("link:{}", shaders.len()));
        if let Some(log) = &inner.link_error_log {
            // a parallel-compile driver defers the failure to the status query
            let log = log.clone();
            if inner.link_latency == 0 {
                return Err(CompilerError::ProgramLinking(log));
            }
            let name = inner.next_name;
            inner.next_name += 1;
            let steps = inner.link_latency;
            inner.programs.insert(
                name,
                MockProgram {
                    steps_left: steps,
                    link_ok: false,
                    log,
                },
            );
            return Ok(ProgramHandle(name));
        }
        let name = inner.next_name;
        inner.next_name += 1;
        let steps = inner.link_latency;
        inner.programs.insert(
            name,
            MockProgram {
                steps_left: steps,
                link_ok: true,
                log: String::new(),
            },
        );
        Ok(ProgramHandle(name))
    }

    fn is_program_complete(&self, program: ProgramHandle) -> bool {
        let mut inner = self.state.inner.lock();
        inner.events.push(format!("poll:{}", program.0));
        match inner.programs.get_mut(&program.0) {
            Some(p) if p.steps_left > 0 => {
                p.steps_left -= 1;
                false
            }
            Some(_) => true,
            None => true,
        }
    }

    fn program_link_ok(&self, program: ProgramHandle) -> bool {
        let mut inner = self.state.inner.lock();
        match inner.programs.get_mut(&program.0) {
            Some(p) => {
                // querying link status forces completion, as in GL
                p.steps_left = 0;
                p.link_ok
            }
            None => false,
        }
    }

    fn program_info_log(&self, program: ProgramHandle) -> String {
        self.state
            .inner
            .lock()
            .programs
            .get(&program.0)
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    fn delete_shader(&self, shader: ShaderHandle) {
        let mut inner = self.state.inner.lock();
        inner.events.push(format!("delete_shader:{}", shader.0));
        inner.shaders.remove(&shader.0);
    }

    fn delete_program(&self, program: ProgramHandle) {
        let mut inner = self.state.inner.lock();
        inner.events.push(format!("delete_program:{}", program.0));
        inner.programs.remove(&program.0);
    }
}
