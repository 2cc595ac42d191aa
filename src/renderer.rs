//! The top-level facade: owns the symbol table and error policy, manages
//! the active light-shader list, and dispatches surface/light shading onto
//! grids. A handle stays valid and keeps its place in activation order
//! across deactivate/reactivate.

use crate::error::{ErrorPolicy, RenderError};
use crate::grid::{Grid, LightHandle, LightSample};
use crate::shader::Shader;
use crate::symbol::SymbolTable;
use crate::vm::builtins::register_builtins;
use crate::vm::machine::{CancellationToken, VirtualMachine};

struct LightEntry {
    shader: Shader,
    grid: Grid,
    active: bool,
}

/// Owns everything shared across a render: the symbol table shaders compile
/// against, the error policy they report through, and the set of currently
/// registered light shaders. `begin()`/`end()` bracket one render; light
/// (de)activation is only valid between them, serialized by `&mut self`.
pub struct Renderer {
    symbol_table: SymbolTable,
    error_policy: ErrorPolicy,
    lights: Vec<LightEntry>,
    cancellation: CancellationToken,
    running: bool,
}

impl Default for Renderer {
    fn default() -> Self {
        Renderer::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        register_builtins(&mut symbol_table);
        Renderer {
            symbol_table,
            error_policy: ErrorPolicy::default(),
            lights: Vec::new(),
            cancellation: CancellationToken::new(),
            running: false,
        }
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn symbol_table(&self) -> &SymbolTable {
        &self.symbol_table
    }

    pub fn symbol_table_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbol_table
    }

    pub fn error_policy(&self) -> &ErrorPolicy {
        &self.error_policy
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Requests cooperative cancellation; in-flight and future `shade`
    /// calls halt at the next polled instruction.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn begin(&mut self) -> Result<(), RenderError> {
        if self.running {
            return Err(RenderError::ResourceMissing {
                message: "begin() called while a render is already active".into(),
            });
        }
        log::info!("renderer: begin");
        self.running = true;
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), RenderError> {
        if !self.running {
            return Err(RenderError::ResourceMissing {
                message: "end() called without a matching begin()".into(),
            });
        }
        log::info!("renderer: end");
        self.running = false;
        Ok(())
    }

    fn require_running(&self) -> Result<(), RenderError> {
        if !self.running {
            return Err(RenderError::ResourceMissing {
                message: "light shader operations require an active begin()/end() bracket".into(),
            });
        }
        Ok(())
    }

    /// Registers a light shader, runs its `initialize()` on a fresh
    /// uninitialized grid (parameter defaults only — a light shader has no
    /// surface geometry to sample), and activates it. Returns a handle
    /// stable across later deactivate/reactivate.
    pub fn light_shader(&mut self, shader: Shader) -> Result<LightHandle, RenderError> {
        self.require_running()?;
        let mut grid = Grid::new();
        grid.resize(1, 1);
        {
            let mut vm = VirtualMachine::new(shader.compiled(), &mut grid).with_cancellation(self.cancellation.clone());
            vm.bind_defaults()?;
        }
        let handle = LightHandle(self.lights.len());
        self.lights.push(LightEntry { shader, grid, active: true });
        Ok(handle)
    }

    pub fn activate_light_shader(&mut self, handle: LightHandle) -> Result<(), RenderError> {
        self.require_running()?;
        let entry = self.lights.get_mut(handle.0).ok_or_else(|| RenderError::ResourceMissing {
            message: "unknown light handle".into(),
        })?;
        entry.active = true;
        Ok(())
    }

    pub fn deactivate_light_shader(&mut self, handle: LightHandle) -> Result<(), RenderError> {
        self.require_running()?;
        let entry = self.lights.get_mut(handle.0).ok_or_else(|| RenderError::ResourceMissing {
            message: "unknown light handle".into(),
        })?;
        entry.active = false;
        Ok(())
    }

    /// Re-runs every active light shader's body against its own private
    /// grid, captures the `Cl`/`L` it left behind, and appends one
    /// [`LightHandle`]/[`LightSample`] pair per active light, in activation
    /// order, for the `illuminance`/`solar` builtins to iterate.
    pub fn light_shade(&mut self, grid: &mut Grid) -> Result<(), RenderError> {
        self.require_running()?;
        grid.clear_lights();
        for (index, entry) in self.lights.iter_mut().enumerate() {
            if !entry.active {
                continue;
            }
            let mut vm = VirtualMachine::new(entry.shader.compiled(), &mut entry.grid).with_cancellation(self.cancellation.clone());
            match vm.shade() {
                Ok(()) => {
                    let sample = light_sample(&entry.grid);
                    grid.push_light(LightHandle(index), sample);
                }
                Err(e) => self.error_policy.report(e)?,
            }
        }
        Ok(())
    }

    /// Runs one surface/displacement/volume/imager shader's body over
    /// `grid`. Parameter defaults are bound first for any parameter the
    /// grid doesn't already carry.
    pub fn surface_shade(&self, grid: &mut Grid, shader: &Shader) -> Result<(), RenderError> {
        let mut vm = VirtualMachine::new(shader.compiled(), grid).with_cancellation(self.cancellation.clone());
        vm.bind_defaults()?;
        vm.shade()
    }
}

/// A light's private grid is always 1x1 (one uniform sample, not one per
/// surface vertex), so its `Cl`/`L` are read back as single vectors. A light
/// shader that never touches `Cl`/`L` contributes black with no direction.
fn light_sample(grid: &Grid) -> LightSample {
    let cl = grid
        .get("Cl")
        .and_then(|v| v.vec3_values().ok())
        .and_then(|v| v.first().copied())
        .unwrap_or_else(|| cgmath::Vector3::new(0.0, 0.0, 0.0));
    let l = grid
        .get("L")
        .and_then(|v| v.vec3_values().ok())
        .and_then(|v| v.first().copied())
        .unwrap_or_else(|| cgmath::Vector3::new(0.0, 0.0, 0.0));
    LightSample { cl, l }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn ambient_light_shader(renderer: &Renderer) -> Shader {
        Shader::compile(
            "ambientlight",
            "light ambientlight(uniform color Cl = 1) { Cl = Cl; }",
            renderer.symbol_table(),
        )
        .unwrap()
    }

    #[test]
    fn active_light_list_tracks_activation_order_across_deactivate_reactivate() {
        let mut renderer = Renderer::new();
        renderer.begin().unwrap();
        let shader = ambient_light_shader(&renderer);
        let light = renderer.light_shader(shader).unwrap();

        let mut grid = Grid::new();
        grid.resize(2, 2);
        grid.add_value("P", ValueType::Point).unwrap();
        renderer.light_shade(&mut grid).unwrap();
        assert_eq!(grid.lights().len(), 1);

        renderer.deactivate_light_shader(light).unwrap();
        let mut grid = Grid::new();
        grid.resize(2, 2);
        grid.add_value("P", ValueType::Point).unwrap();
        renderer.light_shade(&mut grid).unwrap();
        assert_eq!(grid.lights().len(), 0);

        renderer.activate_light_shader(light).unwrap();
        let mut grid = Grid::new();
        grid.resize(2, 2);
        grid.add_value("P", ValueType::Point).unwrap();
        renderer.light_shade(&mut grid).unwrap();
        assert_eq!(grid.lights().len(), 1);
    }

    #[test]
    fn illuminance_sees_the_light_shaders_cl_and_l() {
        let mut renderer = Renderer::new();
        renderer.begin().unwrap();
        let light_shader = Shader::compile(
            "distant",
            "light distant(uniform color Cl = 1) { Cl = Cl; L = vector(0, 0, 1); }",
            renderer.symbol_table(),
        )
        .unwrap();
        renderer.light_shader(light_shader).unwrap();

        let surface_shader = Shader::compile(
            "s",
            "surface s() { illuminance(P) { Ci = Ci + Cl; } }",
            renderer.symbol_table(),
        )
        .unwrap();

        let mut grid = Grid::new();
        grid.resize(2, 1);
        grid.add_value("P", ValueType::Point).unwrap();
        renderer.light_shade(&mut grid).unwrap();
        renderer.surface_shade(&mut grid, &surface_shader).unwrap();

        let ci = grid.get("Ci").unwrap().vec3_values().unwrap();
        assert_eq!(ci, &[cgmath::Vector3::new(1.0, 1.0, 1.0); 2]);
    }

    #[test]
    fn begin_without_matching_end_is_rejected() {
        let mut renderer = Renderer::new();
        renderer.begin().unwrap();
        assert!(renderer.begin().is_err());
    }

    #[test]
    fn cancellation_halts_shading_before_completion() {
        let mut renderer = Renderer::new();
        renderer.begin().unwrap();
        renderer.cancel();
        let shader = Shader::compile(
            "s",
            "surface s() { varying float y; y = 1; }",
            renderer.symbol_table(),
        )
        .unwrap();
        let mut grid = Grid::new();
        grid.resize(2, 2);
        let result = renderer.surface_shade(&mut grid, &shader);
        assert!(matches!(result, Err(RenderError::Cancelled)));
    }
}
