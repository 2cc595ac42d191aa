//! An offline, REYES-style surface renderer's shading core: a typed shading
//! language compiler and a masked, SIMD-over-vertices virtual machine, a
//! parametric geometry model and dicer, and the facade tying them
//! together.

pub mod config;
pub mod error;
pub mod value;
pub mod grid;
pub mod symbol;
pub mod compiler;
pub mod vm;
pub mod geometry;
pub mod shader;
pub mod renderer;

pub use config::Config;
pub use error::RenderError;
pub use grid::Grid;
pub use renderer::Renderer;
pub use shader::Shader;
