//! The bytecode virtual machine: masked, SIMD-over-vertices execution of a
//! [`crate::compiler::codegen::CompiledShader`] over a [`crate::grid::Grid`].

pub mod builtins;
pub mod machine;
pub mod mask;
pub mod opcode;
