//! Orchestrates the compile pipeline (lex -> parse -> codegen) into an
//! immutable [`Shader`] artifact many grids may reference, and the optional
//! on-disk compiled-shader form: compile once, cache, hand out shared,
//! immutable handles rather than recompiling per use.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::compiler::ast::ShaderKind;
use crate::compiler::codegen::{self, CompiledParam, CompiledShader};
use crate::compiler::lexer::Lexer;
use crate::compiler::parser::Parser;
use crate::config::Config;
use crate::error::RenderError;
use crate::symbol::SymbolTable;
use crate::value::{ValueStorage, ValueType};
use crate::vm::opcode::{ArithOp, CompareOp, ConstantValue, Instruction, LogicalOp};

pub const MAGIC: [u8; 4] = *b"SWSH";
pub const VERSION: u32 = 1;

/// A compiled, immutable shader program. Cheap to clone (wraps the compiled
/// form in an `Arc`) so many grids can reference the same program.
#[derive(Debug, Clone)]
pub struct Shader {
    pub name: String,
    compiled: Arc<CompiledShader>,
}

impl Shader {
    /// Lexes, parses, and compiles `source` against `symbol_table`.
    /// `symbol_table` should already have
    /// [`crate::vm::builtins::register_builtins`] applied.
    pub fn compile(name: impl Into<String>, source: &str, symbol_table: &SymbolTable) -> Result<Shader, RenderError> {
        let name = name.into();
        log::debug!("compiling shader \"{name}\"");
        let tokens = Lexer::tokenize(source)?;
        let decl = Parser::parse_shader(tokens)?;
        let compiled = codegen::compile(&decl, symbol_table)?;
        log::debug!("compiled shader \"{name}\" ({} instructions)", compiled.body.len());
        Ok(Shader {
            name,
            compiled: Arc::new(compiled),
        })
    }

    /// Reads `name` (resolved through `config`) from disk and compiles it.
    /// File I/O and `RenderError` both convert into `anyhow::Error`, so the
    /// caller at this boundary only needs to propagate with `?`, not match.
    pub fn compile_from_path(name: &str, config: &Config, symbol_table: &SymbolTable) -> anyhow::Result<Shader> {
        let path = config.resolve(name);
        let source = read_source(&path)?;
        let shader = Shader::compile(name, &source, symbol_table)?;
        Ok(shader)
    }

    pub fn kind(&self) -> ShaderKind {
        self.compiled.kind
    }

    pub fn compiled(&self) -> &CompiledShader {
        &self.compiled
    }

    pub fn params(&self) -> &[CompiledParam] {
        &self.compiled.params
    }

    /// Serializes to the on-disk artifact format. Little-endian throughout;
    /// every multi-byte field is written with `to_le_bytes`.
    pub fn to_artifact_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.compiled.params.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.compiled.constants.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.compiled.body.len() as u32).to_le_bytes());

        out.push(shader_kind_tag(self.compiled.kind));
        write_string(&mut out, &self.name);

        // symbol table: one entry per declared parameter, since parameters
        // are the only symbols a shader exposes to a caller (locals and
        // synthetic slots are private to the body).
        for param in &self.compiled.params {
            write_string(&mut out, &param.name);
            out.push(value_type_tag(param.ty));
            out.push(value_storage_tag(param.storage));
            out.push(param.default.is_some() as u8);
            let default_instrs = param.default.as_deref().unwrap_or(&[]);
            out.extend_from_slice(&(default_instrs.len() as u32).to_le_bytes());
            for instr in default_instrs {
                write_instruction(&mut out, instr);
            }
        }

        for constant in &self.compiled.constants {
            write_constant(&mut out, constant);
        }

        for instr in &self.compiled.body {
            write_instruction(&mut out, instr);
        }

        // slot table, appended after the fixed header sections: every
        // grid-value name the body references plus its (type, storage),
        // so `from_artifact_bytes` can reconstruct a `CompiledShader` with
        // no access to the original source.
        out.extend_from_slice(&(self.compiled.slot_names.len() as u32).to_le_bytes());
        for (name, (ty, storage)) in self.compiled.slot_names.iter().zip(&self.compiled.slot_types) {
            write_string(&mut out, name);
            out.push(value_type_tag(*ty));
            out.push(value_storage_tag(*storage));
        }

        out
    }

    pub fn from_artifact_bytes(bytes: &[u8]) -> Result<Shader, RenderError> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.take(4)?;
        if magic != MAGIC {
            return Err(artifact_err("bad magic, not a SWSH artifact"));
        }
        let version = cursor.read_u32()?;
        if version != VERSION {
            return Err(artifact_err(format!("unsupported artifact version {version}")));
        }
        let param_count = cursor.read_u32()? as usize;
        let constant_count = cursor.read_u32()? as usize;
        let instruction_count = cursor.read_u32()? as usize;
        let kind = shader_kind_from_tag(cursor.read_u8()?)?;
        let name = cursor.read_string()?;

        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let pname = cursor.read_string()?;
            let ty = value_type_from_tag(cursor.read_u8()?)?;
            let storage = value_storage_from_tag(cursor.read_u8()?)?;
            let has_default = cursor.read_u8()? != 0;
            let default_len = cursor.read_u32()? as usize;
            let mut default_instrs = Vec::with_capacity(default_len);
            for _ in 0..default_len {
                default_instrs.push(read_instruction(&mut cursor)?);
            }
            params.push(CompiledParam {
                name: pname,
                ty,
                storage,
                default: has_default.then_some(default_instrs),
            });
        }

        let mut constants = Vec::with_capacity(constant_count);
        for _ in 0..constant_count {
            constants.push(read_constant(&mut cursor)?);
        }

        let mut body = Vec::with_capacity(instruction_count);
        for _ in 0..instruction_count {
            body.push(read_instruction(&mut cursor)?);
        }

        let slot_count = cursor.read_u32()? as usize;
        let mut slot_names = Vec::with_capacity(slot_count);
        let mut slot_types = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slot_names.push(cursor.read_string()?);
            let ty = value_type_from_tag(cursor.read_u8()?)?;
            let storage = value_storage_from_tag(cursor.read_u8()?)?;
            slot_types.push((ty, storage));
        }

        let compiled = CompiledShader {
            kind,
            params,
            body,
            constants,
            slot_names,
            slot_types,
        };
        Ok(Shader {
            name,
            compiled: Arc::new(compiled),
        })
    }
}

fn artifact_err(message: impl Into<String>) -> RenderError {
    RenderError::ResourceMissing { message: message.into() }
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading shader source from {}", path.display()))
}

fn shader_kind_tag(kind: ShaderKind) -> u8 {
    match kind {
        ShaderKind::Surface => 0,
        ShaderKind::Displacement => 1,
        ShaderKind::Light => 2,
        ShaderKind::Volume => 3,
        ShaderKind::Imager => 4,
    }
}

fn shader_kind_from_tag(tag: u8) -> Result<ShaderKind, RenderError> {
    Ok(match tag {
        0 => ShaderKind::Surface,
        1 => ShaderKind::Displacement,
        2 => ShaderKind::Light,
        3 => ShaderKind::Volume,
        4 => ShaderKind::Imager,
        other => return Err(artifact_err(format!("unknown shader kind tag {other}"))),
    })
}

/// Declaration order: float, integer, color, point, vector, normal,
/// matrix, string.
fn value_type_tag(ty: ValueType) -> u8 {
    match ty {
        ValueType::Float => 0,
        ValueType::Integer => 1,
        ValueType::Color => 2,
        ValueType::Point => 3,
        ValueType::Vector => 4,
        ValueType::Normal => 5,
        ValueType::Matrix => 6,
        ValueType::String => 7,
    }
}

fn value_type_from_tag(tag: u8) -> Result<ValueType, RenderError> {
    Ok(match tag {
        0 => ValueType::Float,
        1 => ValueType::Integer,
        2 => ValueType::Color,
        3 => ValueType::Point,
        4 => ValueType::Vector,
        5 => ValueType::Normal,
        6 => ValueType::Matrix,
        7 => ValueType::String,
        other => return Err(artifact_err(format!("unknown value type tag {other}"))),
    })
}

/// Declaration order: constant, uniform, varying, vertex.
fn value_storage_tag(storage: ValueStorage) -> u8 {
    match storage {
        ValueStorage::Constant => 0,
        ValueStorage::Uniform => 1,
        ValueStorage::Varying => 2,
        ValueStorage::Vertex => 3,
    }
}

fn value_storage_from_tag(tag: u8) -> Result<ValueStorage, RenderError> {
    Ok(match tag {
        0 => ValueStorage::Constant,
        1 => ValueStorage::Uniform,
        2 => ValueStorage::Varying,
        3 => ValueStorage::Vertex,
        other => return Err(artifact_err(format!("unknown value storage tag {other}"))),
    })
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_constant(out: &mut Vec<u8>, constant: &ConstantValue) {
    match constant {
        ConstantValue::Float(f) => {
            out.push(0);
            out.extend_from_slice(&f.to_le_bytes());
        }
        ConstantValue::Integer(i) => {
            out.push(1);
            out.extend_from_slice(&i.to_le_bytes());
        }
        ConstantValue::String(s) => {
            out.push(2);
            write_string(out, s);
        }
    }
}

fn read_constant(cursor: &mut Cursor) -> Result<ConstantValue, RenderError> {
    match cursor.read_u8()? {
        0 => Ok(ConstantValue::Float(f64::from_le_bytes(cursor.take(8)?.try_into().unwrap()))),
        1 => Ok(ConstantValue::Integer(i64::from_le_bytes(cursor.take(8)?.try_into().unwrap()))),
        2 => Ok(ConstantValue::String(cursor.read_string()?)),
        other => Err(artifact_err(format!("unknown constant tag {other}"))),
    }
}

/// Fixed-width instruction encoding: one opcode byte followed by two u32
/// operand words (unused words are zero). Room for up to 256 opcodes.
fn write_instruction(out: &mut Vec<u8>, instr: &Instruction) {
    let (op, a, b): (u8, u32, u32) = match instr {
        Instruction::LoadConst(i) => (0, *i, 0),
        Instruction::LoadVar(i) => (1, *i, 0),
        Instruction::StoreVar(i) => (2, *i, 0),
        Instruction::Arith(op) => (3, arith_tag(*op) as u32, 0),
        Instruction::Neg => (4, 0, 0),
        Instruction::Not => (5, 0, 0),
        Instruction::Compare(op) => (6, compare_tag(*op) as u32, 0),
        Instruction::Logical(op) => (7, logical_tag(*op) as u32, 0),
        Instruction::Cast(ty) => (8, value_type_tag(*ty) as u32, 0),
        Instruction::Construct(ty, n) => (9, value_type_tag(*ty) as u32, *n as u32),
        Instruction::Dup => (10, 0, 0),
        Instruction::Pop => (11, 0, 0),
        Instruction::Jump(pc) => (12, *pc, 0),
        Instruction::JumpIfFalseUniform(pc) => (13, *pc, 0),
        Instruction::PushMask => (14, 0, 0),
        Instruction::PushMaskInverted => (15, 0, 0),
        Instruction::PopMask => (16, 0, 0),
        Instruction::LoopBegin { loop_end_pc } => (17, *loop_end_pc, 0),
        Instruction::LoopPredicate { loop_end_pc } => (18, *loop_end_pc, 0),
        Instruction::LoopEnd { loop_begin_pc } => (19, *loop_begin_pc, 0),
        Instruction::LoopStepMask => (20, 0, 0),
        Instruction::Break(level) => (21, *level, 0),
        Instruction::Continue(level) => (22, *level, 0),
        Instruction::UniformLoopPredicate { loop_end_pc } => (23, *loop_end_pc, 0),
        Instruction::IlluminanceBegin { loop_end_pc } => (24, *loop_end_pc, 0),
        Instruction::IlluminanceNext { loop_end_pc } => (25, *loop_end_pc, 0),
        Instruction::IlluminanceEnd { loop_begin_pc } => (26, *loop_begin_pc, 0),
        Instruction::CallBuiltin { id, arg_count } => (27, *id, *arg_count as u32),
        Instruction::Return => (28, 0, 0),
    };
    out.push(op);
    out.extend_from_slice(&a.to_le_bytes());
    out.extend_from_slice(&b.to_le_bytes());
}

fn read_instruction(cursor: &mut Cursor) -> Result<Instruction, RenderError> {
    let op = cursor.read_u8()?;
    let a = cursor.read_u32()?;
    let b = cursor.read_u32()?;
    Ok(match op {
        0 => Instruction::LoadConst(a),
        1 => Instruction::LoadVar(a),
        2 => Instruction::StoreVar(a),
        3 => Instruction::Arith(arith_from_tag(a as u8)?),
        4 => Instruction::Neg,
        5 => Instruction::Not,
        6 => Instruction::Compare(compare_from_tag(a as u8)?),
        7 => Instruction::Logical(logical_from_tag(a as u8)?),
        8 => Instruction::Cast(value_type_from_tag(a as u8)?),
        9 => Instruction::Construct(value_type_from_tag(a as u8)?, b as u8),
        10 => Instruction::Dup,
        11 => Instruction::Pop,
        12 => Instruction::Jump(a),
        13 => Instruction::JumpIfFalseUniform(a),
        14 => Instruction::PushMask,
        15 => Instruction::PushMaskInverted,
        16 => Instruction::PopMask,
        17 => Instruction::LoopBegin { loop_end_pc: a },
        18 => Instruction::LoopPredicate { loop_end_pc: a },
        19 => Instruction::LoopEnd { loop_begin_pc: a },
        20 => Instruction::LoopStepMask,
        21 => Instruction::Break(a),
        22 => Instruction::Continue(a),
        23 => Instruction::UniformLoopPredicate { loop_end_pc: a },
        24 => Instruction::IlluminanceBegin { loop_end_pc: a },
        25 => Instruction::IlluminanceNext { loop_end_pc: a },
        26 => Instruction::IlluminanceEnd { loop_begin_pc: a },
        27 => Instruction::CallBuiltin { id: a, arg_count: b as u8 },
        28 => Instruction::Return,
        other => return Err(artifact_err(format!("unknown opcode {other}"))),
    })
}

fn arith_tag(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add => 0,
        ArithOp::Sub => 1,
        ArithOp::Mul => 2,
        ArithOp::Div => 3,
    }
}
fn arith_from_tag(tag: u8) -> Result<ArithOp, RenderError> {
    Ok(match tag {
        0 => ArithOp::Add,
        1 => ArithOp::Sub,
        2 => ArithOp::Mul,
        3 => ArithOp::Div,
        other => return Err(artifact_err(format!("unknown arith tag {other}"))),
    })
}

fn compare_tag(op: CompareOp) -> u8 {
    match op {
        CompareOp::Eq => 0,
        CompareOp::Ne => 1,
        CompareOp::Lt => 2,
        CompareOp::Le => 3,
        CompareOp::Gt => 4,
        CompareOp::Ge => 5,
    }
}
fn compare_from_tag(tag: u8) -> Result<CompareOp, RenderError> {
    Ok(match tag {
        0 => CompareOp::Eq,
        1 => CompareOp::Ne,
        2 => CompareOp::Lt,
        3 => CompareOp::Le,
        4 => CompareOp::Gt,
        5 => CompareOp::Ge,
        other => return Err(artifact_err(format!("unknown compare tag {other}"))),
    })
}

fn logical_tag(op: LogicalOp) -> u8 {
    match op {
        LogicalOp::And => 0,
        LogicalOp::Or => 1,
    }
}
fn logical_from_tag(tag: u8) -> Result<LogicalOp, RenderError> {
    Ok(match tag {
        0 => LogicalOp::And,
        1 => LogicalOp::Or,
        other => return Err(artifact_err(format!("unknown logical tag {other}"))),
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RenderError> {
        if self.pos + n > self.bytes.len() {
            return Err(artifact_err("artifact truncated"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, RenderError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, RenderError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_string(&mut self) -> Result<String, RenderError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| artifact_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builtins::register_builtins;

    #[test]
    fn compiles_a_trivial_surface_shader() {
        let mut table = SymbolTable::new();
        register_builtins(&mut table);
        let shader = Shader::compile("s", "surface s(uniform float Ka = 1) { varying float y; y = Ka; }", &table).unwrap();
        assert_eq!(shader.kind(), ShaderKind::Surface);
        assert_eq!(shader.params().len(), 1);
    }

    #[test]
    fn artifact_round_trips_through_bytes() {
        let mut table = SymbolTable::new();
        register_builtins(&mut table);
        let shader = Shader::compile(
            "s",
            "surface s(uniform float Ka = 1) { varying float y; y = Ka + sqrt(4.0); }",
            &table,
        )
        .unwrap();
        let bytes = shader.to_artifact_bytes();
        assert_eq!(&bytes[0..4], &MAGIC);
        let restored = Shader::from_artifact_bytes(&bytes).unwrap();
        assert_eq!(restored.name, shader.name);
        assert_eq!(restored.kind(), shader.kind());
        assert_eq!(restored.compiled().body.len(), shader.compiled().body.len());
        assert_eq!(restored.compiled().constants.len(), shader.compiled().constants.len());
    }

    #[test]
    fn compile_from_path_resolves_and_compiles_a_file() {
        let dir = std::env::temp_dir().join(format!("reyes-shading-core-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("matte.sl"), "surface matte(uniform float Kd = 1) { Ci = Kd; }").unwrap();
        let config = Config { shaders_path: dir.clone(), shader_include_path: Vec::new() };
        let mut table = SymbolTable::new();
        register_builtins(&mut table);
        let shader = Shader::compile_from_path("matte", &config, &table).unwrap();
        assert_eq!(shader.kind(), ShaderKind::Surface);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn compile_from_path_reports_missing_file_with_context() {
        let config = Config { shaders_path: std::env::temp_dir().join("reyes-shading-core-nonexistent"), shader_include_path: Vec::new() };
        let table = SymbolTable::new();
        let err = Shader::compile_from_path("nope", &config, &table).unwrap_err();
        assert!(err.to_string().contains("reading shader source"));
    }
}
