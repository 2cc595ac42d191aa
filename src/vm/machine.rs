//! Stack-based, masked bytecode interpreter. Operates over whole grid
//! columns ([`Value`]s) rather than individual scalars, with an explicit
//! mask stack and loop-frame stack driving per-vertex control flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cgmath::{InnerSpace, Vector3};

use crate::compiler::codegen::CompiledShader;
use crate::error::RenderError;
use crate::grid::Grid;
use crate::value::{Value, ValueStorage, ValueType};
use crate::vm::builtins::{self, BuiltinContext};
use crate::vm::mask::{LoopFrame, Mask};
use crate::vm::opcode::{ArithOp, CompareOp, ConstantValue, Instruction, LogicalOp, SlotIndex};

/// Cooperative cancellation flag polled between grids. Clones share the
/// same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn runtime_err(message: impl Into<String>) -> RenderError {
    RenderError::RuntimeShadingError {
        vertex_count: None,
        message: message.into(),
    }
}

fn is_vectorlike(ty: ValueType) -> bool {
    matches!(ty, ValueType::Color | ValueType::Point | ValueType::Vector | ValueType::Normal)
}

fn combined_storage(a: ValueStorage, b: ValueStorage) -> ValueStorage {
    if a.is_varying() || b.is_varying() {
        ValueStorage::Varying
    } else if a == ValueStorage::Constant && b == ValueStorage::Constant {
        ValueStorage::Constant
    } else {
        ValueStorage::Uniform
    }
}

/// Interprets one [`CompiledShader`] against one [`Grid`], mutating it in
/// place. A fresh machine is built per grid; the VM state it carries
/// (operand/mask/loop stacks) does not outlive one `shade` call.
pub struct VirtualMachine<'a> {
    shader: &'a CompiledShader,
    grid: &'a mut Grid,
    operand_stack: Vec<Value>,
    mask_stack: Vec<Mask>,
    loop_stack: Vec<LoopFrame>,
    /// `(next_index, light_count)` per nested `illuminance` loop.
    illuminance_stack: Vec<(usize, usize)>,
    pc: usize,
    cancellation: Option<CancellationToken>,
}

impl<'a> VirtualMachine<'a> {
    pub fn new(shader: &'a CompiledShader, grid: &'a mut Grid) -> Self {
        VirtualMachine {
            shader,
            grid,
            operand_stack: Vec::new(),
            mask_stack: Vec::new(),
            loop_stack: Vec::new(),
            illuminance_stack: Vec::new(),
            pc: 0,
            cancellation: None,
        }
    }

    /// Polled between statements in the outer bytecode loop; on cancel the
    /// VM halts and returns [`RenderError::Cancelled`] without further grid
    /// mutation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Materializes every parameter the grid doesn't already carry an
    /// override for by running its default-value program.
    pub fn bind_defaults(&mut self) -> Result<(), RenderError> {
        let shader = self.shader;
        for param in &shader.params {
            if self.grid.has(&param.name) {
                continue;
            }
            let Some(default) = &param.default else {
                continue;
            };
            let width = if param.storage.is_varying() {
                self.grid.vertex_count().max(1)
            } else {
                1
            };
            let value = self.run(default, width, true)?.expect("expr program always yields a value");
            self.grid
                .add_value_with_storage(&param.name, param.ty, param.storage)
                .map_err(|e| runtime_err(e.to_string()))?;
            if let Some(slot) = self.grid.get_mut(&param.name) {
                *slot = value;
            }
        }
        Ok(())
    }

    /// Runs the shader body over the whole grid.
    pub fn shade(&mut self) -> Result<(), RenderError> {
        let shader = self.shader;
        let width = self.grid.vertex_count().max(1);
        self.run(&shader.body, width, false)?;
        self.warn_on_non_finite_outputs();
        Ok(())
    }

    /// Arithmetic domain errors (e.g. `sqrt` of a negative, division by
    /// zero) are produced silently as NaN/∞ per IEEE-754 rather than
    /// aborting the shade. Scanning the grid's own slots afterwards lets us
    /// report them as one aggregated warning instead of per-vertex spam.
    fn warn_on_non_finite_outputs(&self) {
        let width = self.grid.vertex_count().max(1);
        let mut affected = vec![false; width];
        for name in &self.shader.slot_names {
            let Some(value) = self.grid.get(name) else { continue };
            if value.len() != width {
                continue;
            }
            mark_non_finite(value, &mut affected);
        }
        let count = affected.iter().filter(|b| **b).count();
        if count > 0 {
            let err = RenderError::RuntimeShadingError {
                vertex_count: Some(count),
                message: "NaN or infinite value produced while shading".to_string(),
            };
            log::warn!("{err}");
        }
    }

    fn ensure_slot_value(&mut self, slot: SlotIndex) -> Result<(), RenderError> {
        let name = &self.shader.slot_names[slot as usize];
        if self.grid.has(name) {
            return Ok(());
        }
        let (ty, storage) = self.shader.slot_types[slot as usize];
        self.grid
            .add_value_with_storage(name, ty, storage)
            .map_err(|e| runtime_err(e.to_string()))?;
        Ok(())
    }

    fn load_var(&mut self, slot: SlotIndex) -> Result<Value, RenderError> {
        let name = self.shader.slot_names[slot as usize].clone();
        if name == "du" {
            let mut v = Value::create(ValueType::Float, ValueStorage::Uniform);
            v.float_values_mut().unwrap()[0] = self.grid.du;
            return Ok(v);
        }
        if name == "dv" {
            let mut v = Value::create(ValueType::Float, ValueStorage::Uniform);
            v.float_values_mut().unwrap()[0] = self.grid.dv;
            return Ok(v);
        }
        if name == "time" {
            let mut v = Value::create(ValueType::Float, ValueStorage::Uniform);
            v.float_values_mut().unwrap()[0] = self.grid.time;
            return Ok(v);
        }
        self.ensure_slot_value(slot)?;
        self.grid
            .get(&name)
            .cloned()
            .ok_or_else(|| runtime_err(format!("\"{name}\" was never bound")))
    }

    fn active_mask(&self) -> &Mask {
        self.mask_stack.last().expect("mask stack is never empty while a program runs")
    }

    fn store_var(&mut self, slot: SlotIndex, incoming: Value) -> Result<(), RenderError> {
        let name = self.shader.slot_names[slot as usize].clone();
        if name == "du" || name == "dv" || name == "time" {
            return Err(runtime_err(format!("\"{name}\" is read-only")));
        }
        self.ensure_slot_value(slot)?;
        let (_, storage) = self.shader.slot_types[slot as usize];
        if !storage.is_varying() {
            let dst = self.grid.get_mut(&name).unwrap();
            *dst = incoming;
            return Ok(());
        }
        let mask = self.active_mask().clone();
        let dst = self.grid.get_mut(&name).unwrap();
        masked_store(dst, &incoming, &mask)
    }

    /// Rebinds the surface grid's `Cl`/`L` globals to one light's captured
    /// contribution for this `illuminance` iteration, masked so a vertex
    /// that already broke or continued out of the loop keeps whatever it
    /// last saw.
    fn bind_light_sample(&mut self, sample: crate::grid::LightSample, width: usize) -> Result<(), RenderError> {
        let mask = self.active_mask().clone();
        self.broadcast_vec3("Cl", ValueType::Color, sample.cl, width, &mask)?;
        self.broadcast_vec3("L", ValueType::Vector, sample.l, width, &mask)?;
        Ok(())
    }

    fn broadcast_vec3(
        &mut self,
        name: &str,
        ty: ValueType,
        v: Vector3<f32>,
        width: usize,
        mask: &Mask,
    ) -> Result<(), RenderError> {
        if !self.grid.has(name) {
            self.grid
                .add_value_with_storage(name, ty, ValueStorage::Varying)
                .map_err(|e| runtime_err(e.to_string()))?;
        }
        let mut incoming = Value::create(ty, ValueStorage::Varying);
        incoming.resize(width);
        for slot in incoming.vec3_values_mut().unwrap() {
            *slot = v;
        }
        let dst = self.grid.get_mut(name).unwrap();
        masked_store(dst, &incoming, mask)
    }

    /// Runs `program` over `width` vertices. When `want_value` is set, the
    /// program is a self-contained expression (a parameter default) and the
    /// single resulting [`Value`] is returned; otherwise it's a shader body
    /// and runs until `Return`.
    fn run(&mut self, program: &[Instruction], width: usize, want_value: bool) -> Result<Option<Value>, RenderError> {
        let operand_base = self.operand_stack.len();
        let mask_base = self.mask_stack.len();
        let loop_base = self.loop_stack.len();
        self.mask_stack.push(Mask::all_active(width));
        self.pc = 0;

        while self.pc < program.len() {
            if let Some(token) = &self.cancellation {
                if token.is_cancelled() {
                    return Err(RenderError::Cancelled);
                }
            }
            let instr = &program[self.pc];
            self.pc += 1;
            match instr {
                Instruction::LoadConst(idx) => {
                    let value = self.load_const(*idx)?;
                    self.operand_stack.push(value);
                }
                Instruction::LoadVar(slot) => {
                    let value = self.load_var(*slot)?;
                    self.operand_stack.push(value);
                }
                Instruction::StoreVar(slot) => {
                    let value = self.pop()?;
                    self.store_var(*slot, value)?;
                }
                Instruction::Arith(op) => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.operand_stack.push(arith_value(*op, &a, &b)?);
                }
                Instruction::Neg => {
                    let a = self.pop()?;
                    self.operand_stack.push(neg_value(&a)?);
                }
                Instruction::Not => {
                    let a = self.pop()?;
                    self.operand_stack.push(not_value(&a)?);
                }
                Instruction::Compare(op) => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.operand_stack.push(compare_value(*op, &a, &b)?);
                }
                Instruction::Logical(op) => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.operand_stack.push(logical_value(*op, &a, &b)?);
                }
                Instruction::Cast(ty) => {
                    let a = self.pop()?;
                    self.operand_stack.push(cast_value(&a, *ty)?);
                }
                Instruction::Construct(ty, arg_count) => {
                    let mut args = Vec::with_capacity(*arg_count as usize);
                    for _ in 0..*arg_count {
                        args.push(self.pop()?);
                    }
                    args.reverse();
                    self.operand_stack.push(construct_value(*ty, &args)?);
                }
                Instruction::Dup => {
                    let top = self.peek()?.clone();
                    self.operand_stack.push(top);
                }
                Instruction::Pop => {
                    self.pop()?;
                }
                Instruction::Jump(target) => self.pc = *target as usize,
                Instruction::JumpIfFalseUniform(target) => {
                    let predicate = self.pop()?;
                    if !scalar_truthy(&predicate)? {
                        self.pc = *target as usize;
                    }
                }
                Instruction::PushMask => {
                    let predicate = self.pop()?;
                    let bits = truthy_bits(&predicate, width)?;
                    let top = self.active_mask().clone();
                    self.mask_stack.push(top.and(&Mask::from_bits(bits)));
                }
                Instruction::PushMaskInverted => {
                    let predicate = self.pop()?;
                    let bits: Vec<bool> = truthy_bits(&predicate, width)?.into_iter().map(|b| !b).collect();
                    let top = self.active_mask().clone();
                    self.mask_stack.push(top.and(&Mask::from_bits(bits)));
                }
                Instruction::PopMask => {
                    if self.mask_stack.len() <= mask_base {
                        return Err(runtime_err("mask stack underflow"));
                    }
                    self.mask_stack.pop();
                }
                Instruction::LoopBegin { .. } => {
                    let entry_mask = self.active_mask().clone();
                    let depth = self.mask_stack.len();
                    self.loop_stack.push(LoopFrame::new(entry_mask, depth));
                }
                Instruction::LoopPredicate { loop_end_pc } => {
                    let predicate = self.pop()?;
                    let bits = truthy_bits(&predicate, width)?;
                    let frame = self.loop_stack.last().expect("LoopPredicate without LoopBegin");
                    let iteration = frame.active_mask().and(&Mask::from_bits(bits));
                    if iteration.is_empty_mask() {
                        self.loop_stack.pop();
                        self.pc = *loop_end_pc as usize;
                    } else {
                        self.mask_stack.push(iteration);
                    }
                }
                Instruction::LoopEnd { loop_begin_pc } => {
                    let count = width;
                    let frame = self.loop_stack.last_mut().expect("LoopEnd without LoopBegin");
                    frame.continue_mask = Mask::none_active(count);
                    self.pc = *loop_begin_pc as usize;
                }
                Instruction::LoopStepMask => {
                    let frame = self.loop_stack.last().expect("LoopStepMask outside a loop");
                    let step_mask = frame.entry_mask.and_not(&frame.break_mask);
                    self.mask_stack.push(step_mask);
                }
                Instruction::Break(level) => self.masked_break_or_continue(*level, true)?,
                Instruction::Continue(level) => self.masked_break_or_continue(*level, false)?,
                Instruction::UniformLoopPredicate { loop_end_pc } => {
                    let predicate = self.pop()?;
                    if !scalar_truthy(&predicate)? {
                        self.pc = *loop_end_pc as usize;
                    }
                }
                Instruction::LoopFrameBegin => {
                    let entry_mask = self.active_mask().clone();
                    let depth = self.mask_stack.len();
                    self.loop_stack.push(LoopFrame::new(entry_mask, depth));
                }
                Instruction::LoopContinueReset => {
                    let count = width;
                    let frame = self.loop_stack.last_mut().expect("LoopContinueReset outside a loop");
                    frame.continue_mask = Mask::none_active(count);
                }
                Instruction::LoopFrameEnd => {
                    self.loop_stack.pop();
                }
                Instruction::IlluminanceBegin { loop_end_pc } => {
                    let count = self.grid.lights().len();
                    self.illuminance_stack.push((0, count));
                    if count == 0 {
                        self.illuminance_stack.pop();
                        self.pc = *loop_end_pc as usize;
                    }
                }
                Instruction::IlluminanceNext { loop_end_pc } => {
                    let (index, count) = *self
                        .illuminance_stack
                        .last()
                        .expect("IlluminanceNext without IlluminanceBegin");
                    if index >= count {
                        self.illuminance_stack.pop();
                        self.pc = *loop_end_pc as usize;
                    } else {
                        let sample = self.grid.light_samples().get(index).copied().unwrap_or_default();
                        self.bind_light_sample(sample, width)?;
                    }
                }
                Instruction::IlluminanceEnd { loop_begin_pc } => {
                    let frame = self
                        .illuminance_stack
                        .last_mut()
                        .expect("IlluminanceEnd without IlluminanceBegin");
                    frame.0 += 1;
                    self.pc = *loop_begin_pc as usize;
                }
                Instruction::CallBuiltin { id, arg_count } => {
                    let mut args = Vec::with_capacity(*arg_count as usize);
                    for _ in 0..*arg_count {
                        args.push(self.pop()?);
                    }
                    args.reverse();
                    let ctx = BuiltinContext { grid: self.grid };
                    let result = builtins::call(*id, args, &ctx)?;
                    self.operand_stack.push(result);
                }
                Instruction::Return => break,
            }
        }

        self.mask_stack.truncate(mask_base);
        self.loop_stack.truncate(loop_base);

        if want_value {
            let value = self.pop()?;
            if self.operand_stack.len() != operand_base {
                return Err(runtime_err("expression program left extra values on the stack"));
            }
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    fn masked_break_or_continue(&mut self, level: u32, is_break: bool) -> Result<(), RenderError> {
        let depth = self.loop_stack.len();
        if level == 0 || level as usize > depth {
            return Err(runtime_err("break/continue level outside of any loop"));
        }
        let target_idx = depth - level as usize;
        let current_mask = self.active_mask().clone();

        if is_break {
            for frame in &mut self.loop_stack[target_idx..] {
                frame.break_mask.or_in_place(&current_mask);
            }
        } else {
            for frame in &mut self.loop_stack[target_idx + 1..] {
                frame.break_mask.or_in_place(&current_mask);
            }
            self.loop_stack[target_idx].continue_mask.or_in_place(&current_mask);
        }

        let clear_from = self.loop_stack[target_idx].mask_stack_depth;
        for mask in &mut self.mask_stack[clear_from..] {
            mask.clear_where(&current_mask);
        }
        Ok(())
    }

    fn load_const(&self, idx: u32) -> Result<Value, RenderError> {
        match &self.shader.constants[idx as usize] {
            ConstantValue::Float(f) => {
                let mut v = Value::create(ValueType::Float, ValueStorage::Constant);
                v.float_values_mut().unwrap()[0] = *f as f32;
                Ok(v)
            }
            ConstantValue::Integer(i) => {
                let mut v = Value::create(ValueType::Integer, ValueStorage::Constant);
                v.integer_values_mut().unwrap()[0] = *i as i32;
                Ok(v)
            }
            ConstantValue::String(s) => {
                let mut v = Value::create(ValueType::String, ValueStorage::Constant);
                v.string_values_mut().unwrap()[0] = std::sync::Arc::from(s.as_str());
                Ok(v)
            }
        }
    }

    fn pop(&mut self) -> Result<Value, RenderError> {
        self.operand_stack.pop().ok_or_else(|| runtime_err("operand stack underflow"))
    }

    fn peek(&self) -> Result<&Value, RenderError> {
        self.operand_stack.last().ok_or_else(|| runtime_err("operand stack underflow"))
    }
}

/// Sets `affected[i]` when vertex `i` of `value` carries a NaN/infinite
/// component. Non-numeric value types (matrix, string) can't go non-finite
/// and are left untouched.
fn mark_non_finite(value: &Value, affected: &mut [bool]) {
    match value.ty() {
        ValueType::Float => {
            if let Ok(v) = value.float_values() {
                for (i, x) in v.iter().enumerate() {
                    if !x.is_finite() {
                        affected[i] = true;
                    }
                }
            }
        }
        ValueType::Integer | ValueType::Matrix | ValueType::String => {}
        ValueType::Color | ValueType::Point | ValueType::Vector | ValueType::Normal => {
            if let Ok(v) = value.vec3_values() {
                for (i, p) in v.iter().enumerate() {
                    if !p.x.is_finite() || !p.y.is_finite() || !p.z.is_finite() {
                        affected[i] = true;
                    }
                }
            }
        }
    }
}

fn masked_store(dst: &mut Value, src: &Value, mask: &Mask) -> Result<(), RenderError> {
    match dst.ty() {
        ValueType::Float => {
            let sv = src.float_values().map_err(|e| runtime_err(e.to_string()))?.to_vec();
            let dv = dst.float_values_mut().map_err(|e| runtime_err(e.to_string()))?;
            for (i, slot) in dv.iter_mut().enumerate() {
                if mask.get(i) {
                    *slot = sv[i % sv.len()];
                }
            }
        }
        ValueType::Integer => {
            let sv = src.integer_values().map_err(|e| runtime_err(e.to_string()))?.to_vec();
            let dv = dst.integer_values_mut().map_err(|e| runtime_err(e.to_string()))?;
            for (i, slot) in dv.iter_mut().enumerate() {
                if mask.get(i) {
                    *slot = sv[i % sv.len()];
                }
            }
        }
        ValueType::Color | ValueType::Vector | ValueType::Normal => {
            let sv = src.vec3_values().map_err(|e| runtime_err(e.to_string()))?.to_vec();
            let dv = dst.vec3_values_mut().map_err(|e| runtime_err(e.to_string()))?;
            for (i, slot) in dv.iter_mut().enumerate() {
                if mask.get(i) {
                    *slot = sv[i % sv.len()];
                }
            }
        }
        ValueType::Point => {
            let sv = src.point_values().map_err(|e| runtime_err(e.to_string()))?.to_vec();
            let dv = dst.point_values_mut().map_err(|e| runtime_err(e.to_string()))?;
            for (i, slot) in dv.iter_mut().enumerate() {
                if mask.get(i) {
                    *slot = sv[i % sv.len()];
                }
            }
        }
        ValueType::Matrix | ValueType::String => {
            if mask.bits().iter().all(|b| *b) {
                *dst = src.clone();
            } else {
                return Err(runtime_err("matrix/string values cannot be partially masked"));
            }
        }
    }
    Ok(())
}

fn scalar_truthy(value: &Value) -> Result<bool, RenderError> {
    match value.ty() {
        ValueType::Float => Ok(value.float_values().map_err(|e| runtime_err(e.to_string()))?[0] != 0.0),
        ValueType::Integer => Ok(value.integer_values().map_err(|e| runtime_err(e.to_string()))?[0] != 0),
        other => Err(runtime_err(format!("{other:?} is not a valid condition type"))),
    }
}

fn truthy_bits(value: &Value, width: usize) -> Result<Vec<bool>, RenderError> {
    match value.ty() {
        ValueType::Float => {
            let v = value.float_values().map_err(|e| runtime_err(e.to_string()))?;
            Ok((0..width).map(|i| v[i % v.len()] != 0.0).collect())
        }
        ValueType::Integer => {
            let v = value.integer_values().map_err(|e| runtime_err(e.to_string()))?;
            Ok((0..width).map(|i| v[i % v.len()] != 0).collect())
        }
        other => Err(runtime_err(format!("{other:?} is not a valid condition type"))),
    }
}

fn arith_value(op: ArithOp, a: &Value, b: &Value) -> Result<Value, RenderError> {
    let storage = combined_storage(a.storage(), b.storage());
    match (a.ty(), b.ty()) {
        (ValueType::Float, ValueType::Float) => float_arith(op, a, b, storage),
        (ValueType::Integer, ValueType::Integer) => integer_arith(op, a, b, storage),
        (t, ValueType::Float) if is_vectorlike(t) => vector_scalar_arith(op, a, b, storage, false),
        (ValueType::Float, t) if is_vectorlike(t) => vector_scalar_arith(op, b, a, storage, true),
        (t1, t2) if t1 == t2 && is_vectorlike(t1) => vector_vector_arith(op, a, b, storage),
        (t1, t2) => Err(runtime_err(format!("cannot combine {t1:?} and {t2:?} at runtime"))),
    }
}

fn float_arith(op: ArithOp, a: &Value, b: &Value, storage: ValueStorage) -> Result<Value, RenderError> {
    let av = a.float_values().map_err(|e| runtime_err(e.to_string()))?;
    let bv = b.float_values().map_err(|e| runtime_err(e.to_string()))?;
    let len = av.len().max(bv.len());
    let mut out = Value::create(ValueType::Float, storage);
    out.resize(len);
    let dst = out.float_values_mut().unwrap();
    for i in 0..len {
        let x = av[i % av.len()];
        let y = bv[i % bv.len()];
        dst[i] = match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
        };
    }
    Ok(out)
}

fn integer_arith(op: ArithOp, a: &Value, b: &Value, storage: ValueStorage) -> Result<Value, RenderError> {
    let av = a.integer_values().map_err(|e| runtime_err(e.to_string()))?;
    let bv = b.integer_values().map_err(|e| runtime_err(e.to_string()))?;
    let len = av.len().max(bv.len());
    let mut out = Value::create(ValueType::Integer, storage);
    out.resize(len);
    let dst = out.integer_values_mut().unwrap();
    for i in 0..len {
        let x = av[i % av.len()];
        let y = bv[i % bv.len()];
        dst[i] = match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::Div => {
                if y == 0 {
                    return Err(runtime_err("integer division by zero"));
                }
                x / y
            }
        };
    }
    Ok(out)
}

fn vector_vector_arith(op: ArithOp, a: &Value, b: &Value, storage: ValueStorage) -> Result<Value, RenderError> {
    let av = a.vec3_values().map_err(|e| runtime_err(e.to_string()))?;
    let bv = b.vec3_values().map_err(|e| runtime_err(e.to_string()))?;
    let len = av.len().max(bv.len());
    let mut out = Value::create(a.ty(), storage);
    out.resize(len);
    let dst = out.vec3_values_mut().unwrap();
    for i in 0..len {
        let x = av[i % av.len()];
        let y = bv[i % bv.len()];
        dst[i] = match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => Vector3::new(x.x * y.x, x.y * y.y, x.z * y.z),
            ArithOp::Div => Vector3::new(x.x / y.x, x.y / y.y, x.z / y.z),
        };
    }
    Ok(out)
}

/// `vec OP scalar` when `scalar_on_left` is false, `scalar OP vec` otherwise.
fn vector_scalar_arith(
    op: ArithOp,
    vec: &Value,
    scalar: &Value,
    storage: ValueStorage,
    scalar_on_left: bool,
) -> Result<Value, RenderError> {
    let vv = vec.vec3_values().map_err(|e| runtime_err(e.to_string()))?;
    let sv = scalar.float_values().map_err(|e| runtime_err(e.to_string()))?;
    let len = vv.len().max(sv.len());
    let mut out = Value::create(vec.ty(), storage);
    out.resize(len);
    let dst = out.vec3_values_mut().unwrap();
    for i in 0..len {
        let v = vv[i % vv.len()];
        let s = sv[i % sv.len()];
        dst[i] = match (op, scalar_on_left) {
            (ArithOp::Mul, _) => v * s,
            (ArithOp::Div, false) => v / s,
            (ArithOp::Div, true) => Vector3::new(s / v.x, s / v.y, s / v.z),
            (ArithOp::Add, _) | (ArithOp::Sub, _) => {
                return Err(runtime_err("cannot add/subtract a scalar and a vector"))
            }
        };
    }
    Ok(out)
}

fn neg_value(a: &Value) -> Result<Value, RenderError> {
    match a.ty() {
        ValueType::Float => {
            let v: Vec<f32> = a.float_values().map_err(|e| runtime_err(e.to_string()))?.iter().map(|x| -x).collect();
            let mut out = Value::create(ValueType::Float, a.storage());
            out.resize(v.len());
            out.float_values_mut().unwrap().copy_from_slice(&v);
            Ok(out)
        }
        ValueType::Integer => {
            let v: Vec<i32> = a
                .integer_values()
                .map_err(|e| runtime_err(e.to_string()))?
                .iter()
                .map(|x| x.wrapping_neg())
                .collect();
            let mut out = Value::create(ValueType::Integer, a.storage());
            out.resize(v.len());
            out.integer_values_mut().unwrap().copy_from_slice(&v);
            Ok(out)
        }
        t if is_vectorlike(t) => {
            let v: Vec<Vector3<f32>> = a.vec3_values().map_err(|e| runtime_err(e.to_string()))?.iter().map(|x| -x).collect();
            let mut out = Value::create(t, a.storage());
            out.resize(v.len());
            out.vec3_values_mut().unwrap().copy_from_slice(&v);
            Ok(out)
        }
        other => Err(runtime_err(format!("cannot negate {other:?}"))),
    }
}

fn not_value(a: &Value) -> Result<Value, RenderError> {
    let bits = truthy_bits(a, a.len())?;
    let mut out = Value::create(ValueType::Integer, a.storage());
    out.resize(bits.len());
    let dst = out.integer_values_mut().unwrap();
    for (i, b) in bits.into_iter().enumerate() {
        dst[i] = if b { 0 } else { 1 };
    }
    Ok(out)
}

fn compare_value(op: CompareOp, a: &Value, b: &Value) -> Result<Value, RenderError> {
    let storage = combined_storage(a.storage(), b.storage());
    let bits: Vec<bool> = match (a.ty(), b.ty()) {
        (ValueType::Float, ValueType::Float) => {
            let av = a.float_values().map_err(|e| runtime_err(e.to_string()))?;
            let bv = b.float_values().map_err(|e| runtime_err(e.to_string()))?;
            let len = av.len().max(bv.len());
            (0..len)
                .map(|i| apply_compare(op, av[i % av.len()] as f64, bv[i % bv.len()] as f64))
                .collect()
        }
        (ValueType::Integer, ValueType::Integer) => {
            let av = a.integer_values().map_err(|e| runtime_err(e.to_string()))?;
            let bv = b.integer_values().map_err(|e| runtime_err(e.to_string()))?;
            let len = av.len().max(bv.len());
            (0..len)
                .map(|i| apply_compare(op, av[i % av.len()] as f64, bv[i % bv.len()] as f64))
                .collect()
        }
        (t1, t2) if t1 == t2 && is_vectorlike(t1) => {
            let av = a.vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let bv = b.vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let len = av.len().max(bv.len());
            (0..len)
                .map(|i| {
                    let eq = av[i % av.len()] == bv[i % bv.len()];
                    match op {
                        CompareOp::Eq => eq,
                        CompareOp::Ne => !eq,
                        _ => false,
                    }
                })
                .collect()
        }
        (t1, t2) => return Err(runtime_err(format!("cannot compare {t1:?} and {t2:?} at runtime"))),
    };
    let mut out = Value::create(ValueType::Integer, storage);
    out.resize(bits.len());
    let dst = out.integer_values_mut().unwrap();
    for (i, b) in bits.into_iter().enumerate() {
        dst[i] = b as i32;
    }
    Ok(out)
}

fn apply_compare(op: CompareOp, a: f64, b: f64) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

fn logical_value(op: LogicalOp, a: &Value, b: &Value) -> Result<Value, RenderError> {
    let len = a.len().max(b.len());
    let ab = truthy_bits(a, len)?;
    let bb = truthy_bits(b, len)?;
    let storage = combined_storage(a.storage(), b.storage());
    let mut out = Value::create(ValueType::Integer, storage);
    out.resize(len);
    let dst = out.integer_values_mut().unwrap();
    for i in 0..len {
        dst[i] = match op {
            LogicalOp::And => (ab[i] && bb[i]) as i32,
            LogicalOp::Or => (ab[i] || bb[i]) as i32,
        };
    }
    Ok(out)
}

fn cast_value(a: &Value, ty: ValueType) -> Result<Value, RenderError> {
    if a.ty() == ty {
        return Ok(a.clone());
    }
    match (a.ty(), ty) {
        (ValueType::Float, ValueType::Integer) => {
            let v: Vec<i32> = a.float_values().map_err(|e| runtime_err(e.to_string()))?.iter().map(|x| *x as i32).collect();
            let mut out = Value::create(ValueType::Integer, a.storage());
            out.resize(v.len());
            out.integer_values_mut().unwrap().copy_from_slice(&v);
            Ok(out)
        }
        (ValueType::Integer, ValueType::Float) => {
            let v: Vec<f32> = a.integer_values().map_err(|e| runtime_err(e.to_string()))?.iter().map(|x| *x as f32).collect();
            let mut out = Value::create(ValueType::Float, a.storage());
            out.resize(v.len());
            out.float_values_mut().unwrap().copy_from_slice(&v);
            Ok(out)
        }
        (ValueType::Float, t) if is_vectorlike(t) => {
            let v: Vec<Vector3<f32>> = a
                .float_values()
                .map_err(|e| runtime_err(e.to_string()))?
                .iter()
                .map(|x| Vector3::new(*x, *x, *x))
                .collect();
            let mut out = Value::create(t, a.storage());
            out.resize(v.len());
            out.vec3_values_mut().unwrap().copy_from_slice(&v);
            Ok(out)
        }
        (from, to) => Err(runtime_err(format!("cannot cast {from:?} to {to:?} at runtime"))),
    }
}

fn construct_value(ty: ValueType, args: &[Value]) -> Result<Value, RenderError> {
    let storage = args.iter().fold(ValueStorage::Constant, |acc, v| combined_storage(acc, v.storage()));
    if args.len() == 1 {
        return cast_value(&args[0], ty);
    }
    if args.len() != 3 {
        return Err(runtime_err(format!("constructor expects 1 or 3 arguments, got {}", args.len())));
    }
    let components: Vec<&[f32]> = args
        .iter()
        .map(|v| v.float_values().map_err(|e| runtime_err(e.to_string())))
        .collect::<Result<_, _>>()?;
    let len = components.iter().map(|c| c.len()).max().unwrap_or(1);
    let mut out = Value::create(ty, storage);
    out.resize(len);
    let dst = out.vec3_values_mut().unwrap();
    for i in 0..len {
        dst[i] = Vector3::new(
            components[0][i % components[0].len()],
            components[1][i % components[1].len()],
            components[2][i % components[2].len()],
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::compile;
    use crate::compiler::lexer::Lexer;
    use crate::compiler::parser::Parser;
    use crate::symbol::SymbolTable;

    fn compile_source(src: &str) -> CompiledShader {
        let tokens = Lexer::tokenize(src).unwrap();
        let decl = Parser::parse_shader(tokens).unwrap();
        let table = SymbolTable::new();
        compile(&decl, &table).unwrap()
    }

    #[test]
    fn uniform_for_loop_accumulates_into_a_varying_output() {
        let shader = compile_source(
            "surface s() { uniform float i; varying float total; total = 0; for (i = 0; i < 4; i += 1) { total = total + i; } }",
        );
        let mut grid = Grid::new();
        grid.resize(1, 1);
        let mut vm = VirtualMachine::new(&shader, &mut grid);
        vm.shade().unwrap();
        assert_eq!(grid.get("total").unwrap().float_values().unwrap(), &[6.0]);
    }

    #[test]
    fn varying_if_only_writes_the_selected_vertices() {
        let shader = compile_source(
            "surface s(varying float x) { varying float y; if (x > 0) { y = 1; } else { y = -1; } }",
        );
        let mut grid = Grid::new();
        grid.resize(2, 1);
        grid.add_value_with_storage("x", ValueType::Float, ValueStorage::Varying)
            .unwrap();
        grid.get_mut("x").unwrap().float_values_mut().unwrap().copy_from_slice(&[1.0, -1.0]);
        let mut vm = VirtualMachine::new(&shader, &mut grid);
        vm.shade().unwrap();
        assert_eq!(grid.get("y").unwrap().float_values().unwrap(), &[1.0, -1.0]);
    }

    #[test]
    fn varying_break_stops_only_the_broken_vertex() {
        let shader = compile_source(
            "surface s(varying float x) { uniform float i; varying float n; varying float y; n = 4; y = 0; for (i = 0; i < n; i += 1) { if (x > 0) { break; } y = y + 1; } }",
        );
        let mut grid = Grid::new();
        grid.resize(2, 1);
        grid.add_value_with_storage("x", ValueType::Float, ValueStorage::Varying)
            .unwrap();
        grid.get_mut("x").unwrap().float_values_mut().unwrap().copy_from_slice(&[1.0, -1.0]);
        let mut vm = VirtualMachine::new(&shader, &mut grid);
        vm.shade().unwrap();
        // vertex 0 breaks immediately (y stays 0); vertex 1 never satisfies
        // the break condition and accumulates all 4 iterations.
        assert_eq!(grid.get("y").unwrap().float_values().unwrap(), &[0.0, 4.0]);
    }

    #[test]
    fn varying_break_inside_a_uniform_trip_count_loop_stops_only_the_broken_vertex() {
        let shader = compile_source(
            "surface s(varying float x) { uniform float i; varying float y; y = 0; for (i = 0; i < 4; i += 1) { if (x > 0) { break; } y = y + 1; } }",
        );
        let mut grid = Grid::new();
        grid.resize(2, 1);
        grid.add_value_with_storage("x", ValueType::Float, ValueStorage::Varying)
            .unwrap();
        grid.get_mut("x").unwrap().float_values_mut().unwrap().copy_from_slice(&[1.0, -1.0]);
        let mut vm = VirtualMachine::new(&shader, &mut grid);
        vm.shade().unwrap();
        // the loop's own trip count is uniform (always 4 iterations), but the
        // break is guarded by a varying condition: vertex 0 breaks on the
        // first iteration, vertex 1 never does and accumulates all 4.
        assert_eq!(grid.get("y").unwrap().float_values().unwrap(), &[0.0, 4.0]);
    }

    #[test]
    fn varying_continue_inside_a_uniform_trip_count_loop_skips_only_the_broken_vertex() {
        let shader = compile_source(
            "surface s(varying float x) { uniform float i; varying float y; y = 0; for (i = 0; i < 4; i += 1) { if (x > 0) { continue; } y = y + 1; } }",
        );
        let mut grid = Grid::new();
        grid.resize(2, 1);
        grid.add_value_with_storage("x", ValueType::Float, ValueStorage::Varying)
            .unwrap();
        grid.get_mut("x").unwrap().float_values_mut().unwrap().copy_from_slice(&[1.0, -1.0]);
        let mut vm = VirtualMachine::new(&shader, &mut grid);
        vm.shade().unwrap();
        assert_eq!(grid.get("y").unwrap().float_values().unwrap(), &[0.0, 4.0]);
    }

    #[test]
    fn param_default_program_binds_when_the_caller_supplies_nothing() {
        let shader = compile_source("surface s(uniform float Ka = 2) { varying float y; y = Ka; }");
        let mut grid = Grid::new();
        grid.resize(1, 1);
        let mut vm = VirtualMachine::new(&shader, &mut grid);
        vm.bind_defaults().unwrap();
        vm.shade().unwrap();
        assert_eq!(grid.get("y").unwrap().float_values().unwrap(), &[2.0]);
    }
}
