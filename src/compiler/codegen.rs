//! Combined semantic analysis, storage-class inference and bytecode
//! generation. Two codegen paths exist side by side for every conditional
//! and loop: a plain scalar path when the compiler can prove the
//! controlling expression is constant/uniform, and a masked path
//! otherwise.

use super::ast::{AssignOp, BinOp, Block, Expr, ParamDecl, ShaderDecl, ShaderKind, Stmt, UnOp};
use crate::error::RenderError;
use crate::symbol::{Symbol, SymbolImpl, SymbolTable};
use crate::value::{ValueStorage, ValueType};
use crate::vm::opcode::{ArithOp, CompareOp, ConstantValue, Instruction, LogicalOp, Pc, SlotIndex};
use std::collections::HashMap;

/// Attributes every grid carries whether or not a shader declares them:
/// the predeclared surface/light globals.
const STANDARD_GLOBALS: &[(&str, ValueType, ValueStorage)] = &[
    ("P", ValueType::Point, ValueStorage::Varying),
    ("N", ValueType::Normal, ValueStorage::Varying),
    ("Ng", ValueType::Normal, ValueStorage::Varying),
    ("I", ValueType::Vector, ValueStorage::Varying),
    ("s", ValueType::Float, ValueStorage::Varying),
    ("t", ValueType::Float, ValueStorage::Varying),
    ("u", ValueType::Float, ValueStorage::Varying),
    ("v", ValueType::Float, ValueStorage::Varying),
    ("Cs", ValueType::Color, ValueStorage::Varying),
    ("Os", ValueType::Color, ValueStorage::Varying),
    ("Ci", ValueType::Color, ValueStorage::Varying),
    ("Oi", ValueType::Color, ValueStorage::Varying),
    ("Cl", ValueType::Color, ValueStorage::Varying),
    ("L", ValueType::Vector, ValueStorage::Varying),
    ("du", ValueType::Float, ValueStorage::Uniform),
    ("dv", ValueType::Float, ValueStorage::Uniform),
    ("time", ValueType::Float, ValueStorage::Uniform),
];

/// One compiled `uniform`/`varying`-defaulted parameter: its slot plus,
/// when it has one, the (self-contained, no-jump) program that computes its
/// default value.
#[derive(Debug, Clone)]
pub struct CompiledParam {
    pub name: String,
    pub ty: ValueType,
    pub storage: ValueStorage,
    pub default: Option<Vec<Instruction>>,
}

/// The output of one compile: a flat slot namespace (grid value names), a
/// shared constant pool, per-parameter default programs, and the shader
/// body.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub kind: ShaderKind,
    pub params: Vec<CompiledParam>,
    pub body: Vec<Instruction>,
    pub constants: Vec<ConstantValue>,
    pub slot_names: Vec<String>,
    /// (type, storage) for each entry of `slot_names`, in the same order, so
    /// the VM can lazily materialize a grid [`crate::value::Value`] for a
    /// slot the first time it's stored to.
    pub slot_types: Vec<(ValueType, ValueStorage)>,
}

pub fn compile(decl: &ShaderDecl, symbol_table: &SymbolTable) -> Result<CompiledShader, RenderError> {
    let mut cg = Codegen::new(symbol_table, decl.kind);
    for param in &decl.params {
        cg.declare_slot(&param.name, param.ty, param.storage)?;
    }

    let mut params = Vec::with_capacity(decl.params.len());
    for param in &decl.params {
        params.push(cg.compile_param(param)?);
    }

    cg.compile_block(&decl.body)?;
    cg.code.push(Instruction::Return);

    let slot_types = cg
        .slot_names
        .iter()
        .map(|name| cg.slot_type[name])
        .collect();

    Ok(CompiledShader {
        kind: decl.kind,
        params,
        body: cg.code,
        constants: cg.constants,
        slot_names: cg.slot_names,
        slot_types,
    })
}

struct Codegen<'a> {
    code: Vec<Instruction>,
    constants: Vec<ConstantValue>,
    slot_names: Vec<String>,
    slot_index: HashMap<String, SlotIndex>,
    slot_type: HashMap<String, (ValueType, ValueStorage)>,
    symbol_table: &'a SymbolTable,
    /// Lexical nesting depth of `for`/`while`/`illuminance` loops currently
    /// being compiled, used only to validate `break N`/`continue N` levels.
    /// Every such loop pushes a VM-side loop frame regardless of whether its
    /// own trip count is uniform or varying (see `LoopFrameBegin`/
    /// `LoopBegin`), so `break`/`continue` always compile to the same masked
    /// opcode and don't need to track each loop's kind here.
    loop_depth: u32,
    temp_counter: u32,
    kind: ShaderKind,
}

impl<'a> Codegen<'a> {
    fn new(symbol_table: &'a SymbolTable, kind: ShaderKind) -> Self {
        Codegen {
            code: Vec::new(),
            constants: Vec::new(),
            slot_names: Vec::new(),
            slot_index: HashMap::new(),
            slot_type: HashMap::new(),
            symbol_table,
            loop_depth: 0,
            temp_counter: 0,
            kind,
        }
    }

    fn compile_param(&mut self, param: &ParamDecl) -> Result<CompiledParam, RenderError> {
        let default = match &param.default {
            Some(expr) => {
                let saved = std::mem::take(&mut self.code);
                let (ty, storage) = self.compile_expr(expr)?;
                if !ty.is_assignable_to(param.ty) {
                    return Err(RenderError::semantic(
                        param.line,
                        format!(
                            "default for \"{}\" has type {ty:?}, expected {:?}",
                            param.name, param.ty
                        ),
                    ));
                }
                if !storage.promotes_to(param.storage) {
                    return Err(RenderError::semantic(
                        param.line,
                        format!("default for \"{}\" is varying but the parameter is not", param.name),
                    ));
                }
                Some(std::mem::replace(&mut self.code, saved))
            }
            None => None,
        };
        Ok(CompiledParam {
            name: param.name.clone(),
            ty: param.ty,
            storage: param.storage,
            default,
        })
    }

    fn declare_slot(&mut self, name: &str, ty: ValueType, storage: ValueStorage) -> Result<SlotIndex, RenderError> {
        if let Some(&(existing_ty, _)) = self.slot_type.get(name) {
            if existing_ty != ty {
                return Err(RenderError::semantic(
                    0,
                    format!("\"{name}\" redeclared with type {ty:?}, previously {existing_ty:?}"),
                ));
            }
            return Ok(self.slot_index[name]);
        }
        let index = self.slot_names.len() as SlotIndex;
        self.slot_names.push(name.to_string());
        self.slot_index.insert(name.to_string(), index);
        self.slot_type.insert(name.to_string(), (ty, storage));
        Ok(index)
    }

    fn widen_slot(&mut self, name: &str, storage: ValueStorage) {
        if let Some(entry) = self.slot_type.get_mut(name) {
            if storage.is_varying() {
                entry.1 = ValueStorage::Varying;
            }
        }
    }

    fn synthetic_slot(&mut self, ty: ValueType, storage: ValueStorage) -> SlotIndex {
        let name = format!("__tmp{}", self.temp_counter);
        self.temp_counter += 1;
        self.declare_slot(&name, ty, storage).expect("synthetic slot names never collide")
    }

    fn const_index(&mut self, value: ConstantValue) -> crate::vm::opcode::ConstIndex {
        self.constants.push(value);
        (self.constants.len() - 1) as crate::vm::opcode::ConstIndex
    }

    fn lookup_identifier_type(&self, name: &str) -> Option<(ValueType, ValueStorage)> {
        if let Some(&t) = self.slot_type.get(name) {
            return Some(t);
        }
        if let Some(symbol) = self.symbol_table.lookup_variable(name) {
            return Some((symbol.ty(), symbol.storage()));
        }
        STANDARD_GLOBALS
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, ty, storage)| (*ty, *storage))
    }

    fn resolve_identifier(&mut self, name: &str, line: u32) -> Result<(ValueType, ValueStorage, SlotIndex), RenderError> {
        let (ty, storage) = self
            .lookup_identifier_type(name)
            .ok_or_else(|| RenderError::semantic(line, format!("unknown identifier \"{name}\"")))?;
        let slot = self.declare_slot(name, ty, storage)?;
        Ok((ty, storage, slot))
    }

    // --- static type inference, no emission (used to pick a codegen path) ---

    fn infer_expr(&self, expr: &Expr) -> Result<(ValueType, ValueStorage), RenderError> {
        match expr {
            Expr::FloatLiteral(..) => Ok((ValueType::Float, ValueStorage::Constant)),
            Expr::IntLiteral(..) => Ok((ValueType::Integer, ValueStorage::Constant)),
            Expr::StringLiteral(..) => Ok((ValueType::String, ValueStorage::Constant)),
            Expr::Identifier(name, line) => self
                .lookup_identifier_type(name)
                .ok_or_else(|| RenderError::semantic(*line, format!("unknown identifier \"{name}\""))),
            Expr::Call { name, args, line } => {
                let arg_types = args
                    .iter()
                    .map(|a| self.infer_expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                let symbol = self
                    .symbol_table
                    .resolve_call(name, &arg_types)
                    .ok_or_else(|| RenderError::semantic(*line, format!("unresolved call to \"{name}\"")))?;
                Ok(call_result(symbol, &arg_types))
            }
            Expr::Constructor { ty, args, line } => {
                let arg_types = args
                    .iter()
                    .map(|a| self.infer_expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                check_constructor_args(&arg_types, *line)?;
                Ok((*ty, constructor_storage(&arg_types)))
            }
            Expr::Cast { ty, expr, line } => {
                let (source_ty, storage) = self.infer_expr(expr)?;
                check_cast(source_ty, *ty, *line)?;
                Ok((*ty, storage))
            }
            Expr::Unary { expr, .. } => self.infer_expr(expr),
            Expr::Binary { op, lhs, rhs, line } => {
                let (lty, lst) = self.infer_expr(lhs)?;
                let (rty, rst) = self.infer_expr(rhs)?;
                let ty = binary_result_type(*op, lty, rty, *line)?;
                Ok((ty, binary_result_storage(lst, rst)))
            }
        }
    }

    fn check_boolean(&self, ty: ValueType, line: u32) -> Result<(), RenderError> {
        match ty {
            ValueType::Float | ValueType::Integer => Ok(()),
            other => Err(RenderError::semantic(
                line,
                format!("condition must be numeric, found {other:?}"),
            )),
        }
    }

    // --- expression codegen ---

    fn compile_expr(&mut self, expr: &Expr) -> Result<(ValueType, ValueStorage), RenderError> {
        match expr {
            Expr::FloatLiteral(v, _) => {
                let idx = self.const_index(ConstantValue::Float(*v));
                self.code.push(Instruction::LoadConst(idx));
                Ok((ValueType::Float, ValueStorage::Constant))
            }
            Expr::IntLiteral(v, _) => {
                let idx = self.const_index(ConstantValue::Integer(*v));
                self.code.push(Instruction::LoadConst(idx));
                Ok((ValueType::Integer, ValueStorage::Constant))
            }
            Expr::StringLiteral(s, _) => {
                let idx = self.const_index(ConstantValue::String(s.clone()));
                self.code.push(Instruction::LoadConst(idx));
                Ok((ValueType::String, ValueStorage::Constant))
            }
            Expr::Identifier(name, line) => {
                let (ty, storage, slot) = self.resolve_identifier(name, *line)?;
                self.code.push(Instruction::LoadVar(slot));
                Ok((ty, storage))
            }
            Expr::Call { name, args, line } => {
                let mut arg_types = Vec::with_capacity(args.len());
                for a in args {
                    arg_types.push(self.compile_expr(a)?);
                }
                let symbol = self
                    .symbol_table
                    .resolve_call(name, &arg_types)
                    .ok_or_else(|| RenderError::semantic(*line, format!("unresolved call to \"{name}\"")))?
                    .clone();
                let id = match symbol.implementation() {
                    SymbolImpl::Builtin { id } => id,
                    _ => {
                        return Err(RenderError::codegen(
                            *line,
                            format!("\"{name}\" has no compiled implementation"),
                        ))
                    }
                };
                self.code.push(Instruction::CallBuiltin {
                    id,
                    arg_count: args.len() as u8,
                });
                Ok(call_result(&symbol, &arg_types))
            }
            Expr::Constructor { ty, args, line } => {
                let mut arg_types = Vec::with_capacity(args.len());
                for a in args {
                    arg_types.push(self.compile_expr(a)?);
                }
                check_constructor_args(&arg_types, *line)?;
                self.code.push(Instruction::Construct(*ty, args.len() as u8));
                Ok((*ty, constructor_storage(&arg_types)))
            }
            Expr::Cast { ty, expr, line } => {
                let (source_ty, storage) = self.compile_expr(expr)?;
                check_cast(source_ty, *ty, *line)?;
                self.code.push(Instruction::Cast(*ty));
                Ok((*ty, storage))
            }
            Expr::Unary { op, expr, line } => {
                let (ty, storage) = self.compile_expr(expr)?;
                match op {
                    UnOp::Neg => {
                        if ty == ValueType::String {
                            return Err(RenderError::semantic(*line, "cannot negate a string"));
                        }
                        self.code.push(Instruction::Neg);
                    }
                    UnOp::Not => self.code.push(Instruction::Not),
                }
                Ok((ty, storage))
            }
            Expr::Binary { op, lhs, rhs, line } => {
                let (lty, lst) = self.compile_expr(lhs)?;
                let (rty, rst) = self.compile_expr(rhs)?;
                let ty = binary_result_type(*op, lty, rty, *line)?;
                self.code.push(binary_instruction(*op));
                Ok((ty, binary_result_storage(lst, rst)))
            }
        }
    }

    // --- statement codegen ---

    fn compile_block(&mut self, block: &Block) -> Result<(), RenderError> {
        for stmt in block {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), RenderError> {
        match stmt {
            Stmt::Declaration {
                name,
                ty,
                storage,
                init,
                line,
            } => {
                let declared_storage = storage.unwrap_or(ValueStorage::Uniform);
                self.declare_slot(name, *ty, declared_storage)?;
                if let Some(expr) = init {
                    let (ety, estorage) = self.compile_expr(expr)?;
                    if !ety.is_assignable_to(*ty) {
                        return Err(RenderError::semantic(
                            *line,
                            format!("cannot initialize \"{name}\" of type {ty:?} with {ety:?}"),
                        ));
                    }
                    let slot = self.declare_slot(name, *ty, declared_storage)?;
                    self.code.push(Instruction::StoreVar(slot));
                    self.widen_slot(name, estorage);
                }
                Ok(())
            }
            Stmt::Assign { target, op, value, line } => {
                let (target_ty, target_storage, slot) = self.resolve_identifier(target, *line)?;
                if *op != AssignOp::Assign {
                    self.code.push(Instruction::LoadVar(slot));
                }
                let (vty, vstorage) = self.compile_expr(value)?;
                let result_ty = match op {
                    AssignOp::Assign => {
                        if !vty.is_assignable_to(target_ty) {
                            return Err(RenderError::semantic(
                                *line,
                                format!("cannot assign {vty:?} to \"{target}\" of type {target_ty:?}"),
                            ));
                        }
                        vty
                    }
                    other => {
                        let arith = match other {
                            AssignOp::AddAssign => ArithOp::Add,
                            AssignOp::SubAssign => ArithOp::Sub,
                            AssignOp::MulAssign => ArithOp::Mul,
                            AssignOp::DivAssign => ArithOp::Div,
                            AssignOp::Assign => unreachable!(),
                        };
                        let ty = binary_result_type(arith_to_binop(arith), target_ty, vty, *line)?;
                        self.code.push(Instruction::Arith(arith));
                        ty
                    }
                };
                let _ = result_ty;
                self.code.push(Instruction::StoreVar(slot));
                if vstorage.is_varying() && !target_storage.is_varying() {
                    self.widen_slot(target, ValueStorage::Varying);
                }
                Ok(())
            }
            Stmt::ExprStmt(expr, _line) => {
                self.compile_expr(expr)?;
                self.code.push(Instruction::Pop);
                Ok(())
            }
            Stmt::Block(block) => self.compile_block(block),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                line,
            } => self.compile_if(cond, then_branch, else_branch.as_deref(), *line),
            Stmt::While { cond, body, line } => self.compile_while(cond, body, *line),
            Stmt::For {
                init,
                cond,
                step,
                body,
                line,
            } => self.compile_for(init, cond, step, body, *line),
            Stmt::Illuminance { position, body, line } => self.compile_illuminance(position, body, *line),
            Stmt::Solar { axis, body, line } => self.compile_solar(axis.as_ref(), body, *line),
            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    self.compile_expr(expr)?;
                    self.code.push(Instruction::Pop);
                }
                self.code.push(Instruction::Return);
                Ok(())
            }
            Stmt::Break { level, line } => self.compile_break(*level, *line),
            Stmt::Continue { level, line } => self.compile_continue(*level, *line),
        }
    }

    fn patch_pc(&mut self, idx: usize, target: Pc) {
        match &mut self.code[idx] {
            Instruction::Jump(t)
            | Instruction::JumpIfFalseUniform(t)
            | Instruction::UniformLoopPredicate { loop_end_pc: t }
            | Instruction::LoopBegin { loop_end_pc: t }
            | Instruction::LoopPredicate { loop_end_pc: t }
            | Instruction::LoopEnd { loop_begin_pc: t }
            | Instruction::IlluminanceBegin { loop_end_pc: t }
            | Instruction::IlluminanceNext { loop_end_pc: t }
            | Instruction::IlluminanceEnd { loop_begin_pc: t } => *t = target,
            other => unreachable!("patch_pc target {other:?} carries no pc"),
        }
    }

    // --- if ---

    fn compile_if(
        &mut self,
        cond: &Expr,
        then_branch: &Block,
        else_branch: Option<&Block>,
        line: u32,
    ) -> Result<(), RenderError> {
        let (cty, cstorage) = self.infer_expr(cond)?;
        self.check_boolean(cty, line)?;
        if cstorage.is_varying() {
            self.compile_varying_if(cond, then_branch, else_branch)
        } else {
            self.compile_uniform_if(cond, then_branch, else_branch)
        }
    }

    fn compile_uniform_if(
        &mut self,
        cond: &Expr,
        then_branch: &Block,
        else_branch: Option<&Block>,
    ) -> Result<(), RenderError> {
        self.compile_expr(cond)?;
        let branch_jump = self.code.len();
        self.code.push(Instruction::JumpIfFalseUniform(0));
        self.compile_block(then_branch)?;
        if let Some(else_branch) = else_branch {
            let end_jump = self.code.len();
            self.code.push(Instruction::Jump(0));
            let else_pc = self.code.len() as Pc;
            self.patch_pc(branch_jump, else_pc);
            self.compile_block(else_branch)?;
            let end_pc = self.code.len() as Pc;
            self.patch_pc(end_jump, end_pc);
        } else {
            let end_pc = self.code.len() as Pc;
            self.patch_pc(branch_jump, end_pc);
        }
        Ok(())
    }

    /// Evaluates the predicate once into a synthetic slot so it can be
    /// reloaded for both the then-mask and (inverted) else-mask, matching
    /// "`else` runs with `top_mask ∧ ¬e`" using the same `e` the `if` used.
    fn compile_varying_if(
        &mut self,
        cond: &Expr,
        then_branch: &Block,
        else_branch: Option<&Block>,
    ) -> Result<(), RenderError> {
        let cond_slot = self.synthetic_slot(ValueType::Integer, ValueStorage::Varying);
        self.compile_expr(cond)?;
        self.code.push(Instruction::StoreVar(cond_slot));
        self.code.push(Instruction::LoadVar(cond_slot));
        self.code.push(Instruction::PushMask);
        self.compile_block(then_branch)?;
        self.code.push(Instruction::PopMask);
        if let Some(else_branch) = else_branch {
            self.code.push(Instruction::LoadVar(cond_slot));
            self.code.push(Instruction::PushMaskInverted);
            self.compile_block(else_branch)?;
            self.code.push(Instruction::PopMask);
        }
        Ok(())
    }

    // --- while / for ---

    fn compile_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), RenderError> {
        let (cty, cstorage) = self.infer_expr(cond)?;
        self.check_boolean(cty, line)?;
        if cstorage.is_varying() {
            self.compile_varying_while(cond, body)
        } else {
            self.compile_uniform_while(cond, body)
        }
    }

    fn compile_uniform_while(&mut self, cond: &Expr, body: &Block) -> Result<(), RenderError> {
        self.code.push(Instruction::LoopFrameBegin);
        let loop_begin_pc = self.code.len() as Pc;
        self.compile_expr(cond)?;
        let predicate_idx = self.code.len();
        self.code.push(Instruction::UniformLoopPredicate { loop_end_pc: 0 });
        self.code.push(Instruction::LoopStepMask);
        self.loop_depth += 1;
        self.compile_block(body)?;
        self.loop_depth -= 1;
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopContinueReset);
        self.code.push(Instruction::Jump(loop_begin_pc));
        let loop_end_pc = self.code.len() as Pc;
        self.patch_pc(predicate_idx, loop_end_pc);
        self.code.push(Instruction::LoopFrameEnd);
        Ok(())
    }

    fn compile_varying_while(&mut self, cond: &Expr, body: &Block) -> Result<(), RenderError> {
        let begin_idx = self.code.len();
        self.code.push(Instruction::LoopBegin { loop_end_pc: 0 });
        let loop_cond_pc = self.code.len() as Pc;
        self.compile_expr(cond)?;
        let predicate_idx = self.code.len();
        self.code.push(Instruction::LoopPredicate { loop_end_pc: 0 });
        self.loop_depth += 1;
        self.compile_block(body)?;
        self.loop_depth -= 1;
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopEnd {
            loop_begin_pc: loop_cond_pc,
        });
        let loop_end_pc = self.code.len() as Pc;
        self.patch_pc(begin_idx, loop_end_pc);
        self.patch_pc(predicate_idx, loop_end_pc);
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: &Option<Stmt>,
        cond: &Expr,
        step: &Option<Stmt>,
        body: &Block,
        line: u32,
    ) -> Result<(), RenderError> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        let (cty, cstorage) = self.infer_expr(cond)?;
        self.check_boolean(cty, line)?;
        if cstorage.is_varying() {
            self.compile_varying_for(cond, step, body)
        } else {
            self.compile_uniform_for(cond, step, body)
        }
    }

    fn compile_uniform_for(&mut self, cond: &Expr, step: &Option<Stmt>, body: &Block) -> Result<(), RenderError> {
        self.code.push(Instruction::LoopFrameBegin);
        let loop_begin_pc = self.code.len() as Pc;
        self.compile_expr(cond)?;
        let predicate_idx = self.code.len();
        self.code.push(Instruction::UniformLoopPredicate { loop_end_pc: 0 });
        self.code.push(Instruction::LoopStepMask);
        self.loop_depth += 1;
        self.compile_block(body)?;
        self.loop_depth -= 1;
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopStepMask);
        if let Some(step) = step {
            self.compile_stmt(step)?;
        }
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopContinueReset);
        self.code.push(Instruction::Jump(loop_begin_pc));
        let loop_end_pc = self.code.len() as Pc;
        self.patch_pc(predicate_idx, loop_end_pc);
        self.code.push(Instruction::LoopFrameEnd);
        Ok(())
    }

    fn compile_varying_for(&mut self, cond: &Expr, step: &Option<Stmt>, body: &Block) -> Result<(), RenderError> {
        let begin_idx = self.code.len();
        self.code.push(Instruction::LoopBegin { loop_end_pc: 0 });
        let loop_cond_pc = self.code.len() as Pc;
        self.compile_expr(cond)?;
        let predicate_idx = self.code.len();
        self.code.push(Instruction::LoopPredicate { loop_end_pc: 0 });
        self.loop_depth += 1;
        self.compile_block(body)?;
        self.loop_depth -= 1;
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopStepMask);
        if let Some(step) = step {
            self.compile_stmt(step)?;
        }
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopEnd {
            loop_begin_pc: loop_cond_pc,
        });
        let loop_end_pc = self.code.len() as Pc;
        self.patch_pc(begin_idx, loop_end_pc);
        self.patch_pc(predicate_idx, loop_end_pc);
        Ok(())
    }

    // --- illuminance / solar ---

    /// `illuminance` always takes the uniform-loop shape: every vertex on a
    /// grid sees the same light count (it's a grid property, not a
    /// per-vertex one). Per-vertex visibility/falloff inside the body is
    /// ordinary varying `if`.
    fn compile_illuminance(&mut self, position: &Expr, body: &Block, line: u32) -> Result<(), RenderError> {
        if matches!(self.kind, ShaderKind::Displacement | ShaderKind::Imager) {
            return Err(RenderError::semantic(
                line,
                "illuminance is only valid in a surface, light, or volume shader",
            ));
        }
        let (pty, _) = self.infer_expr(position)?;
        if !matches!(pty, ValueType::Point) {
            return Err(RenderError::semantic(
                line,
                format!("illuminance position must be a point, found {pty:?}"),
            ));
        }
        self.compile_expr(position)?;
        self.code.push(Instruction::Pop);

        self.code.push(Instruction::LoopFrameBegin);
        let begin_idx = self.code.len();
        self.code.push(Instruction::IlluminanceBegin { loop_end_pc: 0 });
        let loop_begin_pc = self.code.len() as Pc;
        let predicate_idx = self.code.len();
        self.code.push(Instruction::IlluminanceNext { loop_end_pc: 0 });
        self.code.push(Instruction::LoopStepMask);
        self.loop_depth += 1;
        self.compile_block(body)?;
        self.loop_depth -= 1;
        self.code.push(Instruction::PopMask);
        self.code.push(Instruction::LoopContinueReset);
        self.code.push(Instruction::IlluminanceEnd { loop_begin_pc });
        let loop_end_pc = self.code.len() as Pc;
        self.patch_pc(begin_idx, loop_end_pc);
        self.patch_pc(predicate_idx, loop_end_pc);
        self.code.push(Instruction::LoopFrameEnd);
        Ok(())
    }

    /// `solar` is a restricted `illuminance`: exactly one light direction
    /// (the optional axis, or the shader's own light axis when omitted),
    /// so it compiles as a single pass through the body with no loop.
    fn compile_solar(&mut self, axis: Option<&Expr>, body: &Block, line: u32) -> Result<(), RenderError> {
        if !matches!(self.kind, ShaderKind::Light) {
            return Err(RenderError::semantic(
                line,
                "solar is only valid in a light shader",
            ));
        }
        if let Some(axis) = axis {
            let (ty, _) = self.infer_expr(axis)?;
            if !matches!(ty, ValueType::Vector) {
                return Err(RenderError::semantic(line, format!("solar axis must be a vector, found {ty:?}")));
            }
            self.compile_expr(axis)?;
            self.code.push(Instruction::Pop);
        }
        self.compile_block(body)
    }

    // --- break / continue ---

    fn compile_break(&mut self, level: u32, line: u32) -> Result<(), RenderError> {
        if self.loop_depth == 0 {
            return Err(RenderError::break_outside_of_loop(line));
        }
        if level as usize > self.loop_depth as usize {
            return Err(RenderError::break_to_level_outside_of_loop(line));
        }
        self.code.push(Instruction::Break(level));
        Ok(())
    }

    fn compile_continue(&mut self, level: u32, line: u32) -> Result<(), RenderError> {
        if self.loop_depth == 0 {
            return Err(RenderError::codegen(line, "Continue outside of a loop"));
        }
        if level as usize > self.loop_depth as usize {
            return Err(RenderError::codegen(line, "Continue to a level outside of a loop"));
        }
        self.code.push(Instruction::Continue(level));
        Ok(())
    }
}

fn arith_to_binop(op: ArithOp) -> BinOp {
    match op {
        ArithOp::Add => BinOp::Add,
        ArithOp::Sub => BinOp::Sub,
        ArithOp::Mul => BinOp::Mul,
        ArithOp::Div => BinOp::Div,
    }
}

fn binary_instruction(op: BinOp) -> Instruction {
    match op {
        BinOp::Add => Instruction::Arith(ArithOp::Add),
        BinOp::Sub => Instruction::Arith(ArithOp::Sub),
        BinOp::Mul => Instruction::Arith(ArithOp::Mul),
        BinOp::Div => Instruction::Arith(ArithOp::Div),
        BinOp::Eq => Instruction::Compare(CompareOp::Eq),
        BinOp::Ne => Instruction::Compare(CompareOp::Ne),
        BinOp::Lt => Instruction::Compare(CompareOp::Lt),
        BinOp::Le => Instruction::Compare(CompareOp::Le),
        BinOp::Gt => Instruction::Compare(CompareOp::Gt),
        BinOp::Ge => Instruction::Compare(CompareOp::Ge),
        BinOp::And => Instruction::Logical(LogicalOp::And),
        BinOp::Or => Instruction::Logical(LogicalOp::Or),
    }
}

fn binary_result_type(op: BinOp, lty: ValueType, rty: ValueType, line: u32) -> Result<ValueType, RenderError> {
    use BinOp::*;
    match op {
        Add | Sub => {
            if lty == rty {
                Ok(lty)
            } else {
                Err(RenderError::semantic(line, format!("cannot combine {lty:?} and {rty:?}")))
            }
        }
        Mul | Div => {
            let is_vectorlike =
                |t: ValueType| matches!(t, ValueType::Color | ValueType::Point | ValueType::Vector | ValueType::Normal);
            if lty == rty {
                Ok(lty)
            } else if lty == ValueType::Float && is_vectorlike(rty) {
                Ok(rty)
            } else if rty == ValueType::Float && is_vectorlike(lty) {
                Ok(lty)
            } else {
                Err(RenderError::semantic(line, format!("cannot combine {lty:?} and {rty:?}")))
            }
        }
        Eq | Ne => {
            if lty == rty {
                Ok(ValueType::Integer)
            } else {
                Err(RenderError::semantic(line, format!("cannot compare {lty:?} and {rty:?}")))
            }
        }
        Lt | Le | Gt | Ge => {
            let numeric = |t: ValueType| matches!(t, ValueType::Float | ValueType::Integer);
            if numeric(lty) && numeric(rty) {
                Ok(ValueType::Integer)
            } else {
                Err(RenderError::semantic(line, format!("cannot order {lty:?} and {rty:?}")))
            }
        }
        And | Or => {
            let numeric = |t: ValueType| matches!(t, ValueType::Float | ValueType::Integer);
            if numeric(lty) && numeric(rty) {
                Ok(ValueType::Integer)
            } else {
                Err(RenderError::semantic(
                    line,
                    format!("logical operands must be numeric, found {lty:?} and {rty:?}"),
                ))
            }
        }
    }
}

fn binary_result_storage(l: ValueStorage, r: ValueStorage) -> ValueStorage {
    if l.is_varying() || r.is_varying() {
        ValueStorage::Varying
    } else if l == ValueStorage::Constant && r == ValueStorage::Constant {
        ValueStorage::Constant
    } else {
        ValueStorage::Uniform
    }
}

fn call_result(symbol: &Symbol, args: &[(ValueType, ValueStorage)]) -> (ValueType, ValueStorage) {
    let any_varying = args.iter().any(|(_, st)| st.is_varying());
    let storage = if any_varying { ValueStorage::Varying } else { symbol.storage() };
    (symbol.ty(), storage)
}

fn check_constructor_args(args: &[(ValueType, ValueStorage)], line: u32) -> Result<(), RenderError> {
    for (ty, _) in args {
        if !matches!(ty, ValueType::Float | ValueType::Integer) {
            return Err(RenderError::semantic(
                line,
                format!("constructor arguments must be numeric, found {ty:?}"),
            ));
        }
    }
    if !matches!(args.len(), 1 | 3) {
        return Err(RenderError::semantic(
            line,
            format!("constructor expects 1 or 3 arguments, found {}", args.len()),
        ));
    }
    Ok(())
}

fn constructor_storage(args: &[(ValueType, ValueStorage)]) -> ValueStorage {
    if args.iter().any(|(_, st)| st.is_varying()) {
        ValueStorage::Varying
    } else {
        ValueStorage::Uniform
    }
}

fn check_cast(from: ValueType, to: ValueType, line: u32) -> Result<(), RenderError> {
    use ValueType::*;
    let ok = from == to
        || matches!((from, to), (Float, Integer) | (Integer, Float))
        || (from == Float && matches!(to, Color | Point | Vector | Normal));
    if ok {
        Ok(())
    } else {
        Err(RenderError::semantic(line, format!("cannot cast {from:?} to {to:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;
    use crate::compiler::parser::Parser;
    use crate::symbol::{SymbolParameter, SymbolTable};
    use crate::vm::builtins::register_builtins;

    fn compile_source(src: &str, table: &SymbolTable) -> Result<CompiledShader, RenderError> {
        let tokens = Lexer::tokenize(src).unwrap();
        let decl = Parser::parse_shader(tokens)?;
        compile(&decl, table)
    }

    #[test]
    fn uniform_loop_counter_compiles_through_the_scalar_path() {
        let table = SymbolTable::new();
        let src = "surface s() { uniform float i; varying float y; for (i = 0; i < 4; i += 1) { y = i; if (i == 1) { break; } } }";
        let compiled = compile_source(src, &table).unwrap();
        assert!(compiled
            .body
            .iter()
            .any(|i| matches!(i, Instruction::UniformLoopPredicate { .. })));
    }

    #[test]
    fn break_under_a_varying_condition_inside_a_uniform_loop_compiles() {
        let mut table = SymbolTable::new();
        table.add_symbols().var("x", ValueType::Float, ValueStorage::Varying);
        let src = "surface s() { uniform float i; varying float y; y = 0; for (i = 0; i < 4; i += 1) { if (x > 0) { break; } y = y + 1; } }";
        let compiled = compile_source(src, &table).unwrap();
        assert!(compiled
            .body
            .iter()
            .any(|i| matches!(i, Instruction::UniformLoopPredicate { .. })));
        assert!(compiled.body.iter().any(|i| matches!(i, Instruction::Break(_))));
        assert!(compiled
            .body
            .iter()
            .any(|i| matches!(i, Instruction::LoopFrameBegin)));
    }

    #[test]
    fn varying_condition_compiles_through_the_masked_path() {
        let mut table = SymbolTable::new();
        table.add_symbols().var("x", ValueType::Float, ValueStorage::Varying);
        let src = "surface s() { varying float y; if (x > 0) { y = 1; } else { y = 0; } }";
        let compiled = compile_source(src, &table).unwrap();
        assert!(compiled.body.iter().any(|i| matches!(i, Instruction::PushMask)));
        assert!(compiled.body.iter().any(|i| matches!(i, Instruction::PushMaskInverted)));
    }

    #[test]
    fn break_outside_loop_is_rejected_before_codegen_even_runs() {
        let table = SymbolTable::new();
        let err = compile_source("surface s() { break; }", &table).unwrap_err();
        assert!(err.to_string().contains(crate::error::BREAK_OUTSIDE_OF_LOOP));
    }

    #[test]
    fn unresolved_call_is_a_semantic_error() {
        let table = SymbolTable::new();
        let err = compile_source("surface s() { varying float y; y = nope(1); }", &table).unwrap_err();
        assert!(matches!(err, RenderError::SemanticError { .. }));
    }

    #[test]
    fn builtin_call_resolves_and_compiles() {
        let mut table = SymbolTable::new();
        register_builtins(&mut table);
        let src = "surface s() { varying float y; y = sqrt(4); }";
        let compiled = compile_source(src, &table).unwrap();
        assert!(compiled
            .body
            .iter()
            .any(|i| matches!(i, Instruction::CallBuiltin { id, .. } if *id == crate::vm::builtins::SQRT)));
    }

    #[test]
    fn param_default_compiles_to_a_standalone_program() {
        let table = SymbolTable::new();
        let src = "surface s(uniform float Ka = 1) { }";
        let compiled = compile_source(src, &table).unwrap();
        assert_eq!(compiled.params.len(), 1);
        assert!(compiled.params[0].default.is_some());
    }

    #[test]
    fn unused_symbol_parameter_import_is_exercised() {
        let _ = SymbolParameter::new(ValueType::Float, ValueStorage::Uniform);
    }
}
