//! Built-in functions: arithmetic already lives in [`super::machine`]'s
//! `Arith`/`Compare` handling; this module covers the named call surface —
//! trig, noise, lighting, and derivative builtins. Registered into a
//! [`SymbolTable`] so overload resolution (`crate::symbol`) picks the right
//! one, and dispatched by numeric id from `CallBuiltin`.

use crate::error::RenderError;
use crate::grid::Grid;
use crate::symbol::{SymbolImpl, SymbolParameter, SymbolTable};
use crate::value::{Value, ValueStorage, ValueType};
use cgmath::{InnerSpace, Vector3};

macro_rules! builtin_id {
    ($name:ident, $id:expr) => {
        pub const $name: u32 = $id;
    };
}

builtin_id!(ABS, 1);
builtin_id!(SQRT, 2);
builtin_id!(POW, 3);
builtin_id!(MIN, 4);
builtin_id!(MAX, 5);
builtin_id!(CLAMP, 6);
builtin_id!(MIX, 7);
builtin_id!(SIN, 8);
builtin_id!(COS, 9);
builtin_id!(TAN, 10);
builtin_id!(RADIANS, 11);
builtin_id!(DEGREES, 12);
builtin_id!(FLOOR, 13);
builtin_id!(CEIL, 14);
builtin_id!(MOD, 15);
builtin_id!(LENGTH, 16);
builtin_id!(NORMALIZE, 17);
builtin_id!(DOT, 18);
builtin_id!(NOISE, 19);
builtin_id!(AMBIENT, 20);
builtin_id!(DIFFUSE, 21);
builtin_id!(SPECULAR, 22);
builtin_id!(DU, 23);
builtin_id!(DV, 24);
builtin_id!(AREA, 25);
builtin_id!(TEXTURE, 26);

/// Declares every builtin's (name, parameter signature, return type) into
/// `table` so overload resolution can find them.
pub fn register_builtins(table: &mut SymbolTable) {
    use ValueStorage::Varying as V;
    let f = ValueType::Float;
    let color = ValueType::Color;
    let vector = ValueType::Vector;
    let normal = ValueType::Normal;

    let mut def = |name: &str, params: Vec<ValueType>, ret: ValueType, id: u32| {
        let parameters = params
            .into_iter()
            .map(|ty| SymbolParameter::new(ty, V))
            .collect();
        table
            .add_symbols()
            .function(name, ret, V, parameters, SymbolImpl::Builtin { id });
    };

    def("abs", vec![f], f, ABS);
    def("sqrt", vec![f], f, SQRT);
    def("pow", vec![f, f], f, POW);
    def("min", vec![f, f], f, MIN);
    def("max", vec![f, f], f, MAX);
    def("clamp", vec![f, f, f], f, CLAMP);
    def("mix", vec![f, f, f], f, MIX);
    def("sin", vec![f], f, SIN);
    def("cos", vec![f], f, COS);
    def("tan", vec![f], f, TAN);
    def("radians", vec![f], f, RADIANS);
    def("degrees", vec![f], f, DEGREES);
    def("floor", vec![f], f, FLOOR);
    def("ceil", vec![f], f, CEIL);
    def("mod", vec![f, f], f, MOD);
    // `length`/`normalize`/`dot` are declared for every vector-shaped type
    // (point/vector/normal/color all share the same `Vector3<f32>` storage,
    // `crate::value::ValueData`) since shaders call them on whichever one a
    // given computation happens to carry.
    for vectorlike in [vector, normal, color] {
        def("length", vec![vectorlike], f, LENGTH);
        def("normalize", vec![vectorlike], vectorlike, NORMALIZE);
    }
    for (a, b) in [
        (vector, vector),
        (normal, normal),
        (normal, vector),
        (vector, normal),
    ] {
        def("dot", vec![a, b], f, DOT);
    }
    def("noise", vec![f], f, NOISE);
    def("ambient", vec![], color, AMBIENT);
    def("diffuse", vec![normal], color, DIFFUSE);
    def("specular", vec![normal, vector, f], color, SPECULAR);
    def("Du", vec![f], f, DU);
    def("Dv", vec![f], f, DV);
    def("area", vec![vector], f, AREA);
    def("texture", vec![ValueType::String], color, TEXTURE);
}

fn elementwise_float(a: &Value, f: impl Fn(f32) -> f32) -> Result<Value, RenderError> {
    let values: Vec<f32> = a
        .float_values()
        .map_err(|e| RenderError::RuntimeShadingError {
            vertex_count: None,
            message: e.to_string(),
        })?
        .iter()
        .map(|x| f(*x))
        .collect();
    let mut out = Value::create(ValueType::Float, a.storage());
    out.resize(values.len());
    out.float_values_mut().unwrap().copy_from_slice(&values);
    Ok(out)
}

fn elementwise_float2(a: &Value, b: &Value, f: impl Fn(f32, f32) -> f32) -> Result<Value, RenderError> {
    let av = a.float_values().map_err(|e| runtime_err(e.to_string()))?;
    let bv = b.float_values().map_err(|e| runtime_err(e.to_string()))?;
    let len = av.len().max(bv.len());
    let storage = if a.storage().is_varying() || b.storage().is_varying() {
        ValueStorage::Varying
    } else {
        ValueStorage::Uniform
    };
    let mut out = Value::create(ValueType::Float, storage);
    out.resize(len);
    let dst = out.float_values_mut().unwrap();
    for i in 0..len {
        let x = av[i % av.len()];
        let y = bv[i % bv.len()];
        dst[i] = f(x, y);
    }
    Ok(out)
}

fn runtime_err(message: impl Into<String>) -> RenderError {
    RenderError::RuntimeShadingError {
        vertex_count: None,
        message: message.into(),
    }
}

/// Runtime context the light-aware builtins need beyond their arguments:
/// the grid they're executing over (for `lights()`, `du`/`dv`, neighbor
/// lookups for `Du`/`Dv`/`area`) and the per-light contributions already
/// written by `Renderer::light_shade`.
pub struct BuiltinContext<'a> {
    pub grid: &'a Grid,
}

pub fn call(id: u32, args: Vec<Value>, ctx: &BuiltinContext) -> Result<Value, RenderError> {
    match id {
        ABS => elementwise_float(&args[0], f32::abs),
        SQRT => elementwise_float(&args[0], f32::sqrt),
        SIN => elementwise_float(&args[0], f32::sin),
        COS => elementwise_float(&args[0], f32::cos),
        TAN => elementwise_float(&args[0], f32::tan),
        RADIANS => elementwise_float(&args[0], f32::to_radians),
        DEGREES => elementwise_float(&args[0], f32::to_degrees),
        FLOOR => elementwise_float(&args[0], f32::floor),
        CEIL => elementwise_float(&args[0], f32::ceil),
        POW => elementwise_float2(&args[0], &args[1], f32::powf),
        MIN => elementwise_float2(&args[0], &args[1], f32::min),
        MAX => elementwise_float2(&args[0], &args[1], f32::max),
        MOD => elementwise_float2(&args[0], &args[1], |a, b| a.rem_euclid(b)),
        CLAMP => {
            let x = args[0].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let lo = args[1].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let hi = args[2].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let len = x.len();
            let mut out = Value::create(ValueType::Float, args[0].storage());
            out.resize(len);
            let dst = out.float_values_mut().unwrap();
            for i in 0..len {
                dst[i] = x[i].clamp(lo[i % lo.len()], hi[i % hi.len()]);
            }
            Ok(out)
        }
        MIX => {
            let x = args[0].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let y = args[1].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let a = args[2].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let len = x.len().max(y.len());
            let mut out = Value::create(ValueType::Float, ValueStorage::Varying);
            out.resize(len);
            let dst = out.float_values_mut().unwrap();
            for i in 0..len {
                let t = a[i % a.len()];
                dst[i] = x[i % x.len()] * (1.0 - t) + y[i % y.len()] * t;
            }
            Ok(out)
        }
        LENGTH => {
            let v = args[0].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let mut out = Value::create(ValueType::Float, args[0].storage());
            out.resize(v.len());
            let dst = out.float_values_mut().unwrap();
            for i in 0..v.len() {
                dst[i] = v[i].magnitude();
            }
            Ok(out)
        }
        NORMALIZE => {
            let v = args[0].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let mut out = Value::create(args[0].ty(), args[0].storage());
            out.resize(v.len());
            let dst = out.vec3_values_mut().unwrap();
            for i in 0..v.len() {
                dst[i] = if v[i].magnitude2() > 0.0 {
                    v[i].normalize()
                } else {
                    Vector3::new(0.0, 0.0, 0.0)
                };
            }
            Ok(out)
        }
        DOT => {
            let a = args[0].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let b = args[1].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let len = a.len().max(b.len());
            let storage = if args[0].storage().is_varying() || args[1].storage().is_varying() {
                ValueStorage::Varying
            } else {
                ValueStorage::Uniform
            };
            let mut out = Value::create(ValueType::Float, storage);
            out.resize(len);
            let dst = out.float_values_mut().unwrap();
            for i in 0..len {
                dst[i] = a[i % a.len()].dot(b[i % b.len()]);
            }
            Ok(out)
        }
        NOISE => {
            // Deterministic hash-based value noise. Not a Perlin-grade
            // implementation; good enough to give shaders variance without
            // depending on an external table.
            let x = args[0].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let mut out = Value::create(ValueType::Float, args[0].storage());
            out.resize(x.len());
            let dst = out.float_values_mut().unwrap();
            for i in 0..x.len() {
                dst[i] = hash_noise(x[i]);
            }
            Ok(out)
        }
        AMBIENT => {
            // Simplified lighting: `ambient()` sums every active light's `Cl`
            // directly, as a standalone call, rather than requiring the
            // shader body to spell out an `illuminance` loop. With no active
            // lights this is black.
            let count = ctx.grid.vertex_count().max(1);
            let sum = ctx
                .grid
                .light_samples()
                .iter()
                .fold(Vector3::new(0.0, 0.0, 0.0), |acc, sample| acc + sample.cl);
            let mut out = Value::create(ValueType::Color, ValueStorage::Varying);
            out.resize(count);
            for slot in out.vec3_values_mut().unwrap() {
                *slot = sum;
            }
            Ok(out)
        }
        DIFFUSE => {
            let normals = args[0].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let count = normals.len().max(ctx.grid.vertex_count()).max(1);
            let mut out = Value::create(ValueType::Color, ValueStorage::Varying);
            out.resize(count);
            let dst = out.vec3_values_mut().unwrap();
            for (i, slot) in dst.iter_mut().enumerate() {
                let n = normals[i % normals.len()];
                *slot = ctx.grid.light_samples().iter().fold(Vector3::new(0.0, 0.0, 0.0), |acc, sample| {
                    if sample.l.magnitude2() > 0.0 {
                        let k = n.dot(sample.l.normalize()).max(0.0);
                        acc + sample.cl * k
                    } else {
                        acc
                    }
                });
            }
            Ok(out)
        }
        SPECULAR => {
            let normals = args[0].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let views = args[1].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            let roughness = args[2].float_values().map_err(|e| runtime_err(e.to_string()))?;
            let count = normals.len().max(views.len()).max(ctx.grid.vertex_count()).max(1);
            let mut out = Value::create(ValueType::Color, ValueStorage::Varying);
            out.resize(count);
            let dst = out.vec3_values_mut().unwrap();
            for (i, slot) in dst.iter_mut().enumerate() {
                let n = normals[i % normals.len()];
                let v = views[i % views.len()];
                let rough = roughness[i % roughness.len()].max(f32::EPSILON);
                *slot = ctx.grid.light_samples().iter().fold(Vector3::new(0.0, 0.0, 0.0), |acc, sample| {
                    if sample.l.magnitude2() == 0.0 || v.magnitude2() == 0.0 {
                        return acc;
                    }
                    let half = sample.l.normalize() + v.normalize();
                    if half.magnitude2() == 0.0 {
                        return acc;
                    }
                    let k = n.dot(half.normalize()).max(0.0).powf(1.0 / rough);
                    acc + sample.cl * k
                });
            }
            Ok(out)
        }
        DU | DV => {
            let values = args[0].float_values().map_err(|e| runtime_err(e.to_string()))?;
            finite_difference(values, ctx.grid, id == DU)
        }
        AREA => {
            let positions = args[0].vec3_values().map_err(|e| runtime_err(e.to_string()))?;
            area_from_positions(positions, ctx.grid)
        }
        TEXTURE => {
            let names = args[0].string_values().map_err(|e| runtime_err(e.to_string()))?;
            let name = names.first().map(|s| s.to_string()).unwrap_or_default();
            Err(RenderError::ResourceMissing {
                message: format!("texture \"{name}\" requires an external texture subsystem"),
            })
        }
        other => Err(runtime_err(format!("unknown builtin id {other}"))),
    }
}

fn hash_noise(x: f32) -> f32 {
    let bits = x.to_bits() as u64;
    let mut h = bits.wrapping_mul(0x9E3779B97F4A7C15);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51AFD7ED558CCD);
    h ^= h >> 33;
    (h as f64 / u64::MAX as f64) as f32
}

fn finite_difference(values: &[f32], grid: &Grid, along_u: bool) -> Result<Value, RenderError> {
    let (w, h) = (grid.width(), grid.height());
    if values.len() != w * h {
        let mut out = Value::create(ValueType::Float, ValueStorage::Uniform);
        out.resize(1);
        return Ok(out);
    }
    let mut out = Value::create(ValueType::Float, ValueStorage::Varying);
    out.resize(values.len());
    let dst = out.float_values_mut().unwrap();
    let step = if along_u { grid.du } else { grid.dv };
    for j in 0..h {
        for i in 0..w {
            let idx = j * w + i;
            let neighbor = if along_u {
                if i + 1 < w {
                    idx + 1
                } else {
                    idx.saturating_sub(1)
                }
            } else if j + 1 < h {
                idx + w
            } else {
                idx.saturating_sub(w)
            };
            let denom = if step.abs() > f32::EPSILON { step } else { 1.0 };
            dst[idx] = (values[neighbor] - values[idx]) / denom;
        }
    }
    Ok(out)
}

fn area_from_positions(positions: &[Vector3<f32>], grid: &Grid) -> Result<Value, RenderError> {
    let (w, h) = (grid.width(), grid.height());
    let mut out = Value::create(ValueType::Float, ValueStorage::Varying);
    out.resize(positions.len());
    if positions.len() != w * h {
        return Ok(out);
    }
    let dst = out.float_values_mut().unwrap();
    for j in 0..h {
        for i in 0..w {
            let idx = j * w + i;
            let iu = if i + 1 < w { idx + 1 } else { idx.saturating_sub(1) };
            let iv = if j + 1 < h { idx + w } else { idx.saturating_sub(w) };
            let du = positions[iu] - positions[idx];
            let dv = positions[iv] - positions[idx];
            dst[idx] = du.cross(dv).magnitude();
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueStorage;

    #[test]
    fn abs_is_elementwise() {
        let mut v = Value::create(ValueType::Float, ValueStorage::Varying);
        v.resize(3);
        v.float_values_mut().unwrap().copy_from_slice(&[-1.0, 0.0, 2.0]);
        let grid = Grid::new();
        let ctx = BuiltinContext { grid: &grid };
        let out = call(ABS, vec![v], &ctx).unwrap();
        assert_eq!(out.float_values().unwrap(), &[1.0, 0.0, 2.0]);
    }

    #[test]
    fn du_uses_forward_difference_with_clamped_boundary() {
        let mut grid = Grid::new();
        grid.resize(2, 1);
        grid.du = 1.0;
        let mut v = Value::create(ValueType::Float, ValueStorage::Varying);
        v.resize(2);
        v.float_values_mut().unwrap().copy_from_slice(&[1.0, 3.0]);
        let ctx = BuiltinContext { grid: &grid };
        let out = call(DU, vec![v], &ctx).unwrap();
        assert_eq!(out.float_values().unwrap(), &[2.0, -2.0]);
    }
}
