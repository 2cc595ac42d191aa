//! Typed per-vertex arrays.
//!
//! A [`Value`] is one storage class times one element type: a single
//! constant/uniform element, or `width * height` varying elements. It backs
//! every named attribute a [`crate::grid::Grid`] carries.

use cgmath::{Matrix4, Point3, Vector3};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    Integer,
    Color,
    Point,
    Vector,
    Normal,
    Matrix,
    String,
}

impl ValueType {
    /// Whether `self` may be promoted to `target` with no data conversion
    /// (i.e. they're storage-identical). Distinct point/vector/normal/color
    /// never promote into each other; there is no implicit float<->point
    /// conversion.
    pub fn is_assignable_to(self, target: ValueType) -> bool {
        self == target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueStorage {
    Constant,
    Uniform,
    Varying,
    Vertex,
}

impl ValueStorage {
    /// Vertex behaves as varying for this core.
    pub fn normalize(self) -> ValueStorage {
        match self {
            ValueStorage::Vertex => ValueStorage::Varying,
            other => other,
        }
    }

    pub fn is_varying(self) -> bool {
        matches!(self.normalize(), ValueStorage::Varying)
    }

    /// Promotion order used by overload resolution and assignment checks:
    /// constant -> uniform -> varying. Returns `true` if `self` can stand in
    /// for `required` (a narrower storage may always widen, never narrow).
    pub fn promotes_to(self, required: ValueStorage) -> bool {
        self.normalize().rank() <= required.normalize().rank()
    }

    fn rank(self) -> u8 {
        match self.normalize() {
            ValueStorage::Constant => 0,
            ValueStorage::Uniform => 1,
            ValueStorage::Varying | ValueStorage::Vertex => 2,
        }
    }
}

/// Dense, typed storage for a [`Value`]. Variant matches [`ValueType`].
#[derive(Debug, Clone)]
pub enum ValueData {
    Float(Vec<f32>),
    Integer(Vec<i32>),
    Color(Vec<Vector3<f32>>),
    Point(Vec<Point3<f32>>),
    Vector(Vec<Vector3<f32>>),
    Normal(Vec<Vector3<f32>>),
    Matrix(Vec<Matrix4<f32>>),
    String(Vec<Arc<str>>),
}

impl ValueData {
    fn new(ty: ValueType, len: usize) -> Self {
        match ty {
            ValueType::Float => ValueData::Float(vec![0.0; len]),
            ValueType::Integer => ValueData::Integer(vec![0; len]),
            ValueType::Color => ValueData::Color(vec![Vector3::new(0.0, 0.0, 0.0); len]),
            ValueType::Point => ValueData::Point(vec![Point3::new(0.0, 0.0, 0.0); len]),
            ValueType::Vector => ValueData::Vector(vec![Vector3::new(0.0, 0.0, 0.0); len]),
            ValueType::Normal => ValueData::Normal(vec![Vector3::new(0.0, 0.0, 0.0); len]),
            ValueType::Matrix => ValueData::Matrix(vec![Matrix4::from_scale(1.0); len]),
            ValueType::String => ValueData::String(vec![Arc::from(""); len]),
        }
    }

    fn len(&self) -> usize {
        match self {
            ValueData::Float(v) => v.len(),
            ValueData::Integer(v) => v.len(),
            ValueData::Color(v) => v.len(),
            ValueData::Point(v) => v.len(),
            ValueData::Vector(v) => v.len(),
            ValueData::Normal(v) => v.len(),
            ValueData::Matrix(v) => v.len(),
            ValueData::String(v) => v.len(),
        }
    }

    fn resize(&mut self, len: usize) {
        match self {
            ValueData::Float(v) => v.resize(len, 0.0),
            ValueData::Integer(v) => v.resize(len, 0),
            ValueData::Color(v) => v.resize(len, Vector3::new(0.0, 0.0, 0.0)),
            ValueData::Point(v) => v.resize(len, Point3::new(0.0, 0.0, 0.0)),
            ValueData::Vector(v) => v.resize(len, Vector3::new(0.0, 0.0, 0.0)),
            ValueData::Normal(v) => v.resize(len, Vector3::new(0.0, 0.0, 0.0)),
            ValueData::Matrix(v) => v.resize(len, Matrix4::from_scale(1.0)),
            ValueData::String(v) => v.resize(len, Arc::from("")),
        }
    }

    fn zero(&mut self) {
        match self {
            ValueData::Float(v) => v.iter_mut().for_each(|x| *x = 0.0),
            ValueData::Integer(v) => v.iter_mut().for_each(|x| *x = 0),
            ValueData::Color(v) | ValueData::Vector(v) | ValueData::Normal(v) => {
                v.iter_mut().for_each(|x| *x = Vector3::new(0.0, 0.0, 0.0))
            }
            ValueData::Point(v) => v.iter_mut().for_each(|x| *x = Point3::new(0.0, 0.0, 0.0)),
            ValueData::Matrix(v) => v.iter_mut().for_each(|x| *x = Matrix4::from_scale(0.0)),
            ValueData::String(v) => v.iter_mut().for_each(|x| *x = Arc::from("")),
        }
    }
}

/// (type, storage, length, dense array).
#[derive(Debug, Clone)]
pub struct Value {
    ty: ValueType,
    storage: ValueStorage,
    data: ValueData,
}

impl Value {
    /// `create(type, storage)` — starts at length 1 (valid for
    /// constant/uniform; callers dicing a varying Value must `resize`).
    pub fn create(ty: ValueType, storage: ValueStorage) -> Self {
        Value {
            ty,
            storage,
            data: ValueData::new(ty, 1),
        }
    }

    pub fn ty(&self) -> ValueType {
        self.ty
    }

    pub fn storage(&self) -> ValueStorage {
        self.storage
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize the dense array. For uniform/constant storage `n` must be 1;
    /// for varying storage `n` must be `width * height` of the owning grid.
    pub fn resize(&mut self, n: usize) {
        self.data.resize(n);
    }

    pub fn zero(&mut self) {
        self.data.zero();
    }

    /// Allocate a new varying Value broadcasting a uniform/constant one
    /// across `count` vertices (storage promotion).
    pub fn broadcast(&self, count: usize) -> Value {
        let mut promoted = Value {
            ty: self.ty,
            storage: ValueStorage::Varying,
            data: ValueData::new(self.ty, count),
        };
        match (&self.data, &mut promoted.data) {
            (ValueData::Float(src), ValueData::Float(dst)) => dst.fill(src[0]),
            (ValueData::Integer(src), ValueData::Integer(dst)) => dst.fill(src[0]),
            (ValueData::Color(src), ValueData::Color(dst)) => dst.fill(src[0]),
            (ValueData::Point(src), ValueData::Point(dst)) => dst.fill(src[0]),
            (ValueData::Vector(src), ValueData::Vector(dst)) => dst.fill(src[0]),
            (ValueData::Normal(src), ValueData::Normal(dst)) => dst.fill(src[0]),
            (ValueData::Matrix(src), ValueData::Matrix(dst)) => dst.fill(src[0]),
            (ValueData::String(src), ValueData::String(dst)) => dst.fill(src[0].clone()),
            _ => unreachable!("Value storage always matches its declared type"),
        }
        promoted
    }

    pub fn float_values(&self) -> Result<&[f32], TypeMismatch> {
        match &self.data {
            ValueData::Float(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Float,
                actual: self.ty,
            }),
        }
    }

    pub fn float_values_mut(&mut self) -> Result<&mut [f32], TypeMismatch> {
        let actual = self.ty;
        match &mut self.data {
            ValueData::Float(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Float,
                actual,
            }),
        }
    }

    pub fn integer_values(&self) -> Result<&[i32], TypeMismatch> {
        match &self.data {
            ValueData::Integer(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Integer,
                actual: self.ty,
            }),
        }
    }

    pub fn integer_values_mut(&mut self) -> Result<&mut [i32], TypeMismatch> {
        let actual = self.ty;
        match &mut self.data {
            ValueData::Integer(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Integer,
                actual,
            }),
        }
    }

    pub fn vec3_values(&self) -> Result<&[Vector3<f32>], TypeMismatch> {
        match &self.data {
            ValueData::Color(v) | ValueData::Vector(v) | ValueData::Normal(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Vector,
                actual: self.ty,
            }),
        }
    }

    pub fn vec3_values_mut(&mut self) -> Result<&mut [Vector3<f32>], TypeMismatch> {
        let actual = self.ty;
        match &mut self.data {
            ValueData::Color(v) | ValueData::Vector(v) | ValueData::Normal(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Vector,
                actual,
            }),
        }
    }

    pub fn point_values(&self) -> Result<&[Point3<f32>], TypeMismatch> {
        match &self.data {
            ValueData::Point(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Point,
                actual: self.ty,
            }),
        }
    }

    pub fn point_values_mut(&mut self) -> Result<&mut [Point3<f32>], TypeMismatch> {
        let actual = self.ty;
        match &mut self.data {
            ValueData::Point(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Point,
                actual,
            }),
        }
    }

    pub fn matrix_values(&self) -> Result<&[Matrix4<f32>], TypeMismatch> {
        match &self.data {
            ValueData::Matrix(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::Matrix,
                actual: self.ty,
            }),
        }
    }

    pub fn string_values(&self) -> Result<&[Arc<str>], TypeMismatch> {
        match &self.data {
            ValueData::String(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::String,
                actual: self.ty,
            }),
        }
    }

    pub fn string_values_mut(&mut self) -> Result<&mut [Arc<str>], TypeMismatch> {
        let actual = self.ty;
        match &mut self.data {
            ValueData::String(v) => Ok(v),
            _ => Err(TypeMismatch {
                requested: ValueType::String,
                actual,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("requested {requested:?} accessor on a Value of type {actual:?}")]
pub struct TypeMismatch {
    pub requested: ValueType,
    pub actual: ValueType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_and_uniform_start_at_length_one() {
        let v = Value::create(ValueType::Float, ValueStorage::Uniform);
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn broadcast_fills_every_vertex_with_the_uniform_value() {
        let mut v = Value::create(ValueType::Float, ValueStorage::Uniform);
        v.float_values_mut().unwrap()[0] = 3.5;
        let varying = v.broadcast(4);
        assert_eq!(varying.float_values().unwrap(), &[3.5, 3.5, 3.5, 3.5]);
        assert_eq!(varying.storage(), ValueStorage::Varying);
    }

    #[test]
    fn storage_promotion_is_one_directional() {
        assert!(ValueStorage::Constant.promotes_to(ValueStorage::Varying));
        assert!(ValueStorage::Uniform.promotes_to(ValueStorage::Varying));
        assert!(!ValueStorage::Varying.promotes_to(ValueStorage::Uniform));
    }

    #[test]
    fn mismatched_accessor_fails_without_panicking() {
        let v = Value::create(ValueType::Float, ValueStorage::Uniform);
        assert!(v.vec3_values().is_err());
    }
}
