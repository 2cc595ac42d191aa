//! Named collection of [`Value`]s over a width x height micropolygon mesh.
//! Produced by dicing (`crate::geometry::dicer`), mutated by the VM during
//! shading.

use crate::value::{Value, ValueStorage, ValueType};
use cgmath::Vector3;
use std::collections::HashMap;

/// A light contribution appended by `Renderer::light_shade` and consumed by
/// the `illuminance` builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightHandle(pub(crate) usize);

/// The `Cl`/`L` a light shader left in its private grid after its last run,
/// captured by `Renderer::light_shade` and read back by `illuminance` as it
/// iterates a surface grid's active lights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSample {
    pub cl: Vector3<f32>,
    pub l: Vector3<f32>,
}

impl Default for LightSample {
    fn default() -> Self {
        LightSample {
            cl: Vector3::new(0.0, 0.0, 0.0),
            l: Vector3::new(0.0, 0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    width: usize,
    height: usize,
    pub du: f32,
    pub dv: f32,
    /// Shutter-relative shading time, the `time` builtin.
    pub time: f32,
    values: HashMap<String, Value>,
    lights: Vec<LightHandle>,
    light_samples: Vec<LightSample>,
}

impl Default for Grid {
    fn default() -> Self {
        Grid {
            width: 0,
            height: 0,
            du: 0.0,
            dv: 0.0,
            time: 0.0,
            values: HashMap::new(),
            lights: Vec::new(),
            light_samples: Vec::new(),
        }
    }
}

impl Grid {
    pub fn new() -> Self {
        Grid::default()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn vertex_count(&self) -> usize {
        self.width * self.height
    }

    /// Resize the grid. Existing varying Values are resized to match;
    /// uniform/constant Values are left alone.
    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        let count = width * height;
        for value in self.values.values_mut() {
            if value.storage().is_varying() {
                value.resize(count);
            }
        }
    }

    /// Creates and returns a Value of `name`. Fails if a Value of the same
    /// name already exists with an incompatible type.
    pub fn add_value(&mut self, name: &str, ty: ValueType) -> Result<&mut Value, GridError> {
        self.add_value_with_storage(name, ty, ValueStorage::Varying)
    }

    pub fn add_value_with_storage(
        &mut self,
        name: &str,
        ty: ValueType,
        storage: ValueStorage,
    ) -> Result<&mut Value, GridError> {
        if let Some(existing) = self.values.get(name) {
            if existing.ty() != ty {
                return Err(GridError::TypeConflict {
                    name: name.to_string(),
                    existing: existing.ty(),
                    requested: ty,
                });
            }
        } else {
            let len = if storage.is_varying() {
                self.vertex_count()
            } else {
                1
            };
            let mut value = Value::create(ty, storage);
            value.resize(len);
            self.values.insert(name.to_string(), value);
        }
        Ok(self.values.get_mut(name).unwrap())
    }

    /// gets-or-creates.
    pub fn value(&mut self, name: &str, ty: ValueType) -> &mut Value {
        self.add_value(name, ty)
            .expect("caller requested a type that conflicts with an existing Value")
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.values.get_mut(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|s| s.as_str())
    }

    pub fn lights(&self) -> &[LightHandle] {
        &self.lights
    }

    /// The `Cl`/`L` each entry of `lights()` carried, in the same order.
    pub fn light_samples(&self) -> &[LightSample] {
        &self.light_samples
    }

    pub fn push_light(&mut self, handle: LightHandle, sample: LightSample) {
        self.lights.push(handle);
        self.light_samples.push(sample);
    }

    pub fn clear_lights(&mut self) {
        self.lights.clear();
        self.light_samples.clear();
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GridError {
    #[error("Value \"{name}\" already exists with type {existing:?}, requested {requested:?}")]
    TypeConflict {
        name: String,
        existing: ValueType,
        requested: ValueType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resizing_a_grid_resizes_its_varying_values() {
        let mut grid = Grid::new();
        grid.resize(2, 2);
        grid.add_value("P", ValueType::Point).unwrap();
        assert_eq!(grid.get("P").unwrap().len(), 4);
    }

    #[test]
    fn adding_the_same_name_twice_with_different_type_fails() {
        let mut grid = Grid::new();
        grid.resize(1, 1);
        grid.add_value("x", ValueType::Float).unwrap();
        let err = grid.add_value("x", ValueType::Color);
        assert!(err.is_err());
    }

    #[test]
    fn uniform_values_are_not_resized_with_the_grid() {
        let mut grid = Grid::new();
        grid.resize(1, 1);
        grid.add_value_with_storage("i", ValueType::Float, ValueStorage::Uniform)
            .unwrap();
        grid.resize(4, 4);
        assert_eq!(grid.get("i").unwrap().len(), 1);
    }
}
