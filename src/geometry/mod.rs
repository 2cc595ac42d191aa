//! Abstract parametric primitives: boundable, splittable, diceable.
//! Represented as a tagged variant rather than a trait object — dicing
//! stays allocation-free per vertex and adding a primitive is a local
//! match arm.

pub mod cone;
pub mod cylinder;
pub mod dicer;
pub mod sphere;

use cgmath::{Matrix4, Point3, Transform, Vector3};

use crate::error::RenderError;
use crate::grid::Grid;
use crate::value::ValueType;

pub use cone::Cone;
pub use cylinder::Cylinder;
pub use sphere::Sphere;

/// (u,v) parameter range, always a subinterval of `[0,1]^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRange {
    pub u: (f32, f32),
    pub v: (f32, f32),
}

impl UvRange {
    pub fn unit() -> Self {
        UvRange { u: (0.0, 1.0), v: (0.0, 1.0) }
    }

    /// The 4-way bisection every diceable primitive's `split` uses.
    fn quadrants(self) -> [UvRange; 4] {
        let (u0, u2) = self.u;
        let u1 = (u0 + u2) / 2.0;
        let (v0, v2) = self.v;
        let v1 = (v0 + v2) / 2.0;
        [
            UvRange { u: (u0, u1), v: (v0, v1) },
            UvRange { u: (u0, u1), v: (v1, v2) },
            UvRange { u: (u1, u2), v: (v0, v1) },
            UvRange { u: (u1, u2), v: (v1, v2) },
        ]
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Cylinder(Cylinder),
    Sphere(Sphere),
    Cone(Cone),
}

/// A parametric primitive together with the (u,v) window of its surface it
/// currently represents. Splitting narrows the window; intrinsic shape
/// parameters never change.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    kind: Kind,
    range: UvRange,
}

impl Geometry {
    pub fn cylinder(cylinder: Cylinder) -> Self {
        Geometry { kind: Kind::Cylinder(cylinder), range: UvRange::unit() }
    }

    pub fn sphere(sphere: Sphere) -> Self {
        Geometry { kind: Kind::Sphere(sphere), range: UvRange::unit() }
    }

    pub fn cone(cone: Cone) -> Self {
        Geometry { kind: Kind::Cone(cone), range: UvRange::unit() }
    }

    pub fn u_range(&self) -> (f32, f32) {
        self.range.u
    }

    pub fn v_range(&self) -> (f32, f32) {
        self.range.v
    }

    fn with_range(&self, range: UvRange) -> Geometry {
        Geometry { kind: self.kind, range }
    }

    fn position(&self, u: f32, v: f32) -> Point3<f32> {
        match &self.kind {
            Kind::Cylinder(c) => c.position(u, v),
            Kind::Sphere(s) => s.position(u, v),
            Kind::Cone(c) => c.position(u, v),
        }
    }

    fn normal(&self, u: f32, v: f32) -> Vector3<f32> {
        match &self.kind {
            Kind::Cylinder(c) => c.normal(u, v),
            Kind::Sphere(s) => s.normal(u, v),
            Kind::Cone(c) => c.normal(u, v),
        }
    }

    pub fn boundable(&self) -> bool {
        true
    }

    /// Bounds by dicing at a fixed 8x8 resolution and taking the extrema of
    /// the resulting positions (dicing is cheap and already transform-correct).
    pub fn bound(&self, transform: &Matrix4<f32>) -> Result<(Point3<f32>, Point3<f32>), RenderError> {
        let grid = self.dice(transform, 8, 8)?;
        let positions = grid.get("P").expect("dice always writes P").point_values().expect("P is a point value");
        let mut min = Point3::new(f32::MAX, f32::MAX, f32::MAX);
        let mut max = Point3::new(f32::MIN, f32::MIN, f32::MIN);
        for p in positions {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }
        Ok((min, max))
    }

    pub fn splittable(&self) -> bool {
        true
    }

    /// 4-way (u,v) bisection; children keep the same intrinsic shape
    /// parameters with narrower ranges.
    pub fn split(&self) -> Vec<Geometry> {
        self.range.quadrants().into_iter().map(|r| self.with_range(r)).collect()
    }

    pub fn diceable(&self) -> bool {
        true
    }

    /// Dices into a `width x height` vertex grid carrying at minimum `P`,
    /// `s`, `t`. Sampling clamps to the range endpoints via
    /// `min(u + du, u_range.y)` stepping to avoid floating-point drift past
    /// the boundary.
    pub fn dice(&self, transform: &Matrix4<f32>, width: usize, height: usize) -> Result<Grid, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::UnsupportedGeometry {
                message: "dice width/height must be positive".into(),
            });
        }

        let mut grid = Grid::new();
        grid.resize(width, height);
        let (u0, u1) = self.range.u;
        let (v0, v1) = self.range.v;
        grid.du = (u1 - u0) / (width as f32 - 1.0).max(1.0);
        grid.dv = (v1 - v0) / (height as f32 - 1.0).max(1.0);

        grid.add_value("P", ValueType::Point).ok();
        grid.add_value("N", ValueType::Normal).ok();
        grid.add_value("s", ValueType::Float).ok();
        grid.add_value("t", ValueType::Float).ok();

        let p = grid.value("P", ValueType::Point).point_values_mut().expect("P is a point value");
        let mut positions = vec![Point3::new(0.0, 0.0, 0.0); width * height];
        let mut normals = vec![Vector3::new(0.0, 0.0, 0.0); width * height];
        let mut ss = vec![0.0f32; width * height];
        let mut ts = vec![0.0f32; width * height];

        let du = if width > 1 { (u1 - u0) / (width as f32 - 1.0) } else { 0.0 };
        let dv = if height > 1 { (v1 - v0) / (height as f32 - 1.0) } else { 0.0 };
        let mut vertex = 0;
        let mut v = v0;
        for j in 0..height {
            let mut u = u0;
            for _ in 0..width {
                let position = self.position(u, v);
                let normal = self.normal(u, v);
                positions[vertex] = transform.transform_point(position);
                normals[vertex] = transform.transform_vector(normal);
                ss[vertex] = u;
                ts[vertex] = v;
                u = (u + du).min(u1);
                vertex += 1;
            }
            v = (v + dv).min(v1);
            let _ = j;
        }
        p.copy_from_slice(&positions);

        let n = grid.value("N", ValueType::Normal).vec3_values_mut().expect("N is a vector value");
        n.copy_from_slice(&normals);
        let s = grid.value("s", ValueType::Float).float_values_mut().expect("s is a float value");
        s.copy_from_slice(&ss);
        let t = grid.value("t", ValueType::Float).float_values_mut().expect("t is a float value");
        t.copy_from_slice(&ts);

        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;

    #[test]
    fn split_produces_four_quadrants_with_narrower_ranges() {
        let geometry = Geometry::cylinder(Cylinder::new(1.0, 0.0, 1.0, std::f32::consts::TAU));
        let children = geometry.split();
        assert_eq!(children.len(), 4);
        for child in &children {
            let (u0, u1) = child.u_range();
            let (v0, v1) = child.v_range();
            assert!(u1 - u0 <= 0.5 + 1e-6);
            assert!(v1 - v0 <= 0.5 + 1e-6);
        }
    }

    #[test]
    fn dice_clamps_to_range_endpoints() {
        let geometry = Geometry::cylinder(Cylinder::new(1.0, 0.0, 1.0, std::f32::consts::TAU));
        let grid = geometry.dice(&Matrix4::identity(), 4, 4).unwrap();
        assert_eq!(grid.vertex_count(), 16);
        let t = grid.get("t").unwrap().float_values().unwrap();
        assert!((t[15] - 1.0).abs() < 1e-6);
    }
}
