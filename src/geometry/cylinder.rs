//! Parametric cylinder. `position()` includes the `zmin` offset in the z
//! coordinate (`zmin + v * (zmax - zmin)`) rather than dropping it.

use cgmath::{Point3, Vector3};

#[derive(Debug, Clone, Copy)]
pub struct Cylinder {
    pub radius: f32,
    pub zmin: f32,
    pub zmax: f32,
    pub thetamax: f32,
}

impl Cylinder {
    pub fn new(radius: f32, zmin: f32, zmax: f32, thetamax: f32) -> Self {
        Cylinder { radius, zmin, zmax, thetamax }
    }

    pub fn position(&self, u: f32, v: f32) -> Point3<f32> {
        let n = self.normal(u, v);
        Point3::new(self.radius * n.x, self.radius * n.y, self.zmin + v * (self.zmax - self.zmin))
    }

    pub fn normal(&self, u: f32, _v: f32) -> Vector3<f32> {
        let theta = u * self.thetamax;
        Vector3::new(theta.cos(), theta.sin(), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_includes_zmin_offset() {
        let cylinder = Cylinder::new(1.0, 2.0, 3.0, std::f32::consts::TAU);
        let bottom = cylinder.position(0.0, 0.0);
        let top = cylinder.position(0.0, 1.0);
        assert!((bottom.z - 2.0).abs() < 1e-6);
        assert!((top.z - 3.0).abs() < 1e-6);
    }

    #[test]
    fn unit_cylinder_matches_known_vertices() {
        let cylinder = Cylinder::new(1.0, 0.0, 1.0, std::f32::consts::TAU);
        let p0 = cylinder.position(0.0, 0.0);
        assert!((p0.x - 1.0).abs() < 1e-5 && p0.y.abs() < 1e-5 && p0.z.abs() < 1e-5);
        let p1 = cylinder.position(1.0, 1.0);
        assert!((p1.x - 1.0).abs() < 1e-4 && p1.y.abs() < 1e-4 && (p1.z - 1.0).abs() < 1e-5);
    }
}
