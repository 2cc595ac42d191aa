//! Parametric sphere, clipped to `[zmin, zmax]` along its axis and swept
//! through `[0, thetamax]` azimuthally — a quadric primitive alongside
//! Cylinder and Cone.

use cgmath::{InnerSpace, Point3, Vector3};

#[derive(Debug, Clone, Copy)]
pub struct Sphere {
    pub radius: f32,
    pub zmin: f32,
    pub zmax: f32,
    pub thetamax: f32,
}

impl Sphere {
    pub fn new(radius: f32, zmin: f32, zmax: f32, thetamax: f32) -> Self {
        Sphere { radius, zmin, zmax, thetamax }
    }

    fn phi_range(&self) -> (f32, f32) {
        let clamp = |z: f32| (z / self.radius).clamp(-1.0, 1.0);
        (clamp(self.zmin).asin(), clamp(self.zmax).asin())
    }

    pub fn position(&self, u: f32, v: f32) -> Point3<f32> {
        let (phimin, phimax) = self.phi_range();
        let phi = phimin + v * (phimax - phimin);
        let theta = u * self.thetamax;
        Point3::new(
            self.radius * phi.cos() * theta.cos(),
            self.radius * phi.cos() * theta.sin(),
            self.radius * phi.sin(),
        )
    }

    pub fn normal(&self, u: f32, v: f32) -> Vector3<f32> {
        let p = self.position(u, v);
        Vector3::new(p.x, p.y, p.z).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sphere_poles_align_with_axis() {
        let sphere = Sphere::new(1.0, -1.0, 1.0, std::f32::consts::TAU);
        let south = sphere.position(0.0, 0.0);
        let north = sphere.position(0.0, 1.0);
        assert!((south.z + 1.0).abs() < 1e-5);
        assert!((north.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn normal_is_unit_length_and_radial() {
        let sphere = Sphere::new(2.0, -2.0, 2.0, std::f32::consts::TAU);
        let n = sphere.normal(0.25, 0.6);
        assert!((n.magnitude() - 1.0).abs() < 1e-5);
    }
}
