//! Parametric right circular cone: base radius `radius` at `z = 0`, apex at
//! `z = height`, swept through `[0, thetamax]` azimuthally.

use cgmath::{InnerSpace, Point3, Vector3};

#[derive(Debug, Clone, Copy)]
pub struct Cone {
    pub height: f32,
    pub radius: f32,
    pub thetamax: f32,
}

impl Cone {
    pub fn new(height: f32, radius: f32, thetamax: f32) -> Self {
        Cone { height, radius, thetamax }
    }

    fn radius_at(&self, v: f32) -> f32 {
        self.radius * (1.0 - v)
    }

    pub fn position(&self, u: f32, v: f32) -> Point3<f32> {
        let theta = u * self.thetamax;
        let r = self.radius_at(v);
        Point3::new(r * theta.cos(), r * theta.sin(), v * self.height)
    }

    /// The slant tangent plane's normal direction, independent of `v`: the
    /// radius factor that vanishes at the apex cancels out of the cross
    /// product of the two parametric tangents, so this formula stays well
    /// defined all the way to `v = 1`.
    pub fn normal(&self, u: f32, _v: f32) -> Vector3<f32> {
        let theta = u * self.thetamax;
        Vector3::new(self.height * theta.cos(), self.height * theta.sin(), self.radius).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apex_is_reached_at_v_one() {
        let cone = Cone::new(2.0, 1.0, std::f32::consts::TAU);
        let apex = cone.position(0.3, 1.0);
        assert!(apex.x.abs() < 1e-5 && apex.y.abs() < 1e-5);
        assert!((apex.z - 2.0).abs() < 1e-6);
    }

    #[test]
    fn normal_stays_unit_length_at_apex() {
        let cone = Cone::new(2.0, 1.0, std::f32::consts::TAU);
        let n = cone.normal(0.7, 1.0);
        assert!((n.magnitude() - 1.0).abs() < 1e-5);
    }
}
