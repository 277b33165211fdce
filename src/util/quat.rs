use serde::{Deserialize, Serialize};
use std::ops::Mul;

use crate::util::vec3::Vec3;

/// Unit quaternion for entity orientation (x, y, z imaginary, w real)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians around `axis`
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let axis = axis.normalize();
        let (sin, cos) = (angle * 0.5).sin_cos();
        Self {
            x: axis.x * sin,
            y: axis.y * sin,
            z: axis.z * sin,
            w: cos,
        }
    }

    /// Yaw (around +Y) then pitch (around +X), matching a first-person camera
    pub fn from_yaw_pitch(yaw: f32, pitch: f32) -> Self {
        Self::from_axis_angle(Vec3::Y, yaw) * Self::from_axis_angle(Vec3::X, pitch)
    }

    #[inline]
    pub fn length_sq(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w
    }

    /// Normalize; degenerate or non-finite input collapses to identity
    pub fn normalize(&self) -> Self {
        let len_sq = self.length_sq();
        if !len_sq.is_finite() || len_sq <= f32::EPSILON {
            return Self::IDENTITY;
        }
        let inv = 1.0 / len_sq.sqrt();
        Self {
            x: self.x * inv,
            y: self.y * inv,
            z: self.z * inv,
            w: self.w * inv,
        }
    }

    pub fn conjugate(&self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
            w: self.w,
        }
    }

    /// Rotate a vector by this (unit) quaternion
    pub fn rotate(&self, v: Vec3) -> Vec3 {
        let q = Vec3::new(self.x, self.y, self.z);
        let t = q.cross(v) * 2.0;
        v + t * self.w + q.cross(t)
    }

    pub fn approx_eq(&self, other: Quat, epsilon: f32) -> bool {
        (self.x - other.x).abs() < epsilon
            && (self.y - other.y).abs() < epsilon
            && (self.z - other.z).abs() < epsilon
            && (self.w - other.w).abs() < epsilon
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Quat {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self {
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_identity_rotation() {
        let v = Vec3::new(1.0, 2.0, 3.0);
        assert!(Quat::IDENTITY.rotate(v).approx_eq(v, 1e-6));
    }

    #[test]
    fn test_axis_angle_rotation() {
        let q = Quat::from_axis_angle(Vec3::Z, FRAC_PI_2);
        assert!(q.rotate(Vec3::X).approx_eq(Vec3::Y, 1e-5));
    }

    #[test]
    fn test_normalize_degenerate() {
        assert_eq!(Quat::new(0.0, 0.0, 0.0, 0.0).normalize(), Quat::IDENTITY);
        assert_eq!(Quat::new(f32::NAN, 0.0, 0.0, 1.0).normalize(), Quat::IDENTITY);
    }

    #[test]
    fn test_normalize_scales_to_unit() {
        let q = Quat::new(0.0, 0.0, 0.0, 4.0).normalize();
        assert!(q.approx_eq(Quat::IDENTITY, 1e-6));
    }

    #[test]
    fn test_mul_composes() {
        let quarter = Quat::from_axis_angle(Vec3::Y, FRAC_PI_2);
        let half = quarter * quarter;
        assert!(half.rotate(Vec3::X).approx_eq(-Vec3::X, 1e-5));
        assert!((quarter * quarter.conjugate()).approx_eq(Quat::IDENTITY, 1e-6));
    }
}
