//! CPU evaluation of the terrain noise.
//!
//! The functions in this module mirror `noise.wgsl` exactly, so that heights queried on the CPU
//! (e.g. for placing objects or clamping the camera) match the displaced terrain on the GPU.

use crate::config::NoiseConfig;
use bevy::math::{Vec2, Vec2Swizzles, Vec3, Vec4, Vec4Swizzles};

const C: Vec4 = Vec4::new(
    0.211_324_87,  // (3 - sqrt(3)) / 6
    0.366_025_42,  // (sqrt(3) - 1) / 2
    -0.577_350_26, // 2 * C.x - 1
    0.024_390_243, // 1 / 41
);

fn mod289(x: Vec3) -> Vec3 {
    x - (x * (1.0 / 289.0)).floor() * 289.0
}

fn mod289_2(x: Vec2) -> Vec2 {
    x - (x * (1.0 / 289.0)).floor() * 289.0
}

fn permute(x: Vec3) -> Vec3 {
    mod289((x * 34.0 + 1.0) * x)
}

/// Two dimensional simplex noise in the range of roughly [-1, 1].
pub fn simplex(v: Vec2) -> f32 {
    // first corner
    let i = (v + v.dot(Vec2::splat(C.y))).floor();
    let x0 = v - i + i.dot(Vec2::splat(C.x));

    // other corners
    let i1 = if x0.x > x0.y { Vec2::X } else { Vec2::Y };
    let mut x12 = x0.xyxy() + Vec4::new(C.x, C.x, C.z, C.z);
    x12.x -= i1.x;
    x12.y -= i1.y;

    let i = mod289_2(i);
    let p = permute(
        permute(i.y + Vec3::new(0.0, i1.y, 1.0)) + i.x + Vec3::new(0.0, i1.x, 1.0),
    );

    let mut m = (0.5
        - Vec3::new(
            x0.dot(x0),
            x12.xy().dot(x12.xy()),
            x12.zw().dot(x12.zw()),
        ))
    .max(Vec3::ZERO);
    m = m * m;
    m = m * m;

    // gradients from 41 points on a line, mapped onto a diamond
    let x = 2.0 * (p * C.w).fract() - 1.0;
    let h = x.abs() - 0.5;
    let ox = (x + 0.5).floor();
    let a0 = x - ox;

    m *= 1.792_842_9 - 0.853_734_73 * (a0 * a0 + h * h);

    let g = Vec3::new(
        a0.x * x0.x + h.x * x0.y,
        a0.y * x12.x + h.y * x12.y,
        a0.z * x12.z + h.z * x12.w,
    );

    130.0 * m.dot(g)
}

impl NoiseConfig {
    /// Evaluates the terrain height at the horizontal world position `xz`.
    pub fn height(&self, xz: Vec2) -> f32 {
        let mut noise_height = 0.0;
        let mut amplitude = 1.0;
        let mut frequency = 1.0;

        for _ in 0..self.octaves {
            noise_height += amplitude * simplex(xz / (self.scale * frequency));
            amplitude *= self.persistence;
            frequency *= self.lacunarity;
        }

        self.terrain_height * (noise_height + 1.0) * 0.5
    }

    /// Approximates the surface normal at `xz` with central differences one unit apart.
    pub fn normal(&self, xz: Vec2) -> Vec3 {
        let left = self.height(xz - Vec2::X);
        let right = self.height(xz + Vec2::X);
        let down = self.height(xz - Vec2::Y);
        let up = self.height(xz + Vec2::Y);

        let dx = Vec3::new(2.0, right - left, 0.0);
        let dz = Vec3::new(0.0, up - down, 2.0);

        dz.cross(dx).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn simplex_vanishes_at_origin() {
        assert_eq!(simplex(Vec2::ZERO), 0.0);
    }

    #[test]
    fn simplex_stays_bounded() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10_000 {
            let v = Vec2::new(
                rng.random_range(-1000.0..1000.0),
                rng.random_range(-1000.0..1000.0),
            );
            let value = simplex(v);
            assert!(value.is_finite());
            assert!(value.abs() <= 1.1, "simplex({v}) = {value}");
        }
    }

    #[test]
    fn height_at_origin_is_half_the_terrain_height() {
        let noise = NoiseConfig::default();

        assert!((noise.height(Vec2::ZERO) - noise.terrain_height * 0.5).abs() < 1e-5);
    }

    #[test]
    fn flat_terrain_points_up() {
        let noise = NoiseConfig {
            terrain_height: 0.0,
            ..Default::default()
        };

        assert!(noise.normal(Vec2::new(12.0, -40.0)).abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn normals_are_unit_length_and_face_up() {
        let noise = NoiseConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..100 {
            let xz = Vec2::new(
                rng.random_range(-2000.0..2000.0),
                rng.random_range(-2000.0..2000.0),
            );
            let normal = noise.normal(xz);
            assert!((normal.length() - 1.0).abs() < 1e-4);
            assert!(normal.y > 0.0);
        }
    }
}
