//! Compute-kernel contract and the bundled demo kernel.
//!
//! The scheduler treats rendering as an opaque, pure function of
//! (scene version, seed, tile). Anything implementing [`RenderKernel`] can
//! be plugged into a worker pool.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::types::{FrameInfo, Tile};

/// A per-pixel renderer.
///
/// Implementations must be deterministic for a given frame, tile and
/// [`identity`](Self::identity): late or duplicate results are discarded
/// or overwritten by the scheduler, never merged.
pub trait RenderKernel: Send + Sync + 'static {
    /// Name and build of the kernel; feeds the scene version.
    fn identity(&self) -> String;

    /// Render `tile` and return `tile.width * tile.height * 4` RGBA bytes,
    /// row-major with the top row first.
    fn render(&self, frame: &FrameInfo, tile: &Tile) -> Vec<u8>;
}

/// Demo kernel: a unit sphere over a ground sphere under a sky gradient,
/// shaded by surface normal, with `tile.sampling` jittered samples per
/// pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkyKernel;

const SKY_KERNEL_BUILD: &str = "1";

impl RenderKernel for SkyKernel {
    fn identity(&self) -> String {
        format!("sky-kernel/{SKY_KERNEL_BUILD}")
    }

    fn render(&self, frame: &FrameInfo, tile: &Tile) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(tile_seed(&frame.seed, tile));
        let samples = tile.sampling.max(1);
        let width = f64::from(frame.width.max(1));
        let height = f64::from(frame.height.max(1));

        let mut out = Vec::with_capacity(tile.buffer_len());
        for row in 0..tile.height {
            for col in 0..tile.width {
                let mut acc = Vec3::default();
                for _ in 0..samples {
                    let (jx, jy) = if samples == 1 {
                        (0.5, 0.5)
                    } else {
                        (rng.random::<f64>(), rng.random::<f64>())
                    };
                    let u = (f64::from(tile.x + col) + jx) / width;
                    let v = 1.0 - (f64::from(tile.y + row) + jy) / height;
                    acc = acc.add(trace(u, v));
                }
                let colour = acc.scale(1.0 / f64::from(samples));
                out.extend_from_slice(&[
                    to_byte(colour.x),
                    to_byte(colour.y),
                    to_byte(colour.z),
                    255,
                ]);
            }
        }
        out
    }
}

/// Stable per-tile RNG seed.
fn tile_seed(seed: &str, tile: &Tile) -> u64 {
    let digest = Sha256::digest(format!(
        "{seed}:{}:{}:{}:{}:{}",
        tile.x, tile.y, tile.width, tile.height, tile.sampling
    ));
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn to_byte(channel: f64) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[derive(Debug, Clone, Copy, Default)]
struct Vec3 {
    x: f64,
    y: f64,
    z: f64,
}

impl Vec3 {
    const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn add(self, o: Self) -> Self {
        Self::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }

    fn sub(self, o: Self) -> Self {
        Self::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }

    fn scale(self, s: f64) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    fn dot(self, o: Self) -> f64 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    fn unit(self) -> Self {
        let len = self.dot(self).sqrt();
        if len == 0.0 {
            self
        } else {
            self.scale(1.0 / len)
        }
    }
}

const SPHERES: [(Vec3, f64); 2] = [
    (Vec3::new(0.0, 0.0, -1.0), 0.5),
    (Vec3::new(0.0, -100.5, -1.0), 100.0),
];

/// Colour seen along the camera ray through viewport coordinates (u, v).
fn trace(u: f64, v: f64) -> Vec3 {
    let lower_left = Vec3::new(-2.0, -1.125, -1.0);
    let direction = lower_left
        .add(Vec3::new(4.0 * u, 0.0, 0.0))
        .add(Vec3::new(0.0, 2.25 * v, 0.0));

    let mut closest: Option<(f64, Vec3, f64)> = None;
    for &(centre, radius) in &SPHERES {
        if let Some(t) = hit_sphere(centre, radius, direction) {
            if closest.map_or(true, |(best, _, _)| t < best) {
                closest = Some((t, centre, radius));
            }
        }
    }

    match closest {
        Some((t, centre, radius)) => {
            let normal = direction.scale(t).sub(centre).scale(1.0 / radius);
            normal.add(Vec3::new(1.0, 1.0, 1.0)).scale(0.5)
        }
        None => {
            let f = 0.5 * (direction.unit().y + 1.0);
            Vec3::new(1.0, 1.0, 1.0)
                .scale(1.0 - f)
                .add(Vec3::new(0.5, 0.7, 1.0).scale(f))
        }
    }
}

/// Nearest positive hit distance of a ray from the origin.
fn hit_sphere(centre: Vec3, radius: f64, direction: Vec3) -> Option<f64> {
    let oc = Vec3::default().sub(centre);
    let a = direction.dot(direction);
    let b = oc.dot(direction);
    let c = oc.dot(oc) - radius * radius;
    let discriminant = b * b - a * c;
    if discriminant <= 0.0 {
        return None;
    }
    let root = discriminant.sqrt();
    [(-b - root) / a, (-b + root) / a]
        .into_iter()
        .find(|&t| t > 1e-3)
}
