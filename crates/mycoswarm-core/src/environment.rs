//! Resource field with regeneration, blockades and hotspot shifts.

use serde::{Deserialize, Serialize};

use crate::{GridField, SimError, SimParams, SimRng};

/// Harvestable resource layer plus a byte mask of blocked cells. A blocked
/// cell holds zero resources and never regenerates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    resources: GridField,
    blocked: Vec<u8>,
    width: u32,
    height: u32,
}

impl Environment {
    pub fn new(width: u32, height: u32) -> Result<Self, SimError> {
        Ok(Self {
            resources: GridField::new(width, height, 0.0)?,
            blocked: vec![0; (width as usize) * (height as usize)],
            width,
            height,
        })
    }

    #[must_use]
    pub fn resources(&self) -> &GridField {
        &self.resources
    }

    #[must_use]
    pub fn resources_mut(&mut self) -> &mut GridField {
        &mut self.resources
    }

    #[must_use]
    pub fn is_blocked(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.blocked[(y as usize) * (self.width as usize) + (x as usize)] != 0
    }

    /// Sparse hotspot seeding: roughly 2% of cells receive `U[0.5, 1.0)`.
    pub fn seed_resources(&mut self, rng: &mut SimRng) {
        for idx in 0..self.resources.len() {
            let roll = rng.uniform(0.0, 1.0);
            self.resources.cells_mut()[idx] = if roll > 0.98 {
                rng.uniform(0.5, 1.0)
            } else {
                0.0
            };
        }
    }

    /// Adds `resource_regen` to every non-blocked cell, clamped to
    /// `resource_max`.
    pub fn regenerate(&mut self, params: &SimParams) {
        let cells = self.resources.cells_mut();
        for (idx, cell) in cells.iter_mut().enumerate() {
            if self.blocked[idx] != 0 {
                continue;
            }
            *cell = (*cell + params.resource_regen).min(params.resource_max);
        }
    }

    /// Zeroes resources and marks cells blocked over the rectangle clipped
    /// to grid bounds. Negative or zero extents are ignored.
    pub fn apply_block_rect(&mut self, x: i32, y: i32, w: i32, h: i32) {
        if w <= 0 || h <= 0 {
            return;
        }
        let x0 = x.max(0) as u32;
        let y0 = y.max(0) as u32;
        let x1 = (x.saturating_add(w)).clamp(0, self.width as i32) as u32;
        let y1 = (y.saturating_add(h)).clamp(0, self.height as i32) as u32;
        for yy in y0..y1 {
            for xx in x0..x1 {
                if let Some(cell) = self.resources.get_mut(xx, yy) {
                    *cell = 0.0;
                }
                self.blocked[(yy as usize) * (self.width as usize) + (xx as usize)] = 1;
            }
        }
    }

    /// Toroidally rotates the resource buffer by `(dx, dy)`. The blocked
    /// mask is not rotated.
    pub fn shift_hotspots(&mut self, dx: i32, dy: i32) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        let w = self.width as i64;
        let h = self.height as i64;
        let sx = ((dx as i64 % w) + w) % w;
        let sy = ((dy as i64 % h) + h) % h;

        let mut next = vec![0.0f32; self.resources.len()];
        for y in 0..h {
            for x in 0..w {
                let nx = (x + sx) % w;
                let ny = (y + sy) % h;
                next[(ny * w + nx) as usize] =
                    self.resources.cells()[(y * w + x) as usize];
            }
        }
        self.resources
            .copy_from(&next)
            .expect("shift buffer matches field size");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SimParams {
        SimParams {
            resource_regen: 0.1,
            resource_max: 1.0,
            ..SimParams::default()
        }
    }

    #[test]
    fn seeding_is_sparse_and_bounded() {
        let mut env = Environment::new(64, 64).expect("env");
        let mut rng = SimRng::new(42);
        env.seed_resources(&mut rng);
        let hot: Vec<f32> = env
            .resources()
            .cells()
            .iter()
            .copied()
            .filter(|v| *v > 0.0)
            .collect();
        assert!(!hot.is_empty());
        // 2% expected; allow a generous band for a 4096-cell draw.
        assert!(hot.len() < 64 * 64 / 10);
        assert!(hot.iter().all(|v| (0.5..1.0).contains(v)));
    }

    #[test]
    fn blocked_cells_never_regenerate() {
        let mut env = Environment::new(8, 8).expect("env");
        env.apply_block_rect(0, 0, 4, 8);
        for _ in 0..5 {
            env.regenerate(&params());
        }
        for y in 0..8 {
            for x in 0..8 {
                let v = env.resources().get(x, y).unwrap();
                if x < 4 {
                    assert_eq!(v, 0.0, "blocked cell ({x},{y}) regenerated");
                    assert!(env.is_blocked(x, y));
                } else {
                    assert!((v - 0.5).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn regeneration_clamps_to_max() {
        let mut env = Environment::new(4, 4).expect("env");
        env.resources_mut().fill(0.95);
        env.regenerate(&params());
        for v in env.resources().cells() {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn block_rect_is_clipped() {
        let mut env = Environment::new(4, 4).expect("env");
        env.resources_mut().fill(1.0);
        env.apply_block_rect(-2, -2, 4, 4);
        assert_eq!(env.resources().get(0, 0), Some(0.0));
        assert_eq!(env.resources().get(1, 1), Some(0.0));
        assert_eq!(env.resources().get(2, 2), Some(1.0));
        env.apply_block_rect(0, 0, -1, 5);
        assert_eq!(env.resources().get(3, 3), Some(1.0));
    }

    #[test]
    fn hotspot_shift_is_toroidal() {
        let mut env = Environment::new(4, 3).expect("env");
        *env.resources_mut().get_mut(3, 2).expect("cell") = 0.7;
        env.shift_hotspots(2, 2);
        assert_eq!(env.resources().get(3, 2), Some(0.0));
        assert!((env.resources().get(1, 1).unwrap() - 0.7).abs() < 1e-6);

        // Negative offsets wrap the other way.
        env.shift_hotspots(-2, -2);
        assert!((env.resources().get(3, 2).unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn shift_does_not_move_mask() {
        let mut env = Environment::new(4, 4).expect("env");
        env.apply_block_rect(0, 0, 1, 1);
        env.shift_hotspots(1, 0);
        assert!(env.is_blocked(0, 0));
        assert!(!env.is_blocked(1, 0));
    }
}
