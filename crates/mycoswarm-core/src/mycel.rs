//! Mycelial support field: reaction-transport density in `[0, 1]`.

use serde::{Deserialize, Serialize};

use crate::{GridField, SimError, SimParams};

#[inline]
fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Density field grown by food pheromone and resources, smoothed toward the
/// neighbour average and decayed each tick. Values stay in `[0, 1]` after
/// every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MycelNetwork {
    density: GridField,
}

impl MycelNetwork {
    pub fn new(width: u32, height: u32) -> Result<Self, SimError> {
        Ok(Self {
            density: GridField::new(width, height, 0.0)?,
        })
    }

    #[must_use]
    pub fn density(&self) -> &GridField {
        &self.density
    }

    #[must_use]
    pub fn density_mut(&mut self) -> &mut GridField {
        &mut self.density
    }

    /// One reaction-transport update.
    ///
    /// Drive is the clamped weighted sum of local food pheromone and
    /// resources, re-mapped through the activation threshold; transport
    /// pulls toward the in-bound neighbour average (the cell itself when no
    /// neighbour is in bounds).
    pub fn update(&mut self, params: &SimParams, pheromone: &GridField, resources: &GridField) {
        let width = self.density.width() as usize;
        let height = self.density.height() as usize;
        let src = self.density.cells();
        let mut next = vec![0.0f32; src.len()];

        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                let current = src[idx];

                let mut drive = clamp01(
                    params.mycel_drive_p * pheromone.cells()[idx]
                        + params.mycel_drive_r * resources.cells()[idx],
                );
                let threshold = params.mycel_drive_threshold;
                drive = if drive > threshold {
                    (drive - threshold) / (1.0 - threshold)
                } else {
                    0.0
                };

                let mut neighbor_sum = 0.0f32;
                let mut neighbor_count = 0u32;
                if x > 0 {
                    neighbor_sum += src[idx - 1];
                    neighbor_count += 1;
                }
                if x + 1 < width {
                    neighbor_sum += src[idx + 1];
                    neighbor_count += 1;
                }
                if y > 0 {
                    neighbor_sum += src[idx - width];
                    neighbor_count += 1;
                }
                if y + 1 < height {
                    neighbor_sum += src[idx + width];
                    neighbor_count += 1;
                }
                let neighbor_avg = if neighbor_count > 0 {
                    neighbor_sum / neighbor_count as f32
                } else {
                    current
                };

                let growth = params.mycel_growth * drive * (1.0 - current);
                let transport = params.mycel_transport * (neighbor_avg - current);
                let decay = params.mycel_decay * current;
                next[idx] = clamp01(current + growth + transport - decay);
            }
        }

        self.density
            .copy_from(&next)
            .expect("update buffer matches field size");
    }
}
