//! Dense 2D scalar fields and the CPU diffusion reference pass.

use serde::{Deserialize, Serialize};

use crate::SimError;

/// Row-major f32 grid. Indexing is `(x, y) -> y * width + x`; fields are
/// never resized during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridField {
    width: u32,
    height: u32,
    cells: Vec<f32>,
}

impl GridField {
    /// Construct a grid with `width * height` cells initialised to `initial`.
    pub fn new(width: u32, height: u32, initial: f32) -> Result<Self, SimError> {
        if width == 0 || height == 0 {
            return Err(SimError::InvalidConfig(
                "field dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            cells: vec![initial; (width as usize) * (height as usize)],
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [f32] {
        &mut self.cells
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Immutable access to a specific cell.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x < self.width && y < self.height {
            Some(self.cells[self.offset(x, y)])
        } else {
            None
        }
    }

    /// Mutable access to a specific cell.
    pub fn get_mut(&mut self, x: u32, y: u32) -> Option<&mut f32> {
        if x < self.width && y < self.height {
            let idx = self.offset(x, y);
            Some(&mut self.cells[idx])
        } else {
            None
        }
    }

    /// Point sample at float coordinates; out-of-bounds reads return 0.
    #[must_use]
    pub fn sample(&self, fx: f32, fy: f32) -> f32 {
        if fx < 0.0 || fy < 0.0 {
            return 0.0;
        }
        let x = fx as u32;
        let y = fy as u32;
        self.get(x, y).unwrap_or(0.0)
    }

    /// Fills the grid with the provided scalar value.
    pub fn fill(&mut self, value: f32) {
        self.cells.fill(value);
    }

    /// Replace the whole buffer. Fails when the length does not match.
    pub fn copy_from(&mut self, values: &[f32]) -> Result<(), SimError> {
        if values.len() != self.cells.len() {
            return Err(SimError::ShapeMismatch);
        }
        self.cells.copy_from_slice(values);
        Ok(())
    }
}

/// Per-pass diffusion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldParams {
    pub diffusion: f32,
    pub evaporation: f32,
}

impl FieldParams {
    #[must_use]
    pub const fn new(diffusion: f32, evaporation: f32) -> Self {
        Self {
            diffusion,
            evaporation,
        }
    }
}

/// One 5-point diffusion + evaporation pass, CPU reference semantics.
///
/// Border cells (fewer than four in-bound neighbours) keep their
/// pre-diffusion value; evaporation and the non-negativity floor apply to
/// every cell. The GPU kernel must stay within 1e-3 per cell of this pass.
pub fn diffuse_and_evaporate(field: &mut GridField, params: FieldParams) {
    let width = field.width as usize;
    let height = field.height as usize;
    let diff = params.diffusion;
    let evap = params.evaporation;
    let src = &field.cells;
    let mut next = vec![0.0f32; src.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let center = src[idx];
            let mut sum = center * (1.0 - diff);
            let mut count = 0u32;

            if x > 0 {
                sum += src[idx - 1] * (diff * 0.25);
                count += 1;
            }
            if x + 1 < width {
                sum += src[idx + 1] * (diff * 0.25);
                count += 1;
            }
            if y > 0 {
                sum += src[idx - width] * (diff * 0.25);
                count += 1;
            }
            if y + 1 < height {
                sum += src[idx + width] * (diff * 0.25);
                count += 1;
            }

            let value = if count < 4 { center } else { sum };
            next[idx] = (value * (1.0 - evap)).max(0.0);
        }
    }

    field.cells = next;
}
