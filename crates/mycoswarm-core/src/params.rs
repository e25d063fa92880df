//! Simulation, evolution and stress parameter bundles.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::species::{SPECIES_COUNT, SpeciesProfile, default_profiles, default_species_fracs};

/// Errors raised when validating configuration.
#[derive(Debug, Error, PartialEq)]
pub enum SimError {
    /// A parameter value is outside its documented range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Incoming data dimensions disagree with the current fields.
    #[error("shape mismatch against current field dimensions")]
    ShapeMismatch,
}

/// Static parameters of a swarm context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimParams {
    /// Grid width in cells.
    pub width: u32,
    /// Grid height in cells.
    pub height: u32,
    /// Number of agent slots.
    pub agent_count: usize,
    /// Default tick count for batch runs.
    pub steps: u32,

    pub pheromone_evaporation: f32,
    pub pheromone_diffusion: f32,
    pub molecule_evaporation: f32,
    pub molecule_diffusion: f32,

    pub resource_regen: f32,
    pub resource_max: f32,

    pub mycel_decay: f32,
    pub mycel_growth: f32,
    pub mycel_transport: f32,
    pub mycel_drive_threshold: f32,
    pub mycel_drive_p: f32,
    pub mycel_drive_r: f32,

    pub agent_move_cost: f32,
    pub agent_harvest: f32,
    pub agent_deposit_scale: f32,
    pub agent_sense_radius: f32,
    pub agent_random_turn: f32,

    /// Per-species pool capacity.
    pub dna_capacity: usize,
    /// Global pool capacity.
    pub dna_global_capacity: usize,
    pub dna_survival_bias: f32,

    pub phero_food_deposit_scale: f32,
    pub phero_danger_deposit_scale: f32,
    pub danger_delta_threshold: f32,
    pub danger_bounce_deposit: f32,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            agent_count: 512,
            steps: 200,

            pheromone_evaporation: 0.02,
            pheromone_diffusion: 0.15,
            molecule_evaporation: 0.35,
            molecule_diffusion: 0.25,

            resource_regen: 0.0015,
            resource_max: 1.0,

            mycel_decay: 0.003,
            mycel_growth: 0.02,
            mycel_transport: 0.12,
            mycel_drive_threshold: 0.08,
            mycel_drive_p: 0.6,
            mycel_drive_r: 0.4,

            agent_move_cost: 0.01,
            agent_harvest: 0.04,
            agent_deposit_scale: 0.8,
            agent_sense_radius: 2.5,
            agent_random_turn: 0.2,

            dna_capacity: 256,
            dna_global_capacity: 128,
            dna_survival_bias: 0.7,

            phero_food_deposit_scale: 0.8,
            phero_danger_deposit_scale: 0.6,
            danger_delta_threshold: 0.05,
            danger_bounce_deposit: 0.02,
        }
    }
}

impl SimParams {
    /// Rejects values the engine cannot run with. Zero agents are allowed
    /// (empty-world runs are a documented scenario).
    pub fn validate(&self) -> Result<(), SimError> {
        if self.width == 0 || self.height == 0 {
            return Err(SimError::InvalidConfig("grid dimensions must be non-zero"));
        }
        if self.resource_max <= 0.0 {
            return Err(SimError::InvalidConfig("resource_max must be positive"));
        }
        for value in [
            self.pheromone_evaporation,
            self.pheromone_diffusion,
            self.molecule_evaporation,
            self.molecule_diffusion,
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SimError::InvalidConfig(
                    "diffusion and evaporation rates must be within [0, 1]",
                ));
            }
        }
        if self.resource_regen < 0.0
            || self.agent_move_cost < 0.0
            || self.agent_harvest < 0.0
            || self.agent_sense_radius < 0.0
            || self.agent_random_turn < 0.0
            || self.dna_survival_bias < 0.0
            || self.phero_food_deposit_scale < 0.0
            || self.phero_danger_deposit_scale < 0.0
            || self.danger_delta_threshold < 0.0
            || self.danger_bounce_deposit < 0.0
        {
            return Err(SimError::InvalidConfig(
                "rates, costs and deposit scales must be non-negative",
            ));
        }
        if !(0.0..1.0).contains(&self.mycel_drive_threshold) {
            return Err(SimError::InvalidConfig(
                "mycel_drive_threshold must be within [0, 1)",
            ));
        }
        Ok(())
    }
}

/// Evolution tuning. Disabled by default; the fixed fallback mutation
/// (sigma 0.1, delta 0.05) applies while disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvoParams {
    pub enabled: bool,
    /// Fraction of the pool treated as elite, and the probability of
    /// sampling from it.
    pub elite_frac: f32,
    /// Energy above which a genome is written back to its pools.
    pub min_energy_to_store: f32,
    pub mutation_sigma: f32,
    pub exploration_delta: f32,
    /// Ticks per fitness averaging window; 0 disables windowing.
    pub fitness_window: u32,
    /// Per-tick fitness decay factor for stored entries.
    pub age_decay: f32,
    /// Probability that a DNA-bound spawn samples the global pool.
    pub global_spawn_frac: f32,
}

impl Default for EvoParams {
    fn default() -> Self {
        Self {
            enabled: false,
            elite_frac: 0.20,
            min_energy_to_store: 1.6,
            mutation_sigma: 0.05,
            exploration_delta: 0.05,
            fitness_window: 50,
            age_decay: 0.995,
            global_spawn_frac: 0.15,
        }
    }
}

impl EvoParams {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.mutation_sigma < 0.0 || self.exploration_delta < 0.0 {
            return Err(SimError::InvalidConfig(
                "mutation sigma and exploration delta must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.global_spawn_frac) {
            return Err(SimError::InvalidConfig(
                "global_spawn_frac must be within [0, 1]",
            ));
        }
        if self.enabled {
            if !(0.0..=1.0).contains(&self.elite_frac) || self.elite_frac == 0.0 {
                return Err(SimError::InvalidConfig(
                    "elite_frac must be within (0, 1]",
                ));
            }
            if self.fitness_window == 0 {
                return Err(SimError::InvalidConfig(
                    "fitness_window must be positive under evolution",
                ));
            }
            if !(0.0..=1.0).contains(&self.age_decay) || self.age_decay == 0.0 {
                return Err(SimError::InvalidConfig("age_decay must be within (0, 1]"));
            }
        }
        Ok(())
    }
}

/// One-shot environmental perturbation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressParams {
    pub enabled: bool,
    /// First tick at which the perturbation fires.
    pub at_step: u64,
    /// Resource blockade `(x, y, w, h)`.
    pub block_rect: Option<(i32, i32, i32, i32)>,
    /// Toroidal hotspot shift `(dx, dy)`.
    pub shift_hotspots: Option<(i32, i32)>,
    /// Upper bound of per-cell uniform pheromone noise after the event.
    pub pheromone_noise: f32,
    /// Separate noise seed; falls back to the main seed when absent.
    pub seed: Option<u64>,
}

impl Default for StressParams {
    fn default() -> Self {
        Self {
            enabled: false,
            at_step: 120,
            block_rect: None,
            shift_hotspots: None,
            pheromone_noise: 0.0,
            seed: None,
        }
    }
}

impl StressParams {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.pheromone_noise < 0.0 {
            return Err(SimError::InvalidConfig(
                "stress pheromone noise must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Everything needed to construct a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub params: SimParams,
    pub evo: EvoParams,
    pub stress: StressParams,
    pub seed: u64,
    pub species_fracs: [f32; SPECIES_COUNT],
    pub profiles: [SpeciesProfile; SPECIES_COUNT],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            params: SimParams::default(),
            evo: EvoParams::default(),
            stress: StressParams::default(),
            seed: 42,
            species_fracs: default_species_fracs(),
            profiles: default_profiles(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        self.params.validate()?;
        self.evo.validate()?;
        self.stress.validate()?;
        if self.species_fracs.iter().any(|f| *f < 0.0 || !f.is_finite()) {
            return Err(SimError::InvalidConfig(
                "species fractions must be finite and non-negative",
            ));
        }
        Ok(())
    }
}
