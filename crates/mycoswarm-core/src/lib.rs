//! Core engine of the mycoswarm workspace.
//!
//! A tick-stepped spatial simulation: multi-species agents harvest
//! resources on a 2D grid, deposit food and danger pheromones, and shape a
//! mycelial support field. Pheromone and molecule fields diffuse and
//! evaporate every tick, successful genomes accumulate in bounded
//! fitness-sorted DNA pools, and a one-shot stress event can perturb the
//! environment mid-run.
//!
//! The crate is single-threaded within a context and free of GPU and UI
//! dependencies; diffusion offload plugs in through the
//! [`DiffusionBackend`] trait.

pub mod agent;
pub mod dna;
pub mod environment;
pub mod field;
pub mod io;
pub mod metrics;
pub mod mycel;
pub mod params;
pub mod rng;
pub mod sim;
pub mod species;

pub use agent::{Agent, FitnessTracker};
pub use dna::{DnaEntry, DnaMemory, Genome};
pub use environment::Environment;
pub use field::{FieldParams, GridField, diffuse_and_evaporate};
pub use io::{DnaCsvRow, GridData, IoError, PoolRef, load_grid_csv, save_grid_csv};
pub use metrics::{EnergyStats, FieldStats, MycelStats, StepMetrics, field_stats};
pub use mycel::MycelNetwork;
pub use params::{EvoParams, SimConfig, SimError, SimParams, StressParams};
pub use rng::SimRng;
pub use sim::{BackendError, DiffusionBackend, FieldKind, SimIoError, Simulation};
pub use species::{
    SPECIES_COUNT, SpeciesProfile, default_profiles, default_species_fracs, pick_species,
};

/// ABI version reported through the host surface.
pub const API_VERSION: (u32, u32, u32) = (1, 0, 0);
