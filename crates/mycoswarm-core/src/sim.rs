//! Simulation context: owns all state and drives one tick.

use std::f32::consts::TAU;
use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::dna::{DnaMemory, Genome};
use crate::environment::Environment;
use crate::field::{FieldParams, GridField, diffuse_and_evaporate};
use crate::io::{self, IoError, PoolRef};
use crate::metrics::{EnergyStats, FieldStats, MycelStats, StepMetrics, field_stats};
use crate::mycel::MycelNetwork;
use crate::params::{EvoParams, SimConfig, SimError, SimParams, StressParams};
use crate::rng::SimRng;
use crate::species::{SPECIES_COUNT, SpeciesProfile, pick_species};

/// Histogram bins used by the entropy query.
const ENTROPY_BINS: usize = 64;
/// Energy at or below which an agent slot is respawned.
const RESPAWN_THRESHOLD: f32 = 0.05;
/// Storage threshold while evolution is disabled.
const PLAIN_STORE_THRESHOLD: f32 = 1.2;
/// Churn guard for the global pool: candidates must beat the worst entry by
/// this margin when the pool is full.
const GLOBAL_ACCEPT_EPS: f32 = 1e-6;

/// The five exposed scalar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Resources,
    PheroFood,
    PheroDanger,
    Molecules,
    Mycel,
}

impl FieldKind {
    pub const ALL: [FieldKind; 5] = [
        FieldKind::Resources,
        FieldKind::PheroFood,
        FieldKind::PheroDanger,
        FieldKind::Molecules,
        FieldKind::Mycel,
    ];

    /// Stable wire index used by the C ABI.
    #[must_use]
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(FieldKind::Resources),
            1 => Some(FieldKind::PheroFood),
            2 => Some(FieldKind::PheroDanger),
            3 => Some(FieldKind::Molecules),
            4 => Some(FieldKind::Mycel),
            _ => None,
        }
    }

    /// File name suffix used by dump artifacts.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FieldKind::Resources => "resources",
            FieldKind::PheroFood => "phero_food",
            FieldKind::PheroDanger => "phero_danger",
            FieldKind::Molecules => "molecules",
            FieldKind::Mycel => "mycel",
        }
    }
}

/// Failure reported by a diffusion backend.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Offload seam for the three per-tick diffusion passes.
///
/// Implementations own device-side double buffers; `step_diffuse` flips the
/// active buffer of each field after its dispatch. Any error permanently
/// downgrades the owning context to the CPU path and the failed pass is
/// redone on the CPU with identical inputs, so a tick always completes.
pub trait DiffusionBackend: Send {
    /// Static backend identifier for logs.
    fn kind(&self) -> &'static str;

    /// Allocate device buffers for the given field shapes and upload the
    /// initial contents. Resets all ping bits.
    fn init_fields(
        &mut self,
        food: &GridField,
        danger: &GridField,
        molecules: &GridField,
    ) -> Result<(), BackendError>;

    /// Write host data into the currently active buffer of each field.
    fn upload_fields(
        &mut self,
        food: &GridField,
        danger: &GridField,
        molecules: &GridField,
    ) -> Result<(), BackendError>;

    /// Dispatch the diffusion kernel for food, danger and molecules,
    /// flipping each field's active buffer, then optionally read back.
    fn step_diffuse(
        &mut self,
        pheromone: FieldParams,
        molecule: FieldParams,
        copyback: bool,
        food: &mut GridField,
        danger: &mut GridField,
        molecules: &mut GridField,
    ) -> Result<(), BackendError>;

    /// Read the currently active device buffers into the host fields.
    fn copyback(
        &mut self,
        food: &mut GridField,
        danger: &mut GridField,
        molecules: &mut GridField,
    ) -> Result<(), BackendError>;

    /// True only while the device context is fully usable.
    fn is_available(&self) -> bool;
}

/// Errors from field CSV operations against a live context.
#[derive(Debug, Error)]
pub enum SimIoError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("CSV dimensions do not match the current field")]
    Shape,
}

/// One spatial swarm simulation. Exclusive owner of its fields, agents,
/// pools and RNGs; external access goes through copy-in/copy-out.
pub struct Simulation {
    params: SimParams,
    evo: EvoParams,
    stress: StressParams,
    seed: u64,
    species_fracs: [f32; SPECIES_COUNT],
    profiles: [SpeciesProfile; SPECIES_COUNT],

    step_index: u64,
    paused: bool,
    stress_applied: bool,

    rng: SimRng,
    stress_rng: SimRng,

    env: Environment,
    phero_food: GridField,
    phero_danger: GridField,
    molecules: GridField,
    mycel: MycelNetwork,

    dna_species: [DnaMemory; SPECIES_COUNT],
    dna_global: DnaMemory,
    agents: Vec<Agent>,
    metrics: Vec<StepMetrics>,

    backend: Option<Box<dyn DiffusionBackend>>,
    no_copyback: bool,
    gpu_failed: bool,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.seed)
            .field("step_index", &self.step_index)
            .field("paused", &self.paused)
            .field("agent_count", &self.agents.len())
            .field("gpu_active", &self.is_gpu_active())
            .finish()
    }
}

impl Simulation {
    /// Build a context from a validated configuration.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let SimConfig {
            params,
            evo,
            stress,
            seed,
            species_fracs,
            profiles,
        } = config;

        let mut sim = Self {
            rng: SimRng::new(seed),
            stress_rng: SimRng::new(stress.seed.unwrap_or(seed)),
            env: Environment::new(params.width, params.height)?,
            phero_food: GridField::new(params.width, params.height, 0.0)?,
            phero_danger: GridField::new(params.width, params.height, 0.0)?,
            molecules: GridField::new(params.width, params.height, 0.0)?,
            mycel: MycelNetwork::new(params.width, params.height)?,
            params,
            evo,
            stress,
            seed,
            species_fracs,
            profiles,
            step_index: 0,
            paused: false,
            stress_applied: false,
            dna_species: Default::default(),
            dna_global: DnaMemory::new(),
            agents: Vec::new(),
            metrics: Vec::new(),
            backend: None,
            no_copyback: false,
            gpu_failed: false,
        };
        sim.env.seed_resources(&mut sim.rng);
        sim.init_agents();
        Ok(sim)
    }

    /// Reset to tick zero with a new seed: fresh fields, agents and pools.
    /// Any installed backend is dropped; hosts re-enable GPU explicitly.
    pub fn reset(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = SimRng::new(seed);
        self.stress_rng = SimRng::new(self.stress.seed.unwrap_or(seed));
        self.step_index = 0;
        self.stress_applied = false;
        for pool in &mut self.dna_species {
            pool.clear();
        }
        self.dna_global.clear();
        self.metrics.clear();
        self.backend = None;
        self.reinit_fields_and_agents();
    }

    fn reinit_fields_and_agents(&mut self) {
        let width = self.params.width;
        let height = self.params.height;
        self.env = Environment::new(width, height).expect("validated dimensions");
        self.phero_food = GridField::new(width, height, 0.0).expect("validated dimensions");
        self.phero_danger = GridField::new(width, height, 0.0).expect("validated dimensions");
        self.molecules = GridField::new(width, height, 0.0).expect("validated dimensions");
        self.mycel = MycelNetwork::new(width, height).expect("validated dimensions");
        self.env.seed_resources(&mut self.rng);
        self.init_agents();
    }

    fn init_agents(&mut self) {
        self.agents.clear();
        self.agents.reserve(self.params.agent_count);
        for _ in 0..self.params.agent_count {
            let agent = self.fresh_agent(0.2, 0.6);
            self.agents.push(agent);
        }
    }

    /// New agent at a random integer cell; `energy ~ U[lo, hi)`.
    fn fresh_agent(&mut self, energy_lo: f32, energy_hi: f32) -> Agent {
        let x = self.rng.uniform_int(0, i64::from(self.params.width) - 1) as f32;
        let y = self.rng.uniform_int(0, i64::from(self.params.height) - 1) as f32;
        let heading = self.rng.uniform(0.0, TAU);
        let energy = self.rng.uniform(energy_lo, energy_hi);
        let species = pick_species(&mut self.rng, &self.species_fracs);
        let genome = self.sample_spawn_genome(species);
        let mut agent = Agent {
            x,
            y,
            heading,
            energy,
            species,
            genome,
            ..Agent::default()
        };
        agent.fitness.reset(energy);
        agent
    }

    /// Spawn-time genome: DNA-bound draws sample the global pool with
    /// probability `global_spawn_frac` (evolution only), otherwise their
    /// species pool; unbound draws are fresh. Evolution adds a role-scaled
    /// mutation on top.
    fn sample_spawn_genome(&mut self, species: usize) -> Genome {
        let profile = self.profiles[species.min(SPECIES_COUNT - 1)];
        let use_dna = self.rng.chance(profile.dna_binding);
        let mut genome = if use_dna {
            if self.evo.enabled
                && !self.dna_global.is_empty()
                && self.rng.chance(self.evo.global_spawn_frac)
            {
                self.dna_global
                    .sample(&mut self.rng, &self.evo, self.params.dna_survival_bias)
            } else {
                self.dna_species[species].sample(
                    &mut self.rng,
                    &self.evo,
                    self.params.dna_survival_bias,
                )
            }
        } else {
            Genome::random(&mut self.rng)
        };
        if self.evo.enabled {
            let sigma = self.evo.mutation_sigma * profile.mutation_sigma_mul;
            let delta = self.evo.exploration_delta * profile.exploration_delta_mul;
            genome.mutate(&mut self.rng, sigma, delta);
        }
        genome
    }

    /// Execute one tick. Returns false (and does nothing) while paused.
    pub fn step(&mut self) -> bool {
        if self.paused {
            return false;
        }

        self.apply_stress_schedule();
        self.stage_agents();
        self.stage_diffusion();
        self.stage_stress_noise();
        self.mycel
            .update(&self.params, &self.phero_food, self.env.resources());
        self.env.regenerate(&self.params);
        for pool in &mut self.dna_species {
            pool.decay(&self.evo);
        }
        self.dna_global.decay(&self.evo);
        self.stage_respawn();
        self.stage_metrics();
        self.step_index += 1;
        true
    }

    /// Run up to `ticks` ticks inline; returns the number executed.
    pub fn run(&mut self, ticks: u32) -> u32 {
        let mut executed = 0;
        for _ in 0..ticks {
            if self.step() {
                executed += 1;
            } else {
                break;
            }
        }
        executed
    }

    fn apply_stress_schedule(&mut self) {
        if !self.stress.enabled || self.stress_applied || self.step_index < self.stress.at_step {
            return;
        }
        if let Some((x, y, w, h)) = self.stress.block_rect {
            self.env.apply_block_rect(x, y, w, h);
        }
        if let Some((dx, dy)) = self.stress.shift_hotspots {
            self.env.shift_hotspots(dx, dy);
        }
        self.stress_applied = true;
        info!(step = self.step_index, "stress event applied");
    }

    fn stage_agents(&mut self) {
        let fitness_window = if self.evo.enabled {
            self.evo.fitness_window
        } else {
            0
        };
        let Self {
            params,
            evo,
            profiles,
            rng,
            env,
            phero_food,
            phero_danger,
            molecules,
            mycel,
            dna_species,
            dna_global,
            agents,
            ..
        } = self;

        for agent in agents.iter_mut() {
            let species = agent.species.min(SPECIES_COUNT - 1);
            let profile = &profiles[species];
            agent.step(
                rng,
                params,
                fitness_window,
                profile,
                phero_food,
                phero_danger,
                molecules,
                env.resources_mut(),
                mycel.density(),
            );

            if evo.enabled {
                if agent.energy > evo.min_energy_to_store {
                    dna_species[species].add(agent.genome, agent.fitness.value, params.dna_capacity);
                    if params.dna_global_capacity > 0 {
                        let accept = dna_global.len() < params.dna_global_capacity
                            || agent.fitness.value
                                > dna_global.worst_fitness().unwrap_or(0.0) + GLOBAL_ACCEPT_EPS;
                        if accept {
                            dna_global.add(
                                agent.genome,
                                agent.fitness.value,
                                params.dna_global_capacity,
                            );
                        }
                    }
                    agent.energy *= 0.6;
                }
            } else if agent.energy > PLAIN_STORE_THRESHOLD {
                dna_species[species].add(agent.genome, agent.energy, params.dna_capacity);
                agent.energy *= 0.6;
            }
        }
    }

    fn stage_diffusion(&mut self) {
        let pheromone = FieldParams::new(
            self.params.pheromone_diffusion,
            self.params.pheromone_evaporation,
        );
        let molecule = FieldParams::new(
            self.params.molecule_diffusion,
            self.params.molecule_evaporation,
        );

        if let Some(mut backend) = self.backend.take() {
            // With copyback on, the host copy is fresh from last tick and
            // carries this tick's agent deposits, so it is re-uploaded. In
            // no-copyback mode the device buffers are authoritative.
            let uploaded = if self.no_copyback {
                Ok(())
            } else {
                backend.upload_fields(&self.phero_food, &self.phero_danger, &self.molecules)
            };
            match uploaded {
                Ok(()) => {
                    let copyback = !self.no_copyback;
                    match backend.step_diffuse(
                        pheromone,
                        molecule,
                        copyback,
                        &mut self.phero_food,
                        &mut self.phero_danger,
                        &mut self.molecules,
                    ) {
                        Ok(()) => {
                            self.backend = Some(backend);
                            return;
                        }
                        // Fall through to the CPU pass below: host fields
                        // still hold this tick's pre-diffusion state.
                        Err(err) => self.downgrade_gpu("diffusion dispatch", &err),
                    }
                }
                Err(err) => self.downgrade_gpu("field upload", &err),
            }
        }

        diffuse_and_evaporate(&mut self.phero_food, pheromone);
        diffuse_and_evaporate(&mut self.phero_danger, pheromone);
        diffuse_and_evaporate(&mut self.molecules, molecule);
    }

    fn downgrade_gpu(&mut self, phase: &str, err: &BackendError) {
        warn!(%err, phase, "GPU backend failed; context downgraded to CPU");
        self.backend = None;
        self.no_copyback = false;
        self.gpu_failed = true;
    }

    fn stage_stress_noise(&mut self) {
        if !self.stress.enabled || !self.stress_applied || self.stress.pheromone_noise <= 0.0 {
            return;
        }
        let noise = self.stress.pheromone_noise;
        for cell in self.phero_food.cells_mut() {
            *cell = (*cell + self.stress_rng.uniform(0.0, noise)).max(0.0);
        }
        for cell in self.phero_danger.cells_mut() {
            *cell = (*cell + self.stress_rng.uniform(0.0, noise)).max(0.0);
        }
    }

    fn stage_respawn(&mut self) {
        for idx in 0..self.agents.len() {
            if self.agents[idx].energy <= RESPAWN_THRESHOLD {
                let fresh = self.fresh_agent(0.2, 0.5);
                self.agents[idx] = fresh;
            }
        }
    }

    fn stage_metrics(&mut self) {
        let metrics = self.system_metrics();
        self.metrics.push(metrics);
    }

    // --- queries ---------------------------------------------------------

    #[must_use]
    pub const fn step_index(&self) -> u64 {
        self.step_index
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn params(&self) -> &SimParams {
        &self.params
    }

    #[must_use]
    pub fn evo(&self) -> &EvoParams {
        &self.evo
    }

    #[must_use]
    pub fn stress(&self) -> &StressParams {
        &self.stress
    }

    /// Replace parameters. Grid-affecting values re-initialise fields and
    /// agents; an installed backend is dropped (buffer shapes may change).
    /// On validation failure nothing changes.
    pub fn set_params(&mut self, params: SimParams, evo: EvoParams) -> Result<(), SimError> {
        params.validate()?;
        evo.validate()?;
        self.params = params;
        self.evo = evo;
        self.backend = None;
        self.reinit_fields_and_agents();
        Ok(())
    }

    #[must_use]
    pub fn profiles(&self) -> &[SpeciesProfile; SPECIES_COUNT] {
        &self.profiles
    }

    /// Profiles apply from the next tick; no re-initialisation.
    pub fn set_profiles(&mut self, profiles: [SpeciesProfile; SPECIES_COUNT]) {
        self.profiles = profiles;
    }

    #[must_use]
    pub fn species_fracs(&self) -> &[f32; SPECIES_COUNT] {
        &self.species_fracs
    }

    /// Fractions apply to future spawns; no re-initialisation.
    pub fn set_species_fracs(&mut self, fracs: [f32; SPECIES_COUNT]) {
        self.species_fracs = fracs;
    }

    #[must_use]
    pub fn metrics(&self) -> &[StepMetrics] {
        &self.metrics
    }

    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Replace the whole agent sequence. Genomes are clamped; fitness
    /// trackers restart from the given energies.
    pub fn set_agents(&mut self, agents: Vec<Agent>) {
        self.agents = agents;
        for agent in &mut self.agents {
            agent.genome.clamp();
            agent.species = agent.species.min(SPECIES_COUNT - 1);
            let energy = agent.energy;
            agent.fitness.reset(energy);
        }
        self.params.agent_count = self.agents.len();
    }

    /// Append one agent slot.
    pub fn spawn_agent(&mut self, mut agent: Agent) {
        agent.genome.clamp();
        agent.species = agent.species.min(SPECIES_COUNT - 1);
        let energy = agent.energy;
        agent.fitness.reset(energy);
        self.agents.push(agent);
        self.params.agent_count = self.agents.len();
    }

    /// Zero an agent's energy. The slot respawns with a fresh genome on the
    /// next tick (0 is below the respawn threshold); there is no removal.
    pub fn kill_agent(&mut self, index: usize) {
        if let Some(agent) = self.agents.get_mut(index) {
            agent.energy = 0.0;
        }
    }

    // --- fields ----------------------------------------------------------

    /// Read access to a field. Forces a device copyback first when the
    /// device buffers are authoritative.
    pub fn field(&mut self, kind: FieldKind) -> &GridField {
        self.ensure_host_fields();
        self.field_ref(kind)
    }

    /// Read access without copyback; host state as-is.
    #[must_use]
    pub fn field_ref(&self, kind: FieldKind) -> &GridField {
        match kind {
            FieldKind::Resources => self.env.resources(),
            FieldKind::PheroFood => &self.phero_food,
            FieldKind::PheroDanger => &self.phero_danger,
            FieldKind::Molecules => &self.molecules,
            FieldKind::Mycel => self.mycel.density(),
        }
    }

    fn field_mut(&mut self, kind: FieldKind) -> &mut GridField {
        match kind {
            FieldKind::Resources => self.env.resources_mut(),
            FieldKind::PheroFood => &mut self.phero_food,
            FieldKind::PheroDanger => &mut self.phero_danger,
            FieldKind::Molecules => &mut self.molecules,
            FieldKind::Mycel => self.mycel.density_mut(),
        }
    }

    /// Overwrite a field from a flat buffer and mirror it to the device.
    pub fn set_field(&mut self, kind: FieldKind, values: &[f32]) -> Result<(), SimError> {
        self.field_mut(kind).copy_from(values)?;
        self.upload_after_host_write();
        Ok(())
    }

    /// Fill a field with one value and mirror it to the device.
    pub fn clear_field(&mut self, kind: FieldKind, value: f32) {
        self.field_mut(kind).fill(value);
        self.upload_after_host_write();
    }

    pub fn load_field_csv(&mut self, kind: FieldKind, path: &Path) -> Result<(), SimIoError> {
        let data = io::load_grid_csv(path)?;
        let field = self.field_ref(kind);
        if data.width != field.width() || data.height != field.height() {
            return Err(SimIoError::Shape);
        }
        self.field_mut(kind)
            .copy_from(&data.values)
            .expect("dimensions checked above");
        self.upload_after_host_write();
        Ok(())
    }

    pub fn save_field_csv(&mut self, kind: FieldKind, path: &Path) -> Result<(), SimIoError> {
        self.ensure_host_fields();
        let field = self.field_ref(kind);
        io::save_grid_csv(path, field.width(), field.height(), field.cells())?;
        Ok(())
    }

    fn upload_after_host_write(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            match backend.upload_fields(&self.phero_food, &self.phero_danger, &self.molecules) {
                Ok(()) => self.backend = Some(backend),
                Err(err) => self.downgrade_gpu("host write upload", &err),
            }
        }
    }

    fn ensure_host_fields(&mut self) {
        if !self.no_copyback {
            return;
        }
        if let Some(mut backend) = self.backend.take() {
            match backend.copyback(
                &mut self.phero_food,
                &mut self.phero_danger,
                &mut self.molecules,
            ) {
                Ok(()) => self.backend = Some(backend),
                Err(err) => self.downgrade_gpu("copyback", &err),
            }
        }
    }

    // --- DNA -------------------------------------------------------------

    #[must_use]
    pub fn dna_sizes(&self) -> ([usize; SPECIES_COUNT], usize) {
        let mut sizes = [0; SPECIES_COUNT];
        for (size, pool) in sizes.iter_mut().zip(self.dna_species.iter()) {
            *size = pool.len();
        }
        (sizes, self.dna_global.len())
    }

    #[must_use]
    pub fn dna_capacity(&self) -> (usize, usize) {
        (self.params.dna_capacity, self.params.dna_global_capacity)
    }

    /// Change capacities; shrinking evicts the worst entries immediately.
    pub fn set_dna_capacity(&mut self, species_cap: usize, global_cap: usize) {
        self.params.dna_capacity = species_cap;
        self.params.dna_global_capacity = global_cap;
        for pool in &mut self.dna_species {
            pool.truncate(species_cap);
        }
        self.dna_global.truncate(global_cap);
    }

    pub fn clear_dna_pools(&mut self) {
        for pool in &mut self.dna_species {
            pool.clear();
        }
        self.dna_global.clear();
    }

    #[must_use]
    pub fn dna_species(&self) -> &[DnaMemory; SPECIES_COUNT] {
        &self.dna_species
    }

    #[must_use]
    pub fn dna_global(&self) -> &DnaMemory {
        &self.dna_global
    }

    pub fn export_dna_csv(&self, path: &Path) -> Result<(), IoError> {
        io::export_dna_csv(path, &self.dna_species, &self.dna_global)
    }

    /// Merge a DNA CSV into the pools, honouring current capacities. The
    /// file is parsed completely before anything is applied.
    pub fn import_dna_csv(&mut self, path: &Path) -> Result<usize, IoError> {
        let rows = io::import_dna_csv(path)?;
        let count = rows.len();
        for row in rows {
            match row.pool {
                PoolRef::Global => {
                    self.dna_global
                        .add(row.genome, row.fitness, self.params.dna_global_capacity);
                }
                PoolRef::Species(species) => {
                    self.dna_species[species].add(row.genome, row.fitness, self.params.dna_capacity);
                }
            }
        }
        Ok(count)
    }

    // --- metrics ---------------------------------------------------------

    /// Metrics snapshot for the current state (also appended per tick).
    #[must_use]
    pub fn system_metrics(&self) -> StepMetrics {
        let mut sums = [0.0f32; SPECIES_COUNT];
        let mut counts = [0usize; SPECIES_COUNT];
        let mut total = 0.0f32;
        for agent in &self.agents {
            total += agent.energy;
            let species = agent.species.min(SPECIES_COUNT - 1);
            sums[species] += agent.energy;
            counts[species] += 1;
        }
        let avg_energy = if self.agents.is_empty() {
            0.0
        } else {
            total / self.agents.len() as f32
        };
        let mut avg_by_species = [0.0f32; SPECIES_COUNT];
        for i in 0..SPECIES_COUNT {
            if counts[i] > 0 {
                avg_by_species[i] = sums[i] / counts[i] as f32;
            }
        }
        let (dna_species_sizes, dna_global_size) = self.dna_sizes();
        StepMetrics {
            step: self.step_index,
            avg_energy,
            avg_energy_by_species: avg_by_species,
            dna_species_sizes,
            dna_global_size,
        }
    }

    #[must_use]
    pub fn energy_stats(&self) -> EnergyStats {
        if self.agents.is_empty() {
            return EnergyStats::default();
        }
        let mut stats = EnergyStats {
            avg: 0.0,
            min: self.agents[0].energy,
            max: self.agents[0].energy,
        };
        let mut sum = 0.0f32;
        for agent in &self.agents {
            sum += agent.energy;
            stats.min = stats.min.min(agent.energy);
            stats.max = stats.max.max(agent.energy);
        }
        stats.avg = sum / self.agents.len() as f32;
        stats
    }

    #[must_use]
    pub fn energy_by_species(&self) -> [f32; SPECIES_COUNT] {
        self.system_metrics().avg_energy_by_species
    }

    /// Entropy statistics for all five fields in ABI order.
    pub fn entropy_metrics(&mut self) -> [FieldStats; 5] {
        self.ensure_host_fields();
        let mut out = [FieldStats::default(); 5];
        for (slot, kind) in out.iter_mut().zip(FieldKind::ALL.iter()) {
            *slot = field_stats(self.field_ref(*kind).cells(), ENTROPY_BINS);
        }
        out
    }

    #[must_use]
    pub fn mycel_stats(&self) -> MycelStats {
        let cells = self.mycel.density().cells();
        if cells.is_empty() {
            return MycelStats::default();
        }
        let mut stats = MycelStats {
            min: cells[0],
            max: cells[0],
            mean: 0.0,
        };
        let mut sum = 0.0f64;
        for &v in cells {
            stats.min = stats.min.min(v);
            stats.max = stats.max.max(v);
            sum += f64::from(v);
        }
        stats.mean = (sum / cells.len() as f64) as f32;
        stats
    }

    // --- GPU -------------------------------------------------------------

    /// Install a diffusion backend. Refused after any prior GPU failure in
    /// this context; a failed installation counts as such a failure.
    pub fn install_backend(&mut self, mut backend: Box<dyn DiffusionBackend>) -> bool {
        if self.gpu_failed {
            warn!("GPU previously failed in this context; create a fresh context to retry");
            return false;
        }
        match backend.init_fields(&self.phero_food, &self.phero_danger, &self.molecules) {
            Ok(()) => {
                info!(backend = backend.kind(), "diffusion backend installed");
                self.backend = Some(backend);
                true
            }
            Err(err) => {
                warn!(%err, "diffusion backend rejected; staying on CPU");
                self.gpu_failed = true;
                false
            }
        }
    }

    /// Drop the backend without marking the context failed (host toggle).
    pub fn disable_backend(&mut self) {
        self.backend = None;
        self.no_copyback = false;
    }

    #[must_use]
    pub fn is_gpu_active(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.is_available())
    }

    /// Leave diffusion results on the device between host reads. Silently
    /// refused while agents exist, because the agent loop reads and writes
    /// host memory every tick.
    pub fn set_no_copyback(&mut self, enable: bool) {
        if enable && !self.agents.is_empty() {
            debug!("no-copyback refused: agents read host fields every tick");
            self.no_copyback = false;
        } else {
            self.no_copyback = enable;
        }
    }

    /// Deep copy of the simulation state. The clone starts on the CPU path
    /// with copyback semantics; its next ticks are bit-identical to the
    /// original's as long as neither context is externally mutated.
    pub fn clone_detached(&mut self) -> Simulation {
        self.ensure_host_fields();
        Simulation {
            params: self.params.clone(),
            evo: self.evo.clone(),
            stress: self.stress,
            seed: self.seed,
            species_fracs: self.species_fracs,
            profiles: self.profiles,
            step_index: self.step_index,
            paused: self.paused,
            stress_applied: self.stress_applied,
            rng: self.rng.clone(),
            stress_rng: self.stress_rng.clone(),
            env: self.env.clone(),
            phero_food: self.phero_food.clone(),
            phero_danger: self.phero_danger.clone(),
            molecules: self.molecules.clone(),
            mycel: self.mycel.clone(),
            dna_species: self.dna_species.clone(),
            dna_global: self.dna_global.clone(),
            agents: self.agents.clone(),
            metrics: self.metrics.clone(),
            backend: None,
            no_copyback: false,
            gpu_failed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(seed: u64) -> SimConfig {
        SimConfig {
            params: SimParams {
                width: 24,
                height: 24,
                agent_count: 16,
                ..SimParams::default()
            },
            seed,
            ..SimConfig::default()
        }
    }

    #[test]
    fn construction_seeds_resources_and_agents() {
        let sim = Simulation::new(small_config(1)).expect("sim");
        assert_eq!(sim.agents().len(), 16);
        assert_eq!(sim.step_index(), 0);
        for agent in sim.agents() {
            assert!(agent.x >= 0.0 && agent.x < 24.0);
            assert!(agent.y >= 0.0 && agent.y < 24.0);
            assert!((0.2..0.6).contains(&agent.energy));
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = small_config(1);
        config.params.width = 0;
        assert!(Simulation::new(config).is_err());
    }

    #[test]
    fn pause_gates_execution() {
        let mut sim = Simulation::new(small_config(2)).expect("sim");
        sim.pause();
        assert!(!sim.step());
        assert_eq!(sim.run(5), 0);
        assert_eq!(sim.step_index(), 0);
        sim.resume();
        assert_eq!(sim.run(5), 5);
        assert_eq!(sim.step_index(), 5);
        assert_eq!(sim.metrics().len(), 5);
    }

    #[test]
    fn post_tick_invariants_hold() {
        let mut config = small_config(3);
        config.evo.enabled = true;
        let mut sim = Simulation::new(config).expect("sim");
        sim.run(50);

        for kind in FieldKind::ALL {
            for v in sim.field_ref(kind).cells() {
                assert!(v.is_finite() && *v >= 0.0, "{kind:?} holds {v}");
            }
        }
        for v in sim.field_ref(FieldKind::Mycel).cells() {
            assert!(*v <= 1.0);
        }
        for agent in sim.agents() {
            assert!(agent.x >= 0.0 && agent.x < 24.0);
            assert!(agent.y >= 0.0 && agent.y < 24.0);
            assert!(agent.energy >= 0.0);
            assert!((0.0..TAU).contains(&agent.heading));
            assert!((0.2..=3.0).contains(&agent.genome.sense_gain));
        }
        let (species_sizes, global_size) = sim.dna_sizes();
        for size in species_sizes {
            assert!(size <= sim.params().dna_capacity);
        }
        assert!(global_size <= sim.params().dna_global_capacity);
        for pool in sim.dna_species() {
            let fits: Vec<f32> = pool.entries().iter().map(|e| e.fitness).collect();
            assert!(fits.windows(2).all(|w| w[0] >= w[1]), "pool not sorted");
        }
    }

    #[test]
    fn kill_agent_respawns_next_tick() {
        let mut sim = Simulation::new(small_config(4)).expect("sim");
        sim.kill_agent(0);
        assert_eq!(sim.agents()[0].energy, 0.0);
        sim.step();
        let respawned = sim.agents()[0];
        assert!((0.2..0.5).contains(&respawned.energy));
    }

    #[test]
    fn respawn_threshold_is_inclusive() {
        let mut config = small_config(5);
        config.params.agent_count = 1;
        config.params.agent_move_cost = 0.0;
        config.params.resource_regen = 0.0;
        let mut sim = Simulation::new(config).expect("sim");

        let mut agents = sim.agents().to_vec();
        agents[0].energy = 0.05;
        sim.set_agents(agents);
        sim.clear_field(FieldKind::Resources, 0.0);
        sim.step();
        // 0.05 with zero move cost stays 0.05 after the agent step, which
        // is <= the threshold, so the slot respawns.
        assert!((0.2..0.5).contains(&sim.agents()[0].energy));
    }

    #[test]
    fn set_params_failure_leaves_state_unchanged() {
        let mut sim = Simulation::new(small_config(6)).expect("sim");
        sim.run(3);
        let mut bad = sim.params().clone();
        bad.width = 0;
        let evo = sim.evo().clone();
        assert!(sim.set_params(bad, evo).is_err());
        assert_eq!(sim.params().width, 24);
        assert_eq!(sim.step_index(), 3);
    }

    #[test]
    fn set_params_reinitialises_fields_and_agents() {
        let mut sim = Simulation::new(small_config(7)).expect("sim");
        sim.run(2);
        let mut params = sim.params().clone();
        params.width = 32;
        params.height = 16;
        params.agent_count = 4;
        let evo = sim.evo().clone();
        sim.set_params(params, evo).expect("set_params");
        assert_eq!(sim.field_ref(FieldKind::PheroFood).width(), 32);
        assert_eq!(sim.field_ref(FieldKind::PheroFood).height(), 16);
        assert_eq!(sim.agents().len(), 4);
        // Step index is part of execution state, not grid state.
        assert_eq!(sim.step_index(), 2);
    }

    #[test]
    fn reset_restarts_from_tick_zero() {
        let mut sim = Simulation::new(small_config(8)).expect("sim");
        sim.run(10);
        sim.reset(99);
        assert_eq!(sim.step_index(), 0);
        assert_eq!(sim.metrics().len(), 0);
        let (sizes, global) = sim.dna_sizes();
        assert_eq!(sizes, [0; SPECIES_COUNT]);
        assert_eq!(global, 0);
    }

    #[test]
    fn clone_matches_original_tick_for_tick() {
        let mut config = small_config(9);
        config.evo.enabled = true;
        let mut sim = Simulation::new(config).expect("sim");
        sim.run(5);
        let mut twin = sim.clone_detached();

        for _ in 0..20 {
            sim.step();
            twin.step();
        }
        assert_eq!(sim.metrics().len(), twin.metrics().len());
        for (a, b) in sim.metrics().iter().zip(twin.metrics().iter()) {
            assert_eq!(a, b);
        }
        for (a, b) in sim
            .field_ref(FieldKind::PheroFood)
            .cells()
            .iter()
            .zip(twin.field_ref(FieldKind::PheroFood).cells())
        {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn same_seed_same_metrics() {
        let mut a = Simulation::new(small_config(0xDEAD)).expect("a");
        let mut b = Simulation::new(small_config(0xDEAD)).expect("b");
        a.run(40);
        b.run(40);
        assert_eq!(a.metrics(), b.metrics());

        let mut c = Simulation::new(small_config(0xBEEF)).expect("c");
        c.run(40);
        assert_ne!(a.metrics(), c.metrics());
    }

    #[test]
    fn no_copyback_refused_with_agents() {
        let mut sim = Simulation::new(small_config(10)).expect("sim");
        sim.set_no_copyback(true);
        assert!(!sim.no_copyback);

        let mut empty = small_config(10);
        empty.params.agent_count = 0;
        let mut sim = Simulation::new(empty).expect("sim");
        sim.set_no_copyback(true);
        assert!(sim.no_copyback);
    }

    #[test]
    fn dna_capacity_shrink_truncates() {
        let mut sim = Simulation::new(small_config(11)).expect("sim");
        let mut agents = sim.agents().to_vec();
        for agent in &mut agents {
            agent.energy = 2.0;
        }
        sim.set_agents(agents);
        sim.step();
        let (sizes, _) = sim.dna_sizes();
        assert!(sizes.iter().any(|s| *s > 0));
        sim.set_dna_capacity(1, 1);
        let (sizes, global) = sim.dna_sizes();
        assert!(sizes.iter().all(|s| *s <= 1));
        assert!(global <= 1);
    }

    #[test]
    fn field_roundtrip_through_context() {
        let mut sim = Simulation::new(small_config(12)).expect("sim");
        let len = sim.field_ref(FieldKind::Molecules).len();
        let values: Vec<f32> = (0..len).map(|i| (i % 7) as f32 * 0.25).collect();
        sim.set_field(FieldKind::Molecules, &values).expect("set");
        assert_eq!(sim.field(FieldKind::Molecules).cells(), values.as_slice());
        assert!(sim.set_field(FieldKind::Molecules, &values[1..]).is_err());

        sim.clear_field(FieldKind::Molecules, 0.5);
        assert!(
            sim.field(FieldKind::Molecules)
                .cells()
                .iter()
                .all(|v| *v == 0.5)
        );
    }
}
