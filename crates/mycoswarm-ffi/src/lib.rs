//! C ABI over the swarm engine.
//!
//! The handle is an opaque process-local token; every function tolerates a
//! null handle (no-op or zero return) and no error ever crosses the
//! boundary: failures become sentinel returns. All operations run
//! synchronously on the caller's thread.
#![allow(clippy::missing_safety_doc)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_float, c_int};
use std::path::Path;

use tracing::warn;

use mycoswarm_core::{
    API_VERSION, Agent, EvoParams, FieldKind, SPECIES_COUNT, SimConfig, SimParams, Simulation,
    SpeciesProfile,
};
use mycoswarm_gpu::{WgpuDiffusion, list_adapters};

/// Opaque handle type exposed to hosts.
pub enum MsHandle {}

/// Handle payload: the context plus host-side GPU selections.
struct MsContext {
    sim: Simulation,
    gpu_platform: c_int,
    gpu_device: c_int,
}

/// Mirror of the wire parameter block.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsParams {
    pub width: c_int,
    pub height: c_int,
    pub agent_count: c_int,
    pub steps: c_int,

    pub pheromone_evaporation: c_float,
    pub pheromone_diffusion: c_float,
    pub molecule_evaporation: c_float,
    pub molecule_diffusion: c_float,

    pub resource_regen: c_float,
    pub resource_max: c_float,

    pub mycel_decay: c_float,
    pub mycel_growth: c_float,
    pub mycel_transport: c_float,
    pub mycel_drive_threshold: c_float,
    pub mycel_drive_p: c_float,
    pub mycel_drive_r: c_float,

    pub agent_move_cost: c_float,
    pub agent_harvest: c_float,
    pub agent_deposit_scale: c_float,
    pub agent_sense_radius: c_float,
    pub agent_random_turn: c_float,

    pub dna_capacity: c_int,
    pub dna_global_capacity: c_int,
    pub dna_survival_bias: c_float,

    pub phero_food_deposit_scale: c_float,
    pub phero_danger_deposit_scale: c_float,
    pub danger_delta_threshold: c_float,
    pub danger_bounce_deposit: c_float,

    pub evo_enable: c_int,
    pub evo_elite_frac: c_float,
    pub evo_min_energy_to_store: c_float,
    pub evo_mutation_sigma: c_float,
    pub evo_exploration_delta: c_float,
    pub evo_fitness_window: c_int,
    pub evo_age_decay: c_float,

    pub global_spawn_frac: c_float,
}

/// Creation payload: parameters plus the RNG seed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsConfig {
    pub params: MsParams,
    pub seed: u32,
}

/// Wire layout of one species profile.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsSpeciesProfile {
    pub exploration_mul: c_float,
    pub food_attraction_mul: c_float,
    pub danger_aversion_mul: c_float,
    pub deposit_food_mul: c_float,
    pub deposit_danger_mul: c_float,
    pub resource_weight_mul: c_float,
    pub molecule_weight_mul: c_float,
    pub mycel_attraction_mul: c_float,
    pub novelty_weight: c_float,
    pub mutation_sigma_mul: c_float,
    pub exploration_delta_mul: c_float,
    pub dna_binding: c_float,
    pub over_density_threshold: c_float,
    pub counter_deposit_mul: c_float,
}

/// Wire layout of one agent.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsAgent {
    pub x: c_float,
    pub y: c_float,
    pub heading: c_float,
    pub energy: c_float,
    pub species: c_int,
    pub sense_gain: c_float,
    pub pheromone_gain: c_float,
    pub exploration_bias: c_float,
}

/// Aggregate system metrics.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsMetrics {
    pub step_index: c_int,
    pub dna_global_size: c_int,
    pub dna_species_sizes: [c_int; 4],
    pub avg_energy: c_float,
    pub avg_energy_by_species: [c_float; 4],
}

/// Per-field entropy statistics, field order: resources, phero_food,
/// phero_danger, molecules, mycel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsEntropy {
    pub entropy: [c_float; 5],
    pub norm_entropy: [c_float; 5],
    pub p95: [c_float; 5],
}

/// Mycelium density summary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsMycelStats {
    pub min_val: c_float,
    pub max_val: c_float,
    pub mean: c_float,
}

fn ctx_mut<'a>(handle: *mut MsHandle) -> Option<&'a mut MsContext> {
    unsafe { handle.cast::<MsContext>().as_mut() }
}

fn params_to_abi(params: &SimParams, evo: &EvoParams) -> MsParams {
    MsParams {
        width: params.width as c_int,
        height: params.height as c_int,
        agent_count: params.agent_count as c_int,
        steps: params.steps as c_int,
        pheromone_evaporation: params.pheromone_evaporation,
        pheromone_diffusion: params.pheromone_diffusion,
        molecule_evaporation: params.molecule_evaporation,
        molecule_diffusion: params.molecule_diffusion,
        resource_regen: params.resource_regen,
        resource_max: params.resource_max,
        mycel_decay: params.mycel_decay,
        mycel_growth: params.mycel_growth,
        mycel_transport: params.mycel_transport,
        mycel_drive_threshold: params.mycel_drive_threshold,
        mycel_drive_p: params.mycel_drive_p,
        mycel_drive_r: params.mycel_drive_r,
        agent_move_cost: params.agent_move_cost,
        agent_harvest: params.agent_harvest,
        agent_deposit_scale: params.agent_deposit_scale,
        agent_sense_radius: params.agent_sense_radius,
        agent_random_turn: params.agent_random_turn,
        dna_capacity: params.dna_capacity as c_int,
        dna_global_capacity: params.dna_global_capacity as c_int,
        dna_survival_bias: params.dna_survival_bias,
        phero_food_deposit_scale: params.phero_food_deposit_scale,
        phero_danger_deposit_scale: params.phero_danger_deposit_scale,
        danger_delta_threshold: params.danger_delta_threshold,
        danger_bounce_deposit: params.danger_bounce_deposit,
        evo_enable: c_int::from(evo.enabled),
        evo_elite_frac: evo.elite_frac,
        evo_min_energy_to_store: evo.min_energy_to_store,
        evo_mutation_sigma: evo.mutation_sigma,
        evo_exploration_delta: evo.exploration_delta,
        evo_fitness_window: evo.fitness_window as c_int,
        evo_age_decay: evo.age_decay,
        global_spawn_frac: evo.global_spawn_frac,
    }
}

/// Lossy-free conversion from the wire block; rejects values that cannot
/// represent a valid configuration (negative counts or dimensions).
fn params_from_abi(p: &MsParams) -> Option<(SimParams, EvoParams)> {
    if p.width <= 0
        || p.height <= 0
        || p.agent_count < 0
        || p.steps < 0
        || p.dna_capacity < 0
        || p.dna_global_capacity < 0
        || p.evo_fitness_window < 0
    {
        return None;
    }
    let params = SimParams {
        width: p.width as u32,
        height: p.height as u32,
        agent_count: p.agent_count as usize,
        steps: p.steps as u32,
        pheromone_evaporation: p.pheromone_evaporation,
        pheromone_diffusion: p.pheromone_diffusion,
        molecule_evaporation: p.molecule_evaporation,
        molecule_diffusion: p.molecule_diffusion,
        resource_regen: p.resource_regen,
        resource_max: p.resource_max,
        mycel_decay: p.mycel_decay,
        mycel_growth: p.mycel_growth,
        mycel_transport: p.mycel_transport,
        mycel_drive_threshold: p.mycel_drive_threshold,
        mycel_drive_p: p.mycel_drive_p,
        mycel_drive_r: p.mycel_drive_r,
        agent_move_cost: p.agent_move_cost,
        agent_harvest: p.agent_harvest,
        agent_deposit_scale: p.agent_deposit_scale,
        agent_sense_radius: p.agent_sense_radius,
        agent_random_turn: p.agent_random_turn,
        dna_capacity: p.dna_capacity as usize,
        dna_global_capacity: p.dna_global_capacity as usize,
        dna_survival_bias: p.dna_survival_bias,
        phero_food_deposit_scale: p.phero_food_deposit_scale,
        phero_danger_deposit_scale: p.phero_danger_deposit_scale,
        danger_delta_threshold: p.danger_delta_threshold,
        danger_bounce_deposit: p.danger_bounce_deposit,
    };
    let evo = EvoParams {
        enabled: p.evo_enable != 0,
        elite_frac: p.evo_elite_frac,
        min_energy_to_store: p.evo_min_energy_to_store,
        mutation_sigma: p.evo_mutation_sigma,
        exploration_delta: p.evo_exploration_delta,
        fitness_window: p.evo_fitness_window as u32,
        age_decay: p.evo_age_decay,
        global_spawn_frac: p.global_spawn_frac,
    };
    Some((params, evo))
}

fn profile_to_abi(profile: &SpeciesProfile) -> MsSpeciesProfile {
    MsSpeciesProfile {
        exploration_mul: profile.exploration_mul,
        food_attraction_mul: profile.food_attraction_mul,
        danger_aversion_mul: profile.danger_aversion_mul,
        deposit_food_mul: profile.deposit_food_mul,
        deposit_danger_mul: profile.deposit_danger_mul,
        resource_weight_mul: profile.resource_weight_mul,
        molecule_weight_mul: profile.molecule_weight_mul,
        mycel_attraction_mul: profile.mycel_attraction_mul,
        novelty_weight: profile.novelty_weight,
        mutation_sigma_mul: profile.mutation_sigma_mul,
        exploration_delta_mul: profile.exploration_delta_mul,
        dna_binding: profile.dna_binding,
        over_density_threshold: profile.over_density_threshold,
        counter_deposit_mul: profile.counter_deposit_mul,
    }
}

fn profile_from_abi(profile: &MsSpeciesProfile) -> SpeciesProfile {
    SpeciesProfile {
        exploration_mul: profile.exploration_mul,
        food_attraction_mul: profile.food_attraction_mul,
        danger_aversion_mul: profile.danger_aversion_mul,
        deposit_food_mul: profile.deposit_food_mul,
        deposit_danger_mul: profile.deposit_danger_mul,
        resource_weight_mul: profile.resource_weight_mul,
        molecule_weight_mul: profile.molecule_weight_mul,
        mycel_attraction_mul: profile.mycel_attraction_mul,
        novelty_weight: profile.novelty_weight,
        mutation_sigma_mul: profile.mutation_sigma_mul,
        exploration_delta_mul: profile.exploration_delta_mul,
        dna_binding: profile.dna_binding,
        over_density_threshold: profile.over_density_threshold,
        counter_deposit_mul: profile.counter_deposit_mul,
    }
}

fn agent_to_abi(agent: &Agent) -> MsAgent {
    MsAgent {
        x: agent.x,
        y: agent.y,
        heading: agent.heading,
        energy: agent.energy,
        species: agent.species as c_int,
        sense_gain: agent.genome.sense_gain,
        pheromone_gain: agent.genome.pheromone_gain,
        exploration_bias: agent.genome.exploration_bias,
    }
}

fn agent_from_abi(agent: &MsAgent) -> Agent {
    let mut out = Agent {
        x: agent.x,
        y: agent.y,
        heading: agent.heading,
        energy: agent.energy,
        species: agent.species.clamp(0, SPECIES_COUNT as c_int - 1) as usize,
        ..Agent::default()
    };
    out.genome.sense_gain = agent.sense_gain;
    out.genome.pheromone_gain = agent.pheromone_gain;
    out.genome.exploration_bias = agent.exploration_bias;
    out.genome.clamp();
    out.fitness.reset(agent.energy);
    out
}

unsafe fn path_from_ptr<'a>(path: *const c_char) -> Option<&'a Path> {
    if path.is_null() {
        return None;
    }
    let cstr = unsafe { CStr::from_ptr(path) };
    cstr.to_str().ok().map(Path::new)
}

// --- lifecycle -----------------------------------------------------------

/// Create a context. A null config uses the reference defaults with seed
/// 42; an invalid config yields a null handle.
#[no_mangle]
pub unsafe extern "C" fn ms_create(cfg: *const MsConfig) -> *mut MsHandle {
    let config = match unsafe { cfg.as_ref() } {
        None => SimConfig::default(),
        Some(cfg) => {
            let Some((params, evo)) = params_from_abi(&cfg.params) else {
                return std::ptr::null_mut();
            };
            SimConfig {
                params,
                evo,
                seed: u64::from(cfg.seed),
                ..SimConfig::default()
            }
        }
    };
    match Simulation::new(config) {
        Ok(sim) => Box::into_raw(Box::new(MsContext {
            sim,
            gpu_platform: 0,
            gpu_device: 0,
        }))
        .cast(),
        Err(err) => {
            warn!(%err, "ms_create rejected configuration");
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_destroy(handle: *mut MsHandle) {
    if handle.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(handle.cast::<MsContext>()) });
}

/// Deep copy. The clone starts on the CPU path; re-enable GPU explicitly.
#[no_mangle]
pub unsafe extern "C" fn ms_clone(src: *const MsHandle) -> *mut MsHandle {
    let Some(ctx) = ctx_mut(src.cast_mut()) else {
        return std::ptr::null_mut();
    };
    let clone = MsContext {
        sim: ctx.sim.clone_detached(),
        gpu_platform: ctx.gpu_platform,
        gpu_device: ctx.gpu_device,
    };
    Box::into_raw(Box::new(clone)).cast()
}

#[no_mangle]
pub unsafe extern "C" fn ms_reset(handle: *mut MsHandle, seed: u32) {
    if let Some(ctx) = ctx_mut(handle) {
        ctx.sim.reset(u64::from(seed));
    }
}

// --- execution -----------------------------------------------------------

/// Run up to `steps` ticks; returns the count actually executed (0 while
/// paused or for a null handle).
#[no_mangle]
pub unsafe extern "C" fn ms_step(handle: *mut MsHandle, steps: c_int) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    if steps <= 0 {
        return 0;
    }
    ctx.sim.run(steps as u32) as c_int
}

#[no_mangle]
pub unsafe extern "C" fn ms_run(handle: *mut MsHandle, steps: c_int) -> c_int {
    unsafe { ms_step(handle, steps) }
}

#[no_mangle]
pub unsafe extern "C" fn ms_pause(handle: *mut MsHandle) {
    if let Some(ctx) = ctx_mut(handle) {
        ctx.sim.pause();
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_resume(handle: *mut MsHandle) {
    if let Some(ctx) = ctx_mut(handle) {
        ctx.sim.resume();
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_step_index(handle: *mut MsHandle) -> c_int {
    ctx_mut(handle).map_or(0, |ctx| ctx.sim.step_index() as c_int)
}

// --- parameters ----------------------------------------------------------

/// Replace parameters; re-initialises fields and agents. Invalid values
/// are silently rejected and the context is unchanged.
#[no_mangle]
pub unsafe extern "C" fn ms_set_params(handle: *mut MsHandle, params: *const MsParams) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(params) = (unsafe { params.as_ref() }) else {
        return;
    };
    let Some((params, evo)) = params_from_abi(params) else {
        return;
    };
    if ctx.sim.set_params(params, evo).is_err() {
        warn!("ms_set_params rejected invalid parameters");
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_params(handle: *mut MsHandle, out: *mut MsParams) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return;
    };
    *out = params_to_abi(ctx.sim.params(), ctx.sim.evo());
}

/// Profiles apply from the next tick; no re-initialisation.
#[no_mangle]
pub unsafe extern "C" fn ms_set_species_profiles(
    handle: *mut MsHandle,
    profiles: *const MsSpeciesProfile,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if profiles.is_null() {
        return;
    }
    let incoming = unsafe { std::slice::from_raw_parts(profiles, SPECIES_COUNT) };
    let mut converted = *ctx.sim.profiles();
    for (slot, profile) in converted.iter_mut().zip(incoming.iter()) {
        *slot = profile_from_abi(profile);
    }
    ctx.sim.set_profiles(converted);
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_species_profiles(
    handle: *mut MsHandle,
    out: *mut MsSpeciesProfile,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if out.is_null() {
        return;
    }
    let outgoing = unsafe { std::slice::from_raw_parts_mut(out, SPECIES_COUNT) };
    for (slot, profile) in outgoing.iter_mut().zip(ctx.sim.profiles().iter()) {
        *slot = profile_to_abi(profile);
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_set_species_fracs(handle: *mut MsHandle, fracs: *const c_float) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if fracs.is_null() {
        return;
    }
    let incoming = unsafe { std::slice::from_raw_parts(fracs, SPECIES_COUNT) };
    let mut converted = [0.0f32; SPECIES_COUNT];
    converted.copy_from_slice(incoming);
    ctx.sim.set_species_fracs(converted);
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_species_fracs(handle: *mut MsHandle, out: *mut c_float) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if out.is_null() {
        return;
    }
    let outgoing = unsafe { std::slice::from_raw_parts_mut(out, SPECIES_COUNT) };
    outgoing.copy_from_slice(ctx.sim.species_fracs());
}

// --- fields --------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ms_get_field_info(
    handle: *mut MsHandle,
    kind: c_int,
    width: *mut c_int,
    height: *mut c_int,
) {
    let (Some(width), Some(height)) = (unsafe { width.as_mut() }, unsafe { height.as_mut() })
    else {
        return;
    };
    *width = 0;
    *height = 0;
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(kind) = FieldKind::from_index(kind) else {
        return;
    };
    let field = ctx.sim.field_ref(kind);
    *width = field.width() as c_int;
    *height = field.height() as c_int;
}

/// Copy a field out. Returns the cell count on success; 0 for a null
/// handle, an unknown field kind or an undersized destination.
#[no_mangle]
pub unsafe extern "C" fn ms_copy_field_out(
    handle: *mut MsHandle,
    kind: c_int,
    dst: *mut c_float,
    dst_count: c_int,
) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    if dst.is_null() {
        return 0;
    }
    let Some(kind) = FieldKind::from_index(kind) else {
        return 0;
    };
    let field = ctx.sim.field(kind);
    let count = field.len();
    if (dst_count as usize) < count || dst_count < 0 {
        return 0;
    }
    let out = unsafe { std::slice::from_raw_parts_mut(dst, count) };
    out.copy_from_slice(field.cells());
    count as c_int
}

/// Copy a field in; mirrors to the device when GPU is active. Returns the
/// cell count on success, 0 otherwise.
#[no_mangle]
pub unsafe extern "C" fn ms_copy_field_in(
    handle: *mut MsHandle,
    kind: c_int,
    src: *const c_float,
    src_count: c_int,
) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    if src.is_null() || src_count < 0 {
        return 0;
    }
    let Some(kind) = FieldKind::from_index(kind) else {
        return 0;
    };
    let count = ctx.sim.field_ref(kind).len();
    if (src_count as usize) < count {
        return 0;
    }
    let values = unsafe { std::slice::from_raw_parts(src, count) };
    match ctx.sim.set_field(kind, values) {
        Ok(()) => count as c_int,
        Err(_) => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_clear_field(handle: *mut MsHandle, kind: c_int, value: c_float) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(kind) = FieldKind::from_index(kind) else {
        return;
    };
    ctx.sim.clear_field(kind, value);
}

#[no_mangle]
pub unsafe extern "C" fn ms_load_field_csv(
    handle: *mut MsHandle,
    kind: c_int,
    path: *const c_char,
) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    let Some(kind) = FieldKind::from_index(kind) else {
        return 0;
    };
    let Some(path) = (unsafe { path_from_ptr(path) }) else {
        return 0;
    };
    match ctx.sim.load_field_csv(kind, path) {
        Ok(()) => 1,
        Err(err) => {
            warn!(%err, "field CSV load failed");
            0
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_save_field_csv(
    handle: *mut MsHandle,
    kind: c_int,
    path: *const c_char,
) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    let Some(kind) = FieldKind::from_index(kind) else {
        return 0;
    };
    let Some(path) = (unsafe { path_from_ptr(path) }) else {
        return 0;
    };
    match ctx.sim.save_field_csv(kind, path) {
        Ok(()) => 1,
        Err(err) => {
            warn!(%err, "field CSV save failed");
            0
        }
    }
}

// --- agents --------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ms_get_agent_count(handle: *mut MsHandle) -> c_int {
    ctx_mut(handle).map_or(0, |ctx| ctx.sim.agents().len() as c_int)
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_agents(
    handle: *mut MsHandle,
    out: *mut MsAgent,
    max_agents: c_int,
) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    if out.is_null() || max_agents <= 0 {
        return 0;
    }
    let count = ctx.sim.agents().len().min(max_agents as usize);
    let outgoing = unsafe { std::slice::from_raw_parts_mut(out, count) };
    for (slot, agent) in outgoing.iter_mut().zip(ctx.sim.agents().iter()) {
        *slot = agent_to_abi(agent);
    }
    count as c_int
}

#[no_mangle]
pub unsafe extern "C" fn ms_set_agents(
    handle: *mut MsHandle,
    agents: *const MsAgent,
    count: c_int,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if agents.is_null() || count <= 0 {
        return;
    }
    let incoming = unsafe { std::slice::from_raw_parts(agents, count as usize) };
    ctx.sim.set_agents(incoming.iter().map(agent_from_abi).collect());
}

/// Zeroes the agent's energy; the slot respawns with a fresh genome on the
/// next tick. Out-of-range ids are ignored.
#[no_mangle]
pub unsafe extern "C" fn ms_kill_agent(handle: *mut MsHandle, agent_id: c_int) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if agent_id < 0 {
        return;
    }
    ctx.sim.kill_agent(agent_id as usize);
}

#[no_mangle]
pub unsafe extern "C" fn ms_spawn_agent(handle: *mut MsHandle, agent: *const MsAgent) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(agent) = (unsafe { agent.as_ref() }) else {
        return;
    };
    ctx.sim.spawn_agent(agent_from_abi(agent));
}

// --- DNA -----------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ms_get_dna_sizes(
    handle: *mut MsHandle,
    out_species: *mut c_int,
    out_global: *mut c_int,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if out_species.is_null() || out_global.is_null() {
        return;
    }
    let (species, global) = ctx.sim.dna_sizes();
    let outgoing = unsafe { std::slice::from_raw_parts_mut(out_species, SPECIES_COUNT) };
    for (slot, size) in outgoing.iter_mut().zip(species.iter()) {
        *slot = *size as c_int;
    }
    unsafe { *out_global = global as c_int };
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_dna_capacity(
    handle: *mut MsHandle,
    species_cap: *mut c_int,
    global_cap: *mut c_int,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let (species, global) = ctx.sim.dna_capacity();
    if let Some(out) = unsafe { species_cap.as_mut() } {
        *out = species as c_int;
    }
    if let Some(out) = unsafe { global_cap.as_mut() } {
        *out = global as c_int;
    }
}

/// May shrink pools; the worst entries are evicted immediately.
#[no_mangle]
pub unsafe extern "C" fn ms_set_dna_capacity(
    handle: *mut MsHandle,
    species_cap: c_int,
    global_cap: c_int,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if species_cap < 0 || global_cap < 0 {
        return;
    }
    ctx.sim
        .set_dna_capacity(species_cap as usize, global_cap as usize);
}

#[no_mangle]
pub unsafe extern "C" fn ms_clear_dna_pools(handle: *mut MsHandle) {
    if let Some(ctx) = ctx_mut(handle) {
        ctx.sim.clear_dna_pools();
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_export_dna_csv(handle: *mut MsHandle, path: *const c_char) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    let Some(path) = (unsafe { path_from_ptr(path) }) else {
        return 0;
    };
    match ctx.sim.export_dna_csv(path) {
        Ok(()) => 1,
        Err(err) => {
            warn!(%err, "DNA export failed");
            0
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_import_dna_csv(handle: *mut MsHandle, path: *const c_char) -> c_int {
    let Some(ctx) = ctx_mut(handle) else { return 0 };
    let Some(path) = (unsafe { path_from_ptr(path) }) else {
        return 0;
    };
    match ctx.sim.import_dna_csv(path) {
        Ok(_) => 1,
        Err(err) => {
            warn!(%err, "DNA import failed");
            0
        }
    }
}

// --- metrics -------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ms_get_system_metrics(handle: *mut MsHandle, out: *mut MsMetrics) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return;
    };
    let metrics = ctx.sim.system_metrics();
    out.step_index = metrics.step as c_int;
    out.dna_global_size = metrics.dna_global_size as c_int;
    out.avg_energy = metrics.avg_energy;
    out.avg_energy_by_species = metrics.avg_energy_by_species;
    for (slot, size) in out
        .dna_species_sizes
        .iter_mut()
        .zip(metrics.dna_species_sizes.iter())
    {
        *slot = *size as c_int;
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_energy_stats(
    handle: *mut MsHandle,
    avg: *mut c_float,
    min: *mut c_float,
    max: *mut c_float,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if avg.is_null() || min.is_null() || max.is_null() {
        return;
    }
    let stats = ctx.sim.energy_stats();
    unsafe {
        *avg = stats.avg;
        *min = stats.min;
        *max = stats.max;
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_energy_by_species(handle: *mut MsHandle, out: *mut c_float) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if out.is_null() {
        return;
    }
    let by_species = ctx.sim.energy_by_species();
    let outgoing = unsafe { std::slice::from_raw_parts_mut(out, SPECIES_COUNT) };
    outgoing.copy_from_slice(&by_species);
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_entropy_metrics(handle: *mut MsHandle, out: *mut MsEntropy) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return;
    };
    let stats = ctx.sim.entropy_metrics();
    for (idx, field) in stats.iter().enumerate() {
        out.entropy[idx] = field.entropy;
        out.norm_entropy[idx] = field.norm_entropy;
        out.p95[idx] = field.p95;
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_get_mycel_stats(handle: *mut MsHandle, out: *mut MsMycelStats) {
    let Some(ctx) = ctx_mut(handle) else { return };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return;
    };
    let stats = ctx.sim.mycel_stats();
    out.min_val = stats.min;
    out.max_val = stats.max;
    out.mean = stats.mean;
}

// --- GPU -----------------------------------------------------------------

/// Enable or disable the GPU diffusion path. Enabling acquires the
/// selected adapter, runs the parity self-test and uploads the current
/// fields; any failure leaves the context on the CPU path permanently.
#[no_mangle]
pub unsafe extern "C" fn ms_ocl_enable(handle: *mut MsHandle, enable: c_int) {
    let Some(ctx) = ctx_mut(handle) else { return };
    if enable == 0 {
        ctx.sim.disable_backend();
        return;
    }
    if ctx.gpu_platform != 0 {
        // wgpu exposes one flat adapter list; the platform index only
        // selects which log line the host sees.
        warn!(platform = ctx.gpu_platform, "platform index ignored; adapters are flat");
    }
    let device = ctx.gpu_device.max(0) as usize;
    match WgpuDiffusion::new(device) {
        Ok(backend) => {
            ctx.sim.install_backend(Box::new(backend));
        }
        Err(err) => {
            warn!(%err, "GPU enable failed; staying on CPU");
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_ocl_select_device(
    handle: *mut MsHandle,
    platform: c_int,
    device: c_int,
) {
    let Some(ctx) = ctx_mut(handle) else { return };
    ctx.gpu_platform = platform;
    ctx.gpu_device = device;
}

/// Print the visible adapters to stdout.
#[no_mangle]
pub extern "C" fn ms_ocl_print_devices() {
    let adapters = list_adapters();
    if adapters.is_empty() {
        println!("(no GPU adapters)");
        return;
    }
    for adapter in adapters {
        println!("Device {}: {} [{}]", adapter.index, adapter.name, adapter.backend);
    }
}

/// Leave diffusion results on the device between host reads. Silently
/// refused while agents exist.
#[no_mangle]
pub unsafe extern "C" fn ms_ocl_set_no_copyback(handle: *mut MsHandle, enable: c_int) {
    if let Some(ctx) = ctx_mut(handle) {
        ctx.sim.set_no_copyback(enable != 0);
    }
}

#[no_mangle]
pub unsafe extern "C" fn ms_is_gpu_active(handle: *mut MsHandle) -> c_int {
    ctx_mut(handle).map_or(0, |ctx| c_int::from(ctx.sim.is_gpu_active()))
}

// --- version -------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn ms_get_api_version(
    major: *mut c_int,
    minor: *mut c_int,
    patch: *mut c_int,
) {
    if let Some(out) = unsafe { major.as_mut() } {
        *out = API_VERSION.0 as c_int;
    }
    if let Some(out) = unsafe { minor.as_mut() } {
        *out = API_VERSION.1 as c_int;
    }
    if let Some(out) = unsafe { patch.as_mut() } {
        *out = API_VERSION.2 as c_int;
    }
}
