//! Per-agent sense / move / harvest / deposit step.

use std::f32::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use crate::{Genome, GridField, SimParams, SimRng, SpeciesProfile};

const CANDIDATE_SPREAD: f32 = 0.6;

#[inline]
fn wrap_angle(mut a: f32) -> f32 {
    while a < 0.0 {
        a += TAU;
    }
    while a >= TAU {
        a -= TAU;
    }
    a
}

/// Windowed fitness accumulator. With a zero window the average is never
/// materialised and `value` stays at its last written state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FitnessTracker {
    pub last_energy: f32,
    pub accum: f32,
    pub ticks: u32,
    pub value: f32,
}

impl FitnessTracker {
    pub fn reset(&mut self, energy: f32) {
        self.last_energy = energy;
        self.accum = 0.0;
        self.ticks = 0;
        self.value = 0.0;
    }
}

/// One swarm agent. Lifecycle: created at context init, mutated only by its
/// own step and by respawn, destroyed with the context. Respawn reuses the
/// slot and resets every field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub x: f32,
    pub y: f32,
    /// Radians in `[0, 2π)`.
    pub heading: f32,
    pub energy: f32,
    pub species: usize,
    pub genome: Genome,
    pub fitness: FitnessTracker,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            energy: 0.5,
            species: 0,
            genome: Genome::default(),
            fitness: FitnessTracker::default(),
        }
    }
}

impl Agent {
    /// Advance this agent by one tick against the shared fields.
    ///
    /// Fields are mutated in place; later agents in the same tick observe
    /// these writes. `fitness_window` of 0 disables fitness averaging.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        rng: &mut SimRng,
        params: &SimParams,
        fitness_window: u32,
        profile: &SpeciesProfile,
        phero_food: &mut GridField,
        phero_danger: &mut GridField,
        molecules: &mut GridField,
        resources: &mut GridField,
        mycel: &GridField,
    ) {
        self.fitness.last_energy = self.energy;

        let heading = self.choose_heading(
            rng,
            params,
            profile,
            phero_food,
            phero_danger,
            molecules,
            resources,
            mycel,
        );
        self.heading = heading;

        let nx = self.x + self.heading.cos();
        let ny = self.y + self.heading.sin();
        let width = phero_food.width() as f32;
        let height = phero_food.height() as f32;

        let mut bounced = false;
        if nx >= 0.0 && ny >= 0.0 && nx < width && ny < height {
            self.x = nx;
            self.y = ny;
        } else {
            self.heading = wrap_angle(self.heading + PI);
            bounced = true;
        }

        self.harvest(params, profile, phero_food, molecules, resources);

        self.energy = (self.energy - params.agent_move_cost).max(0.0);
        let delta = self.energy - self.fitness.last_energy;
        self.update_fitness(delta, fitness_window);
        self.deposit_danger(params, profile, delta, bounced, phero_danger);
        self.counter_deposit(profile, phero_food, mycel);
    }

    #[allow(clippy::too_many_arguments)]
    fn choose_heading(
        &mut self,
        rng: &mut SimRng,
        params: &SimParams,
        profile: &SpeciesProfile,
        phero_food: &GridField,
        phero_danger: &GridField,
        molecules: &GridField,
        resources: &GridField,
        mycel: &GridField,
    ) -> f32 {
        let probe_radius = params.agent_sense_radius * self.genome.sense_gain;
        let candidates = [
            self.heading - CANDIDATE_SPREAD,
            self.heading,
            self.heading + CANDIDATE_SPREAD,
        ];

        let mut weights = [0.0f32; 3];
        for (weight, angle) in weights.iter_mut().zip(candidates.iter()) {
            let px = self.x + angle.cos() * probe_radius;
            let py = self.y + angle.sin() * probe_radius;

            let p_food =
                phero_food.sample(px, py) * self.genome.pheromone_gain * profile.food_attraction_mul;
            let p_danger =
                phero_danger.sample(px, py) * self.genome.pheromone_gain * profile.danger_aversion_mul;
            let r_val = resources.sample(px, py) * profile.resource_weight_mul;
            let m_val = molecules.sample(px, py) * profile.molecule_weight_mul;
            let my_val = mycel.sample(px, py) * profile.mycel_attraction_mul;

            let novelty = 1.0 - (p_food + p_danger + my_val).clamp(0.0, 1.0);
            *weight = (p_food + r_val + 0.25 * m_val + my_val + profile.novelty_weight * novelty
                - p_danger)
                .max(0.001);
        }

        let total = weights[0] + weights[1] + weights[2];
        let mut pick = rng.uniform(0.0, total);
        let mut choice = candidates.len() - 1;
        for (idx, weight) in weights.iter().enumerate() {
            if pick <= *weight {
                choice = idx;
                break;
            }
            pick -= weight;
        }

        let turn = params.agent_random_turn * profile.exploration_mul;
        wrap_angle(candidates[choice] + rng.uniform(-turn, turn) * self.genome.exploration_bias)
    }

    fn harvest(
        &mut self,
        params: &SimParams,
        profile: &SpeciesProfile,
        phero_food: &mut GridField,
        molecules: &mut GridField,
        resources: &mut GridField,
    ) {
        let cx = self.x as u32;
        let cy = self.y as u32;
        let Some(cell) = resources.get_mut(cx, cy) else {
            return;
        };
        let harvested = cell.min(params.agent_harvest);
        *cell -= harvested;
        self.energy += harvested;

        if let Some(food) = phero_food.get_mut(cx, cy) {
            *food += params.phero_food_deposit_scale * harvested * profile.deposit_food_mul;
        }
        if let Some(mols) = molecules.get_mut(cx, cy) {
            *mols += harvested * 0.5;
        }
    }

    fn update_fitness(&mut self, delta: f32, fitness_window: u32) {
        if delta > 0.0 {
            self.fitness.accum += delta;
        }
        self.fitness.ticks += 1;
        if fitness_window > 0 && self.fitness.ticks >= fitness_window {
            self.fitness.value = self.fitness.accum / self.fitness.ticks as f32;
            self.fitness.accum = 0.0;
            self.fitness.ticks = 0;
        }
    }

    fn deposit_danger(
        &self,
        params: &SimParams,
        profile: &SpeciesProfile,
        delta: f32,
        bounced: bool,
        phero_danger: &mut GridField,
    ) {
        let mut deposit = 0.0f32;
        if bounced {
            deposit += params.danger_bounce_deposit;
        }
        if delta < -params.danger_delta_threshold {
            deposit += (-delta) * params.phero_danger_deposit_scale;
        }
        if deposit > 0.0 {
            if let Some(cell) = phero_danger.get_mut(self.x as u32, self.y as u32) {
                *cell += deposit * profile.deposit_danger_mul;
            }
        }
    }

    /// Regulator role: bleed food pheromone out of overcrowded cells.
    fn counter_deposit(&self, profile: &SpeciesProfile, phero_food: &mut GridField, mycel: &GridField) {
        if profile.counter_deposit_mul <= 0.0 {
            return;
        }
        let cx = self.x as u32;
        let cy = self.y as u32;
        let local_mycel = mycel.get(cx, cy).unwrap_or(0.0);
        let Some(food) = phero_food.get_mut(cx, cy) else {
            return;
        };
        let density = *food + local_mycel;
        if density > profile.over_density_threshold {
            let reduction = (density - profile.over_density_threshold) * profile.counter_deposit_mul;
            *food = (*food - reduction).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct World {
        phero_food: GridField,
        phero_danger: GridField,
        molecules: GridField,
        resources: GridField,
        mycel: GridField,
    }

    impl World {
        fn new(size: u32) -> Self {
            Self {
                phero_food: GridField::new(size, size, 0.0).unwrap(),
                phero_danger: GridField::new(size, size, 0.0).unwrap(),
                molecules: GridField::new(size, size, 0.0).unwrap(),
                resources: GridField::new(size, size, 0.0).unwrap(),
                mycel: GridField::new(size, size, 0.0).unwrap(),
            }
        }
    }

    fn step(agent: &mut Agent, rng: &mut SimRng, params: &SimParams, world: &mut World) {
        agent.step(
            rng,
            params,
            0,
            &SpeciesProfile::default(),
            &mut world.phero_food,
            &mut world.phero_danger,
            &mut world.molecules,
            &mut world.resources,
            &world.mycel,
        );
    }

    #[test]
    fn harvest_moves_resource_into_energy_and_deposits() {
        let params = SimParams {
            agent_harvest: 0.04,
            agent_move_cost: 0.0,
            ..SimParams::default()
        };
        let mut world = World::new(16);
        // Uniform resources: wherever the move lands, the harvest is the
        // full per-tick cap.
        world.resources.fill(1.0);

        let mut agent = Agent {
            x: 8.0,
            y: 8.0,
            energy: 0.5,
            ..Agent::default()
        };
        let mut rng = SimRng::new(2);
        step(&mut agent, &mut rng, &params, &mut world);

        let harvested = agent.energy - 0.5;
        assert!((harvested - 0.04).abs() < 1e-6);
        let cell = world
            .resources
            .get(agent.x as u32, agent.y as u32)
            .unwrap();
        assert!((cell - 0.96).abs() < 1e-6);
        // Deposits land on the harvested cell: food scaled by the deposit
        // factor, molecules at half the harvest.
        let food_total: f32 = world.phero_food.cells().iter().sum();
        assert!((food_total - 0.8 * 0.04).abs() < 1e-6);
        let mol_total: f32 = world.molecules.cells().iter().sum();
        assert!((mol_total - 0.02).abs() < 1e-6);
    }

    #[test]
    fn bounce_reverses_heading_and_marks_danger() {
        let params = SimParams {
            agent_move_cost: 0.0,
            danger_bounce_deposit: 0.02,
            ..SimParams::default()
        };
        let mut world = World::new(8);
        // Pin the agent to the left wall pointing out of the grid; all three
        // candidate headings leave the grid.
        let mut agent = Agent {
            x: 0.1,
            y: 4.0,
            heading: PI,
            ..Agent::default()
        };
        let mut rng = SimRng::new(4);
        let before = (agent.x, agent.y);
        step(&mut agent, &mut rng, &params, &mut world);
        // Every candidate heading leaves the grid, so the move must bounce:
        // position unchanged, heading flipped, danger marked at the cell.
        assert_eq!((agent.x, agent.y), before);
        let danger: f32 = world.phero_danger.cells().iter().sum();
        assert!((danger - 0.02).abs() < 1e-6);
        assert!((0.0..TAU).contains(&agent.heading));
    }

    #[test]
    fn energy_never_goes_negative() {
        let params = SimParams {
            agent_move_cost: 1.0,
            ..SimParams::default()
        };
        let mut world = World::new(8);
        let mut agent = Agent {
            x: 4.0,
            y: 4.0,
            energy: 0.3,
            ..Agent::default()
        };
        let mut rng = SimRng::new(6);
        step(&mut agent, &mut rng, &params, &mut world);
        assert_eq!(agent.energy, 0.0);
    }

    #[test]
    fn fitness_window_averages_positive_deltas() {
        let mut agent = Agent::default();
        agent.update_fitness(0.2, 2);
        assert_eq!(agent.fitness.ticks, 1);
        agent.update_fitness(-0.1, 2);
        // Window closed: only the positive delta counts, averaged over 2.
        assert!((agent.fitness.value - 0.1).abs() < 1e-6);
        assert_eq!(agent.fitness.ticks, 0);
        assert_eq!(agent.fitness.accum, 0.0);
    }

    #[test]
    fn heading_stays_normalized() {
        let params = SimParams::default();
        let mut world = World::new(32);
        let mut agent = Agent {
            x: 16.0,
            y: 16.0,
            heading: 6.1,
            ..Agent::default()
        };
        let mut rng = SimRng::new(8);
        for _ in 0..200 {
            step(&mut agent, &mut rng, &params, &mut world);
            assert!((0.0..TAU).contains(&agent.heading), "heading {}", agent.heading);
            assert!(agent.x >= 0.0 && agent.x < 32.0);
            assert!(agent.y >= 0.0 && agent.y < 32.0);
        }
    }

    #[test]
    fn regulator_reduces_overdense_food() {
        let params = SimParams {
            agent_move_cost: 0.0,
            ..SimParams::default()
        };
        let profile = SpeciesProfile {
            over_density_threshold: 0.6,
            counter_deposit_mul: 0.5,
            ..SpeciesProfile::default()
        };
        let mut world = World::new(8);
        world.phero_food.fill(1.0);
        let mut agent = Agent {
            x: 4.0,
            y: 4.0,
            ..Agent::default()
        };
        let mut rng = SimRng::new(10);
        agent.step(
            &mut rng,
            &params,
            0,
            &profile,
            &mut world.phero_food,
            &mut world.phero_danger,
            &mut world.molecules,
            &mut world.resources,
            &world.mycel,
        );
        let cell = world
            .phero_food
            .get(agent.x as u32, agent.y as u32)
            .unwrap();
        assert!(cell < 1.0, "regulator should have bled food pheromone");
    }
}
