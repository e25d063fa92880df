//! Species profiles: per-role behavioral multiplier bundles.

use serde::{Deserialize, Serialize};

use crate::SimRng;

/// Number of species roles in a context.
pub const SPECIES_COUNT: usize = 4;

/// Fourteen multiplicative/additive weights parameterising agent behavior.
/// Plain record, no polymorphism; the regulator role is expressed purely by
/// a non-zero `counter_deposit_mul`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeciesProfile {
    pub exploration_mul: f32,
    pub food_attraction_mul: f32,
    pub danger_aversion_mul: f32,
    pub deposit_food_mul: f32,
    pub deposit_danger_mul: f32,
    pub resource_weight_mul: f32,
    pub molecule_weight_mul: f32,
    pub mycel_attraction_mul: f32,
    pub novelty_weight: f32,
    pub mutation_sigma_mul: f32,
    pub exploration_delta_mul: f32,
    /// Probability of drawing the spawn genome from a DNA pool.
    pub dna_binding: f32,
    pub over_density_threshold: f32,
    pub counter_deposit_mul: f32,
}

impl Default for SpeciesProfile {
    fn default() -> Self {
        Self {
            exploration_mul: 1.0,
            food_attraction_mul: 1.0,
            danger_aversion_mul: 1.0,
            deposit_food_mul: 1.0,
            deposit_danger_mul: 1.0,
            resource_weight_mul: 1.0,
            molecule_weight_mul: 1.0,
            mycel_attraction_mul: 1.0,
            novelty_weight: 0.0,
            mutation_sigma_mul: 1.0,
            exploration_delta_mul: 1.0,
            dna_binding: 1.0,
            over_density_threshold: 0.0,
            counter_deposit_mul: 0.0,
        }
    }
}

/// The four built-in roles: explorer, integrator, regulator, innovator.
#[must_use]
pub fn default_profiles() -> [SpeciesProfile; SPECIES_COUNT] {
    let explorer = SpeciesProfile {
        exploration_mul: 1.4,
        food_attraction_mul: 0.6,
        danger_aversion_mul: 0.8,
        deposit_food_mul: 0.6,
        deposit_danger_mul: 0.5,
        resource_weight_mul: 1.4,
        molecule_weight_mul: 1.4,
        mycel_attraction_mul: 0.6,
        novelty_weight: 0.6,
        dna_binding: 0.9,
        ..SpeciesProfile::default()
    };

    let integrator = SpeciesProfile {
        exploration_mul: 0.7,
        food_attraction_mul: 1.4,
        deposit_food_mul: 1.5,
        deposit_danger_mul: 0.8,
        resource_weight_mul: 0.9,
        molecule_weight_mul: 0.8,
        mycel_attraction_mul: 1.5,
        ..SpeciesProfile::default()
    };

    let regulator = SpeciesProfile {
        exploration_mul: 0.9,
        food_attraction_mul: 0.8,
        danger_aversion_mul: 1.8,
        deposit_food_mul: 0.8,
        deposit_danger_mul: 1.4,
        resource_weight_mul: 0.9,
        molecule_weight_mul: 0.8,
        mycel_attraction_mul: 0.8,
        over_density_threshold: 0.6,
        counter_deposit_mul: 0.5,
        ..SpeciesProfile::default()
    };

    let innovator = SpeciesProfile {
        exploration_mul: 1.3,
        food_attraction_mul: 0.7,
        danger_aversion_mul: 0.9,
        deposit_food_mul: 0.7,
        deposit_danger_mul: 0.7,
        resource_weight_mul: 1.1,
        molecule_weight_mul: 1.2,
        mycel_attraction_mul: 0.6,
        novelty_weight: 0.8,
        mutation_sigma_mul: 1.6,
        exploration_delta_mul: 1.6,
        dna_binding: 0.6,
        ..SpeciesProfile::default()
    };

    [explorer, integrator, regulator, innovator]
}

/// Default population split across the four roles.
#[must_use]
pub const fn default_species_fracs() -> [f32; SPECIES_COUNT] {
    [0.40, 0.25, 0.20, 0.15]
}

/// Cumulative-fraction species pick; falls through to the last role.
#[must_use]
pub fn pick_species(rng: &mut SimRng, fracs: &[f32; SPECIES_COUNT]) -> usize {
    let roll = rng.uniform(0.0, 1.0);
    let mut accum = 0.0f32;
    for (species, frac) in fracs.iter().enumerate() {
        accum += frac;
        if roll <= accum {
            return species;
        }
    }
    SPECIES_COUNT - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_regulator_counter_deposits() {
        let profiles = default_profiles();
        assert_eq!(profiles[2].counter_deposit_mul, 0.5);
        assert_eq!(profiles[2].over_density_threshold, 0.6);
        for (idx, profile) in profiles.iter().enumerate() {
            if idx != 2 {
                assert_eq!(profile.counter_deposit_mul, 0.0);
            }
        }
    }

    #[test]
    fn pick_follows_fractions() {
        let mut rng = SimRng::new(17);
        let fracs = default_species_fracs();
        let mut counts = [0usize; SPECIES_COUNT];
        for _ in 0..10_000 {
            counts[pick_species(&mut rng, &fracs)] += 1;
        }
        for (count, frac) in counts.iter().zip(fracs.iter()) {
            let observed = *count as f32 / 10_000.0;
            assert!((observed - frac).abs() < 0.03, "observed {observed} vs {frac}");
        }
    }

    #[test]
    fn degenerate_fractions_fall_through() {
        let mut rng = SimRng::new(1);
        let fracs = [0.0, 0.0, 0.0, 0.0];
        for _ in 0..32 {
            assert_eq!(pick_species(&mut rng, &fracs), SPECIES_COUNT - 1);
        }
    }
}
