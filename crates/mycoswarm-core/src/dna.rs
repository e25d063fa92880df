//! Evolutionary memory: genomes and bounded fitness-sorted pools.

use serde::{Deserialize, Serialize};

use crate::{EvoParams, SimRng};

/// Behavioral genome carried by every agent. Components are clamped to
/// their ranges on every write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    /// Probe distance multiplier, `[0.2, 3.0]`.
    pub sense_gain: f32,
    /// Pheromone read gain, `[0.2, 3.0]`.
    pub pheromone_gain: f32,
    /// Heading jitter weight, `[0.0, 1.0]`.
    pub exploration_bias: f32,
}

impl Default for Genome {
    fn default() -> Self {
        Self {
            sense_gain: 1.0,
            pheromone_gain: 1.0,
            exploration_bias: 0.5,
        }
    }
}

impl Genome {
    /// Clamp all components into their documented ranges.
    pub fn clamp(&mut self) {
        self.sense_gain = self.sense_gain.clamp(0.2, 3.0);
        self.pheromone_gain = self.pheromone_gain.clamp(0.2, 3.0);
        self.exploration_bias = self.exploration_bias.clamp(0.0, 1.0);
    }

    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.clamp();
        self
    }

    /// Fresh genome for agents spawned without pool ancestry.
    #[must_use]
    pub fn random(rng: &mut SimRng) -> Self {
        Self {
            sense_gain: rng.uniform(0.6, 1.4),
            pheromone_gain: rng.uniform(0.6, 1.4),
            exploration_bias: rng.uniform(0.2, 0.8),
        }
    }

    /// Multiplicative gain mutation and additive bias mutation, clamped.
    pub fn mutate(&mut self, rng: &mut SimRng, sigma: f32, delta: f32) {
        if sigma > 0.0 {
            self.sense_gain *= rng.uniform(1.0 - sigma, 1.0 + sigma);
            self.pheromone_gain *= rng.uniform(1.0 - sigma, 1.0 + sigma);
        }
        if delta > 0.0 {
            self.exploration_bias += rng.uniform(-delta, delta);
        }
        self.clamp();
    }
}

/// One remembered genome with its score and residence time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DnaEntry {
    pub genome: Genome,
    pub fitness: f32,
    pub age: u32,
}

/// Bounded pool ordered descending by fitness.
///
/// Invariants: `len() <= capacity` after every insertion; order is restored
/// on insert and preserved by decay (all entries scale by the same factor).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnaMemory {
    entries: Vec<DnaEntry>,
}

impl DnaMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[DnaEntry] {
        &self.entries
    }

    /// Fitness of the current worst entry, if any.
    #[must_use]
    pub fn worst_fitness(&self) -> Option<f32> {
        self.entries.last().map(|e| e.fitness)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries beyond `capacity`, keeping the best.
    pub fn truncate(&mut self, capacity: usize) {
        self.entries.truncate(capacity);
    }

    /// Insert, re-sort descending by fitness, truncate to `capacity`.
    pub fn add(&mut self, genome: Genome, fitness: f32, capacity: usize) {
        self.entries.push(DnaEntry {
            genome,
            fitness: fitness.max(0.0),
            age: 0,
        });
        self.entries
            .sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
        self.entries.truncate(capacity);
    }

    /// Age every entry and scale its fitness by the decay factor. Relative
    /// order is unchanged, so no re-sort happens here.
    pub fn decay(&mut self, evo: &EvoParams) {
        let factor = if evo.enabled { evo.age_decay } else { 0.995 };
        for entry in &mut self.entries {
            entry.age += 1;
            entry.fitness *= factor;
        }
    }

    /// Sample a genome biased toward high fitness, then mutate it.
    ///
    /// An empty pool yields a fresh random genome. With evolution enabled
    /// the draw prefers the elite prefix with probability `elite_frac` and
    /// mutates with the configured sigma/delta; without evolution the whole
    /// pool is weighted and the fixed mutation (sigma 0.1, delta 0.05)
    /// applies.
    #[must_use]
    pub fn sample(&self, rng: &mut SimRng, evo: &EvoParams, survival_bias: f32) -> Genome {
        if self.entries.is_empty() {
            return Genome::random(rng);
        }

        let pick_range = if evo.enabled {
            let elite = ((self.entries.len() as f32 * evo.elite_frac) as usize).max(1);
            if rng.chance(evo.elite_frac) {
                &self.entries[..elite.min(self.entries.len())]
            } else {
                &self.entries[..]
            }
        } else {
            &self.entries[..]
        };

        let mut genome = Self::weighted_pick(pick_range, rng, survival_bias);
        let (sigma, delta) = if evo.enabled {
            (evo.mutation_sigma, evo.exploration_delta)
        } else {
            (0.1, 0.05)
        };
        genome.mutate(rng, sigma, delta);
        genome
    }

    fn weighted_pick(entries: &[DnaEntry], rng: &mut SimRng, survival_bias: f32) -> Genome {
        let weight = |e: &DnaEntry| e.fitness * survival_bias + 0.01;
        let total: f32 = entries.iter().map(weight).sum();
        let mut pick = rng.uniform(0.0, total);
        for entry in entries {
            let w = weight(entry);
            if pick <= w {
                return entry.genome;
            }
            pick -= w;
        }
        // Numerical edge: fall through to the last entry.
        entries[entries.len() - 1].genome
    }
}
