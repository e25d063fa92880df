use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use mycoswarm_core::{
    FieldKind, GridData, SPECIES_COUNT, SimConfig, SimParams, Simulation, StressParams,
    load_grid_csv,
};
use mycoswarm_gpu::{WgpuDiffusion, list_adapters};

mod report;

use report::{ReportOptions, write_report};

/// Batch driver for the mycoswarm engine.
#[derive(Parser, Debug)]
#[command(name = "mycoswarm", version, about = "Spatial multi-species swarm simulation")]
struct Cli {
    /// Grid width in cells.
    #[arg(long)]
    width: Option<u32>,
    /// Grid height in cells.
    #[arg(long)]
    height: Option<u32>,
    /// Shortcut setting both width and height.
    #[arg(long)]
    size: Option<u32>,
    /// Number of agents.
    #[arg(long)]
    agents: Option<usize>,
    /// Number of simulation steps.
    #[arg(long)]
    steps: Option<u32>,
    /// RNG seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Initial resource field CSV.
    #[arg(long, value_name = "CSV")]
    resources: Option<PathBuf>,
    /// Initial food pheromone field CSV.
    #[arg(long, value_name = "CSV")]
    pheromone: Option<PathBuf>,
    /// Initial molecule field CSV.
    #[arg(long, value_name = "CSV")]
    molecules: Option<PathBuf>,

    /// Mycelium growth rate.
    #[arg(long)]
    mycel_growth: Option<f32>,
    /// Mycelium decay rate.
    #[arg(long)]
    mycel_decay: Option<f32>,
    /// Mycelium transport rate.
    #[arg(long)]
    mycel_transport: Option<f32>,
    /// Mycelium drive threshold.
    #[arg(long = "mycel-threshold")]
    mycel_threshold: Option<f32>,
    /// Mycelium drive weight for food pheromone.
    #[arg(long)]
    mycel_drive_p: Option<f32>,
    /// Mycelium drive weight for resources.
    #[arg(long)]
    mycel_drive_r: Option<f32>,

    /// Dump interval in steps (0 disables dumps).
    #[arg(long, default_value_t = 0)]
    dump_every: u32,
    /// Dump directory.
    #[arg(long, default_value = "dumps")]
    dump_dir: PathBuf,
    /// Dump file prefix.
    #[arg(long, default_value = "swarm")]
    dump_prefix: String,

    /// Report output path (defaults to <dump-dir>/<prefix>_report.html).
    #[arg(long = "report-html", value_name = "PATH")]
    report_html: Option<PathBuf>,
    /// Preview edge length for the report (0 disables previews).
    #[arg(long, default_value_t = 32)]
    report_downsample: u32,
    /// Monochrome report without decorative styling.
    #[arg(long)]
    paper_mode: bool,
    /// Normalise previews across all fields instead of per field.
    #[arg(long)]
    report_global_norm: bool,
    /// Histogram bins for the entropy section.
    #[arg(long, default_value_t = 64)]
    report_hist_bins: usize,
    /// Disable the metric sparklines.
    #[arg(long = "report-no-sparklines")]
    report_no_sparklines: bool,

    /// Enable the one-shot stress event.
    #[arg(long)]
    stress_enable: bool,
    /// Step at which the stress event fires.
    #[arg(long, default_value_t = 120)]
    stress_at_step: u64,
    /// Resource blockade rectangle.
    #[arg(long, num_args = 4, allow_negative_numbers = true, value_names = ["X", "Y", "W", "H"])]
    stress_block_rect: Option<Vec<i32>>,
    /// Toroidal hotspot shift.
    #[arg(long, num_args = 2, allow_negative_numbers = true, value_names = ["DX", "DY"])]
    stress_shift_hotspots: Option<Vec<i32>>,
    /// Per-cell uniform pheromone noise bound after the event.
    #[arg(long, default_value_t = 0.0)]
    stress_pheromone_noise: f32,
    /// Separate seed for the stress noise stream.
    #[arg(long)]
    stress_seed: Option<u64>,

    /// Enable evolutionary tuning.
    #[arg(long)]
    evo_enable: bool,
    /// Elite fraction of the DNA pools.
    #[arg(long, default_value_t = 0.20)]
    evo_elite_frac: f32,
    /// Energy threshold for storing a genome.
    #[arg(long, default_value_t = 1.6)]
    evo_min_energy_to_store: f32,
    /// Gain mutation strength.
    #[arg(long, default_value_t = 0.05)]
    evo_mutation_sigma: f32,
    /// Exploration bias mutation bound.
    #[arg(long, default_value_t = 0.05)]
    evo_exploration_delta: f32,
    /// Fitness averaging window in ticks.
    #[arg(long, default_value_t = 50)]
    evo_fitness_window: u32,
    /// Per-tick fitness decay of stored genomes.
    #[arg(long, default_value_t = 0.995)]
    evo_age_decay: f32,

    /// Population split across the four species.
    #[arg(long, num_args = 4, value_names = ["F0", "F1", "F2", "F3"])]
    species_fracs: Option<Vec<f32>>,
    /// Override one profile multiplier, e.g. `2:novelty_weight=0.5`.
    #[arg(long = "profile-set", value_name = "SPECIES:FIELD=VALUE")]
    profile_set: Vec<String>,

    /// Run the diffusion passes on the GPU.
    #[arg(long)]
    gpu: bool,
    /// Adapter index for the GPU path.
    #[arg(long, default_value_t = 0)]
    gpu_device: usize,
    /// Platform index (accepted for compatibility; adapters are flat).
    #[arg(long, default_value_t = 0)]
    gpu_platform: usize,
    /// Keep diffusion results on the device between dumps (agents=0 only).
    #[arg(long)]
    gpu_no_copyback: bool,
    /// List visible GPU adapters and exit.
    #[arg(long)]
    gpu_list_devices: bool,

    /// Optional subdirectory under the dump directory.
    #[arg(value_name = "DUMP_SUBDIR")]
    dump_subdir: Option<String>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if cli.gpu_list_devices {
        let adapters = list_adapters();
        if adapters.is_empty() {
            println!("(no GPU adapters)");
        }
        for adapter in adapters {
            println!("Device {}: {} [{}]", adapter.index, adapter.name, adapter.backend);
        }
        return Ok(());
    }

    let plan = RunPlan::from_cli(cli)?;
    run(plan)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fully resolved run: validated configuration plus I/O destinations.
struct RunPlan {
    config: SimConfig,
    steps: u32,
    initial_fields: Vec<(FieldKind, GridData)>,
    dump_every: u32,
    dump_dir: PathBuf,
    dump_prefix: String,
    report: ReportOptions,
    gpu: bool,
    gpu_device: usize,
    gpu_platform: usize,
    gpu_no_copyback: bool,
}

impl RunPlan {
    fn from_cli(cli: Cli) -> Result<Self> {
        let mut params = SimParams::default();
        if let Some(size) = cli.size {
            params.width = size;
            params.height = size;
        }
        let width_explicit = cli.width.is_some() || cli.size.is_some();
        let height_explicit = cli.height.is_some() || cli.size.is_some();
        if let Some(width) = cli.width {
            params.width = width;
        }
        if let Some(height) = cli.height {
            params.height = height;
        }
        if let Some(agents) = cli.agents {
            params.agent_count = agents;
        }
        if let Some(steps) = cli.steps {
            params.steps = steps;
        }
        if let Some(v) = cli.mycel_growth {
            params.mycel_growth = v;
        }
        if let Some(v) = cli.mycel_decay {
            params.mycel_decay = v;
        }
        if let Some(v) = cli.mycel_transport {
            params.mycel_transport = v;
        }
        if let Some(v) = cli.mycel_threshold {
            params.mycel_drive_threshold = v;
        }
        if let Some(v) = cli.mycel_drive_p {
            params.mycel_drive_p = v;
        }
        if let Some(v) = cli.mycel_drive_r {
            params.mycel_drive_r = v;
        }

        // Initial fields adopt their CSV dimensions; a conflict with an
        // explicit --width/--height is an error.
        let mut initial_fields = Vec::new();
        for (path, kind, label) in [
            (&cli.resources, FieldKind::Resources, "resources"),
            (&cli.pheromone, FieldKind::PheroFood, "pheromone"),
            (&cli.molecules, FieldKind::Molecules, "molecules"),
        ] {
            let Some(path) = path else { continue };
            let data =
                load_grid_csv(path).with_context(|| format!("loading {label} field"))?;
            if width_explicit && data.width != params.width {
                bail!("{label} CSV width {} does not match --width", data.width);
            }
            if height_explicit && data.height != params.height {
                bail!("{label} CSV height {} does not match --height", data.height);
            }
            params.width = data.width;
            params.height = data.height;
            initial_fields.push((kind, data));
        }

        let mut config = SimConfig {
            params,
            seed: cli.seed,
            ..SimConfig::default()
        };

        config.evo.enabled = cli.evo_enable;
        config.evo.elite_frac = cli.evo_elite_frac;
        config.evo.min_energy_to_store = cli.evo_min_energy_to_store;
        config.evo.mutation_sigma = cli.evo_mutation_sigma;
        config.evo.exploration_delta = cli.evo_exploration_delta;
        config.evo.fitness_window = cli.evo_fitness_window;
        config.evo.age_decay = cli.evo_age_decay;

        config.stress = StressParams {
            enabled: cli.stress_enable,
            at_step: cli.stress_at_step,
            block_rect: cli
                .stress_block_rect
                .as_deref()
                .map(|r| (r[0], r[1], r[2], r[3])),
            shift_hotspots: cli.stress_shift_hotspots.as_deref().map(|s| (s[0], s[1])),
            pheromone_noise: cli.stress_pheromone_noise,
            seed: cli.stress_seed,
        };

        if let Some(fracs) = &cli.species_fracs {
            let mut converted = [0.0f32; SPECIES_COUNT];
            converted.copy_from_slice(fracs);
            config.species_fracs = converted;
        }
        for entry in &cli.profile_set {
            apply_profile_override(&mut config, entry)?;
        }

        config
            .validate()
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        let mut dump_dir = cli.dump_dir;
        let mut report_html = cli.report_html;
        if let Some(subdir) = &cli.dump_subdir {
            dump_dir = dump_dir.join(subdir);
            // A relative report path moves into the subdirectory too.
            if let Some(path) = &report_html {
                if let Some(name) = path.file_name() {
                    report_html = Some(dump_dir.join(name));
                }
            }
        }
        if cli.report_hist_bins == 0 {
            bail!("--report-hist-bins must be positive");
        }

        let steps = config.params.steps;
        Ok(Self {
            report: ReportOptions {
                path: report_html
                    .unwrap_or_else(|| dump_dir.join(format!("{}_report.html", cli.dump_prefix))),
                downsample: cli.report_downsample,
                paper_mode: cli.paper_mode,
                global_norm: cli.report_global_norm,
                hist_bins: cli.report_hist_bins,
                sparklines: !cli.report_no_sparklines,
            },
            config,
            steps,
            initial_fields,
            dump_every: cli.dump_every,
            dump_dir,
            dump_prefix: cli.dump_prefix,
            gpu: cli.gpu,
            gpu_device: cli.gpu_device,
            gpu_platform: cli.gpu_platform,
            gpu_no_copyback: cli.gpu_no_copyback,
        })
    }
}

/// Parse and apply one `SPECIES:FIELD=VALUE` profile override.
fn apply_profile_override(config: &mut SimConfig, entry: &str) -> Result<()> {
    let invalid = || anyhow::anyhow!("invalid --profile-set value: {entry}");
    let (species, rest) = entry.split_once(':').ok_or_else(invalid)?;
    let (field, value) = rest.split_once('=').ok_or_else(invalid)?;
    let species: usize = species.trim().parse().map_err(|_| invalid())?;
    if species >= SPECIES_COUNT {
        bail!("species index {species} out of range in --profile-set");
    }
    let value: f32 = value.trim().parse().map_err(|_| invalid())?;

    let profile = &mut config.profiles[species];
    let slot = match field.trim() {
        "exploration_mul" => &mut profile.exploration_mul,
        "food_attraction_mul" => &mut profile.food_attraction_mul,
        "danger_aversion_mul" => &mut profile.danger_aversion_mul,
        "deposit_food_mul" => &mut profile.deposit_food_mul,
        "deposit_danger_mul" => &mut profile.deposit_danger_mul,
        "resource_weight_mul" => &mut profile.resource_weight_mul,
        "molecule_weight_mul" => &mut profile.molecule_weight_mul,
        "mycel_attraction_mul" => &mut profile.mycel_attraction_mul,
        "novelty_weight" => &mut profile.novelty_weight,
        "mutation_sigma_mul" => &mut profile.mutation_sigma_mul,
        "exploration_delta_mul" => &mut profile.exploration_delta_mul,
        "dna_binding" => &mut profile.dna_binding,
        "over_density_threshold" => &mut profile.over_density_threshold,
        "counter_deposit_mul" => &mut profile.counter_deposit_mul,
        other => bail!("unknown profile field {other} in --profile-set"),
    };
    *slot = value;
    Ok(())
}

fn run(plan: RunPlan) -> Result<()> {
    let mut sim = Simulation::new(plan.config.clone()).map_err(|err| anyhow::anyhow!("{err}"))?;

    for (kind, data) in &plan.initial_fields {
        sim.set_field(*kind, &data.values)
            .map_err(|err| anyhow::anyhow!("initial field rejected: {err}"))?;
    }

    if plan.gpu {
        if plan.gpu_platform != 0 {
            warn!(platform = plan.gpu_platform, "platform index ignored; adapters are flat");
        }
        match WgpuDiffusion::new(plan.gpu_device) {
            Ok(backend) => {
                if sim.install_backend(Box::new(backend)) && plan.gpu_no_copyback {
                    sim.set_no_copyback(true);
                }
            }
            Err(err) => warn!(%err, "GPU unavailable; continuing on CPU"),
        }
    }

    if plan.dump_every > 0 {
        fs::create_dir_all(&plan.dump_dir).with_context(|| {
            format!("could not create dump directory {}", plan.dump_dir.display())
        })?;
    }

    let mut dump_steps = Vec::new();
    for step in 0..plan.steps {
        if plan.dump_every > 0 && step % plan.dump_every == 0 {
            dump_fields(&mut sim, &plan.dump_dir, &plan.dump_prefix, step)?;
            dump_steps.push(step);
        }
        sim.step();

        if step % 10 == 0 {
            let metrics = sim.metrics().last().copied().unwrap_or_else(|| sim.system_metrics());
            let mycel = sim.mycel_stats();
            let (_, global) = sim.dna_sizes();
            info!(
                step,
                avg_energy = metrics.avg_energy,
                dna_global = global,
                mycel_mean = mycel.mean,
                "progress"
            );
        }
    }

    if plan.dump_every > 0 {
        write_report(&mut sim, &plan.report, &plan.dump_prefix, &dump_steps)
            .with_context(|| "report generation failed")?;
        println!("report={}", plan.report.path.display());
    }

    println!("done");
    Ok(())
}

/// Write the five-field artifact set for one step.
fn dump_fields(sim: &mut Simulation, dir: &Path, prefix: &str, step: u32) -> Result<()> {
    for kind in FieldKind::ALL {
        let name = format!("{prefix}_step{step:06}_{}.csv", kind.as_str());
        sim.save_field_csv(kind, &dir.join(&name))
            .with_context(|| format!("writing dump {name}"))?;
    }
    Ok(())
}
