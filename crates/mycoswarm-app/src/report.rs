//! Post-run HTML summary: configuration, metric series, field statistics
//! and downsampled previews.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use mycoswarm_core::{FieldKind, Simulation, field_stats};

/// Report rendering options.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub path: PathBuf,
    /// Maximum preview edge length; 0 disables previews.
    pub downsample: u32,
    /// Monochrome output without decorative styling.
    pub paper_mode: bool,
    /// Normalise previews across all fields instead of per field.
    pub global_norm: bool,
    /// Histogram bins for the entropy section.
    pub hist_bins: usize,
    /// Render metric sparklines.
    pub sparklines: bool,
}

pub fn write_report(
    sim: &mut Simulation,
    opts: &ReportOptions,
    prefix: &str,
    dump_steps: &[u32],
) -> std::io::Result<()> {
    let html = render(sim, opts, prefix, dump_steps);
    if let Some(parent) = opts.path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&opts.path, html)
}

fn render(sim: &mut Simulation, opts: &ReportOptions, prefix: &str, dump_steps: &[u32]) -> String {
    let mut out = String::new();
    let accent = if opts.paper_mode { "#000" } else { "#2563eb" };

    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(out, "<title>{prefix} run report</title>");
    out.push_str("<style>\n");
    if opts.paper_mode {
        out.push_str(
            "body{font-family:serif;color:#000;background:#fff;margin:2em;}\n\
             table{border-collapse:collapse;}td,th{border:1px solid #000;padding:2px 8px;}\n",
        );
    } else {
        out.push_str(
            "body{font-family:sans-serif;color:#111;background:#fafafa;margin:2em;}\n\
             table{border-collapse:collapse;}td,th{border:1px solid #ccc;padding:3px 10px;}\n\
             th{background:#eef;}h2{border-bottom:1px solid #ccc;}\n",
        );
    }
    out.push_str("</style>\n</head>\n<body>\n");
    let _ = writeln!(out, "<h1>{prefix}</h1>");

    render_summary(&mut out, sim);
    if opts.sparklines {
        render_sparklines(&mut out, sim, accent);
    }
    render_field_stats(&mut out, sim, opts.hist_bins);
    if opts.downsample > 0 {
        render_previews(&mut out, sim, opts);
    }
    render_dump_index(&mut out, prefix, dump_steps);

    out.push_str("</body>\n</html>\n");
    out
}

fn render_summary(out: &mut String, sim: &Simulation) {
    let params = sim.params();
    let evo = sim.evo();
    let stress = sim.stress();

    out.push_str("<h2>Run</h2>\n<table>\n");
    let _ = writeln!(
        out,
        "<tr><th>grid</th><td>{}x{}</td></tr>",
        params.width, params.height
    );
    let _ = writeln!(out, "<tr><th>agents</th><td>{}</td></tr>", params.agent_count);
    let _ = writeln!(out, "<tr><th>steps run</th><td>{}</td></tr>", sim.step_index());
    let _ = writeln!(out, "<tr><th>seed</th><td>{}</td></tr>", sim.seed());
    let _ = writeln!(
        out,
        "<tr><th>evolution</th><td>{}</td></tr>",
        if evo.enabled { "on" } else { "off" }
    );
    if stress.enabled {
        let mut scenario = format!("at_step={}", stress.at_step);
        if let Some((x, y, w, h)) = stress.block_rect {
            let _ = write!(scenario, ", block_rect={x},{y},{w},{h}");
        }
        if let Some((dx, dy)) = stress.shift_hotspots {
            let _ = write!(scenario, ", shift_hotspots={dx},{dy}");
        }
        if stress.pheromone_noise > 0.0 {
            let _ = write!(scenario, ", pheromone_noise={}", stress.pheromone_noise);
        }
        let _ = writeln!(out, "<tr><th>stress</th><td>{scenario}</td></tr>");
    }
    let (species_sizes, global_size) = sim.dna_sizes();
    let _ = writeln!(
        out,
        "<tr><th>dna pools</th><td>{species_sizes:?} / global {global_size}</td></tr>"
    );
    out.push_str("</table>\n");
}

fn render_sparklines(out: &mut String, sim: &Simulation, accent: &str) {
    let metrics = sim.metrics();
    if metrics.is_empty() {
        return;
    }
    let energy: Vec<f32> = metrics.iter().map(|m| m.avg_energy).collect();
    let pools: Vec<f32> = metrics
        .iter()
        .map(|m| (m.dna_species_sizes.iter().sum::<usize>() + m.dna_global_size) as f32)
        .collect();

    out.push_str("<h2>Series</h2>\n");
    let _ = writeln!(out, "<p>avg energy {}</p>", sparkline(&energy, accent));
    let _ = writeln!(out, "<p>dna entries {}</p>", sparkline(&pools, accent));
}

/// Inline SVG polyline over the series, 240x40.
fn sparkline(series: &[f32], stroke: &str) -> String {
    const W: f32 = 240.0;
    const H: f32 = 40.0;
    if series.is_empty() {
        return String::new();
    }
    let max = series.iter().copied().fold(f32::MIN, f32::max).max(1e-6);
    let min = series.iter().copied().fold(f32::MAX, f32::min).min(0.0);
    let span = (max - min).max(1e-6);
    let step = if series.len() > 1 {
        W / (series.len() - 1) as f32
    } else {
        W
    };

    let mut points = String::new();
    for (i, value) in series.iter().enumerate() {
        let x = i as f32 * step;
        let y = H - (value - min) / span * H;
        let _ = write!(points, "{x:.1},{y:.1} ");
    }
    format!(
        "<svg width=\"{W}\" height=\"{H}\" viewBox=\"0 0 {W} {H}\">\
         <polyline fill=\"none\" stroke=\"{stroke}\" stroke-width=\"1\" points=\"{}\"/></svg>",
        points.trim_end()
    )
}

fn render_field_stats(out: &mut String, sim: &mut Simulation, bins: usize) {
    out.push_str("<h2>Fields</h2>\n<table>\n");
    out.push_str(
        "<tr><th>field</th><th>min</th><th>max</th><th>mean</th><th>p95</th>\
         <th>entropy</th><th>norm</th></tr>\n",
    );
    for kind in FieldKind::ALL {
        let stats = field_stats(sim.field(kind).cells(), bins);
        let _ = writeln!(
            out,
            "<tr><td>{}</td><td>{:.4}</td><td>{:.4}</td><td>{:.4}</td>\
             <td>{:.4}</td><td>{:.4}</td><td>{:.4}</td></tr>",
            kind.as_str(),
            stats.min,
            stats.max,
            stats.mean,
            stats.p95,
            stats.entropy,
            stats.norm_entropy
        );
    }
    out.push_str("</table>\n");
}

fn render_previews(out: &mut String, sim: &mut Simulation, opts: &ReportOptions) {
    out.push_str("<h2>Previews</h2>\n");

    let global_max = if opts.global_norm {
        let mut max = 0.0f32;
        for kind in FieldKind::ALL {
            for &v in sim.field(kind).cells() {
                max = max.max(v);
            }
        }
        Some(max)
    } else {
        None
    };

    for kind in FieldKind::ALL {
        let field = sim.field(kind);
        let (cols, rows, blocks) = downsample(
            field.cells(),
            field.width() as usize,
            field.height() as usize,
            opts.downsample as usize,
        );
        let max = global_max
            .unwrap_or_else(|| blocks.iter().copied().fold(0.0f32, f32::max))
            .max(1e-6);

        let cell = 6usize;
        let _ = writeln!(out, "<h3>{}</h3>", kind.as_str());
        let _ = write!(
            out,
            "<svg width=\"{}\" height=\"{}\">",
            cols * cell,
            rows * cell
        );
        for row in 0..rows {
            for col in 0..cols {
                let value = (blocks[row * cols + col] / max).clamp(0.0, 1.0);
                let shade = (255.0 - value * 255.0) as u8;
                let fill = if opts.paper_mode {
                    format!("rgb({shade},{shade},{shade})")
                } else {
                    format!("rgb({shade},{shade},255)")
                };
                let _ = write!(
                    out,
                    "<rect x=\"{}\" y=\"{}\" width=\"{cell}\" height=\"{cell}\" fill=\"{fill}\"/>",
                    col * cell,
                    row * cell
                );
            }
        }
        out.push_str("</svg>\n");
    }
}

/// Block-average a field to at most `target` cells per edge.
fn downsample(values: &[f32], width: usize, height: usize, target: usize) -> (usize, usize, Vec<f32>) {
    let block = (width.max(height)).div_ceil(target).max(1);
    let cols = width.div_ceil(block);
    let rows = height.div_ceil(block);
    let mut blocks = vec![0.0f32; cols * rows];
    let mut counts = vec![0u32; cols * rows];
    for y in 0..height {
        for x in 0..width {
            let idx = (y / block) * cols + (x / block);
            blocks[idx] += values[y * width + x];
            counts[idx] += 1;
        }
    }
    for (sum, count) in blocks.iter_mut().zip(counts.iter()) {
        if *count > 0 {
            *sum /= *count as f32;
        }
    }
    (cols, rows, blocks)
}

fn render_dump_index(out: &mut String, prefix: &str, dump_steps: &[u32]) {
    if dump_steps.is_empty() {
        return;
    }
    out.push_str("<h2>Dumps</h2>\n<ul>\n");
    for step in dump_steps {
        let _ = writeln!(
            out,
            "<li>{prefix}_step{step:06}_{{resources,phero_food,phero_danger,molecules,mycel}}.csv</li>"
        );
    }
    out.push_str("</ul>\n");
}
