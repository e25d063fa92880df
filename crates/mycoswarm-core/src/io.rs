//! CSV persistence: field dumps and DNA pool exchange.
//!
//! Field format: UTF-8 text, `#`-prefixed comment lines and blank lines are
//! skipped on read; all data rows carry the same number of comma-separated
//! float values. Writes start with a `# dump` line and use fixed 3-decimal
//! precision. DNA format: header
//! `pool,species,fitness,sense_gain,pheromone_gain,exploration_bias`, pool
//! is `species` (index 0..3) or `global` (index -1).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::dna::{DnaMemory, Genome};
use crate::species::SPECIES_COUNT;

/// I/O failures. Reads never partially mutate caller state; a field CSV
/// write may leave a truncated file behind.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed CSV row in {path}: {row}")]
    MalformedRow { path: PathBuf, row: String },
    #[error("inconsistent row lengths in {path}")]
    RaggedRows { path: PathBuf },
    #[error("{path} contains no data rows")]
    Empty { path: PathBuf },
    #[error("invalid dimensions for CSV dump")]
    InvalidDims,
}

/// Parsed grid file: dimensions inferred from the data.
#[derive(Debug, Clone, PartialEq)]
pub struct GridData {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

/// Load a field CSV. Width is the value count of the first data row, height
/// the number of data rows.
pub fn load_grid_csv(path: &Path) -> Result<GridData, IoError> {
    let file = File::open(path).map_err(|source| IoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut rows: Vec<Vec<f32>> = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|source| IoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim_end_matches('\r');
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut row = Vec::new();
        for cell in trimmed.split(',') {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            let value: f32 = cell.parse().map_err(|_| IoError::MalformedRow {
                path: path.to_path_buf(),
                row: trimmed.to_string(),
            })?;
            row.push(value);
        }
        if row.is_empty() {
            return Err(IoError::MalformedRow {
                path: path.to_path_buf(),
                row: trimmed.to_string(),
            });
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(IoError::Empty {
            path: path.to_path_buf(),
        });
    }

    let width = rows[0].len();
    if rows.iter().any(|row| row.len() != width) {
        return Err(IoError::RaggedRows {
            path: path.to_path_buf(),
        });
    }

    let height = rows.len();
    let mut values = Vec::with_capacity(width * height);
    for row in rows {
        values.extend(row);
    }
    Ok(GridData {
        width: width as u32,
        height: height as u32,
        values,
    })
}

/// Write a field CSV with a `# dump` header and 3-decimal values.
pub fn save_grid_csv(
    path: &Path,
    width: u32,
    height: u32,
    values: &[f32],
) -> Result<(), IoError> {
    if width == 0 || height == 0 || values.len() != (width as usize) * (height as usize) {
        return Err(IoError::InvalidDims);
    }

    let write_err = |source| IoError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(write_err)?;
    let mut out = BufWriter::new(file);

    writeln!(out, "# dump").map_err(write_err)?;
    for y in 0..height as usize {
        let row = &values[y * width as usize..(y + 1) * width as usize];
        let mut first = true;
        for value in row {
            if !first {
                write!(out, ",").map_err(write_err)?;
            }
            write!(out, "{value:.3}").map_err(write_err)?;
            first = false;
        }
        writeln!(out).map_err(write_err)?;
    }
    out.flush().map_err(write_err)
}

/// Destination pool of one imported DNA row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRef {
    Species(usize),
    Global,
}

/// One parsed DNA CSV row; genome is already clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DnaCsvRow {
    pub pool: PoolRef,
    pub fitness: f32,
    pub genome: Genome,
}

/// Export all pools into one CSV, species pools first.
pub fn export_dna_csv(
    path: &Path,
    species: &[DnaMemory; SPECIES_COUNT],
    global: &DnaMemory,
) -> Result<(), IoError> {
    let write_err = |source| IoError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(write_err)?;
    let mut out = BufWriter::new(file);

    writeln!(
        out,
        "pool,species,fitness,sense_gain,pheromone_gain,exploration_bias"
    )
    .map_err(write_err)?;
    for (idx, pool) in species.iter().enumerate() {
        for entry in pool.entries() {
            writeln!(
                out,
                "species,{idx},{},{},{},{}",
                entry.fitness,
                entry.genome.sense_gain,
                entry.genome.pheromone_gain,
                entry.genome.exploration_bias
            )
            .map_err(write_err)?;
        }
    }
    for entry in global.entries() {
        writeln!(
            out,
            "global,-1,{},{},{},{}",
            entry.fitness,
            entry.genome.sense_gain,
            entry.genome.pheromone_gain,
            entry.genome.exploration_bias
        )
        .map_err(write_err)?;
    }
    out.flush().map_err(write_err)
}

/// Parse a DNA CSV fully before anything is applied to a context. Rows
/// naming a species outside 0..4 are rejected.
pub fn import_dna_csv(path: &Path) -> Result<Vec<DnaCsvRow>, IoError> {
    let file = File::open(path).map_err(|source| IoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let malformed = |row: &str| IoError::MalformedRow {
        path: path.to_path_buf(),
        row: row.to_string(),
    };

    let mut rows = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| IoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim_end_matches('\r');
        if line_no == 0 || trimmed.is_empty() {
            continue;
        }

        let fields: Vec<&str> = trimmed.split(',').collect();
        if fields.len() != 6 {
            return Err(malformed(trimmed));
        }
        let species: i32 = fields[1].trim().parse().map_err(|_| malformed(trimmed))?;
        let fitness: f32 = fields[2].trim().parse().map_err(|_| malformed(trimmed))?;
        let genome = Genome {
            sense_gain: fields[3].trim().parse().map_err(|_| malformed(trimmed))?,
            pheromone_gain: fields[4].trim().parse().map_err(|_| malformed(trimmed))?,
            exploration_bias: fields[5].trim().parse().map_err(|_| malformed(trimmed))?,
        }
        .clamped();

        let pool = match fields[0].trim() {
            "global" => PoolRef::Global,
            "species" => {
                if species < 0 || species as usize >= SPECIES_COUNT {
                    return Err(malformed(trimmed));
                }
                PoolRef::Species(species as usize)
            }
            _ => return Err(malformed(trimmed)),
        };
        rows.push(DnaCsvRow {
            pool,
            fitness,
            genome,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn grid_round_trip_within_three_decimals() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("field.csv");
        let values: Vec<f32> = (0..12).map(|i| i as f32 * 0.1234).collect();
        save_grid_csv(&path, 4, 3, &values).expect("save");

        let data = load_grid_csv(&path).expect("load");
        assert_eq!(data.width, 4);
        assert_eq!(data.height, 3);
        for (a, b) in data.values.iter().zip(values.iter()) {
            assert!((a - b).abs() <= 5e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("field.csv");
        std::fs::write(&path, "# dump\n\n1.0,2.0\n# trailing comment\n3.0,4.0\n").expect("write");
        let data = load_grid_csv(&path).expect("load");
        assert_eq!(data.width, 2);
        assert_eq!(data.height, 2);
        assert_eq!(data.values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "1.0,2.0\n3.0\n").expect("write");
        assert!(matches!(
            load_grid_csv(&path),
            Err(IoError::RaggedRows { .. })
        ));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "1.0,zwei\n").expect("write");
        assert!(matches!(
            load_grid_csv(&path),
            Err(IoError::MalformedRow { .. })
        ));
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "# only comments\n").expect("write");
        assert!(matches!(load_grid_csv(&path), Err(IoError::Empty { .. })));
    }

    #[test]
    fn save_rejects_mismatched_dimensions() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.csv");
        assert!(matches!(
            save_grid_csv(&path, 2, 2, &[1.0, 2.0, 3.0]),
            Err(IoError::InvalidDims)
        ));
    }

    #[test]
    fn dna_round_trip_keeps_pools_and_clamps() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dna.csv");

        let mut species: [DnaMemory; SPECIES_COUNT] = Default::default();
        species[1].add(
            Genome {
                sense_gain: 1.5,
                pheromone_gain: 0.8,
                exploration_bias: 0.4,
            },
            2.0,
            16,
        );
        let mut global = DnaMemory::new();
        global.add(Genome::default(), 3.5, 16);

        export_dna_csv(&path, &species, &global).expect("export");
        let rows = import_dna_csv(&path).expect("import");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pool, PoolRef::Species(1));
        assert!((rows[0].fitness - 2.0).abs() < 1e-6);
        assert!((rows[0].genome.sense_gain - 1.5).abs() < 1e-6);
        assert_eq!(rows[1].pool, PoolRef::Global);
    }

    #[test]
    fn dna_import_clamps_genomes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dna.csv");
        std::fs::write(
            &path,
            "pool,species,fitness,sense_gain,pheromone_gain,exploration_bias\nspecies,0,1.0,9.0,0.01,1.5\n",
        )
        .expect("write");
        let rows = import_dna_csv(&path).expect("import");
        assert_eq!(rows[0].genome.sense_gain, 3.0);
        assert_eq!(rows[0].genome.pheromone_gain, 0.2);
        assert_eq!(rows[0].genome.exploration_bias, 1.0);
    }

    #[test]
    fn dna_import_rejects_bad_species_index() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dna.csv");
        std::fs::write(
            &path,
            "pool,species,fitness,sense_gain,pheromone_gain,exploration_bias\nspecies,7,1.0,1.0,1.0,0.5\n",
        )
        .expect("write");
        assert!(matches!(
            import_dna_csv(&path),
            Err(IoError::MalformedRow { .. })
        ));
    }
}
