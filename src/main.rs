//! # TALLYSIM-RS
//!
//! Demonstration driver: a one-dimensional two-cell slab with a simple
//! analog neutron random walk feeding the tally engine from a rayon pool.
//!
//! ```text
//!   x = 0          x = 10          x = 20
//!    |   cell 1    |    cell 2     |
//!    |             | surface 1     |
//!  source →
//! ```
//!
//! Usage: `tallysim [config.json] [results.json]`

use std::env;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::info;

use tallysim_rs::error::{EstimatorError, TallyError};
use tallysim_rs::logging::init_logging;
use tallysim_rs::*;

/// Macroscopic total cross section of both cells (1/cm)
const SIGMA_T: f64 = 0.2;
/// Absorption probability per collision
const ABSORPTION_PROBABILITY: f64 = 0.3;
/// Interface and outer planes (cm)
const PLANES: [f64; 3] = [0.0, 10.0, 20.0];
/// Source energy (MeV)
const SOURCE_ENERGY: f64 = 14.1;
/// Energy below which a history is terminated (MeV)
const ENERGY_CUTOFF: f64 = 1e-3;

fn main() -> Result<(), TallyError> {
    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) => TallyConfig::from_file(path)?,
        None => TallyConfig::slab_example(),
    }
    .with_env_overrides();
    let output = args.next().unwrap_or_else(|| "tallysim_results.json".to_string());

    init_logging(&config.logging)?;
    println!("{}", info());
    println!();

    let handler = EventHandler::from_config(&config)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    info!(histories = config.histories, workers = config.workers, "Running histories");
    let start = Instant::now();

    pool.install(|| {
        (0..config.histories).into_par_iter().try_for_each(|history| {
            let worker = rayon::current_thread_index().unwrap_or(0);
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(history));
            run_history(&handler, worker, history, &mut rng)?;
            handler.commit_observer_history_contributions(worker)
        })
    })?;

    let elapsed = start.elapsed().as_secs_f64();

    handler.reduce_data(&SerialCommunicator, ROOT_RANK)?;
    let context = handler.run_context(0.0, elapsed);

    let mut sink = JsonSink::new();
    handler.export_observer_data(&mut sink, &context, true)?;
    sink.save(&output)?;

    println!("{}", handler.summary(&context));
    println!("Wall-clock time: {:.3} s", elapsed);
    println!("Histories/s: {:.2e}", config.histories as f64 / elapsed.max(1e-12));
    println!("Results written to {}", output);

    Ok(())
}

/// Cell containing x (1 or 2)
fn cell_of(x: f64) -> EntityId {
    if x < PLANES[1] {
        1
    } else {
        2
    }
}

/// Isotropic direction
fn sample_direction<R: Rng>(rng: &mut R) -> Vec3 {
    let mu: f64 = rng.gen_range(-1.0..1.0);
    let phi: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
    let s = (1.0 - mu * mu).sqrt();
    Vec3::new(mu, s * phi.cos(), s * phi.sin())
}

/// Analog random walk of one source neutron
fn run_history<R: Rng>(
    handler: &EventHandler,
    worker: WorkerId,
    history: u64,
    rng: &mut R,
) -> Result<(), EstimatorError> {
    // Inward-hemisphere source at the left face
    let mut direction = sample_direction(rng);
    direction.x = direction.x.abs();

    let mut particle = ParticleState::neutron(history)
        .with_energy(SOURCE_ENERGY)
        .with_position(Vec3::new(1e-9, 0.0, 0.0))
        .with_direction(direction)
        .with_cell(1)
        .at_source();
    let cell = particle.cell;
    handler.update_observers_from_particle_entering_cell_event(worker, &particle, cell)?;

    loop {
        let cell = particle.cell;
        let u = particle.direction.x;

        // Distance to the cell's bounding plane along the flight direction
        let (lower, upper) = if cell == 1 {
            (PLANES[0], PLANES[1])
        } else {
            (PLANES[1], PLANES[2])
        };
        let to_boundary = if u > 0.0 {
            (upper - particle.position.x) / u
        } else if u < 0.0 {
            (lower - particle.position.x) / u
        } else {
            f64::INFINITY
        };

        let flight = -(1.0 - rng.gen::<f64>()).ln() / SIGMA_T;
        let distance = flight.min(to_boundary);

        let start = particle.position;
        particle.advance(distance);
        handler.update_observers_from_particle_subtrack_ending_in_cell_event(
            worker,
            &particle,
            cell,
            distance,
            u,
        )?;
        handler.update_observers_from_particle_subtrack_ending_global_event(
            worker,
            &particle,
            &start,
            &particle.position,
        )?;

        if flight < to_boundary {
            // Collision
            handler.update_observers_from_particle_colliding_in_cell_event(
                worker,
                &particle,
                1.0 / SIGMA_T,
            )?;
            particle.collision_number += 1;

            // Absorbed energy stays in the cell
            if rng.gen::<f64>() < ABSORPTION_PROBABILITY {
                return Ok(());
            }

            particle.energy *= rng.gen_range(0.5..1.0);
            particle.direction = sample_direction(rng);
            if particle.energy < ENERGY_CUTOFF {
                return Ok(());
            }
            continue;
        }

        // Boundary crossing
        handler.update_observers_from_particle_leaving_cell_event(worker, &particle, cell)?;
        let x = particle.position.x;
        if x <= PLANES[0] || x >= PLANES[2] {
            return Ok(());
        }

        handler.update_observers_from_particle_crossing_surface_event(
            worker,
            &particle,
            1,
            &Vec3::unit_x(),
        )?;

        // Nudge across the interface
        particle.position.x += 1e-9 * u.signum();
        particle.cell = cell_of(particle.position.x);
        let cell = particle.cell;
        handler.update_observers_from_particle_entering_cell_event(worker, &particle, cell)?;
    }
}
