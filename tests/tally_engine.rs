//! End-to-end properties of the tally engine: commit semantics across a
//! rayon pool, rank reduction over in-process communicators, dispatch and
//! reset behaviour.

use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use tallysim_rs::*;

fn track_estimator(id: EstimatorId, multiplier: f64) -> Estimator {
    let entities = [(1, 1.0), (2, 1.0)];
    Estimator::new(id, EstimatorKind::CellTrackLengthFlux, multiplier, &entities).unwrap()
}

fn binned_track_estimator(id: EstimatorId, energy_bins: Vec<f64>) -> Estimator {
    let mut est = track_estimator(id, 1.0);
    est.set_bin_boundaries(PhaseSpaceDimension::Energy, energy_bins).unwrap();
    est
}

fn single_history_handler() -> EventHandler {
    let mut handler = EventHandler::new();
    handler.register(track_estimator(1, 10.0)).unwrap();

    let p = ParticleState::neutron(0);
    handler
        .update_observers_from_particle_subtrack_ending_in_cell_event(0, &p, 1, 1.0, 1.0)
        .unwrap();
    handler.commit_observer_history_contributions(0).unwrap();
    handler
}

fn assert_close(a: f64, b: f64) {
    let scale = a.abs().max(b.abs()).max(1.0);
    assert!((a - b).abs() <= 1e-9 * scale, "{a} != {b}");
}

#[test]
fn test_commutativity_across_workers() {
    const WORKERS: usize = 4;
    let mut rng = StdRng::seed_from_u64(2024);
    let totals: Vec<f64> = (0..500).map(|_| rng.gen_range(0.0..5.0)).collect();

    let mut parallel = track_estimator(1, 1.0);
    parallel.enable_thread_support(WORKERS).unwrap();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(WORKERS)
        .build()
        .unwrap();

    pool.install(|| {
        totals.par_iter().enumerate().try_for_each(|(history, &total)| {
            let worker = rayon::current_thread_index().unwrap_or(0);
            let p = ParticleState::neutron(history as u64);
            let point = ObservationPoint::new(&p);
            parallel.add_partial_history_contribution(worker, 1, &point, total)?;
            parallel.commit_history_contribution(worker)
        })
    })
    .unwrap();

    let sequential = track_estimator(2, 1.0);
    for (history, &total) in totals.iter().enumerate().rev() {
        let p = ParticleState::neutron(history as u64);
        sequential
            .add_partial_history_contribution(0, 1, &ObservationPoint::new(&p), total)
            .unwrap();
        sequential.commit_history_contribution(0).unwrap();
    }

    let a = parallel.raw_bin_data(1).unwrap()[0];
    let b = sequential.raw_bin_data(1).unwrap()[0];
    assert_close(a.first, b.first);
    assert_close(a.second, b.second);
    assert!((0..WORKERS).all(|w| !parallel.has_uncommitted_history_contribution(w).unwrap()));
}

/// Several partial scores per history, spread over entities and energy bins
fn random_history(seed: u64) -> Vec<(EntityId, f64, f64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let partials = rng.gen_range(1..8);
    (0..partials)
        .map(|_| {
            let entity = rng.gen_range(1..=2);
            let energy = rng.gen_range(0.0..3.0);
            let length = rng.gen_range(0.0..2.0);
            (entity, energy, length)
        })
        .collect()
}

#[test]
fn test_commutativity_with_many_partials_per_history() {
    const WORKERS: usize = 3;
    const HISTORIES: u64 = 400;
    let bins = vec![0.0, 1.0, 2.0, 3.0];

    let mut parallel = EventHandler::new();
    parallel.enable_thread_support(WORKERS).unwrap();
    parallel.register(binned_track_estimator(1, bins.clone())).unwrap();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(WORKERS)
        .build()
        .unwrap();

    pool.install(|| {
        (0..HISTORIES).into_par_iter().try_for_each(|history| {
            let worker = rayon::current_thread_index().unwrap_or(0);
            for (cell, energy, length) in random_history(history) {
                let p = ParticleState::neutron(history).with_energy(energy);
                parallel.update_observers_from_particle_subtrack_ending_in_cell_event(
                    worker,
                    &p,
                    cell,
                    length,
                    1.0,
                )?;
            }
            parallel.commit_observer_history_contributions(worker)
        })
    })
    .unwrap();

    let mut sequential = EventHandler::new();
    sequential.register(binned_track_estimator(1, bins)).unwrap();
    for history in (0..HISTORIES).rev() {
        for (cell, energy, length) in random_history(history) {
            let p = ParticleState::neutron(history).with_energy(energy);
            sequential
                .update_observers_from_particle_subtrack_ending_in_cell_event(
                    0,
                    &p,
                    cell,
                    length,
                    1.0,
                )
                .unwrap();
        }
        sequential.commit_observer_history_contributions(0).unwrap();
    }

    assert_eq!(parallel.committed_histories(), HISTORIES);
    let a = parallel.estimator(1).unwrap().moment_table();
    let b = sequential.estimator(1).unwrap().moment_table();
    let (a, b) = (a.to_flat(), b.to_flat());
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_close(*x, *y);
    }
    // Every bin of both entities saw scores
    assert!(a.iter().step_by(2).all(|&s1| s1 > 0.0));
}

#[test]
fn test_partial_contributions_aggregate_per_history() {
    let est = track_estimator(1, 1.0);
    let p = ParticleState::neutron(0);
    let point = ObservationPoint::new(&p);

    est.add_partial_history_contribution(0, 2, &point, 2.0).unwrap();
    est.add_partial_history_contribution(0, 2, &point, 3.0).unwrap();
    est.commit_history_contribution(0).unwrap();

    assert_eq!(est.raw_bin_data(2).unwrap(), vec![MomentPair::new(5.0, 25.0)]);
}

#[test]
fn test_single_history_processed_value() {
    let handler = single_history_handler();
    let mut sink = MemorySink::new();
    let context = handler.run_context(0.0, 2.0);
    handler.export_observer_data(&mut sink, &context, true).unwrap();

    let processed = sink.processed_bin_data(1, 1).unwrap();
    assert_close(processed[0].mean, 10.0);
    assert_eq!(processed[0].relative_error, 0.0);
    assert_eq!(processed[0].figure_of_merit, 0.0);
}

#[test]
fn test_reduction_round_trip() {
    const RANKS: usize = 3;

    let handles: Vec<_> = LocalCommunicator::group(RANKS)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let handler = single_history_handler();
                handler.reduce_data(&comm, 0).unwrap();
                let context = handler.run_context(0.0, 1.0);
                let raw = handler.estimator(1).unwrap().raw_bin_data(1).unwrap()[0];
                let processed = handler
                    .estimator(1)
                    .unwrap()
                    .processed_bin_data(1, &context)
                    .unwrap()[0];
                (comm.rank(), handler.committed_histories(), raw, processed)
            })
        })
        .collect();

    for handle in handles {
        let (rank, histories, raw, processed) = handle.join().unwrap();
        if rank == 0 {
            assert_eq!(histories, RANKS as u64);
            assert_eq!(raw, MomentPair::new(RANKS as f64, RANKS as f64));
            assert_close(processed.mean, 10.0);
            assert_eq!(processed.relative_error, 0.0);
        } else {
            assert_eq!(histories, 0);
            assert_eq!(raw, MomentPair::ZERO);
        }
    }
}

#[test]
fn test_reduce_mismatch_is_reported_on_every_rank() {
    let handles: Vec<_> = LocalCommunicator::group(2)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let mut handler = single_history_handler();
                if comm.rank() == 1 {
                    handler.register(track_estimator(2, 1.0)).unwrap();
                }
                let result = handler.reduce_data(&comm, 0);
                (result, handler.committed_histories())
            })
        })
        .collect();

    for handle in handles {
        let (result, histories) = handle.join().unwrap();
        assert_eq!(result, Err(ReduceError::Mismatch { rank: 1, target: 0 }));
        // Data survives a failed reduction
        assert_eq!(histories, 1);
    }
}

#[test]
fn test_reduce_rejects_different_bins_of_equal_size() {
    let handles: Vec<_> = LocalCommunicator::group(2)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let bins = if comm.rank() == 0 {
                    vec![0.0, 1.0, 2.0]
                } else {
                    vec![0.0, 5.0, 10.0]
                };
                let mut handler = EventHandler::new();
                handler.register(binned_track_estimator(1, bins)).unwrap();
                let p = ParticleState::neutron(0).with_energy(0.5);
                handler
                    .update_observers_from_particle_subtrack_ending_in_cell_event(
                        0,
                        &p,
                        1,
                        1.0,
                        1.0,
                    )
                    .unwrap();
                handler.commit_observer_history_contributions(0).unwrap();

                let result = handler.reduce_data(&comm, 0);
                let raw = handler.estimator(1).unwrap().raw_bin_data(1).unwrap();
                (result, raw)
            })
        })
        .collect();

    for handle in handles {
        let (result, raw) = handle.join().unwrap();
        assert_eq!(result, Err(ReduceError::Mismatch { rank: 1, target: 0 }));
        assert_eq!(raw, vec![MomentPair::new(1.0, 1.0), MomentPair::ZERO]);
    }
}

#[test]
fn test_export_is_idempotent() {
    let mut handler = EventHandler::new();
    handler.register(binned_track_estimator(1, vec![0.0, 1.0, 2.0, 3.0])).unwrap();
    for history in 0..20 {
        for (cell, energy, length) in random_history(history) {
            let p = ParticleState::neutron(history).with_energy(energy);
            handler
                .update_observers_from_particle_subtrack_ending_in_cell_event(
                    0,
                    &p,
                    cell,
                    length,
                    1.0,
                )
                .unwrap();
        }
        handler.commit_observer_history_contributions(0).unwrap();
    }
    let context = handler.run_context(0.0, 3.0);

    let mut first = MemorySink::new();
    let mut second = MemorySink::new();
    handler.export_observer_data(&mut first, &context, true).unwrap();
    handler.export_observer_data(&mut second, &context, true).unwrap();
    assert_eq!(first.records, second.records);
    assert!(first.processed_bin_data(1, 2).unwrap().iter().any(|p| p.mean > 0.0));

    let mut json = JsonSink::new();
    handler.export_observer_data(&mut json, &context, true).unwrap();
    let once = json.document();
    handler.export_observer_data(&mut json, &context, true).unwrap();
    assert_eq!(json.document(), once);
    assert_eq!(handler.committed_histories(), 20);
}

#[test]
fn test_out_of_range_contribution_is_dropped() {
    let mut est = track_estimator(1, 1.0);
    est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.1, 1.0, 10.0]).unwrap();
    let mut handler = EventHandler::new();
    handler.register(est).unwrap();

    for energy in [20.0, 0.05] {
        let p = ParticleState::neutron(0).with_energy(energy);
        handler
            .update_observers_from_particle_subtrack_ending_in_cell_event(0, &p, 1, 2.0, 1.0)
            .unwrap();
    }
    handler.commit_observer_history_contributions(0).unwrap();

    let est = handler.estimator(1).unwrap();
    assert!(est.raw_bin_data(1).unwrap().iter().all(|m| m.is_zero()));
    assert_eq!(est.dropped_contributions(), 2);

    // A boundary value belongs to the upper bin
    let p = ParticleState::neutron(1).with_energy(1.0);
    handler
        .update_observers_from_particle_subtrack_ending_in_cell_event(0, &p, 1, 2.0, 1.0)
        .unwrap();
    handler.commit_observer_history_contributions(0).unwrap();
    assert_eq!(
        handler.estimator(1).unwrap().raw_bin_data(1).unwrap(),
        vec![MomentPair::ZERO, MomentPair::new(2.0, 4.0)]
    );
}

#[test]
fn test_dispatch_fans_out_to_fired_entity_only() {
    let mut handler = EventHandler::new();
    handler.register(track_estimator(1, 1.0)).unwrap();
    assert_eq!(handler.observer_count_for(EventKind::ParticleSubtrackEndingInCell, 1), 1);
    assert_eq!(handler.observer_count_for(EventKind::ParticleSubtrackEndingInCell, 2), 1);

    let p = ParticleState::neutron(0);
    handler
        .update_observers_from_particle_subtrack_ending_in_cell_event(0, &p, 2, 4.0, 1.0)
        .unwrap();
    handler.commit_observer_history_contributions(0).unwrap();

    let est = handler.estimator(1).unwrap();
    assert_eq!(est.raw_bin_data(1).unwrap(), vec![MomentPair::ZERO]);
    assert_eq!(est.raw_bin_data(2).unwrap(), vec![MomentPair::new(4.0, 16.0)]);
}

#[test]
fn test_reset_then_export_is_zero() {
    let handler = single_history_handler();
    handler.reset_observer_data();

    let mut sink = MemorySink::new();
    let context = handler.run_context(0.0, 1.0);
    handler.export_observer_data(&mut sink, &context, true).unwrap();

    for entity in [1, 2] {
        assert_eq!(sink.raw_bin_data(1, entity).unwrap(), &[MomentPair::ZERO]);
        let processed = sink.processed_bin_data(1, entity).unwrap();
        assert_eq!(processed[0].mean, 0.0);
        assert_eq!(processed[0].relative_error, 0.0);
    }
}

#[test]
fn test_slab_configuration_end_to_end() {
    let mut config = TallyConfig::slab_example();
    config.workers = 2;
    let handler = EventHandler::from_config(&config).unwrap();
    assert_eq!(handler.number_of_estimators(), 4);

    // Neutron born in cell 2, flies 5 cm along +x and is absorbed
    let p = ParticleState::neutron(0)
        .with_energy(2.0)
        .with_position(Vec3::new(15.0, 0.0, 0.0))
        .with_direction(Vec3::unit_x())
        .with_cell(2);
    handler
        .update_observers_from_particle_entering_cell_event(1, &p, 2)
        .unwrap();
    handler
        .update_observers_from_particle_subtrack_ending_in_cell_event(1, &p, 2, 5.0, 1.0)
        .unwrap();
    handler
        .update_observers_from_particle_subtrack_ending_global_event(
            1,
            &p,
            &Vec3::new(10.0, 0.0, 0.0),
            &Vec3::new(15.0, 0.0, 0.0),
        )
        .unwrap();
    handler.commit_observer_history_contributions(1).unwrap();

    // Track length 5 in the [1, 14.1] energy bin, then weighted by E = 2
    // in the energy-flux response block
    let flux = handler.estimator(1).unwrap().raw_bin_data(2).unwrap();
    assert_eq!(flux.len(), 6);
    assert_eq!(flux[2], MomentPair::new(5.0, 25.0));
    assert_close(flux[5].first, 10.0);
    assert_close(flux[5].second, 100.0);
    // Full 2 MeV deposit lands in [1, 5)
    assert_eq!(
        handler.estimator(3).unwrap().raw_bin_data(2).unwrap()[1],
        MomentPair::new(1.0, 1.0)
    );
    // Mesh element spanning x in [10, 15]
    let element = handler.estimator(4).unwrap().raw_bin_data(2).unwrap()[0];
    assert_close(element.first, 5.0);
    assert_close(element.second, 25.0);

    let mut sink = JsonSink::new();
    let context = handler.run_context(0.0, 1.0);
    handler.export_observer_data(&mut sink, &context, true).unwrap();
    let doc = sink.document();
    assert_eq!(doc["run"]["total_histories"], 1);
    assert!(doc["estimators"]["3"]["entities"]["2"]["raw_bin_data"].is_array());
}
