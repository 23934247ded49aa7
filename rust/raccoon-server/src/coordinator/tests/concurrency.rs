use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Barrier,
    },
    thread,
};

use super::utils::{coordinator, delta, enable_logging, filled};
use crate::coordinator::{AggregationCoordinator, CoordinatorError};

#[test]
fn test_concurrent_aggregations() {
    enable_logging();
    let coordinator = Arc::new(coordinator());

    for round in 1..=50 {
        coordinator.submit_delta("a", delta(1.)).unwrap();
        coordinator.submit_delta("a", delta(3.)).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles = (0..2)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.run_aggregation("a")
                })
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();

        let committed = results
            .iter()
            .filter_map(|result| result.as_ref().ok())
            .collect::<Vec<_>>();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].round, round);
        assert_eq!(committed[0].deltas, 2);
        assert!(results.iter().all(|result| matches!(
            result,
            Ok(_) | Err(CoordinatorError::RoundBusy) | Err(CoordinatorError::EmptyBuffer)
        )));

        assert_eq!(*coordinator.get_weights("a").unwrap(), filled(2. * round as f32));
    }
}

#[test]
fn test_reads_during_aggregation() {
    let coordinator = Arc::new(coordinator());
    let done = Arc::new(AtomicBool::new(false));

    let readers = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut reads = 0_usize;
                loop {
                    let weights = coordinator.get_weights("a").unwrap();
                    // every aggregation adds one to all scalars, so a snapshot mixing two
                    // rounds would hold different values
                    let first = weights.tensors()[0].iter().next().copied().unwrap();
                    assert!(weights
                        .iter()
                        .all(|tensor| tensor.iter().all(|value| *value == first)));
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        break reads;
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for _ in 0..200 {
        coordinator.submit_delta("a", delta(1.)).unwrap();
        coordinator.run_aggregation("a").unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(*coordinator.get_weights("a").unwrap(), filled(200.));
}

#[test]
fn test_no_delta_lost_or_duplicated() {
    let coordinator = Arc::new(coordinator());
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let submitters = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let accepted = accepted.clone();
            let rejected = rejected.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    match coordinator.submit_delta("a", delta(1.)) {
                        Ok(()) => accepted.fetch_add(1, Ordering::SeqCst),
                        Err(CoordinatorError::RoundBusy) => rejected.fetch_add(1, Ordering::SeqCst),
                        Err(error) => panic!("unexpected error: {}", error),
                    };
                }
            })
        })
        .collect::<Vec<_>>();

    let aggregator = {
        let coordinator = coordinator.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut aggregated = 0;
            while !done.load(Ordering::Acquire) {
                aggregated += aggregate(&coordinator);
            }
            aggregated
        })
    };

    for submitter in submitters {
        submitter.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let aggregated = aggregator.join().unwrap() + aggregate(&coordinator);

    assert_eq!(
        accepted.load(Ordering::SeqCst) + rejected.load(Ordering::SeqCst),
        1000
    );
    assert_eq!(aggregated, accepted.load(Ordering::SeqCst));
    assert_eq!(coordinator.pending_count("a").unwrap(), 0);
}

/// Runs an aggregation and returns the number of aggregated deltas.
fn aggregate(coordinator: &AggregationCoordinator) -> usize {
    match coordinator.run_aggregation("a") {
        Ok(summary) => summary.deltas,
        Err(CoordinatorError::EmptyBuffer) => 0,
        Err(error) => panic!("unexpected error: {}", error),
    }
}

#[test]
fn test_groups_aggregate_in_parallel() {
    let coordinator = Arc::new(coordinator());
    let handles = ["a", "b"]
        .iter()
        .copied()
        .map(|name| {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    coordinator.submit_delta(name, delta(1.)).unwrap();
                    coordinator.run_aggregation(name).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*coordinator.get_weights("a").unwrap(), filled(100.));
    assert_eq!(*coordinator.get_weights("b").unwrap(), filled(100.));
}
