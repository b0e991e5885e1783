use std::sync::atomic::Ordering;
use teb::{
    BatchManager, Dgram, PulseId, ResultDgram, TransitionId, BATCH_DURATION, MAX_BATCHES,
    MAX_ENTRIES, MAX_RESULT_SIZE,
};

fn result_at(pid: u64) -> ResultDgram {
    let dg = Dgram::contribution(
        PulseId::event(pid, 0),
        TransitionId::L1Accept,
        0,
        0,
        [0, 0],
    );
    ResultDgram::new(&dg, 0)
}

#[test]
fn allocation_claims_batches_in_freelist_order() {
    let mut batman = BatchManager::new(MAX_RESULT_SIZE).expect("region");
    assert!(batman.current().is_none());

    let first = batman.allocate(100).expect("first batch").clone();
    assert_eq!(first.index(), 0);
    assert_eq!(first.id(), 100);
    assert_eq!(first.extent(), 0);

    let taken = batman.take_current().expect("flush");
    batman.release(taken);

    let second = batman.allocate(200).expect("second batch");
    assert_eq!(second.index(), 1);
}

#[test]
fn expiry_follows_the_duration_window() {
    let mut batman = BatchManager::new(MAX_RESULT_SIZE).expect("region");
    let batch = batman.allocate(100).expect("batch").clone();
    assert!(!batch.expired(100));
    assert!(!batch.expired(BATCH_DURATION - 1));
    assert!(batch.expired(BATCH_DURATION));
    assert!(batch.expired(3 * BATCH_DURATION + 5));
}

#[test]
fn appended_results_share_one_duration_window() {
    let mut batman = BatchManager::new(MAX_RESULT_SIZE).expect("region");
    batman.allocate(10).expect("batch");
    batman.append(&result_at(10)).expect("append");
    batman.append(&result_at(11)).expect("append");

    let batch = batman.current().expect("current").clone();
    assert_eq!(batch.entries(), 2);
    // Both entries decode back out of the region, in append order.
    let slot = batch.extent() / batch.entries();
    let bytes = batman.batch_bytes(&batch);
    let first = Dgram::decode(&bytes[..]).expect("first entry");
    let second = Dgram::decode(&bytes[slot..]).expect("second entry");
    assert_eq!(first.pulse_id.value(), 10);
    assert_eq!(second.pulse_id.value(), 11);
    assert!(
        second.pulse_id.value() - first.pulse_id.value() < BATCH_DURATION,
        "entries must share the duration window"
    );
}

#[test]
fn appends_stop_at_the_entry_budget() {
    let mut batman = BatchManager::new(MAX_RESULT_SIZE).expect("region");
    batman.allocate(0).expect("batch");
    for i in 0..MAX_ENTRIES as u64 {
        assert!(batman.append(&result_at(i)).is_some());
    }
    assert!(batman.append(&result_at(99)).is_none());
}

#[test]
fn release_recycles_through_the_freelist() {
    let mut batman = BatchManager::new(MAX_RESULT_SIZE).expect("region");
    assert_eq!(batman.free_batches(), MAX_BATCHES);

    let mut last_index = 0;
    for pid in 0..(MAX_BATCHES as u64 + 2) {
        let batch = batman
            .allocate(pid * BATCH_DURATION)
            .expect("allocate")
            .clone();
        last_index = batch.index();
        let taken = batman.take_current().expect("flush");
        batman.release(taken);
    }
    // Wrapped past the pool depth and came back around.
    assert_eq!(last_index, 1);
    assert_eq!(batman.free_batches(), MAX_BATCHES);

    let alloc = batman.batch_alloc_cnt().load(Ordering::Relaxed);
    let free = batman.batch_free_cnt().load(Ordering::Relaxed);
    assert_eq!(alloc, MAX_BATCHES as u64 + 2);
    assert_eq!(free, MAX_BATCHES as u64 + 2);
    assert_eq!(batman.batch_waiting().load(Ordering::Relaxed), 0);
}

#[test]
fn region_geometry_matches_the_pool() {
    let batman = BatchManager::new(MAX_RESULT_SIZE).expect("region");
    assert_eq!(
        batman.batch_region_size(),
        batman.max_batch_size() * MAX_BATCHES
    );
    assert_eq!(batman.max_batch_size() % MAX_ENTRIES, 0);
    assert!(batman.max_batch_size() / MAX_ENTRIES >= MAX_RESULT_SIZE);
}
