use serde_json::json;
use std::sync::Arc;
use teb::{
    Damage, Decide, DecideError, DecideLoader, DecideRegistry, DecideSlot, Dgram, MemConfigDb,
    PulseId, StandardDecide, TransitionId, ConfigDb, MON_IDX, RESULT_EXTENT, WRT_IDX,
};

struct CountingDecide;

impl Decide for CountingDecide {
    fn event(&mut self, _ctrb: &Dgram, result: Option<&mut [u32; RESULT_EXTENT]>) -> Damage {
        if let Some(result) = result {
            result[WRT_IDX] += 1;
        }
        Damage::none()
    }
}

fn registry_with(soname: &str) -> Arc<DecideRegistry> {
    let registry = DecideRegistry::new();
    registry.register(soname, Arc::new(|| Box::new(CountingDecide) as Box<dyn Decide>));
    Arc::new(registry)
}

#[test]
fn unknown_library_is_rejected() {
    let mut loader = DecideLoader::new(Arc::new(DecideRegistry::new()));
    let err = loader.open("libmissing.so").expect_err("unknown library");
    assert!(matches!(err, DecideError::UnknownLibrary(_)));
    assert!(matches!(loader.create(), Err(DecideError::NotOpen)));
}

#[test]
fn repeated_configure_pairs_creates_with_destroys() {
    let mut loader = DecideLoader::new(registry_with("libtrig.so"));
    let slot = DecideSlot::new();

    const N: usize = 5;
    for _ in 0..N {
        loader.open("libtrig.so").expect("open");
        let handle = loader.create().expect("create");
        // Storing destroys any object the run thread never claimed.
        slot.store(handle);
    }

    let counters = loader.counters().expect("counters");
    assert_eq!(counters.created(), N as u64);
    assert_eq!(counters.destroyed(), N as u64 - 1);

    // Exactly one object extant; dropping it closes the ledger.
    let live = slot.take().expect("extant object");
    drop(live);
    assert_eq!(counters.destroyed(), N as u64);
}

#[test]
fn reopening_a_different_library_starts_fresh_counters() {
    let registry = DecideRegistry::new();
    registry.register("liba.so", Arc::new(|| Box::new(CountingDecide) as Box<dyn Decide>));
    registry.register("libb.so", Arc::new(|| Box::new(CountingDecide) as Box<dyn Decide>));
    let mut loader = DecideLoader::new(Arc::new(registry));

    loader.open("liba.so").expect("open a");
    let first = loader.create().expect("create a");
    let a_counters = loader.counters().expect("a counters");
    assert_eq!(loader.soname(), Some("liba.so"));

    // The old library handle stays valid for objects it created, even
    // after the next configure opens a different library.
    loader.open("libb.so").expect("open b");
    assert_eq!(loader.soname(), Some("libb.so"));
    let _second = loader.create().expect("create b");

    drop(first);
    assert_eq!(a_counters.created(), 1);
    assert_eq!(a_counters.destroyed(), 1);
    let b_counters = loader.counters().expect("b counters");
    assert_eq!(b_counters.created(), 1);
    assert_eq!(b_counters.destroyed(), 0);
}

#[test]
fn slot_hands_objects_across_threads_once() {
    let mut loader = DecideLoader::new(registry_with("libtrig.so"));
    let slot = DecideSlot::new();
    loader.open("libtrig.so").expect("open");
    slot.store(loader.create().expect("create"));

    let taken = slot.take();
    assert!(taken.is_some());
    assert!(slot.take().is_none());
}

#[test]
fn standard_decide_ors_input_words_into_the_result() {
    let mut decide = StandardDecide::default();
    let ctrb = Dgram::contribution(
        PulseId::event(1, 0),
        TransitionId::L1Accept,
        0,
        0,
        [0x1, 0x80],
    );
    let mut words = [0u32; RESULT_EXTENT];
    let damage = decide.event(&ctrb, Some(&mut words));
    assert!(damage.is_clean());
    assert_eq!(words[WRT_IDX], 0x1);
    assert_eq!(words[MON_IDX], 0x80);

    // The no-response path must tolerate absent result storage.
    let damage = decide.event(&ctrb, None);
    assert!(damage.is_clean());
}

#[test]
fn config_document_names_the_library() {
    let db = MemConfigDb::new();
    db.insert("tmoteb", json!({"soname": "libtrig.so"}));
    let document = db.fetch("tmoteb").expect("document");
    let soname = teb::config::db::string_key("tmoteb", &document, "soname").expect("soname");
    assert_eq!(soname, "libtrig.so");

    let missing = teb::config::db::string_key("tmoteb", &json!({}), "soname");
    assert!(missing.is_err());
}
