use teb::{
    Damage, Dgram, DgramError, Level, PulseId, ResultDgram, Src, TransitionId, TypeId, Xtc,
    MON_IDX, WRT_IDX,
};

#[test]
fn pulse_id_separates_value_and_control() {
    let pid = PulseId::event(0x00ab_cdef_0123, 5);
    assert_eq!(pid.value(), 0x00ab_cdef_0123);
    assert!(pid.is_event());
    assert_eq!(pid.readout_group(), 5);

    let tr = PulseId::transition(42, 3);
    assert!(!tr.is_event());
    assert_eq!(tr.readout_group(), 3);
    assert_eq!(tr.value(), 42);
}

#[test]
fn pulse_id_value_masks_to_56_bits() {
    let pid = PulseId::event(u64::MAX, 0);
    assert_eq!(pid.value(), (1u64 << 56) - 1);
}

#[test]
fn contribution_round_trips_through_the_wire() {
    let dg = Dgram::contribution(
        PulseId::event(0x1234_5678, 2),
        TransitionId::L1Accept,
        0xdead_beef,
        7,
        [0x11, 0x22],
    );
    let bytes = dg.encode();
    assert_eq!(bytes.len(), dg.size());

    let decoded = Dgram::decode(&bytes).expect("decode");
    assert_eq!(decoded, dg);
    assert_eq!(decoded.payload_words(), vec![0x11, 0x22]);
}

#[test]
fn wire_layout_is_byte_exact() {
    let dg = Dgram::contribution(
        PulseId::event(0x0102_0304, 1),
        TransitionId::L1Accept,
        0x0a0b_0c0d,
        9,
        [0x0000_0001, 0x0000_0002],
    );
    let bytes = dg.encode();

    // 8-byte pulse id at offset 0.
    assert_eq!(
        u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        dg.pulse_id.raw()
    );
    // 4-byte transition id at offset 8.
    assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 12);
    // 4-byte environment at offset 12.
    assert_eq!(
        u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        0x0a0b_0c0d
    );
    // 8-byte source at offset 16: id then level.
    assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 9);
    assert_eq!(
        u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        Level::Segment as u32
    );
    // Container: TypeId, damage, extent, then payload.
    assert_eq!(
        u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
        TypeId::DATA as u32
    );
    assert_eq!(u32::from_le_bytes(bytes[28..32].try_into().unwrap()), 0);
    assert_eq!(
        u32::from_le_bytes(bytes[32..36].try_into().unwrap()),
        (Xtc::HEADER_SIZE + 8) as u32
    );
    assert_eq!(u32::from_le_bytes(bytes[36..40].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 2);
}

#[test]
fn damage_survives_the_wire() {
    let mut dg = Dgram::contribution(
        PulseId::event(77, 0),
        TransitionId::L1Accept,
        0,
        0,
        [0, 0],
    );
    dg.xtc.damage.increase(Damage::MISSING_CONTRIBUTION | Damage::DUPLICATE_CONTRIBUTION);
    let decoded = Dgram::decode(&dg.encode()).expect("decode");
    assert!(decoded.xtc.damage.has(Damage::MISSING_CONTRIBUTION));
    assert!(decoded.xtc.damage.has(Damage::DUPLICATE_CONTRIBUTION));
    assert!(!decoded.xtc.damage.has(Damage::OUT_OF_ORDER));
}

#[test]
fn truncated_buffers_are_rejected() {
    let dg = Dgram::contribution(
        PulseId::event(1, 0),
        TransitionId::L1Accept,
        0,
        0,
        [0, 0],
    );
    let bytes = dg.encode();
    assert_eq!(
        Dgram::decode(&bytes[..10]),
        Err(DgramError::Truncated(10))
    );
    // Header intact but payload cut short.
    assert!(matches!(
        Dgram::decode(&bytes[..bytes.len() - 4]),
        Err(DgramError::BadExtent { .. })
    ));
}

#[test]
fn result_dgram_carries_two_zeroed_words() {
    let transition = Dgram::contribution(
        PulseId::transition(10, 0),
        TransitionId::Configure,
        0x55,
        4,
        [9, 9],
    );
    let mut rdg = ResultDgram::new(&transition, 6);
    assert_eq!(rdg.result(), [0, 0]);
    assert_eq!(rdg.pulse_id().value(), 10);
    assert!(!rdg.is_event());
    assert_eq!(rdg.dgram().src, Src::new(6, Level::Event));
    assert_eq!(rdg.dgram().env, 0x55);

    rdg.set_result(WRT_IDX, 1);
    rdg.set_result(MON_IDX, 0x8300_0000);
    rdg.increase_damage(Damage::MISSING_CONTRIBUTION);

    let decoded = Dgram::decode(&rdg.encode()).expect("decode");
    assert_eq!(decoded.payload_words(), vec![1, 0x8300_0000]);
    assert!(decoded.xtc.damage.has(Damage::MISSING_CONTRIBUTION));
}
