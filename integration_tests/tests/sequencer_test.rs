use ecconet_common::addresses;
use integration_tests::prelude::*;

const PATTERN_STEADY: u16 = 25;
const PATTERN_FLASH: u16 = 26;

/// A table with one two-step flasher and one nested arrangement.
fn demo_table() -> Vec<u8> {
    let mut builder = PatternTableBuilder::new();
    builder
        .begin_pattern(PATTERN_STEADY, 0, ecconet_common::patterns::mode::MULTI_KEY)
        .all_off_step(&[(1000, 0)])
        .step(500, &[(1000, 100)])
        .step(500, &[(1000, 0)]);
    builder
        .begin_pattern(PATTERN_FLASH, 2, ecconet_common::patterns::mode::MULTI_KEY)
        .step(100, &[(1001, 80)])
        .step(100, &[(1001, 0)]);
    builder.build()
}

fn sequencer_node<'a>(bus: &mut SimBus<'a>, mbox: &'a RxMbox, address: u8) -> Node<'a, SimHost> {
    let index = bus.add_node(mbox);
    let mut host = bus.new_host(index, TEST_GUID, &[4096]);
    storage::write_file(&mut host, 0, files::ADDRESS_FILE, &[address, 1], 0).unwrap();
    storage::write_file(&mut host, 0, files::PATTERN_TABLE_FILE, &demo_table(), 0).unwrap();
    Node::new(host, Callbacks::new(), mbox, 0)
}

#[test]
fn pattern_steps_drive_the_application() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_STEADY as i32,
    ));
    assert!(node.is_sequencer_running(0));

    // the first step fires immediately
    {
        let seen = tokens.borrow();
        assert_eq!(1, seen.len());
        assert_eq!(1000, seen[0].key.raw());
        assert_eq!(100, seen[0].value);
        assert!(!seen[0]
            .flags
            .contains(ecconet_common::TokenFlags::DEFAULT_STATE));
        assert_eq!(addresses::SEQUENCER_0, seen[0].address);
    }

    // the second step fires after the step period
    run_ms(&mut clock, &mut [&mut node], &bus, 510);
    {
        let seen = tokens.borrow();
        assert!(seen.len() >= 2);
        assert_eq!(1000, seen[1].key.raw());
        assert_eq!(0, seen[1].value);
    }

    // the pattern repeats forever
    run_ms(&mut clock, &mut [&mut node], &bus, 510);
    assert!(tokens.borrow().len() >= 3);
    assert_eq!(100, tokens.borrow()[2].value);
}

#[test]
fn restarting_the_running_pattern_is_ignored() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    let start = Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_STEADY as i32,
    );
    node.token_in(&start);
    let after_first = tokens.borrow().len();
    // the same request again must not restart the pattern
    node.token_in(&start);
    assert_eq!(after_first, tokens.borrow().len());
}

#[test]
fn stop_emits_the_default_state() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_STEADY as i32,
    ));
    tokens.borrow_mut().clear();

    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        ecconet_common::patterns::PATTERN_STOP as i32,
    ));
    assert!(!node.is_sequencer_running(0));

    let seen = tokens.borrow();
    assert_eq!(1, seen.len());
    assert_eq!(1000, seen[0].key.raw());
    assert_eq!(0, seen[0].value);
    assert!(seen[0]
        .flags
        .contains(ecconet_common::TokenFlags::DEFAULT_STATE));
}

#[test]
fn intensity_scales_step_values() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_INTENSITY,
        40,
    ));
    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_STEADY as i32,
    ));

    let seen = tokens.borrow();
    assert_eq!(40, seen[0].value);
}

#[test]
fn finite_pattern_ends_by_itself() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    // two repeats of a two-step 100 ms pattern: done within a second
    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_FLASH as i32,
    ));
    assert!(node.is_sequencer_running(0));
    run_ms(&mut clock, &mut [&mut node], &bus, 1000);
    assert!(!node.is_sequencer_running(0));
}

#[test]
fn packed_start_token_sets_intensity_and_pattern() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    // (pattern << 16) | (intensity << 8) | sequencer index, to sequencer 1
    let value = ((PATTERN_STEADY as i32) << 16) | (50 << 8) | 1;
    node.token_in(&Token::new(
        addresses::SEQUENCER_0 + 1,
        keys::INDEXED_SEQUENCER_WITH_PATTERN,
        value,
    ));

    assert!(node.is_sequencer_running(1));
    let seen = tokens.borrow();
    assert_eq!(addresses::SEQUENCER_0 + 1, seen[0].address);
    assert_eq!(50, seen[0].value);
}

#[test]
fn sync_from_a_higher_peer_restarts_the_pattern() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    // sync to the exact running pattern (the reset default)
    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_STEADY as i32,
    ));
    // half way through step one; a matching sync from address 30 restarts
    run_ms(&mut clock, &mut [&mut node], &bus, 250);
    tokens.borrow_mut().clear();

    let id = FrameId {
        frame_index: 0,
        destination: 0,
        is_event: false,
        source: 30,
        frame_type: FrameType::Single,
    }
    .encode();
    // a pattern sync message: the enumeration rides in the key field
    let data = [
        0u8,
        0xA0 | ((PATTERN_STEADY >> 8) as u8),
        PATTERN_STEADY as u8,
    ];
    bus.inject(id, &data, clock.now());
    run_ms(&mut clock, &mut [&mut node], &bus, 2);

    // step one replayed immediately instead of 250 ms later
    let seen = tokens.borrow();
    assert!(seen.iter().any(|t| t.key.raw() == 1000 && t.value == 100));
}

#[test]
fn running_sequencer_broadcasts_its_sync() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = sequencer_node(&mut bus, &mbox, 5);
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);
    bus.clear_log();

    node.token_in(&Token::new(
        addresses::SEQUENCER_0,
        keys::SEQUENCER_PATTERN,
        PATTERN_STEADY as i32,
    ));
    run_ms(&mut clock, &mut [&mut node], &bus, 10);

    // a two-byte pattern sync message went to the bus
    let sync_frames: Vec<Vec<u8>> = bus
        .frame_log()
        .iter()
        .filter(|f| f.data().len() >= 3 && f.data()[1] & 0xE0 == 0xA0)
        .map(|f| f.data().to_vec())
        .collect();
    assert!(!sync_frames.is_empty());
    let data = &sync_frames[0];
    let enumeration = (((data[1] & 0x1F) as u16) << 8) | data[2] as u16;
    assert_eq!(PATTERN_STEADY, enumeration);
}
