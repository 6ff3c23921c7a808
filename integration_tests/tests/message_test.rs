use integration_tests::prelude::*;

/// Build a node with a static address so it is immediately usable.
fn static_node<'a>(
    bus: &mut SimBus<'a>,
    mbox: &'a RxMbox,
    guid: [u32; 4],
    address: u8,
) -> Node<'a, SimHost> {
    let index = bus.add_node(mbox);
    let mut host = bus.new_host(index, guid, &[2048]);
    storage::write_file(&mut host, 0, files::ADDRESS_FILE, &[address, 1], 0).unwrap();
    Node::new(host, Callbacks::new(), mbox, 0)
}

#[test]
fn status_broadcast_crosses_the_bus() {
    let mbox_a = RxMbox::new();
    let mbox_b = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node_a = static_node(&mut bus, &mbox_a, TEST_GUID, 5);
    let mut node_b = static_node(
        &mut bus,
        &mbox_b,
        [0x1111_2222, 0x3333_4444, 0x5555_6666, 0x7777_8888],
        9,
    );
    let tokens_b = node_b.host().tokens.clone();
    let mut clock = TestClock(0);

    // twelve distinct output statuses force a multi-frame message
    let status = TokenKey::new(1000).with_prefix(KeyPrefix::OutputStatus);
    for i in 0..12u16 {
        node_a.set_exposed_token(TokenKey::new(status.raw() + i), 10 + i as i32);
    }

    bus.clear_log();
    run_ms(&mut clock, &mut [&mut node_a, &mut node_b], &bus, 1500);

    // the broadcast went out as BODY frames closed by a LAST
    let types: Vec<FrameType> = bus
        .frame_log()
        .iter()
        .filter_map(|f| FrameId::decode(f.id()).ok())
        .filter(|id| id.source == 5)
        .map(|id| id.frame_type)
        .collect();
    assert!(types.contains(&FrameType::Body));
    assert!(types.contains(&FrameType::Last));

    // node B decoded the full run
    let received = tokens_b.borrow();
    for i in 0..12u16 {
        assert!(
            received
                .iter()
                .any(|t| t.key.raw() == status.raw() + i && t.value == 10 + i as i32),
            "missing status token {i}"
        );
    }
}

#[test]
fn corrupted_multi_frame_message_is_dropped() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = static_node(&mut bus, &mbox, TEST_GUID, 9);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    // a two-frame status message from a peer, with one payload bit flipped
    let status = TokenKey::new(1000).with_prefix(KeyPrefix::OutputStatus);
    let mut payload = vec![3u8]; // event index
    for i in 0..4u16 {
        let key = TokenKey::new(status.raw() + i);
        payload.push((key.raw() >> 8) as u8);
        payload.push(key.raw() as u8);
        payload.push(50);
    }
    let crc = ecconet_common::crc::crc16(&payload);
    payload.push((crc >> 8) as u8);
    payload.push(crc as u8);
    payload[4] ^= 0x20;

    for (chunk_index, chunk) in payload.chunks(8).enumerate() {
        let id = FrameId {
            frame_index: chunk_index as u8,
            destination: 0,
            is_event: false,
            source: 7,
            frame_type: if (chunk_index + 1) * 8 >= payload.len() {
                FrameType::Last
            } else {
                FrameType::Body
            },
        }
        .encode();
        bus.inject(id, chunk, clock.now());
    }

    run_ms(&mut clock, &mut [&mut node], &bus, 5);
    assert!(tokens.borrow().is_empty());
}

#[test]
fn event_index_orders_non_event_messages() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = static_node(&mut bus, &mbox, TEST_GUID, 9);
    let tokens = node.host().tokens.clone();
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);

    let status = TokenKey::new(1000).with_prefix(KeyPrefix::OutputStatus);

    // a message stamped with event index 10 sets the local index
    let (id, data) = single_frame_token(7, 10, status, 1);
    bus.inject(id, &data, clock.now());
    run_ms(&mut clock, &mut [&mut node], &bus, 2);
    assert_eq!(1, tokens.borrow().len());

    // index 5 is stale against 10: dropped
    let (id, data) = single_frame_token(7, 5, status, 2);
    bus.inject(id, &data, clock.now());
    run_ms(&mut clock, &mut [&mut node], &bus, 2);
    assert_eq!(1, tokens.borrow().len());

    // index 11 is fresh: accepted and adopted
    let (id, data) = single_frame_token(7, 11, status, 3);
    bus.inject(id, &data, clock.now());
    run_ms(&mut clock, &mut [&mut node], &bus, 2);
    assert_eq!(2, tokens.borrow().len());
    assert_eq!(3, tokens.borrow()[1].value);

    // commands pass regardless of their event stamp
    let (id, data) = single_frame_token(7, 5, keys::SYSTEM_POWER_STATE, 1);
    bus.inject(id, &data, clock.now());
    run_ms(&mut clock, &mut [&mut node], &bus, 2);
    assert_eq!(3, tokens.borrow().len());
}

#[test]
fn input_events_are_sent_three_times() {
    let mbox = RxMbox::new();
    let mut bus = SimBus::new();
    let mut node = static_node(&mut bus, &mbox, TEST_GUID, 9);
    let mut clock = TestClock(0);
    run_ms(&mut clock, &mut [&mut node], &bus, 5);
    bus.clear_log();

    let key = TokenKey::new(1002).with_prefix(KeyPrefix::InputStatus);
    node.send_token(&Token::new(0, key, 1));
    run_ms(&mut clock, &mut [&mut node], &bus, 10);

    let events: Vec<FrameId> = bus
        .frame_log()
        .iter()
        .filter_map(|f| FrameId::decode(f.id()).ok())
        .filter(|id| id.source == 9)
        .collect();
    assert_eq!(3, events.len());
    assert!(events.iter().all(|id| id.is_event));
}
