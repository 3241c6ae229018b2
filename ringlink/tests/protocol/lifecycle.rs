use super::helpers::{local_group, policy, small_config};
use ringlink::{CommState, Direction, PeerSlot, QueueHandle, RingError};
use tokio_util::sync::CancellationToken;

#[test]
fn test_queue_switch_orders_on_previous_call() {
    let (rt, mut comms) = local_group(1, &small_config());
    let cancel = CancellationToken::new();
    let c = &mut comms[0];

    c.begin_call(QueueHandle(1)).unwrap();
    c.settle(&policy(), &cancel).unwrap();
    c.begin_call(QueueHandle(2)).unwrap();
    c.settle(&policy(), &cancel).unwrap();
    c.begin_call(QueueHandle(2)).unwrap();
    c.settle(&policy(), &cancel).unwrap();

    let waits = rt.queue_waits().unwrap();
    // The switch to queue 2 waits on the done event recorded on queue 1;
    // staying on queue 2 adds no wait.
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].0, QueueHandle(2));
    assert_eq!(rt.event_queue(waits[0].1).unwrap(), Some(QueueHandle(2)));
    assert_eq!(c.op_counter().unwrap(), 3);
}

#[test]
fn test_ops_rejected_outside_a_call() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let cancel = CancellationToken::new();
    let c = &mut comms[0];
    assert_eq!(c.state(), CommState::Ready);
    assert!(matches!(
        c.publish(0, 0, 0x10),
        Err(RingError::InvalidState { op: "publish", .. })
    ));
    assert!(matches!(
        c.resolve_step(0, 0, &policy(), &cancel),
        Err(RingError::InvalidState {
            op: "resolve_step",
            state: CommState::Ready
        })
    ));
    c.begin_call(QueueHandle::DEFAULT).unwrap();
    c.settle(&policy(), &cancel).unwrap();
    assert!(matches!(
        c.publish_payload(0, 0, b"late"),
        Err(RingError::InvalidState {
            state: CommState::Settled,
            ..
        })
    ));
}

#[test]
fn test_peer_table_layout() {
    let config = ringlink::RingConfig {
        n_rings: 3,
        ..small_config()
    };
    let (_rt, comms) = local_group(4, &config);
    for c in &comms {
        assert_eq!(c.peers().unwrap().len(), 6);
        for ring in 0..3 {
            let nb = c.neighbors(ring).unwrap();
            let prev = c.peer(PeerSlot::prev(ring)).unwrap();
            let next = c.peer(PeerSlot::next(ring)).unwrap();
            assert_eq!(prev.slot().direction, Direction::Prev);
            assert_eq!(prev.neighbor(), nb.prev);
            assert_eq!(next.neighbor(), nb.next);
            assert_eq!(
                next.ring_position(),
                (c.ring_position(ring).unwrap() + 1) % 4
            );
        }
    }
    assert!(matches!(
        comms[0].peer(PeerSlot::next(3)),
        Err(RingError::RingOutOfRange { ring: 3, n_rings: 3 })
    ));
}

#[test]
fn test_ring_tables_exposed_to_devices() {
    let spec = ringlink::GroupSpec {
        devices: ringlink::GroupSpec::local(4).devices,
        user_order: vec![3, 1, 0, 2],
    };
    let rt = std::sync::Arc::new(ringlink::HostRuntime::new());
    let comms = ringlink::init_group(&spec, &small_config(), rt).unwrap();
    let tables = comms[0].tables();
    tables.validate().unwrap();
    let ring = tables.ring(0).unwrap();
    // Ring 0 visits devices in ascending user rank.
    assert_eq!(ring.device_from_ring(), &[2, 1, 3, 0]);
    assert_eq!(ring.user_from_ring(), &[0, 1, 2, 3]);
    assert_eq!(ring.dev_user_from_ring().as_slice(), &[0, 1, 2, 3]);
    assert_eq!(comms[3].rank(), 2);
    assert_eq!(comms[3].ring_position(0).unwrap(), 2);
}
