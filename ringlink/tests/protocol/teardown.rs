use std::sync::Arc;
use std::time::Duration;

use super::helpers::{local_group, policy, small_config};
use ringlink::{
    BackoffPolicy, CommState, DeviceRuntime, DeviceSpec, GroupSpec, HostRuntime, PeerSlot, QueueHandle,
    RingError, init_group,
};
use tokio_util::sync::CancellationToken;

fn two_process_spec() -> GroupSpec {
    GroupSpec {
        devices: vec![
            DeviceSpec {
                device: 0,
                process: 100,
                socket: 0,
            },
            DeviceSpec {
                device: 1,
                process: 200,
                socket: 0,
            },
        ],
        user_order: vec![1, 0],
    }
}

#[test]
fn test_peer_fails_after_neighbor_destroyed() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let prev = comms[0].peer(PeerSlot::prev(0)).unwrap().clone();
    assert!(prev.resolve_remote().is_ok());

    comms[1].destroy().unwrap();
    assert_eq!(comms[1].state(), CommState::Destroyed);

    assert!(matches!(
        prev.resolve_remote(),
        Err(RingError::PeerReleased { device: 1 })
    ));
    assert!(matches!(
        prev.neighbor_op_counter(),
        Err(RingError::PeerReleased { device: 1 })
    ));

    comms[0].begin_call(QueueHandle::DEFAULT).unwrap();
    assert!(matches!(
        comms[0].resolve_step(0, 0, &policy(), &CancellationToken::new()),
        Err(RingError::PeerReleased { device: 1 })
    ));
}

#[test]
fn test_held_handoff_does_not_revive_destroyed_producer() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let cancel = CancellationToken::new();
    for c in comms.iter_mut() {
        c.begin_call(QueueHandle::DEFAULT).unwrap();
    }
    comms[0].publish_payload(0, 4, b"held").unwrap();
    let handoff = comms[1].resolve_step(0, 4, &policy(), &cancel).unwrap();

    comms[0].destroy().unwrap();

    // The handoff pins device 0's block, but device 1 must not reach it.
    let prev = comms[1].peer(PeerSlot::prev(0)).unwrap();
    assert!(matches!(
        prev.resolve_remote(),
        Err(RingError::PeerReleased { device: 0 })
    ));
    assert!(matches!(
        prev.remote_addr(),
        Err(RingError::PeerReleased { device: 0 })
    ));
    assert!(matches!(
        comms[1].resolve_step(0, 5, &policy(), &cancel),
        Err(RingError::PeerReleased { device: 0 })
    ));
    assert_eq!(unsafe { handoff.src_bytes(4) }, b"held");
    handoff.finish();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_interrupts_poll() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let mut neighbor = comms.pop().unwrap();
    let mut waiter = comms.pop().unwrap();
    waiter.begin_call(QueueHandle::DEFAULT).unwrap();

    let poll = tokio::task::spawn_blocking(move || {
        let r = waiter
            .resolve_step(0, 0, &BackoffPolicy::default(), &CancellationToken::new())
            .map(|_| ());
        (waiter, r)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    neighbor.destroy().unwrap();

    let (_waiter, r) = poll.await.unwrap();
    assert!(matches!(r, Err(RingError::PeerReleased { device: 1 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_interrupts_poll() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let mut waiter = comms.remove(0);
    waiter.begin_call(QueueHandle::DEFAULT).unwrap();
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    let poll = tokio::task::spawn_blocking(move || {
        waiter
            .resolve_step(0, 0, &BackoffPolicy::default(), &token)
            .map(|_| ())
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert!(matches!(poll.await.unwrap(), Err(RingError::Cancelled)));
}

#[test]
fn test_cleanup_handles_released_once() {
    let rt = Arc::new(HostRuntime::new().with_ipc(true));
    let mut comms = init_group(&two_process_spec(), &small_config(), rt.clone()).unwrap();

    let handles: Vec<_> = comms[0]
        .peers()
        .unwrap()
        .iter()
        .filter_map(|p| p.cleanup())
        .collect();
    // One ring: a prev and a next link, each with a device and a host handle.
    assert_eq!(handles.len(), 2);
    assert!(handles.iter().all(|h| h.device.is_some() && h.host.is_some()));
    assert_eq!(rt.live_mappings().unwrap().len(), 8);

    comms[0].destroy().unwrap();
    assert_eq!(rt.live_mappings().unwrap().len(), 4);
    assert_eq!(rt.released_mappings().unwrap(), 4);
    assert!(matches!(comms[0].peers(), Err(RingError::Destroyed)));

    let h = handles[0].host.unwrap();
    assert!(matches!(
        rt.release_mapping(h),
        Err(RingError::DoubleRelease { handle }) if handle == h.0
    ));
    assert!(matches!(comms[0].destroy(), Err(RingError::Destroyed)));

    drop(comms);
    assert!(rt.live_mappings().unwrap().is_empty());
    assert_eq!(rt.released_mappings().unwrap(), 8);
}

#[test]
fn test_drop_without_destroy_releases() {
    let rt = Arc::new(HostRuntime::new().with_ipc(true));
    let comms = init_group(&two_process_spec(), &small_config(), rt.clone()).unwrap();
    assert_eq!(rt.live_events().unwrap(), 2);
    drop(comms);
    assert_eq!(rt.live_events().unwrap(), 0);
    assert!(rt.live_mappings().unwrap().is_empty());
}
