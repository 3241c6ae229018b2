use super::helpers::{local_group, payload, policy, run_ring, small_config};
use ringlink::{CopyKind, MemKind, QueueHandle, RingConfig};
use tokio_util::sync::CancellationToken;

const PAYLOAD: usize = 1024;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ring_4_devices_default_buffer() {
    let config = RingConfig {
        n_rings: 1,
        ..RingConfig::default()
    };
    let (_rt, comms) = local_group(4, &config);

    let comms = run_ring(comms, |comm| {
        let cancel = CancellationToken::new();
        let dev = comm.device();
        let epoch = comm.begin_call(QueueHandle::DEFAULT).unwrap();
        assert_eq!(epoch.get(), 1);

        comm.publish_payload(0, 0, &payload(dev, PAYLOAD)).unwrap();

        let prev = comm.neighbors(0).unwrap().prev;
        let handoff = comm.resolve_step(0, 0, &policy(), &cancel).unwrap();
        assert_eq!(handoff.src().kind(), MemKind::Device);
        assert_eq!(handoff.copy_kind(), CopyKind::DeviceToDevice);
        let got = unsafe { handoff.src_bytes(PAYLOAD) };
        assert_eq!(got, payload(prev, PAYLOAD).as_slice(), "device {dev}");
        handoff.finish();

        assert_eq!(comm.settle(&policy(), &cancel).unwrap(), 1);
    })
    .await;

    for c in &comms {
        assert_eq!(c.op_counter().unwrap(), 1, "device {}", c.device());
        for ring in 0..c.n_rings() {
            let out = c.outgoing(ring).unwrap();
            assert!(out.header().all_drained());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forward_around_ring() {
    let (_rt, comms) = local_group(4, &small_config());

    run_ring(comms, |comm| {
        let cancel = CancellationToken::new();
        let dev = comm.device();
        comm.begin_call(QueueHandle::DEFAULT).unwrap();

        if dev == 0 {
            comm.publish_payload(0, 0, &payload(0, PAYLOAD)).unwrap();
            let handoff = comm.resolve_step(0, 0, &policy(), &cancel).unwrap();
            // Passed 0 -> 1 -> 2 -> 3 -> 0 unchanged.
            assert_eq!(
                unsafe { handoff.src_bytes(PAYLOAD) },
                payload(0, PAYLOAD).as_slice()
            );
        } else {
            let handoff = comm.resolve_step(0, 0, &policy(), &cancel).unwrap();
            comm.wait_drained(0, 0, &policy(), &cancel).unwrap();
            let dst = handoff.dst();
            assert!(dst.len_bytes() >= PAYLOAD);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    handoff.src().as_u64() as *const u8,
                    dst.as_u64() as *mut u8,
                    PAYLOAD,
                );
            }
            comm.publish(0, 0, dst.as_u64()).unwrap();
            handoff.finish();
        }

        assert_eq!(comm.settle(&policy(), &cancel).unwrap(), 1);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_calls_all_rings() {
    let config = ringlink::RingConfig {
        n_rings: 2,
        ..small_config()
    };
    let (_rt, comms) = local_group(4, &config);

    let comms = run_ring(comms, |comm| {
        let cancel = CancellationToken::new();
        let dev = comm.device();
        for call in 1..=5u64 {
            let epoch = comm.begin_call(QueueHandle::DEFAULT).unwrap();
            assert_eq!(epoch.get(), call);
            let step = (call as usize) % ringlink::MAX_FLAGS;
            for ring in 0..comm.n_rings() {
                let data = payload(dev + call as usize + ring, 256);
                comm.publish_payload(ring, step, &data).unwrap();
            }
            for ring in 0..comm.n_rings() {
                let prev = comm.neighbors(ring).unwrap().prev;
                let handoff = comm.resolve_step(ring, step, &policy(), &cancel).unwrap();
                assert_eq!(
                    unsafe { handoff.src_bytes(256) },
                    payload(prev + call as usize + ring, 256).as_slice()
                );
            }
            assert_eq!(comm.settle(&policy(), &cancel).unwrap(), call);
        }
    })
    .await;

    for c in &comms {
        assert_eq!(c.op_counter().unwrap(), 5);
        assert_eq!(c.op_sched(), 5);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_staged_ring() {
    let rt = std::sync::Arc::new(ringlink::HostRuntime::new().with_peer_access(false));
    let comms = ringlink::init_local_group(2, &small_config(), rt).unwrap();

    run_ring(comms, |comm| {
        let cancel = CancellationToken::new();
        let dev = comm.device();
        comm.begin_call(QueueHandle::DEFAULT).unwrap();
        comm.publish_payload(0, 4, &payload(dev, 128)).unwrap();
        let handoff = comm.resolve_step(0, 4, &policy(), &cancel).unwrap();
        assert_eq!(handoff.src().kind(), MemKind::Host);
        assert_eq!(handoff.copy_kind(), CopyKind::HostToHost);
        assert_eq!(
            unsafe { handoff.src_bytes(128) },
            payload(1 - dev, 128).as_slice()
        );
        drop(handoff);
        comm.settle(&policy(), &cancel).unwrap();
    })
    .await;
}
