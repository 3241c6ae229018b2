use super::helpers::{local_group, policy, small_config};
use ringlink::{BackoffPolicy, QueueHandle, RingError};
use tokio_util::sync::CancellationToken;

#[test]
fn test_flag_from_earlier_epoch_rejected() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let cancel = CancellationToken::new();

    // Device 1 completes a call on its own and moves to epoch 2.
    comms[1].begin_call(QueueHandle::DEFAULT).unwrap();
    comms[1].settle(&policy(), &cancel).unwrap();
    assert_eq!(comms[1].begin_call(QueueHandle::DEFAULT).unwrap().get(), 2);

    // Device 0 is still in its first call and publishes.
    comms[0].begin_call(QueueHandle::DEFAULT).unwrap();
    comms[0].publish_payload(0, 0, &[9u8; 32]).unwrap();

    let err = comms[1].resolve_step(0, 0, &policy(), &cancel).unwrap_err();
    match err {
        RingError::StaleEpoch {
            step,
            epoch,
            required,
            observed,
        } => {
            assert_eq!(step, 0);
            assert_eq!(epoch, 2);
            assert_eq!(required, 1);
            assert_eq!(observed, 0);
        }
        other => panic!("expected StaleEpoch, got {other:?}"),
    }
    assert!(err_is_protocol(&comms[1].resolve_step(0, 0, &policy(), &cancel)));
}

fn err_is_protocol(r: &ringlink::Result<ringlink::StepHandoff>) -> bool {
    matches!(r, Err(e) if e.is_protocol_violation())
}

#[test]
fn test_next_epoch_waits_for_fresh_publish() {
    let (_rt, mut comms) = local_group(2, &small_config());
    let cancel = CancellationToken::new();

    for c in comms.iter_mut() {
        c.begin_call(QueueHandle::DEFAULT).unwrap();
    }
    comms[0].publish_payload(0, 0, &[1u8; 16]).unwrap();
    comms[1].publish_payload(0, 0, &[2u8; 16]).unwrap();
    let h1 = comms[1].resolve_step(0, 0, &policy(), &cancel).unwrap();
    let h0 = comms[0].resolve_step(0, 0, &policy(), &cancel).unwrap();
    assert_eq!(unsafe { h1.src_bytes(16) }, &[1u8; 16]);
    assert_eq!(unsafe { h0.src_bytes(16) }, &[2u8; 16]);
    h0.finish();
    h1.finish();
    for c in comms.iter_mut() {
        assert_eq!(c.settle(&policy(), &cancel).unwrap(), 1);
    }

    // Second call: step 0 was drained, so nothing is consumable until the
    // producer publishes again.
    for c in comms.iter_mut() {
        assert_eq!(c.begin_call(QueueHandle::DEFAULT).unwrap().get(), 2);
    }
    let err = comms[1]
        .resolve_step(0, 0, &BackoffPolicy::bounded(50), &cancel)
        .unwrap_err();
    assert!(matches!(err, RingError::PollBudgetExhausted { .. }));

    comms[0].publish_payload(0, 0, &[3u8; 16]).unwrap();
    let h1 = comms[1].resolve_step(0, 0, &policy(), &cancel).unwrap();
    assert_eq!(unsafe { h1.src_bytes(16) }, &[3u8; 16]);
}

#[test]
fn test_epoch_tracks_calls() {
    let (_rt, mut comms) = local_group(1, &small_config());
    let c = &mut comms[0];
    assert!(matches!(
        c.epoch(),
        Err(RingError::InvalidState { op: "epoch", .. })
    ));
    for call in 1..=3 {
        let e = c.begin_call(QueueHandle::DEFAULT).unwrap();
        assert_eq!(c.epoch().unwrap(), e);
        assert_eq!(e.get(), call);
        assert_eq!(e.required_counter(), call - 1);
        c.settle(&policy(), &CancellationToken::new()).unwrap();
    }
}
