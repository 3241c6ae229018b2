use ringlink::{BackoffPolicy, Communicator, HostRuntime, RingConfig, init_local_group};
use std::sync::Arc;

/// Payload bytes per block for tests that don't need the full default.
pub const SMALL_BUFFER: usize = 16 * 4096;

pub fn small_config() -> RingConfig {
    RingConfig {
        buffer_size: SMALL_BUFFER,
        n_rings: 1,
        ..RingConfig::default()
    }
}

/// Default pacing with a generous bound, so a broken handshake fails the
/// test instead of hanging it.
pub fn policy() -> BackoffPolicy {
    BackoffPolicy::default().with_max_iters(2_000_000)
}

pub fn local_group(n_dev: usize, config: &RingConfig) -> (Arc<HostRuntime>, Vec<Communicator>) {
    let rt = Arc::new(HostRuntime::new());
    let comms = init_local_group(n_dev, config, rt.clone()).unwrap();
    (rt, comms)
}

/// Helper: drive every communicator on its own blocking thread.
/// Returns the communicators once every device has finished.
pub async fn run_ring<F>(comms: Vec<Communicator>, f: F) -> Vec<Communicator>
where
    F: Fn(&mut Communicator) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for mut comm in comms {
        let f = Arc::clone(&f);
        handles.push(tokio::task::spawn_blocking(move || {
            f(&mut comm);
            comm
        }));
    }
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

/// A recognizable payload for `device`.
pub fn payload(device: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (device * 31 + i) as u8).collect()
}
