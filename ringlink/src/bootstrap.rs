//! Group initialization: tables, blocks, link classification and peer wiring.

use std::sync::Arc;

use crate::comm::Communicator;
use crate::config::RingConfig;
use crate::device::{DeviceRuntime, MappingHandle, MappingKind};
use crate::diag::ring_info;
use crate::error::{RingError, Result};
use crate::memory::{MemKind, check_buffer_size};
use crate::peer::{AddressMode, CleanupHandles, Locality, PeerRef, PeerSlot, PeerTarget};
use crate::ring::RingTables;
use crate::types::{DeviceIndex, ProcessId, Rank};

/// Placement of one device, as reported by the bootstrap collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpec {
    pub device: DeviceIndex,
    /// OS process driving the device.
    pub process: ProcessId,
    /// CPU socket the device hangs off.
    pub socket: u32,
}

/// Input for [`init_group`]. `devices[i].device` must equal `i`;
/// `user_order[device]` is that device's user rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub devices: Vec<DeviceSpec>,
    pub user_order: Vec<Rank>,
}

impl GroupSpec {
    /// `n_dev` devices in one process on one socket, identity rank order.
    pub fn local(n_dev: usize) -> Self {
        Self {
            devices: (0..n_dev)
                .map(|device| DeviceSpec {
                    device,
                    process: 0,
                    socket: 0,
                })
                .collect(),
            user_order: (0..n_dev).collect(),
        }
    }
}

/// How data moves from one device to its ring successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    mode: AddressMode,
    locality: Locality,
    same_socket: bool,
}

impl Link {
    fn classify(
        spec: &GroupSpec,
        runtime: &dyn DeviceRuntime,
        from: DeviceIndex,
        to: DeviceIndex,
    ) -> Self {
        let (a, b) = (&spec.devices[from], &spec.devices[to]);
        let (locality, direct) = if a.process == b.process {
            (
                Locality::SameProcess,
                runtime.can_access_peer(from, to) && runtime.can_access_peer(to, from),
            )
        } else {
            (Locality::CrossProcess, runtime.supports_ipc(from, to))
        };
        Self {
            mode: if direct {
                AddressMode::DeviceDirect
            } else {
                AddressMode::HostStaged
            },
            locality,
            same_socket: a.socket == b.socket,
        }
    }

    fn allows_remote_recv(&self) -> bool {
        self.locality == Locality::SameProcess
            && self.mode == AddressMode::DeviceDirect
            && self.same_socket
    }
}

/// Build one communicator per device, all wired and Ready.
pub fn init_group(
    spec: &GroupSpec,
    config: &RingConfig,
    runtime: Arc<dyn DeviceRuntime>,
) -> Result<Vec<Communicator>> {
    let n_dev = spec.devices.len();
    if n_dev == 0 {
        return Err(RingError::DeviceCount { n_dev });
    }
    if let Some((i, d)) = spec
        .devices
        .iter()
        .enumerate()
        .find(|(i, d)| d.device != *i)
    {
        return Err(RingError::Config(format!(
            "device list entry {i} describes device {}; devices must be numbered in order",
            d.device
        )));
    }
    if spec.user_order.len() != n_dev {
        return Err(RingError::InvalidRankOrder {
            reason: format!(
                "{} ranks given for {n_dev} devices",
                spec.user_order.len()
            ),
        });
    }
    check_buffer_size(config.buffer_size)?;

    let tables = match &config.ring_orders {
        Some(orders) => RingTables::with_orders(&spec.user_order, orders)?,
        None => RingTables::build(&spec.user_order, config.n_rings)?,
    };
    tables.validate()?;
    let tables = Arc::new(tables);

    // links[r][d]: link from device d to its successor on ring r.
    let mut links = Vec::with_capacity(tables.n_rings());
    for r in 0..tables.n_rings() {
        let mut ring_links = Vec::with_capacity(n_dev);
        for d in 0..n_dev {
            let next = tables.neighbors(r, d)?.next;
            let link = Link::classify(spec, runtime.as_ref(), d, next);
            if config.remote_recv && !link.allows_remote_recv() {
                return Err(RingError::Config(format!(
                    "remote receive needs same-process, device-direct, same-socket links; \
                     ring {r} link {d} -> {next} is {:?} {:?} (same socket: {})",
                    link.locality, link.mode, link.same_socket
                )));
            }
            ring_links.push(link);
        }
        links.push(ring_links);
    }

    let mut comms = (0..n_dev)
        .map(|d| {
            Communicator::allocate(
                d,
                spec.user_order[d],
                Arc::clone(&tables),
                config.buffer_size,
                config.remote_recv,
                config.backoff.clone(),
                Arc::clone(&runtime),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut mapped = Vec::new();
    let wiring = match wire_peers(&comms, &tables, &links, config, runtime.as_ref(), &mut mapped) {
        Ok(w) => w,
        Err(e) => {
            for handle in mapped {
                if let Err(re) = runtime.release_mapping(handle) {
                    tracing::warn!(handle = handle.0, "release after failed init: {re}");
                }
            }
            return Err(e);
        }
    };
    for (comm, peers) in comms.iter_mut().zip(wiring) {
        comm.attach_peers(peers)?;
    }

    let staged = links
        .iter()
        .flatten()
        .filter(|l| l.mode == AddressMode::HostStaged)
        .count();
    ring_info!(
        n_dev,
        n_rings = tables.n_rings(),
        staged_links = staged,
        remote_recv = config.remote_recv,
        "ring group initialized"
    );
    Ok(comms)
}

/// Single-process shortcut: `n_dev` devices, identity rank order.
pub fn init_local_group(
    n_dev: usize,
    config: &RingConfig,
    runtime: Arc<dyn DeviceRuntime>,
) -> Result<Vec<Communicator>> {
    init_group(&GroupSpec::local(n_dev), config, runtime)
}

/// Peer tables for every device, in `PeerSlot` order. Every mapping handle
/// created is pushed onto `mapped` so a failed init can release it.
fn wire_peers(
    comms: &[Communicator],
    tables: &RingTables,
    links: &[Vec<Link>],
    config: &RingConfig,
    runtime: &dyn DeviceRuntime,
    mapped: &mut Vec<MappingHandle>,
) -> Result<Vec<Vec<PeerRef>>> {
    let mut wiring = Vec::with_capacity(comms.len());
    for comm in comms {
        let d = comm.device();
        let mut peers = Vec::with_capacity(tables.n_rings() * 2);
        for r in 0..tables.n_rings() {
            let nb = tables.neighbors(r, d)?;

            // Receive side: the predecessor publishes into the block its
            // link to us selects.
            let link = links[r][nb.prev];
            let kind = link.mode.mem_kind();
            let producer = &comms[nb.prev];
            let remote = producer.block(r, kind)?;
            let host_addr = producer.block(r, MemKind::Host)?.base_addr();
            let cleanup = map_link(runtime, link, d, nb.prev, remote.base_addr(), host_addr, mapped)?;
            peers.push(PeerRef::new(PeerTarget {
                device: d,
                neighbor: nb.prev,
                slot: PeerSlot::prev(r),
                ring_position: tables.position(r, nb.prev)?,
                remote,
                local: comm.block(r, kind)?,
                counter: producer.block(0, MemKind::Host)?,
                mode: link.mode,
                locality: link.locality,
                remote_recv: config.remote_recv,
                cleanup,
            }));

            // Send side: we publish into our own block of the link's kind;
            // the successor's block of that kind is its receive buffer.
            let link = links[r][d];
            let kind = link.mode.mem_kind();
            let consumer = &comms[nb.next];
            let remote = consumer.block(r, kind)?;
            let host_addr = consumer.block(r, MemKind::Host)?.base_addr();
            let cleanup = map_link(runtime, link, d, nb.next, remote.base_addr(), host_addr, mapped)?;
            peers.push(PeerRef::new(PeerTarget {
                device: d,
                neighbor: nb.next,
                slot: PeerSlot::next(r),
                ring_position: tables.position(r, nb.next)?,
                remote,
                local: comm.block(r, kind)?,
                counter: consumer.block(0, MemKind::Host)?,
                mode: link.mode,
                locality: link.locality,
                remote_recv: config.remote_recv,
                cleanup,
            }));

            tracing::debug!(
                device = d,
                ring = r,
                prev = nb.prev,
                next = nb.next,
                mode = ?link.mode,
                "peers wired"
            );
        }
        wiring.push(peers);
    }
    Ok(wiring)
}

/// Map a cross-process neighbor's blocks: its device block only when the
/// link is device-direct, its host block always.
fn map_link(
    runtime: &dyn DeviceRuntime,
    link: Link,
    device: DeviceIndex,
    peer: DeviceIndex,
    remote_addr: u64,
    host_addr: u64,
    mapped: &mut Vec<MappingHandle>,
) -> Result<Option<CleanupHandles>> {
    if link.locality != Locality::CrossProcess {
        return Ok(None);
    }
    let device_handle = match link.mode {
        AddressMode::DeviceDirect => {
            let h = runtime.map_peer(MappingKind::Device, device, peer, remote_addr)?;
            mapped.push(h);
            Some(h)
        }
        AddressMode::HostStaged => None,
    };
    let host_handle = runtime.map_peer(MappingKind::Host, device, peer, host_addr)?;
    mapped.push(host_handle);
    Ok(Some(CleanupHandles {
        device: device_handle,
        host: Some(host_handle),
    }))
}
