//! Ring index tables.
//!
//! Each ring is a cyclic order of the communicator's devices. For every ring
//! we keep four permutations of `[0, n_dev)`: the internal order
//! (ring position -> device), ring position -> user rank, its inverse, and a
//! device-visible copy of ring position -> user rank for kernels.

use crate::error::{RingError, Result};
use crate::memory::{BufferRef, Device};
use crate::types::{DeviceIndex, MAX_RINGS, Rank};

/// Ring neighbors of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbors {
    /// Device this one receives from.
    pub prev: DeviceIndex,
    /// Device this one sends to.
    pub next: DeviceIndex,
}

/// A table laid out for device-side reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTable {
    data: Box<[u32]>,
}

impl DeviceTable {
    fn upload(table: &[usize]) -> Self {
        Self {
            data: table.iter().map(|&v| v as u32).collect(),
        }
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    /// Address a kernel reads the table from.
    pub fn as_buffer(&self) -> BufferRef<Device> {
        // SAFETY: the table lives as long as `self`; the host runtime treats
        // host memory as device memory.
        unsafe {
            BufferRef::new(
                self.data.as_ptr() as u64,
                std::mem::size_of_val(&*self.data),
            )
        }
    }
}

/// The four tables of one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingOrder {
    device_from_ring: Box<[DeviceIndex]>,
    ring_from_device: Box<[usize]>,
    user_from_ring: Box<[Rank]>,
    ring_from_user: Box<[usize]>,
    dev_user_from_ring: DeviceTable,
}

impl RingOrder {
    fn new(device_from_ring: Vec<DeviceIndex>, user_order: &[Rank], ring: usize) -> Result<Self> {
        let n = user_order.len();
        check_permutation(&device_from_ring, n, ring, "device_from_ring")?;
        let user_from_ring: Vec<Rank> = device_from_ring.iter().map(|&d| user_order[d]).collect();
        check_permutation(&user_from_ring, n, ring, "user_from_ring")?;
        let ring_from_user = invert(&user_from_ring);
        let ring_from_device = invert(&device_from_ring);
        let dev_user_from_ring = DeviceTable::upload(&user_from_ring);
        Ok(Self {
            device_from_ring: device_from_ring.into(),
            ring_from_device: ring_from_device.into(),
            user_from_ring: user_from_ring.into(),
            ring_from_user: ring_from_user.into(),
            dev_user_from_ring,
        })
    }

    pub fn len(&self) -> usize {
        self.device_from_ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_from_ring.is_empty()
    }

    /// Internal order: the device at each ring position.
    pub fn device_from_ring(&self) -> &[DeviceIndex] {
        &self.device_from_ring
    }

    pub fn user_from_ring(&self) -> &[Rank] {
        &self.user_from_ring
    }

    pub fn ring_from_user(&self) -> &[usize] {
        &self.ring_from_user
    }

    pub fn dev_user_from_ring(&self) -> &DeviceTable {
        &self.dev_user_from_ring
    }

    /// Ring position of `device`.
    pub fn position(&self, device: DeviceIndex) -> Option<usize> {
        self.ring_from_device.get(device).copied()
    }

    pub fn neighbors(&self, device: DeviceIndex) -> Option<Neighbors> {
        let n = self.len();
        let pos = self.position(device)?;
        Some(Neighbors {
            prev: self.device_from_ring[(pos + n - 1) % n],
            next: self.device_from_ring[(pos + 1) % n],
        })
    }

    fn validate(&self, ring: usize) -> Result<()> {
        let n = self.len();
        check_permutation(&self.device_from_ring, n, ring, "device_from_ring")?;
        check_permutation(&self.user_from_ring, n, ring, "user_from_ring")?;
        check_permutation(&self.ring_from_user, n, ring, "ring_from_user")?;
        for i in 0..n {
            if self.ring_from_user[self.user_from_ring[i]] != i
                || self.user_from_ring[self.ring_from_user[i]] != i
            {
                return Err(RingError::NonBijective {
                    ring,
                    table: "ring_from_user",
                    n_dev: n,
                    reason: format!("not the inverse of user_from_ring at {i}"),
                });
            }
        }
        let device_copy = self.dev_user_from_ring.as_slice();
        if device_copy.len() != n
            || device_copy
                .iter()
                .zip(self.user_from_ring.iter())
                .any(|(&d, &h)| d as usize != h)
        {
            return Err(RingError::NonBijective {
                ring,
                table: "dev_user_from_ring",
                n_dev: n,
                reason: "device copy diverges from user_from_ring".into(),
            });
        }
        Ok(())
    }
}

/// Ring index tables for every ring of a communicator group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingTables {
    n_dev: usize,
    rings: Vec<RingOrder>,
}

impl RingTables {
    /// Build `n_rings` default rings for `user_order[device] = user rank`.
    ///
    /// Every ring visits devices in ascending user rank. Ring `r` starts at
    /// user rank `r * n_dev / n_rings`, so rings cover distinct starting
    /// owners. No more rings than devices are built; the same input always
    /// yields the same tables.
    pub fn build(user_order: &[Rank], n_rings: usize) -> Result<Self> {
        let n_dev = user_order.len();
        check_rank_order(user_order)?;
        if n_rings > MAX_RINGS {
            return Err(RingError::TooManyRings {
                requested: n_rings,
                max: MAX_RINGS,
            });
        }
        let n_rings = n_rings.clamp(1, n_dev);

        let device_by_user = invert(user_order);
        let rings = (0..n_rings)
            .map(|r| {
                let start = r * n_dev / n_rings;
                let order = (0..n_dev)
                    .map(|p| device_by_user[(start + p) % n_dev])
                    .collect();
                RingOrder::new(order, user_order, r)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { n_dev, rings })
    }

    /// Build one ring per explicit device order.
    pub fn with_orders(user_order: &[Rank], orders: &[Vec<DeviceIndex>]) -> Result<Self> {
        let n_dev = user_order.len();
        check_rank_order(user_order)?;
        if orders.is_empty() {
            return Err(RingError::Config("at least one ring order is required".into()));
        }
        if orders.len() > MAX_RINGS {
            return Err(RingError::TooManyRings {
                requested: orders.len(),
                max: MAX_RINGS,
            });
        }
        let rings = orders
            .iter()
            .enumerate()
            .map(|(r, order)| RingOrder::new(order.clone(), user_order, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { n_dev, rings })
    }

    pub fn n_dev(&self) -> usize {
        self.n_dev
    }

    pub fn n_rings(&self) -> usize {
        self.rings.len()
    }

    pub fn ring(&self, ring: usize) -> Result<&RingOrder> {
        self.rings.get(ring).ok_or(RingError::RingOutOfRange {
            ring,
            n_rings: self.rings.len(),
        })
    }

    pub fn rings(&self) -> &[RingOrder] {
        &self.rings
    }

    /// Ring position of `device` in `ring`.
    pub fn position(&self, ring: usize, device: DeviceIndex) -> Result<usize> {
        self.ring(ring)?
            .position(device)
            .ok_or_else(|| unknown_device(device, self.n_dev))
    }

    pub fn neighbors(&self, ring: usize, device: DeviceIndex) -> Result<Neighbors> {
        self.ring(ring)?
            .neighbors(device)
            .ok_or_else(|| unknown_device(device, self.n_dev))
    }

    /// Re-check that every table is a bijection and each pair is inverse.
    pub fn validate(&self) -> Result<()> {
        for (r, ring) in self.rings.iter().enumerate() {
            if ring.len() != self.n_dev {
                return Err(RingError::NonBijective {
                    ring: r,
                    table: "device_from_ring",
                    n_dev: self.n_dev,
                    reason: format!("has {} entries", ring.len()),
                });
            }
            ring.validate(r)?;
        }
        Ok(())
    }
}

fn unknown_device(device: DeviceIndex, n_dev: usize) -> RingError {
    RingError::InvalidRankOrder {
        reason: format!("device {device} is not part of a {n_dev}-device group"),
    }
}

fn check_rank_order(user_order: &[Rank]) -> Result<()> {
    let n = user_order.len();
    if n == 0 {
        return Err(RingError::DeviceCount { n_dev: 0 });
    }
    let mut seen = vec![false; n];
    for (device, &rank) in user_order.iter().enumerate() {
        if rank >= n {
            return Err(RingError::InvalidRankOrder {
                reason: format!("device {device} has rank {rank}, outside [0, {n})"),
            });
        }
        if std::mem::replace(&mut seen[rank], true) {
            return Err(RingError::InvalidRankOrder {
                reason: format!("rank {rank} is assigned to more than one device"),
            });
        }
    }
    Ok(())
}

fn check_permutation(table: &[usize], n: usize, ring: usize, name: &'static str) -> Result<()> {
    let fail = |reason: String| RingError::NonBijective {
        ring,
        table: name,
        n_dev: n,
        reason,
    };
    if table.len() != n {
        return Err(fail(format!("has {} entries", table.len())));
    }
    let mut seen = vec![false; n];
    for &v in table {
        if v >= n {
            return Err(fail(format!("{v} is out of range")));
        }
        if std::mem::replace(&mut seen[v], true) {
            return Err(fail(format!("{v} appears twice")));
        }
    }
    Ok(())
}

/// Inverse of a permutation already checked by `check_permutation`.
fn invert(table: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; table.len()];
    for (i, &v) in table.iter().enumerate() {
        inv[v] = i;
    }
    inv
}

/// Parse ring orders of the form `"0 1 2 3|0 2 1 3"`.
pub fn parse_ring_orders(spec: &str) -> Result<Vec<Vec<DeviceIndex>>> {
    spec.split('|')
        .map(|ring| {
            ring.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<DeviceIndex>()
                        .map_err(|e| RingError::Config(format!("ring order entry {s:?}: {e}")))
                })
                .collect()
        })
        .collect()
}
