//! Virtual presence address allocation
//!
//! Each gateway owns a range; every host address of the range is one bit.
//! Network and broadcast addresses are excluded for prefixes shorter than
//! /31. Requests return the lowest free address and are idempotent per owner.
//!
//! Gateway ranges must be disjoint, which makes the gateway of an address
//! unique.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crd::{parse_ipv4, EGateway, VirtualPresence};

/// Shortest accepted prefix; keeps one bitset under 2 MiB
pub const MIN_PREFIX_LEN: u8 = 8;

/// Allocation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    /// No gateway of that name is known
    #[error("unknown gateway {0}")]
    UnknownGateway(String),

    /// The range is unusable
    #[error("invalid range {cidr} for gateway {gateway}: {reason}")]
    InvalidRange {
        /// Gateway name
        gateway: String,
        /// Offending range
        cidr: String,
        /// Why it was rejected
        reason: String,
    },

    /// The range intersects another gateway's range
    #[error("range {cidr} of gateway {gateway} overlaps gateway {other}")]
    Overlap {
        /// Rejected gateway
        gateway: String,
        /// Its range
        cidr: String,
        /// Gateway already holding an intersecting range
        other: String,
    },

    /// Every host address is taken
    #[error("gateway {0} has no free addresses")]
    OutOfAddresses(String),

    /// The address is outside the gateway's range
    #[error("{ip} is not a host address of gateway {gateway}")]
    OutOfRange {
        /// Gateway name
        gateway: String,
        /// Offending address
        ip: Ipv4Addr,
    },

    /// The address already belongs to another owner
    #[error("{ip} is already allocated to {owner}")]
    Conflict {
        /// Contested address
        ip: Ipv4Addr,
        /// Current owner
        owner: String,
    },
}

impl From<AllocatorError> for crate::Error {
    fn from(e: AllocatorError) -> Self {
        match e {
            AllocatorError::UnknownGateway(_) => crate::Error::resolution(e.to_string()),
            _ => crate::Error::allocation(e.to_string()),
        }
    }
}

struct Pool {
    cidr: Ipv4Net,
    first: u32,
    size: u32,
    bits: Vec<u64>,
    owners: BTreeMap<Ipv4Addr, String>,
    by_owner: BTreeMap<String, Ipv4Addr>,
}

impl Pool {
    fn new(gateway: &str, cidr: Ipv4Net) -> Result<Self, AllocatorError> {
        if cidr.prefix_len() < MIN_PREFIX_LEN {
            return Err(AllocatorError::InvalidRange {
                gateway: gateway.to_string(),
                cidr: cidr.to_string(),
                reason: format!("prefix shorter than /{}", MIN_PREFIX_LEN),
            });
        }
        let network = u32::from(cidr.network());
        let broadcast = u32::from(cidr.broadcast());
        let (first, last) = if cidr.prefix_len() < 31 {
            (network + 1, broadcast - 1)
        } else {
            (network, broadcast)
        };
        let size = last - first + 1;
        Ok(Self {
            cidr,
            first,
            size,
            bits: vec![0; (size as usize).div_ceil(64)],
            owners: BTreeMap::new(),
            by_owner: BTreeMap::new(),
        })
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<u32> {
        let value = u32::from(ip);
        (value >= self.first && value - self.first < self.size).then(|| value - self.first)
    }

    fn is_set(&self, index: u32) -> bool {
        self.bits[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: u32, value: bool) {
        let word = &mut self.bits[(index / 64) as usize];
        if value {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    fn lowest_free(&self) -> Option<u32> {
        self.bits.iter().enumerate().find_map(|(i, word)| {
            if *word == u64::MAX {
                return None;
            }
            let index = i as u32 * 64 + word.trailing_ones();
            (index < self.size).then_some(index)
        })
    }

    fn take(&mut self, index: u32, owner: &str) -> Ipv4Addr {
        let ip = Ipv4Addr::from(self.first + index);
        self.set(index, true);
        self.owners.insert(ip, owner.to_string());
        self.by_owner.insert(owner.to_string(), ip);
        ip
    }
}

/// Allocator over every known gateway
#[derive(Default)]
pub struct VirtualPresenceAllocator {
    pools: Mutex<BTreeMap<String, Pool>>,
}

impl VirtualPresenceAllocator {
    /// Empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored gateways and allocations
    ///
    /// Objects that no longer fit (unknown gateway, overlapping range,
    /// conflicting owner) are skipped with a warning.
    pub fn rebuild(gateways: &[EGateway], presences: &[VirtualPresence]) -> Self {
        let allocator = Self::new();
        for gateway in gateways {
            let name = gateway.metadata.name.clone().unwrap_or_default();
            let result = gateway
                .spec
                .cidr()
                .map_err(|e| e.to_string())
                .and_then(|cidr| allocator.add_gateway(&name, cidr).map_err(|e| e.to_string()));
            if let Err(e) = result {
                warn!(gateway = %name, error = %e, "Skipping gateway during allocator rebuild");
            }
        }
        for presence in presences {
            let spec = &presence.spec;
            let owner = presence.owner();
            let result = parse_ipv4("virtualIp", &spec.virtual_ip)
                .map_err(|e| e.to_string())
                .and_then(|ip| {
                    allocator
                        .reserve(&spec.gateway_name, ip, &owner)
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = result {
                warn!(owner = %owner, error = %e, "Skipping allocation during allocator rebuild");
            }
        }
        info!(gateways = allocator.pools.lock().len(), "Rebuilt virtual presence allocator");
        allocator
    }

    /// Register `gateway` with range `cidr`
    ///
    /// Re-adding the same range is a no-op. Changing the range of a gateway
    /// is only allowed while nothing is allocated from it.
    pub fn add_gateway(&self, gateway: &str, cidr: Ipv4Net) -> Result<(), AllocatorError> {
        let cidr = cidr.trunc();
        let mut pools = self.pools.lock();

        if let Some(existing) = pools.get(gateway) {
            if existing.cidr == cidr {
                return Ok(());
            }
            if !existing.owners.is_empty() {
                return Err(AllocatorError::InvalidRange {
                    gateway: gateway.to_string(),
                    cidr: cidr.to_string(),
                    reason: format!("{} still has allocations", existing.cidr),
                });
            }
        }

        if let Some((other, _)) = pools.iter().find(|(name, pool)| {
            name.as_str() != gateway
                && (pool.cidr.contains(&cidr.network()) || cidr.contains(&pool.cidr.network()))
        }) {
            return Err(AllocatorError::Overlap {
                gateway: gateway.to_string(),
                cidr: cidr.to_string(),
                other: other.clone(),
            });
        }

        pools.insert(gateway.to_string(), Pool::new(gateway, cidr)?);
        info!(gateway = %gateway, %cidr, "Registered gateway range");
        Ok(())
    }

    /// Forget `gateway`, returning the owners that still held addresses
    pub fn remove_gateway(&self, gateway: &str) -> Vec<String> {
        self.pools
            .lock()
            .remove(gateway)
            .map(|pool| pool.by_owner.into_keys().collect())
            .unwrap_or_default()
    }

    /// Whether `gateway` is registered
    pub fn has_gateway(&self, gateway: &str) -> bool {
        self.pools.lock().contains_key(gateway)
    }

    /// Allocate the lowest free address of `gateway` to `owner`
    pub fn request(&self, gateway: &str, owner: &str) -> Result<Ipv4Addr, AllocatorError> {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(gateway)
            .ok_or_else(|| AllocatorError::UnknownGateway(gateway.to_string()))?;

        if let Some(ip) = pool.by_owner.get(owner) {
            return Ok(*ip);
        }
        let index = pool
            .lowest_free()
            .ok_or_else(|| AllocatorError::OutOfAddresses(gateway.to_string()))?;
        let ip = pool.take(index, owner);
        debug!(gateway = %gateway, owner = %owner, %ip, "Allocated virtual presence");
        Ok(ip)
    }

    /// Record that `ip` of `gateway` belongs to `owner`
    pub fn reserve(&self, gateway: &str, ip: Ipv4Addr, owner: &str) -> Result<(), AllocatorError> {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(gateway)
            .ok_or_else(|| AllocatorError::UnknownGateway(gateway.to_string()))?;
        let index = pool.index_of(ip).ok_or_else(|| AllocatorError::OutOfRange {
            gateway: gateway.to_string(),
            ip,
        })?;

        match pool.owners.get(&ip) {
            Some(current) if current == owner => return Ok(()),
            Some(current) => {
                return Err(AllocatorError::Conflict {
                    ip,
                    owner: current.clone(),
                })
            }
            None => {}
        }
        if let Some(previous) = pool.by_owner.get(owner).copied() {
            if let Some(previous_index) = pool.index_of(previous) {
                pool.set(previous_index, false);
            }
            pool.owners.remove(&previous);
        }
        pool.take(index, owner);
        Ok(())
    }

    /// Return `owner`'s address of `gateway` to the pool
    ///
    /// Releasing an owner without an address is a no-op.
    pub fn release(&self, gateway: &str, owner: &str) -> Option<Ipv4Addr> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(gateway)?;
        let ip = pool.by_owner.remove(owner)?;
        pool.owners.remove(&ip);
        if let Some(index) = pool.index_of(ip) {
            pool.set(index, false);
        }
        debug!(gateway = %gateway, owner = %owner, %ip, "Released virtual presence");
        Some(ip)
    }

    /// Release whatever `owner` holds in any gateway
    ///
    /// Used on teardown when the owner's gateway may already be gone.
    pub fn release_owner(&self, owner: &str) -> Option<(String, Ipv4Addr)> {
        let gateway = {
            let pools = self.pools.lock();
            pools
                .iter()
                .find(|(_, pool)| pool.by_owner.contains_key(owner))
                .map(|(name, _)| name.clone())?
        };
        self.release(&gateway, owner).map(|ip| (gateway, ip))
    }

    /// Address currently held by `owner` in `gateway`
    pub fn lookup(&self, gateway: &str, owner: &str) -> Option<Ipv4Addr> {
        self.pools.lock().get(gateway)?.by_owner.get(owner).copied()
    }

    /// Gateway whose range contains `ip`
    pub fn gateway_of(&self, ip: Ipv4Addr) -> Option<String> {
        self.pools
            .lock()
            .iter()
            .find(|(_, pool)| pool.cidr.contains(&ip))
            .map(|(name, _)| name.clone())
    }

    /// Allocations of `gateway`, ordered by address
    pub fn allocations(&self, gateway: &str) -> Vec<(Ipv4Addr, String)> {
        self.pools
            .lock()
            .get(gateway)
            .map(|pool| pool.owners.iter().map(|(ip, o)| (*ip, o.clone())).collect())
            .unwrap_or_default()
    }
}
