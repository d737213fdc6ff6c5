//! Candidate address generation.
//!
//! Every CIDR block is walked in a pseudo-random order produced by a full
//! period linear congruential generator over the block's host bits:
//!
//! `x_{i+1} = (a * x_i + c) mod 2^k`
//!
//! With `c` odd and `a ≡ 1 (mod 4)` the sequence visits every offset in
//! `0..2^k` exactly once before repeating (Hull–Dobell), so no address is
//! handed out twice within a pass. Batches take one address per block in
//! turn, with IPv4 and IPv6 blocks alternating, and never straddle two
//! passes. Once every block is spent the whole set is reseeded and a new
//! pass begins.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::Context;
use ipnet::IpNet;
use rand::Rng;

use crate::config::ScanConfig;
use crate::error::ConfigError;

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Parse one configured entry. Bare addresses become single-host blocks.
pub fn parse_block(s: &str) -> Result<IpNet, ConfigError> {
    let s = s.trim();
    let net = if s.contains('/') {
        s.parse::<IpNet>()
            .map_err(|e| ConfigError::InvalidCidr(format!("{s}: {e}")))?
    } else {
        s.parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|e| ConfigError::InvalidCidr(format!("{s}: {e}")))?
    };
    Ok(net.trunc())
}

/// Entries from a list, one per line or comma-separated; `#` starts a comment.
/// Syntax is checked later, when the iterator is built.
pub fn parse_cidr_list(s: &str) -> Vec<String> {
    s.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn load_cidrs_from_path(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading CIDR list {}", path.display()))?;
    Ok(parse_cidr_list(&text))
}

#[derive(Debug)]
struct BlockCursor {
    net: IpNet,
    base: u128,
    host_bits: u8,
    mask: u128,
    multiplier: u128,
    increment: u128,
    state: u128,
    emitted: u128,
    exhausted: bool,
}

impl BlockCursor {
    fn new(net: IpNet) -> Self {
        let (base, host_bits) = match net {
            IpNet::V4(n) => (u128::from(u32::from(n.network())), 32 - n.prefix_len()),
            IpNet::V6(n) => (u128::from(n.network()), 128 - n.prefix_len()),
        };
        let mask = if host_bits >= 128 { u128::MAX } else { (1u128 << host_bits) - 1 };
        let mut cursor = Self {
            net,
            base,
            host_bits,
            mask,
            multiplier: 1,
            increment: 1,
            state: 0,
            emitted: 0,
            exhausted: false,
        };
        cursor.reseed();
        cursor
    }

    fn reseed(&mut self) {
        let mut rng = rand::thread_rng();
        self.multiplier = (rng.gen::<u128>() << 2) | 1;
        self.increment = rng.gen::<u128>() | 1;
        self.state = rng.gen::<u128>() & self.mask;
        self.emitted = 0;
        self.exhausted = false;
    }

    fn size(&self) -> Option<u128> {
        (self.host_bits < 128).then(|| 1u128 << self.host_bits)
    }

    fn next_addr(&mut self) -> Option<IpAddr> {
        if self.exhausted {
            return None;
        }
        let offset = self.state;
        self.state = self
            .multiplier
            .wrapping_mul(self.state)
            .wrapping_add(self.increment)
            & self.mask;
        self.emitted += 1;
        if self.size() == Some(self.emitted) {
            self.exhausted = true;
        }

        let raw = self.base | offset;
        Some(match self.net {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(raw as u32)),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(raw)),
        })
    }
}

/// Endless stream of candidate addresses, handed out in batches.
#[derive(Debug)]
pub struct AddressIterator {
    cursors: Vec<BlockCursor>,
    next: usize,
    batch_size: usize,
    passes: u64,
}

impl AddressIterator {
    pub fn new(
        cidrs: &[String],
        use_ipv4: bool,
        use_ipv6: bool,
        batch_size: usize,
    ) -> Result<Self, ConfigError> {
        if cidrs.is_empty() {
            return Err(ConfigError::EmptyCidrList);
        }
        if !use_ipv4 && !use_ipv6 {
            return Err(ConfigError::NoAddressFamily);
        }

        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for s in cidrs {
            match parse_block(s)? {
                n @ IpNet::V4(_) if use_ipv4 => v4.push(n),
                n @ IpNet::V6(_) if use_ipv6 => v6.push(n),
                _ => {}
            }
        }
        // Overlapping blocks would otherwise hand out the same address twice per pass.
        let v4 = IpNet::aggregate(&v4);
        let v6 = IpNet::aggregate(&v6);
        if v4.is_empty() && v6.is_empty() {
            return Err(ConfigError::NoUsableBlocks);
        }

        let mut cursors = Vec::with_capacity(v4.len() + v6.len());
        let (mut a, mut b) = (v4.into_iter(), v6.into_iter());
        loop {
            match (a.next(), b.next()) {
                (None, None) => break,
                (x, y) => cursors.extend(x.into_iter().chain(y).map(BlockCursor::new)),
            }
        }

        Ok(Self {
            cursors,
            next: 0,
            batch_size: batch_size.max(1),
            passes: 0,
        })
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self, ConfigError> {
        Self::new(
            &config.cidrs,
            config.use_ipv4,
            config.use_ipv6,
            config.batch_size,
        )
    }

    /// Blocks left after family filtering and merging.
    pub fn blocks(&self) -> impl Iterator<Item = IpNet> + '_ {
        self.cursors.iter().map(|c| c.net)
    }

    /// Completed passes over the whole address space.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Up to `batch_size` addresses, round-robin across blocks.
    ///
    /// A short batch means the current pass just ended; the following call
    /// starts a fresh, reshuffled pass.
    pub fn next_batch(&mut self) -> Result<Vec<IpAddr>, ConfigError> {
        if self.cursors.is_empty() {
            return Err(ConfigError::NoUsableBlocks);
        }
        if self.cursors.iter().all(|c| c.exhausted) {
            self.cursors.iter_mut().for_each(BlockCursor::reseed);
            self.next = 0;
            self.passes += 1;
        }

        let n = self.cursors.len();
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(idx) = (0..n)
                .map(|i| (self.next + i) % n)
                .find(|&i| !self.cursors[i].exhausted)
            else {
                break;
            };
            if let Some(ip) = self.cursors[idx].next_addr() {
                batch.push(ip);
            }
            self.next = (idx + 1) % n;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cidrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_pass_covers_block_without_repeats() {
        let mut it = AddressIterator::new(&cidrs(&["192.168.10.0/24"]), true, false, 1000).unwrap();
        let batch = it.next_batch().unwrap();
        assert_eq!(batch.len(), 256);
        let set: HashSet<_> = batch.iter().collect();
        assert_eq!(set.len(), 256);
        assert_eq!(it.passes(), 0);

        let again = it.next_batch().unwrap();
        assert_eq!(again.len(), 256);
        assert_eq!(it.passes(), 1);
    }

    #[test]
    fn single_host_and_bare_address() {
        let mut it = AddressIterator::new(&cidrs(&["1.1.1.1"]), true, false, 8).unwrap();
        assert_eq!(it.next_batch().unwrap(), vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(it.next_batch().unwrap(), vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn host_bits_are_truncated() {
        let net = parse_block("104.16.7.9/12").unwrap();
        assert_eq!(net.to_string(), "104.16.0.0/12");
    }

    #[test]
    fn families_alternate() {
        let mut it = AddressIterator::new(
            &cidrs(&["10.0.0.0/24", "10.1.0.0/24", "fd00::/120"]),
            true,
            true,
            6,
        )
        .unwrap();
        let batch = it.next_batch().unwrap();
        let kinds: Vec<bool> = batch.iter().map(IpAddr::is_ipv4).collect();
        assert_eq!(kinds, vec![true, false, true, true, false, true]);
    }

    #[test]
    fn huge_ipv6_block_is_usable() {
        let mut it = AddressIterator::new(&cidrs(&["::/0"]), false, true, 16).unwrap();
        let batch = it.next_batch().unwrap();
        assert_eq!(batch.len(), 16);
        assert!(batch.iter().all(IpAddr::is_ipv6));
        assert_eq!(batch.iter().collect::<HashSet<_>>().len(), 16);
    }

    #[test]
    fn overlapping_blocks_are_merged() {
        let it = AddressIterator::new(
            &cidrs(&["10.0.0.0/24", "10.0.0.128/25", "10.0.1.0/24"]),
            true,
            false,
            8,
        )
        .unwrap();
        let blocks: Vec<String> = it.blocks().map(|b| b.to_string()).collect();
        assert_eq!(blocks, vec!["10.0.0.0/23"]);
    }

    #[test]
    fn cidr_list_syntax() {
        let list = parse_cidr_list("# cloudflare\n104.16.0.0/12, 172.64.0.0/13\n\n1.1.1.1 # resolver\n");
        assert_eq!(list, vec!["104.16.0.0/12", "172.64.0.0/13", "1.1.1.1"]);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            AddressIterator::new(&[], true, true, 8).unwrap_err(),
            ConfigError::EmptyCidrList
        );
        assert!(matches!(
            AddressIterator::new(&cidrs(&["10.0.0.0/33"]), true, false, 8),
            Err(ConfigError::InvalidCidr(_))
        ));
        assert_eq!(
            AddressIterator::new(&cidrs(&["fd00::/64"]), true, false, 8).unwrap_err(),
            ConfigError::NoUsableBlocks
        );
    }
}
