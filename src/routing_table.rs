// src/routing_table.rs
//
// k-buckets plus replacement caches, keyed by XOR distance to the local
// NodeId. Mirrors the bucket-walk algorithm of the original routing table
// (`update_peer` / `forget_peer` / `find_closest_peers`), generalized from
// the teacher's single-sorted-list `RoutingTable::find_closest` into the
// exact zigzag bucket traversal the distilled spec mandates.

use crate::id::{NodeId, ID_BITS};
use std::collections::VecDeque;
use std::net::SocketAddr;

#[derive(Clone, Debug)]
struct Entry {
    id: NodeId,
    addr: SocketAddr,
}

/// An ordered list of at most `capacity` peers, least-recently-seen at the
/// front, most-recently-seen at the back.
#[derive(Clone, Debug, Default)]
struct Bucket {
    entries: VecDeque<Entry>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    fn touch_or_insert(&mut self, id: NodeId, addr: SocketAddr, capacity: usize) -> bool {
        if let Some(pos) = self.position(&id) {
            self.entries.remove(pos);
            self.entries.push_back(Entry { id, addr });
            return true;
        }
        if self.entries.len() < capacity {
            self.entries.push_back(Entry { id, addr });
            return true;
        }
        false
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.position(id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Newest-first, matching `reversed(OrderedDict)` in the original.
    fn newest_first(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().rev()
    }
}

pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
    replacement: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        RoutingTable {
            local_id,
            k,
            buckets: (0..ID_BITS).map(|_| Bucket::default()).collect(),
            replacement: (0..ID_BITS).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Move-to-tail on re-contact; append to bucket if room; else stash in
    /// the replacement cache (also move-to-tail there if already present).
    pub fn update_peer(&mut self, id: NodeId, addr: SocketAddr) {
        let Some(idx) = self.local_id.bucket_index(&id) else {
            return;
        };
        if self.buckets[idx].touch_or_insert(id, addr, self.k) {
            return;
        }
        let _ = self.replacement[idx].touch_or_insert(id, addr, self.k);
    }

    /// Remove a peer; if its bucket now has room, promote the newest
    /// replacement-cache entry (LIFO, matching `popitem()` in the original).
    pub fn forget_peer(&mut self, id: &NodeId) {
        let Some(idx) = self.local_id.bucket_index(id) else {
            return;
        };
        if !self.buckets[idx].remove(id) {
            self.replacement[idx].remove(id);
            return;
        }
        if let Some(promoted) = self.replacement[idx].entries.pop_back() {
            self.buckets[idx].entries.push_back(promoted);
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        match self.local_id.bucket_index(id) {
            Some(idx) => self.buckets[idx].position(id).is_some(),
            None => false,
        }
    }

    pub fn address_of(&self, id: &NodeId) -> Option<SocketAddr> {
        let idx = self.local_id.bucket_index(id)?;
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.addr)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// All known peers, used for broadcast flooding.
    pub fn all_peers(&self) -> Vec<(NodeId, SocketAddr)> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| (e.id, e.addr)))
            .collect()
    }

    /// Up to `k` peers closest to `key`, walking buckets starting at
    /// `bucket_index(key)` and alternating farther/closer, emitting each
    /// visited bucket newest-first. `excluding`, if set, is never returned.
    pub fn find_closest_peers(
        &self,
        key: &NodeId,
        excluding: Option<&NodeId>,
        k: usize,
    ) -> Vec<(NodeId, SocketAddr)> {
        let mut out = Vec::with_capacity(k);
        let start = match self.local_id.bucket_index(key) {
            Some(idx) => idx as isize,
            None => 0,
        };

        let push_bucket = |idx: isize, out: &mut Vec<(NodeId, SocketAddr)>| {
            if idx < 0 || idx as usize >= self.buckets.len() {
                return;
            }
            for entry in self.buckets[idx as usize].newest_first() {
                if Some(&entry.id) == excluding {
                    continue;
                }
                if out.len() >= k {
                    return;
                }
                out.push((entry.id, entry.addr));
            }
        };

        push_bucket(start, &mut out);
        let mut farther = start - 1;
        let mut closer = start + 1;
        while out.len() < k && (farther >= 0 || (closer as usize) < self.buckets.len()) {
            if farther >= 0 {
                push_bucket(farther, &mut out);
                farther -= 1;
            }
            if out.len() >= k {
                break;
            }
            if (closer as usize) < self.buckets.len() {
                push_bucket(closer, &mut out);
                closer += 1;
            }
        }
        out.truncate(k);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn update_then_contains() {
        let local = NodeId::random();
        let mut rt = RoutingTable::new(local, 20);
        let peer = NodeId::random();
        rt.update_peer(peer, addr(1));
        assert!(rt.contains(&peer));
    }

    #[test]
    fn bucket_overflow_goes_to_replacement_cache() {
        let local = NodeId::zero();
        let mut rt = RoutingTable::new(local, 20);
        // 21 peers that all land in bucket 0 (top bit set => maximal XOR
        // distance from zero, regardless of how the lower bits vary).
        let mut ids = Vec::new();
        for i in 0..21u32 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80; // top bit set => bucket_index = 0 regardless of lower bits
            bytes[19] = i as u8;
            ids.push(NodeId(bytes));
        }
        for (i, id) in ids.iter().enumerate() {
            rt.update_peer(*id, addr(i as u16));
        }
        let idx = local.bucket_index(&ids[0]).unwrap();
        assert_eq!(idx, 0);
        for id in &ids[..20] {
            assert!(rt.contains(id));
        }
        assert!(!rt.contains(&ids[20]));

        // forgetting a bucket member promotes the cached 21st peer
        rt.forget_peer(&ids[0]);
        assert!(rt.contains(&ids[20]));
    }

    #[test]
    fn find_closest_peers_respects_k_and_excludes() {
        let local = NodeId::zero();
        let mut rt = RoutingTable::new(local, 20);
        let mut ids = Vec::new();
        for i in 0..10u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = 1 << (i % 8);
            bytes[18] = i;
            ids.push(NodeId(bytes));
        }
        for (i, id) in ids.iter().enumerate() {
            rt.update_peer(*id, addr(i as u16));
        }
        let closest = rt.find_closest_peers(&local, Some(&ids[0]), 5);
        assert_eq!(closest.len(), 5);
        assert!(closest.iter().all(|(id, _)| id != &ids[0]));
    }
}
