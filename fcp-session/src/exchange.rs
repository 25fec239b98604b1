//! Exchange identifier allocation
//!
//! Every exchange this port originates gets an OX_ID from a bounded range.
//! Inbound frames are correlated back to their owner by OX_ID; the owner
//! type is chosen by the layer above.

use crate::error::{FcError, FcResult};
use fcp_codec::header::XID_UNKNOWN;
use fcp_core::FcId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::RangeInclusive;

/// One open exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange<O> {
    pub ox_id: u16,
    /// Responder exchange id, `XID_UNKNOWN` until the first reply
    pub rx_id: u16,
    pub s_id: FcId,
    pub d_id: FcId,
    pub owner: O,
    pub seq_id: u8,
    pub seq_cnt: u16,
}

struct Inner<O> {
    open: HashMap<u16, Exchange<O>>,
    next: u16,
}

/// OX_ID allocator and exchange registry
pub struct ExchangeManager<O> {
    min: u16,
    max: u16,
    inner: Mutex<Inner<O>>,
}

impl<O> ExchangeManager<O> {
    /// Manager handing out ids from `range`. `XID_UNKNOWN` is never used.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let min = *range.start();
        let max = (*range.end()).min(XID_UNKNOWN - 1).max(min);
        Self {
            min,
            max,
            inner: Mutex::new(Inner {
                open: HashMap::new(),
                next: min,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open an exchange and return its OX_ID.
    ///
    /// Ids are handed out round robin so a just-released id is not reused
    /// while stale frames for it may still be in flight.
    pub fn alloc(&self, s_id: FcId, d_id: FcId, owner: O) -> FcResult<u16> {
        let mut inner = self.inner.lock();
        if inner.open.len() >= self.capacity() {
            return Err(FcError::ResourceExhausted("exchange ids".into()));
        }
        let mut ox_id = inner.next;
        while inner.open.contains_key(&ox_id) {
            ox_id = self.after(ox_id);
        }
        inner.next = self.after(ox_id);
        inner.open.insert(
            ox_id,
            Exchange {
                ox_id,
                rx_id: XID_UNKNOWN,
                s_id,
                d_id,
                owner,
                seq_id: 0,
                seq_cnt: 0,
            },
        );
        Ok(ox_id)
    }

    fn after(&self, ox_id: u16) -> u16 {
        if ox_id >= self.max { self.min } else { ox_id + 1 }
    }

    pub fn contains(&self, ox_id: u16) -> bool {
        self.inner.lock().open.contains_key(&ox_id)
    }

    /// Run `f` on the exchange. `f` must not call back into this manager.
    pub fn with<R>(&self, ox_id: u16, f: impl FnOnce(&mut Exchange<O>) -> R) -> Option<R> {
        self.inner.lock().open.get_mut(&ox_id).map(f)
    }

    /// Learn the responder's RX_ID from its first reply.
    pub fn set_rx_id(&self, ox_id: u16, rx_id: u16) {
        self.with(ox_id, |x| {
            if x.rx_id == XID_UNKNOWN {
                x.rx_id = rx_id;
            }
        });
    }

    /// Sequence id and count for the next sequence we send on `ox_id`.
    pub fn next_sequence(&self, ox_id: u16) -> Option<(u8, u16)> {
        self.with(ox_id, |x| {
            let seq = (x.seq_id, x.seq_cnt);
            x.seq_id = x.seq_id.wrapping_add(1);
            x.seq_cnt = 0;
            seq
        })
    }

    pub fn release(&self, ox_id: u16) -> Option<Exchange<O>> {
        self.inner.lock().open.remove(&ox_id)
    }

    /// Release only while `pred` holds for the current owner. Protects
    /// against freeing an id that was already reused.
    pub fn release_if(&self, ox_id: u16, pred: impl FnOnce(&O) -> bool) -> Option<Exchange<O>> {
        let mut inner = self.inner.lock();
        if inner.open.get(&ox_id).is_some_and(|x| pred(&x.owner)) {
            inner.open.remove(&ox_id)
        } else {
            None
        }
    }

    /// Close every exchange, e.g. on link loss or host reset.
    pub fn drain(&self) -> Vec<Exchange<O>> {
        let mut inner = self.inner.lock();
        inner.next = self.min;
        inner.open.drain().map(|(_, x)| x).collect()
    }
}

impl<O: Clone> ExchangeManager<O> {
    pub fn owner(&self, ox_id: u16) -> Option<O> {
        self.inner.lock().open.get(&ox_id).map(|x| x.owner.clone())
    }

    pub fn get(&self, ox_id: u16) -> Option<Exchange<O>> {
        self.inner.lock().open.get(&ox_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn ids() -> (FcId, FcId) {
        (FcId::new(0x010001).unwrap(), FcId::new(0x020002).unwrap())
    }

    #[test]
    fn test_alloc_round_robin() {
        let (s, d) = ids();
        let xm = ExchangeManager::new(1..=3);
        assert_eq!(xm.alloc(s, d, 'a').unwrap(), 1);
        assert_eq!(xm.alloc(s, d, 'b').unwrap(), 2);
        xm.release(1);
        assert_eq!(xm.alloc(s, d, 'c').unwrap(), 3);
        assert_eq!(xm.alloc(s, d, 'd').unwrap(), 1);
        assert!(matches!(
            xm.alloc(s, d, 'e'),
            Err(FcError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_rx_id_learned_once() {
        let (s, d) = ids();
        let xm = ExchangeManager::new(0x10..=0x20);
        let ox = xm.alloc(s, d, ()).unwrap();
        assert_eq!(xm.get(ox).unwrap().rx_id, XID_UNKNOWN);
        xm.set_rx_id(ox, 0x1234);
        xm.set_rx_id(ox, 0x5678);
        assert_eq!(xm.get(ox).unwrap().rx_id, 0x1234);
    }

    #[test]
    fn test_next_sequence_advances() {
        let (s, d) = ids();
        let xm = ExchangeManager::new(1..=8);
        let ox = xm.alloc(s, d, ()).unwrap();
        assert_eq!(xm.next_sequence(ox), Some((0, 0)));
        assert_eq!(xm.next_sequence(ox), Some((1, 0)));
        assert_eq!(xm.next_sequence(0x7), None);
    }

    #[test]
    fn test_release_if_checks_owner() {
        let (s, d) = ids();
        let xm = ExchangeManager::new(1..=8);
        let ox = xm.alloc(s, d, 7u32).unwrap();
        assert!(xm.release_if(ox, |o| *o == 8).is_none());
        assert!(xm.contains(ox));
        assert_eq!(xm.release_if(ox, |o| *o == 7).unwrap().owner, 7);
        assert!(xm.is_empty());
    }

    #[test]
    fn test_unknown_xid_excluded() {
        let xm: ExchangeManager<()> = ExchangeManager::new(0xFFF0..=0xFFFF);
        assert_eq!(xm.capacity(), 15);
    }

    proptest! {
        #[test]
        fn prop_open_ids_unique(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let (s, d) = ids();
            let xm = ExchangeManager::new(1..=16);
            let mut open: Vec<u16> = Vec::new();
            for alloc in ops {
                if alloc {
                    match xm.alloc(s, d, ()) {
                        Ok(ox) => {
                            prop_assert!((1..=16).contains(&ox));
                            prop_assert!(!open.contains(&ox));
                            open.push(ox);
                        }
                        Err(_) => prop_assert_eq!(open.len(), 16),
                    }
                } else if let Some(ox) = open.pop() {
                    prop_assert!(xm.release(ox).is_some());
                }
            }
            let unique: HashSet<_> = open.iter().collect();
            prop_assert_eq!(unique.len(), xm.len());
        }
    }
}
