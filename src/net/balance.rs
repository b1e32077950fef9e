//! Weighted-random pool used to spread NAT discovery probes across STUN
//! servers and to steer subsequent probes away from servers that answered
//! badly.

use std::sync::Mutex;

use rand::Rng;

const INITIAL_WEIGHT: u32 = 10;
const MAX_WEIGHT: u32 = 100;

#[derive(Debug)]
struct Entry<T> {
    item: T,
    weight: u32,
}

/// A load-balanced pool: `next` draws an entry with probability proportional
/// to its weight, `down` halves a misbehaving entry's weight, `up` restores
/// a healthy one. A weight never reaches zero, so every entry stays
/// reachable.
#[derive(Debug)]
pub struct Balanced<T> {
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T: Clone> Balanced<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            entries: Mutex::new(
                items
                    .into_iter()
                    .map(|item| Entry {
                        item,
                        weight: INITIAL_WEIGHT,
                    })
                    .collect(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("balancer lock poisoned").is_empty()
    }

    /// Draw the next entry. Returns the item and its index for later
    /// `up`/`down` feedback. `None` when the pool is empty.
    pub fn next(&self) -> Option<(T, usize)> {
        let entries = self.entries.lock().expect("balancer lock poisoned");
        if entries.is_empty() {
            return None;
        }
        let total: u64 = entries.iter().map(|e| e.weight as u64).sum();
        let mut point = rand::thread_rng().gen_range(0..total);
        for (idx, entry) in entries.iter().enumerate() {
            if point < entry.weight as u64 {
                return Some((entry.item.clone(), idx));
            }
            point -= entry.weight as u64;
        }
        unreachable!("weighted point always lands inside the pool")
    }

    /// Mark the entry at `idx` as misbehaving.
    pub fn down(&self, idx: usize) {
        let mut entries = self.entries.lock().expect("balancer lock poisoned");
        if let Some(entry) = entries.get_mut(idx) {
            entry.weight = (entry.weight / 2).max(1);
        }
    }

    /// Mark the entry at `idx` as healthy.
    pub fn up(&self, idx: usize) {
        let mut entries = self.entries.lock().expect("balancer lock poisoned");
        if let Some(entry) = entries.get_mut(idx) {
            entry.weight = (entry.weight * 2).min(MAX_WEIGHT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_yields_nothing() {
        let pool: Balanced<String> = Balanced::new(Vec::new());
        assert!(pool.is_empty());
        assert!(pool.next().is_none());
    }

    #[test]
    fn single_entry_always_drawn() {
        let pool = Balanced::new(vec!["only"]);
        for _ in 0..10 {
            let (item, idx) = pool.next().unwrap();
            assert_eq!(item, "only");
            assert_eq!(idx, 0);
        }
    }

    #[test]
    fn down_keeps_entry_reachable() {
        let pool = Balanced::new(vec!["a", "b"]);
        for _ in 0..20 {
            pool.down(0);
        }
        // Weight bottoms out at one; "a" must still appear eventually.
        let mut seen_a = false;
        for _ in 0..500 {
            if pool.next().unwrap().0 == "a" {
                seen_a = true;
                break;
            }
        }
        assert!(seen_a);
    }

    #[test]
    fn down_skews_distribution() {
        let pool = Balanced::new(vec!["bad", "good"]);
        for _ in 0..20 {
            pool.down(0);
            pool.up(1);
        }
        let mut bad = 0;
        for _ in 0..1000 {
            if pool.next().unwrap().0 == "bad" {
                bad += 1;
            }
        }
        assert!(bad < 200, "downed entry drawn {bad}/1000 times");
    }
}
