// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A shared, injectable source of randomness.
///
/// Every component that shuffles hosts or jitters a delay draws from the
/// `RandomSource` it was constructed with, so a seeded source makes host
/// ordering reproducible in tests.
#[derive(Clone)]
pub struct RandomSource(Arc<Mutex<StdRng>>);

impl RandomSource {
    pub fn new() -> Self {
        RandomSource(Arc::new(Mutex::new(StdRng::from_entropy())))
    }

    pub fn seeded(seed: u64) -> Self {
        RandomSource(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))))
    }

    /// A uniformly distributed value in `[low, high)`.
    pub fn gen_range(&self, low: u64, high: u64) -> u64 {
        if low >= high {
            return low;
        }
        self.rng().gen_range(low, high)
    }

    pub fn gen_bool(&self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.rng().gen_bool(p)
    }

    /// A value in `[0, 1)`.
    pub fn gen_f64(&self) -> f64 {
        self.rng().gen::<f64>()
    }

    pub fn shuffle<T: ShuffleCollection>(&self, items: &mut T) {
        shuffle(items, &mut *self.rng());
    }

    fn rng(&self) -> MutexGuard<StdRng> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RandomSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RandomSource")
    }
}

pub trait ShuffleCollection {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn swap(&mut self, i: usize, j: usize);
}

impl<T> ShuffleCollection for Vec<T> {
    fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
    fn len(&self) -> usize {
        self.as_slice().len()
    }
    fn swap(&mut self, i: usize, j: usize) {
        self.as_mut_slice().swap(i, j)
    }
}

impl<T> ShuffleCollection for VecDeque<T> {
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn len(&self) -> usize {
        VecDeque::len(self)
    }
    fn swap(&mut self, i: usize, j: usize) {
        VecDeque::swap(self, i, j)
    }
}

/// Fisher-Yates shuffle
pub fn shuffle<T, R>(items: &mut T, rng: &mut R)
where
    T: ShuffleCollection,
    R: Rng,
{
    let mut i = items.len();
    while i > 1 {
        i -= 1;
        let new_idx = rng.gen_range(0, i + 1);
        items.swap(i, new_idx);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, TestResult};

    #[test]
    fn seeded_sources_repeat() {
        let a = RandomSource::seeded(7);
        let b = RandomSource::seeded(7);
        let mut x: Vec<u32> = (0..20).collect();
        let mut y = x.clone();
        a.shuffle(&mut x);
        b.shuffle(&mut y);
        assert_eq!(x, y);
        assert_eq!(a.gen_range(0, 1000), b.gen_range(0, 1000));
    }

    #[test]
    fn degenerate_ranges() {
        let r = RandomSource::seeded(1);
        assert_eq!(r.gen_range(5, 5), 5);
        assert!(!r.gen_bool(0.0));
        assert!(r.gen_bool(1.0));
    }

    quickcheck! {
        fn prop_shuffle_is_a_permutation(items: Vec<u16>, seed: u64) -> TestResult {
            let mut shuffled = items.clone();
            RandomSource::seeded(seed).shuffle(&mut shuffled);

            let mut a = items;
            let mut b = shuffled;
            a.sort();
            b.sort();
            TestResult::from_bool(a == b)
        }
    }
}
