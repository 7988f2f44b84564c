//! Weighted probability distribution
//!
//! Implements a weighted probability distribution suitable for protocol
//! parameterization (frame lengths, inter-arrival delays).  The drbg module
//! is the random number source throughout, so a given seed reproduces both
//! the distribution tables and the sampled sequence on either peer.

use crate::common::drbg;

use std::cmp::{max, min};
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::{seq::SliceRandom, Rng};

const MIN_VALUES: i32 = 1;
const MAX_VALUES: i32 = 100;

/// A weighted distribution of integer values.
#[derive(Clone)]
pub struct WeightedDist(Arc<Mutex<InnerWeightedDist>>);

struct InnerWeightedDist {
    min_value: i32,
    max_value: i32,
    biased: bool,

    values: Vec<i32>,
    weights: Vec<f64>,

    alias: Vec<usize>,
    prob: Vec<f64>,

    drbg: drbg::Drbg,
}

impl WeightedDist {
    /// Creates a weighted distribution of values ranging from min to max
    /// based on a hash drbg initialized with seed.  Optionally, bias the
    /// weight generation to match the ScrambleSuit non-uniform distribution
    /// from obfsproxy.
    pub fn new(seed: drbg::Seed, min: i32, max: i32, biased: bool) -> Self {
        let w = WeightedDist(Arc::new(Mutex::new(InnerWeightedDist {
            min_value: min,
            max_value: max,
            biased,
            values: vec![],
            weights: vec![],
            alias: vec![],
            prob: vec![],
            // Seed length is fixed, construction cannot fail.
            drbg: drbg::Drbg::new(Some(seed.clone())).unwrap(),
        })));
        w.reseed(seed);

        w
    }

    /// Generates a random value according to the generated distribution.
    pub fn sample(&self) -> i32 {
        let mut dist = self.0.lock().unwrap();

        // Generate a fair die roll from an $n$-sided die; call the side $i$.
        let n = dist.values.len();
        let i = (dist.drbg.uint64() as usize) % n;

        // Flip a coin that comes up heads with probability $prob[i]$.
        let f = (dist.drbg.uint64() >> 11) as f64 / (1u64 << 53) as f64;
        if f < dist.prob[i] {
            // if the coin comes up "heads", use $i$.
            dist.min_value + dist.values[i]
        } else {
            // otherwise use $alias[i]$.
            dist.min_value + dist.values[dist.alias[i]]
        }
    }

    /// Generates a new distribution with the same min/max based on a new seed.
    pub fn reseed(&self, seed: drbg::Seed) {
        let mut dist = self.0.lock().unwrap();
        dist.drbg = drbg::Drbg::new(Some(seed)).unwrap();

        let mut table_rng = {
            let mut seed_block = [0u8; drbg::SEED_LENGTH];
            for chunk in seed_block.chunks_mut(drbg::SIZE) {
                let block = dist.drbg.next_block();
                chunk.copy_from_slice(&block[..chunk.len()]);
            }
            drbg::Drbg::new(Some(drbg::Seed::from(seed_block))).unwrap()
        };

        dist.gen_values(&mut table_rng);
        if dist.biased {
            dist.gen_biased_weights(&mut table_rng);
        } else {
            dist.gen_uniform_weights(&mut table_rng);
        }
        dist.gen_tables();
    }
}

impl InnerWeightedDist {
    // Creates a slice containing a random number of random values that, when
    // scaled by adding self.min_value, will fall into [min, max].
    fn gen_values<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut n_values = self.max_value - self.min_value;

        let mut values: Vec<i32> = (0..=n_values).collect();
        values.shuffle(rng);
        n_values = max(n_values, MIN_VALUES);
        n_values = min(n_values, MAX_VALUES);

        let n_values = rng.gen_range(1..=n_values) as usize;
        self.values = values[..n_values].to_vec();
    }

    // Generates a non-uniform weight list, similar to the ScrambleSuit
    // prob_dist mode.
    fn gen_biased_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.weights = vec![0_f64; self.values.len()];

        let mut cumul_prob: f64 = 0.0;
        for i in 0..self.weights.len() {
            self.weights[i] = (1.0 - cumul_prob) * rng.gen::<f64>();
            cumul_prob += self.weights[i];
        }
    }

    // Generates a uniform weight list.
    fn gen_uniform_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.weights = vec![0_f64; self.values.len()];

        for i in 0..self.weights.len() {
            self.weights[i] = rng.gen();
        }
    }

    // Calculates the alias and prob tables used for Vose's alias method.
    // Algorithm taken from http://www.keithschwarz.com/darts-dice-coins/
    fn gen_tables(&mut self) {
        let n = self.weights.len();
        let sum: f64 = self.weights.iter().sum();

        let mut alias = vec![0_usize; n];
        let mut prob = vec![0_f64; n];

        // multiply each probability by $n$.
        let mut scaled: Vec<f64> = self.weights.iter().map(|f| f * (n as f64) / sum).collect();
        let mut small: Vec<usize> = scaled
            .iter()
            .enumerate()
            .filter(|(_, f)| **f < 1.0)
            .map(|(i, _)| i)
            .collect();
        let mut large: Vec<usize> = scaled
            .iter()
            .enumerate()
            .filter(|(_, f)| **f >= 1.0)
            .map(|(i, _)| i)
            .collect();

        // While $small$ and $large$ are not empty: ($large$ might be emptied first)
        // remove the first element from $small$ and call it $l$.
        // remove the first element from $large$ and call it $g$.
        // set $prob[l] = p_l$, $alias[l] = g$,
        // $p_g = (p_g + p_l) - 1$ (the numerically stable option),
        // then re-file $g$ by its new weight.
        while !small.is_empty() && !large.is_empty() {
            let l = small.remove(0);
            let g = large.remove(0);

            prob[l] = scaled[l];
            alias[l] = g;

            scaled[g] = scaled[g] + scaled[l] - 1.0;
            if scaled[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }

        while !large.is_empty() {
            prob[large.remove(0)] = 1.0;
        }
        while !small.is_empty() {
            prob[small.remove(0)] = 1.0;
        }

        self.prob = prob;
        self.alias = alias;
    }
}

impl fmt::Display for WeightedDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dist = self.0.lock().unwrap();
        let mut buf: String = "[ ".into();
        for (i, v) in dist.values.iter().enumerate() {
            let p = dist.weights[i];
            if p > 0.01 {
                buf.push_str(&format!("{v}: {p}, "));
            }
        }
        buf.push(']');
        write!(f, "{buf}")
    }
}
