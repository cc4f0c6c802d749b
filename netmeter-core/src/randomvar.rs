// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Random-variable generators for frame size/rate and on/off event timing,
//! per spec.md §4.5.1 and §9. Each variant carries a fixed 4-element
//! parameter array on the wire (`ValueArray[4 network doubles]`) so the
//! discriminant plus that array round-trips regardless of how many of the
//! four slots a given kind actually uses.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::Rng;
use rand_distr::{Distribution, Normal as NormalDist, Pareto as ParetoDist};

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GeneratorKind {
    Constant = 0,
    Uniform = 1,
    Exponential = 2,
    Pareto = 3,
    Normal = 4,
    TruncatedNormal = 5,
}

/// A drawable random variable: a generator kind plus its parameter array.
/// `values` is always stored as 4 slots on the wire; only a prefix is
/// meaningful for most kinds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RandomVariable {
    pub kind: GeneratorKind,
    pub values: [f64; 4],
}

impl RandomVariable {
    pub fn constant(value: f64) -> Self {
        Self {
            kind: GeneratorKind::Constant,
            values: [value, 0.0, 0.0, 0.0],
        }
    }

    pub fn uniform(lo: f64, hi: f64) -> Self {
        Self {
            kind: GeneratorKind::Uniform,
            values: [lo, hi, 0.0, 0.0],
        }
    }

    pub fn exponential(mean: f64) -> Self {
        Self {
            kind: GeneratorKind::Exponential,
            values: [mean, 0.0, 0.0, 0.0],
        }
    }

    pub fn pareto(location: f64, shape: f64) -> Self {
        Self {
            kind: GeneratorKind::Pareto,
            values: [location, shape, 0.0, 0.0],
        }
    }

    pub fn normal(mean: f64, stddev: f64) -> Self {
        Self {
            kind: GeneratorKind::Normal,
            values: [mean, stddev, 0.0, 0.0],
        }
    }

    pub fn truncated_normal(mean: f64, stddev: f64) -> Self {
        Self {
            kind: GeneratorKind::TruncatedNormal,
            values: [mean, stddev, 0.0, 0.0],
        }
    }

    /// `true` if this generator is "no traffic" (a size/rate generator whose
    /// draws are always zero), used by the sender to detect a disabled
    /// direction per spec.md §4.5.2.
    pub fn is_zero_constant(&self) -> bool {
        matches!(self.kind, GeneratorKind::Constant) && self.values[0] <= f64::EPSILON
    }

    /// Draws one sample using `rng`. Never panics on degenerate parameters;
    /// Exponential in particular must avoid `log(0)`.
    pub fn draw(&self, rng: &mut impl Rng) -> f64 {
        match self.kind {
            GeneratorKind::Constant => self.values[0],
            GeneratorKind::Uniform => {
                let (lo, hi) = (self.values[0], self.values[1]);
                if hi <= lo {
                    lo
                } else {
                    rng.gen_range(lo..hi)
                }
            }
            GeneratorKind::Exponential => {
                let mean = self.values[0].max(f64::EPSILON);
                // avoid log(0): gen_range is [0,1), exclude the 0 endpoint
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                -mean * u.ln()
            }
            GeneratorKind::Pareto => {
                let location = self.values[0].max(f64::EPSILON);
                let shape = self.values[1].max(f64::EPSILON);
                ParetoDist::new(location, shape)
                    .map(|d| d.sample(rng))
                    .unwrap_or(location)
            }
            GeneratorKind::Normal => {
                let (mean, stddev) = (self.values[0], self.values[1].max(0.0));
                NormalDist::new(mean, stddev.max(f64::EPSILON))
                    .map(|d| d.sample(rng))
                    .unwrap_or(mean)
            }
            GeneratorKind::TruncatedNormal => {
                let (mean, stddev) = (self.values[0], self.values[1].max(0.0));
                let dist = NormalDist::new(mean, stddev.max(f64::EPSILON));
                match dist {
                    Ok(dist) => loop {
                        let v = dist.sample(rng);
                        if v >= 0.0 {
                            return v;
                        }
                    },
                    Err(_) => mean.max(0.0),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_always_draws_its_value() {
        let rv = RandomVariable::constant(42.0);
        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            assert_eq!(rv.draw(&mut rng), 42.0);
        }
    }

    #[test]
    fn uniform_draws_within_bounds() {
        let rv = RandomVariable::uniform(10.0, 20.0);
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let v = rv.draw(&mut rng);
            assert!((10.0..20.0).contains(&v));
        }
    }

    #[test]
    fn exponential_never_produces_nan() {
        let rv = RandomVariable::exponential(5.0);
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            assert!(rv.draw(&mut rng).is_finite());
        }
    }

    #[test]
    fn truncated_normal_never_negative() {
        let rv = RandomVariable::truncated_normal(0.0, 10.0);
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            assert!(rv.draw(&mut rng) >= 0.0);
        }
    }
}
