use crate::error::{Result, SimError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default bit-error probability
pub const DEFAULT_BIT_ERROR_PROBABILITY: f64 = 0.10;

/// Bernoulli gate deciding whether an otherwise clean transmission or
/// reception is treated as a detected bit error.
///
/// Each node owns its gate, so a seeded gate yields the same error pattern
/// for the same sequence of frames.
#[derive(Debug, Clone)]
pub struct BitErrorGate {
    probability: f64,
    rng: StdRng,
}

impl BitErrorGate {
    /// Create a gate; `seed = None` draws the seed from OS entropy
    pub fn new(probability: f64, seed: Option<u64>) -> Result<Self> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(SimError::InvalidConfig(format!(
                "bit error probability {} outside [0, 1]",
                probability
            )));
        }

        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self { probability, rng })
    }

    /// Gate that never fires
    pub fn disabled() -> Self {
        Self {
            probability: 0.0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Draw once; true means "treat this frame as corrupted"
    pub fn trip(&mut self) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        self.rng.gen_bool(self.probability)
    }
}

impl Default for BitErrorGate {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_gate_never_fires() {
        let mut gate = BitErrorGate::disabled();
        assert!((0..1000).all(|_| !gate.trip()));
    }

    #[test]
    fn test_certain_gate_always_fires() {
        let mut gate = BitErrorGate::new(1.0, Some(7)).unwrap();
        assert!((0..100).all(|_| gate.trip()));
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = BitErrorGate::new(0.1, Some(42)).unwrap();
        let mut b = BitErrorGate::new(0.1, Some(42)).unwrap();

        let seq_a: Vec<bool> = (0..200).map(|_| a.trip()).collect();
        let seq_b: Vec<bool> = (0..200).map(|_| b.trip()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_rate_roughly_matches_probability() {
        let mut gate = BitErrorGate::new(DEFAULT_BIT_ERROR_PROBABILITY, Some(12345)).unwrap();
        let hits = (0..10_000).filter(|_| gate.trip()).count();
        assert!(hits > 800 && hits < 1200, "unexpected hit count {}", hits);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        assert!(BitErrorGate::new(1.5, None).is_err());
        assert!(BitErrorGate::new(-0.1, None).is_err());
    }
}
