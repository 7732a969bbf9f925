use std::collections::BTreeMap;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

use crate::error::BucketError;

/// Static bucket configuration: default weight per resource and the draw
/// count that triggers a reset.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketConfig {
    defaults: BTreeMap<String, f64>,
    reset_threshold: u32,
}

impl BucketConfig {
    pub fn new(defaults: BTreeMap<String, f64>, reset_threshold: u32) -> Result<Self, BucketError> {
        if defaults.is_empty() {
            return Err(BucketError::Misconfigured("no resources configured".into()));
        }
        if reset_threshold == 0 {
            return Err(BucketError::Misconfigured("reset threshold must be at least 1".into()));
        }
        if let Some((id, w)) = defaults.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(BucketError::Misconfigured(format!("invalid weight {w} for {id}")));
        }
        if defaults.values().all(|w| *w <= 0.0) {
            return Err(BucketError::Misconfigured("all default weights are zero".into()));
        }
        Ok(Self {
            defaults,
            reset_threshold,
        })
    }

    /// Parses `A=9,B=9,C=2`.
    pub fn parse(raw: &str, reset_threshold: u32) -> Result<Self, BucketError> {
        let mut defaults = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (id, w) = pair
                .split_once('=')
                .ok_or_else(|| BucketError::Misconfigured(format!("expected id=weight in {pair:?}")))?;
            let w: f64 = w
                .trim()
                .parse()
                .map_err(|_| BucketError::Misconfigured(format!("bad weight in {pair:?}")))?;
            defaults.insert(id.trim().to_string(), w);
        }
        Self::new(defaults, reset_threshold)
    }

    pub fn defaults(&self) -> &BTreeMap<String, f64> {
        &self.defaults
    }

    pub fn reset_threshold(&self) -> u32 {
        self.reset_threshold
    }
}

/// Live lottery state, persisted as one versioned document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub weights: BTreeMap<String, f64>,
    /// Draws since the last reset.
    pub draws: u32,
    /// Bumped on every write; used for compare-and-swap.
    pub version: i64,
}

/// Result of one draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draw {
    pub resource_id: String,
    /// This draw reached the threshold and restored the defaults.
    pub reset: bool,
    /// Every weight was zero before the draw, so the defaults were restored
    /// first.
    pub forced_reset: bool,
}

impl BucketState {
    pub fn fresh(cfg: &BucketConfig) -> Self {
        Self {
            weights: cfg.defaults.clone(),
            draws: 0,
            version: 0,
        }
    }

    pub fn reset(&mut self, cfg: &BucketConfig) {
        self.weights = cfg.defaults.clone();
        self.draws = 0;
    }

    /// Whether the persisted resources still match the configuration.
    pub fn matches(&self, cfg: &BucketConfig) -> bool {
        self.weights.keys().eq(cfg.defaults.keys())
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Draws one resource with probability proportional to its remaining
    /// weight, then takes one ticket from it. The threshold reset happens in
    /// the same step, so the state left behind is always current.
    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R, cfg: &BucketConfig) -> Result<Draw, BucketError> {
        let forced_reset = self.total_weight() <= 0.0;
        if forced_reset {
            self.reset(cfg);
        }

        let ids: Vec<&String> = self.weights.keys().collect();
        let dist = WeightedIndex::new(self.weights.values().copied()).map_err(|_| BucketError::Empty)?;
        let resource_id = ids[dist.sample(rng)].clone();

        if let Some(w) = self.weights.get_mut(&resource_id) {
            *w = (*w - 1.0).max(0.0);
        }
        self.draws += 1;

        let reset = self.draws >= cfg.reset_threshold;
        if reset {
            self.reset(cfg);
        }

        Ok(Draw {
            resource_id,
            reset,
            forced_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cfg() -> BucketConfig {
        BucketConfig::parse("A=9,B=9,C=2", 20).unwrap()
    }

    #[test]
    fn parse_and_validate() {
        let c = cfg();
        assert_eq!(c.defaults().len(), 3);
        assert_eq!(c.defaults()["C"], 2.0);

        assert!(BucketConfig::parse("", 20).is_err());
        assert!(BucketConfig::parse("A=0,B=0", 20).is_err());
        assert!(BucketConfig::parse("A=-1", 20).is_err());
        assert!(BucketConfig::parse("A=x", 20).is_err());
        assert!(BucketConfig::parse("A=1", 0).is_err());
    }

    #[test]
    fn draw_decrements_by_one_and_floors_at_zero() {
        let c = BucketConfig::parse("A=0.5,B=0", 10).unwrap();
        let mut s = BucketState::fresh(&c);
        let mut rng = StdRng::seed_from_u64(7);

        let d = s.draw(&mut rng, &c).unwrap();
        assert_eq!(d.resource_id, "A");
        assert_eq!(s.weights["A"], 0.0);
        assert_eq!(s.draws, 1);

        // Everything is exhausted before the threshold: restore, then draw.
        let d = s.draw(&mut rng, &c).unwrap();
        assert!(d.forced_reset);
        assert_eq!(d.resource_id, "A");
        assert_eq!(s.draws, 1);
    }

    #[test]
    fn threshold_draw_leaves_defaults_behind() {
        let c = cfg();
        let mut s = BucketState::fresh(&c);
        let mut rng = StdRng::seed_from_u64(42);

        for i in 1..=20 {
            let d = s.draw(&mut rng, &c).unwrap();
            assert_eq!(d.reset, i == 20);
        }
        assert_eq!(s.draws, 0);
        assert_eq!(&s.weights, c.defaults());
    }

    #[test]
    fn frequencies_track_weights_without_resets() {
        // Threshold beyond the run and weights large enough never to deplete.
        let c = BucketConfig::parse("A=90000,B=90000,C=20000", u32::MAX).unwrap();
        let mut s = BucketState::fresh(&c);
        let mut rng = StdRng::seed_from_u64(1);

        let n = 20_000;
        let mut hits = BTreeMap::<String, u32>::new();
        for _ in 0..n {
            *hits.entry(s.draw(&mut rng, &c).unwrap().resource_id).or_default() += 1;
        }

        let share = |id: &str| f64::from(hits[id]) / f64::from(n);
        assert!((share("A") - 0.45).abs() < 0.02);
        assert!((share("B") - 0.45).abs() < 0.02);
        assert!((share("C") - 0.10).abs() < 0.02);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn weights_stay_in_bounds(seed in any::<u64>(), draws in 1usize..60) {
            let c = cfg();
            let mut s = BucketState::fresh(&c);
            let mut rng = StdRng::seed_from_u64(seed);

            for _ in 0..draws {
                s.draw(&mut rng, &c).unwrap();
                prop_assert!(s.draws < c.reset_threshold());
                for (id, w) in &s.weights {
                    prop_assert!(*w >= 0.0 && *w <= c.defaults()[id]);
                }
            }
            prop_assert_eq!(usize::try_from(s.draws).unwrap(), draws % 20);
        }
    }
}
