use crate::record::ContentionRecord;

/// One sinusoidal component of the system hotness series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HotnessComponent {
    pub amplitude: f64,
    pub frequency: f64,
}

/// System hotness modelled as `F(x) = Σ Aᵢ·sin(ωᵢ·x)` over hot locks.
///
/// `Aᵢ` is a lock's normalized blocked ratio and `ωᵢ` the ownership frequency
/// of its main owner (1 when the lock has no owner on record).
#[derive(Debug, Clone, Default)]
pub struct LockHotnessWave {
    components: Vec<HotnessComponent>,
}

impl LockHotnessWave {
    /// Records without hot-lock stats contribute nothing
    pub fn from_records(records: &[ContentionRecord]) -> Self {
        let components = records
            .iter()
            .filter_map(|record| {
                let hot = record.hot.as_ref()?;
                let frequency = record
                    .main_owner_id
                    .and_then(|owner| record.ownership_frequency.get(&owner))
                    .copied()
                    .unwrap_or(1);
                Some(HotnessComponent {
                    amplitude: hot.normalized_blocked_ratio,
                    frequency: f64::from(frequency),
                })
            })
            .collect();
        Self { components }
    }

    pub fn from_components(components: Vec<HotnessComponent>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[HotnessComponent] {
        &self.components
    }

    pub fn hotness_at(&self, x: f64) -> f64 {
        self.components
            .iter()
            .map(|c| c.amplitude * (c.frequency * x).sin())
            .sum()
    }

    pub fn max(&self, xs: &[f64]) -> f64 {
        xs.iter()
            .map(|x| self.hotness_at(*x))
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    pub fn average(&self, xs: &[f64]) -> f64 {
        if xs.is_empty() {
            return 0.0;
        }
        xs.iter().map(|x| self.hotness_at(*x)).sum::<f64>() / xs.len() as f64
    }

    pub fn variance(&self, xs: &[f64]) -> f64 {
        if xs.is_empty() {
            return 0.0;
        }
        let mean = self.average(xs);
        xs.iter()
            .map(|x| (self.hotness_at(*x) - mean).powi(2))
            .sum::<f64>()
            / xs.len() as f64
    }

    /// Longest run of consecutive points strictly above `threshold`
    pub fn hot_streak(&self, xs: &[f64], threshold: f64) -> usize {
        let mut longest = 0;
        let mut current = 0;
        for x in xs {
            if self.hotness_at(*x) > threshold {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }
        longest
    }
}
