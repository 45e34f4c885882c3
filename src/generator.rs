//! Seeded uniform fill of the input matrices and the post-fill range check.
use crate::backend::{Backend, DeviceMatrix};
use crate::error::Result;
use half::f16;
use log::{debug, error};

/// Fixed so that inputs are identical from run to run.
pub const DEFAULT_SEED: u64 = 1234;

pub const LOWER_BOUND: f32 = -1.0;
pub const UPPER_BOUND: f32 = 1.0;

/// Populates `matrix` with values uniform in [-1, 1]. The same seed yields
/// the same contents on the same backend.
pub fn fill<B: Backend>(backend: &B, matrix: &mut B::Matrix, seed: u64) -> Result<()> {
    let shape = matrix.shape();
    debug!(
        "filling matrix {} ({} elements) with seed {}",
        shape.role,
        shape.elements(),
        seed
    );
    backend.fill_uniform(matrix, seed)
}

/// Outcome of checking generated values against [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RangeReport {
    pub checked: usize,
    pub out_of_range: usize,
    /// Index and decoded value of the first violation.
    pub first: Option<(usize, f32)>,
}

impl RangeReport {
    pub fn is_clean(&self) -> bool {
        self.out_of_range == 0
    }
}

pub fn check_range(values: &[f16]) -> RangeReport {
    let mut report = RangeReport {
        checked: values.len(),
        ..RangeReport::default()
    };
    for (index, value) in values.iter().enumerate() {
        let value = value.to_f32();
        // NaN fails the containment test too.
        if !(LOWER_BOUND..=UPPER_BOUND).contains(&value) {
            report.out_of_range += 1;
            report.first.get_or_insert((index, value));
        }
    }
    report
}

/// Reads `matrix` back and reports values outside [-1, 1] as a loud
/// diagnostic. A violation never fails the run; only the read-back can.
pub fn verify<B: Backend>(backend: &B, matrix: &B::Matrix) -> Result<RangeReport> {
    let values = backend.read_back(matrix)?;
    let report = check_range(&values);
    if let Some((index, value)) = report.first {
        error!(
            "matrix {} initialization failed: {} of {} values outside [{}, {}], first at {} = {}",
            matrix.shape().role,
            report.out_of_range,
            report.checked,
            LOWER_BOUND,
            UPPER_BOUND,
            index,
            value
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bounds_are_inclusive() {
        let values = [f16::from_f32(-1.0), f16::ZERO, f16::from_f32(1.0)];
        let report = check_range(&values);
        assert!(report.is_clean());
        assert_eq!(report.checked, 3);
    }

    #[test]
    fn first_violation_is_recorded() {
        let values = [
            f16::from_f32(0.5),
            f16::from_f32(1.5),
            f16::from_f32(-3.0),
            f16::NAN,
        ];
        let report = check_range(&values);
        assert_eq!(report.out_of_range, 3);
        assert_eq!(report.first, Some((1, 1.5)));
    }

    #[test]
    fn empty_input_is_clean() {
        assert!(check_range(&[]).is_clean());
    }

    proptest! {
        #[test]
        fn unit_interval_values_pass(raw in proptest::collection::vec(-1.0f32..=1.0, 0..256)) {
            let values: Vec<f16> = raw.iter().map(|&v| f16::from_f32(v)).collect();
            prop_assert!(check_range(&values).is_clean());
        }

        #[test]
        fn values_beyond_one_fail(v in 1.01f32..1000.0, negative in any::<bool>()) {
            let v = if negative { -v } else { v };
            let report = check_range(&[f16::from_f32(v)]);
            prop_assert_eq!(report.out_of_range, 1);
        }
    }
}
