use super::error::{AnalysisError, AnalysisResult};
use super::types::Nutrition;

/// Neumaier's variant of Kahan summation.
#[derive(Debug, Default, Clone, Copy)]
struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    fn total(self) -> f64 {
        self.sum + self.compensation
    }
}

/// Field-wise sum of per-dish nutrition into meal totals.
///
/// Non-finite inputs or a non-finite result fail the whole aggregation.
pub fn aggregate<'a, I>(items: I) -> AnalysisResult<Nutrition>
where
    I: IntoIterator<Item = &'a Nutrition>,
{
    let mut acc = [CompensatedSum::default(); 6];
    for (idx, item) in items.into_iter().enumerate() {
        for ((slot, value), field) in acc.iter_mut().zip(item.to_array()).zip(Nutrition::FIELDS) {
            if !value.is_finite() {
                return Err(AnalysisError::Aggregation(format!(
                    "item {idx} has non-finite {field}: {value}"
                )));
            }
            slot.add(value);
        }
    }

    let mut totals = [0.0; 6];
    for ((out, slot), field) in totals.iter_mut().zip(acc).zip(Nutrition::FIELDS) {
        let total = slot.total();
        if !total.is_finite() {
            return Err(AnalysisError::Aggregation(format!("{field} total overflowed")));
        }
        *out = total;
    }
    Ok(Nutrition::from_array(totals))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: f64) -> Nutrition {
        Nutrition::from_array([v; 6])
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(aggregate(&[]).unwrap(), Nutrition::default());
    }

    #[test]
    fn sums_each_field_independently() {
        let a = Nutrition::from_array([100.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = Nutrition::from_array([250.5, 10.0, 20.0, 30.0, 40.0, 50.0]);
        let total = aggregate(&[a, b]).unwrap();
        assert_eq!(total.to_array(), [350.5, 11.0, 22.0, 33.0, 44.0, 55.0]);
    }

    #[test]
    fn compensated_sum_keeps_small_terms() {
        let mut items = vec![n(1e16)];
        items.extend(std::iter::repeat(n(1.0)).take(1000));
        items.push(n(-1e16));
        let total = aggregate(&items).unwrap();
        assert_eq!(total.calories, 1000.0);
    }

    #[test]
    fn tenths_add_up() {
        let items: Vec<_> = std::iter::repeat(n(0.1)).take(10).collect();
        let total = aggregate(&items).unwrap();
        assert_eq!(total.protein, 1.0);
    }

    #[test]
    fn nan_and_inf_are_rejected() {
        let mut bad = n(1.0);
        bad.fat = f64::NAN;
        let err = aggregate(&[n(1.0), bad]).unwrap_err();
        assert!(matches!(err, AnalysisError::Aggregation(ref m) if m.contains("fat")));

        bad.fat = f64::INFINITY;
        assert!(aggregate(&[bad]).is_err());
    }

    #[test]
    fn overflow_is_rejected() {
        assert!(aggregate(&[n(f64::MAX), n(f64::MAX)]).is_err());
    }
}
