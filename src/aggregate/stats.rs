//! Sufficient statistics and their parallel merge.
//!
//! Moments are kept in the numerically stable form (count, mean and central
//! moments M2..M4) and combined with the pairwise update of Chan et al. Raw
//! sums are derived on demand.

use super::reservoir::Reservoir;
use crate::ingest::schema::{Cell, ColumnType, Schema};
use rand::Rng as _;
use rand::rngs::StdRng;
use std::collections::HashMap;

/// Streaming central moments of one variable.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Moments {
    pub count: u64,
    pub mean: f64,
    /// Σ(x - mean)²
    pub m2: f64,
    /// Σ(x - mean)³
    pub m3: f64,
    /// Σ(x - mean)⁴
    pub m4: f64,
}

impl Moments {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let n = self.count as f64;

        let delta = x - self.mean;
        let delta_n = delta / n;
        let delta_n2 = delta_n * delta_n;
        let term1 = delta * delta_n * (n - 1.0);

        self.mean += delta_n;
        self.m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * self.m2
            - 4.0 * delta_n * self.m3;
        self.m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * self.m2;
        self.m2 += term1;
    }

    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let delta = other.mean - self.mean;
        let delta2 = delta * delta;
        let delta3 = delta * delta2;
        let delta4 = delta2 * delta2;

        let m2 = self.m2 + other.m2 + delta2 * n1 * n2 / n;
        let m3 = self.m3
            + other.m3
            + delta3 * n1 * n2 * (n1 - n2) / (n * n)
            + 3.0 * delta * (n1 * other.m2 - n2 * self.m2) / n;
        let m4 = self.m4
            + other.m4
            + delta4 * n1 * n2 * (n1 * n1 - n1 * n2 + n2 * n2) / (n * n * n)
            + 6.0 * delta2 * (n1 * n1 * other.m2 + n2 * n2 * self.m2) / (n * n)
            + 4.0 * delta * (n1 * other.m3 - n2 * self.m3) / n;

        self.count += other.count;
        self.mean += delta * n2 / n;
        self.m2 = m2;
        self.m3 = m3;
        self.m4 = m4;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample variance, M2 / (n - 1).
    pub fn variance(&self) -> Option<f64> {
        (self.count >= 2).then(|| (self.m2 / (self.count - 1) as f64).max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn skewness(&self) -> Option<f64> {
        if self.count < 3 || self.m2 <= 0.0 {
            return None;
        }
        let n = self.count as f64;
        Some(n.sqrt() * self.m3 / self.m2.powf(1.5))
    }

    /// Excess kurtosis.
    pub fn kurtosis(&self) -> Option<f64> {
        if self.count < 4 || self.m2 <= 0.0 {
            return None;
        }
        let n = self.count as f64;
        Some(n * self.m4 / (self.m2 * self.m2) - 3.0)
    }

    pub fn sum(&self) -> f64 {
        self.mean * self.count as f64
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.m2 + self.count as f64 * self.mean * self.mean
    }
}

/// Streaming co-moment of a pair of variables, over rows where both are present.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CoMoment {
    pub count: u64,
    pub mean_x: f64,
    pub mean_y: f64,
    pub m2_x: f64,
    pub m2_y: f64,
    /// Σ(x - mean_x)(y - mean_y)
    pub c_xy: f64,
}

impl CoMoment {
    pub fn push(&mut self, x: f64, y: f64) {
        self.count += 1;
        let n = self.count as f64;
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += dx / n;
        self.mean_y += dy / n;
        self.m2_x += dx * (x - self.mean_x);
        self.m2_y += dy * (y - self.mean_y);
        self.c_xy += dx * (y - self.mean_y);
    }

    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let dx = other.mean_x - self.mean_x;
        let dy = other.mean_y - self.mean_y;
        let weight = n1 * n2 / n;

        self.m2_x += other.m2_x + dx * dx * weight;
        self.m2_y += other.m2_y + dy * dy * weight;
        self.c_xy += other.c_xy + dx * dy * weight;
        self.mean_x += dx * n2 / n;
        self.mean_y += dy * n2 / n;
        self.count += other.count;
    }

    /// Pearson correlation. Undefined below two rows or when either side is constant.
    pub fn correlation(&self) -> Option<f64> {
        if self.count < 2 || self.m2_x <= 0.0 || self.m2_y <= 0.0 {
            return None;
        }
        Some((self.c_xy / (self.m2_x * self.m2_y).sqrt()).clamp(-1.0, 1.0))
    }

    /// Σxy, derived from the central form.
    pub fn sum_of_products(&self) -> f64 {
        self.c_xy + self.count as f64 * self.mean_x * self.mean_y
    }
}

#[derive(Clone, Debug)]
pub struct NumericAccumulator {
    pub moments: Moments,
    pub min: f64,
    pub max: f64,
    pub nulls: u64,
    pub sample: Reservoir,
}

impl NumericAccumulator {
    fn new(sample_size: usize) -> Self {
        Self {
            moments: Moments::default(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            nulls: 0,
            sample: Reservoir::new(sample_size),
        }
    }

    fn observe(&mut self, value: f64, key: u64) {
        self.moments.push(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sample.offer(value, key);
    }

    fn merge(&mut self, other: Self) {
        self.moments.merge(&other.moments);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.nulls += other.nulls;
        self.sample.merge(other.sample);
    }

    pub fn min(&self) -> Option<f64> {
        (self.moments.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.moments.count > 0).then_some(self.max)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BooleanAccumulator {
    pub trues: u64,
    pub falses: u64,
    pub nulls: u64,
}

impl BooleanAccumulator {
    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.falses += other.falses;
        self.nulls += other.nulls;
    }
}

/// Frequency counter that stops admitting new categories at `cap`.
///
/// Once saturated, distinct counts are a lower bound and values outside the
/// tracked set are only counted in `untracked`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryCounter {
    counts: HashMap<String, u64>,
    cap: usize,
    untracked: u64,
    saturated: bool,
}

impl CategoryCounter {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    pub fn observe(&mut self, value: &str) {
        if let Some(count) = self.counts.get_mut(value) {
            *count += 1;
        } else {
            self.add_new(value.to_owned(), 1);
        }
    }

    fn add_new(&mut self, value: String, count: u64) {
        if self.counts.len() < self.cap {
            self.counts.insert(value, count);
        } else {
            self.untracked += count;
            self.saturated = true;
        }
    }

    /// New categories are admitted most frequent first, ties by value, so the
    /// tracked set depends only on the order of merges.
    pub fn merge(&mut self, other: Self) {
        self.untracked += other.untracked;
        self.saturated |= other.saturated;
        let mut fresh = Vec::new();
        for (value, count) in other.counts {
            if let Some(existing) = self.counts.get_mut(&value) {
                *existing += count;
            } else {
                fresh.push((value, count));
            }
        }
        fresh.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (value, count) in fresh {
            self.add_new(value, count);
        }
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn untracked(&self) -> u64 {
        self.untracked
    }

    /// Most frequent values, ties broken alphabetically.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(&String, &u64)> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(n)
            .map(|(v, c)| (v.clone(), *c))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct TextAccumulator {
    pub non_null: u64,
    pub nulls: u64,
    pub categories: CategoryCounter,
}

impl TextAccumulator {
    fn merge(&mut self, other: Self) {
        self.non_null += other.non_null;
        self.nulls += other.nulls;
        self.categories.merge(other.categories);
    }
}

#[derive(Clone, Debug)]
pub enum ColumnAccumulator {
    Numeric(NumericAccumulator),
    Boolean(BooleanAccumulator),
    Text(TextAccumulator),
}

impl ColumnAccumulator {
    pub fn nulls(&self) -> u64 {
        match self {
            Self::Numeric(acc) => acc.nulls,
            Self::Boolean(acc) => acc.nulls,
            Self::Text(acc) => acc.nulls,
        }
    }

    pub fn non_null(&self) -> u64 {
        match self {
            Self::Numeric(acc) => acc.moments.count,
            Self::Boolean(acc) => acc.trues + acc.falses,
            Self::Text(acc) => acc.non_null,
        }
    }

    fn observe(&mut self, cell: &Cell<'_>, rng: &mut StdRng) {
        match (self, cell) {
            (Self::Numeric(acc), Cell::Number(v)) => acc.observe(*v, rng.r#gen()),
            (Self::Numeric(acc), _) => acc.nulls += 1,
            (Self::Boolean(acc), Cell::Bool(true)) => acc.trues += 1,
            (Self::Boolean(acc), Cell::Bool(false)) => acc.falses += 1,
            (Self::Boolean(acc), _) => acc.nulls += 1,
            (Self::Text(acc), Cell::Text(s)) => {
                acc.non_null += 1;
                acc.categories.observe(s);
            }
            (Self::Text(acc), _) => acc.nulls += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.merge(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.merge(b),
            (Self::Text(a), Self::Text(b)) => a.merge(b),
            _ => tracing::error!("Column accumulator kinds differ, skipping merge"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsOptions {
    pub sample_size: usize,
    pub category_cap: usize,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            sample_size: 10_000,
            category_cap: 10_000,
        }
    }
}

/// Per-column accumulators plus co-moments for every numeric column pair.
#[derive(Clone, Debug)]
pub struct SufficientStatistics {
    /// Rows folded in.
    pub rows: u64,
    columns: Vec<ColumnAccumulator>,
    /// Schema indices of the numeric columns.
    numeric: Vec<usize>,
    /// Upper triangle of numeric pairs, row-major.
    pairs: Vec<CoMoment>,
    scratch: Vec<Option<f64>>,
}

impl SufficientStatistics {
    pub fn new(schema: &Schema, options: StatsOptions) -> Self {
        let columns = schema
            .columns()
            .iter()
            .map(|col| match col.ty {
                ColumnType::Integer | ColumnType::Float => {
                    ColumnAccumulator::Numeric(NumericAccumulator::new(options.sample_size))
                }
                ColumnType::Boolean => ColumnAccumulator::Boolean(BooleanAccumulator::default()),
                ColumnType::Text => ColumnAccumulator::Text(TextAccumulator {
                    non_null: 0,
                    nulls: 0,
                    categories: CategoryCounter::new(options.category_cap),
                }),
            })
            .collect();
        let numeric = schema.numeric_indices();
        let m = numeric.len();
        Self {
            rows: 0,
            columns,
            pairs: vec![CoMoment::default(); m * m.saturating_sub(1) / 2],
            scratch: Vec::with_capacity(m),
            numeric,
        }
    }

    fn pair_index(&self, a: usize, b: usize) -> usize {
        let m = self.numeric.len();
        a * m - a * (a + 1) / 2 + (b - a - 1)
    }

    /// Folds one coerced row. `rng` supplies the reservoir keys.
    pub fn observe_row(&mut self, cells: &[Cell<'_>], rng: &mut StdRng) {
        self.rows += 1;
        for (acc, cell) in self.columns.iter_mut().zip(cells) {
            acc.observe(cell, rng);
        }

        self.scratch.clear();
        self.scratch.extend(self.numeric.iter().map(|&i| match cells.get(i) {
            Some(Cell::Number(v)) => Some(*v),
            _ => None,
        }));
        let m = self.numeric.len();
        let mut idx = 0;
        for a in 0..m {
            for b in (a + 1)..m {
                if let (Some(x), Some(y)) = (self.scratch[a], self.scratch[b]) {
                    self.pairs[idx].push(x, y);
                }
                idx += 1;
            }
        }
    }

    /// Combines two partial results over the same schema.
    pub fn merge(&mut self, other: Self) {
        self.rows += other.rows;
        for (a, b) in self.columns.iter_mut().zip(other.columns) {
            a.merge(b);
        }
        for (a, b) in self.pairs.iter_mut().zip(&other.pairs) {
            a.merge(b);
        }
    }

    pub fn columns(&self) -> &[ColumnAccumulator] {
        &self.columns
    }

    pub fn numeric_indices(&self) -> &[usize] {
        &self.numeric
    }

    /// Co-moment of numeric columns `a` and `b`, given as positions among the
    /// numeric columns. `None` on the diagonal.
    pub fn pair(&self, a: usize, b: usize) -> Option<&CoMoment> {
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        if a == b || b >= self.numeric.len() {
            return None;
        }
        self.pairs.get(self.pair_index(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::schema::ColumnDef;
    use rand::SeedableRng as _;

    fn close(a: f64, b: f64) -> bool {
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() / scale < 1e-9
    }

    fn moments_of(values: &[f64]) -> Moments {
        let mut m = Moments::default();
        for &v in values {
            m.push(v);
        }
        m
    }

    #[test]
    fn test_moments_match_two_pass() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = moments_of(&values);
        assert!(close(m.mean, 5.0));
        // population variance is 4, sample variance 32/7
        assert!(close(m.variance().unwrap(), 32.0 / 7.0));
        assert!(close(m.sum(), 40.0));
        assert!(close(m.sum_of_squares(), 232.0));
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let values: Vec<f64> = (0..3000)
            .map(|i| f64::from(i).sin() * 1e6 + f64::from(i % 17))
            .collect();
        let whole = moments_of(&values);

        let parts: Vec<Moments> = values.chunks(700).map(moments_of).collect();
        let mut forward = Moments::default();
        for p in &parts {
            forward.merge(p);
        }
        let mut backward = Moments::default();
        for p in parts.iter().rev() {
            backward.merge(p);
        }
        // tree shaped
        let mut left = parts[0];
        left.merge(&parts[1]);
        let mut right = parts[2];
        for p in &parts[3..] {
            right.merge(p);
        }
        left.merge(&right);

        for m in [forward, backward, left] {
            assert_eq!(m.count, whole.count);
            assert!(close(m.mean, whole.mean));
            assert!(close(m.variance().unwrap(), whole.variance().unwrap()));
            let skew_diff = (m.skewness().unwrap() - whole.skewness().unwrap()).abs();
            let kurt_diff = (m.kurtosis().unwrap() - whole.kurtosis().unwrap()).abs();
            assert!(skew_diff < 1e-7, "skewness drifted by {skew_diff}");
            assert!(kurt_diff < 1e-7, "kurtosis drifted by {kurt_diff}");
        }
    }

    #[test]
    fn test_undefined_below_minimum_count() {
        let m = moments_of(&[1.0]);
        assert_eq!(m.mean(), Some(1.0));
        assert_eq!(m.variance(), None);
        assert_eq!(m.skewness(), None);
        assert_eq!(Moments::default().mean(), None);
    }

    #[test]
    fn test_comoment_correlation() {
        let mut pos = CoMoment::default();
        let mut neg = CoMoment::default();
        let mut flat = CoMoment::default();
        for i in 0..100 {
            let x = f64::from(i);
            pos.push(x, 2.0 * x + 1.0);
            neg.push(x, -x);
            flat.push(x, 5.0);
        }
        assert!((pos.correlation().unwrap() - 1.0).abs() < 1e-12);
        assert!((neg.correlation().unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(flat.correlation(), None);

        let mut halves = CoMoment::default();
        let mut second = CoMoment::default();
        for i in 0..50 {
            halves.push(f64::from(i), -f64::from(i));
        }
        for i in 50..100 {
            second.push(f64::from(i), -f64::from(i));
        }
        halves.merge(&second);
        assert!(close(halves.c_xy, neg.c_xy));
        assert!(close(halves.sum_of_products(), neg.sum_of_products()));
    }

    #[test]
    fn test_category_counter_saturates() {
        let mut counter = CategoryCounter::new(2);
        for v in ["a", "b", "a", "c", "c"] {
            counter.observe(v);
        }
        assert_eq!(counter.distinct(), 2);
        assert!(counter.is_saturated());
        assert_eq!(counter.untracked(), 2);
        assert_eq!(counter.top(1), vec![("a".to_owned(), 2)]);
    }

    #[test]
    fn test_saturated_merge_admits_most_frequent() {
        let mut left = CategoryCounter::new(2);
        left.observe("a");
        let mut right = CategoryCounter::new(3);
        for v in ["z", "y", "y", "x", "x", "x"] {
            right.observe(v);
        }

        left.merge(right);
        assert_eq!(left.distinct(), 2);
        assert!(left.is_saturated());
        assert_eq!(left.top(2), vec![("x".to_owned(), 3), ("a".to_owned(), 1)]);
        assert_eq!(left.untracked(), 3);
    }

    #[test]
    fn test_sufficient_statistics_merge_matches_single_pass() {
        let schema = Schema::new(vec![
            ColumnDef {
                name: "x".into(),
                ty: ColumnType::Float,
            },
            ColumnDef {
                name: "flag".into(),
                ty: ColumnType::Boolean,
            },
            ColumnDef {
                name: "y".into(),
                ty: ColumnType::Integer,
            },
        ]);
        let rows: Vec<[Cell<'static>; 3]> = (0..1000)
            .map(|i| {
                let x = f64::from(i) * 0.5;
                let y = if i % 10 == 0 {
                    Cell::Null
                } else {
                    Cell::Number(f64::from(i % 37))
                };
                [Cell::Number(x), Cell::Bool(i % 3 == 0), y]
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(1);
        let mut single = SufficientStatistics::new(&schema, StatsOptions::default());
        for row in &rows {
            single.observe_row(row, &mut rng);
        }

        let mut merged: Option<SufficientStatistics> = None;
        for (i, chunk) in rows.chunks(300).enumerate().rev() {
            let mut rng = StdRng::seed_from_u64(i as u64);
            let mut part = SufficientStatistics::new(&schema, StatsOptions::default());
            for row in chunk {
                part.observe_row(row, &mut rng);
            }
            match merged.as_mut() {
                Some(acc) => acc.merge(part),
                None => merged = Some(part),
            }
        }
        let merged = merged.unwrap();

        assert_eq!(merged.rows, single.rows);
        let (ColumnAccumulator::Numeric(a), ColumnAccumulator::Numeric(b)) =
            (&merged.columns()[2], &single.columns()[2])
        else {
            panic!("expected numeric column");
        };
        assert_eq!(a.nulls, 100);
        assert_eq!(a.nulls, b.nulls);
        assert!(close(a.moments.mean, b.moments.mean));
        assert!(close(a.moments.variance().unwrap(), b.moments.variance().unwrap()));

        let pair_merged = merged.pair(0, 1).unwrap();
        let pair_single = single.pair(1, 0).unwrap();
        assert_eq!(pair_merged.count, 900);
        assert!(close(
            pair_merged.correlation().unwrap(),
            pair_single.correlation().unwrap()
        ));

        let ColumnAccumulator::Boolean(flags) = &merged.columns()[1] else {
            panic!("expected boolean column");
        };
        assert_eq!(flags.trues, 334);
        assert_eq!(flags.falses, 666);
    }
}
