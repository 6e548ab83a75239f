//! Weighted random selection and ranking over node records.

use std::cmp::Ordering;

use rand::{Rng, distributions::WeightedIndex, prelude::Distribution, seq::SliceRandom};

use super::record::NodeRecord;

/// Picks one record with probability proportional to [`NodeRecord::weight`].
///
/// Equal weights give a uniform pick. Returns `None` for an empty slice.
pub fn weighted_choice<'a, R: Rng + ?Sized>(records: &[&'a NodeRecord], rng: &mut R) -> Option<&'a NodeRecord> {
    if records.is_empty() {
        return None;
    }

    match WeightedIndex::new(records.iter().map(|r| r.weight())) {
        Ok(index) => Some(records[index.sample(rng)]),
        // Only reachable with non-finite metrics; degrade to a uniform pick.
        Err(_) => records.choose(rng).copied(),
    }
}

/// Uniform random pick.
pub fn uniform_choice<'a, R: Rng + ?Sized>(records: &[&'a NodeRecord], rng: &mut R) -> Option<&'a NodeRecord> {
    records.choose(rng).copied()
}

/// Sorts by descending weight, then ascending priority, then name.
pub fn rank_by_weight(records: &mut [NodeRecord]) {
    records.sort_by(|a, b| {
        b.weight()
            .partial_cmp(&a.weight())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn node(name: &str, success_rate: f64, response_time: f64) -> NodeRecord {
        let mut n = NodeRecord::new(name, format!("http://{name}.example:18081/json_rpc"));
        n.success_rate = success_rate;
        n.response_time = response_time;
        n
    }

    #[test]
    fn test_weighted_choice_frequencies_follow_weights() {
        let nodes = [node("fast", 1.0, 0.2), node("slow", 1.0, 0.8), node("flaky", 0.25, 0.2)];
        let refs: Vec<&NodeRecord> = nodes.iter().collect();
        let total: f64 = nodes.iter().map(|n| n.weight()).sum();

        let mut rng = StdRng::seed_from_u64(42);
        let samples = 40_000;
        let mut counts = [0usize; 3];
        for _ in 0..samples {
            let picked = weighted_choice(&refs, &mut rng).unwrap();
            let idx = nodes.iter().position(|n| n.name == picked.name).unwrap();
            counts[idx] += 1;
        }

        for (i, n) in nodes.iter().enumerate() {
            let expected = n.weight() / total;
            let observed = counts[i] as f64 / samples as f64;
            assert!(
                (observed - expected).abs() < 0.02,
                "{}: expected {expected:.3}, observed {observed:.3}",
                n.name
            );
        }
    }

    #[test]
    fn test_weighted_choice_is_uniform_for_fresh_nodes() {
        let nodes = [node("a", 1.0, 0.0), node("b", 1.0, 0.0), node("c", 1.0, 0.0), node("d", 1.0, 0.0)];
        let refs: Vec<&NodeRecord> = nodes.iter().collect();
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0usize; 4];
        for _ in 0..20_000 {
            let picked = weighted_choice(&refs, &mut rng).unwrap();
            counts[nodes.iter().position(|n| n.name == picked.name).unwrap()] += 1;
        }
        for c in counts {
            assert!((c as f64 / 20_000.0 - 0.25).abs() < 0.02);
        }
    }

    #[test]
    fn test_weighted_choice_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(weighted_choice(&[], &mut rng).is_none());
        assert!(uniform_choice(&[], &mut rng).is_none());
    }

    #[test]
    fn test_rank_by_weight_breaks_ties_on_priority() {
        let mut nodes = vec![
            node("slow", 1.0, 1.0).with_priority(0),
            node("tie-b", 1.0, 0.2).with_priority(2),
            node("tie-a", 1.0, 0.2).with_priority(1),
        ];
        rank_by_weight(&mut nodes);
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["tie-a", "tie-b", "slow"]);
    }
}
