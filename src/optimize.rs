//! Grid partition optimizer.
//!
//! Picks one slice length per dimension so that a tile (one slice of every
//! dimension) never exceeds the row limit, while keeping the number of tiles
//! as small as possible.
//!
//! For each dimension only the distinct batch counts `ceil(n / s)` matter, and
//! for a given count the shortest slice reaching it, `ceil(n / count)`, is the
//! cheapest in rows. The search walks the Cartesian product of those
//! per-dimension fronts. It is exponential in the number of dimensions, which
//! stays at four for this portal; fronts have roughly `2 * sqrt(n)` entries.

use crate::{Error, Result};

/// Chosen slice length for one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSize {
    pub name: String,
    pub size: usize,
    /// Number of slices the domain is cut into.
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    sizes: Vec<BatchSize>,
}

impl BatchPlan {
    pub fn iter(&self) -> impl Iterator<Item = &BatchSize> {
        self.sizes.iter()
    }

    pub fn size_of(&self, name: &str) -> Option<usize> {
        self.sizes.iter().find(|b| b.name == name).map(|b| b.size)
    }

    /// Number of tiles the plan produces.
    pub fn tile_count(&self) -> usize {
        self.sizes.iter().map(|b| b.batches).product()
    }

    /// Upper bound on rows returned by a single tile.
    pub fn rows_per_tile(&self) -> usize {
        self.sizes.iter().map(|b| b.size).product()
    }
}

/// One entry of a dimension's front.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    batches: usize,
    size: usize,
}

/// Distinct batch counts for a domain of `len` values, most batches first.
fn candidates(len: usize) -> Vec<Candidate> {
    let mut front: Vec<Candidate> = Vec::new();
    for size in 1..=len {
        let batches = len.div_ceil(size);
        // Sizes ascend, so the first size seen for a count is the smallest one.
        if front.last().map_or(true, |c| c.batches != batches) {
            front.push(Candidate { batches, size });
        }
    }
    front
}

/// Computes per-dimension batch sizes for `domains` (`(name, domain size)` pairs).
///
/// The returned plan satisfies `rows_per_tile() <= limit` and has the fewest
/// tiles of any such assignment. Ties go to the combination found first.
pub fn optimize(domains: &[(&str, usize)], limit: usize) -> Result<BatchPlan> {
    if limit == 0 {
        return Err(Error::Config("row limit must be at least 1".into()));
    }
    if domains.is_empty() {
        return Err(Error::Config("nothing to partition".into()));
    }
    if let Some((name, _)) = domains.iter().find(|(_, len)| *len == 0) {
        return Err(Error::invalid_dimension(name, "empty value set"));
    }

    let total: u128 = domains.iter().map(|(_, len)| *len as u128).product();
    let lower_bound = total.div_ceil(limit as u128);

    if lower_bound == 1 {
        let sizes = domains
            .iter()
            .map(|(name, len)| BatchSize {
                name: name.to_string(),
                size: *len,
                batches: 1,
            })
            .collect();
        return Ok(BatchPlan { sizes });
    }

    let fronts: Vec<Vec<Candidate>> = domains.iter().map(|(_, len)| candidates(*len)).collect();

    let mut best: Option<(u128, Vec<usize>)> = None;
    let mut idx = vec![0usize; fronts.len()];

    'search: loop {
        let request_count: u128 = idx
            .iter()
            .zip(&fronts)
            .map(|(&i, front)| front[i].batches as u128)
            .product();
        let improves = best.as_ref().map_or(true, |(count, _)| request_count < *count);

        if request_count >= lower_bound && improves {
            let rows: u128 = idx
                .iter()
                .zip(&fronts)
                .map(|(&i, front)| front[i].size as u128)
                .product();
            if rows <= limit as u128 {
                best = Some((request_count, idx.clone()));
                if request_count == lower_bound {
                    break 'search;
                }
            }
        }

        // Odometer step, last dimension fastest.
        let mut d = idx.len();
        loop {
            if d == 0 {
                break 'search;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < fronts[d].len() {
                break;
            }
            idx[d] = 0;
        }
    }

    let (_, winner) = best.ok_or(Error::Infeasible { limit })?;
    let sizes = domains
        .iter()
        .zip(&fronts)
        .zip(winner)
        .map(|(((name, _), front), i)| BatchSize {
            name: name.to_string(),
            size: front[i].size,
            batches: front[i].batches,
        })
        .collect();
    Ok(BatchPlan { sizes })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest tile count over every size assignment that respects `limit`.
    fn brute_force_min(lens: &[usize], limit: usize) -> usize {
        fn walk(lens: &[usize], limit: usize, rows: usize, tiles: usize, best: &mut usize) {
            match lens.split_first() {
                None => *best = (*best).min(tiles),
                Some((&len, rest)) => {
                    for size in 1..=len {
                        let rows = rows * size;
                        if rows > limit {
                            break;
                        }
                        walk(rest, limit, rows, tiles * len.div_ceil(size), best);
                    }
                }
            }
        }
        let mut best = usize::MAX;
        walk(lens, limit, 1, 1, &mut best);
        best
    }

    #[test]
    fn crime_and_region_example() {
        let plan = optimize(&[("crime", 5), ("region", 3)], 4).unwrap();
        assert_eq!(plan.size_of("crime"), Some(1));
        assert_eq!(plan.size_of("region"), Some(3));
        assert_eq!(plan.tile_count(), 5);
        assert_eq!(plan.rows_per_tile(), 3);
    }

    #[test]
    fn shortest_slice_per_batch_count_reaches_lower_bound() {
        // Slices of 4 crimes would need 4 rows per tile; 3 crimes fit.
        let plan = optimize(&[("crime", 5), ("region", 2)], 3).unwrap();
        assert_eq!(plan.size_of("crime"), Some(3));
        assert_eq!(plan.size_of("region"), Some(1));
        assert_eq!(plan.tile_count(), 4);
    }

    #[test]
    fn single_tile_fast_path() {
        let plan = optimize(&[("crime", 2), ("region", 3)], 10).unwrap();
        assert_eq!(plan.tile_count(), 1);
        assert_eq!(plan.size_of("crime"), Some(2));
        assert_eq!(plan.size_of("region"), Some(3));
    }

    #[test]
    fn unit_limit_splits_everything() {
        let plan = optimize(&[("crime", 4), ("region", 3), ("measure", 2)], 1).unwrap();
        assert!(plan.iter().all(|b| b.size == 1));
        assert_eq!(plan.tile_count(), 24);
    }

    #[test]
    fn singleton_domain_has_one_batch() {
        let plan = optimize(&[("crime", 1), ("region", 9)], 4).unwrap();
        let crime = plan.iter().find(|b| b.name == "crime").unwrap();
        assert_eq!((crime.size, crime.batches), (1, 1));
        assert_eq!(plan.tile_count(), 3);
    }

    #[test]
    fn invalid_input_rejected() {
        assert!(matches!(
            optimize(&[("crime", 3)], 0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            optimize(&[("crime", 3), ("region", 0)], 5),
            Err(Error::InvalidDimension { .. })
        ));
        assert!(optimize(&[], 5).is_err());
    }

    #[test]
    fn deterministic() {
        let domains = [("crime", 37), ("region", 23), ("period", 11), ("measure", 2)];
        let a = optimize(&domains, 500).unwrap();
        let b = optimize(&domains, 500).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn minimal_and_within_limit_on_small_grids() {
        for a in 1..=7 {
            for b in 1..=6 {
                for c in 1..=3 {
                    for limit in 1..=14 {
                        let lens = [a, b, c];
                        let plan =
                            optimize(&[("x", a), ("y", b), ("z", c)], limit).unwrap();
                        assert!(plan.rows_per_tile() <= limit, "{lens:?} limit {limit}");

                        let implied: usize = plan
                            .iter()
                            .zip(lens)
                            .map(|(bs, len)| len.div_ceil(bs.size))
                            .product();
                        assert_eq!(implied, plan.tile_count());
                        assert_eq!(
                            plan.tile_count(),
                            brute_force_min(&lens, limit),
                            "{lens:?} limit {limit}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn portal_sized_topic() {
        let domains = [("crime", 310), ("region", 312), ("period", 64), ("measure", 2)];
        let plan = optimize(&domains, 10_000).unwrap();
        assert!(plan.rows_per_tile() <= 10_000);

        let total: usize = domains.iter().map(|(_, n)| n).product();
        assert!(plan.tile_count() >= total.div_ceil(10_000));
    }
}
