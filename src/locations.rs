//! Location deduplication and pair canonicalization.
//!
//! Raw pairwise observations reference arbitrary coordinates; before anything
//! else can happen they are collapsed into a canonical list of unique
//! locations plus integer pair-index arrays into that list. Two coordinates
//! are the same location when their integer-ravelled keys are equal, and the
//! unique list is ordered by ascending key rather than arrival order, so the
//! output is reproducible byte-for-byte for the same input.

use std::collections::HashMap;

/// Scale applied to each coordinate component before rounding to an integer
/// key. Two coordinates closer than `1 / COORD_KEY_SCALE` per component are
/// treated as the same location.
pub const COORD_KEY_SCALE: f64 = 1e6;

/// Integer ravelling of a coordinate, used for hashing and ordering.
pub type LocationKey = Vec<i64>;

/// Ravel a coordinate into its integer key.
pub fn coord_key(coord: &[f64]) -> LocationKey {
    coord
        .iter()
        .map(|c| (c * COORD_KEY_SCALE).round() as i64)
        .collect()
}

/// Output of [`unique_locations`]: one entry in `pref_v`/`pref_u` per raw
/// input pair, in input order. Used for prediction queries, where every raw
/// pair must keep its own output slot.
#[derive(Debug, Clone)]
pub struct UniqueLocations {
    /// Deduplicated locations, ordered by ascending key.
    pub coords: Vec<Vec<f64>>,
    /// Index into `coords` of the first endpoint of each raw pair.
    pub pref_v: Vec<usize>,
    /// Index into `coords` of the second endpoint of each raw pair.
    pub pref_u: Vec<usize>,
    /// For each unique location, its first occurrence in the concatenated
    /// raw input `coords_0 ++ coords_1`. Used to remap per-endpoint prior
    /// means onto the deduplicated list.
    pub original_idxs: Vec<usize>,
}

/// Output of [`merge_observations`]: canonical observed pairs with merged
/// comparison counts.
#[derive(Debug, Clone)]
pub struct ObservedPairs {
    /// Deduplicated locations, ordered by ascending key.
    pub coords: Vec<Vec<f64>>,
    /// First occurrence of each unique location in the concatenated input.
    pub original_idxs: Vec<usize>,
    /// Canonical first endpoint of each merged pair (`v`'s key < `u`'s key).
    pub pref_v: Vec<usize>,
    /// Canonical second endpoint of each merged pair.
    pub pref_u: Vec<usize>,
    /// Number of comparisons won by the `v` endpoint. May be fractional when
    /// labels are fractions of totals. Invariant: `0 <= poscount <= total`.
    pub poscounts: Vec<f64>,
    /// Number of comparisons made between the two endpoints.
    pub totals: Vec<f64>,
}

impl ObservedPairs {
    pub fn len(&self) -> usize {
        self.pref_v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pref_v.is_empty()
    }

    pub fn n_locations(&self) -> usize {
        self.coords.len()
    }
}

/// Index the concatenated endpoint keys: returns the ascending-sorted unique
/// keys, the concat-index of each key's first occurrence, and the map from
/// key to position in the sorted list.
fn index_keys(
    coords_0: &[Vec<f64>],
    coords_1: &[Vec<f64>],
) -> (Vec<LocationKey>, Vec<usize>, HashMap<LocationKey, usize>) {
    let mut first_seen: HashMap<LocationKey, usize> = HashMap::new();
    for (i, coord) in coords_0.iter().chain(coords_1.iter()).enumerate() {
        first_seen.entry(coord_key(coord)).or_insert(i);
    }

    let mut keys: Vec<LocationKey> = first_seen.keys().cloned().collect();
    keys.sort_unstable();

    let mut original_idxs = Vec::with_capacity(keys.len());
    let mut positions = HashMap::with_capacity(keys.len());
    for (pos, key) in keys.iter().enumerate() {
        original_idxs.push(first_seen[key]);
        positions.insert(key.clone(), pos);
    }

    (keys, original_idxs, positions)
}

fn coords_at(coords_0: &[Vec<f64>], coords_1: &[Vec<f64>], concat_idx: usize) -> Vec<f64> {
    let n = coords_0.len();
    if concat_idx < n {
        coords_0[concat_idx].clone()
    } else {
        coords_1[concat_idx - n].clone()
    }
}

/// Collapse the endpoints of raw coordinate pairs into a unique location list
/// without merging the pairs themselves. `pref_v`/`pref_u` have one entry per
/// raw pair, in input order.
pub fn unique_locations(coords_0: &[Vec<f64>], coords_1: &[Vec<f64>]) -> UniqueLocations {
    let (_, original_idxs, positions) = index_keys(coords_0, coords_1);

    let coords = original_idxs
        .iter()
        .map(|&i| coords_at(coords_0, coords_1, i))
        .collect();

    let pref_v = coords_0.iter().map(|c| positions[&coord_key(c)]).collect();
    let pref_u = coords_1.iter().map(|c| positions[&coord_key(c)]).collect();

    UniqueLocations {
        coords,
        pref_v,
        pref_u,
        original_idxs,
    }
}

/// Collapse raw counted observations into canonical merged pairs.
///
/// Pairs referencing the same unordered location pair are merged by summing
/// counts; when the canonical ordering (key-smaller location first) requires
/// reversing a raw pair, its positive count is flipped to `total - poscount`
/// first, so the merged `poscount` always counts wins for the canonical `v`.
///
/// Self-pairs (`coords_0[i] == coords_1[i]`) carry no preference signal and
/// are kept with `poscount = total / 2` rather than dropped.
pub fn merge_observations(
    coords_0: &[Vec<f64>],
    coords_1: &[Vec<f64>],
    poscounts: &[f64],
    totals: &[f64],
) -> ObservedPairs {
    let (_, original_idxs, positions) = index_keys(coords_0, coords_1);

    let coords: Vec<Vec<f64>> = original_idxs
        .iter()
        .map(|&i| coords_at(coords_0, coords_1, i))
        .collect();

    let mut merged: HashMap<(usize, usize), (f64, f64)> = HashMap::new();
    for i in 0..coords_0.len() {
        let a = positions[&coord_key(&coords_0[i])];
        let b = positions[&coord_key(&coords_1[i])];
        let total = totals[i];

        let (v, u, pos) = if a == b {
            // Degenerate self-pair: zero-information, kept for bookkeeping.
            (a, b, total / 2.0)
        } else if a < b {
            (a, b, poscounts[i])
        } else {
            (b, a, total - poscounts[i])
        };

        let entry = merged.entry((v, u)).or_insert((0.0, 0.0));
        entry.0 += pos;
        entry.1 += total;
    }

    let mut pair_keys: Vec<(usize, usize)> = merged.keys().copied().collect();
    pair_keys.sort_unstable();

    let mut pref_v = Vec::with_capacity(pair_keys.len());
    let mut pref_u = Vec::with_capacity(pair_keys.len());
    let mut pos_out = Vec::with_capacity(pair_keys.len());
    let mut tot_out = Vec::with_capacity(pair_keys.len());
    for (v, u) in pair_keys {
        let (pos, tot) = merged[&(v, u)];
        debug_assert!(pos >= 0.0 && pos <= tot);
        pref_v.push(v);
        pref_u.push(u);
        pos_out.push(pos);
        tot_out.push(tot);
    }

    ObservedPairs {
        coords,
        original_idxs,
        pref_v,
        pref_u,
        poscounts: pos_out,
        totals: tot_out,
    }
}
