use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;

/// Picks one item with probability proportional to its weight.
///
/// Zero-weight items are never picked while any item has a positive weight.
/// When every weight is zero the pick is uniform.
pub fn select_weighted<T, F>(items: &[T], weight_of: F) -> Option<&T>
where
    F: Fn(&T) -> u32,
{
    match items.len() {
        0 => return None,
        1 => return items.first(),
        _ => {}
    }

    let mut weights: Vec<u64> = items.iter().map(|item| u64::from(weight_of(item))).collect();
    if weights.iter().all(|w| *w == 0) {
        weights.iter_mut().for_each(|w| *w = 1);
    }

    let dist = WeightedIndex::new(&weights).ok()?;
    items.get(dist.sample(&mut rand::rng()))
}
