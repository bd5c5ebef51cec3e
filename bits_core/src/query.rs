//! Turning a query spec into an ordered list of matched elements.

use std::sync::Arc;

use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::BitsResult;
use crate::Collection;
use crate::element::Element;
use crate::model::QuerySpec;
use crate::model::SelectSpec;

/// A random source: seeded when `seed` is given, thread-local otherwise.
pub(crate) fn rng_for(seed: Option<u64>) -> Box<dyn RngCore> {
	match seed {
		Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
		None => Box::new(rand::rng()),
	}
}

/// Apply the query's predicate (`where`, else legacy `query`) and then its
/// `select`.
pub fn matching<T: Element>(collection: &Collection<T>, spec: &QuerySpec) -> BitsResult<Vec<Arc<T>>> {
	let filtered = match spec.predicate() {
		Some(clause) => collection.where_clause(clause)?,
		None => collection.clone(),
	};

	let items = filtered.into_items();
	Ok(match &spec.select {
		Some(select) => select_items(items, select),
		None => items,
	})
}

/// Apply `select` to an already filtered list.
///
/// `indices` (1-based) wins over every other option and keeps the given
/// order, skipping out-of-range entries. Otherwise the pipeline is
/// shuffle, sample, offset, then `k`/`limit`; `shuffle` and `sample` share
/// one random source so a seed fixes both.
pub fn select_items<T: Clone>(items: Vec<T>, select: &SelectSpec) -> Vec<T> {
	if let Some(indices) = &select.indices {
		return indices
			.iter()
			.filter_map(|index| usize::try_from(*index).ok())
			.filter(|index| *index >= 1)
			.filter_map(|index| items.get(index - 1).cloned())
			.collect();
	}

	let mut items = items;
	let mut rng = rng_for(select.seed);

	if select.shuffle {
		items.shuffle(&mut *rng);
	}

	if let Some(amount) = select.sample {
		let amount = amount.min(items.len());
		let picked = rand::seq::index::sample(&mut *rng, items.len(), amount);
		items = picked
			.iter()
			.filter_map(|index| items.get(index).cloned())
			.collect();
	}

	let offset = select.offset.unwrap_or(0).min(items.len());
	items.drain(..offset);

	if let Some(count) = select.k.or(select.limit) {
		items.truncate(count);
	}

	items
}
