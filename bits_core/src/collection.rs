use std::fmt;
use std::sync::Arc;

use derive_more::Deref;
use derive_more::IntoIterator;
use regex::Regex;
use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::element::Element;
use crate::element::ElementId;
use crate::model::WhereClause;

/// Predicates of [`Collection::filter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
	/// Regular expression matched at the start of the element name.
	pub name: Option<String>,
	/// Every tag must be present.
	pub tags: Vec<String>,
	/// Declared metadata equality; null values are ignored.
	pub metadata: Map<String, Value>,
}

impl Filter {
	pub fn is_empty(&self) -> bool {
		self.name.is_none() && self.tags.is_empty() && self.metadata.values().all(Value::is_null)
	}
}

impl From<&WhereClause> for Filter {
	fn from(clause: &WhereClause) -> Self {
		Self {
			name: clause.name.clone(),
			tags: clause.tags.clone(),
			metadata: clause.metadata.clone(),
		}
	}
}

/// Compile a name filter so that it only matches at the start of a name.
pub fn name_pattern(pattern: &str) -> BitsResult<Regex> {
	Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
		BitsError::InvalidPattern {
			pattern: pattern.to_string(),
			reason: e.to_string(),
		}
	})
}

/// An ordered set of elements with unique ids.
///
/// Filtering never mutates the collection it is called on, and results keep
/// the original relative order. Elements are shared through `Arc` so the same
/// bit can sit in the registry that declared it and in every registry that
/// imports it.
#[derive(Deref, IntoIterator)]
pub struct Collection<T> {
	#[into_iterator(owned, ref)]
	items: Vec<Arc<T>>,
}

impl<T> Default for Collection<T> {
	fn default() -> Self {
		Self { items: Vec::new() }
	}
}

impl<T> Clone for Collection<T> {
	fn clone(&self) -> Self {
		Self {
			items: self.items.clone(),
		}
	}
}

impl<T: fmt::Debug> fmt::Debug for Collection<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list().entries(self.items.iter()).finish()
	}
}

impl<T: Element> Collection<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Build a collection, rejecting repeated ids.
	pub fn from_items(items: impl IntoIterator<Item = Arc<T>>) -> BitsResult<Self> {
		let mut collection = Self::new();
		collection.extend(items)?;
		Ok(collection)
	}

	pub fn push(&mut self, item: Arc<T>) -> BitsResult<()> {
		if self.contains_id(item.id()) {
			return Err(BitsError::DuplicateElement(item.label()));
		}

		self.items.push(item);
		Ok(())
	}

	pub fn extend(&mut self, items: impl IntoIterator<Item = Arc<T>>) -> BitsResult<()> {
		for item in items {
			self.push(item)?;
		}

		Ok(())
	}

	pub fn clear(&mut self) {
		self.items.clear();
	}

	pub fn contains_id(&self, id: ElementId) -> bool {
		self.items.iter().any(|item| item.id() == id)
	}

	pub fn into_items(self) -> Vec<Arc<T>> {
		self.items
	}

	pub fn find_by_id(&self, id: ElementId) -> BitsResult<Arc<T>> {
		self.items
			.iter()
			.find(|item| item.id() == id)
			.cloned()
			.ok_or_else(|| BitsError::NotFound(id.to_string()))
	}

	/// First element with exactly this name.
	pub fn find_by_name(&self, name: &str) -> Option<Arc<T>> {
		self.items
			.iter()
			.find(|item| item.name() == Some(name))
			.cloned()
	}

	pub fn filter(&self, filter: &Filter) -> BitsResult<Self> {
		let pattern = filter.name.as_deref().map(name_pattern).transpose()?;

		let items = self
			.items
			.iter()
			.filter(|item| {
				pattern
					.as_ref()
					.is_none_or(|pattern| item.matches_name(pattern))
			})
			.filter(|item| item.matches_tags(&filter.tags))
			.filter(|item| {
				filter
					.metadata
					.iter()
					.all(|(key, expected)| item.matches_metadata(key, expected))
			})
			.cloned()
			.collect();

		Ok(Self { items })
	}

	/// With an `id`, the other predicates only apply to that one element.
	pub fn query(&self, id: Option<ElementId>, filter: &Filter) -> BitsResult<Self> {
		match id {
			Some(id) => {
				let single = Self {
					items: vec![self.find_by_id(id)?],
				};
				single.filter(filter)
			}
			None => self.filter(filter),
		}
	}

	/// [`Collection::query`] plus `has`/`missing` field presence checks.
	pub fn where_clause(&self, clause: &WhereClause) -> BitsResult<Self> {
		let id = clause
			.id
			.as_deref()
			.map(|raw| {
				raw.trim()
					.parse::<ElementId>()
					.map_err(|_| BitsError::NotFound(raw.to_string()))
			})
			.transpose()?;
		let base = self.query(id, &Filter::from(clause))?;

		if clause.has.is_empty() && clause.missing.is_empty() {
			return Ok(base);
		}

		let items = base
			.items
			.into_iter()
			.filter(|item| clause.has.iter().all(|field| item.has_field(field)))
			.filter(|item| !clause.missing.iter().any(|field| item.has_field(field)))
			.collect();

		Ok(Self { items })
	}
}

impl<T: Element> TryFrom<Vec<Arc<T>>> for Collection<T> {
	type Error = BitsError;

	fn try_from(items: Vec<Arc<T>>) -> Result<Self, Self::Error> {
		Self::from_items(items)
	}
}
