use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use minijinja::Environment;
use rstest::rstest;
use serde_json::Value;
use serde_json::json;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;
use crate::document::DocumentFormat;
use crate::document::dump_str;
use crate::document::interpolate;
use crate::document::parse_str;

#[test]
fn filter_requires_every_tag_and_keeps_order() -> BitsResult<()> {
	let collection = Collection::from_items([
		bit("a", &["x", "y"]),
		bit("b", &["x"]),
		bit("c", &["y", "z", "x"]),
	])?;

	let filtered = collection.filter(&Filter {
		tags: vec!["x".to_string(), "y".to_string()],
		..Filter::default()
	})?;

	assert_eq!(names_of(&filtered), vec!["a", "c"]);
	assert_eq!(names_of(&collection), vec!["a", "b", "c"]);

	Ok(())
}

#[rstest]
#[case::prefix("pro", vec!["projectile", "prompt"])]
#[case::anchored("jectile", vec![])]
#[case::alternation("pen|prom", vec!["pendulum", "prompt"])]
fn name_filter_matches_from_the_start(#[case] pattern: &str, #[case] expected: Vec<&str>) -> BitsResult<()> {
	let collection = bits(&["projectile", "pendulum", "prompt"]);
	let filtered = collection.filter(&Filter {
		name: Some(pattern.to_string()),
		..Filter::default()
	})?;

	assert_eq!(names_of(&filtered), expected);

	Ok(())
}

#[test]
fn invalid_name_pattern_is_reported() {
	let collection = bits(&["a"]);
	let result = collection.filter(&Filter {
		name: Some("(".to_string()),
		..Filter::default()
	});

	assert!(matches!(result, Err(BitsError::InvalidPattern { .. })));
}

#[test]
fn collection_rejects_duplicate_ids() -> BitsResult<()> {
	let item = bit("a", &[]);
	let mut collection = Collection::new();
	collection.push(item.clone())?;

	assert!(matches!(collection.push(item), Err(BitsError::DuplicateElement(name)) if name == "a"));

	Ok(())
}

#[test]
fn query_by_id_applies_other_predicates_to_that_element() -> BitsResult<()> {
	let collection = Collection::from_items([bit("a", &["x"]), bit("b", &["x"])])?;
	let id = collection[1].id();

	let found = collection.query(Some(id), &Filter::default())?;
	assert_eq!(names_of(&found), vec!["b"]);

	let filtered = collection.query(
		Some(id),
		&Filter {
			name: Some("a".to_string()),
			..Filter::default()
		},
	)?;
	assert!(filtered.is_empty());

	let missing = collection.find_by_id(ElementId::nil());
	assert!(matches!(missing, Err(BitsError::NotFound(_))));

	Ok(())
}

#[test]
fn where_clause_checks_field_presence() -> BitsResult<()> {
	let collection = Collection::from_items([
		bit_from(json!({ "name": "full", "author": "ada", "src": "x" })),
		bit_from(json!({ "name": "blank", "author": "", "src": "x" })),
		bit_from(json!({ "name": "none", "src": "x" })),
	])?;

	let has: WhereClause = serde_json::from_value(json!({ "has": ["author"] }))
		.unwrap_or_else(|e| panic!("where: {e}"));
	assert_eq!(names_of(&collection.where_clause(&has)?), vec!["full"]);

	let missing: WhereClause = serde_json::from_value(json!({ "missing": ["author"] }))
		.unwrap_or_else(|e| panic!("where: {e}"));
	assert_eq!(names_of(&collection.where_clause(&missing)?), vec!["blank", "none"]);

	Ok(())
}

#[test]
fn metadata_equality_filters_bits() -> BitsResult<()> {
	let collection = Collection::from_items([
		bit_from(json!({ "name": "easy", "level": 1, "src": "x" })),
		bit_from(json!({ "name": "hard", "level": 3, "src": "x" })),
	])?;

	let matched = matching(&collection, &query(json!({ "where": { "level": 3 } })))?;
	assert_eq!(names_of(&matched), vec!["hard"]);

	let legacy = matching(&collection, &query(json!({ "query": { "name": "easy" } })))?;
	assert_eq!(names_of(&legacy), vec!["easy"]);

	Ok(())
}

#[test]
fn select_indices_follow_the_given_order() {
	let select = SelectSpec {
		indices: Some(vec![2, 1, 7, 0, -1]),
		k: Some(1),
		shuffle: true,
		..SelectSpec::default()
	};

	assert_eq!(select_items(vec!["x", "y", "z"], &select), vec!["y", "x"]);
}

#[test]
fn seeded_shuffle_is_deterministic() {
	let items: Vec<u32> = (1..=20).collect();
	let select = SelectSpec {
		shuffle: true,
		seed: Some(42),
		..SelectSpec::default()
	};

	let first = select_items(items.clone(), &select);
	let second = select_items(items.clone(), &select);
	assert_eq!(first, second);

	let mut sorted = first;
	sorted.sort_unstable();
	assert_eq!(sorted, items);
}

#[rstest]
#[case::offset_then_k(SelectSpec { offset: Some(1), k: Some(2), ..SelectSpec::default() }, vec![2, 3])]
#[case::limit(SelectSpec { limit: Some(3), ..SelectSpec::default() }, vec![1, 2, 3])]
#[case::offset_past_end(SelectSpec { offset: Some(9), ..SelectSpec::default() }, vec![])]
#[case::nothing(SelectSpec::default(), vec![1, 2, 3, 4, 5])]
fn select_slices_after_offset(#[case] select: SelectSpec, #[case] expected: Vec<u32>) {
	assert_eq!(select_items(vec![1, 2, 3, 4, 5], &select), expected);
}

#[test]
fn sample_is_seeded_and_clamped() {
	let items: Vec<u32> = (1..=10).collect();
	let select = SelectSpec {
		sample: Some(3),
		seed: Some(7),
		..SelectSpec::default()
	};

	let first = select_items(items.clone(), &select);
	assert_eq!(first.len(), 3);
	assert_eq!(first, select_items(items.clone(), &select));

	let all = select_items(
		vec![1, 2],
		&SelectSpec {
			sample: Some(10),
			seed: Some(1),
			..SelectSpec::default()
		},
	);
	assert_eq!(all.len(), 2);
}

fn grouped(groups: Vec<Vec<ContextValue>>) -> IndexMap<String, QueryResult> {
	let mut results = IndexMap::new();
	results.insert("blocks".to_string(), QueryResult::Multi(groups));
	results
}

#[rstest]
#[case::concat("concat", vec!["a", "b", "c", "d", "e"])]
#[case::interleave("interleave", vec!["a", "c", "b", "d", "e"])]
fn compose_flattens_groups(#[case] mode: &str, #[case] expected: Vec<&str>) -> BitsResult<()> {
	let results = grouped(vec![
		vec![block("a"), block("b")],
		vec![block("c"), block("d"), block("e")],
	]);
	let specs = ComposeSpec::parse_map(&map(json!({ "blocks": { "merge": mode } })))?;

	let context = compose(&results, &specs)?;
	assert_eq!(names(context.get("blocks")), expected);

	Ok(())
}

#[test]
fn compose_flattens_groups_by_default() -> BitsResult<()> {
	let results = grouped(vec![vec![block("a"), block("b")], vec![block("c")]]);

	let context = compose(&results, &IndexMap::new())?;
	assert_eq!(names(context.get("blocks")), vec!["a", "b", "c"]);

	Ok(())
}

#[test]
fn compose_keeps_groups_without_flatten() -> BitsResult<()> {
	let results = grouped(vec![vec![block("a"), block("b")], vec![block("c")]]);
	let specs = ComposeSpec::parse_map(&map(json!({ "blocks": { "flatten": false, "limit": 1 } })))?;

	let context = compose(&results, &specs)?;
	let groups = context
		.get("blocks")
		.and_then(ContextValue::as_list)
		.unwrap_or_default();
	assert_eq!(groups.len(), 1);
	assert_eq!(names(groups.first()), vec!["a", "b"]);

	Ok(())
}

#[test]
fn dedupe_by_name_keeps_first_occurrence() -> BitsResult<()> {
	let first = block("a");
	let first_id = first.element_id();
	let mut results = IndexMap::new();
	results.insert(
		"blocks".to_string(),
		QueryResult::Single(vec![first, block("b"), block("a")]),
	);
	let specs = ComposeSpec::parse_map(&map(json!({ "blocks": { "dedupe": "by:name" } })))?;

	let context = compose(&results, &specs)?;
	assert_eq!(names(context.get("blocks")), vec!["a", "b"]);
	let kept = context
		.get("blocks")
		.and_then(ContextValue::as_list)
		.and_then(|items| items.first())
		.and_then(ContextValue::element_id);
	assert_eq!(kept, first_id);

	Ok(())
}

#[test]
fn dedupe_by_hash_drops_identical_values() -> BitsResult<()> {
	let mut results = IndexMap::new();
	results.insert(
		"values".to_string(),
		QueryResult::Single(vec![
			ContextValue::from(json!({ "x": 1 })),
			ContextValue::from(json!({ "x": 2 })),
			ContextValue::from(json!({ "x": 1 })),
		]),
	);
	let specs = ComposeSpec::parse_map(&map(json!({ "values": { "dedupe": "by:hash" } })))?;

	let context = compose(&results, &specs)?;
	let values = context
		.get("values")
		.and_then(ContextValue::as_list)
		.unwrap_or_default();
	assert_eq!(values.len(), 2);

	Ok(())
}

#[test]
fn aggregate_compose_reads_composed_and_raw_results() -> BitsResult<()> {
	let mut results = IndexMap::new();
	results.insert("warmup".to_string(), QueryResult::Single(vec![block("a"), block("b")]));
	results.insert("main".to_string(), QueryResult::Single(vec![block("c")]));
	let specs = ComposeSpec::parse_map(&map(json!({
		"warmup": { "as": "first" },
		"all": { "from": ["first", "main", "unknown"], "as": "everything", "limit": 2 },
	})))?;

	let context = compose(&results, &specs)?;
	assert_eq!(names(context.get("first")), vec!["a", "b"]);
	assert_eq!(names(context.get("main")), vec!["c"]);
	assert_eq!(names(context.get("everything")), vec!["a", "b"]);
	assert!(!context.contains_key("warmup"));

	Ok(())
}

#[rstest]
#[case::merge(json!({ "blocks": { "merge": "zigzag" } }), "zigzag")]
#[case::dedupe(json!({ "blocks": { "dedupe": "by:colour" } }), "by:colour")]
fn compose_rejects_unknown_modes(#[case] spec: Value, #[case] value: &str) -> BitsResult<()> {
	let results = grouped(vec![vec![block("a")]]);
	let specs = ComposeSpec::parse_map(&map(spec))?;

	let error = compose(&results, &specs).err().unwrap_or_else(|| panic!("expected an error"));
	match error.root_cause() {
		BitsError::UnknownMergeMode(mode) | BitsError::UnknownDedupe(mode) => assert_eq!(mode, value),
		other => panic!("unexpected error: {other}"),
	}

	Ok(())
}

#[rstest]
#[case::nested("queries.blocks[2].where.name", vec![
	PathSegment::Key("queries".to_string()),
	PathSegment::Key("blocks".to_string()),
	PathSegment::Index(2),
	PathSegment::Key("where".to_string()),
	PathSegment::Key("name".to_string()),
])]
#[case::double_index("grid[1][3]", vec![
	PathSegment::Key("grid".to_string()),
	PathSegment::Index(1),
	PathSegment::Index(3),
])]
fn parses_override_paths(#[case] raw: &str, #[case] expected: Vec<PathSegment>) -> BitsResult<()> {
	let path: OverridePath = raw.parse()?;
	assert_eq!(path.segments(), expected.as_slice());
	assert_eq!(path.to_string(), raw);

	Ok(())
}

#[rstest]
#[case::empty("")]
#[case::zero_index("blocks[0]")]
#[case::unbalanced("blocks[2")]
#[case::leading_index("[1]")]
#[case::not_a_number("blocks[x]")]
#[case::trailing_text("blocks[1]x")]
#[case::empty_segment("a..b")]
fn rejects_malformed_override_paths(#[case] raw: &str) {
	assert!(matches!(OverridePath::parse(raw), Err(BitsError::OverridePath { .. })));
}

#[rstest]
#[case::bare("blocks[1]", "queries")]
#[case::context("context.title", "context")]
#[case::compose("compose.all.limit", "compose")]
fn override_paths_default_to_queries(#[case] raw: &str, #[case] section: &str) -> BitsResult<()> {
	let path = OverridePath::parse(raw)?.within_spec();
	assert_eq!(path.segments().first(), Some(&PathSegment::Key(section.to_string())));

	Ok(())
}

#[rstest]
#[case::index_wise(ListMerge::IndexWise, json!([{ "a": 1, "b": 2 }, 9, 3]))]
#[case::replace(ListMerge::Replace, json!([{ "b": 2 }, 9]))]
fn merges_lists(#[case] lists: ListMerge, #[case] expected: Value) {
	let mut base = json!({ "items": [{ "a": 1, "b": 1 }, 2, 3], "keep": true });
	merge_into(&mut base, json!({ "items": [{ "b": 2 }, 9] }), lists);

	assert_eq!(base, json!({ "items": expected, "keep": true }));
}

#[test]
fn remove_drops_the_element_and_ignores_out_of_range() -> BitsResult<()> {
	let mut tree = json!({ "queries": { "blocks": ["q1", "q2", "q3"] } });

	apply_path(&mut tree, &"queries.blocks[2]".parse()?, OverrideOp::Remove, Value::Null)?;
	assert_eq!(tree, json!({ "queries": { "blocks": ["q1", "q3"] } }));

	apply_path(&mut tree, &"queries.blocks[9]".parse()?, OverrideOp::Remove, Value::Null)?;
	assert_eq!(tree, json!({ "queries": { "blocks": ["q1", "q3"] } }));

	Ok(())
}

#[rstest]
#[case::missing_intermediate("queries.missing.name", OverrideOp::Set)]
#[case::index_out_of_range("queries.blocks[4]", OverrideOp::Set)]
#[case::index_into_map("queries[1]", OverrideOp::Merge)]
#[case::key_on_list("queries.blocks.name", OverrideOp::Set)]
fn failing_overrides_leave_the_tree_untouched(#[case] raw: &str, #[case] op: OverrideOp) -> BitsResult<()> {
	let original = json!({ "queries": { "blocks": ["q1"] } });
	let mut tree = original.clone();

	let result = apply_path(&mut tree, &raw.parse()?, op, json!("x"));
	assert!(matches!(result, Err(BitsError::OverridePath { .. })));
	assert_eq!(tree, original);

	Ok(())
}

#[test]
fn unknown_override_op_is_an_error() {
	let overrides = vec![OverrideDecl {
		path: "blocks".to_string(),
		value: json!(1),
		op: Some("append".to_string()),
	}];
	let mut tree = json!({ "queries": { "blocks": [] } });

	let result = apply_overrides(&mut tree, &overrides);
	assert!(matches!(result, Err(BitsError::UnknownOverrideOp(op)) if op == "append"));
}

fn two_queries() -> Value {
	json!({ "blocks": [{ "where": { "name": "q1" } }, { "where": { "name": "q2" } }] })
}

#[test]
fn derived_override_replaces_a_base_query() -> BitsResult<()> {
	let source = MemoryTargets::default()
		.with("a.yaml", spec_with_queries("Base", two_queries()))
		.with(
			"a.yaml",
			target(json!({
				"name": "Derived",
				"extends": "Base",
				"overrides": [{ "path": "queries.blocks[2]", "value": { "where": { "name": "q3" } } }],
			})),
		);

	let spec = source.resolve("a.yaml", "Derived")?;
	assert_eq!(
		spec.queries.get("blocks"),
		Some(&json!([{ "where": { "name": "q1" } }, { "where": { "name": "q3" } }]))
	);
	assert_eq!(spec.template.as_deref(), Some("t.tex"));

	Ok(())
}

#[test]
fn extends_cycle_names_every_target() {
	let source = MemoryTargets::default()
		.with("a.yaml", target(json!({ "name": "A", "extends": "B" })))
		.with("a.yaml", target(json!({ "name": "B", "extends": "A" })));

	let error = source
		.resolve("a.yaml", "A")
		.err()
		.unwrap_or_else(|| panic!("expected a cycle"));
	let Some(ReferenceError::TargetCycle { chain }) = error.reference() else {
		panic!("unexpected error: {error}");
	};
	assert_eq!(chain, "a.yaml::A -> a.yaml::B -> a.yaml::A");
	assert!(error.to_string().contains("a.yaml::B"));
}

#[test]
fn cross_file_base_matches_local_base() -> BitsResult<()> {
	let base = target(json!({
		"name": "Base",
		"template": "t.tex",
		"context": { "title": "Exam", "nested": { "a": 1 } },
		"queries": two_queries(),
	}));
	let derived = |reference: &str| {
		target(json!({
			"name": "Derived",
			"extends": reference,
			"context": { "nested": { "b": 2 } },
			"overrides": [{ "path": "blocks[1].where.name", "value": "q0" }],
		}))
	};

	let local = MemoryTargets::default()
		.with("main.yaml", base.clone())
		.with("main.yaml", derived("Base"));
	let cross = MemoryTargets::default()
		.with("other.yaml", base)
		.with("main.yaml", derived("other.yaml::Base"));

	let local = local.resolve("main.yaml", "Derived")?;
	assert_eq!(local, cross.resolve("main.yaml", "Derived")?);
	assert_eq!(local.context.get("nested"), Some(&json!({ "a": 1, "b": 2 })));

	Ok(())
}

#[test]
fn missing_base_is_a_reference_error() {
	let source = MemoryTargets::default().with("a.yaml", target(json!({ "name": "A", "extends": "Nope" })));

	let error = source
		.resolve("a.yaml", "A")
		.err()
		.unwrap_or_else(|| panic!("expected an error"));
	assert!(matches!(
		error.reference(),
		Some(ReferenceError::MissingBase { target, base, .. }) if target == "A" && base == "Nope"
	));
}

#[test]
fn bases_fold_left_to_right_with_their_own_overrides() -> BitsResult<()> {
	let source = MemoryTargets::default()
		.with(
			"a.yaml",
			target(json!({
				"name": "First",
				"context": { "title": "first", "first": true },
				"queries": { "blocks": [{ "where": { "name": "x" } }] },
			})),
		)
		.with(
			"a.yaml",
			target(json!({
				"name": "Second",
				"context": { "title": "second" },
				"overrides": [{ "path": "blocks[1].where.name", "value": "y" }],
			})),
		)
		.with(
			"a.yaml",
			target(json!({ "name": "Derived", "extends": ["First", "Second"] })),
		);

	let spec = source.resolve("a.yaml", "Derived")?;
	assert_eq!(
		Value::Object(spec.context),
		json!({ "title": "second", "first": true })
	);
	assert_eq!(spec.queries.get("blocks"), Some(&json!([{ "where": { "name": "y" } }])));

	Ok(())
}

#[test]
fn replace_policy_drops_inherited_section() -> BitsResult<()> {
	let source = MemoryTargets::default()
		.with("a.yaml", target(json!({ "name": "Base", "context": { "a": 1, "b": 2 } })))
		.with(
			"a.yaml",
			target(json!({
				"name": "Derived",
				"extends": "Base",
				"merge": { "context": "replace" },
				"context": { "c": 3 },
			})),
		);

	let spec = source.resolve("a.yaml", "Derived")?;
	assert_eq!(Value::Object(spec.context), json!({ "c": 3 }));

	Ok(())
}

#[test]
fn unknown_merge_policy_is_an_error() {
	let source = MemoryTargets::default().with(
		"a.yaml",
		target(json!({ "name": "A", "merge": { "queries": "append" }, "queries": {} })),
	);

	let result = source.resolve("a.yaml", "A");
	assert!(matches!(
		result,
		Err(BitsError::UnknownMergePolicy { section, policy }) if section == "queries" && policy == "append"
	));
}

#[test]
fn override_ops_remove_and_merge() -> BitsResult<()> {
	let source = MemoryTargets::default()
		.with(
			"a.yaml",
			spec_with_queries(
				"Base",
				json!({ "blocks": [{ "where": { "name": "q1" } }, { "where": { "name": "q2" } }, { "where": { "name": "q3" } }] }),
			),
		)
		.with(
			"a.yaml",
			target(json!({
				"name": "Derived",
				"extends": "Base",
				"overrides": [
					{ "path": "blocks[2]", "op": "remove" },
					{ "path": "blocks[9]", "op": "remove" },
					{ "path": "blocks[1]", "op": "merge", "value": { "select": { "k": 1 } } },
					{ "path": "context.title", "value": "Quiz" },
				],
			})),
		);

	let spec = source.resolve("a.yaml", "Derived")?;
	assert_eq!(
		spec.queries.get("blocks"),
		Some(&json!([
			{ "where": { "name": "q1" }, "select": { "k": 1 } },
			{ "where": { "name": "q3" } },
		]))
	);
	assert_eq!(spec.context.get("title"), Some(&json!("Quiz")));

	Ok(())
}

#[test]
fn legacy_context_queries_are_lifted() {
	let spec = TargetSpec::from_decl(&target(json!({
		"name": "A",
		"context": { "title": "T", "blocks": [{ "where": { "name": "x" } }] },
	})));

	assert_eq!(Value::Object(spec.context), json!({ "title": "T" }));
	assert_eq!(
		spec.queries.get("blocks"),
		Some(&json!([{ "where": { "name": "x" } }]))
	);
}

fn preset_bit() -> Arc<Bit> {
	bit_from(json!({
		"name": "projectile",
		"defaults": {
			"context": { "speed": 10 },
			"queries": { "blocks": { "where": { "tags": ["a", "b"] }, "select": { "k": 2 } } },
		},
		"presets": [
			{ "name": "fast", "context": { "speed": 30 } },
			{ "label": "Slow", "queries": { "blocks": { "where": { "tags": ["c"] } } } },
			{ "id": 7, "context": { "speed": 70 } },
		],
		"src": "v=\\VAR{ speed }",
	}))
}

#[rstest]
#[case::none(None, None)]
#[case::default(Some(PresetSelector::Name("default".to_string())), None)]
#[case::name(Some(PresetSelector::Name("fast".to_string())), Some("fast"))]
#[case::label(Some(PresetSelector::Name("Slow".to_string())), Some("Slow"))]
#[case::numeric_string(Some(PresetSelector::Name("2".to_string())), Some("Slow"))]
#[case::index(Some(PresetSelector::Index(1)), Some("fast"))]
fn chooses_presets(#[case] selector: Option<PresetSelector>, #[case] expected: Option<&str>) -> BitsResult<()> {
	let bit = preset_bit();
	let chosen = match choose_preset(&bit, selector.as_ref())? {
		PresetChoice::Defaults => None,
		PresetChoice::Declared(preset) => preset.display_name(),
	};

	assert_eq!(chosen.as_deref(), expected);

	Ok(())
}

#[traced_test]
#[test]
fn legacy_preset_id_is_matched_with_a_warning() {
	let bit = preset_bit();
	let chosen = choose_preset(&bit, Some(&PresetSelector::Name("7".to_string())))
		.unwrap_or_else(|e| panic!("choose: {e}"));

	assert!(matches!(chosen, PresetChoice::Declared(preset) if preset.id == Some(json!(7))));
	assert!(logs_contain("deprecated"));
}

#[rstest]
#[case::unknown_name(PresetSelector::Name("turbo".to_string()))]
#[case::index_too_high(PresetSelector::Index(4))]
#[case::index_zero(PresetSelector::Index(0))]
#[case::numeric_string_out_of_range(PresetSelector::Name("12".to_string()))]
fn unknown_presets_name_the_bit_and_selector(#[case] selector: PresetSelector) {
	let bit = preset_bit();
	let error = choose_preset(&bit, Some(&selector))
		.err()
		.unwrap_or_else(|| panic!("expected an error"));

	let message = error.to_string();
	assert!(message.contains("projectile"), "{message}");
	assert!(message.contains(&selector.to_string()), "{message}");
}

#[traced_test]
#[test]
fn declared_default_preset_is_dropped() {
	let bit = bit_from(json!({
		"name": "b",
		"presets": [{ "name": "default", "context": { "x": 1 } }, { "name": "other" }],
		"src": "x",
	}));

	assert_eq!(bit.presets().len(), 1);
	assert!(matches!(
		choose_preset(&bit, Some(&PresetSelector::Name(DEFAULT_PRESET.to_string()))),
		Ok(PresetChoice::Defaults)
	));
	assert!(logs_contain("reserved"));
}

#[test]
fn preset_queries_replace_lists_of_the_defaults() -> BitsResult<()> {
	let bit = preset_bit();
	let slow = &bit.presets()[1];

	let tree = preset_tree(&bit, slow)?;
	assert_eq!(
		tree.get("queries"),
		Some(&json!({ "blocks": { "where": { "tags": ["c"] }, "select": { "k": 2 } } }))
	);

	Ok(())
}

#[test]
fn preset_overrides_patch_the_merged_queries() -> BitsResult<()> {
	let bit = bit_from(json!({
		"name": "b",
		"defaults": { "queries": { "blocks": [{ "where": { "name": "x" } }, { "where": { "name": "y" } }] } },
		"presets": [{ "name": "p", "overrides": [{ "path": "blocks[2].where.name", "value": "z" }] }],
		"src": "x",
	}));

	let tree = preset_tree(&bit, &bit.presets()[0])?;
	assert_eq!(
		tree.get("queries"),
		Some(&json!({ "blocks": [{ "where": { "name": "x" } }, { "where": { "name": "z" } }] }))
	);

	Ok(())
}

#[rstest]
#[case::no_queries(json!({ "name": "p", "overrides": [{ "path": "blocks[1]", "value": {} }] }), "without_queries")]
#[case::bad_path(json!({ "name": "p", "queries": { "blocks": {} }, "overrides": [{ "path": "blocks.missing.name", "value": 1 }] }), "bad_path")]
#[case::replace_policy(json!({ "name": "p", "merge": { "queries": "replace" }, "overrides": [{ "path": "blocks", "value": 1 }] }), "without_queries")]
fn invalid_preset_overrides(#[case] preset: Value, #[case] kind: &str) {
	let bit = bit_from(json!({
		"name": "b",
		"defaults": { "speed": 1 },
		"presets": [preset],
		"src": "x",
	}));

	let result = preset_tree(&bit, &bit.presets()[0]);
	match kind {
		"without_queries" => {
			assert!(matches!(result, Err(BitsError::PresetOverridesWithoutQueries { .. })));
		}
		_ => assert!(matches!(result, Err(BitsError::OverridePath { .. }))),
	}
}

#[rstest]
#[case::directory("out", "out/questions-exam.pdf")]
#[case::pdf("out/final.pdf", "out/final.pdf")]
#[case::upper_pdf("out/final.PDF", "out/final.PDF")]
fn destinations(#[case] dest: &str, #[case] expected: &str) -> BitsResult<()> {
	let path = destination_for(Path::new(dest), Path::new("reg/questions.yaml"), "exam")?;
	assert_eq!(path, PathBuf::from(expected));

	Ok(())
}

#[test]
fn unsupported_destination_suffix() {
	let result = destination_for(Path::new("out/exam.docx"), Path::new("q.yaml"), "exam");
	assert!(matches!(result, Err(BitsError::UnsupportedDestination { dest }) if dest == "out/exam.docx"));
}

#[test]
fn registry_resolves_targets() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(tmp.path(), "questions.yaml", QUESTIONS);

	let registry = store().get(&path)?;
	assert_eq!(registry.status(), LoadStatus::Loaded);
	assert_eq!(names_of(&registry.bits()), vec!["projectile", "pendulum", "two-part"]);
	assert_eq!(names_of(&registry.constants()), vec!["gravity", "light"]);

	let exam = registry
		.target("exam")
		.unwrap_or_else(|| panic!("no exam target"));
	assert_eq!(exam.context().get("title").and_then(ContextValue::as_str), Some("Midterm"));
	assert_eq!(names(exam.context().get("blocks")), vec!["projectile", "two-part"]);
	assert_eq!(exam.tags(), ["physics".to_string()]);

	let directory = registry.path().parent().unwrap_or_else(|| panic!("no parent"));
	assert_eq!(exam.dest(), directory.join("out/questions-exam.pdf"));
	assert_eq!(exam.template(), directory.join("exam.tex"));

	Ok(())
}

#[test]
fn bit_defaults_are_resolved_on_load() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(tmp.path(), "questions.yaml", QUESTIONS);
	let registry = store().get(&path)?;
	let bits = registry.bits();

	let projectile = bits
		.find_by_name("projectile")
		.unwrap_or_else(|| panic!("no projectile"));
	let defaults = projectile
		.resolved_defaults()
		.unwrap_or_else(|| panic!("defaults not resolved"));
	assert_eq!(number(defaults.get("speed")), Some(10));
	assert_eq!(names(defaults.get("constants")), vec!["gravity"]);
	assert_eq!(projectile.tags(), ["kinematics".to_string(), "physics".to_string()]);

	let pendulum = bits
		.find_by_name("pendulum")
		.unwrap_or_else(|| panic!("no pendulum"));
	assert_eq!(
		number(pendulum.resolved_defaults().and_then(|defaults| defaults.get("length"))),
		Some(1)
	);

	Ok(())
}

#[test]
fn registry_renders_targets_through_the_compiler() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(tmp.path(), "questions.yaml", QUESTIONS);
	write(tmp.path(), "exam.tex", EXAM_TEMPLATE);
	let registry = store().get(&path)?;
	let compiler = RecordingCompiler::default();

	let artifacts = registry.render(&TemplateEngine::new()?, &compiler, &CompileOptions::default())?;
	assert_eq!(artifacts.len(), 1);

	let calls = compiler.calls.lock().unwrap_or_else(|e| panic!("lock: {e}"));
	let (dest, text) = &calls[0];
	assert!(dest.ends_with("out/questions-exam.pdf"));
	assert_eq!(text, "Midterm\nA ball is thrown at 10 m/s.\nCompute 3.\n");

	Ok(())
}

const PRESETS: &str = r"
constants:
  - name: gravity
    symbol: g
    value: 9.81
bits:
  - name: projectile
    defaults:
      speed: 10
    presets:
      - name: fast
        context:
          speed: 30
    src: 'v=\VAR{ speed }'
targets:
  - name: quiz
    template: quiz.tex
    queries:
      plain:
        where: { name: projectile }
      fast:
        where: { name: projectile }
        preset: fast
      layered:
        where: { name: projectile }
        preset: fast
        context: { speed: 40, unit: ms }
        with:
          context: { speed: 50 }
          queries:
            consts:
              kind: constants
";

#[test]
fn block_context_precedence() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(tmp.path(), "presets.yaml", PRESETS);
	let registry = store().get(&path)?;
	let quiz = registry.target("quiz").unwrap_or_else(|| panic!("no quiz"));
	let context = quiz.context();
	let engine = TemplateEngine::new()?;

	let plain = first_block(context, "plain");
	assert_eq!(number(plain.context().get("speed")), Some(10));
	assert_eq!(
		number(plain.context().get("speed")),
		number(plain.bit().resolved_defaults().and_then(|defaults| defaults.get("speed")))
	);

	let fast = first_block(context, "fast");
	assert_eq!(fast.render(&engine, None)?, "v=30");

	let layered = first_block(context, "layered");
	assert_eq!(number(layered.context().get("speed")), Some(50));
	assert_eq!(layered.context().get("unit").and_then(ContextValue::as_str), Some("ms"));
	assert_eq!(names(layered.context().get("consts")), vec!["gravity"]);

	Ok(())
}

#[test]
fn with_clause_rejects_unknown_keys() {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"bad.yaml",
		r"
bits:
  - name: a
    src: x
targets:
  - name: t
    template: t.tex
    queries:
      blocks:
        with:
          contex: { x: 1 }
",
	);

	let error = store()
		.get(&path)
		.err()
		.unwrap_or_else(|| panic!("expected an error"));
	assert!(matches!(error, BitsError::RegistryLoad { .. }));
	assert!(matches!(error.root_cause(), BitsError::InvalidQuery(message) if message.contains("contex")));
}

#[test]
fn constants_where_has() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"constants.yaml",
		r"
constants:
  - name: gravity
    symbol: g
    value: 9.81
  - name: light
    symbol: c
    value: 299792458
    unit: m/s
targets:
  - name: sheet
    template: sheet.tex
    queries:
      constants:
        where: { has: [unit] }
      unitless:
        kind: constants
        where: { missing: [unit] }
",
	);

	let registry = store().get(&path)?;
	let sheet = registry.target("sheet").unwrap_or_else(|| panic!("no sheet"));
	assert_eq!(names(sheet.context().get("constants")), vec!["light"]);
	assert_eq!(names(sheet.context().get("unitless")), vec!["gravity"]);

	Ok(())
}

#[test]
fn imports_append_dependency_elements() -> BitsResult<()> {
	let tmp = workspace();
	write(
		tmp.path(),
		"shared/index.yml",
		r"
tags: [shared]
bits:
  - name: imported
    src: imported
constants:
  - name: pi
    symbol: '\pi'
    value: 3.14159
",
	);
	let path = write(
		tmp.path(),
		"main.yaml",
		r"
imports:
  - registry: shared
  - registry: shared/index.yml
bits:
  - name: local
    src: local
",
	);

	let registry = store().get(&path)?;
	assert_eq!(names_of(&registry.bits()), vec!["local", "imported"]);
	assert_eq!(names_of(&registry.constants()), vec!["pi"]);
	assert_eq!(registry.constants()[0].tags(), ["shared".to_string()]);

	let shared = resolve_registry_path(&tmp.path().join("shared"))?;
	assert_eq!(registry.dependencies(), vec![shared]);

	Ok(())
}

#[test]
fn diamond_imports_share_elements() -> BitsResult<()> {
	let tmp = workspace();
	write(tmp.path(), "base.yaml", "bits:\n  - name: base\n    src: base\n");
	write(tmp.path(), "left.yaml", "imports:\n  - registry: base.yaml\n");
	write(tmp.path(), "right.yaml", "imports:\n  - registry: base.yaml\n");
	let path = write(
		tmp.path(),
		"top.yaml",
		"imports:\n  - registry: left.yaml\n  - registry: right.yaml\n",
	);

	let registry = store().get(&path)?;
	assert_eq!(names_of(&registry.bits()), vec!["base"]);

	Ok(())
}

#[test]
fn import_cycles_are_reference_errors() {
	let tmp = workspace();
	write(tmp.path(), "a.yaml", "imports:\n  - registry: b.yaml\n");
	write(tmp.path(), "b.yaml", "imports:\n  - registry: a.yaml\n");

	let error = store()
		.get(&tmp.path().join("a.yaml"))
		.err()
		.unwrap_or_else(|| panic!("expected a cycle"));
	let Some(ReferenceError::ImportCycle { chain }) = error.reference() else {
		panic!("unexpected error: {error}");
	};
	assert!(chain.contains("a.yaml") && chain.contains("b.yaml"), "{chain}");
}

#[test]
fn preset_selecting_itself_is_a_reference_error() {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"loop.yaml",
		r"
bits:
  - name: X
    presets:
      - name: p
        queries:
          blocks:
            where: { name: X }
            preset: p
    src: x
targets:
  - name: T
    template: t.tex
    queries:
      blocks:
        where: { name: X }
        preset: p
",
	);

	let error = store()
		.get(&path)
		.err()
		.unwrap_or_else(|| panic!("expected a cycle"));
	let Some(ReferenceError::PresetCycle { chain }) = error.reference() else {
		panic!("unexpected error: {error}");
	};
	assert_eq!(chain, "X[p] -> X[p]");
}

#[test]
fn presets_selecting_each_other_are_a_reference_error() {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"pair.yaml",
		r"
bits:
  - name: A
    presets:
      - name: up
        queries:
          blocks:
            where: { name: B }
            preset: down
    src: a
  - name: B
    presets:
      - name: down
        queries:
          blocks:
            where: { name: A }
            preset: up
    src: b
targets:
  - name: T
    template: t.tex
    queries:
      blocks:
        where: { name: A }
        preset: up
",
	);

	let error = store()
		.get(&path)
		.err()
		.unwrap_or_else(|| panic!("expected a cycle"));
	let Some(ReferenceError::PresetCycle { chain }) = error.reference() else {
		panic!("unexpected error: {error}");
	};
	assert_eq!(chain, "A[up] -> B[down] -> A[up]");
}

#[test]
fn same_bit_with_another_preset_is_not_a_cycle() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"nested.yaml",
		r"
bits:
  - name: X
    presets:
      - name: outer
        queries:
          inner:
            where: { name: X }
            preset: plain
      - name: plain
        context:
          depth: 1
    src: x
targets:
  - name: T
    template: t.tex
    queries:
      blocks:
        where: { name: X }
        preset: outer
",
	);

	let registry = store().get(&path)?;
	let target = registry
		.target("T")
		.unwrap_or_else(|| panic!("missing target"));
	let block = first_block(target.context(), "blocks");
	let inner = first_block(block.context(), "inner");
	assert_eq!(number(inner.context().get("depth")), Some(1));

	Ok(())
}

#[test]
fn importing_a_loaded_registry_keeps_its_targets() -> BitsResult<()> {
	let tmp = workspace();
	let a = write(
		tmp.path(),
		"a.yaml",
		"bits:\n  - name: shared\n    src: s\ntargets:\n  - name: exam\n    template: t.tex\n",
	);
	let b = write(
		tmp.path(),
		"b.yaml",
		"imports:\n  - registry: a.yaml\nbits:\n  - name: own\n    src: o\n",
	);
	let store = store();

	let first = store.get(&a)?;
	assert_eq!(first.targets().len(), 1);

	let importer = store.get(&b)?;
	assert_eq!(names_of(&importer.bits()), vec!["own", "shared"]);
	assert_eq!(names_of(&first.targets()), vec!["exam"]);

	Ok(())
}

#[test]
fn extends_cycle_in_registry_is_wrapped_in_load_error() {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"cycle.yaml",
		r"
targets:
  - name: A
    template: t.tex
    extends: B
  - name: B
    extends: A
",
	);

	let error = store()
		.get(&path)
		.err()
		.unwrap_or_else(|| panic!("expected a cycle"));
	assert!(matches!(error, BitsError::RegistryLoad { .. }));
	assert!(matches!(error.reference(), Some(ReferenceError::TargetCycle { .. })));
}

#[test]
fn cross_file_extends_loads_the_base_registry() -> BitsResult<()> {
	let tmp = workspace();
	write(
		tmp.path(),
		"bases/common.yaml",
		r"
targets:
  - name: Base
    template: base.tex
    context:
      title: Base title
      course: Physics
",
	);
	let path = write(
		tmp.path(),
		"main.yaml",
		r"
targets:
  - name: final
    extends: bases/common.yaml::Base
    context:
      title: Final
",
	);

	let registry = store().get(&path)?;
	let final_target = registry.target("final").unwrap_or_else(|| panic!("no target"));
	assert_eq!(final_target.context().get("title").and_then(ContextValue::as_str), Some("Final"));
	assert_eq!(final_target.context().get("course").and_then(ContextValue::as_str), Some("Physics"));

	let directory = registry.path().parent().unwrap_or_else(|| panic!("no parent"));
	assert_eq!(final_target.template(), directory.join("base.tex"));
	assert_eq!(
		registry.dependencies(),
		vec![resolve_registry_path(&tmp.path().join("bases/common.yaml"))?]
	);

	Ok(())
}

#[test]
fn failed_reload_keeps_previous_collections() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(tmp.path(), "questions.yaml", QUESTIONS);
	let store = store();
	let registry = store.get(&path)?;

	write(tmp.path(), "questions.yaml", "bits:\n  - name: broken\n    src: {}\n");
	let error = registry
		.reload(&store)
		.err()
		.unwrap_or_else(|| panic!("expected an error"));

	assert!(matches!(error.root_cause(), BitsError::EmptyFragments { bit } if bit == "broken"));
	assert_eq!(registry.status(), LoadStatus::Failed);
	assert_eq!(names_of(&registry.bits()), vec!["projectile", "pendulum", "two-part"]);
	assert!(registry.target("exam").is_some());

	write(tmp.path(), "questions.yaml", "bits:\n  - name: fixed\n    src: ok\n");
	let again = store.get(&path)?;
	assert!(Arc::ptr_eq(&registry, &again));
	assert_eq!(names_of(&registry.bits()), vec!["fixed"]);

	Ok(())
}

#[test]
fn missing_registry_is_not_found() {
	let tmp = workspace();
	let result = store().get(&tmp.path().join("missing.yaml"));
	assert!(matches!(result, Err(BitsError::RegistryNotFound { .. })));

	let empty_dir = tmp.path().join("empty");
	std::fs::create_dir_all(&empty_dir).unwrap_or_else(|e| panic!("mkdir: {e}"));
	assert!(matches!(
		store().get(&empty_dir),
		Err(BitsError::RegistryNotFound { .. })
	));
}

#[test]
fn variables_are_interpolated_from_config() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(
		tmp.path(),
		"exam.yaml",
		"targets:\n  - name: exam\n    template: t.tex\n    context:\n      title: '${course} final ${unknown}'\n",
	);
	let config = BitsConfig::from_toml_str("[variables]\ncourse = \"Physics 101\"\n")?;

	let registry = RegistryStore::new(config).get(&path)?;
	let exam = registry.target("exam").unwrap_or_else(|| panic!("no target"));
	assert_eq!(
		exam.context().get("title").and_then(ContextValue::as_str),
		Some("Physics 101 final ${unknown}")
	);

	Ok(())
}

#[test]
fn target_without_template_needs_a_default() -> BitsResult<()> {
	let tmp = workspace();
	let path = write(tmp.path(), "exam.yaml", "targets:\n  - name: exam\n");

	let error = store()
		.get(&path)
		.err()
		.unwrap_or_else(|| panic!("expected an error"));
	assert!(matches!(error.root_cause(), BitsError::MissingTemplate { target } if target == "exam"));

	let config = BitsConfig::from_toml_str("[defaults]\ntemplate = \"/templates/default.tex\"\n")?;
	let registry = RegistryStore::new(config).get(&path)?;
	let exam = registry.target("exam").unwrap_or_else(|| panic!("no target"));
	assert_eq!(exam.template(), Path::new("/templates/default.tex"));

	Ok(())
}

#[test]
fn multi_fragment_bits_render_by_part() -> BitsResult<()> {
	let engine = TemplateEngine::new()?;
	let bit = bit_from(json!({
		"name": "two-part",
		"src": { "question": "Compute \\VAR{ x }.", "answer": "\\VAR{ x * 2 }" },
	}));
	let mut context = Context::new();
	context.insert("x".to_string(), ContextValue::from(json!(4)));
	let block = Arc::new(Block::new(bit, context, serde_json::Map::new()));

	assert_eq!(block.render(&engine, Some("answer"))?, "8");

	let error = block
		.render(&engine, None)
		.err()
		.unwrap_or_else(|| panic!("expected an error"));
	assert!(error.to_string().contains("question, answer"), "{error}");

	let error = block
		.render(&engine, Some("hint"))
		.err()
		.unwrap_or_else(|| panic!("expected an error"));
	assert!(error.to_string().contains("no fragment `hint`"), "{error}");

	let mut root = Context::new();
	root.insert("block".to_string(), ContextValue::Block(block));
	let rendered = engine.render_str(
		r#"\VAR{ block.fragments.question.render() }|\VAR{ block.fragment("answer").render(x=10) }|\VAR{ block.render("question", x=5) }"#,
		&root,
	)?;
	assert_eq!(rendered, "Compute 4.|20|Compute 5.");

	Ok(())
}

#[test]
fn empty_fragment_map_is_rejected() {
	let decl: BitDecl = serde_json::from_value(json!({ "name": "empty", "src": {} }))
		.unwrap_or_else(|e| panic!("decl: {e}"));

	assert!(matches!(
		Bit::from_decl(decl, &[]),
		Err(BitsError::EmptyFragments { bit }) if bit == "empty"
	));
}

#[test]
fn template_syntax_and_filters() -> BitsResult<()> {
	let engine = TemplateEngine::new()?;
	let mut context = Context::new();
	context.insert("flag".to_string(), ContextValue::Bool(true));
	context.insert("value".to_string(), ContextValue::from(json!(2.7)));
	context.insert("g".to_string(), ContextValue::Constant(constant("gravity", "g", "9.81")));

	let rendered = engine.render_str(
		"\\BLOCK{ if flag }yes\\BLOCK{ endif } \\VAR{ value | floor } \\VAR{ value | ceil } \\VAR{ g }\\#{ hidden }",
		&context,
	)?;
	assert_eq!(rendered, "yes 2 3 g = 9.81");

	Ok(())
}

struct ShoutPlugin;

impl TemplatePlugin for ShoutPlugin {
	fn name(&self) -> &str {
		"shout"
	}

	fn register(&self, env: &mut Environment<'static>) {
		env.add_filter("shout", |value: String| value.to_uppercase());
	}
}

#[test]
fn plugins_register_filters() -> BitsResult<()> {
	let plugins: Vec<Arc<dyn TemplatePlugin>> = vec![Arc::new(ShoutPlugin)];
	let engine = TemplateEngine::with_plugins(plugins)?;
	let rendered = engine.render_str("\\VAR{ 'hi' | shout }", &Context::new())?;
	assert_eq!(rendered, "HI");

	Ok(())
}

#[test]
fn missing_template_file_is_a_load_error() -> BitsResult<()> {
	let tmp = workspace();
	let engine = TemplateEngine::new()?;
	let result = engine.render_file(&tmp.path().join("nope.tex"), &Context::new());

	assert!(matches!(result, Err(BitsError::TemplateLoad { .. })));

	Ok(())
}

const REPRESENTATIVE: &str = r#"
tags: [physics]
imports:
  - registry: shared.yaml
constants:
  - name: gravity
    symbol: g
    value: '9.81'
bits:
  - name: projectile
    tags: [kinematics]
    author: ada
    level: 2
    defaults:
      context:
        speed: 10
    presets:
      - name: fast
        context:
          speed: 30
      - name: tagged
        queries:
          blocks:
            where:
              tags: [a]
        overrides:
          - path: blocks.where.tags
            value: [b]
    src: 'A ball at \VAR{ speed } m/s.'
  - name: two-part
    src:
      question: 'Compute \VAR{ x }.'
      answer: '\VAR{ x * 2 }'
  - name: dashes
    src: "before\n---\n```\nafter"
targets:
  - name: Base
    template: exam.tex
    queries:
      blocks:
        - where:
            name: projectile
        - where:
            name: two-part
  - name: Final
    extends: [Base]
    merge:
      context: replace
    overrides:
      - path: blocks[2]
        op: remove
"#;

#[rstest]
#[case::yaml(DocumentFormat::Yaml)]
#[case::json(DocumentFormat::Json)]
#[case::markdown(DocumentFormat::Markdown)]
fn documents_round_trip(#[case] format: DocumentFormat) -> BitsResult<()> {
	let variables = IndexMap::new();
	let document = parse_str(REPRESENTATIVE, DocumentFormat::Yaml, "representative.yaml", &variables)?;
	assert_eq!(document.bits.len(), 3);
	assert_eq!(document.targets[1].bases(), ["Base".to_string()]);

	let dumped = dump_str(&document, format)?;
	let parsed = parse_str(&dumped, format, "dumped", &variables)?;
	assert_eq!(parsed, document);

	Ok(())
}

#[test]
fn markdown_registry_layout() -> BitsResult<()> {
	let document = parse_str(
		"---\ntags: [physics]\n---\nname: g1\n```latex\nx\n```\n",
		DocumentFormat::Markdown,
		"g1.md",
		&IndexMap::new(),
	)?;
	let markdown = dump_str(&document, DocumentFormat::Markdown)?;

	insta::assert_snapshot!(markdown, @r"
	---
	tags:
	- physics
	---
	name: g1
	```latex
	x
	```
	");

	Ok(())
}

#[test]
fn markdown_fragments_need_names() {
	let result = parse_str(
		"---\n---\nname: two\n```latex\na\n```\n```latex\nb\n```\n",
		DocumentFormat::Markdown,
		"two.md",
		&IndexMap::new(),
	);

	assert!(matches!(result, Err(BitsError::RegistryParse { .. })));
}

#[test]
fn toml_registries_parse_but_do_not_dump() -> BitsResult<()> {
	let document = parse_str(
		"tags = [\"physics\"]\n\n[[bits]]\nname = \"a\"\nsrc = \"x\"\n",
		DocumentFormat::Toml,
		"a.toml",
		&IndexMap::new(),
	)?;
	assert_eq!(document.bits[0].name.as_deref(), Some("a"));
	assert!(matches!(
		dump_str(&document, DocumentFormat::Toml),
		Err(BitsError::UnsupportedFormat(_))
	));

	Ok(())
}

#[test]
fn interpolation_reaches_nested_strings() {
	let mut variables = IndexMap::new();
	variables.insert("term".to_string(), "Fall".to_string());

	let value = interpolate(
		json!({ "a": ["${term}", { "b": "${ term } ${other}" }], "n": 1 }),
		&variables,
	);
	assert_eq!(value, json!({ "a": ["Fall", { "b": "Fall ${other}" }], "n": 1 }));
}

#[test]
fn unknown_registry_format() {
	assert!(matches!(
		DocumentFormat::from_extension("docx"),
		Err(BitsError::UnsupportedFormat(ext)) if ext == "docx"
	));
}

#[test]
fn config_layers_ini_toml_and_environment() -> BitsResult<()> {
	let tmp = workspace();
	write(
		tmp.path(),
		".bitsrc",
		"[DEFAULT]\ntemplate = legacy.tex\ndest = legacy-out\n\n[output]\ntex = yes\n",
	);
	write(
		tmp.path(),
		"bits.toml",
		"[defaults]\ntemplate = \"modern.tex\"\n\n[variables]\ncourse = \"Physics\"\n",
	);

	let config = BitsConfig::load_with_env(tmp.path(), |key| {
		(key == ENV_DEST).then(|| "env-out".to_string())
	})?;

	assert_eq!(config.defaults.template, Some(PathBuf::from("modern.tex")));
	assert_eq!(config.defaults.dest, Some(PathBuf::from("env-out")));
	assert!(config.output.tex);
	assert!(config.output.pdf);
	assert_eq!(config.variables.get("course").map(String::as_str), Some("Physics"));
	assert_eq!(config.latex, LatexConfig::default());

	Ok(())
}

#[test]
fn config_discovery_prefers_root_file() {
	let tmp = workspace();
	assert_eq!(BitsConfig::resolve_path(tmp.path()), None);

	write(tmp.path(), ".config/bits.toml", "");
	write(tmp.path(), "bits.toml", "");
	assert_eq!(BitsConfig::resolve_path(tmp.path()), Some(tmp.path().join("bits.toml")));
}

#[test]
fn config_output_options() -> BitsResult<()> {
	let config = BitsConfig::from_toml_str(
		"[output]\npdf = false\nbuild_dir = \".bits/build\"\nkeep_intermediates = \"errors\"\n\n[latex]\ncommand = \"xelatex\"\n",
	)?;
	let options = CompileOptions::from_config(&config.output);

	assert!(!options.pdf);
	assert_eq!(options.build_dir, Some(PathBuf::from(".bits/build")));
	assert_eq!(options.keep_intermediates, KeepIntermediates::Errors);
	assert_eq!(config.latex.command, "xelatex");
	assert_eq!(config.latex.args, vec!["-interaction=nonstopmode".to_string()]);

	Ok(())
}

#[test]
fn invalid_config_is_reported() {
	assert!(matches!(
		BitsConfig::from_toml_str("[output]\npdf = \"maybe\"\n"),
		Err(BitsError::ConfigParse(_))
	));
}

#[rstest]
#[case::latex_error("! LaTeX Error: File `missing.sty' not found.\n", Some("File `missing.sty' not found."))]
#[case::package_error("! Package amsmath Error: \\begin{align} allowed only in paragraph mode.\n", Some("\\begin{align} allowed only in paragraph mode."))]
#[case::generic("! Undefined control sequence.\nl.3 \\foo\n", Some("Undefined control sequence."))]
#[case::prefers_latex_error("! Undefined control sequence.\n! LaTeX Error: Missing \\begin{document}.\n", Some("Missing \\begin{document}."))]
#[case::clean("Output written on doc.pdf (1 page).\n", None)]
fn extracts_log_errors(#[case] log: &str, #[case] expected: Option<&str>) {
	assert_eq!(extract_log_error(log).as_deref(), expected);
}

#[cfg(unix)]
#[test]
fn latex_compiler_runs_in_a_work_dir_and_caches() -> BitsResult<()> {
	let tmp = workspace();
	let compiler = LatexCompiler::new("sh", vec![
		"-c".to_string(),
		"touch \"$(basename \"$0\" .tex).pdf\"".to_string(),
	]);
	let dest = tmp.path().join("out/doc.pdf");
	let options = CompileOptions {
		pdf: true,
		tex: true,
		..CompileOptions::default()
	};

	let artifact = compiler.compile("\\documentclass{article}", &dest, &options)?;
	assert!(!artifact.skipped);
	assert!(dest.is_file());
	assert!(tmp.path().join("out/doc.tex").is_file());

	let again = compiler.compile("\\documentclass{article}", &dest, &options)?;
	assert!(again.skipped);

	Ok(())
}

#[cfg(unix)]
#[test]
fn latex_failures_keep_the_log() {
	let tmp = workspace();
	let compiler = LatexCompiler::new("sh", vec![
		"-c".to_string(),
		"echo '! LaTeX Error: Something broke.' > \"$(basename \"$0\" .tex).log\"; exit 1".to_string(),
	]);
	let dest = tmp.path().join("doc.pdf");
	let options = CompileOptions {
		pdf: true,
		keep_intermediates: KeepIntermediates::Errors,
		intermediates_dir: Some(tmp.path().join("keep")),
		..CompileOptions::default()
	};

	let error = compiler
		.compile("x", &dest, &options)
		.err()
		.unwrap_or_else(|| panic!("expected a failure"));
	match error {
		BitsError::Compile { detail, log_file, .. } => {
			assert_eq!(detail, "Something broke.");
			assert_eq!(log_file, Some(tmp.path().join("doc_latex_error.log").display().to_string()));
		}
		other => panic!("unexpected error: {other}"),
	}
	assert!(tmp.path().join("keep/doc/doc.tex").is_file());
	assert!(!dest.exists());
}

#[test]
fn tex_only_output_skips_the_compiler() -> BitsResult<()> {
	let tmp = workspace();
	let compiler = LatexCompiler::new("definitely-not-a-latex-binary", Vec::new());
	let dest = tmp.path().join("doc.pdf");
	let options = CompileOptions {
		pdf: false,
		tex: true,
		..CompileOptions::default()
	};

	let artifact = compiler.compile("body", &dest, &options)?;
	assert_eq!(artifact.tex, Some(tmp.path().join("doc.tex")));
	assert_eq!(artifact.pdf, None);
	assert_eq!(
		std::fs::read_to_string(tmp.path().join("doc.tex")).unwrap_or_default(),
		"body"
	);

	Ok(())
}

#[test]
fn unchanged_tex_is_not_rewritten() -> BitsResult<()> {
	let tmp = workspace();
	let compiler = LatexCompiler::new("definitely-not-a-latex-binary", Vec::new());
	let dest = tmp.path().join("doc.pdf");
	let tex = tmp.path().join("doc.tex");
	let options = CompileOptions {
		pdf: false,
		tex: true,
		..CompileOptions::default()
	};
	let stamp = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
	let modified = |path: &Path| -> BitsResult<std::time::SystemTime> {
		Ok(std::fs::metadata(path)?.modified()?)
	};

	compiler.compile("body", &dest, &options)?;
	std::fs::File::options().write(true).open(&tex)?.set_modified(stamp)?;

	compiler.compile("body", &dest, &options)?;
	assert_eq!(modified(&tex)?, stamp);

	compiler.compile("changed", &dest, &options)?;
	assert_ne!(modified(&tex)?, stamp);
	assert_eq!(std::fs::read_to_string(&tex)?, "changed");

	Ok(())
}
