//! End-to-end scenarios through the public surface: build a document, read
//! values, push updates through the queue, and watch what recomputes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use doc_flow::{
    ArrayBehavior, ComponentRegistry, ComponentTypeDef, DefinitionResult, DepTarget,
    DependencySpec, DocumentCore, InverseDefinition, InverseInstruction, InverseResult,
    KeyInstruction, NoopResolver, SerializedComponent, StateValue, StateVarDefinition,
    StateVarTemplate, TemplateKind,
};

/// A `sum` clone whose calculate function counts its invocations.
fn counting_sum_type(counter: Arc<AtomicUsize>) -> ComponentTypeDef {
    ComponentTypeDef {
        type_tag: "countingSum",
        is_composite: false,
        accepted_child_types: vec![],
        adapts_to: vec![],
        state: vec![StateVarTemplate {
            name: "value".into(),
            kind: TemplateKind::Scalar,
            definition: Arc::new(StateVarDefinition {
                dependencies: vec![(
                    "children".into(),
                    DependencySpec::ChildStateVars { var: "value".into() },
                )],
                calculate: Arc::new(move |deps| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let total: f64 = deps
                        .value("children")
                        .as_list()
                        .unwrap_or(&[])
                        .iter()
                        .map(StateValue::coerce_number)
                        .sum();
                    Ok(DefinitionResult::new().with_value("value", total))
                }),
                array: None,
                produces: vec!["value".into()],
                mark_stale: None,
            }),
            inverse: None,
            for_renderer: true,
            default_value: StateValue::Number(0.0),
            has_essential: false,
            fixed: false,
            fix_location: false,
            modify_indirectly: true,
        }],
        actions: IndexMap::new(),
        create_replacements: None,
        calculate_replacement_changes: None,
    }
}

/// A `numberList` clone whose by-key function counts the keys it computes.
fn counting_list_type(keys_computed: Arc<AtomicUsize>) -> ComponentTypeDef {
    ComponentTypeDef {
        type_tag: "countingList",
        is_composite: false,
        accepted_child_types: vec![],
        adapts_to: vec![],
        state: vec![StateVarTemplate {
            name: "values".into(),
            kind: TemplateKind::Array {
                dimensions: 1,
                entry_prefix: Some("value".into()),
            },
            definition: Arc::new(StateVarDefinition {
                dependencies: vec![(
                    "countAttr".into(),
                    DependencySpec::Attribute {
                        name: "count".into(),
                        default: StateValue::Integer(0),
                    },
                )],
                calculate: Arc::new(|_| Ok(DefinitionResult::new())),
                array: Some(ArrayBehavior {
                    size: Arc::new(|deps| {
                        let count = deps.value("countAttr").as_integer().unwrap_or(0).max(0);
                        Ok(vec![count as usize])
                    }),
                    calculate_keys: Arc::new(move |keys, _| {
                        keys_computed.fetch_add(keys.len(), Ordering::SeqCst);
                        Ok(keys
                            .iter()
                            .map(|k| (k.clone(), KeyInstruction::UseEssentialOrDefault))
                            .collect())
                    }),
                }),
                produces: vec!["values".into()],
                mark_stale: None,
            }),
            inverse: Some(Arc::new(InverseDefinition {
                invert: Arc::new(|ctx| {
                    let instructions = ctx
                        .desired
                        .keys
                        .iter()
                        .map(|(key, value)| InverseInstruction::SetEssential {
                            key: format!("values:{key}"),
                            value: value.clone(),
                        })
                        .collect();
                    Ok(InverseResult::with(instructions))
                }),
                essential_write_allowed: true,
            })),
            for_renderer: true,
            default_value: StateValue::Integer(0),
            has_essential: true,
            fixed: false,
            fix_location: false,
            modify_indirectly: true,
        }],
        actions: IndexMap::new(),
        create_replacements: None,
        calculate_replacement_changes: None,
    }
}

fn core_with(extra: ComponentTypeDef) -> DocumentCore {
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(extra);
    DocumentCore::new(registry, Box::new(NoopResolver))
}

#[test]
fn repeated_reads_compute_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut core = core_with(counting_sum_type(Arc::clone(&calls)));
    core.build(vec![SerializedComponent::new("countingSum")
        .with_child(SerializedComponent::new("number").with_state("value", 2i64))
        .with_child(SerializedComponent::new("number").with_state("value", 3i64))])
        .unwrap();
    let sum = core.roots[0];

    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 5.0);
    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 5.0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let child = core.components.get(sum).unwrap().active_children[0];
    core.request_update(child, "value", 10i64, false).unwrap();
    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 13.0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn writing_back_the_same_value_wakes_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut core = core_with(counting_sum_type(Arc::clone(&calls)));
    core.build(vec![SerializedComponent::new("countingSum")
        .with_child(SerializedComponent::new("number").with_state("value", 2i64))])
        .unwrap();
    let sum = core.roots[0];
    let child = core.components.get(sum).unwrap().active_children[0];

    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 2.0);
    core.request_update(child, "value", 2i64, false).unwrap();
    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 2.0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn changing_one_array_entry_recomputes_one_key() {
    let keys = Arc::new(AtomicUsize::new(0));
    let mut core = core_with(counting_list_type(Arc::clone(&keys)));
    core.build(vec![SerializedComponent::new("countingList")
        .with_attribute("count", 3i64)
        .with_state(
            "values",
            vec![
                StateValue::Integer(1),
                StateValue::Integer(2),
                StateValue::Integer(3),
            ],
        )])
        .unwrap();
    let list = core.roots[0];

    assert_eq!(
        core.get_value(list, "values").unwrap(),
        StateValue::List(vec![
            StateValue::Integer(1),
            StateValue::Integer(2),
            StateValue::Integer(3),
        ])
    );
    assert_eq!(keys.load(Ordering::SeqCst), 3);

    // Updating the second entry dirties only key "1".
    core.request_update(list, "value2", 9i64, false).unwrap();
    assert_eq!(core.get_value(list, "value2").unwrap(), StateValue::Integer(9));
    assert_eq!(keys.load(Ordering::SeqCst), 4);

    assert_eq!(
        core.get_value(list, "values").unwrap(),
        StateValue::List(vec![
            StateValue::Integer(1),
            StateValue::Integer(9),
            StateValue::Integer(3),
        ])
    );
    assert_eq!(keys.load(Ordering::SeqCst), 4);
}

#[test]
fn sequence_grows_by_adding_only_the_new_tail() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("sequence").with_attribute("length", 3i64)])
        .unwrap();
    let seq = core.roots[0];
    let before = core
        .components
        .get(seq)
        .unwrap()
        .visible_replacements()
        .to_vec();
    assert_eq!(before.len(), 3);

    core.request_update(seq, "length", 5i64, false).unwrap();
    let after = core
        .components
        .get(seq)
        .unwrap()
        .visible_replacements()
        .to_vec();
    assert_eq!(after.len(), 5);
    // The first three replacements kept their identity.
    assert_eq!(&after[..3], &before[..]);
    assert_eq!(core.get_value(after[3], "value").unwrap(), StateValue::Integer(4));
    assert_eq!(core.get_value(after[4], "value").unwrap(), StateValue::Integer(5));
}

#[test]
fn copy_of_copy_forwards_both_hops() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("number")
        .with_name("a")
        .with_state("value", 1i64)])
        .unwrap();
    let source = core.roots[0];
    core.build(vec![
        SerializedComponent::new("copy").with_attribute("target", source.as_usize() as i64)
    ])
    .unwrap();
    let first_shadow = core
        .components
        .get(core.roots[1])
        .unwrap()
        .visible_replacements()[0];
    core.build(vec![SerializedComponent::new("copy")
        .with_attribute("target", first_shadow.as_usize() as i64)])
        .unwrap();
    let second_shadow = core
        .components
        .get(core.roots[2])
        .unwrap()
        .visible_replacements()[0];

    core.request_update(second_shadow, "value", 42i64, false).unwrap();
    assert_eq!(core.get_value(source, "value").unwrap(), StateValue::Integer(42));
    assert_eq!(
        core.get_value(first_shadow, "value").unwrap(),
        StateValue::Integer(42)
    );
}

#[test]
fn self_referential_copy_becomes_an_error_component() {
    let mut core = DocumentCore::with_builtins();
    // The copy's own index is 0; it targets itself.
    core.build(vec![
        SerializedComponent::new("copy").with_attribute("target", 0i64)
    ])
    .unwrap();
    let copy = core.roots[0];
    let replacement = core.components.get(copy).unwrap().visible_replacements()[0];
    assert_eq!(
        core.components.get(replacement).unwrap().component_type,
        "_error"
    );
}

#[test]
fn renderer_sees_fresh_values_after_update() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("number").with_state("value", 1i64)])
        .unwrap();
    let number = core.roots[0];
    let _ = core.render_updates().unwrap();

    core.request_update(number, "value", 6i64, false).unwrap();
    let updates = core.render_updates().unwrap();
    let update = updates
        .iter()
        .find(|u| u.component == number)
        .expect("renderer update for the changed component");
    assert_eq!(update.state_values.get("value"), Some(&StateValue::Integer(6)));

    // Nothing changed since the drain, so the next batch is empty.
    assert!(core.render_updates().unwrap().is_empty());
}

#[test]
fn skippable_updates_coalesce_but_settle_on_the_last() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("number").with_state("value", 0i64)])
        .unwrap();
    let number = core.roots[0];
    for v in 1..=20i64 {
        core.request_update(number, "value", v, true).unwrap();
    }
    assert_eq!(core.get_value(number, "value").unwrap(), StateValue::Integer(20));
}

#[test]
fn deleting_a_child_stales_the_parent_sum() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("sum")
        .with_child(SerializedComponent::new("number").with_state("value", 2i64))
        .with_child(SerializedComponent::new("number").with_state("value", 3i64))])
        .unwrap();
    let sum = core.roots[0];
    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 5.0);

    let doomed = core.components.get(sum).unwrap().active_children[1];
    core.delete_components(&[doomed]).unwrap();
    assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 2.0);
    assert!(!core.components.contains(doomed));
}

#[test]
fn entry_names_are_one_based_views() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("numberList")
        .with_attribute("count", 2i64)
        .with_state(
            "values",
            vec![StateValue::Integer(10), StateValue::Integer(20)],
        )])
        .unwrap();
    let list = core.roots[0];
    assert_eq!(core.get_value(list, "value1").unwrap(), StateValue::Integer(10));
    assert_eq!(core.get_value(list, "value2").unwrap(), StateValue::Integer(20));
    // Out-of-range entries materialize but read as null.
    assert_eq!(core.get_value(list, "value5").unwrap(), StateValue::Null);
}

/// A leaf whose `mirror` inverse first tries to push the desired value into
/// `locked`, which blocks non-initiating hops, and then records a note in
/// essential storage.
fn gauge_type() -> ComponentTypeDef {
    let mut locked = StateVarTemplate::essential_scalar("locked", 0i64);
    locked.modify_indirectly = false;
    ComponentTypeDef {
        type_tag: "gauge",
        is_composite: false,
        accepted_child_types: vec![],
        adapts_to: vec![],
        state: vec![
            locked,
            StateVarTemplate {
                name: "mirror".into(),
                kind: TemplateKind::Scalar,
                definition: Arc::new(StateVarDefinition {
                    dependencies: vec![(
                        "locked".into(),
                        DependencySpec::StateVar {
                            target: DepTarget::SelfComponent,
                            var: "locked".into(),
                        },
                    )],
                    calculate: Arc::new(|deps| {
                        Ok(DefinitionResult::new()
                            .with_value("mirror", deps.value("locked").clone()))
                    }),
                    array: None,
                    produces: vec!["mirror".into()],
                    mark_stale: None,
                }),
                inverse: Some(Arc::new(InverseDefinition {
                    invert: Arc::new(|ctx| {
                        let desired = ctx.desired.whole.clone().unwrap_or(StateValue::Null);
                        Ok(InverseResult::with(vec![
                            InverseInstruction::SetDependency {
                                dependency: "locked".into(),
                                desired: desired.clone(),
                            },
                            InverseInstruction::SetEssential {
                                key: "note".into(),
                                value: desired,
                            },
                        ]))
                    }),
                    essential_write_allowed: true,
                })),
                for_renderer: false,
                default_value: StateValue::Integer(0),
                has_essential: false,
                fixed: false,
                fix_location: false,
                modify_indirectly: true,
            },
        ],
        actions: IndexMap::new(),
        create_replacements: None,
        calculate_replacement_changes: None,
    }
}

#[test]
fn fixed_variables_reject_updates_with_a_warning() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("_error").with_state("message", "boom")])
        .unwrap();
    let error = core.roots[0];

    core.request_update(error, "message", "rewritten", false).unwrap();

    assert_eq!(
        core.get_value(error, "message").unwrap(),
        StateValue::Text("boom".into())
    );
    let warnings = core.take_warnings();
    assert!(warnings
        .iter()
        .any(|w| w.component == Some(error) && w.message.contains("fixed")));
}

#[test]
fn blocked_indirect_hop_leaves_the_other_instructions_standing() {
    let mut core = core_with(gauge_type());
    core.build(vec![SerializedComponent::new("gauge")]).unwrap();
    let gauge = core.roots[0];

    core.request_update(gauge, "mirror", 7i64, false).unwrap();

    // The hop into `locked` was rejected; the note write still landed.
    assert_eq!(core.get_value(gauge, "locked").unwrap(), StateValue::Integer(0));
    let essentials = core.take_essential_changes();
    assert_eq!(
        essentials.get(&(gauge, "note".to_string())),
        Some(&StateValue::Integer(7))
    );
    let warnings = core.take_warnings();
    assert!(warnings
        .iter()
        .any(|w| w.component == Some(gauge) && w.message.contains("indirectly")));
}

#[test]
fn renderer_repeats_children_only_when_the_child_list_changes() {
    let mut core = DocumentCore::with_builtins();
    core.build(vec![SerializedComponent::new("sum")
        .with_child(SerializedComponent::new("number").with_state("value", 2i64))
        .with_child(SerializedComponent::new("number").with_state("value", 3i64))])
        .unwrap();
    let sum = core.roots[0];
    let children = core.components.get(sum).unwrap().active_children.clone();
    let child = children[0];
    core.get_value(sum, "value").unwrap();

    // The first emission after the build carries the child list.
    core.request_update(child, "value", 4i64, false).unwrap();
    let updates = core.render_updates().unwrap();
    let update = updates.iter().find(|u| u.component == sum).unwrap();
    assert_eq!(update.children.as_deref(), Some(children.as_slice()));

    // A value-only change re-sends state, not children.
    core.request_update(child, "value", 5i64, false).unwrap();
    let updates = core.render_updates().unwrap();
    let update = updates.iter().find(|u| u.component == sum).unwrap();
    assert_eq!(update.children, None);

    // Deleting a child changes the list again.
    core.delete_components(&[children[1]]).unwrap();
    let updates = core.render_updates().unwrap();
    let update = updates.iter().find(|u| u.component == sum).unwrap();
    assert_eq!(update.children.as_deref(), Some(&children[..1]));
}
