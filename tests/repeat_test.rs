mod common;

use std::collections::BTreeSet;

use common::definition;
use formcascade::{BindDef, ChangeKind, Form, FormConfig, RepeatDef, SerializeOptions};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use regex::Regex;

const REP: &str = "/data/rep";

fn repeat_form(ordinals: bool) -> Form {
    let mut def = definition("<data><rep><q/><pos/></rep><total/></data>");
    def.repeats.push(RepeatDef {
        path: REP.into(),
        count: None,
    });
    def.binds = vec![
        BindDef {
            nodeset: "/data/rep/pos".into(),
            calculate: Some("position(..)".into()),
            ..Default::default()
        },
        BindDef {
            nodeset: "/data/total".into(),
            calculate: Some("count(/data/rep)".into()),
            ..Default::default()
        },
    ];
    let config = if ordinals {
        FormConfig::default().with_ordinals()
    } else {
        FormConfig::default()
    };
    Form::load(&def, None, config).unwrap()
}

fn ordinals(form: &Form) -> Vec<u64> {
    (0..form.repeat_count(REP))
        .filter_map(|i| form.ordinal(REP, i))
        .collect()
}

#[test]
fn test_positions_follow_insertion_and_removal() {
    let mut form = repeat_form(false);
    form.set_value("/data/rep/q", 0, "first").unwrap();
    form.add_repeat(REP, None).unwrap();
    form.add_repeat(REP, Some(0)).unwrap();
    assert_eq!(form.value("/data/total", 0), Some("3"));
    assert_eq!(form.value("/data/rep/q", 1), Some("first"));
    let positions: Vec<_> = (0..3).map(|i| form.value("/data/rep/pos", i)).collect();
    assert_eq!(positions, vec![Some("1"), Some("2"), Some("3")]);

    form.remove_repeat(REP, 0).unwrap();
    assert_eq!(form.value("/data/total", 0), Some("2"));
    assert_eq!(form.value("/data/rep/q", 0), Some("first"));
    assert_eq!(form.value("/data/rep/pos", 0), Some("1"));
}

#[test]
fn test_removing_the_last_instance_leaves_an_empty_one() {
    let mut form = repeat_form(false);
    form.set_value("/data/rep/q", 0, "answer").unwrap();
    let mut events = form.subscribe();
    assert!(form.remove_repeat(REP, 0).unwrap());
    assert_eq!(form.repeat_count(REP), 1);
    assert_eq!(form.value("/data/rep/q", 0), Some(""));
    assert_eq!(form.value("/data/total", 0), Some("1"));
    let structure = events
        .drain()
        .into_iter()
        .filter(|e| e.kind == ChangeKind::Structure)
        .count();
    assert_eq!(structure, 2);

    assert!(!form.remove_repeat(REP, 5).unwrap());
}

#[test]
fn test_ordinals_are_not_reused() {
    let mut form = repeat_form(true);
    form.add_repeat(REP, None).unwrap();
    form.add_repeat(REP, None).unwrap();
    assert_eq!(ordinals(&form), vec![1, 2, 3]);

    form.remove_repeat(REP, 1).unwrap();
    form.add_repeat(REP, None).unwrap();
    assert_eq!(ordinals(&form), vec![1, 3, 4]);

    let xml = form.serialize(SerializeOptions::default());
    assert!(xml.contains("enk:last-used-ordinal=\"4\""));
}

#[test]
fn test_ordinals_continue_after_reload() {
    let mut form = repeat_form(true);
    form.add_repeat(REP, None).unwrap();
    form.remove_repeat(REP, 0).unwrap();
    let saved = form.serialize(SerializeOptions::default());

    let mut def = definition("<data><rep><q/><pos/></rep><total/></data>");
    def.repeats.push(RepeatDef {
        path: REP.into(),
        count: None,
    });
    let mut reloaded = Form::load(&def, Some(&saved), FormConfig::default().with_ordinals()).unwrap();
    assert_eq!(ordinals(&reloaded), vec![2]);
    reloaded.add_repeat(REP, None).unwrap();
    assert_eq!(ordinals(&reloaded), vec![2, 3]);
}

#[test]
fn test_nested_series_of_added_instance_are_numbered() {
    let mut def = definition("<d><o><i><v/></i></o></d>");
    for path in ["/d/o", "/d/o/i"] {
        def.repeats.push(RepeatDef {
            path: path.into(),
            count: None,
        });
    }
    let mut form = Form::load(&def, None, FormConfig::default().with_ordinals()).unwrap();
    assert_eq!(form.ordinal("/d/o/i", 0), Some(1));

    form.add_repeat("/d/o", None).unwrap();
    assert_eq!(form.ordinal("/d/o", 1), Some(2));
    assert_eq!(form.ordinal("/d/o/i", 1), Some(1));

    form.add_repeat("/d/o/i", None).unwrap();
    assert_eq!(form.repeat_count("/d/o/i"), 3);
    assert_eq!(form.ordinal("/d/o/i", 2), Some(2));

    form.remove_repeat("/d/o", 0).unwrap();
    form.remove_repeat("/d/o", 0).unwrap();
    assert_eq!(form.ordinal("/d/o", 0), Some(3));
    assert_eq!(form.ordinal("/d/o/i", 0), Some(1));
}

/// `q` answers in document order, read back from the serialized record.
fn serialized_answers(form: &Form) -> Vec<String> {
    let answer = Regex::new(r"<q>([^<]*)</q>|<q/>").unwrap();
    answer
        .captures_iter(&form.serialize(SerializeOptions::default()))
        .map(|c| c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect()
}

#[derive(Debug, Clone)]
enum Op {
    Add(Option<usize>),
    Remove(usize),
    /// Remove the instance at the index and create one in its place.
    Replace(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::option::of(0usize..6).prop_map(Op::Add),
        (0usize..6).prop_map(Op::Remove),
        (0usize..6).prop_map(Op::Replace),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_repeat_operations_keep_series_consistent(ops in proptest::collection::vec(op(), 1..24)) {
        let mut form = repeat_form(true);
        let mut expected = 1usize;
        let mut answers = vec![String::new()];
        let mut seen: BTreeSet<u64> = ordinals(&form).into_iter().collect();

        for (step, op) in ops.into_iter().enumerate() {
            let before: BTreeSet<u64> = ordinals(&form).into_iter().collect();
            match op {
                Op::Add(after) => {
                    form.add_repeat(REP, after).unwrap();
                    let at = after.map_or(expected, |n| n.min(expected));
                    let label = format!("v{}", step);
                    form.set_value("/data/rep/q", at, &label).unwrap();
                    answers.insert(at, label);
                    expected += 1;
                }
                Op::Remove(index) => {
                    let removed = form.remove_repeat(REP, index).unwrap();
                    prop_assert_eq!(removed, index < expected);
                    if removed {
                        answers.remove(index);
                        if expected > 1 {
                            expected -= 1;
                        } else {
                            answers.push(String::new());
                        }
                    }
                }
                Op::Replace(index) => {
                    if index < expected && expected > 1 {
                        form.remove_repeat(REP, index).unwrap();
                        form.add_repeat(REP, Some(index)).unwrap();
                        answers[index] = String::new();
                    }
                }
            }
            prop_assert_eq!(&serialized_answers(&form), &answers);

            prop_assert_eq!(form.repeat_count(REP), expected);
            let total = expected.to_string();
            prop_assert_eq!(form.value("/data/total", 0), Some(total.as_str()));

            let current = ordinals(&form);
            let unique: BTreeSet<u64> = current.iter().copied().collect();
            prop_assert_eq!(unique.len(), current.len());
            for ordinal in unique.difference(&before) {
                prop_assert!(!seen.contains(ordinal), "ordinal {} reused", ordinal);
                seen.insert(*ordinal);
            }

            let xml = form.serialize(SerializeOptions::default());
            prop_assert_eq!(xml.matches("<rep ").count(), expected);
        }
    }
}
