mod common;

use common::{definition, household, MEMBER};
use formcascade::{
    BindDef, ChangeEvent, ChangeKind, Form, FormConfig, FormError, IssueKind, SerializeOptions,
};
use pretty_assertions::assert_eq;

#[test]
fn test_household_loads_with_defaults() {
    let form = household(FormConfig::default());
    assert!(form.instance_id().unwrap().starts_with("uuid:"));
    assert_eq!(form.repeat_count(MEMBER), 1);
    assert_eq!(form.value("/household/member/adult", 0), Some("no"));
    assert_eq!(form.value("/household/adults", 0), Some("0"));
    assert_eq!(form.value("/household/summary", 0), Some("0 of 1"));
    assert!(form.diagnostics().is_empty());
}

#[test]
fn test_calculations_across_repeat_instances() {
    let mut form = household(FormConfig::default());
    form.set_value("/household/size", 0, "3").unwrap();
    assert_eq!(form.repeat_count(MEMBER), 3);
    assert_eq!(form.value("/household/summary", 0), Some("0 of 3"));

    form.set_value("/household/member/age", 1, "40").unwrap();
    assert_eq!(form.value("/household/member/adult", 0), Some("no"));
    assert_eq!(form.value("/household/member/adult", 1), Some("yes"));
    assert_eq!(form.value("/household/adults", 0), Some("1"));
    assert_eq!(form.value("/household/summary", 0), Some("1 of 3"));

    form.remove_repeat(MEMBER, 1).unwrap();
    assert_eq!(form.value("/household/adults", 0), Some("0"));
}

#[test]
fn test_readonly_calculation_refuses_edits() {
    let mut form = household(FormConfig::default());
    assert!(form.is_readonly("/household/summary", 0).unwrap());
    assert_eq!(
        form.set_value("/household/summary", 0, "edited"),
        Err(FormError::ReadonlyNode {
            path: "/household/summary".into()
        })
    );
    assert_eq!(form.value("/household/summary", 0), Some("0 of 1"));
}

#[test]
fn test_non_relevant_nodes_are_not_serialized() {
    let mut form = household(FormConfig::default());
    assert!(!form.is_relevant("/household/member/pregnant", 0).unwrap());

    form.set_value("/household/member/sex", 0, "f").unwrap();
    form.set_value("/household/member/age", 0, "30").unwrap();
    assert!(form.is_relevant("/household/member/pregnant", 0).unwrap());
    form.set_value("/household/member/pregnant", 0, "yes").unwrap();
    assert!(form
        .serialize(SerializeOptions::default())
        .contains("<pregnant>yes</pregnant>"));

    form.set_value("/household/member/sex", 0, "m").unwrap();
    assert!(!form.is_relevant("/household/member/pregnant", 0).unwrap());
    let visible = form.serialize(SerializeOptions::default());
    assert!(!visible.contains("pregnant"));
    let full = form.serialize(SerializeOptions {
        include_non_relevant: true,
    });
    assert!(full.contains("<pregnant>yes</pregnant>"));

    assert_eq!(form.clear_non_relevant(), 1);
    assert_eq!(form.value("/household/member/pregnant", 0), Some(""));
}

#[test]
fn test_recompute_all_is_idempotent() {
    let mut form = household(FormConfig::default());
    form.set_value("/household/size", 0, "2").unwrap();
    form.set_value("/household/member/age", 0, "20").unwrap();
    form.set_value("/household/region", 0, "north").unwrap();
    let before = form.serialize(SerializeOptions::default());

    let mut events = form.subscribe();
    form.recompute_all();
    assert_eq!(form.serialize(SerializeOptions::default()), before);
    let changes: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e.kind, ChangeKind::Value | ChangeKind::Structure))
        .collect();
    assert_eq!(changes, vec![]);
}

#[test]
fn test_concat_waits_while_group_is_not_relevant() {
    let mut def = definition("<f><show>1</show><g><a/><b/><ab/></g></f>");
    def.binds = vec![
        BindDef {
            nodeset: "/f/g".into(),
            relevant: Some("/f/show = 1".into()),
            ..Default::default()
        },
        BindDef {
            nodeset: "/f/g/ab".into(),
            calculate: Some("concat(/f/g/a, /f/g/b)".into()),
            ..Default::default()
        },
    ];
    let mut form = Form::load(&def, None, FormConfig::default()).unwrap();
    form.set_value("/f/g/a", 0, "x").unwrap();
    form.set_value("/f/g/b", 0, "y").unwrap();
    assert_eq!(form.value("/f/g/ab", 0), Some("xy"));

    form.set_value("/f/show", 0, "0").unwrap();
    form.set_value("/f/g/a", 0, "z").unwrap();
    assert_eq!(form.value("/f/g/ab", 0), Some("xy"));

    form.set_value("/f/show", 0, "1").unwrap();
    assert_eq!(form.value("/f/g/ab", 0), Some("zy"));
}

#[test]
fn test_validation_on_household() {
    let mut form = household(FormConfig::default());
    let issues = form.validate();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].path, "/household/member/name");
    assert_eq!(issues[0].kind, IssueKind::Required);

    form.set_value("/household/member/name", 0, "Ann").unwrap();
    assert!(form.is_valid());

    form.set_value("/household/size", 0, "40").unwrap();
    let issues = form.validate();
    assert_eq!(issues[0].path, "/household/size");
    assert_eq!(issues[0].kind, IssueKind::Constraint);
    assert_eq!(issues[0].message.as_deref(), Some("Between 1 and 29 people"));
}

#[test]
fn test_batched_changes_wait_for_flush() {
    let mut form = household(FormConfig::default().batched());
    form.set_value("/household/size", 0, "2").unwrap();
    form.set_value("/household/size", 0, "3").unwrap();
    assert_eq!(form.value("/household/size", 0), Some("3"));
    assert_eq!(form.repeat_count(MEMBER), 1);
    assert!(form.pending_changes() > 0);

    assert!(form.flush() > 0);
    assert_eq!(form.pending_changes(), 0);
    assert_eq!(form.repeat_count(MEMBER), 3);
    assert_eq!(form.value("/household/summary", 0), Some("0 of 3"));
    assert_eq!(form.flush(), 0);
}

#[test]
fn test_self_referencing_calculation_is_bounded() {
    let mut def = definition("<f><n>0</n></f>");
    def.binds.push(BindDef {
        nodeset: "/f/n".into(),
        calculate: Some(". + 1".into()),
        ..Default::default()
    });
    let config = FormConfig {
        max_cascade_depth: 5,
        ..Default::default()
    };
    let form = Form::load(&def, None, config).unwrap();
    assert!(!form.diagnostics().is_empty());
    assert!(form.value("/f/n", 0).unwrap().parse::<u32>().unwrap() <= 6);
}

fn summarize(events: Vec<ChangeEvent>) -> Vec<(ChangeKind, String, usize)> {
    events
        .into_iter()
        .map(|e| (e.kind, e.path, e.index))
        .collect()
}

#[test]
fn test_lagging_subscriber_still_receives_retained_events() {
    let mut roomy = household(FormConfig::default());
    let mut all = roomy.subscribe();
    roomy.set_value("/household/size", 0, "6").unwrap();
    let everything = summarize(all.drain());
    assert!(everything.len() > 4);
    assert_eq!(all.missed(), 0);

    let config = FormConfig {
        event_buffer_size: 4,
        ..Default::default()
    };
    let mut form = household(config);
    let mut events = form.subscribe();
    form.set_value("/household/size", 0, "6").unwrap();
    let retained = summarize(events.drain());
    assert_eq!(retained, everything[everything.len() - 4..].to_vec());
    assert_eq!(events.missed() as usize, everything.len() - 4);

    form.set_value("/household/region", 0, "south").unwrap();
    let next = summarize(events.drain());
    assert_eq!(next[0], (ChangeKind::Value, "/household/region".to_string(), 0));
}

#[test]
fn test_relevance_fed_by_calculation_hides_before_calculating() {
    let mut def = definition("<f><a>100</a><c/><g><x/></g></f>");
    def.binds = vec![
        BindDef {
            nodeset: "/f/c".into(),
            calculate: Some("/f/a * 2".into()),
            ..Default::default()
        },
        BindDef {
            nodeset: "/f/g".into(),
            relevant: Some("/f/c > 10".into()),
            ..Default::default()
        },
        BindDef {
            nodeset: "/f/g/x".into(),
            calculate: Some("concat(/f/a, '!')".into()),
            ..Default::default()
        },
    ];
    let mut form = Form::load(&def, None, FormConfig::default()).unwrap();
    assert!(form.is_relevant("/f/g", 0).unwrap());
    assert_eq!(form.value("/f/g/x", 0), Some("100!"));

    let mut events = form.subscribe();
    form.set_value("/f/a", 0, "1").unwrap();
    assert_eq!(
        summarize(events.drain()),
        vec![
            (ChangeKind::Value, "/f/a".to_string(), 0),
            (ChangeKind::Value, "/f/c".to_string(), 0),
            (ChangeKind::Relevance, "/f/g".to_string(), 0),
        ]
    );
    assert!(!form.is_relevant("/f/g", 0).unwrap());
    assert_eq!(form.value("/f/g/x", 0), Some("100!"));
    assert_eq!(form.serialize(SerializeOptions::default()), "<f><a>1</a><c>2</c></f>");
}

#[test]
fn test_superseded_batched_edit_leaves_no_stale_result() {
    let age = "/household/member/age";
    let mut form = household(FormConfig::default().batched());
    let mut events = form.subscribe();
    form.set_value(age, 0, "40").unwrap();
    form.set_value(age, 0, "10").unwrap();
    assert_eq!(form.pending_changes(), 2);

    form.flush();
    assert_eq!(form.value(age, 0), Some("10"));
    assert_eq!(form.value("/household/member/adult", 0), Some("no"));
    assert_eq!(form.value("/household/summary", 0), Some("0 of 1"));
    assert_eq!(
        summarize(events.drain()),
        vec![
            (ChangeKind::Value, age.to_string(), 0),
            (ChangeKind::Value, age.to_string(), 0),
        ]
    );

    form.set_value(age, 0, "12").unwrap();
    form.set_value(age, 0, "19").unwrap();
    form.flush();
    let values: Vec<String> = events
        .drain()
        .into_iter()
        .filter(|e| e.kind == ChangeKind::Value)
        .map(|e| e.path)
        .collect();
    assert_eq!(
        values,
        vec![
            age.to_string(),
            age.to_string(),
            "/household/member/adult".to_string(),
            "/household/adults".to_string(),
            "/household/summary".to_string(),
        ]
    );
    assert_eq!(form.value("/household/summary", 0), Some("1 of 1"));
}
