mod common;

use common::{definition, household};
use formcascade::{ChangeKind, Form, FormConfig, ItemsetDef};
use pretty_assertions::assert_eq;

fn option_values(form: &Form, path: &str) -> Vec<String> {
    form.itemset_options(path, 0)
        .unwrap_or_default()
        .iter()
        .map(|o| o.value.clone())
        .collect()
}

#[test]
fn test_cascading_select_clears_stale_choice() {
    let mut form = household(FormConfig::default());
    assert!(option_values(&form, "/household/district").is_empty());

    form.set_value("/household/region", 0, "north").unwrap();
    assert_eq!(
        option_values(&form, "/household/district"),
        vec!["north-1", "north-2"]
    );
    form.set_value("/household/district", 0, "north-2").unwrap();

    let mut events = form.subscribe();
    form.set_value("/household/region", 0, "south").unwrap();
    assert_eq!(option_values(&form, "/household/district"), vec!["south-1"]);
    assert_eq!(form.value("/household/district", 0), Some(""));

    let district: Vec<ChangeKind> = events
        .drain()
        .into_iter()
        .filter(|e| e.path == "/household/district")
        .map(|e| e.kind)
        .collect();
    assert_eq!(district, vec![ChangeKind::Itemset, ChangeKind::Value]);
}

#[test]
fn test_selection_still_offered_is_kept() {
    let mut form = household(FormConfig::default());
    form.set_value("/household/region", 0, "north").unwrap();
    form.set_value("/household/district", 0, "north-1").unwrap();
    form.set_value("/household/member/name", 0, "Ann").unwrap();
    assert_eq!(form.value("/household/district", 0), Some("north-1"));
}

#[test]
fn test_multiple_select_keeps_offered_values() {
    let mut def = definition("<f><min>0</min><picks/></f>");
    def.secondary_instances.insert(
        "nums".into(),
        "<root><n><name>1</name><label>one</label></n><n><name>2</name><label>two</label></n><n><name>3</name><label>three</label></n></root>".into(),
    );
    def.itemsets.push(ItemsetDef {
        path: "/f/picks".into(),
        nodeset: "instance('nums')/root/n[name > /f/min]".into(),
        value_ref: "name".into(),
        label_ref: "label".into(),
        multiple: true,
    });
    let mut form = Form::load(&def, None, FormConfig::default()).unwrap();
    form.set_value("/f/picks", 0, "1 3").unwrap();
    form.set_value("/f/min", 0, "2").unwrap();
    assert_eq!(option_values(&form, "/f/picks"), vec!["3"]);
    assert_eq!(form.value("/f/picks", 0), Some("3"));
}

#[tokio::test]
async fn test_subscriber_receives_value_events() {
    let mut form = household(FormConfig::default());
    let mut events = form.subscribe();
    form.set_value("/household/member/age", 0, "21").unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.kind, ChangeKind::Value);
    assert_eq!(first.path, "/household/member/age");
    assert_eq!(first.repeat_path.as_deref(), Some("/household/member"));
    assert_eq!(first.repeat_index, Some(0));

    let rest = events.drain();
    assert!(rest
        .iter()
        .any(|e| e.path == "/household/member/adult" && e.kind == ChangeKind::Value));
    assert!(rest
        .iter()
        .any(|e| e.path == "/household/adults" && e.kind == ChangeKind::Value));
}
