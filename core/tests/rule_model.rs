use usb_warden_core::rule::{fold_interface_list, InterfaceClass, Rule, Target};
use usb_warden_core::Error;

#[test]
fn parse_full_rule() {
    let raw = "allow name \"Mass Storage\" id 0951:1666 serial \"08A1\" \
               hash \"rq4x/A==\" via-port \"1-2\" with-connect-type \"hotplug\" \
               with-interface 08:06:50";
    let rule = Rule::parse(raw).expect("parse");
    assert_eq!(rule.target, Target::Allow);
    assert_eq!(rule.name.as_deref(), Some("Mass Storage"));
    assert_eq!(rule.vid.as_deref(), Some("0951"));
    assert_eq!(rule.pid.as_deref(), Some("1666"));
    assert_eq!(rule.serial.as_deref(), Some("08A1"));
    assert_eq!(rule.hash.as_deref(), Some("rq4x/A=="));
    assert_eq!(rule.via_port.as_deref(), Some("1-2"));
    assert_eq!(rule.connect_type.as_deref(), Some("hotplug"));
    assert_eq!(rule.interfaces, vec![InterfaceClass::parse("08:06:50").unwrap()]);
    assert_eq!(rule.number, None);
}

#[test]
fn serialize_parse_roundtrip_preserves_semantics() {
    let samples = [
        "allow",
        "block id 1d6b:*",
        "allow name \"Kingston DataTraveler\" hash \"x7ZL8t==\"",
        "reject with-interface { 03:00:01 03:01:01 08:06:50 }",
        "allow id 0951:1666 serial \"001A\" via-port \"1-2\" if !rule-applied",
        "allow with-interface 03:*:*",
    ];
    for raw in samples {
        let first = Rule::parse(raw).expect("first parse");
        let rebuilt = first.build_string(false, true);
        let second = Rule::parse(&rebuilt).expect("reparse");
        assert_eq!(first, second, "round-trip changed semantics for: {raw}");
    }
}

#[test]
fn malformed_rules_fail_without_partial_result() {
    let samples = [
        "",
        "allowall",
        "permit id 1d6b:0002",
        "allow id",
        "allow id 1d6b",
        "allow name",
        "allow with-interface",
        "allow with-interface { 03:00:01",
        "allow with-interface { }",
        "allow name \"unterminated",
        "allow frobnicate \"x\"",
        "allow if",
    ];
    for raw in samples {
        assert!(
            matches!(Rule::parse(raw), Err(Error::MalformedRule(_))),
            "expected MalformedRule for: {raw:?}"
        );
    }
}

#[test]
fn fold_masks_shared_base_classes() {
    let folded = fold_interface_list("{ 01:01:00 01:02:00 02:*:* }");
    assert_eq!(folded, vec!["01:*:*".to_string(), "02:*:*".to_string()]);
}

#[test]
fn fold_keeps_unique_base_classes_concrete() {
    let folded = fold_interface_list("{ 01:01:00 02:00:00 }");
    assert_eq!(folded, vec!["01:01:00".to_string(), "02:00:00".to_string()]);
}

#[test]
fn fold_returns_non_braced_input_unchanged() {
    assert_eq!(fold_interface_list("08:06:50"), vec!["08:06:50".to_string()]);
}

#[test]
fn fold_strips_attribute_keyword() {
    let folded = fold_interface_list("with-interface { 03:00:01 03:01:02 }");
    assert_eq!(folded, vec!["03:*:*".to_string()]);

    assert_eq!(
        fold_interface_list("with-interface 09:00:00"),
        vec!["09:00:00".to_string()]
    );
}

#[test]
fn fold_skips_unparseable_specifiers() {
    let folded = fold_interface_list("{ junk 02:00:00 }");
    assert_eq!(folded, vec!["02:00:00".to_string()]);
}
