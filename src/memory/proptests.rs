//! Property tests for path parsing and scope resolution

use super::{PathSegment, PropertyPath};
use crate::dialogs::{DialogContext, DialogSet, DialogState};
use crate::testing::activity;
use crate::turn::TurnContext;
use proptest::prelude::*;
use serde_json::{json, Map};

fn key() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_]{0,8}"
}

fn segment() -> impl Strategy<Value = PathSegment> {
    prop_oneof![
        key().prop_map(PathSegment::Key),
        (0usize..4).prop_map(PathSegment::Index),
    ]
}

fn path() -> impl Strategy<Value = PropertyPath> {
    (key(), prop::collection::vec(segment(), 0..5)).prop_map(|(first, rest)| {
        let mut segments = vec![PathSegment::Key(first)];
        segments.extend(rest);
        PropertyPath::from_segments(segments)
    })
}

proptest! {
    #[test]
    fn display_then_parse_is_identity(path in path()) {
        let reparsed = PropertyPath::parse(&path.to_string()).unwrap();
        prop_assert_eq!(reparsed, path);
    }

    #[test]
    fn set_on_empty_creates_one_root_and_reads_back(path in path(), n in any::<i64>()) {
        let mut root = Map::new();
        path.set(&mut root, json!(n)).unwrap();
        prop_assert_eq!(root.len(), 1);
        prop_assert_eq!(path.get(&root), Some(&json!(n)));

        prop_assert_eq!(path.remove(&mut root), Some(json!(n)));
        prop_assert_eq!(path.get(&root), None);
    }

    #[test]
    fn entity_alias_matches_full_path(name in key(), value in "[a-z]{1,8}") {
        let set = DialogSet::new();
        let mut state = DialogState::default();
        let mut turn = TurnContext::new(activity("hi"));
        let mut dc = DialogContext::new(&set, &mut turn, &mut state);

        dc.set_value(&format!("@@{name}"), json!(value)).unwrap();
        let full = dc
            .get_value(&format!("turn.recognized.entities.{name}"))
            .unwrap();
        prop_assert_eq!(full, Some(json!(value)));

        dc.set_value(&format!("turn.recognized.entities.{name}"), json!([value.clone()]))
            .unwrap();
        prop_assert_eq!(dc.get_value(&format!("@{name}")).unwrap(), Some(json!(value)));
    }
}
