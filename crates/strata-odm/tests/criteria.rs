mod common;

use bson::doc;
use proptest::prelude::*;
use strata_odm::{Condition, CriterionNode, Operator, SchemaTranslator};
use strata_store::filter_matches;

fn condition() -> impl Strategy<Value = Condition> {
    prop_oneof![
        prop::sample::select(vec!["a", "b", "c"])
            .prop_map(|name| Condition::new("name", Operator::Eq, name)),
        (
            prop::sample::select(vec![Operator::Gt, Operator::Gte, Operator::Lt, Operator::Lte]),
            0i32..60,
        )
            .prop_map(|(op, age)| Condition::new("age", op, age)),
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 1..3)
            .prop_map(|names| Condition::new("name", Operator::In, names)),
        any::<bool>().prop_map(|negate| {
            let c = Condition::new("name", Operator::StartsWith, "a");
            if negate { c.negate() } else { c }
        }),
    ]
}

fn tree() -> impl Strategy<Value = CriterionNode> {
    let leaf = condition().prop_map(CriterionNode::from);
    leaf.prop_recursive(4, 24, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(|children| {
                children
                    .iter()
                    .fold(CriterionNode::Empty, |acc, c| acc.and(c))
            }),
            prop::collection::vec(inner.clone(), 1..4).prop_map(|children| {
                children
                    .iter()
                    .fold(CriterionNode::Empty, |acc, c| acc.or(c))
            }),
            inner.prop_map(|c| c.negate()),
        ]
    })
}

fn author() -> impl Strategy<Value = bson::Document> {
    (prop::sample::select(vec!["a", "ab", "b", "c"]), 0i32..60)
        .prop_map(|(name, age)| doc! { "name": name, "age": age })
}

proptest! {
    #[test]
    fn merged_and_nested_filters_agree(node in tree(), docs in prop::collection::vec(author(), 1..8)) {
        let registry = common::registry();
        let translator = SchemaTranslator::new(&registry, "Author").unwrap();
        let merged = node.to_filter(&translator).unwrap();
        let nested = node.to_nested_filter(&translator).unwrap();
        for d in &docs {
            prop_assert_eq!(
                filter_matches(d, &merged).unwrap(),
                filter_matches(d, &nested).unwrap(),
                "merged {} vs nested {} on {}", merged, nested, d
            );
        }
    }

    #[test]
    fn negation_complements(node in tree(), d in author()) {
        let registry = common::registry();
        let translator = SchemaTranslator::new(&registry, "Author").unwrap();
        let plain = node.to_filter(&translator).unwrap();
        let negated = node.negate().to_filter(&translator).unwrap();
        prop_assert_ne!(
            filter_matches(&d, &plain).unwrap(),
            filter_matches(&d, &negated).unwrap()
        );
    }
}

#[test]
fn translated_filter_uses_storage_names() {
    let registry = common::registry();
    let translator = SchemaTranslator::new(&registry, "Person").unwrap();
    let node = CriterionNode::from(Condition::new("address.zipcode", Operator::Eq, "0150"))
        & CriterionNode::from(Condition::new("name", Operator::Ne, "x"));

    let filter = node.to_filter(&translator).unwrap();
    assert_eq!(filter, doc! { "address.zip": "0150", "n": { "$ne": "x" } });
    assert_eq!(
        node.to_nested_filter(&translator).unwrap(),
        doc! { "$and": [{ "address.zip": "0150" }, { "n": { "$ne": "x" } }] }
    );
}
