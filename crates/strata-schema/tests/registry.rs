mod common;
use common::*;

use strata_schema::{
    DeleteRule, DeleteRuleEntry, FieldDescriptor, FieldKind, Registry, SchemaBuilder, SchemaError,
};

// ── lookup ──────────────────────────────────────────────────

#[test]
fn class_names_follow_inheritance() {
    let registry = zoo();
    assert_eq!(registry.schema("Dog").unwrap().class_name(), "Animal.Mammal.Dog");
    assert_eq!(
        registry.by_class_name("Animal.Mammal.Dog").unwrap().name(),
        "Dog"
    );
    assert!(registry.by_class_name("Dog").is_none());
}

#[test]
fn subclasses_are_transitive() {
    let registry = zoo();
    assert_eq!(registry.subclasses("Animal"), ["Mammal", "Dog"]);
    assert_eq!(registry.subclasses("Mammal"), ["Dog"]);
    assert!(registry.subclasses("Dog").is_empty());
    assert_eq!(
        registry.subclass_discriminators("Mammal").unwrap(),
        ["Animal.Mammal", "Animal.Mammal.Dog"]
    );
}

#[test]
fn collaborator_queries() {
    let registry = zoo();
    assert!(registry.is_polymorphic("Dog").unwrap());
    assert!(!registry.is_polymorphic("Vet").unwrap());
    let pk = registry.primary_key_field("Dog").unwrap().unwrap();
    assert_eq!(pk.storage_name(), "_id");
    assert_eq!(registry.fields_of("Dog").unwrap().len(), 3);
    assert!(registry.default_ordering("Vet").unwrap().is_empty());
}

#[test]
fn unknown_type_is_not_registered() {
    let registry = zoo();
    assert_eq!(
        registry.schema("Cat").unwrap_err(),
        SchemaError::NotRegistered("Cat".into())
    );
}

// ── construction ────────────────────────────────────────────

#[test]
fn parent_must_come_first() {
    let err = Registry::builder()
        .register(SchemaBuilder::new("Dog").extends("Animal"))
        .err()
        .unwrap();
    assert_eq!(err, SchemaError::NotRegistered("Animal".into()));
}

#[test]
fn dangling_reference_fails_build() {
    let err = Registry::builder()
        .register(
            SchemaBuilder::new("Book")
                .field(FieldDescriptor::new("author", FieldKind::Reference("Author".into()))),
        )
        .unwrap()
        .build()
        .err()
        .unwrap();
    assert_eq!(err, SchemaError::NotRegistered("Author".into()));
}

#[test]
fn duplicate_registration_fails() {
    let err = Registry::builder()
        .register(SchemaBuilder::new("A"))
        .unwrap()
        .register(SchemaBuilder::new("A"))
        .err()
        .unwrap();
    assert_eq!(err, SchemaError::AlreadyRegistered("A".into()));
}

// ── delete rules ────────────────────────────────────────────

#[test]
fn delete_rule_expands_to_subclasses_on_both_sides() {
    let registry = zoo();
    registry
        .register_delete_rule("Animal", "Owner", "pet", DeleteRule::Nullify)
        .unwrap();

    for owner in ["Animal", "Mammal", "Dog"] {
        let rules = registry.delete_rules(owner);
        let related: Vec<&str> = rules.iter().map(|r| r.related.as_str()).collect();
        assert_eq!(related, ["Owner", "Breeder"], "rules of {owner}");
    }
    assert!(registry.delete_rules("Owner").is_empty());
}

#[test]
fn delete_rule_on_subclass_does_not_reach_parent() {
    let registry = zoo();
    registry
        .register_delete_rule("Dog", "Vet", "patients", DeleteRule::Pull)
        .unwrap();
    assert!(registry.delete_rules("Animal").is_empty());
    assert_eq!(
        registry.delete_rules("Dog"),
        vec![DeleteRuleEntry {
            related: "Vet".into(),
            field: "patients".into(),
            rule: DeleteRule::Pull,
        }]
    );
}

#[test]
fn reregistering_replaces_rule() {
    let registry = zoo();
    registry
        .register_delete_rule("Animal", "Vet", "patients", DeleteRule::Deny)
        .unwrap();
    registry
        .register_delete_rule("Animal", "Vet", "patients", DeleteRule::Pull)
        .unwrap();
    let rules = registry.delete_rules("Animal");
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule, DeleteRule::Pull);
}

#[test]
fn delete_rule_on_unknown_field_fails() {
    let registry = zoo();
    let err = registry
        .register_delete_rule("Animal", "Vet", "nope", DeleteRule::Cascade)
        .unwrap_err();
    assert!(matches!(err, SchemaError::Invalid(_)));
}
