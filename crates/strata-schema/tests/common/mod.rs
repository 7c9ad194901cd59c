#![allow(dead_code)]

use strata_schema::{FieldDescriptor, FieldKind, Registry, SchemaBuilder};

/// Animal ← Mammal ← Dog, plus Owner and Vet referencing animals.
pub fn zoo() -> Registry {
    Registry::builder()
        .register(
            SchemaBuilder::new("Animal")
                .allow_inheritance()
                .field(FieldDescriptor::new("name", FieldKind::String)),
        )
        .unwrap()
        .register(SchemaBuilder::new("Mammal").extends("Animal"))
        .unwrap()
        .register(
            SchemaBuilder::new("Dog")
                .extends("Mammal")
                .field(FieldDescriptor::new("breed", FieldKind::String)),
        )
        .unwrap()
        .register(
            SchemaBuilder::new("Owner")
                .allow_inheritance()
                .field(FieldDescriptor::new("pet", FieldKind::Reference("Animal".into()))),
        )
        .unwrap()
        .register(SchemaBuilder::new("Breeder").extends("Owner"))
        .unwrap()
        .register(SchemaBuilder::new("Vet").field(FieldDescriptor::new(
            "patients",
            FieldKind::List(Box::new(FieldKind::Reference("Animal".into()))),
        )))
        .unwrap()
        .build()
        .unwrap()
}
