#![allow(dead_code)]

use std::sync::Arc;

use bson::Bson;
use strata_odm::{Database, Document};
use strata_schema::{FieldDescriptor, FieldKind, Registry, SchemaBuilder};
use strata_store::MemorySource;

pub type Db = Database<MemorySource>;

fn list(kind: FieldKind) -> FieldKind {
    FieldKind::List(Box::new(kind))
}

/// Fixture types:
///
/// - `Author` (`authors`): `name`, `age`, ordered by `name`.
/// - `Book` (`books`): `title`, `author` → `Author`, `pages`, `tags`.
/// - `Anthology` (`anthologies`): `title`, `authors` → list of `Author`.
/// - `Person` (`people`): `name` stored as `n`, `age` (default 0), an
///   embedded `address`, `nicknames` and a `friend` → `Person`.
/// - `Address` (embedded): `city`, `zipcode` stored as `zip`.
/// - `Animal` (`animals`, polymorphic) with subclasses `Dog` and `Cat`.
pub fn registry() -> Registry {
    Registry::builder()
        .register(
            SchemaBuilder::new("Author")
                .collection("authors")
                .ordering(["name"])
                .field(FieldDescriptor::new("name", FieldKind::String))
                .field(FieldDescriptor::new("age", FieldKind::Int)),
        )
        .unwrap()
        .register(
            SchemaBuilder::new("Book")
                .collection("books")
                .field(FieldDescriptor::new("title", FieldKind::String))
                .field(FieldDescriptor::new("author", FieldKind::Reference("Author".into())))
                .field(FieldDescriptor::new("pages", FieldKind::Int))
                .field(FieldDescriptor::new("tags", list(FieldKind::String))),
        )
        .unwrap()
        .register(
            SchemaBuilder::new("Anthology")
                .collection("anthologies")
                .field(FieldDescriptor::new("title", FieldKind::String))
                .field(FieldDescriptor::new(
                    "authors",
                    list(FieldKind::Reference("Author".into())),
                )),
        )
        .unwrap()
        .register(
            SchemaBuilder::embedded("Address")
                .field(FieldDescriptor::new("city", FieldKind::String))
                .field(FieldDescriptor::new("zipcode", FieldKind::String).storage("zip")),
        )
        .unwrap()
        .register(
            SchemaBuilder::new("Person")
                .collection("people")
                .field(FieldDescriptor::new("name", FieldKind::String).storage("n"))
                .field(FieldDescriptor::new("age", FieldKind::Int).default_value(0))
                .field(FieldDescriptor::new("address", FieldKind::Embedded("Address".into())))
                .field(FieldDescriptor::new("nicknames", list(FieldKind::String)))
                .field(FieldDescriptor::new("friend", FieldKind::Reference("Person".into()))),
        )
        .unwrap()
        .register(
            SchemaBuilder::new("Animal")
                .collection("animals")
                .allow_inheritance()
                .field(FieldDescriptor::new("name", FieldKind::String)),
        )
        .unwrap()
        .register(
            SchemaBuilder::new("Dog")
                .extends("Animal")
                .field(FieldDescriptor::new("breed", FieldKind::String)),
        )
        .unwrap()
        .register(SchemaBuilder::new("Cat").extends("Animal"))
        .unwrap()
        .build()
        .unwrap()
}

pub fn db() -> Db {
    Database::new(MemorySource::new(), Arc::new(registry()))
}

pub fn author(db: &Db, name: &str, age: i32) -> Document {
    db.objects("Author")
        .unwrap()
        .create([("name", Bson::from(name)), ("age", Bson::from(age))])
        .unwrap()
}

pub fn book(db: &Db, title: &str, author: &Document) -> Document {
    db.objects("Book")
        .unwrap()
        .create([
            ("title", Bson::from(title)),
            ("author", author.pk().unwrap()),
        ])
        .unwrap()
}

/// Authors "a", "a", "b" aged 30, 40, 50.
pub fn seed_authors(db: &Db) {
    author(db, "a", 30);
    author(db, "a", 40);
    author(db, "b", 50);
}

pub fn names(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .map(|d| d.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string())
        .collect()
}

pub fn collect(cursor: &mut strata_odm::QueryCursor<'_, MemorySource>) -> Vec<Document> {
    cursor.documents().collect::<Result<Vec<_>, _>>().unwrap()
}
