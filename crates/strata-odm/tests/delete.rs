mod common;
use common::*;

use std::sync::{Arc, Mutex};

use bson::Bson;
use strata_odm::{DeleteRule, Document, Error, Observer};

// ── Bulk delete ─────────────────────────────────────────────────

#[test]
fn delete_removes_matching_documents() {
    let db = db();
    seed_authors(&db);

    let deleted = db
        .objects("Author")
        .unwrap()
        .filter([("name", "a")])
        .unwrap()
        .delete()
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(names(&collect(&mut db.objects("Author").unwrap())), ["b"]);
}

#[test]
fn windowed_delete_goes_one_document_at_a_time() {
    let db = db();
    seed_authors(&db);
    let before = db.source().stats();

    let mut window = db.objects("Author").unwrap().order_by(["age"]).limit(2);
    assert_eq!(window.delete().unwrap(), 2);
    assert_eq!(db.source().stats().deletes - before.deletes, 2);
    assert_eq!(names(&collect(&mut db.objects("Author").unwrap())), ["b"]);

    assert!(matches!(window.rewind(), Err(Error::Operation(_))));
}

#[test]
fn delete_on_subclass_keeps_siblings() {
    let db = db();
    for kind in ["Dog", "Cat", "Dog"] {
        let mut animal = db.new_document(kind).unwrap();
        animal.set("name", kind).unwrap();
        db.save(&mut animal).unwrap();
    }

    assert_eq!(db.objects("Dog").unwrap().delete().unwrap(), 2);
    assert_eq!(db.objects("Animal").unwrap().count(false).unwrap(), 1);
}

#[test]
fn deleting_unsaved_document_fails() {
    let db = db();
    let unsaved = db.new_document("Author").unwrap();
    assert_eq!(
        db.delete_document(&unsaved).unwrap_err(),
        Error::Operation("attempt to delete a document not yet saved".into())
    );
}

// ── Delete rules ────────────────────────────────────────────────

#[test]
fn deny_blocks_delete_while_referenced() {
    let db = db();
    db.register_delete_rule("Author", "Book", "author", DeleteRule::Deny)
        .unwrap();
    let writer = author(&db, "w", 1);
    book(&db, "one", &writer);

    let err = db.delete_document(&writer).unwrap_err();
    assert_eq!(
        err,
        Error::Operation("Could not delete document (Book.author refers to it)".into())
    );
    assert_eq!(db.objects("Author").unwrap().count(false).unwrap(), 1);

    let lonely = author(&db, "l", 2);
    assert_eq!(db.delete_document(&lonely).unwrap(), 1);
}

#[test]
fn deny_is_checked_before_any_other_rule() {
    let db = db();
    db.register_delete_rule("Author", "Anthology", "authors", DeleteRule::Pull)
        .unwrap();
    db.register_delete_rule("Author", "Book", "author", DeleteRule::Deny)
        .unwrap();
    let writer = author(&db, "w", 1);
    book(&db, "one", &writer);
    db.objects("Anthology")
        .unwrap()
        .create([
            ("title", Bson::from("best of")),
            ("authors", Bson::Array(vec![writer.pk().unwrap()])),
        ])
        .unwrap();

    assert!(db.delete_document(&writer).is_err());
    let anthology = db.source().documents("anthologies").unwrap();
    assert_eq!(anthology[0].get_array("authors").unwrap().len(), 1);
}

#[test]
fn nullify_unsets_references() {
    let db = db();
    db.register_delete_rule("Author", "Book", "author", DeleteRule::Nullify)
        .unwrap();
    let writer = author(&db, "w", 1);
    book(&db, "one", &writer);
    book(&db, "two", &writer);

    assert_eq!(db.delete_document(&writer).unwrap(), 1);
    let books = db.source().documents("books").unwrap();
    assert_eq!(books.len(), 2);
    assert!(books.iter().all(|b| !b.contains_key("author")));
}

#[test]
fn cascade_deletes_referencing_documents() {
    let db = db();
    db.register_delete_rule("Author", "Book", "author", DeleteRule::Cascade)
        .unwrap();
    let w = author(&db, "w", 1);
    let v = author(&db, "v", 2);
    book(&db, "one", &w);
    book(&db, "two", &w);
    book(&db, "three", &v);

    let deleted = db
        .objects("Author")
        .unwrap()
        .filter([("name", "w")])
        .unwrap()
        .delete()
        .unwrap();
    assert_eq!(deleted, 1);
    let titles: Vec<Bson> = db
        .objects("Book")
        .unwrap()
        .scalar(["title"])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(titles, [Bson::from("three")]);
}

#[test]
fn pull_removes_ids_from_lists() {
    let db = db();
    db.register_delete_rule("Author", "Anthology", "authors", DeleteRule::Pull)
        .unwrap();
    let w = author(&db, "w", 1);
    let v = author(&db, "v", 2);
    db.objects("Anthology")
        .unwrap()
        .create([
            ("title", Bson::from("duo")),
            ("authors", Bson::Array(vec![w.pk().unwrap(), v.pk().unwrap()])),
        ])
        .unwrap();

    db.delete_document(&w).unwrap();
    let anthology = db.source().documents("anthologies").unwrap();
    assert_eq!(
        anthology[0].get_array("authors").unwrap(),
        &vec![v.pk().unwrap()]
    );
}

#[test]
fn cascade_cycles_terminate() {
    let db = db();
    db.register_delete_rule("Person", "Person", "friend", DeleteRule::Cascade)
        .unwrap();
    let mut p = db.new_document("Person").unwrap();
    p.set("name", "p").unwrap();
    db.save(&mut p).unwrap();
    let mut q = db.new_document("Person").unwrap();
    q.set("name", "q").unwrap();
    q.set("friend", p.pk().unwrap()).unwrap();
    db.save(&mut q).unwrap();
    p.set("friend", q.pk().unwrap()).unwrap();
    db.save(&mut p).unwrap();

    db.delete_document(&p).unwrap();
    assert_eq!(db.objects("Person").unwrap().count(false).unwrap(), 0);
}

#[test]
fn cascade_depth_is_bounded() {
    let registry = registry();
    let db = strata_odm::Database::with_config(
        strata_store::MemorySource::new(),
        Arc::new(registry),
        strata_odm::DatabaseConfig {
            max_cascade_depth: 0,
            ..Default::default()
        },
    );
    db.register_delete_rule("Author", "Book", "author", DeleteRule::Cascade)
        .unwrap();
    let w = author(&db, "w", 1);
    book(&db, "one", &w);

    assert!(matches!(db.delete_document(&w), Err(Error::Operation(_))));
    assert_eq!(db.objects("Book").unwrap().count(false).unwrap(), 1);
}

// ── Delete observers ────────────────────────────────────────────

#[derive(Default)]
struct Deletions(Mutex<Vec<String>>);

impl Observer for Deletions {
    fn pre_delete(&self, document: &Document) -> Result<(), Error> {
        let name = document.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        self.0.lock().unwrap().push(format!("pre {name}"));
        Ok(())
    }

    fn post_delete(&self, document: &Document) {
        let name = document.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        self.0.lock().unwrap().push(format!("post {name}"));
    }
}

#[test]
fn delete_observers_force_per_document_deletes() {
    let db = db();
    let deletions = Arc::new(Deletions::default());
    db.observe("Author", deletions.clone()).unwrap();
    seed_authors(&db);

    let deleted = db
        .objects("Author")
        .unwrap()
        .filter([("name", "a")])
        .unwrap()
        .delete()
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(
        *deletions.0.lock().unwrap(),
        ["pre a", "post a", "pre a", "post a"]
    );
}

#[test]
fn cascaded_documents_notify_their_observers() {
    let db = db();
    let deletions = Arc::new(Deletions::default());
    db.observe("Book", deletions.clone()).unwrap();
    db.register_delete_rule("Author", "Book", "author", DeleteRule::Cascade)
        .unwrap();
    let w = author(&db, "w", 1);
    book(&db, "one", &w);

    db.delete_document(&w).unwrap();
    assert_eq!(*deletions.0.lock().unwrap(), ["pre ", "post "]);
}
