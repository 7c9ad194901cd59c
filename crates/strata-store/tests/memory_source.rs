#![cfg(feature = "memory")]

mod common;
use common::*;

use bson::{Bson, doc};
use strata_store::{
    CountOptions, DataSource, FindAndModifyOptions, FindOptions, MemorySource, ReturnDocument,
    StoreError,
};

// ── find ────────────────────────────────────────────────────

#[test]
fn unsorted_find_keeps_insertion_order() {
    let source = seeded();
    let docs = find_all(&source, doc! {}, FindOptions::default());
    assert_eq!(ids(&docs), vec![1, 2, 3, 4, 5]);
}

#[test]
fn find_filters_sorts_and_pages() {
    let source = seeded();
    let options = FindOptions {
        sort: Some(doc! { "year": -1 }),
        skip: 1,
        limit: Some(2),
        ..Default::default()
    };
    let docs = find_all(&source, doc! { "year": { "$gt": 1900 } }, options);
    assert_eq!(ids(&docs), vec![1, 5]);
}

#[test]
fn find_limit_zero_returns_nothing() {
    let source = seeded();
    let options = FindOptions {
        limit: Some(0),
        ..Default::default()
    };
    assert!(find_all(&source, doc! {}, options).is_empty());
}

#[test]
fn find_on_array_and_nested_paths() {
    let source = seeded();
    let docs = find_all(&source, doc! { "tags": "classic" }, FindOptions::default());
    assert_eq!(ids(&docs), vec![1, 2]);

    let docs = find_all(&source, doc! { "author.name": "Austen" }, FindOptions::default());
    assert_eq!(ids(&docs), vec![2, 4]);

    let docs = find_all(&source, doc! { "tags": { "$size": 0 } }, FindOptions::default());
    assert_eq!(ids(&docs), vec![5]);
}

#[test]
fn find_with_or_and_regex() {
    let source = seeded();
    let filter = doc! { "$or": [
        { "title": { "$regex": "^d", "$options": "i" } },
        { "year": { "$lt": 1816 } },
    ] };
    let docs = find_all(&source, filter, FindOptions::default());
    assert_eq!(ids(&docs), vec![1, 2]);
}

#[test]
fn find_applies_projection() {
    let source = seeded();
    let options = FindOptions {
        projection: Some(doc! { "title": 1 }),
        limit: Some(1),
        ..Default::default()
    };
    let docs = find_all(&source, doc! {}, options);
    assert_eq!(docs, vec![doc! { "_id": 1, "title": "Dune" }]);
}

#[test]
fn unknown_top_level_operator_is_rejected() {
    let source = seeded();
    let err = source
        .find(BOOKS, &doc! { "$where": "1" }, &FindOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::InvalidQuery(_)));
}

#[test]
fn unknown_hint_is_rejected() {
    let source = seeded();
    let options = FindOptions {
        hint: Some(Bson::String("title_1".into())),
        ..Default::default()
    };
    let err = source.find(BOOKS, &doc! {}, &options).err().unwrap();
    assert_eq!(
        err,
        StoreError::InvalidQuery("hint provided does not correspond to an existing index".into())
    );

    source.create_index(BOOKS, doc! { "title": 1 }, false).unwrap();
    assert!(source.find(BOOKS, &doc! {}, &options).is_ok());
}

#[test]
fn cursor_sees_snapshot_taken_at_open() {
    let source = seeded();
    let mut cursor = source.find(BOOKS, &doc! {}, &FindOptions::default()).unwrap();
    cursor.next().unwrap().unwrap();
    source.delete_many(BOOKS, &doc! {}).unwrap();
    assert_eq!(cursor.remaining(), 4);
}

// ── writes ──────────────────────────────────────────────────

#[test]
fn insert_assigns_object_id_first() {
    let source = MemorySource::new();
    let id = source.insert_one("c", doc! { "a": 1 }).unwrap();
    assert!(matches!(id, Bson::ObjectId(_)));
    let docs = source.documents("c").unwrap();
    assert_eq!(docs[0].keys().next().map(String::as_str), Some("_id"));
}

#[test]
fn duplicate_id_rejects_whole_batch() {
    let source = seeded();
    let err = source
        .insert_many(BOOKS, vec![doc! { "_id": 10 }, doc! { "_id": 1 }])
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(ref m) if m.starts_with("E11000")));
    assert_eq!(source.documents(BOOKS).unwrap().len(), 5);
}

#[test]
fn unique_index_guards_updates() {
    let source = seeded();
    source.create_index(BOOKS, doc! { "title": 1 }, true).unwrap();
    let err = source
        .update_one(BOOKS, &doc! { "_id": 2 }, &doc! { "$set": { "title": "Dune" } }, false)
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(_)));
    let docs = find_all(&source, doc! { "_id": 2 }, FindOptions::default());
    assert_eq!(docs[0].get_str("title").unwrap(), "Emma");
}

#[test]
fn unique_index_over_existing_duplicates_fails() {
    let source = seeded();
    let err = source
        .create_index(BOOKS, doc! { "author.name": 1 }, true)
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(_)));
}

#[test]
fn update_many_counts_matched_and_modified() {
    let source = seeded();
    let result = source
        .update_many(
            BOOKS,
            &doc! { "author.name": "Austen" },
            &doc! { "$set": { "year": 1815 } },
            false,
        )
        .unwrap();
    assert_eq!((result.matched, result.modified), (2, 1));
    assert!(result.upserted_id.is_none());
}

#[test]
fn update_one_touches_first_match_only() {
    let source = seeded();
    source
        .update_one(BOOKS, &doc! { "tags": "romance" }, &doc! { "$inc": { "year": 1 } }, false)
        .unwrap();
    let docs = find_all(&source, doc! { "tags": "romance" }, FindOptions::default());
    assert_eq!(docs[0].get_i32("year").unwrap(), 1816);
    assert_eq!(docs[1].get_i32("year").unwrap(), 1817);
}

#[test]
fn upsert_seeds_from_filter() {
    let source = MemorySource::new();
    let result = source
        .update_one(
            "c",
            &doc! { "name": "x", "age": { "$gt": 3 } },
            &doc! { "$set": { "n": 1 } },
            true,
        )
        .unwrap();
    assert_eq!(result.matched, 0);
    assert!(result.upserted_id.is_some());
    let docs = source.documents("c").unwrap();
    assert_eq!(docs[0].get_str("name").unwrap(), "x");
    assert_eq!(docs[0].get_i32("n").unwrap(), 1);
    assert!(!docs[0].contains_key("age"));
}

#[test]
fn delete_many_returns_count() {
    let source = seeded();
    let removed = source.delete_many(BOOKS, &doc! { "tags": "scifi" }).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(source.delete_many("missing", &doc! {}).unwrap(), 0);
}

// ── find and modify ─────────────────────────────────────────

#[test]
fn find_one_and_update_returns_before_or_after() {
    let source = seeded();
    let update = doc! { "$inc": { "year": 10 } };
    let mut options = FindAndModifyOptions {
        sort: Some(doc! { "year": 1 }),
        ..Default::default()
    };
    let before = source
        .find_one_and_update(BOOKS, &doc! {}, &update, &options)
        .unwrap()
        .unwrap();
    assert_eq!(before.get_i32("year").unwrap(), 1815);

    options.return_document = ReturnDocument::After;
    options.projection = Some(doc! { "year": 1, "_id": 0 });
    let after = source
        .find_one_and_update(BOOKS, &doc! { "_id": 4 }, &update, &options)
        .unwrap()
        .unwrap();
    assert_eq!(after, doc! { "year": 1827 });
}

#[test]
fn find_one_and_update_without_match() {
    let source = seeded();
    let update = doc! { "$set": { "x": 1 } };
    let options = FindAndModifyOptions::default();
    assert!(source
        .find_one_and_update(BOOKS, &doc! { "_id": 99 }, &update, &options)
        .unwrap()
        .is_none());

    let options = FindAndModifyOptions {
        upsert: true,
        return_document: ReturnDocument::After,
        ..Default::default()
    };
    let doc = source
        .find_one_and_update(BOOKS, &doc! { "_id": 99 }, &update, &options)
        .unwrap()
        .unwrap();
    assert_eq!(doc, doc! { "_id": 99, "x": 1 });
}

#[test]
fn find_one_and_delete_honours_sort() {
    let source = seeded();
    let options = FindAndModifyOptions {
        sort: Some(doc! { "year": -1 }),
        ..Default::default()
    };
    let doc = source
        .find_one_and_delete(BOOKS, &doc! {}, &options)
        .unwrap()
        .unwrap();
    assert_eq!(doc.get_i32("_id").unwrap(), 3);
    assert_eq!(source.documents(BOOKS).unwrap().len(), 4);
}

// ── counting, distinct, aggregate ───────────────────────────

#[test]
fn count_respects_skip_and_limit() {
    let source = seeded();
    let all = source
        .count_documents(BOOKS, &doc! {}, &CountOptions::default())
        .unwrap();
    assert_eq!(all, 5);
    let options = CountOptions {
        skip: 1,
        limit: Some(3),
        hint: None,
    };
    assert_eq!(source.count_documents(BOOKS, &doc! {}, &options).unwrap(), 3);
    let options = CountOptions {
        skip: 4,
        limit: Some(3),
        hint: None,
    };
    assert_eq!(source.count_documents(BOOKS, &doc! {}, &options).unwrap(), 1);
}

#[test]
fn distinct_flattens_arrays() {
    let source = seeded();
    let tags = source.distinct(BOOKS, "tags", &doc! {}).unwrap();
    assert_eq!(
        tags,
        vec![
            Bson::from("scifi"),
            Bson::from("classic"),
            Bson::from("romance")
        ]
    );
}

#[test]
fn aggregate_groups_by_author() {
    let source = seeded();
    let out = source
        .aggregate(
            BOOKS,
            &[
                doc! { "$match": { "year": { "$lt": 1900 } } },
                doc! { "$group": { "_id": "$author.name", "n": { "$sum": 1 } } },
            ],
        )
        .unwrap();
    assert_eq!(out, vec![doc! { "_id": "Austen", "n": 2 }]);
}

// ── bookkeeping ─────────────────────────────────────────────

#[test]
fn stats_track_cursors() {
    let source = seeded();
    source.reset_stats();
    {
        let mut cursor = source.find(BOOKS, &doc! {}, &FindOptions::default()).unwrap();
        cursor.next();
        cursor.next();
    }
    let stats = source.stats();
    assert_eq!(stats.finds, 1);
    assert_eq!(stats.cursors_opened, 1);
    assert_eq!(stats.cursors_closed, 1);
    assert_eq!(stats.documents_returned, 2);
}

#[test]
fn index_information_lists_id_index() {
    let source = seeded();
    let name = source.create_index(BOOKS, doc! { "year": -1 }, false).unwrap();
    assert_eq!(name, "year_-1");
    let names: Vec<String> = source
        .index_information(BOOKS)
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, vec!["_id_".to_string(), "year_-1".to_string()]);
}

#[test]
fn drop_collection_removes_documents() {
    let source = seeded();
    source.drop_collection(BOOKS).unwrap();
    assert!(source.documents(BOOKS).unwrap().is_empty());
}
