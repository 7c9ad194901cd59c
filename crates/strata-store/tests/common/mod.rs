#![allow(dead_code)]

use bson::{Document, doc};
use strata_store::{DataSource, FindOptions, MemorySource};

pub const BOOKS: &str = "books";

/// A source holding five books, inserted in title order.
pub fn seeded() -> MemorySource {
    let source = MemorySource::new();
    source
        .insert_many(
            BOOKS,
            vec![
                doc! { "_id": 1, "title": "Dune", "year": 1965, "tags": ["scifi", "classic"], "author": { "name": "Herbert" } },
                doc! { "_id": 2, "title": "Emma", "year": 1815, "tags": ["romance", "classic"], "author": { "name": "Austen" } },
                doc! { "_id": 3, "title": "Hyperion", "year": 1989, "tags": ["scifi"], "author": { "name": "Simmons" } },
                doc! { "_id": 4, "title": "Persuasion", "year": 1817, "tags": ["romance"], "author": { "name": "Austen" } },
                doc! { "_id": 5, "title": "Solaris", "year": 1961, "tags": [], "author": { "name": "Lem" } },
            ],
        )
        .unwrap();
    source
}

pub fn find_all(source: &MemorySource, filter: Document, options: FindOptions) -> Vec<Document> {
    source
        .find(BOOKS, &filter, &options)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

pub fn ids(docs: &[Document]) -> Vec<i32> {
    docs.iter().map(|d| d.get_i32("_id").unwrap()).collect()
}
