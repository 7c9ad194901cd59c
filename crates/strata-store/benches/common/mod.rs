#![allow(dead_code)]

use bson::{Document, doc};
use strata_store::{DataSource, MemorySource};

/// `n` small documents shaped like typical application records.
pub fn generate_docs(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            doc! {
                "_id": format!("rec-{i}"),
                "name": format!("User {i}"),
                "status": if i % 2 == 0 { "active" } else { "rejected" },
                "contacts_count": (i % 100) as i32,
                "address": { "city": format!("city-{}", i % 10) },
                "tags": ["a", "b"],
            }
        })
        .collect()
}

pub fn seed_source(source: &MemorySource, collection: &str, n: usize) {
    source.insert_many(collection, generate_docs(n)).unwrap();
}
