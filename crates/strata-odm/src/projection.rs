use bson::{Bson, Document, doc};
use strata_schema::ID_KEY;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    Include,
    Exclude,
}

/// Fields to load, keyed by storage path.
///
/// A set is either all-inclusion or all-exclusion. `_id` may be dropped from
/// an inclusion set, `$slice` entries combine with either mode, and
/// always-include paths (the type discriminator) survive both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionSet {
    mode: Option<ProjectionMode>,
    fields: Vec<String>,
    slices: Vec<(String, Bson)>,
    id: Option<bool>,
    always_include: Vec<String>,
}

impl ProjectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_always_include<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            always_include: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn mode(&self) -> Option<ProjectionMode> {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.slices.is_empty() && self.id.is_none()
    }

    pub fn include<I, S>(&mut self, paths: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            let path = path.into();
            if path == ID_KEY {
                self.id = Some(true);
                continue;
            }
            self.switch_to(ProjectionMode::Include)?;
            push_unique(&mut self.fields, path);
        }
        Ok(())
    }

    pub fn exclude<I, S>(&mut self, paths: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            let path = path.into();
            if path == ID_KEY {
                self.id = Some(false);
                continue;
            }
            if self.always_include.contains(&path) {
                continue;
            }
            self.switch_to(ProjectionMode::Exclude)?;
            push_unique(&mut self.fields, path);
        }
        Ok(())
    }

    /// Restrict a list field to `count` elements (negative counts from the
    /// end), or to `[skip, limit]` when given a pair.
    pub fn slice(&mut self, path: impl Into<String>, value: impl Into<Bson>) {
        let path = path.into();
        let value = value.into();
        match self.slices.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = value,
            None => self.slices.push((path, value)),
        }
    }

    /// Union of two sets. Fails when one includes and the other excludes.
    pub fn merge(&self, other: &ProjectionSet) -> Result<ProjectionSet, Error> {
        let mut merged = self.clone();
        if let Some(mode) = other.mode {
            merged.switch_to(mode)?;
        }
        for field in &other.fields {
            push_unique(&mut merged.fields, field.clone());
        }
        for (path, value) in &other.slices {
            merged.slice(path.clone(), value.clone());
        }
        if other.id.is_some() {
            merged.id = other.id;
        }
        for path in &other.always_include {
            push_unique(&mut merged.always_include, path.clone());
        }
        Ok(merged)
    }

    /// Drop every entry but the always-include paths.
    pub fn reset(&mut self) {
        self.mode = None;
        self.fields.clear();
        self.slices.clear();
        self.id = None;
    }

    /// The storage projection document, `None` when every field is loaded.
    pub fn to_document(&self) -> Option<Document> {
        if self.is_empty() {
            return None;
        }
        let mut out = Document::new();
        match self.mode {
            Some(ProjectionMode::Include) => {
                for path in self.fields.iter().chain(&self.always_include) {
                    out.insert(path.clone(), 1);
                }
            }
            Some(ProjectionMode::Exclude) => {
                for path in &self.fields {
                    out.insert(path.clone(), 0);
                }
            }
            None => {}
        }
        for (path, value) in &self.slices {
            out.insert(path.clone(), doc! { "$slice": value.clone() });
        }
        match self.id {
            Some(false) => {
                out.insert(ID_KEY, 0);
            }
            Some(true) if self.mode == Some(ProjectionMode::Include) => {
                out.insert(ID_KEY, 1);
            }
            // `_id` alone is a one-field inclusion.
            Some(true) if self.mode.is_none() && self.slices.is_empty() => {
                out.insert(ID_KEY, 1);
            }
            _ => {}
        }
        Some(out)
    }

    fn switch_to(&mut self, mode: ProjectionMode) -> Result<(), Error> {
        match self.mode {
            Some(current) if current != mode => Err(Error::InvalidQuery(
                "Projection cannot have a mix of inclusion and exclusion (mixed inclusion/exclusion)"
                    .into(),
            )),
            _ => {
                self.mode = Some(mode);
                Ok(())
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, path: String) {
    if !list.contains(&path) {
        list.push(path);
    }
}
