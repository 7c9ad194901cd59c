use serde::{Deserialize, Serialize};

/// What happens to documents referencing a deleted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteRule {
    DoNothing,
    /// Unset the referencing field.
    Nullify,
    /// Delete the referencing documents too.
    Cascade,
    /// Refuse the delete while references exist.
    Deny,
    /// Remove the deleted id from a list-valued referencing field.
    Pull,
}

/// One entry of a type's delete-rule table: documents of `related` refer to
/// the owning type through `field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRuleEntry {
    pub related: String,
    pub field: String,
    pub rule: DeleteRule,
}
