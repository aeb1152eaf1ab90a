//! Immutable snapshots of the tree, its factories and their children.
//!
//! Snapshots are built once after a storage commit and shared by the HTTP
//! response and the broadcast event, so both always describe the same state.

use serde::{Deserialize, Serialize};

use crate::errors::{ValidationError, MAX_CHILDREN, MIN_CHILDREN};
use crate::ids::{ChildId, FactoryId, TreeId};

pub const DEFAULT_TREE_NAME: &str = "Default Tree";
pub const DEFAULT_LOWER_BOUND: i64 = 1;
pub const DEFAULT_UPPER_BOUND: i64 = 100;
pub const DEFAULT_CHILD_COUNT: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: ChildId,
    pub value: i64,
    pub factory_id: FactoryId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factory {
    pub id: FactoryId,
    pub name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub child_count: u32,
    pub tree_id: TreeId,
    #[serde(default)]
    pub children: Vec<Child>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub name: String,
    #[serde(default)]
    pub factories: Vec<Factory>,
}

/// Body of a factory creation request.
#[derive(Clone, Debug, Deserialize)]
pub struct NewFactory {
    pub name: String,
    #[serde(default = "default_lower_bound")]
    pub lower_bound: i64,
    #[serde(default = "default_upper_bound")]
    pub upper_bound: i64,
    #[serde(default = "default_child_count")]
    pub child_count: i64,
}

fn default_lower_bound() -> i64 {
    DEFAULT_LOWER_BOUND
}

fn default_upper_bound() -> i64 {
    DEFAULT_UPPER_BOUND
}

fn default_child_count() -> i64 {
    i64::from(DEFAULT_CHILD_COUNT)
}

impl NewFactory {
    pub fn new(name: impl Into<String>, lower_bound: i64, upper_bound: i64, child_count: i64) -> Self {
        Self {
            name: name.into(),
            lower_bound,
            upper_bound,
            child_count,
        }
    }

    /// Check every invariant and return the normalised child count.
    pub fn validate(&self) -> Result<u32, ValidationError> {
        validate_name(&self.name)?;
        validate_factory(self.lower_bound, self.upper_bound, self.child_count)
    }
}

/// Partial update of a factory. Absent fields keep their stored value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FactoryPatch {
    pub name: Option<String>,
    pub lower_bound: Option<i64>,
    pub upper_bound: Option<i64>,
    pub child_count: Option<i64>,
}

impl FactoryPatch {
    /// Merge the patch onto `current` and validate the result as a whole.
    /// Children are dropped from the returned value; callers reload them.
    pub fn apply(&self, current: &Factory) -> Result<Factory, ValidationError> {
        let name = self.name.clone().unwrap_or_else(|| current.name.clone());
        validate_name(&name)?;
        let lower_bound = self.lower_bound.unwrap_or(current.lower_bound);
        let upper_bound = self.upper_bound.unwrap_or(current.upper_bound);
        let child_count = validate_factory(
            lower_bound,
            upper_bound,
            self.child_count.unwrap_or(i64::from(current.child_count)),
        )?;

        Ok(Factory {
            id: current.id.clone(),
            name,
            lower_bound,
            upper_bound,
            child_count,
            tree_id: current.tree_id.clone(),
            children: Vec::new(),
        })
    }
}

/// Partial update of the tree.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TreePatch {
    pub name: Option<String>,
}

impl TreePatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.name {
            Some(name) => validate_name(name),
            None => Ok(()),
        }
    }
}

/// Bounds must be strictly ordered and the child count within
/// `MIN_CHILDREN..=MAX_CHILDREN`.
pub fn validate_factory(lower_bound: i64, upper_bound: i64, child_count: i64) -> Result<u32, ValidationError> {
    if lower_bound >= upper_bound {
        return Err(ValidationError::BoundsInverted {
            lower: lower_bound,
            upper: upper_bound,
        });
    }
    if child_count < i64::from(MIN_CHILDREN) || child_count > i64::from(MAX_CHILDREN) {
        return Err(ValidationError::ChildCountOutOfRange { count: child_count });
    }
    Ok(child_count as u32)
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName { field: "name" });
    }
    Ok(())
}
