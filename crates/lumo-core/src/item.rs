use serde::{Deserialize, Serialize};

use crate::contract::{check_len, check_positive, Validate, ValidationError};

pub const NAME_MAX_CHARS: usize = 255;
pub const DESCRIPTION_MAX_CHARS: usize = 1000;

/// A stored item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateItemInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Partial update: absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateItemInput {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetItemInput {
    pub id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteItemInput {
    pub id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteItemOutput {
    pub success: bool,
}

fn check_name(name: &str) -> Result<(), ValidationError> {
    check_len("name", name, 1, NAME_MAX_CHARS)
}

fn check_description(description: Option<&str>) -> Result<(), ValidationError> {
    match description {
        Some(d) => check_len("description", d, 0, DESCRIPTION_MAX_CHARS),
        None => Ok(()),
    }
}

impl Validate for Item {
    fn validate(&self) -> Result<(), ValidationError> {
        check_positive("id", self.id)?;
        check_name(&self.name)?;
        check_description(self.description.as_deref())
    }
}

impl Validate for CreateItemInput {
    fn validate(&self) -> Result<(), ValidationError> {
        check_name(&self.name)?;
        check_description(self.description.as_deref())
    }
}

impl Validate for UpdateItemInput {
    fn validate(&self) -> Result<(), ValidationError> {
        check_positive("id", self.id)?;
        if let Some(name) = &self.name {
            check_name(name)?;
        }
        check_description(self.description.as_deref())
    }
}

impl Validate for GetItemInput {
    fn validate(&self) -> Result<(), ValidationError> {
        check_positive("id", self.id)
    }
}

impl Validate for DeleteItemInput {
    fn validate(&self) -> Result<(), ValidationError> {
        check_positive("id", self.id)
    }
}
