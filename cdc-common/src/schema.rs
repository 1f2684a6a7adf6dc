//! Static metadata for the tracked CRM entities: which fields each entity must carry,
//! what kind of value each known field holds, and how entities map to tables.
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Entity keys and foreign keys: 15 or 18 character CRM identifiers.
pub static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{15,18}$").expect("identifier pattern is valid"));

pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(value)
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ObjectType")]
pub struct ParseObjectTypeError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    Account,
    Contact,
    Opportunity,
    Case,
}

/// The kind of scalar a field is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    /// ISO-8601 instant carried as a string.
    Timestamp,
    /// ISO-8601 calendar date carried as a string.
    Date,
    /// Nested object, or its serialized text form.
    Json,
}

impl FieldKind {
    /// Null is accepted for every kind: presence is enforced by the required-field list.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }

        match self {
            FieldKind::String | FieldKind::Timestamp | FieldKind::Date => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Json => value.is_object() || value.is_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Date => "date",
            FieldKind::Json => "json",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the JSON type of a value, for error messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const ACCOUNT_REQUIRED: &[&str] = &["id", "name", "created_date", "last_modified_date"];
const CONTACT_REQUIRED: &[&str] = &[
    "id",
    "first_name",
    "last_name",
    "created_date",
    "last_modified_date",
];
const OPPORTUNITY_REQUIRED: &[&str] = &[
    "id",
    "name",
    "stage_name",
    "created_date",
    "last_modified_date",
];
const CASE_REQUIRED: &[&str] = &["id", "subject", "status", "created_date", "last_modified_date"];

const ACCOUNT_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::String),
    ("name", FieldKind::String),
    ("type", FieldKind::String),
    ("industry", FieldKind::String),
    ("annual_revenue", FieldKind::Number),
    ("phone", FieldKind::String),
    ("website", FieldKind::String),
    ("billing_address", FieldKind::Json),
    ("shipping_address", FieldKind::Json),
    ("created_date", FieldKind::Timestamp),
    ("last_modified_date", FieldKind::Timestamp),
    ("system_modstamp", FieldKind::Timestamp),
];

const CONTACT_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::String),
    ("account_id", FieldKind::String),
    ("first_name", FieldKind::String),
    ("last_name", FieldKind::String),
    ("email", FieldKind::String),
    ("phone", FieldKind::String),
    ("title", FieldKind::String),
    ("lead_source", FieldKind::String),
    ("created_date", FieldKind::Timestamp),
    ("last_modified_date", FieldKind::Timestamp),
    ("system_modstamp", FieldKind::Timestamp),
];

const OPPORTUNITY_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::String),
    ("account_id", FieldKind::String),
    ("name", FieldKind::String),
    ("stage_name", FieldKind::String),
    ("type", FieldKind::String),
    ("lead_source", FieldKind::String),
    ("amount", FieldKind::Number),
    ("probability", FieldKind::Number),
    ("close_date", FieldKind::Date),
    ("is_won", FieldKind::Boolean),
    ("is_closed", FieldKind::Boolean),
    ("created_date", FieldKind::Timestamp),
    ("last_modified_date", FieldKind::Timestamp),
    ("system_modstamp", FieldKind::Timestamp),
];

const CASE_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::String),
    ("account_id", FieldKind::String),
    ("contact_id", FieldKind::String),
    ("subject", FieldKind::String),
    ("description", FieldKind::String),
    ("status", FieldKind::String),
    ("origin", FieldKind::String),
    ("priority", FieldKind::String),
    ("is_escalated", FieldKind::Boolean),
    ("is_closed", FieldKind::Boolean),
    ("closed_date", FieldKind::Timestamp),
    ("created_date", FieldKind::Timestamp),
    ("last_modified_date", FieldKind::Timestamp),
    ("system_modstamp", FieldKind::Timestamp),
];

impl ObjectType {
    pub const ALL: [ObjectType; 4] = [
        ObjectType::Account,
        ObjectType::Contact,
        ObjectType::Opportunity,
        ObjectType::Case,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Account => "Account",
            ObjectType::Contact => "Contact",
            ObjectType::Opportunity => "Opportunity",
            ObjectType::Case => "Case",
        }
    }

    /// Fields that must be non-null in the `after` snapshot of INSERT and UPDATE events.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ObjectType::Account => ACCOUNT_REQUIRED,
            ObjectType::Contact => CONTACT_REQUIRED,
            ObjectType::Opportunity => OPPORTUNITY_REQUIRED,
            ObjectType::Case => CASE_REQUIRED,
        }
    }

    pub fn field_kinds(&self) -> &'static [(&'static str, FieldKind)] {
        match self {
            ObjectType::Account => ACCOUNT_FIELDS,
            ObjectType::Contact => CONTACT_FIELDS,
            ObjectType::Opportunity => OPPORTUNITY_FIELDS,
            ObjectType::Case => CASE_FIELDS,
        }
    }

    pub fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.field_kinds()
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, kind)| *kind)
    }

    /// Fields referencing other entities, which must look like identifiers when set.
    pub fn foreign_keys(&self) -> &'static [&'static str] {
        match self {
            ObjectType::Account => &[],
            ObjectType::Contact | ObjectType::Opportunity => &["account_id"],
            ObjectType::Case => &["account_id", "contact_id"],
        }
    }

    /// Three character key prefix the CRM uses for identifiers of this entity.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            ObjectType::Account => "001",
            ObjectType::Contact => "003",
            ObjectType::Opportunity => "006",
            ObjectType::Case => "500",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = ParseObjectTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Account" => Ok(ObjectType::Account),
            "Contact" => Ok(ObjectType::Contact),
            "Opportunity" => Ok(ObjectType::Opportunity),
            "Case" => Ok(ObjectType::Case),
            invalid => Err(ParseObjectTypeError(invalid.to_owned())),
        }
    }
}

/// Maps an entity type to the tables holding its raw feed and its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub raw_prefix: String,
    pub history_suffix: String,
}

impl TableNames {
    pub fn new(raw_prefix: &str, history_suffix: &str) -> Self {
        Self {
            raw_prefix: raw_prefix.to_owned(),
            history_suffix: history_suffix.to_owned(),
        }
    }

    pub fn raw_table(&self, object_type: ObjectType) -> String {
        format!("{}{}", self.raw_prefix, object_type.as_str().to_lowercase())
    }

    pub fn history_table(&self, object_type: ObjectType) -> String {
        format!(
            "{}{}",
            object_type.as_str().to_lowercase(),
            self.history_suffix
        )
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::new("raw_", "_history")
    }
}

/// Convert a camelCase field name to snake_case, e.g. `AccountId` to `account_id`.
pub fn normalize_field_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            normalized.push('_');
            normalized.push(c.to_ascii_lowercase());
        } else {
            normalized.push(c);
        }
    }
    normalized.trim_start_matches('_').to_owned()
}
