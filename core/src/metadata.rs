//! Class accessor metadata: the backend's description of a resource's fields.
//!
//! Fetched once per resource from `GET /<resource>/:classAccessor` and kept
//! immutable for the lifetime of the resource client that owns it.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, Result};

/// Simple class names the backend uses for date and timestamp columns.
const DATE_TYPES: &[&str] = &[
    "Date",
    "Timestamp",
    "LocalDate",
    "LocalDateTime",
    "Instant",
    "ZonedDateTime",
    "OffsetDateTime",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Date,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    /// Backend type tag, e.g. `java.sql.Timestamp`.
    pub type_name: String,
}

impl Property {
    pub fn kind(&self) -> PropertyKind {
        let simple = self
            .type_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.type_name);
        if DATE_TYPES.contains(&simple) {
            PropertyKind::Date
        } else {
            PropertyKind::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassAccessor {
    pub properties: Vec<Property>,
}

#[derive(Deserialize)]
struct WireAccessor {
    properties: Option<Vec<WireProperty>>,
}

#[derive(Deserialize)]
struct WireProperty {
    name: Option<String>,
    #[serde(rename = "type")]
    type_name: Option<String>,
}

impl ClassAccessor {
    /// Validates and converts the `:classAccessor` payload.
    pub fn from_json(value: Value) -> Result<Self> {
        let wire: WireAccessor = serde_json::from_value(value)
            .map_err(|e| ApiError::MalformedMetadata(e.to_string()))?;
        let properties = wire
            .properties
            .ok_or_else(|| ApiError::MalformedMetadata("missing properties".to_string()))?;

        let properties = properties
            .into_iter()
            .enumerate()
            .map(|(index, p)| {
                let name = p.name.ok_or_else(|| {
                    ApiError::MalformedMetadata(format!("property #{index} has no name"))
                })?;
                let type_name = p.type_name.ok_or_else(|| {
                    ApiError::MalformedMetadata(format!("property {name} has no type"))
                })?;
                Ok(Property { name, type_name })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { properties })
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn kind_of(&self, field: &str) -> PropertyKind {
        self.property(field)
            .map(Property::kind)
            .unwrap_or(PropertyKind::Other)
    }
}
