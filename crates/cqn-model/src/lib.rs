//! Reflected entity metadata
//!
//! A read-only view of the definitions the pipeline consults: entities, their
//! ordered elements, keys, associations and annotations. Loaded from CSN-style
//! JSON and shared behind an `Arc` by the hosting service.

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use cqn_ir::Expr;

mod on;
pub use on::{join_keys, on_condition, JoinKey};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Entity not found: {0}")]
    UnknownEntity(String),

    #[error("Element {element} not found in {entity}")]
    UnknownElement { entity: String, element: String },

    #[error("Element {element} of {entity} is not an association")]
    NotAnAssociation { entity: String, element: String },

    #[error("Failed to parse model: {0}")]
    Json(#[from] serde_json::Error),
}

/// Primitive and structural element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    #[serde(rename = "cds.Boolean")]
    Boolean,
    #[serde(rename = "cds.Integer")]
    Integer,
    #[serde(rename = "cds.Int16")]
    Int16,
    #[serde(rename = "cds.Int32")]
    Int32,
    #[serde(rename = "cds.Int64")]
    Int64,
    #[serde(rename = "cds.UInt8")]
    UInt8,
    #[serde(rename = "cds.Decimal")]
    Decimal,
    #[serde(rename = "cds.Double")]
    Double,
    #[serde(rename = "cds.String")]
    String,
    #[serde(rename = "cds.LargeString")]
    LargeString,
    #[serde(rename = "cds.UUID")]
    Uuid,
    #[serde(rename = "cds.Date")]
    Date,
    #[serde(rename = "cds.Time")]
    Time,
    #[serde(rename = "cds.DateTime")]
    DateTime,
    #[serde(rename = "cds.Timestamp")]
    Timestamp,
    #[serde(rename = "cds.Binary")]
    Binary,
    #[serde(rename = "cds.LargeBinary")]
    LargeBinary,
    #[serde(rename = "cds.Association")]
    Association,
    #[serde(rename = "cds.Composition")]
    Composition,
    #[serde(other)]
    Other,
}

impl ElementType {
    /// Types `$search` may look into
    pub fn is_searchable(self) -> bool {
        matches!(
            self,
            ElementType::String
                | ElementType::Uuid
                | ElementType::Date
                | ElementType::Time
                | ElementType::DateTime
                | ElementType::Timestamp
        )
    }

    pub fn is_association(self) -> bool {
        matches!(self, ElementType::Association | ElementType::Composition)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cardinality {
    #[serde(default)]
    pub max: Option<serde_json::Value>,
}

/// Managed association key, `{ref: ['ID'], as?: 'ID'}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(rename = "ref")]
    pub path: Vec<String>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ForeignKey {
    /// Name of the referenced target element
    pub fn target_element(&self) -> String {
        self.path.join("_")
    }

    /// Suffix used for the generated foreign key column
    pub fn name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.target_element())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(skip)]
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<ElementType>,

    #[serde(default)]
    pub key: bool,

    #[serde(rename = "virtual", default)]
    pub virtual_: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<ForeignKey>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<Vec<Expr>>,

    /// Annotations (`@...`) and any other properties
    #[serde(flatten)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

impl Element {
    pub fn is_association(&self) -> bool {
        self.type_.map(ElementType::is_association).unwrap_or(false) || self.target.is_some()
    }

    pub fn is_to_many(&self) -> bool {
        if !self.is_association() {
            return false;
        }
        match self.cardinality.as_ref().and_then(|c| c.max.as_ref()) {
            Some(serde_json::Value::String(max)) => max == "*",
            Some(serde_json::Value::Number(max)) => max.as_u64().map(|m| m > 1).unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_to_one(&self) -> bool {
        self.is_association() && !self.is_to_many()
    }

    /// Truthy annotation lookup, name without the leading `@`
    pub fn annotated(&self, name: &str) -> bool {
        match self.annotations.get(&format!("@{}", name)) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.annotated("cds.api.ignore")
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.type_, Some(ElementType::LargeBinary)) || self.annotated("Core.MediaType")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(skip)]
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_elements", serialize_with = "serialize_elements")]
    pub elements: Vec<Element>,

    #[serde(flatten)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn try_element(&self, name: &str) -> Result<&Element, ModelError> {
        self.element(name).ok_or_else(|| ModelError::UnknownElement {
            entity: self.name.clone(),
            element: name.to_string(),
        })
    }

    pub fn association(&self, name: &str) -> Result<&Element, ModelError> {
        let element = self.try_element(name)?;
        if !element.is_association() {
            return Err(ModelError::NotAnAssociation {
                entity: self.name.clone(),
                element: name.to_string(),
            });
        }
        Ok(element)
    }

    pub fn is_association(&self, name: &str) -> bool {
        self.element(name).map(Element::is_association).unwrap_or(false)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| e.key)
    }

    /// Key column names; managed association keys expand to `assoc_fk`
    pub fn key_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for key in self.keys() {
            let names = match &key.keys {
                Some(fks) if key.is_association() => {
                    fks.iter().map(|fk| format!("{}_{}", key.name, fk.name())).collect()
                }
                _ if key.is_association() => Vec::new(),
                _ => vec![key.name.clone()],
            };
            for name in names {
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }
        columns
    }

    /// Associations in declaration order
    pub fn associations(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| e.is_association())
    }

    pub fn is_singleton(&self) -> bool {
        matches!(self.annotations.get("@odata.singleton"), Some(serde_json::Value::Bool(true)))
    }

    /// Persisted, exposed columns
    pub fn columns(&self) -> impl Iterator<Item = &Element> {
        self.elements
            .iter()
            .filter(|e| !e.is_association() && !e.virtual_ && !e.is_ignored())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns().map(|e| e.name.clone()).collect()
    }

    /// Columns `$search` looks into: annotated defaults if any, else every text/date column
    pub fn searchable_columns(&self) -> Vec<String> {
        let allowed: Vec<&Element> = self
            .columns()
            .filter(|e| e.type_.map(ElementType::is_searchable).unwrap_or(false))
            .collect();
        let annotated: Vec<String> = allowed
            .iter()
            .filter(|e| e.annotated("Search.defaultSearchElement"))
            .map(|e| e.name.clone())
            .collect();
        if annotated.is_empty() {
            allowed.iter().map(|e| e.name.clone()).collect()
        } else {
            annotated
        }
    }
}

/// All entity definitions of one service generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    definitions: BTreeMap<String, Entity>,
}

impl Model {
    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        let mut model: Model = serde_json::from_str(json)?;
        for (name, entity) in model.definitions.iter_mut() {
            entity.name = name.clone();
        }
        Ok(model)
    }

    pub fn insert(&mut self, mut entity: Entity, name: impl Into<String>) {
        let name = name.into();
        entity.name = name.clone();
        self.definitions.insert(name, entity);
    }

    pub fn find(&self, name: &str) -> Option<&Entity> {
        self.definitions.get(name)
    }

    pub fn entity(&self, name: &str) -> Result<&Entity, ModelError> {
        self.find(name).ok_or_else(|| ModelError::UnknownEntity(name.to_string()))
    }

    /// Target entity of `entity.assoc`
    pub fn target(&self, entity: &Entity, assoc: &str) -> Result<&Entity, ModelError> {
        let element = entity.association(assoc)?;
        let target = element.target.as_deref().ok_or_else(|| ModelError::NotAnAssociation {
            entity: entity.name.clone(),
            element: assoc.to_string(),
        })?;
        self.entity(target)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.definitions.values()
    }

    /// Generated `assoc_key` columns of the managed to-one associations of `entity`
    pub fn foreign_key_columns(&self, entity: &Entity) -> Result<Vec<String>, ModelError> {
        let mut columns = Vec::new();
        for assoc in entity.associations().filter(|a| a.is_to_one() && a.on.is_none()) {
            let names: Vec<String> = match &assoc.keys {
                Some(keys) => keys.iter().map(ForeignKey::name).collect(),
                None => self.target(entity, &assoc.name)?.key_columns(),
            };
            columns.extend(names.into_iter().map(|n| format!("{}_{}", assoc.name, n)));
        }
        Ok(columns)
    }
}

fn deserialize_elements<'de, D>(deserializer: D) -> Result<Vec<Element>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ElementsVisitor;

    impl<'de> Visitor<'de> for ElementsVisitor {
        type Value = Vec<Element>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of element definitions")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            // Declaration order is significant for default projections.
            let mut elements = Vec::new();
            while let Some((name, mut element)) = map.next_entry::<String, Element>()? {
                if elements.iter().any(|e: &Element| e.name == name) {
                    return Err(de::Error::custom(format!("duplicate element {}", name)));
                }
                element.name = name;
                elements.push(element);
            }
            Ok(elements)
        }
    }

    deserializer.deserialize_map(ElementsVisitor)
}

fn serialize_elements<S>(elements: &[Element], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(elements.len()))?;
    for element in elements {
        map.serialize_entry(&element.name, element)?;
    }
    map.end()
}
