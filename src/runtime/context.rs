//! Merged extraction context for field mapping.
//!
//! All source paths in mapping rules are written against one synthetic root
//! document: message metadata at the top level and the vendor payload under
//! `data`. List mapping derives a per-element context that shares the root.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::extraction::{coerce_found, lookup};
use crate::mapping::rule::DataType;
use crate::message::RawEntityMessage;

/// Key addressing the current array element.
pub const ELEMENT_KEY: &str = "_element";
/// Key addressing the current array index.
pub const INDEX_KEY: &str = "_index";

#[derive(Debug, Clone, PartialEq)]
struct ElementFrame {
    value: Value,
    index: Value,
}

/// Context document for one raw message.
///
/// The root is shared between a message context and all of its element
/// contexts; an element context only owns its element.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionContext {
    root: Arc<Value>,
    frame: Option<ElementFrame>,
}

impl ExtractionContext {
    /// Build the merged context for a message.
    ///
    /// # Example
    /// ```
    /// use entity_fabric::message::RawEntityMessage;
    /// use entity_fabric::runtime::ExtractionContext;
    /// use serde_json::json;
    ///
    /// let raw = serde_json::from_value::<RawEntityMessage>(json!({
    ///     "vendor": "microsoft", "type": "users", "tenant": "T1", "data": {"id": "U1"}
    /// })).unwrap();
    /// let ctx = ExtractionContext::from_message(&raw);
    /// assert_eq!(ctx.document()["tenant"], json!("T1"));
    /// assert_eq!(ctx.document()["data"]["id"], json!("U1"));
    /// ```
    pub fn from_message(message: &RawEntityMessage) -> Self {
        Self::new(
            message.tenant.as_deref(),
            message.subscriber.as_deref(),
            message.instance_id.as_deref(),
            message.domain.as_deref(),
            message.data.clone(),
        )
    }

    /// Build a context from its parts.
    pub fn new(
        tenant: Option<&str>,
        subscriber: Option<&str>,
        instance_id: Option<&str>,
        domain: Option<&str>,
        data: Value,
    ) -> Self {
        Self::from_document(json!({
            "tenant": tenant,
            "subscriber": subscriber,
            "instance_id": instance_id,
            "domain": domain,
            "data": data,
        }))
    }

    /// Wrap an existing document.
    pub fn from_document(root: Value) -> Self {
        Self {
            root: Arc::new(root),
            frame: None,
        }
    }

    /// The synthetic root document, without any element.
    pub fn document(&self) -> &Value {
        &self.root
    }

    /// Context for one element of a mapped array. Shares the parent root and
    /// adds `_element` and `_index`.
    pub fn for_element(&self, element: &Value, index: usize) -> Self {
        Self {
            root: Arc::clone(&self.root),
            frame: Some(ElementFrame {
                value: element.clone(),
                index: Value::from(index),
            }),
        }
    }

    /// The current element, when this is an element context.
    pub fn element(&self) -> Option<&Value> {
        self.frame.as_ref().map(|f| &f.value)
    }

    pub fn index(&self) -> Option<usize> {
        self.frame
            .as_ref()
            .and_then(|f| f.index.as_u64())
            .map(|i| i as usize)
    }

    /// Resolve a path. `_element[.rest]` and `_index` address the current
    /// element; every other path reads the root.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(frame) = &self.frame {
            if path == INDEX_KEY {
                return Some(&frame.index);
            }
            if path == ELEMENT_KEY {
                return Some(&frame.value).filter(|v| !v.is_null());
            }
            if let Some(rest) = path
                .strip_prefix(ELEMENT_KEY)
                .and_then(|r| r.strip_prefix('.'))
            {
                return lookup(&frame.value, rest);
            }
        }
        lookup(&self.root, path)
    }

    /// [`lookup`](Self::lookup) followed by coercion to `data_type`.
    pub fn extract(&self, path: &str, data_type: DataType) -> Option<Value> {
        coerce_found(self.lookup(path)?, path, data_type)
    }

    /// Root-level text field (`tenant`, `instance_id`, ...).
    pub fn get_context_field(&self, key: &str) -> Option<&str> {
        self.root.get(key).and_then(Value::as_str)
    }
}

impl Default for ExtractionContext {
    fn default() -> Self {
        Self::from_document(json!({}))
    }
}
