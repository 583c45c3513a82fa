//! Demo catalog
//!
//! The e-commerce system under repair:
//! - `services/catalog_sync.py`, whose `POLICY_FIELDS` list decides which
//!   catalog attributes reach the local product store
//! - The external catalog those fields are copied from
//! - The return-eligibility check that fails when `return_policy` is not synced

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

/// Path of the catalog sync module
pub const CATALOG_SYNC_FILE: &str = "services/catalog_sync.py";

/// Field the return-eligibility check requires
pub const REQUIRED_FIELD: &str = "return_policy";

/// Catalog sync module as deployed, with `return_policy` missing
pub const CATALOG_SYNC_SOURCE: &str = r#"#!/usr/bin/env python3
"""Catalog synchronization service"""

from typing import Dict, Any

# Fields to sync from catalog
POLICY_FIELDS = ["price", "inventory", "category"]

class CatalogSync:
    def __init__(self, api_url: str):
        self.api_url = api_url

    async def sync_product(self, sku: str) -> Dict[str, Any]:
        """Sync a single product from catalog"""
        response = await self._fetch_product_data(sku)

        product_data = {}
        for field in POLICY_FIELDS:
            if field in response:
                product_data[field] = response[field]

        return product_data
"#;

/// Failed return-eligibility check
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EligibilityError {
    /// Product lacks a field the check requires
    #[error("schema validation failed: {field} missing for SKU {sku}")]
    MissingField {
        /// Missing field
        field: String,
        /// Product SKU
        sku: String,
    },

    /// Sync module has no readable `POLICY_FIELDS` list
    #[error("catalog sync source has no POLICY_FIELDS list")]
    UnreadableSync,
}

/// Product as published by the external catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub price: f64,
    pub inventory: u32,
    pub is_clearance: bool,
    pub return_policy: String,
}

impl CatalogEntry {
    fn new(sku: &str, name: &str, category: &str, price: f64, inventory: u32, is_clearance: bool) -> Self {
        let return_policy = if is_clearance {
            "FINAL_SALE_NO_RETURNS"
        } else {
            "30_DAY_RETURN"
        };
        Self {
            sku: sku.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            price,
            inventory,
            is_clearance,
            return_policy: return_policy.to_string(),
        }
    }
}

/// Look up a product in the external catalog
///
/// Unknown SKUs get a generic non-clearance entry.
#[must_use]
pub fn catalog_entry(sku: &str) -> CatalogEntry {
    match sku {
        "SKU-1001" => CatalogEntry::new(sku, "Everyday Tee", "tops", 18.0, 25, true),
        "SKU-1002" => CatalogEntry::new(sku, "Linen Pants", "bottoms", 59.0, 15, false),
        "SKU-1003" => CatalogEntry::new(sku, "Weekend Hoodie", "tops", 35.0, 8, true),
        _ => CatalogEntry::new(sku, "", "electronics", 29.99, 100, false),
    }
}

fn policy_fields_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*POLICY_FIELDS\s*=\s*\[([^\]]*)\]").ok())
        .as_ref()
}

/// Field names listed in the module's `POLICY_FIELDS`
///
/// Handles single- and multi-line lists. `None` if the list is absent.
#[must_use]
pub fn synced_fields(source: &str) -> Option<Vec<String>> {
    let captures = policy_fields_regex()?.captures(source)?;
    let body = captures.get(1)?.as_str();
    Some(
        body.split(',')
            .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\''))
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Product as seen by the local store after a sync
///
/// Identity fields always come from the local store; everything else only
/// when the sync module copies it.
///
/// # Errors
/// Returns [`EligibilityError::UnreadableSync`] if the source has no field list.
pub fn sync_product(source: &str, sku: &str) -> Result<Map<String, Value>, EligibilityError> {
    let fields = synced_fields(source).ok_or(EligibilityError::UnreadableSync)?;
    let entry = catalog_entry(sku);

    let mut product = Map::new();
    product.insert("sku".into(), json!(entry.sku));
    product.insert("name".into(), json!(entry.name));
    product.insert("is_clearance".into(), json!(entry.is_clearance));

    if let Value::Object(catalog) = json!(entry) {
        for field in fields {
            if let Some(value) = catalog.get(&field) {
                product.insert(field, value.clone());
            }
        }
    }
    Ok(product)
}

/// Result of a successful eligibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub sku: String,
    pub order_id: String,
    pub eligible: bool,
    pub return_policy: String,
    pub reason: String,
    pub is_clearance: bool,
}

impl Eligibility {
    /// Render as JSON
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!(self)
    }
}

/// Check if an order line can be returned
///
/// # Errors
/// Returns [`EligibilityError::MissingField`] when `return_policy` did not
/// survive the sync.
pub fn check_return_eligibility(
    source: &str,
    sku: &str,
    order_id: &str,
) -> Result<Eligibility, EligibilityError> {
    let product = sync_product(source, sku)?;
    let return_policy = product
        .get(REQUIRED_FIELD)
        .and_then(Value::as_str)
        .filter(|policy| !policy.is_empty())
        .ok_or_else(|| EligibilityError::MissingField {
            field: REQUIRED_FIELD.to_string(),
            sku: sku.to_string(),
        })?;

    let eligible = return_policy != "FINAL_SALE_NO_RETURNS";
    Ok(Eligibility {
        sku: sku.to_string(),
        order_id: order_id.to_string(),
        eligible,
        return_policy: return_policy.to_string(),
        reason: if eligible {
            "Standard return policy".to_string()
        } else {
            "Final sale item".to_string()
        },
        is_clearance: product
            .get("is_clearance")
            .and_then(Value::as_bool)
            .unwrap_or_default(),
    })
}
