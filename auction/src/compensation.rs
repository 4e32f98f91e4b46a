//! Correction rules for dead-lettered auction events.
//!
//! The search projection rejects blocked model names and negative mileage
//! with `InvalidArgument`. Once such a message is dead-lettered, the
//! compensation consumer rewrites the offending fields and republishes:
//!
//! | message type     | exception         | correction                          |
//! |------------------|-------------------|-------------------------------------|
//! | `AuctionCreated` | `InvalidArgument` | blocked model → placeholder, mileage < 0 → 0 |
//! | `AuctionUpdated` | `InvalidArgument` | same                                |
//!
//! Anything else is escalated to the fault ledger.

use crate::events::{AuctionCreated, AuctionUpdated};
use crate::search::ItemRules;
use gavel_core::message::Message;
use gavel_runtime::{CorrectionRule, CorrectionTable};
use serde_json::Value;

/// Model name substituted for a blocked one.
pub const PLACEHOLDER_MODEL: &str = "FooBar";

/// Rewrites blocked models and negative mileage in an item payload.
#[derive(Debug, Clone)]
pub struct ItemDefectRule {
    rules: ItemRules,
    placeholder: String,
}

impl ItemDefectRule {
    /// Replace models blocked by `rules` with `placeholder`.
    #[must_use]
    pub fn new(rules: ItemRules, placeholder: impl Into<String>) -> Self {
        Self {
            rules,
            placeholder: placeholder.into(),
        }
    }
}

impl CorrectionRule for ItemDefectRule {
    fn apply(&self, payload: &mut Value) -> bool {
        let Some(fields) = payload.as_object_mut() else {
            return false;
        };
        let mut corrected = false;

        if let Some(Value::String(model)) = fields.get_mut("model") {
            if self.rules.is_blocked(model) {
                model.clone_from(&self.placeholder);
                corrected = true;
            }
        }
        if fields.get("mileage").and_then(Value::as_i64).is_some_and(|m| m < 0) {
            fields.insert("mileage".to_string(), Value::from(0));
            corrected = true;
        }

        corrected
    }
}

/// The auction marketplace's correction table.
#[must_use]
pub fn correction_table(rules: &ItemRules) -> CorrectionTable {
    let rule = ItemDefectRule::new(rules.clone(), PLACEHOLDER_MODEL);
    CorrectionTable::new()
        .with_rule(AuctionCreated::MESSAGE_TYPE, "InvalidArgument", rule.clone())
        .with_rule(AuctionUpdated::MESSAGE_TYPE, "InvalidArgument", rule)
}
