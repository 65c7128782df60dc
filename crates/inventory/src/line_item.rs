use serde::{Deserialize, Serialize};

use essentials_core::{DomainError, DomainResult, ItemId, Money, StorageLocationId};

use crate::state::StockKey;

/// Largest absolute quantity a single line item may carry.
pub const MAX_LINE_QUANTITY: i64 = i32::MAX as i64;

/// Signed quantity change for one `(item, storage location)` pair.
///
/// Positive quantities add stock at the location, negative quantities remove
/// it. A line without a storage location is an organization-level rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: ItemId,
    pub storage_location_id: Option<StorageLocationId>,
    pub quantity: i64,
    /// Value of one unit, when the originating record knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_value: Option<Money>,
}

impl LineItem {
    pub fn new(item_id: ItemId, storage_location_id: StorageLocationId, quantity: i64) -> Self {
        Self {
            item_id,
            storage_location_id: Some(storage_location_id),
            quantity,
            unit_value: None,
        }
    }

    /// A delta recorded against the organization as a whole.
    pub fn organization_level(item_id: ItemId, quantity: i64) -> Self {
        Self {
            item_id,
            storage_location_id: None,
            quantity,
            unit_value: None,
        }
    }

    pub fn with_unit_value(mut self, unit_value: Money) -> Self {
        self.unit_value = Some(unit_value);
        self
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.storage_location_id, self.item_id)
    }

    pub fn is_zero(&self) -> bool {
        self.quantity == 0
    }

    /// The same line with its sign flipped.
    pub fn negated(&self) -> Self {
        Self {
            quantity: self.quantity.saturating_neg(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity.unsigned_abs() > MAX_LINE_QUANTITY as u64 {
            return Err(DomainError::validation(format!(
                "quantity {} for item {} exceeds the per-line limit",
                self.quantity, self.item_id
            )));
        }
        if let Some(v) = self.unit_value {
            if v.cents() < 0 {
                return Err(DomainError::validation(format!(
                    "unit value for item {} cannot be negative",
                    self.item_id
                )));
            }
        }
        Ok(())
    }

    /// Merge lines targeting the same `(item, storage location)`.
    ///
    /// Output keeps first-seen order. Quantities are summed (a zero result is
    /// kept, it simply contributes nothing when folded); the last unit value
    /// seen for a key wins.
    pub fn combine_duplicates(lines: impl IntoIterator<Item = LineItem>) -> DomainResult<Vec<LineItem>> {
        let mut combined: Vec<LineItem> = Vec::new();
        for line in lines {
            match combined.iter_mut().find(|c| c.key() == line.key()) {
                Some(existing) => {
                    existing.quantity = existing.quantity.checked_add(line.quantity).ok_or_else(|| {
                        DomainError::validation(format!("quantity overflow for item {}", line.item_id))
                    })?;
                    if line.unit_value.is_some() {
                        existing.unit_value = line.unit_value;
                    }
                }
                None => combined.push(line),
            }
        }
        Ok(combined)
    }
}
