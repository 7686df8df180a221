//! # Domain Types
//!
//! The five synced entities.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Synced Entities                                 │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Customer     │   │  InventoryItem  │   │     Ticket      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  meta           │   │  meta           │   │  meta           │       │
//! │  │  given_name     │   │  sku  (match)   │   │  ticket_number  │       │
//! │  │  email (match)  │   │  name           │   │  customer_id ───┼──►Cust│
//! │  │  phone (match)  │   │  quantity       │   │  status         │       │
//! │  └─────────────────┘   │  min_quantity   │   │  total_cents    │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! │  ┌─────────────────┐   ┌─────────────────┐                             │
//! │  │    Payment      │   │    Employee     │                             │
//! │  │  ─────────────  │   │  ─────────────  │                             │
//! │  │  meta           │   │  meta           │                             │
//! │  │  ticket_id ─────┼─► │  display_name   │                             │
//! │  │  customer_id    │   │  role           │                             │
//! │  │  amount_cents   │   │  is_active      │                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! │                                                                         │
//! │  Foreign references hold the referenced record's local_id.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All monetary values are integer cents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::record::{EntityKind, LowStockAlert, MatchKey, SyncMeta, SyncableRecord};
use crate::validation::{
    validate_email, validate_name, validate_non_negative, validate_non_zero, validate_sku,
    ValidationResult,
};
use crate::error::ValidationError;

// =============================================================================
// Customer
// =============================================================================

/// A shop customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Customer {
    #[serde(flatten)]
    pub meta: SyncMeta,

    pub given_name: String,

    #[serde(default)]
    pub family_name: Option<String>,

    /// Matched case-insensitively against POS customers.
    #[serde(default)]
    pub email: Option<String>,

    /// Matched exactly against POS customers.
    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub notes: Option<String>,
}

impl Customer {
    pub fn new(tenant_id: impl Into<String>, given_name: impl Into<String>) -> Self {
        Customer {
            meta: SyncMeta::new(tenant_id),
            given_name: given_name.into(),
            family_name: None,
            email: None,
            phone: None,
            notes: None,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.family_name {
            Some(family) if !family.trim().is_empty() => format!("{} {}", self.given_name, family),
            _ => self.given_name.clone(),
        }
    }
}

impl SyncableRecord for Customer {
    const KIND: EntityKind = EntityKind::Customer;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn match_keys(&self) -> Vec<MatchKey> {
        self.email
            .as_deref()
            .and_then(MatchKey::email)
            .into_iter()
            .chain(self.phone.as_deref().and_then(MatchKey::phone))
            .collect()
    }

    /// A customer needs a name or at least one way to reach them.
    fn validate(&self) -> ValidationResult<()> {
        let has_contact = self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
            || self.phone.as_deref().is_some_and(|p| !p.trim().is_empty());

        if self.given_name.trim().is_empty() && !has_contact {
            return Err(ValidationError::Required {
                field: "given_name".to_string(),
            });
        }
        Ok(())
    }

    fn validate_entry(&self) -> ValidationResult<()> {
        self.validate()?;
        if let Some(email) = self.email.as_deref().filter(|e| !e.trim().is_empty()) {
            validate_email(email)?;
        }
        Ok(())
    }
}

// =============================================================================
// Inventory Item
// =============================================================================

/// A stocked part or product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InventoryItem {
    #[serde(flatten)]
    pub meta: SyncMeta,

    /// Stock Keeping Unit; the secondary match key.
    pub sku: String,

    pub name: String,

    pub price_cents: i64,

    #[serde(default)]
    pub cost_cents: Option<i64>,

    /// On-hand quantity. May go negative after oversells.
    #[serde(default)]
    pub quantity: i64,

    /// Reorder threshold; `quantity <= min_quantity` raises a low-stock alert.
    #[serde(default)]
    pub min_quantity: i64,
}

impl InventoryItem {
    pub fn new(
        tenant_id: impl Into<String>,
        sku: impl Into<String>,
        name: impl Into<String>,
        price_cents: i64,
    ) -> Self {
        InventoryItem {
            meta: SyncMeta::new(tenant_id),
            sku: sku.into(),
            name: name.into(),
            price_cents,
            cost_cents: None,
            quantity: 0,
            min_quantity: 0,
        }
    }

    #[inline]
    pub fn is_low_stock(&self) -> bool {
        self.quantity <= self.min_quantity
    }
}

impl SyncableRecord for InventoryItem {
    const KIND: EntityKind = EntityKind::InventoryItem;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn match_keys(&self) -> Vec<MatchKey> {
        MatchKey::sku(&self.sku).into_iter().collect()
    }

    fn validate(&self) -> ValidationResult<()> {
        if self.sku.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "sku".to_string(),
            });
        }
        validate_name("name", &self.name)?;
        validate_non_negative("price_cents", self.price_cents)?;
        if let Some(cost) = self.cost_cents {
            validate_non_negative("cost_cents", cost)?;
        }
        validate_non_negative("min_quantity", self.min_quantity)?;
        Ok(())
    }

    /// SKU format is only enforced on SKUs typed in here; the POS has its
    /// own rules.
    fn validate_entry(&self) -> ValidationResult<()> {
        self.validate()?;
        validate_sku(&self.sku)
    }

    fn low_stock_alert(&self) -> Option<LowStockAlert> {
        if self.meta.is_deleted() || !self.is_low_stock() {
            return None;
        }
        Some(LowStockAlert {
            local_id: self.meta.local_id.clone(),
            sku: self.sku.clone(),
            name: self.name.clone(),
            quantity: self.quantity,
            min_quantity: self.min_quantity,
        })
    }
}

// =============================================================================
// Ticket
// =============================================================================

/// Repair ticket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    AwaitingParts,
    Ready,
    Closed,
    Cancelled,
}

/// A repair/service ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Ticket {
    #[serde(flatten)]
    pub meta: SyncMeta,

    /// Human-facing number printed on the claim slip.
    pub ticket_number: String,

    /// Customer `local_id`.
    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub status: TicketStatus,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub total_cents: i64,

    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub due_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn new(tenant_id: impl Into<String>, ticket_number: impl Into<String>) -> Self {
        Ticket {
            meta: SyncMeta::new(tenant_id),
            ticket_number: ticket_number.into(),
            customer_id: None,
            status: TicketStatus::Open,
            description: String::new(),
            total_cents: 0,
            due_at: None,
        }
    }
}

impl SyncableRecord for Ticket {
    const KIND: EntityKind = EntityKind::Ticket;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn validate(&self) -> ValidationResult<()> {
        validate_name("ticket_number", &self.ticket_number)?;
        validate_non_negative("total_cents", self.total_cents)?;
        Ok(())
    }
}

// =============================================================================
// Payment
// =============================================================================

/// How a payment was tendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PaymentMethod {
    #[default]
    Cash,
    Card,
    GiftCard,
    Other,
}

/// A payment taken against a ticket or a walk-in sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Payment {
    #[serde(flatten)]
    pub meta: SyncMeta,

    /// Ticket `local_id`.
    #[serde(default)]
    pub ticket_id: Option<String>,

    /// Customer `local_id`.
    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub method: PaymentMethod,

    /// Negative for refunds.
    pub amount_cents: i64,

    /// Terminal or processor reference.
    #[serde(default)]
    pub reference: Option<String>,

    #[ts(as = "String")]
    pub paid_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(tenant_id: impl Into<String>, method: PaymentMethod, amount_cents: i64) -> Self {
        let meta = SyncMeta::new(tenant_id);
        let paid_at = meta.updated_at;
        Payment {
            meta,
            ticket_id: None,
            customer_id: None,
            method,
            amount_cents,
            reference: None,
            paid_at,
        }
    }
}

impl SyncableRecord for Payment {
    const KIND: EntityKind = EntityKind::Payment;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn validate(&self) -> ValidationResult<()> {
        validate_non_zero("amount_cents", self.amount_cents)
    }
}

// =============================================================================
// Employee
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum EmployeeRole {
    Owner,
    Manager,
    Technician,
    #[default]
    Cashier,
}

/// A staff member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Employee {
    #[serde(flatten)]
    pub meta: SyncMeta,

    pub display_name: String,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub role: EmployeeRole,

    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Employee {
    pub fn new(tenant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Employee {
            meta: SyncMeta::new(tenant_id),
            display_name: display_name.into(),
            email: None,
            role: EmployeeRole::default(),
            is_active: true,
        }
    }
}

impl SyncableRecord for Employee {
    const KIND: EntityKind = EntityKind::Employee;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn validate(&self) -> ValidationResult<()> {
        validate_name("display_name", &self.display_name)
    }

    fn validate_entry(&self) -> ValidationResult<()> {
        self.validate()?;
        if let Some(email) = self.email.as_deref().filter(|e| !e.trim().is_empty()) {
            validate_email(email)?;
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
