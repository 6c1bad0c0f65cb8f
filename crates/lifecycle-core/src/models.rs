use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Kind of entity that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User,
    Account,
    System,
    Admin,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Account => "account",
            EntityType::System => "system",
            EntityType::Admin => "admin",
        }
    }
}

impl FromStr for EntityType {
    type Err = EngineError;

    /// Exact, lowercase match only: the input contract treats any other
    /// spelling as a violation.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(EntityType::User),
            "account" => Ok(EntityType::Account),
            "system" => Ok(EntityType::System),
            "admin" => Ok(EntityType::Admin),
            other => Err(EngineError::Config(format!("unknown entity_type: {other}"))),
        }
    }
}

/// Client surface an event was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    WebApp,
    MobileApp,
    Api,
    DesktopApp,
}

impl Location {
    pub const ALL: [Location; 4] = [
        Location::WebApp,
        Location::MobileApp,
        Location::Api,
        Location::DesktopApp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::WebApp => "web_app",
            Location::MobileApp => "mobile_app",
            Location::Api => "api",
            Location::DesktopApp => "desktop_app",
        }
    }
}

impl FromStr for Location {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "web_app" => Ok(Location::WebApp),
            "mobile_app" => Ok(Location::MobileApp),
            "api" => Ok(Location::Api),
            "desktop_app" => Ok(Location::DesktopApp),
            other => Err(EngineError::Config(format!("unknown location: {other}"))),
        }
    }
}

// ── Event ─────────────────────────────────────────────────────────────────────

/// A single validated record from the event log.
///
/// Events are immutable once accepted; every derived table is recomputed
/// from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub event_id: String,
    /// Identifier of the emitting entity (user id, account id, ...).
    pub entity_id: String,
    pub entity_type: EntityType,
    /// Snake-case event name, e.g. `"project_create"`.
    pub event_type: String,
    /// UTC instant the event happened.
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Product taxonomy node the event touched, at any tier.
    #[serde(default)]
    pub product_id: Option<String>,
    /// Counts toward the subject's "active" determination.
    #[serde(default)]
    pub is_qualifying_event: bool,
    /// Marks first meaningful engagement with a product.
    #[serde(default)]
    pub is_activation_event: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ── Entity directory records ─────────────────────────────────────────────────

/// A platform user. Every user belongs to exactly one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub account_id: String,
    #[serde(default)]
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A customer account holding licensed seats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    #[serde(default)]
    pub account_name: Option<String>,
    /// Commercial type, e.g. `"enterprise"`, `"small_business"`.
    pub account_type: String,
    #[serde(default)]
    pub industry: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Licensed seats. Zero means the seat count is unknown.
    #[serde(default)]
    pub total_seats: u32,
    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_payment_at: Option<DateTime<Utc>>,
    /// Next contract renewal due date.
    #[serde(default)]
    pub renewal_date: Option<DateTime<Utc>>,
    /// Number of renewals already completed.
    #[serde(default)]
    pub renewals_completed: u32,
}

/// Level of a node in the product taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductTier {
    Family,
    Product,
    Feature,
    SubFeature,
}

impl ProductTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductTier::Family => "family",
            ProductTier::Product => "product",
            ProductTier::Feature => "feature",
            ProductTier::SubFeature => "sub_feature",
        }
    }

    /// The tier a node's parent must have, or `None` for roots.
    pub fn parent_tier(&self) -> Option<ProductTier> {
        match self {
            ProductTier::Family => None,
            ProductTier::Product => Some(ProductTier::Family),
            ProductTier::Feature => Some(ProductTier::Product),
            ProductTier::SubFeature => Some(ProductTier::Feature),
        }
    }
}

/// A node of the 4-tier product taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub tier: ProductTier,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// ── Lifecycle states ──────────────────────────────────────────────────────────

/// One of the three independent lifecycle state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleDomain {
    Platform,
    Account,
    Product,
}

impl fmt::Display for LifecycleDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleDomain::Platform => "platform",
            LifecycleDomain::Account => "account",
            LifecycleDomain::Product => "product",
        };
        f.write_str(s)
    }
}

/// Behaviour shared by the per-domain state enumerations.
pub trait LifecycleState: Copy + Eq + fmt::Debug + Serialize + Send + Sync + 'static {
    /// Domain the enumeration belongs to.
    const DOMAIN: LifecycleDomain;

    /// Every state of the domain, `unknown` last.
    fn variants() -> &'static [Self];

    /// Reserved state for subjects with missing reference data.
    fn unknown() -> Self;

    /// State assigned to a subject with no events at all.
    fn zero_activity_default() -> Self;

    fn as_str(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformState {
    New,
    Active,
    Dormant,
    Churned,
    Unknown,
}

impl LifecycleState for PlatformState {
    const DOMAIN: LifecycleDomain = LifecycleDomain::Platform;

    fn variants() -> &'static [Self] {
        &[
            PlatformState::New,
            PlatformState::Active,
            PlatformState::Dormant,
            PlatformState::Churned,
            PlatformState::Unknown,
        ]
    }

    fn unknown() -> Self {
        PlatformState::Unknown
    }

    fn zero_activity_default() -> Self {
        PlatformState::New
    }

    fn as_str(&self) -> &'static str {
        match self {
            PlatformState::New => "new",
            PlatformState::Active => "active",
            PlatformState::Dormant => "dormant",
            PlatformState::Churned => "churned",
            PlatformState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Trial,
    NewPaid,
    Expanding,
    Active,
    Contracting,
    AtRisk,
    Churned,
    Unknown,
}

impl LifecycleState for AccountState {
    const DOMAIN: LifecycleDomain = LifecycleDomain::Account;

    fn variants() -> &'static [Self] {
        &[
            AccountState::Trial,
            AccountState::NewPaid,
            AccountState::Expanding,
            AccountState::Active,
            AccountState::Contracting,
            AccountState::AtRisk,
            AccountState::Churned,
            AccountState::Unknown,
        ]
    }

    fn unknown() -> Self {
        AccountState::Unknown
    }

    fn zero_activity_default() -> Self {
        AccountState::Trial
    }

    fn as_str(&self) -> &'static str {
        match self {
            AccountState::Trial => "trial",
            AccountState::NewPaid => "new_paid",
            AccountState::Expanding => "expanding",
            AccountState::Active => "active",
            AccountState::Contracting => "contracting",
            AccountState::AtRisk => "at_risk",
            AccountState::Churned => "churned",
            AccountState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductState {
    NeverAdopted,
    NewToProduct,
    ActiveInProduct,
    DormantInProduct,
    ChurnedFromProduct,
    Unknown,
}

impl LifecycleState for ProductState {
    const DOMAIN: LifecycleDomain = LifecycleDomain::Product;

    fn variants() -> &'static [Self] {
        &[
            ProductState::NeverAdopted,
            ProductState::NewToProduct,
            ProductState::ActiveInProduct,
            ProductState::DormantInProduct,
            ProductState::ChurnedFromProduct,
            ProductState::Unknown,
        ]
    }

    fn unknown() -> Self {
        ProductState::Unknown
    }

    fn zero_activity_default() -> Self {
        ProductState::NeverAdopted
    }

    fn as_str(&self) -> &'static str {
        match self {
            ProductState::NeverAdopted => "never_adopted",
            ProductState::NewToProduct => "new_to_product",
            ProductState::ActiveInProduct => "active_in_product",
            ProductState::DormantInProduct => "dormant_in_product",
            ProductState::ChurnedFromProduct => "churned_from_product",
            ProductState::Unknown => "unknown",
        }
    }
}

// ── Lifecycle output rows ────────────────────────────────────────────────────

/// Event counters carried on every lifecycle row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectCounters {
    pub events: u64,
    pub qualifying_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_since_last_qualifying: Option<i64>,
}

/// Seat and health figures attached to account lifecycle rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountMetrics {
    pub total_seats: u32,
    pub active_users_30d: u32,
    /// `None` when the account has no licensed seats.
    pub utilization_pct: Option<f64>,
    pub adoption_breadth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_to_renewal: Option<i64>,
    pub health_score: f64,
}

/// Current lifecycle state of one subject in one domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleRecord<S: LifecycleState> {
    pub subject_id: String,
    pub domain: LifecycleDomain,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub state: S,
    /// Instant the current state began holding (the as-of instant for
    /// `unknown`).
    pub state_since: DateTime<Utc>,
    /// Name of the rule that produced `state`.
    pub rule: &'static str,
    pub last_qualifying_event_at: Option<DateTime<Utc>>,
    pub counters: SubjectCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountMetrics>,
}

// ── Metric grain ──────────────────────────────────────────────────────────────

/// Time grain of a metric window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grain {
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "7d")]
    SevenDay,
    #[serde(rename = "30d")]
    ThirtyDay,
    #[serde(rename = "month")]
    Month,
    #[serde(rename = "18mo")]
    EighteenMonth,
}
