//! Entity directory: users, accounts and the product taxonomy.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::error::{EngineError, Result};
use lifecycle_core::models::{Account, Product, ProductTier, User};
use serde::Deserialize;
use tracing::{debug, warn};

/// On-disk shape of the directory document.
#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    products: Vec<Product>,
}

/// Outcome of resolving an event's `product_id` against the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductResolution<'a> {
    /// Rolled up to this tier=product node.
    Product(&'a str),
    /// The id names a family, which sits above per-product tracking.
    Family,
    /// The id is known but the node or one of its ancestors is malformed.
    Invalid,
    /// The id is not in the directory.
    Unknown,
}

/// Read-only reference data for one run.
#[derive(Debug, Clone, Default)]
pub struct EntityDirectory {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<String, Account>,
    products: BTreeMap<String, Product>,
    /// Every valid non-family node → its tier=product ancestor.
    rollup: HashMap<String, String>,
    users_by_account: BTreeMap<String, Vec<String>>,
}

impl EntityDirectory {
    /// Load the directory JSON at `path`, recording taxonomy and reference
    /// problems in `diagnostics`.
    pub fn load(path: &Path, diagnostics: &mut DiagnosticsReport) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: DirectoryFile = serde_json::from_str(&content)?;
        let directory = Self::build(file.users, file.accounts, file.products, diagnostics)?;
        debug!(
            "Loaded directory {}: {} users, {} accounts, {} products",
            path.display(),
            directory.users.len(),
            directory.accounts.len(),
            directory.products.len()
        );
        Ok(directory)
    }

    /// Index the given records. Duplicate ids make the directory unusable.
    pub fn build(
        users: Vec<User>,
        accounts: Vec<Account>,
        products: Vec<Product>,
        diagnostics: &mut DiagnosticsReport,
    ) -> Result<Self> {
        let users = index_unique(users, "user", |u| u.user_id.clone())?;
        let accounts = index_unique(accounts, "account", |a| a.account_id.clone())?;
        let products = index_unique(products, "product", |p| p.product_id.clone())?;

        let mut users_by_account: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for user in users.values() {
            if !accounts.contains_key(&user.account_id) {
                diagnostics.push(
                    DiagnosticKind::MissingAccount,
                    user.account_id.clone(),
                    format!("referenced by user {}", user.user_id),
                );
            }
            users_by_account
                .entry(user.account_id.clone())
                .or_default()
                .push(user.user_id.clone());
        }

        let rollup = build_rollup(&products, diagnostics);

        Ok(Self {
            users,
            accounts,
            products,
            rollup,
            users_by_account,
        })
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn account(&self, account_id: &str) -> Option<&Account> {
        self.accounts.get(account_id)
    }

    pub fn product(&self, product_id: &str) -> Option<&Product> {
        self.products.get(product_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Account ids referenced by users, including ones missing from the
    /// directory, in id order.
    pub fn referenced_account_ids(&self) -> impl Iterator<Item = &str> {
        self.users_by_account.keys().map(String::as_str)
    }

    /// Users belonging to `account_id`, in id order.
    pub fn users_of(&self, account_id: &str) -> &[String] {
        self.users_by_account
            .get(account_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Valid tier=product nodes, in id order.
    pub fn tracked_products(&self) -> impl Iterator<Item = &Product> {
        self.products
            .values()
            .filter(|p| p.tier == ProductTier::Product && self.rollup.contains_key(&p.product_id))
    }

    /// Resolve a product id of any tier to its tier=product ancestor.
    pub fn resolve_product(&self, product_id: &str) -> ProductResolution<'_> {
        if let Some(target) = self.rollup.get(product_id) {
            return ProductResolution::Product(target.as_str());
        }
        match self.products.get(product_id) {
            Some(p) if p.tier == ProductTier::Family && p.parent_id.is_none() => {
                ProductResolution::Family
            }
            Some(_) => ProductResolution::Invalid,
            None => ProductResolution::Unknown,
        }
    }
}

// ── Internal helpers ──────────────────────────────────────────────────────────

fn index_unique<T>(
    records: Vec<T>,
    label: &str,
    key: impl Fn(&T) -> String,
) -> Result<BTreeMap<String, T>> {
    let mut map = BTreeMap::new();
    for record in records {
        let id = key(&record);
        if id.trim().is_empty() {
            return Err(EngineError::DirectoryInvalid(format!("{label} with blank id")));
        }
        if map.insert(id.clone(), record).is_some() {
            return Err(EngineError::DirectoryInvalid(format!("duplicate {label} id {id}")));
        }
    }
    Ok(map)
}

/// Check each node's parent link and map every valid product, feature and
/// sub-feature to its tier=product ancestor.
fn build_rollup(
    products: &BTreeMap<String, Product>,
    diagnostics: &mut DiagnosticsReport,
) -> HashMap<String, String> {
    let mut valid: HashMap<&str, bool> = HashMap::new();
    for product in products.values() {
        let problem = match (product.tier.parent_tier(), product.parent_id.as_deref()) {
            (None, None) => None,
            (None, Some(_)) => Some("family must not have a parent".to_string()),
            (Some(expected), None) => Some(format!("{} needs a {} parent", product.tier.as_str(), expected.as_str())),
            (Some(expected), Some(parent_id)) => match products.get(parent_id) {
                None => Some(format!("parent {parent_id} does not exist")),
                Some(parent) if parent.tier != expected => Some(format!(
                    "parent {parent_id} is a {}, expected {}",
                    parent.tier.as_str(),
                    expected.as_str()
                )),
                Some(_) => None,
            },
        };
        if let Some(detail) = &problem {
            warn!("Invalid taxonomy node {}: {}", product.product_id, detail);
            diagnostics.push(DiagnosticKind::InvalidTaxonomy, product.product_id.clone(), detail.clone());
        }
        valid.insert(product.product_id.as_str(), problem.is_none());
    }

    let mut rollup = HashMap::new();
    for product in products.values() {
        if product.tier == ProductTier::Family {
            continue;
        }
        // Walk up until the tier=product ancestor; every node on the way
        // must be valid.
        let mut node = product;
        let target = loop {
            if !valid.get(node.product_id.as_str()).copied().unwrap_or(false) {
                break None;
            }
            if node.tier == ProductTier::Product {
                break Some(node.product_id.clone());
            }
            match node.parent_id.as_deref().and_then(|id| products.get(id)) {
                Some(parent) => node = parent,
                None => break None,
            }
        };
        if let Some(target) = target {
            rollup.insert(product.product_id.clone(), target);
        }
    }
    rollup
}
