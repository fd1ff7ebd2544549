//! Product catalog: what can be bought and what a purchase grants.

use std::collections::HashMap;
use std::path::Path;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// A product id or price id that is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown product: {0}")]
pub struct UnknownProduct(pub String);

/// Errors raised while loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate product id: {0}")]
    DuplicateProduct(String),

    #[error("Duplicate price id: {0}")]
    DuplicatePrice(String),

    #[error("Invalid subscription term for {0}: term days must be positive and coins non-negative")]
    InvalidTerm(String),
}

/// What a product grants when paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductKind {
    /// A time-boxed entitlement plus a coin grant per paid term.
    #[serde(rename_all = "camelCase")]
    Subscription { term_days: u32, value_coins: i64 },
    /// A plain purchase. Recorded as an order, never touches the ledger.
    OneOff,
}

/// Coin grant and validity duration of one subscription purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Term {
    pub days: u32,
    pub value_coins: i64,
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Store product id (App Store product identifier).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Card gateway price id mapped to this product.
    #[serde(default)]
    pub price_id: Option<String>,
    /// Expected card gateway charge in major units.
    #[serde(default)]
    pub price: Option<BigDecimal>,
    #[serde(default)]
    pub currency: Option<String>,
    pub kind: ProductKind,
}

impl Product {
    /// Returns the subscription term, or `None` for one-off products.
    pub fn term(&self) -> Option<Term> {
        match self.kind {
            ProductKind::Subscription {
                term_days,
                value_coins,
            } => Some(Term {
                days: term_days,
                value_coins,
            }),
            ProductKind::OneOff => None,
        }
    }

    pub fn is_subscription(&self) -> bool {
        self.term().is_some()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    products: Vec<Product>,
}

/// Immutable product lookup by product id and by card gateway price id.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    products: Vec<Product>,
    by_id: HashMap<String, usize>,
    by_price: HashMap<String, usize>,
}

impl ProductCatalog {
    pub fn new(products: Vec<Product>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::new();
        let mut by_price = HashMap::new();

        for (index, product) in products.iter().enumerate() {
            if let ProductKind::Subscription {
                term_days,
                value_coins,
            } = product.kind
            {
                if term_days == 0 || value_coins < 0 {
                    return Err(CatalogError::InvalidTerm(product.id.clone()));
                }
            }
            if by_id.insert(product.id.clone(), index).is_some() {
                return Err(CatalogError::DuplicateProduct(product.id.clone()));
            }
            if let Some(price_id) = &product.price_id {
                if by_price.insert(price_id.clone(), index).is_some() {
                    return Err(CatalogError::DuplicatePrice(price_id.clone()));
                }
            }
        }

        Ok(Self {
            products,
            by_id,
            by_price,
        })
    }

    /// Parses a catalog document of the form `{"products": [...]}`.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::new(file.products)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn product(&self, product_id: &str) -> Option<&Product> {
        self.by_id.get(product_id).map(|&i| &self.products[i])
    }

    pub fn by_price_id(&self, price_id: &str) -> Option<&Product> {
        self.by_price.get(price_id).map(|&i| &self.products[i])
    }

    pub fn resolve(&self, product_id: &str) -> Result<&Product, UnknownProduct> {
        self.product(product_id)
            .ok_or_else(|| UnknownProduct(product_id.to_string()))
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
