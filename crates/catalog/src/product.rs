use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use pharmaflow_core::ProductId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Active,
    Archived,
}

/// What the catalog tells us about a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub product_id: ProductId,
    pub name: String,
    /// Price in smallest currency unit (e.g., cents).
    pub price: u64,
    pub status: ProductStatus,
}

impl ProductInfo {
    pub fn active(product_id: ProductId, name: impl Into<String>, price: u64) -> Self {
        Self {
            product_id,
            name: name.into(),
            price,
            status: ProductStatus::Active,
        }
    }

    /// Archived products are treated as missing by order confirmation.
    pub fn can_be_sold(&self) -> bool {
        self.status == ProductStatus::Active
    }

    pub fn has_valid_price(&self) -> bool {
        self.price > 0
    }
}

/// Read-only port onto the external catalog.
pub trait ProductCatalog: Send + Sync {
    fn get_product(&self, product_id: &ProductId) -> Option<ProductInfo>;
}

impl<C> ProductCatalog for Arc<C>
where
    C: ProductCatalog + ?Sized,
{
    fn get_product(&self, product_id: &ProductId) -> Option<ProductInfo> {
        (**self).get_product(product_id)
    }
}

/// Catalog kept in process memory, seeded through the API or by tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<ProductId, ProductInfo>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = ProductInfo>) -> Self {
        let catalog = Self::new();
        for p in products {
            catalog.upsert(p);
        }
        catalog
    }

    pub fn upsert(&self, product: ProductInfo) {
        let mut guard = match self.products.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(product.product_id.clone(), product);
    }

    pub fn len(&self) -> usize {
        self.products.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProductCatalog for InMemoryCatalog {
    fn get_product(&self, product_id: &ProductId) -> Option<ProductInfo> {
        self.products
            .read()
            .ok()
            .and_then(|g| g.get(product_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_seeded_product() {
        let catalog = InMemoryCatalog::with_products([ProductInfo::active(
            ProductId::from("P1"),
            "Amoxicillin 500mg",
            1250,
        )]);

        let info = catalog.get_product(&ProductId::from("P1")).unwrap();
        assert_eq!(info.name, "Amoxicillin 500mg");
        assert_eq!(info.price, 1250);
        assert!(info.can_be_sold());
        assert!(catalog.get_product(&ProductId::from("P2")).is_none());
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert(ProductInfo::active(ProductId::from("P1"), "A", 10));
        catalog.upsert(ProductInfo {
            status: ProductStatus::Archived,
            ..ProductInfo::active(ProductId::from("P1"), "A", 0)
        });

        let info = catalog.get_product(&ProductId::from("P1")).unwrap();
        assert!(!info.can_be_sold());
        assert!(!info.has_valid_price());
        assert_eq!(catalog.len(), 1);
    }
}
