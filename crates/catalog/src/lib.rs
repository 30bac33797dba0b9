//! `pharmaflow-catalog`: the product catalog as seen from order confirmation.
//!
//! The catalog is owned by another service. All this workspace needs from it
//! is `GetProduct(productId) -> {name, price} | NotFound`.

pub mod product;

pub use product::{InMemoryCatalog, ProductCatalog, ProductInfo, ProductStatus};
