//! Entity trait: identity that survives state changes.

/// Something with a stable identity (a lot, a delivery, ...).
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
