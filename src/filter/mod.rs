//! Domain classification.
//!
//! Names are matched against four lists (circumvention, escape, block,
//! redirect) by testing the name and each of its parent domains.

mod classifier;
mod domains;
pub mod loader;

pub use classifier::{Classification, Classifier, DomainLists};
pub use domains::{DomainSet, Suffixes, suffixes};
