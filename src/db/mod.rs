//! Access to the relational store.
//!
//! The selector only ever talks to the store through the [`store::SelectorStore`]
//! and [`store::SelectorTx`] traits. [`postgres::PgSelectorStore`] is the
//! production implementation.

pub mod models;
pub mod postgres;
pub mod store;

pub use postgres::PgSelectorStore;
pub use store::{SelectorStore, SelectorTx, StoreError};
