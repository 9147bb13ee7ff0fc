//! Analytics event ingestion with at-least-once processing.
//!
//! Events enter through [`ingress`], are appended to a durable log
//! ([`queue`]), and are written to a [`store`] by [`processor`] loops that
//! commit a log offset only after the event at that offset is persisted.

pub mod api;
pub mod config;
pub mod event;
pub mod health;
pub mod ingress;
pub mod processor;
pub mod queue;
pub mod service;
pub mod store;
