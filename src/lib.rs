//! ACME certificate lifecycle engine and dynamic SNI certificate store.
//!
//! Obtains, renews, and hot-swaps X.509 server certificates from an ACME
//! certificate authority, and exposes a live, mutable certificate store
//! (the [`store::DynamicCertStore`]) that a `rustls`-based TLS server
//! consults on every handshake to select a certificate by SNI hostname.
//!
//! The [`controller::Controller`] is the crate's single entry point:
//! `start`/`start_with`/`reconfigure`/`check` drive the
//! [`reconciler::ConfigReconciler`]'s two-phase reconcile of a declarative
//! [`config::Config`] against the running [`store::DynamicCertStore`].

pub mod account;
pub mod certificate;
pub mod challenge;
pub mod config;
pub mod controller;
pub mod error;
pub mod keys;
pub mod persistence;
pub mod reconciler;
pub mod retry;
pub mod session;
pub mod store;

pub use config::{Account, Certificate, Config, RenewalTime};
pub use controller::Controller;
pub use error::{Error, Result};
pub use persistence::Persistence;
pub use store::{CertEntry, DynamicCertStore};
