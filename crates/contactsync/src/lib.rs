//! Bidirectional synchronization of a local address book with a remote
//! Atom contacts service.
//!
//! The [`service::SyncService`] runs passes over configured scopes. Each pass
//! goes through the [`reconcile`] engine, which talks to the remote side via
//! the [`client::RequestEngine`], paced by the [`throttle`] controller and
//! authorized by the [`auth`] session manager.

pub mod atom;
pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod request;
pub mod scope;
pub mod secret;
pub mod service;
pub mod session;
pub mod state;
pub mod storage;
pub mod summary;
pub mod throttle;

pub use config::{Endpoints, OAuthClientConfig, SyncSettings, ThrottleConfig};
pub use error::{SyncError, SyncResult};
pub use model::{ContactRecord, GroupRecord, RemoteId, SystemGroup, Timestamp};
pub use scope::{ScopeFilter, ScopePolicy, ScopeState, SyncScope};
pub use secret::Secret;
pub use service::{ServiceStores, SessionReport, SyncService};
pub use summary::{ScopeSummary, SyncSummaryData};
