//! # canopy_constructs
//!
//! Resource constructs built on [`canopy_core`].
//!
//! ## Modules
//!
//! - [`kms`]: keys and aliases with grant helpers
//! - [`iam`]: roles, the grantee side of every grant
//! - [`sqs`]: queues and queue policies
//! - [`events`]: rules, buses, schedules and targets, including
//!   cross-account and cross-region routing
//! - [`efs`]: file systems and access points
//! - [`custom_resource`]: custom resources, providers and the provider runtime
//! - [`manifest`]: building an app from a YAML or JSON manifest
//!
//! ## Example
//!
//! ```rust,no_run
//! use canopy_constructs::kms::{Key, KeyProps, KeyRef};
//! use canopy_constructs::iam::{Role, RoleProps};
//! use canopy_core::{synthesize, App, StackProps};
//! use canopy_policy::Principal;
//!
//! let mut app = App::new();
//! let root = app.root();
//! let stack = app.add_stack(root, "Data", StackProps::default()).unwrap();
//! let key = Key::new(&mut app, stack, "Key", KeyProps::default()).unwrap();
//! let role = Role::new(
//!     &mut app,
//!     stack,
//!     "Reader",
//!     RoleProps::new(Principal::service("lambda.amazonaws.com")),
//! )
//! .unwrap();
//! key.grant_decrypt(&mut app, &role).unwrap();
//! let assembly = synthesize(&mut app).unwrap();
//! ```

pub mod custom_resource;
pub mod efs;
pub mod error;
pub mod events;
pub mod iam;
pub mod kms;
pub mod manifest;
pub mod sqs;

pub use error::{ConstructError, ConstructResult};
pub use iam::{Grantable, Role, RoleProps};
pub use kms::{Alias, Key, KeyProps, KeyRef};
pub use manifest::{AppManifest, Built, ConstructRegistry};
pub use sqs::{Queue, QueueProps};

// Re-export for convenience
pub use canopy_core::{App, CoreError, ErrorKind};
