//! # canopy_policy
//!
//! Policy document model for canopy.
//!
//! This crate provides:
//! - **Principals**: account roots, services, federated providers, roles,
//!   users and conditionally wrapped principals
//! - **Statements**: allow/deny statements with actions, resources and conditions
//! - **Documents**: ordered statements with minimization and validation
//!
//! Values are plain strings. Deploy-time values are carried as encoded token
//! strings and resolved later by `canopy_core`, so two statements that
//! reference the same token compare equal.
//!
//! ## Example
//!
//! ```rust
//! use canopy_policy::{PolicyDocument, PolicyStatement, Principal};
//!
//! let mut doc = PolicyDocument::new();
//! doc.add_statement(
//!     PolicyStatement::allow()
//!         .with_actions(["kms:Decrypt"])
//!         .with_principal(Principal::account_root("111111111111"))
//!         .with_resources(["*"]),
//! );
//! doc.add_statement(
//!     PolicyStatement::allow()
//!         .with_actions(["kms:Encrypt"])
//!         .with_principal(Principal::account_root("111111111111"))
//!         .with_resources(["*"]),
//! );
//!
//! // Both statements share a scope and render as one.
//! assert_eq!(doc.minimized().len(), 1);
//! ```

pub mod condition;
pub mod document;
pub mod error;
pub mod principal;
pub mod statement;

pub use condition::Conditions;
pub use document::{PolicyDocument, PolicyValidation, POLICY_VERSION};
pub use error::{PolicyError, PolicyResult};
pub use principal::{account_root_arn, arn_account, Principal, PrincipalFragment, DEFAULT_PARTITION};
pub use statement::{Effect, PolicyStatement};
