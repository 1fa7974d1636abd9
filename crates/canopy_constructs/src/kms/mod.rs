//! KMS keys and aliases.
//!
//! Both implement [`KeyRef`], so code that needs "something that encrypts"
//! can take either. Grants on a bound alias land on its key; grants on an
//! alias imported by name are accepted as no-ops with a warning.

pub mod alias;
pub mod key;

pub use alias::{validate_alias_name, Alias, ALIAS_TYPE};
pub use key::{Key, KeyProps, KeySpec, KeyUsage, DUMMY_KEY_ID, KEY_PROVIDER, KEY_TYPE};

use canopy_core::{App, ConstructId, Grant, GrantTarget};
use canopy_policy::PolicyStatement;

use crate::error::ConstructResult;
use crate::iam::Grantable;

pub const ENCRYPT_ACTIONS: &[&str] = &["kms:Encrypt", "kms:ReEncrypt*", "kms:GenerateDataKey*"];
pub const DECRYPT_ACTIONS: &[&str] = &["kms:Decrypt"];
pub const ADMIN_ACTIONS: &[&str] = &[
    "kms:Create*",
    "kms:Describe*",
    "kms:Enable*",
    "kms:List*",
    "kms:Put*",
    "kms:Update*",
    "kms:Revoke*",
    "kms:Disable*",
    "kms:Get*",
    "kms:Delete*",
    "kms:TagResource",
    "kms:UntagResource",
    "kms:ScheduleKeyDeletion",
    "kms:CancelKeyDeletion",
];

/// A key, or something that stands in for one.
pub trait KeyRef {
    fn node(&self) -> ConstructId;

    fn key_arn(&self) -> &str;

    fn key_id(&self) -> &str;

    /// Where grants on this key are applied.
    fn grant_target(&self) -> GrantTarget;

    fn is_alias(&self) -> bool {
        false
    }

    /// Append a statement to the key policy. Returns whether anything changed.
    fn add_to_resource_policy(
        &self,
        app: &mut App,
        statement: PolicyStatement,
    ) -> ConstructResult<bool>;

    fn grant(&self, app: &mut App, grantee: &dyn Grantable, actions: &[&str]) -> ConstructResult<Grant> {
        Ok(app.grant(&grantee.grantee(), &self.grant_target(), actions)?)
    }

    fn grant_decrypt(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, DECRYPT_ACTIONS)
    }

    fn grant_encrypt(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, ENCRYPT_ACTIONS)
    }

    fn grant_encrypt_decrypt(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        let actions: Vec<&str> = DECRYPT_ACTIONS.iter().chain(ENCRYPT_ACTIONS).copied().collect();
        self.grant(app, grantee, &actions)
    }

    fn grant_admin(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, ADMIN_ACTIONS)
    }
}
