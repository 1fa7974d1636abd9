//! The KMS key construct.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use canopy_core::{
    contains_token, App, ConstructId, ContextQuery, GrantMode, GrantTarget, PolicyRender,
    PolicySlot, RemovalPolicy, ResourceNode, TagFormat,
};
use canopy_policy::{PolicyDocument, PolicyStatement, Principal};

use super::alias::Alias;
use super::{KeyRef, ADMIN_ACTIONS};
use crate::error::{ConstructError, ConstructResult};

pub const KEY_TYPE: &str = "AWS::KMS::Key";

/// Context provider used by [`Key::from_lookup`].
pub const KEY_PROVIDER: &str = "key-provider";

/// Key id returned by a lookup that missed the cache.
pub const DUMMY_KEY_ID: &str = "1234abcd-12ab-34cd-56ef-1234567890ab";

const MIN_PENDING_WINDOW_DAYS: u32 = 7;
const MAX_PENDING_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeySpec {
    #[default]
    #[serde(rename = "SYMMETRIC_DEFAULT")]
    SymmetricDefault,
    #[serde(rename = "RSA_2048")]
    Rsa2048,
    #[serde(rename = "RSA_3072")]
    Rsa3072,
    #[serde(rename = "RSA_4096")]
    Rsa4096,
    #[serde(rename = "ECC_NIST_P256")]
    EccNistP256,
    #[serde(rename = "ECC_NIST_P384")]
    EccNistP384,
    #[serde(rename = "ECC_NIST_P521")]
    EccNistP521,
    #[serde(rename = "ECC_SECG_P256K1")]
    EccSecgP256k1,
    #[serde(rename = "HMAC_224")]
    Hmac224,
    #[serde(rename = "HMAC_256")]
    Hmac256,
    #[serde(rename = "HMAC_384")]
    Hmac384,
    #[serde(rename = "HMAC_512")]
    Hmac512,
    #[serde(rename = "SM2")]
    Sm2,
}

impl KeySpec {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySpec::SymmetricDefault => "SYMMETRIC_DEFAULT",
            KeySpec::Rsa2048 => "RSA_2048",
            KeySpec::Rsa3072 => "RSA_3072",
            KeySpec::Rsa4096 => "RSA_4096",
            KeySpec::EccNistP256 => "ECC_NIST_P256",
            KeySpec::EccNistP384 => "ECC_NIST_P384",
            KeySpec::EccNistP521 => "ECC_NIST_P521",
            KeySpec::EccSecgP256k1 => "ECC_SECG_P256K1",
            KeySpec::Hmac224 => "HMAC_224",
            KeySpec::Hmac256 => "HMAC_256",
            KeySpec::Hmac384 => "HMAC_384",
            KeySpec::Hmac512 => "HMAC_512",
            KeySpec::Sm2 => "SM2",
        }
    }

    /// Usages this spec can be created with.
    pub fn allowed_usages(&self) -> &'static [KeyUsage] {
        match self {
            KeySpec::SymmetricDefault => &[KeyUsage::EncryptDecrypt],
            KeySpec::Rsa2048 | KeySpec::Rsa3072 | KeySpec::Rsa4096 => {
                &[KeyUsage::EncryptDecrypt, KeyUsage::SignVerify]
            }
            KeySpec::EccNistP256 | KeySpec::EccNistP384 | KeySpec::EccNistP521 => {
                &[KeyUsage::SignVerify, KeyUsage::KeyAgreement]
            }
            KeySpec::EccSecgP256k1 => &[KeyUsage::SignVerify],
            KeySpec::Hmac224 | KeySpec::Hmac256 | KeySpec::Hmac384 | KeySpec::Hmac512 => {
                &[KeyUsage::GenerateVerifyMac]
            }
            KeySpec::Sm2 => &[
                KeyUsage::EncryptDecrypt,
                KeyUsage::SignVerify,
                KeyUsage::KeyAgreement,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsage {
    #[default]
    EncryptDecrypt,
    SignVerify,
    GenerateVerifyMac,
    KeyAgreement,
}

impl KeyUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyUsage::EncryptDecrypt => "ENCRYPT_DECRYPT",
            KeyUsage::SignVerify => "SIGN_VERIFY",
            KeyUsage::GenerateVerifyMac => "GENERATE_VERIFY_MAC",
            KeyUsage::KeyAgreement => "KEY_AGREEMENT",
        }
    }
}

/// Properties for [`Key::new`].
#[derive(Debug, Clone, Default)]
pub struct KeyProps {
    pub description: Option<String>,
    /// Create a bound alias with this name.
    pub alias: Option<String>,
    pub enabled: Option<bool>,
    pub enable_key_rotation: Option<bool>,
    pub key_spec: Option<KeySpec>,
    pub key_usage: Option<KeyUsage>,
    pub pending_window_days: Option<u32>,
    /// Replaces the default key policy when set.
    pub policy: Option<PolicyDocument>,
    /// Principals given administrative actions on the key.
    pub admins: Vec<Principal>,
    pub removal_policy: Option<RemovalPolicy>,
}

fn check_props(props: &KeyProps) -> Result<(), String> {
    let spec = props.key_spec.unwrap_or_default();
    let usage = props.key_usage.unwrap_or_default();
    if !spec.allowed_usages().contains(&usage) {
        return Err(format!(
            "key spec '{}' is not valid with key usage '{}'",
            spec.as_str(),
            usage.as_str()
        ));
    }
    if props.enable_key_rotation == Some(true) && spec != KeySpec::SymmetricDefault {
        return Err(format!(
            "key rotation can only be enabled on symmetric keys, not '{}'",
            spec.as_str()
        ));
    }
    Ok(())
}

fn pending_window_errors(days: u32) -> Vec<String> {
    if (MIN_PENDING_WINDOW_DAYS..=MAX_PENDING_WINDOW_DAYS).contains(&days) {
        Vec::new()
    } else {
        vec![format!(
            "pending window must be between {} and {} days, got {}",
            MIN_PENDING_WINDOW_DAYS, MAX_PENDING_WINDOW_DAYS, days
        )]
    }
}

/// A KMS key defined in this app, or imported by arn or lookup.
#[derive(Debug, Clone)]
pub struct Key {
    node: ConstructId,
    resource: Option<ConstructId>,
    arn: String,
    key_id: String,
}

impl Key {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: KeyProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        check_props(&props).map_err(|msg| ConstructError::invalid(app.path(node), msg))?;

        let mut resource = ResourceNode::new(KEY_TYPE)
            .with_policy(
                PolicySlot::Resource,
                PolicyRender::Property("keyPolicy".to_string()),
                true,
            )
            .default_removal(RemovalPolicy::Retain)
            .taggable(TagFormat::Standard);
        if let Some(description) = &props.description {
            resource = resource.with_property("description", description.clone());
        }
        if let Some(enabled) = props.enabled {
            resource = resource.with_property("enabled", enabled);
        }
        if let Some(rotation) = props.enable_key_rotation {
            resource = resource.with_property("enableKeyRotation", rotation);
        }
        if let Some(spec) = props.key_spec {
            resource = resource.with_property("keySpec", spec.as_str());
        }
        if let Some(usage) = props.key_usage {
            resource = resource.with_property("keyUsage", usage.as_str());
        }
        if let Some(days) = props.pending_window_days {
            resource = resource.with_property("pendingWindowInDays", days);
            app.add_validation(node, move |_, _| pending_window_errors(days))?;
        }

        let resource = app.add_resource(node, "Resource", resource)?;
        if let Some(policy) = props.removal_policy {
            app.apply_removal_policy(resource, policy)?;
        }

        match &props.policy {
            Some(document) => {
                for statement in document.statements() {
                    app.add_policy_statement(resource, PolicySlot::Resource, statement.clone())?;
                }
            }
            None => {
                let mode = app.stack(app.stack_of(node)?)?.grant_mode();
                let actions: Vec<&str> = match mode {
                    GrantMode::IdentityFirst => vec!["kms:*"],
                    GrantMode::StrictResource => ADMIN_ACTIONS.to_vec(),
                };
                let account = app.account(node)?;
                let statement = PolicyStatement::allow()
                    .with_actions(actions)
                    .with_principal(Principal::account_root(account))
                    .with_resources(["*"]);
                app.add_policy_statement(resource, PolicySlot::Resource, statement)?;
            }
        }
        for admin in &props.admins {
            let statement = PolicyStatement::allow()
                .with_actions(ADMIN_ACTIONS.iter().copied())
                .with_principal(admin.clone())
                .with_resources(["*"]);
            app.add_policy_statement(resource, PolicySlot::Resource, statement)?;
        }

        let key = Self {
            node,
            resource: Some(resource),
            arn: app.get_att(resource, "Arn"),
            key_id: app.ref_token(resource),
        };
        if let Some(alias) = &props.alias {
            key.add_alias(app, alias)?;
        }
        debug!("Key {}", app.path(node));
        Ok(key)
    }

    /// Reference an existing key by arn. Its key policy cannot be edited.
    pub fn from_key_arn(app: &mut App, scope: ConstructId, id: &str, arn: &str) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let key_id = if contains_token(arn) {
            arn.to_string()
        } else {
            arn.split_once(":key/")
                .map(|(_, id)| id.to_string())
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    ConstructError::invalid(
                        app.path(node),
                        format!("'{}' is not a key arn (expected '...:key/<id>')", arn),
                    )
                })?
        };
        Ok(Self {
            node,
            resource: None,
            arn: arn.to_string(),
            key_id,
        })
    }

    /// Find an existing key by alias name through the context cache. A miss
    /// yields a placeholder key id and fails synthesis later.
    pub fn from_lookup(app: &mut App, scope: ConstructId, id: &str, alias_name: &str) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let query = ContextQuery::new(KEY_PROVIDER).with_prop("aliasName", alias_name);
        let value = app.lookup_context(node, query, json!({ "keyId": DUMMY_KEY_ID }))?;
        let key_id = value
            .get("keyId")
            .and_then(Value::as_str)
            .unwrap_or(DUMMY_KEY_ID)
            .to_string();
        let arn = app.format_arn(node, "kms", None, None, &format!("key/{}", key_id))?;
        Ok(Self {
            node,
            resource: None,
            arn,
            key_id,
        })
    }

    pub fn resource(&self) -> Option<ConstructId> {
        self.resource
    }

    pub fn is_imported(&self) -> bool {
        self.resource.is_none()
    }

    /// Create an alias bound to this key.
    pub fn add_alias(&self, app: &mut App, alias_name: &str) -> ConstructResult<Alias> {
        let name = if alias_name.starts_with("alias/") || contains_token(alias_name) {
            alias_name.to_string()
        } else {
            format!("alias/{}", alias_name)
        };
        let id = format!("Alias{}", name.trim_start_matches("alias/"));
        Alias::new(app, self.node, &id, &name, self)
    }
}

impl KeyRef for Key {
    fn node(&self) -> ConstructId {
        self.node
    }

    fn key_arn(&self) -> &str {
        &self.arn
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn grant_target(&self) -> GrantTarget {
        match self.resource {
            Some(resource) => GrantTarget::Owned {
                resource,
                policy_holder: Some(resource),
                arns: vec![self.arn.clone()],
                policy_resources: vec!["*".to_string()],
            },
            None => GrantTarget::Imported {
                scope: self.node,
                arns: vec![self.arn.clone()],
            },
        }
    }

    fn add_to_resource_policy(
        &self,
        app: &mut App,
        statement: PolicyStatement,
    ) -> ConstructResult<bool> {
        match self.resource {
            Some(resource) => Ok(app.add_policy_statement(resource, PolicySlot::Resource, statement)?),
            None => Ok(false),
        }
    }
}
