//! EFS file systems and access points.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use canopy_core::{
    App, ConstructId, Grant, GrantTarget, PolicyRender, PolicySlot, RemovalPolicy, ResourceNode,
    EFS_DEFAULT_ENCRYPTION_AT_REST, EFS_DENY_ANONYMOUS_ACCESS,
};
use canopy_policy::{PolicyDocument, PolicyStatement, Principal};

use crate::error::{ConstructError, ConstructResult};
use crate::iam::Grantable;
use crate::kms::{Key, KeyRef};

pub const FILE_SYSTEM_TYPE: &str = "AWS::EFS::FileSystem";
pub const ACCESS_POINT_TYPE: &str = "AWS::EFS::AccessPoint";

pub const CLIENT_MOUNT: &str = "elasticfilesystem:ClientMount";
pub const CLIENT_WRITE: &str = "elasticfilesystem:ClientWrite";
pub const CLIENT_ROOT_ACCESS: &str = "elasticfilesystem:ClientRootAccess";

const MAX_ACCESS_POINT_PATH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PerformanceMode {
    #[default]
    GeneralPurpose,
    MaxIo,
}

impl PerformanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceMode::GeneralPurpose => "generalPurpose",
            PerformanceMode::MaxIo => "maxIO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThroughputMode {
    #[default]
    Bursting,
    Provisioned,
    Elastic,
}

impl ThroughputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThroughputMode::Bursting => "bursting",
            ThroughputMode::Provisioned => "provisioned",
            ThroughputMode::Elastic => "elastic",
        }
    }
}

/// Days without access before files move to infrequent access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePolicy {
    After1Day,
    After7Days,
    After14Days,
    After30Days,
    After60Days,
    After90Days,
    After180Days,
    After270Days,
    After365Days,
}

impl LifecyclePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePolicy::After1Day => "AFTER_1_DAY",
            LifecyclePolicy::After7Days => "AFTER_7_DAYS",
            LifecyclePolicy::After14Days => "AFTER_14_DAYS",
            LifecyclePolicy::After30Days => "AFTER_30_DAYS",
            LifecyclePolicy::After60Days => "AFTER_60_DAYS",
            LifecyclePolicy::After90Days => "AFTER_90_DAYS",
            LifecyclePolicy::After180Days => "AFTER_180_DAYS",
            LifecyclePolicy::After270Days => "AFTER_270_DAYS",
            LifecyclePolicy::After365Days => "AFTER_365_DAYS",
        }
    }
}

/// Properties for [`FileSystem::new`].
#[derive(Debug, Clone, Default)]
pub struct FileSystemProps {
    pub file_system_name: Option<String>,
    /// Defaults to the `@canopy/efs:default-encryption-at-rest` flag.
    pub encrypted: Option<bool>,
    pub kms_key: Option<Key>,
    pub performance_mode: Option<PerformanceMode>,
    pub throughput_mode: Option<ThroughputMode>,
    pub provisioned_throughput_mibps: Option<u32>,
    pub lifecycle_policy: Option<LifecyclePolicy>,
    /// Move files back to primary storage on first access.
    pub out_of_infrequent_access_on_access: bool,
    pub enable_automatic_backups: bool,
    pub file_system_policy: Option<PolicyDocument>,
    /// Defaults to the inverse of `@canopy/efs:deny-anonymous-access`.
    pub allow_anonymous_access: Option<bool>,
    pub removal_policy: Option<RemovalPolicy>,
}

fn check_modes(props: &FileSystemProps) -> Vec<String> {
    let mut errors = Vec::new();
    let throughput = props.throughput_mode.unwrap_or_default();
    match (throughput, props.provisioned_throughput_mibps) {
        (ThroughputMode::Provisioned, None) => errors.push(
            "provisioned throughput mode requires 'provisionedThroughputPerSecond'".to_string(),
        ),
        (ThroughputMode::Provisioned, Some(0)) => {
            errors.push("provisioned throughput must be at least 1 MiB/s".to_string())
        }
        (ThroughputMode::Provisioned, Some(_)) => {}
        (_, Some(_)) => errors.push(
            "'provisionedThroughputPerSecond' can only be set with provisioned throughput mode"
                .to_string(),
        ),
        (_, None) => {}
    }
    if props.performance_mode == Some(PerformanceMode::MaxIo) && throughput == ThroughputMode::Elastic {
        errors.push("max I/O performance mode is not supported with elastic throughput".to_string());
    }
    if props.encrypted == Some(false) && props.kms_key.is_some() {
        errors.push("a KMS key was given but encryption is disabled".to_string());
    }
    errors
}

/// An EFS file system.
#[derive(Debug, Clone)]
pub struct FileSystem {
    node: ConstructId,
    resource: ConstructId,
    id: String,
    arn: String,
    encrypted: bool,
}

impl FileSystem {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: FileSystemProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let errors = check_modes(&props);
        if !errors.is_empty() {
            return Err(ConstructError::invalid(app.path(node), errors.join("; ")));
        }

        let encrypted = match props.encrypted {
            Some(encrypted) => encrypted,
            None => props.kms_key.is_some() || app.feature_flag(node, EFS_DEFAULT_ENCRYPTION_AT_REST)?,
        };
        let allow_anonymous = match props.allow_anonymous_access {
            Some(allow) => allow,
            None => !app.feature_flag(node, EFS_DENY_ANONYMOUS_ACCESS)?,
        };

        let mut lifecycle = Vec::new();
        if let Some(policy) = props.lifecycle_policy {
            lifecycle.push(json!({ "transitionToIA": policy.as_str() }));
        }
        if props.out_of_infrequent_access_on_access {
            lifecycle.push(json!({ "transitionToPrimaryStorageClass": "AFTER_1_ACCESS" }));
        }

        let mut resource = ResourceNode::new(FILE_SYSTEM_TYPE)
            .with_property("encrypted", encrypted)
            .with_property("lifecyclePolicies", Value::Array(lifecycle))
            .with_policy(
                PolicySlot::Resource,
                PolicyRender::Property("fileSystemPolicy".to_string()),
                false,
            )
            .default_removal(RemovalPolicy::Retain);
        if let Some(key) = &props.kms_key {
            resource = resource.with_property("kmsKeyId", key.key_arn());
        }
        if let Some(mode) = props.performance_mode {
            resource = resource.with_property("performanceMode", mode.as_str());
        }
        if let Some(mode) = props.throughput_mode {
            resource = resource.with_property("throughputMode", mode.as_str());
        }
        if let Some(mibps) = props.provisioned_throughput_mibps {
            resource = resource.with_property("provisionedThroughputInMibps", mibps);
        }
        if props.enable_automatic_backups {
            resource = resource.with_property("backupPolicy", json!({ "status": "ENABLED" }));
        }
        if let Some(name) = &props.file_system_name {
            resource = resource.with_property(
                "fileSystemTags",
                json!([{ "key": "Name", "value": name }]),
            );
        }

        let resource = app.add_resource(node, "Resource", resource)?;
        if let Some(policy) = props.removal_policy {
            app.apply_removal_policy(resource, policy)?;
        }
        if let Some(document) = &props.file_system_policy {
            for statement in document.statements() {
                app.add_policy_statement(resource, PolicySlot::Resource, statement.clone())?;
            }
        }
        if !allow_anonymous {
            let statement = PolicyStatement::allow()
                .with_principal(Principal::Any)
                .with_actions([CLIENT_WRITE, CLIENT_ROOT_ACCESS])
                .with_condition(
                    "Bool",
                    "elasticfilesystem:AccessedViaMountTarget",
                    json!("true"),
                );
            app.add_policy_statement(resource, PolicySlot::Resource, statement)?;
        }

        debug!("FileSystem {} (encrypted: {})", app.path(node), encrypted);
        Ok(Self {
            node,
            resource,
            id: app.ref_token(resource),
            arn: app.get_att(resource, "Arn"),
            encrypted,
        })
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn resource(&self) -> ConstructId {
        self.resource
    }

    pub fn file_system_id(&self) -> &str {
        &self.id
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn add_to_resource_policy(&self, app: &mut App, statement: PolicyStatement) -> ConstructResult<bool> {
        Ok(app.add_policy_statement(self.resource, PolicySlot::Resource, statement)?)
    }

    pub fn grant(&self, app: &mut App, grantee: &dyn Grantable, actions: &[&str]) -> ConstructResult<Grant> {
        let target = GrantTarget::Owned {
            resource: self.resource,
            policy_holder: Some(self.resource),
            arns: vec![self.arn.clone()],
            policy_resources: vec![self.arn.clone()],
        };
        Ok(app.grant(&grantee.grantee(), &target, actions)?)
    }

    pub fn grant_read(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, &[CLIENT_MOUNT])
    }

    pub fn grant_read_write(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, &[CLIENT_MOUNT, CLIENT_WRITE])
    }

    pub fn grant_root_access(&self, app: &mut App, grantee: &dyn Grantable) -> ConstructResult<Grant> {
        self.grant(app, grantee, &[CLIENT_MOUNT, CLIENT_WRITE, CLIENT_ROOT_ACCESS])
    }

    pub fn add_access_point(&self, app: &mut App, id: &str, props: AccessPointProps) -> ConstructResult<AccessPoint> {
        AccessPoint::new(app, self.node, id, self, props)
    }
}

/// Ownership and permissions applied when the root directory is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub owner_uid: String,
    pub owner_gid: String,
    /// Octal, e.g. `755`.
    pub permissions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixUser {
    pub uid: String,
    pub gid: String,
    #[serde(default)]
    pub secondary_gids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AccessPointProps {
    pub path: Option<String>,
    pub create_acl: Option<Acl>,
    pub posix_user: Option<PosixUser>,
}

fn permissions_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-7]{3,4}$").expect("valid permissions regex"))
}

fn check_access_point(props: &AccessPointProps) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(path) = &props.path {
        if !path.starts_with('/') {
            errors.push(format!("access point path '{}' must start with '/'", path));
        }
        if path.len() > MAX_ACCESS_POINT_PATH {
            errors.push(format!(
                "access point path must be at most {} characters",
                MAX_ACCESS_POINT_PATH
            ));
        }
    }
    if let Some(acl) = &props.create_acl {
        if !permissions_pattern().is_match(&acl.permissions) {
            errors.push(format!(
                "permissions '{}' must be 3 or 4 octal digits",
                acl.permissions
            ));
        }
    }
    errors
}

/// An application entry point into a file system.
#[derive(Debug, Clone)]
pub struct AccessPoint {
    node: ConstructId,
    resource: ConstructId,
    id: String,
    arn: String,
}

impl AccessPoint {
    pub fn new(
        app: &mut App,
        scope: ConstructId,
        id: &str,
        file_system: &FileSystem,
        props: AccessPointProps,
    ) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let errors = check_access_point(&props);
        if !errors.is_empty() {
            return Err(ConstructError::invalid(app.path(node), errors.join("; ")));
        }

        let mut root_directory = serde_json::Map::new();
        if let Some(path) = &props.path {
            root_directory.insert("path".to_string(), json!(path));
        }
        if let Some(acl) = &props.create_acl {
            root_directory.insert(
                "creationInfo".to_string(),
                json!({
                    "ownerUid": acl.owner_uid,
                    "ownerGid": acl.owner_gid,
                    "permissions": acl.permissions,
                }),
            );
        }
        let mut resource = ResourceNode::new(ACCESS_POINT_TYPE)
            .with_property("fileSystemId", file_system.file_system_id())
            .with_property("rootDirectory", Value::Object(root_directory));
        if let Some(user) = &props.posix_user {
            resource = resource.with_property(
                "posixUser",
                json!({
                    "uid": user.uid,
                    "gid": user.gid,
                    "secondaryGids": user.secondary_gids,
                }),
            );
        }
        let resource = app.add_resource(node, "Resource", resource)?;
        Ok(Self {
            node,
            resource,
            id: app.ref_token(resource),
            arn: app.get_att(resource, "Arn"),
        })
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn resource(&self) -> ConstructId {
        self.resource
    }

    pub fn access_point_id(&self) -> &str {
        &self.id
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }
}
