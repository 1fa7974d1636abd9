//! App manifests: a declarative description of stacks and constructs.
//!
//! The CLI synthesizes a YAML (or JSON) manifest:
//!
//! ```yaml
//! stacks:
//!   - id: Producer
//!     env: { account: "111111111111", region: us-east-1 }
//!     constructs:
//!       - type: kms.Key
//!         id: DataKey
//!         props: { alias: alias/data, pending_window_days: 7 }
//!   - id: Consumer
//!     constructs:
//!       - type: iam.Role
//!         id: Worker
//!         props: { assumed_by: { type: service, service: lambda.amazonaws.com } }
//! grants:
//!   - grantee: Consumer/Worker
//!     target: Producer/DataKey
//!     grant: decrypt
//! ```
//!
//! Construct references are `Stack/Id` (or `Stack/Nested/Id`); a bare `Id`
//! refers to the declaring stack. Constructs can only reference constructs
//! declared before them.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use canopy_core::{App, ConstructId, Grant, NestedStackProps, RemovalPolicy, StackProps};
use canopy_policy::Principal;

use crate::custom_resource::{CustomResource, CustomResourceProps, Provider, ProviderProps};
use crate::efs::{
    AccessPointProps, Acl, FileSystem, FileSystemProps, LifecyclePolicy, PerformanceMode,
    PosixUser, ThroughputMode,
};
use crate::error::{ConstructError, ConstructResult};
use crate::events::{
    EventBus, EventBusProps, EventBusTarget, EventPattern, Rule, RuleProps, RuleTargetInput,
    Schedule, SqsQueue,
};
use crate::iam::{Grantable, Role, RoleProps};
use crate::kms::{Alias, Key, KeyProps, KeyRef, KeySpec, KeyUsage};
use crate::sqs::{DeadLetterQueue, Queue, QueueProps};

/// Top-level manifest document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppManifest {
    pub stacks: Vec<StackSpec>,
    pub grants: Vec<GrantSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackSpec {
    pub id: String,
    #[serde(flatten)]
    pub props: StackProps,
    #[serde(default)]
    pub constructs: Vec<ConstructSpec>,
    #[serde(default)]
    pub nested: Vec<NestedStackSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NestedStackSpec {
    pub id: String,
    #[serde(flatten)]
    pub props: NestedStackProps,
    #[serde(default)]
    pub constructs: Vec<ConstructSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstructSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub props: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrantSpec {
    pub grantee: String,
    pub target: String,
    /// A named grant such as `decrypt` or `send`.
    #[serde(default)]
    pub grant: Option<String>,
    /// Explicit actions, used when no named grant is given.
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RoleDef {
    assumed_by: Option<Principal>,
    role_name: Option<String>,
    description: Option<String>,
    path: Option<String>,
    managed_policy_arns: Vec<String>,
    max_session_duration_secs: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeyDef {
    description: Option<String>,
    alias: Option<String>,
    enabled: Option<bool>,
    enable_key_rotation: Option<bool>,
    key_spec: Option<KeySpec>,
    key_usage: Option<KeyUsage>,
    pending_window_days: Option<u32>,
    admins: Vec<Principal>,
    removal_policy: Option<RemovalPolicy>,
}

#[derive(Debug, Deserialize)]
struct KeyLookupDef {
    alias_name: String,
}

#[derive(Debug, Deserialize)]
struct AliasDef {
    alias_name: String,
    /// Key to alias; the alias is imported by name when absent.
    #[serde(default)]
    target_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeadLetterDef {
    queue: String,
    max_receive_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueueDef {
    queue_name: Option<String>,
    fifo: Option<bool>,
    content_based_deduplication: Option<bool>,
    visibility_timeout_secs: Option<u32>,
    retention_period_secs: Option<u32>,
    delivery_delay_secs: Option<u32>,
    encryption_key: Option<String>,
    dead_letter_queue: Option<DeadLetterDef>,
    removal_policy: Option<RemovalPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventBusDef {
    event_bus_name: Option<String>,
    event_source_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TargetDef {
    Queue {
        queue: String,
        #[serde(default)]
        message_group_id: Option<String>,
        #[serde(default)]
        input: Option<Value>,
    },
    EventBus {
        bus: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleDef {
    rule_name: Option<String>,
    description: Option<String>,
    enabled: Option<bool>,
    event_pattern: Option<EventPattern>,
    schedule: Option<String>,
    event_bus: Option<String>,
    targets: Vec<TargetDef>,
}

#[derive(Debug, Deserialize)]
struct AccessPointDef {
    id: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    create_acl: Option<Acl>,
    #[serde(default)]
    posix_user: Option<PosixUser>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSystemDef {
    file_system_name: Option<String>,
    encrypted: Option<bool>,
    kms_key: Option<String>,
    performance_mode: Option<PerformanceMode>,
    throughput_mode: Option<ThroughputMode>,
    provisioned_throughput_mibps: Option<u32>,
    lifecycle_policy: Option<LifecyclePolicy>,
    out_of_infrequent_access_on_access: bool,
    enable_automatic_backups: bool,
    allow_anonymous_access: Option<bool>,
    removal_policy: Option<RemovalPolicy>,
    access_points: Vec<AccessPointDef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderDef {
    on_event_handler_arn: String,
    is_complete_handler_arn: Option<String>,
    query_interval_secs: Option<u64>,
    total_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CustomResourceDef {
    service_token: Option<String>,
    provider: Option<String>,
    resource_type: Option<String>,
    properties: Map<String, Value>,
    removal_policy: Option<RemovalPolicy>,
}

/// A construct built from a manifest.
#[derive(Debug, Clone)]
pub enum Built {
    Role(Role),
    Key(Key),
    Alias(Alias),
    Queue(Queue),
    EventBus(EventBus),
    Rule(Rule),
    FileSystem(FileSystem),
    Provider(Provider),
    CustomResource(CustomResource),
}

impl Built {
    pub fn kind(&self) -> &'static str {
        match self {
            Built::Role(_) => "iam.Role",
            Built::Key(_) => "kms.Key",
            Built::Alias(_) => "kms.Alias",
            Built::Queue(_) => "sqs.Queue",
            Built::EventBus(_) => "events.EventBus",
            Built::Rule(_) => "events.Rule",
            Built::FileSystem(_) => "efs.FileSystem",
            Built::Provider(_) => "custom.Provider",
            Built::CustomResource(_) => "custom.Resource",
        }
    }
}

/// Constructs built from a manifest, keyed by `Stack/Id`.
#[derive(Debug, Default)]
pub struct ConstructRegistry {
    stacks: BTreeMap<String, ConstructId>,
    entries: BTreeMap<String, Built>,
}

impl ConstructRegistry {
    pub fn get(&self, key: &str) -> Option<&Built> {
        self.entries.get(key)
    }

    pub fn stack(&self, key: &str) -> Option<ConstructId> {
        self.stacks.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn resolve(&self, reference: &str, stack_key: &str) -> ConstructResult<&Built> {
        let key = if reference.contains('/') {
            reference.to_string()
        } else {
            format!("{}/{}", stack_key, reference)
        };
        self.entries.get(&key).ok_or_else(|| {
            ConstructError::Manifest(format!(
                "'{}' does not name a construct declared earlier",
                key
            ))
        })
    }

    fn role(&self, reference: &str, stack_key: &str) -> ConstructResult<&Role> {
        match self.resolve(reference, stack_key)? {
            Built::Role(role) => Ok(role),
            other => Err(mismatch(reference, "iam.Role", other)),
        }
    }

    fn key(&self, reference: &str, stack_key: &str) -> ConstructResult<&Key> {
        match self.resolve(reference, stack_key)? {
            Built::Key(key) => Ok(key),
            other => Err(mismatch(reference, "kms.Key", other)),
        }
    }

    fn queue(&self, reference: &str, stack_key: &str) -> ConstructResult<&Queue> {
        match self.resolve(reference, stack_key)? {
            Built::Queue(queue) => Ok(queue),
            other => Err(mismatch(reference, "sqs.Queue", other)),
        }
    }

    fn bus(&self, reference: &str, stack_key: &str) -> ConstructResult<&EventBus> {
        match self.resolve(reference, stack_key)? {
            Built::EventBus(bus) => Ok(bus),
            other => Err(mismatch(reference, "events.EventBus", other)),
        }
    }

    fn provider(&self, reference: &str, stack_key: &str) -> ConstructResult<&Provider> {
        match self.resolve(reference, stack_key)? {
            Built::Provider(provider) => Ok(provider),
            other => Err(mismatch(reference, "custom.Provider", other)),
        }
    }
}

fn mismatch(reference: &str, expected: &str, found: &Built) -> ConstructError {
    ConstructError::Manifest(format!(
        "'{}' is a {}, expected a {}",
        reference,
        found.kind(),
        expected
    ))
}

fn decode<T: DeserializeOwned + Default>(key: &str, props: &Value) -> ConstructResult<T> {
    if props.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(props.clone())
        .map_err(|e| ConstructError::Manifest(format!("{}: invalid props: {}", key, e)))
}

fn decode_required<T: DeserializeOwned>(key: &str, props: &Value) -> ConstructResult<T> {
    serde_json::from_value(props.clone())
        .map_err(|e| ConstructError::Manifest(format!("{}: invalid props: {}", key, e)))
}

impl AppManifest {
    pub fn from_yaml(content: &str) -> ConstructResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> ConstructResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Add every stack, construct and grant to `app`.
    pub fn build(&self, app: &mut App) -> ConstructResult<ConstructRegistry> {
        let mut registry = ConstructRegistry::default();
        let root = app.root();
        for stack_spec in &self.stacks {
            let stack = app.add_stack(root, &stack_spec.id, stack_spec.props.clone())?;
            registry.stacks.insert(stack_spec.id.clone(), stack);
            for spec in &stack_spec.constructs {
                build_construct(app, &mut registry, stack, &stack_spec.id, spec)?;
            }
            for nested_spec in &stack_spec.nested {
                let nested = app.add_nested_stack(stack, &nested_spec.id, nested_spec.props.clone())?;
                let nested_key = format!("{}/{}", stack_spec.id, nested_spec.id);
                registry.stacks.insert(nested_key.clone(), nested);
                for spec in &nested_spec.constructs {
                    build_construct(app, &mut registry, nested, &nested_key, spec)?;
                }
            }
        }
        for grant in &self.grants {
            apply_grant(app, &registry, grant)?;
        }
        info!(
            "Built {} stack(s) and {} construct(s) from manifest",
            registry.stacks.len(),
            registry.len()
        );
        Ok(registry)
    }
}

fn build_construct(
    app: &mut App,
    registry: &mut ConstructRegistry,
    stack: ConstructId,
    stack_key: &str,
    spec: &ConstructSpec,
) -> ConstructResult<()> {
    let key = format!("{}/{}", stack_key, spec.id);
    if registry.entries.contains_key(&key) {
        return Err(ConstructError::Manifest(format!("'{}' is declared twice", key)));
    }
    debug!("Building {} ({})", key, spec.kind);
    let built = match spec.kind.as_str() {
        "iam.Role" => {
            let def: RoleDef = decode(&key, &spec.props)?;
            let assumed_by = def.assumed_by.ok_or_else(|| {
                ConstructError::Manifest(format!("{}: 'assumed_by' is required", key))
            })?;
            let mut props = RoleProps::new(assumed_by);
            props.role_name = def.role_name;
            props.description = def.description;
            props.path = def.path;
            props.managed_policy_arns = def.managed_policy_arns;
            props.max_session_duration_secs = def.max_session_duration_secs;
            Built::Role(Role::new(app, stack, &spec.id, props)?)
        }
        "kms.Key" => {
            let def: KeyDef = decode(&key, &spec.props)?;
            let props = KeyProps {
                description: def.description,
                alias: def.alias,
                enabled: def.enabled,
                enable_key_rotation: def.enable_key_rotation,
                key_spec: def.key_spec,
                key_usage: def.key_usage,
                pending_window_days: def.pending_window_days,
                policy: None,
                admins: def.admins,
                removal_policy: def.removal_policy,
            };
            Built::Key(Key::new(app, stack, &spec.id, props)?)
        }
        "kms.KeyLookup" => {
            let def: KeyLookupDef = decode_required(&key, &spec.props)?;
            Built::Key(Key::from_lookup(app, stack, &spec.id, &def.alias_name)?)
        }
        "kms.Alias" => {
            let def: AliasDef = decode_required(&key, &spec.props)?;
            let alias = match &def.target_key {
                Some(target) => {
                    let target = registry.key(target, stack_key)?.clone();
                    Alias::new(app, stack, &spec.id, &def.alias_name, &target)?
                }
                None => Alias::from_alias_name(app, stack, &spec.id, &def.alias_name)?,
            };
            Built::Alias(alias)
        }
        "sqs.Queue" => {
            let def: QueueDef = decode(&key, &spec.props)?;
            let encryption_key = match &def.encryption_key {
                Some(reference) => Some(registry.key(reference, stack_key)?.clone()),
                None => None,
            };
            let dead_letter_queue = match &def.dead_letter_queue {
                Some(dlq) => Some(DeadLetterQueue {
                    queue: registry.queue(&dlq.queue, stack_key)?.clone(),
                    max_receive_count: dlq.max_receive_count,
                }),
                None => None,
            };
            let props = QueueProps {
                queue_name: def.queue_name,
                fifo: def.fifo,
                content_based_deduplication: def.content_based_deduplication,
                visibility_timeout_secs: def.visibility_timeout_secs,
                retention_period_secs: def.retention_period_secs,
                delivery_delay_secs: def.delivery_delay_secs,
                encryption_key,
                dead_letter_queue,
                removal_policy: def.removal_policy,
            };
            Built::Queue(Queue::new(app, stack, &spec.id, props)?)
        }
        "events.EventBus" => {
            let def: EventBusDef = decode(&key, &spec.props)?;
            let props = EventBusProps {
                event_bus_name: def.event_bus_name,
                event_source_name: def.event_source_name,
            };
            Built::EventBus(EventBus::new(app, stack, &spec.id, props)?)
        }
        "events.Rule" => build_rule(app, registry, stack, stack_key, &key, spec)?,
        "efs.FileSystem" => {
            let def: FileSystemDef = decode(&key, &spec.props)?;
            let kms_key = match &def.kms_key {
                Some(reference) => Some(registry.key(reference, stack_key)?.clone()),
                None => None,
            };
            let props = FileSystemProps {
                file_system_name: def.file_system_name,
                encrypted: def.encrypted,
                kms_key,
                performance_mode: def.performance_mode,
                throughput_mode: def.throughput_mode,
                provisioned_throughput_mibps: def.provisioned_throughput_mibps,
                lifecycle_policy: def.lifecycle_policy,
                out_of_infrequent_access_on_access: def.out_of_infrequent_access_on_access,
                enable_automatic_backups: def.enable_automatic_backups,
                file_system_policy: None,
                allow_anonymous_access: def.allow_anonymous_access,
                removal_policy: def.removal_policy,
            };
            let fs = FileSystem::new(app, stack, &spec.id, props)?;
            for ap in def.access_points {
                fs.add_access_point(
                    app,
                    &ap.id,
                    AccessPointProps {
                        path: ap.path,
                        create_acl: ap.create_acl,
                        posix_user: ap.posix_user,
                    },
                )?;
            }
            Built::FileSystem(fs)
        }
        "custom.Provider" => {
            let def: ProviderDef = decode(&key, &spec.props)?;
            let props = ProviderProps {
                on_event_handler_arn: def.on_event_handler_arn,
                is_complete_handler_arn: def.is_complete_handler_arn,
                query_interval: def.query_interval_secs.map(Duration::from_secs),
                total_timeout: def.total_timeout_secs.map(Duration::from_secs),
            };
            Built::Provider(Provider::new(app, stack, &spec.id, props)?)
        }
        "custom.Resource" => {
            let def: CustomResourceDef = decode(&key, &spec.props)?;
            let service_token = match (&def.service_token, &def.provider) {
                (Some(token), None) => token.clone(),
                (None, Some(provider)) => registry
                    .provider(provider, stack_key)?
                    .service_token()
                    .to_string(),
                _ => {
                    return Err(ConstructError::Manifest(format!(
                        "{}: set exactly one of 'service_token' and 'provider'",
                        key
                    )))
                }
            };
            let props = CustomResourceProps {
                service_token,
                resource_type: def.resource_type,
                properties: def.properties,
                removal_policy: def.removal_policy,
            };
            Built::CustomResource(CustomResource::new(app, stack, &spec.id, props)?)
        }
        other => {
            return Err(ConstructError::Manifest(format!(
                "{}: unknown construct type '{}'",
                key, other
            )))
        }
    };
    registry.entries.insert(key, built);
    Ok(())
}

fn build_rule(
    app: &mut App,
    registry: &ConstructRegistry,
    stack: ConstructId,
    stack_key: &str,
    key: &str,
    spec: &ConstructSpec,
) -> ConstructResult<Built> {
    let def: RuleDef = decode(key, &spec.props)?;
    let schedule = match &def.schedule {
        Some(expression) => Some(expression.parse::<Schedule>()?),
        None => None,
    };
    let event_bus = match &def.event_bus {
        Some(reference) => Some(registry.bus(reference, stack_key)?.clone()),
        None => None,
    };
    let rule = Rule::new(
        app,
        stack,
        &spec.id,
        RuleProps {
            rule_name: def.rule_name,
            description: def.description,
            enabled: def.enabled,
            event_pattern: def.event_pattern,
            schedule,
            event_bus,
        },
    )?;
    for target in def.targets {
        match target {
            TargetDef::Queue {
                queue,
                message_group_id,
                input,
            } => {
                let mut target = SqsQueue::new(registry.queue(&queue, stack_key)?.clone());
                target.message_group_id = message_group_id;
                target.input = input.map(|value| match value {
                    Value::String(text) => RuleTargetInput::Text(text),
                    other => RuleTargetInput::Object(other),
                });
                rule.add_target(app, target)?;
            }
            TargetDef::EventBus { bus } => {
                let bus = registry.bus(&bus, stack_key)?.clone();
                rule.add_target(app, EventBusTarget::new(bus))?;
            }
        }
    }
    Ok(Built::Rule(rule))
}

fn key_grant(
    key: &dyn KeyRef,
    app: &mut App,
    grantee: &dyn Grantable,
    spec: &GrantSpec,
) -> ConstructResult<Grant> {
    match spec.grant.as_deref() {
        Some("decrypt") => key.grant_decrypt(app, grantee),
        Some("encrypt") => key.grant_encrypt(app, grantee),
        Some("encrypt-decrypt") => key.grant_encrypt_decrypt(app, grantee),
        Some("admin") => key.grant_admin(app, grantee),
        Some(other) => Err(unknown_grant(spec, other)),
        None => {
            let actions: Vec<&str> = spec.actions.iter().map(String::as_str).collect();
            key.grant(app, grantee, &actions)
        }
    }
}

fn unknown_grant(spec: &GrantSpec, name: &str) -> ConstructError {
    ConstructError::Manifest(format!(
        "grant '{}' is not available on '{}'",
        name, spec.target
    ))
}

fn apply_grant(app: &mut App, registry: &ConstructRegistry, spec: &GrantSpec) -> ConstructResult<()> {
    if spec.grant.is_none() && spec.actions.is_empty() {
        return Err(ConstructError::Manifest(format!(
            "grant on '{}' needs 'grant' or 'actions'",
            spec.target
        )));
    }
    let grantee = registry.role(&spec.grantee, "")?.clone();
    let actions: Vec<&str> = spec.actions.iter().map(String::as_str).collect();
    let grant = match registry.resolve(&spec.target, "")? {
        Built::Key(key) => key_grant(key, app, &grantee, spec)?,
        Built::Alias(alias) => key_grant(alias, app, &grantee, spec)?,
        Built::Queue(queue) => match spec.grant.as_deref() {
            Some("send") => queue.grant_send_messages(app, &grantee)?,
            Some("consume") => queue.grant_consume_messages(app, &grantee)?,
            Some("purge") => queue.grant_purge(app, &grantee)?,
            Some(other) => return Err(unknown_grant(spec, other)),
            None => queue.grant(app, &grantee, &actions)?,
        },
        Built::EventBus(bus) => match spec.grant.as_deref() {
            Some("put-events") | None => bus.grant_put_events_to(app, &grantee)?,
            Some(other) => return Err(unknown_grant(spec, other)),
        },
        Built::FileSystem(fs) => match spec.grant.as_deref() {
            Some("read") => fs.grant_read(app, &grantee)?,
            Some("read-write") => fs.grant_read_write(app, &grantee)?,
            Some("root") => fs.grant_root_access(app, &grantee)?,
            Some(other) => return Err(unknown_grant(spec, other)),
            None => fs.grant(app, &grantee, &actions)?,
        },
        other => {
            return Err(ConstructError::Manifest(format!(
                "'{}' is a {}, which cannot be granted on",
                spec.target,
                other.kind()
            )))
        }
    };
    grant.assert_success()?;
    Ok(())
}
