//! Custom resources and the provider protocol behind them.
//!
//! A custom resource is an ordinary template resource whose lifecycle is
//! implemented by a handler addressed through its service token. The
//! [`ProviderRuntime`] drives a [`LifecycleHandler`] the way the deployment
//! engine would: one `on_event` call, then optional `is_complete` polling.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use canopy_core::{template_property_name, App, ConstructId, RemovalPolicy, ResourceNode};

use crate::error::{ConstructError, ConstructResult};

pub const CUSTOM_RESOURCE_TYPE: &str = "AWS::CloudFormation::CustomResource";
const CUSTOM_PREFIX: &str = "Custom::";
const MAX_TYPE_LENGTH: usize = 60;
const SERVICE_TOKEN_KEY: &str = "serviceToken";

/// Upper bound on how long a long-running provider may take.
pub const MAX_TOTAL_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn type_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_@-]+$").expect("valid resource type regex"))
}

/// Check a custom resource type: the generic type or `Custom::<Name>`.
pub fn validate_resource_type(resource_type: &str) -> Result<(), String> {
    if resource_type == CUSTOM_RESOURCE_TYPE {
        return Ok(());
    }
    let Some(name) = resource_type.strip_prefix(CUSTOM_PREFIX) else {
        return Err(format!(
            "custom resource type '{}' must be '{}' or start with '{}'",
            resource_type, CUSTOM_RESOURCE_TYPE, CUSTOM_PREFIX
        ));
    };
    if resource_type.len() > MAX_TYPE_LENGTH {
        return Err(format!(
            "custom resource type '{}' is longer than {} characters",
            resource_type, MAX_TYPE_LENGTH
        ));
    }
    if !type_name_pattern().is_match(name) {
        return Err(format!(
            "custom resource type '{}' may only contain alphanumerics and '_@-' after '{}'",
            resource_type, CUSTOM_PREFIX
        ));
    }
    Ok(())
}

/// Properties for [`CustomResource::new`].
#[derive(Debug, Clone, Default)]
pub struct CustomResourceProps {
    pub service_token: String,
    /// Defaults to `AWS::CloudFormation::CustomResource`.
    pub resource_type: Option<String>,
    /// Handed to the handler. Top-level keys are capitalized, values are
    /// passed through verbatim.
    pub properties: Map<String, Value>,
    /// Defaults to destroy.
    pub removal_policy: Option<RemovalPolicy>,
}

#[derive(Debug, Clone)]
pub struct CustomResource {
    node: ConstructId,
    resource: ConstructId,
}

impl CustomResource {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: CustomResourceProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        let resource_type = props
            .resource_type
            .clone()
            .unwrap_or_else(|| CUSTOM_RESOURCE_TYPE.to_string());
        validate_resource_type(&resource_type).map_err(|msg| ConstructError::invalid(app.path(node), msg))?;
        if props.service_token.is_empty() {
            return Err(ConstructError::invalid(app.path(node), "a service token is required"));
        }

        let mut resource = ResourceNode::new(resource_type)
            .with_property(SERVICE_TOKEN_KEY, props.service_token.clone())
            .default_removal(RemovalPolicy::Destroy);
        for (key, value) in &props.properties {
            if template_property_name(key) == template_property_name(SERVICE_TOKEN_KEY) {
                return Err(ConstructError::invalid(
                    app.path(node),
                    "'ServiceToken' is reserved; set it through the service token",
                ));
            }
            resource = resource.with_property(key, value.clone()).raw_key(key);
        }
        let resource = app.add_resource(node, "Resource", resource)?;
        if let Some(policy) = props.removal_policy {
            app.apply_removal_policy(resource, policy)?;
        }
        Ok(Self { node, resource })
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn resource(&self) -> ConstructId {
        self.resource
    }

    /// The physical id returned by the handler.
    pub fn reference(&self, app: &mut App) -> String {
        app.ref_token(self.resource)
    }

    /// A field of the handler's response data.
    pub fn get_att(&self, app: &mut App, name: &str) -> String {
        app.get_att(self.resource, name)
    }
}

/// Properties for [`Provider::new`].
#[derive(Debug, Clone, Default)]
pub struct ProviderProps {
    pub on_event_handler_arn: String,
    /// Makes the provider long-running.
    pub is_complete_handler_arn: Option<String>,
    pub query_interval: Option<Duration>,
    pub total_timeout: Option<Duration>,
}

/// A handler-backed provider. Its service token is what custom resources
/// point at.
#[derive(Debug, Clone)]
pub struct Provider {
    node: ConstructId,
    service_token: String,
    completion: Option<Completion>,
}

/// Polling settings of a long-running provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub query_interval: Duration,
    pub total_timeout: Duration,
}

impl Completion {
    pub fn new(query_interval: Duration, total_timeout: Duration) -> Result<Self, String> {
        if total_timeout > MAX_TOTAL_TIMEOUT {
            return Err(format!(
                "total timeout of {}s exceeds the maximum of {}s",
                total_timeout.as_secs(),
                MAX_TOTAL_TIMEOUT.as_secs()
            ));
        }
        if query_interval.is_zero() || query_interval > total_timeout {
            return Err(format!(
                "query interval of {}ms must be positive and at most the total timeout",
                query_interval.as_millis()
            ));
        }
        Ok(Self {
            query_interval,
            total_timeout,
        })
    }
}

impl Provider {
    pub fn new(app: &mut App, scope: ConstructId, id: &str, props: ProviderProps) -> ConstructResult<Self> {
        let node = app.add_construct(scope, id)?;
        if props.on_event_handler_arn.is_empty() {
            return Err(ConstructError::invalid(app.path(node), "an on-event handler is required"));
        }
        let completion = match &props.is_complete_handler_arn {
            Some(_) => Some(
                Completion::new(
                    props.query_interval.unwrap_or(DEFAULT_QUERY_INTERVAL),
                    props.total_timeout.unwrap_or(DEFAULT_TOTAL_TIMEOUT),
                )
                .map_err(|msg| ConstructError::invalid(app.path(node), msg))?,
            ),
            None if props.query_interval.is_some() || props.total_timeout.is_some() => {
                return Err(ConstructError::invalid(
                    app.path(node),
                    "query interval and total timeout need an is-complete handler",
                ))
            }
            None => None,
        };

        app.add_metadata(
            node,
            "canopy:provider",
            json!({
                "onEvent": props.on_event_handler_arn,
                "isComplete": props.is_complete_handler_arn,
                "queryIntervalSecs": completion.map(|c| c.query_interval.as_secs()),
                "totalTimeoutSecs": completion.map(|c| c.total_timeout.as_secs()),
            }),
        )?;
        debug!("Provider {}", app.path(node));
        Ok(Self {
            node,
            service_token: props.on_event_handler_arn,
            completion,
        })
    }

    pub fn node(&self) -> ConstructId {
        self.node
    }

    pub fn service_token(&self) -> &str {
        &self.service_token
    }

    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    pub fn is_long_running(&self) -> bool {
        self.completion.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

/// What the handler receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleRequest {
    pub request_type: RequestType,
    pub request_id: String,
    pub logical_resource_id: String,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_resource_properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub stack_id: String,
    #[serde(default)]
    pub service_token: String,
}

/// What `on_event` returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub no_echo: bool,
}

/// What `is_complete` returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IsCompleteResponse {
    pub is_complete: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Final result reported back for one lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutcome {
    pub physical_resource_id: String,
    pub data: Map<String, Value>,
    pub no_echo: bool,
}

#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    async fn on_event(&self, request: &LifecycleRequest) -> ConstructResult<LifecycleResponse>;

    /// Only called by long-running providers.
    async fn is_complete(&self, _request: &LifecycleRequest) -> ConstructResult<IsCompleteResponse> {
        Ok(IsCompleteResponse {
            is_complete: true,
            data: Map::new(),
        })
    }
}

/// Drives a handler through one lifecycle event.
pub struct ProviderRuntime {
    handler: Arc<dyn LifecycleHandler>,
    completion: Option<Completion>,
}

impl ProviderRuntime {
    pub fn new(handler: Arc<dyn LifecycleHandler>) -> Self {
        Self {
            handler,
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Runtime matching a [`Provider`]'s settings.
    pub fn for_provider(provider: &Provider, handler: Arc<dyn LifecycleHandler>) -> Self {
        Self {
            handler,
            completion: provider.completion(),
        }
    }

    pub async fn handle(&self, request: LifecycleRequest) -> ConstructResult<ProviderOutcome> {
        info!(
            "{:?} {} ({})",
            request.request_type, request.logical_resource_id, request.resource_type
        );
        let response = self.handler.on_event(&request).await?;
        let physical_resource_id = self.physical_id(&request, &response)?;

        let mut data = response.data;
        if let Some(completion) = self.completion {
            let mut polled = request.clone();
            polled.physical_resource_id = Some(physical_resource_id.clone());
            let done = self.poll(&polled, completion).await?;
            data.extend(done.data);
        }

        Ok(ProviderOutcome {
            physical_resource_id,
            data,
            no_echo: response.no_echo,
        })
    }

    fn physical_id(&self, request: &LifecycleRequest, response: &LifecycleResponse) -> ConstructResult<String> {
        let previous = request.physical_resource_id.as_deref();
        match (request.request_type, response.physical_resource_id.as_deref()) {
            (RequestType::Delete, Some(id)) if Some(id) != previous => Err(ConstructError::Provider(format!(
                "delete of {} cannot change the physical resource id from '{}' to '{}'",
                request.logical_resource_id,
                previous.unwrap_or_default(),
                id
            ))),
            (_, Some(id)) => Ok(id.to_string()),
            (RequestType::Create, None) => Ok(request.request_id.clone()),
            (_, None) => previous.map(str::to_string).ok_or_else(|| {
                ConstructError::Provider(format!(
                    "{:?} of {} carries no physical resource id",
                    request.request_type, request.logical_resource_id
                ))
            }),
        }
    }

    async fn poll(&self, request: &LifecycleRequest, completion: Completion) -> ConstructResult<IsCompleteResponse> {
        let started = Instant::now();
        loop {
            let response = self.handler.is_complete(request).await?;
            if response.is_complete {
                return Ok(response);
            }
            if started.elapsed() + completion.query_interval > completion.total_timeout {
                warn!(
                    "{} did not complete within {}ms",
                    request.logical_resource_id,
                    completion.total_timeout.as_millis()
                );
                return Err(ConstructError::Provider(format!(
                    "operation timed out after {}ms",
                    completion.total_timeout.as_millis()
                )));
            }
            sleep(completion.query_interval).await;
        }
    }
}
