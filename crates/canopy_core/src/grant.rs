//! Grant engine: turns "principal P may do A on resource R" into policy
//! statements on P's identity, R's resource policy, or both.
//!
//! Which side is mutated is decided by a [`GrantStrategy`], picked per stack
//! when the stack is created (see [`GrantMode`]).

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use canopy_policy::{Principal, PolicyStatement};

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult};
use crate::resource::PolicySlot;
use crate::token::{contains_token, tokens_in, TokenKind};

/// Grant behaviour of a stack, chosen from `@canopy/kms:default-key-policies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantMode {
    /// Grants land in the resource policy.
    StrictResource,
    /// Grants land in the identity policy; the resource's default policy
    /// delegates to the account.
    IdentityFirst,
}

impl GrantMode {
    pub fn from_flag(default_key_policies: bool) -> Self {
        if default_key_policies {
            GrantMode::IdentityFirst
        } else {
            GrantMode::StrictResource
        }
    }

    pub fn strategy(&self) -> &'static dyn GrantStrategy {
        match self {
            GrantMode::StrictResource => &StrictResourceStrategy,
            GrantMode::IdentityFirst => &IdentityFirstStrategy,
        }
    }
}

/// Facts about a grant that decide where statements go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrantFacts {
    /// The grantee has an identity policy we can edit.
    pub has_identity: bool,
    /// The target has a resource policy we can edit.
    pub has_resource_policy: bool,
    /// Grantee and target live in different accounts.
    pub cross_account: bool,
    /// Grantee identity and target live in different stacks.
    pub cross_stack: bool,
    /// The grantee's principal renders in the target's stack without
    /// referencing a resource of another stack.
    pub grantee_nameable: bool,
}

/// Principal named in the resource-policy statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePrincipal {
    Grantee,
    /// The grantee's account root; the identity statement does the rest.
    AccountRoot,
}

/// Statements a strategy wants written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrantPlan {
    pub identity: bool,
    pub resource: Option<ResourcePrincipal>,
}

impl GrantPlan {
    pub fn is_empty(&self) -> bool {
        !self.identity && self.resource.is_none()
    }
}

pub trait GrantStrategy {
    fn name(&self) -> &'static str;
    fn plan(&self, facts: &GrantFacts) -> GrantPlan;
}

/// Resource policy first. The grantee is named in the resource policy unless
/// that would reference another stack's resource; then the statement names
/// the grantee's account root and the identity policy carries the grant.
/// Across accounts the identity policy is always written too.
pub struct StrictResourceStrategy;

impl GrantStrategy for StrictResourceStrategy {
    fn name(&self) -> &'static str {
        "strict-resource"
    }

    fn plan(&self, facts: &GrantFacts) -> GrantPlan {
        if facts.has_resource_policy {
            let crosses = facts.cross_stack || facts.cross_account;
            if facts.has_identity && crosses && !facts.grantee_nameable {
                return GrantPlan {
                    identity: true,
                    resource: Some(ResourcePrincipal::AccountRoot),
                };
            }
            return GrantPlan {
                identity: facts.has_identity && facts.cross_account,
                resource: Some(ResourcePrincipal::Grantee),
            };
        }
        GrantPlan {
            identity: facts.has_identity,
            resource: None,
        }
    }
}

/// Identity policy first; the resource policy is touched only when the
/// grantee has no identity. Across accounts this behaves like
/// [`StrictResourceStrategy`].
pub struct IdentityFirstStrategy;

impl GrantStrategy for IdentityFirstStrategy {
    fn name(&self) -> &'static str {
        "identity-first"
    }

    fn plan(&self, facts: &GrantFacts) -> GrantPlan {
        if facts.cross_account {
            return StrictResourceStrategy.plan(facts);
        }
        if facts.has_identity {
            return GrantPlan {
                identity: true,
                resource: None,
            };
        }
        GrantPlan {
            identity: false,
            resource: facts
                .has_resource_policy
                .then_some(ResourcePrincipal::Grantee),
        }
    }
}

/// Who is being granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grantee {
    pub principal: Principal,
    /// Resource holding the grantee's identity policy, if editable.
    pub identity: Option<ConstructId>,
}

impl Grantee {
    /// A principal without an editable identity (service, imported role).
    pub fn principal(principal: Principal) -> Self {
        Self {
            principal,
            identity: None,
        }
    }

    pub fn with_identity(principal: Principal, identity: ConstructId) -> Self {
        Self {
            principal,
            identity: Some(identity),
        }
    }
}

/// What is being granted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantTarget {
    /// A resource defined in this app.
    Owned {
        resource: ConstructId,
        /// Resource carrying the target's resource policy, if any.
        policy_holder: Option<ConstructId>,
        /// Arns named in identity statements.
        arns: Vec<String>,
        /// Resources named in resource-policy statements.
        policy_resources: Vec<String>,
    },
    /// A resource referenced by arn; its policy cannot be edited.
    Imported { scope: ConstructId, arns: Vec<String> },
    /// A target whose identity is not known (e.g. an alias by name).
    Unresolved { scope: ConstructId, reason: String },
}

impl GrantTarget {
    fn scope(&self) -> ConstructId {
        match self {
            GrantTarget::Owned { resource, .. } => *resource,
            GrantTarget::Imported { scope, .. } | GrantTarget::Unresolved { scope, .. } => *scope,
        }
    }
}

/// Outcome of a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub path: String,
    pub actions: Vec<String>,
    pub principal_statement: Option<PolicyStatement>,
    pub resource_statement: Option<PolicyStatement>,
    pub success: bool,
}

impl Grant {
    /// Turn an unsatisfied grant into an `invalid-policy` error.
    pub fn assert_success(&self) -> CoreResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(CoreError::InvalidPolicy {
                path: self.path.clone(),
                message: format!(
                    "could not add a statement for {} to any policy; the grantee has no identity policy and the resource has no resource policy",
                    self.actions.join(", ")
                ),
            })
        }
    }
}

fn literal_account(account: Option<String>) -> Option<String> {
    account.filter(|a| !contains_token(a))
}

impl App {
    /// Identity-statement resources usable from another account. An arn
    /// whose tokens cannot be linked across accounts widens to `*`.
    fn cross_account_resources(&self, arns: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for arn in arns {
            let resource = if self.linkable_across_accounts(arn) {
                arn.clone()
            } else {
                "*".to_string()
            };
            if !out.contains(&resource) {
                out.push(resource);
            }
        }
        out
    }

    fn linkable_across_accounts(&self, s: &str) -> bool {
        tokens_in(&Value::String(s.to_string()))
            .into_iter()
            .filter_map(|id| self.token(id))
            .filter(|token| token.is_reference())
            .all(|token| {
                let attribute = match &token.kind {
                    TokenKind::Ref { .. } => "Ref",
                    TokenKind::GetAtt { attribute, .. } => attribute.as_str(),
                    _ => return false,
                };
                token
                    .producer
                    .and_then(|producer| self.resource(producer))
                    .is_some_and(|resource| resource.cross_env_attribute(attribute).is_some())
            })
    }

    /// Whether `principal` can be written into a policy of `stack` without
    /// referencing a resource owned by another stack.
    fn renders_in_stack(&self, principal: &Principal, stack: ConstructId) -> bool {
        tokens_in(&principal.policy_fragment().to_json())
            .into_iter()
            .filter_map(|id| self.token(id))
            .filter(|token| token.is_reference())
            .all(|token| match token.producer {
                Some(producer) => self.stack_of(producer).is_ok_and(|s| s == stack),
                None => true,
            })
    }

    /// Grant `actions` on `target` to `grantee`.
    pub fn grant(
        &mut self,
        grantee: &Grantee,
        target: &GrantTarget,
        actions: &[&str],
    ) -> CoreResult<Grant> {
        let scope = target.scope();
        let actions: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
        let mut grant = Grant {
            path: self.path(scope),
            actions: actions.clone(),
            principal_statement: None,
            resource_statement: None,
            success: false,
        };

        let (resource_stack, policy_holder, arns, policy_resources) = match target {
            GrantTarget::Unresolved { reason, .. } => {
                self.add_warning(
                    scope,
                    format!("grant of {} ignored: {}", actions.join(", "), reason),
                );
                grant.success = true;
                return Ok(grant);
            }
            GrantTarget::Imported { arns, .. } => {
                (self.stack_of(scope)?, None, arns.clone(), Vec::new())
            }
            GrantTarget::Owned {
                resource,
                policy_holder,
                arns,
                policy_resources,
            } => (
                self.stack_of(*resource)?,
                *policy_holder,
                arns.clone(),
                policy_resources.clone(),
            ),
        };

        let identity_stack = match grantee.identity {
            Some(identity) => Some(self.stack_of(identity)?),
            None => None,
        };

        let resource_account = match target {
            GrantTarget::Imported { arns, .. } => {
                arns.iter().find_map(|arn| canopy_policy::arn_account(arn))
            }
            _ => self.stack(resource_stack)?.env().account.clone(),
        };
        let grantee_account = literal_account(grantee.principal.principal_account()).or_else(|| {
            identity_stack.and_then(|s| self.stack_data(s).and_then(|d| d.env().account.clone()))
        });
        let cross_account = matches!(
            (&resource_account, &grantee_account),
            (Some(a), Some(b)) if a != b
        );

        let facts = GrantFacts {
            has_identity: grantee.identity.is_some(),
            has_resource_policy: policy_holder.is_some(),
            cross_account,
            cross_stack: identity_stack.is_some_and(|s| s != resource_stack),
            grantee_nameable: self.renders_in_stack(&grantee.principal, resource_stack),
        };
        let mode = self.stack(resource_stack)?.grant_mode();
        let strategy = mode.strategy();
        let plan = strategy.plan(&facts);
        debug!(
            "Grant {} on {} using {} ({:?}) -> {:?}",
            actions.join(","),
            grant.path,
            strategy.name(),
            facts,
            plan
        );

        if plan.is_empty() {
            return Ok(grant);
        }

        if plan.identity {
            if let Some(identity) = grantee.identity {
                let resources = if cross_account {
                    self.cross_account_resources(&arns)
                } else {
                    arns.clone()
                };
                let statement = PolicyStatement::allow()
                    .with_actions(actions.iter().cloned())
                    .with_resources(resources);
                self.add_policy_statement(identity, PolicySlot::Identity, statement.clone())?;
                grant.principal_statement = Some(statement);
            }
        }

        if let (Some(kind), Some(holder)) = (plan.resource, policy_holder) {
            let principal = match kind {
                ResourcePrincipal::Grantee => grantee.principal.clone(),
                ResourcePrincipal::AccountRoot => {
                    let account = match (&grantee_account, identity_stack) {
                        (Some(account), _) => account.clone(),
                        (None, Some(stack)) => self.account(stack)?,
                        (None, None) => self.account(scope)?,
                    };
                    Principal::account_root(account)
                }
            };
            let statement = PolicyStatement::allow()
                .with_actions(actions.iter().cloned())
                .with_principal(principal)
                .with_resources(policy_resources.iter().cloned());
            self.add_policy_statement(holder, PolicySlot::Resource, statement.clone())?;
            grant.resource_statement = Some(statement);
        }

        if cross_account {
            if let Some(identity_stack) = identity_stack {
                if identity_stack != resource_stack {
                    self.add_stack_dependency(identity_stack, resource_stack)?;
                }
            }
        }

        grant.success = grant.principal_statement.is_some() || grant.resource_statement.is_some();
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(identity: bool, resource: bool, account: bool, stack: bool) -> GrantFacts {
        GrantFacts {
            has_identity: identity,
            has_resource_policy: resource,
            cross_account: account,
            cross_stack: stack,
            grantee_nameable: !stack,
        }
    }

    fn nameable(mut facts: GrantFacts) -> GrantFacts {
        facts.grantee_nameable = true;
        facts
    }

    #[test]
    fn test_strict_same_stack_uses_resource_policy() {
        let plan = StrictResourceStrategy.plan(&facts(true, true, false, false));
        assert!(!plan.identity);
        assert_eq!(plan.resource, Some(ResourcePrincipal::Grantee));
    }

    #[test]
    fn test_strict_cross_stack_uses_both_with_account_root() {
        let plan = StrictResourceStrategy.plan(&facts(true, true, false, true));
        assert!(plan.identity);
        assert_eq!(plan.resource, Some(ResourcePrincipal::AccountRoot));
    }

    #[test]
    fn test_strict_cross_stack_names_a_literal_grantee() {
        let plan = StrictResourceStrategy.plan(&nameable(facts(true, true, false, true)));
        assert!(!plan.identity);
        assert_eq!(plan.resource, Some(ResourcePrincipal::Grantee));
    }

    #[test]
    fn test_strict_cross_account_writes_both_policies() {
        let plan = StrictResourceStrategy.plan(&nameable(facts(true, true, true, true)));
        assert!(plan.identity);
        assert_eq!(plan.resource, Some(ResourcePrincipal::Grantee));

        let plan = StrictResourceStrategy.plan(&facts(true, true, true, true));
        assert!(plan.identity);
        assert_eq!(plan.resource, Some(ResourcePrincipal::AccountRoot));
    }

    #[test]
    fn test_cross_account_resources_widen_unlinkable_tokens() {
        use crate::resource::ResourceNode;
        use crate::stack::StackProps;

        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Keys", StackProps::default()).unwrap();
        let anonymous = app
            .add_resource(stack, "Anonymous", ResourceNode::new("AWS::KMS::Key"))
            .unwrap();
        let named = app
            .add_resource(
                stack,
                "Named",
                ResourceNode::new("AWS::SQS::Queue").with_cross_env_attribute(
                    "Arn",
                    "arn:aws:sqs:us-east-1:111111111111:jobs",
                ),
            )
            .unwrap();
        let arns = vec![
            app.get_att(anonymous, "Arn"),
            "arn:aws:kms:us-east-1:111111111111:key/abc".to_string(),
            app.get_att(named, "Arn"),
        ];

        let resources = app.cross_account_resources(&arns);
        assert_eq!(
            resources,
            vec![
                "*".to_string(),
                "arn:aws:kms:us-east-1:111111111111:key/abc".to_string(),
                arns[2].clone(),
            ]
        );
    }

    #[test]
    fn test_strict_external_resource_uses_identity() {
        let plan = StrictResourceStrategy.plan(&facts(true, false, false, false));
        assert!(plan.identity);
        assert!(plan.resource.is_none());
    }

    #[test]
    fn test_identity_first_leaves_resource_policy_alone() {
        let plan = IdentityFirstStrategy.plan(&facts(true, true, false, true));
        assert!(plan.identity);
        assert!(plan.resource.is_none());
    }

    #[test]
    fn test_identity_first_cross_account_falls_back() {
        let plan = IdentityFirstStrategy.plan(&facts(true, true, true, true));
        assert!(plan.identity);
        assert_eq!(plan.resource, Some(ResourcePrincipal::AccountRoot));
    }

    #[test]
    fn test_service_principal_uses_resource_policy_in_both_modes() {
        for strategy in [GrantMode::StrictResource, GrantMode::IdentityFirst] {
            let plan = strategy.strategy().plan(&facts(false, true, false, false));
            assert!(!plan.identity);
            assert_eq!(plan.resource, Some(ResourcePrincipal::Grantee));
        }
    }

    #[test]
    fn test_nothing_editable_is_empty_plan() {
        assert!(StrictResourceStrategy
            .plan(&facts(false, false, false, false))
            .is_empty());
        assert!(IdentityFirstStrategy
            .plan(&facts(false, false, true, false))
            .is_empty());
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(GrantMode::from_flag(false), GrantMode::StrictResource);
        assert_eq!(GrantMode::from_flag(true), GrantMode::IdentityFirst);
    }
}
