//! End-to-end synthesis tests for canopy_constructs.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use canopy_constructs::events::{EventPattern, Rule, RuleProps, Schedule, SqsQueue, TimeUnit};
use canopy_constructs::iam::{Role, RoleProps};
use canopy_constructs::kms::{Key, KeyProps, KeyRef, ENCRYPT_ACTIONS, KEY_TYPE};
use canopy_constructs::sqs::{Queue, QueueProps};
use canopy_constructs::AppManifest;
use canopy_core::{
    synthesize, App, CloudAssembly, ConstructId, Environment, ErrorKind, StackProps,
    TemplateDocument, KMS_DEFAULT_KEY_POLICIES,
};
use canopy_policy::Principal;

fn stack_props(account: Option<&str>, identity_first: bool) -> StackProps {
    let mut context = BTreeMap::new();
    if identity_first {
        context.insert(KMS_DEFAULT_KEY_POLICIES.to_string(), json!(true));
    }
    StackProps {
        env: match account {
            Some(account) => Environment::new(account, "us-east-1"),
            None => Environment::agnostic(),
        },
        context,
        ..Default::default()
    }
}

fn lambda_role(app: &mut App, stack: ConstructId, id: &str) -> Role {
    Role::new(
        app,
        stack,
        id,
        RoleProps::new(Principal::service("lambda.amazonaws.com")),
    )
    .unwrap()
}

/// Statements of every inline policy on a rendered role.
fn role_statements(template: &TemplateDocument, logical_id: &str) -> Vec<Value> {
    template
        .resource(logical_id)
        .and_then(|r| r.property("Policies"))
        .and_then(Value::as_array)
        .map(|policies| {
            policies
                .iter()
                .flat_map(|p| {
                    p["PolicyDocument"]["Statement"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn key_statements(template: &TemplateDocument, logical_id: &str) -> Vec<Value> {
    template
        .resource(logical_id)
        .and_then(|r| r.property("KeyPolicy"))
        .and_then(|p| p["Statement"].as_array().cloned())
        .unwrap_or_default()
}

fn has_action(statement: &Value, action: &str) -> bool {
    match &statement["Action"] {
        Value::String(a) => a == action,
        Value::Array(list) => list.iter().any(|a| a == action),
        _ => false,
    }
}

struct CrossStackKey {
    assembly: CloudAssembly,
    key_id: String,
    role_id: String,
}

fn cross_stack_key(identity_first: bool) -> CrossStackKey {
    let mut app = App::new();
    let root = app.root();
    let a = app.add_stack(root, "A", stack_props(None, identity_first)).unwrap();
    let b = app.add_stack(root, "B", stack_props(None, identity_first)).unwrap();
    let key = Key::new(&mut app, a, "MyKey", KeyProps::default()).unwrap();
    let role = lambda_role(&mut app, b, "Reader");
    key.grant_decrypt(&mut app, &role).unwrap().assert_success().unwrap();

    let key_id = app.logical_id(key.resource().unwrap());
    let role_id = app.logical_id(role.resource().unwrap());
    CrossStackKey {
        assembly: synthesize(&mut app).unwrap(),
        key_id,
        role_id,
    }
}

#[test]
fn test_cross_stack_key_reference_exports_and_imports_the_arn() {
    let CrossStackKey {
        assembly,
        key_id,
        role_id,
    } = cross_stack_key(true);

    let a = assembly.template("A").unwrap();
    let (output_name, output) = a.outputs.iter().next().unwrap();
    assert!(output_name.starts_with("ExportsOutput"));
    assert_eq!(output["Value"], json!({"Fn::GetAtt": [key_id, "Arn"]}));
    let export_name = output["Export"]["Name"].clone();

    let b = assembly.template("B").unwrap();
    let decrypt: Vec<Value> = role_statements(b, &role_id)
        .into_iter()
        .filter(|s| has_action(s, "kms:Decrypt"))
        .collect();
    assert_eq!(decrypt.len(), 1);
    assert_eq!(decrypt[0]["Effect"], json!("Allow"));
    assert_eq!(decrypt[0]["Resource"], json!({"Fn::ImportValue": export_name}));

    let artifact = assembly.artifact("B").unwrap();
    assert_eq!(artifact.dependencies, vec!["A".to_string()]);
    assert_eq!(artifact.imports.len(), 1);

    // Identity-first: the key policy keeps only its default statement.
    let key_policy = key_statements(a, &key_id);
    assert_eq!(key_policy.len(), 1);
    assert!(!has_action(&key_policy[0], "kms:Decrypt"));
}

#[test]
fn test_cross_stack_key_reference_in_strict_mode_extends_the_key_policy() {
    let CrossStackKey {
        assembly,
        key_id,
        role_id,
    } = cross_stack_key(false);

    let a = assembly.template("A").unwrap();
    assert!(key_statements(a, &key_id)
        .iter()
        .any(|s| has_action(s, "kms:Decrypt") && s["Effect"] == json!("Allow")));

    let b = assembly.template("B").unwrap();
    assert!(role_statements(b, &role_id)
        .iter()
        .any(|s| has_action(s, "kms:Decrypt")));
}

#[test]
fn test_cross_account_key_grant_trusts_the_grantee_account() {
    for identity_first in [false, true] {
        let mut app = App::new();
        let root = app.root();
        let a = app
            .add_stack(root, "A", stack_props(Some("111111111111"), identity_first))
            .unwrap();
        let b = app
            .add_stack(root, "B", stack_props(Some("222222222222"), identity_first))
            .unwrap();
        let key = Key::new(&mut app, a, "MyKey", KeyProps::default()).unwrap();
        let role = lambda_role(&mut app, b, "Reader");
        key.grant_decrypt(&mut app, &role).unwrap().assert_success().unwrap();
        let key_id = app.logical_id(key.resource().unwrap());
        let role_id = app.logical_id(role.resource().unwrap());

        let assembly = synthesize(&mut app)
            .unwrap_or_else(|e| panic!("identity_first={}: {}", identity_first, e));

        let key_policy = key_statements(assembly.template("A").unwrap(), &key_id);
        assert!(
            key_policy.iter().any(|s| has_action(s, "kms:Decrypt")
                && s["Effect"] == json!("Allow")
                && s["Principal"] == json!({"AWS": "arn:aws:iam::222222222222:root"})),
            "identity_first={}: {:?}",
            identity_first,
            key_policy
        );

        let decrypt: Vec<Value> = role_statements(assembly.template("B").unwrap(), &role_id)
            .into_iter()
            .filter(|s| has_action(s, "kms:Decrypt"))
            .collect();
        assert_eq!(decrypt.len(), 1, "identity_first={}", identity_first);
        assert_eq!(decrypt[0]["Resource"], json!("*"));
        assert!(assembly.artifact("B").unwrap().imports.is_empty());
        assert!(assembly.artifact("B").unwrap().dependencies.contains(&"A".to_string()));
    }
}

#[test]
fn test_strict_grant_names_a_physically_named_role_in_another_stack() {
    let mut app = App::new();
    let root = app.root();
    let a = app
        .add_stack(root, "A", stack_props(Some("111111111111"), false))
        .unwrap();
    let b = app
        .add_stack(root, "B", stack_props(Some("111111111111"), false))
        .unwrap();
    let key = Key::new(&mut app, a, "MyKey", KeyProps::default()).unwrap();
    let role = Role::new(
        &mut app,
        b,
        "Reader",
        RoleProps::new(Principal::service("lambda.amazonaws.com")).with_role_name("reader"),
    )
    .unwrap();
    key.grant_decrypt(&mut app, &role).unwrap().assert_success().unwrap();
    let key_id = app.logical_id(key.resource().unwrap());
    let role_id = app.logical_id(role.resource().unwrap());

    let assembly = synthesize(&mut app).unwrap();
    let key_policy = key_statements(assembly.template("A").unwrap(), &key_id);
    assert!(key_policy.iter().any(|s| has_action(s, "kms:Decrypt")
        && s["Principal"] == json!({"AWS": "arn:aws:iam::111111111111:role/reader"})));
    assert!(role_statements(assembly.template("B").unwrap(), &role_id).is_empty());
    assert!(assembly.artifact("A").unwrap().dependencies.is_empty());
    assert!(assembly.artifact("B").unwrap().dependencies.is_empty());
}

#[test]
fn test_cross_account_rule_target_is_relayed_through_the_default_bus() {
    let mut app = App::new();
    let root = app.root();
    let a = app
        .add_stack(root, "A", stack_props(Some("111111111111"), false))
        .unwrap();
    let b = app
        .add_stack(root, "B", stack_props(Some("222222222222"), false))
        .unwrap();
    let queue = Queue::new(&mut app, b, "Inbox", QueueProps::default()).unwrap();
    let rule = Rule::new(
        &mut app,
        a,
        "OnInventory",
        RuleProps {
            event_pattern: Some(EventPattern::new().with_source(["app.inventory"])),
            ..Default::default()
        },
    )
    .unwrap();
    rule.add_target(&mut app, SqsQueue::new(queue.clone())).unwrap();
    let rule_id = app.logical_id(rule.resource());
    let queue_id = app.logical_id(queue.resource().unwrap());

    let assembly = synthesize(&mut app).unwrap();

    let template_a = assembly.template("A").unwrap();
    let targets = template_a
        .resource(&rule_id)
        .unwrap()
        .property("Targets")
        .unwrap()
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(targets.len(), 1);
    assert_eq!(
        targets[0]["Arn"],
        json!("arn:aws:events:us-east-1:222222222222:event-bus/default")
    );
    assert!(targets[0].get("RoleArn").is_some());

    let relay_role = template_a
        .resources_of_type("AWS::IAM::Role")
        .find(|(id, _)| {
            role_statements(template_a, id)
                .iter()
                .any(|s| has_action(s, "events:PutEvents"))
        });
    assert!(relay_role.is_some());

    let template_b = assembly.template("B").unwrap();
    let (_, bus_policy) = template_b
        .resources_of_type("AWS::Events::EventBusPolicy")
        .next()
        .unwrap();
    assert_eq!(bus_policy.property("Principal").unwrap(), &json!("111111111111"));
    assert_eq!(bus_policy.property("Action").unwrap(), &json!("events:PutEvents"));

    let (_, forward) = template_b
        .resources_of_type("AWS::Events::Rule")
        .next()
        .unwrap();
    assert_eq!(
        forward.property("EventPattern").unwrap(),
        &json!({"source": ["app.inventory"]})
    );
    assert_eq!(
        forward.property("Targets").unwrap()[0]["Arn"],
        json!({"Fn::GetAtt": [queue_id, "Arn"]})
    );

    assert!(assembly
        .artifact("A")
        .unwrap()
        .dependencies
        .contains(&"B".to_string()));
}

#[test]
fn test_cross_account_target_requires_concrete_environments() {
    let mut app = App::new();
    let root = app.root();
    let a = app.add_stack(root, "A", stack_props(None, false)).unwrap();
    let b = app
        .add_stack(root, "B", stack_props(Some("222222222222"), false))
        .unwrap();
    let queue = Queue::new(&mut app, b, "Inbox", QueueProps::default()).unwrap();
    let rule = Rule::new(
        &mut app,
        a,
        "OnInventory",
        RuleProps {
            event_pattern: Some(EventPattern::new().with_source(["app.inventory"])),
            ..Default::default()
        },
    )
    .unwrap();
    let err = rule.add_target(&mut app, SqsQueue::new(queue)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownEnvironment);
    assert_eq!(err.exit_code(), 4);
}

#[test]
fn test_alias_grant_forwards_to_the_key_policy() {
    let mut app = App::new();
    let root = app.root();
    let stack = app
        .add_stack(root, "Vault", stack_props(Some("111111111111"), false))
        .unwrap();
    let key = Key::new(&mut app, stack, "K", KeyProps::default()).unwrap();
    let alias = key.add_alias(&mut app, "alias/foo").unwrap();
    let role = lambda_role(&mut app, stack, "Writer");
    alias.grant_encrypt(&mut app, &role).unwrap();

    let key_id = app.logical_id(key.resource().unwrap());
    let alias_id = app.logical_id(alias.resource().unwrap());
    let assembly = synthesize(&mut app).unwrap();
    let template = assembly.template("Vault").unwrap();

    let statements = key_statements(template, &key_id);
    let encrypt = statements
        .iter()
        .find(|s| has_action(s, ENCRYPT_ACTIONS[0]))
        .unwrap();
    for action in ENCRYPT_ACTIONS {
        assert!(has_action(encrypt, action), "missing {}", action);
    }

    let alias_resource = template.resource(&alias_id).unwrap();
    assert_eq!(alias_resource.resource_type, "AWS::KMS::Alias");
    let props = alias_resource.properties.as_ref().unwrap().as_object().unwrap();
    assert_eq!(
        props.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["AliasName", "TargetKeyId"]
    );
}

#[test]
fn test_pending_window_is_validated_at_the_key_path() {
    for (days, ok) in [(30, true), (31, false), (7, true), (6, false)] {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Vault", StackProps::default()).unwrap();
        Key::new(
            &mut app,
            stack,
            "Key",
            KeyProps {
                pending_window_days: Some(days),
                ..Default::default()
            },
        )
        .unwrap();

        match synthesize(&mut app) {
            Ok(assembly) => {
                assert!(ok, "pending window {} should fail", days);
                let (_, key) = assembly
                    .template("Vault")
                    .unwrap()
                    .resources_of_type(KEY_TYPE)
                    .next()
                    .unwrap();
                assert_eq!(key.property("PendingWindowInDays").unwrap(), &json!(days));
            }
            Err(err) => {
                assert!(!ok, "pending window {} should pass", days);
                assert_eq!(err.kind(), ErrorKind::ValidationFailure);
                assert!(err.to_string().contains("Vault/Key"));
            }
        }
    }
}

#[test]
fn test_rate_zero_is_a_validation_failure() {
    let err = "rate(0 minutes)".parse::<Schedule>().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert_eq!(err.exit_code(), 1);
    assert!(Schedule::rate(0, TimeUnit::Minute).is_err());
    assert_eq!(
        Schedule::rate(1, TimeUnit::Minute).unwrap().expression(),
        "rate(1 minute)"
    );
}

#[test]
fn test_context_miss_lists_query_keys_and_exits_with_2() {
    let mut app = App::new();
    let root = app.root();
    let stack = app
        .add_stack(root, "Lookup", stack_props(Some("111111111111"), false))
        .unwrap();
    Key::from_lookup(&mut app, stack, "Existing", "alias/app").unwrap();

    let err = synthesize(&mut app).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingContext);
    assert_eq!(err.exit_code(), 2);
    let message = err.to_string();
    assert!(message.contains("account=111111111111"));
    assert!(message.contains("aliasName=alias/app"));
    assert!(message.contains("region=us-east-1"));
}

#[test]
fn test_manifest_synthesis_is_byte_stable() {
    let manifest = AppManifest::from_yaml(
        r#"
stacks:
  - id: Shared
    constructs:
      - type: kms.Key
        id: Key
        props: { alias: alias/shared, enable_key_rotation: true }
      - type: sqs.Queue
        id: Jobs
        props: { encryption_key: Key, visibility_timeout_secs: 60 }
    nested:
      - id: Workers
        constructs:
          - type: iam.Role
            id: Worker
            props:
              assumed_by: { type: service, service: lambda.amazonaws.com }
grants:
  - grantee: Shared/Workers/Worker
    target: Shared/Jobs
    grant: consume
"#,
    )
    .unwrap();

    let render = || {
        let mut app = App::new();
        manifest.build(&mut app).unwrap();
        let assembly = synthesize(&mut app).unwrap();
        assembly
            .stack_names()
            .into_iter()
            .map(|name| assembly.template(name).unwrap().to_json_string().unwrap())
            .collect::<Vec<_>>()
    };
    let first = render();
    assert_eq!(first.len(), 2);
    assert_eq!(first, render());
}
