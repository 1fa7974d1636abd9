//! Integration tests for linking and synthesis across stacks.

use std::collections::BTreeMap;

use canopy_core::{
    synthesize, App, AppConfig, CloudAssembly, ConstructId, ContextQuery, Environment,
    ErrorKind, FileContextProvider, GrantTarget, Grantee, NestedStackProps, PolicyRender,
    PolicySlot, ResourceNode, StackProps, CROSS_REGION_WRITER_TYPE, KMS_DEFAULT_KEY_POLICIES,
};
use canopy_policy::Principal;
use serde_json::{json, Value};

fn stack_in(app: &mut App, id: &str, env: Environment) -> ConstructId {
    let root = app.root();
    app.add_stack(
        root,
        id,
        StackProps {
            env,
            ..Default::default()
        },
    )
    .unwrap()
}

fn key_node() -> ResourceNode {
    ResourceNode::new("AWS::KMS::Key").with_policy(
        PolicySlot::Resource,
        PolicyRender::Property("keyPolicy".to_string()),
        false,
    )
}

fn role_node() -> ResourceNode {
    ResourceNode::new("AWS::IAM::Role").with_policy(
        PolicySlot::Identity,
        PolicyRender::InlinePolicies {
            policy_name: "DefaultPolicy".to_string(),
        },
        false,
    )
}

fn property<'a>(assembly: &'a CloudAssembly, stack: &str, logical_id: &str, key: &str) -> &'a Value {
    assembly
        .template(stack)
        .unwrap()
        .resource(logical_id)
        .unwrap()
        .property(key)
        .unwrap()
}

#[test]
fn test_cross_stack_reference_exports_once() {
    let mut app = App::new();
    let producer = stack_in(&mut app, "Producer", Environment::agnostic());
    let consumer = stack_in(&mut app, "Consumer", Environment::agnostic());

    let key = app.add_resource(producer, "Key", key_node()).unwrap();
    let arn = app.get_att(key, "Arn");
    let first = app
        .add_resource(consumer, "First", ResourceNode::new("T::First").with_property("keyArn", arn.clone()))
        .unwrap();
    let second = app
        .add_resource(consumer, "Second", ResourceNode::new("T::Second").with_property("keyArn", arn))
        .unwrap();
    let key_id = app.logical_id(key);
    let (first_id, second_id) = (app.logical_id(first), app.logical_id(second));

    let assembly = synthesize(&mut app).unwrap();

    let export_name = format!("Producer:ExportsOutputFnGetAtt{}Arn", key_id);
    let outputs = &assembly.template("Producer").unwrap().outputs;
    assert_eq!(outputs.len(), 1);
    let output = &outputs[&format!("ExportsOutputFnGetAtt{}Arn", key_id)];
    assert_eq!(output["Value"], json!({"Fn::GetAtt": [key_id, "Arn"]}));
    assert_eq!(output["Export"]["Name"], json!(export_name));

    let import = json!({"Fn::ImportValue": export_name});
    assert_eq!(property(&assembly, "Consumer", &first_id, "KeyArn"), &import);
    assert_eq!(property(&assembly, "Consumer", &second_id, "KeyArn"), &import);

    let artifact = assembly.artifact("Consumer").unwrap();
    assert_eq!(artifact.dependencies, vec!["Producer".to_string()]);
    assert_eq!(artifact.imports, vec![export_name.clone()]);
    assert_eq!(assembly.artifact("Producer").unwrap().exports, vec![export_name]);
}

#[test]
fn test_reference_embedded_in_string_joins() {
    let mut app = App::new();
    let producer = stack_in(&mut app, "Producer", Environment::agnostic());
    let consumer = stack_in(&mut app, "Consumer", Environment::agnostic());
    let queue = app
        .add_resource(producer, "Queue", ResourceNode::new("AWS::SQS::Queue"))
        .unwrap();
    let name = app.get_att(queue, "QueueName");
    let user = app
        .add_resource(
            consumer,
            "User",
            ResourceNode::new("T::User").with_property("label", format!("queue-{}-main", name)),
        )
        .unwrap();
    let queue_id = app.logical_id(queue);
    let user_id = app.logical_id(user);

    let assembly = synthesize(&mut app).unwrap();
    let export_name = format!("Producer:ExportsOutputFnGetAtt{}QueueName", queue_id);
    assert_eq!(
        property(&assembly, "Consumer", &user_id, "Label"),
        &json!({"Fn::Join": ["", ["queue-", {"Fn::ImportValue": export_name}, "-main"]]})
    );
}

#[test]
fn test_nested_stack_outputs_flow_to_parent() {
    let mut app = App::new();
    let parent = stack_in(&mut app, "Parent", Environment::agnostic());
    let nested = app
        .add_nested_stack(parent, "Storage", NestedStackProps::default())
        .unwrap();
    let bucket = app
        .add_resource(nested, "Bucket", ResourceNode::new("AWS::S3::Bucket"))
        .unwrap();
    let bucket_ref = app.ref_token(bucket);
    let reader = app
        .add_resource(parent, "Reader", ResourceNode::new("T::Reader").with_property("bucket", bucket_ref))
        .unwrap();
    let bucket_id = app.logical_id(bucket);
    let reader_id = app.logical_id(reader);
    let link = app.stack(nested).unwrap().nested().unwrap();
    let nested_resource_id = app.logical_id(link.resource);

    let assembly = synthesize(&mut app).unwrap();

    assert_eq!(app.stack(nested).unwrap().name(), "Parent-Storage");
    let output_name = format!("Ref{}", bucket_id);
    let nested_template = assembly.template("Parent-Storage").unwrap();
    assert_eq!(nested_template.outputs[&output_name]["Value"], json!({"Ref": bucket_id}));
    assert!(nested_template.outputs[&output_name].get("Export").is_none());

    assert_eq!(
        property(&assembly, "Parent", &reader_id, "Bucket"),
        &json!({"Fn::GetAtt": [nested_resource_id, format!("Outputs.{}", output_name)]})
    );
    assert_eq!(
        property(&assembly, "Parent", &nested_resource_id, "TemplateURL"),
        &json!("Parent-Storage.template.json")
    );
    assert_eq!(
        assembly.artifact("Parent-Storage").unwrap().nested_parent.as_deref(),
        Some("Parent")
    );
    assert!(assembly.artifact("Parent").unwrap().imports.is_empty());
}

#[test]
fn test_nested_stack_receives_parent_values_as_parameters() {
    let mut app = App::new();
    let parent = stack_in(&mut app, "Parent", Environment::agnostic());
    let topic = app
        .add_resource(parent, "Topic", ResourceNode::new("AWS::SNS::Topic"))
        .unwrap();
    let nested = app
        .add_nested_stack(parent, "Workers", NestedStackProps::default())
        .unwrap();
    let topic_ref = app.ref_token(topic);
    let worker = app
        .add_resource(nested, "Worker", ResourceNode::new("T::Worker").with_property("topic", topic_ref))
        .unwrap();
    let topic_id = app.logical_id(topic);
    let worker_id = app.logical_id(worker);
    let nested_resource_id = app.logical_id(app.stack(nested).unwrap().nested().unwrap().resource);

    let assembly = synthesize(&mut app).unwrap();

    let parameter = format!("referencetoParentRef{}", topic_id);
    let nested_template = assembly.template("Parent-Workers").unwrap();
    assert_eq!(nested_template.parameters[&parameter], json!({"Type": "String"}));
    assert_eq!(
        property(&assembly, "Parent-Workers", &worker_id, "Topic"),
        &json!({"Ref": parameter})
    );
    assert_eq!(
        property(&assembly, "Parent", &nested_resource_id, "Parameters"),
        &json!({ parameter: {"Ref": topic_id} })
    );
}

#[test]
fn test_cross_region_reference_uses_writer_stack() {
    let mut app = App::new();
    let producer = stack_in(&mut app, "Producer", Environment::new("111111111111", "us-east-1"));
    let consumer = stack_in(&mut app, "Consumer", Environment::new("111111111111", "eu-west-1"));
    let key = app.add_resource(producer, "Key", key_node()).unwrap();
    let arn = app.get_att(key, "Arn");
    let user = app
        .add_resource(consumer, "User", ResourceNode::new("T::User").with_property("keyArn", arn))
        .unwrap();
    let key_id = app.logical_id(key);
    let user_id = app.logical_id(user);

    let assembly = synthesize(&mut app).unwrap();

    let parameter = format!("/canopy/exports/Consumer/Producer-FnGetAtt{}Arn", key_id);
    assert_eq!(
        property(&assembly, "Consumer", &user_id, "KeyArn"),
        &json!(format!("{{{{resolve:ssm:{}}}}}", parameter))
    );

    let side_name = "Producer-CrossRegionExports-eu-west-1";
    let side = assembly.template(side_name).unwrap();
    let writers: Vec<_> = side.resources_of_type(CROSS_REGION_WRITER_TYPE).collect();
    assert_eq!(writers.len(), 1);
    let props = writers[0].1.property("WriterProps").unwrap();
    assert_eq!(props["region"], json!("eu-west-1"));
    assert_eq!(
        props["exports"][&parameter],
        json!({"Fn::ImportValue": format!("Producer:ExportsOutputFnGetAtt{}Arn", key_id)})
    );

    assert_eq!(
        assembly.artifact("Consumer").unwrap().dependencies,
        vec![side_name.to_string()]
    );
    assert_eq!(
        assembly.artifact(side_name).unwrap().dependencies,
        vec!["Producer".to_string()]
    );
    assert!(assembly.artifact("Consumer").unwrap().imports.is_empty());
}

#[test]
fn test_cross_account_reference_needs_physical_name() {
    let mut app = App::new();
    let producer = stack_in(&mut app, "Producer", Environment::new("111111111111", "us-east-1"));
    let consumer = stack_in(&mut app, "Consumer", Environment::new("222222222222", "us-east-1"));
    let queue = app
        .add_resource(producer, "Queue", ResourceNode::new("AWS::SQS::Queue"))
        .unwrap();
    let arn = app.get_att(queue, "Arn");
    app.add_resource(consumer, "User", ResourceNode::new("T::User").with_property("queueArn", arn))
        .unwrap();

    let err = synthesize(&mut app).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert!(err.to_string().contains("physical name"));
}

#[test]
fn test_cross_account_reference_uses_physical_value() {
    let physical = "arn:aws:sqs:us-east-1:111111111111:orders";
    let mut app = App::new();
    let producer = stack_in(&mut app, "Producer", Environment::new("111111111111", "us-east-1"));
    let consumer = stack_in(&mut app, "Consumer", Environment::new("222222222222", "us-east-1"));
    let queue = app
        .add_resource(
            producer,
            "Queue",
            ResourceNode::new("AWS::SQS::Queue")
                .with_property("queueName", "orders")
                .with_physical_name("orders")
                .with_cross_env_attribute("Arn", physical),
        )
        .unwrap();
    let arn = app.get_att(queue, "Arn");
    let user = app
        .add_resource(consumer, "User", ResourceNode::new("T::User").with_property("queueArn", arn))
        .unwrap();
    let user_id = app.logical_id(user);

    let assembly = synthesize(&mut app).unwrap();
    assert_eq!(property(&assembly, "Consumer", &user_id, "QueueArn"), &json!(physical));
    assert!(assembly.template("Producer").unwrap().outputs.is_empty());
    assert_eq!(
        assembly.artifact("Consumer").unwrap().dependencies,
        vec!["Producer".to_string()]
    );
}

#[test]
fn test_agnostic_to_concrete_reference_is_unknown_environment() {
    let mut app = App::new();
    let producer = stack_in(&mut app, "Producer", Environment::agnostic());
    let consumer = stack_in(&mut app, "Consumer", Environment::new("111111111111", "us-east-1"));
    let queue = app
        .add_resource(producer, "Queue", ResourceNode::new("AWS::SQS::Queue"))
        .unwrap();
    let arn = app.get_att(queue, "Arn");
    app.add_resource(consumer, "User", ResourceNode::new("T::User").with_property("queueArn", arn))
        .unwrap();

    let err = synthesize(&mut app).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownEnvironment);
    assert_eq!(err.exit_code(), 4);
}

#[test]
fn test_missing_context_fails_before_rendering() {
    let mut app = App::new();
    let stack = stack_in(&mut app, "Lookups", Environment::new("111111111111", "us-east-1"));
    let value = app
        .lookup_context(stack, ContextQuery::new("availability-zones"), json!(["dummy-1a"]))
        .unwrap();
    assert_eq!(value, json!(["dummy-1a"]));

    let err = synthesize(&mut app).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingContext);
    assert_eq!(err.exit_code(), 2);
    assert!(err
        .to_string()
        .contains("availability-zones:account=111111111111:region=us-east-1"));
}

#[test]
fn test_cached_context_is_used() {
    let mut values = BTreeMap::new();
    values.insert(
        "availability-zones:account=111111111111:region=us-east-1".to_string(),
        json!(["us-east-1a", "us-east-1b"]),
    );
    let mut app = App::new();
    app.set_context_provider(Box::new(FileContextProvider::from_values(values)));
    let stack = stack_in(&mut app, "Lookups", Environment::new("111111111111", "us-east-1"));
    let value = app
        .lookup_context(stack, ContextQuery::new("availability-zones"), json!(["dummy-1a"]))
        .unwrap();
    assert_eq!(value, json!(["us-east-1a", "us-east-1b"]));
    assert!(synthesize(&mut app).is_ok());
}

fn build_app(reversed: bool) -> CloudAssembly {
    let mut app = App::new();
    let shared = stack_in(&mut app, "Shared", Environment::agnostic());
    let service = stack_in(&mut app, "Service", Environment::agnostic());

    let mut ids = vec!["Alpha", "Beta", "Gamma"];
    if reversed {
        ids.reverse();
    }
    let mut queues = BTreeMap::new();
    for id in ids {
        let queue = app
            .add_resource(shared, id, ResourceNode::new("AWS::SQS::Queue").with_property("queueName", id))
            .unwrap();
        queues.insert(id, queue);
    }
    for (id, queue) in &queues {
        let arn = app.get_att(*queue, "Arn");
        app.add_resource(
            service,
            &format!("{}Reader", id),
            ResourceNode::new("T::Reader").with_property("source", arn),
        )
        .unwrap();
    }
    synthesize(&mut app).unwrap()
}

#[test]
fn test_synthesis_is_byte_identical_across_runs() {
    let first = build_app(false);
    let second = build_app(false);
    for name in first.stack_names() {
        assert_eq!(
            first.template(name).unwrap().to_json_string().unwrap(),
            second.template(name).unwrap().to_json_string().unwrap()
        );
    }
    assert_eq!(first.manifest, second.manifest);
}

#[test]
fn test_declaration_order_does_not_change_templates() {
    let forward = build_app(false);
    let reversed = build_app(true);
    for name in ["Shared", "Service"] {
        assert_eq!(
            forward.template(name).unwrap().to_json().unwrap(),
            reversed.template(name).unwrap().to_json().unwrap()
        );
    }
}

#[test]
fn test_strict_grant_same_stack_merges_into_key_policy() {
    let mut app = App::new();
    let stack = stack_in(&mut app, "Secure", Environment::agnostic());
    let key = app.add_resource(stack, "Key", key_node()).unwrap();
    let role = app.add_resource(stack, "Role", role_node()).unwrap();
    let role_arn = app.get_att(role, "Arn");
    let key_arn = app.get_att(key, "Arn");

    let grantee = Grantee::with_identity(Principal::role(role_arn), role);
    let target = GrantTarget::Owned {
        resource: key,
        policy_holder: Some(key),
        arns: vec![key_arn],
        policy_resources: vec!["*".to_string()],
    };
    app.grant(&grantee, &target, &["kms:Decrypt"]).unwrap().assert_success().unwrap();
    app.grant(&grantee, &target, &["kms:Encrypt"]).unwrap().assert_success().unwrap();
    let key_id = app.logical_id(key);
    let role_id = app.logical_id(role);

    let assembly = synthesize(&mut app).unwrap();
    assert_eq!(
        property(&assembly, "Secure", &key_id, "KeyPolicy"),
        &json!({
            "Statement": [{
                "Action": ["kms:Decrypt", "kms:Encrypt"],
                "Effect": "Allow",
                "Principal": {"AWS": {"Fn::GetAtt": [role_id.clone(), "Arn"]}},
                "Resource": "*"
            }],
            "Version": "2012-10-17"
        })
    );
    let role_resource = assembly.template("Secure").unwrap().resource(&role_id).unwrap();
    assert!(role_resource.property("Policies").is_none());
}

#[test]
fn test_identity_first_grant_lands_on_role() {
    let config = AppConfig::default().with_flag(KMS_DEFAULT_KEY_POLICIES, true);
    let mut app = App::with_config(config);
    let stack = stack_in(&mut app, "Secure", Environment::agnostic());
    let key = app.add_resource(stack, "Key", key_node()).unwrap();
    let role = app.add_resource(stack, "Role", role_node()).unwrap();
    let role_arn = app.get_att(role, "Arn");
    let key_arn = app.get_att(key, "Arn");

    let grantee = Grantee::with_identity(Principal::role(role_arn), role);
    let target = GrantTarget::Owned {
        resource: key,
        policy_holder: Some(key),
        arns: vec![key_arn],
        policy_resources: vec!["*".to_string()],
    };
    let grant = app.grant(&grantee, &target, &["kms:Decrypt"]).unwrap();
    assert!(grant.success);
    assert!(grant.resource_statement.is_none());
    let key_id = app.logical_id(key);
    let role_id = app.logical_id(role);

    let assembly = synthesize(&mut app).unwrap();
    assert_eq!(
        property(&assembly, "Secure", &role_id, "Policies"),
        &json!([{
            "PolicyName": "DefaultPolicy",
            "PolicyDocument": {
                "Statement": [{
                    "Action": "kms:Decrypt",
                    "Effect": "Allow",
                    "Resource": {"Fn::GetAtt": [key_id.clone(), "Arn"]}
                }],
                "Version": "2012-10-17"
            }
        }])
    );
    let key_resource = assembly.template("Secure").unwrap().resource(&key_id).unwrap();
    assert!(key_resource.property("KeyPolicy").is_none());
}

#[test]
fn test_strict_grant_across_stacks_falls_back_to_account_root_for_token_grantee() {
    let mut app = App::new();
    let keys = stack_in(&mut app, "Keys", Environment::new("111111111111", "us-east-1"));
    let roles = stack_in(&mut app, "Roles", Environment::new("111111111111", "us-east-1"));
    let key = app.add_resource(keys, "Key", key_node()).unwrap();
    let role = app.add_resource(roles, "Role", role_node()).unwrap();
    let role_arn = app.get_att(role, "Arn");
    let key_arn = app.get_att(key, "Arn");

    let grantee = Grantee::with_identity(Principal::role(role_arn), role);
    let target = GrantTarget::Owned {
        resource: key,
        policy_holder: Some(key),
        arns: vec![key_arn],
        policy_resources: vec!["*".to_string()],
    };
    let grant = app.grant(&grantee, &target, &["kms:Decrypt"]).unwrap();
    assert!(grant.principal_statement.is_some());
    let key_id = app.logical_id(key);

    let assembly = synthesize(&mut app).unwrap();
    let policy = property(&assembly, "Keys", &key_id, "KeyPolicy");
    assert_eq!(
        policy["Statement"][0]["Principal"],
        json!({"AWS": "arn:aws:iam::111111111111:root"})
    );
    assert_eq!(
        assembly.artifact("Roles").unwrap().dependencies,
        vec!["Keys".to_string()]
    );
    assert!(assembly.artifact("Keys").unwrap().dependencies.is_empty());
}

#[test]
fn test_strict_grant_across_stacks_names_a_literal_grantee() {
    let mut app = App::new();
    let keys = stack_in(&mut app, "Keys", Environment::new("111111111111", "us-east-1"));
    let roles = stack_in(&mut app, "Roles", Environment::new("111111111111", "us-east-1"));
    let key = app.add_resource(keys, "Key", key_node()).unwrap();
    let role = app.add_resource(roles, "Role", role_node()).unwrap();
    let key_arn = app.get_att(key, "Arn");
    let role_arn = "arn:aws:iam::111111111111:role/reader";

    let grantee = Grantee::with_identity(Principal::role(role_arn), role);
    let target = GrantTarget::Owned {
        resource: key,
        policy_holder: Some(key),
        arns: vec![key_arn],
        policy_resources: vec!["*".to_string()],
    };
    let grant = app.grant(&grantee, &target, &["kms:Decrypt"]).unwrap();
    assert!(grant.success);
    assert!(grant.principal_statement.is_none());
    let key_id = app.logical_id(key);

    let assembly = synthesize(&mut app).unwrap();
    let policy = property(&assembly, "Keys", &key_id, "KeyPolicy");
    assert_eq!(
        policy["Statement"][0],
        json!({
            "Action": "kms:Decrypt",
            "Effect": "Allow",
            "Principal": {"AWS": role_arn},
            "Resource": "*"
        })
    );
    assert!(assembly.artifact("Roles").unwrap().dependencies.is_empty());
}

#[test]
fn test_unresolved_grant_warns_and_succeeds() {
    let mut app = App::new();
    let stack = stack_in(&mut app, "Secure", Environment::agnostic());
    let role = app.add_resource(stack, "Role", role_node()).unwrap();
    let alias = app.add_construct(stack, "AliasByName").unwrap();
    let grantee = Grantee::with_identity(Principal::service("lambda.amazonaws.com"), role);
    let target = GrantTarget::Unresolved {
        scope: alias,
        reason: "the alias target is not known".to_string(),
    };

    let grant = app.grant(&grantee, &target, &["kms:Decrypt"]).unwrap();
    assert!(grant.success);
    assert!(grant.principal_statement.is_none());
    assert_eq!(app.warnings().len(), 1);
    assert_eq!(app.warnings()[0].path, "Secure/AliasByName");
}

#[test]
fn test_grant_without_any_policy_fails_assertion() {
    let mut app = App::new();
    let stack = stack_in(&mut app, "Secure", Environment::agnostic());
    let bucket = app
        .add_resource(stack, "Bucket", ResourceNode::new("AWS::S3::Bucket"))
        .unwrap();
    let grantee = Grantee::principal(Principal::service("logs.amazonaws.com"));
    let target = GrantTarget::Imported {
        scope: bucket,
        arns: vec!["arn:aws:s3:::external".to_string()],
    };
    let grant = app.grant(&grantee, &target, &["s3:GetObject"]).unwrap();
    assert!(!grant.success);
    let err = grant.assert_success().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
}
