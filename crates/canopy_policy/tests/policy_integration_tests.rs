//! Integration tests for the policy document model.

use canopy_policy::{Conditions, Effect, PolicyDocument, PolicyStatement, Principal};
use serde_json::{json, Value};

const KEY_POLICY_YAML: &str = r#"
Version: "2012-10-17"
Statement:
  - Sid: AdminAccess
    Effect: Allow
    Action: "kms:*"
    Principal:
      AWS: "arn:aws:iam::111111111111:root"
    Resource: "*"
  - Effect: Allow
    Action:
      - kms:Decrypt
    Principal:
      Service: logs.amazonaws.com
    Resource: "*"
    Condition:
      ArnLike:
        "kms:EncryptionContext:aws:logs:arn": "arn:aws:logs:us-east-1:111111111111:*"
"#;

#[test]
fn test_document_parsed_from_yaml_renders_back() {
    let value: Value = serde_yaml::from_str(KEY_POLICY_YAML).unwrap();
    let doc = PolicyDocument::from_json(&value).unwrap();

    assert_eq!(doc.len(), 2);
    assert_eq!(doc.statements()[0].sid.as_deref(), Some("AdminAccess"));
    assert_eq!(
        doc.statements()[0].principals,
        vec![Principal::account_root("111111111111")]
    );
    assert!(doc.validate_for_resource_policy().is_valid());

    let rendered = doc.to_json().unwrap();
    assert_eq!(rendered["Version"], json!("2012-10-17"));
    assert_eq!(rendered["Statement"][1]["Principal"], json!({"Service": "logs.amazonaws.com"}));
}

#[test]
fn test_grants_to_same_principal_render_as_one_statement() {
    let role = Principal::role("arn:aws:iam::111111111111:role/app");
    let mut doc = PolicyDocument::new();
    doc.add_statement(
        PolicyStatement::allow()
            .with_actions(["kms:Encrypt", "kms:ReEncrypt*"])
            .with_principal(role.clone())
            .with_resources(["*"]),
    );
    doc.add_statement(
        PolicyStatement::allow()
            .with_actions(["kms:Decrypt"])
            .with_principal(role)
            .with_resources(["*"]),
    );

    let rendered = doc.to_json().unwrap();
    let statements = rendered["Statement"].as_array().unwrap();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0]["Action"],
        json!(["kms:Encrypt", "kms:ReEncrypt*", "kms:Decrypt"])
    );
}

#[test]
fn test_statements_differing_by_condition_stay_separate() {
    let mut conditions = Conditions::new();
    conditions.add("StringEquals", "aws:SourceAccount", json!("111111111111"));

    let plain = PolicyStatement::allow()
        .with_actions(["sqs:SendMessage"])
        .with_principal(Principal::service("events.amazonaws.com"))
        .with_resources(["arn:aws:sqs:us-east-1:111111111111:jobs"]);
    let conditioned = PolicyStatement::allow()
        .with_actions(["sqs:GetQueueUrl"])
        .with_principal(Principal::service("events.amazonaws.com").with_conditions(conditions))
        .with_resources(["arn:aws:sqs:us-east-1:111111111111:jobs"]);

    let doc = PolicyDocument::from_statements([plain, conditioned]);
    assert_eq!(doc.minimized().len(), 2);
}

#[test]
fn test_merge_preserves_order_and_skips_duplicates() {
    let first = PolicyStatement::allow()
        .with_actions(["a:One"])
        .with_principal(Principal::Any)
        .with_resources(["*"]);
    let second = PolicyStatement::deny()
        .with_actions(["a:Two"])
        .with_principal(Principal::Any)
        .with_resources(["*"]);

    let mut left = PolicyDocument::from_statements([first.clone()]);
    let right = PolicyDocument::from_statements([first, second]);
    left.merge(&right);

    assert_eq!(left.len(), 2);
    assert_eq!(left.statements()[1].effect, Effect::Deny);
}

#[test]
fn test_statement_without_principal_or_resource_is_invalid() {
    let doc = PolicyDocument::from_statements([PolicyStatement::allow().with_actions(["s3:GetObject"])]);
    let result = doc.validate_for_any_policy();
    assert_eq!(result.errors.len(), 1);
}
