//! # canopy_core
//!
//! Construct tree, tokens, stacks and the synthesis engine for canopy.
//!
//! An [`App`] owns an arena of constructs. Stacks group resources; resources
//! carry property bags that may embed tokens. At the end of construction,
//! [`synthesize`] links cross-stack references, runs validators and renders
//! one [`TemplateDocument`] per stack.
//!
//! # Architecture
//!
//! - **Construct tree**: [`App`], [`ConstructId`] handles, validators
//! - **Tokens**: string-encoded lazy values resolved per consuming stack
//! - **Stacks**: environments, parameters, outputs, nested stacks
//! - **Grants**: identity/resource policy mutations behind [`GrantStrategy`]
//! - **Linking**: exports, imports and cross-environment peers
//!
//! # Example
//!
//! ```rust
//! use canopy_core::{synthesize, App, ResourceNode, StackProps};
//!
//! let mut app = App::new();
//! let root = app.root();
//! let stack = app.add_stack(root, "Demo", StackProps::default()).unwrap();
//! app.add_resource(stack, "Queue", ResourceNode::new("AWS::SQS::Queue")).unwrap();
//!
//! let assembly = synthesize(&mut app).unwrap();
//! assert_eq!(assembly.template("Demo").unwrap().resources.len(), 1);
//! ```

pub mod app;
pub mod config;
pub mod construct;
pub mod context;
pub mod error;
pub mod flags;
pub mod grant;
pub mod linker;
pub mod logical_id;
pub mod resolve;
pub mod resource;
pub mod sink;
pub mod stack;
pub mod synth;
pub mod tags;
pub mod template;
pub mod token;

// Re-export main types for convenience
pub use app::{App, Diagnostic, DiagnosticLevel, Phase};
pub use config::{AppConfig, CONFIG_FILE, DEFAULT_OUTPUT_DIR};
pub use construct::{ConstructId, Node, NodeKind, PATH_SEPARATOR};
pub use context::{ContextProvider, ContextQuery, FileContextProvider, DEFAULT_CONTEXT_FILE};
pub use error::{CoreError, CoreResult, ErrorKind, MissingContext, ValidationFailure};
pub use flags::{
    FeatureFlag, EFS_DEFAULT_ENCRYPTION_AT_REST, EFS_DENY_ANONYMOUS_ACCESS,
    EVENTS_QUEUE_SAME_ACCOUNT, FEATURE_FLAGS, KMS_DEFAULT_KEY_POLICIES,
};
pub use grant::{
    Grant, GrantFacts, GrantMode, GrantPlan, GrantStrategy, GrantTarget, Grantee,
    IdentityFirstStrategy, ResourcePrincipal, StrictResourceStrategy,
};
pub use linker::{Linker, CROSS_REGION_WRITER_TYPE};
pub use logical_id::{make_logical_id, MAX_LOGICAL_ID_LENGTH};
pub use resolve::{ResolveContext, ResolveMode, Resolver};
pub use resource::{
    AttachedPolicy, PolicyRender, PolicySlot, RemovalPolicy, ResourceNode, TagFormat,
};
pub use sink::{DirectorySink, TemplateSink};
pub use stack::{
    Environment, NestedStackLink, NestedStackProps, Output, Parameter, StackData, StackProps,
    NESTED_STACK_TYPE,
};
pub use synth::{synthesize, template_property_name};
pub use tags::{TagOptions, DEFAULT_REMOVE_PRIORITY, DEFAULT_SET_PRIORITY};
pub use template::{
    AssemblyManifest, CloudAssembly, RenderedResource, StackArtifact, TemplateDocument,
};
pub use token::{contains_token, is_token, Token, TokenId, TokenKind};
