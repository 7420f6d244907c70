//! Declarative desired-state model of one ingress group's ALB topology.
//! Built fresh each reconcile cycle; the deployer diffs it against observed
//! AWS state.

pub mod builder;
pub mod naming;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crd::{IpAddressType, LbScheme, PortRef, TargetType};
use crate::endpoints::ServiceRef;

/// Marker tag on controller-created resources.
pub const RESOURCE_TAG: &str = "ingress.k8s.aws/resource";
/// Tag carrying the group ID on every resource of the stack.
pub const STACK_TAG: &str = "ingress.k8s.aws/stack";
/// Cluster ownership values recognized during discovery.
pub const OWNED: &str = "owned";
pub const SHARED: &str = "shared";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete desired topology for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub load_balancer: LoadBalancerSpec,
    pub listeners: Vec<ListenerSpec>,
    pub target_groups: Vec<TargetGroupSpec>,
    /// Desired TargetGroupBinding CRs, one per target group.
    pub bindings: Vec<BindingSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub scheme: LbScheme,
    pub ip_address_type: IpAddressType,
    /// Resolved subnet IDs, one per AZ, ordered by AZ.
    pub subnets: Vec<String>,
    pub security_groups: SecurityGroupConfig,
    pub tags: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SecurityGroupConfig {
    /// User-supplied security group IDs; the controller never mutates them.
    Explicit(Vec<String>),
    /// Controller-provisioned frontend SG plus the rules it must carry.
    Managed(ManagedSecurityGroup),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagedSecurityGroup {
    pub name: String,
    /// Client-facing permissions, one per listener port and peer.
    pub ingress: Vec<SgRule>,
    pub tags: BTreeMap<String, String>,
    /// Worker-node SG permissions granting LB-to-target traffic, keyed by the
    /// frontend SG as the referenced source group.
    pub target_ingress: Vec<SgRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SgRule {
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub peer: SgPeer,
}

/// Traffic source of a derived security-group rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SgPeer {
    IpBlock(String),
    /// The managed frontend SG itself (resolved to an ID at deploy time).
    FrontendSg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSpec {
    pub port: i32,
    pub protocol: Protocol,
    pub ssl_policy: Option<String>,
    /// Primary certificate first, additional certificates after.
    pub certificates: Vec<String>,
    pub default_actions: Vec<Action>,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleCondition {
    Host(Vec<String>),
    Path(Vec<String>),
    HttpHeader { name: String, values: Vec<String> },
    QueryString(Vec<(String, String)>),
    HttpRequestMethod(Vec<String>),
    SourceIp(Vec<String>),
}

/// Listener actions as a tagged sum with exhaustive handling. Authenticate
/// variants are only valid ahead of a terminal action on an HTTPS listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Forward(TargetGroupKey),
    ForwardArn(String),
    Redirect(RedirectSpec),
    FixedResponse(FixedResponseSpec),
    AuthenticateCognito(CognitoAuthSpec),
    AuthenticateOidc(OidcAuthSpec),
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Action::AuthenticateCognito(_) | Action::AuthenticateOidc(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectSpec {
    pub protocol: Option<String>,
    pub port: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    pub status_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixedResponseSpec {
    pub content_type: Option<String>,
    pub message_body: Option<String>,
    pub status_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitoAuthSpec {
    #[serde(rename = "userPoolARN")]
    pub user_pool_arn: String,
    #[serde(rename = "userPoolClientID")]
    pub user_pool_client_id: String,
    pub user_pool_domain: String,
    #[serde(default)]
    pub authentication_request_extra_params: BTreeMap<String, String>,
    #[serde(skip)]
    pub session: AuthSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcAuthSpec {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub user_info_endpoint: String,
    /// Loaded from the referenced Secret in the Ingress namespace.
    pub client_id: String,
    pub client_secret: String,
    pub session: AuthSession,
}

/// Shared auth session knobs from the `auth-*` annotations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthSession {
    pub on_unauthenticated_request: Option<String>,
    pub scope: Option<String>,
    pub session_cookie: Option<String>,
    pub session_timeout: Option<i64>,
}

/// Identity of a target group within the model: the backend tuple it serves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetGroupKey {
    pub service: ServiceRef,
    pub port: PortRef,
    pub target_type: TargetType,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroupSpec {
    pub key: TargetGroupKey,
    /// Stable hashed name, the pairing identity against observed state.
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub health_check: HealthCheckSpec,
    pub attributes: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub path: String,
    /// `traffic-port` or an explicit numeric port.
    pub port: String,
    pub protocol: Protocol,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    /// HTTP matcher codes, e.g. `200` or `200-399`.
    pub matcher: String,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        HealthCheckSpec {
            path: "/".to_string(),
            port: "traffic-port".to_string(),
            protocol: Protocol::Http,
            interval_seconds: 15,
            timeout_seconds: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            matcher: "200".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingSpec {
    pub service: ServiceRef,
    pub port: PortRef,
    pub target_type: TargetType,
    pub target_group_name: String,
}

/// Wire form of the `actions.<svc>` annotation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ActionAnnotation {
    #[serde(rename = "forward", rename_all = "camelCase")]
    Forward {
        #[serde(rename = "targetGroupARN")]
        target_group_arn: Option<String>,
        forward_config: Option<ForwardConfigAnnotation>,
    },
    #[serde(rename = "redirect", rename_all = "camelCase")]
    Redirect { redirect_config: RedirectSpec },
    #[serde(rename = "fixed-response", rename_all = "camelCase")]
    FixedResponse {
        fixed_response_config: FixedResponseSpec,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardConfigAnnotation {
    pub target_groups: Vec<ForwardTargetAnnotation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardTargetAnnotation {
    pub service_name: Option<String>,
    pub service_port: Option<PortRef>,
    #[serde(rename = "targetGroupARN")]
    pub target_group_arn: Option<String>,
}

/// Wire form of the `conditions.<svc>` annotation (a JSON array).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", tag = "field")]
pub enum ConditionAnnotation {
    #[serde(rename = "host-header", rename_all = "camelCase")]
    HostHeader { host_header_config: ValuesConfig },
    #[serde(rename = "path-pattern", rename_all = "camelCase")]
    PathPattern { path_pattern_config: ValuesConfig },
    #[serde(rename = "http-header", rename_all = "camelCase")]
    HttpHeader { http_header_config: HttpHeaderConfig },
    #[serde(rename = "query-string", rename_all = "camelCase")]
    QueryString { query_string_config: QueryStringConfig },
    #[serde(rename = "http-request-method", rename_all = "camelCase")]
    HttpRequestMethod {
        http_request_method_config: ValuesConfig,
    },
    #[serde(rename = "source-ip", rename_all = "camelCase")]
    SourceIp { source_ip_config: ValuesConfig },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValuesConfig {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderConfig {
    pub http_header_name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStringConfig {
    pub values: Vec<QueryStringPair>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryStringPair {
    pub key: Option<String>,
    pub value: String,
}

/// Wire form of `auth-idp-oidc`: endpoints plus the Secret carrying the
/// client credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcIdpAnnotation {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub user_info_endpoint: String,
    pub secret_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn action_annotation_parses_forward() {
        let parsed: ActionAnnotation = serde_json::from_str(
            r#"{"type":"forward","forwardConfig":{"targetGroups":[{"serviceName":"web","servicePort":80}]}}"#,
        )
        .unwrap();
        match parsed {
            ActionAnnotation::Forward { forward_config, .. } => {
                let tgs = forward_config.unwrap().target_groups;
                assert_eq!(tgs.len(), 1);
                assert_eq!(tgs[0].service_name.as_deref(), Some("web"));
                assert_eq!(tgs[0].service_port, Some(PortRef::Number(80)));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn action_annotation_parses_redirect() {
        let parsed: ActionAnnotation = serde_json::from_str(
            r#"{"type":"redirect","redirectConfig":{"protocol":"HTTPS","port":"443","statusCode":"HTTP_301"}}"#,
        )
        .unwrap();
        match parsed {
            ActionAnnotation::Redirect { redirect_config } => {
                assert_eq!(redirect_config.protocol.as_deref(), Some("HTTPS"));
                assert_eq!(redirect_config.status_code, "HTTP_301");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn condition_annotation_parses_header_field() {
        let parsed: Vec<ConditionAnnotation> = serde_json::from_str(
            r#"[{"field":"http-header","httpHeaderConfig":{"httpHeaderName":"X-Env","values":["prod"]}}]"#,
        )
        .unwrap();
        match &parsed[0] {
            ConditionAnnotation::HttpHeader { http_header_config } => {
                assert_eq!(http_header_config.http_header_name, "X-Env");
                assert_eq!(http_header_config.values, vec!["prod".to_string()]);
            }
            other => panic!("unexpected condition {other:?}"),
        }
    }

    #[test]
    fn authenticate_actions_are_not_terminal() {
        let auth = Action::AuthenticateCognito(CognitoAuthSpec {
            user_pool_arn: "arn:pool".to_string(),
            user_pool_client_id: "client".to_string(),
            user_pool_domain: "domain".to_string(),
            authentication_request_extra_params: BTreeMap::new(),
            session: AuthSession::default(),
        });
        assert!(!auth.is_terminal());
        assert!(Action::Redirect(RedirectSpec::default()).is_terminal());
    }
}
