use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How backends are registered with a target group: node instances behind a
/// NodePort, or pod IPs directly.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Instance,
    Ip,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Instance => "instance",
            TargetType::Ip => "ip",
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(TargetType::Instance),
            "ip" => Ok(TargetType::Ip),
            other => Err(format!("unknown target type {other:?}")),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LbScheme {
    Internal,
    InternetFacing,
}

impl LbScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            LbScheme::Internal => "internal",
            LbScheme::InternetFacing => "internet-facing",
        }
    }
}

impl FromStr for LbScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(LbScheme::Internal),
            "internet-facing" => Ok(LbScheme::InternetFacing),
            other => Err(format!("unknown scheme {other:?}")),
        }
    }
}

impl fmt::Display for LbScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    Ipv4,
    Dualstack,
}

impl IpAddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpAddressType::Ipv4 => "ipv4",
            IpAddressType::Dualstack => "dualstack",
        }
    }
}

impl FromStr for IpAddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(IpAddressType::Ipv4),
            "dualstack" => Ok(IpAddressType::Dualstack),
            other => Err(format!("unknown ip address type {other:?}")),
        }
    }
}

/// A service port referenced by number or by name.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::Number(n) => write!(f, "{n}"),
            PortRef::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    pub name: String,
    pub port: PortRef,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkingProtocol {
    Tcp,
    Udp,
}

/// Source of traffic allowed to reach registered targets. Exactly one
/// variant per entry, mirroring the CRD's one-of shape.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum NetworkingPeer {
    #[serde(rename_all = "camelCase")]
    IpBlock { cidr: String },
    #[serde(rename_all = "camelCase")]
    SecurityGroup { group_id: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingPort {
    pub protocol: Option<NetworkingProtocol>,
    pub port: Option<PortRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct NetworkingIngressRule {
    pub from: Vec<NetworkingPeer>,
    pub ports: Vec<NetworkingPort>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct TargetGroupBindingNetworking {
    pub ingress: Vec<NetworkingIngressRule>,
}

/// Binds a Service's resolved endpoint set to an ALB target group. Created by
/// the ingress deployer, reconciled by the binding controller.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "elbv2.k8s.aws",
    version = "v1alpha1",
    kind = "TargetGroupBinding",
    plural = "targetgroupbindings",
    namespaced
)]
#[kube(status = "TargetGroupBindingStatus")]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupBindingSpec {
    pub target_group_arn: Option<String>,
    pub target_group_name: Option<String>,
    pub target_type: Option<TargetType>,
    pub service_ref: ServiceReference,
    #[serde(default)]
    pub multi_cluster_target_group: bool,
    pub networking: Option<TargetGroupBindingNetworking>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupBindingStatus {
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    pub match_labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct IngressGroup {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Cluster-scoped parameters attached to an IngressClass. Values here take
/// precedence over the equivalent per-Ingress annotations.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "elbv2.k8s.aws",
    version = "v1beta1",
    kind = "IngressClassParams",
    plural = "ingressclassparams"
)]
#[serde(rename_all = "camelCase")]
pub struct IngressClassParamsSpec {
    pub namespace_selector: Option<NamespaceSelector>,
    pub group: Option<IngressGroup>,
    pub scheme: Option<LbScheme>,
    pub ip_address_type: Option<IpAddressType>,
    pub tags: Option<Vec<KeyValuePair>>,
    pub load_balancer_attributes: Option<Vec<KeyValuePair>>,
}

/// Emits both CRDs as a multi-document YAML stream. schemars decorates the
/// generated schemas with `format` hints that OLM rejects, so the documents
/// are scrubbed of them first.
pub fn print_crds_without_formats() -> anyhow::Result<()> {
    for crd in [TargetGroupBinding::crd(), IngressClassParams::crd()] {
        let mut doc = serde_json::to_value(&crd)?;
        scrub_format_hints(&mut doc);
        println!("---");
        println!("{}", serde_yaml::to_string(&doc)?);
    }
    Ok(())
}

fn scrub_format_hints(node: &mut serde_json::Value) {
    match node {
        serde_json::Value::Object(fields) => {
            fields.remove("format");
            fields.values_mut().for_each(scrub_format_hints);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(scrub_format_hints),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn networking_peer_wire_shape() {
        let peer = NetworkingPeer::SecurityGroup {
            group_id: "sg-123".to_string(),
        };
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json, serde_json::json!({"securityGroup": {"groupId": "sg-123"}}));

        let ip: NetworkingPeer =
            serde_json::from_value(serde_json::json!({"ipBlock": {"cidr": "10.0.0.0/8"}})).unwrap();
        assert_eq!(
            ip,
            NetworkingPeer::IpBlock {
                cidr: "10.0.0.0/8".to_string()
            }
        );
    }

    #[test]
    fn port_ref_is_untagged() {
        let by_number: PortRef = serde_json::from_str("80").unwrap();
        assert_eq!(by_number, PortRef::Number(80));
        let by_name: PortRef = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(by_name, PortRef::Name("http".to_string()));
    }

    #[test]
    fn format_hints_are_scrubbed_at_any_depth() {
        let mut doc = serde_json::json!({
            "format": "int64",
            "properties": {
                "port": {"type": "integer", "format": "int32"},
                "items": [{"format": "date-time", "type": "string"}],
            },
        });
        scrub_format_hints(&mut doc);
        assert_eq!(
            doc,
            serde_json::json!({
                "properties": {
                    "port": {"type": "integer"},
                    "items": [{"type": "string"}],
                },
            })
        );
    }

    #[test]
    fn generated_crd_schema_carries_no_format_hints() {
        let mut doc = serde_json::to_value(TargetGroupBinding::crd()).unwrap();
        scrub_format_hints(&mut doc);
        assert!(!format!("{doc}").contains("\"format\""));
    }

    #[test]
    fn enums_round_trip_wire_values() {
        assert_eq!(
            serde_json::to_string(&LbScheme::InternetFacing).unwrap(),
            "\"internet-facing\""
        );
        assert_eq!(
            "internet-facing".parse::<LbScheme>().unwrap(),
            LbScheme::InternetFacing
        );
        assert_eq!(serde_json::to_string(&TargetType::Ip).unwrap(), "\"ip\"");
        assert_eq!("instance".parse::<TargetType>().unwrap(), TargetType::Instance);
        assert_eq!(
            serde_json::to_string(&IpAddressType::Dualstack).unwrap(),
            "\"dualstack\""
        );
    }
}
