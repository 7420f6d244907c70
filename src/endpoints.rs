use std::fmt;

use k8s_openapi::api::core::v1::{Endpoints, Node, Service, ServicePort};
use kube::{Api, Client, api::ListParams};
use tracing::debug;

use crate::crd::{PortRef, TargetType};
use crate::error::{Error, Result};

pub const EXCLUDE_BALANCER_LABEL: &str = "alpha.service-controller.kubernetes.io/exclude-balancer";

const EXCLUDING_TAINTS: &[&str] = &[
    "node.kubernetes.io/unreachable",
    "node.kubernetes.io/not-ready",
];

/// A single ALB registration target: pod IP or EC2 instance ID, plus port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub id: String,
    pub port: i32,
}

impl Target {
    pub fn new(id: impl Into<String>, port: i32) -> Self {
        Target {
            id: id.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ServiceRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A node takes traffic only while Ready, schedulable, not carrying an
/// excluding taint, and not opted out via the exclude-balancer label.
pub fn is_node_suitable(node: &Node) -> bool {
    if let Some(spec) = &node.spec {
        if spec.unschedulable.unwrap_or(false) {
            return false;
        }
        for taint in spec.taints.iter().flatten() {
            if EXCLUDING_TAINTS.contains(&taint.key.as_str()) {
                return false;
            }
        }
    }
    if node
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(EXCLUDE_BALANCER_LABEL))
    {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Extracts the EC2 instance ID from a node's providerID
/// (`aws:///us-west-2a/i-0abc...`).
pub fn node_instance_id(node: &Node) -> Option<String> {
    let provider_id = node.spec.as_ref()?.provider_id.as_ref()?;
    let id = provider_id.rsplit('/').next()?;
    if id.starts_with("i-") {
        Some(id.to_string())
    } else {
        None
    }
}

fn find_service_port<'a>(service: &'a Service, port: &PortRef) -> Result<&'a ServicePort> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .ok_or_else(|| Error::MissingDependency("service has no ports".to_string()))?;
    ports
        .iter()
        .find(|sp| match port {
            PortRef::Number(n) => sp.port == *n,
            PortRef::Name(name) => sp.name.as_deref() == Some(name.as_str()),
        })
        .ok_or_else(|| Error::MissingDependency(format!("service port {port} not found")))
}

/// Pod-IP targets from the ready addresses of the Endpoints object. The
/// numeric port comes from the subset entry whose name matches the service
/// port's name (both unset for a single unnamed port).
pub fn ip_targets(service: &Service, endpoints: &Endpoints, port: &PortRef) -> Result<Vec<Target>> {
    let service_port = find_service_port(service, port)?;
    let mut targets = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let Some(resolved) = subset
            .ports
            .iter()
            .flatten()
            .find(|ep| ep.name == service_port.name)
        else {
            continue;
        };
        for address in subset.addresses.iter().flatten() {
            targets.push(Target::new(address.ip.clone(), resolved.port));
        }
    }
    Ok(normalize(targets))
}

/// Instance targets: every suitable node, on the service's NodePort.
pub fn instance_targets(service: &Service, nodes: &[Node], port: &PortRef) -> Result<Vec<Target>> {
    let service_port = find_service_port(service, port)?;
    let node_port = service_port.node_port.ok_or_else(|| {
        Error::MissingDependency(format!("service port {port} has no NodePort"))
    })?;
    let targets = nodes
        .iter()
        .filter(|n| is_node_suitable(n))
        .filter_map(node_instance_id)
        .map(|id| Target::new(id, node_port))
        .collect();
    Ok(normalize(targets))
}

fn normalize(mut targets: Vec<Target>) -> Vec<Target> {
    targets.sort();
    targets.dedup();
    targets
}

/// Resolves the registration target set for a (service, port, target type)
/// triple against live cluster state.
#[derive(Clone)]
pub struct EndpointResolver {
    client: Client,
}

impl EndpointResolver {
    pub fn new(client: Client) -> Self {
        EndpointResolver { client }
    }

    pub async fn resolve(
        &self,
        svc_ref: &ServiceRef,
        port: &PortRef,
        target_type: TargetType,
    ) -> Result<Vec<Target>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &svc_ref.namespace);
        let service = services.get(&svc_ref.name).await.map_err(|e| match e {
            kube::Error::Api(ref api) if api.code == 404 => {
                Error::MissingDependency(format!("service {svc_ref} not found"))
            }
            other => Error::Kube(other),
        })?;

        let targets = match target_type {
            TargetType::Ip => {
                let endpoints: Api<Endpoints> =
                    Api::namespaced(self.client.clone(), &svc_ref.namespace);
                let eps = endpoints.get(&svc_ref.name).await.map_err(|e| match e {
                    kube::Error::Api(ref api) if api.code == 404 => {
                        Error::MissingDependency(format!("endpoints {svc_ref} not found"))
                    }
                    other => Error::Kube(other),
                })?;
                ip_targets(&service, &eps, port)?
            }
            TargetType::Instance => {
                let nodes: Api<Node> = Api::all(self.client.clone());
                let node_list = nodes.list(&ListParams::default()).await?;
                instance_targets(&service, &node_list.items, port)?
            }
        };
        debug!(service = %svc_ref, targets = targets.len(), "resolved endpoint targets");
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, NodeCondition, NodeSpec, NodeStatus,
        ServiceSpec, Taint,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use pretty_assertions::assert_eq;

    fn service(ports: Vec<ServicePort>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ip_targets_resolve_named_ports() {
        let svc = service(vec![ServicePort {
            port: 80,
            name: Some("http".to_string()),
            ..Default::default()
        }]);
        let eps = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![
                    EndpointAddress {
                        ip: "10.0.0.2".to_string(),
                        ..Default::default()
                    },
                    EndpointAddress {
                        ip: "10.0.0.1".to_string(),
                        ..Default::default()
                    },
                ]),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let targets = ip_targets(&svc, &eps, &PortRef::Number(80)).unwrap();
        // sorted and carrying the resolved numeric port
        assert_eq!(
            targets,
            vec![Target::new("10.0.0.1", 8080), Target::new("10.0.0.2", 8080)]
        );
    }

    #[test]
    fn ip_targets_skip_unmatched_subsets() {
        let svc = service(vec![ServicePort {
            port: 80,
            name: Some("http".to_string()),
            ..Default::default()
        }]);
        let eps = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    name: Some("metrics".to_string()),
                    port: 9090,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(ip_targets(&svc, &eps, &PortRef::Number(80)).unwrap(), vec![]);
    }

    #[test]
    fn instance_targets_use_node_port() {
        let svc = service(vec![ServicePort {
            port: 80,
            node_port: Some(31080),
            ..Default::default()
        }]);
        let nodes = vec![
            ready_node("n1", "aws:///us-east-1a/i-aaa"),
            ready_node("n2", "aws:///us-east-1b/i-bbb"),
        ];
        let targets = instance_targets(&svc, &nodes, &PortRef::Number(80)).unwrap();
        assert_eq!(
            targets,
            vec![Target::new("i-aaa", 31080), Target::new("i-bbb", 31080)]
        );
    }

    #[test]
    fn instance_targets_require_node_port() {
        let svc = service(vec![ServicePort {
            port: 80,
            ..Default::default()
        }]);
        let err = instance_targets(&svc, &[], &PortRef::Number(80)).unwrap_err();
        assert!(matches!(err, Error::MissingDependency(_)));
    }

    #[test]
    fn unsuitable_nodes_are_filtered() {
        let mut unschedulable = ready_node("n1", "aws:///us-east-1a/i-aaa");
        unschedulable.spec.as_mut().unwrap().unschedulable = Some(true);

        let mut tainted = ready_node("n2", "aws:///us-east-1b/i-bbb");
        tainted.spec.as_mut().unwrap().taints = Some(vec![Taint {
            key: "node.kubernetes.io/unreachable".to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }]);

        let mut excluded = ready_node("n3", "aws:///us-east-1c/i-ccc");
        excluded.metadata.labels = Some(
            [(EXCLUDE_BALANCER_LABEL.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );

        let mut not_ready = ready_node("n4", "aws:///us-east-1a/i-ddd");
        not_ready
            .status
            .as_mut()
            .unwrap()
            .conditions
            .as_mut()
            .unwrap()[0]
            .status = "False".to_string();

        let good = ready_node("n5", "aws:///us-east-1b/i-eee");

        for node in [&unschedulable, &tainted, &excluded, &not_ready] {
            assert!(!is_node_suitable(node));
        }
        assert!(is_node_suitable(&good));
    }

    #[test]
    fn instance_id_from_provider_id() {
        let node = ready_node("n1", "aws:///us-west-2a/i-0123456789abcdef");
        assert_eq!(node_instance_id(&node), Some("i-0123456789abcdef".to_string()));

        let bare = ready_node("n2", "gce://project/zone/vm");
        assert_eq!(node_instance_id(&bare), None);
    }
}
