use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::group::GroupId;
use crate::model::TargetGroupKey;

/// ALB resource names cap at 32 characters.
const MAX_NAME: usize = 32;
const HASH_LEN: usize = 12;

fn fingerprint<T: Serialize>(input: &T) -> String {
    let mut h = Sha256::new();
    let bytes = serde_json::to_vec(input).expect("fingerprint serialize");
    h.update(bytes);
    let digest = format!("{:x}", h.finalize());
    digest[..HASH_LEN].to_string()
}

fn sanitize(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    trimmed.chars().take(max_len).collect()
}

/// Load balancer name: sanitized group ID plus a stable hash of the full ID,
/// so distinct groups that sanitize alike still get distinct names.
pub fn load_balancer_name(group: &GroupId) -> String {
    let hash = fingerprint(&group.to_string());
    let prefix = sanitize(&group.to_string(), MAX_NAME - HASH_LEN - 1);
    format!("{prefix}-{hash}")
}

/// Target group name: sanitized service name plus a hash over the full
/// backend tuple (service, port, target type, protocol).
pub fn target_group_name(key: &TargetGroupKey) -> String {
    let hash = fingerprint(&(
        key.service.to_string(),
        key.port.to_string(),
        key.target_type.as_str(),
        key.protocol.as_str(),
    ));
    let prefix = sanitize(&key.service.name, MAX_NAME - HASH_LEN - 1);
    format!("{prefix}-{hash}")
}

/// Name for the managed frontend security group of a load balancer.
pub fn managed_sg_name(lb_name: &str) -> String {
    format!("{lb_name}-sg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PortRef, TargetType};
    use crate::endpoints::ServiceRef;
    use crate::model::Protocol;
    use pretty_assertions::assert_eq;

    fn key(port: i32) -> TargetGroupKey {
        TargetGroupKey {
            service: ServiceRef::new("default", "web"),
            port: PortRef::Number(port),
            target_type: TargetType::Ip,
            protocol: Protocol::Http,
        }
    }

    #[test]
    fn names_are_stable_and_bounded() {
        let a = load_balancer_name(&GroupId::implicit("default", "web"));
        let b = load_balancer_name(&GroupId::implicit("default", "web"));
        assert_eq!(a, b);
        assert!(a.len() <= 32);
        assert!(a.starts_with("default-web-"));

        let long = GroupId::implicit(
            "a-namespace-with-a-very-long-name",
            "and-an-even-longer-ingress-name",
        );
        assert!(load_balancer_name(&long).len() <= 32);
    }

    #[test]
    fn tg_name_differs_per_tuple() {
        let by_port = target_group_name(&key(80));
        assert!(by_port.starts_with("web-"));
        assert!(by_port.len() <= 32);
        assert_ne!(by_port, target_group_name(&key(8080)));

        let mut instance = key(80);
        instance.target_type = TargetType::Instance;
        assert_ne!(target_group_name(&key(80)), target_group_name(&instance));
    }

    #[test]
    fn distinct_groups_with_same_sanitized_prefix_differ() {
        let a = load_balancer_name(&GroupId::implicit("team", "app.v1"));
        let b = load_balancer_name(&GroupId::implicit("team", "app-v1"));
        assert_ne!(a, b);
    }
}
