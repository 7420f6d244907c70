use std::collections::BTreeMap;
use std::sync::OnceLock;

use aws_sdk_resourcegroupstagging::types::TagFilter;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::group::GroupId;
use crate::model::{OWNED, SHARED, STACK_TAG};

/// AWS resource kinds the controller manages, recognized from the ARN's type
/// segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    LoadBalancer,
    Listener,
    ListenerRule,
    TargetGroup,
    Subnet,
}

fn classifiers() -> &'static [(Regex, ResourceKind)] {
    static CLASSIFIERS: OnceLock<Vec<(Regex, ResourceKind)>> = OnceLock::new();
    CLASSIFIERS.get_or_init(|| {
        [
            (r":loadbalancer/app/", ResourceKind::LoadBalancer),
            (r":listener/app/", ResourceKind::Listener),
            (r":listener-rule/app/", ResourceKind::ListenerRule),
            (r":targetgroup/", ResourceKind::TargetGroup),
            (r":subnet/", ResourceKind::Subnet),
        ]
        .into_iter()
        .map(|(pattern, kind)| (Regex::new(pattern).expect("arn classifier"), kind))
        .collect()
    })
}

pub fn classify_arn(arn: &str) -> Option<ResourceKind> {
    classifiers()
        .iter()
        .find(|(re, _)| re.is_match(arn))
        .map(|(_, kind)| *kind)
}

#[derive(Debug, Clone)]
pub struct TaggedResource {
    pub arn: String,
    pub kind: Option<ResourceKind>,
    pub tags: BTreeMap<String, String>,
}

/// Grouped view of the resources belonging to one ingress stack.
#[derive(Debug, Default, Clone)]
pub struct StackResources {
    pub load_balancers: Vec<TaggedResource>,
    pub listeners: Vec<TaggedResource>,
    pub rules: Vec<TaggedResource>,
    pub target_groups: Vec<TaggedResource>,
}

/// Tag-based discovery of cluster-owned resources through the
/// Resource Groups Tagging API.
#[derive(Clone)]
pub struct Inventory {
    tagging: aws_sdk_resourcegroupstagging::Client,
    cluster_tag: String,
}

impl Inventory {
    pub fn new(tagging: aws_sdk_resourcegroupstagging::Client, cluster_name: &str) -> Self {
        Inventory {
            tagging,
            cluster_tag: format!("kubernetes.io/cluster/{cluster_name}"),
        }
    }

    fn cluster_filter(&self) -> TagFilter {
        TagFilter::builder()
            .key(&self.cluster_tag)
            .values(OWNED)
            .values(SHARED)
            .build()
    }

    async fn get_resources(
        &self,
        type_filters: &[&str],
        extra: Option<TagFilter>,
    ) -> Result<Vec<TaggedResource>> {
        let mut resources = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .tagging
                .get_resources()
                .tag_filters(self.cluster_filter())
                .set_pagination_token(token.clone());
            if let Some(extra) = extra.clone() {
                req = req.tag_filters(extra);
            }
            for tf in type_filters {
                req = req.resource_type_filters(tf.to_string());
            }
            let out = req
                .send()
                .await
                .map_err(aws_sdk_resourcegroupstagging::Error::from)?;

            for mapping in out.resource_tag_mapping_list() {
                let Some(arn) = mapping.resource_arn() else {
                    continue;
                };
                let tags = mapping
                    .tags()
                    .iter()
                    .map(|t| (t.key().to_string(), t.value().to_string()))
                    .collect();
                resources.push(TaggedResource {
                    arn: arn.to_string(),
                    kind: classify_arn(arn),
                    tags,
                });
            }

            let next = out
                .pagination_token()
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            // same-token termination guards against a pathological API echo
            if next.is_none() || next == token {
                break;
            }
            token = next;
        }
        Ok(resources)
    }

    /// Every ELBv2 resource tagged into this cluster's stack for `group`.
    pub async fn stack_resources(&self, group: &GroupId) -> Result<StackResources> {
        let stack_filter = TagFilter::builder()
            .key(STACK_TAG)
            .values(group.to_string())
            .build();
        let resources = self
            .get_resources(&["elasticloadbalancing"], Some(stack_filter))
            .await?;
        let mut stack = StackResources::default();
        for resource in resources {
            match resource.kind {
                Some(ResourceKind::LoadBalancer) => stack.load_balancers.push(resource),
                Some(ResourceKind::Listener) => stack.listeners.push(resource),
                Some(ResourceKind::ListenerRule) => stack.rules.push(resource),
                Some(ResourceKind::TargetGroup) => stack.target_groups.push(resource),
                _ => debug!(arn = %resource.arn, "ignoring unclassified stack resource"),
            }
        }
        Ok(stack)
    }

    /// Subnet IDs tagged for cluster load balancers, discovered by role tag.
    pub async fn subnets_by_role(&self, internal: bool) -> Result<Vec<String>> {
        let role = if internal {
            "kubernetes.io/role/internal-elb"
        } else {
            "kubernetes.io/role/elb"
        };
        let role_filter = TagFilter::builder().key(role).build();
        let resources = self.get_resources(&["ec2:subnet"], Some(role_filter)).await?;
        Ok(resources
            .into_iter()
            .filter(|r| r.kind == Some(ResourceKind::Subnet))
            .filter_map(|r| r.arn.rsplit('/').next().map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arns_classify_by_type_segment() {
        assert_eq!(
            classify_arn(
                "arn:aws:elasticloadbalancing:us-east-1:123:loadbalancer/app/my-lb/50dc6c"
            ),
            Some(ResourceKind::LoadBalancer)
        );
        assert_eq!(
            classify_arn(
                "arn:aws:elasticloadbalancing:us-east-1:123:listener/app/my-lb/50dc6c/f2f7dc"
            ),
            Some(ResourceKind::Listener)
        );
        assert_eq!(
            classify_arn(
                "arn:aws:elasticloadbalancing:us-east-1:123:listener-rule/app/my-lb/50dc6c/f2f7dc/9683b2"
            ),
            Some(ResourceKind::ListenerRule)
        );
        assert_eq!(
            classify_arn("arn:aws:elasticloadbalancing:us-east-1:123:targetgroup/web-abc/73e2d6"),
            Some(ResourceKind::TargetGroup)
        );
        assert_eq!(
            classify_arn("arn:aws:ec2:us-east-1:123:subnet/subnet-0bb1c79de3EXAMPLE"),
            Some(ResourceKind::Subnet)
        );
        assert_eq!(
            classify_arn("arn:aws:elasticloadbalancing:us-east-1:123:loadbalancer/net/my-nlb/x"),
            None
        );
    }

    #[test]
    fn listener_rule_wins_over_listener() {
        // listener-rule ARNs also contain ":listener" as a substring; the
        // classifier table order must not misfile them
        let arn = "arn:aws:elasticloadbalancing:us-east-1:123:listener-rule/app/lb/1/2/3";
        assert_eq!(classify_arn(arn), Some(ResourceKind::ListenerRule));
    }
}
