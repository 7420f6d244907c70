use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::{
    ProtocolEnum, TargetGroupAttribute, TargetTypeEnum,
};
use tracing::{debug, info};

use crate::aws::retry::{RetryPolicy, retry_on};
use crate::crd::TargetType;
use crate::error::{Error, Result};
use crate::model::{Protocol, TargetGroupSpec};

/// Attribute values AWS reports when nothing was configured; filtered out so
/// an untouched attribute never reads as drift.
const DEFAULT_TG_ATTRIBUTES: &[(&str, &str)] = &[
    ("deregistration_delay.timeout_seconds", "300"),
    ("stickiness.enabled", "false"),
    ("load_balancing.algorithm.type", "round_robin"),
    ("slow_start.duration_seconds", "0"),
];

/// Observed state a paired target group can drift on. Port, protocol, and
/// target type are create-only and already folded into the name hash, so a
/// name match implies they agree.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedTargetGroup {
    pub arn: String,
    pub name: String,
    pub health_check_path: Option<String>,
    pub health_check_port: Option<String>,
    pub health_check_protocol: Option<Protocol>,
    pub health_check_interval: Option<i32>,
    pub health_check_timeout: Option<i32>,
    pub healthy_threshold: Option<i32>,
    pub unhealthy_threshold: Option<i32>,
    pub matcher: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct TargetGroupChanges<'a> {
    pub create: Vec<&'a TargetGroupSpec>,
    pub modify: Vec<(&'a TargetGroupSpec, &'a ObservedTargetGroup)>,
    pub delete: Vec<&'a ObservedTargetGroup>,
    pub unchanged: Vec<(&'a TargetGroupSpec, &'a ObservedTargetGroup)>,
}

/// Strips AWS-default attribute values before comparison.
pub fn significant_attributes(attrs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    attrs
        .iter()
        .filter(|(k, v)| {
            !DEFAULT_TG_ATTRIBUTES
                .iter()
                .any(|(dk, dv)| dk == &k.as_str() && dv == &v.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn health_check_differs(desired: &TargetGroupSpec, observed: &ObservedTargetGroup) -> bool {
    let hc = &desired.health_check;
    observed.health_check_path.as_deref() != Some(hc.path.as_str())
        || observed.health_check_port.as_deref() != Some(hc.port.as_str())
        || observed.health_check_protocol != Some(hc.protocol)
        || observed.health_check_interval != Some(hc.interval_seconds)
        || observed.health_check_timeout != Some(hc.timeout_seconds)
        || observed.healthy_threshold != Some(hc.healthy_threshold)
        || observed.unhealthy_threshold != Some(hc.unhealthy_threshold)
        || observed.matcher.as_deref() != Some(hc.matcher.as_str())
}

pub fn attributes_differ(desired: &TargetGroupSpec, observed: &ObservedTargetGroup) -> bool {
    significant_attributes(&desired.attributes) != significant_attributes(&observed.attributes)
}

/// Pairs desired and observed target groups by stable name and classifies
/// each pair.
pub fn diff<'a>(
    desired: &'a [TargetGroupSpec],
    observed: &'a [ObservedTargetGroup],
) -> TargetGroupChanges<'a> {
    let mut changes = TargetGroupChanges::default();
    for spec in desired {
        match observed.iter().find(|o| o.name == spec.name) {
            None => changes.create.push(spec),
            Some(current) => {
                if health_check_differs(spec, current) || attributes_differ(spec, current) {
                    changes.modify.push((spec, current));
                } else {
                    changes.unchanged.push((spec, current));
                }
            }
        }
    }
    for current in observed {
        if !desired.iter().any(|d| d.name == current.name) {
            changes.delete.push(current);
        }
    }
    changes
}

fn protocol_enum(p: Protocol) -> ProtocolEnum {
    match p {
        Protocol::Http => ProtocolEnum::Http,
        Protocol::Https => ProtocolEnum::Https,
    }
}

fn protocol_from_enum(p: &ProtocolEnum) -> Option<Protocol> {
    match p {
        ProtocolEnum::Http => Some(Protocol::Http),
        ProtocolEnum::Https => Some(Protocol::Https),
        _ => None,
    }
}

fn target_type_enum(t: TargetType) -> TargetTypeEnum {
    match t {
        TargetType::Instance => TargetTypeEnum::Instance,
        TargetType::Ip => TargetTypeEnum::Ip,
    }
}

pub struct TargetGroupManager<'a> {
    pub elbv2: &'a aws_sdk_elasticloadbalancingv2::Client,
    pub vpc_id: &'a str,
    pub metrics: &'a crate::metrics::Metrics,
}

impl TargetGroupManager<'_> {
    /// Fetches full detail for the stack's target groups.
    pub async fn observe(&self, arns: &[String]) -> Result<Vec<ObservedTargetGroup>> {
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let out = self
            .elbv2
            .describe_target_groups()
            .set_target_group_arns(Some(arns.to_vec()))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;

        let mut observed = Vec::new();
        for tg in out.target_groups() {
            let (Some(arn), Some(name)) = (tg.target_group_arn(), tg.target_group_name()) else {
                continue;
            };
            let attrs = self
                .elbv2
                .describe_target_group_attributes()
                .target_group_arn(arn)
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            let attributes = attrs
                .attributes()
                .iter()
                .filter_map(|a| Some((a.key()?.to_string(), a.value()?.to_string())))
                .collect();
            observed.push(ObservedTargetGroup {
                arn: arn.to_string(),
                name: name.to_string(),
                health_check_path: tg.health_check_path().map(str::to_string),
                health_check_port: tg.health_check_port().map(str::to_string),
                health_check_protocol: tg.health_check_protocol().and_then(protocol_from_enum),
                health_check_interval: tg.health_check_interval_seconds(),
                health_check_timeout: tg.health_check_timeout_seconds(),
                healthy_threshold: tg.healthy_threshold_count(),
                unhealthy_threshold: tg.unhealthy_threshold_count(),
                matcher: tg.matcher().and_then(|m| m.http_code()).map(str::to_string),
                attributes,
            });
        }
        Ok(observed)
    }

    pub async fn create(&self, spec: &TargetGroupSpec) -> Result<String> {
        info!(name = %spec.name, "creating target group");
        let hc = &spec.health_check;
        let out = self
            .elbv2
            .create_target_group()
            .name(&spec.name)
            .vpc_id(self.vpc_id)
            .port(spec.port)
            .protocol(protocol_enum(spec.protocol))
            .target_type(target_type_enum(spec.target_type))
            .health_check_path(&hc.path)
            .health_check_port(&hc.port)
            .health_check_protocol(protocol_enum(hc.protocol))
            .health_check_interval_seconds(hc.interval_seconds)
            .health_check_timeout_seconds(hc.timeout_seconds)
            .healthy_threshold_count(hc.healthy_threshold)
            .unhealthy_threshold_count(hc.unhealthy_threshold)
            .matcher(
                aws_sdk_elasticloadbalancingv2::types::Matcher::builder()
                    .http_code(&hc.matcher)
                    .build(),
            )
            .set_tags((!spec.tags.is_empty()).then(|| {
                spec.tags
                    .iter()
                    .map(|(k, v)| {
                        aws_sdk_elasticloadbalancingv2::types::Tag::builder()
                            .key(k)
                            .value(v)
                            .build()
                    })
                    .collect()
            }))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        let arn = out
            .target_groups()
            .first()
            .and_then(|tg| tg.target_group_arn())
            .ok_or_else(|| {
                Error::MissingDependency(format!("created target group {} has no arn", spec.name))
            })?
            .to_string();
        self.apply_attributes(&arn, spec).await?;
        Ok(arn)
    }

    pub async fn modify(&self, spec: &TargetGroupSpec, observed: &ObservedTargetGroup) -> Result<()> {
        if health_check_differs(spec, observed) {
            info!(name = %spec.name, "updating target group health check");
            let hc = &spec.health_check;
            self.elbv2
                .modify_target_group()
                .target_group_arn(&observed.arn)
                .health_check_path(&hc.path)
                .health_check_port(&hc.port)
                .health_check_protocol(protocol_enum(hc.protocol))
                .health_check_interval_seconds(hc.interval_seconds)
                .health_check_timeout_seconds(hc.timeout_seconds)
                .healthy_threshold_count(hc.healthy_threshold)
                .unhealthy_threshold_count(hc.unhealthy_threshold)
                .matcher(
                    aws_sdk_elasticloadbalancingv2::types::Matcher::builder()
                        .http_code(&hc.matcher)
                        .build(),
                )
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        }
        if attributes_differ(spec, observed) {
            self.apply_attributes(&observed.arn, spec).await?;
        }
        Ok(())
    }

    async fn apply_attributes(&self, arn: &str, spec: &TargetGroupSpec) -> Result<()> {
        if spec.attributes.is_empty() {
            return Ok(());
        }
        let attributes: Vec<TargetGroupAttribute> = spec
            .attributes
            .iter()
            .map(|(k, v)| TargetGroupAttribute::builder().key(k).value(v).build())
            .collect();
        self.elbv2
            .modify_target_group_attributes()
            .target_group_arn(arn)
            .set_attributes(Some(attributes))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        Ok(())
    }

    /// Deletes a target group, riding out `ResourceInUse` while AWS finishes
    /// detaching a dependent listener or rule.
    pub async fn delete(&self, arn: &str) -> Result<()> {
        debug!(%arn, "deleting target group");
        let policy = RetryPolicy::target_group_delete();
        let result = retry_on(
            &policy,
            || async {
                self.elbv2
                    .delete_target_group()
                    .target_group_arn(arn)
                    .send()
                    .await
                    .map_err(aws_sdk_elasticloadbalancingv2::Error::from)
            },
            |err| {
                let retryable =
                    matches!(err, aws_sdk_elasticloadbalancingv2::Error::ResourceInUseException(_));
                if retryable {
                    self.metrics.aws_retry("elbv2", "DeleteTargetGroup");
                }
                retryable
            },
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            // already gone counts as deleted
            Err(aws_sdk_elasticloadbalancingv2::Error::TargetGroupNotFoundException(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PortRef;
    use crate::endpoints::ServiceRef;
    use crate::model::{HealthCheckSpec, TargetGroupKey};
    use pretty_assertions::assert_eq;

    fn spec(name: &str) -> TargetGroupSpec {
        TargetGroupSpec {
            key: TargetGroupKey {
                service: ServiceRef::new("default", "web"),
                port: PortRef::Number(80),
                target_type: TargetType::Ip,
                protocol: Protocol::Http,
            },
            name: name.to_string(),
            port: 8080,
            protocol: Protocol::Http,
            target_type: TargetType::Ip,
            health_check: HealthCheckSpec::default(),
            attributes: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    fn observed(name: &str) -> ObservedTargetGroup {
        let hc = HealthCheckSpec::default();
        ObservedTargetGroup {
            arn: format!("arn:tg/{name}"),
            name: name.to_string(),
            health_check_path: Some(hc.path),
            health_check_port: Some(hc.port),
            health_check_protocol: Some(hc.protocol),
            health_check_interval: Some(hc.interval_seconds),
            health_check_timeout: Some(hc.timeout_seconds),
            healthy_threshold: Some(hc.healthy_threshold),
            unhealthy_threshold: Some(hc.unhealthy_threshold),
            matcher: Some(hc.matcher),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn unpaired_resources_create_and_delete() {
        let desired = vec![spec("web-aaa"), spec("api-bbb")];
        let current = vec![observed("api-bbb"), observed("old-ccc")];
        let changes = diff(&desired, &current);
        assert_eq!(changes.create.len(), 1);
        assert_eq!(changes.create[0].name, "web-aaa");
        assert_eq!(changes.delete.len(), 1);
        assert_eq!(changes.delete[0].name, "old-ccc");
        assert_eq!(changes.unchanged.len(), 1);
        assert!(changes.modify.is_empty());
    }

    #[test]
    fn health_check_drift_is_a_modify() {
        let mut desired = spec("web-aaa");
        desired.health_check.path = "/healthz".to_string();
        let current = observed("web-aaa");
        let changes_input = [desired];
        let observed_input = [current];
        let changes = diff(&changes_input, &observed_input);
        assert_eq!(changes.modify.len(), 1);
        assert!(changes.create.is_empty());
    }

    #[test]
    fn default_attributes_are_not_drift() {
        let desired = spec("web-aaa");
        let mut current = observed("web-aaa");
        current.attributes.insert(
            "deregistration_delay.timeout_seconds".to_string(),
            "300".to_string(),
        );
        current
            .attributes
            .insert("stickiness.enabled".to_string(), "false".to_string());
        let desired_input = [desired];
        let observed_input = [current];
        let changes = diff(&desired_input, &observed_input);
        assert!(changes.modify.is_empty());
        assert_eq!(changes.unchanged.len(), 1);
    }

    #[test]
    fn non_default_attribute_is_drift() {
        let mut desired = spec("web-aaa");
        desired.attributes.insert(
            "deregistration_delay.timeout_seconds".to_string(),
            "60".to_string(),
        );
        let current = observed("web-aaa");
        let desired_input = [desired];
        let observed_input = [current];
        let changes = diff(&desired_input, &observed_input);
        assert_eq!(changes.modify.len(), 1);
    }
}
