//! Keeps a target group's registered targets converged with the endpoints of
//! the bound Service.

use aws_sdk_elasticloadbalancingv2::types::{
    TargetDescription, TargetHealthDescription, TargetHealthStateEnum,
};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::TargetGroupBinding;
use crate::endpoints::{EndpointResolver, ServiceRef, Target};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChanges {
    pub add: Vec<Target>,
    pub remove: Vec<Target>,
}

impl TargetChanges {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Registered targets as reported by DescribeTargetHealth, with `draining`
/// targets excluded: a target already on its way out must not count as
/// present, or its removal would be re-issued forever.
pub fn current_targets(healths: &[TargetHealthDescription]) -> Vec<Target> {
    let mut targets: Vec<Target> = healths
        .iter()
        .filter(|h| {
            h.target_health()
                .and_then(|th| th.state())
                .is_none_or(|s| *s != TargetHealthStateEnum::Draining)
        })
        .filter_map(|h| {
            let t = h.target()?;
            Some(Target::new(t.id()?.to_string(), t.port().unwrap_or_default()))
        })
        .collect();
    targets.sort();
    targets.dedup();
    targets
}

/// `add = desired \ current`, `remove = current \ desired`, identity
/// `(id, port)`.
pub fn diff_targets(desired: &[Target], current: &[Target]) -> TargetChanges {
    TargetChanges {
        add: desired
            .iter()
            .filter(|t| !current.contains(t))
            .cloned()
            .collect(),
        remove: current
            .iter()
            .filter(|t| !desired.contains(t))
            .cloned()
            .collect(),
    }
}

pub struct BindingReconciler {
    pub elbv2: aws_sdk_elasticloadbalancingv2::Client,
    pub resolver: EndpointResolver,
    pub metrics: Metrics,
}

impl BindingReconciler {
    async fn resolve_tg_arn(&self, binding: &TargetGroupBinding) -> Result<String> {
        if let Some(arn) = &binding.spec.target_group_arn {
            return Ok(arn.clone());
        }
        let name = binding.spec.target_group_name.as_ref().ok_or_else(|| {
            Error::MissingDependency(format!(
                "binding {} names no target group",
                binding.name_any()
            ))
        })?;
        let out = self
            .elbv2
            .describe_target_groups()
            .names(name)
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        out.target_groups()
            .first()
            .and_then(|tg| tg.target_group_arn())
            .map(str::to_string)
            .ok_or_else(|| Error::MissingDependency(format!("target group {name} not found")))
    }

    pub async fn reconcile(&self, binding: &TargetGroupBinding) -> Result<()> {
        let namespace = binding.namespace().unwrap_or_default();
        let target_type = binding.spec.target_type.ok_or_else(|| {
            Error::MissingDependency(format!(
                "binding {} declares no target type",
                binding.name_any()
            ))
        })?;
        let svc_ref = ServiceRef::new(namespace, binding.spec.service_ref.name.clone());
        let tg_arn = self.resolve_tg_arn(binding).await?;

        let desired = self
            .resolver
            .resolve(&svc_ref, &binding.spec.service_ref.port, target_type)
            .await?;

        self.metrics.aws_request("elbv2", "DescribeTargetHealth");
        let health = self
            .elbv2
            .describe_target_health()
            .target_group_arn(&tg_arn)
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        let current = current_targets(health.target_health_descriptions());

        let changes = diff_targets(&desired, &current);
        if changes.is_empty() {
            debug!(binding = %binding.name_any(), "targets already converged");
            return Ok(());
        }

        if !changes.add.is_empty() {
            info!(binding = %binding.name_any(), count = changes.add.len(), "registering targets");
            self.metrics.aws_request("elbv2", "RegisterTargets");
            self.elbv2
                .register_targets()
                .target_group_arn(&tg_arn)
                .set_targets(Some(to_descriptions(&changes.add)))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        }
        if !changes.remove.is_empty() {
            info!(binding = %binding.name_any(), count = changes.remove.len(), "deregistering targets");
            self.metrics.aws_request("elbv2", "DeregisterTargets");
            self.elbv2
                .deregister_targets()
                .target_group_arn(&tg_arn)
                .set_targets(Some(to_descriptions(&changes.remove)))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        }
        Ok(())
    }
}

fn to_descriptions(targets: &[Target]) -> Vec<TargetDescription> {
    targets
        .iter()
        .map(|t| {
            TargetDescription::builder()
                .id(&t.id)
                .port(t.port)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_elasticloadbalancingv2::types::TargetHealth;
    use pretty_assertions::assert_eq;

    fn health(id: &str, port: i32, state: TargetHealthStateEnum) -> TargetHealthDescription {
        TargetHealthDescription::builder()
            .target(
                TargetDescription::builder()
                    .id(id)
                    .port(port)
                    .build()
                    .expect("target id"),
            )
            .target_health(TargetHealth::builder().state(state).build())
            .build()
    }

    #[test]
    fn draining_targets_are_invisible() {
        // current = {A:80}; desired = {A:80, C:80} → add C only, remove none
        let healths = vec![
            health("A", 80, TargetHealthStateEnum::Healthy),
            health("B", 80, TargetHealthStateEnum::Draining),
        ];
        let current = current_targets(&healths);
        assert_eq!(current, vec![Target::new("A", 80)]);

        let desired = vec![Target::new("A", 80), Target::new("C", 80)];
        let changes = diff_targets(&desired, &current);
        assert_eq!(changes.add, vec![Target::new("C", 80)]);
        assert_eq!(changes.remove, Vec::<Target>::new());
    }

    #[test]
    fn add_and_remove_are_disjoint() {
        let desired = vec![Target::new("A", 80), Target::new("B", 80)];
        let current = vec![Target::new("B", 80), Target::new("C", 80)];
        let changes = diff_targets(&desired, &current);
        assert_eq!(changes.add, vec![Target::new("A", 80)]);
        assert_eq!(changes.remove, vec![Target::new("C", 80)]);
        for added in &changes.add {
            assert!(!changes.remove.contains(added));
        }
    }

    #[test]
    fn node_withdrawal_only_deregisters() {
        // three suitable nodes shrink to two; no registration should happen
        let desired = vec![Target::new("i-a", 31080), Target::new("i-c", 31080)];
        let current = vec![
            Target::new("i-a", 31080),
            Target::new("i-b", 31080),
            Target::new("i-c", 31080),
        ];
        let changes = diff_targets(&desired, &current);
        assert!(changes.add.is_empty());
        assert_eq!(changes.remove, vec![Target::new("i-b", 31080)]);
    }

    #[test]
    fn converged_set_is_empty_diff() {
        let targets = vec![Target::new("10.0.0.1", 8080), Target::new("10.0.0.2", 8080)];
        assert!(diff_targets(&targets, &targets).is_empty());
    }
}
