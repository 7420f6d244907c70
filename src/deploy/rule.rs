use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::RulePriorityPair;
use tracing::info;

use crate::deploy::convert::{
    aws_actions, aws_conditions, normalize_aws_actions, normalize_aws_conditions,
    normalize_model_actions, normalize_model_conditions,
};
use crate::error::Result;
use crate::model::RuleSpec;

#[derive(Debug, Clone)]
pub struct ObservedRule {
    pub arn: String,
    pub priority: i32,
    pub conditions: Vec<aws_sdk_elasticloadbalancingv2::types::RuleCondition>,
    pub actions: Vec<aws_sdk_elasticloadbalancingv2::types::Action>,
}

#[derive(Debug, Default)]
pub struct RuleChanges<'a> {
    pub create: Vec<&'a RuleSpec>,
    /// Same priority, different content.
    pub modify: Vec<(&'a RuleSpec, &'a ObservedRule)>,
    /// Same condition set, moved to a new priority.
    pub reprioritize: Vec<(&'a RuleSpec, &'a ObservedRule)>,
    pub delete: Vec<&'a ObservedRule>,
}

impl RuleChanges<'_> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.modify.is_empty()
            && self.reprioritize.is_empty()
            && self.delete.is_empty()
    }
}

fn content_equal(
    spec: &RuleSpec,
    observed: &ObservedRule,
    tg_arns: &BTreeMap<String, String>,
) -> Result<bool> {
    Ok(
        normalize_model_conditions(&spec.conditions) == normalize_aws_conditions(&observed.conditions)
            && normalize_model_actions(&spec.actions, tg_arns)?
                == normalize_aws_actions(&observed.actions),
    )
}

fn conditions_equal(spec: &RuleSpec, observed: &ObservedRule) -> bool {
    normalize_model_conditions(&spec.conditions) == normalize_aws_conditions(&observed.conditions)
}

/// Pairs desired rules with observed rules: by priority first, then by
/// condition-set equality to recognize a priority reassignment instead of a
/// delete-and-recreate.
pub fn diff<'a>(
    desired: &'a [RuleSpec],
    observed: &'a [ObservedRule],
    tg_arns: &BTreeMap<String, String>,
) -> Result<RuleChanges<'a>> {
    let mut changes = RuleChanges::default();
    let mut used = vec![false; observed.len()];
    let mut unmatched: Vec<&RuleSpec> = Vec::new();

    for spec in desired {
        match observed.iter().position(|o| o.priority == spec.priority) {
            Some(idx) => {
                used[idx] = true;
                if !content_equal(spec, &observed[idx], tg_arns)? {
                    changes.modify.push((spec, &observed[idx]));
                }
            }
            None => unmatched.push(spec),
        }
    }

    for spec in unmatched {
        let fallback = observed
            .iter()
            .enumerate()
            .find(|(idx, o)| !used[*idx] && conditions_equal(spec, o));
        match fallback {
            Some((idx, o)) => {
                used[idx] = true;
                changes.reprioritize.push((spec, o));
            }
            None => changes.create.push(spec),
        }
    }

    for (idx, o) in observed.iter().enumerate() {
        if !used[idx] {
            changes.delete.push(o);
        }
    }
    Ok(changes)
}

pub struct RuleManager<'a> {
    pub elbv2: &'a aws_sdk_elasticloadbalancingv2::Client,
}

impl RuleManager<'_> {
    pub async fn observe(&self, listener_arn: &str) -> Result<Vec<ObservedRule>> {
        let mut rules = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .elbv2
                .describe_rules()
                .listener_arn(listener_arn)
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            for rule in out.rules() {
                if rule.is_default().unwrap_or(false) {
                    continue;
                }
                let (Some(arn), Some(priority)) = (
                    rule.rule_arn(),
                    rule.priority().and_then(|p| p.parse::<i32>().ok()),
                ) else {
                    continue;
                };
                rules.push(ObservedRule {
                    arn: arn.to_string(),
                    priority,
                    conditions: rule.conditions().to_vec(),
                    actions: rule.actions().to_vec(),
                });
            }
            let next = out.next_marker().map(str::to_string);
            if next.is_none() || next == marker {
                break;
            }
            marker = next;
        }
        Ok(rules)
    }

    pub async fn apply(
        &self,
        listener_arn: &str,
        changes: &RuleChanges<'_>,
        tg_arns: &BTreeMap<String, String>,
    ) -> Result<bool> {
        if changes.is_empty() {
            return Ok(false);
        }
        // Reprioritizations first so new rules never collide with a priority
        // that is about to be vacated.
        if !changes.reprioritize.is_empty() {
            let pairs: Vec<RulePriorityPair> = changes
                .reprioritize
                .iter()
                .map(|(spec, o)| {
                    RulePriorityPair::builder()
                        .rule_arn(&o.arn)
                        .priority(spec.priority)
                        .build()
                })
                .collect();
            info!(count = pairs.len(), "reassigning rule priorities");
            self.elbv2
                .set_rule_priorities()
                .set_rule_priorities(Some(pairs))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            for (spec, o) in &changes.reprioritize {
                if !content_equal(spec, o, tg_arns)? {
                    self.modify(spec, o, tg_arns).await?;
                }
            }
        }
        for (spec, o) in &changes.modify {
            self.modify(spec, o, tg_arns).await?;
        }
        for spec in &changes.create {
            info!(priority = spec.priority, "creating rule");
            self.elbv2
                .create_rule()
                .listener_arn(listener_arn)
                .priority(spec.priority)
                .set_conditions(Some(aws_conditions(&spec.conditions)))
                .set_actions(Some(aws_actions(&spec.actions, tg_arns)?))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        }
        for o in &changes.delete {
            info!(priority = o.priority, "deleting rule");
            match self
                .elbv2
                .delete_rule()
                .rule_arn(&o.arn)
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)
            {
                Ok(_) => {}
                Err(aws_sdk_elasticloadbalancingv2::Error::RuleNotFoundException(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    async fn modify(
        &self,
        spec: &RuleSpec,
        observed: &ObservedRule,
        tg_arns: &BTreeMap<String, String>,
    ) -> Result<()> {
        info!(priority = spec.priority, "updating rule");
        self.elbv2
            .modify_rule()
            .rule_arn(&observed.arn)
            .set_conditions(Some(aws_conditions(&spec.conditions)))
            .set_actions(Some(aws_actions(&spec.actions, tg_arns)?))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, RedirectSpec, RuleCondition};
    use pretty_assertions::assert_eq;

    fn redirect() -> Action {
        Action::Redirect(RedirectSpec {
            protocol: Some("HTTPS".to_string()),
            port: Some("443".to_string()),
            status_code: "HTTP_301".to_string(),
            ..Default::default()
        })
    }

    fn rule(priority: i32, host: &str) -> RuleSpec {
        RuleSpec {
            priority,
            conditions: vec![RuleCondition::Host(vec![host.to_string()])],
            actions: vec![redirect()],
        }
    }

    fn observed_from(spec: &RuleSpec) -> ObservedRule {
        let arns = BTreeMap::new();
        ObservedRule {
            arn: format!("arn:rule/{}", spec.priority),
            priority: spec.priority,
            conditions: aws_conditions(&spec.conditions),
            actions: aws_actions(&spec.actions, &arns).unwrap(),
        }
    }

    #[test]
    fn converged_rules_produce_no_changes() {
        let desired = vec![rule(1, "a.com"), rule(2, "b.com")];
        let observed: Vec<ObservedRule> = desired.iter().map(observed_from).collect();
        let changes = diff(&desired, &observed, &BTreeMap::new()).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn content_drift_at_same_priority_is_modify() {
        let desired = vec![rule(1, "b.com")];
        let observed = vec![observed_from(&rule(1, "a.com"))];
        let changes = diff(&desired, &observed, &BTreeMap::new()).unwrap();
        assert_eq!(changes.modify.len(), 1);
        assert!(changes.create.is_empty());
        assert!(changes.delete.is_empty());
    }

    #[test]
    fn renumbering_matches_by_condition_set() {
        // the rule at priority 2 should slide to priority 1, not be recreated
        let desired = vec![rule(1, "b.com")];
        let observed = vec![observed_from(&rule(2, "b.com"))];
        let changes = diff(&desired, &observed, &BTreeMap::new()).unwrap();
        assert_eq!(changes.reprioritize.len(), 1);
        assert_eq!(changes.reprioritize[0].0.priority, 1);
        assert_eq!(changes.reprioritize[0].1.priority, 2);
        assert!(changes.create.is_empty());
        assert!(changes.delete.is_empty());
    }

    #[test]
    fn group_shrink_modifies_and_deletes() {
        // two observed rules, first member removed: survivor pairs at p1 by
        // priority, p2 is deleted
        let desired = vec![rule(1, "b.com")];
        let observed = vec![
            observed_from(&rule(1, "a.com")),
            observed_from(&rule(2, "b.com")),
        ];
        let changes = diff(&desired, &observed, &BTreeMap::new()).unwrap();
        assert_eq!(changes.modify.len(), 1);
        assert_eq!(changes.delete.len(), 1);
        assert_eq!(changes.delete[0].priority, 2);
        assert!(changes.create.is_empty());
    }

    #[test]
    fn fresh_listener_creates_everything() {
        let desired = vec![rule(1, "a.com"), rule(2, "b.com")];
        let changes = diff(&desired, &[], &BTreeMap::new()).unwrap();
        assert_eq!(changes.create.len(), 2);
        assert!(changes.delete.is_empty());
    }
}
