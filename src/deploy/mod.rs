//! Applies a desired [`Model`] to AWS: observe, pair, classify, and execute
//! changes per resource kind, in dependency order. Target groups come first
//! so listeners and rules can reference them; deletions run in reverse.

pub mod convert;
pub mod listener;
pub mod load_balancer;
pub mod rule;
pub mod security_group;
pub mod tags;
pub mod target_group;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::aws::AwsClients;
use crate::aws::cache::DescribeCache;
use crate::aws::inventory::{Inventory, StackResources};
use crate::error::{Error, Result};
use crate::group::GroupId;
use crate::metrics::Metrics;
use crate::model::{Model, SecurityGroupConfig, naming};

use self::listener::ListenerManager;
use self::load_balancer::LoadBalancerManager;
use self::rule::RuleManager;
use self::security_group::SecurityGroupManager;
use self::target_group::TargetGroupManager;

pub struct Deployer {
    pub aws: AwsClients,
    pub inventory: Inventory,
    pub metrics: Metrics,
    pub vpc_id: String,
    pub cluster_tag: String,
    /// Fronts stack discovery; invalidated whenever a cycle mutates AWS.
    pub stack_cache: DescribeCache<StackResources>,
}

impl Deployer {
    pub fn new(
        aws: AwsClients,
        inventory: Inventory,
        metrics: Metrics,
        vpc_id: String,
        cluster_tag: String,
    ) -> Self {
        let stack_cache = DescribeCache::new(
            "stack-resources",
            crate::aws::cache::DEFAULT_TTL,
            metrics.clone(),
        );
        Deployer {
            aws,
            inventory,
            metrics,
            vpc_id,
            cluster_tag,
            stack_cache,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub lb_arn: String,
    pub lb_dns: String,
    /// Target group name → ARN for every TG in the model.
    pub target_group_arns: BTreeMap<String, String>,
    /// ID of the managed frontend SG, when one is in play.
    pub frontend_sg: Option<String>,
    /// Whether any AWS mutation was issued this cycle.
    pub mutated: bool,
}

impl Deployer {
    fn tg_manager(&self) -> TargetGroupManager<'_> {
        TargetGroupManager {
            elbv2: &self.aws.elbv2,
            vpc_id: &self.vpc_id,
            metrics: &self.metrics,
        }
    }

    fn sg_manager(&self) -> SecurityGroupManager<'_> {
        SecurityGroupManager {
            ec2: &self.aws.ec2,
            vpc_id: &self.vpc_id,
            cluster_tag: &self.cluster_tag,
        }
    }

    pub async fn deploy(&self, group: &GroupId, model: &Model) -> Result<DeployOutcome> {
        let mut mutated = false;
        let stack = self
            .stack_cache
            .get_or_fetch("GetStackResources", &group.to_string(), || {
                self.inventory.stack_resources(group)
            })
            .await?;
        let observed_tags: BTreeMap<String, BTreeMap<String, String>> = stack
            .load_balancers
            .iter()
            .chain(stack.target_groups.iter())
            .map(|r| (r.arn.clone(), r.tags.clone()))
            .collect();

        // target groups first: listeners and rules reference them
        let tg_mgr = self.tg_manager();
        let stack_tg_arns: Vec<String> =
            stack.target_groups.iter().map(|r| r.arn.clone()).collect();
        let observed_tgs = tg_mgr.observe(&stack_tg_arns).await?;
        let tg_changes = target_group::diff(&model.target_groups, &observed_tgs);

        let mut tg_arns: BTreeMap<String, String> = BTreeMap::new();
        for (spec, observed) in tg_changes.unchanged.iter() {
            tg_arns.insert(spec.name.clone(), observed.arn.clone());
        }
        for (spec, observed) in tg_changes.modify.iter() {
            tg_mgr.modify(spec, observed).await?;
            tg_arns.insert(spec.name.clone(), observed.arn.clone());
            mutated = true;
        }
        for spec in tg_changes.create.iter() {
            let arn = tg_mgr.create(spec).await?;
            tg_arns.insert(spec.name.clone(), arn);
            mutated = true;
        }

        // security groups attached to the LB
        let sg_mgr = self.sg_manager();
        let (lb_sg_ids, frontend_sg) = match &model.load_balancer.security_groups {
            SecurityGroupConfig::Explicit(ids) => (ids.clone(), None),
            SecurityGroupConfig::Managed(managed) => {
                let (id, sg_mutated) = sg_mgr.ensure_frontend(managed).await?;
                mutated |= sg_mutated;
                (vec![id.clone()], Some(id))
            }
        };

        // load balancer
        let lb_mgr = LoadBalancerManager { elbv2: &self.aws.elbv2 };
        let observed_lb = lb_mgr.observe(&model.load_balancer.name).await?;
        let lb = match observed_lb {
            Some(current) => {
                mutated |= lb_mgr
                    .reconcile(&model.load_balancer, &current, &lb_sg_ids)
                    .await?;
                current
            }
            None => {
                mutated = true;
                lb_mgr.create(&model.load_balancer, &lb_sg_ids).await?
            }
        };

        // listeners and their rules
        let listener_mgr = ListenerManager { elbv2: &self.aws.elbv2 };
        let rule_mgr = RuleManager { elbv2: &self.aws.elbv2 };
        let observed_listeners = listener_mgr.observe(&lb.arn).await?;
        for spec in &model.listeners {
            let listener_arn = match observed_listeners.iter().find(|o| o.port == spec.port) {
                Some(current) => {
                    mutated |= listener_mgr.reconcile(spec, current, &tg_arns).await?;
                    current.arn.clone()
                }
                None => {
                    mutated = true;
                    listener_mgr.create(&lb.arn, spec, &tg_arns).await?
                }
            };
            let observed_rules = rule_mgr.observe(&listener_arn).await?;
            let changes = rule::diff(&spec.rules, &observed_rules, &tg_arns)?;
            mutated |= rule_mgr.apply(&listener_arn, &changes, &tg_arns).await?;
        }

        // orphaned listeners go away with their rules
        for orphan in observed_listeners
            .iter()
            .filter(|o| !model.listeners.iter().any(|l| l.port == o.port))
        {
            listener_mgr.delete(&orphan.arn).await?;
            mutated = true;
        }

        // now-unreferenced target groups
        for orphan in tg_changes.delete.iter() {
            tg_mgr.delete(&orphan.arn).await?;
            mutated = true;
        }

        // node SG permissions once target groups exist
        if let (Some(frontend), SecurityGroupConfig::Managed(managed)) =
            (&frontend_sg, &model.load_balancer.security_groups)
        {
            mutated |= sg_mgr.ensure_backend_rules(frontend, managed).await?;
        }

        // tag reconciliation over surviving resources
        for (arn, desired) in std::iter::once((&lb.arn, &model.load_balancer.tags)).chain(
            model
                .target_groups
                .iter()
                .filter_map(|tg| tg_arns.get(&tg.name).map(|arn| (arn, &tg.tags))),
        ) {
            if let Some(current) = observed_tags.get(arn) {
                let diff = tags::diff_tags(current, desired);
                mutated |= tags::reconcile_tags(&self.aws.elbv2, arn, &diff).await?;
            }
        }

        if mutated {
            // the cached discovery no longer reflects what exists
            self.stack_cache.invalidate_all();
            self.metrics.reloads.inc();
        }
        info!(group = %group, lb = %lb.arn, mutated, "deployed model");
        Ok(DeployOutcome {
            lb_arn: lb.arn,
            lb_dns: lb.dns_name,
            target_group_arns: tg_arns,
            frontend_sg,
            mutated,
        })
    }

    /// Tears down every AWS resource of an empty group's stack: listeners,
    /// load balancer, target groups, managed security group.
    pub async fn deprovision(&self, group: &GroupId) -> Result<()> {
        // teardown decisions always use a fresh view
        self.stack_cache.invalidate_all();
        let stack = self.inventory.stack_resources(group).await?;
        debug!(
            group = %group,
            load_balancers = stack.load_balancers.len(),
            listeners = stack.listeners.len(),
            rules = stack.rules.len(),
            target_groups = stack.target_groups.len(),
            "tearing down stack"
        );
        let lb_mgr = LoadBalancerManager { elbv2: &self.aws.elbv2 };
        let listener_mgr = ListenerManager { elbv2: &self.aws.elbv2 };
        let tg_mgr = self.tg_manager();

        for lb_resource in &stack.load_balancers {
            let Some(lb) = lb_mgr.observe_arn(&lb_resource.arn).await? else {
                continue;
            };
            for listener in listener_mgr.observe(&lb.arn).await? {
                listener_mgr.delete(&listener.arn).await?;
            }
            lb_mgr.delete(&lb).await?;
        }

        for tg in &stack.target_groups {
            tg_mgr.delete(&tg.arn).await?;
        }

        let lb_name = naming::load_balancer_name(group);
        let managed = crate::model::ManagedSecurityGroup {
            name: naming::managed_sg_name(&lb_name),
            ingress: Vec::new(),
            tags: BTreeMap::new(),
            target_ingress: Vec::new(),
        };
        if let Err(err) = self.sg_manager().delete_frontend(&managed).await {
            // the SG may be detaching from the deleted LB for a while
            match err {
                Error::Ec2(_) => {
                    warn!(group = %group, %err, "managed sg deletion pending; will retry");
                    return Err(err);
                }
                other => return Err(other),
            }
        }
        info!(group = %group, "deprovisioned stack");
        Ok(())
    }
}
