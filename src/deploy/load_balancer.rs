use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::{
    IpAddressType as AwsIpAddressType, LoadBalancerAttribute, LoadBalancerSchemeEnum,
    LoadBalancerTypeEnum, Tag,
};
use tracing::info;

use crate::crd::{IpAddressType, LbScheme};
use crate::error::{Error, Result};
use crate::model::LoadBalancerSpec;

const DEFAULT_LB_ATTRIBUTES: &[(&str, &str)] = &[
    ("idle_timeout.timeout_seconds", "60"),
    ("deletion_protection.enabled", "false"),
    ("access_logs.s3.enabled", "false"),
    ("routing.http2.enabled", "true"),
];

/// Observed state a paired load balancer can drift on; the scheme is
/// create-only and implied by the name pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedLoadBalancer {
    pub arn: String,
    pub dns_name: String,
    pub ip_address_type: Option<IpAddressType>,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

pub fn significant_attributes(attrs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    attrs
        .iter()
        .filter(|(k, v)| {
            !DEFAULT_LB_ATTRIBUTES
                .iter()
                .any(|(dk, dv)| dk == &k.as_str() && dv == &v.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn attributes_differ(desired: &LoadBalancerSpec, observed: &ObservedLoadBalancer) -> bool {
    significant_attributes(&desired.attributes) != significant_attributes(&observed.attributes)
}

pub fn subnets_differ(desired: &[String], observed: &[String]) -> bool {
    let mut a = desired.to_vec();
    let mut b = observed.to_vec();
    a.sort();
    b.sort();
    a != b
}

fn scheme_enum(scheme: LbScheme) -> LoadBalancerSchemeEnum {
    match scheme {
        LbScheme::Internal => LoadBalancerSchemeEnum::Internal,
        LbScheme::InternetFacing => LoadBalancerSchemeEnum::InternetFacing,
    }
}

fn ip_type_enum(t: IpAddressType) -> AwsIpAddressType {
    match t {
        IpAddressType::Ipv4 => AwsIpAddressType::Ipv4,
        IpAddressType::Dualstack => AwsIpAddressType::Dualstack,
    }
}

pub struct LoadBalancerManager<'a> {
    pub elbv2: &'a aws_sdk_elasticloadbalancingv2::Client,
}

impl LoadBalancerManager<'_> {
    pub async fn observe(&self, name: &str) -> Result<Option<ObservedLoadBalancer>> {
        let described = self.elbv2.describe_load_balancers().names(name).send().await;
        self.first_described(described).await
    }

    pub async fn observe_arn(&self, arn: &str) -> Result<Option<ObservedLoadBalancer>> {
        let described = self
            .elbv2
            .describe_load_balancers()
            .load_balancer_arns(arn)
            .send()
            .await;
        self.first_described(described).await
    }

    async fn first_described(
        &self,
        described: std::result::Result<
            aws_sdk_elasticloadbalancingv2::operation::describe_load_balancers::DescribeLoadBalancersOutput,
            aws_sdk_elasticloadbalancingv2::error::SdkError<
                aws_sdk_elasticloadbalancingv2::operation::describe_load_balancers::DescribeLoadBalancersError,
            >,
        >,
    ) -> Result<Option<ObservedLoadBalancer>> {
        let out = match described.map_err(aws_sdk_elasticloadbalancingv2::Error::from) {
            Ok(out) => out,
            Err(aws_sdk_elasticloadbalancingv2::Error::LoadBalancerNotFoundException(_)) => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let Some(lb) = out.load_balancers().first() else {
            return Ok(None);
        };
        let Some(arn) = lb.load_balancer_arn() else {
            return Ok(None);
        };

        let attrs = self
            .elbv2
            .describe_load_balancer_attributes()
            .load_balancer_arn(arn)
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        let attributes = attrs
            .attributes()
            .iter()
            .filter_map(|a| Some((a.key()?.to_string(), a.value()?.to_string())))
            .collect();

        Ok(Some(ObservedLoadBalancer {
            arn: arn.to_string(),
            dns_name: lb.dns_name().unwrap_or_default().to_string(),
            ip_address_type: lb.ip_address_type().and_then(|t| match t {
                AwsIpAddressType::Ipv4 => Some(IpAddressType::Ipv4),
                AwsIpAddressType::Dualstack => Some(IpAddressType::Dualstack),
                _ => None,
            }),
            subnets: lb
                .availability_zones()
                .iter()
                .filter_map(|az| az.subnet_id().map(str::to_string))
                .collect(),
            security_groups: lb.security_groups().to_vec(),
            attributes,
        }))
    }

    pub async fn create(
        &self,
        spec: &LoadBalancerSpec,
        security_group_ids: &[String],
    ) -> Result<ObservedLoadBalancer> {
        info!(name = %spec.name, "creating load balancer");
        let tags: Vec<Tag> = spec
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();
        let out = self
            .elbv2
            .create_load_balancer()
            .name(&spec.name)
            .r#type(LoadBalancerTypeEnum::Application)
            .scheme(scheme_enum(spec.scheme))
            .ip_address_type(ip_type_enum(spec.ip_address_type))
            .set_subnets(Some(spec.subnets.clone()))
            .set_security_groups(Some(security_group_ids.to_vec()))
            .set_tags((!tags.is_empty()).then_some(tags))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        let lb = out.load_balancers().first().ok_or_else(|| {
            Error::MissingDependency(format!("created load balancer {} not returned", spec.name))
        })?;
        let arn = lb
            .load_balancer_arn()
            .ok_or_else(|| {
                Error::MissingDependency(format!("created load balancer {} has no arn", spec.name))
            })?
            .to_string();
        self.apply_attributes(&arn, spec).await?;
        Ok(ObservedLoadBalancer {
            arn,
            dns_name: lb.dns_name().unwrap_or_default().to_string(),
            ip_address_type: Some(spec.ip_address_type),
            subnets: spec.subnets.clone(),
            security_groups: security_group_ids.to_vec(),
            attributes: spec.attributes.clone(),
        })
    }

    /// Converges an existing load balancer; returns whether anything changed.
    pub async fn reconcile(
        &self,
        spec: &LoadBalancerSpec,
        observed: &ObservedLoadBalancer,
        security_group_ids: &[String],
    ) -> Result<bool> {
        let mut mutated = false;
        if subnets_differ(&spec.subnets, &observed.subnets) {
            info!(name = %spec.name, "updating load balancer subnets");
            self.elbv2
                .set_subnets()
                .load_balancer_arn(&observed.arn)
                .set_subnets(Some(spec.subnets.clone()))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            mutated = true;
        }
        if subnets_differ(security_group_ids, &observed.security_groups) {
            info!(name = %spec.name, "updating load balancer security groups");
            self.elbv2
                .set_security_groups()
                .load_balancer_arn(&observed.arn)
                .set_security_groups(Some(security_group_ids.to_vec()))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            mutated = true;
        }
        if observed.ip_address_type != Some(spec.ip_address_type) {
            self.elbv2
                .set_ip_address_type()
                .load_balancer_arn(&observed.arn)
                .ip_address_type(ip_type_enum(spec.ip_address_type))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            mutated = true;
        }
        if attributes_differ(spec, observed) {
            self.apply_attributes(&observed.arn, spec).await?;
            mutated = true;
        }
        Ok(mutated)
    }

    async fn apply_attributes(&self, arn: &str, spec: &LoadBalancerSpec) -> Result<()> {
        if spec.attributes.is_empty() {
            return Ok(());
        }
        let attributes: Vec<LoadBalancerAttribute> = spec
            .attributes
            .iter()
            .map(|(k, v)| LoadBalancerAttribute::builder().key(k).value(v).build())
            .collect();
        self.elbv2
            .modify_load_balancer_attributes()
            .load_balancer_arn(arn)
            .set_attributes(Some(attributes))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        Ok(())
    }

    /// Deletes the load balancer unless deletion protection is enabled.
    pub async fn delete(&self, observed: &ObservedLoadBalancer) -> Result<()> {
        if observed
            .attributes
            .get("deletion_protection.enabled")
            .is_some_and(|v| v == "true")
        {
            return Err(Error::DeletionProtected(observed.arn.clone()));
        }
        info!(arn = %observed.arn, "deleting load balancer");
        match self
            .elbv2
            .delete_load_balancer()
            .load_balancer_arn(&observed.arn)
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)
        {
            Ok(_) => Ok(()),
            Err(aws_sdk_elasticloadbalancingv2::Error::LoadBalancerNotFoundException(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SecurityGroupConfig;
    use pretty_assertions::assert_eq;

    fn spec() -> LoadBalancerSpec {
        LoadBalancerSpec {
            name: "default-web-abc".to_string(),
            scheme: LbScheme::InternetFacing,
            ip_address_type: IpAddressType::Ipv4,
            subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            security_groups: SecurityGroupConfig::Explicit(vec!["sg-1".to_string()]),
            tags: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    fn observed() -> ObservedLoadBalancer {
        ObservedLoadBalancer {
            arn: "arn:lb".to_string(),
            dns_name: "lb.example.amazonaws.com".to_string(),
            ip_address_type: Some(IpAddressType::Ipv4),
            subnets: vec!["subnet-b".to_string(), "subnet-a".to_string()],
            security_groups: vec!["sg-1".to_string()],
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn subnet_comparison_ignores_order() {
        let spec = spec();
        let observed = observed();
        assert!(!subnets_differ(&spec.subnets, &observed.subnets));
        assert!(subnets_differ(&spec.subnets, &["subnet-a".to_string()]));
    }

    #[test]
    fn default_attributes_filtered_from_comparison() {
        let spec = spec();
        let mut observed = observed();
        observed
            .attributes
            .insert("idle_timeout.timeout_seconds".to_string(), "60".to_string());
        observed
            .attributes
            .insert("deletion_protection.enabled".to_string(), "false".to_string());
        assert!(!attributes_differ(&spec, &observed));

        observed
            .attributes
            .insert("idle_timeout.timeout_seconds".to_string(), "120".to_string());
        assert!(attributes_differ(&spec, &observed));
    }
}
