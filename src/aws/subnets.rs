use std::sync::Arc;
use std::time::Duration;

use aws_sdk_ec2::types::Filter;

use crate::aws::cache::DescribeCache;
use crate::aws::inventory::Inventory;
use crate::crd::LbScheme;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::model::builder::SubnetInfo;

/// Subnet topology changes rarely; cache resolutions for an hour.
const SUBNET_TTL: Duration = Duration::from_secs(3600);

/// Resolves the `subnets` annotation (IDs or Name-tag values) or, absent the
/// annotation, discovers role-tagged cluster subnets.
#[derive(Clone)]
pub struct SubnetResolver {
    ec2: aws_sdk_ec2::Client,
    inventory: Inventory,
    cache: Arc<DescribeCache<Vec<SubnetInfo>>>,
    vpc_id: Option<String>,
}

impl SubnetResolver {
    pub fn new(
        ec2: aws_sdk_ec2::Client,
        inventory: Inventory,
        vpc_id: Option<String>,
        metrics: Metrics,
    ) -> Self {
        SubnetResolver {
            ec2,
            inventory,
            cache: Arc::new(DescribeCache::new("subnets", SUBNET_TTL, metrics)),
            vpc_id,
        }
    }

    pub async fn resolve(
        &self,
        annotation: Option<Vec<String>>,
        scheme: LbScheme,
    ) -> Result<Vec<SubnetInfo>> {
        match annotation {
            Some(values) if !values.is_empty() => {
                self.cache
                    .get_or_fetch("DescribeSubnets", &values, || {
                        self.describe_annotated(values.clone())
                    })
                    .await
            }
            _ => {
                let internal = scheme == LbScheme::Internal;
                self.cache
                    .get_or_fetch("DiscoverSubnets", &internal, || self.discover(internal))
                    .await
            }
        }
    }

    async fn describe_annotated(&self, values: Vec<String>) -> Result<Vec<SubnetInfo>> {
        let (ids, names): (Vec<String>, Vec<String>) =
            values.into_iter().partition(|v| v.starts_with("subnet-"));
        let mut subnets = Vec::new();
        if !ids.is_empty() {
            subnets.extend(self.describe(Some(ids), None).await?);
        }
        if !names.is_empty() {
            let filter = Filter::builder()
                .name("tag:Name")
                .set_values(Some(names))
                .build();
            subnets.extend(self.describe(None, Some(filter)).await?);
        }
        Ok(subnets)
    }

    async fn discover(&self, internal: bool) -> Result<Vec<SubnetInfo>> {
        let ids = self.inventory.subnets_by_role(internal).await?;
        if ids.is_empty() {
            return Err(Error::InvalidSubnets(
                "no role-tagged subnets discovered".to_string(),
            ));
        }
        self.describe(Some(ids), None).await
    }

    async fn describe(
        &self,
        ids: Option<Vec<String>>,
        filter: Option<Filter>,
    ) -> Result<Vec<SubnetInfo>> {
        let mut filters = Vec::new();
        if let Some(filter) = filter {
            filters.push(filter);
        }
        if let Some(vpc) = &self.vpc_id {
            filters.push(Filter::builder().name("vpc-id").values(vpc).build());
        }
        let out = self
            .ec2
            .describe_subnets()
            .set_subnet_ids(ids)
            .set_filters((!filters.is_empty()).then_some(filters))
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        let mut subnets: Vec<SubnetInfo> = out
            .subnets()
            .iter()
            .filter_map(|s| {
                Some(SubnetInfo {
                    id: s.subnet_id()?.to_string(),
                    az: s.availability_zone()?.to_string(),
                })
            })
            .collect();
        subnets.sort_by(|a, b| a.az.cmp(&b.az).then_with(|| a.id.cmp(&b.id)));
        Ok(subnets)
    }
}
