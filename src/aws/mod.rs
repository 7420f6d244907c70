//! AWS-facing layer: process-wide SDK clients, the describe cache, tagged
//! resource discovery, and retry policy.

pub mod cache;
pub mod inventory;
pub mod retry;
pub mod subnets;

use aws_config::{BehaviorVersion, Region, retry::RetryConfig};

/// Process-wide AWS service clients; cheap to clone and safe to share
/// across reconcile workers.
#[derive(Clone)]
pub struct AwsClients {
    pub elbv2: aws_sdk_elasticloadbalancingv2::Client,
    pub ec2: aws_sdk_ec2::Client,
    pub acm: aws_sdk_acm::Client,
    pub iam: aws_sdk_iam::Client,
    pub tagging: aws_sdk_resourcegroupstagging::Client,
}

impl AwsClients {
    pub async fn load(region: Option<String>, max_retries: u32) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).retry_config(
            RetryConfig::standard().with_max_attempts(max_retries.max(1)),
        );
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = loader.load().await;
        AwsClients {
            elbv2: aws_sdk_elasticloadbalancingv2::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            acm: aws_sdk_acm::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            tagging: aws_sdk_resourcegroupstagging::Client::new(&config),
        }
    }
}
