use crate::group::GroupId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Controller-wide error type. Variants map onto how the reconciler reacts:
/// validation and group conflicts drop the offending Ingress (or group) for
/// the cycle, dependency and AWS errors requeue with backoff, conflicts on
/// status writes requeue immediately.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("annotation {key}: {reason}")]
    InvalidAnnotation { key: String, reason: String },

    #[error("ingress group {group}: {detail}")]
    ConflictingGroup { group: GroupId, detail: String },

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("no issued certificate matches host {0}")]
    NoMatchingCert(String),

    #[error("multiple issued certificates match host {0}")]
    MultipleMatchingCerts(String),

    #[error("invalid subnet configuration: {0}")]
    InvalidSubnets(String),

    #[error("load balancer {0} has deletion protection enabled")]
    DeletionProtected(String),

    /// Ingress exists but is not claimed by this controller's class.
    #[error("ingress is not managed by this controller")]
    NotManaged,

    #[error("reconcile deadline exceeded while {0}")]
    DeadlineExceeded(&'static str),

    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("elbv2: {0}")]
    Elb(#[from] aws_sdk_elasticloadbalancingv2::Error),

    #[error("ec2: {0}")]
    Ec2(#[from] aws_sdk_ec2::Error),

    #[error("acm: {0}")]
    Acm(#[from] aws_sdk_acm::Error),

    #[error("iam: {0}")]
    Iam(#[from] aws_sdk_iam::Error),

    #[error("resource tagging: {0}")]
    Tagging(#[from] aws_sdk_resourcegroupstagging::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_annotation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidAnnotation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the cluster state an Ingress carries. These exclude
    /// the Ingress from its group for the cycle instead of failing the group.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidAnnotation { .. }
                | Error::NoMatchingCert(_)
                | Error::MultipleMatchingCerts(_)
        )
    }

    /// Optimistic-concurrency failure on a Kubernetes write.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }
}
