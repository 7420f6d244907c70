use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_ANNOTATION_PREFIX: &str = "alb.ingress.kubernetes.io";

/// Command-line surface of the controller. Election and healthz flags are
/// consumed by the process bootstrap; everything else feeds the reconcilers.
#[derive(Debug, Clone, Parser)]
#[command(name = "alb-ingress-controller", about = "Reconciles Ingress groups into AWS ALBs")]
pub struct Settings {
    /// Name of the cluster, used in ownership tags on every AWS resource.
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// IngressClass claimed by this controller.
    #[arg(long, default_value = "alb")]
    pub ingress_class: String,

    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    #[arg(long, env = "AWS_VPC_ID")]
    pub aws_vpc_id: Option<String>,

    /// Full resync interval in seconds.
    #[arg(long, default_value_t = 600)]
    pub sync_period: u64,

    /// Restrict watches to one namespace; all namespaces when unset.
    #[arg(long)]
    pub watch_namespace: Option<String>,

    /// Primary prefix for recognized Ingress/Service annotations.
    #[arg(long, default_value = DEFAULT_ANNOTATION_PREFIX)]
    pub annotation_prefix: String,

    #[arg(long, default_value_t = 10)]
    pub aws_max_retries: u32,

    /// Upper bound on a single reconcile attempt in seconds.
    #[arg(long, default_value_t = 60)]
    pub reconcile_timeout: u64,

    /// Tags applied to every managed AWS resource, as k=v pairs.
    #[arg(long, value_delimiter = ',')]
    pub default_tags: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub election: bool,

    #[arg(long, default_value = "alb-ingress-controller-leader")]
    pub election_id: String,

    #[arg(long)]
    pub election_namespace: Option<String>,

    #[arg(long, default_value_t = 10254)]
    pub healthz_port: u16,
}

impl Settings {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout)
    }

    /// `--default-tags` parsed into a map; later duplicates win.
    pub fn default_tag_map(&self) -> BTreeMap<String, String> {
        self.default_tags
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }

    pub fn cluster_ownership_tag(&self) -> String {
        format!("kubernetes.io/cluster/{}", self.cluster_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(extra: &[&str]) -> Settings {
        let mut args = vec!["alb-ingress-controller", "--cluster-name", "kube"];
        args.extend_from_slice(extra);
        Settings::parse_from(args)
    }

    #[test]
    fn defaults() {
        let s = settings(&[]);
        assert_eq!(s.ingress_class, "alb");
        assert_eq!(s.annotation_prefix, DEFAULT_ANNOTATION_PREFIX);
        assert_eq!(s.reconcile_timeout(), Duration::from_secs(60));
        assert_eq!(s.cluster_ownership_tag(), "kubernetes.io/cluster/kube");
    }

    #[test]
    fn default_tags_parse_as_map() {
        let s = settings(&["--default-tags", "team=infra,env=prod,env=stage"]);
        let tags = s.default_tag_map();
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
        // later duplicate wins
        assert_eq!(tags.get("env").map(String::as_str), Some("stage"));
    }
}
