use std::sync::Arc;

use aws_sdk_acm::types::CertificateStatus;
use k8s_openapi::api::networking::v1::Ingress;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Matches a certificate domain (possibly wildcarded) against a host.
/// A `*.` wildcard covers exactly one label; comparison is case sensitive.
pub fn domain_matches(domain: &str, host: &str) -> bool {
    if let Some(tail) = domain.strip_prefix("*.") {
        match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == tail,
            None => false,
        }
    } else {
        domain == host
    }
}

/// Hosts an Ingress wants TLS for: rule hosts plus `spec.tls[].hosts`,
/// deduplicated in first-seen order.
pub fn tls_hosts(ingress: &Ingress) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    let mut push = |h: &str| {
        if !h.is_empty() && !hosts.iter().any(|x| x == h) {
            hosts.push(h.to_string());
        }
    };
    if let Some(spec) = &ingress.spec {
        for rule in spec.rules.iter().flatten() {
            if let Some(host) = &rule.host {
                push(host);
            }
        }
        for tls in spec.tls.iter().flatten() {
            for host in tls.hosts.iter().flatten() {
                push(host);
            }
        }
    }
    hosts
}

#[derive(Debug, Clone)]
pub struct CertEntry {
    pub arn: String,
    pub domains: Vec<String>,
}

/// Issued certificates known to the account, ACM first-class and IAM server
/// certificates as a second-chance pool.
#[derive(Debug, Default, Clone)]
pub struct CertInventory {
    pub acm: Vec<CertEntry>,
    pub iam: Vec<CertEntry>,
}

fn matching_arns<'a>(entries: &'a [CertEntry], host: &str) -> Vec<&'a str> {
    entries
        .iter()
        .filter(|e| e.domains.iter().any(|d| domain_matches(d, host)))
        .map(|e| e.arn.as_str())
        .collect()
}

/// Resolves each host against the inventory. ACM matches win outright; IAM is
/// consulted only when ACM has none. Exactly one certificate must match per
/// host. The result is the deduplicated union in host order.
pub fn resolve_hosts(inventory: &CertInventory, hosts: &[String]) -> Result<Vec<String>> {
    let mut arns: Vec<String> = Vec::new();
    for host in hosts {
        let mut matched = matching_arns(&inventory.acm, host);
        if matched.is_empty() {
            matched = matching_arns(&inventory.iam, host);
        }
        match matched.len() {
            0 => return Err(Error::NoMatchingCert(host.clone())),
            1 => {
                let arn = matched[0];
                if !arns.iter().any(|a| a == arn) {
                    arns.push(arn.to_string());
                }
            }
            _ => return Err(Error::MultipleMatchingCerts(host.clone())),
        }
    }
    Ok(arns)
}

/// Lazily builds the certificate inventory once per reconcile cycle. The
/// mutex is held across the build so concurrent model builders wait on one
/// ACM listing instead of issuing their own.
pub struct CertResolver {
    acm: aws_sdk_acm::Client,
    iam: aws_sdk_iam::Client,
    inventory: Mutex<Option<Arc<CertInventory>>>,
}

impl CertResolver {
    pub fn new(acm: aws_sdk_acm::Client, iam: aws_sdk_iam::Client) -> Self {
        CertResolver {
            acm,
            iam,
            inventory: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, hosts: &[String]) -> Result<Vec<String>> {
        let inventory = self.inventory().await?;
        resolve_hosts(&inventory, hosts)
    }

    pub async fn inventory(&self) -> Result<Arc<CertInventory>> {
        let mut slot = self.inventory.lock().await;
        if let Some(inv) = slot.as_ref() {
            return Ok(Arc::clone(inv));
        }
        let inv = Arc::new(CertInventory {
            acm: self.list_acm().await?,
            iam: self.list_iam().await?,
        });
        debug!(
            acm = inv.acm.len(),
            iam = inv.iam.len(),
            "built certificate inventory"
        );
        *slot = Some(Arc::clone(&inv));
        Ok(inv)
    }

    async fn list_acm(&self) -> Result<Vec<CertEntry>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .acm
                .list_certificates()
                .certificate_statuses(CertificateStatus::Issued)
                .set_next_token(token.clone())
                .send()
                .await
                .map_err(aws_sdk_acm::Error::from)?;
            for summary in out.certificate_summary_list() {
                let Some(arn) = summary.certificate_arn() else {
                    continue;
                };
                let detail = self
                    .acm
                    .describe_certificate()
                    .certificate_arn(arn)
                    .send()
                    .await
                    .map_err(aws_sdk_acm::Error::from)?;
                let domains = detail
                    .certificate()
                    .map(|c| c.subject_alternative_names().to_vec())
                    .unwrap_or_default();
                entries.push(CertEntry {
                    arn: arn.to_string(),
                    domains,
                });
            }
            let next = out.next_token().map(str::to_string);
            if next.is_none() || next == token {
                break;
            }
            token = next;
        }
        Ok(entries)
    }

    async fn list_iam(&self) -> Result<Vec<CertEntry>> {
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .iam
                .list_server_certificates()
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(aws_sdk_iam::Error::from)?;
            for meta in out.server_certificate_metadata_list() {
                entries.push(CertEntry {
                    arn: meta.arn().to_string(),
                    domains: vec![meta.server_certificate_name().to_string()],
                });
            }
            if !out.is_truncated() {
                break;
            }
            let next = out.marker().map(str::to_string);
            if next.is_none() || next == marker {
                break;
            }
            marker = next;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wildcard_covers_one_label() {
        assert!(domain_matches("*.a.b", "x.a.b"));
        assert!(!domain_matches("*.a.b", "a.b"));
        assert!(!domain_matches("*.a.b", "x.y.a.b"));
        assert!(domain_matches("a.b", "a.b"));
        // case sensitive
        assert!(!domain_matches("A.b", "a.b"));
    }

    fn entry(arn: &str, domains: &[&str]) -> CertEntry {
        CertEntry {
            arn: arn.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn single_acm_match_wins() {
        let inv = CertInventory {
            acm: vec![entry("arn:a", &["*.ex.com"]), entry("arn:b", &["other.com"])],
            iam: vec![],
        };
        let arns = resolve_hosts(&inv, &["api.ex.com".to_string()]).unwrap();
        assert_eq!(arns, vec!["arn:a".to_string()]);
    }

    #[test]
    fn no_match_is_an_error() {
        let inv = CertInventory {
            acm: vec![entry("arn:b", &["other.com"])],
            iam: vec![],
        };
        let err = resolve_hosts(&inv, &["api.ex.com".to_string()]).unwrap_err();
        assert!(matches!(err, Error::NoMatchingCert(h) if h == "api.ex.com"));
    }

    #[test]
    fn ambiguous_match_is_an_error() {
        let inv = CertInventory {
            acm: vec![entry("arn:a", &["*.ex.com"]), entry("arn:b", &["api.ex.com"])],
            iam: vec![],
        };
        let err = resolve_hosts(&inv, &["api.ex.com".to_string()]).unwrap_err();
        assert!(matches!(err, Error::MultipleMatchingCerts(_)));
    }

    #[test]
    fn iam_is_second_chance_only() {
        let inv = CertInventory {
            acm: vec![entry("arn:acm", &["api.ex.com"])],
            iam: vec![entry("arn:iam", &["api.ex.com"])],
        };
        let arns = resolve_hosts(&inv, &["api.ex.com".to_string()]).unwrap();
        assert_eq!(arns, vec!["arn:acm".to_string()]);

        let iam_only = CertInventory {
            acm: vec![],
            iam: vec![entry("arn:iam", &["legacy.ex.com"])],
        };
        let arns = resolve_hosts(&iam_only, &["legacy.ex.com".to_string()]).unwrap();
        assert_eq!(arns, vec!["arn:iam".to_string()]);
    }

    #[test]
    fn union_across_hosts_dedups() {
        let inv = CertInventory {
            acm: vec![entry("arn:a", &["*.ex.com"])],
            iam: vec![],
        };
        let arns = resolve_hosts(
            &inv,
            &["api.ex.com".to_string(), "www.ex.com".to_string()],
        )
        .unwrap();
        assert_eq!(arns, vec!["arn:a".to_string()]);
    }
}
