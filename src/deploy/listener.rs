use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::{Certificate, ProtocolEnum};
use tracing::info;

use crate::deploy::convert::{aws_actions, normalize_aws_actions, normalize_model_actions};
use crate::error::{Error, Result};
use crate::model::{ListenerSpec, Protocol};

#[derive(Debug, Clone)]
pub struct ObservedListener {
    pub arn: String,
    pub port: i32,
    pub protocol: Option<Protocol>,
    pub ssl_policy: Option<String>,
    /// Primary certificate ARN, when the listener is HTTPS.
    pub certificate: Option<String>,
    pub default_actions: Vec<aws_sdk_elasticloadbalancingv2::types::Action>,
}

fn protocol_enum(p: Protocol) -> ProtocolEnum {
    match p {
        Protocol::Http => ProtocolEnum::Http,
        Protocol::Https => ProtocolEnum::Https,
    }
}

/// True when an existing listener needs a ModifyListener call.
pub fn needs_update(
    spec: &ListenerSpec,
    observed: &ObservedListener,
    tg_arns: &BTreeMap<String, String>,
) -> Result<bool> {
    if observed.protocol != Some(spec.protocol) {
        return Ok(true);
    }
    if spec.protocol == Protocol::Https {
        if observed.ssl_policy != spec.ssl_policy {
            return Ok(true);
        }
        if observed.certificate.as_deref() != spec.certificates.first().map(String::as_str) {
            return Ok(true);
        }
    }
    Ok(normalize_model_actions(&spec.default_actions, tg_arns)?
        != normalize_aws_actions(&observed.default_actions))
}

pub struct ListenerManager<'a> {
    pub elbv2: &'a aws_sdk_elasticloadbalancingv2::Client,
}

impl ListenerManager<'_> {
    pub async fn observe(&self, lb_arn: &str) -> Result<Vec<ObservedListener>> {
        let mut listeners = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .elbv2
                .describe_listeners()
                .load_balancer_arn(lb_arn)
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            for listener in out.listeners() {
                let Some(arn) = listener.listener_arn() else {
                    continue;
                };
                listeners.push(ObservedListener {
                    arn: arn.to_string(),
                    port: listener.port().unwrap_or_default(),
                    protocol: listener.protocol().and_then(|p| match p {
                        ProtocolEnum::Http => Some(Protocol::Http),
                        ProtocolEnum::Https => Some(Protocol::Https),
                        _ => None,
                    }),
                    ssl_policy: listener.ssl_policy().map(str::to_string),
                    certificate: listener
                        .certificates()
                        .first()
                        .and_then(|c| c.certificate_arn())
                        .map(str::to_string),
                    default_actions: listener.default_actions().to_vec(),
                });
            }
            let next = out.next_marker().map(str::to_string);
            if next.is_none() || next == marker {
                break;
            }
            marker = next;
        }
        Ok(listeners)
    }

    pub async fn create(
        &self,
        lb_arn: &str,
        spec: &ListenerSpec,
        tg_arns: &BTreeMap<String, String>,
    ) -> Result<String> {
        info!(port = spec.port, protocol = %spec.protocol, "creating listener");
        let mut req = self
            .elbv2
            .create_listener()
            .load_balancer_arn(lb_arn)
            .port(spec.port)
            .protocol(protocol_enum(spec.protocol))
            .set_default_actions(Some(aws_actions(&spec.default_actions, tg_arns)?));
        if spec.protocol == Protocol::Https {
            if let Some(policy) = &spec.ssl_policy {
                req = req.ssl_policy(policy);
            }
            if let Some(primary) = spec.certificates.first() {
                req = req.certificates(
                    Certificate::builder().certificate_arn(primary).build(),
                );
            }
        }
        let out = req
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        let arn = out
            .listeners()
            .first()
            .and_then(|l| l.listener_arn())
            .ok_or_else(|| {
                Error::MissingDependency(format!("created listener :{} has no arn", spec.port))
            })?
            .to_string();
        self.sync_additional_certificates(&arn, spec).await?;
        Ok(arn)
    }

    pub async fn reconcile(
        &self,
        spec: &ListenerSpec,
        observed: &ObservedListener,
        tg_arns: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let mut mutated = false;
        if needs_update(spec, observed, tg_arns)? {
            info!(port = spec.port, "updating listener");
            let mut req = self
                .elbv2
                .modify_listener()
                .listener_arn(&observed.arn)
                .protocol(protocol_enum(spec.protocol))
                .set_default_actions(Some(aws_actions(&spec.default_actions, tg_arns)?));
            if spec.protocol == Protocol::Https {
                if let Some(policy) = &spec.ssl_policy {
                    req = req.ssl_policy(policy);
                }
                if let Some(primary) = spec.certificates.first() {
                    req = req.certificates(
                        Certificate::builder().certificate_arn(primary).build(),
                    );
                }
            }
            req.send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            mutated = true;
        }
        if spec.protocol == Protocol::Https {
            mutated |= self.sync_additional_certificates(&observed.arn, spec).await?;
        }
        Ok(mutated)
    }

    /// Converges the non-primary certificate set on an HTTPS listener.
    async fn sync_additional_certificates(
        &self,
        listener_arn: &str,
        spec: &ListenerSpec,
    ) -> Result<bool> {
        if spec.protocol != Protocol::Https || spec.certificates.len() <= 1 {
            return Ok(false);
        }
        let desired: Vec<&str> = spec.certificates[1..].iter().map(String::as_str).collect();
        let out = self
            .elbv2
            .describe_listener_certificates()
            .listener_arn(listener_arn)
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
        let current: Vec<String> = out
            .certificates()
            .iter()
            .filter(|c| !c.is_default().unwrap_or(false))
            .filter_map(|c| c.certificate_arn())
            .map(str::to_string)
            .collect();

        let mut mutated = false;
        let to_add: Vec<&str> = desired
            .iter()
            .copied()
            .filter(|d| !current.iter().any(|c| c == d))
            .collect();
        if !to_add.is_empty() {
            let certs = to_add
                .iter()
                .map(|arn| Certificate::builder().certificate_arn(*arn).build())
                .collect();
            self.elbv2
                .add_listener_certificates()
                .listener_arn(listener_arn)
                .set_certificates(Some(certs))
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            mutated = true;
        }
        for stale in current.iter().filter(|c| !desired.contains(&c.as_str())) {
            self.elbv2
                .remove_listener_certificates()
                .listener_arn(listener_arn)
                .certificates(Certificate::builder().certificate_arn(stale).build())
                .send()
                .await
                .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
            mutated = true;
        }
        Ok(mutated)
    }

    /// Deletes a listener; a listener that is already gone counts as deleted.
    pub async fn delete(&self, arn: &str) -> Result<()> {
        info!(%arn, "deleting listener");
        match self
            .elbv2
            .delete_listener()
            .listener_arn(arn)
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)
        {
            Ok(_) => Ok(()),
            Err(aws_sdk_elasticloadbalancingv2::Error::ListenerNotFoundException(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, FixedResponseSpec};
    use pretty_assertions::assert_eq;

    fn spec() -> ListenerSpec {
        ListenerSpec {
            port: 443,
            protocol: Protocol::Https,
            ssl_policy: Some("ELBSecurityPolicy-2016-08".to_string()),
            certificates: vec!["arn:cert-a".to_string()],
            default_actions: vec![Action::FixedResponse(FixedResponseSpec {
                content_type: Some("text/plain".to_string()),
                message_body: None,
                status_code: "404".to_string(),
            })],
            rules: vec![],
        }
    }

    fn observed() -> ObservedListener {
        let arns = BTreeMap::new();
        ObservedListener {
            arn: "arn:listener".to_string(),
            port: 443,
            protocol: Some(Protocol::Https),
            ssl_policy: Some("ELBSecurityPolicy-2016-08".to_string()),
            certificate: Some("arn:cert-a".to_string()),
            default_actions: aws_actions(&spec().default_actions, &arns).unwrap(),
        }
    }

    #[test]
    fn converged_listener_needs_no_update() {
        let arns = BTreeMap::new();
        assert_eq!(needs_update(&spec(), &observed(), &arns).unwrap(), false);
    }

    #[test]
    fn certificate_swap_is_an_update() {
        let arns = BTreeMap::new();
        let mut current = observed();
        current.certificate = Some("arn:cert-b".to_string());
        assert!(needs_update(&spec(), &current, &arns).unwrap());
    }

    #[test]
    fn ssl_policy_drift_is_an_update() {
        let arns = BTreeMap::new();
        let mut current = observed();
        current.ssl_policy = Some("ELBSecurityPolicy-TLS13-1-2-2021-06".to_string());
        assert!(needs_update(&spec(), &current, &arns).unwrap());
    }
}
