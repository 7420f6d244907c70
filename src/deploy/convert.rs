//! Conversions between the model's action/condition sums and their ELBv2
//! wire shapes, plus a normalized form used to compare desired against
//! observed without tripping on AWS-populated placeholder defaults.

use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::{
    Action as AwsAction, ActionTypeEnum, AuthenticateCognitoActionConfig,
    AuthenticateOidcActionConfig, FixedResponseActionConfig, HostHeaderConditionConfig,
    HttpHeaderConditionConfig, HttpRequestMethodConditionConfig, PathPatternConditionConfig,
    QueryStringConditionConfig, QueryStringKeyValuePair, RedirectActionConfig,
    RedirectActionStatusCodeEnum, RuleCondition as AwsRuleCondition, SourceIpConditionConfig,
};

use crate::error::{Error, Result};
use crate::model::{Action, RuleCondition, naming};

/// Order-insensitive, default-insensitive view of a rule action used for
/// drift detection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NormalizedAction {
    Forward {
        target_group_arn: String,
    },
    Redirect {
        protocol: String,
        port: String,
        host: String,
        path: String,
        query: String,
        status_code: String,
    },
    FixedResponse {
        content_type: String,
        message_body: String,
        status_code: String,
    },
    AuthenticateCognito {
        user_pool_arn: String,
        client_id: String,
        domain: String,
    },
    AuthenticateOidc {
        issuer: String,
        client_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NormalizedCondition {
    Host(Vec<String>),
    Path(Vec<String>),
    Header { name: String, values: Vec<String> },
    Query(Vec<(String, String)>),
    Method(Vec<String>),
    SourceIp(Vec<String>),
}

fn placeholder(value: &Option<String>, default: &str) -> String {
    value.clone().unwrap_or_else(|| default.to_string())
}

/// Resolves a model action to its ELBv2 form. Forward actions need the
/// target-group name→ARN map produced by the target-group pass.
pub fn aws_action(action: &Action, tg_arns: &BTreeMap<String, String>) -> Result<AwsAction> {
    let builder = match action {
        Action::Forward(key) => {
            let name = naming::target_group_name(key);
            let arn = tg_arns.get(&name).ok_or_else(|| {
                Error::MissingDependency(format!("target group {name} has no arn yet"))
            })?;
            AwsAction::builder()
                .r#type(ActionTypeEnum::Forward)
                .target_group_arn(arn)
        }
        Action::ForwardArn(arn) => AwsAction::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(arn),
        Action::Redirect(redirect) => AwsAction::builder()
            .r#type(ActionTypeEnum::Redirect)
            .redirect_config(
                RedirectActionConfig::builder()
                    .set_protocol(redirect.protocol.clone())
                    .set_port(redirect.port.clone())
                    .set_host(redirect.host.clone())
                    .set_path(redirect.path.clone())
                    .set_query(redirect.query.clone())
                    .status_code(RedirectActionStatusCodeEnum::from(
                        redirect.status_code.as_str(),
                    ))
                    .build(),
            ),
        Action::FixedResponse(fixed) => AwsAction::builder()
            .r#type(ActionTypeEnum::FixedResponse)
            .fixed_response_config(
                FixedResponseActionConfig::builder()
                    .set_content_type(fixed.content_type.clone())
                    .set_message_body(fixed.message_body.clone())
                    .status_code(&fixed.status_code)
                    .build(),
            ),
        Action::AuthenticateCognito(auth) => AwsAction::builder()
            .r#type(ActionTypeEnum::AuthenticateCognito)
            .authenticate_cognito_config(
                AuthenticateCognitoActionConfig::builder()
                    .user_pool_arn(&auth.user_pool_arn)
                    .user_pool_client_id(&auth.user_pool_client_id)
                    .user_pool_domain(&auth.user_pool_domain)
                    .set_authentication_request_extra_params(
                        (!auth.authentication_request_extra_params.is_empty()).then(|| {
                            auth.authentication_request_extra_params
                                .clone()
                                .into_iter()
                                .collect()
                        }),
                    )
                    .set_scope(auth.session.scope.clone())
                    .set_session_cookie_name(auth.session.session_cookie.clone())
                    .set_session_timeout(auth.session.session_timeout)
                    .set_on_unauthenticated_request(
                        auth.session
                            .on_unauthenticated_request
                            .as_deref()
                            .map(Into::into),
                    )
                    .build(),
            ),
        Action::AuthenticateOidc(auth) => AwsAction::builder()
            .r#type(ActionTypeEnum::AuthenticateOidc)
            .authenticate_oidc_config(
                AuthenticateOidcActionConfig::builder()
                    .issuer(&auth.issuer)
                    .authorization_endpoint(&auth.authorization_endpoint)
                    .token_endpoint(&auth.token_endpoint)
                    .user_info_endpoint(&auth.user_info_endpoint)
                    .client_id(&auth.client_id)
                    .client_secret(&auth.client_secret)
                    .set_scope(auth.session.scope.clone())
                    .set_session_cookie_name(auth.session.session_cookie.clone())
                    .set_session_timeout(auth.session.session_timeout)
                    .set_on_unauthenticated_request(
                        auth.session
                            .on_unauthenticated_request
                            .as_deref()
                            .map(Into::into),
                    )
                    .build()
                    .expect("oidc endpoints are set"),
            ),
    };
    Ok(builder.build().expect("action type is set"))
}

pub fn aws_actions(actions: &[Action], tg_arns: &BTreeMap<String, String>) -> Result<Vec<AwsAction>> {
    let mut out = Vec::with_capacity(actions.len());
    for (i, action) in actions.iter().enumerate() {
        let mut built = aws_action(action, tg_arns)?;
        built.order = Some(i as i32 + 1);
        out.push(built);
    }
    Ok(out)
}

pub fn normalize_model_actions(
    actions: &[Action],
    tg_arns: &BTreeMap<String, String>,
) -> Result<Vec<NormalizedAction>> {
    actions
        .iter()
        .map(|action| {
            Ok(match action {
                Action::Forward(key) => {
                    let name = naming::target_group_name(key);
                    let arn = tg_arns.get(&name).ok_or_else(|| {
                        Error::MissingDependency(format!("target group {name} has no arn yet"))
                    })?;
                    NormalizedAction::Forward {
                        target_group_arn: arn.clone(),
                    }
                }
                Action::ForwardArn(arn) => NormalizedAction::Forward {
                    target_group_arn: arn.clone(),
                },
                Action::Redirect(r) => NormalizedAction::Redirect {
                    protocol: placeholder(&r.protocol, "#{protocol}"),
                    port: placeholder(&r.port, "#{port}"),
                    host: placeholder(&r.host, "#{host}"),
                    path: placeholder(&r.path, "/#{path}"),
                    query: placeholder(&r.query, "#{query}"),
                    status_code: r.status_code.clone(),
                },
                Action::FixedResponse(f) => NormalizedAction::FixedResponse {
                    content_type: placeholder(&f.content_type, ""),
                    message_body: placeholder(&f.message_body, ""),
                    status_code: f.status_code.clone(),
                },
                Action::AuthenticateCognito(a) => NormalizedAction::AuthenticateCognito {
                    user_pool_arn: a.user_pool_arn.clone(),
                    client_id: a.user_pool_client_id.clone(),
                    domain: a.user_pool_domain.clone(),
                },
                Action::AuthenticateOidc(a) => NormalizedAction::AuthenticateOidc {
                    issuer: a.issuer.clone(),
                    client_id: a.client_id.clone(),
                },
            })
        })
        .collect()
}

pub fn normalize_aws_actions(actions: &[AwsAction]) -> Vec<NormalizedAction> {
    actions
        .iter()
        .filter_map(|action| {
            Some(match action.r#type()? {
                ActionTypeEnum::Forward => NormalizedAction::Forward {
                    target_group_arn: action.target_group_arn().unwrap_or_default().to_string(),
                },
                ActionTypeEnum::Redirect => {
                    let r = action.redirect_config()?;
                    NormalizedAction::Redirect {
                        protocol: r.protocol().unwrap_or("#{protocol}").to_string(),
                        port: r.port().unwrap_or("#{port}").to_string(),
                        host: r.host().unwrap_or("#{host}").to_string(),
                        path: r.path().unwrap_or("/#{path}").to_string(),
                        query: r.query().unwrap_or("#{query}").to_string(),
                        status_code: r.status_code().map(|s| s.as_str()).unwrap_or_default().to_string(),
                    }
                }
                ActionTypeEnum::FixedResponse => {
                    let f = action.fixed_response_config()?;
                    NormalizedAction::FixedResponse {
                        content_type: f.content_type().unwrap_or_default().to_string(),
                        message_body: f.message_body().unwrap_or_default().to_string(),
                        status_code: f.status_code().unwrap_or_default().to_string(),
                    }
                }
                ActionTypeEnum::AuthenticateCognito => {
                    let a = action.authenticate_cognito_config()?;
                    NormalizedAction::AuthenticateCognito {
                        user_pool_arn: a.user_pool_arn().unwrap_or_default().to_string(),
                        client_id: a.user_pool_client_id().unwrap_or_default().to_string(),
                        domain: a.user_pool_domain().unwrap_or_default().to_string(),
                    }
                }
                ActionTypeEnum::AuthenticateOidc => {
                    let a = action.authenticate_oidc_config()?;
                    NormalizedAction::AuthenticateOidc {
                        issuer: a.issuer().unwrap_or_default().to_string(),
                        client_id: a.client_id().unwrap_or_default().to_string(),
                    }
                }
                _ => return None,
            })
        })
        .collect()
}

pub fn aws_conditions(conditions: &[RuleCondition]) -> Vec<AwsRuleCondition> {
    conditions
        .iter()
        .map(|condition| match condition {
            RuleCondition::Host(values) => AwsRuleCondition::builder()
                .field("host-header")
                .host_header_config(
                    HostHeaderConditionConfig::builder()
                        .set_values(Some(values.clone()))
                        .build(),
                )
                .build(),
            RuleCondition::Path(values) => AwsRuleCondition::builder()
                .field("path-pattern")
                .path_pattern_config(
                    PathPatternConditionConfig::builder()
                        .set_values(Some(values.clone()))
                        .build(),
                )
                .build(),
            RuleCondition::HttpHeader { name, values } => AwsRuleCondition::builder()
                .field("http-header")
                .http_header_config(
                    HttpHeaderConditionConfig::builder()
                        .http_header_name(name)
                        .set_values(Some(values.clone()))
                        .build(),
                )
                .build(),
            RuleCondition::QueryString(pairs) => AwsRuleCondition::builder()
                .field("query-string")
                .query_string_config(
                    QueryStringConditionConfig::builder()
                        .set_values(Some(
                            pairs
                                .iter()
                                .map(|(k, v)| {
                                    QueryStringKeyValuePair::builder()
                                        .set_key((!k.is_empty()).then(|| k.clone()))
                                        .value(v)
                                        .build()
                                })
                                .collect(),
                        ))
                        .build(),
                )
                .build(),
            RuleCondition::HttpRequestMethod(values) => AwsRuleCondition::builder()
                .field("http-request-method")
                .http_request_method_config(
                    HttpRequestMethodConditionConfig::builder()
                        .set_values(Some(values.clone()))
                        .build(),
                )
                .build(),
            RuleCondition::SourceIp(values) => AwsRuleCondition::builder()
                .field("source-ip")
                .source_ip_config(
                    SourceIpConditionConfig::builder()
                        .set_values(Some(values.clone()))
                        .build(),
                )
                .build(),
        })
        .collect()
}

pub fn normalize_model_conditions(conditions: &[RuleCondition]) -> Vec<NormalizedCondition> {
    let mut out: Vec<NormalizedCondition> = conditions
        .iter()
        .map(|condition| match condition {
            RuleCondition::Host(v) => NormalizedCondition::Host(sorted(v)),
            RuleCondition::Path(v) => NormalizedCondition::Path(sorted(v)),
            RuleCondition::HttpHeader { name, values } => NormalizedCondition::Header {
                name: name.clone(),
                values: sorted(values),
            },
            RuleCondition::QueryString(pairs) => {
                let mut pairs = pairs.clone();
                pairs.sort();
                NormalizedCondition::Query(pairs)
            }
            RuleCondition::HttpRequestMethod(v) => NormalizedCondition::Method(sorted(v)),
            RuleCondition::SourceIp(v) => NormalizedCondition::SourceIp(sorted(v)),
        })
        .collect();
    out.sort();
    out
}

pub fn normalize_aws_conditions(conditions: &[AwsRuleCondition]) -> Vec<NormalizedCondition> {
    let mut out: Vec<NormalizedCondition> = conditions
        .iter()
        .filter_map(|condition| {
            Some(match condition.field()? {
                "host-header" => NormalizedCondition::Host(sorted(
                    condition.host_header_config().map(|c| c.values()).unwrap_or_default(),
                )),
                "path-pattern" => NormalizedCondition::Path(sorted(
                    condition.path_pattern_config().map(|c| c.values()).unwrap_or_default(),
                )),
                "http-header" => {
                    let c = condition.http_header_config()?;
                    NormalizedCondition::Header {
                        name: c.http_header_name().unwrap_or_default().to_string(),
                        values: sorted(c.values()),
                    }
                }
                "query-string" => {
                    let c = condition.query_string_config()?;
                    let mut pairs: Vec<(String, String)> = c
                        .values()
                        .iter()
                        .map(|p| {
                            (
                                p.key().unwrap_or_default().to_string(),
                                p.value().unwrap_or_default().to_string(),
                            )
                        })
                        .collect();
                    pairs.sort();
                    NormalizedCondition::Query(pairs)
                }
                "http-request-method" => NormalizedCondition::Method(sorted(
                    condition
                        .http_request_method_config()
                        .map(|c| c.values())
                        .unwrap_or_default(),
                )),
                "source-ip" => NormalizedCondition::SourceIp(sorted(
                    condition.source_ip_config().map(|c| c.values()).unwrap_or_default(),
                )),
                _ => return None,
            })
        })
        .collect();
    out.sort();
    out
}

fn sorted<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut out: Vec<String> = values.iter().map(|v| v.as_ref().to_string()).collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixedResponseSpec, RedirectSpec};
    use pretty_assertions::assert_eq;

    #[test]
    fn redirect_normalization_fills_placeholders() {
        let model = Action::Redirect(RedirectSpec {
            protocol: Some("HTTPS".to_string()),
            port: Some("443".to_string()),
            status_code: "HTTP_301".to_string(),
            ..Default::default()
        });
        let normalized = normalize_model_actions(&[model], &BTreeMap::new()).unwrap();
        assert_eq!(
            normalized,
            vec![NormalizedAction::Redirect {
                protocol: "HTTPS".to_string(),
                port: "443".to_string(),
                host: "#{host}".to_string(),
                path: "/#{path}".to_string(),
                query: "#{query}".to_string(),
                status_code: "HTTP_301".to_string(),
            }]
        );
    }

    #[test]
    fn desired_and_observed_forms_agree() {
        let model = vec![Action::FixedResponse(FixedResponseSpec {
            content_type: Some("text/plain".to_string()),
            message_body: None,
            status_code: "404".to_string(),
        })];
        let arns = BTreeMap::new();
        let wire = aws_actions(&model, &arns).unwrap();
        assert_eq!(
            normalize_model_actions(&model, &arns).unwrap(),
            normalize_aws_actions(&wire),
        );
    }

    #[test]
    fn condition_comparison_is_order_insensitive() {
        let a = vec![
            RuleCondition::Path(vec!["/a".to_string(), "/b".to_string()]),
            RuleCondition::Host(vec!["x.com".to_string()]),
        ];
        let b = vec![
            RuleCondition::Host(vec!["x.com".to_string()]),
            RuleCondition::Path(vec!["/b".to_string(), "/a".to_string()]),
        ];
        assert_eq!(normalize_model_conditions(&a), normalize_model_conditions(&b));
    }

    #[test]
    fn aws_condition_round_trip_normalizes_equal() {
        let model = vec![
            RuleCondition::Host(vec!["example.com".to_string()]),
            RuleCondition::QueryString(vec![("env".to_string(), "prod".to_string())]),
        ];
        let wire = aws_conditions(&model);
        assert_eq!(
            normalize_model_conditions(&model),
            normalize_aws_conditions(&wire),
        );
    }
}
