//! Assembles the desired [`Model`] for a group from a pre-fetched cluster
//! snapshot. Everything here is synchronous and deterministic: identical
//! inputs produce an identical model, which is what makes the differ's
//! idempotence guarantee hold.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::ResourceExt;

use crate::annotations::{AnnotationParser, Annotations, ParseOptions, annotations_or_empty, suffix};
use crate::certs::{CertInventory, resolve_hosts, tls_hosts};
use crate::crd::{IngressClassParamsSpec, IpAddressType, LbScheme, PortRef, TargetType};
use crate::endpoints::ServiceRef;
use crate::error::{Error, Result};
use crate::group::{Group, GroupId};
use crate::model::{
    Action, ActionAnnotation, AuthSession, BindingSpec, CognitoAuthSpec, ConditionAnnotation,
    FixedResponseSpec, HealthCheckSpec, ListenerSpec, LoadBalancerSpec, ManagedSecurityGroup,
    Model, OidcAuthSpec, OidcIdpAnnotation, Protocol, RedirectSpec, RuleCondition, RuleSpec,
    STACK_TAG, SecurityGroupConfig, SgPeer, SgRule, TargetGroupKey, TargetGroupSpec, naming,
};

const DEFAULT_SSL_POLICY: &str = "ELBSecurityPolicy-2016-08";

/// A subnet candidate resolved from annotations or role-tag discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetInfo {
    pub id: String,
    pub az: String,
}

/// Cluster state the builder consumes, fetched ahead of time so the build
/// itself stays pure.
#[derive(Default)]
pub struct ClusterSnapshot {
    pub services: BTreeMap<ServiceRef, Service>,
    /// Keyed `namespace/name`.
    pub secrets: BTreeMap<String, Secret>,
    pub certs: CertInventory,
    pub subnets: Vec<SubnetInfo>,
    pub class_params: Option<IngressClassParamsSpec>,
}

#[derive(Clone)]
pub struct BuildSettings {
    pub parser: AnnotationParser,
    pub cluster_name: String,
    pub default_tags: BTreeMap<String, String>,
}

pub struct BuildOutput {
    pub model: Model,
    /// Members dropped from this cycle with the validation error that
    /// excluded them; surfaced as events by the caller.
    pub rejected: Vec<(String, Error)>,
}

/// True when building this group will need the issued-certificate inventory:
/// some member wants HTTPS without an explicit `certificate-arn`.
pub fn needs_cert_inference(group: &Group, parser: &AnnotationParser) -> bool {
    group.active.iter().any(|ing| {
        let ann = annotations_or_empty(&ing.metadata);
        let explicit = parser
            .parse_string_slice(suffix::CERTIFICATE_ARN, &[ann], &ParseOptions::default())
            .is_some();
        !explicit && wants_https(parser, ann, ing)
    })
}

fn wants_https(parser: &AnnotationParser, ann: &Annotations, ingress: &Ingress) -> bool {
    if let Ok(Some(ports)) = parse_listen_ports(parser, ann) {
        return ports.iter().any(|(p, _)| *p == Protocol::Https);
    }
    // No listen-ports annotation: only explicit TLS configuration flips the
    // default away from HTTP. Rule hosts alone do not imply HTTPS; they only
    // participate in certificate matching once TLS is requested.
    if parser
        .parse_string_slice(suffix::CERTIFICATE_ARN, &[ann], &ParseOptions::default())
        .is_some()
    {
        return true;
    }
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.tls.as_ref())
        .is_some_and(|tls| !tls.is_empty())
}

/// Secrets referenced by `auth-idp-oidc` annotations, as `namespace/name`.
pub fn oidc_secret_refs(group: &Group, parser: &AnnotationParser) -> Vec<(String, String)> {
    let mut refs = BTreeSet::new();
    for ingress in &group.active {
        let ann = annotations_or_empty(&ingress.metadata);
        if let Ok(Some(idp)) =
            parser.parse_json::<OidcIdpAnnotation>(suffix::AUTH_IDP_OIDC, &[ann], &ParseOptions::default())
        {
            refs.insert((ingress.namespace().unwrap_or_default(), idp.secret_name));
        }
    }
    refs.into_iter().collect()
}

/// Services referenced by any backend of any active member.
pub fn referenced_services(group: &Group) -> Vec<ServiceRef> {
    let mut refs = BTreeSet::new();
    for ingress in &group.active {
        let ns = ingress.namespace().unwrap_or_default();
        let Some(spec) = &ingress.spec else { continue };
        if let Some(default_backend) = &spec.default_backend {
            if let Some(svc) = &default_backend.service {
                refs.insert(ServiceRef::new(ns.clone(), svc.name.clone()));
            }
        }
        for rule in spec.rules.iter().flatten() {
            for path in rule
                .http
                .iter()
                .flat_map(|h| h.paths.iter())
            {
                if let Some(svc) = &path.backend.service {
                    refs.insert(ServiceRef::new(ns.clone(), svc.name.clone()));
                }
            }
        }
    }
    refs.into_iter().collect()
}

struct MemberRule {
    conditions: Vec<RuleCondition>,
    actions: Vec<Action>,
    auth: Option<Action>,
}

struct MemberPlan {
    listen_ports: Vec<(Protocol, i32)>,
    certificates: Vec<String>,
    ssl_redirect: Option<i32>,
    default_forward: Option<Action>,
    rules: Vec<MemberRule>,
}

pub fn build(group: &Group, snapshot: &ClusterSnapshot, settings: &BuildSettings) -> Result<BuildOutput> {
    if group.active.is_empty() {
        return Err(Error::MissingDependency(format!(
            "group {} has no active members",
            group.id
        )));
    }
    let lb_name = naming::load_balancer_name(&group.id);

    let mut rejected: Vec<(String, Error)> = Vec::new();
    let mut plans: Vec<MemberPlan> = Vec::new();
    let mut tg_sources: BTreeMap<TargetGroupKey, usize> = BTreeMap::new();

    for (idx, ingress) in group.active.iter().enumerate() {
        match plan_member(ingress, snapshot, settings, &mut tg_sources, idx) {
            Ok(plan) => plans.push(plan),
            Err(e) if e.is_validation() => {
                rejected.push((member_name(ingress), e));
            }
            Err(e) => return Err(e),
        }
    }
    if plans.is_empty() {
        let detail = rejected
            .first()
            .map(|(name, e)| format!("{name}: {e}"))
            .unwrap_or_else(|| "all members rejected".to_string());
        return Err(Error::MissingDependency(format!(
            "group {} has no buildable members ({detail})",
            group.id
        )));
    }

    let load_balancer = build_load_balancer(group, snapshot, settings, &lb_name)?;
    let listeners = build_listeners(&group.id, &plans)?;
    let target_groups = build_target_groups(group, snapshot, settings, &tg_sources, &load_balancer.tags)?;
    let bindings = target_groups
        .iter()
        .map(|tg| BindingSpec {
            service: tg.key.service.clone(),
            port: tg.key.port.clone(),
            target_type: tg.target_type,
            target_group_name: tg.name.clone(),
        })
        .collect();

    let load_balancer =
        attach_managed_sg_rules(load_balancer, &listeners, &target_groups);

    Ok(BuildOutput {
        model: Model {
            load_balancer,
            listeners,
            target_groups,
            bindings,
        },
        rejected,
    })
}

fn member_name(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    )
}

fn parse_listen_ports(
    parser: &AnnotationParser,
    ann: &Annotations,
) -> Result<Option<Vec<(Protocol, i32)>>> {
    let raw: Option<Vec<BTreeMap<String, i32>>> =
        parser.parse_json(suffix::LISTEN_PORTS, &[ann], &ParseOptions::default())?;
    let Some(entries) = raw else { return Ok(None) };
    let mut ports = Vec::new();
    for entry in &entries {
        for (proto, port) in entry {
            let protocol = proto.parse::<Protocol>().map_err(|e| {
                Error::invalid_annotation(parser.full_key(suffix::LISTEN_PORTS), e)
            })?;
            if !(1..=65535).contains(port) {
                return Err(Error::invalid_annotation(
                    parser.full_key(suffix::LISTEN_PORTS),
                    format!("port {port} out of range"),
                ));
            }
            ports.push((protocol, *port));
        }
    }
    if ports.is_empty() {
        return Err(Error::invalid_annotation(
            parser.full_key(suffix::LISTEN_PORTS),
            "no ports listed",
        ));
    }
    Ok(Some(ports))
}

fn member_certificates(
    ingress: &Ingress,
    ann: &Annotations,
    snapshot: &ClusterSnapshot,
    parser: &AnnotationParser,
) -> Result<Vec<String>> {
    let mut certs = match parser.parse_string_slice(
        suffix::CERTIFICATE_ARN,
        &[ann],
        &ParseOptions::default(),
    ) {
        Some(explicit) => explicit,
        None => resolve_hosts(&snapshot.certs, &tls_hosts(ingress))?,
    };
    if let Some(additional) = parser.parse_string_slice(
        suffix::ADDITIONAL_CERTIFICATE_ARN,
        &[ann],
        &ParseOptions::default(),
    ) {
        for arn in additional {
            if !certs.contains(&arn) {
                certs.push(arn);
            }
        }
    }
    Ok(certs)
}

fn service_annotations<'a>(
    snapshot: &'a ClusterSnapshot,
    svc_ref: &ServiceRef,
) -> Option<&'a Annotations> {
    snapshot
        .services
        .get(svc_ref)
        .map(|svc| annotations_or_empty(&svc.metadata))
}

fn auth_action(
    ingress: &Ingress,
    sources: &[&Annotations],
    snapshot: &ClusterSnapshot,
    parser: &AnnotationParser,
) -> Result<Option<Action>> {
    let auth_type = parser
        .parse_string(suffix::AUTH_TYPE, sources, &ParseOptions::default())
        .unwrap_or_else(|| "none".to_string());
    let session = AuthSession {
        on_unauthenticated_request: parser.parse_string(
            suffix::AUTH_ON_UNAUTHENTICATED,
            sources,
            &ParseOptions::default(),
        ),
        scope: parser.parse_string(suffix::AUTH_SCOPE, sources, &ParseOptions::default()),
        session_cookie: parser.parse_string(
            suffix::AUTH_SESSION_COOKIE,
            sources,
            &ParseOptions::default(),
        ),
        session_timeout: parser.parse_i64(
            suffix::AUTH_SESSION_TIMEOUT,
            sources,
            &ParseOptions::default(),
        )?,
    };
    match auth_type.as_str() {
        "none" => Ok(None),
        "cognito" => {
            let mut idp: CognitoAuthSpec = parser
                .parse_json(suffix::AUTH_IDP_COGNITO, sources, &ParseOptions::default())?
                .ok_or_else(|| {
                    Error::invalid_annotation(
                        parser.full_key(suffix::AUTH_IDP_COGNITO),
                        "required when auth-type is cognito",
                    )
                })?;
            idp.session = session;
            Ok(Some(Action::AuthenticateCognito(idp)))
        }
        "oidc" => {
            let idp: OidcIdpAnnotation = parser
                .parse_json(suffix::AUTH_IDP_OIDC, sources, &ParseOptions::default())?
                .ok_or_else(|| {
                    Error::invalid_annotation(
                        parser.full_key(suffix::AUTH_IDP_OIDC),
                        "required when auth-type is oidc",
                    )
                })?;
            let ns = ingress.namespace().unwrap_or_default();
            let secret_key = format!("{ns}/{}", idp.secret_name);
            let secret = snapshot
                .secrets
                .get(&secret_key)
                .ok_or_else(|| Error::MissingDependency(format!("secret {secret_key} not found")))?;
            let (client_id, client_secret) = oidc_credentials(secret, &secret_key)?;
            Ok(Some(Action::AuthenticateOidc(OidcAuthSpec {
                issuer: idp.issuer,
                authorization_endpoint: idp.authorization_endpoint,
                token_endpoint: idp.token_endpoint,
                user_info_endpoint: idp.user_info_endpoint,
                client_id,
                client_secret,
                session,
            })))
        }
        other => Err(Error::invalid_annotation(
            parser.full_key(suffix::AUTH_TYPE),
            format!("unknown auth type {other:?}"),
        )),
    }
}

fn oidc_credentials(secret: &Secret, key: &str) -> Result<(String, String)> {
    let field = |name: &str| -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(name))
            .ok_or_else(|| Error::MissingDependency(format!("secret {key} missing key {name}")))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|_| Error::MissingDependency(format!("secret {key} key {name} is not UTF-8")))
    };
    Ok((field("clientID")?, field("clientSecret")?))
}

fn backend_action(
    ingress: &Ingress,
    backend: &IngressBackend,
    snapshot: &ClusterSnapshot,
    parser: &AnnotationParser,
    tg_sources: &mut BTreeMap<TargetGroupKey, usize>,
    member_idx: usize,
) -> Result<(Vec<Action>, Vec<RuleCondition>, Option<Action>)> {
    let ns = ingress.namespace().unwrap_or_default();
    let ing_ann = annotations_or_empty(&ingress.metadata);
    let svc = backend.service.as_ref().ok_or_else(|| {
        Error::invalid_annotation("backend", "only service backends are supported")
    })?;
    let svc_ref = ServiceRef::new(ns, svc.name.clone());
    let svc_ann = service_annotations(snapshot, &svc_ref);
    let sources: Vec<&Annotations> = svc_ann.into_iter().chain([ing_ann]).collect();

    // Extra conditions declared for this backend.
    let extra: Option<Vec<ConditionAnnotation>> = parser.parse_json(
        &format!("conditions.{}", svc.name),
        &[ing_ann],
        &ParseOptions::default(),
    )?;
    let extra_conditions = extra
        .map(|list| list.iter().map(condition_from_annotation).collect())
        .unwrap_or_default();

    let auth = auth_action(ingress, &sources, snapshot, parser)?;

    // An `actions.<svc>` annotation replaces the forward entirely.
    let annotated: Option<ActionAnnotation> = parser.parse_json(
        &format!("actions.{}", svc.name),
        &[ing_ann],
        &ParseOptions::default(),
    )?;
    if let Some(action) = annotated {
        let resolved = action_from_annotation(
            &action,
            ingress,
            snapshot,
            parser,
            tg_sources,
            member_idx,
        )?;
        return Ok((resolved, extra_conditions, auth));
    }

    let port = svc
        .port
        .as_ref()
        .and_then(|p| {
            p.number
                .map(PortRef::Number)
                .or_else(|| p.name.clone().map(PortRef::Name))
        })
        .ok_or_else(|| Error::invalid_annotation("backend", "service backend has no port"))?;
    let key = target_group_key(&svc_ref, port, parser, &sources)?;
    tg_sources.entry(key.clone()).or_insert(member_idx);
    Ok((vec![Action::Forward(key)], extra_conditions, auth))
}

fn action_from_annotation(
    annotation: &ActionAnnotation,
    ingress: &Ingress,
    snapshot: &ClusterSnapshot,
    parser: &AnnotationParser,
    tg_sources: &mut BTreeMap<TargetGroupKey, usize>,
    member_idx: usize,
) -> Result<Vec<Action>> {
    match annotation {
        ActionAnnotation::Redirect { redirect_config } => {
            Ok(vec![Action::Redirect(redirect_config.clone())])
        }
        ActionAnnotation::FixedResponse {
            fixed_response_config,
        } => Ok(vec![Action::FixedResponse(fixed_response_config.clone())]),
        ActionAnnotation::Forward {
            target_group_arn,
            forward_config,
        } => {
            if let Some(arn) = target_group_arn {
                return Ok(vec![Action::ForwardArn(arn.clone())]);
            }
            let config = forward_config.as_ref().ok_or_else(|| {
                Error::invalid_annotation("actions", "forward requires a target")
            })?;
            let entry = config.target_groups.first().ok_or_else(|| {
                Error::invalid_annotation("actions", "forward lists no target groups")
            })?;
            if let Some(arn) = &entry.target_group_arn {
                return Ok(vec![Action::ForwardArn(arn.clone())]);
            }
            let name = entry.service_name.as_ref().ok_or_else(|| {
                Error::invalid_annotation("actions", "forward target has no service")
            })?;
            let port = entry.service_port.clone().ok_or_else(|| {
                Error::invalid_annotation("actions", "forward target has no port")
            })?;
            let svc_ref = ServiceRef::new(ingress.namespace().unwrap_or_default(), name.clone());
            let svc_ann = service_annotations(snapshot, &svc_ref);
            let ing_ann = annotations_or_empty(&ingress.metadata);
            let sources: Vec<&Annotations> = svc_ann.into_iter().chain([ing_ann]).collect();
            let key = target_group_key(&svc_ref, port, parser, &sources)?;
            tg_sources.entry(key.clone()).or_insert(member_idx);
            Ok(vec![Action::Forward(key)])
        }
    }
}

fn condition_from_annotation(c: &ConditionAnnotation) -> RuleCondition {
    match c {
        ConditionAnnotation::HostHeader { host_header_config } => {
            RuleCondition::Host(host_header_config.values.clone())
        }
        ConditionAnnotation::PathPattern {
            path_pattern_config,
        } => RuleCondition::Path(path_pattern_config.values.clone()),
        ConditionAnnotation::HttpHeader { http_header_config } => RuleCondition::HttpHeader {
            name: http_header_config.http_header_name.clone(),
            values: http_header_config.values.clone(),
        },
        ConditionAnnotation::QueryString {
            query_string_config,
        } => RuleCondition::QueryString(
            query_string_config
                .values
                .iter()
                .map(|p| (p.key.clone().unwrap_or_default(), p.value.clone()))
                .collect(),
        ),
        ConditionAnnotation::HttpRequestMethod {
            http_request_method_config,
        } => RuleCondition::HttpRequestMethod(http_request_method_config.values.clone()),
        ConditionAnnotation::SourceIp { source_ip_config } => {
            RuleCondition::SourceIp(source_ip_config.values.clone())
        }
    }
}

fn target_group_key(
    svc_ref: &ServiceRef,
    port: PortRef,
    parser: &AnnotationParser,
    sources: &[&Annotations],
) -> Result<TargetGroupKey> {
    let target_type = match parser.parse_string(suffix::TARGET_TYPE, sources, &ParseOptions::default())
    {
        Some(raw) => raw.parse::<TargetType>().map_err(|e| {
            Error::invalid_annotation(parser.full_key(suffix::TARGET_TYPE), e)
        })?,
        None => TargetType::Instance,
    };
    let protocol = match parser.parse_string(
        suffix::BACKEND_PROTOCOL,
        sources,
        &ParseOptions::default(),
    ) {
        Some(raw) => raw.parse::<Protocol>().map_err(|e| {
            Error::invalid_annotation(parser.full_key(suffix::BACKEND_PROTOCOL), e)
        })?,
        None => Protocol::Http,
    };
    Ok(TargetGroupKey {
        service: svc_ref.clone(),
        port,
        target_type,
        protocol,
    })
}

fn plan_member(
    ingress: &Ingress,
    snapshot: &ClusterSnapshot,
    settings: &BuildSettings,
    tg_sources: &mut BTreeMap<TargetGroupKey, usize>,
    member_idx: usize,
) -> Result<MemberPlan> {
    let parser = &settings.parser;
    let ann = annotations_or_empty(&ingress.metadata);

    let wants_tls = wants_https(parser, ann, ingress);
    let certificates = if wants_tls {
        member_certificates(ingress, ann, snapshot, parser)?
    } else {
        Vec::new()
    };

    let listen_ports = match parse_listen_ports(parser, ann)? {
        Some(ports) => ports,
        None if !certificates.is_empty() => vec![(Protocol::Https, 443)],
        None => vec![(Protocol::Http, 80)],
    };
    if listen_ports.iter().any(|(p, _)| *p == Protocol::Https) && certificates.is_empty() {
        return Err(Error::invalid_annotation(
            parser.full_key(suffix::CERTIFICATE_ARN),
            "HTTPS listener requires a certificate",
        ));
    }

    let ssl_redirect = parser
        .parse_i64(suffix::SSL_REDIRECT, &[ann], &ParseOptions::default())?
        .map(|p| p as i32);

    let ignore_host = parser
        .parse_bool(suffix::IGNORE_HOST_HEADER, &[ann], &ParseOptions::default())?
        .unwrap_or(false);

    let default_forward = match ingress.spec.as_ref().and_then(|s| s.default_backend.as_ref()) {
        Some(backend) => {
            let (actions, _, _) =
                backend_action(ingress, backend, snapshot, parser, tg_sources, member_idx)?;
            actions.into_iter().next()
        }
        None => None,
    };

    let mut rules = Vec::new();
    for rule in ingress
        .spec
        .iter()
        .flat_map(|s| s.rules.iter().flatten())
    {
        let host_condition = rule
            .host
            .as_ref()
            .filter(|_| !ignore_host)
            .map(|h| RuleCondition::Host(vec![h.clone()]));
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            let (actions, extra_conditions, auth) = backend_action(
                ingress,
                &path.backend,
                snapshot,
                parser,
                tg_sources,
                member_idx,
            )?;
            let mut conditions = Vec::new();
            if let Some(host) = &host_condition {
                conditions.push(host.clone());
            }
            if let Some(p) = path.path.as_ref().filter(|p| !p.is_empty()) {
                let pattern = match path.path_type.as_str() {
                    "Prefix" if p != "/" => format!("{}/*", p.trim_end_matches('/')),
                    _ => p.clone(),
                };
                let mut values = vec![pattern];
                // A Prefix path also matches the bare path itself.
                if path.path_type == "Prefix" && p != "/" {
                    values.insert(0, p.trim_end_matches('/').to_string());
                }
                conditions.push(RuleCondition::Path(values));
            }
            conditions.extend(extra_conditions);
            rules.push(MemberRule {
                conditions,
                actions,
                auth,
            });
        }
    }

    Ok(MemberPlan {
        listen_ports,
        certificates,
        ssl_redirect,
        default_forward,
        rules,
    })
}

fn group_annotation_sources<'a>(group: &'a Group) -> Vec<&'a Annotations> {
    group
        .active
        .iter()
        .map(|ing| annotations_or_empty(&ing.metadata))
        .collect()
}

fn build_load_balancer(
    group: &Group,
    snapshot: &ClusterSnapshot,
    settings: &BuildSettings,
    lb_name: &str,
) -> Result<LoadBalancerSpec> {
    let parser = &settings.parser;
    let sources = group_annotation_sources(group);
    let params = snapshot.class_params.as_ref();

    let scheme = match params.and_then(|p| p.scheme) {
        Some(scheme) => scheme,
        None => parser
            .parse_string(suffix::SCHEME, &sources, &ParseOptions::default())
            .ok_or_else(|| {
                Error::invalid_annotation(parser.full_key(suffix::SCHEME), "scheme is required")
            })?
            .parse::<LbScheme>()
            .map_err(|e| Error::invalid_annotation(parser.full_key(suffix::SCHEME), e))?,
    };

    let ip_address_type = match params.and_then(|p| p.ip_address_type) {
        Some(t) => t,
        None => parser
            .parse_string(suffix::IP_ADDRESS_TYPE, &sources, &ParseOptions::default())
            .map(|raw| {
                raw.parse::<IpAddressType>().map_err(|e| {
                    Error::invalid_annotation(parser.full_key(suffix::IP_ADDRESS_TYPE), e)
                })
            })
            .transpose()?
            .unwrap_or(IpAddressType::Ipv4),
    };

    let subnets = validate_subnets(&snapshot.subnets)?;

    let mut attributes: BTreeMap<String, String> = parser
        .parse_string_map(
            suffix::LOAD_BALANCER_ATTRIBUTES,
            &sources,
            &ParseOptions::default(),
        )
        .unwrap_or_default();
    for kv in params.and_then(|p| p.load_balancer_attributes.as_ref()).into_iter().flatten() {
        attributes.insert(kv.key.clone(), kv.value.clone());
    }

    let mut tags = settings.default_tags.clone();
    if let Some(annotated) =
        parser.parse_string_map(suffix::TAGS, &sources, &ParseOptions::default())
    {
        tags.extend(annotated);
    }
    for kv in params.and_then(|p| p.tags.as_ref()).into_iter().flatten() {
        tags.insert(kv.key.clone(), kv.value.clone());
    }
    tags.insert(
        format!("kubernetes.io/cluster/{}", settings.cluster_name),
        crate::model::OWNED.to_string(),
    );
    tags.insert(STACK_TAG.to_string(), group.id.to_string());

    let security_groups = match parser.parse_string_slice(
        suffix::SECURITY_GROUPS,
        &sources,
        &ParseOptions::default(),
    ) {
        Some(ids) => SecurityGroupConfig::Explicit(ids),
        None => {
            let mut sg_tags = tags.clone();
            sg_tags.insert(
                crate::model::RESOURCE_TAG.to_string(),
                "LoadBalancer".to_string(),
            );
            SecurityGroupConfig::Managed(ManagedSecurityGroup {
                name: naming::managed_sg_name(lb_name),
                ingress: Vec::new(),
                tags: sg_tags,
                target_ingress: Vec::new(),
            })
        }
    };

    Ok(LoadBalancerSpec {
        name: lb_name.to_string(),
        scheme,
        ip_address_type,
        subnets,
        security_groups,
        tags,
        attributes,
    })
}

fn validate_subnets(candidates: &[SubnetInfo]) -> Result<Vec<String>> {
    if candidates.is_empty() {
        return Err(Error::InvalidSubnets("no subnets resolved".to_string()));
    }
    let mut by_az: BTreeMap<&str, &SubnetInfo> = BTreeMap::new();
    for subnet in candidates {
        if let Some(existing) = by_az.insert(subnet.az.as_str(), subnet) {
            return Err(Error::InvalidSubnets(format!(
                "{} and {} are both in {}",
                existing.id, subnet.id, subnet.az
            )));
        }
    }
    Ok(by_az.values().map(|s| s.id.clone()).collect())
}

fn build_listeners(group_id: &GroupId, plans: &[MemberPlan]) -> Result<Vec<ListenerSpec>> {
    // Port → protocol union, with conflicts rejected.
    let mut ports: BTreeMap<i32, Protocol> = BTreeMap::new();
    for plan in plans {
        for (protocol, port) in &plan.listen_ports {
            if let Some(existing) = ports.insert(*port, *protocol) {
                if existing != *protocol {
                    return Err(Error::ConflictingGroup {
                        group: group_id.clone(),
                        detail: format!("port {port} declared both {existing} and {protocol}"),
                    });
                }
            }
        }
    }

    let mut listeners = Vec::new();
    for (port, protocol) in ports {
        let mut certificates: Vec<String> = Vec::new();
        let mut rules: Vec<RuleSpec> = Vec::new();
        let mut default_actions: Option<Vec<Action>> = None;
        let mut ssl_redirect: Option<i32> = None;
        let mut priority = 1;

        for plan in plans {
            if !plan.listen_ports.iter().any(|(_, p)| *p == port) {
                continue;
            }
            if protocol == Protocol::Https {
                for cert in &plan.certificates {
                    if !certificates.contains(cert) {
                        certificates.push(cert.clone());
                    }
                }
            }
            if protocol == Protocol::Http {
                if let Some(target) = plan.ssl_redirect {
                    ssl_redirect.get_or_insert(target);
                    // redirected listeners carry no per-path rules
                    continue;
                }
            }
            for rule in &plan.rules {
                let mut actions = Vec::new();
                if protocol == Protocol::Https {
                    if let Some(auth) = &rule.auth {
                        actions.push(auth.clone());
                    }
                }
                actions.extend(rule.actions.iter().cloned());
                debug_assert!(actions.last().is_some_and(Action::is_terminal));
                rules.push(RuleSpec {
                    priority,
                    conditions: rule.conditions.clone(),
                    actions,
                });
                priority += 1;
            }
            if default_actions.is_none() {
                if let Some(fwd) = &plan.default_forward {
                    default_actions = Some(vec![fwd.clone()]);
                }
            }
        }

        let default_actions = match ssl_redirect {
            Some(target) => vec![Action::Redirect(RedirectSpec {
                protocol: Some("HTTPS".to_string()),
                port: Some(target.to_string()),
                status_code: "HTTP_301".to_string(),
                ..Default::default()
            })],
            None => default_actions.unwrap_or_else(|| {
                vec![Action::FixedResponse(FixedResponseSpec {
                    content_type: Some("text/plain".to_string()),
                    message_body: None,
                    status_code: "404".to_string(),
                })]
            }),
        };
        if ssl_redirect.is_some() {
            rules.clear();
        }

        listeners.push(ListenerSpec {
            port,
            protocol,
            ssl_policy: (protocol == Protocol::Https).then(|| DEFAULT_SSL_POLICY.to_string()),
            certificates,
            default_actions,
            rules,
        });
    }
    Ok(listeners)
}

fn build_target_groups(
    group: &Group,
    snapshot: &ClusterSnapshot,
    settings: &BuildSettings,
    tg_sources: &BTreeMap<TargetGroupKey, usize>,
    base_tags: &BTreeMap<String, String>,
) -> Result<Vec<TargetGroupSpec>> {
    let parser = &settings.parser;
    let mut specs = Vec::new();
    for (key, member_idx) in tg_sources {
        let ingress = &group.active[*member_idx];
        let ing_ann = annotations_or_empty(&ingress.metadata);
        let svc_ann = service_annotations(snapshot, &key.service);
        let sources: Vec<&Annotations> = svc_ann.into_iter().chain([ing_ann]).collect();

        let service = snapshot.services.get(&key.service).ok_or_else(|| {
            Error::MissingDependency(format!("service {} not found", key.service))
        })?;
        let port = target_group_port(service, key)?;

        let attributes = parser
            .parse_string_map(
                suffix::TARGET_GROUP_ATTRIBUTES,
                &sources,
                &ParseOptions::default(),
            )
            .unwrap_or_default();

        specs.push(TargetGroupSpec {
            name: naming::target_group_name(key),
            key: key.clone(),
            port,
            protocol: key.protocol,
            target_type: key.target_type,
            health_check: health_check(parser, &sources, key.protocol)?,
            attributes,
            tags: base_tags.clone(),
        });
    }
    Ok(specs)
}

fn target_group_port(service: &Service, key: &TargetGroupKey) -> Result<i32> {
    let ports = service.spec.as_ref().and_then(|s| s.ports.as_ref());
    let service_port = ports
        .into_iter()
        .flatten()
        .find(|sp| match &key.port {
            PortRef::Number(n) => sp.port == *n,
            PortRef::Name(name) => sp.name.as_deref() == Some(name.as_str()),
        })
        .ok_or_else(|| {
            Error::MissingDependency(format!(
                "service {} has no port {}",
                key.service, key.port
            ))
        })?;
    match key.target_type {
        TargetType::Instance => service_port.node_port.ok_or_else(|| {
            Error::MissingDependency(format!(
                "service {} port {} has no NodePort",
                key.service, key.port
            ))
        }),
        TargetType::Ip => Ok(match &service_port.target_port {
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n)) => *n,
            // named or unset target port: the registered targets carry the
            // real port, the TG port is nominal
            _ => service_port.port,
        }),
    }
}

fn health_check(
    parser: &AnnotationParser,
    sources: &[&Annotations],
    backend_protocol: Protocol,
) -> Result<HealthCheckSpec> {
    let defaults = HealthCheckSpec::default();
    let protocol = match parser.parse_string(
        suffix::HEALTHCHECK_PROTOCOL,
        sources,
        &ParseOptions::default(),
    ) {
        Some(raw) => raw.parse::<Protocol>().map_err(|e| {
            Error::invalid_annotation(parser.full_key(suffix::HEALTHCHECK_PROTOCOL), e)
        })?,
        None => backend_protocol,
    };
    Ok(HealthCheckSpec {
        path: parser
            .parse_string(suffix::HEALTHCHECK_PATH, sources, &ParseOptions::default())
            .unwrap_or(defaults.path),
        port: parser
            .parse_string(suffix::HEALTHCHECK_PORT, sources, &ParseOptions::default())
            .unwrap_or(defaults.port),
        protocol,
        interval_seconds: parser
            .parse_i64(suffix::HEALTHCHECK_INTERVAL, sources, &ParseOptions::default())?
            .map(|v| v as i32)
            .unwrap_or(defaults.interval_seconds),
        timeout_seconds: parser
            .parse_i64(suffix::HEALTHCHECK_TIMEOUT, sources, &ParseOptions::default())?
            .map(|v| v as i32)
            .unwrap_or(defaults.timeout_seconds),
        healthy_threshold: parser
            .parse_i64(suffix::HEALTHY_THRESHOLD, sources, &ParseOptions::default())?
            .map(|v| v as i32)
            .unwrap_or(defaults.healthy_threshold),
        unhealthy_threshold: parser
            .parse_i64(suffix::UNHEALTHY_THRESHOLD, sources, &ParseOptions::default())?
            .map(|v| v as i32)
            .unwrap_or(defaults.unhealthy_threshold),
        matcher: parser
            .parse_string(suffix::SUCCESS_CODES, sources, &ParseOptions::default())
            .unwrap_or(defaults.matcher),
    })
}

/// Fills the managed SG's permissions now that listener ports and target
/// group ports are known.
fn attach_managed_sg_rules(
    mut lb: LoadBalancerSpec,
    listeners: &[ListenerSpec],
    target_groups: &[TargetGroupSpec],
) -> LoadBalancerSpec {
    if let SecurityGroupConfig::Managed(managed) = &mut lb.security_groups {
        let mut ingress: Vec<SgRule> = listeners
            .iter()
            .map(|l| SgRule {
                protocol: "tcp".to_string(),
                from_port: l.port,
                to_port: l.port,
                peer: SgPeer::IpBlock("0.0.0.0/0".to_string()),
            })
            .collect();
        ingress.sort();
        ingress.dedup();
        managed.ingress = ingress;

        let mut target_ingress: Vec<SgRule> = target_groups
            .iter()
            .map(|tg| SgRule {
                protocol: "tcp".to_string(),
                from_port: tg.port,
                to_port: tg.port,
                peer: SgPeer::FrontendSg,
            })
            .collect();
        target_ingress.sort();
        target_ingress.dedup();
        managed.target_ingress = target_ingress;
    }
    lb
}
