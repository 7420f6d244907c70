use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Secret, Service};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressClass, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
        watcher::Config,
    },
};
use tracing::{debug, error, info, warn};

use crate::annotations::{AnnotationParser, ParseOptions, annotations_or_empty, suffix};
use crate::aws::AwsClients;
use crate::aws::inventory::Inventory;
use crate::aws::subnets::SubnetResolver;
use crate::binding::BindingReconciler;
use crate::certs::CertResolver;
use crate::config::Settings;
use crate::crd::{
    IngressClassParams, LbScheme, NetworkingIngressRule, NetworkingPeer, NetworkingPort,
    NetworkingProtocol, ServiceReference, TargetGroupBinding, TargetGroupBindingNetworking,
    TargetGroupBindingSpec, TargetType,
};
use crate::deploy::{DeployOutcome, Deployer};
use crate::endpoints::EndpointResolver;
use crate::error::{Error, Result};
use crate::group::{Group, GroupBuilder, GroupId, GroupLocks, finalizer_for, matches_class};
use crate::metrics::Metrics;
use crate::model::builder::{
    BuildSettings, ClusterSnapshot, build, needs_cert_inference, oidc_secret_refs,
    referenced_services,
};
use crate::model::naming;

const MANAGER: &str = "alb-ingress-controller";
/// Label tying a TargetGroupBinding to the stack that created it.
const STACK_LABEL: &str = "ingress.k8s.aws/stack-name";

pub struct Ctx {
    pub client: Client,
    pub settings: Settings,
    pub parser: AnnotationParser,
    pub deployer: Arc<Deployer>,
    pub subnet_resolver: SubnetResolver,
    pub group_builder: Arc<GroupBuilder>,
    pub group_locks: GroupLocks,
    pub bindings: Arc<BindingReconciler>,
    pub metrics: Metrics,
    pub aws: AwsClients,
    pub recorder: Recorder,
}

pub async fn run_controllers(settings: Settings) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let metrics = Metrics::new();
    let aws = AwsClients::load(settings.aws_region.clone(), settings.aws_max_retries).await;
    let vpc_id = settings
        .aws_vpc_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--aws-vpc-id is required"))?;

    let parser = AnnotationParser::new(settings.annotation_prefix.clone());
    let inventory = Inventory::new(aws.tagging.clone(), &settings.cluster_name);
    let deployer = Arc::new(Deployer::new(
        aws.clone(),
        inventory.clone(),
        metrics.clone(),
        vpc_id.clone(),
        settings.cluster_ownership_tag(),
    ));
    let subnet_resolver = SubnetResolver::new(
        aws.ec2.clone(),
        inventory.clone(),
        Some(vpc_id),
        metrics.clone(),
    );
    let group_builder = Arc::new(GroupBuilder::new(
        client.clone(),
        parser.clone(),
        settings.ingress_class.clone(),
        settings.watch_namespace.clone(),
    ));
    let bindings = Arc::new(BindingReconciler {
        elbv2: aws.elbv2.clone(),
        resolver: EndpointResolver::new(client.clone()),
        metrics: metrics.clone(),
    });
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: MANAGER.into(),
            instance: None,
        },
    );

    let ctx = Arc::new(Ctx {
        client: client.clone(),
        settings,
        parser,
        deployer,
        subnet_resolver,
        group_builder,
        group_locks: GroupLocks::default(),
        bindings,
        metrics,
        aws,
        recorder,
    });

    let watch_ns = ctx.settings.watch_namespace.clone();
    let ingresses: Api<Ingress> = scoped_api(&client, watch_ns.as_deref());
    let services: Api<Service> = scoped_api(&client, watch_ns.as_deref());
    let ingress_controller = Controller::new(ingresses, Config::default());
    let ingress_store = ingress_controller.store();
    let ingress_controller = ingress_controller
        .watches(services, Config::default(), move |svc: Service| {
            let name = svc.name_any();
            let ns = svc.namespace().unwrap_or_default();
            ingress_store
                .state()
                .iter()
                .filter(|ing| ingress_references_service(ing, &ns, &name))
                .map(|ing| ObjectRef::from_obj(&**ing))
                .collect::<Vec<_>>()
        })
        .run(reconcile_ingress, ingress_error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((objref, _)) => debug!(ingress = %objref.name, "reconciled"),
                // ingresses of other classes are not ours to report on
                Err(kube::runtime::controller::Error::ReconcilerFailed(Error::NotManaged, _)) => {}
                Err(err) => error!(%err, "ingress reconcile failed"),
            }
        });

    let tgbs: Api<TargetGroupBinding> = scoped_api(&client, watch_ns.as_deref());
    let endpoints: Api<Endpoints> = scoped_api(&client, watch_ns.as_deref());
    let nodes: Api<Node> = Api::all(client.clone());
    let tgb_controller = Controller::new(tgbs, Config::default());
    let tgb_store = tgb_controller.store();
    let tgb_store_for_nodes = tgb_store.clone();
    let tgb_controller = tgb_controller
        .watches(endpoints, Config::default(), move |eps: Endpoints| {
            let name = eps.name_any();
            let ns = eps.namespace().unwrap_or_default();
            tgb_store
                .state()
                .iter()
                .filter(|tgb| {
                    tgb.namespace().as_deref() == Some(ns.as_str())
                        && tgb.spec.service_ref.name == name
                })
                .map(|tgb| ObjectRef::from_obj(&**tgb))
                .collect::<Vec<_>>()
        })
        .watches(nodes, Config::default(), move |_node: Node| {
            // any node transition may change the instance-mode target set
            tgb_store_for_nodes
                .state()
                .iter()
                .filter(|tgb| tgb.spec.target_type == Some(TargetType::Instance))
                .map(|tgb| ObjectRef::from_obj(&**tgb))
                .collect::<Vec<_>>()
        })
        .run(reconcile_binding, binding_error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((objref, _)) => debug!(binding = %objref.name, "reconciled"),
                Err(err) => error!(%err, "binding reconcile failed"),
            }
        });

    if ctx.settings.election {
        info!(
            id = %ctx.settings.election_id,
            namespace = ?ctx.settings.election_namespace,
            "leader election delegated to the process bootstrap"
        );
    }
    debug!(
        healthz_port = ctx.settings.healthz_port,
        "healthz served by the process bootstrap"
    );
    info!("starting controllers");
    futures_util::future::join(ingress_controller, tgb_controller).await;
    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn ingress_references_service(ingress: &Ingress, namespace: &str, name: &str) -> bool {
    if ingress.namespace().as_deref() != Some(namespace) {
        return false;
    }
    let Some(spec) = &ingress.spec else {
        return false;
    };
    let default_hit = spec
        .default_backend
        .as_ref()
        .and_then(|b| b.service.as_ref())
        .is_some_and(|s| s.name == name);
    default_hit
        || spec
            .rules
            .iter()
            .flatten()
            .flat_map(|r| r.http.iter().flat_map(|h| h.paths.iter()))
            .any(|p| p.backend.service.as_ref().is_some_and(|s| s.name == name))
}

async fn reconcile_ingress(ingress: Arc<Ingress>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let managed = matches_class(&ctx.parser, &ingress, &ctx.settings.ingress_class);
    let has_finalizer = ingress
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f.starts_with("ingress.k8s.aws/") || f.starts_with("group.ingress.k8s.aws/"));
    if !managed && !has_finalizer {
        return Err(Error::NotManaged);
    }

    let group_id = match ctx.group_builder.group_id(&ingress) {
        Ok(id) => id,
        Err(err) => {
            emit(&ctx, &ingress, EventType::Warning, "FailedBuildModel", &err.to_string()).await;
            return Ok(Action::await_change());
        }
    };

    let _guard = ctx.group_locks.lock(&group_id).await;
    let work = reconcile_group(&ctx, &group_id);
    match tokio::time::timeout(ctx.settings.reconcile_timeout(), work).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::DeadlineExceeded("reconciling group")),
    }
    Ok(Action::requeue(ctx.settings.sync_period()))
}

fn ingress_error_policy(ingress: Arc<Ingress>, err: &Error, ctx: Arc<Ctx>) -> Action {
    warn!(ingress = %ingress.name_any(), %err, "reconcile error");
    if let Error::Elb(_) | Error::Ec2(_) | Error::Acm(_) | Error::Iam(_) | Error::Tagging(_) = err {
        ctx.metrics.aws_error("aws", "reconcile");
    }
    if err.is_conflict() {
        return Action::requeue(Duration::ZERO);
    }
    match err {
        Error::NotManaged => Action::await_change(),
        Error::DeadlineExceeded(_) => Action::requeue(Duration::from_secs(10)),
        _ => Action::requeue(Duration::from_secs(30)),
    }
}

async fn reconcile_binding(
    binding: Arc<TargetGroupBinding>,
    ctx: Arc<Ctx>,
) -> Result<Action, Error> {
    ctx.bindings.reconcile(&binding).await?;
    Ok(Action::requeue(ctx.settings.sync_period()))
}

fn binding_error_policy(binding: Arc<TargetGroupBinding>, err: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(binding = %binding.name_any(), %err, "binding reconcile error");
    Action::requeue(Duration::from_secs(15))
}

/// Full build→diff→deploy cycle for one group, holding the group lock.
async fn reconcile_group(ctx: &Ctx, group_id: &GroupId) -> Result<()> {
    let mut group = ctx.group_builder.build(group_id).await?;
    update_managed_gauge(ctx, &group);

    if group.is_empty() {
        info!(group = %group_id, "group is empty; deprovisioning");
        ctx.deployer.deprovision(group_id).await?;
        cleanup_bindings(ctx, group_id, &BTreeMap::new()).await?;
        for ingress in group.leaving.clone() {
            clear_status(ctx, &ingress).await?;
            remove_finalizer(ctx, &ingress, group_id).await?;
        }
        return Ok(());
    }

    let class_params = fetch_class_params(ctx).await?;
    apply_namespace_selector(ctx, &mut group, class_params.as_ref()).await?;
    if group.active.is_empty() {
        return Err(Error::MissingDependency(format!(
            "group {group_id} has no members admitted by the ingress class"
        )));
    }

    for ingress in &group.active {
        ensure_finalizer(ctx, ingress, group_id).await?;
    }

    let snapshot = gather_snapshot(ctx, &group, class_params).await?;
    let settings = BuildSettings {
        parser: ctx.parser.clone(),
        cluster_name: ctx.settings.cluster_name.clone(),
        default_tags: ctx.settings.default_tag_map(),
    };
    let output = match build(&group, &snapshot, &settings) {
        Ok(output) => output,
        Err(err) => {
            for ingress in &group.active {
                emit(ctx, ingress, EventType::Warning, "FailedBuildModel", &err.to_string()).await;
            }
            return Err(err);
        }
    };
    for (member, err) in &output.rejected {
        warn!(group = %group_id, %member, %err, "member excluded from cycle");
        if let Some(ingress) = group
            .active
            .iter()
            .find(|i| format!("{}/{}", i.namespace().unwrap_or_default(), i.name_any()) == *member)
        {
            let reason = match err {
                Error::NoMatchingCert(_) | Error::MultipleMatchingCerts(_) => "CertificateNotFound",
                _ => "FailedBuildModel",
            };
            emit(ctx, ingress, EventType::Warning, reason, &err.to_string()).await;
        }
    }

    let outcome = match ctx.deployer.deploy(group_id, &output.model).await {
        Ok(outcome) => outcome,
        Err(err) => {
            for ingress in &group.active {
                emit(ctx, ingress, EventType::Warning, "FailedDeployModel", &err.to_string()).await;
            }
            return Err(err);
        }
    };

    debug!(group = %group_id, lb = %outcome.lb_arn, mutated = outcome.mutated, "model deployed");
    sync_bindings(ctx, group_id, &output.model, &outcome).await?;

    for ingress in &group.active {
        update_status(ctx, ingress, &outcome.lb_dns).await?;
        emit(
            ctx,
            ingress,
            EventType::Normal,
            "SuccessfullyReconciled",
            &outcome.lb_dns,
        )
        .await;
    }
    for ingress in group.leaving.clone() {
        clear_status(ctx, &ingress).await?;
        remove_finalizer(ctx, &ingress, group_id).await?;
    }
    Ok(())
}

async fn fetch_class_params(ctx: &Ctx) -> Result<Option<IngressClassParams>> {
    let classes: Api<IngressClass> = Api::all(ctx.client.clone());
    let class = match classes.get_opt(&ctx.settings.ingress_class).await? {
        Some(class) => class,
        None => return Ok(None),
    };
    let Some(params_ref) = class.spec.as_ref().and_then(|s| s.parameters.as_ref()) else {
        return Ok(None);
    };
    if params_ref.kind != "IngressClassParams" {
        return Ok(None);
    }
    let params: Api<IngressClassParams> = Api::all(ctx.client.clone());
    Ok(params.get_opt(&params_ref.name).await?)
}

/// Drops members whose namespace labels fail the class params selector.
async fn apply_namespace_selector(
    ctx: &Ctx,
    group: &mut Group,
    params: Option<&IngressClassParams>,
) -> Result<()> {
    let Some(selector) = params
        .and_then(|p| p.spec.namespace_selector.as_ref())
        .and_then(|s| s.match_labels.as_ref())
    else {
        return Ok(());
    };
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let mut admitted = Vec::new();
    for ingress in group.active.drain(..) {
        let ns_name = ingress.namespace().unwrap_or_default();
        let ns = namespaces.get_opt(&ns_name).await?;
        let labels = ns
            .as_ref()
            .and_then(|n| n.metadata.labels.as_ref())
            .cloned()
            .unwrap_or_default();
        if selector.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            admitted.push(ingress);
        } else {
            warn!(ingress = %ingress.name_any(), namespace = %ns_name, "namespace not admitted by class params");
        }
    }
    group.active = admitted;
    Ok(())
}

async fn gather_snapshot(
    ctx: &Ctx,
    group: &Group,
    class_params: Option<IngressClassParams>,
) -> Result<ClusterSnapshot> {
    let mut snapshot = ClusterSnapshot {
        class_params: class_params.map(|p| p.spec),
        ..Default::default()
    };

    for svc_ref in referenced_services(group) {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), &svc_ref.namespace);
        if let Some(service) = api.get_opt(&svc_ref.name).await? {
            snapshot.services.insert(svc_ref, service);
        }
    }

    for (ns, name) in oidc_secret_refs(group, &ctx.parser) {
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
        if let Some(secret) = api.get_opt(&name).await? {
            snapshot.secrets.insert(format!("{ns}/{name}"), secret);
        }
    }

    if needs_cert_inference(group, &ctx.parser) {
        let resolver = CertResolver::new(ctx.aws.acm.clone(), ctx.aws.iam.clone());
        snapshot.certs = (*resolver.inventory().await?).clone();
    }

    let sources: Vec<&crate::annotations::Annotations> = group
        .active
        .iter()
        .map(|i| annotations_or_empty(&i.metadata))
        .collect();
    let subnet_annotation =
        ctx.parser
            .parse_string_slice(suffix::SUBNETS, &sources, &ParseOptions::default());
    let scheme = snapshot
        .class_params
        .as_ref()
        .and_then(|p| p.scheme)
        .or_else(|| {
            ctx.parser
                .parse_string(suffix::SCHEME, &sources, &ParseOptions::default())
                .and_then(|raw| raw.parse::<LbScheme>().ok())
        });
    if let Some(scheme) = scheme {
        snapshot.subnets = ctx
            .subnet_resolver
            .resolve(subnet_annotation, scheme)
            .await?;
    }
    Ok(snapshot)
}

/// Upserts one TargetGroupBinding per model binding and prunes leftovers
/// from earlier cycles.
async fn sync_bindings(
    ctx: &Ctx,
    group_id: &GroupId,
    model: &crate::model::Model,
    outcome: &DeployOutcome,
) -> Result<()> {
    let stack_name = naming::load_balancer_name(group_id);
    let mut desired_names: BTreeMap<String, ()> = BTreeMap::new();

    for binding in &model.bindings {
        let Some(arn) = outcome.target_group_arns.get(&binding.target_group_name) else {
            continue;
        };
        desired_names.insert(binding.target_group_name.clone(), ());
        let networking = outcome
            .frontend_sg
            .as_ref()
            .map(|sg| TargetGroupBindingNetworking {
                ingress: vec![NetworkingIngressRule {
                    from: vec![NetworkingPeer::SecurityGroup {
                        group_id: sg.clone(),
                    }],
                    ports: vec![NetworkingPort {
                        protocol: Some(NetworkingProtocol::Tcp),
                        port: None,
                    }],
                }],
            });
        let mut tgb = TargetGroupBinding::new(
            &binding.target_group_name,
            TargetGroupBindingSpec {
                target_group_arn: Some(arn.clone()),
                target_group_name: Some(binding.target_group_name.clone()),
                target_type: Some(binding.target_type),
                service_ref: ServiceReference {
                    name: binding.service.name.clone(),
                    port: binding.port.clone(),
                },
                multi_cluster_target_group: false,
                networking,
            },
        );
        tgb.metadata.namespace = Some(binding.service.namespace.clone());
        tgb.metadata.labels = Some(
            [(STACK_LABEL.to_string(), stack_name.clone())]
                .into_iter()
                .collect(),
        );
        let api: Api<TargetGroupBinding> =
            Api::namespaced(ctx.client.clone(), &binding.service.namespace);
        api.patch(
            &binding.target_group_name,
            &PatchParams::apply(MANAGER).force(),
            &Patch::Apply(&tgb),
        )
        .await?;
    }

    cleanup_bindings(ctx, group_id, &desired_names).await
}

async fn cleanup_bindings(ctx: &Ctx, group_id: &GroupId, keep: &BTreeMap<String, ()>) -> Result<()> {
    let stack_name = naming::load_balancer_name(group_id);
    let api: Api<TargetGroupBinding> = Api::all(ctx.client.clone());
    let list = api
        .list(&ListParams::default().labels(&format!("{STACK_LABEL}={stack_name}")))
        .await?;
    for tgb in list.items {
        if keep.contains_key(&tgb.name_any()) {
            continue;
        }
        let ns = tgb.namespace().unwrap_or_default();
        let scoped: Api<TargetGroupBinding> = Api::namespaced(ctx.client.clone(), &ns);
        let _ = scoped.delete(&tgb.name_any(), &DeleteParams::default()).await;
    }
    Ok(())
}

async fn ensure_finalizer(ctx: &Ctx, ingress: &Ingress, group_id: &GroupId) -> Result<()> {
    let finalizer = finalizer_for(group_id);
    if ingress
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| *f == finalizer)
    {
        return Ok(());
    }
    let mut finalizers = ingress.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer);
    let api: Api<Ingress> =
        Api::namespaced(ctx.client.clone(), &ingress.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers }});
    api.patch(
        &ingress.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(ctx: &Ctx, ingress: &Ingress, group_id: &GroupId) -> Result<()> {
    let finalizer = finalizer_for(group_id);
    let remaining: Vec<String> = ingress
        .metadata
        .finalizers
        .iter()
        .flatten()
        .filter(|f| **f != finalizer)
        .cloned()
        .collect();
    let api: Api<Ingress> =
        Api::namespaced(ctx.client.clone(), &ingress.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining }});
    api.patch(
        &ingress.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Writes the LB hostname into Ingress status, only when it changed.
async fn update_status(ctx: &Ctx, ingress: &Ingress, hostname: &str) -> Result<()> {
    let current = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|list| list.first())
        .and_then(|entry| entry.hostname.as_deref());
    if current == Some(hostname) {
        return Ok(());
    }
    let status = IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: Some(vec![IngressLoadBalancerIngress {
                hostname: Some(hostname.to_string()),
                ..Default::default()
            }]),
        }),
    };
    let api: Api<Ingress> =
        Api::namespaced(ctx.client.clone(), &ingress.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &ingress.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    ctx.metrics.updates.inc();
    Ok(())
}

async fn clear_status(ctx: &Ctx, ingress: &Ingress) -> Result<()> {
    let has_hostname = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|list| !list.is_empty());
    if !has_hostname {
        return Ok(());
    }
    let api: Api<Ingress> =
        Api::namespaced(ctx.client.clone(), &ingress.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": { "loadBalancer": { "ingress": [] }}});
    api.patch_status(
        &ingress.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

fn update_managed_gauge(ctx: &Ctx, group: &Group) {
    let mut per_namespace: BTreeMap<String, i64> = BTreeMap::new();
    for ingress in &group.active {
        *per_namespace
            .entry(ingress.namespace().unwrap_or_default())
            .or_default() += 1;
    }
    for (ns, count) in per_namespace {
        ctx.metrics
            .managed_ingresses
            .with_label_values(&[ns.as_str()])
            .set(count);
    }
}

async fn emit(ctx: &Ctx, ingress: &Ingress, type_: EventType, reason: &str, note: &str) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note.to_string()),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(publish_err) = ctx.recorder.publish(&event, &ingress.object_ref(&())).await {
        debug!(%publish_err, "failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress_with_backend(ns: &str, svc: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some("ing".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: None,
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: svc.to_string(),
                                    port: None,
                                }),
                                resource: None,
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_event_maps_to_referencing_ingresses() {
        let ing = ingress_with_backend("default", "web");
        assert!(ingress_references_service(&ing, "default", "web"));
        assert!(!ingress_references_service(&ing, "default", "other"));
        assert!(!ingress_references_service(&ing, "kube-system", "web"));
    }
}
