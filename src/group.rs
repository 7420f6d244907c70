use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client, Resource, ResourceExt, api::ListParams};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::annotations::{AnnotationParser, ParseOptions, suffix};
use crate::error::{Error, Result};

/// Legacy class annotation, looked up with exact matching.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

const IMPLICIT_FINALIZER: &str = "ingress.k8s.aws/resources";
const EXPLICIT_FINALIZER_PREFIX: &str = "group.ingress.k8s.aws/";

/// Identity of an ingress group: an explicit name shared across members, or
/// the namespace/name of a standalone Ingress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupId {
    Explicit(String),
    Implicit { namespace: String, name: String },
}

impl GroupId {
    pub fn implicit(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        GroupId::Implicit {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, GroupId::Explicit(_))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Explicit(name) => f.write_str(name),
            GroupId::Implicit { namespace, name } => write!(f, "{namespace}/{name}"),
        }
    }
}

/// Finalizer recorded on members of a group. Explicit groups get a
/// group-specific finalizer so a member that moves between groups can still
/// be recognized as leaving the old one.
pub fn finalizer_for(id: &GroupId) -> String {
    match id {
        GroupId::Explicit(name) => format!("{EXPLICIT_FINALIZER_PREFIX}{name}"),
        GroupId::Implicit { .. } => IMPLICIT_FINALIZER.to_string(),
    }
}

fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub active: Vec<Ingress>,
    pub leaving: Vec<Ingress>,
}

impl Group {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Annotation suffixes that configure the shared load balancer; members of an
/// explicit group must not disagree on these.
const LB_LEVEL_SUFFIXES: &[&str] = &[
    suffix::SCHEME,
    suffix::IP_ADDRESS_TYPE,
    suffix::SUBNETS,
    suffix::LOAD_BALANCER_ATTRIBUTES,
];

pub struct GroupBuilder {
    client: Client,
    parser: AnnotationParser,
    ingress_class: String,
    watch_namespace: Option<String>,
}

impl GroupBuilder {
    pub fn new(
        client: Client,
        parser: AnnotationParser,
        ingress_class: String,
        watch_namespace: Option<String>,
    ) -> Self {
        GroupBuilder {
            client,
            parser,
            ingress_class,
            watch_namespace,
        }
    }

    /// Resolves the group an Ingress declares: the validated `group.name`
    /// annotation, or the implicit per-Ingress singleton.
    pub fn group_id(&self, ingress: &Ingress) -> Result<GroupId> {
        group_id(&self.parser, ingress)
    }

    pub fn matches_class(&self, ingress: &Ingress) -> bool {
        matches_class(&self.parser, ingress, &self.ingress_class)
    }

    pub async fn build(&self, id: &GroupId) -> Result<Group> {
        let api: Api<Ingress> = match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let all = api.list(&ListParams::default()).await?;
        let candidates: Vec<Ingress> = all
            .items
            .into_iter()
            .filter(|ing| self.matches_class(ing) || has_finalizer(ing, id))
            .collect();
        partition(id, candidates, &self.parser)
    }
}

pub fn group_id(parser: &AnnotationParser, ingress: &Ingress) -> Result<GroupId> {
    match parser.parse_string(suffix::GROUP_NAME, &[ingress_annotations(ingress)], &ParseOptions::default())
    {
        Some(name) => {
            if !is_valid_group_name(&name) {
                return Err(Error::invalid_annotation(
                    parser.full_key(suffix::GROUP_NAME),
                    format!("invalid group name {name:?}"),
                ));
            }
            Ok(GroupId::Explicit(name))
        }
        None => Ok(GroupId::implicit(
            ingress.namespace().unwrap_or_default(),
            ingress.name_any(),
        )),
    }
}

pub fn matches_class(parser: &AnnotationParser, ingress: &Ingress, class: &str) -> bool {
    if let Some(spec_class) = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref())
    {
        return spec_class == class;
    }
    parser
        .parse_string(
            INGRESS_CLASS_ANNOTATION,
            &[ingress_annotations(ingress)],
            &ParseOptions::exact(),
        )
        .is_some_and(|v| v == class)
}

fn ingress_annotations(ingress: &Ingress) -> &crate::annotations::Annotations {
    crate::annotations::annotations_or_empty(&ingress.metadata)
}

fn has_finalizer(ingress: &Ingress, id: &GroupId) -> bool {
    let wanted = finalizer_for(id);
    ingress
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| *f == wanted)
}

fn namespaced_name(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    )
}

/// Splits candidates into active and leaving members of `id`, ordering active
/// members by (`group.order` asc, namespace/name asc). Rule priorities are
/// later allocated in this order, so it must be total and deterministic.
pub fn partition(
    id: &GroupId,
    candidates: Vec<Ingress>,
    parser: &AnnotationParser,
) -> Result<Group> {
    let mut active: Vec<(i64, String, Ingress)> = Vec::new();
    let mut leaving: Vec<Ingress> = Vec::new();

    for ingress in candidates {
        let resolves_here = match group_id(parser, &ingress) {
            Ok(resolved) => resolved == *id,
            // A member with a malformed group annotation cannot be active,
            // but may still be leaving.
            Err(_) => false,
        };
        let deleting = ingress.meta().deletion_timestamp.is_some();

        if resolves_here && !deleting {
            let order = parser
                .parse_i64(
                    suffix::GROUP_ORDER,
                    &[ingress_annotations(&ingress)],
                    &ParseOptions::default(),
                )?
                .unwrap_or(0);
            active.push((order, namespaced_name(&ingress), ingress));
        } else if has_finalizer(&ingress, id) {
            leaving.push(ingress);
        }
    }

    if id.is_explicit() {
        check_duplicate_orders(id, &active, parser)?;
        check_lb_conflicts(id, &active, parser)?;
    } else if active.len() > 1 {
        return Err(Error::ConflictingGroup {
            group: id.clone(),
            detail: format!("{} active members in an implicit group", active.len()),
        });
    }

    active.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    leaving.sort_by_key(namespaced_name);

    Ok(Group {
        id: id.clone(),
        active: active.into_iter().map(|(_, _, ing)| ing).collect(),
        leaving,
    })
}

fn check_duplicate_orders(
    id: &GroupId,
    active: &[(i64, String, Ingress)],
    parser: &AnnotationParser,
) -> Result<()> {
    let mut seen: HashMap<i64, &str> = HashMap::new();
    for (order, name, ingress) in active {
        let explicit = parser
            .parse_i64(
                suffix::GROUP_ORDER,
                &[ingress_annotations(ingress)],
                &ParseOptions::default(),
            )?
            .is_some();
        if !explicit {
            continue;
        }
        if let Some(other) = seen.insert(*order, name.as_str()) {
            return Err(Error::ConflictingGroup {
                group: id.clone(),
                detail: format!("{name} and {other} both declare group.order {order}"),
            });
        }
    }
    Ok(())
}

fn check_lb_conflicts(
    id: &GroupId,
    active: &[(i64, String, Ingress)],
    parser: &AnnotationParser,
) -> Result<()> {
    for sfx in LB_LEVEL_SUFFIXES {
        let mut first: Option<(&str, String)> = None;
        for (_, name, ingress) in active {
            let Some(value) = parser.parse_string(
                sfx,
                &[ingress_annotations(ingress)],
                &ParseOptions::default(),
            ) else {
                continue;
            };
            match &first {
                None => first = Some((name, value)),
                Some((other, existing)) if *existing != value => {
                    return Err(Error::ConflictingGroup {
                        group: id.clone(),
                        detail: format!("{name} and {other} disagree on {sfx}"),
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Per-group mutual exclusion across reconcile workers. kube-runtime already
/// serializes per Ingress; this extends the guarantee to whole groups.
#[derive(Clone, Default)]
pub struct GroupLocks {
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl GroupLocks {
    pub async fn lock(&self, id: &GroupId) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().expect("group lock map poisoned");
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::IngressSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use pretty_assertions::assert_eq;

    const PREFIX: &str = "alb.ingress.kubernetes.io";

    fn parser() -> AnnotationParser {
        AnnotationParser::new(PREFIX)
    }

    fn ingress(ns: &str, name: &str, annotations: &[(&str, &str)]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (format!("{PREFIX}/{k}"), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("alb".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn implicit_group_id_is_namespaced_name() {
        let ing = ingress("default", "web", &[]);
        assert_eq!(
            group_id(&parser(), &ing).unwrap(),
            GroupId::implicit("default", "web")
        );
    }

    #[test]
    fn explicit_group_name_is_validated() {
        let ok = ingress("default", "web", &[("group.name", "shared-lb")]);
        assert_eq!(
            group_id(&parser(), &ok).unwrap(),
            GroupId::Explicit("shared-lb".to_string())
        );
        let bad = ingress("default", "web", &[("group.name", "-Bad!")]);
        assert!(group_id(&parser(), &bad).is_err());
    }

    #[test]
    fn active_members_sorted_by_order_then_name() {
        let id = GroupId::Explicit("g".to_string());
        let group = partition(
            &id,
            vec![
                ingress("default", "b", &[("group.name", "g"), ("group.order", "2")]),
                ingress("default", "a", &[("group.name", "g"), ("group.order", "1")]),
                ingress("default", "c", &[("group.name", "g")]),
            ],
            &parser(),
        )
        .unwrap();
        let names: Vec<String> = group.active.iter().map(|i| i.name_any()).collect();
        // unset order sorts as 0, before explicit 1 and 2
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(group.leaving.is_empty());
    }

    #[test]
    fn duplicate_explicit_order_is_conflict() {
        let id = GroupId::Explicit("g".to_string());
        let err = partition(
            &id,
            vec![
                ingress("default", "a", &[("group.name", "g"), ("group.order", "1")]),
                ingress("default", "b", &[("group.name", "g"), ("group.order", "1")]),
            ],
            &parser(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConflictingGroup { .. }));
    }

    #[test]
    fn lb_level_disagreement_is_conflict() {
        let id = GroupId::Explicit("g".to_string());
        let err = partition(
            &id,
            vec![
                ingress("default", "a", &[("group.name", "g"), ("scheme", "internal")]),
                ingress(
                    "default",
                    "b",
                    &[("group.name", "g"), ("scheme", "internet-facing")],
                ),
            ],
            &parser(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConflictingGroup { .. }));
    }

    #[test]
    fn departed_member_with_finalizer_is_leaving() {
        let id = GroupId::Explicit("g".to_string());
        let mut gone = ingress("default", "old", &[]);
        gone.metadata.finalizers = Some(vec![finalizer_for(&id)]);

        let mut deleting = ingress("default", "dying", &[("group.name", "g")]);
        deleting.metadata.finalizers = Some(vec![finalizer_for(&id)]);
        deleting.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        let group = partition(
            &id,
            vec![
                ingress("default", "live", &[("group.name", "g")]),
                gone,
                deleting,
            ],
            &parser(),
        )
        .unwrap();
        let active: Vec<String> = group.active.iter().map(|i| i.name_any()).collect();
        let leaving: Vec<String> = group.leaving.iter().map(|i| i.name_any()).collect();
        assert_eq!(active, vec!["live"]);
        assert_eq!(leaving, vec!["dying", "old"]);
    }

    #[test]
    fn finalizers_distinguish_group_flavors() {
        assert_eq!(
            finalizer_for(&GroupId::Explicit("g".to_string())),
            "group.ingress.k8s.aws/g"
        );
        assert_eq!(
            finalizer_for(&GroupId::implicit("default", "web")),
            "ingress.k8s.aws/resources"
        );
    }
}
