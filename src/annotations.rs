use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Annotation suffixes recognized on Ingress and Service objects.
pub mod suffix {
    pub const GROUP_NAME: &str = "group.name";
    pub const GROUP_ORDER: &str = "group.order";
    pub const SCHEME: &str = "scheme";
    pub const IP_ADDRESS_TYPE: &str = "ip-address-type";
    pub const SUBNETS: &str = "subnets";
    pub const SECURITY_GROUPS: &str = "security-groups";
    pub const LISTEN_PORTS: &str = "listen-ports";
    pub const CERTIFICATE_ARN: &str = "certificate-arn";
    pub const ADDITIONAL_CERTIFICATE_ARN: &str = "additional-certificate-arn";
    pub const SSL_POLICY: &str = "ssl-policy";
    pub const SSL_REDIRECT: &str = "ssl-redirect";
    pub const HEALTHCHECK_PATH: &str = "healthcheck-path";
    pub const HEALTHCHECK_PORT: &str = "healthcheck-port";
    pub const HEALTHCHECK_PROTOCOL: &str = "healthcheck-protocol";
    pub const HEALTHCHECK_INTERVAL: &str = "healthcheck-interval-seconds";
    pub const HEALTHCHECK_TIMEOUT: &str = "healthcheck-timeout-seconds";
    pub const HEALTHY_THRESHOLD: &str = "healthy-threshold-count";
    pub const UNHEALTHY_THRESHOLD: &str = "unhealthy-threshold-count";
    pub const SUCCESS_CODES: &str = "success-codes";
    pub const BACKEND_PROTOCOL: &str = "backend-protocol";
    pub const TARGET_TYPE: &str = "target-type";
    pub const AUTH_TYPE: &str = "auth-type";
    pub const AUTH_IDP_COGNITO: &str = "auth-idp-cognito";
    pub const AUTH_IDP_OIDC: &str = "auth-idp-oidc";
    pub const AUTH_ON_UNAUTHENTICATED: &str = "auth-on-unauthenticated-request";
    pub const AUTH_SCOPE: &str = "auth-scope";
    pub const AUTH_SESSION_COOKIE: &str = "auth-session-cookie";
    pub const AUTH_SESSION_TIMEOUT: &str = "auth-session-timeout";
    pub const TAGS: &str = "tags";
    pub const LOAD_BALANCER_ATTRIBUTES: &str = "load-balancer-attributes";
    pub const TARGET_GROUP_ATTRIBUTES: &str = "target-group-attributes";
    pub const IGNORE_HOST_HEADER: &str = "ignore-host-header";
}

/// The annotation map of an object, or a shared empty map when unset.
pub fn annotations_or_empty(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> &Annotations {
    static EMPTY: std::sync::OnceLock<Annotations> = std::sync::OnceLock::new();
    meta.annotations
        .as_ref()
        .unwrap_or_else(|| EMPTY.get_or_init(Default::default))
}

/// Lookup options for a single parse call.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// The suffix is the complete key; no prefix is applied.
    pub exact: bool,
    /// Prefixes tried in order after the primary one.
    pub alternative_prefixes: Vec<String>,
}

impl ParseOptions {
    pub fn exact() -> Self {
        ParseOptions {
            exact: true,
            ..Default::default()
        }
    }

    pub fn with_alternatives<I: IntoIterator<Item = String>>(prefixes: I) -> Self {
        ParseOptions {
            exact: false,
            alternative_prefixes: prefixes.into_iter().collect(),
        }
    }
}

/// Resolves prefixed annotation suffixes against ordered sources. A source is
/// one object's annotation map; the first source containing the key wins, and
/// within a source the primary prefix is consulted before any alternatives.
#[derive(Debug, Clone)]
pub struct AnnotationParser {
    prefix: String,
}

pub type Annotations = BTreeMap<String, String>;

impl AnnotationParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        AnnotationParser {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn full_key(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.prefix)
    }

    fn lookup<'a>(
        &self,
        suffix: &str,
        sources: &[&'a Annotations],
        opts: &ParseOptions,
    ) -> Option<(String, &'a str)> {
        for source in sources {
            if opts.exact {
                if let Some(v) = source.get(suffix) {
                    return Some((suffix.to_string(), v.as_str()));
                }
                continue;
            }
            let primary = self.full_key(suffix);
            if let Some(v) = source.get(&primary) {
                return Some((primary, v.as_str()));
            }
            for alt in &opts.alternative_prefixes {
                let key = format!("{alt}/{suffix}");
                if let Some(v) = source.get(&key) {
                    return Some((key, v.as_str()));
                }
            }
        }
        None
    }

    pub fn parse_string(
        &self,
        suffix: &str,
        sources: &[&Annotations],
        opts: &ParseOptions,
    ) -> Option<String> {
        self.lookup(suffix, sources, opts).map(|(_, v)| v.to_string())
    }

    pub fn parse_bool(
        &self,
        suffix: &str,
        sources: &[&Annotations],
        opts: &ParseOptions,
    ) -> Result<Option<bool>> {
        match self.lookup(suffix, sources, opts) {
            None => Ok(None),
            Some((key, v)) => v
                .parse::<bool>()
                .map(Some)
                .map_err(|_| Error::invalid_annotation(key, format!("expected bool, got {v:?}"))),
        }
    }

    pub fn parse_i64(
        &self,
        suffix: &str,
        sources: &[&Annotations],
        opts: &ParseOptions,
    ) -> Result<Option<i64>> {
        match self.lookup(suffix, sources, opts) {
            None => Ok(None),
            Some((key, v)) => v
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::invalid_annotation(key, format!("expected integer, got {v:?}"))),
        }
    }

    /// Comma-separated list: items trimmed, empties dropped, order preserved.
    pub fn parse_string_slice(
        &self,
        suffix: &str,
        sources: &[&Annotations],
        opts: &ParseOptions,
    ) -> Option<Vec<String>> {
        self.lookup(suffix, sources, opts).map(|(_, v)| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// Comma-separated `k=v` pairs; a later duplicate key overrides an
    /// earlier one, and keys or values may be empty.
    pub fn parse_string_map(
        &self,
        suffix: &str,
        sources: &[&Annotations],
        opts: &ParseOptions,
    ) -> Option<BTreeMap<String, String>> {
        self.lookup(suffix, sources, opts).map(|(_, v)| {
            let mut out = BTreeMap::new();
            for pair in v.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                out.insert(k.trim().to_string(), v.trim().to_string());
            }
            out
        })
    }

    pub fn parse_json<T: DeserializeOwned>(
        &self,
        suffix: &str,
        sources: &[&Annotations],
        opts: &ParseOptions,
    ) -> Result<Option<T>> {
        match self.lookup(suffix, sources, opts) {
            None => Ok(None),
            Some((key, v)) => serde_json::from_str(v)
                .map(Some)
                .map_err(|e| Error::invalid_annotation(key, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn annotations(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parser() -> AnnotationParser {
        AnnotationParser::new("alb.ingress.kubernetes.io")
    }

    #[test]
    fn prefixed_lookup() {
        let src = annotations(&[("alb.ingress.kubernetes.io/scheme", "internal")]);
        let got = parser().parse_string("scheme", &[&src], &ParseOptions::default());
        assert_eq!(got, Some("internal".to_string()));
        assert_eq!(
            parser().parse_string("missing", &[&src], &ParseOptions::default()),
            None
        );
    }

    #[test]
    fn first_source_wins() {
        let svc = annotations(&[("alb.ingress.kubernetes.io/target-type", "ip")]);
        let ing = annotations(&[("alb.ingress.kubernetes.io/target-type", "instance")]);
        let got = parser().parse_string("target-type", &[&svc, &ing], &ParseOptions::default());
        assert_eq!(got, Some("ip".to_string()));
    }

    #[test]
    fn alternative_prefixes_after_primary() {
        let src = annotations(&[
            ("ingress.kubernetes.io/scheme", "internet-facing"),
            ("alb.ingress.kubernetes.io/scheme", "internal"),
        ]);
        let opts = ParseOptions::with_alternatives(vec!["ingress.kubernetes.io".to_string()]);
        assert_eq!(
            parser().parse_string("scheme", &[&src], &opts),
            Some("internal".to_string())
        );

        let alt_only = annotations(&[("ingress.kubernetes.io/scheme", "internet-facing")]);
        assert_eq!(
            parser().parse_string("scheme", &[&alt_only], &opts),
            Some("internet-facing".to_string())
        );
    }

    #[test]
    fn exact_bypasses_prefix() {
        let src = annotations(&[("kubernetes.io/ingress.class", "alb")]);
        assert_eq!(
            parser().parse_string("kubernetes.io/ingress.class", &[&src], &ParseOptions::exact()),
            Some("alb".to_string())
        );
        assert_eq!(
            parser().parse_string("kubernetes.io/ingress.class", &[&src], &ParseOptions::default()),
            None
        );
    }

    #[test]
    fn i64_rejects_garbage() {
        let src = annotations(&[("alb.ingress.kubernetes.io/group.order", "12x")]);
        let err = parser()
            .parse_i64("group.order", &[&src], &ParseOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAnnotation { .. }));

        let ok = annotations(&[("alb.ingress.kubernetes.io/group.order", " 7 ")]);
        assert_eq!(
            parser()
                .parse_i64("group.order", &[&ok], &ParseOptions::default())
                .unwrap(),
            Some(7)
        );
    }

    #[test]
    fn slice_trims_and_drops_empties() {
        let src = annotations(&[(
            "alb.ingress.kubernetes.io/subnets",
            " subnet-a, ,subnet-b ,subnet-c",
        )]);
        assert_eq!(
            parser().parse_string_slice("subnets", &[&src], &ParseOptions::default()),
            Some(vec![
                "subnet-a".to_string(),
                "subnet-b".to_string(),
                "subnet-c".to_string()
            ])
        );
    }

    #[test]
    fn map_later_duplicate_overrides() {
        let src = annotations(&[(
            "alb.ingress.kubernetes.io/tags",
            "env=prod,team=,env=stage",
        )]);
        let map = parser()
            .parse_string_map("tags", &[&src], &ParseOptions::default())
            .unwrap();
        assert_eq!(map.get("env").map(String::as_str), Some("stage"));
        assert_eq!(map.get("team").map(String::as_str), Some(""));
    }

    #[test]
    fn json_parses_typed() {
        let src = annotations(&[(
            "alb.ingress.kubernetes.io/listen-ports",
            r#"[{"HTTP": 80}, {"HTTPS": 443}]"#,
        )]);
        let ports: Option<Vec<BTreeMap<String, u16>>> = parser()
            .parse_json("listen-ports", &[&src], &ParseOptions::default())
            .unwrap();
        let ports = ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].get("HTTP"), Some(&80));

        let bad = annotations(&[("alb.ingress.kubernetes.io/listen-ports", "{nope")]);
        let err: Result<Option<serde_json::Value>> =
            parser().parse_json("listen-ports", &[&bad], &ParseOptions::default());
        assert!(err.is_err());
    }
}
