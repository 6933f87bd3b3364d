//! The injector's layered configuration model.
//!
//! Every setting is an annotation under `mesh.nebula.technology/`. The
//! effective value for a pod is resolved per key, last writer wins: the pod's
//! own annotations override its namespace's annotations, which override the
//! cluster defaults file. The merged configuration is embedded verbatim into
//! the injected sidecar's environment, so proxy behaviour is a pure function
//! of it.

use crate::annotation;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_INBOUND_PORT: u16 = 4143;
pub const DEFAULT_OUTBOUND_PORT: u16 = 4140;
pub const DEFAULT_ADMIN_PORT: u16 = 4191;
pub const DEFAULT_CONTROL_PORT: u16 = 4190;
pub const DEFAULT_PROXY_UID: i64 = 2102;
pub const DEFAULT_LOG_LEVEL: &str = "warn,mesh=info";
pub const DEFAULT_LOG_FORMAT: &str = "plain";

/// Ports that commonly carry server-speaks-first protocols; never
/// protocol-detected unless overridden.
pub const DEFAULT_OPAQUE_PORTS: &str = "25,587,3306,4444,5432,6379,9300,11211";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("annotation {key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("patch could not be rendered: {0}")]
    Render(String),
}

/// Cluster-level injection defaults, merged from the build-time image
/// coordinates and the mounted defaults file. Read-only after startup.
#[derive(Clone, Debug)]
pub struct InjectorDefaults {
    pub proxy_image: String,
    pub proxy_init_image: String,
    pub debug_image: String,
    pub proxy_version: String,

    /// When set, network redirection is programmed by a separately-installed
    /// CNI plugin and no init container is injected.
    pub cni_enabled: bool,

    /// Cluster-default annotation values, lowest layer of the merge.
    pub annotations: BTreeMap<String, String>,
}

impl Default for InjectorDefaults {
    fn default() -> Self {
        Self {
            proxy_image: "ghcr.io/nebula-technologies/mesh-proxy".to_string(),
            proxy_init_image: "ghcr.io/nebula-technologies/mesh-init".to_string(),
            debug_image: "ghcr.io/nebula-technologies/mesh-debug".to_string(),
            proxy_version: env!("CARGO_PKG_VERSION").to_string(),
            cni_enabled: false,
            annotations: BTreeMap::new(),
        }
    }
}

/// The shape of the mounted cluster defaults file.
#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DefaultsFile {
    #[serde(default)]
    pub proxy_image: Option<String>,
    #[serde(default)]
    pub proxy_init_image: Option<String>,
    #[serde(default)]
    pub debug_image: Option<String>,
    #[serde(default)]
    pub proxy_version: Option<String>,
    #[serde(default)]
    pub cni_enabled: Option<bool>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl InjectorDefaults {
    /// Applies a parsed defaults file over the built-in defaults. Annotation
    /// keys may be written bare (`inject`) or fully prefixed.
    pub fn with_file(mut self, file: DefaultsFile) -> Self {
        if let Some(v) = file.proxy_image {
            self.proxy_image = v;
        }
        if let Some(v) = file.proxy_init_image {
            self.proxy_init_image = v;
        }
        if let Some(v) = file.debug_image {
            self.debug_image = v;
        }
        if let Some(v) = file.proxy_version {
            self.proxy_version = v;
        }
        if let Some(v) = file.cni_enabled {
            self.cni_enabled = v;
        }
        for (key, value) in file.annotations {
            self.annotations.insert(normalize_key(&key), value);
        }
        self
    }
}

/// Strips the mesh prefix so the merge works on bare keys.
fn normalize_key(key: &str) -> String {
    key.strip_prefix(&format!("{}/", crate::ANNOTATION_PREFIX))
        .unwrap_or(key)
        .to_string()
}

/// The `inject` gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectMode {
    Disabled,
    Enabled,
    Ingress,
}

impl FromStr for InjectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "enabled" => Ok(Self::Enabled),
            "ingress" => Ok(Self::Ingress),
            other => Err(format!("expected enabled|disabled|ingress, got {}", other)),
        }
    }
}

impl fmt::Display for InjectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Ingress => "ingress",
        })
    }
}

/// A comma-separated list of ports and inclusive ranges, e.g.
/// `25,587,3000-3010`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortRanges(Vec<RangeInclusive<u16>>);

impl PortRanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|r| r.contains(&port))
    }
}

impl FromStr for PortRanges {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                None => {
                    let port: u16 = part.parse().map_err(|_| format!("bad port {}", part))?;
                    port..=port
                }
                Some((lo, hi)) => {
                    let lo: u16 = lo.trim().parse().map_err(|_| format!("bad port {}", lo))?;
                    let hi: u16 = hi.trim().parse().map_err(|_| format!("bad port {}", hi))?;
                    if lo > hi {
                        return Err(format!("inverted range {}", part));
                    }
                    lo..=hi
                }
            };
            ranges.push(range);
        }
        Ok(Self(ranges))
    }
}

impl fmt::Display for PortRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if range.start() == range.end() {
                write!(f, "{}", range.start())?;
            } else {
                write!(f, "{}-{}", range.start(), range.end())?;
            }
        }
        Ok(())
    }
}

/// The effective injection configuration of one pod.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyConfig {
    pub inject: Option<InjectMode>,

    pub proxy_image: String,
    pub proxy_version: String,

    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,

    pub log_level: String,
    pub log_format: String,

    pub inbound_port: u16,
    pub outbound_port: u16,
    pub admin_port: u16,
    pub control_port: u16,

    pub skip_inbound_ports: PortRanges,
    pub skip_outbound_ports: PortRanges,
    pub opaque_ports: PortRanges,
    pub require_identity_ports: PortRanges,

    pub disable_identity: bool,
    pub enable_debug_sidecar: bool,
    pub wait_before_exit_seconds: u64,
    pub proxy_uid: i64,
}

impl ProxyConfig {
    /// Resolves the effective configuration for a pod from the three
    /// annotation layers.
    pub fn resolve(
        defaults: &InjectorDefaults,
        ns_annotations: &BTreeMap<String, String>,
        pod_annotations: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let lookup = Merged {
            defaults,
            ns_annotations,
            pod_annotations,
        };

        Ok(Self {
            inject: lookup.parsed::<InjectMode>("inject")?,
            proxy_image: lookup
                .value("proxy-image")
                .unwrap_or(&defaults.proxy_image)
                .to_string(),
            proxy_version: lookup
                .value("proxy-version")
                .unwrap_or(&defaults.proxy_version)
                .to_string(),
            cpu_request: lookup.value("proxy-cpu-request").map(String::from),
            cpu_limit: lookup.value("proxy-cpu-limit").map(String::from),
            memory_request: lookup.value("proxy-memory-request").map(String::from),
            memory_limit: lookup.value("proxy-memory-limit").map(String::from),
            log_level: lookup
                .value("proxy-log-level")
                .map(String::as_str)
                .unwrap_or(DEFAULT_LOG_LEVEL)
                .to_string(),
            log_format: lookup
                .value("proxy-log-format")
                .map(String::as_str)
                .unwrap_or(DEFAULT_LOG_FORMAT)
                .to_string(),
            inbound_port: lookup
                .parsed("proxy-inbound-port")?
                .unwrap_or(DEFAULT_INBOUND_PORT),
            outbound_port: lookup
                .parsed("proxy-outbound-port")?
                .unwrap_or(DEFAULT_OUTBOUND_PORT),
            admin_port: lookup.parsed("admin-port")?.unwrap_or(DEFAULT_ADMIN_PORT),
            control_port: lookup
                .parsed("control-port")?
                .unwrap_or(DEFAULT_CONTROL_PORT),
            skip_inbound_ports: lookup.parsed("skip-inbound-ports")?.unwrap_or_default(),
            skip_outbound_ports: lookup.parsed("skip-outbound-ports")?.unwrap_or_default(),
            opaque_ports: lookup
                .parsed("opaque-ports")?
                .unwrap_or_else(|| DEFAULT_OPAQUE_PORTS.parse().expect("default opaque ports")),
            require_identity_ports: lookup
                .parsed("require-identity-on-inbound-ports")?
                .unwrap_or_default(),
            disable_identity: lookup.parsed("disable-identity")?.unwrap_or(false),
            enable_debug_sidecar: lookup.parsed("enable-debug-sidecar")?.unwrap_or(false),
            wait_before_exit_seconds: lookup.parsed("wait-before-exit-seconds")?.unwrap_or(0),
            proxy_uid: lookup.parsed("proxy-uid")?.unwrap_or(DEFAULT_PROXY_UID),
        })
    }
}

struct Merged<'a> {
    defaults: &'a InjectorDefaults,
    ns_annotations: &'a BTreeMap<String, String>,
    pod_annotations: &'a BTreeMap<String, String>,
}

impl<'a> Merged<'a> {
    /// Last-writer-wins per key: pod over namespace over cluster defaults.
    fn value(&self, key: &str) -> Option<&'a String> {
        let full = annotation(key);
        self.pod_annotations
            .get(&full)
            .or_else(|| self.ns_annotations.get(&full))
            .or_else(|| self.defaults.annotations.get(key))
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.value(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
                key: annotation(key),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn anns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (annotation(k), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg =
            ProxyConfig::resolve(&InjectorDefaults::default(), &BTreeMap::new(), &BTreeMap::new())
                .unwrap();
        assert_eq!(cfg.inject, None);
        assert_eq!(cfg.inbound_port, 4143);
        assert_eq!(cfg.outbound_port, 4140);
        assert_eq!(cfg.admin_port, 4191);
        assert_eq!(cfg.control_port, 4190);
        assert_eq!(cfg.log_level, "warn,mesh=info");
        assert!(cfg.opaque_ports.contains(25));
        assert!(cfg.opaque_ports.contains(3306));
        assert!(!cfg.disable_identity);
    }

    #[test]
    fn pod_overrides_namespace_overrides_cluster() {
        let defaults = InjectorDefaults::default().with_file(DefaultsFile {
            annotations: btreemap! {
                "inject".to_string() => "disabled".to_string(),
                "proxy-log-level".to_string() => "debug".to_string(),
            },
            ..Default::default()
        });
        let ns = anns(&[("inject", "enabled"), ("proxy-uid", "5000")]);
        let pod = anns(&[("proxy-uid", "6000")]);

        let cfg = ProxyConfig::resolve(&defaults, &ns, &pod).unwrap();
        assert_eq!(cfg.inject, Some(InjectMode::Enabled));
        assert_eq!(cfg.proxy_uid, 6000);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn prefixed_keys_in_the_defaults_file_are_normalized() {
        let defaults = InjectorDefaults::default().with_file(DefaultsFile {
            annotations: btreemap! {
                annotation("inject") => "ingress".to_string(),
            },
            ..Default::default()
        });
        let cfg = ProxyConfig::resolve(&defaults, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(cfg.inject, Some(InjectMode::Ingress));
    }

    #[test]
    fn invalid_values_are_reported_with_their_key() {
        let pod = anns(&[("proxy-inbound-port", "not-a-port")]);
        let err =
            ProxyConfig::resolve(&InjectorDefaults::default(), &BTreeMap::new(), &pod).unwrap_err();
        assert!(err.to_string().contains("proxy-inbound-port"));
    }

    #[test]
    fn port_ranges_parse_and_match() {
        let ranges: PortRanges = "25, 587,3000-3010".parse().unwrap();
        assert!(ranges.contains(25));
        assert!(ranges.contains(3005));
        assert!(!ranges.contains(80));
        assert_eq!(ranges.to_string(), "25,587,3000-3010");

        assert!("4143-4140".parse::<PortRanges>().is_err());
        assert!("http".parse::<PortRanges>().is_err());
        assert_eq!("".parse::<PortRanges>().unwrap(), PortRanges::default());
    }
}
