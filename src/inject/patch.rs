//! Renders the JSON patch that attaches the sidecar proxy to a pod.
//!
//! The webhook is conservative: anything that prevents rendering admits the
//! pod unchanged, and a pod that already carries a proxy (or a conflicting
//! init container) is never modified.

use super::config::{ConfigError, InjectMode, InjectorDefaults, ProxyConfig};
use crate::k8s::Pod;
use crate::{annotation, ClusterInfo};
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, Handler,
    Lifecycle, ObjectFieldSelector, Probe, ProjectedVolumeSource, ResourceRequirements,
    SecurityContext, ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const PROXY_CONTAINER_NAME: &str = "mesh-proxy";
pub const INIT_CONTAINER_NAME: &str = "mesh-init";
pub const DEBUG_CONTAINER_NAME: &str = "mesh-debug";
pub const IDENTITY_TOKEN_VOLUME: &str = "mesh-identity-token";
const IDENTITY_TOKEN_MOUNT: &str = "/var/run/secrets/tokens";

/// The webhook's decision for one admission request.
#[derive(Debug)]
pub enum Verdict {
    /// Admit with this patch.
    Inject(Patch),

    /// Admit unchanged.
    Skip(String),
}

/// Renders injection patches. Read-only after startup.
#[derive(Clone)]
pub struct Injector {
    pub defaults: InjectorDefaults,
    pub cluster: ClusterInfo,
}

// === impl Injector ===

impl Injector {
    pub fn new(defaults: InjectorDefaults, cluster: ClusterInfo) -> Self {
        Self { defaults, cluster }
    }

    /// The full decision procedure for one pod.
    pub fn inject(
        &self,
        ns_labels: &BTreeMap<String, String>,
        ns_annotations: &BTreeMap<String, String>,
        pod: &Pod,
    ) -> Result<Verdict, ConfigError> {
        if ns_labels.get(&annotation("admission-webhooks")).map(String::as_str)
            == Some("disabled")
        {
            return Ok(Verdict::Skip("namespace opted out of admission".to_string()));
        }

        let spec = match &pod.spec {
            Some(spec) => spec,
            None => return Ok(Verdict::Skip("pod has no spec".to_string())),
        };

        // Never touch a pod that already carries a proxy, and treat a foreign
        // container squatting on our names as a conflict to stay away from.
        if spec.containers.iter().any(|c| c.name == PROXY_CONTAINER_NAME) {
            return Ok(Verdict::Skip("pod already carries a proxy".to_string()));
        }
        if spec
            .init_containers
            .iter()
            .flatten()
            .any(|c| c.name == INIT_CONTAINER_NAME)
        {
            return Ok(Verdict::Skip(
                "pod carries a conflicting init container".to_string(),
            ));
        }

        let pod_annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let config = ProxyConfig::resolve(&self.defaults, ns_annotations, &pod_annotations)?;

        let mode = match config.inject {
            Some(InjectMode::Enabled) => InjectMode::Enabled,
            Some(InjectMode::Ingress) => InjectMode::Ingress,
            Some(InjectMode::Disabled) => {
                return Ok(Verdict::Skip("injection disabled".to_string()))
            }
            None => return Ok(Verdict::Skip("not opted into injection".to_string())),
        };

        Ok(Verdict::Inject(self.render(pod, &config, mode)?))
    }

    fn render(&self, pod: &Pod, config: &ProxyConfig, mode: InjectMode) -> Result<Patch, ConfigError> {
        let render_err =
            |e: serde_json::Error| ConfigError::Render(format!("serializing patch: {}", e));
        let spec = pod.spec.as_ref().expect("spec checked by caller");
        let mut ops = Vec::new();

        // Sidecar.
        let sidecar = self.proxy_container(config, mode);
        ops.push(PatchOperation::Add(AddOperation {
            path: "/spec/containers/-".to_string(),
            value: serde_json::to_value(&sidecar).map_err(render_err)?,
        }));

        if config.enable_debug_sidecar {
            let debug = self.debug_container(config);
            ops.push(PatchOperation::Add(AddOperation {
                path: "/spec/containers/-".to_string(),
                value: serde_json::to_value(&debug).map_err(render_err)?,
            }));
        }

        // Network redirection. In CNI mode the separately-installed plugin
        // programs redirection and no elevated init container is added.
        if !self.defaults.cni_enabled {
            let init = self.init_container(config);
            match &spec.init_containers {
                None => ops.push(PatchOperation::Add(AddOperation {
                    path: "/spec/initContainers".to_string(),
                    value: serde_json::to_value(vec![&init]).map_err(render_err)?,
                })),
                Some(_) => ops.push(PatchOperation::Add(AddOperation {
                    path: "/spec/initContainers/-".to_string(),
                    value: serde_json::to_value(&init).map_err(render_err)?,
                })),
            }
        }

        // Identity token projection.
        if !config.disable_identity {
            let volume = self.identity_token_volume();
            match &spec.volumes {
                None => ops.push(PatchOperation::Add(AddOperation {
                    path: "/spec/volumes".to_string(),
                    value: serde_json::to_value(vec![&volume]).map_err(render_err)?,
                })),
                Some(_) => ops.push(PatchOperation::Add(AddOperation {
                    path: "/spec/volumes/-".to_string(),
                    value: serde_json::to_value(&volume).map_err(render_err)?,
                })),
            }
        }

        // Proxy-awareness annotations for downstream tooling.
        let mut stamped = BTreeMap::new();
        stamped.insert(annotation("proxy-version"), config.proxy_version.clone());
        stamped.insert(annotation("inject"), mode.to_string());
        stamped.insert(
            annotation("proxy-inbound-port"),
            config.inbound_port.to_string(),
        );
        stamped.insert(
            annotation("proxy-outbound-port"),
            config.outbound_port.to_string(),
        );
        stamped.insert(
            annotation("identity-mode"),
            if config.disable_identity {
                "disabled".to_string()
            } else {
                "default".to_string()
            },
        );
        stamped.insert(
            annotation("created-by"),
            format!("kube-mesh-controller/{}", env!("CARGO_PKG_VERSION")),
        );

        match &pod.metadata.annotations {
            None => ops.push(PatchOperation::Add(AddOperation {
                path: "/metadata/annotations".to_string(),
                value: serde_json::to_value(&stamped).map_err(render_err)?,
            })),
            Some(_) => {
                for (key, value) in stamped {
                    ops.push(PatchOperation::Add(AddOperation {
                        path: format!("/metadata/annotations/{}", escape_pointer(&key)),
                        value: serde_json::Value::String(value),
                    }));
                }
            }
        }

        Ok(Patch(ops))
    }

    fn proxy_container(&self, config: &ProxyConfig, mode: InjectMode) -> Container {
        let identity_name = format!(
            "$(_pod_sa).$(_pod_ns).serviceaccount.{}",
            self.cluster.identity_domain
        );
        let control_plane = |svc: &str, port: u16| {
            format!(
                "{}.{}.svc.{}:{}",
                svc, self.cluster.control_plane_ns, self.cluster.cluster_domain, port
            )
        };

        let mut env = vec![
            env_value("MESH_PROXY_LOG", &config.log_level),
            env_value("MESH_PROXY_LOG_FORMAT", &config.log_format),
            env_value(
                "MESH_PROXY_DESTINATION_SVC_ADDR",
                &control_plane("mesh-destination", 8086),
            ),
            env_value(
                "MESH_PROXY_INBOUND_LISTEN_ADDR",
                &format!("0.0.0.0:{}", config.inbound_port),
            ),
            env_value(
                "MESH_PROXY_OUTBOUND_LISTEN_ADDR",
                &format!("127.0.0.1:{}", config.outbound_port),
            ),
            env_value(
                "MESH_PROXY_ADMIN_LISTEN_ADDR",
                &format!("0.0.0.0:{}", config.admin_port),
            ),
            env_value(
                "MESH_PROXY_CONTROL_LISTEN_ADDR",
                &format!("0.0.0.0:{}", config.control_port),
            ),
        ];

        if !config.opaque_ports.is_empty() {
            env.push(env_value(
                "MESH_PROXY_INBOUND_PORTS_DISABLE_PROTOCOL_DETECTION",
                &config.opaque_ports.to_string(),
            ));
        }
        if !config.require_identity_ports.is_empty() {
            env.push(env_value(
                "MESH_PROXY_INBOUND_PORTS_REQUIRE_IDENTITY",
                &config.require_identity_ports.to_string(),
            ));
        }
        if mode == InjectMode::Ingress {
            env.push(env_value("MESH_PROXY_INGRESS_MODE", "true"));
        }

        let mut volume_mounts = None;
        if config.disable_identity {
            env.push(env_value("MESH_PROXY_IDENTITY_DISABLED", "true"));
        } else {
            env.push(env_field("_pod_ns", "metadata.namespace"));
            env.push(env_field("_pod_sa", "spec.serviceAccountName"));
            env.push(env_value("MESH_PROXY_IDENTITY_LOCAL_NAME", &identity_name));
            env.push(env_value(
                "MESH_PROXY_IDENTITY_SVC_ADDR",
                &control_plane("mesh-identity", 8080),
            ));
            env.push(env_value(
                "MESH_PROXY_IDENTITY_TOKEN_FILE",
                &format!("{}/{}", IDENTITY_TOKEN_MOUNT, IDENTITY_TOKEN_VOLUME),
            ));
            volume_mounts = Some(vec![VolumeMount {
                name: IDENTITY_TOKEN_VOLUME.to_string(),
                mount_path: IDENTITY_TOKEN_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]);
        }

        let lifecycle = (config.wait_before_exit_seconds > 0).then(|| Lifecycle {
            pre_stop: Some(Handler {
                exec: Some(k8s_openapi::api::core::v1::ExecAction {
                    command: Some(vec![
                        "/bin/sleep".to_string(),
                        config.wait_before_exit_seconds.to_string(),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        Container {
            name: PROXY_CONTAINER_NAME.to_string(),
            image: Some(format!("{}:{}", config.proxy_image, config.proxy_version)),
            env: Some(env),
            ports: Some(vec![
                ContainerPort {
                    name: Some("mesh-proxy".to_string()),
                    container_port: config.inbound_port as i32,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("mesh-admin".to_string()),
                    container_port: config.admin_port as i32,
                    ..Default::default()
                },
            ]),
            resources: resources(config),
            security_context: Some(SecurityContext {
                run_as_user: Some(config.proxy_uid),
                run_as_non_root: Some(true),
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                ..Default::default()
            }),
            readiness_probe: Some(admin_probe("/ready", config.admin_port, 2)),
            liveness_probe: Some(admin_probe("/live", config.admin_port, 10)),
            lifecycle,
            volume_mounts,
            ..Default::default()
        }
    }

    fn init_container(&self, config: &ProxyConfig) -> Container {
        let mut skip_inbound = vec![
            config.admin_port.to_string(),
            config.control_port.to_string(),
        ];
        if !config.skip_inbound_ports.is_empty() {
            skip_inbound.push(config.skip_inbound_ports.to_string());
        }

        let mut args = vec![
            "--incoming-proxy-port".to_string(),
            config.inbound_port.to_string(),
            "--outgoing-proxy-port".to_string(),
            config.outbound_port.to_string(),
            "--proxy-uid".to_string(),
            config.proxy_uid.to_string(),
            "--inbound-ports-to-ignore".to_string(),
            skip_inbound.join(","),
        ];
        if !config.skip_outbound_ports.is_empty() {
            args.push("--outbound-ports-to-ignore".to_string());
            args.push(config.skip_outbound_ports.to_string());
        }

        Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(format!(
                "{}:{}",
                self.defaults.proxy_init_image, config.proxy_version
            )),
            args: Some(args),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                    drop: None,
                }),
                privileged: Some(false),
                run_as_user: Some(0),
                run_as_non_root: Some(false),
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn debug_container(&self, config: &ProxyConfig) -> Container {
        Container {
            name: DEBUG_CONTAINER_NAME.to_string(),
            image: Some(format!(
                "{}:{}",
                self.defaults.debug_image, config.proxy_version
            )),
            ..Default::default()
        }
    }

    fn identity_token_volume(&self) -> Volume {
        Volume {
            name: IDENTITY_TOKEN_VOLUME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(format!("identity.{}", self.cluster.control_plane_ns)),
                        expiration_seconds: Some(86_400),
                        path: IDENTITY_TOKEN_VOLUME.to_string(),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn admin_probe(path: &str, port: u16, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port as i32),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        ..Default::default()
    }
}

fn resources(config: &ProxyConfig) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &config.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &config.memory_request {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &config.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &config.memory_limit {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }

    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then(|| requests),
        limits: (!limits.is_empty()).then(|| limits),
    })
}

/// Escapes a JSON-pointer path segment per RFC 6901.
fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
