use std::net::IpAddr;
use thiserror::Error;

/// A parsed destination authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A named service inside the cluster domain.
    Service {
        namespace: String,
        name: String,
        port: u16,
    },

    /// A literal address, resolved against the pod and ClusterIP indexes.
    Ip(IpAddr, u16),

    /// A name outside the cluster domain. The caller answers with the
    /// unresolved sentinel so the proxy forwards opaquely.
    External { host: String, port: u16 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("empty authority")]
    Empty,

    #[error("invalid port in {0}")]
    InvalidPort(String),

    #[error("invalid authority {0}")]
    InvalidHost(String),
}

impl Target {
    /// Parses a `host:port` authority. Hosts of the forms `<svc>.<ns>`,
    /// `<svc>.<ns>.svc` and `<svc>.<ns>.svc.<cluster-domain>` resolve
    /// in-cluster; IP literals resolve through the address indexes; anything
    /// else is external. A missing port defaults to 80.
    pub fn parse(path: &str, cluster_domain: &str) -> Result<Target, TargetError> {
        if path.is_empty() {
            return Err(TargetError::Empty);
        }

        let (host, port) = split_authority(path)?;
        if host.is_empty() {
            return Err(TargetError::InvalidHost(path.to_string()));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Target::Ip(ip, port));
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(TargetError::InvalidHost(path.to_string()));
        }

        let host = host.trim_end_matches('.');
        let labels: Vec<&str> = host.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(TargetError::InvalidHost(path.to_string()));
        }

        let service = |name: &str, namespace: &str| Target::Service {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port,
        };

        match labels.as_slice() {
            [name, namespace] => Ok(service(name, namespace)),
            [name, namespace, "svc"] => Ok(service(name, namespace)),
            [name, namespace, "svc", domain @ ..] if domain.join(".") == cluster_domain => {
                Ok(service(name, namespace))
            }
            _ => Ok(Target::External {
                host: host.to_string(),
                port,
            }),
        }
    }
}

fn split_authority(path: &str) -> Result<(&str, u16), TargetError> {
    // Bracketed IPv6 hosts carry the port outside the brackets.
    if let Some(rest) = path.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| TargetError::InvalidHost(path.to_string()))?;
        let port = match rest.strip_prefix(':') {
            None if rest.is_empty() => 80,
            Some(p) => p
                .parse()
                .map_err(|_| TargetError::InvalidPort(path.to_string()))?,
            None => return Err(TargetError::InvalidHost(path.to_string())),
        };
        return Ok((host, port));
    }

    match path.rsplit_once(':') {
        // A bare IPv6 address contains colons but no port separator we can
        // trust; parse the whole path as a host in that case.
        Some((host, _)) if host.contains(':') => Ok((path, 80)),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| TargetError::InvalidPort(path.to_string()))?;
            Ok((host, port))
        }
        None => Ok((path, 80)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(namespace: &str, name: &str, port: u16) -> Target {
        Target::Service {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port,
        }
    }

    #[test]
    fn cluster_local_forms() {
        for path in [
            "web.emojivoto:8080",
            "web.emojivoto.svc:8080",
            "web.emojivoto.svc.cluster.local:8080",
            "web.emojivoto.svc.cluster.local.:8080",
        ] {
            assert_eq!(
                Target::parse(path, "cluster.local").unwrap(),
                svc("emojivoto", "web", 8080),
                "{}",
                path
            );
        }
    }

    #[test]
    fn foreign_domain_is_external() {
        assert_eq!(
            Target::parse("web.emojivoto.svc.other.domain:8080", "cluster.local").unwrap(),
            Target::External {
                host: "web.emojivoto.svc.other.domain".to_string(),
                port: 8080,
            }
        );
        assert_eq!(
            Target::parse("example.com:443", "cluster.local").unwrap(),
            Target::External {
                host: "example.com".to_string(),
                port: 443,
            }
        );
    }

    #[test]
    fn ip_literals() {
        assert_eq!(
            Target::parse("10.23.4.5:8080", "cluster.local").unwrap(),
            Target::Ip("10.23.4.5".parse().unwrap(), 8080)
        );
        assert_eq!(
            Target::parse("[2001:db8::1]:8080", "cluster.local").unwrap(),
            Target::Ip("2001:db8::1".parse().unwrap(), 8080)
        );
    }

    #[test]
    fn default_port() {
        assert_eq!(
            Target::parse("web.emojivoto.svc.cluster.local", "cluster.local").unwrap(),
            svc("emojivoto", "web", 80)
        );
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            Target::parse("", "cluster.local"),
            Err(TargetError::Empty)
        ));
        assert!(matches!(
            Target::parse("web.emojivoto:http", "cluster.local"),
            Err(TargetError::InvalidPort(_))
        ));
        assert!(matches!(
            Target::parse("web..emojivoto:80", "cluster.local"),
            Err(TargetError::InvalidHost(_))
        ));
    }
}
