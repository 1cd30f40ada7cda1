use k8s_openapi::api::core::v1::{LoadBalancerIngress, Service, ServicePort};

use crate::controller::cache::ServiceCache;

/// The address returned when no Service can be resolved.
pub const DEFAULT_LOAD_BALANCER: &str = "dummy.admiral.global";

impl ServiceCache {
    /// Find the externally routable address and port for the app `key` in
    /// `namespace`.
    ///
    /// Services are tried newest first. For each Service labelled as `key`
    /// the first of these that is set wins:
    ///
    /// - a load balancer ingress hostname, with the default mTLS port
    /// - a load balancer ingress IP, with the default mTLS port
    /// - the first external IP, with the port exposed for mTLS traffic
    ///
    /// Ignored Services are skipped. Ignore status is checked against the
    /// Service as it is stored right now. If nothing resolves, returns
    /// [DEFAULT_LOAD_BALANCER] and port 0.
    pub fn get_load_balancer(&self, key: &str, namespace: &str) -> (String, u16) {
        let services = self.get(namespace).unwrap_or_default();
        let labels = self.labels();

        for service in &services {
            if !labels.service_matches_app(service, key)
                || labels.should_ignore_service(service, false)
            {
                continue;
            }

            if let Some(address) = resolve(service, labels.default_mtls_port) {
                return address;
            }
        }

        (DEFAULT_LOAD_BALANCER.to_string(), 0)
    }
}

fn resolve(service: &Service, mtls_port: u16) -> Option<(String, u16)> {
    let ingress: &[LoadBalancerIngress] = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default();

    let hostname = ingress
        .iter()
        .filter_map(|i| i.hostname.as_deref())
        .find(|h| !h.is_empty());
    if let Some(hostname) = hostname {
        return Some((hostname.to_string(), mtls_port));
    }

    let ip = ingress
        .iter()
        .filter_map(|i| i.ip.as_deref())
        .find(|ip| !ip.is_empty());
    if let Some(ip) = ip {
        return Some((ip.to_string(), mtls_port));
    }

    let spec = service.spec.as_ref()?;
    let external_ip = spec
        .external_ips
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|ip| !ip.is_empty())?;
    let ports = spec.ports.as_deref().unwrap_or_default();

    Some((external_ip.clone(), external_port(ports, mtls_port)))
}

// prefer the port that carries mTLS traffic, then whatever is declared first.
// node ports win over service ports, since external IPs usually front nodes.
fn external_port(ports: &[ServicePort], mtls_port: u16) -> u16 {
    let exposed = |p: &ServicePort| p.node_port.unwrap_or(p.port);

    ports
        .iter()
        .find(|p| p.port == i32::from(mtls_port))
        .or_else(|| ports.first())
        .map(exposed)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(mtls_port)
}
