//! UDP service: key authorization and per-port binders

use crate::binder::UdpBinder;
use rtun_control::{AuthError, Authorities, Binder, BinderRegistry, Service};
use rtun_proto::{Protocol, ServerConfig, CONN_TIMEOUT};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub struct UdpService {
    authorities: Arc<Authorities>,
    bindings: BinderRegistry<UdpBinder>,
    bind_host: IpAddr,
    buffer_size: usize,
    probe_timeout: Duration,
}

impl UdpService {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            authorities: Arc::new(Authorities::from_config(config, Protocol::Udp)),
            bindings: BinderRegistry::new(),
            bind_host: config.bind_host,
            buffer_size: config.udp_buffer_size,
            probe_timeout: CONN_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Authorize `key` for `port` and return the shared binder for the port
    pub fn get_binder(&self, key: &str, port: u16) -> Result<Arc<UdpBinder>, AuthError> {
        self.authorities.authorize(key, port)?;

        let bind_addr = SocketAddr::new(self.bind_host, port);
        Ok(self.bindings.get_or_create(port, || {
            UdpBinder::with_probe_timeout(bind_addr, self.buffer_size, self.probe_timeout)
        }))
    }

    pub fn binder_count(&self) -> usize {
        self.bindings.len()
    }
}

impl Service for UdpService {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn get_binder(&self, key: &str, port: u16) -> Result<Arc<dyn Binder>, AuthError> {
        let binder: Arc<dyn Binder> = UdpService::get_binder(self, key, port)?;
        Ok(binder)
    }

    fn authorize(&self, key: &str, port: u16) -> Result<(), AuthError> {
        self.authorities.authorize(key, port)
    }
}
