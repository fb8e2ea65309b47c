//! TCP service: key authorization and per-port binders

use crate::binder::TcpBinder;
use rtun_control::{AuthError, Authorities, Binder, BinderRegistry, Service};
use rtun_proto::{Protocol, ServerConfig, CONN_TIMEOUT};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub struct TcpService {
    authorities: Arc<Authorities>,
    bindings: BinderRegistry<TcpBinder>,
    bind_host: IpAddr,
    probe_timeout: Duration,
}

impl TcpService {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            authorities: Arc::new(Authorities::from_config(config, Protocol::Tcp)),
            bindings: BinderRegistry::new(),
            bind_host: config.bind_host,
            probe_timeout: CONN_TIMEOUT,
        }
    }

    /// Watchdog timeout for binders created from now on
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Authorize `key` for `port` and return the shared binder for the port
    pub fn get_binder(&self, key: &str, port: u16) -> Result<Arc<TcpBinder>, AuthError> {
        self.authorities.authorize(key, port)?;

        let bind_addr = SocketAddr::new(self.bind_host, port);
        Ok(self.bindings.get_or_create(port, || {
            TcpBinder::with_probe_timeout(bind_addr, self.probe_timeout)
        }))
    }

    pub fn binder_count(&self) -> usize {
        self.bindings.len()
    }
}

impl Service for TcpService {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn get_binder(&self, key: &str, port: u16) -> Result<Arc<dyn Binder>, AuthError> {
        let binder: Arc<dyn Binder> = TcpService::get_binder(self, key, port)?;
        Ok(binder)
    }

    fn authorize(&self, key: &str, port: u16) -> Result<(), AuthError> {
        self.authorities.authorize(key, port)
    }
}
