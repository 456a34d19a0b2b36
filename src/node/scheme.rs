use crate::config::{Family, SchemeConfig};
use crate::error::Error;
use log::debug;
use std::collections::HashSet;

/// A configured endpoint template owning its brokers' ids. The broker tasks
/// themselves live with the registry; a scheme going away closes them.
pub struct Scheme {
    pub id: u64,
    pub config: SchemeConfig,
    pub brokers: HashSet<u64>,
}

impl Scheme {
    pub fn new(id: u64, config: SchemeConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            id,
            config,
            brokers: HashSet::new(),
        })
    }

    pub fn has_open_brokers(&self) -> bool {
        !self.brokers.is_empty()
    }

    /// Transport family changes are only legal while nothing is connected.
    pub fn set_family(&mut self, family: Family) -> Result<(), Error> {
        if self.has_open_brokers() {
            return Err(Error::BrokerOpen);
        }
        self.config.family = family;
        Ok(())
    }

    /// Removes the UNIX socket file if this scheme created one.
    pub fn cleanup(&self) {
        if self.config.family == Family::Unix {
            let path = self.config.unix_socket_path();
            if path.exists() {
                debug!("removing unix socket {}", path.display());
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

impl Drop for Scheme {
    fn drop(&mut self) {
        self.cleanup();
    }
}
