//! Name service: service name to port name.
//!
//! The registry is shared by every process of a universe. Lookups take a
//! read lock, so they always see either the whole of a publish or
//! unpublish or none of it.

use crate::error::{Error, Result};
use crate::info::Info;
use crate::Mpi;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct NameRegistry {
    names: RwLock<HashMap<String, String>>,
}

impl NameRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, service: &str, port: &str) -> Result<()> {
        if service.is_empty() {
            return Err(Error::InvalidArg("service name is empty".into()));
        }
        if port.is_empty() {
            return Err(Error::InvalidPort("port name is empty".into()));
        }
        let mut names = self.names.write();
        if let Some(existing) = names.get(service) {
            return Err(Error::InvalidArg(format!(
                "service '{service}' is already published as '{existing}'"
            )));
        }
        names.insert(service.to_string(), port.to_string());
        tracing::debug!(service, port, "published name");
        Ok(())
    }

    pub(crate) fn unpublish(&self, service: &str) -> Result<()> {
        self.names
            .write()
            .remove(service)
            .map(|port| tracing::debug!(service, port, "unpublished name"))
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))
    }

    pub(crate) fn lookup(&self, service: &str) -> Result<String> {
        self.names
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))
    }
}

impl Mpi {
    /// Publish `port` under `service` for [`lookup_name`](Self::lookup_name).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if `service` is empty or already published.
    pub fn publish_name(&self, service: &str, _info: &Info, port: &str) -> Result<()> {
        let state = self.state();
        state.route(
            state.world_errors(),
            state.universe.names.publish(service, port),
        )
    }

    /// Withdraw a published service name.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if `service` is not currently published.
    pub fn unpublish_name(&self, service: &str, _info: &Info, _port: &str) -> Result<()> {
        let state = self.state();
        state.route(state.world_errors(), state.universe.names.unpublish(service))
    }

    /// Port name published under `service`.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if `service` was never published or has
    /// been unpublished.
    pub fn lookup_name(&self, service: &str, _info: &Info) -> Result<String> {
        let state = self.state();
        state.route(state.world_errors(), state.universe.names.lookup(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ErrorMode, Universe};

    #[test]
    fn publish_lookup_unpublish() {
        let names = NameRegistry::new();
        names.publish("svc", "p1").unwrap();
        assert_eq!(names.lookup("svc").unwrap(), "p1");
        names.unpublish("svc").unwrap();
        assert_eq!(
            names.lookup("svc").unwrap_err(),
            Error::ServiceNotFound("svc".into())
        );
        assert_eq!(
            names.unpublish("svc").unwrap_err(),
            Error::ServiceNotFound("svc".into())
        );
    }

    #[test]
    fn duplicate_publish_is_rejected() {
        let names = NameRegistry::new();
        names.publish("svc", "p1").unwrap();
        assert!(matches!(
            names.publish("svc", "p2").unwrap_err(),
            Error::InvalidArg(_)
        ));
        assert_eq!(names.lookup("svc").unwrap(), "p1");
        assert!(names.lookup("never").is_err());
    }

    #[test]
    fn lookup_after_barrier_sees_publish() {
        let universe = Universe::new(Config::default().with_errors(ErrorMode::Return));
        universe
            .run(3, |mpi| {
                let world = mpi.world();
                let info = Info::null();
                if world.rank() == 0 {
                    mpi.publish_name("MyTest", &info, "otherhost:122")?;
                }
                world.barrier()?;
                assert_eq!(mpi.lookup_name("MyTest", &info)?, "otherhost:122");
                world.barrier()?;
                if world.rank() == 0 {
                    mpi.unpublish_name("MyTest", &info, "otherhost:122")?;
                }
                world.barrier()?;
                assert_eq!(
                    mpi.lookup_name("MyTest", &info).unwrap_err(),
                    Error::ServiceNotFound("MyTest".into())
                );
                Ok(())
            })
            .unwrap();
    }
}
