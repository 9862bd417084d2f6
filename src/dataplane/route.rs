//! Host route tables

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::debug;

use super::{DataPlaneError, HostRoute, RouteTable};

/// Routes managed through `ip route`
#[derive(Clone, Debug)]
pub struct IpRouteTable {
    binary: String,
}

impl Default for IpRouteTable {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpRouteTable {
    /// Use the given `ip` binary
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, verb: &str, route: &HostRoute) -> Result<(), DataPlaneError> {
        let cidr = route.cidr();
        let via = route.via.to_string();
        let args = ["route", verb, cidr.as_str(), "via", via.as_str()];
        debug!(cmd = %self.binary, args = ?args, "executing");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| DataPlaneError::Spawn(format!("{}: {}", self.binary, e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(verb, route, stderr, &self.binary))
    }
}

fn classify(verb: &str, route: &HostRoute, stderr: String, binary: &str) -> DataPlaneError {
    if verb == "add" && stderr.contains("File exists") {
        return DataPlaneError::RouteExists(route.cidr());
    }
    if verb == "del" && (stderr.contains("No such process") || stderr.contains("not found")) {
        return DataPlaneError::RouteNotFound(route.cidr());
    }
    DataPlaneError::Command {
        command: format!("{} route {} {}", binary, verb, route),
        stderr,
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn add_route(&self, route: &HostRoute) -> Result<(), DataPlaneError> {
        self.run("add", route).await
    }

    async fn delete_route(&self, route: &HostRoute) -> Result<(), DataPlaneError> {
        self.run("del", route).await
    }
}

/// In-memory route table for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryRouteTable {
    routes: Mutex<BTreeSet<HostRoute>>,
}

impl MemoryRouteTable {
    /// Installed routes
    pub fn routes(&self) -> Vec<HostRoute> {
        self.routes.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add_route(&self, route: &HostRoute) -> Result<(), DataPlaneError> {
        if !self.routes.lock().insert(route.clone()) {
            return Err(DataPlaneError::RouteExists(route.cidr()));
        }
        debug!(route = %route, "dry-run: add route");
        Ok(())
    }

    async fn delete_route(&self, route: &HostRoute) -> Result<(), DataPlaneError> {
        if !self.routes.lock().remove(route) {
            return Err(DataPlaneError::RouteNotFound(route.cidr()));
        }
        debug!(route = %route, "dry-run: delete route");
        Ok(())
    }
}
