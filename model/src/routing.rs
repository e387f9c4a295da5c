//! Choosing the resolver group responsible for a new ticket.

use anyhow::Error;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A resolver group a ticket can be routed to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub group_id: String,
    /// The group's display name, which is also the key of its
    /// [resolver group](crate::ticket::ResolverGroup) record.
    pub name: String,
}

impl Route {
    pub fn new(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            name: name.into(),
        }
    }
}

/// Maps incident subcategories to resolver groups.
///
/// In a routing file, this looks like
/// ```json
/// {
///     "routes": {
///         "Electric Shock": { "groupId": "elec", "name": "Electrical Safety Team" }
///     },
///     "fallback": { "groupId": "triage", "name": "EHS Triage Queue" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoutingTable {
    #[serde(default)]
    routes: HashMap<String, Route>,
    #[serde(default = "triage")]
    fallback: Route,
}

fn triage() -> Route {
    Route::new("triage", "EHS Triage Queue")
}

impl Default for RoutingTable {
    fn default() -> Self {
        let elec = Route::new("elec", "Electrical Safety Team");
        let mach = Route::new("ehs-mach", "EHS Machinery");
        let chem = Route::new("chem", "Chemical Safety");
        Self {
            routes: [
                ("Electric Shock", &elec),
                ("Arc Flash/Blast", &elec),
                ("Entanglement", &mach),
                ("Crushing", &mach),
                ("Shearing", &mach),
                ("Chemical Burns", &chem),
                ("Chemical Spills", &chem),
            ]
            .into_iter()
            .map(|(subcategory, route)| (subcategory.to_string(), route.clone()))
            .collect(),
            fallback: triage(),
        }
    }
}

impl RoutingTable {
    /// Read a routing table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| Error::msg(format!("unable to open {}: {err}", path.display())))?;
        serde_json::from_reader(file)
            .map_err(|err| Error::msg(format!("malformed routing table {}: {err}", path.display())))
    }

    /// The group responsible for tickets in `subcategory`.
    pub fn route(&self, subcategory: &str) -> &Route {
        self.routes.get(subcategory).unwrap_or(&self.fallback)
    }

    /// Is `route` the catch-all for unrecognized subcategories?
    pub fn is_fallback(&self, route: &Route) -> bool {
        *route == self.fallback
    }
}

/// Routing options.
#[derive(Clone, Debug, Default, Args)]
#[group(skip)]
pub struct Options {
    /// Read the subcategory routing table from FILE instead of using the built-in table.
    #[clap(long, env = "RELAY_ROUTES", value_name = "FILE")]
    pub routes: Option<PathBuf>,
}

impl Options {
    pub fn table(&self) -> Result<RoutingTable, Error> {
        match &self.routes {
            Some(path) => {
                let table = RoutingTable::load(path)?;
                tracing::info!("loaded {} routes from {}", table.routes.len(), path.display());
                Ok(table)
            }
            None => Ok(RoutingTable::default()),
        }
    }
}
