//! Static domain discovery
//!
//! Lists the domains and projects named in the cluster configuration.

use crate::config::DiscoveryConfiguration;
use crate::domain::ports::{DiscoveredDomain, DiscoveredProject, DomainDiscoverer};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub struct StaticDiscoverer {
    domains: Vec<DiscoveredDomain>,
    projects: BTreeMap<String, Vec<DiscoveredProject>>,
}

impl StaticDiscoverer {
    pub fn new(config: &DiscoveryConfiguration) -> Self {
        Self {
            domains: config
                .domains
                .iter()
                .map(|d| DiscoveredDomain {
                    uuid: d.uuid.clone(),
                    name: d.name.clone(),
                })
                .collect(),
            projects: config
                .domains
                .iter()
                .map(|d| (d.uuid.clone(), d.projects.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl DomainDiscoverer for StaticDiscoverer {
    async fn list_domains(&self) -> Result<Vec<DiscoveredDomain>> {
        Ok(self.domains.clone())
    }

    async fn list_projects(&self, domain: &DiscoveredDomain) -> Result<Vec<DiscoveredProject>> {
        Ok(self.projects.get(&domain.uuid).cloned().unwrap_or_default())
    }
}
