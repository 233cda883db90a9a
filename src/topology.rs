//! Topology Directory.
//!
//! Answers which namespaces are global and at which granularity conflicts
//! are detected, and tracks which origins and destinations are registered.
//! Backed by `DashMap` so operator calls and workers never block each other.
//!
//! Unknown namespaces are local: their operations advance a Tailer's
//! position but never enter the global log.

use crate::conflict::Granularity;
use crate::config::{GlobalSyncConfig, ResumeFrom};
use crate::error::Result;
use crate::record::Namespace;
use dashmap::DashMap;
use tracing::info;

/// Replication settings for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSettings {
    pub is_global: bool,
    pub granularity: Granularity,
}

/// Registered destination and where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRegistration {
    pub destination_id: String,
    pub resume_from: ResumeFrom,
}

#[derive(Debug, Default)]
pub struct Topology {
    namespaces: DashMap<Namespace, NamespaceSettings>,
    destinations: DashMap<String, ResumeFrom>,
    sources: DashMap<String, ResumeFrom>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config. Namespaces are validated.
    pub fn from_config(config: &GlobalSyncConfig) -> Result<Self> {
        let topology = Self::new();
        for ns in &config.namespaces {
            let namespace = Namespace::new(ns.namespace.clone())?;
            topology.namespaces.insert(
                namespace,
                NamespaceSettings {
                    is_global: ns.is_global,
                    granularity: ns.granularity,
                },
            );
        }
        for source in &config.sources {
            topology
                .sources
                .insert(source.origin_id.clone(), source.resume_from);
        }
        if config.settings.applier.enabled {
            topology.destinations.insert(
                config.destination_id().to_string(),
                config.settings.applier.resume_from,
            );
        }
        Ok(topology)
    }

    pub fn is_global(&self, namespace: &Namespace) -> bool {
        self.namespaces
            .get(namespace)
            .map(|s| s.is_global)
            .unwrap_or(false)
    }

    pub fn granularity(&self, namespace: &Namespace) -> Granularity {
        self.namespaces
            .get(namespace)
            .map(|s| s.granularity)
            .unwrap_or_default()
    }

    pub fn settings(&self, namespace: &Namespace) -> Option<NamespaceSettings> {
        self.namespaces.get(namespace).map(|s| *s)
    }

    /// Mark a namespace global. Takes effect for operations tailed afterwards.
    pub fn mark_global(&self, namespace: Namespace, granularity: Granularity) {
        info!(namespace = %namespace, granularity = %granularity, "Namespace marked global");
        self.namespaces.insert(
            namespace,
            NamespaceSettings {
                is_global: true,
                granularity,
            },
        );
    }

    pub fn mark_local(&self, namespace: Namespace) {
        info!(namespace = %namespace, "Namespace marked local");
        let granularity = self.granularity(&namespace);
        self.namespaces.insert(
            namespace,
            NamespaceSettings {
                is_global: false,
                granularity,
            },
        );
    }

    pub fn global_namespaces(&self) -> Vec<Namespace> {
        let mut out: Vec<Namespace> = self
            .namespaces
            .iter()
            .filter(|e| e.is_global)
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    pub fn register_destination(&self, destination_id: &str, resume_from: ResumeFrom) {
        info!(destination_id, ?resume_from, "Destination registered");
        self.destinations
            .insert(destination_id.to_string(), resume_from);
    }

    pub fn destinations(&self) -> Vec<DestinationRegistration> {
        let mut out: Vec<DestinationRegistration> = self
            .destinations
            .iter()
            .map(|e| DestinationRegistration {
                destination_id: e.key().clone(),
                resume_from: *e.value(),
            })
            .collect();
        out.sort_by(|a, b| a.destination_id.cmp(&b.destination_id));
        out
    }

    pub fn register_source(&self, origin_id: &str, resume_from: ResumeFrom) {
        info!(origin_id, ?resume_from, "Source registered");
        self.sources.insert(origin_id.to_string(), resume_from);
    }

    pub fn sources(&self) -> Vec<String> {
        let mut out: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }
}
