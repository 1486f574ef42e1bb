use anyhow::Result;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap};
use std::ops::Index;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::registry::ModuleRegistry;
use crate::resolver::{BucketId, BucketSnapshot, DependencyResolver};
use crate::types::{Manifest, SharingStrategy};

/// Modules and the dependency buckets they are bound to.
pub struct CompositionGraph {
    graph: DiGraph<Node, Edge>,
    module_map: HashMap<String, NodeIndex>,
    bucket_map: HashMap<BucketId, NodeIndex>,
    conflicts: Vec<RegistryError>,
}

impl CompositionGraph {
    /// Plan the composition of the given manifests without loading anything.
    ///
    /// Manifests are bound in order against a scratch resolver, so the
    /// result is what loading them in that order would produce. Manifests
    /// that cannot be resolved keep their node and are listed in
    /// [`CompositionGraph::conflicts`].
    pub fn plan(manifests: &[Manifest], singletons: BTreeSet<String>) -> Self {
        let resolver = DependencyResolver::new(HashMap::new(), singletons);
        let mut conflicts = Vec::new();
        for manifest in manifests {
            if let Err(e) = resolver.bind_all(Uuid::new_v4(), &manifest.id, &manifest.dependencies) {
                conflicts.push(e);
            }
        }
        let mut graph = Self::build(manifests.iter(), &resolver.snapshot());
        graph.conflicts = conflicts;
        graph
    }

    /// Snapshot of a live registry: every registered module and the buckets
    /// of the loaded ones.
    pub fn from_registry(registry: &ModuleRegistry) -> Self {
        let manifests = registry.manifests();
        Self::build(
            manifests.iter().map(|m| m.as_ref()),
            &registry.dependency_buckets(),
        )
    }

    fn build<'a>(
        manifests: impl Iterator<Item = &'a Manifest>,
        buckets: &[BucketSnapshot],
    ) -> Self {
        let mut graph = DiGraph::<Node, Edge>::new();
        let mut module_map = HashMap::<String, NodeIndex>::new();
        let mut bucket_map = HashMap::<BucketId, NodeIndex>::new();
        let mut strategies = HashMap::<(String, String), SharingStrategy>::new();

        for manifest in manifests {
            for dependency in &manifest.dependencies {
                strategies.insert(
                    (manifest.id.clone(), dependency.name.clone()),
                    dependency.strategy,
                );
            }
            let index = graph.add_node(Node::Module(ModuleNode {
                id: manifest.id.clone(),
                version: manifest.version.to_string(),
                framework: manifest.framework.kind.clone(),
            }));
            module_map.insert(manifest.id.clone(), index);
        }

        for bucket in buckets {
            let bucket_index = graph.add_node(Node::Bucket(BucketNode {
                id: bucket.id,
                dependency: bucket.dependency.clone(),
                range: bucket.range.to_string(),
                private: bucket.private,
            }));
            bucket_map.insert(bucket.id, bucket_index);

            for member in &bucket.members {
                let Some(module_index) = module_map.get(member) else {
                    tracing::warn!(
                        module = %member,
                        bucket = bucket.id,
                        "bucket member has no manifest in the graph"
                    );
                    continue;
                };
                let strategy = strategies
                    .get(&(member.clone(), bucket.dependency.clone()))
                    .copied()
                    .unwrap_or(SharingStrategy::Auto);
                graph.update_edge(*module_index, bucket_index, Edge::Binding(strategy));
            }
        }

        Self {
            graph,
            module_map,
            bucket_map,
            conflicts: Vec::new(),
        }
    }

    /// Write the graph to a DOT file
    pub fn write_dot_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let dot_content = self.dot();
        std::fs::write(path, dot_content)
            .map_err(|e| anyhow::anyhow!("Failed to write DOT file: {e}"))?;
        Ok(())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &petgraph::graph::Node<Node>> {
        self.graph.raw_nodes().iter()
    }

    pub fn get_module_index(&self, id: &str) -> Option<NodeIndex> {
        self.module_map.get(id).copied()
    }

    pub fn get_bucket_index(&self, id: BucketId) -> Option<NodeIndex> {
        self.bucket_map.get(&id).copied()
    }

    /// Buckets a module is bound to, ordered by bucket id.
    pub fn get_buckets(&self, module: &str) -> Vec<&BucketNode> {
        let Some(index) = self.get_module_index(module) else {
            return Vec::new();
        };
        let mut buckets: Vec<_> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Outgoing)
            .filter_map(|n| match &self.graph[n] {
                Node::Bucket(bucket) => Some(bucket),
                Node::Module(_) => None,
            })
            .collect();
        buckets.sort_by_key(|b| b.id);
        buckets
    }

    /// Modules bound to a bucket, ordered by id.
    pub fn get_members(&self, bucket: BucketId) -> Vec<&str> {
        let Some(index) = self.get_bucket_index(bucket) else {
            return Vec::new();
        };
        let mut members: Vec<_> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .filter_map(|n| match &self.graph[n] {
                Node::Module(module) => Some(module.id.as_str()),
                Node::Bucket(_) => None,
            })
            .collect();
        members.sort();
        members
    }

    pub fn conflicts(&self) -> &[RegistryError] {
        &self.conflicts
    }

    fn dot(&self) -> String {
        let mut output = String::from("digraph CompositionGraph {\n");
        output.push_str("  rankdir=LR;\n");
        output.push_str("  node [fontname=\"Arial\", fontsize=10];\n");
        output.push_str("  edge [fontname=\"Arial\", fontsize=9];\n");

        for node_index in self.graph.node_indices() {
            let node_attrs = match &self.graph[node_index] {
                Node::Module(module) => {
                    let label = if module.framework.is_empty() {
                        format!("{}\\n{}", module.id, module.version)
                    } else {
                        format!("{}\\n{} ({})", module.id, module.version, module.framework)
                    };
                    format!(
                        "[label=\"{label}\", shape=box, fillcolor=lightblue, style=\"rounded,filled\"]"
                    )
                }
                Node::Bucket(bucket) => {
                    let color = if bucket.private { "lightgrey" } else { "orange" };
                    format!(
                        "[label=\"{}#{}\\n{}\", shape=ellipse, fillcolor={color}, style=\"filled\"]",
                        bucket.dependency, bucket.id, bucket.range
                    )
                }
            };
            output.push_str(&format!("  {} {};\n", node_index.index(), node_attrs));
        }

        for edge_ref in self.graph.edge_references() {
            let edge_attrs = match edge_ref.weight() {
                Edge::Binding(SharingStrategy::Isolated) => {
                    "[color=grey, style=dashed, label=\"isolated\"]".to_string()
                }
                Edge::Binding(strategy) => {
                    format!("[color=blue, style=solid, label=\"{strategy}\"]")
                }
            };
            output.push_str(&format!(
                "  {} -> {} {};\n",
                edge_ref.source().index(),
                edge_ref.target().index(),
                edge_attrs
            ));
        }

        output.push_str("}\n");
        output
    }
}

impl std::fmt::Debug for CompositionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct FlatNode<'a>(&'a Node);
        impl<'a> std::fmt::Debug for FlatNode<'a> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.0 {
                    Node::Module(module) => std::fmt::Debug::fmt(module, f),
                    Node::Bucket(bucket) => std::fmt::Debug::fmt(bucket, f),
                }
            }
        }

        let mut debug_struct = f.debug_struct("CompositionGraph");

        let nodes: Vec<_> = self
            .graph
            .raw_nodes()
            .iter()
            .map(|n| FlatNode(&n.weight))
            .collect();
        debug_struct.field("nodes", &nodes);

        let edges: Vec<String> = self
            .graph
            .edge_references()
            .map(|edge| {
                format!(
                    "{} -> {} ({:?})",
                    self.graph[edge.source()].name(),
                    self.graph[edge.target()].name(),
                    edge.weight()
                )
            })
            .collect();
        debug_struct.field("edges", &edges);

        if !self.conflicts.is_empty() {
            let conflicts: Vec<_> = self.conflicts.iter().map(|e| e.to_string()).collect();
            debug_struct.field("conflicts", &conflicts);
        }
        debug_struct.finish()
    }
}

impl Index<NodeIndex> for CompositionGraph {
    type Output = Node;

    fn index(&self, index: NodeIndex) -> &Self::Output {
        &self.graph[index]
    }
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub id: String,
    pub version: String,
    pub framework: String,
}

#[derive(Debug, Clone)]
pub struct BucketNode {
    pub id: BucketId,
    pub dependency: String,
    pub range: String,
    pub private: bool,
}

#[derive(Debug, Clone)]
pub enum Node {
    Module(ModuleNode),
    Bucket(BucketNode),
}

impl Node {
    pub fn name(&self) -> String {
        match self {
            Node::Module(module) => module.id.clone(),
            Node::Bucket(bucket) => format!("{}#{}", bucket.dependency, bucket.id),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Edge {
    Binding(SharingStrategy),
}
