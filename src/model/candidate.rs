use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::{EntityKind, Row, Scalar};

/// Position of a candidate inside its [`CandidateGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A not-yet-persisted entity. Scalar columns (including foreign keys that
/// are already known) live in `fields`; relationships that point at other
/// unresolved candidates live in `links`, keyed by relation name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: EntityKind,
    pub fields: Row,
    #[serde(default)]
    pub links: Vec<(String, NodeId)>,
    /// Broader concepts in this kind's hierarchy.
    #[serde(default)]
    pub parents: Vec<NodeId>,
}

impl Candidate {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: Row::new(),
            links: Vec::new(),
            parents: Vec::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: &str, value: impl Into<Scalar>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Builder-style link to a candidate already added to the graph.
    pub fn link(mut self, relation: &str, target: NodeId) -> Self {
        self.set_link(relation, target);
        self
    }

    pub fn set_link(&mut self, relation: &str, target: NodeId) {
        match self.links.iter_mut().find(|(name, _)| name == relation) {
            Some(existing) => existing.1 = target,
            None => self.links.push((relation.to_string(), target)),
        }
    }

    pub fn linked(&self, relation: &str) -> Option<NodeId> {
        self.links
            .iter()
            .find(|(name, _)| name == relation)
            .map(|(_, target)| *target)
    }

    pub fn aspect(label: &str, iri: &str) -> Self {
        Self::new(EntityKind::Aspect).with("label", label).with("iri", iri)
    }

    pub fn unit(label: &str, iri: &str) -> Self {
        Self::new(EntityKind::Unit).with("label", label).with("iri", iri)
    }

    pub fn class(label: &str, iri: &str) -> Self {
        Self::new(EntityKind::DescriptorInst)
            .with("label", label)
            .with("iri", iri)
    }

    pub fn controlled_term(label: &str, iri: &str) -> Self {
        Self::new(EntityKind::ControlledTerm)
            .with("label", label)
            .with("iri", iri)
    }

    pub fn address(addr_type: &str, addr_field: &str) -> Self {
        Self::new(EntityKind::Address)
            .with("addr_type", addr_type)
            .with("addr_field", addr_field)
    }

    pub fn dataset(id: Uuid) -> Self {
        Self::new(EntityKind::Object)
            .with("id", id)
            .with("id_type", "dataset")
    }

    pub fn package(id: Uuid, id_file: i64) -> Self {
        Self::new(EntityKind::Object)
            .with("id", id)
            .with("id_type", "package")
            .with("id_file", id_file)
    }

    pub fn subject(id_sub: &str) -> Self {
        Self::new(EntityKind::ValueInst)
            .with("type", "subject")
            .with("id_sub", id_sub)
            .with("id_formal", id_sub)
    }

    pub fn sample(id_sub: &str, id_sam: &str) -> Self {
        Self::new(EntityKind::ValueInst)
            .with("type", "sample")
            .with("id_sub", id_sub)
            .with("id_sam", id_sam)
            .with("id_formal", id_sam)
    }
}

/// Arena of candidates that reference each other by [`NodeId`].
///
/// A node referenced from several places is resolved once. Nothing stops a
/// caller from wiring a cycle; the resolver rejects those.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateGraph {
    nodes: Vec<Candidate>,
}

impl CandidateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, candidate: Candidate) -> NodeId {
        self.nodes.push(candidate);
        NodeId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> Option<&Candidate> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Candidate> {
        self.nodes.get_mut(id.0)
    }

    /// Point `from`'s relation at `to`. Returns false when `from` is not in
    /// this graph.
    pub fn link(&mut self, from: NodeId, relation: &str, to: NodeId) -> bool {
        match self.nodes.get_mut(from.0) {
            Some(node) => {
                node.set_link(relation, to);
                true
            }
            None => false,
        }
    }

    /// Record `parent` as a broader concept of `child`. Returns false when
    /// `child` is not in this graph.
    pub fn add_parent(&mut self, child: NodeId, parent: NodeId) -> bool {
        match self.nodes.get_mut(child.0) {
            Some(node) => {
                if !node.parents.contains(&parent) {
                    node.parents.push(parent);
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Candidate)> {
        self.nodes.iter().enumerate().map(|(i, c)| (NodeId(i), c))
    }
}
