//! Resource path parsing.
//!
//! A resource path is a dotted list of `type<id>` segments naming one node
//! of the resource tree, e.g. `sys0.cpu1.pe3`. A segment whose id is `*`
//! or missing (`sys0.cpu.pe`) is a template segment matching any id at
//! that level.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a resource tree node. Orders by path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    System,
    Group,
    Cpu,
    Gpu,
    Accelerator,
    ProcElement,
    Memory,
    NetworkIf,
    Interconnect,
    Io,
    Custom,
}

impl ResourceType {
    pub const ALL: [ResourceType; 11] = [
        ResourceType::System,
        ResourceType::Group,
        ResourceType::Cpu,
        ResourceType::Gpu,
        ResourceType::Accelerator,
        ResourceType::ProcElement,
        ResourceType::Memory,
        ResourceType::NetworkIf,
        ResourceType::Interconnect,
        ResourceType::Io,
        ResourceType::Custom,
    ];

    /// Short prefix used in path segments.
    pub fn prefix(&self) -> &'static str {
        match self {
            ResourceType::System => "sys",
            ResourceType::Group => "grp",
            ResourceType::Cpu => "cpu",
            ResourceType::Gpu => "gpu",
            ResourceType::Accelerator => "acc",
            ResourceType::ProcElement => "pe",
            ResourceType::Memory => "mem",
            ResourceType::NetworkIf => "net",
            ResourceType::Interconnect => "icn",
            ResourceType::Io => "io",
            ResourceType::Custom => "cst",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.prefix() == prefix)
    }
}

impl Ord for ResourceType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.prefix().cmp(other.prefix())
    }
}

impl PartialOrd for ResourceType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty resource path")]
    Empty,
    #[error("unknown resource type in segment: {0}")]
    UnknownType(String),
    #[error("invalid resource id in segment: {0}")]
    InvalidId(String),
}

/// One `type<id>` segment. `id == None` is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathSegment {
    pub kind: ResourceType,
    pub id: Option<u32>,
}

impl PathSegment {
    pub fn new(kind: ResourceType, id: u32) -> Self {
        Self { kind, id: Some(id) }
    }

    pub fn any(kind: ResourceType) -> Self {
        Self { kind, id: None }
    }

    fn matches(&self, concrete: &PathSegment) -> bool {
        self.kind == concrete.kind && (self.id.is_none() || self.id == concrete.id)
    }
}

impl FromStr for PathSegment {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(|c: char| c.is_ascii_digit() || c == '*')
            .unwrap_or(s.len());
        let (prefix, id) = s.split_at(split);
        let kind = ResourceType::from_prefix(prefix)
            .ok_or_else(|| PathError::UnknownType(s.to_string()))?;
        let id = match id {
            "" | "*" => None,
            digits => Some(
                digits
                    .parse::<u32>()
                    .map_err(|_| PathError::InvalidId(s.to_string()))?,
            ),
        };
        Ok(Self { kind, id })
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}{}", self.kind, id),
            None => write!(f, "{}*", self.kind),
        }
    }
}

/// Normalized resource path.
///
/// Ordering is lexicographic on the type prefixes, segment by segment,
/// with ids compared as numbers: `sys0.acc0` sorts before `sys0.cpu0`, and
/// `pe2` before `pe10`. A wildcard id sorts before every concrete id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath {
    segments: Vec<PathSegment>,
}

impl ResourcePath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        path.parse()
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn last(&self) -> PathSegment {
        // Non-empty by construction.
        self.segments[self.segments.len() - 1]
    }

    /// Type of the node this path names.
    pub fn kind(&self) -> ResourceType {
        self.last().kind
    }

    /// True if any segment is a wildcard.
    pub fn is_template(&self) -> bool {
        self.segments.iter().any(|s| s.id.is_none())
    }

    /// True if `concrete` names exactly this node (same depth, matching ids).
    pub fn matches(&self, concrete: &ResourcePath) -> bool {
        self.segments.len() == concrete.segments.len() && self.matches_prefix(concrete)
    }

    /// True if `concrete` is this node or one of its descendants.
    pub fn matches_prefix(&self, concrete: &ResourcePath) -> bool {
        self.segments.len() <= concrete.segments.len()
            && self
                .segments
                .iter()
                .zip(&concrete.segments)
                .all(|(p, c)| p.matches(c))
    }

    /// Id of the first segment of the given type, if any.
    pub fn id_of(&self, kind: ResourceType) -> Option<u32> {
        self.segments.iter().find(|s| s.kind == kind).and_then(|s| s.id)
    }

    pub fn contains_type(&self, kind: ResourceType) -> bool {
        self.segments.iter().any(|s| s.kind == kind)
    }

    /// Parent path, `None` for a root segment.
    pub fn parent(&self) -> Option<ResourcePath> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: PathSegment) -> ResourcePath {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let segments = s
            .split('.')
            .map(str::parse)
            .collect::<Result<Vec<PathSegment>, _>>()?;
        Ok(Self { segments })
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
