//! Identity types for the three managed resource kinds.

use std::str::FromStr;

use crate::define_key;
use crate::IdError;

/// API group of the managed custom resources.
pub const API_GROUP: &str = "kubesolv.io";

/// API version of the managed custom resources.
pub const API_VERSION: &str = "v1";

/// Group and version joined the way resource manifests spell them.
pub const API_GROUP_VERSION: &str = "kubesolv.io/v1";

/// Longest namespace or name accepted (DNS-1123 subdomain limit).
const MAX_SEGMENT_LEN: usize = 253;

// =============================================================================
// Resource Kind
// =============================================================================

/// The resource kinds this controller manages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ResourceKind {
    Solver,
    CubeState,
    SolveJob,
}

impl ResourceKind {
    /// Every managed kind, parents first.
    pub const ALL: [ResourceKind; 3] = [Self::Solver, Self::CubeState, Self::SolveJob];

    /// The kinds that are owned by a `Solver`.
    pub const CHILDREN: [ResourceKind; 2] = [Self::CubeState, Self::SolveJob];

    /// Returns the singular kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Solver => "Solver",
            Self::CubeState => "CubeState",
            Self::SolveJob => "SolveJob",
        }
    }

    /// Returns the lowercase plural used in API paths.
    #[must_use]
    pub const fn plural(&self) -> &'static str {
        match self {
            Self::Solver => "solvers",
            Self::CubeState => "cubestates",
            Self::SolveJob => "solvejobs",
        }
    }

    /// Returns true for kinds that carry an owner reference.
    #[must_use]
    pub const fn is_child(&self) -> bool {
        !matches!(self, Self::Solver)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = IdError;

    /// Accepts the singular kind (`CubeState`) or the plural (`cubestates`),
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s) || kind.plural() == s)
            .ok_or_else(|| IdError::UnknownKind(s.to_string()))
    }
}

// =============================================================================
// Object Key
// =============================================================================

/// Namespace plus name; the immutable identity of a resource within its kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    namespace: String,
    name: String,
}

impl ObjectKey {
    /// Creates a key, validating both segments.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self { namespace, name })
    }

    /// Parses a key from the `namespace/name` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator);
        };

        Self::new(namespace, name)
    }

    /// Returns the namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the name segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ObjectKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ObjectKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Validates one DNS-1123 style segment: lowercase alphanumerics, `-` and `.`,
/// starting and ending with an alphanumeric.
fn validate_segment(segment: &'static str, value: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidSegment {
        segment,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(invalid("longer than 253 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid("only lowercase alphanumerics, '-' and '.' are allowed"));
    }

    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let starts = value.chars().next().is_some_and(alnum);
    let ends = value.chars().next_back().is_some_and(alnum);
    if !starts || !ends {
        return Err(invalid("must start and end with an alphanumeric character"));
    }

    Ok(())
}

// =============================================================================
// Typed Keys
// =============================================================================

define_key!(SolverKey, Solver);
define_key!(CubeStateKey, CubeState);
define_key!(SolveJobKey, SolveJob);

// =============================================================================
// Object Reference
// =============================================================================

/// A kind plus key; the unit of work handed around the controller.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub key: ObjectKey,
}

impl ObjectRef {
    /// Creates a reference.
    #[must_use]
    pub const fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }

    /// Returns the namespace of the referenced resource.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.key.namespace()
    }

    /// Returns the name of the referenced resource.
    #[must_use]
    pub fn name(&self) -> &str {
        self.key.name()
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

// =============================================================================
// UID
// =============================================================================

/// Store-assigned unique id; distinguishes a resource from a later one
/// recreated under the same key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Uid(uuid::Uuid);

impl Uid {
    /// Generates a fresh random UID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidUid(e.to_string()))
    }
}

// =============================================================================
// Resource Version
// =============================================================================

/// Monotonic per-object write counter used as the optimistic-concurrency token.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version a resource carries right after creation.
    pub const FIRST: Self = Self(1);

    /// Creates a version from a raw counter.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the raw counter.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

// =============================================================================
// Tests
// =============================================================================
