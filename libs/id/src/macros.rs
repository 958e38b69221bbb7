//! Macros for defining typed resource keys.

/// Macro to define a key type bound to one resource kind.
///
/// This generates a newtype wrapper around [`ObjectKey`](crate::ObjectKey) with:
/// - A `KIND` constant
/// - `new()` to build a validated key from namespace and name
/// - `parse()` to parse from the `namespace/name` form
/// - `object_ref()` to pair the key with its kind
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (as a string)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_key!(SolverKey, Solver);
///
/// let key = SolverKey::new("default", "s1")?;
/// let parsed: SolverKey = "default/s1".parse()?;
/// ```
#[macro_export]
macro_rules! define_key {
    ($name:ident, $kind:ident) => {
        /// A key identifying one resource of this kind.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::ObjectKey);

        impl $name {
            /// The resource kind this key identifies.
            pub const KIND: $crate::ResourceKind = $crate::ResourceKind::$kind;

            /// Creates a key from a namespace and a name, validating both.
            pub fn new(
                namespace: impl Into<String>,
                name: impl Into<String>,
            ) -> Result<Self, $crate::IdError> {
                $crate::ObjectKey::new(namespace, name).map(Self)
            }

            /// Wraps an already validated untyped key.
            #[must_use]
            pub const fn from_key(key: $crate::ObjectKey) -> Self {
                Self(key)
            }

            /// Parses a key from the `namespace/name` form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::ObjectKey::parse(s).map(Self)
            }

            /// Converts a reference into a typed key, rejecting other kinds.
            pub fn try_from_ref(r: &$crate::ObjectRef) -> Result<Self, $crate::IdError> {
                if r.kind != Self::KIND {
                    return Err($crate::IdError::KindMismatch {
                        expected: Self::KIND.as_str(),
                        actual: r.kind.as_str(),
                    });
                }
                Ok(Self(r.key.clone()))
            }

            /// Returns the namespace segment.
            #[must_use]
            pub fn namespace(&self) -> &str {
                self.0.namespace()
            }

            /// Returns the name segment.
            #[must_use]
            pub fn name(&self) -> &str {
                self.0.name()
            }

            /// Returns the untyped key.
            #[must_use]
            pub const fn key(&self) -> &$crate::ObjectKey {
                &self.0
            }

            /// Returns the reference (kind + key) for this resource.
            #[must_use]
            pub fn object_ref(&self) -> $crate::ObjectRef {
                $crate::ObjectRef::new(Self::KIND, self.0.clone())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl From<$name> for $crate::ObjectKey {
            fn from(key: $name) -> Self {
                key.0
            }
        }

        impl AsRef<$crate::ObjectKey> for $name {
            fn as_ref(&self) -> &$crate::ObjectKey {
                &self.0
            }
        }
    };
}
