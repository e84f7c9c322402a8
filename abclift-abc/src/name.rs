//! Namespaces and multinames.
//!
//! A multiname is a possibly-late-bound qualified name: the namespace, the
//! local name, or both may be supplied at runtime from the operand stack.
//! The semantic analyzer resolves compile-time-known multinames against class
//! traits; late-bound ones force runtime lookups.

use std::fmt;
use std::sync::Arc;

/// The kind of a namespace.
///
/// Mirrors the ABC constant-pool namespace kinds. `Private` namespaces are
/// distinct per occurrence; the per-file serial id keeps them apart (and
/// feeds the name mangler's private prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsKind {
    /// A user-defined or package namespace with a URI.
    Namespace,
    /// The public package namespace (URI is the package name, often empty).
    Package,
    /// Package-internal visibility.
    PackageInternal,
    /// Protected visibility.
    Protected,
    /// An explicit namespace.
    Explicit,
    /// Static-protected visibility.
    StaticProtected,
    /// Private visibility, distinguished by serial id.
    Private,
    /// The "any" namespace (`*`).
    Any,
}

/// A single namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The namespace kind.
    pub kind: NsKind,
    /// The namespace URI. Empty for `Any` and for the unnamed package.
    pub uri: Arc<str>,
    /// Serial id distinguishing private namespaces within one ABC file.
    /// Zero for all non-private kinds.
    pub private_id: u32,
}

impl Namespace {
    /// The public namespace of the unnamed package.
    pub fn public() -> Self {
        Namespace {
            kind: NsKind::Package,
            uri: Arc::from(""),
            private_id: 0,
        }
    }

    /// The `*` namespace.
    pub fn any() -> Self {
        Namespace {
            kind: NsKind::Any,
            uri: Arc::from(""),
            private_id: 0,
        }
    }

    /// A private namespace with the given per-file serial id.
    pub fn private(id: u32) -> Self {
        Namespace {
            kind: NsKind::Private,
            uri: Arc::from(""),
            private_id: id,
        }
    }

    /// A user namespace with the given URI.
    pub fn user(uri: &str) -> Self {
        Namespace {
            kind: NsKind::Namespace,
            uri: Arc::from(uri),
            private_id: 0,
        }
    }

    /// Is this the public namespace of some package?
    pub fn is_public(&self) -> bool {
        self.kind == NsKind::Package
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            NsKind::Any => write!(f, "*"),
            NsKind::Private => write!(f, "<private #{}>", self.private_id),
            _ => write!(f, "{}", self.uri),
        }
    }
}

/// The shape of a multiname.
#[derive(Debug, Clone, PartialEq)]
pub enum MultinameKind {
    /// Fully qualified: one namespace, one name.
    QName {
        /// The qualifying namespace.
        ns: Namespace,
        /// The local name.
        name: Arc<str>,
    },
    /// Runtime namespace, compile-time name.
    RtqName {
        /// The local name.
        name: Arc<str>,
    },
    /// Runtime namespace and runtime name.
    RtqNameLate,
    /// Compile-time name qualified by a set of candidate namespaces.
    Multiname {
        /// The candidate namespaces.
        ns_set: Vec<Namespace>,
        /// The local name.
        name: Arc<str>,
    },
    /// Runtime name qualified by a set of candidate namespaces.
    MultinameLate {
        /// The candidate namespaces.
        ns_set: Vec<Namespace>,
    },
    /// A parameterized type name, e.g. `Vector.<int>`.
    Parameterized {
        /// The base type name.
        base: Box<Multiname>,
        /// Type parameters, in declared order.
        params: Vec<Multiname>,
    },
}

/// A multiname: a possibly-late-bound qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct Multiname {
    /// The name shape.
    pub kind: MultinameKind,
    /// Set for XML attribute names (`@name`).
    pub attribute: bool,
}

impl Multiname {
    /// A public `QName` with the given local name.
    pub fn public(name: &str) -> Self {
        Multiname {
            kind: MultinameKind::QName {
                ns: Namespace::public(),
                name: Arc::from(name),
            },
            attribute: false,
        }
    }

    /// Does resolving this name require a runtime-supplied namespace?
    pub fn has_runtime_ns(&self) -> bool {
        match self.kind {
            MultinameKind::RtqName { .. } | MultinameKind::RtqNameLate => true,
            _ => false,
        }
    }

    /// Does resolving this name require a runtime-supplied local name?
    pub fn has_runtime_name(&self) -> bool {
        match self.kind {
            MultinameKind::RtqNameLate | MultinameKind::MultinameLate { .. } => true,
            _ => false,
        }
    }

    /// Total count of runtime operands this name pops from the stack,
    /// namespace first.
    pub fn runtime_operand_count(&self) -> u32 {
        self.has_runtime_ns() as u32 + self.has_runtime_name() as u32
    }

    /// The compile-time local name, if there is one.
    pub fn local_name(&self) -> Option<&str> {
        match &self.kind {
            MultinameKind::QName { name, .. }
            | MultinameKind::RtqName { name }
            | MultinameKind::Multiname { name, .. } => Some(name),
            MultinameKind::Parameterized { base, .. } => base.local_name(),
            _ => None,
        }
    }

    /// The compile-time candidate namespaces, if any.
    pub fn ns_candidates(&self) -> &[Namespace] {
        match &self.kind {
            MultinameKind::QName { ns, .. } => std::slice::from_ref(ns),
            MultinameKind::Multiname { ns_set, .. } | MultinameKind::MultinameLate { ns_set } => {
                ns_set
            }
            MultinameKind::Parameterized { base, .. } => base.ns_candidates(),
            _ => &[],
        }
    }

    /// Would a trait qualified by `ns` be visible through this name?
    pub fn admits_ns(&self, ns: &Namespace) -> bool {
        self.ns_candidates()
            .iter()
            .any(|cand| cand.kind == NsKind::Any || cand == ns)
    }

    /// Is the local name a decimal array-index literal?
    pub fn index_literal(&self) -> Option<u32> {
        let name = self.local_name()?;
        if name.is_empty() || name.len() > 10 {
            return None;
        }
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // "01" is a string key, not an index.
        if name.len() > 1 && name.starts_with('0') {
            return None;
        }
        name.parse().ok()
    }
}

impl fmt::Display for Multiname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.attribute {
            write!(f, "@")?;
        }
        match &self.kind {
            MultinameKind::QName { ns, name } => {
                if ns.is_public() && ns.uri.is_empty() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}::{}", ns, name)
                }
            }
            MultinameKind::RtqName { name } => write!(f, "<rt>::{}", name),
            MultinameKind::RtqNameLate => write!(f, "<rt>::<rt>"),
            MultinameKind::Multiname { name, .. } => write!(f, "{{ns-set}}::{}", name),
            MultinameKind::MultinameLate { .. } => write!(f, "{{ns-set}}::<rt>"),
            MultinameKind::Parameterized { base, params } => {
                write!(f, "{}.<", base)?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ">")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_parts() {
        assert!(!Multiname::public("x").has_runtime_ns());
        assert!(!Multiname::public("x").has_runtime_name());

        let late = Multiname {
            kind: MultinameKind::RtqNameLate,
            attribute: false,
        };
        assert!(late.has_runtime_ns());
        assert!(late.has_runtime_name());
        assert_eq!(late.runtime_operand_count(), 2);
    }

    #[test]
    fn index_literals() {
        assert_eq!(Multiname::public("0").index_literal(), Some(0));
        assert_eq!(Multiname::public("42").index_literal(), Some(42));
        assert_eq!(Multiname::public("007").index_literal(), None);
        assert_eq!(Multiname::public("x1").index_literal(), None);
        assert_eq!(Multiname::public("").index_literal(), None);
        assert_eq!(Multiname::public("99999999999").index_literal(), None);
    }

    #[test]
    fn ns_admission() {
        let mn = Multiname {
            kind: MultinameKind::Multiname {
                ns_set: vec![Namespace::public(), Namespace::private(3)],
                name: Arc::from("f"),
            },
            attribute: false,
        };
        assert!(mn.admits_ns(&Namespace::public()));
        assert!(mn.admits_ns(&Namespace::private(3)));
        assert!(!mn.admits_ns(&Namespace::private(4)));
        assert!(!mn.admits_ns(&Namespace::user("flash.utils")));
    }
}
