//! Symbol-name mangling.
//!
//! Qualified names ⟨namespace, local name⟩ become single identifiers in the
//! back-end symbol space. Each namespace kind gets a distinct prefix letter,
//! private namespaces carry their per-file serial id, and every reserved
//! character inside a component is escaped as `$` followed by the character
//! (NUL is rewritten to `$0`), which keeps the component separator `.`
//! unambiguous and the member encoding injective.
//!
//! Type names drop the component separator; the reserved `<Module>` literal
//! comes out escaped like any other angle-bracketed name.

use abclift_abc::name::{Namespace, NsKind};
use std::fmt::Write;

const ESCAPE: char = '$';

fn is_reserved(c: char) -> bool {
    match c {
        '$' | '.' | '<' | '>' | ':' | ';' | '[' | ']' | '/' | '\\' | ' ' => true,
        _ => false,
    }
}

/// Mangles qualified names, reusing one scratch buffer across calls.
#[derive(Debug, Default)]
pub struct NameMangler {
    buf: String,
}

impl NameMangler {
    /// A mangler with an empty scratch buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a member name: namespace prefix, separator, local name.
    pub fn mangle_member(&mut self, ns: &Namespace, name: &str) -> String {
        self.buf.clear();
        self.push_ns(ns);
        self.buf.push('.');
        self.push_escaped(name);
        self.buf.clone()
    }

    /// Encode a type name: namespace prefix directly followed by the local
    /// name, no separator.
    pub fn mangle_type(&mut self, ns: &Namespace, name: &str) -> String {
        self.buf.clear();
        self.push_ns(ns);
        self.push_escaped(name);
        self.buf.clone()
    }

    fn push_ns(&mut self, ns: &Namespace) {
        match ns.kind {
            NsKind::Package => {
                // The unnamed package keeps the empty prefix; named packages
                // get their own letter so no user namespace can shadow them.
                if !ns.uri.is_empty() {
                    self.buf.push('Q');
                    self.push_escaped(&ns.uri);
                }
            }
            NsKind::Namespace => {
                self.buf.push('N');
                self.push_escaped(&ns.uri);
            }
            NsKind::PackageInternal => {
                self.buf.push('I');
                self.push_escaped(&ns.uri);
            }
            NsKind::Protected => {
                self.buf.push('R');
                self.push_escaped(&ns.uri);
            }
            NsKind::StaticProtected => {
                self.buf.push('S');
                self.push_escaped(&ns.uri);
            }
            NsKind::Explicit => {
                self.buf.push('E');
                self.push_escaped(&ns.uri);
            }
            NsKind::Private => {
                let _ = write!(self.buf, "P{}", ns.private_id);
            }
            NsKind::Any => {
                self.buf.push('A');
            }
        }
    }

    fn push_escaped(&mut self, component: &str) {
        for c in component.chars() {
            if c == '\0' {
                self.buf.push(ESCAPE);
                self.buf.push('0');
            } else if is_reserved(c) {
                self.buf.push(ESCAPE);
                self.buf.push(c);
            } else {
                self.buf.push(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_member() {
        let mut m = NameMangler::new();
        assert_eq!(m.mangle_member(&Namespace::public(), "frobnicate"), ".frobnicate");
    }

    #[test]
    fn package_and_user_namespaces_cannot_collide() {
        let mut m = NameMangler::new();
        let pkg = Namespace {
            kind: NsKind::Package,
            uri: std::sync::Arc::from("Nfoo"),
            private_id: 0,
        };
        let user = Namespace::user("foo");
        assert_ne!(m.mangle_member(&pkg, "x"), m.mangle_member(&user, "x"));
    }

    #[test]
    fn private_serials_are_distinct() {
        let mut m = NameMangler::new();
        let a = m.mangle_member(&Namespace::private(1), "x");
        let b = m.mangle_member(&Namespace::private(2), "x");
        assert_ne!(a, b);
        assert_eq!(a, "P1.x");
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let mut m = NameMangler::new();
        assert_eq!(
            m.mangle_member(&Namespace::public(), "a.b$c"),
            ".a$.b$$c"
        );
        assert_eq!(m.mangle_member(&Namespace::public(), "x\0y"), ".x$0y");
    }

    #[test]
    fn type_names_omit_the_separator() {
        let mut m = NameMangler::new();
        let ns = Namespace {
            kind: NsKind::Package,
            uri: std::sync::Arc::from("flash.utils"),
            private_id: 0,
        };
        assert_eq!(m.mangle_type(&ns, "ByteArray"), "Qflash$.utilsByteArray");
        // The reserved module literal is never emitted verbatim.
        let module = m.mangle_type(&Namespace::public(), "<Module>");
        assert_eq!(module, "$<Module$>");
    }

    #[test]
    fn member_mangling_is_injective_over_a_sample() {
        use std::collections::HashSet;
        let mut m = NameMangler::new();
        let namespaces = [
            Namespace::public(),
            Namespace::any(),
            Namespace::user(""),
            Namespace::user("a"),
            Namespace::user("a.b"),
            Namespace::private(0),
            Namespace::private(10),
            Namespace {
                kind: NsKind::Package,
                uri: std::sync::Arc::from("a"),
                private_id: 0,
            },
            Namespace {
                kind: NsKind::Protected,
                uri: std::sync::Arc::from("a"),
                private_id: 0,
            },
            Namespace {
                kind: NsKind::StaticProtected,
                uri: std::sync::Arc::from("a"),
                private_id: 0,
            },
            Namespace {
                kind: NsKind::PackageInternal,
                uri: std::sync::Arc::from("a"),
                private_id: 0,
            },
            Namespace {
                kind: NsKind::Explicit,
                uri: std::sync::Arc::from("a"),
                private_id: 0,
            },
        ];
        let names = ["x", "y", "a.b", "a$b", "", "<init>", "P1"];
        let mut seen = HashSet::new();
        for ns in &namespaces {
            for name in &names {
                let sym = m.mangle_member(ns, name);
                assert!(seen.insert(sym.clone()), "collision on {}", sym);
            }
        }
    }
}
