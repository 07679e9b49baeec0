//! # Scopes
//!
//! A scope is an addressable sub-document namespace. Scopes form a tree
//! (nested fragments and templates), and each one owns exactly one node tree.
//!
//! Scopes and scoped identifiers are interned by an explicit
//! [`ScopeRegistry`], so two equal inputs always yield the same instance and
//! equality is a pointer comparison.
//!
//! ```rust,ignore
//! let mut registry = ScopeRegistry::new();
//! let root = registry.root();
//! let card = registry.create_child(&root, "card");
//! assert_eq!(card, registry.intern(["", "card"]));
//! assert_eq!(card.parent(), Some(root));
//! ```

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

#[derive(Debug)]
struct ScopeData {
    path: Vec<String>,
    parent: Option<Scope>,
}

/// Interned scope path. Cheap to clone; compares by identity.
#[derive(Clone)]
pub struct Scope(Rc<ScopeData>);

impl Scope {
    /// Last path segment (`""` for the root scope)
    pub fn name(&self) -> &str {
        self.0.path.last().map(String::as_str).unwrap_or("")
    }

    /// Enclosing scope, `None` for the root scope
    pub fn parent(&self) -> Option<Scope> {
        self.0.parent.clone()
    }

    pub fn path(&self) -> &[String] {
        &self.0.path
    }

    /// Path segments joined by `/`
    pub fn key(&self) -> String {
        self.0.path.join("/")
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    /// This scope and every enclosing scope, root first
    pub fn ancestors_inclusive(&self) -> Vec<Scope> {
        let mut chain = vec![self.clone()];
        let mut cursor = self.parent();
        while let Some(scope) = cursor {
            cursor = scope.parent();
            chain.push(scope);
        }
        chain.reverse();
        chain
    }

    /// Whether `self` is `other` or one of its ancestors
    pub fn contains(&self, other: &Scope) -> bool {
        other.ancestors_inclusive().iter().any(|s| s == self)
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({:?})", self.key())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.key())
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.path.serialize(serializer)
    }
}

#[derive(Debug)]
struct IdentifierData {
    scope: Scope,
    id: String,
}

/// Interned `(scope, node id)` pair, usable as a pointer across documents
#[derive(Clone)]
pub struct ScopedIdentifier(Rc<IdentifierData>);

impl ScopedIdentifier {
    pub fn scope(&self) -> &Scope {
        &self.0.scope
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }
}

impl PartialEq for ScopedIdentifier {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ScopedIdentifier {}

impl Hash for ScopedIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for ScopedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopedIdentifier({}#{})", self.0.scope, self.0.id)
    }
}

impl fmt::Display for ScopedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.scope, self.0.id)
    }
}

impl Serialize for ScopedIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ScopedIdentifier", 2)?;
        state.serialize_field("scope", &self.0.scope)?;
        state.serialize_field("id", &self.0.id)?;
        state.end()
    }
}

/// Interning table for scopes and scoped identifiers.
///
/// Owned by the application context and passed by reference. Entries are
/// never evicted, so identities stay stable for the registry's lifetime.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    scopes: HashMap<Vec<String>, Scope>,
    identifiers: HashMap<Scope, HashMap<String, ScopedIdentifier>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root scope (path `[""]`)
    pub fn root(&mut self) -> Scope {
        self.intern([""])
    }

    /// Canonical scope for `path`.
    ///
    /// Paths are rooted at the empty segment; a path that does not start
    /// with `""` is treated as relative to the root. An empty path is the
    /// root itself.
    pub fn intern<I, S>(&mut self, path: I) -> Scope
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments: Vec<String> = path.into_iter().map(Into::into).collect();
        if segments.first().map(String::as_str) != Some("") {
            segments.insert(0, String::new());
        }
        self.intern_segments(segments)
    }

    fn intern_segments(&mut self, segments: Vec<String>) -> Scope {
        if let Some(scope) = self.scopes.get(&segments) {
            return scope.clone();
        }

        let parent = if segments.len() > 1 {
            Some(self.intern_segments(segments[..segments.len() - 1].to_vec()))
        } else {
            None
        };

        let scope = Scope(Rc::new(ScopeData {
            path: segments.clone(),
            parent,
        }));
        self.scopes.insert(segments, scope.clone());
        scope
    }

    /// Canonical child scope `name` of `scope`
    pub fn create_child(&mut self, scope: &Scope, name: &str) -> Scope {
        let mut segments = scope.path().to_vec();
        segments.push(name.to_string());
        self.intern_segments(segments)
    }

    /// Canonical identifier for `id` inside `scope`
    pub fn identifier(&mut self, scope: &Scope, id: &str) -> ScopedIdentifier {
        let by_id = self.identifiers.entry(scope.clone()).or_default();
        by_id
            .entry(id.to_string())
            .or_insert_with(|| {
                ScopedIdentifier(Rc::new(IdentifierData {
                    scope: scope.clone(),
                    id: id.to_string(),
                }))
            })
            .clone()
    }

    /// Number of interned scopes
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut registry = ScopeRegistry::new();
        let a = registry.intern(["", "page", "card"]);
        let b = registry.intern(["", "page", "card"]);
        assert_eq!(a, b);
        assert!(Rc::ptr_eq(&a.0, &b.0));

        // ancestors were interned on the way
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_relative_paths_are_rooted() {
        let mut registry = ScopeRegistry::new();
        assert_eq!(registry.intern(["page"]), registry.intern(["", "page"]));
        assert_eq!(registry.intern(Vec::<String>::new()), registry.root());
    }

    #[test]
    fn test_scope_navigation() {
        let mut registry = ScopeRegistry::new();
        let root = registry.root();
        let page = registry.create_child(&root, "page");
        let card = registry.create_child(&page, "card");

        assert!(root.is_root());
        assert_eq!(root.name(), "");
        assert_eq!(card.name(), "card");
        assert_eq!(card.parent(), Some(page.clone()));
        assert_eq!(root.parent(), None);
        assert_eq!(card.path(), &["".to_string(), "page".into(), "card".into()]);
        assert_eq!(card.key(), "/page/card");
        assert_eq!(card.to_string(), "/page/card");
        assert_eq!(root.to_string(), "/");

        let chain = card.ancestors_inclusive();
        assert_eq!(chain, vec![root.clone(), page.clone(), card.clone()]);
        assert!(page.contains(&card));
        assert!(!card.contains(&page));
    }

    #[test]
    fn test_scoped_identifier_interning() {
        let mut registry = ScopeRegistry::new();
        let root = registry.root();
        let page = registry.create_child(&root, "page");

        let a = registry.identifier(&page, "n1");
        let b = registry.identifier(&page, "n1");
        let c = registry.identifier(&root, "n1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.id(), "n1");
        assert_eq!(a.scope(), &page);
        assert_eq!(a.to_string(), "/page#n1");
    }

    #[test]
    fn test_scope_serializes_as_path() {
        let mut registry = ScopeRegistry::new();
        let page = registry.intern(["", "page"]);
        let id = registry.identifier(&page, "n1");

        assert_eq!(serde_json::to_string(&page).unwrap(), r#"["","page"]"#);
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            r#"{"scope":["","page"],"id":"n1"}"#
        );
    }
}
