/// Name of a lockable resource: the path of segments from the database root,
/// e.g. `database/table42/page7`. Equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    names: Vec<String>,
}

impl ResourceName {
    pub fn new_root(name: impl Into<String>) -> Self {
        ResourceName {
            names: vec![name.into()],
        }
    }

    pub fn from_segments(names: Vec<String>) -> Self {
        assert!(!names.is_empty(), "resource name must have a root segment");
        ResourceName { names }
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut names = self.names.clone();
        names.push(name.into());
        ResourceName { names }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.names.len() <= 1 {
            return None;
        }
        Some(ResourceName {
            names: self.names[..self.names.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.names
    }

    pub fn last_segment(&self) -> &str {
        self.names.last().expect("non-empty by construction")
    }

    /// Strict descendant test: `self` lies below `other` in the hierarchy.
    pub fn is_descendant_of(&self, other: &ResourceName) -> bool {
        self.names.len() > other.names.len() && self.names[..other.names.len()] == other.names[..]
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.names.join("/"))
    }
}
