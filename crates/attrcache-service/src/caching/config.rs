use std::fmt;

/// All known cache names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    Sources,
    Derived,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Sources => "sources",
            Self::Derived => "derived",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
