//! Search scope, shared by both backends' operation interface.

/// How far a search descends from its base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the base entry itself.
    Base,
    /// Direct children only.
    OneLevel,
    /// Base entry and every descendant.
    Subtree,
    /// Every descendant, excluding the base entry itself.
    Subordinate,
}

impl Scope {
    /// The scope a direct child of the base is searched under:
    /// `onelevel` descends one step then switches to `base`; `subordinate`
    /// descends then switches to `subtree`.
    pub fn child_scope(self) -> Scope {
        match self {
            Scope::OneLevel => Scope::Base,
            Scope::Subordinate => Scope::Subtree,
            other => other,
        }
    }

    /// Whether the base entry itself should be included in the results.
    pub fn includes_base(self) -> bool {
        matches!(self, Scope::Base | Scope::Subtree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onelevel_children_are_searched_at_base_scope() {
        assert_eq!(Scope::OneLevel.child_scope(), Scope::Base);
    }

    #[test]
    fn subordinate_children_are_searched_at_subtree_scope() {
        assert_eq!(Scope::Subordinate.child_scope(), Scope::Subtree);
    }

    #[test]
    fn only_base_and_subtree_include_the_base_entry() {
        assert!(Scope::Base.includes_base());
        assert!(Scope::Subtree.includes_base());
        assert!(!Scope::OneLevel.includes_base());
        assert!(!Scope::Subordinate.includes_base());
    }
}
