//! Member to scene reverse index

use indexmap::{IndexMap, IndexSet};
use scene_core::SceneDefinition;

/// Which scenes reference each member, built once
#[derive(Debug, Clone, Default)]
pub struct ReverseIndex {
    members: IndexMap<String, IndexSet<String>>,
}

impl ReverseIndex {
    pub fn build<'a>(definitions: impl IntoIterator<Item = &'a SceneDefinition>) -> Self {
        let mut members: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for definition in definitions {
            for member in definition.member_ids() {
                members
                    .entry(member.to_string())
                    .or_default()
                    .insert(definition.id.clone());
            }
        }
        Self { members }
    }

    /// Scene ids referencing `member`, in definition order
    pub fn scenes_for(&self, member: &str) -> impl Iterator<Item = &str> {
        self.members
            .get(member)
            .into_iter()
            .flat_map(|scenes| scenes.iter().map(String::as_str))
    }

    /// Every member referenced by at least one scene
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
