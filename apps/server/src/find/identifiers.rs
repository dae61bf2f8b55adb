use crate::models::ResourceType;

/// Public ids restricting a lookup, at most one per level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrthancIdentifiers {
    ids: [Option<String>; 4],
}

impl OrthancIdentifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, level: ResourceType, id: impl Into<String>) {
        self.ids[level.index()] = Some(id.into());
    }

    pub fn get(&self, level: ResourceType) -> Option<&str> {
        self.ids[level.index()].as_deref()
    }

    pub fn has(&self, level: ResourceType) -> bool {
        self.ids[level.index()].is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.iter().all(Option::is_none)
    }

    /// Deepest level carrying an id, with that id.
    pub fn deepest(&self) -> Option<(ResourceType, &str)> {
        ResourceType::ALL
            .iter()
            .rev()
            .find_map(|level| self.get(*level).map(|id| (*level, id)))
    }

    /// The only id that is set, if exactly one is.
    pub fn single(&self) -> Option<(ResourceType, &str)> {
        if self.ids.iter().filter(|id| id.is_some()).count() == 1 {
            self.deepest()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepest_and_single() {
        let mut ids = OrthancIdentifiers::new();
        assert!(ids.is_empty());
        assert_eq!(ids.deepest(), None);

        ids.set(ResourceType::Patient, "p");
        assert_eq!(ids.single(), Some((ResourceType::Patient, "p")));

        ids.set(ResourceType::Series, "s");
        assert_eq!(ids.deepest(), Some((ResourceType::Series, "s")));
        assert_eq!(ids.single(), None);
    }
}
