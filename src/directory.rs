use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ulid::Ulid;

/// Lookups the booking flow needs from the rest of the platform
/// (moderation and family records). Both are plain yes/no questions.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Is the specialist's profile in the approved moderation state?
    async fn is_specialist_approved(&self, specialist_id: Ulid) -> bool;

    /// Does the child belong to the parent?
    async fn is_child_of(&self, child_id: Ulid, parent_id: Ulid) -> bool;
}

/// Directory held in memory. Used by tests and by embedders that sync
/// moderation state into the process.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    approved: DashSet<Ulid>,
    /// child → parent
    children: DashMap<Ulid, Ulid>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&self, specialist_id: Ulid) {
        self.approved.insert(specialist_id);
    }

    pub fn revoke(&self, specialist_id: Ulid) {
        self.approved.remove(&specialist_id);
    }

    pub fn add_child(&self, parent_id: Ulid, child_id: Ulid) {
        self.children.insert(child_id, parent_id);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn is_specialist_approved(&self, specialist_id: Ulid) -> bool {
        self.approved.contains(&specialist_id)
    }

    async fn is_child_of(&self, child_id: Ulid, parent_id: Ulid) -> bool {
        self.children
            .get(&child_id)
            .is_some_and(|owner| *owner.value() == parent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approval_and_children() {
        let dir = InMemoryDirectory::new();
        let spec = Ulid::new();
        let parent = Ulid::new();
        let child = Ulid::new();

        assert!(!dir.is_specialist_approved(spec).await);
        dir.approve(spec);
        assert!(dir.is_specialist_approved(spec).await);
        dir.revoke(spec);
        assert!(!dir.is_specialist_approved(spec).await);

        dir.add_child(parent, child);
        assert!(dir.is_child_of(child, parent).await);
        assert!(!dir.is_child_of(child, Ulid::new()).await);
        assert!(!dir.is_child_of(Ulid::new(), parent).await);
    }
}
