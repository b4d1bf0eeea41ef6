//! Queue permissions.

use std::collections::HashSet;

use ci_queue::{AccessControl, Actor, BuildRequest, OwnerId};

/// Admins may do anything. Other actors may cancel their own personal builds.
#[derive(Debug, Clone, Default)]
pub struct ActorAccess {
    admins: HashSet<String>,
}

impl ActorAccess {
    pub fn new(admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    pub fn is_admin(&self, actor: &Actor) -> bool {
        self.admins.contains(&actor.name)
    }

    fn owns(actor: &Actor, request: &BuildRequest) -> bool {
        match (&request.owner, actor.id) {
            (OwnerId::User(user_id), Some(actor_id)) => *user_id == actor_id,
            _ => false,
        }
    }
}

impl AccessControl for ActorAccess {
    fn can_cancel(&self, actor: &Actor, request: &BuildRequest) -> bool {
        self.is_admin(actor) || Self::owns(actor, request)
    }

    fn can_cancel_all(&self, actor: &Actor) -> bool {
        self.is_admin(actor)
    }

    fn can_toggle_queue(&self, actor: &Actor) -> bool {
        self.is_admin(actor)
    }

    fn can_view(&self, actor: &Actor, request: &BuildRequest) -> bool {
        !request.is_personal() || self.is_admin(actor) || Self::owns(actor, request)
    }
}

#[cfg(test)]
mod tests {
    use ci_queue::RequestId;

    use super::*;

    fn access() -> ActorAccess {
        ActorAccess::new(["root".to_string()])
    }

    #[test]
    fn admins_may_do_everything() {
        let root = Actor::new(None, "root");
        let request = BuildRequest::new(RequestId(1), OwnerId::User(4), "personal");

        assert!(access().can_cancel(&root, &request));
        assert!(access().can_cancel_all(&root));
        assert!(access().can_toggle_queue(&root));
        assert!(access().can_view(&root, &request));
    }

    #[test]
    fn users_manage_their_personal_builds_only() {
        let alice = Actor::new(Some(4), "alice");
        let own = BuildRequest::new(RequestId(1), OwnerId::User(4), "personal");
        let other = BuildRequest::new(RequestId(2), OwnerId::User(5), "personal");
        let project = BuildRequest::new(RequestId(3), OwnerId::Project(4), "scm");

        assert!(access().can_cancel(&alice, &own));
        assert!(access().can_view(&alice, &own));
        assert!(!access().can_cancel(&alice, &other));
        assert!(!access().can_view(&alice, &other));
        assert!(!access().can_cancel(&alice, &project));
        assert!(access().can_view(&alice, &project));
        assert!(!access().can_cancel_all(&alice));
        assert!(!access().can_toggle_queue(&Actor::anonymous()));
    }
}
