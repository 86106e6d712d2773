//! Cached entity types and the dependencies between their views.

use std::fmt;

use cutroom_store::{
    CREATED_AT_FIELD, Client, Direction, PostProduction, Project, Query, Script, Video,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::{CacheStore, EntityCache};

/// The entity types held by the [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Video,
    Script,
    Client,
    PostProduction,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Project,
        EntityKind::Video,
        EntityKind::Script,
        EntityKind::Client,
        EntityKind::PostProduction,
    ];

    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Project => Project::COLLECTION,
            EntityKind::Video => Video::COLLECTION,
            EntityKind::Script => Script::COLLECTION,
            EntityKind::Client => Client::COLLECTION,
            EntityKind::PostProduction => PostProduction::COLLECTION,
        }
    }

    /// Caches whose views embed data from this kind and go stale when it changes.
    ///
    /// Videos show their project and their script/edit status; projects show
    /// their client; scripts and edits show their video.
    pub fn dependents(self) -> &'static [EntityKind] {
        match self {
            EntityKind::Project => &[EntityKind::Video],
            EntityKind::Video => &[EntityKind::Script, EntityKind::PostProduction],
            EntityKind::Script => &[EntityKind::Video],
            EntityKind::Client => &[EntityKind::Project],
            EntityKind::PostProduction => &[EntityKind::Video],
        }
    }

    /// Parse a kind from user input. Accepts singular and plural forms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "project" | "projects" => Some(EntityKind::Project),
            "video" | "videos" => Some(EntityKind::Video),
            "script" | "scripts" => Some(EntityKind::Script),
            "client" | "clients" => Some(EntityKind::Client),
            "postproduction" | "post-production" | "postproductions" | "post-productions" => {
                Some(EntityKind::PostProduction)
            }
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Project => "project",
            EntityKind::Video => "video",
            EntityKind::Script => "script",
            EntityKind::Client => "client",
            EntityKind::PostProduction => "post-production",
        };
        f.write_str(name)
    }
}

/// A record type with its own cache in the [`CacheStore`].
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// The one-shot read that populates the cache. Newest first by default.
    fn query() -> Query {
        Query::collection(Self::KIND.collection()).order_by(CREATED_AT_FIELD, Direction::Desc)
    }

    /// This type's cache within `caches`.
    fn cache(caches: &CacheStore) -> &EntityCache<Self>;
}

impl Entity for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> &str {
        &self.id
    }

    fn cache(caches: &CacheStore) -> &EntityCache<Self> {
        &caches.projects
    }
}

impl Entity for Video {
    const KIND: EntityKind = EntityKind::Video;

    fn id(&self) -> &str {
        &self.id
    }

    fn cache(caches: &CacheStore) -> &EntityCache<Self> {
        &caches.videos
    }
}

impl Entity for Script {
    const KIND: EntityKind = EntityKind::Script;

    fn id(&self) -> &str {
        &self.id
    }

    fn cache(caches: &CacheStore) -> &EntityCache<Self> {
        &caches.scripts
    }
}

impl Entity for Client {
    const KIND: EntityKind = EntityKind::Client;

    fn id(&self) -> &str {
        &self.id
    }

    // Client lists are alphabetical.
    fn query() -> Query {
        Query::collection(Self::KIND.collection()).order_by("name", Direction::Asc)
    }

    fn cache(caches: &CacheStore) -> &EntityCache<Self> {
        &caches.clients
    }
}

impl Entity for PostProduction {
    const KIND: EntityKind = EntityKind::PostProduction;

    fn id(&self) -> &str {
        &self.id
    }

    fn cache(caches: &CacheStore) -> &EntityCache<Self> {
        &caches.post_productions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_kind_depends_on_itself() {
        for kind in EntityKind::ALL {
            assert!(!kind.dependents().contains(&kind), "{kind} lists itself");
        }
    }

    #[test]
    fn parse_accepts_plural_and_hyphenated() {
        assert_eq!(EntityKind::parse("Videos"), Some(EntityKind::Video));
        assert_eq!(
            EntityKind::parse("post-production"),
            Some(EntityKind::PostProduction)
        );
        assert_eq!(EntityKind::parse("users"), None);
    }

    #[test]
    fn clients_order_by_name() {
        let order = Client::query().order_by.unwrap();
        assert_eq!(order.field, "name");
        assert_eq!(order.direction, Direction::Asc);
    }
}
