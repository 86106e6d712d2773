//! Compose-time mention and reference pickers.
//!
//! Typing `@` opens a user picker and `#` opens a two-step reference picker
//! (entity type, then entity). Picking splices a formatted token into the text
//! and records the structured entry that is sent along with it.

use std::sync::LazyLock;

use cutroom_store::{
    EntityReference, Mention, PostProduction, Project, ReferenceKind, Script, UserProfile, Video,
};
use regex::Regex;

use super::render::{Piece, Spelling, Token, recorded_spellings, tokenize};

static MENTION_TRIGGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@(\w*)$").unwrap());
static REFERENCE_TRIGGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(\w*)$").unwrap());

/// Autocomplete catalogs, loaded once per session.
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub users: Vec<UserProfile>,
    pub projects: Vec<Project>,
    pub videos: Vec<Video>,
    pub scripts: Vec<Script>,
    pub post_productions: Vec<PostProduction>,
}

impl Lookups {
    /// Every referenceable entity of `kind`, with its display name.
    pub fn references(&self, kind: ReferenceKind) -> Vec<EntityReference> {
        let entry = |id: &str, name: &str| EntityReference {
            kind,
            id: id.to_string(),
            name: name.to_string(),
        };
        match kind {
            ReferenceKind::Project => self
                .projects
                .iter()
                .map(|p| entry(&p.id, p.display_name()))
                .collect(),
            ReferenceKind::Video => self
                .videos
                .iter()
                .map(|v| entry(&v.id, v.display_title()))
                .collect(),
            ReferenceKind::Script => self
                .scripts
                .iter()
                .map(|s| entry(&s.id, s.display_title()))
                .collect(),
            ReferenceKind::PostProduction => self
                .post_productions
                .iter()
                .map(|p| entry(&p.id, p.display_title()))
                .collect(),
        }
    }

    /// Users whose name contains `query`, ignoring case.
    pub fn matching_users(&self, query: &str) -> Vec<&UserProfile> {
        let query = query.to_lowercase();
        self.users
            .iter()
            .filter(|u| u.display_name().to_lowercase().contains(&query))
            .collect()
    }

    /// Entities of `kind` whose name contains `query`, ignoring case.
    pub fn matching_references(&self, kind: ReferenceKind, query: &str) -> Vec<EntityReference> {
        let query = query.to_lowercase();
        self.references(kind)
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&query))
            .collect()
    }
}

/// Which picker is open, and where its trigger character sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Picker {
    Closed,
    Mention {
        start: usize,
        query: String,
    },
    ReferenceType {
        start: usize,
        query: String,
    },
    ReferenceEntity {
        start: usize,
        kind: ReferenceKind,
        query: String,
    },
}

/// A message ready to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub mentions: Vec<Mention>,
    pub references: Vec<EntityReference>,
}

impl Draft {
    /// Build a draft from raw text, resolving `@Name` and `#type:Name` tokens
    /// typed without the pickers.
    ///
    /// Full names are tried longest first, so `@Alicia Moreno` resolves as one
    /// token. A single-word mention also matches a user's first name. Mentions
    /// ignore case; references need an exact name within the type.
    pub fn from_text(text: &str, lookups: &Lookups) -> Self {
        let mut draft = Draft {
            content: text.trim().to_string(),
            ..Default::default()
        };

        let spellings = lookups
            .users
            .iter()
            .map(|u| Spelling::mention(u.display_name(), true))
            .chain(ReferenceKind::ALL.into_iter().flat_map(|kind| {
                lookups
                    .references(kind)
                    .into_iter()
                    .flat_map(move |r| Spelling::reference(kind, &r.name))
            }))
            .collect();

        for piece in tokenize(text, spellings) {
            match piece {
                Piece::Text(_) => {}
                Piece::Token(Token::Mention(name)) => {
                    let user = lookups.users.iter().find(|u| {
                        let display = u.display_name();
                        display.eq_ignore_ascii_case(&name)
                            || display
                                .split_whitespace()
                                .next()
                                .is_some_and(|first| first.eq_ignore_ascii_case(&name))
                    });
                    if let Some(user) = user {
                        push_mention(&mut draft.mentions, user);
                    }
                }
                Piece::Token(Token::Reference(kind, name)) => {
                    if let Some(reference) =
                        lookups.references(kind).into_iter().find(|r| r.name == name)
                    {
                        push_reference(&mut draft.references, reference);
                    }
                }
            }
        }
        draft
    }
}

fn push_mention(mentions: &mut Vec<Mention>, user: &UserProfile) {
    if mentions.iter().all(|m| m.user_id != user.id) {
        mentions.push(Mention {
            user_id: user.id.clone(),
            user_name: user.display_name().to_string(),
        });
    }
}

fn push_reference(references: &mut Vec<EntityReference>, reference: EntityReference) {
    if !references.contains(&reference) {
        references.push(reference);
    }
}

/// Message input state.
#[derive(Debug, Clone)]
pub struct Composer {
    text: String,
    /// Byte offset into `text`.
    cursor: usize,
    picker: Picker,
    mentions: Vec<Mention>,
    references: Vec<EntityReference>,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new()
    }
}

impl Composer {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            cursor: 0,
            picker: Picker::Closed,
            mentions: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn picker(&self) -> &Picker {
        &self.picker
    }

    /// Replace the input and cursor, then re-scan for a trigger.
    pub fn set_text(&mut self, text: impl Into<String>, cursor: usize) {
        self.text = text.into();
        let mut cursor = cursor.min(self.text.len());
        while !self.text.is_char_boundary(cursor) {
            cursor -= 1;
        }
        self.cursor = cursor;
        self.update_picker();
    }

    /// Type at the end of the input.
    pub fn type_text(&mut self, text: &str) {
        let mut next = self.text.clone();
        next.insert_str(self.cursor, text);
        let cursor = self.cursor + text.len();
        self.set_text(next, cursor);
    }

    fn update_picker(&mut self) {
        let before = &self.text[..self.cursor];
        let mention = MENTION_TRIGGER_RE.captures(before);
        let reference = REFERENCE_TRIGGER_RE.captures(before);

        let start_of = |caps: &Option<regex::Captures<'_>>| {
            caps.as_ref().and_then(|c| c.get(0)).map(|m| m.start())
        };
        let query_of = |caps: &Option<regex::Captures<'_>>| {
            caps.as_ref()
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };

        // The trigger nearer the cursor wins.
        self.picker = match (start_of(&mention), start_of(&reference)) {
            (Some(m), r) if r.is_none_or(|r| m > r) => Picker::Mention {
                start: m,
                query: query_of(&mention),
            },
            (_, Some(start)) => match &self.picker {
                Picker::ReferenceEntity {
                    start: open_start,
                    kind,
                    ..
                } if *open_start == start => Picker::ReferenceEntity {
                    start,
                    kind: *kind,
                    query: query_of(&reference),
                },
                _ => Picker::ReferenceType {
                    start,
                    query: query_of(&reference),
                },
            },
            _ => Picker::Closed,
        };
    }

    pub fn close_picker(&mut self) {
        self.picker = Picker::Closed;
    }

    /// Users offered by an open mention picker.
    pub fn mention_candidates<'a>(&self, lookups: &'a Lookups) -> Vec<&'a UserProfile> {
        match &self.picker {
            Picker::Mention { query, .. } => lookups.matching_users(query),
            _ => Vec::new(),
        }
    }

    /// Entity types offered by the first reference step.
    pub fn reference_type_candidates(&self) -> Vec<ReferenceKind> {
        match &self.picker {
            Picker::ReferenceType { query, .. } => {
                let query = query.to_lowercase();
                ReferenceKind::ALL
                    .into_iter()
                    .filter(|k| {
                        k.label().to_lowercase().contains(&query)
                            || k.key().contains(&query)
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Entities offered by the second reference step.
    pub fn reference_candidates(&self, lookups: &Lookups) -> Vec<EntityReference> {
        match &self.picker {
            Picker::ReferenceEntity { kind, query, .. } => {
                lookups.matching_references(*kind, query)
            }
            _ => Vec::new(),
        }
    }

    /// Pick the entity type. The text typed to filter types is cleared so that
    /// further typing filters entities.
    pub fn choose_reference_type(&mut self, kind: ReferenceKind) -> bool {
        let Picker::ReferenceType { start, .. } = self.picker else {
            return false;
        };
        let trigger_end = start + 1;
        self.text.replace_range(trigger_end..self.cursor, "");
        self.cursor = trigger_end;
        self.picker = Picker::ReferenceEntity {
            start,
            kind,
            query: String::new(),
        };
        true
    }

    /// Pick a user from the open mention picker.
    pub fn select_mention(&mut self, user: &UserProfile) -> bool {
        let Picker::Mention { start, .. } = self.picker else {
            return false;
        };
        self.splice(start, &format!("@{} ", user.display_name()));
        push_mention(&mut self.mentions, user);
        true
    }

    /// Pick an entity from the open reference picker.
    pub fn select_reference(&mut self, reference: EntityReference) -> bool {
        let Picker::ReferenceEntity { start, .. } = self.picker else {
            return false;
        };
        self.splice(
            start,
            &format!("#{}:{} ", reference.kind.token(), reference.name),
        );
        push_reference(&mut self.references, reference);
        true
    }

    fn splice(&mut self, start: usize, token: &str) {
        self.text.replace_range(start..self.cursor, token);
        self.cursor = start + token.len();
        self.picker = Picker::Closed;
    }

    /// The message to send. Picked entries whose token was edited away are
    /// dropped; a token only counts when it stands whole in the text.
    pub fn submission(&self) -> Draft {
        let present: Vec<Token> = tokenize(
            &self.text,
            recorded_spellings(&self.mentions, &self.references),
        )
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Token(token) => Some(token),
            Piece::Text(_) => None,
        })
        .collect();

        Draft {
            content: self.text.trim().to_string(),
            mentions: self
                .mentions
                .iter()
                .filter(|m| present.contains(&Token::Mention(m.user_name.clone())))
                .cloned()
                .collect(),
            references: self
                .references
                .iter()
                .filter(|r| present.contains(&Token::Reference(r.kind, r.name.clone())))
                .cloned()
                .collect(),
        }
    }

    /// Reset after a successful send.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
