//! Splitting stored message content into styled segments.

use std::sync::LazyLock;

use cutroom_store::{EntityReference, Mention, ReferenceKind};
use regex::Regex;

/// A single-word mention (`@Name`) or typed reference (`#video:Name`) at the
/// start of the input.
static WORD_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:@(\w+)|#(project|video|script|post-production|postproduction):([\w-]+))")
        .unwrap()
});

/// A mention or reference found in message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Mention(String),
    Reference(ReferenceKind, String),
}

/// The literal text of a known token. Names may contain spaces.
#[derive(Debug, Clone)]
pub(crate) struct Spelling {
    text: String,
    token: Token,
    ignore_case: bool,
}

impl Spelling {
    pub(crate) fn mention(name: &str, ignore_case: bool) -> Self {
        Self {
            text: format!("@{}", name),
            token: Token::Mention(name.to_string()),
            ignore_case,
        }
    }

    /// Both the hyphenated and the internal spelling of the type.
    pub(crate) fn reference(kind: ReferenceKind, name: &str) -> Vec<Self> {
        let mut spellings = vec![Self {
            text: format!("#{}:{}", kind.token(), name),
            token: Token::Reference(kind, name.to_string()),
            ignore_case: false,
        }];
        if kind.key() != kind.token() {
            spellings.push(Self {
                text: format!("#{}:{}", kind.key(), name),
                token: Token::Reference(kind, name.to_string()),
                ignore_case: false,
            });
        }
        spellings
    }

    fn matches(&self, rest: &str) -> bool {
        let Some(head) = rest.get(..self.text.len()) else {
            return false;
        };
        let equal = if self.ignore_case {
            head.eq_ignore_ascii_case(&self.text)
        } else {
            head == self.text
        };
        equal && ends_token(&rest[self.text.len()..])
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether a token followed by `after` ends there rather than running on
/// into a longer word.
fn ends_token(after: &str) -> bool {
    after.chars().next().is_none_or(|c| !is_word_char(c))
}

/// Exact spellings of the mentions and references recorded for a message.
pub(crate) fn recorded_spellings(
    mentions: &[Mention],
    references: &[EntityReference],
) -> Vec<Spelling> {
    mentions
        .iter()
        .map(|m| Spelling::mention(&m.user_name, false))
        .chain(
            references
                .iter()
                .flat_map(|r| Spelling::reference(r.kind, &r.name)),
        )
        .collect()
}

/// A run of tokenized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece<'a> {
    Text(&'a str),
    Token(Token),
}

/// Split `content` into text and tokens.
///
/// At each `@` or `#`, known spellings are tried longest first, then a
/// single-word token.
pub(crate) fn tokenize(content: &str, mut spellings: Vec<Spelling>) -> Vec<Piece<'_>> {
    spellings.retain(|s| s.text.len() > 1 && !s.text.ends_with(':'));
    spellings.sort_by(|a, b| b.text.len().cmp(&a.text.len()));

    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut at = 0;

    while let Some(c) = content[at..].chars().next() {
        let rest = &content[at..];
        let found = if c == '@' || c == '#' {
            spellings
                .iter()
                .find(|s| s.matches(rest))
                .map(|s| (s.text.len(), s.token.clone()))
                .or_else(|| word_token(rest))
        } else {
            None
        };

        match found {
            Some((len, token)) => {
                if at > text_start {
                    pieces.push(Piece::Text(&content[text_start..at]));
                }
                pieces.push(Piece::Token(token));
                at += len;
                text_start = at;
            }
            None => at += c.len_utf8(),
        }
    }

    if text_start < content.len() {
        pieces.push(Piece::Text(&content[text_start..]));
    }
    pieces
}

fn word_token(rest: &str) -> Option<(usize, Token)> {
    let caps = WORD_TOKEN_RE.captures(rest)?;
    let len = caps.get(0)?.end();
    if let Some(name) = caps.get(1) {
        return Some((len, Token::Mention(name.as_str().to_string())));
    }
    let kind = caps.get(2).and_then(|k| ReferenceKind::parse(k.as_str()))?;
    let name = caps.get(3)?;
    Some((len, Token::Reference(kind, name.as_str().to_string())))
}

/// A run of message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Mention {
        name: String,
    },
    Reference {
        kind: ReferenceKind,
        name: String,
        /// The persisted reference this token resolves to. `None` renders inert.
        target: Option<EntityReference>,
    },
}

impl Segment {
    pub fn is_clickable(&self) -> bool {
        matches!(self, Segment::Reference { target: Some(_), .. })
    }

    /// Text as it appeared in the message.
    pub fn raw(&self) -> String {
        match self {
            Segment::Text(text) => text.clone(),
            Segment::Mention { name } => format!("@{}", name),
            Segment::Reference { kind, name, .. } => format!("#{}:{}", kind.token(), name),
        }
    }
}

/// Split `content` into text, mention and reference segments.
///
/// The names persisted with the message are matched first, so names with
/// spaces stay whole. Other tokens end at the first non-word character.
/// A reference token resolves to the first persisted reference whose name is
/// exactly the token's name.
pub fn parse_segments(
    content: &str,
    mentions: &[Mention],
    references: &[EntityReference],
) -> Vec<Segment> {
    tokenize(content, recorded_spellings(mentions, references))
        .into_iter()
        .map(|piece| match piece {
            Piece::Text(text) => Segment::Text(text.to_string()),
            Piece::Token(Token::Mention(name)) => Segment::Mention { name },
            Piece::Token(Token::Reference(kind, name)) => Segment::Reference {
                target: references.iter().find(|r| r.name == name).cloned(),
                kind,
                name,
            },
        })
        .collect()
}

/// Route of the page showing a referenced entity.
pub fn route_for(reference: &EntityReference) -> String {
    let prefix = match reference.kind {
        ReferenceKind::Project => "/projects",
        ReferenceKind::Video => "/videos",
        ReferenceKind::Script => "/scripts",
        ReferenceKind::PostProduction => "/post-production",
    };
    format!("{}/{}", prefix, reference.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn launch() -> EntityReference {
        EntityReference {
            kind: ReferenceKind::Project,
            id: "p1".to_string(),
            name: "Launch".to_string(),
        }
    }

    #[test]
    fn splits_mentions_and_references() {
        let segments = parse_segments("hello @Ali see #project:Launch today", &[], &[launch()]);
        assert_eq!(
            segments,
            vec![
                Segment::Text("hello ".into()),
                Segment::Mention { name: "Ali".into() },
                Segment::Text(" see ".into()),
                Segment::Reference {
                    kind: ReferenceKind::Project,
                    name: "Launch".into(),
                    target: Some(launch()),
                },
                Segment::Text(" today".into()),
            ]
        );
        assert!(segments[3].is_clickable());
    }

    #[test]
    fn unmatched_reference_is_inert() {
        let segments = parse_segments("#video:Teaser", &[], &[launch()]);
        assert_eq!(segments.len(), 1);
        assert!(!segments[0].is_clickable());
    }

    #[test]
    fn name_match_is_exact() {
        let segments = parse_segments("#project:launch", &[], &[launch()]);
        assert!(!segments[0].is_clickable());
    }

    #[test]
    fn hyphenated_post_production_normalizes() {
        let segments = parse_segments("cut #post-production:Final-Cut", &[], &[]);
        assert_eq!(
            segments[1],
            Segment::Reference {
                kind: ReferenceKind::PostProduction,
                name: "Final-Cut".into(),
                target: None,
            }
        );
        assert_eq!(segments[1].raw(), "#post-production:Final-Cut");
    }

    #[test]
    fn plain_text_is_one_segment() {
        assert_eq!(
            parse_segments("no tokens # here", &[], &[]),
            vec![Segment::Text("no tokens # here".into())]
        );
    }

    #[test]
    fn persisted_names_with_spaces_stay_whole() {
        let big_launch = EntityReference {
            kind: ReferenceKind::Project,
            id: "p9".to_string(),
            name: "Big Launch".to_string(),
        };
        let mentions = [Mention {
            user_id: "u2".to_string(),
            user_name: "Alicia Moreno".to_string(),
        }];
        let segments = parse_segments(
            "hi @Alicia Moreno see #project:Big Launch now",
            &mentions,
            &[big_launch.clone()],
        );
        assert_eq!(
            segments,
            vec![
                Segment::Text("hi ".into()),
                Segment::Mention {
                    name: "Alicia Moreno".into()
                },
                Segment::Text(" see ".into()),
                Segment::Reference {
                    kind: ReferenceKind::Project,
                    name: "Big Launch".into(),
                    target: Some(big_launch),
                },
                Segment::Text(" now".into()),
            ]
        );
    }

    #[test]
    fn longest_persisted_name_wins() {
        let mentions = [
            Mention {
                user_id: "u1".to_string(),
                user_name: "Ali".to_string(),
            },
            Mention {
                user_id: "u4".to_string(),
                user_name: "Ali Haddad".to_string(),
            },
        ];
        let segments = parse_segments("@Ali Haddad and @Ali", &mentions, &[]);
        assert_eq!(
            segments,
            vec![
                Segment::Mention {
                    name: "Ali Haddad".into()
                },
                Segment::Text(" and ".into()),
                Segment::Mention { name: "Ali".into() },
            ]
        );
    }

    #[test]
    fn persisted_name_does_not_match_inside_a_longer_word() {
        let mentions = [Mention {
            user_id: "u1".to_string(),
            user_name: "Ali".to_string(),
        }];
        let segments = parse_segments("@Alicia!", &mentions, &[]);
        assert_eq!(
            segments,
            vec![
                Segment::Mention {
                    name: "Alicia".into()
                },
                Segment::Text("!".into()),
            ]
        );
    }

    #[test]
    fn internal_type_spelling_resolves_too() {
        let cut = EntityReference {
            kind: ReferenceKind::PostProduction,
            id: "pp1".to_string(),
            name: "Final Cut".to_string(),
        };
        let segments = parse_segments("#postproduction:Final Cut", &[], &[cut.clone()]);
        assert_eq!(
            segments,
            vec![Segment::Reference {
                kind: ReferenceKind::PostProduction,
                name: "Final Cut".into(),
                target: Some(cut),
            }]
        );
    }

    #[test]
    fn routes_are_type_specific() {
        let mut reference = launch();
        assert_eq!(route_for(&reference), "/projects/p1");
        reference.kind = ReferenceKind::PostProduction;
        assert_eq!(route_for(&reference), "/post-production/p1");
    }
}
