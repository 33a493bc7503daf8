use std::collections::BTreeSet;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{
    db::{message::RecipientType, user::User},
    error::Error,
};

/// What the caller wants to address: an explicit id list or a named
/// segment shortcut.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecipientSpec {
    Users { ids: Vec<i64> },
    Segment { segment: Segment },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Stream { name: String },
    NonCourse,
    Hackathon,
    All,
}

impl FromStr for Segment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Segment::All),
            "non_course" => Ok(Segment::NonCourse),
            "hackathon" => Ok(Segment::Hackathon),
            other => other
                .strip_prefix("stream:")
                .filter(|name| !name.is_empty())
                .map(|name| Segment::Stream {
                    name: name.to_owned(),
                })
                .ok_or_else(|| Error::validation(format!("unknown segment: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRecipients {
    pub users: Vec<User>,
    pub recipient_type: RecipientType,
    pub recipient_group: Option<String>,
}

/// Translates a recipient specification into a validated, deduplicated
/// user list. Explicit ids must all exist; unknown ids fail the whole
/// request. Segments resolve to whatever matches, possibly nothing.
pub async fn resolve(db: &SqlitePool, spec: &RecipientSpec) -> Result<ResolvedRecipients, Error> {
    let mut conn = db.acquire().await?;

    let users = match spec {
        RecipientSpec::Users { ids } => {
            let unique: Vec<i64> = ids.iter().copied().unique().collect();
            let found = User::by_ids(&mut conn, &unique).await?;

            let known: BTreeSet<i64> = found.iter().map(|u| u.user_id).collect();
            let missing: Vec<i64> = unique
                .iter()
                .copied()
                .filter(|id| !known.contains(id))
                .collect();

            if !missing.is_empty() {
                return Err(Error::UnknownRecipients { user_ids: missing });
            }

            found
        }
        RecipientSpec::Segment { segment } => match segment {
            Segment::Stream { name } => User::by_stream(&mut conn, name).await?,
            Segment::NonCourse => User::non_course(&mut conn).await?,
            Segment::Hackathon => User::hackathon_participants(&mut conn).await?,
            Segment::All => User::list_all(&mut conn).await?,
        },
    };

    let (recipient_type, recipient_group) = classify(&users);

    Ok(ResolvedRecipients {
        users,
        recipient_type,
        recipient_group,
    })
}

/// If all recipients carry the same single stream tag and there is more
/// than one of them, the broadcast is a group send for that stream;
/// otherwise it is an individual send.
pub fn classify(users: &[User]) -> (RecipientType, Option<String>) {
    if users.len() > 1 {
        let tags: BTreeSet<Option<&str>> =
            users.iter().map(|u| u.course_stream.as_deref()).collect();

        if tags.len() == 1 {
            if let Some(Some(tag)) = tags.into_iter().next() {
                return (RecipientType::Group, Some(tag.to_owned()));
            }
        }
    }

    (RecipientType::Individual, None)
}

/// Merges incremental segment selections, deduplicating by user id and
/// keeping the first-seen entry.
pub fn merge_selections(selections: impl IntoIterator<Item = Vec<User>>) -> Vec<User> {
    selections
        .into_iter()
        .flatten()
        .unique_by(|u| u.user_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(user_id: i64, stream: Option<&str>) -> User {
        User {
            user_id,
            username: None,
            first_name: None,
            course_stream: stream.map(str::to_owned),
            hackathon: false,
        }
    }

    #[test]
    fn shared_stream_classifies_as_group() {
        let users = [user(1, Some("rust-2026")), user(2, Some("rust-2026"))];
        assert_eq!(
            classify(&users),
            (RecipientType::Group, Some("rust-2026".to_owned()))
        );
    }

    #[test]
    fn mixed_or_single_recipients_stay_individual() {
        assert_eq!(
            classify(&[user(1, Some("rust-2026"))]),
            (RecipientType::Individual, None)
        );
        assert_eq!(
            classify(&[user(1, Some("rust-2026")), user(2, Some("go-2026"))]),
            (RecipientType::Individual, None)
        );
        assert_eq!(
            classify(&[user(1, None), user(2, None)]),
            (RecipientType::Individual, None)
        );
    }

    #[test]
    fn merge_keeps_first_seen() {
        let merged = merge_selections([
            vec![user(1, Some("a")), user(2, Some("a"))],
            vec![user(2, Some("b")), user(3, None)],
        ]);

        assert_eq!(
            merged.iter().map(|u| u.user_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(merged[1].course_stream.as_deref(), Some("a"));
    }

    #[test]
    fn segment_parses_from_path() {
        assert_eq!("all".parse::<Segment>().unwrap(), Segment::All);
        assert_eq!(
            "stream:rust-2026".parse::<Segment>().unwrap(),
            Segment::Stream {
                name: "rust-2026".to_owned()
            }
        );
        assert!("stream:".parse::<Segment>().is_err());
        assert!("bogus".parse::<Segment>().is_err());
    }
}
