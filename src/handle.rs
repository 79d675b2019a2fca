//! Folder-name grammar and canonicalization.
//!
//! A folder name is a comma-separated writer list, optionally followed by
//! `#` and a comma-separated reader list. The canonical form sorts and
//! deduplicates each list and drops readers that already appear as
//! writers; any other spelling of the same handle is an alias.

use std::fmt;

use crate::ops::Kbpki;
use crate::ops::OpContext;
use crate::ops::OpsError;

/// Separator between users within a list.
pub const USER_SEP: char = ',';
/// Separator between the writer and reader lists.
pub const READER_SEP: char = '#';

/// A parsed, resolved top-level folder handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlfHandle {
    writers: Vec<String>,
    readers: Vec<String>,
    public: bool,
}

impl TlfHandle {
    /// The resolved writers, sorted.
    pub fn writers(&self) -> &[String] {
        &self.writers
    }

    /// The resolved readers, sorted, disjoint from the writers.
    pub fn readers(&self) -> &[String] {
        &self.readers
    }

    /// Whether the folder lives in the public namespace.
    pub fn public(&self) -> bool {
        self.public
    }

    /// The canonical spelling of this handle.
    pub fn canonical_name(&self) -> String {
        let mut name = self.writers.join(",");
        if !self.readers.is_empty() {
            name.push(READER_SEP);
            name.push_str(&self.readers.join(","));
        }
        name
    }

    /// Whether `user` may read the folder.
    pub fn has_reader(&self, user: &str) -> bool {
        self.public
            || self.writers.iter().any(|w| w == user)
            || self.readers.iter().any(|r| r == user)
    }
}

impl fmt::Display for TlfHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

/// Failure modes of [`parse_tlf_handle`].
#[derive(Debug)]
pub enum HandleError {
    /// The name is valid but not in canonical form; the payload is the
    /// canonical spelling.
    NonCanonical(String),
    /// A listed user does not exist.
    NoSuchUser(String),
    /// A public folder may not name readers.
    ReadersInPublic,
    /// The name does not match the grammar.
    BadName(String),
    /// Resolution failed for another reason.
    Ops(OpsError),
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::NonCanonical(canon) => {
                write!(f, "name is an alias for {canon}")
            }
            HandleError::NoSuchUser(user) => write!(f, "{user} is not a known user"),
            HandleError::ReadersInPublic => f.write_str("public folders cannot have readers"),
            HandleError::BadName(name) => write!(f, "{name:?} is not a valid folder name"),
            HandleError::Ops(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for HandleError {}

/// Parse `name` against the folder-name grammar, resolving each listed
/// user through `kbpki`. Returns the handle only when `name` is already
/// canonical; a valid alias fails with [`HandleError::NonCanonical`].
pub fn parse_tlf_handle(
    ctx: &OpContext,
    kbpki: &dyn Kbpki,
    name: &str,
    public: bool,
) -> Result<TlfHandle, HandleError> {
    if name.is_empty() {
        return Err(HandleError::BadName(name.to_string()));
    }
    let mut halves = name.split(READER_SEP);
    let writer_list = halves.next().unwrap_or_default();
    let reader_list = halves.next();
    if halves.next().is_some() {
        return Err(HandleError::BadName(name.to_string()));
    }
    if public && reader_list.is_some() {
        return Err(HandleError::ReadersInPublic);
    }

    let mut writers = resolve_user_list(ctx, kbpki, name, writer_list)?;
    let mut readers = match reader_list {
        Some(list) => resolve_user_list(ctx, kbpki, name, list)?,
        None => Vec::new(),
    };
    writers.sort();
    writers.dedup();
    readers.sort();
    readers.dedup();
    readers.retain(|r| !writers.contains(r));

    let handle = TlfHandle {
        writers,
        readers,
        public,
    };
    let canonical = handle.canonical_name();
    if canonical != name {
        return Err(HandleError::NonCanonical(canonical));
    }
    Ok(handle)
}

fn resolve_user_list(
    ctx: &OpContext,
    kbpki: &dyn Kbpki,
    name: &str,
    list: &str,
) -> Result<Vec<String>, HandleError> {
    let mut users = Vec::new();
    for assertion in list.split(USER_SEP) {
        if assertion.is_empty() {
            return Err(HandleError::BadName(name.to_string()));
        }
        match kbpki.resolve_user(ctx, assertion) {
            Ok(user) => users.push(user),
            Err(OpsError::NoSuchUser(user)) => return Err(HandleError::NoSuchUser(user)),
            Err(err) => return Err(HandleError::Ops(err)),
        }
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memfs::LocalKbpki;

    fn kbpki() -> Arc<LocalKbpki> {
        Arc::new(LocalKbpki::new(
            ["jdoe", "wsmith", "max"],
            Some("jdoe".to_string()),
        ))
    }

    fn parse(name: &str, public: bool) -> Result<TlfHandle, HandleError> {
        parse_tlf_handle(&OpContext::background(), kbpki().as_ref(), name, public)
    }

    #[test]
    fn canonical_single_writer() {
        let handle = parse("jdoe", false).unwrap();
        assert_eq!(handle.writers(), ["jdoe"]);
        assert!(handle.readers().is_empty());
        assert_eq!(handle.canonical_name(), "jdoe");
    }

    #[test]
    fn duplicate_writer_is_alias() {
        match parse("jdoe,jdoe", false) {
            Err(HandleError::NonCanonical(canon)) => assert_eq!(canon, "jdoe"),
            other => panic!("expected alias, got {other:?}"),
        }
    }

    #[test]
    fn unsorted_writers_are_alias() {
        match parse("wsmith,jdoe", false) {
            Err(HandleError::NonCanonical(canon)) => assert_eq!(canon, "jdoe,wsmith"),
            other => panic!("expected alias, got {other:?}"),
        }
    }

    #[test]
    fn reader_list_parses() {
        let handle = parse("jdoe#wsmith", false).unwrap();
        assert_eq!(handle.writers(), ["jdoe"]);
        assert_eq!(handle.readers(), ["wsmith"]);
    }

    #[test]
    fn writer_absorbed_from_readers() {
        match parse("jdoe#jdoe,wsmith", false) {
            Err(HandleError::NonCanonical(canon)) => assert_eq!(canon, "jdoe#wsmith"),
            other => panic!("expected alias, got {other:?}"),
        }
    }

    #[test]
    fn unknown_user() {
        match parse("nobody", false) {
            Err(HandleError::NoSuchUser(user)) => assert_eq!(user, "nobody"),
            other => panic!("expected no such user, got {other:?}"),
        }
    }

    #[test]
    fn public_readers_rejected() {
        assert!(matches!(
            parse("jdoe#wsmith", true),
            Err(HandleError::ReadersInPublic)
        ));
    }

    #[test]
    fn bad_names() {
        for name in ["", "a##b", "jdoe,,wsmith", "#wsmith", "jdoe#"] {
            assert!(
                matches!(parse(name, false), Err(HandleError::BadName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn reader_access() {
        let handle = parse("jdoe#wsmith", false).unwrap();
        assert!(handle.has_reader("jdoe"));
        assert!(handle.has_reader("wsmith"));
        assert!(!handle.has_reader("max"));
    }
}
