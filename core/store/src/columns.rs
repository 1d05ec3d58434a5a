use std::fmt;

/// This enum holds the information about the columns that we use within the
/// key-value storage.
///
/// You can think about the storage as a 2-dimensional table (with key and
/// column as indexes/coordinates). Column names are part of the persisted
/// layout; renaming a variant is a breaking change.
#[derive(
    PartialEq,
    Copy,
    Clone,
    Debug,
    Hash,
    Eq,
    strum::EnumCount,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum DBCol {
    /// Column to indicate which version of database this is.
    /// - *Rows*: single row `"VERSION"`
    /// - *Content type*: version (u32), serialized as decimal text
    DbVersion,
    /// Trusted peer records.
    /// - *Rows*: `peer:<peer-id bytes>`
    /// - *Content type*: serialized peer record
    Peers,
    /// Peer groups.
    /// - *Rows*: `group:<name>`
    /// - *Content type*: serialized group record
    Groups,
    /// Peers for which every connection is refused.
    /// - *Rows*: `blocked:<peer-id bytes>`
    /// - *Content type*: empty
    Blocklist,
    /// Registry-wide settings.
    /// - *Rows*: `settings:<name>` (for example `settings:strict_mode`)
    /// - *Content type*: cell specific
    Settings,
}

impl fmt::Display for DBCol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&str>::from(self))
    }
}
