//! Migration units and their on-disk source format.
//!
//! A unit file looks like:
//!
//! ```sql
//! -- description: Create users
//! -- @up
//! CREATE TABLE users (id VARCHAR(36) NOT NULL, PRIMARY KEY (id));
//! CREATE INDEX idx_users_id ON users (id);
//! -- @down
//! DROP TABLE users;
//! ```
//!
//! Without an `-- @up` marker everything before `-- @down` is forward SQL.
//! Without `-- @down` the unit is irreversible.

use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;

use sha2::{Digest, Sha256};

use crate::error::{Result, StrataError};

/// Direction a unit is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single versioned migration: forward and reverse statement lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    identifier: String,
    description: String,
    up: Vec<String>,
    down: Vec<String>,
    checksum: String,
    source: Option<PathBuf>,
}

impl MigrationUnit {
    /// Build a unit from explicit statement lists.
    pub fn new(
        identifier: impl Into<String>,
        description: impl Into<String>,
        up: Vec<String>,
        down: Vec<String>,
    ) -> Result<Self> {
        let identifier = identifier.into();
        validate_identifier(&identifier)?;

        if up.iter().all(|s| s.trim().is_empty()) {
            return Err(StrataError::InvalidMigration(format!(
                "{} has no up statements",
                identifier
            )));
        }

        let checksum = compute_checksum(&up, &down);
        Ok(Self {
            identifier,
            description: description.into(),
            up,
            down,
            checksum,
            source: None,
        })
    }

    /// Parse a unit from SQL source. A `-- description:` header overrides
    /// the given description.
    pub fn from_sql(
        identifier: impl Into<String>,
        description: impl Into<String>,
        sql: &str,
    ) -> Result<Self> {
        let identifier = identifier.into();
        let sections = Sections::parse(sql).map_err(|reason| {
            StrataError::InvalidMigration(format!("{}: {}", identifier, reason))
        })?;

        let description = sections.description.unwrap_or_else(|| description.into());
        let up = split_statements(&sections.up);
        let down = sections
            .down
            .as_deref()
            .map(split_statements)
            .unwrap_or_default();

        Self::new(identifier, description, up, down)
    }

    /// Load a unit from a `<identifier>_<slug>.sql` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
            StrataError::InvalidMigration(format!(
                "Invalid migration filename: {}",
                path.display()
            ))
        })?;

        let (identifier, slug) = stem.split_once('_').unwrap_or((stem, ""));
        let sql = std::fs::read_to_string(path)?;

        let mut unit = Self::from_sql(identifier, slug.replace('_', " "), &sql)?;
        unit.source = Some(path.to_path_buf());
        Ok(unit)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Forward statements in execution order.
    pub fn up(&self) -> &[String] {
        &self.up
    }

    /// Reverse statements in execution order, as the author declared them.
    pub fn down(&self) -> &[String] {
        &self.down
    }

    pub fn statements(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    pub fn has_down(&self) -> bool {
        !self.down.is_empty()
    }

    /// SHA-256 over both statement lists, hex encoded.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// File the unit was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Identifiers sort lexicographically, so only ASCII alphanumerics are allowed.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() || !identifier.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StrataError::InvalidMigration(format!(
            "Invalid migration identifier '{}': expected ASCII letters and digits",
            identifier
        )));
    }
    Ok(())
}

fn compute_checksum(up: &[String], down: &[String]) -> String {
    let mut hasher = Sha256::new();
    for statement in up {
        hasher.update(statement.trim().as_bytes());
        hasher.update(b"\n;\n");
    }
    hasher.update(b"-- @down\n");
    for statement in down {
        hasher.update(statement.trim().as_bytes());
        hasher.update(b"\n;\n");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default)]
struct Sections {
    description: Option<String>,
    up: String,
    down: Option<String>,
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Up,
    Down,
}

impl Sections {
    fn parse(sql: &str) -> std::result::Result<Self, String> {
        let mut sections = Sections::default();
        let mut current = Section::Preamble;

        for line in sql.lines() {
            match marker(line) {
                Some(Marker::Up) => {
                    if current != Section::Preamble {
                        return Err("unexpected '-- @up' marker".into());
                    }
                    current = Section::Up;
                    continue;
                }
                Some(Marker::Down) => {
                    if current == Section::Down {
                        return Err("duplicate '-- @down' marker".into());
                    }
                    current = Section::Down;
                    sections.down = Some(String::new());
                    continue;
                }
                Some(Marker::Description(text)) if current == Section::Preamble => {
                    sections.description = Some(text);
                    continue;
                }
                _ => {}
            }

            let target = match current {
                Section::Preamble | Section::Up => &mut sections.up,
                Section::Down => sections.down.get_or_insert_with(String::new),
            };
            target.push_str(line);
            target.push('\n');
        }

        Ok(sections)
    }
}

enum Marker {
    Up,
    Down,
    Description(String),
}

fn marker(line: &str) -> Option<Marker> {
    let comment = line.trim().strip_prefix("--")?.trim();
    if comment.eq_ignore_ascii_case("@up") {
        Some(Marker::Up)
    } else if comment.eq_ignore_ascii_case("@down") {
        Some(Marker::Down)
    } else {
        let (key, value) = comment.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("description") && !value.trim().is_empty() {
            Some(Marker::Description(value.trim().to_string()))
        } else {
            None
        }
    }
}

enum Scan {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
    DollarQuoted(String),
}

/// Split SQL into individual statements.
///
/// Semicolons inside quoted strings, quoted identifiers, comments and
/// dollar-quoted bodies (`$$ ... $$`, `$fn$ ... $fn$`) do not split.
/// Comment-only fragments are dropped and leading comments are trimmed.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut state = Scan::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match &state {
            Scan::Normal => {
                if c == '-' && chars.peek() == Some(&'-') {
                    chars.next();
                    current.push_str("--");
                    state = Scan::LineComment;
                    continue;
                }
                if c == '/' && chars.peek() == Some(&'*') {
                    chars.next();
                    current.push_str("/*");
                    state = Scan::BlockComment;
                    continue;
                }
                if c == ';' {
                    flush(&mut statements, &mut current, has_code);
                    has_code = false;
                    continue;
                }

                if !has_code && !c.is_whitespace() {
                    // Everything before the first code character is whitespace or comments.
                    current.clear();
                    has_code = true;
                }
                current.push(c);

                match c {
                    '\'' => state = Scan::SingleQuoted,
                    '"' => state = Scan::DoubleQuoted,
                    '$' => {
                        if let Some(tag) = read_dollar_tag(&mut chars, &mut current) {
                            state = Scan::DollarQuoted(tag);
                        }
                    }
                    _ => {}
                }
            }
            Scan::SingleQuoted => {
                current.push(c);
                if c == '\'' {
                    state = Scan::Normal;
                }
            }
            Scan::DoubleQuoted => {
                current.push(c);
                if c == '"' {
                    state = Scan::Normal;
                }
            }
            Scan::LineComment => {
                current.push(c);
                if c == '\n' {
                    state = Scan::Normal;
                }
            }
            Scan::BlockComment => {
                current.push(c);
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push('/');
                    state = Scan::Normal;
                }
            }
            Scan::DollarQuoted(tag) => {
                current.push(c);
                if c == '$' {
                    if let Some(closing) = read_dollar_tag(&mut chars, &mut current) {
                        if closing == *tag {
                            state = Scan::Normal;
                        }
                    }
                }
            }
        }
    }

    flush(&mut statements, &mut current, has_code);
    statements
}

/// Having consumed a `$`, read the rest of a `$tag$` delimiter if present.
/// `$1`-style placeholders are not delimiters.
fn read_dollar_tag(chars: &mut Peekable<Chars<'_>>, current: &mut String) -> Option<String> {
    let mut tag = String::from("$");
    loop {
        match chars.peek() {
            Some(&'$') => {
                chars.next();
                current.push('$');
                tag.push('$');
                return Some(tag);
            }
            Some(&c) if c.is_alphanumeric() || c == '_' => {
                if tag.len() == 1 && c.is_ascii_digit() {
                    return None;
                }
                chars.next();
                current.push(c);
                tag.push(c);
            }
            _ => return None,
        }
    }
}

fn flush(statements: &mut Vec<String>, current: &mut String, has_code: bool) {
    let statement = current.trim();
    if has_code && !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Turn a free-form name into a file-name slug.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// Skeleton for a new unit file.
pub fn render_template(description: &str) -> String {
    format!(
        "-- description: {}\n-- @up\n\n-- @down\n",
        description.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const OUTBOX_USERS: &str =
        include_str!("../../../migrations/20260202193346_create_outbox_events_and_users.sql");

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_statements("SELECT 1; SELECT 2; SELECT 3;");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn test_split_last_statement_without_semicolon() {
        let stmts = split_statements("CREATE TABLE a (id INT);\nDROP TABLE a");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "DROP TABLE a");
    }

    #[test]
    fn test_split_with_dollar_quoted_function() {
        let sql = r#"
CREATE FUNCTION test() RETURNS void AS $$
BEGIN
    SELECT 1;
    SELECT 2;
END;
$$ LANGUAGE plpgsql;

SELECT 3;
"#;
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("CREATE FUNCTION"));
        assert!(stmts[0].contains("$$ LANGUAGE plpgsql"));
        assert_eq!(stmts[1], "SELECT 3");
    }

    #[test]
    fn test_split_with_named_dollar_tag() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; $body$ LANGUAGE sql; SELECT 2;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("LANGUAGE sql"));
    }

    #[test]
    fn test_split_ignores_semicolons_in_strings_and_comments() {
        let sql = "INSERT INTO t VALUES ('a;b', 'it''s;');\n-- note; not a split\nSELECT \"odd;name\" FROM t; /* x; y */ SELECT 2;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], "INSERT INTO t VALUES ('a;b', 'it''s;')");
        assert_eq!(stmts[1], "SELECT \"odd;name\" FROM t");
        assert_eq!(stmts[2], "SELECT 2");
    }

    #[test]
    fn test_split_drops_comment_only_fragments() {
        let sql = "-- leading comment\n\n-- another\n;\n-- trailing";
        assert!(split_statements(sql).is_empty());
    }

    #[test]
    fn test_split_trims_leading_comments() {
        let stmts = split_statements("-- create things\nCREATE TABLE a (id INT);");
        assert_eq!(stmts, vec!["CREATE TABLE a (id INT)"]);
    }

    #[test]
    fn test_split_keeps_positional_placeholders() {
        let stmts = split_statements("UPDATE t SET a = $1 WHERE b = $2; SELECT 1");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "UPDATE t SET a = $1 WHERE b = $2");
    }

    #[test]
    fn test_from_sql_with_markers() {
        let sql = "-- description: Add posts\n-- @up\nCREATE TABLE posts (id INT);\nCREATE INDEX idx_posts ON posts (id);\n-- @down\nDROP TABLE posts;\n";
        let unit = MigrationUnit::from_sql("0002", "fallback", sql).unwrap();
        assert_eq!(unit.identifier(), "0002");
        assert_eq!(unit.description(), "Add posts");
        assert_eq!(unit.up().len(), 2);
        assert_eq!(unit.down(), &["DROP TABLE posts".to_string()]);
        assert!(unit.has_down());
    }

    #[test]
    fn test_from_sql_without_markers_is_irreversible() {
        let unit = MigrationUnit::from_sql("0001", "first", "SELECT 1;").unwrap();
        assert_eq!(unit.description(), "first");
        assert_eq!(unit.up().len(), 1);
        assert!(!unit.has_down());
    }

    #[test]
    fn test_from_sql_down_without_up_marker() {
        let unit = MigrationUnit::from_sql("0001", "", "CREATE TABLE a (id INT);\n-- @down\nDROP TABLE a;").unwrap();
        assert_eq!(unit.up(), &["CREATE TABLE a (id INT)".to_string()]);
        assert_eq!(unit.down(), &["DROP TABLE a".to_string()]);
    }

    #[test]
    fn test_from_sql_rejects_misplaced_markers() {
        let err = MigrationUnit::from_sql("0001", "", "-- @down\nDROP TABLE a;\n-- @up\nCREATE TABLE a (id INT);")
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidMigration(_)));

        let err = MigrationUnit::from_sql("0001", "", "SELECT 1;\n-- @down\nSELECT 2;\n-- @down\nSELECT 3;")
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidMigration(_)));
    }

    #[test]
    fn test_from_sql_rejects_empty_up() {
        let err = MigrationUnit::from_sql("0001", "", "-- @up\n-- nothing\n-- @down\nDROP TABLE a;")
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidMigration(_)));
    }

    #[test]
    fn test_invalid_identifier() {
        assert!(MigrationUnit::new("", "x", vec!["SELECT 1".into()], vec![]).is_err());
        assert!(MigrationUnit::new("v1.2", "x", vec!["SELECT 1".into()], vec![]).is_err());
        assert!(MigrationUnit::new("Version20260202193346", "x", vec!["SELECT 1".into()], vec![]).is_ok());
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = MigrationUnit::new("1", "a", vec!["CREATE TABLE users (id UUID)".into()], vec![]).unwrap();
        let b = MigrationUnit::new("1", "renamed", vec!["CREATE TABLE users (id UUID)".into()], vec![]).unwrap();
        let c = MigrationUnit::new("1", "a", vec!["CREATE TABLE posts (id UUID)".into()], vec![]).unwrap();
        let d = MigrationUnit::new(
            "1",
            "a",
            vec!["CREATE TABLE users (id UUID)".into()],
            vec!["DROP TABLE users".into()],
        )
        .unwrap();

        assert_eq!(a.checksum().len(), 64);
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert_ne!(a.checksum(), d.checksum());
    }

    #[test]
    fn test_from_file_derives_identifier_and_description() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("20260101120000_add_posts_table.sql");
        fs::write(&path, "CREATE TABLE posts (id INT);").unwrap();

        let unit = MigrationUnit::from_file(&path).unwrap();
        assert_eq!(unit.identifier(), "20260101120000");
        assert_eq!(unit.description(), "add posts table");
        assert_eq!(unit.source(), Some(path.as_path()));
    }

    #[test]
    fn test_outbox_and_users_unit() {
        let unit = MigrationUnit::from_sql("20260202193346", "", OUTBOX_USERS).unwrap();
        assert_eq!(unit.up().len(), 9);
        assert_eq!(unit.down().len(), 2);
        assert!(unit.up()[0].starts_with("CREATE TABLE outbox_events"));
        assert!(unit.up()[4].starts_with("CREATE TABLE users"));
        assert_eq!(unit.down()[0], "DROP TABLE outbox_events");
        assert_eq!(unit.down()[1], "DROP TABLE users");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Create Users"), "create_users");
        assert_eq!(slugify("  add-index: users.email "), "add_index_users_email");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_rendered_template_parses_after_filling_in() {
        let template = render_template("Add comments");
        let filled = template.replace("-- @up\n", "-- @up\nCREATE TABLE comments (id INT);\n");
        let unit = MigrationUnit::from_sql("1", "", &filled).unwrap();
        assert_eq!(unit.description(), "Add comments");
        assert_eq!(unit.up().len(), 1);
        assert!(!unit.has_down());
    }
}
