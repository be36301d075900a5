//! Query layer over a single downloaded catalog file.
//!
//! A catalog is a self-contained SQLite store describing one contiguous
//! subtree: directory entries keyed by path hash, plus references to
//! nested catalogs attached below it. Only the read-only variant exists on
//! the client; all statements are prepared once and cached.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, instrument};

use stratofs_castore::ObjectDigest;

use crate::dirent::{CatalogFlags, DirectoryEntry, EntryKind};
use crate::path_hash::PathHash;
use crate::symlinks::{self, SymlinkEnv};

pub mod manager;

const LOOKUP_FIELDS: &str = "hash, inode, size, mode, mtime, flags, name, symlink, rowid";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("corrupt catalog: {0}")]
    Corrupt(String),
}

/// Process-wide inputs of entry construction, passed explicitly into every
/// catalog instead of living in global state: the environment snapshot for
/// symlink expansion and the owner the whole tree is presented as.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    pub symlink_env: SymlinkEnv,
    pub uid: u32,
    pub gid: u32,
}

/// One open catalog file.
pub struct Catalog {
    conn: Mutex<Connection>,
    context: Arc<QueryContext>,
    schema_version: f64,
    revision: u64,
    root_prefix: String,
    row_count: u64,
}

impl Catalog {
    #[instrument(skip(context), err)]
    pub fn open(path: &Path, context: Arc<QueryContext>) -> Result<Self, CatalogError> {
        debug!("opening catalog file");
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let schema_version = match property(&conn, "schema")? {
            Some(value) => value
                .parse::<f64>()
                .map_err(|_| CatalogError::Corrupt(format!("bad schema version {:?}", value)))?,
            // catalogs predating the schema property
            None => 1.0,
        };
        let revision = match property(&conn, "revision")? {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| CatalogError::Corrupt(format!("bad revision {:?}", value)))?,
            None => 0,
        };
        let root_prefix = property(&conn, "root_prefix")?.unwrap_or_default();
        let row_count: i64 = conn.query_row("SELECT count(*) FROM catalog;", [], |row| row.get(0))?;

        Ok(Self {
            conn: Mutex::new(conn),
            context,
            schema_version,
            revision,
            root_prefix,
            row_count: row_count as u64,
        })
    }

    pub fn schema_version(&self) -> f64 {
        self.schema_version
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn root_prefix(&self) -> &str {
        &self.root_prefix
    }

    /// Number of entries; fixed for the lifetime of a (read-only) catalog.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Entry with the given path hash, along with its row id.
    pub fn lookup_path_hash(
        &self,
        hash: &PathHash,
    ) -> Result<Option<(u64, DirectoryEntry)>, CatalogError> {
        let (h1, h2) = hash.to_columns();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM catalog WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);",
            LOOKUP_FIELDS
        ))?;
        stmt.query_row(params![h1, h2], |row| Ok(self.entry_from_row(row)))
            .optional()?
            .transpose()
    }

    /// Entry stored at the given row id. Used to answer inode queries
    /// after the metadata caches dropped the entry.
    pub fn lookup_rowid(&self, rowid: u64) -> Result<Option<(u64, DirectoryEntry)>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM catalog WHERE rowid = :rowid;",
            LOOKUP_FIELDS
        ))?;
        stmt.query_row(params![rowid as i64], |row| Ok(self.entry_from_row(row)))
            .optional()?
            .transpose()
    }

    /// Some entry of the given hardlink group. Group members share their
    /// stat data, so any row answers an inode query for the group.
    pub fn lookup_hardlink_group(
        &self,
        group: u32,
    ) -> Result<Option<(u64, DirectoryEntry)>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM catalog WHERE (inode >> 32) = :grp LIMIT 1;",
            LOOKUP_FIELDS
        ))?;
        stmt.query_row(params![group as i64], |row| Ok(self.entry_from_row(row)))
            .optional()?
            .transpose()
    }

    /// All children of the directory with the given path hash, in on-disk
    /// order.
    pub fn listing(&self, parent: &PathHash) -> Result<Vec<(u64, DirectoryEntry)>, CatalogError> {
        let (h1, h2) = parent.to_columns();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM catalog WHERE (parent_1 = :p_1) AND (parent_2 = :p_2);",
            LOOKUP_FIELDS
        ))?;
        let rows = stmt.query_map(params![h1, h2], |row| Ok(self.entry_from_row(row)))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }

    /// Digest of the nested catalog mounted at `path`, if any.
    pub fn lookup_nested(&self, path: &str) -> Result<Option<ObjectDigest>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT sha1 FROM nested_catalogs WHERE path = :path;")?;
        let hex: Option<String> = stmt
            .query_row(params![path], |row| row.get(0))
            .optional()?;
        match hex {
            None => Ok(None),
            Some(hex) if hex.is_empty() => Ok(Some(ObjectDigest::NULL)),
            Some(hex) => Ok(Some(ObjectDigest::from_hex(&hex).map_err(|e| {
                CatalogError::Corrupt(format!("bad nested catalog digest: {}", e))
            })?)),
        }
    }

    /// All nested catalog references of this catalog.
    pub fn nested_listing(&self) -> Result<Vec<(String, ObjectDigest)>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT path, sha1 FROM nested_catalogs;")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut refs = Vec::new();
        for row in rows {
            let (path, hex) = row?;
            let digest = if hex.is_empty() {
                ObjectDigest::NULL
            } else {
                ObjectDigest::from_hex(&hex).map_err(|e| {
                    CatalogError::Corrupt(format!("bad nested catalog digest: {}", e))
                })?
            };
            refs.push((path, digest));
        }
        Ok(refs)
    }

    /// The only place where directory entries come into existence: builds
    /// one from the typed columns of a lookup row.
    fn entry_from_row(&self, row: &Row) -> Result<(u64, DirectoryEntry), CatalogError> {
        let flag_bits: u32 = row
            .get::<_, i64>(5)
            .map_err(CatalogError::Sql)? as u32;
        let flags = CatalogFlags::from_bits_truncate(flag_bits);

        let kind = if flags.contains(CatalogFlags::DIRECTORY) {
            EntryKind::Directory
        } else if flags.contains(CatalogFlags::SYMLINK) {
            EntryKind::Symlink
        } else if flags.contains(CatalogFlags::FILE) {
            EntryKind::Regular
        } else {
            return Err(CatalogError::Corrupt(format!(
                "entry without kind flag: {:#x}",
                flag_bits
            )));
        };

        let checksum = match row
            .get::<_, Option<Vec<u8>>>(0)
            .map_err(CatalogError::Sql)?
        {
            None => ObjectDigest::NULL,
            Some(blob) if blob.is_empty() => ObjectDigest::NULL,
            Some(blob) => ObjectDigest::try_from(blob)
                .map_err(|e| CatalogError::Corrupt(format!("bad content digest: {}", e)))?,
        };

        // schema 1.x predates the hardlink encoding in the inode column
        let hardlinks = if self.schema_version < 2.0 {
            0
        } else {
            row.get::<_, i64>(1).map_err(CatalogError::Sql)? as u64
        };

        let name: String = row.get(6).map_err(CatalogError::Sql)?;
        let raw_symlink: String = row.get(7).map_err(CatalogError::Sql)?;
        let symlink_target = if kind == EntryKind::Symlink {
            symlinks::expand(&raw_symlink, &self.context.symlink_env)
        } else {
            String::new()
        };

        let rowid: i64 = row.get(8).map_err(CatalogError::Sql)?;
        let entry = DirectoryEntry {
            name,
            kind,
            mode: row.get::<_, i64>(3).map_err(CatalogError::Sql)? as u32,
            uid: self.context.uid,
            gid: self.context.gid,
            size: row.get::<_, i64>(2).map_err(CatalogError::Sql)? as u64,
            mtime: row.get(4).map_err(CatalogError::Sql)?,
            checksum,
            symlink_target,
            hardlinks,
            is_nested_root: flags.contains(CatalogFlags::NESTED_ROOT),
            is_nested_mountpoint: flags.contains(CatalogFlags::NESTED_MOUNTPOINT),
            inode: DirectoryEntry::INVALID_INODE,
        };
        Ok((rowid as u64, entry))
    }
}

fn property(conn: &Connection, key: &str) -> Result<Option<String>, CatalogError> {
    Ok(conn
        .query_row(
            "SELECT value FROM properties WHERE key = ?1;",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Catalog, QueryContext};
    use crate::dirent::{encode_hardlinks, EntryKind};
    use crate::fixtures::CatalogBuilder;
    use crate::path_hash::PathHash;
    use stratofs_castore::ObjectDigest;

    fn context() -> Arc<QueryContext> {
        Arc::new(QueryContext {
            symlink_env: [("ARCH", "x86_64")].into_iter().collect(),
            uid: 911,
            gid: 911,
        })
    }

    #[test]
    fn lookup_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");

        let mut builder = CatalogBuilder::new(&path);
        builder.set_revision(3);
        builder.add_directory("", 0o755, 1700000000);
        builder.add_directory("/software", 0o755, 1700000000);
        builder.add_file(
            "/software/foo",
            0o644,
            1700000001,
            12345,
            ObjectDigest::of(b"foo"),
        );
        builder.add_symlink("/software/current", 0o777, 1700000002, "$(ARCH)/foo");
        builder.finish();

        let catalog = Catalog::open(&path, context()).unwrap();
        assert_eq!(2.0, catalog.schema_version());
        assert_eq!(3, catalog.revision());
        assert_eq!(4, catalog.row_count());

        let (_, foo) = catalog
            .lookup_path_hash(&PathHash::of("/software/foo"))
            .unwrap()
            .expect("entry must exist");
        assert_eq!("foo", foo.name);
        assert_eq!(EntryKind::Regular, foo.kind);
        assert_eq!(12345, foo.size);
        assert_eq!(911, foo.uid);
        assert_eq!(ObjectDigest::of(b"foo"), foo.checksum);

        let (_, link) = catalog
            .lookup_path_hash(&PathHash::of("/software/current"))
            .unwrap()
            .expect("entry must exist");
        assert_eq!(EntryKind::Symlink, link.kind);
        assert_eq!("x86_64/foo", link.symlink_target);
        assert_eq!("x86_64/foo".len() as u64, link.stat_size());

        let children = catalog.listing(&PathHash::of("/software")).unwrap();
        let names: Vec<_> = children.iter().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(vec!["foo", "current"], names);

        assert!(catalog
            .lookup_path_hash(&PathHash::of("/missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn rowid_and_hardlink_group_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");

        let mut builder = CatalogBuilder::new(&path);
        builder.add_directory("", 0o755, 0);
        builder.add_hardlink(
            "/a",
            0o644,
            0,
            3,
            ObjectDigest::of(b"x"),
            encode_hardlinks(1, 2),
        );
        builder.add_hardlink(
            "/b",
            0o644,
            0,
            3,
            ObjectDigest::of(b"x"),
            encode_hardlinks(1, 2),
        );
        builder.finish();

        let catalog = Catalog::open(&path, context()).unwrap();

        let (rowid, a) = catalog
            .lookup_path_hash(&PathHash::of("/a"))
            .unwrap()
            .unwrap();
        assert_eq!(2, a.linkcount());
        assert_eq!(1, a.hardlink_group());

        let (again, _) = catalog.lookup_rowid(rowid).unwrap().unwrap();
        assert_eq!(rowid, again);

        let (_, member) = catalog.lookup_hardlink_group(1).unwrap().unwrap();
        assert_eq!(member.hardlink_group(), 1);
    }

    #[test]
    fn nested_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");

        let nested_digest = ObjectDigest::of(b"the nested catalog");
        let mut builder = CatalogBuilder::new(&path);
        builder.add_directory("", 0o755, 0);
        builder.add_nested_catalog("/atlas", &nested_digest);
        builder.finish();

        let catalog = Catalog::open(&path, context()).unwrap();
        assert_eq!(
            Some(nested_digest),
            catalog.lookup_nested("/atlas").unwrap()
        );
        assert_eq!(None, catalog.lookup_nested("/cms").unwrap());
        assert_eq!(
            vec![("/atlas".to_string(), nested_digest)],
            catalog.nested_listing().unwrap()
        );
    }
}
