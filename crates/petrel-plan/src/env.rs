use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::ResultExt;
use petrel_db::{blobs, Index, Store, Tenant, TenantKey, UploadFs};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::filter::{compile, Decision};
use crate::handle::FilterHandle;
use crate::{syntax, Error, Expr};

struct SavedIndex {
    db: String,
    table: String,
    index: Arc<Index>,
}

struct SavedList {
    db: String,
    list: Vec<String>,
}

/// The per-query planning environment.
///
/// Owns the query's index/list memoisation and the rolling fingerprint
/// of everything it resolved. One `Env` serves exactly one query; it is
/// never shared across queries and needs no locking.
pub struct Env {
    root: Arc<dyn Store>,
    /// Fixed database name, when the query runs inside one database.
    db: Option<String>,
    worker: Uuid,
    key: TenantKey,
    recent: Vec<SavedIndex>,
    lists: Vec<SavedList>,
    hash: Sha256,
    modtime: Option<DateTime<Utc>>,
}

impl Env {
    pub fn new(tenant: &dyn Tenant, db: Option<&str>) -> error_stack::Result<Self, Error> {
        let root = tenant.root().change_context(Error::Storage)?;
        Ok(Self {
            root,
            db: db.map(|d| d.to_owned()),
            worker: tenant.id(),
            key: tenant.key().clone(),
            recent: Vec::new(),
            lists: Vec::new(),
            hash: Sha256::new(),
            modtime: None,
        })
    }

    pub fn key(&self) -> &TenantKey {
        &self.key
    }

    pub fn worker(&self) -> Uuid {
        self.worker
    }

    /// The upload side of the tenant's store, when it has one.
    pub fn uploader(&self) -> Option<&dyn UploadFs> {
        self.root.uploader()
    }

    /// The fingerprint of every index resolved so far: a 256-bit digest
    /// plus the newest index creation time.
    ///
    /// Stable only once no further resolutions can occur for the query;
    /// an upstream result cache keys on it.
    pub fn cache_fingerprint(&self) -> (Vec<u8>, Option<DateTime<Utc>>) {
        (self.hash.clone().finalize().to_vec(), self.modtime)
    }

    /// Split a table expression into `(database, table)`.
    ///
    /// With a fixed database the expression must be a bare identifier;
    /// otherwise it must be exactly `db.table`.
    fn resolve(&self, e: &Expr) -> error_stack::Result<(String, String), Error> {
        let Expr::Path(path) = e else {
            return Err(syntax(format!("unexpected table expression \"{e}\"")));
        };
        match &self.db {
            Some(db) => {
                if !path.rest.is_empty() {
                    return Err(syntax(format!(
                        "trailing path expression \"{}\" in table not supported",
                        path.rest.join(".")
                    )));
                }
                Ok((db.clone(), path.first.clone()))
            }
            None => match path.rest.as_slice() {
                [table] => Ok((path.first.clone(), table.clone())),
                [] => Err(syntax(format!("no database+table reference in \"{path}\""))),
                [_, trailing @ ..] => Err(syntax(format!(
                    "trailing path expression \"{}\" in table not supported",
                    trailing.join(".")
                ))),
            },
        }
    }

    /// Resolve a table expression to its index.
    ///
    /// A query referencing the same table more than once (CTEs, nested
    /// SELECTs) loads the index a single time; later calls return the
    /// cached object.
    pub fn index(&mut self, e: &Expr) -> error_stack::Result<Arc<Index>, Error> {
        let (db, table) = self.resolve(e)?;
        for saved in &self.recent {
            if saved.db == db && saved.table == table {
                return Ok(saved.index.clone());
            }
        }
        let index = self
            .root
            .open_partial_index(&db, &table, &self.key)
            .change_context(Error::Storage)?;
        let index = Arc::new(index);
        debug!(%db, %table, created = %index.created, "index resolved");
        if self.modtime.map_or(true, |m| m < index.created) {
            self.modtime = Some(index.created);
        }
        // The index name plus its creation time is unique per input, so
        // it serves as the fingerprint contribution.
        self.hash.update(format!("{db}/{table}").as_bytes());
        self.hash.update(index.created.to_rfc3339().as_bytes());
        self.recent.push(SavedIndex {
            db,
            table,
            index: index.clone(),
        });
        Ok(index)
    }

    /// Resolve a table and materialise its surviving blobs under an
    /// optional `WHERE` predicate.
    pub fn stat(
        &mut self,
        e: &Expr,
        where_: Option<&Expr>,
    ) -> error_stack::Result<FilterHandle, Error> {
        let index = self.index(e)?;
        let compiled = where_.and_then(compile);
        let blobs = match &compiled {
            None => blobs(&index, None),
            Some(f) => blobs(
                &index,
                Some(&|sparse, block| f.matches(sparse, block) != Decision::Never),
            ),
        };
        Ok(FilterHandle {
            filter: where_.cloned(),
            compiled,
            blobs,
        })
    }

    /// List the tables of a database, memoised per query. An empty name
    /// means the env's fixed database.
    pub fn list_tables(&mut self, db: &str) -> error_stack::Result<Vec<String>, Error> {
        let db = if db.is_empty() {
            self.db.clone().unwrap_or_default()
        } else {
            db.to_owned()
        };
        for saved in &self.lists {
            if saved.db == db {
                return Ok(saved.list.clone());
            }
        }
        let list = self
            .root
            .list_tables(&db)
            .change_context(Error::Storage)?;
        self.lists.push(SavedList {
            db,
            list: list.clone(),
        });
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CmpOp;
    use chrono::TimeZone;
    use petrel_blockfmt::{BlockDesc, RangeSet, SparseIndex, Trailer};
    use petrel_db::{DirStore, ObjectDesc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTenant {
        store: Arc<CountingStore>,
        key: TenantKey,
        id: Uuid,
    }

    impl Tenant for TestTenant {
        fn id(&self) -> Uuid {
            self.id
        }

        fn key(&self) -> &TenantKey {
            &self.key
        }

        fn root(&self) -> error_stack::Result<Arc<dyn Store>, petrel_db::Error> {
            Ok(self.store.clone())
        }
    }

    /// Wraps a DirStore and counts index loads.
    struct CountingStore {
        inner: DirStore,
        index_loads: AtomicUsize,
    }

    impl petrel_db::ObjectSource for CountingStore {
        fn open_object(
            &self,
            path: &str,
            offset: u64,
            len: u64,
        ) -> std::io::Result<Box<dyn std::io::Read + Send>> {
            self.inner.open_object(path, offset, len)
        }
    }

    impl Store for CountingStore {
        fn open_partial_index(
            &self,
            db: &str,
            table: &str,
            key: &TenantKey,
        ) -> error_stack::Result<Index, petrel_db::Error> {
            self.index_loads.fetch_add(1, Ordering::SeqCst);
            self.inner.open_partial_index(db, table, key)
        }

        fn list_tables(&self, db: &str) -> error_stack::Result<Vec<String>, petrel_db::Error> {
            self.inner.list_tables(db)
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn table_index(db: &str, table: &str, created: DateTime<Utc>) -> Index {
        let mut sparse = SparseIndex::default();
        let mut r = RangeSet::new();
        r.note(&vec!["ts".to_owned()], ts(100));
        r.note(&vec!["ts".to_owned()], ts(200));
        sparse.push_block(&r);
        Index {
            db: db.to_owned(),
            table: table.to_owned(),
            created,
            contents: vec![ObjectDesc {
                path: format!("db/{db}/{table}/packed-0"),
                etag: format!("etag-{db}-{table}"),
                size: 4096,
                trailer: Some(Trailer {
                    version: 1,
                    algo: "zstd".to_owned(),
                    align: 1 << 10,
                    offset: 4000,
                    blocks: vec![BlockDesc {
                        offset: 0,
                        chunks: 4,
                    }],
                    sparse,
                    created,
                }),
            }],
        }
    }

    fn tenant(dir: &std::path::Path) -> TestTenant {
        let key = TenantKey::new([5u8; 32]);
        let store = DirStore::new(dir);
        store
            .write_index(&table_index("metrics", "cpu", ts(1_000_000)), &key)
            .unwrap();
        store
            .write_index(&table_index("metrics", "api", ts(2_000_000)), &key)
            .unwrap();
        TestTenant {
            store: Arc::new(CountingStore {
                inner: store,
                index_loads: AtomicUsize::new(0),
            }),
            key,
            id: Uuid::from_u128(42),
        }
    }

    #[test]
    fn test_double_reference_loads_index_once() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());
        let mut env = Env::new(&tenant, None).unwrap();

        let table = Expr::path(&["metrics", "cpu"]);
        let first = env.index(&table).unwrap();
        let (fp1, mod1) = env.cache_fingerprint();
        let second = env.index(&table).unwrap();
        let (fp2, mod2) = env.cache_fingerprint();

        assert!(Arc::ptr_eq(&first, &second), "second call must be cached");
        assert_eq!(tenant.store.index_loads.load(Ordering::SeqCst), 1);
        // The fingerprint advanced exactly once: re-resolution does not
        // touch the hash.
        assert_eq!(fp1, fp2);
        assert_eq!(mod1, mod2);
        assert_eq!(mod1, Some(ts(1_000_000)));
    }

    #[test]
    fn test_fingerprint_advances_per_distinct_table() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());
        let mut env = Env::new(&tenant, None).unwrap();

        env.index(&Expr::path(&["metrics", "cpu"])).unwrap();
        let (fp1, _) = env.cache_fingerprint();
        env.index(&Expr::path(&["metrics", "api"])).unwrap();
        let (fp2, modtime) = env.cache_fingerprint();
        assert_ne!(fp1, fp2);
        assert_eq!(modtime, Some(ts(2_000_000)));
    }

    #[test]
    fn test_reference_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());

        // no fixed database: db.table required
        let mut env = Env::new(&tenant, None).unwrap();
        let err = env.index(&Expr::path(&["cpu"])).unwrap_err();
        assert!(matches!(err.current_context(), Error::Syntax(_)));
        let err = env
            .index(&Expr::path(&["metrics", "cpu", "extra"]))
            .unwrap_err();
        assert!(
            err.to_string().contains("extra"),
            "syntax error cites the offending fragment: {err}"
        );
        let err = env.index(&Expr::Int(3)).unwrap_err();
        assert!(matches!(err.current_context(), Error::Syntax(_)));

        // fixed database: bare identifier required
        let mut env = Env::new(&tenant, Some("metrics")).unwrap();
        env.index(&Expr::path(&["cpu"])).unwrap();
        assert!(env.index(&Expr::path(&["metrics", "cpu"])).is_err());
    }

    #[test]
    fn test_missing_index_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());
        let mut env = Env::new(&tenant, None).unwrap();
        let err = env.index(&Expr::path(&["metrics", "nope"])).unwrap_err();
        assert!(matches!(err.current_context(), Error::Storage));
    }

    #[test]
    fn test_stat_filter_eliminates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());
        let mut env = Env::new(&tenant, None).unwrap();

        // the single block spans [100, 200]; ts < 50 excludes it
        let where_ = Expr::compare(
            CmpOp::Lt,
            Expr::path(&["ts"]),
            Expr::Timestamp(ts(50)),
        );
        let handle = env
            .stat(&Expr::path(&["metrics", "cpu"]), Some(&where_))
            .unwrap();
        assert!(handle.blobs.is_empty());
        assert!(handle.compiled.is_some());
        assert_eq!(handle.filter, Some(where_));
    }

    #[test]
    fn test_stat_keeps_matching_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());
        let mut env = Env::new(&tenant, None).unwrap();
        let where_ = Expr::compare(
            CmpOp::Lt,
            Expr::path(&["ts"]),
            Expr::Timestamp(ts(150)),
        );
        let handle = env
            .stat(&Expr::path(&["metrics", "cpu"]), Some(&where_))
            .unwrap();
        assert_eq!(handle.blobs.len(), 1);
    }

    #[test]
    fn test_list_tables_memoised_and_default_db() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = tenant(dir.path());
        let mut env = Env::new(&tenant, Some("metrics")).unwrap();
        assert_eq!(env.list_tables("").unwrap(), vec!["api", "cpu"]);
        // remove the backing dir: the memoised answer must survive
        std::fs::remove_dir_all(dir.path().join("db")).unwrap();
        assert_eq!(env.list_tables("metrics").unwrap(), vec!["api", "cpu"]);
    }
}
