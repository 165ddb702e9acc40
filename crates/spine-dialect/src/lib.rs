//! SQL dialect abstraction
//!
//! Different databases disagree on placeholder syntax (`?`, `$1`, `%s`, `:1`),
//! timestamp functions (`datetime('now')`, `NOW()`, `SYSTIMESTAMP`), and
//! upsert syntax (`INSERT OR REPLACE`, `ON CONFLICT`, `MERGE`). A [`Dialect`]
//! generates the correct fragment for each backend so repository code never
//! branches on which database it is talking to.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Time unit accepted by [`Dialect::interval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn as_sql_word(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }
}

/// Backend-specific SQL generation.
///
/// Implementations are stateless; `get_dialect` hands out a shared singleton
/// per name so callers never pay for repeated allocation.
pub trait Dialect: Send + Sync {
    /// Short identifier, e.g. `"sqlite"`, `"postgresql"`.
    fn name(&self) -> &'static str;

    /// Positional placeholder for the `i`-th bound parameter (0-based).
    fn placeholder(&self, i: usize) -> String;

    /// Comma-joined placeholders for `n` parameters, e.g. `"?, ?, ?"` or
    /// `"$1, $2, $3"`.
    fn placeholders(&self, n: usize) -> String {
        (0..n)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// SQL expression for the current UTC timestamp.
    fn now(&self) -> &'static str;

    /// SQL expression for `now() + n * unit` (n may be negative, e.g. -24 hours).
    fn interval(&self, n: i64, unit: IntervalUnit) -> String;

    /// A single-statement `INSERT ... ON CONFLICT DO NOTHING` equivalent.
    fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String;

    /// A single-statement portable upsert keyed by `key_cols`.
    ///
    /// Non-key columns are overwritten with the incoming values on conflict.
    fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String;
}

fn columns_and_placeholders(cols: &[&str], d: &dyn Dialect) -> (String, String) {
    (cols.join(", "), d.placeholders(cols.len()))
}

/// SQLite: `?` placeholders, `datetime('now')`, `INSERT OR REPLACE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _i: usize) -> String {
        "?".to_string()
    }

    fn now(&self) -> &'static str {
        "datetime('now')"
    }

    fn interval(&self, n: i64, unit: IntervalUnit) -> String {
        format!("datetime('now', '{:+} {}')", n, unit.as_sql_word())
    }

    fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String {
        let (names, ph) = columns_and_placeholders(cols, self);
        format!("INSERT OR IGNORE INTO {table} ({names}) VALUES ({ph})")
    }

    fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
        let (names, ph) = columns_and_placeholders(cols, self);
        let updates = non_key_assignments(cols, key_cols, "excluded.");
        let keys = key_cols.join(", ");
        format!(
            "INSERT INTO {table} ({names}) VALUES ({ph})\nON CONFLICT ({keys}) DO UPDATE SET {updates}"
        )
    }
}

/// PostgreSQL: `$n` placeholders, `NOW()`, `ON CONFLICT ... DO UPDATE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, i: usize) -> String {
        format!("${}", i + 1)
    }

    fn now(&self) -> &'static str {
        "NOW()"
    }

    fn interval(&self, n: i64, unit: IntervalUnit) -> String {
        format!("NOW() + INTERVAL '{} {}'", n, unit.as_sql_word())
    }

    fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String {
        let (names, ph) = columns_and_placeholders(cols, self);
        format!("INSERT INTO {table} ({names}) VALUES ({ph}) ON CONFLICT DO NOTHING")
    }

    fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
        let (names, ph) = columns_and_placeholders(cols, self);
        let updates = non_key_assignments(cols, key_cols, "EXCLUDED.");
        let keys = key_cols.join(", ");
        format!(
            "INSERT INTO {table} ({names}) VALUES ({ph})\nON CONFLICT ({keys}) DO UPDATE SET {updates}"
        )
    }
}

/// MySQL: `%s`-style placeholders (driver-bound), `NOW()`, `ON DUPLICATE KEY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn placeholder(&self, _i: usize) -> String {
        "%s".to_string()
    }

    fn now(&self) -> &'static str {
        "NOW()"
    }

    fn interval(&self, n: i64, unit: IntervalUnit) -> String {
        let op = if n < 0 { "-" } else { "+" };
        format!("NOW() {op} INTERVAL {} {}", n.abs(), unit.as_sql_word())
    }

    fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String {
        let (names, ph) = columns_and_placeholders(cols, self);
        format!("INSERT IGNORE INTO {table} ({names}) VALUES ({ph})")
    }

    fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
        let (names, ph) = columns_and_placeholders(cols, self);
        let updates = non_key_assignments(cols, key_cols, "VALUES(");
        let updates = mysql_values_wrap(&updates);
        format!(
            "INSERT INTO {table} ({names}) VALUES ({ph})\nON DUPLICATE KEY UPDATE {updates}"
        )
    }
}

fn mysql_values_wrap(assignments: &str) -> String {
    // non_key_assignments produced "col = VALUES(col" fragments; close the paren.
    assignments
        .split(", ")
        .map(|a| format!("{a})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// DB2: `?` placeholders, `CURRENT TIMESTAMP`, `MERGE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Db2Dialect;

impl Dialect for Db2Dialect {
    fn name(&self) -> &'static str {
        "db2"
    }

    fn placeholder(&self, _i: usize) -> String {
        "?".to_string()
    }

    fn now(&self) -> &'static str {
        "CURRENT TIMESTAMP"
    }

    fn interval(&self, n: i64, unit: IntervalUnit) -> String {
        let op = if n < 0 { "-" } else { "+" };
        format!(
            "CURRENT TIMESTAMP {op} {} {}",
            n.abs(),
            unit.as_sql_word()
        )
    }

    fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String {
        merge_upsert(table, cols, &[], self)
    }

    fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
        merge_upsert(table, cols, key_cols, self)
    }
}

/// Oracle: `:1`-style positional binds, `SYSTIMESTAMP`, `MERGE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn placeholder(&self, i: usize) -> String {
        format!(":{}", i + 1)
    }

    fn now(&self) -> &'static str {
        "SYSTIMESTAMP"
    }

    fn interval(&self, n: i64, unit: IntervalUnit) -> String {
        let op = if n < 0 { "-" } else { "+" };
        format!(
            "SYSTIMESTAMP {op} INTERVAL '{}' {}",
            n.abs(),
            unit.as_sql_word().to_uppercase()
        )
    }

    fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String {
        merge_upsert(table, cols, &[], self)
    }

    fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
        merge_upsert(table, cols, key_cols, self)
    }
}

/// Build `col = excluded_prefix.col, ...` for non-key columns.
fn non_key_assignments(cols: &[&str], key_cols: &[&str], excluded_prefix: &str) -> String {
    cols.iter()
        .filter(|c| !key_cols.contains(c))
        .map(|c| format!("{c} = {excluded_prefix}{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shared `MERGE` statement shape for DB2/Oracle. When `key_cols` is empty
/// this degrades to an insert-only merge (used for `insert_or_ignore`).
fn merge_upsert(table: &str, cols: &[&str], key_cols: &[&str], d: &dyn Dialect) -> String {
    let ph = d.placeholders(cols.len());
    let source_cols = cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} AS {c}", d.placeholder(i)))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_cols = cols.join(", ");
    let insert_vals = cols
        .iter()
        .map(|c| format!("src.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    if key_cols.is_empty() {
        return format!(
            "MERGE INTO {table} tgt USING (SELECT {source_cols} FROM DUAL) src ON (1 = 0)\nWHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})"
        );
    }

    let on_clause = key_cols
        .iter()
        .map(|k| format!("tgt.{k} = src.{k}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let update_set = non_key_assignments(cols, key_cols, "src.");

    let _ = ph; // placeholders are embedded per-column above
    format!(
        "MERGE INTO {table} tgt USING (SELECT {source_cols} FROM DUAL) src ON ({on_clause})\nWHEN MATCHED THEN UPDATE SET {update_set}\nWHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})"
    )
}

fn registry() -> &'static Mutex<HashMap<String, &'static dyn Dialect>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, &'static dyn Dialect>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<String, &'static dyn Dialect> = HashMap::new();
        m.insert("sqlite".to_string(), &SqliteDialect);
        m.insert("postgresql".to_string(), &PostgresDialect);
        m.insert("postgres".to_string(), &PostgresDialect);
        m.insert("mysql".to_string(), &MySqlDialect);
        m.insert("db2".to_string(), &Db2Dialect);
        m.insert("oracle".to_string(), &OracleDialect);
        Mutex::new(m)
    })
}

/// Error returned by [`get_dialect`] for an unregistered name.
#[derive(Debug, thiserror::Error)]
#[error("unknown dialect: {0}")]
pub struct UnknownDialect(pub String);

/// Resolve a dialect singleton by name. Built-ins are `sqlite`, `postgresql`
/// (or `postgres`), `mysql`, `db2`, `oracle`. Additional names can be added
/// with [`register_dialect`].
pub fn get_dialect(name: &str) -> Result<&'static dyn Dialect, UnknownDialect> {
    registry()
        .lock()
        .get(name)
        .copied()
        .ok_or_else(|| UnknownDialect(name.to_string()))
}

/// Register a `'static` dialect implementation under `name`, overwriting any
/// prior registration. Typically called once at process startup for a
/// database variant not covered by the built-ins (e.g. a Postgres-compatible
/// fork).
pub fn register_dialect(name: &str, dialect: &'static dyn Dialect) {
    registry().lock().insert(name.to_string(), dialect);
}

/// Infer a dialect from a `SPINE_DATABASE_URL`-style connection string scheme.
pub fn dialect_from_url(url: &str) -> Result<&'static dyn Dialect, UnknownDialect> {
    let scheme = url.split("://").next().unwrap_or(url);
    let scheme = scheme.split('+').next().unwrap_or(scheme);
    get_dialect(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_placeholders() {
        let d = SqliteDialect;
        assert_eq!(d.placeholder(0), "?");
        assert_eq!(d.placeholders(3), "?, ?, ?");
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let d = PostgresDialect;
        assert_eq!(d.placeholders(3), "$1, $2, $3");
    }

    #[test]
    fn mysql_uses_percent_s() {
        let d = MySqlDialect;
        assert_eq!(d.placeholders(2), "%s, %s");
    }

    #[test]
    fn oracle_placeholders_are_colon_numbered() {
        let d = OracleDialect;
        assert_eq!(d.placeholder(0), ":1");
        assert_eq!(d.placeholder(2), ":3");
    }

    #[test]
    fn interval_sign_is_preserved() {
        assert_eq!(
            SqliteDialect.interval(-24, IntervalUnit::Hours),
            "datetime('now', '-24 hours')"
        );
        assert_eq!(
            PostgresDialect.interval(-24, IntervalUnit::Hours),
            "NOW() + INTERVAL '-24 hours'"
        );
        assert_eq!(
            MySqlDialect.interval(-24, IntervalUnit::Hours),
            "NOW() - INTERVAL 24 hours"
        );
    }

    #[test]
    fn upsert_excludes_key_columns_from_update() {
        let d = PostgresDialect;
        let sql = d.upsert("core_schedules", &["id", "name", "enabled"], &["id"]);
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET"));
        assert!(sql.contains("name = EXCLUDED.name"));
        assert!(sql.contains("enabled = EXCLUDED.enabled"));
        assert!(!sql.contains("id = EXCLUDED.id"));
    }

    #[test]
    fn mysql_upsert_uses_values_function() {
        let sql = MySqlDialect.upsert("t", &["id", "v"], &["id"]);
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
        assert!(sql.contains("v = VALUES(v)"));
    }

    #[test]
    fn db2_and_oracle_use_merge() {
        let sql = Db2Dialect.upsert("t", &["id", "v"], &["id"]);
        assert!(sql.starts_with("MERGE INTO t"));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT"));
    }

    #[test]
    fn get_dialect_returns_singleton_by_name() {
        let a = get_dialect("sqlite").unwrap();
        let b = get_dialect("sqlite").unwrap();
        assert_eq!(a.name(), b.name());
        assert!(get_dialect("nonexistent").is_err());
    }

    #[test]
    fn dialect_from_url_reads_scheme() {
        assert_eq!(dialect_from_url("sqlite:///data/spine.db").unwrap().name(), "sqlite");
        assert_eq!(
            dialect_from_url("postgresql+asyncpg://localhost/spine")
                .unwrap()
                .name(),
            "postgresql"
        );
    }

    #[test]
    fn register_dialect_adds_custom_variant() {
        #[derive(Debug, Default, Clone, Copy)]
        struct CockroachDialect;
        impl Dialect for CockroachDialect {
            fn name(&self) -> &'static str {
                "cockroach"
            }
            fn placeholder(&self, i: usize) -> String {
                PostgresDialect.placeholder(i)
            }
            fn now(&self) -> &'static str {
                PostgresDialect.now()
            }
            fn interval(&self, n: i64, unit: IntervalUnit) -> String {
                PostgresDialect.interval(n, unit)
            }
            fn insert_or_ignore(&self, table: &str, cols: &[&str]) -> String {
                PostgresDialect.insert_or_ignore(table, cols)
            }
            fn upsert(&self, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
                PostgresDialect.upsert(table, cols, key_cols)
            }
        }
        static CRDB: CockroachDialect = CockroachDialect;
        register_dialect("cockroach", &CRDB);
        assert_eq!(get_dialect("cockroach").unwrap().name(), "cockroach");
    }
}
