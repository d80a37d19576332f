//! Schema versioning
//!
//! The store keeps the version of the application that last migrated it in a single row of
//! `app_config`. On open the running version is compared against it with semantic version
//! ordering, a newer application migrates, an equal or older one leaves the schema alone. The
//! `dev` version on either side always migrates.
use super::{ConnectionError, StepContext, SQL_SCHEMA, SQL_SCHEMA_NUMBER};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use semver::Version;
use tracing::{debug, error, info};

/// version reported by development builds
pub const DEV_VERSION: &str = "dev";

fn parse(which: &'static str, version: &str) -> Result<Version, ConnectionError> {
    Version::parse(version.trim_start_matches('v')).map_err(|source| {
        ConnectionError::InvalidVersion {
            which,
            version: version.to_owned(),
            source,
        }
    })
}

/// Decide whether a store at version `stored` has to be migrated by application version `app`
///
/// `None` stands for a store that was never migrated.
pub fn needs_migration(app: &str, stored: Option<&str>) -> Result<bool, ConnectionError> {
    let Some(stored) = stored else {
        return Ok(true);
    };

    if app == DEV_VERSION || stored == DEV_VERSION {
        return Ok(true);
    }

    let app = parse("application", app)?;
    let stored = parse("database", stored)?;

    Ok(app > stored)
}

/// Version recorded by the last migration, `None` for a file that was never migrated
///
/// A version row that can't be read fails, the store is never migrated over it.
pub fn stored_version(connection: &Connection) -> Result<Option<String>, ConnectionError> {
    let tables: u32 = connection
        .query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'app_config'",
            [],
            |row| row.get(0),
        )
        .step("look up schema version table")?;

    if tables == 0 {
        debug!("No schema version recorded yet");

        return Ok(None);
    }

    connection
        .query_row("select version from app_config where id = 1", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .step("read schema version")
}

/// Apply the schema and record `app` as the new version, all in one transaction
pub fn migrate(connection: &mut Connection, app: &str) -> Result<(), ConnectionError> {
    let tx = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .step("start migration transaction")?;

    for (counter, statement) in SQL_SCHEMA.iter().enumerate() {
        let counter = counter + 1;

        match tx.execute(statement, []) {
            Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
            Err(error) => {
                error!(error = ?error, statement = statement, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                return Err(ConnectionError::Query {
                    step: "apply schema",
                    source: error,
                });
            }
        }
    }

    tx.execute(
        "insert into app_config (id, version) values (1, ?)
         on conflict (id) do update set version = excluded.version",
        params![app],
    )
    .step("record schema version")?;
    tx.commit().step("commit migration")?;

    info!(version = app, "Migrated database schema");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{needs_migration, DEV_VERSION};
    use crate::database::ConnectionError;

    #[test]
    fn fresh_store_migrates() {
        assert!(needs_migration("1.0.0", None).unwrap());
    }

    #[test]
    fn newer_application_migrates() {
        assert!(needs_migration("1.0.0", Some("0.9.0")).unwrap());
        assert!(needs_migration("v1.2.0", Some("1.1.9")).unwrap());
    }

    #[test]
    fn same_or_older_application_does_not() {
        assert!(!needs_migration("1.0.0", Some("1.0.0")).unwrap());
        assert!(!needs_migration("0.9.0", Some("1.0.0")).unwrap());
    }

    #[test]
    fn development_always_migrates() {
        assert!(needs_migration(DEV_VERSION, Some("9.9.9")).unwrap());
        assert!(needs_migration("0.1.0", Some(DEV_VERSION)).unwrap());
        assert!(needs_migration(DEV_VERSION, Some("garbage")).unwrap());
    }

    #[test]
    fn invalid_versions_are_fatal() {
        assert!(matches!(
            needs_migration("one", Some("1.0.0")),
            Err(ConnectionError::InvalidVersion {
                which: "application",
                ..
            })
        ));
        assert!(matches!(
            needs_migration("1.0.0", Some("1.0")),
            Err(ConnectionError::InvalidVersion {
                which: "database",
                ..
            })
        ));
    }
}
