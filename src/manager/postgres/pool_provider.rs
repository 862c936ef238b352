//! Pool provider abstraction for read/write routing.
//!
//! [`PoolProvider`] lets the PostgreSQL backend send candidate scans to a replica
//! while every conditional update, row lock and read-after-write goes to the primary.
//! A plain `PgPool` implements it with both sides pointing at the same pool.
//!
//! For tests, [`TestDbPools`] builds a replica pool that refuses writes, so a write
//! routed through `.read()` fails loudly.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Trait for providing database pools with read/write routing.
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for queries that tolerate replica lag.
    ///
    /// Candidate listing is the only caller: a request accepted moments ago may
    /// still show up, and the subsequent accept attempt will report `AlreadyAssigned`.
    fn read(&self) -> &PgPool;

    /// Pool for writes, `SELECT ... FOR UPDATE`, and reads that must see the latest commit.
    fn write(&self) -> &PgPool;
}

impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

/// Test pool provider with read-only replica enforcement.
///
/// Both pools connect to the same database; the replica sets
/// `default_transaction_read_only = on` on every connection.
#[derive(Clone, Debug)]
pub struct TestDbPools {
    primary: PgPool,
    replica: PgPool,
}

impl TestDbPools {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let primary = pool.clone();

        let replica = PgPoolOptions::new()
            .max_connections(pool.options().get_max_connections())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET default_transaction_read_only = on")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(pool.connect_options().as_ref().clone())
            .await?;

        Ok(Self { primary, replica })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        &self.replica
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}
