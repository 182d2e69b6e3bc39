pub mod memory;
pub mod models;
pub mod pg;
pub mod repo;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::Result;

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        crate::error::EngineError::Db(sqlx::Error::Migrate(Box::new(e)))
    })?;
    Ok(())
}
