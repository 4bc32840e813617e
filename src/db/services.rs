//! Remote provider registry.

use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::types::{Service, ServiceKind};

/// Register (or replace) a remote provider.
pub async fn register(pool: &PgPool, service: &Service) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO services (name, url, kind)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO UPDATE SET url = $2, kind = $3
        "#,
    )
    .bind(&service.name)
    .bind(&service.url)
    .bind(service.kind)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_by_name(pool: &PgPool, name: &str) -> Result<Service> {
    let row = sqlx::query("SELECT * FROM services WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Service {
            name: row.get("name"),
            url: row.get("url"),
            kind: row.get("kind"),
        }),
        None => Err(Error::NoSuchProvider(name.to_string())),
    }
}

pub async fn list(pool: &PgPool) -> Result<Vec<Service>> {
    let rows = sqlx::query("SELECT * FROM services ORDER BY name ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| Service {
            name: row.get("name"),
            url: row.get("url"),
            kind: row.get("kind"),
        })
        .collect())
}

pub async fn remove(pool: &PgPool, name: &str) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM services WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(Error::NoSuchProvider(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_register_and_fetch() {
        let settings = crate::config::Settings::load(None).unwrap();
        let pool = crate::db::connect(&settings).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();

        let service = Service {
            name: "emu".into(),
            url: "https://wps.example.com/wps".into(),
            kind: ServiceKind::Wps1,
        };
        register(&pool, &service).await.unwrap();
        let fetched = fetch_by_name(&pool, "emu").await.unwrap();
        assert_eq!(fetched.url, service.url);
        assert_eq!(fetched.kind, ServiceKind::Wps1);
        remove(&pool, "emu").await.unwrap();
    }
}
