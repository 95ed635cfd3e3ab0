use crate::config::Config;
use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Variant type produced by the upload flow for watermark sources.
pub const LARGE_VARIANT: &str = "large";

/// Read model over the externally owned photo catalog.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub id: i64,
    pub slug: String,
    pub storage_path: String,
    pub published: bool,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub variant_type: String,
    pub storage_path: String,
}

impl Photo {
    /// Key in the photos container to derive from: the pre-resized `large`
    /// variant when one exists, the original upload otherwise.
    pub fn source_key(&self) -> &str {
        self.variants
            .iter()
            .find(|variant| variant.variant_type == LARGE_VARIANT)
            .map(|variant| variant.storage_path.as_str())
            .unwrap_or(&self.storage_path)
    }
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db directory {:?}", parent))?;
            }
        }
        let db_url = format!("sqlite://{}?mode=rwc", config.db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .context("connect to sqlite")?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS photos (
          id INTEGER PRIMARY KEY,
          slug TEXT NOT NULL UNIQUE,
          storage_path TEXT NOT NULL,
          published INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS photo_variants (
          id INTEGER PRIMARY KEY,
          photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
          variant_type TEXT NOT NULL,
          storage_path TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS photo_variants_photo_id ON photo_variants(photo_id);
        "#;
        sqlx::query(schema)
            .execute(&self.pool)
            .await
            .context("initialize photo schema")?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find_photo_by_slug(&self, slug: &str) -> Result<Option<Photo>> {
        let row = sqlx::query(
            r#"
            SELECT id, slug, storage_path, published
            FROM photos
            WHERE slug = ?1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("lookup photo by slug")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let variants = sqlx::query(
            r#"
            SELECT variant_type, storage_path
            FROM photo_variants
            WHERE photo_id = ?1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("load photo variants")?
        .into_iter()
        .map(|row| Variant {
            variant_type: row.get("variant_type"),
            storage_path: row.get("storage_path"),
        })
        .collect();
        Ok(Some(Photo {
            id,
            slug: row.get("slug"),
            storage_path: row.get("storage_path"),
            published: row.get::<i64, _>("published") == 1,
            variants,
        }))
    }

    /// Seeds a catalog row the way the upload flow would.
    #[cfg(test)]
    pub(crate) async fn insert_photo(
        &self,
        slug: &str,
        storage_path: &str,
        published: bool,
        variants: &[(&str, &str)],
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO photos (slug, storage_path, published) VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(slug)
        .bind(storage_path)
        .bind(if published { 1 } else { 0 })
        .fetch_one(&self.pool)
        .await?;
        for (variant_type, path) in variants {
            sqlx::query(
                "INSERT INTO photo_variants (photo_id, variant_type, storage_path) VALUES (?1, ?2, ?3)",
            )
            .bind(id)
            .bind(*variant_type)
            .bind(*path)
            .execute(&self.pool)
            .await?;
        }
        Ok(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use tempfile::TempDir;

    pub(crate) async fn test_database() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.db_path = dir.path().join("nested/photos.db");
        let db = Database::new(&config).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn finds_photo_with_variants() {
        let (db, _dir) = test_database().await;
        db.insert_photo(
            "sample-photo",
            "originals/sample-photo.jpg",
            true,
            &[
                ("thumb", "public/sample-photo_512.jpg"),
                ("large", "public/sample-photo_2048.jpg"),
            ],
        )
        .await
        .unwrap();

        let photo = db.find_photo_by_slug("sample-photo").await.unwrap().unwrap();
        assert_eq!(photo.slug, "sample-photo");
        assert!(photo.published);
        assert_eq!(photo.variants.len(), 2);
        assert_eq!(photo.variants[0].variant_type, "thumb");
        assert_eq!(photo.source_key(), "public/sample-photo_2048.jpg");
    }

    #[tokio::test]
    async fn missing_slug_is_none() {
        let (db, _dir) = test_database().await;
        assert!(db.find_photo_by_slug("does-not-exist").await.unwrap().is_none());
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn reopening_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.db_path = dir.path().join("photos.db");
        let db = Database::new(&config).await.unwrap();
        db.insert_photo("kept", "originals/kept.jpg", false, &[])
            .await
            .unwrap();
        drop(db);
        let reopened = Database::new(&config).await.unwrap();
        let photo = reopened.find_photo_by_slug("kept").await.unwrap().unwrap();
        assert!(!photo.published);
    }

    #[test]
    fn source_key_falls_back_to_original() {
        let photo = Photo {
            id: 1,
            slug: "old-upload".to_string(),
            storage_path: "originals/old-upload.jpg".to_string(),
            published: true,
            variants: vec![Variant {
                variant_type: "thumb".to_string(),
                storage_path: "public/old-upload_512.jpg".to_string(),
            }],
        };
        assert_eq!(photo.source_key(), "originals/old-upload.jpg");
    }
}
