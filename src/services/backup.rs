//! Database and object storage snapshots.
//!
//! A backup directory holds one JSON file per table, a manifest plus a copy
//! of every object per bucket, and the schema the rows were written against.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, SqliteConnection};
use tokio::fs;
use tracing::{info, warn};

use crate::{
    db::DbPool,
    error::AppError,
    models::{photo::Photo, tag::Tag, tag::TripTag, trip::Trip, user::User},
    services::storage::{StorageService, BUCKETS},
};

pub const SCHEMA_SQL: &str = include_str!("../../migrations/20240101000000_init.sql");
const MANIFEST_URL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const OBJECTS_DIR: &str = "objects";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub key: String,
    pub size: u64,
    pub signed_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub dir: PathBuf,
    pub users: usize,
    pub trips: usize,
    pub photos: usize,
    pub tags: usize,
    pub trip_tags: usize,
    pub objects: usize,
}

#[derive(Clone)]
pub struct BackupService {
    db: DbPool,
    storage: StorageService,
}

impl BackupService {
    pub fn new(db: DbPool, storage: StorageService) -> Self {
        Self { db, storage }
    }

    /// Writes a snapshot into a new timestamped directory under `out`.
    pub async fn backup(&self, out: &Path) -> Result<BackupReport, AppError> {
        self.backup_at(out, Utc::now()).await
    }

    pub async fn backup_at(&self, out: &Path, now: DateTime<Utc>) -> Result<BackupReport, AppError> {
        let dir = out.join(backup_dir_name(now));
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "writing backup");

        let mut report = BackupReport {
            dir: dir.clone(),
            ..Default::default()
        };
        report.users = self
            .dump_table::<User>(
                &dir,
                "users",
                "SELECT id, uuid, username, email, password_hash, created_at, last_login_at \
                 FROM users ORDER BY created_at DESC",
            )
            .await?;
        report.trips = self
            .dump_table::<Trip>(
                &dir,
                "trips",
                "SELECT id, user_id, title, description, trip_date, latitude, longitude, \
                 trip_path, gpx_file, created_at FROM trips ORDER BY created_at DESC",
            )
            .await?;
        report.photos = self
            .dump_table::<Photo>(
                &dir,
                "photos",
                "SELECT id, trip_id, user_id, url, name, is_cover_photo, latitude, longitude, \
                 created_at FROM photos ORDER BY created_at DESC",
            )
            .await?;
        report.tags = self
            .dump_table::<Tag>(
                &dir,
                "tags",
                "SELECT id, name, usage_count, created_at FROM tags ORDER BY created_at DESC",
            )
            .await?;
        report.trip_tags = self
            .dump_table::<TripTag>(
                &dir,
                "trip_tags",
                "SELECT trip_id, tag_id, created_at FROM trip_tags ORDER BY created_at DESC",
            )
            .await?;

        for bucket in BUCKETS {
            report.objects += self.dump_bucket(&dir, bucket).await?;
        }

        fs::write(dir.join("schema.sql"), SCHEMA_SQL).await?;
        info!(
            users = report.users,
            trips = report.trips,
            photos = report.photos,
            tags = report.tags,
            objects = report.objects,
            "backup complete"
        );
        Ok(report)
    }

    async fn dump_table<T>(&self, dir: &Path, table: &str, sql: &str) -> Result<usize, AppError>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Serialize + Send + Unpin,
    {
        let rows: Vec<T> = sqlx::query_as(sql).fetch_all(&self.db).await?;
        let json = serde_json::to_vec_pretty(&rows)?;
        fs::write(dir.join(format!("{table}.json")), json).await?;
        info!(table, rows = rows.len(), "backed up table");
        Ok(rows.len())
    }

    async fn dump_bucket(&self, dir: &Path, bucket: &str) -> Result<usize, AppError> {
        let objects = self.storage.list_objects(bucket).await?;
        let mut manifest = Vec::with_capacity(objects.len());
        for object in &objects {
            let data = self.storage.read_object(bucket, &object.key).await?;
            let target = object_copy_path(dir, bucket, &object.key);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, data).await?;

            let signed_url = match self
                .storage
                .signer()
                .signed_url_with_ttl(bucket, &object.key, MANIFEST_URL_TTL)
            {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(bucket, key = %object.key, "no signed URL for object: {err}");
                    None
                }
            };
            manifest.push(ManifestEntry {
                key: object.key.clone(),
                size: object.size,
                signed_url,
            });
        }

        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(dir.join(format!("storage-{bucket}.json")), json).await?;
        info!(bucket, objects = manifest.len(), "backed up bucket");
        Ok(manifest.len())
    }

    /// Loads a snapshot back. Rows get fresh ids in the target database and
    /// references are rewritten to them; rows already present are reused.
    /// Tag usage counts are rebuilt from the restored links.
    pub async fn restore(&self, dir: &Path) -> Result<BackupReport, AppError> {
        if !fs::try_exists(dir.join("schema.sql")).await? {
            return Err(AppError::BadRequest(format!(
                "{} does not look like a backup directory",
                dir.display()
            )));
        }

        let users: Vec<User> = read_table(dir, "users").await?;
        let tags: Vec<Tag> = read_table(dir, "tags").await?;
        let trips: Vec<Trip> = read_table(dir, "trips").await?;
        let photos: Vec<Photo> = read_table(dir, "photos").await?;
        let trip_tags: Vec<TripTag> = read_table(dir, "trip_tags").await?;

        let mut tx = self.db.begin().await?;
        let mut report = BackupReport {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        let (restored_users, user_ids) = restore_users(&mut *tx, &users).await?;
        let (restored_tags, tag_ids) = restore_tags(&mut *tx, &tags).await?;
        let (restored_trips, trip_ids) = restore_trips(&mut *tx, &trips, &user_ids).await?;
        report.users = restored_users;
        report.tags = restored_tags;
        report.trips = restored_trips;
        report.photos = restore_photos(&mut *tx, &photos, &trip_ids, &user_ids).await?;
        report.trip_tags = restore_trip_tags(&mut *tx, &trip_tags, &trip_ids, &tag_ids).await?;
        tx.commit().await?;

        for bucket in BUCKETS {
            report.objects += self.restore_bucket(dir, bucket).await?;
        }

        info!(
            users = report.users,
            trips = report.trips,
            photos = report.photos,
            tags = report.tags,
            trip_tags = report.trip_tags,
            objects = report.objects,
            "restore complete"
        );
        Ok(report)
    }

    async fn restore_bucket(&self, dir: &Path, bucket: &str) -> Result<usize, AppError> {
        let manifest_path = dir.join(format!("storage-{bucket}.json"));
        if !fs::try_exists(&manifest_path).await? {
            warn!(bucket, "backup has no manifest for bucket");
            return Ok(0);
        }
        let manifest: Vec<ManifestEntry> =
            serde_json::from_slice(&fs::read(&manifest_path).await?)?;

        let mut restored = 0;
        for entry in manifest {
            let source = object_copy_path(dir, bucket, &entry.key);
            match fs::read(&source).await {
                Ok(data) => {
                    self.storage.put_object(bucket, &entry.key, &data).await?;
                    restored += 1;
                }
                Err(err) => warn!(bucket, key = %entry.key, "object missing from backup: {err}"),
            }
        }
        Ok(restored)
    }
}

pub fn backup_dir_name(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

fn object_copy_path(dir: &Path, bucket: &str, key: &str) -> PathBuf {
    let mut path = dir.join(OBJECTS_DIR).join(bucket);
    for segment in key.split('/') {
        path.push(segment);
    }
    path
}

async fn read_table<T: DeserializeOwned>(dir: &Path, table: &str) -> Result<Vec<T>, AppError> {
    let path = dir.join(format!("{table}.json"));
    if !fs::try_exists(&path).await? {
        warn!(table, "backup has no file for table");
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&fs::read(&path).await?)?)
}

/// Backup ids mapped to the ids the rows carry in the target database.
type IdMap = HashMap<i64, i64>;

/// Accounts are matched by uuid. A different account that already holds the
/// username or email aborts the restore.
async fn restore_users(
    conn: &mut SqliteConnection,
    rows: &[User],
) -> Result<(usize, IdMap), AppError> {
    let mut ids = IdMap::new();
    let mut inserted = 0;
    for user in rows {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE uuid = ?")
            .bind(&user.uuid)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(id) = existing {
            ids.insert(user.id, id);
            continue;
        }

        let taken: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE username = ? OR lower(email) = lower(?)",
        )
        .bind(&user.username)
        .bind(&user.email)
        .fetch_one(&mut *conn)
        .await?;
        if taken > 0 {
            return Err(AppError::BadRequest(format!(
                "user {} conflicts with a different account in this installation",
                user.username
            )));
        }

        let id = sqlx::query(
            "INSERT INTO users (uuid, username, email, password_hash, created_at, last_login_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.uuid)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .bind(user.last_login_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        ids.insert(user.id, id);
        inserted += 1;
    }
    Ok((inserted, ids))
}

async fn restore_tags(conn: &mut SqliteConnection, rows: &[Tag]) -> Result<(usize, IdMap), AppError> {
    let mut ids = IdMap::new();
    let mut inserted = 0;
    for tag in rows {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
            .bind(&tag.name)
            .fetch_optional(&mut *conn)
            .await?;
        let id = match existing {
            Some(id) => id,
            None => {
                inserted += 1;
                // usage_count is rebuilt by the trip_tags triggers
                sqlx::query("INSERT INTO tags (name, usage_count, created_at) VALUES (?, 0, ?)")
                    .bind(&tag.name)
                    .bind(tag.created_at)
                    .execute(&mut *conn)
                    .await?
                    .last_insert_rowid()
            }
        };
        ids.insert(tag.id, id);
    }
    Ok((inserted, ids))
}

/// A trip with the same owner, title and creation time is taken to be the
/// one already restored.
async fn restore_trips(
    conn: &mut SqliteConnection,
    rows: &[Trip],
    users: &IdMap,
) -> Result<(usize, IdMap), AppError> {
    let mut ids = IdMap::new();
    let mut inserted = 0;
    for trip in rows {
        let Some(&user_id) = users.get(&trip.user_id) else {
            warn!(trip_id = trip.id, user_id = trip.user_id, "skipping trip without owner in backup");
            continue;
        };
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM trips WHERE user_id = ? AND title = ? AND created_at = ?",
        )
        .bind(user_id)
        .bind(&trip.title)
        .bind(trip.created_at)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            ids.insert(trip.id, id);
            continue;
        }

        let id = sqlx::query(
            "INSERT INTO trips \
             (user_id, title, description, trip_date, latitude, longitude, trip_path, gpx_file, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&trip.title)
        .bind(&trip.description)
        .bind(&trip.trip_date)
        .bind(trip.latitude)
        .bind(trip.longitude)
        .bind(&trip.trip_path)
        .bind(&trip.gpx_file)
        .bind(trip.created_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        ids.insert(trip.id, id);
        inserted += 1;
    }
    Ok((inserted, ids))
}

async fn restore_photos(
    conn: &mut SqliteConnection,
    rows: &[Photo],
    trips: &IdMap,
    users: &IdMap,
) -> Result<usize, AppError> {
    let mut inserted = 0;
    for photo in rows {
        let Some(&trip_id) = trips.get(&photo.trip_id) else {
            warn!(photo_id = photo.id, trip_id = photo.trip_id, "skipping photo without trip in backup");
            continue;
        };
        let present: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM photos WHERE trip_id = ? AND url = ?")
            .bind(trip_id)
            .bind(&photo.url)
            .fetch_one(&mut *conn)
            .await?;
        if present > 0 {
            continue;
        }

        sqlx::query(
            "INSERT INTO photos \
             (trip_id, user_id, url, name, is_cover_photo, latitude, longitude, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(trip_id)
        .bind(photo.user_id.and_then(|id| users.get(&id).copied()))
        .bind(&photo.url)
        .bind(&photo.name)
        .bind(photo.is_cover_photo)
        .bind(photo.latitude)
        .bind(photo.longitude)
        .bind(photo.created_at)
        .execute(&mut *conn)
        .await?;
        inserted += 1;
    }
    Ok(inserted)
}

async fn restore_trip_tags(
    conn: &mut SqliteConnection,
    rows: &[TripTag],
    trips: &IdMap,
    tags: &IdMap,
) -> Result<usize, AppError> {
    let mut inserted = 0;
    for link in rows {
        let (Some(&trip_id), Some(&tag_id)) = (trips.get(&link.trip_id), tags.get(&link.tag_id)) else {
            warn!(trip_id = link.trip_id, tag_id = link.tag_id, "skipping dangling trip tag");
            continue;
        };
        inserted += sqlx::query(
            "INSERT OR IGNORE INTO trip_tags (trip_id, tag_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(trip_id)
        .bind(tag_id)
        .bind(link.created_at)
        .execute(&mut *conn)
        .await?
        .rows_affected() as usize;
    }
    Ok(inserted)
}
