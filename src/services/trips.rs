use bytes::Bytes;
use chrono::Utc;
use futures_util::future::try_join_all;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::{
    auth::AuthenticatedUser,
    dates::format_date_for_api,
    db::DbPool,
    error::AppError,
    gpx::{gpx_to_geojson, simplify_path, track_coordinates, FeatureCollection},
    models::{
        tag::{dedupe_tags, normalize_tag, PopularTag},
        trip::{line_string_json, GeoPoint, TripRow, TripView},
    },
    services::{
        photo_meta::photo_location,
        storage::{object_key_for_gpx, object_key_for_photo, StorageService, GPX_BUCKET, PHOTO_BUCKET},
    },
};

pub const MAX_TITLE_CHARS: usize = 200;
const MAX_PATH_POINTS: usize = 500;

/// Joined retrieval: one row per trip, photos (cover first) and tags folded
/// into JSON arrays.
const TRIP_SELECT: &str = r#"
SELECT
    t.id,
    t.title,
    t.description,
    t.trip_date,
    t.latitude AS lat,
    t.longitude AS long,
    t.trip_path,
    t.gpx_file,
    t.created_at,
    (
        SELECT json_group_array(json_object(
            'id', p.id,
            'url', p.url,
            'name', p.name,
            'is_cover_photo', p.is_cover_photo,
            'lat', p.latitude,
            'long', p.longitude
        ))
        FROM (
            SELECT * FROM photos
            WHERE photos.trip_id = t.id
            ORDER BY photos.is_cover_photo DESC, photos.id ASC
        ) AS p
    ) AS photos,
    (
        SELECT json_group_array(g.name)
        FROM (
            SELECT tags.name FROM trip_tags
            JOIN tags ON tags.id = trip_tags.tag_id
            WHERE trip_tags.trip_id = t.id
            ORDER BY tags.name ASC
        ) AS g
    ) AS tags
FROM trips t
"#;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTripInput {
    pub title: String,
    pub description: Option<String>,
    pub trip_date: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub tags: Vec<String>,
    pub photos: Vec<UploadedFile>,
    pub gpx_file: Option<UploadedFile>,
}

#[derive(Clone)]
pub struct TripService {
    db: DbPool,
    storage: StorageService,
    max_upload_bytes: usize,
}

/// Object keys written during one create, removed again if it fails.
#[derive(Default)]
struct WrittenObjects {
    photos: Vec<String>,
    gpx: Vec<String>,
}

struct ParsedTrack {
    file: UploadedFile,
    path: Vec<[f64; 2]>,
}

impl TripService {
    pub fn new(db: DbPool, storage: StorageService, max_upload_bytes: usize) -> Self {
        Self {
            db,
            storage,
            max_upload_bytes,
        }
    }

    pub async fn list_trips(&self, owner: &AuthenticatedUser) -> Result<Vec<TripView>, AppError> {
        let sql = format!("{TRIP_SELECT} WHERE t.user_id = ? ORDER BY t.trip_date DESC, t.id DESC");
        let rows: Vec<TripRow> = sqlx::query_as(&sql)
            .bind(owner.id)
            .fetch_all(&self.db)
            .await?;
        debug!(user = %owner.username, count = rows.len(), "loaded trips");
        let signer = self.storage.signer();
        Ok(rows
            .into_iter()
            .map(|row| TripView::from_row(row, signer))
            .collect())
    }

    pub async fn get_trip(&self, owner: &AuthenticatedUser, trip_id: i64) -> Result<TripView, AppError> {
        let sql = format!("{TRIP_SELECT} WHERE t.user_id = ? AND t.id = ?");
        let row: Option<TripRow> = sqlx::query_as(&sql)
            .bind(owner.id)
            .bind(trip_id)
            .fetch_optional(&self.db)
            .await?;
        let row = row.ok_or(AppError::NotFound)?;
        Ok(TripView::from_row(row, self.storage.signer()))
    }

    pub async fn create_trip(
        &self,
        owner: &AuthenticatedUser,
        input: CreateTripInput,
    ) -> Result<TripView, AppError> {
        let title = validate_title(&input.title)?;
        let location = resolve_location(input.latitude, input.longitude)?;
        self.check_upload_size(&input)?;
        let track = input.gpx_file.clone().map(parse_track).transpose()?;

        let now = Utc::now();
        let trip_date = format_date_for_api(input.trip_date.as_deref(), now.date_naive());
        let description = input
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        let mut tx = self.db.begin().await?;
        let trip_id = sqlx::query(
            r#"
            INSERT INTO trips (user_id, title, description, trip_date, latitude, longitude, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(owner.id)
        .bind(&title)
        .bind(&description)
        .bind(&trip_date)
        .bind(location.map(|p| p.lat))
        .bind(location.map(|p| p.lng))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut written = WrittenObjects::default();
        let attached = self
            .attach_uploads(&mut *tx, owner, trip_id, &input, track, &mut written)
            .await;
        let committed = match attached {
            Ok(()) => tx.commit().await.map_err(AppError::from),
            Err(err) => {
                drop(tx);
                Err(err)
            }
        };
        if let Err(err) = committed {
            warn!(trip_id, "trip creation failed, removing uploaded objects: {err}");
            self.storage.delete_objects(PHOTO_BUCKET, &written.photos).await;
            self.storage.delete_objects(GPX_BUCKET, &written.gpx).await;
            return Err(err);
        }

        info!(trip_id, user = %owner.username, photos = input.photos.len(), "created trip");
        self.get_trip(owner, trip_id).await
    }

    async fn attach_uploads(
        &self,
        conn: &mut SqliteConnection,
        owner: &AuthenticatedUser,
        trip_id: i64,
        input: &CreateTripInput,
        track: Option<ParsedTrack>,
        written: &mut WrittenObjects,
    ) -> Result<(), AppError> {
        let now = Utc::now();

        written.photos = input
            .photos
            .iter()
            .enumerate()
            .map(|(index, file)| object_key_for_photo(&owner.uuid, trip_id, index, &file.file_name, now))
            .collect();
        try_join_all(
            written
                .photos
                .iter()
                .zip(&input.photos)
                .map(|(key, file)| self.storage.put_object(PHOTO_BUCKET, key, &file.bytes)),
        )
        .await?;

        for (index, (key, file)) in written.photos.iter().zip(&input.photos).enumerate() {
            let location = photo_location(&file.bytes);
            sqlx::query(
                r#"
                INSERT INTO photos (trip_id, user_id, url, name, is_cover_photo, latitude, longitude, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(trip_id)
            .bind(owner.id)
            .bind(key)
            .bind(&file.file_name)
            .bind(index == 0)
            .bind(location.map(|p| p.lat))
            .bind(location.map(|p| p.lng))
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        let tags = dedupe_tags(input.tags.iter().filter_map(|t| normalize_tag(t)));
        for tag in &tags {
            let tag_id = get_or_create_tag(conn, tag).await?;
            sqlx::query("INSERT OR IGNORE INTO trip_tags (trip_id, tag_id, created_at) VALUES (?, ?, ?)")
                .bind(trip_id)
                .bind(tag_id)
                .bind(now)
                .execute(&mut *conn)
                .await?;
        }

        if let Some(track) = track {
            let key = object_key_for_gpx(&owner.uuid, trip_id, &track.file.file_name);
            written.gpx.push(key.clone());
            self.storage.put_object(GPX_BUCKET, &key, &track.file.bytes).await?;
            let trip_path = (!track.path.is_empty()).then(|| line_string_json(&track.path));
            sqlx::query("UPDATE trips SET gpx_file = ?, trip_path = ? WHERE id = ?")
                .bind(&key)
                .bind(trip_path)
                .bind(trip_id)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }

    fn check_upload_size(&self, input: &CreateTripInput) -> Result<(), AppError> {
        let total: usize = input
            .photos
            .iter()
            .chain(input.gpx_file.iter())
            .map(|file| file.bytes.len())
            .sum();
        if total > self.max_upload_bytes {
            return Err(AppError::PayloadTooLarge);
        }
        Ok(())
    }

    /// GeoJSON for the trip's GPX upload; an empty collection when there is
    /// none or it cannot be read.
    pub async fn trip_track(
        &self,
        owner: &AuthenticatedUser,
        trip_id: i64,
    ) -> Result<FeatureCollection, AppError> {
        let gpx_file: Option<Option<String>> =
            sqlx::query_scalar("SELECT gpx_file FROM trips WHERE id = ? AND user_id = ?")
                .bind(trip_id)
                .bind(owner.id)
                .fetch_optional(&self.db)
                .await?;
        let Some(key) = gpx_file.ok_or(AppError::NotFound)? else {
            return Ok(FeatureCollection::default());
        };

        let data = match self.storage.read_object(GPX_BUCKET, &key).await {
            Ok(data) => data,
            Err(AppError::NotFound) => {
                warn!(trip_id, key = %key, "GPX object missing");
                return Ok(FeatureCollection::default());
            }
            Err(err) => return Err(err),
        };
        match gpx_to_geojson(&String::from_utf8_lossy(&data)) {
            Ok(collection) => Ok(collection),
            Err(err) => {
                warn!(trip_id, "error converting GPX to GeoJSON: {err}");
                Ok(FeatureCollection::default())
            }
        }
    }

    pub async fn tag_suggestions(&self, query: Option<&str>) -> Result<Vec<String>, AppError> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let names: Vec<String> = match query {
            Some(q) => {
                sqlx::query_scalar(
                    "SELECT name FROM tags WHERE instr(lower(name), lower(?)) > 0 ORDER BY name ASC",
                )
                .bind(q)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT name FROM tags ORDER BY name ASC")
                    .fetch_all(&self.db)
                    .await?
            }
        };
        Ok(names)
    }

    pub async fn popular_tags(&self, limit: i64) -> Result<Vec<PopularTag>, AppError> {
        let tags = sqlx::query_as("SELECT id, name, usage_count FROM popular_tags LIMIT ?")
            .bind(limit)
            .fetch_all(&self.db)
            .await?;
        Ok(tags)
    }
}

async fn get_or_create_tag(conn: &mut SqliteConnection, name: &str) -> Result<i64, AppError> {
    sqlx::query("INSERT OR IGNORE INTO tags (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    let id = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

pub fn validate_title(raw: &str) -> Result<String, AppError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::BadRequest("Please enter a trip title".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::BadRequest(format!(
            "Trip title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

/// Both coordinates or none. `0,0` counts as no location.
pub fn resolve_location(lat: Option<f64>, lng: Option<f64>) -> Result<Option<GeoPoint>, AppError> {
    match (lat, lng) {
        (Some(lat), Some(lng)) if lat == 0.0 && lng == 0.0 => Ok(None),
        (Some(lat), Some(lng)) => GeoPoint::checked(lat, lng)
            .map(Some)
            .ok_or_else(|| AppError::BadRequest("Location is out of range".into())),
        (None, None) => Ok(None),
        _ => Err(AppError::BadRequest(
            "Location needs both latitude and longitude".into(),
        )),
    }
}

fn parse_track(file: UploadedFile) -> Result<ParsedTrack, AppError> {
    let xml = std::str::from_utf8(&file.bytes)
        .map_err(|_| AppError::BadRequest("The GPX file is not valid UTF-8".into()))?;
    let collection = gpx_to_geojson(xml).map_err(|err| {
        debug!("rejected GPX upload {}: {err}", file.file_name);
        AppError::BadRequest("The GPX file could not be read".into())
    })?;
    let path = simplify_path(&track_coordinates(&collection), MAX_PATH_POINTS);
    Ok(ParsedTrack { file, path })
}
