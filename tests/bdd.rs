#![allow(dead_code)]

use std::{collections::HashMap, fmt, fs::File, path::PathBuf};

use anyhow::Context;
use bytes::Bytes;
use cucumber::{given, then, when, World as _};
use tempfile::TempDir;
use tripmap::{
    auth::{self, AuthenticatedUser},
    config::AppConfig,
    db::{init_pool, run_migrations},
    gpx::track_coordinates,
    error::AppError,
    models::{
        trip::{GeoPoint, TripView},
        user::User,
    },
    services::{
        backup::{BackupReport, BackupService, ManifestEntry},
        storage::GPX_BUCKET,
        trips::{CreateTripInput, UploadedFile},
    },
    state::AppState,
};

const TRACK_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="bdd" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>Ride</name>
    <trkseg>
      <trkpt lat="50.0755" lon="14.4378"><time>2024-06-01T08:00:00Z</time></trkpt>
      <trkpt lat="50.0800" lon="14.4400"><time>2024-06-01T08:05:00Z</time></trkpt>
      <trkpt lat="50.0850" lon="14.4500"><time>2024-06-01T08:10:00Z</time></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

#[derive(Debug, cucumber::World, Default)]
struct AppWorld {
    state: Option<TestState>,
    previous_state: Option<TestState>,
    users: HashMap<String, AuthenticatedUser>,
    registered_user: Option<AuthenticatedUser>,
    last_trip: Option<TripView>,
    last_error: Option<String>,
    session_id: Option<String>,
    backup: Option<BackupReport>,
}

impl AppWorld {
    fn app_state(&self) -> &AppState {
        self.state
            .as_ref()
            .expect("state must be initialised first")
            .app()
    }

    fn user(&self, username: &str) -> AuthenticatedUser {
        self.users
            .get(username)
            .cloned()
            .unwrap_or_else(|| panic!("user {username} must be registered first"))
    }

    async fn create_trip(&mut self, username: &str, input: CreateTripInput) {
        let user = self.user(username);
        let result = self.app_state().trips.create_trip(&user, input).await;
        match result {
            Ok(trip) => {
                self.last_trip = Some(trip);
                self.last_error = None;
            }
            Err(err) => {
                self.last_trip = None;
                self.last_error = Some(err.to_string());
            }
        }
    }

    /// Starts a new installation holding one other account.
    async fn switch_to_occupied_state(&mut self, username: &str, email: &str) {
        let fresh = TestState::new().await.expect("fresh state");
        let user = auth::register_user(fresh.app(), username, email, "correct-horse")
            .await
            .expect("register user");
        self.previous_state = self.state.replace(fresh);
        self.users.insert(user.username.clone(), user);
    }

    /// Re-reads known users from the current installation, whose ids may
    /// differ from the ones they had when registered.
    async fn reload_users(&mut self) {
        let db = self.app_state().db.clone();
        let mut reloaded = HashMap::new();
        for username in self.users.keys() {
            let row: Option<User> = sqlx::query_as(
                "SELECT id, uuid, username, email, password_hash, created_at, last_login_at \
                 FROM users WHERE username = ?",
            )
            .bind(username)
            .fetch_optional(&db)
            .await
            .expect("load user");
            if let Some(user) = row {
                reloaded.insert(username.clone(), AuthenticatedUser::from(user));
            }
        }
        self.registered_user = self
            .registered_user
            .as_ref()
            .and_then(|user| reloaded.get(&user.username).cloned());
        self.users = reloaded;
    }

    fn last_trip(&self) -> &TripView {
        if let Some(err) = &self.last_error {
            panic!("trip creation failed: {err}");
        }
        self.last_trip.as_ref().expect("a trip must be created first")
    }
}

struct TestState {
    app: AppState,
    root: TempDir,
}

impl fmt::Debug for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestState").finish()
    }
}

impl TestState {
    async fn new() -> anyhow::Result<Self> {
        let root = TempDir::new().context("create temp dir for bdd world")?;
        let storage_root = root.path().join("storage");
        std::fs::create_dir_all(&storage_root)?;

        let db_path = root.path().join("bdd.sqlite");
        File::create(&db_path)?;
        let database_url = format!("sqlite://{}", db_path.to_string_lossy());

        let config = AppConfig::local(database_url, storage_root);
        let db = init_pool(&config.database_url).await?;
        run_migrations(&db).await?;

        let app = AppState::new(config, db);
        app.storage.ensure_structure().await?;
        Ok(Self { app, root })
    }

    fn app(&self) -> &AppState {
        &self.app
    }

    fn backup_service(&self) -> BackupService {
        BackupService::new(self.app.db.clone(), self.app.storage.clone())
    }
}

fn trip_input(title: &str, date: &str) -> CreateTripInput {
    CreateTripInput {
        title: title.to_string(),
        trip_date: Some(date.to_string()),
        ..Default::default()
    }
}

fn fake_photo(index: usize) -> UploadedFile {
    UploadedFile {
        file_name: format!("IMG_{index:04}.jpg"),
        bytes: Bytes::from(format!("fake-jpeg-{index}")),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[given("a fresh application state")]
async fn given_fresh_state(world: &mut AppWorld) {
    world.state = Some(TestState::new().await.expect("state"));
    world.users.clear();
    world.registered_user = None;
    world.last_trip = None;
    world.last_error = None;
}

#[given(
    regex = r#"^a registered user "([^"]+)" with email "([^"]+)" and password "([^"]+)"$"#
)]
async fn given_registered_user(
    world: &mut AppWorld,
    username: String,
    email: String,
    password: String,
) {
    register_user(world, username, email, password).await;
}

#[when(
    regex = r#"^I register a user "([^"]+)" with email "([^"]+)" and password "([^"]+)"$"#
)]
async fn when_register_user(
    world: &mut AppWorld,
    username: String,
    email: String,
    password: String,
) {
    register_user(world, username, email, password).await;
}

#[when(
    regex = r#"^I try to register a user "([^"]+)" with email "([^"]+)" and password "([^"]+)"$"#
)]
async fn when_try_register_user(
    world: &mut AppWorld,
    username: String,
    email: String,
    password: String,
) {
    let result = auth::register_user(world.app_state(), &username, &email, &password).await;
    match result {
        Ok(user) => panic!("registration of {} unexpectedly succeeded", user.username),
        Err(err) => world.last_error = Some(err.to_string()),
    }
}

#[then(regex = r#"^registration fails with "([^"]+)"$"#)]
async fn then_registration_fails(world: &mut AppWorld, message: String) {
    assert_eq!(world.last_error.as_deref(), Some(message.as_str()));
}

#[then(regex = r#"^I can authenticate as "([^"]+)" using password "([^"]+)"$"#)]
async fn then_can_authenticate(world: &mut AppWorld, identifier: String, password: String) {
    let authed = auth::authenticate_user(world.app_state(), &identifier, &password)
        .await
        .expect("authentication");
    let registered = world
        .registered_user
        .as_ref()
        .expect("user must exist before authenticating");
    assert_eq!(authed.id, registered.id);
    assert_eq!(authed.username, registered.username);
}

#[then(regex = r#"^authenticating as "([^"]+)" with password "([^"]+)" fails$"#)]
async fn then_authentication_fails(world: &mut AppWorld, identifier: String, password: String) {
    let result = auth::authenticate_user(world.app_state(), &identifier, &password).await;
    assert!(result.is_err(), "authentication should have failed");
}

#[when(regex = r#"^"([^"]+)" starts a session$"#)]
async fn when_start_session(world: &mut AppWorld, username: String) {
    let user = world.user(&username);
    let session_id = auth::create_session(world.app_state(), user.id)
        .await
        .expect("create session");
    assert_eq!(session_id.len(), 64);
    world.session_id = Some(session_id);
}

#[then(regex = r#"^the session belongs to "([^"]+)"$"#)]
async fn then_session_belongs_to(world: &mut AppWorld, username: String) {
    let session_id = world.session_id.clone().expect("session must exist");
    let user = auth::user_for_session(world.app_state(), &session_id)
        .await
        .expect("resolve session")
        .expect("session should resolve to a user");
    assert_eq!(user.username, username);
}

#[when("the session is destroyed")]
async fn when_session_destroyed(world: &mut AppWorld) {
    let session_id = world.session_id.clone().expect("session must exist");
    auth::destroy_session(world.app_state(), &session_id)
        .await
        .expect("destroy session");
}

#[then("the session no longer resolves")]
async fn then_session_gone(world: &mut AppWorld) {
    let session_id = world.session_id.clone().expect("session must exist");
    let user = auth::user_for_session(world.app_state(), &session_id)
        .await
        .expect("resolve session");
    assert!(user.is_none());
}

#[when(regex = r#"^"([^"]+)" creates a trip "([^"]+)" on "([^"]+)"$"#)]
async fn when_create_trip(world: &mut AppWorld, username: String, title: String, date: String) {
    world.create_trip(&username, trip_input(&title, &date)).await;
}

#[when(
    regex = r#"^"([^"]+)" creates a trip "([^"]+)" on "([^"]+)" at (-?[\d.]+), (-?[\d.]+) tagged "([^"]*)" with (\d+) photos$"#
)]
async fn when_create_full_trip(
    world: &mut AppWorld,
    username: String,
    title: String,
    date: String,
    lat: f64,
    lng: f64,
    tags: String,
    photos: usize,
) {
    let mut input = trip_input(&title, &date);
    input.description = Some("A day outside.".into());
    input.latitude = Some(lat);
    input.longitude = Some(lng);
    input.tags = split_list(&tags);
    input.photos = (0..photos).map(fake_photo).collect();
    world.create_trip(&username, input).await;
}

#[when(regex = r#"^"([^"]+)" creates a trip "([^"]+)" on "([^"]+)" with a GPX track$"#)]
async fn when_create_trip_with_track(
    world: &mut AppWorld,
    username: String,
    title: String,
    date: String,
) {
    let mut input = trip_input(&title, &date);
    input.gpx_file = Some(UploadedFile {
        file_name: "ride.gpx".into(),
        bytes: Bytes::from_static(TRACK_GPX.as_bytes()),
    });
    world.create_trip(&username, input).await;
}

#[when(regex = r#"^"([^"]+)" creates a trip "([^"]+)" tagged "([^"]*)"$"#)]
async fn when_create_tagged_trip(world: &mut AppWorld, username: String, title: String, tags: String) {
    let mut input = trip_input(&title, "2024-04-01");
    input.tags = split_list(&tags);
    world.create_trip(&username, input).await;
}

#[when(regex = r#"^"([^"]+)" tries to create a trip "([^"]*)"$"#)]
async fn when_try_create_trip(world: &mut AppWorld, username: String, title: String) {
    world.create_trip(&username, trip_input(&title, "2024-04-01")).await;
}

#[when(regex = r#"^"([^"]+)" tries to create a trip "([^"]*)" with an invalid GPX file$"#)]
async fn when_try_create_invalid_gpx(world: &mut AppWorld, username: String, title: String) {
    let mut input = trip_input(&title, "2024-04-01");
    input.photos = vec![fake_photo(0)];
    input.gpx_file = Some(UploadedFile {
        file_name: "broken.gpx".into(),
        bytes: Bytes::from_static(b"<gpx><trk><trkseg>"),
    });
    world.create_trip(&username, input).await;
}

#[then(regex = r#"^trip creation fails with "([^"]+)"$"#)]
async fn then_trip_creation_fails(world: &mut AppWorld, message: String) {
    assert!(world.last_trip.is_none(), "trip should not have been created");
    assert_eq!(world.last_error.as_deref(), Some(message.as_str()));
}

#[then(regex = r"^the trip has (\d+) photos and the first one is the cover$")]
async fn then_trip_photos(world: &mut AppWorld, expected: usize) {
    let trip = world.last_trip();
    assert_eq!(trip.photos.len(), expected);
    let first = trip.photos.first().expect("at least one photo");
    assert!(first.is_cover_photo);
    assert_eq!(trip.cover_photo().map(|p| p.url.clone()), Some(first.url.clone()));
    for photo in &trip.photos {
        assert!(photo.url.starts_with("/media/trip-photos/"), "unsigned url {}", photo.url);
    }
}

#[then(regex = r#"^the trip has tags "([^"]*)"$"#)]
async fn then_trip_tags(world: &mut AppWorld, tags: String) {
    assert_eq!(world.last_trip().tags, split_list(&tags));
}

#[then(regex = r"^the trip location is (-?[\d.]+), (-?[\d.]+)$")]
async fn then_trip_location(world: &mut AppWorld, lat: f64, lng: f64) {
    assert_eq!(world.last_trip().location, Some(GeoPoint { lat, lng }));
}

#[then(regex = r#"^the trip date is "([^"]+)" shown as "([^"]+)"$"#)]
async fn then_trip_date(world: &mut AppWorld, date: String, display: String) {
    let trip = world.last_trip();
    assert_eq!(trip.trip_date.as_deref(), Some(date.as_str()));
    assert_eq!(trip.display_date, display);
}

#[then(regex = r#"^the tag "([^"]+)" has been used (\d+) times?$"#)]
async fn then_tag_usage(world: &mut AppWorld, name: String, expected: i64) {
    let popular = world
        .app_state()
        .trips
        .popular_tags(50)
        .await
        .expect("popular tags");
    let tag = popular
        .iter()
        .find(|tag| tag.name == name)
        .unwrap_or_else(|| panic!("tag {name} is not popular"));
    assert_eq!(tag.usage_count, expected);
}

#[then(regex = r"^the trip has a stored track with (\d+) points$")]
async fn then_trip_track(world: &mut AppWorld, expected: usize) {
    let trip = world.last_trip().clone();
    assert!(trip.has_track);
    assert_track_points(world, &trip, expected).await;
}

#[then(regex = r"^the trip path has (\d+) points$")]
async fn then_trip_path(world: &mut AppWorld, expected: usize) {
    let trip = world.last_trip();
    assert_eq!(trip.trip_path.len(), expected);
    assert!(trip.is_mappable());
}

#[then(regex = r#"^the trip "([^"]+)" of "([^"]+)" has a stored track with (\d+) points$"#)]
async fn then_named_trip_track(world: &mut AppWorld, title: String, username: String, expected: usize) {
    let user = world.user(&username);
    let trips = world
        .app_state()
        .trips
        .list_trips(&user)
        .await
        .expect("list trips");
    let trip = trips
        .into_iter()
        .find(|trip| trip.title == title)
        .unwrap_or_else(|| panic!("trip {title} not found"));
    assert_track_points(world, &trip, expected).await;
}

async fn assert_track_points(world: &AppWorld, trip: &TripView, expected: usize) {
    let owner = owner_of(world, trip.id).await;
    let track = world
        .app_state()
        .trips
        .trip_track(&owner, trip.id)
        .await
        .expect("trip track");
    assert_eq!(track_coordinates(&track).len(), expected);
}

async fn owner_of(world: &AppWorld, trip_id: i64) -> AuthenticatedUser {
    for user in world.users.values() {
        if world.app_state().trips.get_trip(user, trip_id).await.is_ok() {
            return user.clone();
        }
    }
    panic!("no registered user owns trip {trip_id}");
}

#[when("the stored GPX object of the last trip is deleted")]
async fn when_gpx_deleted(world: &mut AppWorld) {
    for key in stored_gpx_keys(world).await {
        world
            .app_state()
            .storage
            .delete_object(GPX_BUCKET, &key)
            .await
            .expect("delete object");
    }
}

#[when(regex = r#"^the stored GPX object of the last trip is overwritten with "([^"]*)"$"#)]
async fn when_gpx_corrupted(world: &mut AppWorld, contents: String) {
    for key in stored_gpx_keys(world).await {
        world
            .app_state()
            .storage
            .put_object(GPX_BUCKET, &key, contents.as_bytes())
            .await
            .expect("put object");
    }
}

async fn stored_gpx_keys(world: &AppWorld) -> Vec<String> {
    let trip_id = world.last_trip().id;
    let keys: Vec<String> = world
        .app_state()
        .storage
        .list_objects(GPX_BUCKET)
        .await
        .expect("list objects")
        .into_iter()
        .map(|object| object.key)
        .filter(|key| key.split('/').nth(1) == Some(trip_id.to_string().as_str()))
        .collect();
    assert!(!keys.is_empty(), "trip {trip_id} has no stored GPX object");
    keys
}

#[then(regex = r#"^"([^"]+)" gets an empty track for the last trip$"#)]
async fn then_empty_track(world: &mut AppWorld, username: String) {
    let user = world.user(&username);
    let trip_id = world.last_trip().id;
    let track = world
        .app_state()
        .trips
        .trip_track(&user, trip_id)
        .await
        .expect("trip track");
    assert!(track.features.is_empty(), "unexpected features: {:?}", track.features);
}

#[then(regex = r#"^"([^"]+)" cannot load the track of the last trip$"#)]
async fn then_track_not_found(world: &mut AppWorld, username: String) {
    let user = world.user(&username);
    let trip_id = world.last_trip().id;
    let result = world.app_state().trips.trip_track(&user, trip_id).await;
    assert!(matches!(result, Err(AppError::NotFound)), "expected not found");
}

#[then(regex = r#"^"([^"]+)" sees trips "([^"]*)"$"#)]
async fn then_user_sees_trips(world: &mut AppWorld, username: String, titles: String) {
    let user = world.user(&username);
    let trips = world
        .app_state()
        .trips
        .list_trips(&user)
        .await
        .expect("list trips");
    let seen: Vec<String> = trips.into_iter().map(|trip| trip.title).collect();
    assert_eq!(seen, split_list(&titles));
}

#[then(regex = r#"^"([^"]+)" cannot open the last trip$"#)]
async fn then_cannot_open(world: &mut AppWorld, username: String) {
    let user = world.user(&username);
    let trip_id = world.last_trip().id;
    let result = world.app_state().trips.get_trip(&user, trip_id).await;
    assert!(
        matches!(result, Err(AppError::NotFound)),
        "expected not found"
    );
}

#[then(regex = r#"^tag suggestions for "([^"]*)" are "([^"]*)"$"#)]
async fn then_tag_suggestions(world: &mut AppWorld, query: String, expected: String) {
    let names = world
        .app_state()
        .trips
        .tag_suggestions(Some(&query))
        .await
        .expect("tag suggestions");
    assert_eq!(names, split_list(&expected));
}

#[then(regex = r#"^no objects are stored in "([^"]+)"$"#)]
async fn then_bucket_empty(world: &mut AppWorld, bucket: String) {
    let objects = world
        .app_state()
        .storage
        .list_objects(&bucket)
        .await
        .expect("list objects");
    assert!(objects.is_empty(), "unexpected objects: {objects:?}");
}

#[when("I back up the application")]
async fn when_backup(world: &mut AppWorld) {
    let state = world.state.as_ref().expect("state must be initialised first");
    let out = state.root.path().join("backups");
    let report = state.backup_service().backup(&out).await.expect("backup");
    world.backup = Some(report);
}

#[then(regex = r"^the backup contains (\d+) trips, (\d+) photos and (\d+) tags$")]
async fn then_backup_counts(world: &mut AppWorld, trips: usize, photos: usize, tags: usize) {
    let report = world.backup.as_ref().expect("backup must exist");
    assert_eq!(report.trips, trips);
    assert_eq!(report.photos, photos);
    assert_eq!(report.tags, tags);
    for file in ["users.json", "trips.json", "photos.json", "tags.json", "trip_tags.json", "schema.sql"] {
        assert!(report.dir.join(file).exists(), "{file} missing from backup");
    }
}

#[then(regex = r#"^the backup manifest for "([^"]+)" lists (\d+) objects?$"#)]
async fn then_backup_manifest(world: &mut AppWorld, bucket: String, expected: usize) {
    let report = world.backup.as_ref().expect("backup must exist");
    let raw = std::fs::read(report.dir.join(format!("storage-{bucket}.json"))).expect("manifest");
    let manifest: Vec<ManifestEntry> = serde_json::from_slice(&raw).expect("manifest json");
    assert_eq!(manifest.len(), expected);
    for entry in &manifest {
        let copy: PathBuf = report.dir.join("objects").join(&bucket).join(&entry.key);
        assert!(copy.exists(), "object copy missing for {}", entry.key);
        assert!(entry.signed_url.is_some());
    }
}

#[when("I restore the backup into a fresh application state")]
async fn when_restore(world: &mut AppWorld) {
    let dir = world.backup.as_ref().expect("backup must exist").dir.clone();
    let fresh = TestState::new().await.expect("fresh state");
    let report = fresh.backup_service().restore(&dir).await.expect("restore");
    assert!(report.trips > 0);
    world.previous_state = world.state.replace(fresh);
    world.reload_users().await;
}

#[when("I restore the backup into the current application state")]
async fn when_restore_in_place(world: &mut AppWorld) {
    let dir = world.backup.as_ref().expect("backup must exist").dir.clone();
    let state = world.state.as_ref().expect("state must be initialised first");
    let report = state.backup_service().restore(&dir).await.expect("restore");
    assert_eq!(report.users, 0);
    assert_eq!(report.trips, 0);
    assert_eq!(report.photos, 0);
}

#[when(
    regex = r#"^I restore the backup into a fresh application state where "([^"]+)" with email "([^"]+)" has a trip "([^"]+)" tagged "([^"]*)"$"#
)]
async fn when_restore_next_to_account(
    world: &mut AppWorld,
    username: String,
    email: String,
    title: String,
    tags: String,
) {
    let dir = world.backup.as_ref().expect("backup must exist").dir.clone();
    world.switch_to_occupied_state(&username, &email).await;

    let mut input = trip_input(&title, "2024-03-01");
    input.tags = split_list(&tags);
    world.create_trip(&username, input).await;
    world.last_trip();

    let state = world.state.as_ref().expect("state must be initialised first");
    let result = state.backup_service().restore(&dir).await;
    let report = result.expect("restore");
    assert_eq!(report.users, 1);
    world.reload_users().await;
}

#[when(
    regex = r#"^I try to restore the backup into a fresh application state where "([^"]+)" with email "([^"]+)" is registered$"#
)]
async fn when_try_restore_over_account(world: &mut AppWorld, username: String, email: String) {
    let dir = world.backup.as_ref().expect("backup must exist").dir.clone();
    world.switch_to_occupied_state(&username, &email).await;

    let state = world.state.as_ref().expect("state must be initialised first");
    let result = state.backup_service().restore(&dir).await;
    match result {
        Ok(report) => panic!("restore unexpectedly succeeded: {report:?}"),
        Err(err) => world.last_error = Some(err.to_string()),
    }
}

#[then(regex = r#"^the restore fails with "([^"]+)"$"#)]
async fn then_restore_fails(world: &mut AppWorld, message: String) {
    assert_eq!(world.last_error.as_deref(), Some(message.as_str()));
}

#[then(regex = r#"^the trip "([^"]+)" of "([^"]+)" has tags "([^"]*)"$"#)]
async fn then_named_trip_tags(world: &mut AppWorld, title: String, username: String, tags: String) {
    let trip = find_trip(world, &username, &title).await;
    assert_eq!(trip.tags, split_list(&tags));
}

#[then(regex = r#"^the trip "([^"]+)" of "([^"]+)" has (\d+) photos?$"#)]
async fn then_named_trip_photos(world: &mut AppWorld, title: String, username: String, expected: usize) {
    let trip = find_trip(world, &username, &title).await;
    assert_eq!(trip.photos.len(), expected);
}

async fn find_trip(world: &AppWorld, username: &str, title: &str) -> TripView {
    let user = world.user(username);
    let trips = world
        .app_state()
        .trips
        .list_trips(&user)
        .await
        .expect("list trips");
    trips
        .into_iter()
        .find(|trip| trip.title == title)
        .unwrap_or_else(|| panic!("trip {title} not found for {username}"))
}

async fn register_user(world: &mut AppWorld, username: String, email: String, password: String) {
    let created = auth::register_user(world.app_state(), &username, &email, &password)
        .await
        .expect("register user");
    world.users.insert(created.username.clone(), created.clone());
    world.registered_user = Some(created);
}

#[tokio::main]
async fn main() {
    AppWorld::cucumber()
        .fail_on_skipped()
        .with_default_cli()
        .run("tests/features")
        .await;
}
