use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, NoneAsEmptyString};
use tracing::{debug, warn};

use crate::{
    auth::CurrentUser,
    dates::format_date_for_input,
    error::AppError,
    gpx::{track_coordinates, FeatureCollection},
    map::MapView,
    models::{photo::PhotoView, tag::parse_tag_list, tag::PopularTag, trip::TripView},
    services::trips::{CreateTripInput, UploadedFile},
    state::AppState,
};

const DASHBOARD_LATEST: usize = 3;
const DASHBOARD_POPULAR_TAGS: i64 = 10;
const EXCERPT_CHARS: usize = 160;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(dashboard))
        .route("/trips", get(trips_list))
        .route("/trips/new", get(trip_new_form).post(trip_new_submit))
        .route("/trips/:id", get(trip_detail))
        .route("/trips/:id/track", get(trip_track))
        .route("/trips/:id/map", get(trip_map))
        .route("/map", get(overview_map))
        .route("/api/trips", get(api_trips))
        .route("/api/trips/:id", get(api_trip))
        .route("/tags", get(tag_suggestions))
        .route("/geocode", get(geocode))
        .route("/rgeocode", get(reverse_geocode))
}

/// Trip summary as shown in lists and on the dashboard.
#[derive(Clone)]
struct TripCard {
    id: i64,
    title: String,
    display_date: String,
    cover_url: Option<String>,
    excerpt: Option<String>,
    location: Option<String>,
    has_track: bool,
    tags: Vec<String>,
}

impl From<&TripView> for TripCard {
    fn from(trip: &TripView) -> Self {
        Self {
            id: trip.id,
            title: trip.title.clone(),
            display_date: trip.display_date.clone(),
            cover_url: trip.cover_photo().map(|photo| photo.url.clone()),
            excerpt: trip.description.as_deref().map(excerpt),
            location: trip.location.map(|point| point.display(4)),
            has_track: trip.has_track,
            tags: trip.tags.clone(),
        }
    }
}

#[derive(Template)]
#[template(path = "user/dashboard.html")]
struct DashboardTemplate {
    display_name: String,
    trip_count: usize,
    latest: Vec<TripCard>,
    popular_tags: Vec<PopularTag>,
}

async fn dashboard(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let trips = state.trips.list_trips(user).await?;
    let popular_tags = state.trips.popular_tags(DASHBOARD_POPULAR_TAGS).await?;
    Ok(AskamaTemplateResponse::into_response(DashboardTemplate {
        display_name: user.username.clone(),
        trip_count: trips.len(),
        latest: trips.iter().take(DASHBOARD_LATEST).map(TripCard::from).collect(),
        popular_tags,
    }))
}

#[derive(Template)]
#[template(path = "user/trips_list.html")]
struct TripsListTemplate {
    trips: Vec<TripCard>,
}

#[derive(Template)]
#[template(path = "user/trips_map.html")]
struct TripsMapTemplate {
    trip_count: usize,
    mappable_count: usize,
}

#[derive(Deserialize)]
struct TripsQuery {
    view: Option<String>,
}

async fn trips_list(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<TripsQuery>,
) -> Result<Response, AppError> {
    let user = current.require_user()?;
    let trips = state.trips.list_trips(user).await?;

    if query.view.as_deref() == Some("map") {
        return Ok(AskamaTemplateResponse::into_response(TripsMapTemplate {
            trip_count: trips.len(),
            mappable_count: trips.iter().filter(|trip| trip.is_mappable()).count(),
        }));
    }

    Ok(AskamaTemplateResponse::into_response(TripsListTemplate {
        trips: trips.iter().map(TripCard::from).collect(),
    }))
}

#[derive(Template, Default)]
#[template(path = "user/trip_new.html")]
struct TripNewTemplate {
    show_error: bool,
    error_message: String,
    title: String,
    trip_date: String,
    description: String,
    lat: String,
    lng: String,
    tags: String,
}

async fn trip_new_form(current: CurrentUser) -> Result<impl IntoResponse, AppError> {
    current.require_user()?;
    Ok(AskamaTemplateResponse::into_response(TripNewTemplate {
        trip_date: format_date_for_input(None, Local::now().date_naive()),
        ..Default::default()
    }))
}

/// Raw text fields of the new trip form, echoed back when it is re-rendered.
#[derive(Default)]
struct NewTripFields {
    title: String,
    trip_date: String,
    description: String,
    lat: String,
    lng: String,
    tags: String,
}

impl NewTripFields {
    fn into_template(self, message: String) -> TripNewTemplate {
        TripNewTemplate {
            show_error: true,
            error_message: message,
            title: self.title,
            trip_date: self.trip_date,
            description: self.description,
            lat: self.lat,
            lng: self.lng,
            tags: self.tags,
        }
    }
}

async fn trip_new_submit(
    State(state): State<AppState>,
    current: CurrentUser,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let user = current.require_user()?;

    let mut fields = NewTripFields::default();
    let (photos, gpx_file) = match read_trip_form(&mut multipart, &mut fields).await {
        Ok(uploads) => uploads,
        Err(err) => return new_trip_error(fields, err),
    };

    let coordinates = parse_coordinate(&fields.lat, "Latitude")
        .and_then(|lat| Ok((lat, parse_coordinate(&fields.lng, "Longitude")?)));
    let (latitude, longitude) = match coordinates {
        Ok(pair) => pair,
        Err(err) => return new_trip_error(fields, err),
    };

    let input = CreateTripInput {
        title: fields.title.clone(),
        description: Some(fields.description.clone()),
        trip_date: Some(fields.trip_date.clone()),
        latitude,
        longitude,
        tags: parse_tag_list(&fields.tags),
        photos,
        gpx_file,
    };

    match state.trips.create_trip(user, input).await {
        Ok(trip) => Ok(Redirect::to(&format!("/me/trips/{}", trip.id)).into_response()),
        Err(err) => new_trip_error(fields, err),
    }
}

/// Reads the multipart body, filling `fields` as it goes so a failure part
/// way through can still echo what was entered.
async fn read_trip_form(
    multipart: &mut Multipart,
    fields: &mut NewTripFields,
) -> Result<(Vec<UploadedFile>, Option<UploadedFile>), AppError> {
    let mut photos = Vec::new();
    let mut gpx_file = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "photos" | "gpx_file" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                if file_name.is_empty() && bytes.is_empty() {
                    continue;
                }
                let upload = UploadedFile { file_name, bytes };
                if name == "photos" {
                    photos.push(upload);
                } else {
                    gpx_file = Some(upload);
                }
            }
            "title" => fields.title = field.text().await.map_err(multipart_error)?,
            "trip_date" => fields.trip_date = field.text().await.map_err(multipart_error)?,
            "description" => fields.description = field.text().await.map_err(multipart_error)?,
            "lat" => fields.lat = field.text().await.map_err(multipart_error)?,
            "lng" => fields.lng = field.text().await.map_err(multipart_error)?,
            "tags" => fields.tags = field.text().await.map_err(multipart_error)?,
            other => debug!("ignoring unknown form field {other}"),
        }
    }
    Ok((photos, gpx_file))
}

/// Form mistakes re-render the form; anything else is a server error.
fn new_trip_error(fields: NewTripFields, err: AppError) -> Result<Response, AppError> {
    match err {
        AppError::BadRequest(msg) => Ok(render_new_trip_error(fields, msg, StatusCode::BAD_REQUEST)),
        AppError::PayloadTooLarge => Ok(render_new_trip_error(
            fields,
            "The uploaded files are too large".into(),
            StatusCode::PAYLOAD_TOO_LARGE,
        )),
        err => Err(err),
    }
}

fn render_new_trip_error(fields: NewTripFields, message: String, status: StatusCode) -> Response {
    (
        status,
        AskamaTemplateResponse::into_response(fields.into_template(message)),
    )
        .into_response()
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        warn!("rejected multipart body: {err}");
        AppError::BadRequest(format!("Could not read the submitted form: {}", err.body_text()))
    }
}

fn parse_coordinate(raw: &str, label: &str) -> Result<Option<f64>, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| AppError::BadRequest(format!("{label} must be a number")))
}

#[derive(Template)]
#[template(path = "user/trip_detail.html")]
struct TripDetailTemplate {
    trip: TripCard,
    description: Option<String>,
    photos: Vec<PhotoView>,
}

async fn trip_detail(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let trip = state.trips.get_trip(user, trip_id).await?;
    Ok(AskamaTemplateResponse::into_response(TripDetailTemplate {
        trip: TripCard::from(&trip),
        description: trip.description,
        photos: trip.photos,
    }))
}

async fn trip_track(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<i64>,
) -> Result<Json<FeatureCollection>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.trips.trip_track(user, trip_id).await?))
}

async fn trip_map(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<i64>,
) -> Result<Json<MapView>, AppError> {
    let user = current.require_user()?;
    let trip = state.trips.get_trip(user, trip_id).await?;
    let track = if trip.has_track {
        track_coordinates(&state.trips.trip_track(user, trip_id).await?)
    } else {
        Vec::new()
    };
    Ok(Json(MapView::for_trip(&trip, track)))
}

async fn overview_map(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<MapView>, AppError> {
    let user = current.require_user()?;
    let trips = state.trips.list_trips(user).await?;
    Ok(Json(MapView::overview(&trips)))
}

async fn api_trips(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<TripView>>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.trips.list_trips(user).await?))
}

async fn api_trip(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(trip_id): Path<i64>,
) -> Result<Json<TripView>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.trips.get_trip(user, trip_id).await?))
}

#[serde_as]
#[derive(Deserialize)]
struct TagQuery {
    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    q: Option<String>,
}

async fn tag_suggestions(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<TagQuery>,
) -> Result<Json<Vec<String>>, AppError> {
    current.require_user()?;
    Ok(Json(state.trips.tag_suggestions(query.q.as_deref()).await?))
}

#[derive(Deserialize)]
struct GeocodeQuery {
    query: String,
}

async fn geocode(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<GeocodeQuery>,
) -> Result<Json<Value>, AppError> {
    current.require_user()?;
    let text = query.query.trim();
    if text.is_empty() {
        return Err(AppError::BadRequest("Missing search query".into()));
    }
    Ok(Json(state.geocode.geocode(text).await?))
}

#[derive(Deserialize)]
struct ReverseGeocodeQuery {
    lat: f64,
    lon: f64,
}

async fn reverse_geocode(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<ReverseGeocodeQuery>,
) -> Result<Json<Value>, AppError> {
    current.require_user()?;
    Ok(Json(state.geocode.reverse_geocode(query.lat, query.lon).await?))
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}
