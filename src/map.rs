//! Map descriptions handed to the browser: tile providers, projected
//! features and the layer stack they are drawn in.

use serde::Serialize;

use crate::models::trip::{GeoPoint, TripView};

pub const DEFAULT_CENTER: GeoPoint = GeoPoint {
    lat: 49.7417517,
    lng: 15.3350758,
};
pub const OVERVIEW_ZOOM: u8 = 7;
pub const TRIP_ZOOM: u8 = 13;
pub const DEFAULT_TILES: &str = "turist";

const MAX_MERCATOR_LAT: f64 = 85.051_128_78;
const EARTH_RADIUS: f64 = 6_378_137.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TileProvider {
    pub id: &'static str,
    pub name: &'static str,
    pub url_template: &'static str,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub attribution: &'static str,
}

pub static TILE_PROVIDERS: [TileProvider; 4] = [
    TileProvider {
        id: "base",
        name: "Mapy.cz base",
        url_template: "https://mapserver.mapy.cz/base-m/{z}-{x}-{y}",
        min_zoom: 1,
        max_zoom: 19,
        attribution: "© Seznam.cz, a.s., © OpenStreetMap contributors",
    },
    TileProvider {
        id: "turist",
        name: "Mapy.cz tourist",
        url_template: "https://mapserver.mapy.cz/turist-m/{z}-{x}-{y}",
        min_zoom: 1,
        max_zoom: 19,
        attribution: "© Seznam.cz, a.s., © OpenStreetMap contributors",
    },
    TileProvider {
        id: "aerial",
        name: "Mapy.cz aerial",
        url_template: "https://mapserver.mapy.cz/ophoto-m/{z}-{x}-{y}",
        min_zoom: 1,
        max_zoom: 19,
        attribution: "© Seznam.cz, a.s.",
    },
    TileProvider {
        id: "osm",
        name: "OpenStreetMap",
        url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
        min_zoom: 0,
        max_zoom: 19,
        attribution: "© OpenStreetMap contributors",
    },
];

pub fn tile_provider(id: &str) -> Option<&'static TileProvider> {
    TILE_PROVIDERS.iter().find(|provider| provider.id == id)
}

/// EPSG:4326 to EPSG:3857 (web mercator) metres.
pub fn to_web_mercator(lon: f64, lat: f64) -> [f64; 2] {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    [x, y]
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TripPopup {
    pub trip_id: i64,
    pub title: String,
    pub date: String,
    pub description: Option<String>,
    pub cover_photo_url: Option<String>,
    pub tags: Vec<String>,
    pub location: Option<String>,
}

impl TripPopup {
    pub fn from_trip(trip: &TripView) -> Self {
        Self {
            trip_id: trip.id,
            title: trip.title.clone(),
            date: trip.display_date.clone(),
            description: trip.description.clone(),
            cover_photo_url: trip.cover_photo().map(|photo| photo.url.clone()),
            tags: trip.tags.clone(),
            location: trip.location.map(|point| point.display(4)),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MapFeature {
    Marker {
        trip_id: i64,
        position: [f64; 2],
        popup: TripPopup,
    },
    Path {
        trip_id: i64,
        coordinates: Vec<[f64; 2]>,
        popup: TripPopup,
    },
    Track {
        trip_id: i64,
        coordinates: Vec<[f64; 2]>,
        popup: TripPopup,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Marker,
    Path,
    Track,
}

impl LayerKind {
    /// Lines are drawn below markers.
    pub fn z_index(self) -> u8 {
        match self {
            LayerKind::Path | LayerKind::Track => 1,
            LayerKind::Marker => 2,
        }
    }
}

impl MapFeature {
    pub fn trip_id(&self) -> i64 {
        match self {
            MapFeature::Marker { trip_id, .. }
            | MapFeature::Path { trip_id, .. }
            | MapFeature::Track { trip_id, .. } => *trip_id,
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            MapFeature::Marker { .. } => LayerKind::Marker,
            MapFeature::Path { .. } => LayerKind::Path,
            MapFeature::Track { .. } => LayerKind::Track,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MapLayer {
    pub trip_id: i64,
    pub kind: LayerKind,
    pub z_index: u8,
    pub feature: MapFeature,
    #[serde(skip)]
    seq: u64,
}

/// Layers keyed by `(trip_id, kind)`. Mounting a key twice replaces the
/// earlier layer, so re-rendering a trip never stacks duplicate lines.
#[derive(Debug, Clone, Default)]
pub struct LayerSet {
    layers: Vec<MapLayer>,
    next_seq: u64,
}

impl LayerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, feature: MapFeature) {
        let trip_id = feature.trip_id();
        let kind = feature.kind();
        self.unmount(trip_id, kind);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.layers.push(MapLayer {
            trip_id,
            kind,
            z_index: kind.z_index(),
            feature,
            seq,
        });
    }

    pub fn unmount(&mut self, trip_id: i64, kind: LayerKind) -> Option<MapLayer> {
        let idx = self
            .layers
            .iter()
            .position(|layer| layer.trip_id == trip_id && layer.kind == kind)?;
        Some(self.layers.remove(idx))
    }

    pub fn unmount_trip(&mut self, trip_id: i64) {
        self.layers.retain(|layer| layer.trip_id != trip_id);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Draw order: z-index, then mount order.
    pub fn ordered(&self) -> Vec<&MapLayer> {
        let mut ordered: Vec<&MapLayer> = self.layers.iter().collect();
        ordered.sort_by_key(|layer| (layer.z_index, layer.seq));
        ordered
    }

    pub fn into_ordered(self) -> Vec<MapLayer> {
        let mut layers = self.layers;
        layers.sort_by_key(|layer| (layer.z_index, layer.seq));
        layers
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MapView {
    pub center: GeoPoint,
    pub center_mercator: [f64; 2],
    pub zoom: u8,
    pub tiles: &'static TileProvider,
    pub alternatives: Vec<&'static TileProvider>,
    pub layers: Vec<MapLayer>,
}

impl MapView {
    fn new(center: GeoPoint, zoom: u8, layers: LayerSet) -> Self {
        let tiles = tile_provider(DEFAULT_TILES).unwrap_or(&TILE_PROVIDERS[0]);
        Self {
            center,
            center_mercator: to_web_mercator(center.lng, center.lat),
            zoom,
            tiles,
            alternatives: TILE_PROVIDERS
                .iter()
                .filter(|provider| provider.id != tiles.id)
                .collect(),
            layers: layers.into_ordered(),
        }
    }

    /// All mappable trips: markers at their location, stored paths as lines.
    pub fn overview(trips: &[TripView]) -> Self {
        let mut layers = LayerSet::new();
        let mut located = Vec::new();

        for trip in trips.iter().filter(|trip| trip.is_mappable()) {
            let popup = TripPopup::from_trip(trip);
            if let Some(location) = trip.location {
                located.push(location);
                layers.mount(MapFeature::Marker {
                    trip_id: trip.id,
                    position: [location.lng, location.lat],
                    popup: popup.clone(),
                });
            }
            if !trip.trip_path.is_empty() {
                layers.mount(MapFeature::Path {
                    trip_id: trip.id,
                    coordinates: trip.trip_path.clone(),
                    popup,
                });
            }
        }

        let center = mean_point(&located).unwrap_or(DEFAULT_CENTER);
        Self::new(center, OVERVIEW_ZOOM, layers)
    }

    /// A single trip with its full GPX track when one was loaded.
    pub fn for_trip(trip: &TripView, track: Vec<[f64; 2]>) -> Self {
        let mut layers = LayerSet::new();
        let popup = TripPopup::from_trip(trip);

        if let Some(location) = trip.location {
            layers.mount(MapFeature::Marker {
                trip_id: trip.id,
                position: [location.lng, location.lat],
                popup: popup.clone(),
            });
        }

        let first_line_point = track.first().or_else(|| trip.trip_path.first()).copied();
        if !track.is_empty() {
            layers.mount(MapFeature::Track {
                trip_id: trip.id,
                coordinates: track,
                popup,
            });
        } else if !trip.trip_path.is_empty() {
            layers.mount(MapFeature::Path {
                trip_id: trip.id,
                coordinates: trip.trip_path.clone(),
                popup,
            });
        }

        let center = trip
            .location
            .or_else(|| first_line_point.map(|[lng, lat]| GeoPoint { lat, lng }))
            .unwrap_or(DEFAULT_CENTER);
        Self::new(center, TRIP_ZOOM, layers)
    }
}

fn mean_point(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.lat).sum::<f64>() / n;
    let lng = points.iter().map(|p| p.lng).sum::<f64>() / n;
    Some(GeoPoint { lat, lng })
}
