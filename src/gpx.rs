//! GPX to GeoJSON conversion.
//!
//! Tracks become `LineString` (one segment) or `MultiLineString` features,
//! routes become `LineString` features and waypoints become `Point` features.
//! Coordinates follow GeoJSON order: `[lon, lat]` or `[lon, lat, ele]`.

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GpxError {
    #[error("error parsing GPX XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("error parsing GPX attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("document root is not <gpx>")]
    NotGpx,
    #[error("GPX document ends inside <{0}>")]
    Truncated(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeatureCollectionType {
    #[default]
    FeatureCollection,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeatureType {
    #[default]
    Feature,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: FeatureCollectionType,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureType,
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Vec<f64>),
    LineString(Vec<Vec<f64>>),
    MultiLineString(Vec<Vec<Vec<f64>>>),
}

#[derive(Debug, Default)]
struct Props {
    name: Option<String>,
    desc: Option<String>,
    kind: Option<String>,
    time: Option<String>,
}

impl Props {
    fn set(&mut self, field: &str, text: String) {
        match field {
            "name" => self.name = Some(text),
            "desc" => self.desc = Some(text),
            "type" => self.kind = Some(text),
            "time" => self.time = Some(text),
            _ => {}
        }
    }

    fn into_map(self, gpx_type: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("_gpxType".into(), Value::from(gpx_type));
        for (key, value) in [
            ("name", self.name),
            ("desc", self.desc),
            ("type", self.kind),
            ("time", self.time),
        ] {
            if let Some(value) = value {
                map.insert(key.into(), Value::from(value));
            }
        }
        map
    }
}

#[derive(Debug)]
struct PointBuilder {
    coords: Option<(f64, f64)>,
    ele: Option<f64>,
    props: Props,
}

impl PointBuilder {
    fn from_element(element: &BytesStart<'_>) -> Result<Self, GpxError> {
        let mut lat = None;
        let mut lon = None;
        for attr in element.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?;
            match attr.key.local_name().as_ref() {
                b"lat" => lat = value.trim().parse::<f64>().ok(),
                b"lon" => lon = value.trim().parse::<f64>().ok(),
                _ => {}
            }
        }
        let coords = match (lat, lon) {
            (Some(lat), Some(lon))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) =>
            {
                Some((lon, lat))
            }
            _ => None,
        };
        Ok(Self {
            coords,
            ele: None,
            props: Props::default(),
        })
    }

    fn set(&mut self, field: &str, text: String) {
        if field == "ele" {
            self.ele = text.trim().parse().ok();
        } else {
            self.props.set(field, text);
        }
    }

    fn finish(self) -> Option<TrackPoint> {
        let (lon, lat) = self.coords?;
        let mut coordinate = vec![lon, lat];
        if let Some(ele) = self.ele {
            coordinate.push(ele);
        }
        Some(TrackPoint {
            coordinate,
            props: self.props,
        })
    }
}

#[derive(Debug)]
struct TrackPoint {
    coordinate: Vec<f64>,
    props: Props,
}

#[derive(Debug, Default)]
struct LineBuilder {
    props: Props,
    segments: Vec<Vec<TrackPoint>>,
    current: Vec<TrackPoint>,
}

impl LineBuilder {
    fn close_segment(&mut self) {
        let segment = std::mem::take(&mut self.current);
        if segment.len() >= 2 {
            self.segments.push(segment);
        }
    }

    fn into_track_feature(mut self) -> Option<Feature> {
        self.close_segment();
        if self.segments.is_empty() {
            return None;
        }
        let mut properties = self.props.into_map("trk");
        let all_timed = self
            .segments
            .iter()
            .flatten()
            .all(|point| point.props.time.is_some());

        let geometry = if self.segments.len() == 1 {
            let segment = self.segments.remove(0);
            if all_timed {
                properties.insert(
                    "coordinateProperties".into(),
                    serde_json::json!({ "times": segment_times(&segment) }),
                );
            }
            Geometry::LineString(segment.into_iter().map(|p| p.coordinate).collect())
        } else {
            if all_timed {
                let times: Vec<Vec<String>> = self.segments.iter().map(|s| segment_times(s)).collect();
                properties.insert(
                    "coordinateProperties".into(),
                    serde_json::json!({ "times": times }),
                );
            }
            Geometry::MultiLineString(
                self.segments
                    .into_iter()
                    .map(|segment| segment.into_iter().map(|p| p.coordinate).collect())
                    .collect(),
            )
        };

        Some(Feature {
            kind: FeatureType::Feature,
            geometry,
            properties,
        })
    }

    fn into_route_feature(self) -> Option<Feature> {
        if self.current.len() < 2 {
            return None;
        }
        let all_timed = self.current.iter().all(|p| p.props.time.is_some());
        let mut properties = self.props.into_map("rte");
        if all_timed {
            properties.insert(
                "coordinateProperties".into(),
                serde_json::json!({ "times": segment_times(&self.current) }),
            );
        }
        Some(Feature {
            kind: FeatureType::Feature,
            geometry: Geometry::LineString(self.current.into_iter().map(|p| p.coordinate).collect()),
            properties,
        })
    }
}

fn segment_times(segment: &[TrackPoint]) -> Vec<String> {
    segment
        .iter()
        .filter_map(|point| point.props.time.clone())
        .collect()
}

/// Which builder receives `<name>`, `<ele>`, etc. text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Point,
    Line,
    None,
}

#[derive(Default)]
struct Converter {
    stack: Vec<String>,
    track: Option<LineBuilder>,
    route: Option<LineBuilder>,
    point: Option<(String, PointBuilder)>,
    features: Vec<Feature>,
    saw_root: bool,
}

impl Converter {
    fn owner(&self) -> Owner {
        if self.point.is_some() {
            Owner::Point
        } else if self.track.is_some() || self.route.is_some() {
            Owner::Line
        } else {
            Owner::None
        }
    }

    fn open(&mut self, element: &BytesStart<'_>) -> Result<(), GpxError> {
        let name = local_name(element);
        if !self.saw_root {
            if name != "gpx" {
                return Err(GpxError::NotGpx);
            }
            self.saw_root = true;
        }
        match name.as_str() {
            "trk" => self.track = Some(LineBuilder::default()),
            "rte" => self.route = Some(LineBuilder::default()),
            "trkseg" => {
                if let Some(track) = self.track.as_mut() {
                    track.close_segment();
                }
            }
            "trkpt" | "rtept" | "wpt" => {
                self.point = Some((name.clone(), PointBuilder::from_element(element)?));
            }
            _ => {}
        }
        self.stack.push(name);
        Ok(())
    }

    fn close(&mut self, name: &str) {
        self.stack.pop();
        match name {
            "trkpt" | "rtept" | "wpt" => {
                let Some((kind, builder)) = self.point.take() else {
                    return;
                };
                let Some(point) = builder.finish() else {
                    debug!("skipping {kind} without usable lat/lon");
                    return;
                };
                match kind.as_str() {
                    "trkpt" => {
                        if let Some(track) = self.track.as_mut() {
                            track.current.push(point);
                        }
                    }
                    "rtept" => {
                        if let Some(route) = self.route.as_mut() {
                            route.current.push(point);
                        }
                    }
                    _ => self.features.push(Feature {
                        kind: FeatureType::Feature,
                        geometry: Geometry::Point(point.coordinate),
                        properties: point.props.into_map("wpt"),
                    }),
                }
            }
            "trkseg" => {
                if let Some(track) = self.track.as_mut() {
                    track.close_segment();
                }
            }
            "trk" => {
                if let Some(feature) = self.track.take().and_then(LineBuilder::into_track_feature) {
                    self.features.push(feature);
                }
            }
            "rte" => {
                if let Some(feature) = self.route.take().and_then(LineBuilder::into_route_feature) {
                    self.features.push(feature);
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: String) {
        let Some(field) = self.stack.last().map(String::as_str) else {
            return;
        };
        if !matches!(field, "name" | "desc" | "type" | "time" | "ele") {
            return;
        }
        // Only direct children of trk/rte/point carry properties.
        let parent = self
            .stack
            .len()
            .checked_sub(2)
            .and_then(|idx| self.stack.get(idx))
            .cloned();
        let field = field.to_string();
        match (self.owner(), parent.as_deref()) {
            (Owner::Point, Some("trkpt" | "rtept" | "wpt")) => {
                if let Some((_, point)) = self.point.as_mut() {
                    point.set(&field, text);
                }
            }
            (Owner::Line, Some("trk")) => {
                if let Some(track) = self.track.as_mut() {
                    track.props.set(&field, text);
                }
            }
            (Owner::Line, Some("rte")) => {
                if let Some(route) = self.route.as_mut() {
                    route.props.set(&field, text);
                }
            }
            _ => {}
        }
    }
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

pub fn gpx_to_geojson(xml: &str) -> Result<FeatureCollection, GpxError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut converter = Converter::default();
    loop {
        match reader.read_event()? {
            Event::Start(element) => converter.open(&element)?,
            Event::Empty(element) => {
                converter.open(&element)?;
                let name = local_name(&element);
                converter.close(&name);
            }
            Event::End(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                converter.close(&name);
            }
            Event::Text(text) => {
                let text = text.unescape()?.into_owned();
                converter.text(text);
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                converter.text(text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !converter.saw_root {
        return Err(GpxError::NotGpx);
    }
    if let Some(open) = converter.stack.last() {
        return Err(GpxError::Truncated(open.clone()));
    }

    Ok(FeatureCollection {
        kind: FeatureCollectionType::FeatureCollection,
        features: converter.features,
    })
}

/// `[lon, lat]` pairs of the first line feature, segments concatenated.
pub fn track_coordinates(collection: &FeatureCollection) -> Vec<[f64; 2]> {
    let to_pair = |c: &Vec<f64>| match c.as_slice() {
        [lon, lat, ..] => Some([*lon, *lat]),
        _ => None,
    };
    collection
        .features
        .iter()
        .find_map(|feature| match &feature.geometry {
            Geometry::LineString(coords) => Some(coords.iter().filter_map(to_pair).collect()),
            Geometry::MultiLineString(lines) => {
                Some(lines.iter().flatten().filter_map(to_pair).collect())
            }
            Geometry::Point(_) => None,
        })
        .unwrap_or_default()
}

/// Display path: conversion failures are logged and produce an empty track.
pub fn track_from_gpx(xml: &str) -> Vec<[f64; 2]> {
    match gpx_to_geojson(xml) {
        Ok(collection) => track_coordinates(&collection),
        Err(err) => {
            warn!("error converting GPX to GeoJSON: {err}");
            Vec::new()
        }
    }
}

/// Evenly down-samples a path, always keeping both endpoints.
pub fn simplify_path(coords: &[[f64; 2]], max_points: usize) -> Vec<[f64; 2]> {
    if coords.len() <= max_points || max_points < 2 {
        return coords.to_vec();
    }
    let last = coords.len() - 1;
    let step = last as f64 / (max_points - 1) as f64;
    (0..max_points)
        .map(|i| {
            let idx = ((i as f64) * step).round() as usize;
            coords[idx.min(last)]
        })
        .collect()
}
