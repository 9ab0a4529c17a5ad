//! Shared-topology encoding of feature collections.
//!
//! Produces TopoJSON-shaped documents: coordinates are quantized onto an
//! integer grid spanning the collection's bounding box, every line and ring
//! becomes a delta-encoded arc, and identical arcs (in either direction) are
//! stored once and referenced by index.

use geo::{BoundingRect, Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon, Rect};
use hashbrown::HashMap;
use serde_json::{json, Map, Value};

use crate::error::ArtifactError;
use crate::models::FeatureCollection;

/// Name of the single object every encoded topology contains.
pub const OBJECT_NAME: &str = "data";

/// Grid resolution used when none is configured.
pub const DEFAULT_QUANTIZATION: u32 = 1_000_000;

/// Converts a feature collection into its topology companion.
pub trait TopologyEncoder: Send + Sync {
    fn encode(&self, collection: &FeatureCollection) -> Result<Value, ArtifactError>;
}

/// Quantizing encoder with whole-arc deduplication.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedTopology {
    quantization: u32,
}

impl Default for QuantizedTopology {
    fn default() -> Self {
        Self::new(DEFAULT_QUANTIZATION)
    }
}

impl QuantizedTopology {
    pub fn new(quantization: u32) -> Self {
        Self {
            quantization: quantization.max(2),
        }
    }
}

impl TopologyEncoder for QuantizedTopology {
    fn encode(&self, collection: &FeatureCollection) -> Result<Value, ArtifactError> {
        let mut parsed = Vec::with_capacity(collection.features.len());
        for (idx, feature) in collection.features.iter().enumerate() {
            let geometry = match feature.get("geometry") {
                None | Some(Value::Null) => None,
                Some(g) => Some(parse_geometry(g).map_err(|e| {
                    ArtifactError::Topology(format!("feature {}: {}", idx, e))
                })?),
            };
            parsed.push((feature, geometry));
        }

        let bbox = parsed
            .iter()
            .filter_map(|(_, g)| g.as_ref().and_then(|g| g.bounding_rect()))
            .reduce(merge_rect);

        let grid = Grid::new(bbox, self.quantization);
        let mut arcs = ArcTable::default();

        let geometries: Vec<Value> = parsed
            .iter()
            .map(|(feature, geometry)| {
                let mut object = match geometry {
                    Some(g) => encode_geometry(g, &grid, &mut arcs),
                    None => json!({ "type": Value::Null }),
                };
                if let Some(id) = feature.get("id") {
                    object["id"] = id.clone();
                }
                if let Some(props) = feature.get("properties").filter(|p| !p.is_null()) {
                    object["properties"] = props.clone();
                }
                object
            })
            .collect();

        let mut topology = json!({
            "type": "Topology",
            "objects": {
                OBJECT_NAME: {
                    "type": "GeometryCollection",
                    "geometries": geometries,
                }
            },
            "arcs": arcs.into_json(),
        });
        if let Some(rect) = bbox {
            topology["bbox"] = json!([rect.min().x, rect.min().y, rect.max().x, rect.max().y]);
            topology["transform"] = json!({
                "scale": [grid.kx, grid.ky],
                "translate": [grid.x0, grid.y0],
            });
        }
        Ok(topology)
    }
}

fn merge_rect(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

struct Grid {
    x0: f64,
    y0: f64,
    kx: f64,
    ky: f64,
}

impl Grid {
    fn new(bbox: Option<Rect<f64>>, quantization: u32) -> Self {
        let Some(rect) = bbox else {
            return Self { x0: 0.0, y0: 0.0, kx: 1.0, ky: 1.0 };
        };
        let steps = f64::from(quantization - 1);
        let span = |lo: f64, hi: f64| if hi > lo { (hi - lo) / steps } else { 1.0 };
        Self {
            x0: rect.min().x,
            y0: rect.min().y,
            kx: span(rect.min().x, rect.max().x),
            ky: span(rect.min().y, rect.max().y),
        }
    }

    fn quantize(&self, c: Coord<f64>) -> [i64; 2] {
        [
            ((c.x - self.x0) / self.kx).round() as i64,
            ((c.y - self.y0) / self.ky).round() as i64,
        ]
    }

    /// Quantize a line, dropping points that collapse onto their predecessor.
    fn quantize_line(&self, line: &LineString<f64>) -> Vec<[i64; 2]> {
        let mut points: Vec<[i64; 2]> = Vec::with_capacity(line.0.len());
        for c in &line.0 {
            let q = self.quantize(*c);
            if points.last() != Some(&q) {
                points.push(q);
            }
        }
        if points.len() == 1 {
            points.push(points[0]);
        }
        points
    }
}

/// Arcs stored once each; lookups match either direction.
#[derive(Default)]
struct ArcTable {
    arcs: Vec<Vec<[i64; 2]>>,
    index: HashMap<Vec<[i64; 2]>, usize>,
}

impl ArcTable {
    /// Index of the arc, or its one's complement when stored reversed.
    fn insert(&mut self, points: Vec<[i64; 2]>) -> i64 {
        if let Some(&idx) = self.index.get(&points) {
            return idx as i64;
        }
        let mut reversed = points.clone();
        reversed.reverse();
        if let Some(&idx) = self.index.get(&reversed) {
            return !(idx as i64);
        }
        let idx = self.arcs.len();
        self.index.insert(points.clone(), idx);
        self.arcs.push(points);
        idx as i64
    }

    fn into_json(self) -> Value {
        let arcs: Vec<Value> = self
            .arcs
            .into_iter()
            .map(|arc| {
                let mut prev = [0i64, 0i64];
                let deltas: Vec<Value> = arc
                    .into_iter()
                    .map(|p| {
                        let d = json!([p[0] - prev[0], p[1] - prev[1]]);
                        prev = p;
                        d
                    })
                    .collect();
                Value::Array(deltas)
            })
            .collect();
        Value::Array(arcs)
    }
}

fn encode_geometry(geometry: &Geometry<f64>, grid: &Grid, arcs: &mut ArcTable) -> Value {
    let mut line_arcs = |line: &LineString<f64>| arcs.insert(grid.quantize_line(line));

    match geometry {
        Geometry::Point(p) => json!({ "type": "Point", "coordinates": grid.quantize(p.0) }),
        Geometry::MultiPoint(mp) => {
            let coords: Vec<[i64; 2]> = mp.0.iter().map(|p| grid.quantize(p.0)).collect();
            json!({ "type": "MultiPoint", "coordinates": coords })
        }
        Geometry::LineString(line) => {
            json!({ "type": "LineString", "arcs": [line_arcs(line)] })
        }
        Geometry::MultiLineString(mls) => {
            let lines: Vec<Vec<i64>> = mls.0.iter().map(|l| vec![line_arcs(l)]).collect();
            json!({ "type": "MultiLineString", "arcs": lines })
        }
        Geometry::Polygon(poly) => {
            json!({ "type": "Polygon", "arcs": polygon_arcs(poly, &mut line_arcs) })
        }
        Geometry::MultiPolygon(mp) => {
            let polys: Vec<Vec<Vec<i64>>> = mp
                .0
                .iter()
                .map(|poly| polygon_arcs(poly, &mut line_arcs))
                .collect();
            json!({ "type": "MultiPolygon", "arcs": polys })
        }
        // Parsing never produces the remaining variants.
        _ => json!({ "type": Value::Null }),
    }
}

fn polygon_arcs(poly: &Polygon<f64>, line_arcs: &mut impl FnMut(&LineString<f64>) -> i64) -> Vec<Vec<i64>> {
    std::iter::once(poly.exterior())
        .chain(poly.interiors())
        .map(|ring| vec![line_arcs(ring)])
        .collect()
}

fn parse_geometry(value: &Value) -> Result<Geometry<f64>, String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry without type")?;
    let coords = || value.get("coordinates").ok_or(format!("{} without coordinates", kind));

    match kind {
        "Point" => Ok(Geometry::Point(Point(parse_coord(coords()?)?))),
        "MultiPoint" => Ok(Geometry::MultiPoint(MultiPoint(
            parse_array(coords()?, |c| parse_coord(c).map(Point))?,
        ))),
        "LineString" => Ok(Geometry::LineString(parse_line(coords()?)?)),
        "MultiLineString" => Ok(Geometry::MultiLineString(MultiLineString(parse_array(
            coords()?,
            parse_line,
        )?))),
        "Polygon" => Ok(Geometry::Polygon(parse_polygon(coords()?)?)),
        "MultiPolygon" => Ok(Geometry::MultiPolygon(MultiPolygon(parse_array(
            coords()?,
            parse_polygon,
        )?))),
        other => Err(format!("unsupported geometry type {}", other)),
    }
}

fn parse_array<T>(value: &Value, item: impl Fn(&Value) -> Result<T, String>) -> Result<Vec<T>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("expected array, got {}", value))?
        .iter()
        .map(item)
        .collect()
}

fn parse_coord(value: &Value) -> Result<Coord<f64>, String> {
    match value.as_array().map(Vec::as_slice) {
        Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(Coord { x, y }),
            _ => Err(format!("non-numeric position {}", value)),
        },
        _ => Err(format!("invalid position {}", value)),
    }
}

fn parse_line(value: &Value) -> Result<LineString<f64>, String> {
    Ok(LineString::new(parse_array(value, parse_coord)?))
}

fn parse_polygon(value: &Value) -> Result<Polygon<f64>, String> {
    let mut rings = parse_array(value, parse_line)?.into_iter();
    let exterior = rings.next().ok_or("polygon without rings")?;
    Ok(Polygon::new(exterior, rings.collect()))
}
