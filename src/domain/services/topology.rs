//! Topology Service
//!
//! Pure domain logic mapping client coordinates to edges and precomputing
//! peer routes. This service has NO external dependencies - it's pure Rust.

use crate::domain::entities::{EdgeSpec, Region, RegionLink, RoutingEntry};
use crate::domain::error::{FabricError, Result};
use crate::domain::value_objects::{Coordinate, EdgeStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Signal speed in fiber, km per second.
const SIGNAL_SPEED_KM_PER_S: f64 = 200_000.0;

/// Fixed per-hop processing cost.
const PROCESSING_MS: f64 = 5.0;

/// Great-circle distance between two coordinates, in kilometres.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Estimated one-way latency to a peer at the given distance.
///
/// propagation (distance / 200,000 km/s) + 5ms processing + distance / 10,000
/// routing overhead, all in milliseconds.
pub fn estimate_latency_ms(distance_km: f64) -> f64 {
    distance_km / SIGNAL_SPEED_KM_PER_S * 1_000.0 + PROCESSING_MS + distance_km / 10_000.0
}

/// Estimated bandwidth bucket in Mb/s.
pub fn estimate_bandwidth_mbps(distance_km: f64) -> u32 {
    if distance_km < 1_000.0 {
        10_000
    } else if distance_km < 5_000.0 {
        5_000
    } else if distance_km < 15_000.0 {
        1_000
    } else {
        500
    }
}

/// Hop count between two distinct regions, from the distance of their centres.
///
/// Below 3,000 km is 2 hops, below 8,000 km is 3, anything farther is 4.
/// Edges of the same region are always 1 hop apart. Pairs declared through
/// [`Topology::with_adjacency`] replace this estimate.
fn inter_region_hops(distance_km: f64) -> u32 {
    if distance_km < 3_000.0 {
        2
    } else if distance_km < 8_000.0 {
        3
    } else {
        4
    }
}

/// Static placement of one edge.
#[derive(Debug, Clone)]
pub struct EdgePlacement {
    pub id: String,
    pub region_id: String,
    pub coordinate: Coordinate,
    pub max_connections: u32,
}

/// Runtime view of an edge consulted during primary selection.
#[derive(Debug, Clone, Copy)]
pub struct EdgeLoad {
    /// Effective status (edge status combined with its region's)
    pub status: EdgeStatus,
    pub current_connections: u32,
}

/// Outcome of primary edge selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimarySelection {
    pub edge_id: String,
    /// No active edge had spare connections; capacity was ignored
    pub saturated: bool,
    /// No edge was active; the closest degraded edge stands in
    pub degraded: bool,
    /// Client coordinate was absent or invalid
    pub used_fallback_edge: bool,
}

/// Immutable region/edge inventory with precomputed routing tables.
///
/// Built once at startup; a topology change builds a new instance.
#[derive(Debug)]
pub struct Topology {
    regions: Vec<Region>,
    /// Sorted by edge id so scans break ties on the lowest id
    edges: Vec<EdgePlacement>,
    edge_index: HashMap<String, usize>,
    region_index: HashMap<String, usize>,
    /// Hop counts between regions, indexed like `regions`.
    /// Distance buckets unless overridden by declared links.
    hops: Vec<Vec<u32>>,
    routing: HashMap<String, Arc<[RoutingEntry]>>,
    fallback_edge: String,
}

impl Topology {
    /// Build and validate a topology.
    pub fn new(regions: Vec<Region>, fallback_edge: Option<String>) -> Result<Self> {
        if regions.is_empty() {
            return Err(FabricError::InvalidInput(
                "topology must declare at least one region".to_string(),
            ));
        }

        let mut seen_regions = HashSet::new();
        let mut seen_edges = HashSet::new();
        let mut edges = Vec::new();

        for region in &regions {
            if !seen_regions.insert(region.id.clone()) {
                return Err(FabricError::InvalidInput(format!(
                    "duplicate region id {}",
                    region.id
                )));
            }
            if !region.coordinate().is_valid() {
                return Err(FabricError::InvalidInput(format!(
                    "region {} has invalid coordinates",
                    region.id
                )));
            }
            if region.edges.is_empty() {
                return Err(FabricError::InvalidInput(format!(
                    "region {} has no edges",
                    region.id
                )));
            }
            if (region.capacity as u64) < region.edge_capacity() {
                return Err(FabricError::InvalidInput(format!(
                    "region {} capacity {} is below its edges' total {}",
                    region.id,
                    region.capacity,
                    region.edge_capacity()
                )));
            }
            for edge in &region.edges {
                if !seen_edges.insert(edge.id.clone()) {
                    return Err(FabricError::InvalidInput(format!(
                        "duplicate edge id {}",
                        edge.id
                    )));
                }
                edges.push(EdgePlacement {
                    id: edge.id.clone(),
                    region_id: region.id.clone(),
                    coordinate: region.coordinate(),
                    max_connections: edge.max_connections,
                });
            }
        }

        edges.sort_by(|a, b| a.id.cmp(&b.id));

        let fallback_edge = match fallback_edge {
            Some(id) if seen_edges.contains(&id) => id,
            Some(id) => {
                return Err(FabricError::InvalidInput(format!(
                    "fallback edge {} is not part of the topology",
                    id
                )))
            }
            None => regions[0].edges[0].id.clone(),
        };

        let edge_index = edges
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let region_index = regions
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        let hops = regions
            .iter()
            .map(|a| {
                regions
                    .iter()
                    .map(|b| {
                        if a.id == b.id {
                            1
                        } else {
                            inter_region_hops(haversine_km(a.coordinate(), b.coordinate()))
                        }
                    })
                    .collect()
            })
            .collect();

        let mut topology = Self {
            regions,
            edges,
            edge_index,
            region_index,
            hops,
            routing: HashMap::new(),
            fallback_edge,
        };
        topology.rebuild_routing();

        Ok(topology)
    }

    /// Replace estimated inter-region hop counts with declared links.
    ///
    /// Links are symmetric. Pairs not listed keep their distance estimate.
    pub fn with_adjacency(mut self, links: &[RegionLink]) -> Result<Self> {
        for link in links {
            let index = |id: &str| {
                self.region_index.get(id).copied().ok_or_else(|| {
                    FabricError::InvalidInput(format!("adjacency names unknown region {}", id))
                })
            };
            let a = index(&link.from)?;
            let b = index(&link.to)?;
            if a == b {
                return Err(FabricError::InvalidInput(format!(
                    "adjacency links region {} to itself",
                    link.from
                )));
            }
            if link.hops < 2 {
                return Err(FabricError::InvalidInput(format!(
                    "adjacency {} -> {} must be at least 2 hops, got {}",
                    link.from, link.to, link.hops
                )));
            }
            self.hops[a][b] = link.hops;
            self.hops[b][a] = link.hops;
        }

        if !links.is_empty() {
            self.rebuild_routing();
        }
        Ok(self)
    }

    fn rebuild_routing(&mut self) {
        self.routing = self
            .edges
            .iter()
            .map(|e| (e.id.clone(), self.build_routing_table(&e.id).into()))
            .collect();
    }

    /// Six regions, two edges each.
    pub fn default_regions() -> Vec<Region> {
        let region = |id: &str, name: &str, lat: f64, lon: f64| Region {
            id: id.to_string(),
            name: name.to_string(),
            latitude: lat,
            longitude: lon,
            capacity: 20_000,
            edges: vec![
                EdgeSpec {
                    id: format!("{}-a", id),
                    max_connections: 10_000,
                },
                EdgeSpec {
                    id: format!("{}-b", id),
                    max_connections: 10_000,
                },
            ],
        };

        vec![
            region("us-east", "Ashburn", 39.04, -77.49),
            region("us-west", "San Jose", 37.34, -121.89),
            region("eu-west", "Dublin", 53.35, -6.26),
            region("eu-central", "Frankfurt", 50.11, 8.68),
            region("ap-northeast", "Tokyo", 35.68, 139.69),
            region("ap-southeast", "Singapore", 1.35, 103.82),
        ]
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, region_id: &str) -> Option<&Region> {
        self.region_index.get(region_id).map(|&i| &self.regions[i])
    }

    /// All edges, ordered by id.
    pub fn edges(&self) -> &[EdgePlacement] {
        &self.edges
    }

    pub fn edge(&self, edge_id: &str) -> Option<&EdgePlacement> {
        self.edge_index.get(edge_id).map(|&i| &self.edges[i])
    }

    /// Edges of one region, ordered by id.
    pub fn edges_in_region<'a>(&'a self, region_id: &'a str) -> impl Iterator<Item = &'a EdgePlacement> + 'a {
        self.edges.iter().filter(move |e| e.region_id == region_id)
    }

    pub fn fallback_edge(&self) -> &str {
        &self.fallback_edge
    }

    /// Hop count between two regions; None if either is unknown.
    pub fn hop_count(&self, from_region: &str, to_region: &str) -> Option<u32> {
        let a = *self.region_index.get(from_region)?;
        let b = *self.region_index.get(to_region)?;
        Some(self.hops[a][b])
    }

    /// Precomputed routing table of an edge.
    pub fn routing_table(&self, edge_id: &str) -> Option<Arc<[RoutingEntry]>> {
        self.routing.get(edge_id).cloned()
    }

    /// Compute the ordered peer list of an edge.
    ///
    /// Sorted ascending by estimated latency with edge id as tie-break;
    /// never contains the owning edge.
    pub fn build_routing_table(&self, edge_id: &str) -> Vec<RoutingEntry> {
        let Some(origin) = self.edge(edge_id) else {
            return Vec::new();
        };

        let mut table: Vec<RoutingEntry> = self
            .edges
            .iter()
            .filter(|peer| peer.id != origin.id)
            .map(|peer| {
                let distance_km = haversine_km(origin.coordinate, peer.coordinate);
                RoutingEntry {
                    peer_edge_id: peer.id.clone(),
                    distance_km,
                    latency_ms: estimate_latency_ms(distance_km),
                    hop_count: self
                        .hop_count(&origin.region_id, &peer.region_id)
                        .unwrap_or(1),
                    bandwidth_mbps: estimate_bandwidth_mbps(distance_km),
                }
            })
            .collect();

        table.sort_by(|a, b| {
            a.latency_ms
                .total_cmp(&b.latency_ms)
                .then_with(|| a.peer_edge_id.cmp(&b.peer_edge_id))
        });
        table
    }

    /// Select the primary edge for a client.
    ///
    /// Among active edges with spare connections, picks the one closest to
    /// the client; ties go to the lowest edge id. Absent or invalid
    /// coordinates select the fixed fallback edge. When every active edge is
    /// saturated the closest active edge is returned anyway, and with no
    /// active edge at all the closest degraded one is. Returns None only when
    /// every edge is disabled.
    pub fn select_primary<F>(&self, client: Option<Coordinate>, load: F) -> Option<PrimarySelection>
    where
        F: Fn(&str) -> EdgeLoad,
    {
        let client = match client {
            Some(c) if c.is_valid() => c,
            _ => {
                let fallback = self.edge(&self.fallback_edge)?;
                if load(&fallback.id).status == EdgeStatus::Active {
                    return Some(PrimarySelection {
                        edge_id: fallback.id.clone(),
                        saturated: false,
                        degraded: false,
                        used_fallback_edge: true,
                    });
                }
                // Fallback edge is out of rotation: nearest eligible edge to it
                let mut selection = self.closest_eligible(fallback.coordinate, &load)?;
                selection.used_fallback_edge = true;
                return Some(selection);
            }
        };

        self.closest_eligible(client, &load)
    }

    fn closest_eligible<F>(&self, client: Coordinate, load: &F) -> Option<PrimarySelection>
    where
        F: Fn(&str) -> EdgeLoad,
    {
        let mut best: Option<(&EdgePlacement, f64)> = None;
        let mut best_any: Option<(&EdgePlacement, f64)> = None;
        let mut best_degraded: Option<(&EdgePlacement, f64)> = None;

        for edge in &self.edges {
            let state = load(&edge.id);
            let distance = match state.status {
                EdgeStatus::Disabled => continue,
                EdgeStatus::Degraded => {
                    let distance = haversine_km(client, edge.coordinate);
                    match best_degraded {
                        Some((_, d)) if distance >= d => {}
                        _ => best_degraded = Some((edge, distance)),
                    }
                    continue;
                }
                EdgeStatus::Active => haversine_km(client, edge.coordinate),
            };

            // Strict comparison keeps the lowest id on ties (edges are sorted)
            match best_any {
                Some((_, d)) if distance >= d => {}
                _ => best_any = Some((edge, distance)),
            }

            if state.current_connections >= edge.max_connections {
                continue;
            }

            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((edge, distance)),
            }
        }

        let (edge, saturated, degraded) = match (best, best_any, best_degraded) {
            (Some((edge, _)), _, _) => (edge, false, false),
            (None, Some((edge, _)), _) => (edge, true, false),
            (None, None, Some((edge, _))) => (edge, false, true),
            (None, None, None) => return None,
        };
        Some(PrimarySelection {
            edge_id: edge.id.clone(),
            saturated,
            degraded,
            used_fallback_edge: false,
        })
    }
}
