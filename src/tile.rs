//! Tiles: one slice of every dimension, i.e. one request to the portal.

use serde::{Deserialize, Serialize};

use crate::dimension::{DimensionSet, CRIME, MEASURE, MEASURE_VALUES, PERIOD, REGION};
use crate::optimize::BatchPlan;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    pub dimension: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    slices: Vec<Slice>,
}

impl Tile {
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn slice(&self, dimension: &str) -> Option<&[String]> {
        self.slices
            .iter()
            .find(|s| s.dimension == dimension)
            .map(|s| s.values.as_slice())
    }

    /// Rows this tile can return at most.
    pub fn row_estimate(&self) -> usize {
        self.slices.iter().map(|s| s.values.len()).product()
    }
}

/// Cuts every dimension into consecutive slices of the planned size and
/// returns the Cartesian product of those slices.
///
/// Tiles are ordered by dimension order, then slice order, the last
/// dimension varying fastest.
pub fn enumerate(dims: &DimensionSet, plan: &BatchPlan) -> Result<Vec<Tile>> {
    let mut tiles: Vec<Vec<Slice>> = vec![Vec::with_capacity(dims.len())];

    for dim in dims.iter() {
        let size = plan
            .size_of(dim.name())
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::invalid_dimension(dim.name(), "no batch size in plan"))?;

        let slices: Vec<Slice> = dim
            .values()
            .chunks(size)
            .map(|chunk| Slice {
                dimension: dim.name().to_string(),
                values: chunk.to_vec(),
            })
            .collect();

        let mut next = Vec::with_capacity(tiles.len() * slices.len());
        for prefix in &tiles {
            for slice in &slices {
                let mut tile = prefix.clone();
                tile.push(slice.clone());
                next.push(tile);
            }
        }
        tiles = next;
    }

    Ok(tiles.into_iter().map(|slices| Tile { slices }).collect())
}

/// Form fields of the portal's filter submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPayload {
    pub brottstyp_id_string: String,
    pub region_id_string: String,
    pub period_id_string: String,
    pub antal: u8,
    pub antal_100k: u8,
}

impl FilterPayload {
    pub fn from_tile(tile: &Tile) -> Result<Self> {
        let joined = |name: &'static str| -> Result<String> {
            tile.slice(name)
                .map(|values| values.join("*"))
                .ok_or(Error::MissingDimension(name))
        };
        let measures = tile.slice(MEASURE).ok_or(Error::MissingDimension(MEASURE))?;
        let requested = |measure: &str| u8::from(measures.iter().any(|m| m == measure));

        let payload = FilterPayload {
            brottstyp_id_string: joined(CRIME)?,
            region_id_string: joined(REGION)?,
            period_id_string: joined(PERIOD)?,
            antal: requested(MEASURE_VALUES[0]),
            antal_100k: requested(MEASURE_VALUES[1]),
        };
        if payload.antal == 0 && payload.antal_100k == 0 {
            return Err(Error::invalid_dimension(
                MEASURE,
                "tile must request `antal` or `antal_100k`",
            ));
        }
        Ok(payload)
    }

    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("brottstyp_id_string", self.brottstyp_id_string.clone()),
            ("region_id_string", self.region_id_string.clone()),
            ("period_id_string", self.period_id_string.clone()),
            ("antal", self.antal.to_string()),
            ("antal_100k", self.antal_100k.to_string()),
        ]
    }
}
