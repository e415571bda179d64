//! Query dimensions: the named axes of a topic's parameter space.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CRIME: &str = "crime";
pub const REGION: &str = "region";
pub const PERIOD: &str = "period";
pub const MEASURE: &str = "measure";

/// Absolute count and rate per 100 000 inhabitants, named by their form fields.
pub const MEASURE_VALUES: [&str; 2] = ["antal", "antal_100k"];

/// Menu id of a topic on the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub u32);

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named, ordered domain of value identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    name: String,
    values: Vec<String>,
}

impl Dimension {
    /// Fails if `values` is empty or holds the same identifier twice.
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Result<Self> {
        let name = name.into();
        if values.is_empty() {
            return Err(Error::invalid_dimension(&name, "empty value set"));
        }
        let mut seen = HashSet::with_capacity(values.len());
        for value in &values {
            if !seen.insert(value.as_str()) {
                return Err(Error::invalid_dimension(
                    &name,
                    format!("duplicate identifier `{value}`"),
                ));
            }
        }
        Ok(Self { name, values })
    }

    pub fn measure() -> Self {
        Self {
            name: MEASURE.to_string(),
            values: MEASURE_VALUES.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered collection of dimensions with unique names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionSet {
    dims: Vec<Dimension>,
}

impl DimensionSet {
    pub fn new(dims: Vec<Dimension>) -> Result<Self> {
        if dims.is_empty() {
            return Err(Error::Config("a topic needs at least one dimension".into()));
        }
        let mut names = HashSet::with_capacity(dims.len());
        for dim in &dims {
            if !names.insert(dim.name()) {
                return Err(Error::invalid_dimension(dim.name(), "declared twice"));
            }
        }
        Ok(Self { dims })
    }

    /// The standard crime × region × period × measure layout of a topic.
    pub fn for_topic(crime: Vec<String>, region: Vec<String>, period: Vec<String>) -> Result<Self> {
        Self::new(vec![
            Dimension::new(CRIME, crime)?,
            Dimension::new(REGION, region)?,
            Dimension::new(PERIOD, period)?,
            Dimension::measure(),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dims.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name() == name)
    }

    /// `(name, domain size)` pairs in declaration order, the optimizer's input.
    pub fn domain_sizes(&self) -> Vec<(&str, usize)> {
        self.dims.iter().map(|d| (d.name(), d.len())).collect()
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn empty_domain_rejected() {
        let err = Dimension::new(CRIME, vec![]).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn duplicate_identifier_rejected() {
        let err = Dimension::new(REGION, ids(&["1", "2", "1"])).unwrap_err();
        assert!(err.to_string().contains("`1`"));
    }

    #[test]
    fn topic_layout_adds_measure() {
        let set = DimensionSet::for_topic(ids(&["10", "11"]), ids(&["1"]), ids(&["2020"])).unwrap();
        assert_eq!(
            set.domain_sizes(),
            vec![(CRIME, 2), (REGION, 1), (PERIOD, 1), (MEASURE, 2)]
        );
        assert_eq!(set.get(MEASURE).unwrap().values(), &ids(&MEASURE_VALUES));
    }

    #[test]
    fn duplicate_dimension_name_rejected() {
        let a = Dimension::new(CRIME, ids(&["1"])).unwrap();
        let b = Dimension::new(CRIME, ids(&["2"])).unwrap();
        assert!(DimensionSet::new(vec![a, b]).is_err());
    }
}
